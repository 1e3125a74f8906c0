//! Packaging of a batch build's exported documents into one zip archive.

use std::fs::File;
use std::io::Write;

use tracing::{debug, info};
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use annotate_shared::{AnnotateError, Result};

use crate::layout::BuildLayout;

/// Directory inside the archive holding the documents.
const ARCHIVE_DIR: &str = "korpus";

/// Zip every exported document as `korpus/<name>_annotated.xml`.
///
/// The archive is written next to its final path and renamed into place,
/// so a download never sees a half-written file. Returns the number of
/// documents packaged.
pub fn package_exports(layout: &BuildLayout) -> Result<usize> {
    let export_dir = layout.export_dir();
    let mut exports: Vec<_> = std::fs::read_dir(&export_dir)
        .map_err(|e| AnnotateError::io(&export_dir, e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "xml"))
        .collect();
    exports.sort();

    let target = layout.archive();
    let partial = target.with_extension("zip.partial");
    let file = File::create(&partial).map_err(|e| AnnotateError::io(&partial, e))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut packaged = 0;
    for path in &exports {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let content = std::fs::read(path).map_err(|e| AnnotateError::io(path, e))?;
        writer
            .start_file(format!("{ARCHIVE_DIR}/{stem}_annotated.xml"), options)
            .map_err(zip_error)?;
        writer
            .write_all(&content)
            .map_err(|e| AnnotateError::io(&partial, e))?;
        debug!(document = stem, "packaged");
        packaged += 1;
    }
    writer.finish().map_err(zip_error)?;

    std::fs::rename(&partial, &target).map_err(|e| AnnotateError::io(&target, e))?;
    info!(archive = %target.display(), documents = packaged, "archive written");
    Ok(packaged)
}

fn zip_error(e: zip::result::ZipError) -> AnnotateError {
    AnnotateError::pipeline(format!("could not write archive: {e}"))
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn layout() -> BuildLayout {
        let root = std::env::temp_dir().join(format!("annotate-archive-{}", uuid::Uuid::now_v7()));
        let layout = BuildLayout::new(root);
        std::fs::create_dir_all(layout.export_dir()).unwrap();
        layout
    }

    #[test]
    fn packages_exports_under_korpus() {
        let layout = layout();
        std::fs::write(layout.export_file("b"), "<corpus>b</corpus>").unwrap();
        std::fs::write(layout.export_file("a"), "<corpus>a</corpus>").unwrap();
        std::fs::write(layout.export_dir().join("notes.txt"), "skip").unwrap();

        assert_eq!(package_exports(&layout).unwrap(), 2);
        assert!(!layout.archive().with_extension("zip.partial").exists());

        let mut archive = zip::ZipArchive::new(File::open(layout.archive()).unwrap()).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort();
        assert_eq!(names, ["korpus/a_annotated.xml", "korpus/b_annotated.xml"]);

        let mut content = String::new();
        archive
            .by_name("korpus/a_annotated.xml")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "<corpus>a</corpus>");

        let _ = std::fs::remove_dir_all(layout.root());
    }

    #[test]
    fn missing_export_dir_is_io_error() {
        let layout = BuildLayout::new(std::env::temp_dir().join(format!(
            "annotate-archive-missing-{}",
            uuid::Uuid::now_v7()
        )));
        assert!(matches!(package_exports(&layout), Err(AnnotateError::Io { .. })));
    }
}
