//! On-disk layout of a single build directory.

use std::path::{Path, PathBuf};

/// Paths inside `<builds_dir>/<fingerprint>/`.
#[derive(Debug, Clone)]
pub struct BuildLayout {
    root: PathBuf,
}

impl BuildLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalized input documents.
    pub fn original_dir(&self) -> PathBuf {
        self.root.join("original")
    }

    /// Intermediate annotation files written by the pipeline.
    pub fn annotations_dir(&self) -> PathBuf {
        self.root.join("annotations")
    }

    /// Exported, annotated documents.
    pub fn export_dir(&self) -> PathBuf {
        self.root.join("export.original")
    }

    pub fn makefile(&self) -> PathBuf {
        self.root.join("Makefile")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    /// Marker whose mtime records the last access.
    pub fn accessed_file(&self) -> PathBuf {
        self.root.join("accessed")
    }

    pub fn warnings_log(&self) -> PathBuf {
        self.root.join("warnings.log")
    }

    /// Packaged archive for batch builds.
    pub fn archive(&self) -> PathBuf {
        self.root.join("export.zip")
    }

    pub fn original_file(&self, document: &str) -> PathBuf {
        self.original_dir().join(format!("{document}.xml"))
    }

    /// Sentinel the preprocessing step leaves behind for a parsed document.
    pub fn parse_sentinel(&self, document: &str) -> PathBuf {
        self.annotations_dir().join(format!("{document}.@TEXT"))
    }

    /// Token file, empty when the document had no words.
    pub fn token_file(&self, document: &str) -> PathBuf {
        self.annotations_dir().join(format!("{document}.token.word"))
    }

    pub fn export_file(&self, document: &str) -> PathBuf {
        self.export_dir().join(format!("{document}.xml"))
    }

    /// Document names found in `original/`, sorted.
    pub fn list_documents(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.original_dir()) else {
            return Vec::new();
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".xml").map(str::to_string)
            })
            .collect();
        names.sort();
        names
    }
}
