//! Input normalization: turn submitted text or uploaded files into the XML
//! documents the pipeline reads from `original/`.

use std::collections::BTreeMap;

use annotate_shared::{AnnotateError, DEFAULT_ROOT, Result, TextMode};

/// A file as uploaded by the caller.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Client-side file name, extension included.
    pub filename: String,
    pub content: String,
}

/// A normalized document, stored as `original/<name>.xml`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Document {
    /// Sanitized name without extension.
    pub name: String,
    pub content: String,
}

/// Escape the XML metacharacters `&`, `<` and `>`.
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Normalize inline text. Plain text is escaped and wrapped in the root
/// element; XML passes through untouched.
pub fn prepare_text(text: &str, mode: TextMode) -> Result<String> {
    if text.trim().is_empty() {
        return Err(AnnotateError::input("empty input"));
    }

    Ok(match mode {
        TextMode::Plain => format!("<{DEFAULT_ROOT}>{}</{DEFAULT_ROOT}>", escape_xml(text)),
        TextMode::Xml => text.to_string(),
    })
}

/// Normalize a batch of uploads into uniquely named, sorted documents.
pub fn prepare_files(uploads: &[Upload]) -> Result<Vec<Document>> {
    if uploads.is_empty() {
        return Err(AnnotateError::input("no files"));
    }

    // Keyed by sanitized name; the values keep upload order.
    let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for upload in uploads {
        let (stem, ext) = match upload.filename.rfind('.') {
            Some(i) => (&upload.filename[..i], &upload.filename[i..]),
            None => (upload.filename.as_str(), ".txt"),
        };

        let content = if ext == ".xml" {
            upload.content.clone()
        } else {
            format!(
                "<{DEFAULT_ROOT}>\n{}\n</{DEFAULT_ROOT}>",
                escape_xml(&upload.content)
            )
        };

        by_name
            .entry(sanitize_filename(stem))
            .or_default()
            .push(content);
    }

    let mut documents = Vec::with_capacity(uploads.len());
    for (name, contents) in by_name {
        if contents.len() == 1 {
            documents.extend(contents.into_iter().map(|content| Document {
                name: name.clone(),
                content,
            }));
        } else {
            for (n, content) in contents.into_iter().enumerate() {
                documents.push(Document {
                    name: format!("{name}_#{}", n + 1),
                    content,
                });
            }
        }
    }

    documents.sort();
    Ok(documents)
}

/// Reduce a file name to ASCII `[A-Za-z0-9_.-]`, whitespace becoming `_`.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let trimmed = cleaned.trim_start_matches(['.', '_']);

    if trimmed.is_empty() {
        "file".into()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(name: &str, content: &str) -> Upload {
        Upload {
            filename: name.into(),
            content: content.into(),
        }
    }

    #[test]
    fn plain_text_is_escaped_and_wrapped() {
        let xml = prepare_text("a < b & c", TextMode::Plain).unwrap();
        assert_eq!(xml, "<text>a &lt; b &amp; c</text>");
    }

    #[test]
    fn xml_text_passes_through() {
        let xml = prepare_text("<text>Hej</text>", TextMode::Xml).unwrap();
        assert_eq!(xml, "<text>Hej</text>");
    }

    #[test]
    fn empty_text_is_rejected() {
        assert!(matches!(
            prepare_text("", TextMode::Plain),
            Err(AnnotateError::Input { .. })
        ));
        assert!(prepare_text("  \n\t", TextMode::Xml).is_err());
    }

    #[test]
    fn files_are_named_wrapped_and_sorted() {
        let docs = prepare_files(&[
            upload("zeta.txt", "z & z"),
            upload("alpha.xml", "<text>a</text>"),
            upload("README", "plain"),
        ])
        .unwrap();

        let names: Vec<_> = docs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["README", "alpha", "zeta"]);
        assert_eq!(docs[1].content, "<text>a</text>");
        assert_eq!(docs[2].content, "<text>\nz &amp; z\n</text>");
        assert_eq!(docs[0].content, "<text>\nplain\n</text>");
    }

    #[test]
    fn duplicate_names_are_numbered() {
        let docs = prepare_files(&[
            upload("a.txt", "one"),
            upload("a.xml", "<text>two</text>"),
            upload("b.txt", "three"),
        ])
        .unwrap();

        let names: Vec<_> = docs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a_#1", "a_#2", "b"]);
        assert_eq!(docs[1].content, "<text>two</text>");
    }

    #[test]
    fn no_files_is_rejected() {
        assert!(matches!(prepare_files(&[]), Err(AnnotateError::Input { .. })));
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("my  report 2"), "my_report_2");
        assert_eq!(sanitize_filename("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_filename("räksmörgås"), "rksmrgs");
        assert_eq!(sanitize_filename("åäö"), "file");
    }
}
