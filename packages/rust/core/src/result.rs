//! Final payload of a finished build and its XML rendering.

use annotate_shared::Status;

use crate::fingerprint::Fingerprint;
use crate::input::escape_xml;

/// Message shown when preprocessing could not parse the input.
pub const PARSE_ERROR_MSG: &str = "Could not parse the input. Check that it is well-formed XML.";

/// Message shown when the pipeline failed.
pub const PIPELINE_ERROR_MSG: &str = "The annotation pipeline failed.";

/// Why a build that ran to completion produced no usable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// No tokens were found in the input.
    EmptyInput,
    /// The exported document is missing or empty.
    NoResult,
    /// At least one exported document of a batch is missing.
    MissingFile,
}

impl FailureReason {
    pub fn message(self) -> &'static str {
        match self {
            Self::EmptyInput => "The input contains no text to annotate.",
            Self::NoResult => "The annotation produced no result.",
            Self::MissingFile => "One or more annotated files are missing.",
        }
    }
}

/// What a finished build hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Annotated text, download reference already injected.
    Annotated {
        warnings: Option<String>,
        document: String,
    },
    /// Download reference to the packaged batch.
    Archive { link: String },
    ParseError { warnings: Option<String> },
    Rejected {
        reason: FailureReason,
        warnings: Option<String>,
    },
    Failed {
        trace: String,
        stdout: String,
        stderr: String,
    },
}

/// Cached result of a finished build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub fingerprint: Fingerprint,
    /// Final status, after any downgrade.
    pub status: Status,
    pub outcome: Outcome,
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        self.status == Status::Done
    }

    /// Render the payload as the XML fragment streamed to callers.
    pub fn to_xml(&self) -> String {
        let mut out: Vec<String> = Vec::new();
        match &self.outcome {
            Outcome::Annotated { warnings, document } => {
                push_warnings(&mut out, warnings);
                out.push(document.clone());
            }
            Outcome::Archive { link } => {
                out.push(format!("<corpus link='{link}'/>"));
            }
            Outcome::ParseError { warnings } => {
                push_warnings(&mut out, warnings);
                out.push(error_element(PARSE_ERROR_MSG));
            }
            Outcome::Rejected { reason, warnings } => {
                push_warnings(&mut out, warnings);
                out.push(error_element(reason.message()));
            }
            Outcome::Failed {
                trace,
                stdout,
                stderr,
            } => {
                out.push(format!("<trace>{}</trace>", escape_xml(trace)));
                out.push(format!("<stderr>{}</stderr>", escape_xml(stderr)));
                out.push(format!("<stdout>{}</stdout>", escape_xml(stdout)));
                out.push(error_element(PIPELINE_ERROR_MSG));
            }
        }
        let mut xml = out.join("\n");
        xml.push('\n');
        xml
    }
}

// Warnings are escaped when sanitized.
fn push_warnings(out: &mut Vec<String>, warnings: &Option<String>) {
    if let Some(w) = warnings.as_deref().filter(|w| !w.is_empty()) {
        out.push(format!("<warning>{w}</warning>"));
    }
}

fn error_element(message: &str) -> String {
    format!("<error>{message}</error>")
}

/// Insert the download reference into the first `<corpus` element.
pub fn inject_link(document: &str, link: &str) -> String {
    document.replacen("<corpus", &format!("<corpus link='{link}'"), 1)
}

/// Whether an exported document has no content inside its `<corpus>` wrapper.
pub fn is_empty_export(document: &str) -> bool {
    let inner = document.trim();
    let inner = inner.strip_prefix("<corpus>").unwrap_or(inner);
    let inner = inner.strip_suffix("</corpus>").unwrap_or(inner);
    inner.trim().is_empty()
}
