//! Cleanup of the pipeline's warnings log before it is shown to callers.

use std::sync::LazyLock;

use regex::Regex;

use crate::input::escape_xml;

/// Reduce a raw warnings log to the distinct warning and error lines.
///
/// Line-number prefixes (`12 | `) are stripped, only lines carrying a
/// `warning :` or `-ERROR-` marker are kept, and each kept line is
/// XML-escaped. First occurrence wins.
pub fn sanitize_warnings(raw: &str) -> String {
    static PREFIX_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\d+\W\|\W").expect("valid regex"));

    let mut lines: Vec<String> = Vec::new();
    for line in raw.trim_end().lines() {
        let stripped = PREFIX_RE.replace(line, "");
        if !(stripped.contains("warning :") || stripped.contains("-ERROR-")) {
            continue;
        }
        let escaped = escape_xml(&stripped);
        if !lines.contains(&escaped) {
            lines.push(escaped);
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_prefixes_and_filters() {
        let raw = "1 | warning : unknown tag <p>\n\
                   2 | just chatter\n\
                   3 | -ERROR- tokenizer failed\n";
        assert_eq!(
            sanitize_warnings(raw),
            "warning : unknown tag &lt;p&gt;\n-ERROR- tokenizer failed"
        );
    }

    #[test]
    fn deduplicates_preserving_order() {
        let raw = "1 | warning : b\n2 | warning : a\n3 | warning : b\n";
        assert_eq!(sanitize_warnings(raw), "warning : b\nwarning : a");
    }

    #[test]
    fn unprefixed_lines_are_kept() {
        assert_eq!(sanitize_warnings("warning : bare"), "warning : bare");
    }

    #[test]
    fn nothing_relevant_gives_empty() {
        assert_eq!(sanitize_warnings("7 | all good\n"), "");
        assert_eq!(sanitize_warnings(""), "");
    }
}
