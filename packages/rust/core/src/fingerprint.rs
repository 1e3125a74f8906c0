//! Build identity: a SHA-256 content hash over the normalized input, the
//! generated build script and the uploaded file names.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use annotate_shared::AnnotateError;

/// Suffix marking a multi-file build.
pub const BATCH_SUFFIX: &str = "-f";

/// Deterministic identifier of a build request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash the inputs of a build request.
    ///
    /// Every field is length-prefixed so that moving bytes between fields
    /// changes the digest. A non-empty `file_names` yields a batch fingerprint.
    pub fn compute<S: AsRef<str>>(text: &str, script: &str, file_names: &[S]) -> Self {
        let mut hasher = Sha256::new();
        feed(&mut hasher, text.as_bytes());
        feed(&mut hasher, script.as_bytes());
        hasher.update((file_names.len() as u64).to_le_bytes());
        for name in file_names {
            feed(&mut hasher, name.as_ref().as_bytes());
        }

        let mut key = format!("{:x}", hasher.finalize());
        if !file_names.is_empty() {
            key.push_str(BATCH_SUFFIX);
        }
        Self(key)
    }

    /// Whether this fingerprint identifies a multi-file build.
    pub fn is_batch(&self) -> bool {
        self.0.ends_with(BATCH_SUFFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `s` has the shape of a fingerprint: 64 lowercase hex digits,
    /// optionally followed by the batch suffix.
    pub fn is_well_formed(s: &str) -> bool {
        let digest = s.strip_suffix(BATCH_SUFFIX).unwrap_or(s);
        digest.len() == 64
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = AnnotateError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if Self::is_well_formed(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(AnnotateError::not_found(s))
        }
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_FILES: &[&str] = &[];

    #[test]
    fn deterministic() {
        let a = Fingerprint::compute("<text>Hej</text>", "corpus = x", NO_FILES);
        let b = Fingerprint::compute("<text>Hej</text>", "corpus = x", NO_FILES);
        assert_eq!(a, b);
        assert!(!a.is_batch());
        assert!(Fingerprint::is_well_formed(a.as_str()));
    }

    #[test]
    fn any_field_change_changes_key() {
        let base = Fingerprint::compute("a", "b", NO_FILES);
        assert_ne!(base, Fingerprint::compute("a ", "b", NO_FILES));
        assert_ne!(base, Fingerprint::compute("a", "b\n", NO_FILES));
        assert_ne!(base, Fingerprint::compute("", "b", NO_FILES));
    }

    #[test]
    fn field_boundaries_are_not_confused() {
        assert_ne!(
            Fingerprint::compute("ab", "c", NO_FILES),
            Fingerprint::compute("a", "bc", NO_FILES)
        );
        assert_ne!(
            Fingerprint::compute("", "", &["ab", "c"]),
            Fingerprint::compute("", "", &["a", "bc"])
        );
    }

    #[test]
    fn file_names_are_order_sensitive_and_mark_batch() {
        let ab = Fingerprint::compute("t", "s", &["a", "b"]);
        let ba = Fingerprint::compute("t", "s", &["b", "a"]);
        assert_ne!(ab, ba);
        assert!(ab.is_batch());
        assert!(ab.as_str().ends_with("-f"));
        assert!(Fingerprint::is_well_formed(ab.as_str()));
    }

    #[test]
    fn empty_text_is_valid_and_distinct() {
        let empty = Fingerprint::compute("", "s", NO_FILES);
        let hello = Fingerprint::compute("hello", "s", NO_FILES);
        assert_ne!(empty, hello);
        assert_eq!(empty.as_str().len(), 64);
    }

    #[test]
    fn parse_checks_shape() {
        let fp = Fingerprint::compute("x", "y", NO_FILES);
        let parsed: Fingerprint = fp.as_str().parse().expect("parse");
        assert_eq!(parsed, fp);

        assert!("abc".parse::<Fingerprint>().is_err());
        assert!("../etc".parse::<Fingerprint>().is_err());
        assert!(fp.as_str().to_uppercase().parse::<Fingerprint>().is_err());
        assert!(format!("{fp}-x").parse::<Fingerprint>().is_err());
    }
}
