//! Core domain types for annotation builds: lifecycle status, build mode,
//! and the typed, validated build settings.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AnnotateError, Result};

/// Name of the root annotation every root element is mapped onto.
pub const DEFAULT_ROOT: &str = "text";

static XML_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("valid regex"));

static CORPUS_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\p{L}\p{N}_\-]+$").expect("valid regex"));

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Init,
    Parsing,
    Running,
    Done,
    Error,
    ParseError,
    /// Set by administrative removal immediately before the files go.
    Deleted,
}

impl Status {
    /// `Done`, `Error` and `ParseError` are terminal outcomes of a run.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::ParseError)
    }

    /// Stable lowercase name, used in logs and snapshots.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Parsing => "parsing",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::ParseError => "parse_error",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// BuildMode
// ---------------------------------------------------------------------------

/// Whether a build annotates a single inline text or a batch of files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    Text,
    Files,
}

impl BuildMode {
    pub fn is_batch(self) -> bool {
        self == Self::Files
    }
}

// ---------------------------------------------------------------------------
// Settings option enums
// ---------------------------------------------------------------------------

/// Corpus language. Non-Swedish languages go through the FreeLing analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "sv")]
    Sv,
    #[serde(rename = "sv-dev")]
    SvDev,
    #[serde(rename = "sv-1800")]
    Sv1800,
    #[serde(rename = "en")]
    En,
    #[serde(rename = "de")]
    De,
    #[serde(rename = "es")]
    Es,
    #[serde(rename = "fr")]
    Fr,
}

impl Language {
    /// Language code as written in the build script.
    pub fn code(self) -> &'static str {
        match self {
            Self::Sv => "sv",
            Self::SvDev => "sv-dev",
            Self::Sv1800 => "sv-1800",
            Self::En => "en",
            Self::De => "de",
            Self::Es => "es",
            Self::Fr => "fr",
        }
    }

    /// Analysis toolchain selected for the language.
    pub fn analysis(self) -> &'static str {
        match self {
            Self::Sv | Self::SvDev | Self::Sv1800 => self.code(),
            Self::En | Self::De | Self::Es | Self::Fr => "fl",
        }
    }

    pub fn is_freeling(self) -> bool {
        self.analysis() == "fl"
    }
}

/// How the submitted text is to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMode {
    #[default]
    Plain,
    Xml,
}

/// Named tokenizer or segmenter implemented by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segmenter {
    /// Resolves to the pipeline's default for the segmentation level.
    #[default]
    DefaultTokenizer,
    BetterWord,
    PunktWord,
    PunktSentence,
    Whitespace,
    Linebreaks,
    Blanklines,
}

impl Segmenter {
    pub fn name(self) -> &'static str {
        match self {
            Self::DefaultTokenizer => "default_tokenizer",
            Self::BetterWord => "better_word",
            Self::PunktWord => "punkt_word",
            Self::PunktSentence => "punkt_sentence",
            Self::Whitespace => "whitespace",
            Self::Linebreaks => "linebreaks",
            Self::Blanklines => "blanklines",
        }
    }

    /// Name to use for word segmentation.
    pub fn word(self) -> &'static str {
        match self {
            Self::DefaultTokenizer => Self::BetterWord.name(),
            other => other.name(),
        }
    }

    /// Name to use for sentence segmentation.
    pub fn sentence(self) -> &'static str {
        match self {
            Self::DefaultTokenizer => Self::PunktSentence.name(),
            other => other.name(),
        }
    }
}

/// Span within which sentences are segmented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chunk {
    #[default]
    Text,
    Paragraph,
}

impl Chunk {
    pub fn name(self) -> &'static str {
        match self {
            Self::Text => DEFAULT_ROOT,
            Self::Paragraph => "paragraph",
        }
    }
}

/// Sentence segmentation options.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SentenceSegmentation {
    pub sentence_chunk: Chunk,
    pub sentence_segmenter: Segmenter,
}

/// Paragraph segmentation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParagraphSegmentation {
    #[default]
    None,
    Blanklines,
    Linebreaks,
}

impl ParagraphSegmentation {
    /// Segmenter name, or `None` when paragraphs are not segmented.
    pub fn segmenter(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Blanklines => Some(Segmenter::Blanklines.name()),
            Self::Linebreaks => Some(Segmenter::Linebreaks.name()),
        }
    }
}

/// Root element of the submitted document and the attributes to keep on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RootElement {
    pub tag: String,
    pub attributes: Vec<String>,
}

impl Default for RootElement {
    fn default() -> Self {
        Self {
            tag: DEFAULT_ROOT.into(),
            attributes: Vec::new(),
        }
    }
}

/// Token-level annotation written as a column of the output.
///
/// Declaration order is the column order in the generated script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionalAttribute {
    Pos,
    Msd,
    Lemma,
    Lex,
    Saldo,
    Sense,
    Prefix,
    Suffix,
    Complemgram,
    Lemprob,
    Compwf,
    Blingbring,
    Swefn,
    Sentiment,
    Sentimentclass,
    Ref,
    Dephead,
    Deprel,
}

impl PositionalAttribute {
    /// Pipeline annotation file producing the column.
    pub fn annotation(self) -> &'static str {
        match self {
            Self::Lemma => "baseform",
            Self::Lex => "lemgram",
            Self::Dephead => "dephead.ref",
            other => other.column(),
        }
    }

    /// Column name in the output.
    pub fn column(self) -> &'static str {
        match self {
            Self::Pos => "pos",
            Self::Msd => "msd",
            Self::Lemma => "lemma",
            Self::Lex => "lex",
            Self::Saldo => "saldo",
            Self::Sense => "sense",
            Self::Prefix => "prefix",
            Self::Suffix => "suffix",
            Self::Complemgram => "complemgram",
            Self::Lemprob => "lemprob",
            Self::Compwf => "compwf",
            Self::Blingbring => "blingbring",
            Self::Swefn => "swefn",
            Self::Sentiment => "sentiment",
            Self::Sentimentclass => "sentimentclass",
            Self::Ref => "ref",
            Self::Dephead => "dephead",
            Self::Deprel => "deprel",
        }
    }
}

/// Attribute of the named-entity structural element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedEntity {
    Ex,
    Type,
    Subtype,
    Name,
}

impl NamedEntity {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ex => "ex",
            Self::Type => "type",
            Self::Subtype => "subtype",
            Self::Name => "name",
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Build settings as submitted by the caller, stored as `settings.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// Corpus identifier written into the build script.
    pub corpus: String,
    pub lang: Language,
    pub textmode: TextMode,
    pub word_segmenter: Segmenter,
    pub sentence_segmentation: SentenceSegmentation,
    pub paragraph_segmentation: ParagraphSegmentation,
    pub root: RootElement,
    pub positional_attributes: Vec<PositionalAttribute>,
    pub named_entity_recognition: Vec<NamedEntity>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            corpus: "untitled".into(),
            lang: Language::default(),
            textmode: TextMode::default(),
            word_segmenter: Segmenter::default(),
            sentence_segmentation: SentenceSegmentation::default(),
            paragraph_segmentation: ParagraphSegmentation::default(),
            root: RootElement::default(),
            positional_attributes: vec![
                PositionalAttribute::Pos,
                PositionalAttribute::Msd,
                PositionalAttribute::Lemma,
                PositionalAttribute::Lex,
                PositionalAttribute::Sense,
            ],
            named_entity_recognition: Vec::new(),
        }
    }
}

impl Settings {
    /// Parse and validate settings from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| AnnotateError::validation(format!("malformed settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Pretty JSON form, as persisted next to the build.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| AnnotateError::Serialization(e.to_string()))
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !CORPUS_NAME.is_match(&self.corpus) {
            return Err(AnnotateError::validation(format!(
                "invalid corpus name: {:?}",
                self.corpus
            )));
        }

        if !XML_NAME.is_match(&self.root.tag) {
            return Err(AnnotateError::validation(format!(
                "invalid root tag: {:?}",
                self.root.tag
            )));
        }
        if let Some(attr) = self
            .root
            .attributes
            .iter()
            .find(|a| !XML_NAME.is_match(a))
        {
            return Err(AnnotateError::validation(format!(
                "invalid root attribute: {attr:?}"
            )));
        }

        if self.sentence_segmentation.sentence_chunk == Chunk::Paragraph
            && self.paragraph_segmentation == ParagraphSegmentation::None
        {
            return Err(AnnotateError::validation(
                "sentence_chunk is paragraph but paragraph_segmentation is none",
            ));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self
            .positional_attributes
            .iter()
            .find(|attr| !seen.insert(**attr))
        {
            return Err(AnnotateError::validation(format!(
                "duplicate positional attribute: {}",
                dup.column()
            )));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self
            .named_entity_recognition
            .iter()
            .find(|ne| !seen.insert(**ne))
        {
            return Err(AnnotateError::validation(format!(
                "duplicate named entity attribute: {}",
                dup.name()
            )));
        }

        Ok(())
    }
}
