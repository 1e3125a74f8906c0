//! Shared types, error model, and configuration for the annotation build engine.
//!
//! This crate is the foundation depended on by the other workspace crates.
//! It provides:
//! - [`AnnotateError`]: the unified error type
//! - Domain types ([`Status`], [`BuildMode`], [`Settings`] and its options)
//! - Configuration ([`AppConfig`], [`EngineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AdminConfig, AppConfig, EngineConfig, PipelineConfig, RetentionConfig, ServerConfig,
    StorageConfig, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from,
};
pub use error::{AnnotateError, Result};
pub use types::{
    BuildMode, Chunk, DEFAULT_ROOT, Language, NamedEntity, ParagraphSegmentation, PositionalAttribute,
    RootElement, SentenceSegmentation, Segmenter, Settings, Status, TextMode,
};
