//! Build orchestration for the annotation pipeline.
//!
//! This crate owns the build lifecycle: content fingerprinting, input
//! normalization, build-script generation, the per-fingerprint registry,
//! subprocess supervision, the subscriber protocol, crash-resume and
//! retention. [`Engine`] is the entry point.

pub mod archive;
pub mod build;
pub mod engine;
pub mod executor;
pub mod fingerprint;
pub mod input;
pub mod layout;
pub mod notifier;
pub mod registry;
pub mod result;
pub mod resume;
pub mod script;
pub mod warnings;

#[cfg(all(test, unix))]
pub(crate) mod testing;

pub use build::{Build, Diagnostics, Progress};
pub use engine::{Admin, Download, Engine, JoinInfo};
pub use fingerprint::Fingerprint;
pub use input::Upload;
pub use notifier::{BuildEvent, Subscriber, Update};
pub use registry::{BuildSnapshot, Removal};
pub use result::{BuildResult, FailureReason, Outcome};
pub use script::{MakefileGenerator, ScriptGenerator};
