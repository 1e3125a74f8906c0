//! Crash-resume: rebuild the registry from the build directories left on
//! disk and restart their pipeline runs.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use annotate_shared::BuildMode;

use crate::build::{Build, TEXT_DOCUMENT};
use crate::executor::Executor;
use crate::fingerprint::Fingerprint;
use crate::layout::BuildLayout;
use crate::registry::Registry;

/// Scan the registry root on a background task, register one build per
/// build directory and launch its executor. Resolves to the fingerprints
/// that were resumed; their runs continue independently.
///
/// The directory scan runs on the blocking pool.
pub fn resume_builds(
    registry: Arc<Registry>,
    executor: Executor,
    backend_url: String,
) -> JoinHandle<Vec<Fingerprint>> {
    tokio::spawn(async move {
        let root = registry.root().to_path_buf();
        let found = tokio::task::spawn_blocking(move || load_builds(&root, &backend_url))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "resume scan task failed");
                Vec::new()
            });
        register_all(&registry, &executor, found)
    })
}

/// Reconstruct a build for every build directory under `root`.
#[instrument(skip_all, fields(root = %root.display()))]
fn load_builds(root: &Path, backend_url: &str) -> Vec<Build> {
    scan(root)
        .into_iter()
        .map(|fingerprint| {
            let layout = BuildLayout::new(root.join(fingerprint.as_str()));
            let documents = layout.list_documents();
            let mode = infer_mode(&fingerprint, documents.len());
            let documents = match mode {
                BuildMode::Text => vec![TEXT_DOCUMENT.to_string()],
                BuildMode::Files => documents,
            };
            Build::resumed(fingerprint, mode, layout, backend_url, documents)
        })
        .collect()
}

fn register_all(registry: &Registry, executor: &Executor, builds: Vec<Build>) -> Vec<Fingerprint> {
    let mut resumed = Vec::new();
    for build in builds {
        let fingerprint = build.fingerprint().clone();
        let mode = build.mode();
        match registry.insert_resumed(build) {
            Some(build) => {
                info!(fingerprint = %fingerprint, ?mode, "reattaching build");
                executor.spawn(build);
                resumed.push(fingerprint);
            }
            None => info!(fingerprint = %fingerprint, "already registered, not resumed"),
        }
    }
    info!(count = resumed.len(), "resume scan complete");
    resumed
}

/// Directories under `root` whose names parse as fingerprints, sorted.
fn scan(root: &Path) -> Vec<Fingerprint> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "cannot scan builds directory");
            return Vec::new();
        }
    };

    let mut found: Vec<Fingerprint> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    found.sort();
    found
}

/// Batch builds carry the suffix; an `original/` holding more than one
/// document also means files mode.
fn infer_mode(fingerprint: &Fingerprint, document_count: usize) -> BuildMode {
    if fingerprint.is_batch() || document_count > 1 {
        BuildMode::Files
    } else {
        BuildMode::Text
    }
}
