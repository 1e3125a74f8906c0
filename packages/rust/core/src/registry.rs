//! Process-wide registry of builds keyed by fingerprint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use annotate_shared::{Result, Status};

use crate::build::Build;
use crate::fingerprint::Fingerprint;

/// Point-in-time view of one build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSnapshot {
    pub fingerprint: Fingerprint,
    pub status: Status,
    /// When the current status was entered.
    pub since: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
    /// Seconds since last access.
    pub idle_secs: u64,
}

/// Outcome of a forced removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// A registered build was removed with its files.
    Removed,
    /// No build was registered, but a directory was found and deleted.
    OrphanRemoved,
    NotFound,
}

/// Mapping from fingerprint to build; at most one build per fingerprint.
#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    builds: Mutex<HashMap<Fingerprint, Arc<Build>>>,
}

impl Registry {
    /// A registry whose build directories live under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            builds: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the build registered for `fingerprint`, creating it with
    /// `create` if there is none. The flag is `true` when the build is new.
    ///
    /// Lookup and insertion happen under one lock, so concurrent identical
    /// submissions share a single build.
    pub fn submit<F>(&self, fingerprint: &Fingerprint, create: F) -> Result<(Arc<Build>, bool)>
    where
        F: FnOnce() -> Result<Build>,
    {
        let mut builds = self.builds.lock();
        if let Some(build) = builds.get(fingerprint) {
            return Ok((Arc::clone(build), false));
        }

        let build = Arc::new(create()?);
        builds.insert(fingerprint.clone(), Arc::clone(&build));
        Ok((build, true))
    }

    /// Register a build reconstructed from disk. An already registered
    /// build for the same fingerprint wins.
    pub fn insert_resumed(&self, build: Build) -> Option<Arc<Build>> {
        let mut builds = self.builds.lock();
        if builds.contains_key(build.fingerprint()) {
            return None;
        }
        let build = Arc::new(build);
        builds.insert(build.fingerprint().clone(), Arc::clone(&build));
        Some(build)
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<Build>> {
        self.builds.lock().get(fingerprint).cloned()
    }

    pub fn len(&self) -> usize {
        self.builds.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every registered build.
    pub fn builds(&self) -> Vec<Arc<Build>> {
        self.builds.lock().values().cloned().collect()
    }

    /// Snapshot of all builds, sorted by fingerprint.
    pub fn enumerate(&self) -> Vec<BuildSnapshot> {
        let mut snapshots: Vec<BuildSnapshot> = self
            .builds()
            .iter()
            .map(|build| BuildSnapshot {
                fingerprint: build.fingerprint().clone(),
                status: build.status(),
                since: build.status_changed_at(),
                accessed: build.accessed_at(),
                idle_secs: build.idle().as_secs(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        snapshots
    }

    /// Remove every build matching `predicate` and delete its files.
    pub fn evict<P>(&self, predicate: P) -> Vec<Fingerprint>
    where
        P: Fn(&Build) -> bool,
    {
        let removed: Vec<Arc<Build>> = {
            let mut builds = self.builds.lock();
            let doomed: Vec<Fingerprint> = builds
                .iter()
                .filter(|(_, build)| predicate(build))
                .map(|(fp, _)| fp.clone())
                .collect();
            doomed
                .iter()
                .filter_map(|fp| builds.remove(fp))
                .collect()
        };

        let mut fingerprints = Vec::with_capacity(removed.len());
        for build in removed {
            build.remove_files();
            fingerprints.push(build.fingerprint().clone());
        }
        fingerprints.sort();
        if !fingerprints.is_empty() {
            info!(count = fingerprints.len(), "evicted builds");
        }
        fingerprints
    }

    /// Remove finished builds idle for at least `timeout`; with
    /// `include_errors`, failed builds go regardless of idle time.
    pub fn evict_idle(&self, timeout: Duration, include_errors: bool) -> Vec<Fingerprint> {
        self.evict(|build| is_evictable(build.status(), build.idle(), timeout, include_errors))
    }

    /// Remove a build regardless of its state. Without a registered build,
    /// a directory of that name under the root is deleted as an orphan.
    pub fn force_remove(&self, fingerprint: &str) -> Removal {
        let registered = fingerprint
            .parse::<Fingerprint>()
            .ok()
            .and_then(|fp| self.builds.lock().remove(&fp));

        if let Some(build) = registered {
            build.remove_files();
            return Removal::Removed;
        }

        if !Fingerprint::is_well_formed(fingerprint) {
            return Removal::NotFound;
        }
        let dir = self.root.join(fingerprint);
        if !dir.is_dir() {
            return Removal::NotFound;
        }
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(fingerprint, "removed orphaned build directory");
                Removal::OrphanRemoved
            }
            Err(e) => {
                warn!(fingerprint, error = %e, "could not remove orphaned build directory");
                Removal::NotFound
            }
        }
    }

    /// Force-remove every build directory under the root, registered or not.
    pub fn force_remove_all(&self) -> Vec<(String, Removal)> {
        let mut names: Vec<String> = self
            .builds
            .lock()
            .keys()
            .map(|fp| fp.to_string())
            .collect();

        if let Ok(entries) = std::fs::read_dir(&self.root) {
            for entry in entries.filter_map(|e| e.ok()) {
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_dir && Fingerprint::is_well_formed(&name) && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names.sort();

        names
            .into_iter()
            .map(|name| {
                let removal = self.force_remove(&name);
                (name, removal)
            })
            .collect()
    }
}

/// Idle-eviction rule: finished and idle for at least `timeout`, or, with
/// `include_errors`, in a failed state.
pub fn is_evictable(status: Status, idle: Duration, timeout: Duration, include_errors: bool) -> bool {
    (status.is_finished() && idle >= timeout)
        || (include_errors && matches!(status, Status::Error | Status::ParseError))
}
