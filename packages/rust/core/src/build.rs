//! The build entity: one annotation job, its directory tree, its lifecycle
//! state and the subscribers watching it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use annotate_shared::{AnnotateError, BuildMode, Result, Status};

use crate::fingerprint::Fingerprint;
use crate::input::Document;
use crate::layout::BuildLayout;
use crate::notifier::BuildEvent;
use crate::result::{BuildResult, FailureReason, Outcome, inject_link, is_empty_export};

/// Document name used for single-text builds.
pub const TEXT_DOCUMENT: &str = "text";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Pipeline progress: the tool currently running and the step counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub command: String,
    pub step: u32,
    pub steps: u32,
}

/// Output captured from a failed or finished run.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub trace: String,
    pub stdout: String,
    pub stderr: String,
    /// Sanitized warnings log, `None` when no log was written.
    pub warnings: Option<String>,
}

/// Mutable part of a build, guarded by one lock so that status changes,
/// progress changes and subscriber registration are totally ordered.
#[derive(Debug)]
pub(crate) struct BuildState {
    pub(crate) status: Status,
    pub(crate) status_changed_at: DateTime<Utc>,
    pub(crate) accessed_at: DateTime<Utc>,
    pub(crate) progress: Progress,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) pid: Option<u32>,
    pub(crate) subscribers: Vec<UnboundedSender<BuildEvent>>,
}

impl BuildState {
    fn new(accessed_at: DateTime<Utc>) -> Self {
        Self {
            status: Status::Init,
            status_changed_at: Utc::now(),
            accessed_at,
            progress: Progress::default(),
            diagnostics: Diagnostics::default(),
            pid: None,
            subscribers: Vec::new(),
        }
    }

    /// Send to every live subscriber, dropping the ones whose receiver is gone.
    pub(crate) fn broadcast(&mut self, event: BuildEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// What a fresh build writes to disk before its first run.
#[derive(Debug, Clone)]
pub struct Submission {
    pub documents: Vec<Document>,
    pub script: String,
    pub settings_json: String,
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// One annotation job, shared between the registry, its executor and any
/// number of subscribers.
#[derive(Debug)]
pub struct Build {
    fingerprint: Fingerprint,
    mode: BuildMode,
    layout: BuildLayout,
    documents: Vec<String>,
    link: String,
    submission: Mutex<Option<Submission>>,
    state: Mutex<BuildState>,
    finalized: Mutex<Option<BuildResult>>,
    /// Cancelled when the build is removed; stops its pipeline run.
    removed: CancellationToken,
}

impl Build {
    /// A build for a new request. Nothing touches disk until [`Build::materialize`].
    pub fn fresh(
        fingerprint: Fingerprint,
        mode: BuildMode,
        layout: BuildLayout,
        backend_url: &str,
        submission: Submission,
    ) -> Self {
        let documents = submission
            .documents
            .iter()
            .map(|d| d.name.clone())
            .collect();
        Self::new(
            fingerprint,
            mode,
            layout,
            backend_url,
            documents,
            Some(submission),
            Utc::now(),
        )
    }

    /// A build reconstructed from an existing directory. The last access
    /// time comes from the `accessed` marker when present.
    pub fn resumed(
        fingerprint: Fingerprint,
        mode: BuildMode,
        layout: BuildLayout,
        backend_url: &str,
        documents: Vec<String>,
    ) -> Self {
        let accessed_at = std::fs::metadata(layout.accessed_file())
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Self::new(
            fingerprint,
            mode,
            layout,
            backend_url,
            documents,
            None,
            accessed_at,
        )
    }

    fn new(
        fingerprint: Fingerprint,
        mode: BuildMode,
        layout: BuildLayout,
        backend_url: &str,
        documents: Vec<String>,
        submission: Option<Submission>,
        accessed_at: DateTime<Utc>,
    ) -> Self {
        let link = format!("{backend_url}/download?hash={fingerprint}");
        Self {
            fingerprint,
            mode,
            layout,
            documents,
            link,
            submission: Mutex::new(submission),
            state: Mutex::new(BuildState::new(accessed_at)),
            finalized: Mutex::new(None),
            removed: CancellationToken::new(),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    pub fn layout(&self) -> &BuildLayout {
        &self.layout
    }

    /// Names of the documents this build annotates.
    pub fn documents(&self) -> &[String] {
        &self.documents
    }

    /// Download reference handed out with successful results.
    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn status_changed_at(&self) -> DateTime<Utc> {
        self.state.lock().status_changed_at
    }

    pub fn accessed_at(&self) -> DateTime<Utc> {
        self.state.lock().accessed_at
    }

    /// Time since the build was last accessed.
    pub fn idle(&self) -> Duration {
        (Utc::now() - self.accessed_at())
            .to_std()
            .unwrap_or_default()
    }

    pub fn progress(&self) -> Progress {
        self.state.lock().progress.clone()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.state.lock().diagnostics.clone()
    }

    /// Pid of the main pipeline run while it is alive.
    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, BuildState> {
        self.state.lock()
    }

    /// Whether this build still has files to write before running.
    pub fn needs_materialize(&self) -> bool {
        self.submission.lock().is_some()
    }

    // -- mutations ----------------------------------------------------------

    /// Move to `status` and notify subscribers. Reaching a finished state
    /// (or `Deleted`) releases every subscriber queue. `Deleted` is terminal.
    pub fn change_status(&self, status: Status) {
        let mut state = self.state.lock();
        if state.status == Status::Deleted {
            debug!(fingerprint = %self.fingerprint, %status, "build deleted, status change ignored");
            return;
        }
        state.status = status;
        state.status_changed_at = Utc::now();
        state.broadcast(BuildEvent::StatusChanged(status));
        if status.is_finished() || status == Status::Deleted {
            state.subscribers.clear();
        }
        info!(fingerprint = %self.fingerprint, %status, "status changed");
    }

    /// Update the progress counters and notify subscribers.
    pub fn change_step(&self, command: Option<&str>, step: Option<u32>, steps: Option<u32>) {
        let mut state = self.state.lock();
        if let Some(command) = command {
            state.progress.command = command.to_string();
        }
        if let Some(step) = step {
            state.progress.step = step;
        }
        if let Some(steps) = steps {
            state.progress.steps = steps;
        }
        let progress = state.progress.clone();
        state.broadcast(BuildEvent::Progress(progress));
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        self.state.lock().pid = pid;
    }

    pub(crate) fn set_warnings(&self, warnings: Option<String>) {
        self.state.lock().diagnostics.warnings = warnings;
    }

    pub(crate) fn record_failure(&self, trace: String, stdout: String, stderr: String) {
        let mut state = self.state.lock();
        state.diagnostics.trace = trace;
        state.diagnostics.stdout = stdout;
        state.diagnostics.stderr = stderr;
    }

    // -- files --------------------------------------------------------------

    /// Write the directory tree, build script, settings and input documents.
    ///
    /// An existing `original/text.xml` is left alone: it belongs to an earlier
    /// incarnation of the same build.
    pub fn materialize(&self) -> Result<()> {
        let Some(submission) = self.submission.lock().take() else {
            return Ok(());
        };

        for dir in [
            self.layout.root().to_path_buf(),
            self.layout.original_dir(),
            self.layout.annotations_dir(),
            self.layout.export_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| AnnotateError::io(&dir, e))?;
        }

        write_file(&self.layout.makefile(), &submission.script)?;
        write_file(&self.layout.settings_file(), &submission.settings_json)?;

        for document in &submission.documents {
            let path = self.layout.original_file(&document.name);
            if self.mode == BuildMode::Text && path.exists() {
                info!(fingerprint = %self.fingerprint, "input exists, not rewritten");
                continue;
            }
            write_file(&path, &document.content)?;
        }

        self.access();
        debug!(fingerprint = %self.fingerprint, dir = %self.layout.root().display(), "build materialized");
        Ok(())
    }

    /// Record an access now, both in memory and on the `accessed` marker.
    pub fn access(&self) {
        let now = Utc::now();
        self.state.lock().accessed_at = now;
        let path = self.layout.accessed_file();
        if let Err(e) = std::fs::write(&path, now.to_rfc3339()) {
            warn!(fingerprint = %self.fingerprint, error = %e, "could not touch access marker");
        }
    }

    /// Resolves once the build has been removed.
    pub async fn removed(&self) {
        self.removed.cancelled().await
    }

    pub fn is_removed(&self) -> bool {
        self.removed.is_cancelled()
    }

    /// Mark the build deleted, stop its pipeline run and remove its directory.
    pub fn remove_files(&self) {
        self.change_status(Status::Deleted);
        self.removed.cancel();
        info!(fingerprint = %self.fingerprint, "removing build files");
        if let Err(e) = std::fs::remove_dir_all(self.layout.root()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(fingerprint = %self.fingerprint, error = %e, "could not remove build directory");
            }
        }
    }

    /// Stored settings JSON, `{}` if unreadable.
    pub fn settings_json(&self) -> String {
        std::fs::read_to_string(self.layout.settings_file()).unwrap_or_else(|e| {
            warn!(fingerprint = %self.fingerprint, error = %e, "could not read settings");
            "{}".into()
        })
    }

    /// The submitted input: the text itself, or the list of document files.
    pub fn original(&self) -> String {
        match self.mode {
            BuildMode::Files => {
                let files: Vec<String> = self.documents.iter().map(|d| format!("{d}.xml")).collect();
                format!("files='{}'", files.join(", "))
            }
            BuildMode::Text => std::fs::read_to_string(self.layout.original_file(TEXT_DOCUMENT))
                .unwrap_or_else(|e| {
                    warn!(fingerprint = %self.fingerprint, error = %e, "could not read original");
                    String::new()
                }),
        }
    }

    // -- result -------------------------------------------------------------

    /// The final payload. Computed once on first call after the build has
    /// finished; output checks made here may downgrade `Done` to `Error`.
    pub fn result(&self) -> Result<BuildResult> {
        let status = self.status();
        if !status.is_finished() {
            return Err(AnnotateError::NotFinished {
                fingerprint: self.fingerprint.to_string(),
            });
        }

        let mut finalized = self.finalized.lock();
        let result = match finalized.as_ref() {
            Some(result) => result.clone(),
            None => {
                let result = self.finalize(status);
                *finalized = Some(result.clone());
                result
            }
        };
        drop(finalized);

        self.access();
        Ok(result)
    }

    fn finalize(&self, status: Status) -> BuildResult {
        let diagnostics = self.diagnostics();
        let warnings = diagnostics.warnings;

        let (status, outcome) = match status {
            Status::ParseError => (status, Outcome::ParseError { warnings }),
            Status::Done => match self.verify_outputs(warnings.clone()) {
                Ok(outcome) => (status, outcome),
                Err(reason) => {
                    warn!(fingerprint = %self.fingerprint, reason = reason.message(), "finished build has no usable output");
                    self.change_status(Status::Error);
                    (Status::Error, Outcome::Rejected { reason, warnings })
                }
            },
            _ => (
                status,
                Outcome::Failed {
                    trace: diagnostics.trace,
                    stdout: diagnostics.stdout,
                    stderr: diagnostics.stderr,
                },
            ),
        };

        BuildResult {
            fingerprint: self.fingerprint.clone(),
            status,
            outcome,
        }
    }

    fn verify_outputs(
        &self,
        warnings: Option<String>,
    ) -> std::result::Result<Outcome, FailureReason> {
        match self.mode {
            BuildMode::Text => {
                let tokens = std::fs::read_to_string(self.layout.token_file(TEXT_DOCUMENT))
                    .unwrap_or_default();
                if tokens.is_empty() {
                    return Err(FailureReason::EmptyInput);
                }

                let exported = std::fs::read_to_string(self.layout.export_file(TEXT_DOCUMENT))
                    .map_err(|_| FailureReason::NoResult)?;
                if is_empty_export(&exported) {
                    return Err(FailureReason::NoResult);
                }

                Ok(Outcome::Annotated {
                    warnings,
                    document: inject_link(&exported, &self.link),
                })
            }
            BuildMode::Files => {
                if self
                    .documents
                    .iter()
                    .all(|doc| self.layout.export_file(doc).exists())
                {
                    Ok(Outcome::Archive {
                        link: self.link.clone(),
                    })
                } else {
                    Err(FailureReason::MissingFile)
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        let mut state = self.state.lock();
        state.accessed_at -= chrono::Duration::from_std(by).unwrap_or_default();
    }
}

fn write_file(path: &std::path::Path, content: &str) -> Result<()> {
    std::fs::write(path, content).map_err(|e| AnnotateError::io(path, e))
}
