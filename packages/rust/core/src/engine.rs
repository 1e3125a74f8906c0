//! Engine facade: the entry point callers use to submit, observe, fetch and
//! administer builds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use annotate_shared::{AnnotateError, BuildMode, EngineConfig, Result, Settings, Status};

use crate::build::{Build, Submission, TEXT_DOCUMENT};
use crate::executor::Executor;
use crate::fingerprint::Fingerprint;
use crate::input::{Document, Upload, prepare_files, prepare_text};
use crate::layout::BuildLayout;
use crate::notifier::{Subscriber, subscribe};
use crate::registry::{BuildSnapshot, Registry, Removal};
use crate::resume::resume_builds;
use crate::script::{MakefileGenerator, ScriptGenerator};

/// What a caller joining an existing build learns about it.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    /// Stored settings JSON.
    pub settings: String,
    /// The original text, or the list of submitted files.
    pub original: String,
}

/// A finished build's downloadable artifact.
#[derive(Debug, Clone)]
pub struct Download {
    pub path: PathBuf,
    pub filename: &'static str,
    pub content_type: &'static str,
}

/// The orchestration engine.
pub struct Engine {
    config: Arc<EngineConfig>,
    registry: Arc<Registry>,
    executor: Executor,
    generator: Arc<dyn ScriptGenerator>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("builds_dir", &self.config.builds_dir)
            .field("builds", &self.registry.len())
            .finish()
    }
}

impl Engine {
    /// Create an engine, making sure the builds directory exists.
    pub fn new(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.builds_dir)
            .map_err(|e| AnnotateError::io(&config.builds_dir, e))?;

        let config = Arc::new(config);
        Ok(Self {
            registry: Arc::new(Registry::new(&config.builds_dir)),
            executor: Executor::new(Arc::clone(&config)),
            generator: Arc::new(MakefileGenerator),
            config,
        })
    }

    /// Replace the build-script generator.
    pub fn with_generator(mut self, generator: impl ScriptGenerator + 'static) -> Self {
        self.generator = Arc::new(generator);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Reattach builds left on disk by a previous process, in the background.
    pub fn resume(&self) -> JoinHandle<Vec<Fingerprint>> {
        resume_builds(
            Arc::clone(&self.registry),
            self.executor.clone(),
            self.config.backend_url.clone(),
        )
    }

    /// Resume the builds left on disk and wait until each has settled.
    ///
    /// Waiting does not fetch results, so the builds keep the access times
    /// recorded on disk and idle eviction still applies to them.
    pub async fn resume_and_settle(&self) -> Result<Vec<Fingerprint>> {
        let resumed = self
            .resume()
            .await
            .map_err(|e| AnnotateError::pipeline(format!("resume task failed: {e}")))?;

        for fingerprint in &resumed {
            if let Some(build) = self.registry.get(fingerprint) {
                let status = subscribe(&build, false).settled().await;
                info!(%fingerprint, %status, "resumed build settled");
            }
        }
        Ok(resumed)
    }

    /// Validate `settings` and render the build script for them.
    pub fn script(&self, settings: &Settings) -> Result<String> {
        settings.validate()?;
        Ok(self.generator.generate(settings))
    }

    /// Submit a single text. Identical submissions share one build.
    #[instrument(skip_all, fields(corpus = %settings.corpus))]
    pub fn submit_text(&self, text: &str, settings: &Settings) -> Result<Arc<Build>> {
        let script = self.script(settings)?;
        let text = prepare_text(text, settings.textmode)?;
        let fingerprint = Fingerprint::compute(&text, &script, &[] as &[&str]);

        let documents = vec![Document {
            name: TEXT_DOCUMENT.into(),
            content: text,
        }];
        self.submit(fingerprint, BuildMode::Text, documents, script, settings)
    }

    /// Submit a batch of files. Identical submissions share one build.
    #[instrument(skip_all, fields(corpus = %settings.corpus, files = uploads.len()))]
    pub fn submit_files(&self, uploads: &[Upload], settings: &Settings) -> Result<Arc<Build>> {
        let script = self.script(settings)?;
        let documents = prepare_files(uploads)?;

        let text = documents
            .iter()
            .map(|d| d.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let names: Vec<&str> = documents.iter().map(|d| d.name.as_str()).collect();
        let fingerprint = Fingerprint::compute(&text, &script, &names);

        self.submit(fingerprint, BuildMode::Files, documents, script, settings)
    }

    fn submit(
        &self,
        fingerprint: Fingerprint,
        mode: BuildMode,
        documents: Vec<Document>,
        script: String,
        settings: &Settings,
    ) -> Result<Arc<Build>> {
        let (build, is_new) = self.registry.submit(&fingerprint, || {
            Ok(Build::fresh(
                fingerprint.clone(),
                mode,
                BuildLayout::new(self.config.builds_dir.join(fingerprint.as_str())),
                &self.config.backend_url,
                Submission {
                    documents,
                    script,
                    settings_json: settings.to_json()?,
                },
            ))
        })?;

        if is_new {
            info!(%fingerprint, ?mode, "starting new build");
            // Written before returning so a join sees the stored input.
            if let Err(e) = build.materialize() {
                error!(%fingerprint, error = %e, "could not write build files");
                build.record_failure(e.to_string(), String::new(), String::new());
                build.change_status(Status::Error);
                return Ok(build);
            }
            self.executor.spawn(Arc::clone(&build));
        } else {
            info!(%fingerprint, status = %build.status(), "joining existing build");
        }
        Ok(build)
    }

    /// Observe a build until it finishes.
    pub fn subscribe(&self, build: &Arc<Build>, want_progress: bool) -> Subscriber {
        subscribe(build, want_progress)
    }

    /// Join a known build by fingerprint.
    pub fn join(&self, fingerprint: &str, want_progress: bool) -> Result<(JoinInfo, Subscriber)> {
        let build = self.lookup(fingerprint)?;
        let info = JoinInfo {
            settings: build.settings_json(),
            original: build.original(),
        };
        Ok((info, subscribe(&build, want_progress)))
    }

    /// Locate the artifact of a finished build.
    pub fn download(&self, fingerprint: &str) -> Result<Download> {
        let build = self.lookup(fingerprint)?;
        if !build.status().is_finished() {
            return Err(AnnotateError::NotFinished {
                fingerprint: fingerprint.to_string(),
            });
        }

        let download = match build.mode() {
            BuildMode::Text => Download {
                path: build.layout().export_file(TEXT_DOCUMENT),
                filename: "corpus.xml",
                content_type: "application/xml",
            },
            BuildMode::Files => Download {
                path: build.layout().archive(),
                filename: "corpus.zip",
                content_type: "application/zip",
            },
        };
        if !download.path.is_file() {
            return Err(AnnotateError::not_found(fingerprint));
        }

        build.access();
        Ok(download)
    }

    /// Check that the execution backend answers.
    pub async fn ping(&self) -> Result<Duration> {
        self.executor.ping().await
    }

    /// Unlock the administrative operations.
    pub fn admin(&self, secret: &str) -> Result<Admin<'_>> {
        match self.config.secret_key.as_deref() {
            Some(expected) if !secret.is_empty() && secret == expected => Ok(Admin { engine: self }),
            _ => {
                error!("secret key could not be confirmed");
                Err(AnnotateError::Unauthorized)
            }
        }
    }

    fn lookup(&self, fingerprint: &str) -> Result<Arc<Build>> {
        fingerprint
            .parse::<Fingerprint>()
            .ok()
            .and_then(|fp| self.registry.get(&fp))
            .ok_or_else(|| AnnotateError::not_found(fingerprint))
    }
}

/// Administrative operations, available after the secret was confirmed.
#[derive(Debug)]
pub struct Admin<'a> {
    engine: &'a Engine,
}

impl Admin<'_> {
    /// Snapshot of every registered build.
    pub fn status(&self) -> Vec<BuildSnapshot> {
        self.engine.registry.enumerate()
    }

    /// Remove builds idle longer than `timeout` (default: the configured
    /// retention window), and with `include_errors` every failed build.
    pub fn evict_idle(&self, timeout: Option<Duration>, include_errors: bool) -> Vec<Fingerprint> {
        let timeout = timeout.unwrap_or(self.engine.config.idle_timeout);
        info!(timeout_secs = timeout.as_secs(), include_errors, "evicting idle builds");
        self.engine.registry.evict_idle(timeout, include_errors)
    }

    pub fn force_remove(&self, fingerprint: &str) -> Removal {
        self.engine.registry.force_remove(fingerprint)
    }

    pub fn force_remove_all(&self) -> Vec<(String, Removal)> {
        self.engine.registry.force_remove_all()
    }
}
