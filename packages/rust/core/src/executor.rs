//! Pipeline execution: drive the external build tool through preprocessing,
//! a counting dry run and the supervised main run, translating its output
//! into status changes and progress increments.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use annotate_shared::{AnnotateError, BuildMode, EngineConfig, Result, Status};

use crate::archive::package_exports;
use crate::build::Build;
use crate::fingerprint::Fingerprint;
use crate::layout::BuildLayout;
use crate::warnings::sanitize_warnings;

/// Build-tool target that parses the input documents.
const PARSE_TARGET: &str = "@TEXT";

/// Build-tool target that runs the full annotation and export.
const EXPORT_TARGET: &str = "export";

/// Reply the execution backend sends to a ping.
const PONG: &str = "PONG";

/// A failed run, as recorded on the build.
#[derive(Debug)]
struct RunFailure {
    trace: String,
    stderr: String,
}

impl RunFailure {
    fn new(trace: impl Into<String>) -> Self {
        Self {
            trace: trace.into(),
            stderr: String::new(),
        }
    }

    fn removed() -> Self {
        Self::new("build removed")
    }

    fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

impl From<AnnotateError> for RunFailure {
    fn from(e: AnnotateError) -> Self {
        Self::new(e.to_string())
    }
}

/// Per-fingerprint locks serializing runs over one build directory.
type RunLocks = Arc<Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>>;

/// Runs builds through the external pipeline.
#[derive(Debug, Clone)]
pub struct Executor {
    config: Arc<EngineConfig>,
    runs: RunLocks,
}

impl Executor {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            config,
            runs: RunLocks::default(),
        }
    }

    /// Run `build` on a background task.
    pub fn spawn(&self, build: Arc<Build>) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move { executor.run(build).await })
    }

    /// Run `build` to a finished state. Failures never escape: they are
    /// recorded on the build, which ends in `Error`.
    ///
    /// At most one run per fingerprint executes at a time; a run for a
    /// resubmitted build waits until the run of the removed one has stopped.
    #[instrument(skip_all, fields(fingerprint = %build.fingerprint()))]
    pub async fn run(&self, build: Arc<Build>) {
        let lock = self.run_lock(build.fingerprint());
        let guard = lock.lock().await;

        if build.is_removed() {
            info!("build removed before its run started");
        } else {
            let mut stdout = Vec::new();
            if let Err(failure) = self.drive(&build, &mut stdout).await {
                build.set_pid(None);
                if build.is_removed() {
                    info!("build removed, run abandoned");
                } else {
                    error!(trace = %failure.trace, "pipeline run failed");
                    build.record_failure(failure.trace, stdout.join("\n"), failure.stderr);
                    build.change_status(Status::Error);
                }
            }
        }

        drop(guard);
        self.release_run_lock(build.fingerprint(), lock);
    }

    fn run_lock(&self, fingerprint: &Fingerprint) -> Arc<tokio::sync::Mutex<()>> {
        let mut runs = self.runs.lock();
        Arc::clone(runs.entry(fingerprint.clone()).or_default())
    }

    /// Forget the lock once nobody else holds or waits for it.
    fn release_run_lock(&self, fingerprint: &Fingerprint, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut runs = self.runs.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            runs.remove(fingerprint);
        }
    }

    /// Run `cmd` to completion unless the build is removed first, in which
    /// case the child is killed on drop.
    async fn output(&self, build: &Build, mut cmd: Command) -> std::result::Result<Output, RunFailure> {
        tokio::select! {
            output = cmd.output() => output.map_err(|e| RunFailure::new(self.spawn_error(e))),
            () = build.removed() => Err(RunFailure::removed()),
        }
    }

    async fn drive(
        &self,
        build: &Build,
        stdout_lines: &mut Vec<String>,
    ) -> std::result::Result<(), RunFailure> {
        let layout = build.layout();
        let dir = layout.root();

        if build.needs_materialize() {
            build.materialize()?;
        }

        // --- Preprocessing ---
        let parsed = self.output(build, self.command(dir, PARSE_TARGET)).await?;
        build.change_status(Status::Parsing);

        let parse_stderr = String::from_utf8_lossy(&parsed.stderr).trim_end().to_string();
        let unparsed = build
            .documents()
            .iter()
            .find(|doc| !layout.parse_sentinel(doc).exists())
            .cloned();

        // A single text reports preprocessing errors before parse failures;
        // a batch reports the documents that failed to parse first.
        let checks = match build.mode() {
            BuildMode::Text => [PreprocessCheck::Stderr, PreprocessCheck::Sentinels],
            BuildMode::Files => [PreprocessCheck::Sentinels, PreprocessCheck::Stderr],
        };
        for check in checks {
            match check {
                PreprocessCheck::Stderr if !parse_stderr.is_empty() => {
                    error!("preprocessing reported errors");
                    build.set_warnings(read_warnings(layout));
                    build.record_failure(String::new(), String::new(), parse_stderr);
                    build.change_status(Status::Error);
                    return Ok(());
                }
                PreprocessCheck::Sentinels => {
                    if let Some(doc) = &unparsed {
                        warn!(document = %doc, "input could not be parsed");
                        build.set_warnings(read_warnings(layout));
                        build.change_status(Status::ParseError);
                        return Ok(());
                    }
                }
                PreprocessCheck::Stderr => {}
            }
        }

        // --- Dry run ---
        let mut dry_run = self.command(dir, EXPORT_TARGET);
        dry_run.arg("--dry-run");
        let dry = self.output(build, dry_run).await?;
        let dry_stderr = String::from_utf8_lossy(&dry.stderr).trim_end().to_string();
        if !dry.status.success() || !dry_stderr.is_empty() {
            return Err(RunFailure::new(format!("dry run failed: {}", dry.status))
                .with_stderr(dry_stderr));
        }
        let invocations = count_invocations(&String::from_utf8_lossy(&dry.stdout), self.marker());
        debug!(invocations, "dry run complete");

        // --- Main run ---
        let mut child = self
            .command(dir, EXPORT_TARGET)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RunFailure::new(self.spawn_error(e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunFailure::new("failed to capture pipeline stdout"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunFailure::new("failed to capture pipeline stderr"))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        build.set_pid(child.id());
        build.change_status(Status::Running);
        build.change_step(Some(""), Some(0), Some(invocations + 1));

        let mut step = 0;
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let next = tokio::select! {
                next = lines.next_line() => next,
                () = build.removed() => {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Err(RunFailure::removed());
                }
            };
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    let _ = child.kill().await;
                    let stderr = stderr_task.await.unwrap_or_default();
                    return Err(
                        RunFailure::new(format!("reading pipeline output: {e}")).with_stderr(stderr)
                    );
                }
            };
            if line.contains(self.marker()) {
                step += 1;
                let command = parse_invocation(&line, self.marker());
                build.change_step(Some(command.as_str()), Some(step), None);
            }
            stdout_lines.push(line);
        }
        build.change_step(Some(""), Some(step + 1), None);

        build.set_warnings(read_warnings(layout));

        let status = child
            .wait()
            .await
            .map_err(|e| RunFailure::new(format!("waiting for pipeline: {e}")))?;
        build.set_pid(None);
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(
                RunFailure::new(exit_trace(&self.config.make_program, status)).with_stderr(stderr.trim_end())
            );
        }

        if build.mode() == BuildMode::Files {
            let layout = layout.clone();
            tokio::task::spawn_blocking(move || package_exports(&layout))
                .await
                .map_err(|e| RunFailure::new(format!("packaging task failed: {e}")))??;
        }

        build.change_status(Status::Done);
        Ok(())
    }

    /// Check that the execution backend answers. Returns the round-trip time.
    pub async fn ping(&self) -> Result<Duration> {
        let mut parts = self.config.launcher.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| AnnotateError::config("pipeline launcher is empty"))?;

        let start = Instant::now();
        let output = Command::new(program)
            .args(parts)
            .arg("PING")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AnnotateError::pipeline(format!("could not run launcher: {e}")))?;
        let elapsed = start.elapsed();

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.trim() == PONG && stderr.trim().is_empty() {
            info!(elapsed_ms = elapsed.as_millis() as u64, "execution backend answered");
            Ok(elapsed)
        } else {
            Err(AnnotateError::pipeline(format!(
                "unexpected ping reply: stdout={:?} stderr={:?}",
                stdout.trim(),
                stderr.trim()
            )))
        }
    }

    fn marker(&self) -> &str {
        &self.config.launcher
    }

    fn spawn_error(&self, e: std::io::Error) -> String {
        format!("failed to run `{}`: {e}", self.config.make_program)
    }

    /// `<make> <target> -C <dir> dir_chmod=777 -j <N> python=<launcher>`
    fn command(&self, dir: &Path, target: &str) -> Command {
        let config = &self.config;
        let mut cmd = Command::new(&config.make_program);
        cmd.arg(target)
            .arg("-C")
            .arg(dir)
            .arg("dir_chmod=777")
            .arg("-j")
            .arg(config.processes.to_string())
            .arg(format!("python={}", config.launcher))
            .env("PIPELINE_MODELS", &config.models_dir)
            .env("PIPELINE_MAKEFILES", &config.makefiles_dir)
            .env("remote_host", "null")
            .env("remote_datadir", "null")
            .env("remote_registry", "null")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Preprocessing outcomes, checked in a mode-dependent order.
#[derive(Debug, Clone, Copy)]
enum PreprocessCheck {
    Stderr,
    Sentinels,
}

/// Number of output lines announcing a tool invocation.
pub fn count_invocations(output: &str, marker: &str) -> u32 {
    output.lines().filter(|line| line.contains(marker)).count() as u32
}

/// Short command name from an invocation line: the module, plus its first
/// flag when the line continues with further flags.
///
/// `launch -m tools.segment --token --out x` gives `tools.segment --token`;
/// `launch -m tools.export out` gives `tools.export`.
pub fn parse_invocation(line: &str, marker: &str) -> String {
    let Some((_, rest)) = line.split_once(marker) else {
        return String::new();
    };
    let args: Vec<&str> = rest.split_whitespace().collect();
    match args.get(3) {
        Some(arg) if arg.contains("--") => args[1..3].join(" "),
        _ => args.get(1).map(|s| s.to_string()).unwrap_or_default(),
    }
}

fn exit_trace(program: &str, status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("`{program}` exited with status {code}"),
        None => format!("`{program}` was terminated by a signal"),
    }
}

/// Sanitized warnings log, or `None` if the pipeline wrote none.
fn read_warnings(layout: &BuildLayout) -> Option<String> {
    std::fs::read_to_string(layout.warnings_log())
        .ok()
        .map(|raw| sanitize_warnings(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_names() {
        let marker = "/opt/launch /run/p.sock";
        assert_eq!(
            parse_invocation("/opt/launch /run/p.sock -m tools.segment --token --out x", marker),
            "tools.segment --token"
        );
        assert_eq!(
            parse_invocation("/opt/launch /run/p.sock -m tools.export out y", marker),
            "tools.export"
        );
        assert_eq!(parse_invocation("/opt/launch /run/p.sock -m tools.x", marker), "tools.x");
        assert_eq!(parse_invocation("/opt/launch /run/p.sock", marker), "");
        assert_eq!(parse_invocation("unrelated", marker), "");
    }

    #[test]
    fn counts_marker_lines() {
        let out = "mkdir -p x\nlaunch -m a\nlaunch -m b\necho done\n";
        assert_eq!(count_invocations(out, "launch"), 2);
        assert_eq!(count_invocations("", "launch"), 0);
    }

    #[cfg(unix)]
    mod pipeline {
        use super::super::*;

        use crate::build::{Submission, TEXT_DOCUMENT};
        use crate::fingerprint::Fingerprint;
        use crate::input::Document;
        use crate::notifier::{Update, subscribe};
        use crate::result::Outcome;
        use crate::testing::Sandbox;
        use annotate_shared::BuildMode;

        fn text_build(sandbox: &Sandbox, text: &str) -> Arc<Build> {
            let fp = Fingerprint::compute(text, "s", &[] as &[&str]);
            Arc::new(Build::fresh(
                fp.clone(),
                BuildMode::Text,
                BuildLayout::new(sandbox.config.builds_dir.join(fp.as_str())),
                &sandbox.config.backend_url,
                Submission {
                    documents: vec![Document {
                        name: TEXT_DOCUMENT.into(),
                        content: text.into(),
                    }],
                    script: "s".into(),
                    settings_json: "{}".into(),
                },
            ))
        }

        fn batch_build(sandbox: &Sandbox, documents: &[(&str, &str)]) -> Arc<Build> {
            let names: Vec<&str> = documents.iter().map(|(name, _)| *name).collect();
            let fp = Fingerprint::compute("batch", "s", &names);
            Arc::new(Build::fresh(
                fp.clone(),
                BuildMode::Files,
                BuildLayout::new(sandbox.config.builds_dir.join(fp.as_str())),
                &sandbox.config.backend_url,
                Submission {
                    documents: documents
                        .iter()
                        .map(|(name, content)| Document {
                            name: name.to_string(),
                            content: content.to_string(),
                        })
                        .collect(),
                    script: "s".into(),
                    settings_json: "{}".into(),
                },
            ))
        }

        /// Wait until the main run has started its first tool.
        async fn first_tool_started(build: &Arc<Build>) {
            let mut sub = subscribe(build, true);
            loop {
                match sub.next().await {
                    Some(Update::Progress(p)) if p.step >= 1 => return,
                    Some(_) => {}
                    None => panic!("build ended before its first tool ran"),
                }
            }
        }

        #[tokio::test]
        async fn successful_run_reports_progress() {
            let sandbox = Sandbox::new();
            let executor = Executor::new(Arc::new(sandbox.config.clone()));
            let build = text_build(&sandbox, "<text>Hello world.</text>");
            let mut sub = subscribe(&build, true);

            executor.spawn(Arc::clone(&build)).await.unwrap();

            let mut statuses = Vec::new();
            let mut progress = Vec::new();
            let mut result = None;
            while let Some(update) = sub.next().await {
                match update {
                    Update::Status(s) => statuses.push(s),
                    Update::Progress(p) => progress.push((p.command, p.step, p.steps)),
                    Update::Finished(r) => result = Some(r),
                }
            }

            assert_eq!(statuses, vec![Status::Parsing, Status::Running, Status::Done]);
            assert_eq!(
                progress,
                vec![
                    (String::new(), 0, 3),
                    ("tools.segment --token".to_string(), 1, 3),
                    ("tools.export".to_string(), 2, 3),
                    (String::new(), 3, 3),
                ]
            );
            let result = result.expect("result");
            assert_eq!(result.status, Status::Done);
            let xml = result.to_xml();
            assert!(xml.contains(&format!("<corpus link='{}'>", build.link())));
            assert!(!xml.contains("<warning>"));
            assert!(build.pid().is_none());
        }

        #[tokio::test]
        async fn unparsable_input_is_parse_error() {
            let sandbox = Sandbox::new();
            let executor = Executor::new(Arc::new(sandbox.config.clone()));
            let build = text_build(&sandbox, "<text>BROKEN</text>");

            executor.run(Arc::clone(&build)).await;

            assert_eq!(build.status(), Status::ParseError);
            let result = build.result().unwrap();
            assert!(matches!(result.outcome, Outcome::ParseError { .. }));
            assert!(result.to_xml().contains("warning : could not parse text"));
        }

        #[tokio::test]
        async fn non_zero_exit_is_error() {
            let sandbox = Sandbox::new();
            let executor = Executor::new(Arc::new(sandbox.config.clone()));
            let build = text_build(&sandbox, "<text>CRASH</text>");

            executor.run(Arc::clone(&build)).await;

            assert_eq!(build.status(), Status::Error);
            let diagnostics = build.diagnostics();
            assert!(diagnostics.trace.contains("status 3"));
            assert!(diagnostics.stderr.contains("tool crashed on text"));
            assert!(diagnostics.stdout.contains("tools.segment"));
        }

        #[tokio::test]
        async fn missing_build_tool_is_error() {
            let sandbox = Sandbox::new();
            let mut config = sandbox.config.clone();
            config.make_program = sandbox.root.join("no-such-make").display().to_string();
            let executor = Executor::new(Arc::new(config));
            let build = text_build(&sandbox, "<text>x</text>");

            executor.run(Arc::clone(&build)).await;

            assert_eq!(build.status(), Status::Error);
            assert!(build.diagnostics().trace.contains("failed to run"));
            assert!(build.result().unwrap().to_xml().contains("<trace>"));
        }

        #[tokio::test]
        async fn preprocessing_stderr_is_error() {
            let sandbox = Sandbox::new();
            let executor = Executor::new(Arc::new(sandbox.config.clone()));
            let build = text_build(&sandbox, "<text>NOISY but parsable</text>");

            executor.run(Arc::clone(&build)).await;

            assert!(build.layout().parse_sentinel(TEXT_DOCUMENT).exists());
            assert_eq!(build.status(), Status::Error);
            assert_eq!(sandbox.runs(build.fingerprint().as_str()), 0);
            let result = build.result().unwrap();
            assert!(matches!(result.outcome, Outcome::Failed { .. }));
            assert!(result.to_xml().contains("<stderr>noise while parsing text</stderr>"));
        }

        #[tokio::test]
        async fn text_checks_stderr_before_sentinel() {
            let sandbox = Sandbox::new();
            let executor = Executor::new(Arc::new(sandbox.config.clone()));
            let build = text_build(&sandbox, "<text>BROKEN and NOISY</text>");

            executor.run(Arc::clone(&build)).await;

            assert_eq!(build.status(), Status::Error);
            assert!(build.diagnostics().stderr.contains("noise while parsing text"));
        }

        #[tokio::test]
        async fn batch_checks_sentinels_before_stderr() {
            let sandbox = Sandbox::new();
            let executor = Executor::new(Arc::new(sandbox.config.clone()));
            let build = batch_build(
                &sandbox,
                &[("a", "<text>fine</text>"), ("b", "<text>BROKEN and NOISY</text>")],
            );

            executor.run(Arc::clone(&build)).await;

            assert_eq!(build.status(), Status::ParseError);
            assert!(build.result().unwrap().to_xml().contains("could not parse b"));
        }

        #[tokio::test]
        async fn batch_run_packages_archive() {
            let sandbox = Sandbox::new();
            let executor = Executor::new(Arc::new(sandbox.config.clone()));
            let build = batch_build(&sandbox, &[("a", "<text>one</text>"), ("b", "<text>two</text>")]);

            executor.run(Arc::clone(&build)).await;

            assert_eq!(build.status(), Status::Done);
            assert!(build.layout().archive().is_file());
            let result = build.result().unwrap();
            assert!(matches!(result.outcome, Outcome::Archive { .. }));
        }

        #[tokio::test]
        async fn removal_stops_the_running_pipeline() {
            let sandbox = Sandbox::new();
            sandbox.set_slow(true);
            let executor = Executor::new(Arc::new(sandbox.config.clone()));
            let build = text_build(&sandbox, "<text>Slow going.</text>");

            let handle = executor.spawn(Arc::clone(&build));
            first_tool_started(&build).await;
            assert!(build.pid().is_some());
            build.remove_files();

            // The stalled tool would keep the run alive for 30 s.
            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("run stopped after removal")
                .unwrap();
            assert_eq!(build.status(), Status::Deleted);
            assert!(build.pid().is_none());
            assert!(build.diagnostics().trace.is_empty());
            assert!(executor.runs.lock().is_empty());
        }

        #[tokio::test]
        async fn run_lock_is_shared_per_fingerprint() {
            let sandbox = Sandbox::new();
            let executor = Executor::new(Arc::new(sandbox.config.clone()));
            let fp = Fingerprint::compute("a", "s", &[] as &[&str]);
            let other = Fingerprint::compute("b", "s", &[] as &[&str]);

            let first = executor.run_lock(&fp);
            let held = first.lock().await;
            let second = executor.run_lock(&fp);
            assert!(Arc::ptr_eq(&first, &second));
            assert!(second.try_lock().is_err());
            assert!(executor.run_lock(&other).try_lock().is_ok());

            // Still wanted by `second`: kept.
            drop(held);
            executor.release_run_lock(&other, executor.run_lock(&other));
            executor.release_run_lock(&fp, first);
            assert!(executor.runs.lock().contains_key(&fp));
            executor.release_run_lock(&fp, second);
            assert!(executor.runs.lock().is_empty());
        }

        #[tokio::test]
        async fn ping_expects_pong() {
            let sandbox = Sandbox::new();
            let mut config = sandbox.config.clone();

            config.launcher = "echo PONG".into();
            // `echo PONG PING` prints both words.
            assert!(Executor::new(Arc::new(config.clone())).ping().await.is_err());

            config.launcher = format!("{} pong", sandbox.fake_make().display());
            assert!(Executor::new(Arc::new(config.clone())).ping().await.is_ok());

            config.launcher = String::new();
            assert!(matches!(
                Executor::new(Arc::new(config)).ping().await,
                Err(AnnotateError::Config { .. })
            ));
        }
    }
}
