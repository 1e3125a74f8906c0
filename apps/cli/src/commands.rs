//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use annotate_core::{BuildResult, Engine, Fingerprint, Removal, Subscriber, Update, Upload};
use annotate_shared::{
    AppConfig, EngineConfig, Settings, init_config, load_config, load_config_from,
};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Annotate: run texts through the annotation pipeline.
#[derive(Parser)]
#[command(
    name = "annotate",
    version,
    about = "Submit texts to the annotation pipeline and manage its builds.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.annotate/annotate.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Submit a text or a set of files and print the annotated result.
    Submit {
        /// Text to annotate.
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        text: Option<String>,

        /// File to annotate (can be specified multiple times).
        #[arg(long)]
        file: Vec<PathBuf>,

        /// Settings JSON file (defaults to the stock settings).
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Show a progress bar while the pipeline runs.
        #[arg(long)]
        progress: bool,
    },

    /// Follow a previously submitted build.
    Join {
        fingerprint: String,

        /// Show a progress bar while the pipeline runs.
        #[arg(long)]
        progress: bool,
    },

    /// Restart every build found in the builds directory and wait for them.
    Resume,

    /// List builds with their status and idle time.
    Status {
        #[command(flatten)]
        auth: AdminAuth,
    },

    /// Remove builds that have been idle too long.
    Cleanup {
        #[command(flatten)]
        auth: AdminAuth,

        /// Also remove every build that ended in an error.
        #[arg(long)]
        errors: bool,

        /// Idle timeout in seconds (defaults to the configured retention).
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Remove one build, or all of them.
    Remove {
        #[command(flatten)]
        auth: AdminAuth,

        #[arg(required_unless_present = "all", conflicts_with = "all")]
        fingerprint: Option<String>,

        /// Remove every build directory.
        #[arg(long)]
        all: bool,
    },

    /// Print the build script generated for a settings file.
    Script {
        /// Settings JSON file (defaults to the stock settings).
        #[arg(long)]
        settings: Option<PathBuf>,
    },

    /// Print the path of a finished build's artifact.
    Download { fingerprint: String },

    /// Check that the pipeline launcher answers.
    Ping,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Secret guarding the administrative commands.
#[derive(clap::Args)]
pub(crate) struct AdminAuth {
    /// Admin secret key.
    #[arg(long, env = "ANNOTATE_SECRET_KEY", hide_env_values = true)]
    pub secret: String,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "annotate=info",
        1 => "annotate=debug",
        _ => "annotate=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Submit {
            text,
            file,
            settings,
            progress,
        } => cmd_submit(config_path, text.as_deref(), &file, settings.as_deref(), progress).await,
        Command::Join {
            fingerprint,
            progress,
        } => cmd_join(config_path, &fingerprint, progress).await,
        Command::Resume => cmd_resume(config_path).await,
        Command::Status { auth } => cmd_status(config_path, &auth).await,
        Command::Cleanup {
            auth,
            errors,
            timeout,
        } => cmd_cleanup(config_path, &auth, errors, timeout).await,
        Command::Remove {
            auth,
            fingerprint,
            all,
        } => cmd_remove(config_path, &auth, fingerprint.as_deref(), all).await,
        Command::Script { settings } => cmd_script(config_path, settings.as_deref()),
        Command::Download { fingerprint } => cmd_download(config_path, &fingerprint).await,
        Command::Ping => cmd_ping(config_path).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn app_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

fn open_engine(config_path: Option<&Path>) -> Result<Engine> {
    let config = app_config(config_path)?;
    Ok(Engine::new(EngineConfig::from(&config))?)
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| eyre!("cannot read settings '{}': {e}", path.display()))?;
            Ok(Settings::from_json(&json)?)
        }
        None => Ok(Settings::default()),
    }
}

fn read_upload(path: &Path) -> Result<Upload> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| eyre!("'{}' is not a file name", path.display()))?
        .to_string();
    let content = std::fs::read_to_string(path)
        .map_err(|e| eyre!("cannot read '{}': {e}", path.display()))?;
    Ok(Upload { filename, content })
}

/// Register the builds left on disk by earlier runs. With `wait`, block
/// until every resumed build has settled; waiting leaves their access
/// times untouched.
async fn resume(engine: &Engine, wait: bool) -> Result<Vec<Fingerprint>> {
    if wait {
        return Ok(engine.resume_and_settle().await?);
    }
    let resumed = engine
        .resume()
        .await
        .map_err(|e| eyre!("resume task failed: {e}"))?;
    Ok(resumed)
}

fn progress_bar() -> Result<ProgressBar> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .map_err(|e| eyre!("invalid progress template: {e}"))?
            .progress_chars("=> ")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    bar.enable_steady_tick(Duration::from_millis(80));
    Ok(bar)
}

/// Drain a subscriber until the build's result arrives.
async fn follow(mut subscriber: Subscriber, show_progress: bool) -> Result<BuildResult> {
    let fingerprint = subscriber.fingerprint().clone();
    let bar = if show_progress { Some(progress_bar()?) } else { None };

    while let Some(update) = subscriber.next().await {
        match update {
            Update::Status(status) => match &bar {
                Some(bar) => bar.set_message(status.to_string()),
                None => info!(fingerprint = %fingerprint, %status, "status changed"),
            },
            Update::Progress(progress) => {
                if let Some(bar) = &bar {
                    bar.set_length(u64::from(progress.steps));
                    bar.set_position(u64::from(progress.step));
                    bar.set_message(progress.command);
                }
            }
            Update::Finished(result) => {
                if let Some(bar) = &bar {
                    bar.finish_and_clear();
                }
                return Ok(result);
            }
        }
    }

    if let Some(bar) = &bar {
        bar.abandon();
    }
    Err(eyre!("build {fingerprint} was removed before it finished"))
}

fn print_result(result: &BuildResult) -> Result<()> {
    print!("{}", result.to_xml());
    if result.is_success() {
        Ok(())
    } else {
        Err(eyre!("build {} finished with status {}", result.fingerprint, result.status))
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_submit(
    config_path: Option<&Path>,
    text: Option<&str>,
    files: &[PathBuf],
    settings: Option<&Path>,
    progress: bool,
) -> Result<()> {
    let settings = load_settings(settings)?;
    let engine = open_engine(config_path)?;

    let build = match text {
        Some(text) => engine.submit_text(text, &settings)?,
        None => {
            let uploads = files.iter().map(|path| read_upload(path)).collect::<Result<Vec<_>>>()?;
            engine.submit_files(&uploads, &settings)?
        }
    };

    eprintln!("fingerprint: {}", build.fingerprint());
    let result = follow(engine.subscribe(&build, progress), progress).await?;
    print_result(&result)
}

async fn cmd_join(config_path: Option<&Path>, fingerprint: &str, progress: bool) -> Result<()> {
    let engine = open_engine(config_path)?;
    resume(&engine, false).await?;

    let (join, subscriber) = engine.join(fingerprint, progress)?;
    eprintln!("settings: {}", join.settings);
    eprintln!("original: {}", join.original);

    let result = follow(subscriber, progress).await?;
    print_result(&result)
}

async fn cmd_resume(config_path: Option<&Path>) -> Result<()> {
    let engine = open_engine(config_path)?;
    let resumed = resume(&engine, true).await?;

    for fingerprint in &resumed {
        let status = engine
            .registry()
            .get(fingerprint)
            .map(|build| build.status().to_string())
            .unwrap_or_else(|| "removed".to_string());
        println!("{fingerprint}  {status}");
    }
    println!("{} build(s) resumed", resumed.len());
    Ok(())
}

async fn cmd_status(config_path: Option<&Path>, auth: &AdminAuth) -> Result<()> {
    let engine = open_engine(config_path)?;
    engine.admin(&auth.secret)?;
    resume(&engine, true).await?;

    let snapshots = engine.admin(&auth.secret)?.status();
    println!("{}", serde_json::to_string_pretty(&snapshots)?);
    Ok(())
}

async fn cmd_cleanup(
    config_path: Option<&Path>,
    auth: &AdminAuth,
    errors: bool,
    timeout: Option<u64>,
) -> Result<()> {
    let engine = open_engine(config_path)?;
    engine.admin(&auth.secret)?;
    resume(&engine, true).await?;

    let removed = engine
        .admin(&auth.secret)?
        .evict_idle(timeout.map(Duration::from_secs), errors);
    for fingerprint in &removed {
        println!("removed {fingerprint}");
    }
    println!("{} build(s) removed", removed.len());
    Ok(())
}

async fn cmd_remove(
    config_path: Option<&Path>,
    auth: &AdminAuth,
    fingerprint: Option<&str>,
    all: bool,
) -> Result<()> {
    let engine = open_engine(config_path)?;
    engine.admin(&auth.secret)?;
    resume(&engine, true).await?;
    let admin = engine.admin(&auth.secret)?;

    if all {
        for (name, removal) in admin.force_remove_all() {
            println!("{name}  {removal:?}");
        }
        return Ok(());
    }

    let fingerprint = fingerprint.ok_or_else(|| eyre!("a fingerprint or --all is required"))?;
    match admin.force_remove(fingerprint) {
        Removal::NotFound => Err(eyre!("no build found for '{fingerprint}'")),
        removal => {
            println!("{fingerprint}  {removal:?}");
            Ok(())
        }
    }
}

fn cmd_script(config_path: Option<&Path>, settings: Option<&Path>) -> Result<()> {
    let settings = load_settings(settings)?;
    let engine = open_engine(config_path)?;
    print!("{}", engine.script(&settings)?);
    Ok(())
}

async fn cmd_download(config_path: Option<&Path>, fingerprint: &str) -> Result<()> {
    let engine = open_engine(config_path)?;
    resume(&engine, true).await?;

    let download = engine.download(fingerprint)?;
    info!(
        fingerprint,
        filename = download.filename,
        content_type = download.content_type,
        "artifact ready"
    );
    println!("{}", download.path.display());
    Ok(())
}

async fn cmd_ping(config_path: Option<&Path>) -> Result<()> {
    let engine = open_engine(config_path)?;
    match engine.ping().await {
        Ok(elapsed) => {
            println!("PONG ({:.3}s)", elapsed.as_secs_f64());
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "ping failed");
            Err(e.into())
        }
    }
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = app_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
