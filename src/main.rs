use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pocketcam::config::DEFAULT_CONFIG_TOML;
use pocketcam::{
    CaptureJob, FrameData, JobOutcome, PocketcamConfig, PocketcamError, PostProcessingDispatcher,
    StillCamera,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "pocketcam")]
#[command(about = "Post-capture processing for handheld camera stills and videos")]
#[command(version)]
#[command(long_about = "Runs the pocketcam post-processing pipelines on files from disk: \
single-image enhancement, multi-frame night stacking and video stabilization. \
The outcome of each job is printed as JSON.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "pocketcam.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write logs to this file
    #[arg(long, value_name = "PATH", help = "Append logs to a file in addition to stderr")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enhance a still image in place
    Enhance {
        /// Image to enhance
        image: PathBuf,
    },
    /// Stack a burst of images into one low-noise still
    Night {
        /// Where the stacked image is written
        output: PathBuf,
        /// Burst frames, oldest first
        #[arg(num_args = 1..)]
        frames: Vec<PathBuf>,
    },
    /// Stabilize a recorded video
    Stabilize {
        /// Video to stabilize
        video: PathBuf,
    },
}

/// The command-line harness has no live sensor to fall back on
struct NoStillCamera;

#[async_trait::async_trait]
impl StillCamera for NoStillCamera {
    async fn capture_still(&self, path: &Path) -> pocketcam::Result<()> {
        Err(PocketcamError::component(
            "still_camera".to_string(),
            format!("no camera attached to capture {}", path.display()),
        ))
    }

    fn camera_name(&self) -> &str {
        "none"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return Ok(());
    }

    // Keep the guard alive so the file writer flushes on exit
    let log_guard = init_logging(&args)?;

    info!("Starting pocketcam v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match PocketcamConfig::load_from_file(&args.config) {
        Ok(config) => {
            info!("Configuration loaded successfully from: {}", args.config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("✗ Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    if args.validate_config {
        info!("Configuration validation successful");
        println!("✓ Configuration is valid");
        return Ok(());
    }

    debug!(
        "Effective configuration:\n{}",
        toml::to_string_pretty(&config).context("serializing configuration")?
    );

    let Some(command) = args.command else {
        eprintln!("No command given; run `pocketcam --help` for usage");
        std::process::exit(2);
    };

    let job = build_job(command).await?;
    let dispatcher = PostProcessingDispatcher::new(&config, Arc::new(NoStillCamera));
    info!(
        "Dispatching {} job (video backend: {})",
        job.mode.name(),
        dispatcher.video_backend()
    );

    let outcome = dispatcher.submit(job).wait().await;
    print_outcome(&outcome)?;

    if outcome.is_success() {
        Ok(())
    } else {
        drop(log_guard);
        std::process::exit(1);
    }
}

async fn build_job(command: Command) -> Result<CaptureJob> {
    let job = match command {
        Command::Enhance { image } => CaptureJob::normal(image),
        Command::Night { output, frames } => {
            let burst = tokio::task::spawn_blocking(move || load_burst(&frames))
                .await
                .context("loading burst frames")??;
            CaptureJob::night(output, burst)
        }
        Command::Stabilize { video } => CaptureJob::video(video),
    };
    Ok(job)
}

fn load_burst(paths: &[PathBuf]) -> Result<Vec<FrameData>> {
    paths
        .iter()
        .enumerate()
        .map(|(index, path)| {
            let image = image::open(path)
                .with_context(|| format!("opening burst frame {}", path.display()))?;
            debug!("Loaded burst frame {} from {}", index, path.display());
            Ok(FrameData::from_dynamic_image(index as u64, image))
        })
        .collect()
}

fn print_outcome(outcome: &JobOutcome) -> Result<()> {
    let json = serde_json::to_string_pretty(outcome).context("serializing job outcome")?;
    println!("{}", json);
    Ok(())
}

fn init_logging(args: &Args) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pocketcam={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .with_writer(std::io::stderr)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .boxed()
        }
    };

    let (file_layer, guard) = match &args.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .context("log file path has no file name")?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# Pocketcam Configuration File");
    println!("# This is the default configuration with all available options");
    println!();
    println!("{}", DEFAULT_CONFIG_TOML);
}
