use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use crop_transcoder::{
    config::Config,
    media::ffmpeg::{FfmpegSinkFactory, FfmpegSource},
    media::Rect,
    TranscodeOrchestrator, TranscodeRequest,
};

/// Frames between progress log lines
const PROGRESS_EVERY_FRAMES: u64 = 30;

/// `X,Y,W,H` crop rectangle in display pixels
#[derive(Debug, Clone, Copy)]
struct CropArg(Rect);

impl FromStr for CropArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid number in crop '{}': {}", s, e))?;

        match values.as_slice() {
            [x, y, w, h] => Ok(CropArg(Rect::new(*x, *y, *w, *h))),
            _ => Err(format!("expected X,Y,W,H but got '{}'", s)),
        }
    }
}

#[derive(Parser)]
#[command(
    name = "crop-transcoder",
    version,
    about = "Crop a video to a rectangle and re-encode it to MP4",
    long_about = "Crop-Transcoder crops every frame of a video to a fixed rectangle given in display coordinates and re-encodes it as H.264 with AAC audio into a new MP4 file."
)]
struct Cli {
    /// Input video file
    input: PathBuf,

    /// Crop rectangle in display pixels: X,Y,W,H
    #[arg(long, allow_hyphen_values = true)]
    crop: CropArg,

    /// Start time in seconds (validated only)
    #[arg(long)]
    start: Option<f64>,

    /// End time in seconds (validated only)
    #[arg(long)]
    end: Option<f64>,

    /// Directory for the output file (defaults to the system temp directory)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Configuration file (optional)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Crop-Transcoder v{}", env!("CARGO_PKG_VERSION"));
    info!("Input: {:?}", cli.input);

    // Load configuration
    let mut config = match cli.config {
        Some(config_path) => {
            info!("Loading configuration from {:?}", config_path);
            Config::from_file(&config_path)?
        }
        None => {
            info!("Using default configuration");
            Config::default()
        }
    };
    if let Some(dir) = cli.output_dir {
        config.output.directory = Some(dir);
    }

    let source = FfmpegSource::open(&cli.input).map_err(|e| anyhow::anyhow!(e.user_message()))?;
    let orchestrator = TranscodeOrchestrator::new(
        Some(Box::new(source)),
        Arc::new(FfmpegSinkFactory::new()),
        config,
    );
    let handle = orchestrator.handle();

    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling transcode");
            interrupt.cancel();
        }
    });

    let watcher = handle.clone();
    let progress_task = tokio::spawn(async move {
        let mut next_report = PROGRESS_EVERY_FRAMES;
        while !watcher.state().is_terminal() {
            let snapshot = watcher.progress();
            if snapshot.frames_completed >= next_report {
                info!("📊 {} ({})", snapshot, watcher.state());
                next_report = snapshot.frames_completed + PROGRESS_EVERY_FRAMES;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    let request = TranscodeRequest::new(cli.crop.0).with_time_range(cli.start, cli.end);
    let result = orchestrator.transcode(request).await;
    progress_task.abort();

    match result {
        Ok(path) => {
            println!("{}", path.display());
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!(e.user_message())),
    }
}
