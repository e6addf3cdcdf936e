use clap::Parser;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use traffic_lens::{
    analyzer::{Analyze, AnalyzerConfig, GeminiAnalyzer, DEFAULT_API_BASE, DEFAULT_MODEL},
    api::SourceDescriptor,
    app::{App, AppConfig},
    capture::{decode_jpeg, EncodedFrame},
    ffmpeg::{FfmpegBackend, FfmpegConfig, DEFAULT_WEBCAM_DEVICE},
    scheduler::BackoffPolicy,
    server::{run_server, LogLevel},
    utils::{ensure_directory_exists, img_with_bbox, read_jpeg_file, save_image},
};

#[derive(Parser, Debug, Clone)]
#[command(version=env!("CARGO_PKG_VERSION"), about = "Periodic traffic analysis of a camera or stream")]
pub struct Args {
    /// The port on which the dashboard will listen for HTTP requests.
    /// Default is 32170. Example usage: --port 8080
    #[arg(long, default_value_t = 32170)]
    pub port: u16,

    /// Start with the local capture device as video source.
    #[arg(long, conflicts_with = "url")]
    pub webcam: bool,

    /// Start with a remote stream as video source.
    /// Example: --url "https://example.com/traffic/live.m3u8"
    #[arg(long)]
    pub url: Option<String>,

    /// Capture device passed to ffmpeg.
    #[arg(long, default_value = DEFAULT_WEBCAM_DEVICE)]
    pub device: String,

    /// Path to the ffmpeg executable.
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// Frames per second pulled from the source for display.
    #[arg(long, default_value_t = 2)]
    pub fps: u32,

    /// Skip the cross-origin check for http(s) streams.
    #[arg(long)]
    pub no_cross_origin_check: bool,

    /// Start analysis as soon as the source is active.
    #[arg(long)]
    pub auto_start: bool,

    /// Milliseconds between analysis cycles when everything works.
    #[arg(long, default_value_t = 20_000)]
    pub interval_ms: u64,

    /// Backoff after the first quota failure, doubled on each further one.
    #[arg(long, default_value_t = 10_000)]
    pub backoff_floor_ms: u64,

    /// Upper bound of the quota backoff.
    #[arg(long, default_value_t = 120_000)]
    pub backoff_ceiling_ms: u64,

    /// Model used for analysis. The API key is read from API_KEY or GEMINI_API_KEY.
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    #[arg(long, default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// Path to save analyzed frames with the detected vehicles drawn in.
    /// If not specified, frames will not be saved. Example: --image-path "/path/to/save/images"
    #[arg(long)]
    pub image_path: Option<String>,

    /// Path to a test image. The application will analyze only this image, print the
    /// result and save a copy with the suffix '-od'. Example: --image "/path/to/test.jpg"
    #[arg(long)]
    pub image: Option<String>,

    /// Path to write the log file to.
    #[clap(short, long, value_parser)]
    log_path: Option<String>,

    /// Sets the level of logging
    #[clap(short, long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Threads available for frame encoding.
    #[arg(long, default_value_t = 2)]
    pub blocking_threads: usize,
}

impl Args {
    fn descriptor(&self) -> Option<SourceDescriptor> {
        match (&self.url, self.webcam) {
            (Some(address), _) => Some(SourceDescriptor::Url {
                address: address.clone(),
            }),
            (None, true) => Some(SourceDescriptor::Webcam),
            (None, false) => None,
        }
    }

    fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            normal_interval: Duration::from_millis(self.interval_ms),
            floor: Duration::from_millis(self.backoff_floor_ms),
            ceiling: Duration::from_millis(self.backoff_ceiling_ms.max(self.backoff_floor_ms)),
            ..BackoffPolicy::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    setup_ansi_support();

    let args = Args::parse();

    // Logging
    let _guard = if let Some(log_path) = args.log_path.clone() {
        println!(
            "Starting Traffic Lens, logging into: {}/traffic_lens.log",
            log_path
        );
        let file_appender = tracing_appender::rolling::daily(&log_path, "traffic_lens.log");
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_writer(non_blocking)
            .with_max_level(Level::from(args.log_level))
            .with_ansi(false)
            .init();
        Some(_guard)
    } else {
        tracing_subscriber::fmt()
            .with_max_level(Level::from(args.log_level))
            .init();
        None
    };

    info!("Starting Traffic Lens traffic analysis service");

    // Requests are few, the blocking pool does the JPEG work.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .max_blocking_threads(args.blocking_threads.max(1))
        .enable_all()
        .build()?;

    debug!("Tokio initialized with {} blocking threads.", args.blocking_threads);

    let analyzer = GeminiAnalyzer::new(AnalyzerConfig {
        api_base: args.api_base.clone(),
        model: args.model.clone(),
        ..AnalyzerConfig::default()
    })?;

    rt.block_on(async {
        ensure_directory_exists(args.image_path.as_deref()).await?;

        match args.image.clone() {
            None => run(args, analyzer).await,
            Some(image) => test_image(image, analyzer).await,
        }
    })
}

async fn run(args: Args, analyzer: GeminiAnalyzer) -> anyhow::Result<()> {
    info!("Analyzing with model {}", analyzer.model());
    let backend = FfmpegBackend::new(FfmpegConfig {
        ffmpeg: args.ffmpeg.clone(),
        webcam_device: args.device.clone(),
        fps: args.fps.max(1),
        check_cross_origin: !args.no_cross_origin_check,
        ..FfmpegConfig::default()
    })?;
    let app = Arc::new(App::new(
        backend,
        analyzer,
        AppConfig {
            policy: args.policy(),
            image_path: args.image_path.clone(),
        },
    ));

    let cancellation_token = CancellationToken::new();
    let watcher = app.watch_source(cancellation_token.clone());

    if let Some(descriptor) = args.descriptor() {
        if let Err(e) = app.set_source(descriptor).await {
            warn!("Video source did not start: {}", e);
        }
    }
    if args.auto_start {
        app.start_analysis().await;
    }

    let shutdown = cancellation_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                shutdown.cancel();
            }
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        }
    });

    let result = run_server(args.port, app.clone(), cancellation_token.clone()).await;

    cancellation_token.cancel();
    if let Err(e) = watcher.await {
        warn!("Source watcher ended abnormally: {}", e);
    }
    app.shutdown().await;
    result
}

async fn test_image(image: String, analyzer: GeminiAnalyzer) -> anyhow::Result<()> {
    let start_test_time = std::time::Instant::now();
    let contents = read_jpeg_file(&image).await?;
    let decoded = decode_jpeg(&contents)?;

    let frame = EncodedFrame {
        width: decoded.width(),
        height: decoded.height(),
        jpeg: contents,
        captured_at: chrono::Local::now(),
    };
    let result = analyzer.analyze(frame.clone()).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    let img = img_with_bbox(&result.detected_objects, &frame.jpeg)?;
    let saved = save_image(img, &image, "-od").await?;
    let test_time = start_test_time.elapsed();

    info!(
        "Tested image in {:#?}, {} vehicles, saved {:?}",
        test_time, result.vehicle_count, saved
    );

    Ok(())
}

fn setup_ansi_support() {
    #[cfg(target_os = "windows")]
    if let Err(e) = ansi_term::enable_ansi_support() {
        eprintln!("Failed to enable ANSI support: {}", e);
    }
}
