use anyhow::{Context, Result};
use assessment_uploader::{
    build_session, config::UploaderConfig, AssessmentSession, PassOutcome, DEFAULT_MIRROR_PATH,
};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "assessment-uploader")]
#[command(about = "Buffer assessment recordings locally and upload them in the background")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Assessment the recordings belong to
    #[arg(long)]
    pub assessment_id: String,

    /// User who produced the recordings
    #[arg(long)]
    pub user_id: String,

    /// Audio files to enqueue for upload
    pub files: Vec<PathBuf>,

    /// JSON configuration file (flags override its values)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Endpoint that returns presigned upload URLs
    #[arg(long)]
    pub presign_endpoint: Option<String>,

    /// Upload into this local directory instead of remote storage
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Mirror directory used to recover recordings after a crash
    #[arg(long)]
    pub mirror_path: Option<PathBuf>,

    /// Keep recordings in memory only
    #[arg(long, default_value = "false")]
    pub no_mirror: bool,

    /// Seconds between scheduled upload passes
    #[arg(long)]
    pub interval: Option<u64>,

    /// Upload attempts per recording before giving up
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Seconds a single upload attempt may take
    #[arg(long)]
    pub attempt_timeout: Option<u64>,

    /// Discard recovered recordings that already used up their upload attempts
    #[arg(long, default_value = "false")]
    pub clear_abandoned: bool,

    /// Upload once and exit instead of running until interrupted
    #[arg(long, default_value = "false")]
    pub once: bool,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl Args {
    /// Merge the optional config file with command-line overrides
    pub fn resolve_config(&self) -> Result<UploaderConfig> {
        let mut config = match &self.config {
            Some(path) => UploaderConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => UploaderConfig::default(),
        };

        if let Some(endpoint) = &self.presign_endpoint {
            config.presign_endpoint = Some(endpoint.clone());
            config.output_dir = None;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = Some(dir.clone());
            config.presign_endpoint = None;
        }
        if let Some(path) = &self.mirror_path {
            config.mirror_path = Some(path.clone());
        }
        if self.no_mirror {
            config.mirror_path = None;
        } else if config.mirror_path.is_none() {
            config.mirror_path = Some(PathBuf::from(DEFAULT_MIRROR_PATH));
        }
        if let Some(interval) = self.interval {
            config.upload_interval_secs = interval;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(timeout) = self.attempt_timeout {
            config.attempt_timeout_secs = timeout;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Guess a media type from the file extension
fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("wav") => "audio/wav",
        Some("ogg") | Some("opus") => "audio/ogg",
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("mp3") => "audio/mpeg",
        _ => "audio/webm",
    }
}

async fn enqueue_files(session: &AssessmentSession, files: &[PathBuf]) -> Result<usize> {
    let mut enqueued = 0;
    for path in files {
        let audio = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let id = session.record(audio, content_type_for(path)).await?;
        info!("Enqueued {} as recording {}", path.display(), id);
        enqueued += 1;
    }
    Ok(enqueued)
}

/// Wait for TERM signal (Unix only)
#[cfg(unix)]
async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut stream) = signal(SignalKind::terminate()) {
        stream.recv().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_term_signal() {
    futures::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = args.resolve_config()?;

    info!("Starting Assessment Uploader v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Assessment: {} (user {})", args.assessment_id, args.user_id);
    match (&config.presign_endpoint, &config.output_dir) {
        (Some(endpoint), _) => info!("  Presign endpoint: {}", endpoint),
        (None, Some(dir)) => info!("  Output directory: {}", dir.display()),
        _ => {}
    }
    match &config.mirror_path {
        Some(path) => info!("  Mirror: {}", path.display()),
        None => info!("  Mirror: disabled"),
    }
    info!("  Interval: {}s", config.upload_interval_secs);
    info!("  Max attempts: {}", config.max_attempts);

    let session = build_session(&config, &args.assessment_id, &args.user_id)
        .await
        .context("Failed to create assessment session")?;

    if args.clear_abandoned {
        let purged = session.buffer().purge_abandoned().await;
        info!("Discarded {} abandoned recordings", purged);
    }

    session.start().await.context("Failed to start session")?;
    let enqueued = enqueue_files(&session, &args.files).await?;
    info!("Enqueued {} files", enqueued);

    if !args.once {
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received Ctrl+C signal"),
            _ = wait_for_term_signal() => info!("Received TERM signal"),
        }
    }

    match session.end().await.context("Failed to end session")? {
        PassOutcome::Completed(report) => info!("Final upload pass: {}", report),
        PassOutcome::Skipped => warn!("Final upload pass skipped"),
    }

    let stats = session.buffer().stats().await;
    info!("{}", stats);
    info!("{}", session.scheduler().executor().stats().await);

    if stats.pending > 0 || stats.abandoned > 0 {
        error!(
            "{} recordings are still waiting for upload and remain in the mirror",
            stats.pending + stats.abandoned
        );
    }

    Ok(())
}
