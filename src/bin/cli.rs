use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use camstream::{
    CameraSource, MuxerTarget, Resolution, SegmentConfig, SegmentDownloader, SessionConfig, StreamJob,
    StreamJobConfig, StreamRequest,
};

/// Everything `--config` may set; missing fields keep their defaults
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    session: SessionConfig,
    segment: SegmentConfig,
    stream: StreamJobConfig,
}

#[derive(Parser)]
#[clap(version, about = "Download recordings from and relay live video of a camera")]
struct Opt {
    /// JSON file with `session`, `segment` and `stream` sections
    #[clap(long)]
    config: Option<PathBuf>,

    /// Camera address
    #[clap(long)]
    host: Option<String>,

    #[clap(long)]
    port: Option<u16>,

    #[clap(long)]
    username: Option<String>,

    /// Cloud password of the camera owner's account
    #[clap(long)]
    password: Option<String>,

    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Fetch a recorded segment into an .mp4 file
    Download {
        /// Segment start, epoch seconds on the camera clock
        #[clap(long)]
        start: i64,
        /// Segment end, epoch seconds on the camera clock
        #[clap(long)]
        end: i64,
        #[clap(long)]
        output_dir: Option<PathBuf>,
        /// Camera clock minus local clock, seconds
        #[clap(long)]
        time_correction: Option<i64>,
        #[clap(long, default_value_t = false)]
        overwrite: bool,
        #[clap(long, default_value_t = false)]
        no_audio: bool,
    },
    /// Relay the live view (MPEG-TS on stdout unless --output is given)
    Stream {
        #[clap(long, value_enum, default_value_t = ResolutionArg::Hd)]
        resolution: ResolutionArg,
        /// Write this file instead of stdout
        #[clap(long)]
        output: Option<PathBuf>,
        /// Stop cleanly after this many seconds of output
        #[clap(long)]
        duration: Option<f64>,
        #[clap(long, default_value_t = false)]
        no_audio: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ResolutionArg {
    Hd,
    Vga,
}

impl From<ResolutionArg> for Resolution {
    fn from(r: ResolutionArg) -> Self {
        match r {
            ResolutionArg::Hd => Resolution::Hd,
            ResolutionArg::Vga => Resolution::Vga,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Prints progress as JSON lines on stderr; stdout may carry video.
fn print_progress() -> mpsc::UnboundedSender<camstream::ProgressEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{line}");
            }
        }
    });
    tx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camstream=info")))
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();
    let mut cfg = load_config(opt.config.as_ref())?;
    if let Some(host) = opt.host {
        cfg.session.host = host;
    }
    if let Some(port) = opt.port {
        cfg.session.port = port;
    }
    if let Some(username) = opt.username {
        cfg.session.username = username;
    }
    if let Some(password) = opt.password {
        cfg.session.cloud_password = password;
    }
    anyhow::ensure!(!cfg.session.host.is_empty(), "no camera host given (--host or config file)");

    match opt.command {
        Cmd::Download { start, end, output_dir, time_correction, overwrite, no_audio } => {
            anyhow::ensure!(end > start, "--end must be after --start");
            let mut segment = cfg.segment;
            if let Some(dir) = output_dir {
                segment.output_dir = dir;
            }
            if let Some(correction) = time_correction {
                segment.time_correction = correction;
            }
            segment.overwrite |= overwrite;
            segment.audio &= !no_audio;

            let downloader = SegmentDownloader::for_camera(cfg.session, segment).with_events(print_progress());
            let outcome = downloader.download(start, end).await?;
            tracing::info!(?outcome, "download done");
        }
        Cmd::Stream { resolution, output, duration, no_audio } => {
            let mut stream = cfg.stream;
            stream.target = output.map_or(MuxerTarget::Stdout, MuxerTarget::File);
            stream.audio &= !no_audio;
            if duration.is_some() {
                stream.duration_secs = duration;
            }
            let request = StreamRequest::Preview { resolution: resolution.into(), audio: stream.audio };
            let source = Arc::new(CameraSource::new(cfg.session));

            let mut job = StreamJob::spawn(source, request, stream, None, Some(print_progress()));
            tokio::select! {
                outcome = job.wait() => {
                    let outcome = outcome?;
                    tracing::info!(?outcome, "stream done");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted");
                    job.stop().await;
                }
            }
        }
    }
    Ok(())
}
