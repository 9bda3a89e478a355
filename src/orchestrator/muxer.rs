//! The external muxer process and the pipes feeding it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{MuxerConfig, MuxerTarget};
use crate::constants::{ALAW_SAMPLE_RATE, MUXER_CHANNEL_CAPACITY, MUXER_POLL_INTERVAL_MS};
use crate::error::{Error, Result};

/// Seconds from an ffmpeg `time=HH:MM:SS.ss` progress marker
pub fn parse_time_marker(line: &str) -> Option<f64> {
    let rest = &line[line.rfind("time=")? + 5..];
    let stamp = rest.split_whitespace().next()?;
    let mut parts = stamp.splitn(3, ':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let s: f64 = parts.next()?.parse().ok()?;
    let secs = h * 3600.0 + m * 60.0 + s;
    (secs >= 0.0).then_some(secs)
}

fn audio_input_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-f", "alaw", "-ar"].map(Into::into).to_vec();
    args.push(ALAW_SAMPLE_RATE.to_string().into());
    args.extend(["-ac", "1", "-i"].map(OsString::from));
    args.push(path.into());
    args
}

/// Arguments for a muxer reading MPEG-TS on stdin and, optionally, raw
/// A-law from `audio`.
pub fn relay_args(target: &MuxerTarget, audio: Option<&Path>) -> Vec<OsString> {
    let mut args: Vec<OsString> =
        ["-hide_banner", "-y", "-fflags", "+genpts", "-f", "mpegts", "-i", "pipe:0"].map(Into::into).to_vec();
    if let Some(audio) = audio {
        args.extend(audio_input_args(audio));
    }
    args.extend(["-map", "0:v", "-c:v", "copy"].map(OsString::from));
    if audio.is_some() {
        args.extend(["-map", "1:a", "-c:a", "aac"].map(OsString::from));
    }
    match target {
        MuxerTarget::File(path) => args.push(path.into()),
        MuxerTarget::Stdout => args.extend(["-f", "mpegts", "pipe:1"].map(OsString::from)),
    }
    args
}

/// Arguments for muxing finished working files into `output`.
pub fn segment_args(video: &Path, audio: Option<&Path>, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-y", "-loglevel", "error", "-f", "mpegts", "-i"].map(Into::into).to_vec();
    args.push(video.into());
    if let Some(audio) = audio {
        args.extend(audio_input_args(audio));
    }
    args.extend(["-map", "0:v", "-c:v", "copy"].map(OsString::from));
    if audio.is_some() {
        args.extend(["-map", "1:a", "-c:a", "aac"].map(OsString::from));
    }
    args.push(output.into());
    args
}

/// Final step of a segment download
#[async_trait]
pub trait SegmentMuxer: Send + Sync {
    async fn mux(&self, video: &Path, audio: Option<&Path>, output: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FfmpegSegmentMuxer {
    ffmpeg: PathBuf,
}

impl FfmpegSegmentMuxer {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self { ffmpeg: ffmpeg.into() }
    }
}

#[async_trait]
impl SegmentMuxer for FfmpegSegmentMuxer {
    async fn mux(&self, video: &Path, audio: Option<&Path>, output: &Path) -> Result<()> {
        let out = Command::new(&self.ffmpeg)
            .args(segment_args(video, audio, output))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Muxer(format!("failed to run {}: {e}", self.ffmpeg.display())))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let last = stderr.lines().last().unwrap_or_default();
            return Err(Error::Muxer(format!("{} exited with {}: {last}", self.ffmpeg.display(), out.status)));
        }
        Ok(())
    }
}

/// Copies queued buffers into `writer` until the queue closes, then shuts
/// the writer down so the reader sees EOF.
pub(crate) async fn pump<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W, name: &'static str)
where
    W: AsyncWrite + Unpin,
{
    while let Some(buf) = rx.recv().await {
        if let Err(e) = writer.write_all(&buf).await {
            tracing::warn!(pipe = name, error = %e, "muxer input closed");
            return;
        }
    }
    let _ = writer.shutdown().await;
    tracing::debug!(pipe = name, "muxer input finished");
}

/// Reads the muxer's log, publishing every `time=` marker.
async fn scrape_progress<R: AsyncRead + Unpin>(mut stderr: R, progress: watch::Sender<f64>) {
    let mut buf = vec![0u8; 4096];
    let mut line = Vec::new();
    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\r' || b == b'\n' {
                if !line.is_empty() {
                    let text = String::from_utf8_lossy(&line);
                    match parse_time_marker(&text) {
                        Some(secs) => {
                            let _ = progress.send(secs);
                        }
                        None => tracing::trace!(target: "camstream::ffmpeg", "{text}"),
                    }
                    line.clear();
                }
            } else {
                line.push(b);
            }
        }
    }
}

/// Relays the muxer's stdout into a caller-supplied channel.
async fn forward_stdout<R: AsyncRead + Unpin>(mut stdout: R, sink: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if sink.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// A running ffmpeg fed through bounded channels
pub struct MuxerProcess {
    child: Child,
    video: Option<mpsc::Sender<Bytes>>,
    audio: Option<mpsc::Sender<Bytes>>,
    tasks: Vec<JoinHandle<()>>,
    progress: watch::Receiver<f64>,
    _fifo_dir: Option<tempfile::TempDir>,
}

impl MuxerProcess {
    /// Starts the muxer. With `audio`, raw A-law is passed through a named
    /// pipe next to stdin. With a `stdout` sink, the muxer's output is
    /// relayed there; otherwise it inherits the parent's stdout.
    pub async fn spawn(
        config: &MuxerConfig,
        target: &MuxerTarget,
        audio: bool,
        stdout: Option<mpsc::Sender<Bytes>>,
    ) -> Result<Self> {
        let fifo_dir = if audio { Some(tempfile::tempdir()?) } else { None };
        let fifo_path = fifo_dir.as_ref().map(|d| d.path().join("audio.alaw"));
        if let Some(path) = &fifo_path {
            make_fifo(path)?;
        }

        let mut cmd = Command::new(&config.ffmpeg);
        cmd.args(relay_args(target, fifo_path.as_deref()))
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.stdout(if stdout.is_some() { Stdio::piped() } else { Stdio::inherit() });
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Muxer(format!("failed to spawn {}: {e}", config.ffmpeg.display())))?;
        tracing::info!(ffmpeg = %config.ffmpeg.display(), ?target, audio, "muxer started");

        let mut tasks = Vec::new();
        let (video_tx, video_rx) = mpsc::channel(MUXER_CHANNEL_CAPACITY);
        let stdin = child.stdin.take().ok_or_else(|| Error::Muxer("muxer stdin unavailable".into()))?;
        tasks.push(tokio::spawn(pump(video_rx, stdin, "video")));

        let audio_tx = match &fifo_path {
            Some(path) => {
                let sender = open_fifo_writer(path).await?;
                let (tx, rx) = mpsc::channel(MUXER_CHANNEL_CAPACITY);
                tasks.push(tokio::spawn(pump(rx, sender, "audio")));
                Some(tx)
            }
            None => None,
        };

        let (progress_tx, progress) = watch::channel(0.0);
        if let Some(stderr) = child.stderr.take() {
            tasks.push(tokio::spawn(scrape_progress(stderr, progress_tx)));
        }
        if let (Some(sink), Some(out)) = (stdout, child.stdout.take()) {
            tasks.push(tokio::spawn(forward_stdout(out, sink)));
        }

        Ok(Self { child, video: Some(video_tx), audio: audio_tx, tasks, progress, _fifo_dir: fifo_dir })
    }

    pub async fn write_video(&mut self, data: Bytes) -> Result<()> {
        let tx = self.video.clone();
        self.feed(tx, data).await
    }

    pub async fn write_audio(&mut self, data: Bytes) -> Result<()> {
        let tx = self.audio.clone();
        self.feed(tx, data).await
    }

    /// Waits for room in the pipe queue, checking that the muxer is still
    /// alive while it waits.
    async fn feed(&mut self, tx: Option<mpsc::Sender<Bytes>>, data: Bytes) -> Result<()> {
        let Some(tx) = tx else {
            return Err(Error::Muxer("muxer input already closed".into()));
        };
        let poll = Duration::from_millis(MUXER_POLL_INTERVAL_MS);
        loop {
            tokio::select! {
                permit = tx.reserve() => {
                    let permit = permit.map_err(|_| Error::Muxer("muxer stopped reading its input".into()))?;
                    permit.send(data);
                    return Ok(());
                }
                _ = tokio::time::sleep(poll) => {
                    if let Some(status) = self.child.try_wait()? {
                        return Err(Error::Muxer(format!("muxer exited early with {status}")));
                    }
                    tracing::trace!("muxer input is backed up");
                }
            }
        }
    }

    /// Latest `time=` position reported by the muxer
    pub fn progress(&self) -> f64 {
        *self.progress.borrow()
    }

    pub fn progress_watch(&self) -> watch::Receiver<f64> {
        self.progress.clone()
    }

    /// Closes stdin and the audio pipe so the muxer finalizes its output.
    pub fn close_inputs(&mut self) {
        self.video = None;
        self.audio = None;
    }

    pub fn has_exited(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Closes the inputs and waits for a clean exit.
    pub async fn finish(mut self) -> Result<f64> {
        self.close_inputs();
        let status = self.child.wait().await?;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        let seconds = self.progress();
        if !status.success() {
            return Err(Error::Muxer(format!("muxer exited with {status}")));
        }
        tracing::info!(seconds, "muxer finished");
        Ok(seconds)
    }

    pub async fn kill(mut self) {
        let _ = self.child.kill().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> Result<()> {
    use nix::sys::stat::Mode;
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| Error::Io(e.into()))
}

#[cfg(not(unix))]
fn make_fifo(_path: &Path) -> Result<()> {
    Err(Error::Muxer("audio relay needs named pipes".into()))
}

/// Opening for read and write never blocks waiting for the muxer to open
/// its end, and closing it still delivers EOF once the muxer holds the
/// only other descriptor.
#[cfg(target_os = "linux")]
async fn open_fifo_writer(path: &Path) -> Result<tokio::net::unix::pipe::Sender> {
    Ok(tokio::net::unix::pipe::OpenOptions::new().read_write(true).open_sender(path)?)
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn open_fifo_writer(path: &Path) -> Result<tokio::net::unix::pipe::Sender> {
    // ENXIO until the muxer has opened the read end
    for _ in 0..100 {
        match tokio::net::unix::pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            Err(e) if e.raw_os_error() == Some(nix::libc::ENXIO) => {
                tokio::time::sleep(Duration::from_millis(MUXER_POLL_INTERVAL_MS / 5)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Muxer("muxer never opened the audio pipe".into()))
}

#[cfg(not(unix))]
async fn open_fifo_writer(_path: &Path) -> Result<tokio::io::Sink> {
    Err(Error::Muxer("audio relay needs named pipes".into()))
}
