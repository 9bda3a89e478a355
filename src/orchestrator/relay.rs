//! Pipe-fed stream jobs: live relay, or a download muxed on the fly.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Reporter;
use super::framing::{AudioFramer, TsAligner};
use super::muxer::MuxerProcess;
use super::source::{MediaSource, StreamRequest};
use crate::config::{MuxerTarget, StreamJobConfig};
use crate::constants::{ALAW_FRAME_SIZE, MUXER_POLL_INTERVAL_MS};
use crate::error::{Error, Result};
use crate::types::{Action, JobOutcome, ProgressEvent};

/// Handle to a running stream job
pub struct StreamJob {
    task: Option<JoinHandle<Result<JobOutcome>>>,
    reporter: Reporter,
}

impl StreamJob {
    /// Starts the job on the current runtime. With `stdout`, muxer output
    /// (for [`MuxerTarget::Stdout`]) is relayed into that channel.
    pub fn spawn<S>(
        source: Arc<S>,
        request: StreamRequest,
        config: StreamJobConfig,
        stdout: Option<mpsc::Sender<Bytes>>,
        events: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Self
    where
        S: MediaSource + 'static,
    {
        let file_name = match &config.target {
            MuxerTarget::File(path) => Some(path.clone()),
            MuxerTarget::Stdout => None,
        };
        let reporter = Reporter::new(events, file_name, config.duration_secs.unwrap_or(0.0));
        let task = tokio::spawn(run(source, request, config, stdout, reporter.clone()));
        Self { task: Some(task), reporter }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancels the job and waits until it is gone. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();
        match task.await {
            Err(e) if e.is_cancelled() => self.reporter.report(Action::Stopped, 0.0),
            Err(e) => tracing::warn!(error = %e, "stream job panicked"),
            Ok(_) => {}
        }
    }

    /// Waits for the job to end on its own.
    pub async fn wait(&mut self) -> Result<JobOutcome> {
        let task = self.task.take().ok_or_else(|| Error::Muxer("stream job already collected".into()))?;
        task.await.map_err(|e| Error::Muxer(format!("stream job aborted: {e}")))?
    }
}

impl Drop for StreamJob {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn run<S: MediaSource>(
    source: Arc<S>,
    request: StreamRequest,
    config: StreamJobConfig,
    stdout: Option<mpsc::Sender<Bytes>>,
    reporter: Reporter,
) -> Result<JobOutcome> {
    let result = relay(&*source, &request, &config, stdout, &reporter).await;
    match &result {
        Ok(JobOutcome::DurationReached { seconds } | JobOutcome::StreamEnded { seconds }) => {
            reporter.report(Action::Finished, *seconds)
        }
        Err(e) => {
            tracing::error!(error = %e, "stream job failed");
            reporter.report(Action::Failed, 0.0);
        }
    }
    result
}

async fn relay<S: MediaSource + ?Sized>(
    source: &S,
    request: &StreamRequest,
    config: &StreamJobConfig,
    stdout: Option<mpsc::Sender<Bytes>>,
    reporter: &Reporter,
) -> Result<JobOutcome> {
    let mut muxer = MuxerProcess::spawn(&config.muxer, &config.target, config.audio, stdout).await?;
    let mut responses = source.open(request, config.window_size, config.no_data_timeout()).await?;
    let mut progress = muxer.progress_watch();
    let mut watching = true;
    let mut aligner = TsAligner::default();
    let mut framer = AudioFramer::new(ALAW_FRAME_SIZE);
    let mut liveness = tokio::time::interval(Duration::from_millis(MUXER_POLL_INTERVAL_MS));
    let reached = |secs: f64| config.duration_secs.is_some_and(|limit| secs >= limit);
    reporter.report(Action::Streaming, 0.0);

    let duration_reached = loop {
        tokio::select! {
            item = responses.next() => match item {
                Some(Ok(response)) => {
                    if !response.is_media() {
                        if let Some(code) = response.error_code() {
                            tracing::warn!(code, "device reported an error while streaming");
                        }
                        continue;
                    }
                    let cells = aligner.push(&response.plaintext);
                    if !cells.is_empty() {
                        muxer.write_video(cells).await?;
                    }
                    if let Some(samples) = response.audio_payload.as_ref().filter(|_| config.audio) {
                        for frame in framer.push(samples) {
                            muxer.write_audio(frame).await?;
                        }
                    }
                }
                Some(Err(e)) => {
                    muxer.kill().await;
                    return Err(e);
                }
                None => break false,
            },
            changed = progress.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let secs = *progress.borrow_and_update();
                reporter.report(Action::Streaming, secs);
                if reached(secs) {
                    break true;
                }
            }
            _ = liveness.tick() => {
                if let Some(status) = muxer.has_exited()? {
                    return Err(Error::Muxer(format!("muxer exited early with {status}")));
                }
            }
        }
    };
    drop(responses);

    // closing the inputs lets the muxer finalize instead of being killed
    if framer.pending() > 0 {
        tracing::debug!(bytes = framer.pending(), "dropping partial audio frame");
    }
    let seconds = muxer.finish().await?;
    Ok(if duration_reached {
        JobOutcome::DurationReached { seconds }
    } else {
        JobOutcome::StreamEnded { seconds }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use futures::stream::BoxStream;

    use crate::config::MuxerConfig;
    use crate::orchestrator::source::Resolution;
    use crate::types::Response;

    /// Never yields anything
    struct Silent;

    #[async_trait]
    impl MediaSource for Silent {
        async fn open(&self, _: &StreamRequest, _: u32, _: Duration) -> Result<BoxStream<'static, Result<Response>>> {
            Ok(futures::stream::pending().boxed())
        }
    }

    fn request() -> StreamRequest {
        StreamRequest::Preview { resolution: Resolution::Hd, audio: false }
    }

    fn config(ffmpeg: impl Into<PathBuf>) -> StreamJobConfig {
        StreamJobConfig {
            audio: false,
            muxer: MuxerConfig { ffmpeg: ffmpeg.into(), ffprobe: "ffprobe".into() },
            ..Default::default()
        }
    }

    /// A stand-in muxer that ignores its arguments
    #[cfg(unix)]
    fn fake_muxer(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<Action> {
        let mut actions = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            actions.push(ev.action);
        }
        actions
    }

    #[tokio::test]
    async fn missing_muxer_fails_the_job() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut job = StreamJob::spawn(Arc::new(Silent), request(), config("/nonexistent/ffmpeg"), None, Some(tx));
        assert!(matches!(job.wait().await, Err(Error::Muxer(_))));
        assert!(!job.is_running());
        assert_eq!(drain(&mut rx).last(), Some(&Action::Failed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn muxer_exit_is_noticed_while_idle() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = fake_muxer(dir.path(), "exit 3");
        let mut job = StreamJob::spawn(Arc::new(Silent), request(), config(muxer), None, None);
        let outcome = tokio::time::timeout(Duration::from_secs(5), job.wait()).await.unwrap();
        assert!(matches!(outcome, Err(Error::Muxer(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = fake_muxer(dir.path(), "exec sleep 30");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut job = StreamJob::spawn(Arc::new(Silent), request(), config(muxer), None, Some(tx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(job.is_running());

        job.stop().await;
        assert!(!job.is_running());
        job.stop().await;
        assert!(matches!(job.wait().await, Err(Error::Muxer(_))));

        let actions = drain(&mut rx);
        assert_eq!(actions.first(), Some(&Action::Streaming));
        assert_eq!(actions.iter().filter(|a| **a == Action::Stopped).count(), 1);
    }
}
