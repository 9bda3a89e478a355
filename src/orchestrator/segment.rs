//! Bounded download of one recorded segment.

use std::path::{Path, PathBuf};

use chrono::{Local, TimeZone};
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;

use super::Reporter;
use super::estimate::{DurationEstimator, DurationProbe, FfprobeProbe};
use super::framing::TsAligner;
use super::muxer::{FfmpegSegmentMuxer, SegmentMuxer};
use super::source::{CameraSource, MediaSource, StreamRequest};
use crate::config::{SegmentConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::types::{Action, DownloadOutcome, ProgressEvent};

/// Intermediate files next to the final output
struct WorkFiles {
    video: PathBuf,
    audio: PathBuf,
}

impl WorkFiles {
    fn for_output(output: &Path) -> Self {
        Self { video: output.with_extension("ts"), audio: output.with_extension("alaw") }
    }

    async fn remove(&self) {
        for path in [&self.video, &self.audio] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove working file"),
            }
        }
    }
}

pub struct SegmentDownloader<S, P, M> {
    source: S,
    probe: P,
    muxer: M,
    config: SegmentConfig,
    events: Option<UnboundedSender<ProgressEvent>>,
}

impl SegmentDownloader<CameraSource, FfprobeProbe, FfmpegSegmentMuxer> {
    pub fn for_camera(session: SessionConfig, config: SegmentConfig) -> Self {
        let probe = FfprobeProbe::new(&config.muxer.ffprobe);
        let muxer = FfmpegSegmentMuxer::new(&config.muxer.ffmpeg);
        Self::new(CameraSource::new(session), probe, muxer, config)
    }
}

impl<S, P, M> SegmentDownloader<S, P, M>
where
    S: MediaSource,
    P: DurationProbe,
    M: SegmentMuxer,
{
    pub fn new(source: S, probe: P, muxer: M, config: SegmentConfig) -> Self {
        Self { source, probe, muxer, config, events: None }
    }

    pub fn with_events(mut self, events: UnboundedSender<ProgressEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// `YYYY.MM.DD-HH.MM.SS-HH.MM.SS.mp4` in local time
    pub fn output_path(&self, start: i64, end: i64) -> PathBuf {
        let local = |t: i64| Local.timestamp_opt(t - self.config.time_correction, 0).earliest();
        let name = match (local(start), local(end)) {
            (Some(s), Some(e)) => format!("{}-{}.mp4", s.format("%Y.%m.%d-%H.%M.%S"), e.format("%H.%M.%S")),
            _ => format!("{start}-{end}.mp4"),
        };
        self.config.output_dir.join(name)
    }

    /// Downloads `[start, end]` (device-clock epochs).
    pub async fn download(&self, start: i64, end: i64) -> Result<DownloadOutcome> {
        self.download_at(start, end, chrono::Utc::now().timestamp()).await
    }

    /// As [`download`](Self::download), with the local clock reading supplied.
    pub async fn download_at(&self, start: i64, end: i64, local_now: i64) -> Result<DownloadOutcome> {
        let output = self.output_path(start, end);
        let expected = (end - start) as f64;
        let reporter = Reporter::new(self.events.clone(), Some(output.clone()), expected);

        let device_now = local_now + self.config.time_correction;
        if end + self.config.recording_guard_secs > device_now {
            tracing::info!(start, end, device_now, "segment is still being recorded");
            reporter.report(Action::RecordingInProgress, 0.0);
            return Err(Error::RecordingInProgress);
        }
        if !self.config.overwrite && tokio::fs::try_exists(&output).await? {
            reporter.report(Action::Skipping, 0.0);
            return Ok(DownloadOutcome::Skipped { path: output });
        }
        if let Some(dir) = output.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let work = WorkFiles::for_output(&output);
        let request = StreamRequest::Playback { start, end };
        let result = self.attempts(&request, expected, &work, &reporter).await;
        let (captured, shorter) = match result {
            Ok(v) => v,
            Err(e) => {
                // partial working files are left for inspection
                let action = if matches!(e, Error::IncompleteCapture { .. }) { Action::GivingUp } else { Action::Failed };
                reporter.report(action, 0.0);
                return Err(e);
            }
        };

        reporter.report(Action::Converting, captured);
        let audio = self.audio_input(&work).await;
        if let Err(e) = self.muxer.mux(&work.video, audio, &output).await {
            reporter.report(Action::Failed, captured);
            return Err(e);
        }
        work.remove().await;

        if shorter {
            reporter.report(Action::FinishedShorter, captured);
            Ok(DownloadOutcome::Shorter { path: output, duration: captured })
        } else {
            reporter.report(Action::Finished, captured);
            Ok(DownloadOutcome::Complete { path: output, duration: captured })
        }
    }

    /// First attempt, then one retry with a smaller window. Returns the
    /// captured duration and whether it fell short.
    async fn attempts(
        &self,
        request: &StreamRequest,
        expected: f64,
        work: &WorkFiles,
        reporter: &Reporter,
    ) -> Result<(f64, bool)> {
        let first = self.capture(request, self.config.window_size, Action::Downloading, work, reporter).await?;
        if first >= expected {
            return Ok((first, false));
        }
        tracing::info!(captured = first, expected, window = self.config.retry_window_size, "stream ended early, retrying");

        let second = self.capture(request, self.config.retry_window_size, Action::Retrying, work, reporter).await?;
        if second >= expected {
            Ok((second, false))
        } else if second + self.config.shorter_tolerance_secs >= expected {
            Ok((second, true))
        } else {
            Err(Error::IncompleteCapture { captured: second, expected })
        }
    }

    /// One pass over the exchange, writing the working files from scratch.
    async fn capture(
        &self,
        request: &StreamRequest,
        window_size: u32,
        action: Action,
        work: &WorkFiles,
        reporter: &Reporter,
    ) -> Result<f64> {
        let mut video = File::create(&work.video).await?;
        let mut audio = if self.config.audio { Some(File::create(&work.audio).await?) } else { None };
        let limit = reporter.total() + self.config.padding_secs;

        let mut responses = self.source.open(request, window_size, self.config.no_data_timeout()).await?;
        let mut aligner = TsAligner::default();
        let mut estimator = DurationEstimator::new(self.config.refresh);
        let mut bytes = 0u64;
        let mut estimate = 0.0;
        reporter.report(action, 0.0);

        while let Some(item) = responses.next().await {
            let response = item?;
            if !response.is_media() {
                if let Some(code) = response.error_code() {
                    tracing::warn!(code, "device reported an error during download");
                }
                continue;
            }

            let cells = aligner.push(&response.plaintext);
            video.write_all(&cells).await?;
            bytes += cells.len() as u64;
            if let (Some(file), Some(samples)) = (audio.as_mut(), &response.audio_payload) {
                file.write_all(samples).await?;
            }

            if estimator.record_chunk() {
                video.flush().await?;
                match self.probe.duration(&work.video).await {
                    Ok(Some(d)) => estimator.update(bytes, d),
                    Ok(None) => estimator.reschedule(),
                    Err(e) => {
                        tracing::debug!(error = %e, "duration probe failed");
                        estimator.reschedule();
                    }
                }
            }
            estimate = estimator.estimate(bytes);
            reporter.report(action, estimate);

            if estimate > limit {
                tracing::debug!(estimate, limit, "captured past the padded end");
                break;
            }
        }
        drop(responses);
        video.flush().await?;
        if let Some(file) = audio.as_mut() {
            file.flush().await?;
        }

        // the last chunks may not have been probed
        if let Ok(Some(d)) = self.probe.duration(&work.video).await {
            estimate = d;
        }
        tracing::debug!(window = window_size, chunks = estimator.chunks(), bytes, estimate, "capture ended");
        Ok(estimate)
    }

    async fn audio_input<'a>(&self, work: &'a WorkFiles) -> Option<&'a Path> {
        if !self.config.audio {
            return None;
        }
        match tokio::fs::metadata(&work.audio).await {
            Ok(meta) if meta.len() > 0 => Some(work.audio.as_path()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream::BoxStream;

    use crate::constants::{TS_PACKET_SIZE, TS_SYNC_BYTE};
    use crate::types::Response;

    /// Each attempt yields a fixed number of one-cell chunks, then goes quiet
    struct ScriptedSource {
        attempts: Mutex<VecDeque<usize>>,
        windows: Mutex<Vec<u32>>,
    }

    impl ScriptedSource {
        fn new(attempts: &[usize]) -> Self {
            Self { attempts: Mutex::new(attempts.iter().copied().collect()), windows: Mutex::new(Vec::new()) }
        }
        fn windows(&self) -> Vec<u32> {
            self.windows.lock().unwrap().clone()
        }
    }

    fn chunk() -> Response {
        let mut cell = vec![0xFFu8; TS_PACKET_SIZE];
        cell[0] = TS_SYNC_BYTE;
        Response::media(cell, Some(bytes::Bytes::from_static(&[0xD5; 160])))
    }

    #[async_trait]
    impl MediaSource for &ScriptedSource {
        async fn open(
            &self,
            _request: &StreamRequest,
            window_size: u32,
            _no_data_timeout: Duration,
        ) -> Result<BoxStream<'static, Result<Response>>> {
            self.windows.lock().unwrap().push(window_size);
            let chunks = self.attempts.lock().unwrap().pop_front().unwrap_or(0);
            Ok(futures::stream::iter((0..chunks).map(|_| Ok(chunk()))).boxed())
        }
    }

    /// One second per transport cell in the file
    struct CellClock;

    #[async_trait]
    impl DurationProbe for CellClock {
        async fn duration(&self, path: &Path) -> Result<Option<f64>> {
            let len = tokio::fs::metadata(path).await?.len();
            Ok(Some((len / TS_PACKET_SIZE as u64) as f64))
        }
    }

    #[derive(Default)]
    struct TouchMuxer {
        calls: Mutex<Vec<(PathBuf, Option<PathBuf>)>>,
    }

    #[async_trait]
    impl SegmentMuxer for &TouchMuxer {
        async fn mux(&self, video: &Path, audio: Option<&Path>, output: &Path) -> Result<()> {
            self.calls.lock().unwrap().push((video.to_path_buf(), audio.map(Path::to_path_buf)));
            tokio::fs::write(output, b"mp4").await?;
            Ok(())
        }
    }

    const START: i64 = 1000;
    const END: i64 = 1010;
    const NOW: i64 = 1_000_000;

    fn config(dir: &Path) -> SegmentConfig {
        SegmentConfig { output_dir: dir.to_path_buf(), padding_secs: 5.0, ..Default::default() }
    }

    #[tokio::test]
    async fn complete_on_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(&[13]);
        let muxer = TouchMuxer::default();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let dl = SegmentDownloader::new(&source, CellClock, &muxer, config(dir.path())).with_events(tx);

        let outcome = dl.download_at(START, END, NOW).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Complete { duration, .. } if duration == 13.0));
        assert_eq!(source.windows(), [200]);
        assert!(outcome.path().exists());

        let calls = muxer.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.is_some());
        // working files are cleaned up
        assert!(!calls[0].0.exists());

        drop(dl);
        let mut actions = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            actions.push(ev.action);
        }
        assert_eq!(actions.first(), Some(&Action::Downloading));
        assert_eq!(&actions[actions.len() - 2..], [Action::Converting, Action::Finished]);
        assert!(!actions.contains(&Action::Retrying));
    }

    #[tokio::test]
    async fn shorter_retry_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(&[4, 9]);
        let muxer = TouchMuxer::default();
        let dl = SegmentDownloader::new(&source, CellClock, &muxer, config(dir.path()));

        let outcome = dl.download_at(START, END, NOW).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Shorter { duration, .. } if duration == 9.0));
        assert_eq!(source.windows(), [200, 50]);
    }

    #[tokio::test]
    async fn retry_too_short_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(&[4, 3]);
        let muxer = TouchMuxer::default();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let dl = SegmentDownloader::new(&source, CellClock, &muxer, config(dir.path())).with_events(tx);

        let err = dl.download_at(START, END, NOW).await.unwrap_err();
        assert!(matches!(err, Error::IncompleteCapture { captured, expected } if captured == 3.0 && expected == 10.0));
        assert!(muxer.calls.lock().unwrap().is_empty());

        let mut last = None;
        while let Ok(ev) = rx.try_recv() {
            last = Some(ev.action);
        }
        assert_eq!(last, Some(Action::GivingUp));
    }

    #[tokio::test]
    async fn stops_once_past_the_padded_end() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(&[40]);
        let muxer = TouchMuxer::default();
        let dl = SegmentDownloader::new(&source, CellClock, &muxer, config(dir.path()));

        let outcome = dl.download_at(START, END, NOW).await.unwrap();
        // 10 s segment plus 5 s padding; the 16th cell crosses it
        assert!(matches!(outcome, DownloadOutcome::Complete { duration, .. } if duration == 16.0));
    }

    #[tokio::test]
    async fn recent_segment_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(&[13]);
        let muxer = TouchMuxer::default();
        let mut cfg = config(dir.path());
        cfg.time_correction = 30;
        let dl = SegmentDownloader::new(&source, CellClock, &muxer, cfg);

        // device clock reads END + 50, inside the 60 s guard
        let err = dl.download_at(START, END, END + 20).await.unwrap_err();
        assert!(matches!(err, Error::RecordingInProgress));
        assert!(source.windows().is_empty());
    }

    #[tokio::test]
    async fn existing_output_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(&[13]);
        let muxer = TouchMuxer::default();
        let dl = SegmentDownloader::new(&source, CellClock, &muxer, config(dir.path()));
        std::fs::write(dl.output_path(START, END), b"old").unwrap();

        let outcome = dl.download_at(START, END, NOW).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Skipped { .. }));
        assert!(source.windows().is_empty());
    }

    #[test]
    fn output_name_shape() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(&[]);
        let muxer = TouchMuxer::default();
        let dl = SegmentDownloader::new(&source, CellClock, &muxer, config(dir.path()));
        let path = dl.output_path(1_700_000_000, 1_700_000_060);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with(".mp4"));
        let stem = name.trim_end_matches(".mp4");
        let parts: Vec<&str> = stem.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), "YYYY.MM.DD".len());
        assert!(parts[1..].iter().all(|p| p.len() == "HH.MM.SS".len()));
        assert_eq!(path.parent(), Some(dir.path()));
    }
}
