//! Per-stream capture engine.
//!
//! One engine owns one source connection and one capture thread. The thread
//! reads frames in a loop, samples them on a time policy, and submits a
//! dispatch task per sampled frame to the shared queue. Live sources
//! reconnect with a fixed backoff after a failed read; file sources treat a
//! failed read as end of stream.
//!
//! `start()` probe-opens the source on the caller's thread so a dead source
//! fails fast instead of reporting success and erroring in the background.
//! `stop()` is cooperative: it flips a flag the loop polls and joins the
//! thread with a bounded wait.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::capture::{self, Frame, FrameSource};
use crate::epoch_now;
use crate::queue::TaskQueue;
use crate::sink::{DetectionClient, DispatchFrame};

/// Backoff between reconnect attempts on a live source.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
/// Bound on the capture-thread join in `stop()`.
const STOP_WAIT: Duration = Duration::from_secs(5);

pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 50;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Immutable parameters fixed when a stream starts.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub stream_id: String,
    /// Resolved source locator (URL or absolute file path).
    pub video_source: String,
    pub detection_url: String,
    pub frame_interval: Duration,
    pub device_id: Option<i64>,
    pub user_id: Option<i64>,
    pub request_timeout: Duration,
    /// Sampled frames are dropped while the queue backlog is at or above
    /// this depth.
    pub max_queue_depth: usize,
}

/// Running counters for one stream. `frames_processed` equals
/// `frames_sent + frames_failed + frames_dropped` once in-flight dispatches
/// settle.
#[derive(Clone, Debug, Default)]
pub struct StreamStats {
    pub frames_processed: u64,
    pub frames_sent: u64,
    pub frames_failed: u64,
    pub frames_dropped: u64,
    pub last_frame_time: Option<f64>,
    pub last_sample_time: Option<f64>,
    pub last_error: Option<String>,
}

/// Status snapshot handed to callers; never a live reference.
#[derive(Clone, Debug, Serialize)]
pub struct StreamStatus {
    pub stream_id: String,
    pub is_running: bool,
    pub connection_active: bool,
    pub video_source: String,
    pub frame_interval_secs: u64,
    pub frames_processed: u64,
    pub frames_sent: u64,
    pub frames_failed: u64,
    pub frames_dropped: u64,
    pub last_frame_time: Option<f64>,
    pub last_sample_time: Option<f64>,
    pub last_error: Option<String>,
    pub device_id: Option<i64>,
    pub user_id: Option<i64>,
}

/// State shared between the engine, its capture thread, and in-flight
/// dispatch jobs.
pub(crate) struct EngineShared {
    running: AtomicBool,
    connection_active: AtomicBool,
    stats: Mutex<StreamStats>,
}

impl EngineShared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            connection_active: AtomicBool::new(false),
            stats: Mutex::new(StreamStats::default()),
        }
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, StreamStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_error(&self, message: String) {
        self.lock_stats().last_error = Some(message);
    }

    pub(crate) fn record_sent(&self) {
        self.lock_stats().frames_sent += 1;
    }

    pub(crate) fn record_dispatch_failure(&self, message: &str) {
        let mut stats = self.lock_stats();
        stats.frames_failed += 1;
        stats.last_error = Some(message.to_string());
    }
}

/// Per-stream capture engine. At most one may exist per stream identifier;
/// the registry enforces that.
pub struct CaptureEngine {
    config: Arc<StreamConfig>,
    shared: Arc<EngineShared>,
    queue: Arc<TaskQueue>,
    client: Arc<DetectionClient>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureEngine {
    pub fn new(config: StreamConfig, queue: Arc<TaskQueue>) -> Self {
        let client = Arc::new(DetectionClient::new(
            &config.detection_url,
            config.request_timeout,
        ));
        Self {
            config: Arc::new(config),
            shared: Arc::new(EngineShared::new()),
            queue,
            client,
            handle: None,
        }
    }

    /// Probe-open the source and spawn the capture thread. Fails without
    /// spawning anything if the source cannot be opened; fails if the engine
    /// is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.shared.running.load(Ordering::SeqCst) {
            bail!("stream '{}' is already running", self.config.stream_id);
        }

        self.queue.start();

        let source = match capture::open_source(
            &self.config.video_source,
            self.config.request_timeout,
        ) {
            Ok(source) => source,
            Err(error) => {
                self.shared.set_error(format!("{error:#}"));
                log::error!("stream {}: {error:#}", self.config.stream_id);
                return Err(error);
            }
        };

        self.shared.running.store(true, Ordering::SeqCst);
        // The probe-open above succeeded, so the connection is live from the
        // caller's point of view before the thread takes over.
        self.shared.connection_active.store(true, Ordering::SeqCst);
        let config = Arc::clone(&self.config);
        let shared = Arc::clone(&self.shared);
        let queue = Arc::clone(&self.queue);
        let client = Arc::clone(&self.client);
        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", self.config.stream_id))
            .spawn(move || capture_loop(config, shared, queue, client, source));
        match handle {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(error) => {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.connection_active.store(false, Ordering::SeqCst);
                Err(error).context("spawn capture thread")
            }
        }
    }

    /// Cooperative stop. Always succeeds; stopping a stopped engine is a
    /// no-op. Dispatch tasks already queued run to completion.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + STOP_WAIT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::warn!(
                    "stream {}: capture thread did not exit within {STOP_WAIT:?}",
                    self.config.stream_id
                );
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> StreamStatus {
        let stats = self.shared.lock_stats().clone();
        StreamStatus {
            stream_id: self.config.stream_id.clone(),
            is_running: self.shared.running.load(Ordering::SeqCst),
            connection_active: self.shared.connection_active.load(Ordering::SeqCst),
            video_source: self.config.video_source.clone(),
            frame_interval_secs: self.config.frame_interval.as_secs(),
            frames_processed: stats.frames_processed,
            frames_sent: stats.frames_sent,
            frames_failed: stats.frames_failed,
            frames_dropped: stats.frames_dropped,
            last_frame_time: stats.last_frame_time,
            last_sample_time: stats.last_sample_time,
            last_error: stats.last_error,
            device_id: self.config.device_id,
            user_id: self.config.user_id,
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.lock_stats().last_error.clone()
    }
}

/// Time-based sampling policy. File sources with a usable playback position
/// sample on video time; everything else samples on the wall clock. Either
/// way a frame is sampled at most once per interval.
struct Sampler {
    interval: Duration,
    last_wall: Option<Instant>,
    last_position_ms: Option<f64>,
}

impl Sampler {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_wall: None,
            last_position_ms: None,
        }
    }

    fn should_sample(&mut self, now: Instant, position_ms: Option<f64>) -> bool {
        if let Some(position) = position_ms.filter(|p| *p > 0.0) {
            let interval_ms = self.interval.as_secs_f64() * 1000.0;
            match self.last_position_ms {
                Some(last) if position - last < interval_ms => false,
                _ => {
                    self.last_position_ms = Some(position);
                    true
                }
            }
        } else {
            match self.last_wall {
                Some(last) if now.duration_since(last) < self.interval => false,
                _ => {
                    self.last_wall = Some(now);
                    true
                }
            }
        }
    }
}

fn capture_loop(
    config: Arc<StreamConfig>,
    shared: Arc<EngineShared>,
    queue: Arc<TaskQueue>,
    client: Arc<DetectionClient>,
    mut source: Box<dyn FrameSource>,
) {
    let mut sampler = Sampler::new(config.frame_interval);
    log::info!(
        "stream {}: capture loop started for {}",
        config.stream_id,
        config.video_source
    );

    while shared.running.load(Ordering::SeqCst) {
        match source.read_frame() {
            Ok(frame) => {
                let now = Instant::now();
                let wall = epoch_now();
                let position_ms = if source.is_finite() {
                    frame.position_ms
                } else {
                    None
                };
                shared.lock_stats().last_frame_time = Some(wall);

                if sampler.should_sample(now, position_ms) {
                    dispatch_frame(&config, &shared, &queue, &client, frame, wall);
                }
            }
            Err(error) => {
                shared.connection_active.store(false, Ordering::SeqCst);
                shared.set_error(format!("{error:#}"));
                log::warn!(
                    "stream {}: read failed on {}: {error:#}",
                    config.stream_id,
                    config.video_source
                );

                if source.is_finite() {
                    // End of content for a file; nothing to reconnect to.
                    break;
                }
                if !interruptible_sleep(&shared.running, RECONNECT_BACKOFF) {
                    break;
                }
                match source.reopen() {
                    Ok(()) => {
                        shared.connection_active.store(true, Ordering::SeqCst);
                        log::info!(
                            "stream {}: reconnected to {}",
                            config.stream_id,
                            config.video_source
                        );
                    }
                    Err(error) => {
                        shared.set_error(format!("{error:#}"));
                    }
                }
            }
        }
    }

    shared.connection_active.store(false, Ordering::SeqCst);
    log::info!("stream {}: capture loop exited", config.stream_id);
}

fn dispatch_frame(
    config: &Arc<StreamConfig>,
    shared: &Arc<EngineShared>,
    queue: &Arc<TaskQueue>,
    client: &Arc<DetectionClient>,
    frame: Frame,
    sample_time: f64,
) {
    // Every sampled frame counts as processed, whatever its fate, so that
    // frames_processed = frames_sent + frames_failed + frames_dropped once
    // in-flight dispatches settle.
    let frame_number = {
        let mut stats = shared.lock_stats();
        stats.frames_processed += 1;
        stats.last_sample_time = Some(sample_time);
        stats.frames_processed
    };

    let jpeg = match frame.into_jpeg() {
        Ok(jpeg) => jpeg,
        Err(error) => {
            let mut stats = shared.lock_stats();
            stats.frames_failed += 1;
            stats.last_error = Some(format!("{error:#}"));
            return;
        }
    };

    // Backpressure: the frame is never buffered, just discarded.
    if queue.queued_len() >= config.max_queue_depth {
        shared.lock_stats().frames_dropped += 1;
        return;
    }

    let task_id = format!(
        "{}:{}:{:08x}",
        config.stream_id,
        frame_number,
        rand::random::<u32>()
    );
    let work = DispatchFrame::new(
        Arc::clone(client),
        Arc::clone(shared),
        config.stream_id.clone(),
        frame_number,
        config.device_id,
        config.user_id,
        jpeg,
    );
    if let Err(error) = queue.submit(&task_id, Box::new(work)) {
        let mut stats = shared.lock_stats();
        stats.frames_failed += 1;
        stats.last_error = Some(format!("{error:#}"));
    }
}

/// Sleep in small steps so a stop request cuts the backoff short. Returns
/// false if the running flag was cleared while waiting.
fn interruptible_sleep(running: &AtomicBool, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    running.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(source: &str, interval: Duration) -> StreamConfig {
        StreamConfig {
            stream_id: "test".to_string(),
            video_source: source.to_string(),
            // Closed port; dispatch attempts fail fast.
            detection_url: "http://127.0.0.1:9/detect".to_string(),
            frame_interval: interval,
            device_id: None,
            user_id: None,
            request_timeout: Duration::from_millis(500),
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
        }
    }

    fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn wall_clock_sampler_respects_interval() {
        let mut sampler = Sampler::new(Duration::from_secs(2));
        let t0 = Instant::now();
        assert!(sampler.should_sample(t0, None));
        assert!(!sampler.should_sample(t0 + Duration::from_millis(500), None));
        assert!(!sampler.should_sample(t0 + Duration::from_millis(1999), None));
        assert!(sampler.should_sample(t0 + Duration::from_secs(2), None));
        assert!(!sampler.should_sample(t0 + Duration::from_secs(3), None));
        assert!(sampler.should_sample(t0 + Duration::from_secs(4), None));
    }

    #[test]
    fn video_time_sampler_ignores_wall_clock() {
        let mut sampler = Sampler::new(Duration::from_secs(2));
        let t0 = Instant::now();
        // All calls at the same wall instant; only the position advances.
        assert!(sampler.should_sample(t0, Some(40.0)));
        assert!(!sampler.should_sample(t0, Some(1000.0)));
        assert!(!sampler.should_sample(t0, Some(2030.0)));
        assert!(sampler.should_sample(t0, Some(2040.0)));
        assert!(sampler.should_sample(t0, Some(4100.0)));
    }

    #[test]
    fn sampler_falls_back_to_wall_clock_without_position() {
        let mut sampler = Sampler::new(Duration::from_secs(1));
        let t0 = Instant::now();
        // Position of zero is treated as "no usable position".
        assert!(sampler.should_sample(t0, Some(0.0)));
        assert!(!sampler.should_sample(t0 + Duration::from_millis(100), None));
        assert!(sampler.should_sample(t0 + Duration::from_secs(1), None));
    }

    #[test]
    fn start_fails_fast_on_unopenable_source() {
        let queue = Arc::new(TaskQueue::new(1, 16));
        let mut engine = CaptureEngine::new(
            test_config("/no/such/file.mp4", Duration::from_secs(1)),
            queue.clone(),
        );
        assert!(engine.start().is_err());
        assert!(!engine.is_running());
        assert!(engine.last_error().is_some());
        queue.stop();
    }

    #[test]
    fn second_start_without_stop_is_rejected() {
        let queue = Arc::new(TaskQueue::new(1, 16));
        let mut engine = CaptureEngine::new(
            test_config("stub://cam?fps=50", Duration::from_secs(1)),
            queue.clone(),
        );
        engine.start().unwrap();
        assert!(engine.start().is_err());
        engine.stop();
        assert!(!engine.is_running());
        queue.stop();
    }

    #[test]
    fn file_source_samples_on_video_time() {
        let queue = Arc::new(TaskQueue::new(1, 64));
        // 50 frames at 100 fps with kind=file: positions 10ms..500ms of video
        // time at 10ms per frame. Interval 200ms of video time samples
        // positions 10, 210, 410 -> exactly 3 frames.
        let mut engine = CaptureEngine::new(
            test_config(
                "stub://clip?fps=100&frames=50&kind=file",
                Duration::from_millis(200),
            ),
            queue.clone(),
        );
        engine.start().unwrap();
        assert!(wait_until(
            || !engine.status().connection_active,
            Duration::from_secs(10),
        ));
        let status = engine.status();
        assert_eq!(status.frames_processed, 3);
        // End of file leaves the engine logically stopped but not "stopped".
        assert!(status.is_running);
        assert!(status.last_error.is_some());
        engine.stop();
        assert!(!engine.status().is_running);
        queue.stop();
    }

    #[test]
    fn live_source_reconnects_after_one_failed_read() {
        let queue = Arc::new(TaskQueue::new(1, 64));
        let mut engine = CaptureEngine::new(
            test_config("stub://cam?fps=100&fail_at=3", Duration::from_secs(5)),
            queue.clone(),
        );
        engine.start().unwrap();

        // The injected failure drops the connection...
        assert!(wait_until(
            || !engine.status().connection_active,
            Duration::from_secs(5),
        ));
        assert!(engine.status().last_error.is_some());
        // ...and the backoff-then-reopen restores it without ending the loop.
        assert!(wait_until(
            || engine.status().connection_active,
            Duration::from_secs(5),
        ));
        assert!(engine.status().is_running);
        engine.stop();
        queue.stop();
    }

    #[test]
    fn stop_joins_the_capture_thread() {
        let queue = Arc::new(TaskQueue::new(1, 16));
        let mut engine = CaptureEngine::new(
            test_config("stub://cam?fps=50", Duration::from_secs(1)),
            queue.clone(),
        );
        engine.start().unwrap();
        engine.stop();
        assert!(engine.handle.is_none());
        assert!(!engine.status().is_running);
        assert!(!engine.status().connection_active);
        // Stopping again is a no-op.
        engine.stop();
        queue.stop();
    }
}
