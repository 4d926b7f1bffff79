//! Stream registry: the process-wide map of active capture engines.
//!
//! Owned explicitly and passed to whatever exposes the control surface; there
//! is no global singleton. One lock serializes start/stop/status and
//! guarantees at most one engine per stream identifier.
//!
//! Lock order: the registry lock is released before an engine join, and
//! status reads only take a per-engine stats lock while already holding the
//! registry lock (engines never take the registry lock), so the two cannot
//! deadlock.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::capture::resolve_source;
use crate::engine::{CaptureEngine, StreamConfig, StreamStatus};
use crate::queue::TaskQueue;

/// Parameters for starting one stream.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub stream_id: String,
    pub video_source: String,
    pub detection_url: String,
    pub frame_interval_secs: u64,
    pub device_id: Option<i64>,
    pub user_id: Option<i64>,
}

pub struct StreamRegistry {
    queue: Arc<TaskQueue>,
    streams: Mutex<HashMap<String, CaptureEngine>>,
    request_timeout: Duration,
    max_queue_depth: usize,
}

impl StreamRegistry {
    pub fn new(queue: Arc<TaskQueue>, request_timeout: Duration, max_queue_depth: usize) -> Self {
        Self {
            queue,
            streams: Mutex::new(HashMap::new()),
            request_timeout,
            max_queue_depth,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Start a stream. Rejects duplicate identifiers and sources that cannot
    /// be opened; the engine is registered only after `start()` succeeds.
    pub fn start_stream(&self, request: StreamRequest) -> Result<()> {
        if request.stream_id.trim().is_empty() {
            bail!("stream id must not be empty");
        }
        if request.frame_interval_secs == 0 {
            bail!("frame interval must be at least one second");
        }

        let mut streams = self.lock_streams();
        if streams.contains_key(&request.stream_id) {
            bail!("stream '{}' is already running", request.stream_id);
        }

        let config = StreamConfig {
            stream_id: request.stream_id.clone(),
            video_source: resolve_source(&request.video_source),
            detection_url: request.detection_url,
            frame_interval: Duration::from_secs(request.frame_interval_secs),
            device_id: request.device_id,
            user_id: request.user_id,
            request_timeout: self.request_timeout,
            max_queue_depth: self.max_queue_depth,
        };
        let mut engine = CaptureEngine::new(config, Arc::clone(&self.queue));
        engine.start()?;
        streams.insert(request.stream_id, engine);
        Ok(())
    }

    /// Stop and remove a stream. Returns false if no such stream is active.
    /// The engine join happens after the registry lock is released.
    pub fn stop_stream(&self, stream_id: &str) -> bool {
        let engine = self.lock_streams().remove(stream_id);
        match engine {
            Some(mut engine) => {
                engine.stop();
                log::info!("stopped stream {stream_id}");
                true
            }
            None => false,
        }
    }

    pub fn status(&self, stream_id: &str) -> Option<StreamStatus> {
        self.lock_streams().get(stream_id).map(|e| e.status())
    }

    pub fn all_statuses(&self) -> HashMap<String, StreamStatus> {
        self.lock_streams()
            .iter()
            .map(|(id, engine)| (id.clone(), engine.status()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.lock_streams().len()
    }

    /// Stop every active stream; used on daemon shutdown.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.lock_streams().keys().cloned().collect();
        for id in ids {
            self.stop_stream(&id);
        }
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<String, CaptureEngine>> {
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
