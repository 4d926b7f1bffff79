//! Live video ingestion and frame dispatch pipeline.
//!
//! This crate connects to remote camera feeds (HTTP MJPEG, RTSP, or local
//! files), samples frames on a time policy, and forwards sampled frames to a
//! remote pothole-detection endpoint through a bounded, backpressure-aware
//! task queue.
//!
//! # Architecture
//!
//! - `queue`: shared worker pool running dispatch tasks, with a lifecycle
//!   result store behind it
//! - `capture`: frame sources — raw MJPEG multipart scanning plus a generic
//!   grab path for RTSP/files, selected once per stream at open time
//! - `engine`: per-stream capture loop, sampling policy, reconnect, and
//!   backpressure accounting
//! - `sink`: multipart HTTP client for the detection endpoint
//! - `registry`: the one-engine-per-stream map behind the control surface
//! - `config`: file + environment configuration for the daemon
//!
//! Sampled frames may be dropped under load by design; every drop or failure
//! increments an observable counter.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod capture;
pub mod config;
pub mod engine;
pub mod queue;
pub mod registry;
pub mod sink;

pub use capture::{
    open_source, probe_kind, resolve_source, Frame, FrameData, FrameSource, GrabSource,
    MjpegSource, SourceKind,
};
pub use config::{PipelineConfig, StreamEntry};
pub use engine::{
    CaptureEngine, StreamConfig, StreamStats, StreamStatus, DEFAULT_MAX_QUEUE_DEPTH,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use queue::{
    DispatchWork, QueueStats, TaskQueue, TaskSnapshot, TaskStatus, DEFAULT_TASK_RETENTION,
    DEFAULT_WORKERS,
};
pub use registry::{StreamRegistry, StreamRequest};
pub use sink::DetectionClient;

/// Wall-clock time as fractional seconds since the Unix epoch, the form the
/// status snapshots use.
pub(crate) fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
