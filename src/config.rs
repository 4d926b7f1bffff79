//! Pipeline configuration.
//!
//! Loaded from a JSON file named by `POTHOLE_CONFIG` (or a path given on the
//! command line), with environment-variable overrides applied on top and a
//! validation pass at the end.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::engine::{DEFAULT_MAX_QUEUE_DEPTH, DEFAULT_REQUEST_TIMEOUT};
use crate::queue::{DEFAULT_TASK_RETENTION, DEFAULT_WORKERS};

const DEFAULT_FRAME_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    detection_url: Option<String>,
    workers: Option<usize>,
    max_queue_depth: Option<usize>,
    request_timeout_secs: Option<u64>,
    task_retention: Option<usize>,
    streams: Option<Vec<StreamEntryFile>>,
}

#[derive(Debug, Deserialize)]
struct StreamEntryFile {
    stream_id: String,
    video_source: String,
    detection_url: Option<String>,
    frame_interval_secs: Option<u64>,
    device_id: Option<i64>,
    user_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Default detection endpoint for streams that do not name their own.
    pub detection_url: Option<String>,
    pub workers: usize,
    pub max_queue_depth: usize,
    pub request_timeout: Duration,
    pub task_retention: usize,
    /// Streams the daemon starts at boot.
    pub streams: Vec<StreamEntry>,
}

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub stream_id: String,
    pub video_source: String,
    pub detection_url: Option<String>,
    pub frame_interval_secs: u64,
    pub device_id: Option<i64>,
    pub user_id: Option<i64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection_url: None,
            workers: DEFAULT_WORKERS,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            task_retention: DEFAULT_TASK_RETENTION,
            streams: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("POTHOLE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let streams = file
            .streams
            .unwrap_or_default()
            .into_iter()
            .map(|entry| StreamEntry {
                stream_id: entry.stream_id,
                video_source: entry.video_source,
                detection_url: entry.detection_url,
                frame_interval_secs: entry
                    .frame_interval_secs
                    .unwrap_or(DEFAULT_FRAME_INTERVAL_SECS),
                device_id: entry.device_id,
                user_id: entry.user_id,
            })
            .collect();
        Self {
            detection_url: file.detection_url,
            workers: file.workers.unwrap_or(DEFAULT_WORKERS),
            max_queue_depth: file.max_queue_depth.unwrap_or(DEFAULT_MAX_QUEUE_DEPTH),
            request_timeout: file
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            task_retention: file.task_retention.unwrap_or(DEFAULT_TASK_RETENTION),
            streams,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("POTHOLE_DETECTION_URL") {
            if !url.trim().is_empty() {
                self.detection_url = Some(url);
            }
        }
        if let Ok(workers) = std::env::var("POTHOLE_WORKERS") {
            self.workers = workers
                .parse()
                .map_err(|_| anyhow!("POTHOLE_WORKERS must be an integer"))?;
        }
        if let Ok(depth) = std::env::var("POTHOLE_MAX_QUEUE") {
            self.max_queue_depth = depth
                .parse()
                .map_err(|_| anyhow!("POTHOLE_MAX_QUEUE must be an integer"))?;
        }
        if let Ok(timeout) = std::env::var("POTHOLE_REQUEST_TIMEOUT_SECS") {
            let seconds: u64 = timeout.parse().map_err(|_| {
                anyhow!("POTHOLE_REQUEST_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.request_timeout = Duration::from_secs(seconds);
        }
        if let Ok(retention) = std::env::var("POTHOLE_TASK_RETENTION") {
            self.task_retention = retention
                .parse()
                .map_err(|_| anyhow!("POTHOLE_TASK_RETENTION must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("workers must be at least 1"));
        }
        if self.max_queue_depth == 0 {
            return Err(anyhow!("max_queue_depth must be at least 1"));
        }
        if self.request_timeout.as_secs() == 0 {
            return Err(anyhow!("request_timeout_secs must be greater than zero"));
        }
        if self.task_retention == 0 {
            return Err(anyhow!("task_retention must be at least 1"));
        }
        for stream in &self.streams {
            if stream.stream_id.trim().is_empty() {
                return Err(anyhow!("stream entries must have a stream_id"));
            }
            if stream.frame_interval_secs == 0 {
                return Err(anyhow!(
                    "stream '{}': frame_interval_secs must be at least 1",
                    stream.stream_id
                ));
            }
            if stream.detection_url.is_none() && self.detection_url.is_none() {
                return Err(anyhow!(
                    "stream '{}' has no detection_url and no default is set",
                    stream.stream_id
                ));
            }
        }
        Ok(())
    }

    /// Detection endpoint for one configured stream.
    pub fn detection_url_for(&self, stream: &StreamEntry) -> Option<String> {
        stream
            .detection_url
            .clone()
            .or_else(|| self.detection_url.clone())
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
