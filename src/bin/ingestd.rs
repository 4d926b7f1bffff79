//! ingestd - pothole ingestion daemon
//!
//! Loads the pipeline configuration, starts the shared dispatch queue and the
//! stream registry, boots the configured streams, and logs pipeline
//! statistics until interrupted.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pothole_ingest::{PipelineConfig, StreamRegistry, StreamRequest, TaskQueue};

#[derive(Parser, Debug)]
#[command(name = "ingestd", about = "Pothole detection ingestion daemon")]
struct Args {
    /// Path to the pipeline config file (JSON).
    #[arg(long, env = "POTHOLE_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds between statistics log lines.
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => PipelineConfig::load_from(path)?,
        None => PipelineConfig::load()?,
    };

    let queue = Arc::new(TaskQueue::new(cfg.workers, cfg.task_retention));
    queue.start();
    let registry = StreamRegistry::new(Arc::clone(&queue), cfg.request_timeout, cfg.max_queue_depth);

    for stream in &cfg.streams {
        let detection_url = cfg
            .detection_url_for(stream)
            .ok_or_else(|| anyhow!("stream '{}' has no detection url", stream.stream_id))?;
        let request = StreamRequest {
            stream_id: stream.stream_id.clone(),
            video_source: stream.video_source.clone(),
            detection_url,
            frame_interval_secs: stream.frame_interval_secs,
            device_id: stream.device_id,
            user_id: stream.user_id,
        };
        match registry.start_stream(request) {
            Ok(()) => log::info!(
                "started stream {} from {}",
                stream.stream_id,
                stream.video_source
            ),
            Err(error) => log::error!("failed to start stream {}: {error:#}", stream.stream_id),
        }
    }

    if registry.active_count() == 0 {
        log::warn!("no active streams; waiting for shutdown signal");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .map_err(|e| anyhow!("install signal handler: {e}"))?;
    }

    let stats_interval = Duration::from_secs(args.stats_interval.max(1));
    let mut last_stats = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        if last_stats.elapsed() >= stats_interval {
            last_stats = Instant::now();
            let queue_stats = queue.stats();
            log::info!(
                "queue: {} queued, {} running, {} completed, {} failed, {} workers",
                queue_stats.queue_size,
                queue_stats.running_tasks,
                queue_stats.completed_tasks,
                queue_stats.failed_tasks,
                queue_stats.active_workers
            );
            for (id, status) in registry.all_statuses() {
                log::info!(
                    "stream {id}: processed={} sent={} failed={} dropped={} connected={}",
                    status.frames_processed,
                    status.frames_sent,
                    status.frames_failed,
                    status.frames_dropped,
                    status.connection_active
                );
            }
        }
    }

    log::info!("shutting down");
    registry.shutdown();
    queue.stop();
    Ok(())
}
