use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use pothole_ingest::PipelineConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "POTHOLE_CONFIG",
        "POTHOLE_DETECTION_URL",
        "POTHOLE_WORKERS",
        "POTHOLE_MAX_QUEUE",
        "POTHOLE_REQUEST_TIMEOUT_SECS",
        "POTHOLE_TASK_RETENTION",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "detection_url": "http://detector.internal/api/v1/prediction/",
        "workers": 4,
        "max_queue_depth": 25,
        "request_timeout_secs": 45,
        "streams": [
            {
                "stream_id": "cam-front",
                "video_source": "http://camera-1/mjpeg",
                "frame_interval_secs": 10,
                "device_id": 7
            },
            {
                "stream_id": "cam-rear",
                "video_source": "rtsp://camera-2/stream",
                "detection_url": "http://other-detector/api/",
                "user_id": 3
            }
        ]
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("POTHOLE_CONFIG", file.path());
    std::env::set_var("POTHOLE_WORKERS", "8");
    std::env::set_var("POTHOLE_TASK_RETENTION", "256");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(
        cfg.detection_url.as_deref(),
        Some("http://detector.internal/api/v1/prediction/")
    );
    assert_eq!(cfg.workers, 8);
    assert_eq!(cfg.max_queue_depth, 25);
    assert_eq!(cfg.request_timeout, Duration::from_secs(45));
    assert_eq!(cfg.task_retention, 256);

    assert_eq!(cfg.streams.len(), 2);
    let front = &cfg.streams[0];
    assert_eq!(front.stream_id, "cam-front");
    assert_eq!(front.video_source, "http://camera-1/mjpeg");
    assert_eq!(front.frame_interval_secs, 10);
    assert_eq!(front.device_id, Some(7));
    assert_eq!(front.user_id, None);
    assert_eq!(
        cfg.detection_url_for(front).as_deref(),
        Some("http://detector.internal/api/v1/prediction/")
    );

    let rear = &cfg.streams[1];
    // No frame_interval_secs in the file; the default applies.
    assert_eq!(rear.frame_interval_secs, 30);
    assert_eq!(
        cfg.detection_url_for(rear).as_deref(),
        Some("http://other-detector/api/")
    );

    clear_env();
}

#[test]
fn defaults_apply_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PipelineConfig::load().expect("load config");
    assert_eq!(cfg.workers, 2);
    assert_eq!(cfg.max_queue_depth, 50);
    assert_eq!(cfg.request_timeout, Duration::from_secs(60));
    assert!(cfg.streams.is_empty());
    assert!(cfg.detection_url.is_none());

    clear_env();
}

#[test]
fn rejects_zero_workers_from_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("POTHOLE_WORKERS", "0");
    let err = PipelineConfig::load().unwrap_err();
    assert!(err.to_string().contains("workers"));

    clear_env();
}

#[test]
fn rejects_stream_without_any_detection_url() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "streams": [
            { "stream_id": "cam-1", "video_source": "rtsp://camera-1/stream" }
        ]
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("POTHOLE_CONFIG", file.path());

    let err = PipelineConfig::load().unwrap_err();
    assert!(err.to_string().contains("no detection_url"));

    clear_env();
}

#[test]
fn rejects_malformed_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    std::env::set_var("POTHOLE_CONFIG", file.path());

    let err = PipelineConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
