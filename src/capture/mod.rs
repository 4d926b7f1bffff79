//! Frame capture sources.
//!
//! Two capture strategies sit behind the [`FrameSource`] trait:
//! - [`MjpegSource`]: raw multipart MJPEG scanning over HTTP, for IoT cameras
//!   that stream `multipart/x-mixed-replace` (or claim to).
//! - [`GrabSource`]: generic frame grabbing for RTSP and local files, with a
//!   `stub://` synthetic backend for tests and demos.
//!
//! The strategy is chosen once per stream by [`open_source`], which doubles as
//! the engine's probe-open: if the source cannot be opened here, the stream
//! never starts.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use url::Url;

pub mod grab;
#[cfg(feature = "capture-ffmpeg")]
pub(crate) mod grab_ffmpeg;
pub mod mjpeg;

pub use grab::GrabSource;
pub use mjpeg::MjpegSource;

/// Pixel payload of one captured frame.
#[derive(Clone, Debug)]
pub enum FrameData {
    /// Already-encoded JPEG bytes (raw MJPEG path).
    Jpeg(Vec<u8>),
    /// Decoded RGB24 pixels that still need encoding.
    Rgb {
        pixels: Vec<u8>,
        width: u32,
        height: u32,
    },
}

/// One captured frame plus the decoder's stream position, when it has one.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: FrameData,
    /// Position in the source in milliseconds. Only file-like sources report
    /// this; it drives video-time sampling.
    pub position_ms: Option<f64>,
}

impl Frame {
    /// Encode the frame as JPEG. MJPEG frames pass through unchanged.
    pub fn into_jpeg(self) -> Result<Vec<u8>> {
        match self.data {
            FrameData::Jpeg(bytes) => Ok(bytes),
            FrameData::Rgb {
                pixels,
                width,
                height,
            } => {
                let mut out = Vec::new();
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 85)
                    .encode(&pixels, width, height, image::ExtendedColorType::Rgb8)
                    .context("encode frame as jpeg")?;
                Ok(out)
            }
        }
    }
}

/// A connected stream of frames. Implementations block in `read_frame` but
/// must use short internal timeouts so a stop request is observed promptly.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Frame>;

    /// Release and reopen the underlying connection after a failed read.
    fn reopen(&mut self) -> Result<()>;

    /// Finite sources (local files) treat a failed read as end of stream;
    /// the capture loop must not reconnect them.
    fn is_finite(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Http,
    Rtsp,
    File,
    Stub,
}

/// Classify a source locator. Anything that does not parse as a known URL
/// scheme is treated as a local file path.
pub fn probe_kind(locator: &str) -> SourceKind {
    if let Ok(url) = Url::parse(locator) {
        match url.scheme() {
            "http" | "https" => return SourceKind::Http,
            "rtsp" | "rtmp" => return SourceKind::Rtsp,
            "stub" => return SourceKind::Stub,
            _ => {}
        }
    }
    SourceKind::File
}

/// Resolve relative local paths against the working directory. URLs and
/// absolute paths pass through; an unresolvable locator is returned as-is and
/// left for the probe-open to reject.
pub fn resolve_source(locator: &str) -> String {
    let locator = locator.trim();
    if probe_kind(locator) != SourceKind::File {
        return locator.to_string();
    }
    let path = Path::new(locator);
    if path.is_absolute() {
        return locator.to_string();
    }
    if let Ok(cwd) = std::env::current_dir() {
        let candidate = cwd.join(path);
        if candidate.exists() {
            return candidate.to_string_lossy().into_owned();
        }
    }
    locator.to_string()
}

/// Probe-open a source and pick the capture strategy for its lifetime.
///
/// HTTP(S) sources try the raw MJPEG scan first and fall back to generic
/// capture; everything else goes straight to generic capture. Errors here are
/// the fail-fast path: no capture thread exists yet.
pub fn open_source(locator: &str, read_timeout: Duration) -> Result<Box<dyn FrameSource>> {
    match probe_kind(locator) {
        SourceKind::Http => match MjpegSource::open(locator, read_timeout) {
            Ok(source) => Ok(Box::new(source)),
            Err(error) => {
                log::warn!(
                    "mjpeg capture unavailable for {locator}, trying generic capture: {error:#}"
                );
                let source = GrabSource::open(locator, SourceKind::Http)
                    .with_context(|| format!("failed to open video source: {locator}"))?;
                Ok(Box::new(source))
            }
        },
        kind => {
            let source = GrabSource::open(locator, kind)
                .with_context(|| format!("failed to open video source: {locator}"))?;
            Ok(Box::new(source))
        }
    }
}
