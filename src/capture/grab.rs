//! Generic frame-grabbing capture.
//!
//! Covers everything the raw MJPEG scan does not: RTSP streams, local video
//! files, and HTTP sources whose MJPEG probe failed. Real decode lives behind
//! the `capture-ffmpeg` feature; `stub://` locators select a synthetic backend
//! used by tests, demos, and deployments without a camera attached.
//!
//! Synthetic locators configure behavior through the query string:
//! `stub://cam?fps=25&frames=100&fail_at=5&kind=file&width=64&height=48`.
//! `frames` ends the stream after that many reads, `fail_at` injects a single
//! read failure at that frame index, and `kind=file` makes the source finite
//! with a reported playback position.

use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::time::Duration;
use url::Url;

use super::{Frame, FrameData, FrameSource, SourceKind};

#[cfg(feature = "capture-ffmpeg")]
use super::grab_ffmpeg::FfmpegGrabSource;

const DEFAULT_STUB_FPS: u32 = 25;
const DEFAULT_STUB_WIDTH: u32 = 64;
const DEFAULT_STUB_HEIGHT: u32 = 48;

/// Generic capture source.
pub struct GrabSource {
    backend: GrabBackend,
}

enum GrabBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "capture-ffmpeg")]
    Ffmpeg(FfmpegGrabSource),
}

impl GrabSource {
    pub fn open(locator: &str, kind: SourceKind) -> Result<Self> {
        match kind {
            SourceKind::Stub => Ok(Self {
                backend: GrabBackend::Synthetic(SyntheticSource::open(locator)?),
            }),
            SourceKind::File => {
                if !Path::new(locator).exists() {
                    bail!("video source not found: {locator}");
                }
                Self::open_decoder(locator, kind)
            }
            SourceKind::Http | SourceKind::Rtsp => Self::open_decoder(locator, kind),
        }
    }

    #[cfg(feature = "capture-ffmpeg")]
    fn open_decoder(locator: &str, kind: SourceKind) -> Result<Self> {
        Ok(Self {
            backend: GrabBackend::Ffmpeg(FfmpegGrabSource::open(locator, kind)?),
        })
    }

    #[cfg(not(feature = "capture-ffmpeg"))]
    fn open_decoder(locator: &str, _kind: SourceKind) -> Result<Self> {
        bail!("decoding {locator} requires the capture-ffmpeg feature")
    }
}

impl FrameSource for GrabSource {
    fn read_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            GrabBackend::Synthetic(source) => source.read_frame(),
            #[cfg(feature = "capture-ffmpeg")]
            GrabBackend::Ffmpeg(source) => source.read_frame(),
        }
    }

    fn reopen(&mut self) -> Result<()> {
        match &mut self.backend {
            GrabBackend::Synthetic(source) => source.reopen(),
            #[cfg(feature = "capture-ffmpeg")]
            GrabBackend::Ffmpeg(source) => source.reopen(),
        }
    }

    fn is_finite(&self) -> bool {
        match &self.backend {
            GrabBackend::Synthetic(source) => source.finite,
            #[cfg(feature = "capture-ffmpeg")]
            GrabBackend::Ffmpeg(source) => source.is_finite(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticSource {
    fps: u32,
    width: u32,
    height: u32,
    /// End of stream after this many frames, when set.
    frame_limit: Option<u64>,
    /// Inject exactly one read failure at this frame index (1-based).
    fail_at: Option<u64>,
    finite: bool,
    frame_count: u64,
    failed_once: bool,
}

impl SyntheticSource {
    fn open(locator: &str) -> Result<Self> {
        let url = Url::parse(locator).with_context(|| format!("parse stub locator {locator}"))?;
        let mut source = Self {
            fps: DEFAULT_STUB_FPS,
            width: DEFAULT_STUB_WIDTH,
            height: DEFAULT_STUB_HEIGHT,
            frame_limit: None,
            fail_at: None,
            finite: false,
            frame_count: 0,
            failed_once: false,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "fps" => source.fps = parse_param(&key, &value)?,
                "width" => source.width = parse_param(&key, &value)?,
                "height" => source.height = parse_param(&key, &value)?,
                "frames" => source.frame_limit = Some(parse_param(&key, &value)?),
                "fail_at" => source.fail_at = Some(parse_param(&key, &value)?),
                "kind" => source.finite = value == "file",
                other => bail!("unknown stub parameter '{other}' in {locator}"),
            }
        }
        if source.fps == 0 {
            bail!("stub fps must be at least 1");
        }
        log::info!("GrabSource: connected to {locator} (synthetic)");
        Ok(source)
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let next = self.frame_count + 1;
        if self.fail_at == Some(next) && !self.failed_once {
            self.failed_once = true;
            bail!("synthetic read failure at frame {next}");
        }
        if let Some(limit) = self.frame_limit {
            if self.frame_count >= limit {
                bail!("synthetic stream ended after {limit} frames");
            }
        }

        // Pace frame production like a real decoder would.
        std::thread::sleep(Duration::from_millis(u64::from(1000 / self.fps)));
        self.frame_count = next;

        let position_ms = self
            .finite
            .then(|| self.frame_count as f64 * 1000.0 / f64::from(self.fps));
        Ok(Frame {
            data: FrameData::Rgb {
                pixels: self.generate_pixels(),
                width: self.width,
                height: self.height,
            },
            position_ms,
        })
    }

    fn reopen(&mut self) -> Result<()> {
        Ok(())
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        pixels
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid stub parameter {key}={value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_source_produces_rgb_frames() {
        let mut source = GrabSource::open("stub://cam?fps=100", SourceKind::Stub).unwrap();
        let frame = source.read_frame().unwrap();
        match frame.data {
            FrameData::Rgb { width, height, .. } => {
                assert_eq!(width, DEFAULT_STUB_WIDTH);
                assert_eq!(height, DEFAULT_STUB_HEIGHT);
            }
            _ => panic!("expected rgb frame"),
        }
        assert!(frame.position_ms.is_none());
        assert!(!source.is_finite());
    }

    #[test]
    fn file_kind_stub_reports_playback_position() {
        let mut source =
            GrabSource::open("stub://clip?fps=100&kind=file&frames=3", SourceKind::Stub).unwrap();
        assert!(source.is_finite());
        let first = source.read_frame().unwrap().position_ms.unwrap();
        let second = source.read_frame().unwrap().position_ms.unwrap();
        assert!((first - 10.0).abs() < 0.001);
        assert!((second - 20.0).abs() < 0.001);
    }

    #[test]
    fn frame_limit_ends_the_stream() {
        let mut source =
            GrabSource::open("stub://clip?fps=100&frames=2&kind=file", SourceKind::Stub).unwrap();
        source.read_frame().unwrap();
        source.read_frame().unwrap();
        assert!(source.read_frame().is_err());
    }

    #[test]
    fn fail_at_injects_exactly_one_failure() {
        let mut source =
            GrabSource::open("stub://cam?fps=100&fail_at=2", SourceKind::Stub).unwrap();
        source.read_frame().unwrap();
        assert!(source.read_frame().is_err());
        source.reopen().unwrap();
        source.read_frame().unwrap();
        source.read_frame().unwrap();
    }

    #[test]
    fn unknown_stub_parameter_is_rejected() {
        assert!(GrabSource::open("stub://cam?bogus=1", SourceKind::Stub).is_err());
    }

    #[test]
    fn missing_file_fails_to_open() {
        assert!(GrabSource::open("/no/such/clip.mp4", SourceKind::File).is_err());
    }
}
