//! FFmpeg-backed generic capture.
//!
//! One backend serves RTSP streams, local files, and HTTP fallbacks: FFmpeg's
//! demuxer handles all three locator forms. Frames are scaled to RGB24
//! in-memory; packet PTS is converted to a millisecond playback position for
//! file sources so the engine can sample on video time.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;

use super::{Frame, FrameData, SourceKind};

pub(crate) struct FfmpegGrabSource {
    locator: String,
    kind: SourceKind,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    /// Seconds per PTS tick of the selected stream.
    time_base: f64,
}

impl FfmpegGrabSource {
    pub(crate) fn open(locator: &str, kind: SourceKind) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&locator.to_string())
            .with_context(|| format!("open '{locator}' with ffmpeg"))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("source has no video track"))?;
        let stream_index = input_stream.index();
        let time_base = {
            let tb = input_stream.time_base();
            f64::from(tb.numerator()) / f64::from(tb.denominator().max(1))
        };
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;
        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!("GrabSource: connected to {locator} (ffmpeg)");
        Ok(Self {
            locator: locator.to_string(),
            kind,
            input,
            stream_index,
            decoder,
            scaler,
            time_base,
        })
    }

    pub(crate) fn read_frame(&mut self) -> Result<Frame> {
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            let position_ms = match self.kind {
                SourceKind::File => packet.pts().map(|pts| pts as f64 * self.time_base * 1000.0),
                _ => None,
            };

            self.decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;

            while self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                return Ok(Frame {
                    data: FrameData::Rgb {
                        pixels,
                        width,
                        height,
                    },
                    position_ms,
                });
            }
        }

        anyhow::bail!("stream {} ended", self.locator)
    }

    pub(crate) fn reopen(&mut self) -> Result<()> {
        *self = Self::open(&self.locator, self.kind)?;
        Ok(())
    }

    pub(crate) fn is_finite(&self) -> bool {
        self.kind == SourceKind::File
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
