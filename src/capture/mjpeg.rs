//! Raw MJPEG multipart capture over HTTP.
//!
//! Many IoT cameras (ESP32-CAM firmware in particular) serve
//! `multipart/x-mixed-replace` streams with sloppy or missing part headers.
//! Instead of parsing the multipart framing, this source scans the byte
//! stream for the JPEG start/end markers and extracts whatever sits between
//! them. A hard cap on the rolling buffer keeps a marker-less stream from
//! growing memory without bound.

use anyhow::{anyhow, bail, Context, Result};
use std::io::Read;
use std::time::Duration;

use super::{Frame, FrameData, FrameSource};

/// Rolling buffer cap; on overflow the buffer is discarded and scanning
/// restarts from empty.
pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;
const CHUNK_SIZE: usize = 4096;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const JPEG_START: [u8; 2] = [0xFF, 0xD8];
const JPEG_END: [u8; 2] = [0xFF, 0xD9];

/// HTTP MJPEG frame source.
pub struct MjpegSource {
    url: String,
    read_timeout: Duration,
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegSource {
    /// Connect and hold the streaming response body. A non-200 status or a
    /// transport error fails the open, which sends the caller down the
    /// generic-capture fallback.
    pub fn open(url: &str, read_timeout: Duration) -> Result<Self> {
        let reader = connect(url, read_timeout)?;
        Ok(Self::from_reader(url.to_string(), read_timeout, reader))
    }

    fn from_reader(url: String, read_timeout: Duration, reader: Box<dyn Read + Send>) -> Self {
        Self {
            url,
            read_timeout,
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            if let Some(jpeg) = extract_jpeg(&mut self.buffer) {
                return Ok(jpeg);
            }

            let read = self
                .reader
                .read(&mut chunk)
                .with_context(|| format!("read mjpeg chunk from {}", self.url))?;
            if read == 0 {
                bail!("mjpeg stream from {} ended", self.url);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_BUFFER_BYTES {
                log::warn!("mjpeg buffer overflow on {}, discarding buffer", self.url);
                self.buffer.clear();
            }
        }
    }
}

impl FrameSource for MjpegSource {
    fn read_frame(&mut self) -> Result<Frame> {
        let jpeg = self.read_next_jpeg()?;
        Ok(Frame {
            data: FrameData::Jpeg(jpeg),
            position_ms: None,
        })
    }

    fn reopen(&mut self) -> Result<()> {
        self.buffer.clear();
        self.reader = connect(&self.url, self.read_timeout)?;
        Ok(())
    }

    fn is_finite(&self) -> bool {
        false
    }
}

fn connect(url: &str, read_timeout: Duration) -> Result<Box<dyn Read + Send>> {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(CONNECT_TIMEOUT)
        .timeout_read(read_timeout)
        .build();
    let response = match agent.get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(code, _)) => bail!("HTTP {code} from {url}"),
        Err(error) => {
            return Err(anyhow!(error)).with_context(|| format!("connect to mjpeg stream {url}"))
        }
    };

    // Some camera firmware omits the multipart content type; if the status
    // was 200 we attempt the marker scan regardless.
    let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
    if !content_type.contains("multipart") && !content_type.contains("image/jpeg") {
        log::debug!("unusual content-type '{content_type}' from {url}, scanning anyway");
    }
    Ok(response.into_reader())
}

/// Scan the rolling buffer for one complete JPEG. On a hit, the frame bytes
/// (markers inclusive) are returned and the buffer keeps the unconsumed tail.
fn extract_jpeg(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = find_marker(buffer, JPEG_START, 0)?;
    let end = find_marker(buffer, JPEG_END, start + 2)?;
    let jpeg = buffer[start..end + 2].to_vec();
    buffer.drain(..end + 2);
    Some(jpeg)
}

fn find_marker(buffer: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if buffer.len() < from + 2 {
        return None;
    }
    (from..buffer.len() - 1).find(|&i| buffer[i] == marker[0] && buffer[i + 1] == marker[1])
}
