//! Outbound leg of a dispatch task: the detection sink client.
//!
//! The sink is an opaque remote HTTP endpoint that accepts a JPEG image as a
//! multipart upload and answers with a JSON detection result. One
//! [`DispatchFrame`] job is submitted to the task queue per sampled frame; it
//! performs the POST and folds the outcome back into the owning stream's
//! statistics.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::EngineShared;
use crate::queue::DispatchWork;

/// Form field the sink expects the JPEG under.
const PHOTO_FIELD: &str = "photo";

/// Blocking HTTP client for the detection endpoint.
pub struct DetectionClient {
    endpoint: String,
    agent: ureq::Agent,
}

impl DetectionClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            endpoint: endpoint.to_string(),
            agent,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST one JPEG to the sink. Non-2xx responses and transport errors are
    /// errors; a 2xx body that is not JSON is wrapped as `{"raw": <text>}`.
    pub fn submit_frame(
        &self,
        jpeg: &[u8],
        filename: &str,
        device_id: Option<i64>,
        user_id: Option<i64>,
    ) -> Result<serde_json::Value> {
        let boundary = format!("----pothole-ingest-{:032x}", rand::random::<u128>());
        let body = multipart_body(&boundary, jpeg, filename, device_id, user_id);

        let response = match self
            .agent
            .post(&self.endpoint)
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={boundary}"),
            )
            .send_bytes(&body)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                bail!("detection sink returned HTTP {code}")
            }
            Err(error) => {
                return Err(anyhow!(error))
                    .with_context(|| format!("post frame to {}", self.endpoint))
            }
        };

        let text = response
            .into_string()
            .context("read detection sink response")?;
        Ok(parse_sink_response(&text))
    }
}

fn parse_sink_response(text: &str) -> serde_json::Value {
    match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => serde_json::json!({ "raw": text }),
    }
}

fn multipart_body(
    boundary: &str,
    jpeg: &[u8],
    filename: &str,
    device_id: Option<i64>,
    user_id: Option<i64>,
) -> Vec<u8> {
    let mut body = Vec::with_capacity(jpeg.len() + 512);
    let fields = [("deviceId", device_id), ("userId", user_id)];
    for (name, value) in fields {
        if let Some(value) = value {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
    }
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{PHOTO_FIELD}\"; \
             filename=\"{filename}\"\r\nContent-Type: image/jpeg\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(jpeg);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

/// One sampled frame on its way to the sink. Runs on a queue worker.
pub struct DispatchFrame {
    client: Arc<DetectionClient>,
    shared: Arc<EngineShared>,
    stream_id: String,
    frame_number: u64,
    device_id: Option<i64>,
    user_id: Option<i64>,
    jpeg: Vec<u8>,
}

impl DispatchFrame {
    pub(crate) fn new(
        client: Arc<DetectionClient>,
        shared: Arc<EngineShared>,
        stream_id: String,
        frame_number: u64,
        device_id: Option<i64>,
        user_id: Option<i64>,
        jpeg: Vec<u8>,
    ) -> Self {
        Self {
            client,
            shared,
            stream_id,
            frame_number,
            device_id,
            user_id,
            jpeg,
        }
    }
}

impl DispatchWork for DispatchFrame {
    fn run(&self) -> Result<serde_json::Value> {
        let filename = format!("{}_{}.jpg", self.stream_id, self.frame_number);
        match self
            .client
            .submit_frame(&self.jpeg, &filename, self.device_id, self.user_id)
        {
            Ok(payload) => {
                self.shared.record_sent();
                Ok(payload)
            }
            Err(error) => {
                self.shared.record_dispatch_failure(&format!("{error:#}"));
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_body_carries_photo_and_form_fields() {
        let jpeg = [0xFF, 0xD8, 0xFF, 0xD9];
        let body = multipart_body("BOUNDARY", &jpeg, "cam_7.jpg", Some(12), Some(3));
        let text = String::from_utf8_lossy(&body);

        assert!(text.contains("name=\"deviceId\"\r\n\r\n12"));
        assert!(text.contains("name=\"userId\"\r\n\r\n3"));
        assert!(text.contains("name=\"photo\"; filename=\"cam_7.jpg\""));
        assert!(text.contains("Content-Type: image/jpeg"));
        assert!(text.ends_with("\r\n--BOUNDARY--\r\n"));
        // The JPEG bytes are present verbatim.
        assert!(body.windows(4).any(|w| w == jpeg));
    }

    #[test]
    fn multipart_body_omits_absent_identifiers() {
        let body = multipart_body("BOUNDARY", &[1, 2, 3], "f.jpg", None, None);
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains("deviceId"));
        assert!(!text.contains("userId"));
    }

    #[test]
    fn json_responses_are_parsed() {
        let value = parse_sink_response(r#"{"detections": [], "count": 0}"#);
        assert_eq!(value["count"], 0);
    }

    #[test]
    fn non_json_responses_are_wrapped_raw() {
        let value = parse_sink_response("OK");
        assert_eq!(value, serde_json::json!({ "raw": "OK" }));
    }
}
