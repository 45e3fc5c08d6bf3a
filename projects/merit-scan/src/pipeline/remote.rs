use crate::error::DetectionError;
use crate::pipeline::detection::HumanDetector;
use crate::pipeline::types::{DetectedFrame, DetectionResponse};
use crate::video::split_data_url;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent";

pub const DETECTION_PROMPT: &str = "You are reviewing a frame of search-and-rescue drone footage. \
Decide whether a human is visible in the image and, if so, where. \
Reply with JSON only, in the form \
{\"humanDetected\": boolean, \"description\": string, \"confidence\": number between 0 and 1, \
\"boundingBox\": {\"x\": number, \"y\": number, \"width\": number, \"height\": number}} \
where the bounding box is in percent of the frame and omitted when no human is present.";

/// Classifier backed by a multimodal generateContent endpoint.
pub struct RemoteDetector {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl RemoteDetector {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Result<Self, DetectionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| DetectionError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl HumanDetector for RemoteDetector {
    fn name(&self) -> &str {
        "remote"
    }

    async fn detect(&self, frame: &DetectedFrame) -> Result<DetectionResponse, DetectionError> {
        let (mime_type, data) = split_data_url(&frame.image_url).ok_or_else(|| {
            DetectionError::InvalidFrame(format!("{} is not a base64 data URL", frame.id))
        })?;

        let body = json!({
            "contents": [{
                "parts": [
                    { "text": DETECTION_PROMPT },
                    { "inline_data": { "mime_type": mime_type, "data": data } }
                ]
            }]
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DetectionError::Transport(format!("request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| DetectionError::Transport(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(DetectionError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_detection_payload(&text)
    }
}

/// Decodes a classifier answer out of a response body.
///
/// Tried in order: the whole body as a detection object, the model text
/// inside a generateContent envelope, and finally the first balanced
/// `{...}` substring of that text.
pub fn parse_detection_payload(body: &str) -> Result<DetectionResponse, DetectionError> {
    if let Ok(response) = serde_json::from_str::<DetectionResponse>(body) {
        return Ok(response);
    }

    let envelope = envelope_text(body);
    let text = envelope.as_deref().unwrap_or(body);
    if envelope.is_some() {
        if let Ok(response) = serde_json::from_str::<DetectionResponse>(text.trim()) {
            return Ok(response);
        }
    }

    let candidate = first_balanced_object(text).ok_or_else(|| {
        DetectionError::Parse(format!("no JSON object in response: {}", truncate(text, 120)))
    })?;
    serde_json::from_str::<DetectionResponse>(candidate)
        .map_err(|e| DetectionError::Parse(format!("{}: {}", e, truncate(candidate, 120))))
}

/// `candidates[0].content.parts[0].text` of a generateContent response
fn envelope_text(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()
        .map(str::to_string)
}

/// Returns the first `{...}` span whose braces balance, skipping braces inside strings.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
