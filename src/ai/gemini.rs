use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use super::adapter::{AiError, DetectionCandidate, DetectionClient, DetectionRequest, RestorationClient};
use super::payload::ImagePayload;
use crate::scan::types::{NormalizedBox, Rotation};

const API_KEY_HEADER: &str = "x-goog-api-key";

const DETECTION_INSTRUCTION: &str = "Find every distinct physical photograph lying on this scanned page. \
Return one entry per photograph with its bounding box in 0-1000 normalized coordinates \
and the clockwise rotation in degrees (0, 90, 180 or 270) that would make it upright.";

const RESTORATION_DIRECTIVE: &str = "Restore this scanned photograph: extend the image naturally into any \
missing or torn borders, remove dust, scratches and scanner artifacts, and correct faded colors. \
Return only the restored image.";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_base: String,
    pub api_key: String,
    pub detection_model: String,
    pub restoration_model: String,
    pub timeout: Duration,
}

/// Talks to a `generateContent` endpoint for both detection and restoration.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    config: GeminiConfig,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    ymin: f64,
    xmin: f64,
    ymax: f64,
    xmax: f64,
    #[serde(default)]
    rotation: Option<f64>,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, AiError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| AiError::Request(format!("failed to build http client: {}", err)))?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, model: &str) -> Result<Url, AiError> {
        let base = self.config.api_base.trim();
        if base.is_empty() {
            return Err(AiError::Request("api base url is empty".into()));
        }
        let mut url =
            Url::parse(base).map_err(|err| AiError::Request(format!("invalid api base: {}", err)))?;
        ensure_trailing_slash(&mut url);
        let model = model.trim().trim_start_matches("models/");
        url.join(&format!("models/{}:generateContent", model))
            .map_err(|err| AiError::Request(format!("invalid model endpoint: {}", err)))
    }

    async fn generate(&self, model: &str, body: Value) -> Result<Value, AiError> {
        let url = self.endpoint(model)?;
        let response = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AiError::UnexpectedStatus(response.status().as_u16()));
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Err(AiError::EmptyResponse);
        }
        serde_json::from_str(&text).map_err(|err| AiError::Schema(err.to_string()))
    }
}

fn ensure_trailing_slash(url: &mut Url) {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
}

fn inline_image(image: &ImagePayload) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type,
            "data": image.to_base64(),
        }
    })
}

fn detection_schema() -> Value {
    json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": {
                "label": { "type": "STRING" },
                "confidence": { "type": "NUMBER" },
                "ymin": { "type": "NUMBER" },
                "xmin": { "type": "NUMBER" },
                "ymax": { "type": "NUMBER" },
                "xmax": { "type": "NUMBER" },
                "rotation": { "type": "INTEGER" }
            },
            "required": ["label", "confidence", "ymin", "xmin", "ymax", "xmax", "rotation"]
        }
    })
}

fn detection_prompt(directive: &str, target_count: Option<u32>) -> String {
    let mut prompt = format!("{}\n\n{}", DETECTION_INSTRUCTION, directive.trim());
    if let Some(count) = target_count {
        prompt.push_str(&format!(
            "\n\nThe operator counted {} photographs on this scan.",
            count
        ));
    }
    prompt
}

fn candidate_parts(response: &Value) -> Vec<Value> {
    response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn response_text(response: &Value) -> String {
    let mut text = String::new();
    for part in candidate_parts(response) {
        if let Some(fragment) = part.get("text").and_then(Value::as_str) {
            text.push_str(fragment);
        }
    }
    text
}

/// Models sometimes wrap JSON in a markdown fence even in JSON mode.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

pub(crate) fn parse_detections(text: &str) -> Result<Vec<DetectionCandidate>, AiError> {
    let body = strip_code_fence(text);
    if body.is_empty() {
        return Err(AiError::EmptyResponse);
    }
    let wire: Vec<WireDetection> =
        serde_json::from_str(body).map_err(|err| AiError::Schema(err.to_string()))?;
    Ok(wire
        .into_iter()
        .filter_map(|item| {
            let bbox = NormalizedBox::from_model(item.xmin, item.ymin, item.xmax, item.ymax)?;
            Some(DetectionCandidate {
                label: item
                    .label
                    .filter(|label| !label.trim().is_empty())
                    .unwrap_or_else(|| "photo".into()),
                confidence: item.confidence.unwrap_or(0.0).clamp(0.0, 1.0) as f32,
                bbox,
                rotation: Rotation::nearest(item.rotation.unwrap_or(0.0)),
            })
        })
        .collect())
}

fn extract_image(response: &Value, fallback_mime: &str) -> Result<ImagePayload, AiError> {
    for part in candidate_parts(response) {
        let Some(inline) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
        if data.is_empty() {
            continue;
        }
        let mime = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or(fallback_mime);
        return ImagePayload::from_base64(mime, data)
            .map_err(|err| AiError::Schema(format!("image base64 decode failed: {}", err)));
    }
    Err(AiError::MissingImage)
}

#[async_trait]
impl DetectionClient for GeminiClient {
    async fn detect(
        &self,
        request: DetectionRequest<'_>,
    ) -> Result<Vec<DetectionCandidate>, AiError> {
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    inline_image(request.image),
                    { "text": detection_prompt(request.directive, request.target_count) }
                ]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": detection_schema(),
            }
        });
        let response = self.generate(&self.config.detection_model, body).await?;
        parse_detections(&response_text(&response))
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

#[async_trait]
impl RestorationClient for GeminiClient {
    async fn restore(&self, crop: &ImagePayload) -> Result<ImagePayload, AiError> {
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    inline_image(crop),
                    { "text": RESTORATION_DIRECTIVE }
                ]
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
            }
        });
        let response = self.generate(&self.config.restoration_model, body).await?;
        extract_image(&response, &crop.mime_type)
    }

    fn name(&self) -> &str {
        "gemini"
    }
}
