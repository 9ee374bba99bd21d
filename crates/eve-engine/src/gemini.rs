use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use eve_contracts::chat::{Part, Turn, VisualKind};
use eve_contracts::models::PRIMARY_IMAGE_MODEL;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::backend::{ChatBackend, ChatRequest, ImageBackend, ImageRequest, SamplingConfig};
use crate::error::RemoteError;
use crate::util::{error_chain_text, non_empty_env, truncate_text};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const IMAGE_ASPECT_RATIO: &str = "9:16";

const REQUEST_TIMEOUT_S: f64 = 90.0;
const TRANSPORT_RETRIES: usize = 2;
const RETRY_BACKOFF_S: f64 = 1.2;

/// Blocking client for `generateContent`, used for chat, utility prompts
/// and the primary image backend.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_base: String,
    http: HttpClient,
    image_model: String,
}

impl GeminiClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
            image_model: PRIMARY_IMAGE_MODEL.to_string(),
        }
    }

    /// Honors `GEMINI_API_BASE`.
    pub fn from_env() -> Self {
        Self::new(non_empty_env("GEMINI_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()))
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
    ) -> anyhow::Result<HttpResponse> {
        let mut attempt = 0;
        loop {
            let response = self
                .http
                .post(endpoint)
                .query(&[("key", api_key)])
                .timeout(Duration::from_secs_f64(REQUEST_TIMEOUT_S))
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let retryable = raw.is_timeout() || raw.is_connect() || raw.is_request();
                    // The request URL carries the key as a query parameter.
                    let err = anyhow::Error::new(raw.without_url())
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !retryable || attempt >= TRANSPORT_RETRIES {
                        return Err(err);
                    }
                    attempt += 1;
                    tracing::debug!(
                        attempt,
                        max = TRANSPORT_RETRIES,
                        "Gemini transport retry after transient request failure"
                    );
                    thread::sleep(Duration::from_secs_f64(RETRY_BACKOFF_S * attempt as f64));
                }
            }
        }
    }

    fn call(&self, model: &str, api_key: &str, payload: &Value) -> Result<Value, RemoteError> {
        let endpoint = self.endpoint_for_model(model);
        let response = self
            .post_with_transport_retries(&endpoint, api_key, payload)
            .map_err(|err| RemoteError::Transport(error_chain_text(&err, 512)))?;
        response_json_or_error(model, response)
    }
}

impl ChatBackend for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_text(&self, api_key: &str, request: &ChatRequest) -> Result<String, RemoteError> {
        let payload = chat_payload(request);
        let response = self.call(&request.model, api_key, &payload)?;
        extract_text(&response).ok_or(RemoteError::EmptyResponse)
    }
}

impl ImageBackend for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn render(&self, api_key: Option<&str>, request: &ImageRequest) -> Result<String, RemoteError> {
        let api_key = api_key.ok_or(RemoteError::MissingCredential)?;
        let payload = image_payload(request);
        let response = self.call(&self.image_model, api_key, &payload)?;
        let (mime_type, data) = extract_inline_image(&response).ok_or(RemoteError::EmptyResponse)?;
        if BASE64.decode(data.as_bytes()).is_err() {
            return Err(RemoteError::Transport(
                "Gemini image base64 decode failed".to_string(),
            ));
        }
        Ok(format!("data:{mime_type};base64,{data}"))
    }
}

fn response_json_or_error(model: &str, response: HttpResponse) -> Result<Value, RemoteError> {
    let status = response.status();
    let body = response.text().map_err(|err| {
        RemoteError::Transport(format!("Gemini response body read failed: {err}"))
    })?;
    if !status.is_success() {
        return Err(RemoteError::from_status(status.as_u16(), &body, model));
    }
    serde_json::from_str(&body).map_err(|_| {
        RemoteError::Transport(format!(
            "Gemini returned invalid JSON payload: {}",
            truncate_text(&body, 200)
        ))
    })
}

pub fn default_safety_settings() -> Vec<Value> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .into_iter()
    .map(|category| {
        json!({
            "category": category,
            "threshold": "BLOCK_NONE",
        })
    })
    .collect()
}

fn turn_json(turn: &Turn) -> Value {
    let parts: Vec<Value> = turn
        .parts
        .iter()
        .map(|part| match part {
            Part::Text(text) => json!({ "text": text }),
            Part::InlineData { mime_type, data } => json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": data,
                }
            }),
        })
        .collect();
    json!({
        "role": turn.role.as_str(),
        "parts": parts,
    })
}

fn generation_config(sampling: &SamplingConfig) -> Map<String, Value> {
    let mut config = Map::new();
    config.insert("temperature".to_string(), json!(sampling.temperature));
    if let Some(top_p) = sampling.top_p {
        config.insert("topP".to_string(), json!(top_p));
    }
    if let Some(top_k) = sampling.top_k {
        config.insert("topK".to_string(), json!(top_k));
    }
    config
}

pub fn chat_payload(request: &ChatRequest) -> Value {
    let mut payload = Map::new();
    payload.insert(
        "contents".to_string(),
        Value::Array(request.contents.iter().map(turn_json).collect()),
    );
    if let Some(instruction) = request
        .system_instruction
        .as_deref()
        .filter(|text| !text.trim().is_empty())
    {
        payload.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": instruction }] }),
        );
    }
    payload.insert(
        "generationConfig".to_string(),
        Value::Object(generation_config(&request.sampling)),
    );
    payload.insert(
        "safetySettings".to_string(),
        Value::Array(default_safety_settings()),
    );
    Value::Object(payload)
}

pub fn image_prompt_prefix(kind: VisualKind) -> &'static str {
    match kind {
        VisualKind::Selfie => "Selfie of Eve: ",
        VisualKind::Scene => "Scene from user POV: ",
    }
}

pub fn image_payload(request: &ImageRequest) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [{
                "text": format!("{}{}", image_prompt_prefix(request.kind), request.prompt),
            }],
        }],
        "generationConfig": {
            "imageConfig": {
                "aspectRatio": IMAGE_ASPECT_RATIO,
            },
        },
        "safetySettings": default_safety_settings(),
    })
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

/// Concatenated text parts of the first candidate; thought parts are skipped.
pub fn extract_text(response: &Value) -> Option<String> {
    let text: String = candidate_parts(response)
        .iter()
        .filter(|part| !part.get("thought").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// First inline image of the first candidate as `(mime, base64)`.
pub fn extract_inline_image(response: &Value) -> Option<(String, String)> {
    candidate_parts(response).iter().find_map(|part| {
        let inline = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))?;
        let data = inline.get("data").and_then(Value::as_str)?;
        if data.is_empty() {
            return None;
        }
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        Some((mime_type.to_string(), data.to_string()))
    })
}
