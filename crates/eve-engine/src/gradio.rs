//! Secondary image backend speaking the Gradio REST call protocol.
//!
//! `POST {base}/gradio_api/call/{fn}` returns an `event_id`; the result is
//! then streamed as server-sent events from `GET {base}/gradio_api/call/{fn}/{event_id}`
//! and the `complete` event carries the output array.

use std::time::Duration;

use eve_contracts::settings::{GenerationSettings, MIN_STEPS};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use crate::backend::{ImageBackend, ImageRequest};
use crate::error::RemoteError;
use crate::util::{error_chain_text, truncate_text};

pub const DEFAULT_SPACE: &str = "black-forest-labs/FLUX.1-schnell";
pub const GRADIO_FN: &str = "generate";
pub const NEGATIVE_PROMPT: &str =
    "blurry, low quality, distorted face, deformed hands, extra limbs, watermark, text, cartoon";

const REQUEST_TIMEOUT_S: u64 = 180;

#[derive(Debug, Clone)]
pub struct GradioBackend {
    http: HttpClient,
    function: String,
}

impl Default for GradioBackend {
    fn default() -> Self {
        Self::new(GRADIO_FN)
    }
}

impl GradioBackend {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            http: HttpClient::new(),
            function: function.into(),
        }
    }

    fn submit(&self, base: &str, data: &Value) -> Result<String, RemoteError> {
        let url = format!("{base}/gradio_api/call/{}", self.function);
        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_S))
            .json(&json!({ "data": data }))
            .send()
            .map_err(|err| transport(err, &url))?;
        let status = response.status();
        let body = response.text().map_err(|err| transport(err, &url))?;
        if !status.is_success() {
            return Err(endpoint_failure(status.as_u16(), &body, base));
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|_| {
            RemoteError::Transport(format!(
                "Gradio call returned invalid JSON: {}",
                truncate_text(&body, 200)
            ))
        })?;
        parsed
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Transport("Gradio call returned no event_id".to_string()))
    }

    fn await_result(&self, base: &str, event_id: &str) -> Result<String, RemoteError> {
        let url = format!("{base}/gradio_api/call/{}/{event_id}", self.function);
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_S))
            .send()
            .map_err(|err| transport(err, &url))?;
        let status = response.status();
        let body = response.text().map_err(|err| transport(err, &url))?;
        if !status.is_success() {
            return Err(endpoint_failure(status.as_u16(), &body, base));
        }
        let data = complete_event_data(&body)?;
        image_reference(base, &data).ok_or(RemoteError::EmptyResponse)
    }
}

impl ImageBackend for GradioBackend {
    fn name(&self) -> &str {
        "gradio"
    }

    fn render(&self, _api_key: Option<&str>, request: &ImageRequest) -> Result<String, RemoteError> {
        let endpoint = request
            .endpoint
            .as_deref()
            .ok_or_else(|| RemoteError::Transport("no Gradio endpoint configured".to_string()))?;
        let base = resolve_space_url(endpoint);
        let data = call_arguments(&request.prompt, &request.settings);
        let event_id = self.submit(&base, &data)?;
        self.await_result(&base, &event_id)
    }
}

fn transport(err: reqwest::Error, url: &str) -> RemoteError {
    let err = anyhow::Error::new(err).context(format!("Gradio request failed ({url})"));
    RemoteError::Transport(error_chain_text(&err, 512))
}

/// A 404 here means the endpoint or function is wrong, not the chat model.
fn endpoint_failure(status: u16, body: &str, base: &str) -> RemoteError {
    if status == 404 {
        return RemoteError::Transport(format!("Gradio endpoint not found: {base}"));
    }
    RemoteError::from_status(status, body, base)
}

/// Accepts a full URL or a Hugging Face `owner/space` id.
pub fn resolve_space_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }
    let host = trimmed
        .to_ascii_lowercase()
        .replace(['/', '.', '_'], "-");
    format!("https://{host}.hf.space")
}

/// Positional inputs of the generation function.
pub fn call_arguments(prompt: &str, settings: &GenerationSettings) -> Value {
    json!([
        prompt,
        NEGATIVE_PROMPT,
        Value::Null,
        settings.ip_adapter_strength,
        settings.lora_strength,
        settings.guidance,
        settings.steps.max(MIN_STEPS),
        settings.seed,
        settings.randomize_seed,
        settings.use_magic,
    ])
}

/// Extracts the `data:` payload of the `complete` event from an SSE body.
pub fn complete_event_data(body: &str) -> Result<Value, RemoteError> {
    let mut event = "";
    for line in body.lines() {
        if let Some(name) = line.strip_prefix("event:") {
            event = name.trim();
            continue;
        }
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        match event {
            "complete" => {
                return serde_json::from_str(data.trim()).map_err(|_| {
                    RemoteError::Transport("Gradio complete event is not JSON".to_string())
                })
            }
            "error" => {
                return Err(RemoteError::Transport(format!(
                    "Gradio generation failed: {}",
                    truncate_text(data.trim(), 200)
                )))
            }
            _ => {}
        }
    }
    Err(RemoteError::EmptyResponse)
}

/// First output that names an image: a bare string, or a file object with
/// `url` or `path`.
pub fn image_reference(base: &str, data: &Value) -> Option<String> {
    let first = match data {
        Value::Array(items) => items.first()?,
        other => other,
    };
    match first {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Object(file) => {
            if let Some(url) = file.get("url").and_then(Value::as_str) {
                return Some(url.to_string());
            }
            file.get("path")
                .and_then(Value::as_str)
                .map(|path| format!("{base}/gradio_api/file={path}"))
        }
        _ => None,
    }
}
