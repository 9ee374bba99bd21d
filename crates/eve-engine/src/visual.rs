//! Deferred image generation for `[SCENE]`/`[SELFIE]` directives.

use std::sync::mpsc;
use std::sync::Arc;

use anyhow::Result;
use eve_contracts::chat::{user_turn, VisualKind};
use eve_contracts::settings::GenerationSettings;

use crate::background::{spawn_worker, Completion};
use crate::backend::{ChatBackend, ChatRequest, ImageBackendRegistry, ImageRequest, SamplingConfig};
use crate::error::RemoteError;
use crate::persona::{visual_rewrite_request, MAX_VISUAL_PROMPT_CHARS};

pub const STYLE_SUFFIX: &str = ", 8k, best quality, masterpiece";
pub const REWRITE_TEMPERATURE: f64 = 0.7;

const PRIMARY_BACKEND: &str = "gemini";
const SECONDARY_BACKEND: &str = "gradio";

#[derive(Debug, Clone, PartialEq)]
pub struct VisualJob {
    pub message_id: String,
    pub directive: String,
    pub kind: VisualKind,
    pub settings: GenerationSettings,
    pub endpoint: Option<String>,
    pub prior_context: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub image: String,
    pub backend: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisualCompletion {
    pub message_id: String,
    pub directive: String,
    pub result: Result<RenderedImage, RemoteError>,
}

#[derive(Clone)]
pub struct VisualPipeline {
    chat: Arc<dyn ChatBackend>,
    images: Arc<ImageBackendRegistry>,
}

impl VisualPipeline {
    pub fn new(chat: Arc<dyn ChatBackend>, images: Arc<ImageBackendRegistry>) -> Self {
        Self { chat, images }
    }

    /// Secondary first when an endpoint is configured, primary always last.
    pub fn backend_order(endpoint: Option<&str>) -> Vec<&'static str> {
        match endpoint.map(str::trim).filter(|value| !value.is_empty()) {
            Some(_) => vec![SECONDARY_BACKEND, PRIMARY_BACKEND],
            None => vec![PRIMARY_BACKEND],
        }
    }

    /// Rewrites the directive into a full prompt and appends the style
    /// suffix. Falls back to the raw directive when the rewrite fails.
    pub fn enhance_prompt(&self, job: &VisualJob) -> String {
        let rewritten = job
            .api_key
            .as_deref()
            .and_then(|api_key| self.rewrite(api_key, job));
        let base = rewritten.unwrap_or_else(|| job.directive.trim().to_string());
        format!("{base}{STYLE_SUFFIX}")
    }

    fn rewrite(&self, api_key: &str, job: &VisualJob) -> Option<String> {
        let text = visual_rewrite_request(
            job.kind,
            &job.directive,
            job.prior_context.as_deref().unwrap_or(""),
        );
        let request = ChatRequest {
            model: job.settings.chat_model.clone(),
            system_instruction: None,
            contents: user_turn(&text, None).into_iter().collect(),
            sampling: SamplingConfig::fixed(REWRITE_TEMPERATURE),
        };
        match self.chat.generate_text(api_key, &request) {
            Ok(reply) => {
                let clipped: String = reply.trim().chars().take(MAX_VISUAL_PROMPT_CHARS).collect();
                let clipped = clipped.trim().to_string();
                (!clipped.is_empty()).then_some(clipped)
            }
            Err(err) => {
                tracing::debug!(error = %err, "visual prompt rewrite failed; using directive");
                None
            }
        }
    }

    pub fn request_visual(&self, job: &VisualJob) -> Result<RenderedImage, RemoteError> {
        let prompt = self.enhance_prompt(job);
        let request = ImageRequest {
            prompt: prompt.clone(),
            kind: job.kind,
            settings: job.settings.clone(),
            endpoint: job.endpoint.clone(),
        };

        let mut last_error = RemoteError::EmptyResponse;
        for name in Self::backend_order(job.endpoint.as_deref()) {
            let Some(backend) = self.images.get(name) else {
                continue;
            };
            match backend.render(job.api_key.as_deref(), &request) {
                Ok(image) => {
                    return Ok(RenderedImage {
                        image,
                        backend: name.to_string(),
                        prompt,
                    })
                }
                Err(err) => {
                    tracing::warn!(backend = name, error = %err, "image backend failed");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    /// Runs `request_visual` on a worker thread.
    pub fn spawn(&self, job: VisualJob, sender: &mpsc::Sender<Completion>) -> Result<()> {
        let pipeline = self.clone();
        let message_id = job.message_id.clone();
        let directive = job.directive.clone();
        spawn_worker(
            "eve-visual",
            sender.clone(),
            move || {
                let result = pipeline.request_visual(&job);
                Completion::Visual(VisualCompletion {
                    message_id: job.message_id,
                    directive: job.directive,
                    result,
                })
            },
            move |err| {
                Completion::Visual(VisualCompletion {
                    message_id,
                    directive,
                    result: Err(err),
                })
            },
        )
    }
}
