use std::collections::BTreeMap;

use eve_contracts::chat::{Turn, VisualKind};
use eve_contracts::settings::GenerationSettings;

use crate::error::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
}

impl SamplingConfig {
    pub fn from_settings(settings: &GenerationSettings) -> Self {
        Self {
            temperature: settings.temperature,
            top_p: Some(settings.top_p),
            top_k: Some(settings.top_k),
        }
    }

    /// Temperature only, for short utility calls.
    pub fn fixed(temperature: f64) -> Self {
        Self {
            temperature,
            top_p: None,
            top_k: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub system_instruction: Option<String>,
    pub contents: Vec<Turn>,
    pub sampling: SamplingConfig,
}

pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;
    fn generate_text(&self, api_key: &str, request: &ChatRequest) -> Result<String, RemoteError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    /// Fully enhanced prompt, style suffix included.
    pub prompt: String,
    pub kind: VisualKind,
    pub settings: GenerationSettings,
    pub endpoint: Option<String>,
}

pub trait ImageBackend: Send + Sync {
    fn name(&self) -> &str;
    /// Returns a data URI or URL for the rendered image.
    fn render(&self, api_key: Option<&str>, request: &ImageRequest) -> Result<String, RemoteError>;
}

#[derive(Default)]
pub struct ImageBackendRegistry {
    backends: BTreeMap<String, Box<dyn ImageBackend>>,
}

impl ImageBackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<B: ImageBackend + 'static>(&mut self, backend: B) {
        self.backends
            .insert(backend.name().to_string(), Box::new(backend));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageBackend> {
        self.backends.get(name).map(|backend| backend.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}
