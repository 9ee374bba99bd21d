//! Eve companion engine: remote clients, conversation handle management,
//! memory consolidation and the deferred image pipeline.

mod background;
pub mod backend;
pub mod companion;
pub mod consolidator;
pub mod controller;
pub mod error;
pub mod gemini;
pub mod gradio;
pub mod persona;
mod util;
pub mod visual;

#[cfg(test)]
mod testing;

pub use background::Completion;
pub use backend::{
    ChatBackend, ChatRequest, ImageBackend, ImageBackendRegistry, ImageRequest, SamplingConfig,
};
pub use companion::{
    BackgroundUpdate, Backends, Companion, CompanionConfig, Confirmation, KeyTest,
    LanguageChange, PendingAction, TurnReport,
};
pub use consolidator::{ConsolidationOutcome, MemoryConsolidator};
pub use controller::{
    Credential, CredentialResolver, CredentialSource, SessionContext, SessionController,
    TurnOutcome,
};
pub use error::RemoteError;
pub use gemini::GeminiClient;
pub use gradio::GradioBackend;
pub use visual::{RenderedImage, VisualPipeline};
