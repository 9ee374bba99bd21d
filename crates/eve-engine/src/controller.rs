//! Conversation handle lifecycle and turn submission.
//!
//! The remote API is stateless, so a "handle" is the locally held bundle of
//! system instruction, sampling config and formatted history that each call
//! replays. `SessionContext` tracks whether that bundle is usable:
//!
//! ```text
//! Absent --bind--> Bound --call failure / explicit invalidate--> Invalid --bind--> Bound
//! ```
//!
//! A bound context is rebuilt whenever the language, chat model or memory
//! count it was built for no longer matches the caller's.

use std::fmt;
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use eve_contracts::chat::{
    format_history, model_turn, parse_reply, user_turn, Part, Turn, VisualKind,
};
use eve_contracts::models::{ModelSelector, CHAT_CAPABILITY};
use eve_contracts::session::{Message, Role};
use eve_contracts::settings::{GenerationSettings, KeyRing, Language};
use sha2::{Digest, Sha256};

use crate::backend::{ChatBackend, ChatRequest, SamplingConfig};
use crate::error::RemoteError;
use crate::persona;
use crate::util::non_empty_env;

pub const CREDENTIAL_ENV_KEYS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    ActiveKey,
    Environment,
}

impl CredentialSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialSource::ActiveKey => "active_key",
            CredentialSource::Environment => "environment",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    key: String,
    source: CredentialSource,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("source", &self.source)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl Credential {
    pub fn new(key: impl Into<String>, source: CredentialSource) -> Self {
        Self {
            key: key.into(),
            source,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    /// Short sha256 prefix, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.key.as_bytes());
        hex::encode(&digest[..6])
    }
}

/// Two-step credential lookup: the active key ring entry first, then the
/// environment.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    env_keys: Vec<String>,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new(CREDENTIAL_ENV_KEYS.iter().map(|key| (*key).to_string()))
    }
}

impl CredentialResolver {
    pub fn new(env_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            env_keys: env_keys.into_iter().collect(),
        }
    }

    pub fn without_environment() -> Self {
        Self::new(Vec::new())
    }

    pub fn from_key_ring(&self, ring: &KeyRing) -> Result<Credential, RemoteError> {
        ring.active()
            .map(|entry| entry.key.trim())
            .filter(|key| !key.is_empty())
            .map(|key| Credential::new(key, CredentialSource::ActiveKey))
            .ok_or(RemoteError::MissingCredential)
    }

    pub fn from_environment(&self) -> Result<Credential, RemoteError> {
        self.env_keys
            .iter()
            .find_map(|name| non_empty_env(name))
            .map(|key| Credential::new(key, CredentialSource::Environment))
            .ok_or(RemoteError::MissingCredential)
    }

    pub fn resolve(&self, ring: &KeyRing) -> Result<Credential, RemoteError> {
        match self.from_key_ring(ring) {
            Err(RemoteError::MissingCredential) => self.from_environment(),
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundContext {
    pub language: Language,
    pub model: String,
    pub memories_count: usize,
    pub credential: Credential,
    pub system_instruction: String,
    pub sampling: SamplingConfig,
    pub history: Vec<Turn>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum SessionContext {
    #[default]
    Absent,
    Bound(BoundContext),
    Invalid {
        reason: String,
    },
}

impl SessionContext {
    pub fn bound(&self) -> Option<&BoundContext> {
        match self {
            SessionContext::Bound(bound) => Some(bound),
            _ => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound().is_some()
    }

    pub fn is_current(&self, language: Language, model: &str, memories_count: usize) -> bool {
        self.bound().is_some_and(|bound| {
            bound.language == language
                && bound.model == model
                && bound.memories_count == memories_count
        })
    }

    /// Bound contexts become invalid; absent ones stay absent.
    pub fn invalidate(&mut self, reason: impl Into<String>) {
        if self.is_bound() {
            *self = SessionContext::Invalid {
                reason: reason.into(),
            };
        }
    }

    pub fn reset(&mut self) {
        *self = SessionContext::Absent;
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            SessionContext::Absent => "absent",
            SessionContext::Bound(_) => "bound",
            SessionContext::Invalid { .. } => "invalid",
        }
    }
}

/// Everything a context is built from.
#[derive(Debug, Clone, Copy)]
pub struct ContextInputs<'a> {
    pub history: &'a [Message],
    pub key_ring: &'a KeyRing,
    pub settings: &'a GenerationSettings,
    pub away: Option<&'a str>,
    pub language: Language,
    pub memories: &'a [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Reused,
    Bound,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub text: String,
    pub visual_prompt: Option<String>,
    pub visual_kind: VisualKind,
    pub is_error: bool,
    pub error: Option<RemoteError>,
    pub suggested_model: Option<String>,
    /// True when the context was (re)built for this turn.
    pub rebound: bool,
}

pub struct SessionController {
    backend: Arc<dyn ChatBackend>,
    resolver: CredentialResolver,
    selector: ModelSelector,
    clock: fn() -> NaiveDateTime,
}

impl SessionController {
    pub fn new(backend: Arc<dyn ChatBackend>, resolver: CredentialResolver) -> Self {
        Self {
            backend,
            resolver,
            selector: ModelSelector::default(),
            clock: local_now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn resolver(&self) -> &CredentialResolver {
        &self.resolver
    }

    /// Binds a context unless the current one already matches `inputs`.
    pub fn ensure_context(
        &self,
        ctx: &mut SessionContext,
        inputs: &ContextInputs<'_>,
    ) -> Result<Binding, RemoteError> {
        if ctx.is_current(
            inputs.language,
            &inputs.settings.chat_model,
            inputs.memories.len(),
        ) {
            return Ok(Binding::Reused);
        }
        self.bind(ctx, inputs)?;
        Ok(Binding::Bound)
    }

    /// Unconditionally replaces the context. On a missing credential no
    /// context is created.
    pub fn bind(&self, ctx: &mut SessionContext, inputs: &ContextInputs<'_>) -> Result<(), RemoteError> {
        let credential = match self.resolver.resolve(inputs.key_ring) {
            Ok(credential) => credential,
            Err(err) => {
                ctx.invalidate(err.kind());
                return Err(err);
            }
        };
        let system_instruction =
            persona::system_instruction(inputs.language, (self.clock)(), inputs.away, inputs.memories);
        *ctx = SessionContext::Bound(BoundContext {
            language: inputs.language,
            model: inputs.settings.chat_model.clone(),
            memories_count: inputs.memories.len(),
            credential,
            system_instruction,
            sampling: SamplingConfig::from_settings(inputs.settings),
            history: format_history(inputs.history, inputs.settings.history_depth),
        });
        Ok(())
    }

    /// Sends one user turn. Failures never escape as errors: they come back
    /// as an error outcome carrying the user-facing text, and the context is
    /// discarded.
    pub fn submit_turn(
        &self,
        ctx: &mut SessionContext,
        inputs: &ContextInputs<'_>,
        text: &str,
        image: Option<&str>,
    ) -> TurnOutcome {
        let rebound = match self.ensure_context(ctx, inputs) {
            Ok(binding) => binding == Binding::Bound,
            Err(err) => return self.failed(err, false),
        };
        let SessionContext::Bound(bound) = ctx else {
            return self.failed(RemoteError::MissingCredential, rebound);
        };

        let user = user_turn(text, image).unwrap_or_else(|| Turn {
            role: Role::User,
            parts: vec![Part::Text(text.to_string())],
        });
        let mut contents = bound.history.clone();
        push_turn(&mut contents, user.clone());
        let request = ChatRequest {
            model: bound.model.clone(),
            system_instruction: Some(bound.system_instruction.clone()),
            contents,
            sampling: bound.sampling,
        };

        match self.backend.generate_text(bound.credential.key(), &request) {
            Ok(raw) => {
                push_turn(&mut bound.history, user);
                push_turn(&mut bound.history, model_turn(&raw));
                trim_window(&mut bound.history, inputs.settings.history_depth);
                let parsed = parse_reply(&raw, inputs.settings.ai_image_generation);
                TurnOutcome {
                    text: parsed.clean_text,
                    visual_prompt: parsed.visual_prompt,
                    visual_kind: parsed.visual_kind,
                    is_error: false,
                    error: None,
                    suggested_model: None,
                    rebound,
                }
            }
            Err(err) => {
                tracing::warn!(model = %request.model, error = %err, "chat turn failed");
                ctx.invalidate(err.kind());
                self.failed(err, rebound)
            }
        }
    }

    fn failed(&self, err: RemoteError, rebound: bool) -> TurnOutcome {
        let suggested_model = match &err {
            RemoteError::ModelNotFound { model } => self
                .selector
                .alternative_to(model, CHAT_CAPABILITY)
                .map(|spec| spec.name),
            _ => None,
        };
        TurnOutcome {
            text: err.user_message().to_string(),
            visual_prompt: None,
            visual_kind: VisualKind::default(),
            is_error: true,
            error: Some(err),
            suggested_model,
            rebound,
        }
    }
}

pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Appends `turn`, folding it into the last turn when the roles match.
fn push_turn(turns: &mut Vec<Turn>, turn: Turn) {
    match turns.last_mut() {
        Some(last) if last.role == turn.role => last.parts.extend(turn.parts),
        _ => turns.push(turn),
    }
}

/// Keeps the trailing `depth` turns, never starting on a model turn.
fn trim_window(turns: &mut Vec<Turn>, depth: usize) {
    let excess = turns.len().saturating_sub(depth);
    turns.drain(..excess);
    let leading_model = turns
        .iter()
        .take_while(|turn| turn.role == Role::Model)
        .count();
    turns.drain(..leading_model);
}
