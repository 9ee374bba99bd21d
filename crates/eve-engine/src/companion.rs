//! The application object: owns the working session, settings and key ring,
//! runs turns through the controller and applies background completions.
//!
//! Every mutation is flushed to disk before the call returns. Background
//! work (memory consolidation, image rendering) reports back over a channel
//! and is only applied from `poll_background` / `wait_background`, so the
//! session is never touched off the owning thread.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use eve_contracts::chat::user_turn;
use eve_contracts::events::EventWriter;
use eve_contracts::models::{ModelSelector, ModelSpec, CHAT_CAPABILITY};
use eve_contracts::session::{now_millis, Greeting, Message, Session};
use eve_contracts::settings::{ApiKeyDef, GenerationSettings, KeyRing, Language, DEFAULT_CHAT_MODEL};
use eve_contracts::store::{SessionStore, SettingsStore};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::background::Completion;
use crate::backend::{ChatBackend, ChatRequest, ImageBackendRegistry, SamplingConfig};
use crate::consolidator::{
    ConsolidationCompletion, ConsolidationOutcome, ConsolidationStart, MemoryConsolidator,
};
use crate::controller::{
    local_now, Binding, ContextInputs, CredentialResolver, SessionContext, SessionController,
};
use crate::error::RemoteError;
use crate::gemini::GeminiClient;
use crate::gradio::GradioBackend;
use crate::persona::away_phrase;
use crate::util::map_object;
use crate::visual::{VisualCompletion, VisualJob, VisualPipeline};

pub const SESSION_FILE: &str = "session.json";
pub const SETTINGS_FILE: &str = "settings.json";
pub const EVENTS_FILE: &str = "events.jsonl";

/// Model and prompt used to check that a key works.
pub const KEY_TEST_MODEL: &str = DEFAULT_CHAT_MODEL;
const KEY_TEST_PROMPT: &str = "test";
/// Token cost charged per attached image in the usage estimate.
const IMAGE_TOKEN_COST: usize = 258;

#[derive(Debug, Clone)]
pub struct CompanionConfig {
    pub data_dir: PathBuf,
    pub events_path: Option<PathBuf>,
    pub resolver: CredentialResolver,
    pub clock: fn() -> NaiveDateTime,
}

impl CompanionConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            events_path: None,
            resolver: CredentialResolver::default(),
            clock: local_now,
        }
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join(SESSION_FILE)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    pub fn events_path(&self) -> PathBuf {
        self.events_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(EVENTS_FILE))
    }
}

pub struct Backends {
    pub chat: Arc<dyn ChatBackend>,
    pub images: ImageBackendRegistry,
}

impl Backends {
    /// Gemini for chat and primary images, Gradio as the secondary renderer.
    pub fn live() -> Self {
        let gemini = GeminiClient::from_env();
        let mut images = ImageBackendRegistry::new();
        images.register(gemini.clone());
        images.register(GradioBackend::default());
        Self {
            chat: Arc::new(gemini),
            images,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub reply: Message,
    pub visual_pending: bool,
    pub error: Option<RemoteError>,
    pub suggested_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundUpdate {
    Consolidation(ConsolidationOutcome),
    ImageReady { message_id: String, backend: String },
    ImageFailed { message_id: String, reason: String },
    ImageDiscarded { message_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Language(Language),
    Wipe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageChange {
    Unchanged,
    Applied(Language),
    NeedsConfirmation(Language),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Language(Language),
    Wiped,
    NothingPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyTest {
    Valid,
    Invalid(String),
}

pub struct Companion {
    config: CompanionConfig,
    session_store: SessionStore,
    settings_store: SettingsStore,
    events: EventWriter,
    chat: Arc<dyn ChatBackend>,
    controller: SessionController,
    consolidator: MemoryConsolidator,
    visuals: VisualPipeline,
    selector: ModelSelector,
    session: Session,
    settings: GenerationSettings,
    key_ring: KeyRing,
    language: Language,
    endpoint: Option<String>,
    context: SessionContext,
    away: Option<String>,
    prior_visual: Option<String>,
    pending: Option<PendingAction>,
    visuals_in_flight: usize,
    sender: mpsc::Sender<Completion>,
    receiver: mpsc::Receiver<Completion>,
}

impl Companion {
    /// Loads persisted state, binds a context when a credential is
    /// available and starts a consolidation if the history is due.
    pub fn open(config: CompanionConfig, backends: Backends) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data dir {}", config.data_dir.display())
        })?;

        let mut settings_store = SettingsStore::new(config.settings_path());
        let settings = settings_store.generation_settings();
        let language = settings_store.language();
        let endpoint = settings_store.endpoint();
        let key_ring = settings_store.key_ring();

        let mut session_store = SessionStore::new(config.session_path());
        let (session, source, away) = match session_store.load() {
            Ok(Some(mut stored)) if !stored.messages.is_empty() => {
                let away = away_phrase(now_millis() - stored.last_updated);
                settle_pending_images(&mut stored);
                (stored, "stored", away)
            }
            Ok(Some(stored)) => {
                let mut session = Session::greeted(Greeting::Welcome, language);
                session.memories = stored.memories;
                (session, "stored_empty", None)
            }
            Ok(None) => (Session::greeted(Greeting::Welcome, language), "new", None),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "session load failed; starting fresh");
                quarantine(&config.session_path());
                (Session::greeted(Greeting::LoadFailed, language), "load_failed", None)
            }
        };

        let chat = Arc::clone(&backends.chat);
        let controller =
            SessionController::new(Arc::clone(&chat), config.resolver.clone()).with_clock(config.clock);
        let events = EventWriter::new(config.events_path(), Uuid::new_v4().to_string());
        let (sender, receiver) = mpsc::channel();

        let mut companion = Self {
            session_store,
            settings_store,
            events,
            consolidator: MemoryConsolidator::new(Arc::clone(&chat)),
            visuals: VisualPipeline::new(Arc::clone(&chat), Arc::new(backends.images)),
            selector: ModelSelector::default(),
            chat,
            controller,
            session,
            settings,
            key_ring,
            language,
            endpoint,
            context: SessionContext::Absent,
            away,
            prior_visual: None,
            pending: None,
            visuals_in_flight: 0,
            sender,
            receiver,
            config,
        };

        companion.events.record(
            "session_loaded",
            map_object(json!({
                "source": source,
                "messages": companion.session.messages.len(),
                "memories": companion.session.memories.len(),
                "language": companion.language.as_str(),
                "away": companion.away,
            })),
        );
        companion.rebind();
        companion.persist_session();
        companion.maybe_consolidate();
        Ok(companion)
    }

    pub fn config(&self) -> &CompanionConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn messages(&self) -> &[Message] {
        &self.session.messages
    }

    pub fn memories(&self) -> &[String] {
        &self.session.memories
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub fn key_ring(&self) -> &KeyRing {
        &self.key_ring
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn pending_action(&self) -> Option<PendingAction> {
        self.pending
    }

    pub fn prior_visual(&self) -> Option<&str> {
        self.prior_visual.as_deref()
    }

    pub fn is_consolidating(&self) -> bool {
        self.consolidator.in_flight()
    }

    pub fn background_in_flight(&self) -> bool {
        self.consolidator.in_flight() || self.visuals_in_flight > 0
    }

    pub fn chat_models(&self) -> Vec<ModelSpec> {
        self.selector.registry.by_capability(CHAT_CAPABILITY)
    }

    pub fn events_path(&self) -> &Path {
        self.events.path()
    }

    /// Sends one user turn. `None` when there is neither text nor image.
    pub fn send(&mut self, text: &str, image: Option<String>) -> Option<TurnReport> {
        let image = image.filter(|value| !value.trim().is_empty());
        if text.trim().is_empty() && image.is_none() {
            return None;
        }
        let user = Message::user(text, image.clone());

        let inputs = ContextInputs {
            history: &self.session.messages,
            key_ring: &self.key_ring,
            settings: &self.settings,
            away: self.away.as_deref(),
            language: self.language,
            memories: &self.session.memories,
        };
        let outcome = self
            .controller
            .submit_turn(&mut self.context, &inputs, text, image.as_deref());
        if outcome.rebound && self.context.is_bound() {
            self.record_binding();
            self.away = None;
        }

        self.session.push(user);
        let mut visual_pending = false;
        let reply = if outcome.is_error {
            let kind = outcome.error.as_ref().map(RemoteError::kind).unwrap_or("unknown");
            self.events.record(
                "turn_failed",
                map_object(json!({
                    "kind": kind,
                    "model": self.settings.chat_model,
                    "suggested_model": outcome.suggested_model,
                })),
            );
            Message::model_error(outcome.text.clone())
        } else {
            let mut reply = Message::model(outcome.text.clone());
            if outcome.visual_prompt.is_some() {
                reply = reply.image_pending();
                visual_pending = true;
            }
            self.events.record(
                "turn_completed",
                map_object(json!({
                    "model": self.settings.chat_model,
                    "chars": outcome.text.chars().count(),
                    "visual": outcome.visual_prompt.as_ref().map(|_| outcome.visual_kind.as_str()),
                })),
            );
            reply
        };
        self.session.push(reply.clone());

        if let Some(directive) = outcome.visual_prompt.filter(|_| visual_pending) {
            let job = VisualJob {
                message_id: reply.id.clone(),
                directive,
                kind: outcome.visual_kind,
                settings: self.settings.clone(),
                endpoint: self.endpoint.clone(),
                prior_context: self.prior_visual.clone(),
                api_key: self.api_key(),
            };
            visual_pending = self.start_visual(job);
        }

        self.session.touch();
        self.persist_session();
        self.maybe_consolidate();

        let reply = self
            .session
            .find(&reply.id)
            .cloned()
            .unwrap_or(reply);
        Some(TurnReport {
            reply,
            visual_pending,
            error: outcome.error,
            suggested_model: outcome.suggested_model,
        })
    }

    fn start_visual(&mut self, job: VisualJob) -> bool {
        let message_id = job.message_id.clone();
        self.events.record(
            "visual_requested",
            map_object(json!({
                "message_id": message_id,
                "kind": job.kind.as_str(),
                "backends": VisualPipeline::backend_order(job.endpoint.as_deref()),
            })),
        );
        match self.visuals.spawn(job, &self.sender) {
            Ok(()) => {
                self.visuals_in_flight += 1;
                true
            }
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "visual worker failed to start");
                self.session.patch_image(&message_id, None);
                self.events.record(
                    "visual_failed",
                    map_object(json!({ "message_id": message_id, "reason": format!("{err:#}") })),
                );
                false
            }
        }
    }

    /// Applies every completion that has already arrived.
    pub fn poll_background(&mut self) -> Vec<BackgroundUpdate> {
        let mut updates = Vec::new();
        while let Ok(completion) = self.receiver.try_recv() {
            updates.push(self.apply_completion(completion));
        }
        updates
    }

    /// Blocks until all background work is done or `timeout` passes.
    pub fn wait_background(&mut self, timeout: Duration) -> Vec<BackgroundUpdate> {
        let deadline = Instant::now() + timeout;
        let mut updates = self.poll_background();
        while self.background_in_flight() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.receiver.recv_timeout(remaining) {
                Ok(completion) => updates.push(self.apply_completion(completion)),
                Err(_) => break,
            }
        }
        updates
    }

    fn apply_completion(&mut self, completion: Completion) -> BackgroundUpdate {
        match completion {
            Completion::Consolidation(done) => self.apply_consolidation(done),
            Completion::Visual(done) => self.apply_visual(done),
        }
    }

    fn apply_consolidation(&mut self, completion: ConsolidationCompletion) -> BackgroundUpdate {
        let outcome = self.consolidator.apply(&mut self.session, completion);
        match &outcome {
            ConsolidationOutcome::Applied { summary, pruned } => {
                self.events.record(
                    "consolidation_applied",
                    map_object(json!({
                        "pruned": pruned,
                        "memories": self.session.memories.len(),
                        "summary_chars": summary.chars().count(),
                    })),
                );
                self.session.touch();
                self.persist_session();
                self.maybe_consolidate();
            }
            ConsolidationOutcome::Stale => {
                tracing::debug!("consolidation result no longer matches history; dropped");
                self.events.record(
                    "consolidation_failed",
                    map_object(json!({ "reason": "stale" })),
                );
            }
            ConsolidationOutcome::Failed(reason) => {
                tracing::warn!(reason = %reason, "memory consolidation failed");
                self.events.record(
                    "consolidation_failed",
                    map_object(json!({ "reason": reason })),
                );
            }
        }
        BackgroundUpdate::Consolidation(outcome)
    }

    fn apply_visual(&mut self, completion: VisualCompletion) -> BackgroundUpdate {
        self.visuals_in_flight = self.visuals_in_flight.saturating_sub(1);
        let message_id = completion.message_id;
        let update = match completion.result {
            Ok(rendered) => {
                if !self.session.patch_image(&message_id, Some(rendered.image)) {
                    return BackgroundUpdate::ImageDiscarded { message_id };
                }
                self.prior_visual = Some(completion.directive);
                self.events.record(
                    "visual_resolved",
                    map_object(json!({ "message_id": message_id, "backend": rendered.backend })),
                );
                BackgroundUpdate::ImageReady {
                    message_id,
                    backend: rendered.backend,
                }
            }
            Err(err) => {
                if !self.session.patch_image(&message_id, None) {
                    return BackgroundUpdate::ImageDiscarded { message_id };
                }
                self.events.record(
                    "visual_failed",
                    map_object(json!({ "message_id": message_id, "reason": err.kind() })),
                );
                BackgroundUpdate::ImageFailed {
                    message_id,
                    reason: err.to_string(),
                }
            }
        };
        self.persist_session();
        update
    }

    /// Switches immediately while the conversation is pristine; otherwise
    /// parks the switch until `confirm`.
    pub fn request_language(&mut self, language: Language) -> Result<LanguageChange> {
        if language == self.language {
            return Ok(LanguageChange::Unchanged);
        }
        if self.session.is_pristine() {
            self.apply_language(language)?;
            return Ok(LanguageChange::Applied(language));
        }
        self.pending = Some(PendingAction::Language(language));
        Ok(LanguageChange::NeedsConfirmation(language))
    }

    pub fn request_wipe(&mut self) {
        self.pending = Some(PendingAction::Wipe);
    }

    pub fn confirm(&mut self) -> Result<Confirmation> {
        match self.pending.take() {
            Some(PendingAction::Language(language)) => {
                self.apply_language(language)?;
                Ok(Confirmation::Language(language))
            }
            Some(PendingAction::Wipe) => {
                self.wipe();
                Ok(Confirmation::Wiped)
            }
            None => Ok(Confirmation::NothingPending),
        }
    }

    pub fn cancel(&mut self) -> Option<PendingAction> {
        self.pending.take()
    }

    fn apply_language(&mut self, language: Language) -> Result<()> {
        self.settings_store.save_language(language)?;
        let previous = self.language;
        self.language = language;
        self.prior_visual = None;
        let reset = self.session.is_pristine();
        if reset {
            let memories = std::mem::take(&mut self.session.memories);
            self.session = Session::greeted(Greeting::Reset, language);
            self.session.memories = memories;
            self.context.reset();
        }
        self.events.record(
            "language_changed",
            map_object(json!({
                "from": previous.as_str(),
                "to": language.as_str(),
                "reset": reset,
            })),
        );
        self.rebind();
        self.persist_session();
        Ok(())
    }

    /// Forgets the whole conversation, long-term memories included.
    pub fn wipe(&mut self) {
        if let Err(err) = self.session_store.clear() {
            tracing::warn!(error = %format!("{err:#}"), "session clear failed");
        }
        let dropped_messages = self.session.messages.len();
        let dropped_memories = self.session.memories.len();
        self.session = Session::greeted(Greeting::FreshStart, self.language);
        self.context.reset();
        self.prior_visual = None;
        self.pending = None;
        self.events.record(
            "memory_wiped",
            map_object(json!({
                "messages": dropped_messages,
                "memories": dropped_memories,
            })),
        );
        self.rebind();
        self.persist_session();
    }

    /// Updates one generation setting and returns its canonical name.
    pub fn set_setting(&mut self, field: &str, raw: &str) -> Result<&'static str> {
        let mut updated = self.settings.clone();
        let name = updated.set_field(field, raw)?;
        self.store_settings(updated, name)?;
        Ok(name)
    }

    pub fn reset_setting(&mut self, field: &str) -> Result<&'static str> {
        let mut updated = self.settings.clone();
        let name = updated.reset_field(field)?;
        self.store_settings(updated, name)?;
        Ok(name)
    }

    /// Selects the chat model. Unknown ids are accepted; the returned
    /// warning says so.
    pub fn set_model(&mut self, model: &str) -> Result<Option<String>> {
        let model = model.trim();
        if model.is_empty() {
            bail!("model id is required");
        }
        let warning = match self.selector.select(Some(model), CHAT_CAPABILITY) {
            Ok(selection) => selection.fallback_reason.map(|_| {
                format!("'{model}' is not in the chat catalog; using it anyway")
            }),
            Err(reason) => Some(reason),
        };
        if let Some(warning) = &warning {
            tracing::warn!(model, warning = %warning, "unlisted chat model selected");
        }
        self.set_setting("chatModel", model)?;
        Ok(warning)
    }

    fn store_settings(&mut self, updated: GenerationSettings, field: &str) -> Result<()> {
        let updated = updated.normalized();
        self.settings_store.save_generation_settings(&updated)?;
        let sampling_changed = SamplingConfig::from_settings(&updated)
            != SamplingConfig::from_settings(&self.settings)
            || updated.history_depth != self.settings.history_depth;
        self.settings = updated;
        self.events.record(
            "settings_updated",
            map_object(json!({
                "field": field,
                "value": self.settings.field_value(field).unwrap_or(Value::Null),
            })),
        );
        if sampling_changed {
            self.context.invalidate("settings_changed");
        }
        self.rebind();
        self.maybe_consolidate();
        Ok(())
    }

    /// Stores the trimmed endpoint; blank clears it.
    pub fn set_endpoint(&mut self, raw: &str) -> Result<Option<String>> {
        let stored = self.settings_store.save_endpoint(raw)?;
        self.endpoint = stored.clone();
        self.events.record(
            "settings_updated",
            map_object(json!({ "field": "endpoint", "configured": stored.is_some() })),
        );
        Ok(stored)
    }

    pub fn add_key(&mut self, label: &str, key: &str) -> Result<ApiKeyDef> {
        let mut ring = self.key_ring.clone();
        let entry = ring.add(label, key)?;
        self.store_key_ring(ring)?;
        Ok(entry)
    }

    pub fn use_key(&mut self, id: &str) -> Result<()> {
        let mut ring = self.key_ring.clone();
        if !ring.select(id) {
            bail!("no API key with id '{id}'");
        }
        self.store_key_ring(ring)
    }

    pub fn remove_key(&mut self, id: &str) -> Result<()> {
        let mut ring = self.key_ring.clone();
        if !ring.remove(id) {
            bail!("no API key with id '{id}'");
        }
        self.store_key_ring(ring)
    }

    fn store_key_ring(&mut self, ring: KeyRing) -> Result<()> {
        self.settings_store.save_key_ring(&ring)?;
        let active_changed = ring.active() != self.key_ring.active();
        self.key_ring = ring;
        self.events.record(
            "settings_updated",
            map_object(json!({
                "field": "api_keys",
                "count": self.key_ring.keys.len(),
                "active_id": self.key_ring.active().map(|entry| entry.id.clone()),
            })),
        );
        if active_changed {
            self.context.invalidate("credential_changed");
            self.rebind();
        }
        Ok(())
    }

    /// Sends a one-word prompt with the given key.
    pub fn test_key(&self, id: &str) -> Result<KeyTest> {
        let Some(entry) = self.key_ring.get(id) else {
            bail!("no API key with id '{id}'");
        };
        let request = ChatRequest {
            model: KEY_TEST_MODEL.to_string(),
            system_instruction: None,
            contents: user_turn(KEY_TEST_PROMPT, None).into_iter().collect(),
            sampling: SamplingConfig::fixed(1.0),
        };
        match self.chat.generate_text(&entry.key, &request) {
            Ok(_) | Err(RemoteError::EmptyResponse) => Ok(KeyTest::Valid),
            Err(err) => Ok(KeyTest::Invalid(err.user_message().to_string())),
        }
    }

    /// Rough token estimate for the active window: a quarter token per
    /// character plus a flat cost per image.
    pub fn context_usage(&self) -> usize {
        let messages = &self.session.messages;
        if messages.len() <= 1 {
            return 0;
        }
        let start = messages.len().saturating_sub(self.settings.history_depth);
        let window = &messages[start..];
        let chars: usize = window.iter().map(|message| message.text.chars().count()).sum();
        let images = window.iter().filter(|message| message.image.is_some()).count();
        (chars as f64 / 4.0).round() as usize + images * IMAGE_TOKEN_COST
    }

    fn api_key(&self) -> Option<String> {
        self.controller
            .resolver()
            .resolve(&self.key_ring)
            .ok()
            .map(|credential| credential.key().to_string())
    }

    fn rebind(&mut self) {
        let inputs = ContextInputs {
            history: &self.session.messages,
            key_ring: &self.key_ring,
            settings: &self.settings,
            away: self.away.as_deref(),
            language: self.language,
            memories: &self.session.memories,
        };
        match self.controller.ensure_context(&mut self.context, &inputs) {
            Ok(Binding::Bound) => {
                self.record_binding();
                self.away = None;
            }
            Ok(Binding::Reused) => {}
            Err(err) => tracing::debug!(error = %err, "conversation context not bound"),
        }
    }

    fn record_binding(&self) {
        let Some(bound) = self.context.bound() else {
            return;
        };
        self.events.record(
            "context_bound",
            map_object(json!({
                "language": bound.language.as_str(),
                "model": bound.model,
                "memories": bound.memories_count,
                "history_turns": bound.history.len(),
                "credential_source": bound.credential.source().as_str(),
                "credential_fingerprint": bound.credential.fingerprint(),
            })),
        );
    }

    fn maybe_consolidate(&mut self) {
        let api_key = self.api_key();
        let start = self.consolidator.maybe_consolidate(
            &self.session,
            &self.settings,
            self.language,
            api_key.as_deref(),
            &self.sender,
        );
        match start {
            ConsolidationStart::Started { batch } => {
                self.events.record(
                    "consolidation_started",
                    map_object(json!({ "batch": batch, "messages": self.session.messages.len() })),
                );
            }
            ConsolidationStart::SpawnFailed(reason) => {
                tracing::warn!(reason = %reason, "consolidation worker failed to start");
                self.events.record(
                    "consolidation_failed",
                    map_object(json!({ "reason": reason })),
                );
            }
            ConsolidationStart::NoCredential => {
                tracing::debug!("consolidation due but no credential is configured");
            }
            ConsolidationStart::NotDue | ConsolidationStart::InFlight => {}
        }
    }

    /// Save failures are logged, never retried.
    fn persist_session(&mut self) {
        if let Err(err) = self.session_store.save(&self.session) {
            tracing::warn!(error = %format!("{err:#}"), "session save failed");
        }
    }
}

/// Images still pending from a previous run will never resolve.
fn settle_pending_images(session: &mut Session) {
    let pending: Vec<String> = session
        .messages
        .iter()
        .filter(|message| message.is_image_loading)
        .map(|message| message.id.clone())
        .collect();
    for id in pending {
        session.patch_image(&id, None);
    }
}

/// Moves an unreadable session file aside so the fresh session can be saved.
fn quarantine(path: &Path) {
    let target = path.with_extension("json.corrupt");
    if let Err(err) = fs::rename(path, &target) {
        tracing::warn!(error = %err, path = %path.display(), "could not move unreadable session aside");
    }
}

#[cfg(test)]
mod tests {
    use eve_contracts::session::Role;
    use eve_contracts::settings::MIN_STEPS;

    use super::*;
    use crate::error::{MISSING_CREDENTIAL_MESSAGE, PERMISSION_DENIED_MESSAGE};
    use crate::testing::{fixed_clock, FakeChat, FakeImage, ImageLog};

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        dir: tempfile::TempDir,
        chat: Arc<FakeChat>,
        gemini_images: ImageLog,
    }

    impl Harness {
        fn new() -> anyhow::Result<Self> {
            Ok(Self {
                dir: tempfile::tempdir()?,
                chat: Arc::new(FakeChat::default()),
                gemini_images: ImageLog::default(),
            })
        }

        fn config(&self) -> CompanionConfig {
            let mut config = CompanionConfig::new(self.dir.path().join("eve"));
            config.resolver = CredentialResolver::without_environment();
            config.clock = fixed_clock;
            config
        }

        fn with_key(self) -> anyhow::Result<Self> {
            let config = self.config();
            fs::create_dir_all(&config.data_dir)?;
            let mut ring = KeyRing::default();
            ring.add("main", "AIza-test-key")?;
            SettingsStore::new(config.settings_path()).save_key_ring(&ring)?;
            Ok(self)
        }

        fn seed_session(&self, count: usize, last_updated: i64) -> anyhow::Result<()> {
            let config = self.config();
            fs::create_dir_all(&config.data_dir)?;
            let mut session = Session::empty();
            for idx in 0..count {
                let role = if idx % 2 == 0 { Role::User } else { Role::Model };
                session.push(Message::with_id(format!("s{idx}"), role, format!("line {idx}")));
            }
            session.last_updated = last_updated;
            SessionStore::new(config.session_path()).save(&session)?;
            Ok(())
        }

        fn open(&mut self) -> anyhow::Result<Companion> {
            let gemini = FakeImage::rendering("gemini", "data:image/png;base64,AAAA");
            self.gemini_images = gemini.log();
            let mut images = ImageBackendRegistry::new();
            images.register(gemini);
            let chat: Arc<dyn ChatBackend> = self.chat.clone();
            Companion::open(self.config(), Backends { chat, images })
        }

        fn events(&self) -> anyhow::Result<Vec<Value>> {
            let raw = fs::read_to_string(self.config().events_path())?;
            raw.lines()
                .map(|line| serde_json::from_str(line).map_err(anyhow::Error::new))
                .collect()
        }

        fn event_types(&self) -> anyhow::Result<Vec<String>> {
            Ok(self
                .events()?
                .iter()
                .filter_map(|event| event["type"].as_str().map(str::to_string))
                .collect())
        }
    }

    fn user_texts(companion: &Companion) -> Vec<String> {
        companion
            .messages()
            .iter()
            .map(|message| message.text.clone())
            .collect()
    }

    #[test]
    fn first_open_starts_with_a_single_welcome() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        let companion = harness.open()?;

        assert_eq!(companion.messages().len(), 1);
        assert_eq!(companion.messages()[0].id, "welcome");
        assert_eq!(companion.messages()[0].text, "Hello World");
        assert!(companion.memories().is_empty());
        assert!(!companion.is_consolidating());
        assert_eq!(companion.context().state_name(), "absent");
        assert_eq!(companion.context_usage(), 0);

        let stored = SessionStore::new(harness.config().session_path()).load()?;
        assert_eq!(stored.map(|session| session.messages.len()), Some(1));
        assert!(harness.event_types()?.contains(&"session_loaded".to_string()));
        Ok(())
    }

    #[test]
    fn unreadable_session_falls_back_to_fresh_start() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        let config = harness.config();
        fs::create_dir_all(&config.data_dir)?;
        fs::write(config.session_path(), "{not json")?;

        let companion = harness.open()?;
        assert_eq!(companion.messages().len(), 1);
        assert_eq!(companion.messages()[0].id, "welcome_error");
        assert_eq!(companion.messages()[0].text, "Fresh start.");
        assert!(config.data_dir.join("session.json.corrupt").exists());

        let stored = SessionStore::new(config.session_path()).load()?;
        assert_eq!(stored.map(|session| session.messages[0].id.clone()).as_deref(), Some("welcome_error"));
        Ok(())
    }

    #[test]
    fn unreadable_settings_still_accept_new_values() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        let config = harness.config();
        fs::create_dir_all(&config.data_dir)?;
        fs::write(config.settings_path(), "{bad json")?;

        let mut companion = harness.open()?;
        let key = companion.add_key("main", "AIza-test-key")?;
        companion.set_setting("steps", "25")?;
        assert!(config.data_dir.join("settings.json.corrupt").exists());

        let mut stored = SettingsStore::new(config.settings_path());
        assert_eq!(stored.key_ring().active_id, Some(key.id));
        assert_eq!(stored.generation_settings().steps, 25);
        Ok(())
    }

    #[test]
    fn send_without_credential_shows_error_bubble() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        let mut companion = harness.open()?;

        let report = companion.send("hi eve", None);
        let report = report.ok_or_else(|| anyhow::anyhow!("turn was skipped"))?;
        assert!(report.reply.is_error);
        assert_eq!(report.reply.text, MISSING_CREDENTIAL_MESSAGE);
        assert_eq!(report.error, Some(RemoteError::MissingCredential));
        assert_eq!(companion.context().state_name(), "absent");
        assert!(harness.chat.requests().is_empty());
        assert_eq!(companion.messages().len(), 3);
        assert!(harness.event_types()?.contains(&"turn_failed".to_string()));
        Ok(())
    }

    #[test]
    fn empty_turns_are_ignored() -> anyhow::Result<()> {
        let mut harness = Harness::new()?.with_key()?;
        let mut companion = harness.open()?;
        assert_eq!(companion.send("   ", None), None);
        assert_eq!(companion.send("", Some(" ".to_string())), None);
        assert_eq!(companion.messages().len(), 1);
        Ok(())
    }

    #[test]
    fn open_binds_context_with_away_note() -> anyhow::Result<()> {
        let mut harness = Harness::new()?.with_key()?;
        harness.seed_session(4, now_millis() - 2 * 60 * 60 * 1000)?;
        let companion = harness.open()?;

        let bound = companion
            .context()
            .bound()
            .ok_or_else(|| anyhow::anyhow!("context not bound"))?;
        assert!(bound
            .system_instruction
            .contains("(User returned after 2 hours and 0 minutes)"));
        assert_eq!(bound.history.len(), 4);

        let events = harness.events()?;
        let bound_event = events
            .iter()
            .find(|event| event["type"] == "context_bound")
            .ok_or_else(|| anyhow::anyhow!("missing context_bound"))?;
        assert_eq!(bound_event["credential_source"], "active_key");
        assert!(!bound_event.to_string().contains("AIza-test-key"));
        Ok(())
    }

    #[test]
    fn reply_with_directive_resolves_image_in_background() -> anyhow::Result<()> {
        let mut harness = Harness::new()?.with_key()?;
        harness.chat.push(Ok("Look outside. [SCENE: rain on the window]".to_string()));
        harness.chat.push(Ok("soft rain streaking a dark window".to_string()));
        let mut companion = harness.open()?;

        let report = companion
            .send("what's it like there?", None)
            .ok_or_else(|| anyhow::anyhow!("turn was skipped"))?;
        assert_eq!(report.reply.text, "Look outside.");
        assert!(report.visual_pending);
        assert!(report.reply.is_image_loading);

        let updates = companion.wait_background(WAIT);
        assert_eq!(
            updates,
            vec![BackgroundUpdate::ImageReady {
                message_id: report.reply.id.clone(),
                backend: "gemini".to_string(),
            }]
        );
        let patched = companion
            .session()
            .find(&report.reply.id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("reply vanished"))?;
        assert!(!patched.is_image_loading);
        assert_eq!(patched.image.as_deref(), Some("data:image/png;base64,AAAA"));
        assert_eq!(companion.prior_visual(), Some("rain on the window"));
        assert_eq!(
            harness.gemini_images.prompts(),
            vec!["soft rain streaking a dark window, 8k, best quality, masterpiece".to_string()]
        );
        Ok(())
    }

    #[test]
    fn image_generation_disabled_strips_directives_without_rendering() -> anyhow::Result<()> {
        let mut harness = Harness::new()?.with_key()?;
        harness.chat.push(Ok("[SELFIE] Here you go".to_string()));
        let mut companion = harness.open()?;
        companion.set_setting("aiImageGeneration", "false")?;

        let report = companion
            .send("selfie?", None)
            .ok_or_else(|| anyhow::anyhow!("turn was skipped"))?;
        assert_eq!(report.reply.text, "Here you go");
        assert!(!report.visual_pending);
        assert!(!companion.background_in_flight());
        Ok(())
    }

    #[test]
    fn visual_completion_for_wiped_message_is_discarded() -> anyhow::Result<()> {
        let mut harness = Harness::new()?.with_key()?;
        harness.chat.push(Ok("Me, right now. [SELFIE: waving]".to_string()));
        let mut companion = harness.open()?;

        let report = companion
            .send("selfie pls", None)
            .ok_or_else(|| anyhow::anyhow!("turn was skipped"))?;
        companion.wipe();
        let updates = companion.wait_background(WAIT);
        assert_eq!(
            updates,
            vec![BackgroundUpdate::ImageDiscarded {
                message_id: report.reply.id
            }]
        );
        assert_eq!(companion.prior_visual(), None);
        assert_eq!(companion.messages().len(), 1);
        assert_eq!(companion.messages()[0].id, "fresh_start");
        Ok(())
    }

    #[test]
    fn history_past_depth_plus_slack_is_consolidated() -> anyhow::Result<()> {
        let mut harness = Harness::new()?.with_key()?;
        harness.seed_session(29, now_millis())?;
        harness.chat.push(Ok("sure".to_string()));
        harness.chat.push(Ok("I remember our first chat and it made me feel seen.".to_string()));
        harness.chat.push(Ok("still here".to_string()));
        let mut companion = harness.open()?;
        assert!(!companion.is_consolidating());

        companion.send("hey", None);
        assert_eq!(companion.messages().len(), 31);
        assert!(companion.is_consolidating());

        let updates = companion.wait_background(WAIT);
        assert!(matches!(
            updates.as_slice(),
            [BackgroundUpdate::Consolidation(ConsolidationOutcome::Applied { pruned: 10, .. })]
        ));
        assert_eq!(companion.messages().len(), 21);
        assert_eq!(companion.messages()[0].id, "s10");
        assert_eq!(
            companion.memories(),
            &["I remember our first chat and it made me feel seen.".to_string()]
        );

        let stored = SessionStore::new(harness.config().session_path())
            .load()?
            .ok_or_else(|| anyhow::anyhow!("session not saved"))?;
        assert_eq!(stored.messages.len(), 21);
        assert_eq!(stored.memories.len(), 1);

        let next = companion.send("remember me?", None);
        assert!(next.is_some());
        let requests = harness.chat.requests();
        let (_, last) = requests
            .last()
            .ok_or_else(|| anyhow::anyhow!("no request sent"))?;
        assert!(last
            .system_instruction
            .as_deref()
            .unwrap_or("")
            .contains("• I remember our first chat and it made me feel seen."));
        Ok(())
    }

    #[test]
    fn consolidation_failure_keeps_history() -> anyhow::Result<()> {
        let mut harness = Harness::new()?.with_key()?;
        harness.seed_session(31, now_millis())?;
        harness.chat.push(Err(RemoteError::PermissionDenied("billing".to_string())));
        let mut companion = harness.open()?;
        assert!(companion.is_consolidating());

        let updates = companion.wait_background(WAIT);
        assert!(matches!(
            updates.as_slice(),
            [BackgroundUpdate::Consolidation(ConsolidationOutcome::Failed(_))]
        ));
        assert_eq!(companion.messages().len(), 31);
        assert!(companion.memories().is_empty());
        assert!(harness.event_types()?.contains(&"consolidation_failed".to_string()));
        Ok(())
    }

    #[test]
    fn language_switch_on_pristine_session_resets_silently() -> anyhow::Result<()> {
        let mut harness = Harness::new()?.with_key()?;
        let mut companion = harness.open()?;

        let change = companion.request_language(Language::Manglish)?;
        assert_eq!(change, LanguageChange::Applied(Language::Manglish));
        assert_eq!(companion.pending_action(), None);
        assert_eq!(companion.messages().len(), 1);
        assert_eq!(companion.messages()[0].id, "reset");
        assert_eq!(companion.messages()[0].text, "Enthaanu... നമുക്ക് ഒന്നൂടെ തുടങ്ങാം.");
        assert_eq!(
            companion.context().bound().map(|bound| bound.language),
            Some(Language::Manglish)
        );
        assert_eq!(
            SettingsStore::new(harness.config().settings_path()).language(),
            Language::Manglish
        );
        assert_eq!(
            companion.request_language(Language::Manglish)?,
            LanguageChange::Unchanged
        );
        Ok(())
    }

    #[test]
    fn language_switch_with_history_needs_confirmation() -> anyhow::Result<()> {
        let mut harness = Harness::new()?.with_key()?;
        harness.chat.push(Ok("hey you".to_string()));
        let mut companion = harness.open()?;
        companion.send("hi", None);

        let change = companion.request_language(Language::Manglish)?;
        assert_eq!(change, LanguageChange::NeedsConfirmation(Language::Manglish));
        assert_eq!(companion.language(), Language::English);
        assert_eq!(companion.cancel(), Some(PendingAction::Language(Language::Manglish)));
        assert_eq!(companion.confirm()?, Confirmation::NothingPending);

        companion.request_language(Language::Manglish)?;
        assert_eq!(companion.confirm()?, Confirmation::Language(Language::Manglish));
        assert_eq!(companion.language(), Language::Manglish);
        assert_eq!(user_texts(&companion), vec!["Hello World", "hi", "hey you"]);
        let bound = companion
            .context()
            .bound()
            .ok_or_else(|| anyhow::anyhow!("context not rebound"))?;
        assert_eq!(bound.language, Language::Manglish);
        assert!(bound.system_instruction.contains("[Samayam:"));
        Ok(())
    }

    #[test]
    fn wipe_requires_confirmation_and_clears_memories() -> anyhow::Result<()> {
        let mut harness = Harness::new()?.with_key()?;
        harness.chat.push(Ok("noted".to_string()));
        let mut companion = harness.open()?;
        companion.send("remember this", None);

        companion.request_wipe();
        assert_eq!(companion.messages().len(), 3);
        assert_eq!(companion.confirm()?, Confirmation::Wiped);
        assert_eq!(user_texts(&companion), vec!["Let's start a new chapter."]);
        assert!(companion.memories().is_empty());

        let stored = SessionStore::new(harness.config().session_path())
            .load()?
            .ok_or_else(|| anyhow::anyhow!("session not saved"))?;
        assert_eq!(stored.messages[0].id, "fresh_start");
        assert!(harness.event_types()?.contains(&"memory_wiped".to_string()));
        Ok(())
    }

    #[test]
    fn low_step_count_is_saved_at_floor() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        let mut companion = harness.open()?;
        assert_eq!(companion.set_setting("steps", "5")?, "steps");
        assert_eq!(companion.settings().steps, MIN_STEPS);
        assert_eq!(
            SettingsStore::new(harness.config().settings_path())
                .generation_settings()
                .steps,
            MIN_STEPS
        );
        companion.reset_setting("steps")?;
        assert_eq!(companion.settings().steps, 30);
        Ok(())
    }

    #[test]
    fn unknown_model_is_accepted_with_warning() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        let mut companion = harness.open()?;
        assert_eq!(companion.set_model("gemini-2.5-flash")?, None);
        let warning = companion.set_model("gemini-experimental")?;
        assert!(warning.unwrap_or_default().contains("not in the chat catalog"));
        assert_eq!(companion.settings().chat_model, "gemini-experimental");
        assert!(companion.set_model("  ").is_err());
        Ok(())
    }

    #[test]
    fn first_key_becomes_active_and_binds_context() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        let mut companion = harness.open()?;
        assert!(!companion.context().is_bound());

        let first = companion.add_key("main", "AIza-one")?;
        let second = companion.add_key("spare", "AIza-two")?;
        assert_eq!(companion.key_ring().active_id.as_deref(), Some(first.id.as_str()));
        assert!(companion.context().is_bound());

        companion.use_key(&second.id)?;
        assert_eq!(companion.key_ring().active_id.as_deref(), Some(second.id.as_str()));
        assert!(companion.use_key("missing").is_err());

        companion.remove_key(&second.id)?;
        assert!(companion.key_ring().active().is_none());
        assert_eq!(companion.context().state_name(), "invalid");
        Ok(())
    }

    #[test]
    fn key_test_reports_valid_and_invalid() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        harness.chat.push(Ok("ok".to_string()));
        harness.chat.push(Err(RemoteError::PermissionDenied("denied".to_string())));
        let mut companion = harness.open()?;
        let key = companion.add_key("main", "AIza-one")?;

        assert_eq!(companion.test_key(&key.id)?, KeyTest::Valid);
        assert_eq!(
            companion.test_key(&key.id)?,
            KeyTest::Invalid(PERMISSION_DENIED_MESSAGE.to_string())
        );
        let requests = harness.chat.requests();
        assert_eq!(requests[0].0, "AIza-one");
        assert_eq!(requests[0].1.model, KEY_TEST_MODEL);
        assert!(companion.test_key("missing").is_err());
        Ok(())
    }

    #[test]
    fn endpoint_is_trimmed_and_blank_clears() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        let mut companion = harness.open()?;
        assert_eq!(
            companion.set_endpoint("  owner/space  ")?.as_deref(),
            Some("owner/space")
        );
        assert_eq!(companion.endpoint(), Some("owner/space"));
        assert_eq!(companion.set_endpoint("   ")?, None);
        assert_eq!(companion.endpoint(), None);
        Ok(())
    }

    #[test]
    fn context_usage_counts_window_chars_and_images() -> anyhow::Result<()> {
        let mut harness = Harness::new()?;
        harness.seed_session(2, now_millis())?;
        let mut companion = harness.open()?;
        // "line 0" + "line 1" = 12 chars -> 3 tokens.
        assert_eq!(companion.context_usage(), 3);

        companion.send("", Some("data:image/png;base64,AAAA".to_string()));
        // The error bubble adds its text; the user turn adds one image.
        let expected_chars = 12 + MISSING_CREDENTIAL_MESSAGE.chars().count();
        let expected = (expected_chars as f64 / 4.0).round() as usize + IMAGE_TOKEN_COST;
        assert_eq!(companion.context_usage(), expected);
        Ok(())
    }
}
