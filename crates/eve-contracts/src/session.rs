use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::settings::Language;

/// Maximum number of long-term memories kept on a session.
pub const MEMORY_CAP: usize = 15;
/// Number of oldest messages folded into one memory per consolidation.
pub const CONSOLIDATION_BATCH: usize = 10;
/// Messages tolerated beyond the history depth before consolidation kicks in.
pub const CONSOLIDATION_SLACK: usize = 10;

static LAST_MESSAGE_ID: AtomicI64 = AtomicI64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_image_loading: bool,
}

impl Message {
    pub fn with_id(id: impl Into<String>, role: Role, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            text: text.into(),
            image: None,
            is_error: false,
            is_image_loading: false,
        }
    }

    pub fn user(text: impl Into<String>, image: Option<String>) -> Self {
        let mut message = Self::with_id(next_message_id(), Role::User, text);
        message.image = image;
        message
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::with_id(next_message_id(), Role::Model, text)
    }

    pub fn model_error(text: impl Into<String>) -> Self {
        let mut message = Self::model(text);
        message.is_error = true;
        message
    }

    pub fn image_pending(mut self) -> Self {
        self.is_image_loading = true;
        self
    }
}

/// Canned model-side messages that open a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    Welcome,
    LoadFailed,
    Reset,
    FreshStart,
}

impl Greeting {
    pub fn id(self) -> &'static str {
        match self {
            Greeting::Welcome => "welcome",
            Greeting::LoadFailed => "welcome_error",
            Greeting::Reset => "reset",
            Greeting::FreshStart => "fresh_start",
        }
    }

    pub fn text(self, language: Language) -> &'static str {
        match (self, language) {
            (Greeting::Welcome, Language::English) => "Hello World",
            (Greeting::Welcome, Language::Manglish) => "Hey, enthaanu വിശേഷം?",
            (Greeting::LoadFailed, _) => "Fresh start.",
            (Greeting::Reset, Language::English) => "Okay, let's start over.",
            (Greeting::Reset, Language::Manglish) => "Enthaanu... നമുക്ക് ഒന്നൂടെ തുടങ്ങാം.",
            (Greeting::FreshStart, Language::English) => "Let's start a new chapter.",
            (Greeting::FreshStart, Language::Manglish) => "Namukku puthiyathayi thudangaam.",
        }
    }

    pub fn message(self, language: Language) -> Message {
        Message::with_id(self.id(), Role::Model, self.text(language))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub memories: Vec<String>,
    #[serde(default = "now_millis")]
    pub last_updated: i64,
}

impl Session {
    pub fn empty() -> Self {
        Self {
            messages: Vec::new(),
            memories: Vec::new(),
            last_updated: now_millis(),
        }
    }

    /// A session holding nothing but the given greeting.
    pub fn greeted(greeting: Greeting, language: Language) -> Self {
        let mut session = Self::empty();
        session.messages.push(greeting.message(language));
        session
    }

    /// True while the conversation has not meaningfully started.
    pub fn is_pristine(&self) -> bool {
        self.messages.len() <= 1
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn find(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    /// Resolves a deferred visual. Returns false when the message is gone.
    pub fn patch_image(&mut self, id: &str, image: Option<String>) -> bool {
        let Some(message) = self.messages.iter_mut().find(|message| message.id == id) else {
            return false;
        };
        if image.is_some() {
            message.image = image;
        }
        message.is_image_loading = false;
        true
    }

    pub fn consolidation_due(&self, history_depth: usize) -> bool {
        self.messages.len() > history_depth + CONSOLIDATION_SLACK
    }

    pub fn oldest(&self, count: usize) -> &[Message] {
        &self.messages[..count.min(self.messages.len())]
    }

    /// Folds `summary` into memory and drops the summarized messages, but only
    /// if the session still starts with exactly those ids.
    pub fn apply_consolidation(&mut self, summarized_ids: &[String], summary: &str) -> bool {
        let summary = summary.trim();
        if summary.is_empty() || summarized_ids.is_empty() {
            return false;
        }
        if self.messages.len() < summarized_ids.len() {
            return false;
        }
        let still_oldest = self
            .messages
            .iter()
            .zip(summarized_ids)
            .all(|(message, id)| &message.id == id);
        if !still_oldest {
            return false;
        }
        self.remember(summary);
        self.messages.drain(..summarized_ids.len());
        true
    }

    /// Prepends a memory, keeping the most recent `MEMORY_CAP`.
    pub fn remember(&mut self, summary: &str) {
        self.memories.insert(0, summary.to_string());
        self.memories.truncate(MEMORY_CAP);
    }

    pub fn touch(&mut self) {
        self.last_updated = now_millis();
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Millisecond ids, bumped when two messages land in the same millisecond.
pub fn next_message_id() -> String {
    let now = now_millis();
    let mut last = LAST_MESSAGE_ID.load(Ordering::Relaxed);
    loop {
        let candidate = if now > last { now } else { last + 1 };
        match LAST_MESSAGE_ID.compare_exchange(last, candidate, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => return candidate.to_string(),
            Err(actual) => last = actual,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}
