use std::fmt;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Lowest step count the image backends are ever asked for.
pub const MIN_STEPS: u32 = 20;
pub const DEFAULT_CHAT_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_HISTORY_DEPTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    English,
    Manglish,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Language::English => "english",
            Language::Manglish => "manglish",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Manglish => "Manglish",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "english" | "en" => Some(Language::English),
            "manglish" | "ml" => Some(Language::Manglish),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    pub guidance: f64,
    pub steps: u32,
    pub ip_adapter_strength: f64,
    pub lora_strength: f64,
    pub seed: i64,
    pub randomize_seed: bool,
    pub use_magic: bool,
    pub ai_image_generation: bool,
    pub chat_model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub history_depth: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            guidance: 7.0,
            steps: 30,
            ip_adapter_strength: 0.6,
            lora_strength: 0.45,
            seed: 42,
            randomize_seed: true,
            use_magic: true,
            ai_image_generation: true,
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            temperature: 1.0,
            top_p: 0.95,
            top_k: 40,
            history_depth: DEFAULT_HISTORY_DEPTH,
        }
    }
}

/// Persisted field names, in display order.
pub const SETTING_FIELDS: &[&str] = &[
    "chatModel",
    "temperature",
    "topP",
    "topK",
    "historyDepth",
    "aiImageGeneration",
    "guidance",
    "steps",
    "ipAdapterStrength",
    "loraStrength",
    "seed",
    "randomizeSeed",
    "useMagic",
];

impl GenerationSettings {
    /// Decodes a stored record: unknown or missing fields take their defaults,
    /// and a missing or zero step count loads as the floor.
    pub fn from_stored(value: &Value) -> Self {
        let mut settings: Self = serde_json::from_value(value.clone()).unwrap_or_default();
        let stored_steps = value
            .get("steps")
            .and_then(Value::as_u64)
            .filter(|steps| *steps > 0)
            .map(|steps| steps.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(MIN_STEPS);
        settings.steps = stored_steps;
        settings.normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.steps = self.steps.max(MIN_STEPS);
        if self.history_depth == 0 {
            self.history_depth = DEFAULT_HISTORY_DEPTH;
        }
        if self.chat_model.trim().is_empty() {
            self.chat_model = DEFAULT_CHAT_MODEL.to_string();
        }
        self
    }

    pub fn field_value(&self, field: &str) -> Option<Value> {
        let value = match canonical_field(field)? {
            "guidance" => json!(self.guidance),
            "steps" => json!(self.steps),
            "ipAdapterStrength" => json!(self.ip_adapter_strength),
            "loraStrength" => json!(self.lora_strength),
            "seed" => json!(self.seed),
            "randomizeSeed" => json!(self.randomize_seed),
            "useMagic" => json!(self.use_magic),
            "aiImageGeneration" => json!(self.ai_image_generation),
            "chatModel" => json!(self.chat_model),
            "temperature" => json!(self.temperature),
            "topP" => json!(self.top_p),
            "topK" => json!(self.top_k),
            "historyDepth" => json!(self.history_depth),
            _ => return None,
        };
        Some(value)
    }

    /// Parses `raw` into the named field. Accepts camelCase or snake_case names.
    pub fn set_field(&mut self, field: &str, raw: &str) -> Result<&'static str> {
        let Some(name) = canonical_field(field) else {
            bail!("unknown setting '{field}'");
        };
        let raw = raw.trim();
        match name {
            "guidance" => self.guidance = parse_f64(name, raw)?,
            "steps" => self.steps = parse_u64(name, raw)?.min(u64::from(u32::MAX)) as u32,
            "ipAdapterStrength" => self.ip_adapter_strength = parse_f64(name, raw)?,
            "loraStrength" => self.lora_strength = parse_f64(name, raw)?,
            "seed" => {
                self.seed = raw
                    .parse::<i64>()
                    .with_context(|| format!("{name} expects an integer, got '{raw}'"))?
            }
            "randomizeSeed" => self.randomize_seed = parse_bool(name, raw)?,
            "useMagic" => self.use_magic = parse_bool(name, raw)?,
            "aiImageGeneration" => self.ai_image_generation = parse_bool(name, raw)?,
            "chatModel" => {
                if raw.is_empty() {
                    bail!("chatModel cannot be empty");
                }
                self.chat_model = raw.to_string();
            }
            "temperature" => self.temperature = parse_f64(name, raw)?,
            "topP" => self.top_p = parse_f64(name, raw)?,
            "topK" => self.top_k = parse_u64(name, raw)?.min(u64::from(u32::MAX)) as u32,
            "historyDepth" => {
                let depth = parse_u64(name, raw)?;
                if depth == 0 {
                    bail!("historyDepth must be at least 1");
                }
                self.history_depth = depth as usize;
            }
            _ => bail!("unknown setting '{field}'"),
        }
        Ok(name)
    }

    pub fn reset_field(&mut self, field: &str) -> Result<&'static str> {
        let Some(name) = canonical_field(field) else {
            bail!("unknown setting '{field}'");
        };
        let defaults = Self::default();
        let Some(value) = defaults.field_value(name) else {
            bail!("unknown setting '{field}'");
        };
        let raw = match value {
            Value::String(text) => text,
            other => other.to_string(),
        };
        self.set_field(name, &raw)
    }
}

fn canonical_field(field: &str) -> Option<&'static str> {
    let folded: String = field
        .trim()
        .chars()
        .filter(|ch| *ch != '_' && *ch != '-')
        .map(|ch| ch.to_ascii_lowercase())
        .collect();
    SETTING_FIELDS
        .iter()
        .copied()
        .find(|name| name.to_ascii_lowercase() == folded)
}

fn parse_f64(name: &str, raw: &str) -> Result<f64> {
    let value = raw
        .parse::<f64>()
        .with_context(|| format!("{name} expects a number, got '{raw}'"))?;
    if !value.is_finite() {
        bail!("{name} must be finite");
    }
    Ok(value)
}

fn parse_u64(name: &str, raw: &str) -> Result<u64> {
    raw.parse::<u64>()
        .with_context(|| format!("{name} expects a non-negative integer, got '{raw}'"))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => bail!("{name} expects true/false, got '{raw}'"),
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyDef {
    pub id: String,
    pub label: String,
    pub key: String,
}

impl fmt::Debug for ApiKeyDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyDef")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl ApiKeyDef {
    /// Last four characters, for display.
    pub fn masked(&self) -> String {
        let tail: String = self
            .key
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<char>>()
            .into_iter()
            .rev()
            .collect();
        format!("…{tail}")
    }
}

/// Ordered credentials plus a weak reference to the active one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRing {
    pub keys: Vec<ApiKeyDef>,
    pub active_id: Option<String>,
}

impl KeyRing {
    pub fn new(keys: Vec<ApiKeyDef>, active_id: Option<String>) -> Self {
        Self { keys, active_id }
    }

    /// Adds a key; the first key added becomes active.
    pub fn add(&mut self, label: &str, key: &str) -> Result<ApiKeyDef> {
        let label = label.trim();
        let key = key.trim();
        if label.is_empty() || key.is_empty() {
            bail!("both a label and a key are required");
        }
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        let entry = ApiKeyDef {
            id,
            label: label.to_string(),
            key: key.to_string(),
        };
        self.keys.push(entry.clone());
        if self.keys.len() == 1 {
            self.active_id = Some(entry.id.clone());
        }
        Ok(entry)
    }

    pub fn select(&mut self, id: &str) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        self.active_id = Some(id.to_string());
        true
    }

    /// Removes a key. The active reference is left as-is and simply stops
    /// resolving if it pointed at the removed entry.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.keys.len();
        self.keys.retain(|key| key.id != id);
        self.keys.len() != before
    }

    pub fn get(&self, id: &str) -> Option<&ApiKeyDef> {
        self.keys.iter().find(|key| key.id == id)
    }

    pub fn active(&self) -> Option<&ApiKeyDef> {
        self.active_id.as_deref().and_then(|id| self.get(id))
    }
}
