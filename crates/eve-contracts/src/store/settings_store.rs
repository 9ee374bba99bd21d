use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::Value;

use super::KvStore;
use crate::settings::{ApiKeyDef, GenerationSettings, KeyRing, Language};

pub const API_KEYS_KEY: &str = "eve_api_keys";
pub const ACTIVE_KEY_ID_KEY: &str = "eve_active_key_id";
pub const ENDPOINT_KEY: &str = "eve_gradio_url";
pub const GEN_SETTINGS_KEY: &str = "eve_gen_settings";
pub const LANGUAGE_KEY: &str = "eve_language";

/// Typed accessors over the flat settings file.
///
/// Reads are lenient: a missing or malformed value yields its default.
/// Writes normalise before persisting.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    kv: KvStore,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            kv: KvStore::new(path),
        }
    }

    pub fn generation_settings(&mut self) -> GenerationSettings {
        match self.read(GEN_SETTINGS_KEY) {
            Some(value) => GenerationSettings::from_stored(&value),
            None => GenerationSettings::default(),
        }
    }

    pub fn save_generation_settings(&mut self, settings: &GenerationSettings) -> Result<()> {
        let value = serde_json::to_value(settings.clone().normalized())?;
        self.kv
            .put(GEN_SETTINGS_KEY, value)
            .context("failed to save generation settings")
    }

    pub fn language(&mut self) -> Language {
        self.read(LANGUAGE_KEY)
            .as_ref()
            .and_then(Value::as_str)
            .and_then(Language::parse)
            .unwrap_or_default()
    }

    pub fn save_language(&mut self, language: Language) -> Result<()> {
        self.kv
            .put(LANGUAGE_KEY, Value::String(language.as_str().to_string()))
            .context("failed to save language")
    }

    pub fn endpoint(&mut self) -> Option<String> {
        self.read(ENDPOINT_KEY)
            .as_ref()
            .and_then(Value::as_str)
            .and_then(normalize_endpoint)
    }

    /// Stores the trimmed endpoint; blank input clears it.
    pub fn save_endpoint(&mut self, endpoint: &str) -> Result<Option<String>> {
        let normalized = normalize_endpoint(endpoint);
        let written = match &normalized {
            Some(value) => self.kv.put(ENDPOINT_KEY, Value::String(value.clone())),
            None => self.kv.delete(ENDPOINT_KEY),
        };
        written.context("failed to save image endpoint")?;
        Ok(normalized)
    }

    pub fn key_ring(&mut self) -> KeyRing {
        let keys: Vec<ApiKeyDef> = self
            .read(API_KEYS_KEY)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        let active_id = self
            .read(ACTIVE_KEY_ID_KEY)
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|id| !id.is_empty());
        KeyRing::new(keys, active_id)
    }

    pub fn save_key_ring(&mut self, ring: &KeyRing) -> Result<()> {
        self.kv
            .put(API_KEYS_KEY, serde_json::to_value(&ring.keys)?)
            .context("failed to save API keys")?;
        let written = match &ring.active_id {
            Some(id) => self.kv.put(ACTIVE_KEY_ID_KEY, Value::String(id.clone())),
            None => self.kv.delete(ACTIVE_KEY_ID_KEY),
        };
        written.context("failed to save active key")
    }

    fn read(&mut self, key: &str) -> Option<Value> {
        match self.kv.get(key) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key, error = %format!("{err:#}"), "settings read failed; using default");
                None
            }
        }
    }
}

pub fn normalize_endpoint(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
