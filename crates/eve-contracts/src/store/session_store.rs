use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::Value;

use super::KvStore;
use crate::session::Session;

/// Key of the one session record an installation keeps.
pub const SESSION_KEY: &str = "global_session";

#[derive(Debug, Clone)]
pub struct SessionStore {
    kv: KvStore,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            kv: KvStore::new(path),
        }
    }

    /// `Ok(None)` when nothing was stored yet; `Err` when the record exists
    /// but cannot be read.
    pub fn load(&mut self) -> Result<Option<Session>> {
        let Some(value) = self.kv.get(SESSION_KEY)? else {
            return Ok(None);
        };
        let session: Session =
            serde_json::from_value(value).context("stored session is malformed")?;
        Ok(Some(session))
    }

    /// Full overwrite of the stored record.
    pub fn save(&mut self, session: &Session) -> Result<()> {
        let mut record = serde_json::to_value(session)?;
        if let Value::Object(map) = &mut record {
            map.insert("id".to_string(), Value::String(SESSION_KEY.to_string()));
        }
        self.kv
            .put(SESSION_KEY, record)
            .context("failed to save session")
    }

    pub fn clear(&mut self) -> Result<()> {
        self.kv.delete(SESSION_KEY).context("failed to clear session")
    }
}
