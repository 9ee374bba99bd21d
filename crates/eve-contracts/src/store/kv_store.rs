use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

/// Flat JSON-object file with per-key writes.
///
/// Every read refreshes from disk. A write only merges the keys this instance
/// touched into whatever is on disk at flush time, so two stores sharing a
/// file do not clobber each other's keys.
#[derive(Debug, Clone)]
pub struct KvStore {
    path: PathBuf,
    payload: Map<String, Value>,
    dirty_keys: Vec<String>,
    removed_keys: Vec<String>,
}

impl KvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: Map::new(),
            dirty_keys: Vec::new(),
            removed_keys: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Value>> {
        self.refresh()?;
        Ok(self.payload.get(key).cloned())
    }

    pub fn put(&mut self, key: &str, value: Value) -> Result<()> {
        self.refresh_for_write()?;
        if self.payload.get(key) == Some(&value) {
            return Ok(());
        }
        self.payload.insert(key.to_string(), value);
        self.removed_keys.retain(|item| item != key);
        if !self.dirty_keys.iter().any(|item| item == key) {
            self.dirty_keys.push(key.to_string());
        }
        self.flush()
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.refresh_for_write()?;
        if self.payload.remove(key).is_none() {
            return Ok(());
        }
        self.dirty_keys.retain(|item| item != key);
        if !self.removed_keys.iter().any(|item| item == key) {
            self.removed_keys.push(key.to_string());
        }
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.dirty_keys.is_empty() && self.removed_keys.is_empty() {
            return Ok(());
        }

        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        for key in &self.dirty_keys {
            if let Some(value) = self.payload.get(key) {
                on_disk.insert(key.clone(), value.clone());
            }
        }
        for key in &self.removed_keys {
            on_disk.remove(key);
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = on_disk;
        self.dirty_keys.clear();
        self.removed_keys.clear();
        Ok(())
    }

    fn refresh(&mut self) -> Result<()> {
        self.payload = read_json_object(&self.path)?;
        Ok(())
    }

    /// Writes start over from an empty object when the file is unreadable.
    /// The bad file is kept beside it as `<name>.corrupt`.
    fn refresh_for_write(&mut self) -> Result<()> {
        match read_json_object(&self.path) {
            Ok(payload) => self.payload = payload,
            Err(err) => {
                let aside = corrupt_path(&self.path);
                tracing::warn!(
                    path = %self.path.display(),
                    error = %format!("{err:#}"),
                    "unreadable store moved aside before write"
                );
                std::fs::rename(&self.path, &aside).with_context(|| {
                    format!("failed to move {} aside", self.path.display())
                })?;
                self.payload = Map::new();
            }
        }
        Ok(())
    }
}

/// A missing file reads as an empty object; anything unparsable is an error.
fn read_json_object(path: &Path) -> Result<Map<String, Value>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    match parsed {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("{} does not hold a JSON object", path.display()),
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".corrupt");
    path.with_file_name(name)
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )
    .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
