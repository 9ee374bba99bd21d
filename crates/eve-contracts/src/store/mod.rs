mod kv_store;
mod session_store;
mod settings_store;

pub use kv_store::KvStore;
pub use session_store::{SessionStore, SESSION_KEY};
pub use settings_store::{
    normalize_endpoint, SettingsStore, ACTIVE_KEY_ID_KEY, API_KEYS_KEY, ENDPOINT_KEY,
    GEN_SETTINGS_KEY, LANGUAGE_KEY,
};
