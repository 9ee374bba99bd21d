use std::env;

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Joins the distinct messages of an error chain, outermost first.
pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for text in err.chain().map(|cause| cause.to_string()) {
        let text = text.trim();
        if !text.is_empty() && parts.last().map(String::as_str) != Some(text) {
            parts.push(text.to_string());
        }
    }
    let joined = if parts.is_empty() {
        err.to_string()
    } else {
        parts.join(" | caused by: ")
    };
    truncate_text(&joined, max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn map_object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    value.as_object().cloned().unwrap_or_default()
}
