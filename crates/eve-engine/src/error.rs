//! Failure taxonomy for calls to the remote services.

use thiserror::Error;

pub const MISSING_CREDENTIAL_MESSAGE: &str =
    "Connection failed. Please check your API key and billing status.";
pub const PERMISSION_DENIED_MESSAGE: &str =
    "Access denied. Your API key might not have permission for this model, or billing is required.";
pub const RATE_LIMITED_MESSAGE: &str =
    "Too many messages. Please wait a moment before sending again.";
pub const MODEL_NOT_FOUND_MESSAGE: &str =
    "Model not found. Please try a different chat model in settings.";
pub const TRANSPORT_MESSAGE: &str = "Signal lost. The connection to Gemini was interrupted.";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Neither the key ring nor the environment supplied a key
    #[error("no API key available")]
    MissingCredential,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("model not found: {model}")]
    ModelNotFound { model: String },

    #[error("transport failure: {0}")]
    Transport(String),

    /// The call succeeded but carried nothing usable
    #[error("remote returned no usable content")]
    EmptyResponse,
}

impl RemoteError {
    /// Classifies a non-success HTTP reply.
    pub fn from_status(status: u16, body: &str, model: &str) -> Self {
        let detail = extract_error_message(body);
        if status == 403 || detail.to_ascii_lowercase().contains("permission") {
            return Self::PermissionDenied(detail);
        }
        match status {
            429 => Self::RateLimited(detail),
            404 => Self::ModelNotFound {
                model: model.to_string(),
            },
            _ => Self::Transport(format!("HTTP {status}: {detail}")),
        }
    }

    /// Text presented to the user in place of a reply.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::MissingCredential => MISSING_CREDENTIAL_MESSAGE,
            Self::PermissionDenied(_) => PERMISSION_DENIED_MESSAGE,
            Self::RateLimited(_) => RATE_LIMITED_MESSAGE,
            Self::ModelNotFound { .. } => MODEL_NOT_FOUND_MESSAGE,
            Self::Transport(_) | Self::EmptyResponse => TRANSPORT_MESSAGE,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::PermissionDenied(_) => "permission_denied",
            Self::RateLimited(_) => "rate_limited",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::Transport(_) => "transport",
            Self::EmptyResponse => "empty_response",
        }
    }
}

/// Pulls `error.status` / `error.message` out of a Google-style error body.
fn extract_error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let error = parsed.as_ref().and_then(|value| value.get("error"));
    let message = error
        .and_then(|error| error.get("message"))
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let status = error
        .and_then(|error| error.get("status"))
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty());
    match (status, message) {
        (Some(status), Some(message)) => format!("{status}: {message}"),
        (None, Some(message)) => message.to_string(),
        _ => crate::util::truncate_text(body.trim(), 512),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses_like_the_chat_surface_expects() {
        let forbidden = RemoteError::from_status(403, "{}", "gemini-3-pro-preview");
        assert_eq!(forbidden.user_message(), PERMISSION_DENIED_MESSAGE);

        let body = r#"{"error":{"code":400,"message":"Caller lacks permission","status":"FAILED_PRECONDITION"}}"#;
        assert!(matches!(
            RemoteError::from_status(400, body, "m"),
            RemoteError::PermissionDenied(detail) if detail == "FAILED_PRECONDITION: Caller lacks permission"
        ));

        assert_eq!(
            RemoteError::from_status(429, "quota", "m").user_message(),
            RATE_LIMITED_MESSAGE
        );
        assert_eq!(
            RemoteError::from_status(404, "", "gemini-9"),
            RemoteError::ModelNotFound {
                model: "gemini-9".to_string()
            }
        );
        let other = RemoteError::from_status(500, "boom", "m");
        assert_eq!(other, RemoteError::Transport("HTTP 500: boom".to_string()));
        assert_eq!(other.user_message(), TRANSPORT_MESSAGE);
    }

    #[test]
    fn missing_credential_has_its_own_message() {
        assert_eq!(
            RemoteError::MissingCredential.user_message(),
            MISSING_CREDENTIAL_MESSAGE
        );
        assert_eq!(RemoteError::EmptyResponse.kind(), "empty_response");
    }
}
