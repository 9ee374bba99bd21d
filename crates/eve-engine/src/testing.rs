use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, NaiveDateTime};

use crate::backend::{ChatBackend, ChatRequest, ImageBackend, ImageRequest};
use crate::error::RemoteError;

/// Wednesday, October 14, 2026, 07:05 PM.
pub(crate) fn fixed_clock() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 10, 14)
        .and_then(|date| date.and_hms_opt(19, 5, 0))
        .unwrap_or_default()
}

/// Chat backend that plays back scripted results and records every call.
#[derive(Default)]
pub(crate) struct FakeChat {
    script: Mutex<VecDeque<Result<String, RemoteError>>>,
    requests: Mutex<Vec<(String, ChatRequest)>>,
}

impl FakeChat {
    pub(crate) fn scripted(script: Vec<Result<String, RemoteError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::default(),
        }
    }

    pub(crate) fn replying<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::scripted(replies.into_iter().map(|reply| Ok(reply.into())).collect())
    }

    pub(crate) fn push(&self, result: Result<String, RemoteError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(result);
        }
    }

    pub(crate) fn requests(&self) -> Vec<(String, ChatRequest)> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl ChatBackend for FakeChat {
    fn name(&self) -> &str {
        "fake"
    }

    fn generate_text(&self, api_key: &str, request: &ChatRequest) -> Result<String, RemoteError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((api_key.to_string(), request.clone()));
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| Err(RemoteError::Transport("script exhausted".to_string())))
    }
}

/// Chat backend whose every call panics.
pub(crate) struct PanickingChat;

impl ChatBackend for PanickingChat {
    fn name(&self) -> &str {
        "panicking"
    }

    fn generate_text(&self, _api_key: &str, _request: &ChatRequest) -> Result<String, RemoteError> {
        panic!("chat backend blew up")
    }
}

#[derive(Clone, Default)]
pub(crate) struct ImageLog(Arc<Mutex<Vec<ImageRequest>>>);

impl ImageLog {
    pub(crate) fn len(&self) -> usize {
        self.0.lock().map(|log| log.len()).unwrap_or_default()
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.0
            .lock()
            .map(|log| log.iter().map(|request| request.prompt.clone()).collect())
            .unwrap_or_default()
    }
}

/// Image backend with a fixed outcome.
pub(crate) struct FakeImage {
    name: String,
    outcome: Result<String, RemoteError>,
    log: ImageLog,
}

impl FakeImage {
    pub(crate) fn rendering(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            outcome: Ok(image.to_string()),
            log: ImageLog::default(),
        }
    }

    pub(crate) fn failing(name: &str, err: RemoteError) -> Self {
        Self {
            name: name.to_string(),
            outcome: Err(err),
            log: ImageLog::default(),
        }
    }

    pub(crate) fn log(&self) -> ImageLog {
        self.log.clone()
    }
}

impl ImageBackend for FakeImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn render(&self, _api_key: Option<&str>, request: &ImageRequest) -> Result<String, RemoteError> {
        if let Ok(mut log) = self.log.0.lock() {
            log.push(request.clone());
        }
        self.outcome.clone()
    }
}
