//! Long-term memory consolidation.
//!
//! Once the stored history outgrows the window by more than the slack, the
//! oldest batch is summarized off-thread into one first-person memory. The
//! completion is applied only while the session still starts with the same
//! message ids.

use std::sync::mpsc;
use std::sync::Arc;

use eve_contracts::chat::user_turn;
use eve_contracts::session::{Session, CONSOLIDATION_BATCH};
use eve_contracts::settings::{GenerationSettings, Language};

use crate::background::{spawn_worker, Completion};
use crate::backend::{ChatBackend, ChatRequest, SamplingConfig};
use crate::error::RemoteError;
use crate::persona;

pub const SUMMARY_TEMPERATURE: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidationJob {
    pub message_ids: Vec<String>,
    pub request: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidationCompletion {
    pub message_ids: Vec<String>,
    pub result: Result<String, RemoteError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsolidationStart {
    NotDue,
    InFlight,
    NoCredential,
    Started { batch: usize },
    SpawnFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsolidationOutcome {
    Applied { summary: String, pruned: usize },
    Stale,
    Failed(String),
}

pub struct MemoryConsolidator {
    backend: Arc<dyn ChatBackend>,
    in_flight: bool,
}

impl MemoryConsolidator {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            in_flight: false,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Builds the summary job when the session is due, `None` otherwise.
    pub fn plan(
        session: &Session,
        settings: &GenerationSettings,
        language: Language,
    ) -> Option<ConsolidationJob> {
        if !session.consolidation_due(settings.history_depth) {
            return None;
        }
        let batch = session.oldest(CONSOLIDATION_BATCH);
        Some(ConsolidationJob {
            message_ids: batch.iter().map(|message| message.id.clone()).collect(),
            request: persona::summary_request(language, batch),
            model: settings.chat_model.clone(),
        })
    }

    /// Starts a background summary if one is due and none is running.
    pub fn maybe_consolidate(
        &mut self,
        session: &Session,
        settings: &GenerationSettings,
        language: Language,
        api_key: Option<&str>,
        sender: &mpsc::Sender<Completion>,
    ) -> ConsolidationStart {
        if self.in_flight {
            return ConsolidationStart::InFlight;
        }
        let Some(job) = Self::plan(session, settings, language) else {
            return ConsolidationStart::NotDue;
        };
        let Some(api_key) = api_key.map(str::to_string) else {
            return ConsolidationStart::NoCredential;
        };

        let batch = job.message_ids.len();
        let backend = Arc::clone(&self.backend);
        let message_ids = job.message_ids.clone();
        let spawned = spawn_worker(
            "eve-consolidator",
            sender.clone(),
            move || {
                let result = summarize(backend.as_ref(), &api_key, &job);
                Completion::Consolidation(ConsolidationCompletion {
                    message_ids: job.message_ids,
                    result,
                })
            },
            move |err| {
                Completion::Consolidation(ConsolidationCompletion {
                    message_ids,
                    result: Err(err),
                })
            },
        );
        match spawned {
            Ok(()) => {
                self.in_flight = true;
                ConsolidationStart::Started { batch }
            }
            Err(err) => ConsolidationStart::SpawnFailed(format!("{err:#}")),
        }
    }

    /// Applies a finished summary and clears the in-flight flag.
    pub fn apply(
        &mut self,
        session: &mut Session,
        completion: ConsolidationCompletion,
    ) -> ConsolidationOutcome {
        self.in_flight = false;
        let summary = match completion.result {
            Ok(summary) => summary,
            Err(err) => return ConsolidationOutcome::Failed(err.to_string()),
        };
        if session.apply_consolidation(&completion.message_ids, &summary) {
            ConsolidationOutcome::Applied {
                summary: summary.trim().to_string(),
                pruned: completion.message_ids.len(),
            }
        } else {
            ConsolidationOutcome::Stale
        }
    }
}

pub fn summarize(
    backend: &dyn ChatBackend,
    api_key: &str,
    job: &ConsolidationJob,
) -> Result<String, RemoteError> {
    let contents = user_turn(&job.request, None).into_iter().collect();
    let request = ChatRequest {
        model: job.model.clone(),
        system_instruction: None,
        contents,
        sampling: SamplingConfig::fixed(SUMMARY_TEMPERATURE),
    };
    let summary = backend.generate_text(api_key, &request)?;
    let summary = summary.trim();
    if summary.is_empty() {
        return Err(RemoteError::EmptyResponse);
    }
    Ok(summary.to_string())
}
