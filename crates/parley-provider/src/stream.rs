use crate::provider::ProviderError;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

/// One unit pushed by a transport. Everything except `TextDelta`, `Usage`
/// and `Done` is an auxiliary push the shell may render separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental answer text.
    TextDelta(String),
    /// The backend is searching the web for this query.
    SearchQuery(String),
    SearchResults(Vec<SearchResult>),
    /// Status line such as "Generating answers for you...".
    Progress(String),
    /// The backend acknowledged an attached image.
    AttachmentEcho { url: String },
    /// Follow-up prompts suggested by the backend.
    Suggestions(Vec<String>),
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    /// End of turn.
    Done,
}

impl StreamEvent {
    pub fn is_auxiliary(&self) -> bool {
        !matches!(
            self,
            StreamEvent::TextDelta(_) | StreamEvent::Usage { .. } | StreamEvent::Done
        )
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            StreamEvent::TextDelta(text) => Some(text),
            _ => None,
        }
    }
}

pub type StreamResult = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;
