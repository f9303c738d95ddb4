//! Frame building and parsing for the ChatHub websocket.
//!
//! Every JSON frame is terminated by the ASCII record separator; one websocket
//! text message may carry several frames.

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

use super::conversation::Conversation;
use crate::{ProviderError, SearchResult, StreamEvent, SydneyRequest};

pub const DELIMITER: char = '\u{1e}';

const BASE_OPTIONS: &[&str] = &[
    "nlu_direct_response_filter",
    "deepleo",
    "disable_emoji_spoken_text",
    "responsible_ai_policy_235",
    "enablemm",
    "dv3sugg",
    "iyxapbing",
    "iycapbing",
    "saharagenconv5",
    "eredirecturl",
];

const ALLOWED_MESSAGE_TYPES: &[&str] = &[
    "ActionRequest",
    "Chat",
    "Context",
    "InternalSearchQuery",
    "InternalSearchResult",
    "InternalLoaderMessage",
    "Progress",
    "GenerateContentQuery",
    "SearchQuery",
];

/// Fixed id the service expects on the web-page context message.
const WEBPAGE_CONTEXT_MESSAGE_ID: &str = "discover-web--page-ping-mriduna-----";

pub fn frame(value: &Value) -> String {
    let mut text = value.to_string();
    text.push(DELIMITER);
    text
}

pub fn handshake() -> String {
    frame(&json!({ "protocol": "json", "version": 1 }))
}

pub fn ping() -> String {
    frame(&json!({ "type": 6 }))
}

pub fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.split(DELIMITER).filter(|f| !f.trim().is_empty())
}

/// Canonical tone name for a workspace conversation style.
pub fn tone(conversation_style: &str) -> &'static str {
    match conversation_style.to_ascii_lowercase().as_str() {
        "balanced" => "Balanced",
        "precise" => "Precise",
        _ => "Creative",
    }
}

pub fn options_sets(tone: &str) -> Vec<&'static str> {
    let extra: &[&str] = match tone {
        "Balanced" => &["galileo", "saharagenconv5"],
        "Precise" => &["h3precise", "clgalileo", "gencontentv3"],
        _ => &["h3imaginative", "clgalileo", "gencontentv3"],
    };
    BASE_OPTIONS.iter().chain(extra.iter()).copied().collect()
}

/// Last two characters of the locale, e.g. `en-US` -> `US`.
pub fn region(locale: &str) -> String {
    let chars: Vec<char> = locale.chars().collect();
    if chars.len() < 2 {
        return "US".to_string();
    }
    chars[chars.len() - 2..].iter().collect::<String>().to_uppercase()
}

pub struct InvocationIds<'a> {
    pub message_id: &'a str,
    pub trace_id: &'a str,
    /// `Chat` or `SearchQuery`.
    pub message_type: &'a str,
}

/// The type-4 `chat` invocation that starts a turn.
pub fn chat_invocation(request: &SydneyRequest, conversation: &Conversation, ids: InvocationIds<'_>) -> Value {
    let tone = tone(&request.conversation_style);
    let mut prompt = request.prompt.clone();
    if request.no_search {
        prompt.push_str(" #no_search");
    }

    json!({
        "arguments": [{
            "optionsSets": options_sets(tone),
            "source": "cib",
            "allowedMessageTypes": ALLOWED_MESSAGE_TYPES,
            "sliceIds": [],
            "verbosity": "verbose",
            "scenario": "SERP",
            "traceId": ids.trace_id,
            "requestId": ids.message_id,
            "isStartOfSession": true,
            "message": {
                "locale": request.locale,
                "market": request.locale,
                "region": region(&request.locale),
                "author": "user",
                "inputMethod": "Keyboard",
                "text": prompt,
                "messageType": ids.message_type,
                "requestId": ids.message_id,
                "messageId": ids.message_id,
                "imageUrl": request.image_url,
            },
            "tone": tone,
            "conversationSignature": conversation.conversation_signature,
            "participant": { "id": conversation.client_id },
            "spokenTextMode": "None",
            "conversationId": conversation.conversation_id,
            "previousMessages": [{
                "author": "user",
                "description": request.context,
                "contextType": "WebPage",
                "messageType": "Context",
                "messageId": WEBPAGE_CONTEXT_MESSAGE_ID,
            }],
        }],
        "invocationId": "0",
        "target": "chat",
        "type": 4,
    })
}

/// Maps a non-`Success` result value onto the transport error taxonomy.
pub fn classify_result(value: &str, message: &str) -> ProviderError {
    let detail = if message.is_empty() {
        value.to_string()
    } else {
        format!("{value}: {message}")
    };
    match value {
        "Throttled" => ProviderError::RateLimit(detail),
        "Unauthorized" | "UnauthorizedRequest" | "Forbidden" | "CaptchaChallenge" => {
            ProviderError::AuthError(detail)
        }
        "Disengaged" | "OffensiveContent" | "ContentFiltered" => {
            ProviderError::ContentFiltered(detail)
        }
        "ServiceUnavailable" | "ServerError" => ProviderError::NetworkError(detail),
        _ => ProviderError::ApiError(detail),
    }
}

#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub events: Vec<Result<StreamEvent, ProviderError>>,
    pub finished: bool,
}

impl FrameOutcome {
    fn fail(&mut self, err: ProviderError) {
        self.events.push(Err(err));
        self.finished = true;
    }
}

/// Turns server frames into stream events. Bot text arrives cumulatively per
/// message id, so only the unseen suffix is emitted.
#[derive(Debug, Default)]
pub struct UpdateParser {
    emitted: HashMap<String, usize>,
    echoed_images: HashSet<String>,
    last_suggestions: Vec<String>,
}

impl UpdateParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_frame(&mut self, raw: &str) -> FrameOutcome {
        let mut outcome = FrameOutcome::default();
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => {
                outcome.fail(ProviderError::StreamError("malformed json frame".to_string()));
                return outcome;
            }
        };

        match value.get("type").and_then(Value::as_i64) {
            Some(1) => {
                if let Some(messages) = value.pointer("/arguments/0/messages").and_then(Value::as_array) {
                    for message in messages {
                        self.handle_message(message, &mut outcome);
                        if outcome.finished {
                            break;
                        }
                    }
                }
            }
            Some(2) => {
                let result_value = value
                    .pointer("/item/result/value")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if result_value != "Success" {
                    let message = value
                        .pointer("/item/result/message")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    outcome.fail(classify_result(result_value, message));
                    return outcome;
                }
                if let Some(messages) = value.pointer("/item/messages").and_then(Value::as_array) {
                    for message in messages {
                        self.handle_message(message, &mut outcome);
                        if outcome.finished {
                            return outcome;
                        }
                    }
                }
                outcome.events.push(Ok(StreamEvent::Done));
                outcome.finished = true;
            }
            Some(3) => {
                outcome.events.push(Ok(StreamEvent::Done));
                outcome.finished = true;
            }
            Some(7) => {
                let reason = value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("server closed the conversation");
                outcome.fail(ProviderError::NetworkError(reason.to_string()));
            }
            _ => {}
        }
        outcome
    }

    fn handle_message(&mut self, message: &Value, outcome: &mut FrameOutcome) {
        let author = message.get("author").and_then(Value::as_str).unwrap_or_default();
        let text = message_text(message);

        if author == "user" {
            if let Some(url) = message
                .get("imageUrl")
                .and_then(Value::as_str)
                .filter(|url| !url.is_empty())
            {
                if self.echoed_images.insert(url.to_string()) {
                    outcome.events.push(Ok(StreamEvent::AttachmentEcho {
                        url: url.to_string(),
                    }));
                }
            }
            return;
        }

        match message.get("messageType").and_then(Value::as_str) {
            Some("InternalSearchQuery") => {
                if !text.is_empty() {
                    outcome.events.push(Ok(StreamEvent::SearchQuery(text.to_string())));
                }
            }
            Some("InternalSearchResult") => {
                let results = search_results(message);
                if !results.is_empty() {
                    outcome.events.push(Ok(StreamEvent::SearchResults(results)));
                }
            }
            Some("InternalLoaderMessage") | Some("Progress") => {
                if !text.is_empty() {
                    outcome.events.push(Ok(StreamEvent::Progress(text.to_string())));
                }
            }
            Some("Disengaged") => {
                outcome.fail(ProviderError::ContentFiltered(
                    "the backend ended the conversation".to_string(),
                ));
            }
            Some(_) => {}
            None if author == "bot" => self.handle_bot_text(message, text, outcome),
            None => {}
        }
    }

    fn handle_bot_text(&mut self, message: &Value, text: &str, outcome: &mut FrameOutcome) {
        if message.get("contentOrigin").and_then(Value::as_str) == Some("Apology") {
            outcome.fail(ProviderError::ContentFiltered(if text.is_empty() {
                "the backend withdrew its answer".to_string()
            } else {
                text.to_string()
            }));
            return;
        }

        let id = message
            .get("messageId")
            .and_then(Value::as_str)
            .unwrap_or("bot")
            .to_string();
        let seen = self.emitted.entry(id).or_insert(0);
        if text.len() > *seen && text.is_char_boundary(*seen) {
            outcome
                .events
                .push(Ok(StreamEvent::TextDelta(text[*seen..].to_string())));
            *seen = text.len();
        }

        let suggestions: Vec<String> = message
            .get("suggestedResponses")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|s| s.get("text").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if !suggestions.is_empty() && suggestions != self.last_suggestions {
            self.last_suggestions = suggestions.clone();
            outcome.events.push(Ok(StreamEvent::Suggestions(suggestions)));
        }
    }
}

fn message_text(message: &Value) -> &str {
    message
        .get("text")
        .and_then(Value::as_str)
        .or_else(|| {
            message
                .pointer("/adaptiveCards/0/body/0/text")
                .and_then(Value::as_str)
        })
        .unwrap_or_default()
}

/// Search results hide in `groundingInfo` or in a JSON blob in `hiddenText`.
fn search_results(message: &Value) -> Vec<SearchResult> {
    let mut results = Vec::new();
    if let Some(grounding) = message.get("groundingInfo") {
        collect_results(grounding, &mut results);
    }
    if results.is_empty() {
        let hidden = message
            .get("hiddenText")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let trimmed = hidden
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            collect_results(&value, &mut results);
        }
    }
    results
}

fn collect_results(value: &Value, results: &mut Vec<SearchResult>) {
    let Some(object) = value.as_object() else {
        return;
    };
    for items in object.values().filter_map(Value::as_array) {
        for item in items {
            let title = item.get("title").and_then(Value::as_str);
            let url = item.get("url").and_then(Value::as_str);
            if let (Some(title), Some(url)) = (title, url) {
                let snippet = match item.get("snippets").and_then(Value::as_array) {
                    Some(snippets) => snippets
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(" "),
                    None => item
                        .get("snippet")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                };
                results.push(SearchResult {
                    title: title.to_string(),
                    url: url.to_string(),
                    snippet,
                });
            }
        }
    }
}
