use reqwest::Client;
use serde::Deserialize;

use super::protocol::classify_result;
use super::SydneySettings;
use crate::ProviderError;

const SIGNATURE_HEADER: &str = "x-sydney-encryptedconversationsignature";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub conversation_id: String,
    pub client_id: String,
    #[serde(default)]
    pub conversation_signature: Option<String>,
    /// Taken from the response header, not the body.
    #[serde(skip)]
    pub sec_access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(flatten)]
    conversation: Option<Conversation>,
    #[serde(default)]
    result: Option<CreateResult>,
}

#[derive(Debug, Deserialize)]
struct CreateResult {
    #[serde(default)]
    value: String,
    #[serde(default)]
    message: Option<String>,
}

/// Opens a new server-side conversation for one ask.
pub async fn create_conversation(
    client: &Client,
    settings: &SydneySettings,
) -> Result<Conversation, ProviderError> {
    let mut request = client
        .get(&settings.create_conversation_url)
        .header("Referer", "https://www.bing.com/search?q=Bing+AI&showconv=1")
        .header("Origin", "https://www.bing.com");
    let cookie = settings.cookie_header();
    if !cookie.is_empty() {
        request = request.header("Cookie", cookie);
    }

    let response = request.send().await?;
    let status = response.status().as_u16();
    let token = response
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await?;
    if !(200..300).contains(&status) {
        return Err(ProviderError::from_status(status, body));
    }

    parse_create_response(&body, token)
}

pub(crate) fn parse_create_response(
    body: &str,
    sec_access_token: Option<String>,
) -> Result<Conversation, ProviderError> {
    let parsed: CreateResponse = serde_json::from_str(body).map_err(|e| {
        ProviderError::ApiError(format!("unreadable conversation response: {e}"))
    })?;

    if let Some(result) = &parsed.result {
        if !result.value.is_empty() && result.value != "Success" {
            return Err(classify_result(
                &result.value,
                result.message.as_deref().unwrap_or_default(),
            ));
        }
    }

    let mut conversation = parsed.conversation.ok_or_else(|| {
        ProviderError::ApiError("conversation response is missing its ids".to_string())
    })?;
    conversation.sec_access_token = sec_access_token.filter(|t| !t.is_empty());
    Ok(conversation)
}
