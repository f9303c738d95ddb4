use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::SydneySettings;
use crate::ProviderError;

pub const DEFAULT_KBLOB_URL: &str = "https://www.bing.com/images/kblob";
const BLOB_URL_PREFIX: &str = "https://www.bing.com/images/blob?bcid=";

/// Somewhere a JPEG can be parked so a backend can fetch it by URL.
#[async_trait]
pub trait RemoteImageStore: Send + Sync {
    /// Returns the public URL of the uploaded image.
    async fn upload_jpeg(&self, jpeg: Vec<u8>) -> Result<String, ProviderError>;
}

/// Uploads through the Bing knowledge-blob endpoint.
pub struct KblobImageStore {
    client: Client,
    endpoint: String,
    cookie: String,
}

impl KblobImageStore {
    pub fn new(client: Client, settings: &SydneySettings) -> Self {
        Self {
            client,
            endpoint: DEFAULT_KBLOB_URL.to_string(),
            cookie: settings.cookie_header(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KblobResponse {
    #[serde(default)]
    blob_id: String,
    #[serde(default)]
    processed_blob_id: String,
}

fn knowledge_request() -> String {
    json!({
        "imageInfo": {},
        "knowledgeRequest": {
            "invokedSkills": ["ImageById"],
            "subscriptionId": "Bing.Chat.Multimodal",
            "invokedSkillsRequestData": { "enableFaceBlur": true },
            "convoData": { "convoid": "", "convotone": "Creative" },
        },
    })
    .to_string()
}

pub(crate) fn blob_url(body: &str) -> Result<String, ProviderError> {
    let parsed: KblobResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::ApiError(format!("unreadable image upload response: {e}")))?;
    let id = if parsed.processed_blob_id.is_empty() {
        parsed.blob_id
    } else {
        parsed.processed_blob_id
    };
    if id.is_empty() {
        return Err(ProviderError::ApiError(
            "image upload returned no blob id".to_string(),
        ));
    }
    Ok(format!("{BLOB_URL_PREFIX}{id}"))
}

#[async_trait]
impl RemoteImageStore for KblobImageStore {
    async fn upload_jpeg(&self, jpeg: Vec<u8>) -> Result<String, ProviderError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&jpeg);
        let form = reqwest::multipart::Form::new()
            .text("knowledgeRequest", knowledge_request())
            .text("imageBase64", encoded);

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Referer", "https://www.bing.com/search?q=Bing+AI&showconv=1")
            .multipart(form);
        if !self.cookie.is_empty() {
            request = request.header("Cookie", self.cookie.clone());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_status(status, body));
        }
        let url = blob_url(&body)?;
        tracing::debug!(bytes = jpeg.len(), %url, "uploaded image");
        Ok(url)
    }
}
