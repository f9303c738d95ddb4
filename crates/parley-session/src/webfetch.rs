use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const ACCEPT_HEADER: &str =
    "text/html;q=1.0, application/xhtml+xml;q=0.9, text/plain;q=0.8, text/markdown;q=0.7, */*;q=0.1";

static TITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"https?://[^\s<>"'`]+"#).unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebFetchResult {
    pub title: String,
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("URL must start with http:// or https://: {0}")]
    InvalidUrl(String),

    #[error("Failed to fetch URL: {0}")]
    Request(String),

    #[error("Request failed with status code: {0}")]
    Status(u16),

    #[error("Response too large (exceeds 5MB limit)")]
    TooLarge,

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Unsupported content type: {0}")]
    UnsupportedContent(String),
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<WebFetchResult, FetchError>;
}

pub struct WebFetcher {
    client: Client,
    timeout_secs: u64,
}

impl WebFetcher {
    pub fn new(proxy: Option<&str>) -> Result<Self, parley_provider::ProviderError> {
        let client = parley_provider::http::build_client(
            proxy,
            Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        )?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[async_trait]
impl PageFetcher for WebFetcher {
    async fn fetch(&self, url: &str) -> Result<WebFetchResult, FetchError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }

        let request = self
            .client
            .get(url)
            .header("Accept", ACCEPT_HEADER)
            .header("Accept-Language", "en-US,en;q=0.9")
            .send();
        let response = tokio::time::timeout(Duration::from_secs(self.timeout_secs), request)
            .await
            .map_err(|_| FetchError::Timeout(self.timeout_secs))?
            .map_err(|e| FetchError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if response
            .content_length()
            .is_some_and(|len| len as usize > MAX_RESPONSE_SIZE)
        {
            return Err(FetchError::TooLarge);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Request(format!("Failed to read response: {e}")))?;
        if bytes.len() > MAX_RESPONSE_SIZE {
            return Err(FetchError::TooLarge);
        }

        let result = page_from_body(url, &content_type, &String::from_utf8_lossy(&bytes))?;
        tracing::debug!(%url, title = %result.title, size = result.content.len(), "fetched page");
        Ok(result)
    }
}

fn page_from_body(url: &str, content_type: &str, body: &str) -> Result<WebFetchResult, FetchError> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    let is_html = mime.contains("html") || (mime.is_empty() && body.trim_start().starts_with('<'));
    if is_html {
        let title = TITLE
            .captures(body)
            .map(|caps| decode_entities(caps[1].trim()))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| url.to_string());
        return Ok(WebFetchResult {
            title,
            content: html2md::parse_html(body),
        });
    }

    if mime.is_empty() || mime.starts_with("text/") || mime.contains("json") || mime.contains("xml") {
        return Ok(WebFetchResult {
            title: url.to_string(),
            content: body.to_string(),
        });
    }
    Err(FetchError::UnsupportedContent(mime))
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Distinct http(s) URLs in `text`, in order of appearance, at most `limit`.
pub fn extract_urls(text: &str, limit: usize) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for m in URL.find_iter(text) {
        let url = m
            .as_str()
            .trim_end_matches(|c| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | ')' | ']' | '}'));
        if !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
        if urls.len() >= limit {
            break;
        }
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/page", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        url
    }

    fn ok(content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn html_pages_become_markdown_with_title() {
        let body = "<html><head><title>Rust &amp; Tokio</title></head><body><h1>Hello</h1><p>World</p></body></html>";
        let url = serve(ok("text/html; charset=utf-8", body)).await;

        let page = WebFetcher::with_client(Client::new()).fetch(&url).await.unwrap();
        assert_eq!(page.title, "Rust & Tokio");
        assert!(page.content.contains("Hello"));
        assert!(page.content.contains("World"));
        assert!(!page.content.contains("<p>"));
    }

    #[tokio::test]
    async fn plain_text_is_returned_as_is() {
        let url = serve(ok("text/plain", "just text")).await;
        let page = WebFetcher::with_client(Client::new()).fetch(&url).await.unwrap();
        assert_eq!(page.title, url);
        assert_eq!(page.content, "just text");
    }

    #[tokio::test]
    async fn oversized_and_failed_responses_are_errors() {
        let head = "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 6000000\r\nConnection: close\r\n\r\n";
        let url = serve(head.to_string()).await;
        let err = WebFetcher::with_client(Client::new()).fetch(&url).await.unwrap_err();
        assert!(matches!(err, FetchError::TooLarge));

        let url = serve("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()).await;
        let err = WebFetcher::with_client(Client::new()).fetch(&url).await.unwrap_err();
        assert!(matches!(err, FetchError::Status(404)));
    }

    #[tokio::test]
    async fn non_http_urls_are_rejected() {
        let err = WebFetcher::with_client(Client::new())
            .fetch("file:///etc/passwd")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[test]
    fn binary_content_is_unsupported() {
        let err = page_from_body("https://x", "image/png", "\u{0}").unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedContent(m) if m == "image/png"));
    }

    #[test]
    fn urls_are_extracted_trimmed_and_capped() {
        let prompt = "Compare https://a.example/x, https://b.example/y. and (https://c.example) \
                      plus https://a.example/x and https://d.example";
        assert_eq!(
            extract_urls(prompt, 3),
            vec!["https://a.example/x", "https://b.example/y", "https://c.example"]
        );
        assert!(extract_urls("no links here", 3).is_empty());
    }
}
