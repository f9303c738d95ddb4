//! Turns a picked image or document into something an ask can carry.

use async_trait::async_trait;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use parley_core::ErrorKind;
use parley_provider::{BackendKind, ProviderError, RemoteImageStore};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const JPEG_QUALITY: u8 = 80;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "json", "log", "xml", "html", "htm", "yaml", "yml", "toml",
    "rs", "py", "js", "ts", "go", "java", "c", "cpp", "h",
];

/// Either the user backed out, or the payload is ready. Never both.
#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentResult<T> {
    Canceled,
    Ready(T),
}

impl<T> AttachmentResult<T> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, AttachmentResult::Canceled)
    }

    pub fn ready(self) -> Option<T> {
        match self {
            AttachmentResult::Ready(value) => Some(value),
            AttachmentResult::Canceled => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> AttachmentResult<U> {
        match self {
            AttachmentResult::Ready(value) => AttachmentResult::Ready(f(value)),
            AttachmentResult::Canceled => AttachmentResult::Canceled,
        }
    }
}

impl<T: Serialize> Serialize for AttachmentResult<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Populated<'a, T> {
            canceled: bool,
            #[serde(flatten)]
            payload: &'a T,
        }

        match self {
            AttachmentResult::Canceled => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("canceled", &true)?;
                map.end()
            }
            AttachmentResult::Ready(payload) => Populated {
                canceled: false,
                payload,
            }
            .serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageAttachment {
    /// `data:image/jpeg;base64,...`
    pub base64_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bing_url: Option<String>,
}

impl ImageAttachment {
    /// Sydney prefers the uploaded URL; OpenAI-compatible backends always
    /// get the inline payload.
    pub fn reference_for(&self, kind: BackendKind) -> &str {
        match (kind, &self.bing_url) {
            (BackendKind::Sydney, Some(url)) => url,
            _ => &self.base64_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentAttachment {
    pub text: String,
    pub ext: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    Image(ImageAttachment),
    Document(DocumentAttachment),
}

type Resolved = Result<AttachmentResult<Attachment>, AttachmentError>;

/// An attachment flow already running on the runtime. An ask can wait on it
/// later; dropping it aborts the flow.
pub struct PendingAttachment {
    handle: JoinHandle<Resolved>,
    cancel: CancellationToken,
}

impl PendingAttachment {
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(cancel: CancellationToken, flow: F) -> Self
    where
        F: Future<Output = Resolved> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(flow),
            cancel,
        }
    }

    /// Asks the flow to stop; it resolves to `Canceled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for PendingAttachment {
    type Output = Resolved;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(resolved)) => Poll::Ready(resolved),
            Poll::Ready(Err(err)) if err.is_cancelled() => Poll::Ready(Ok(AttachmentResult::Canceled)),
            Poll::Ready(Err(err)) => Poll::Ready(Err(AttachmentError::Unsupported(format!(
                "attachment flow failed: {err}"
            )))),
        }
    }
}

impl Drop for PendingAttachment {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("Unsupported attachment: {0}")]
    Unsupported(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image upload failed: {0}")]
    Upload(#[from] ProviderError),
}

impl AttachmentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AttachmentError::Unsupported(_) => ErrorKind::AttachmentUnsupported,
            AttachmentError::Io { .. } => ErrorKind::AttachmentUnreadable,
            AttachmentError::Upload(err) => err.kind(),
        }
    }
}

/// The file selection surface. `None` means the user closed it.
#[async_trait]
pub trait FilePicker: Send + Sync {
    async fn pick_image(&self) -> Option<PathBuf>;
    async fn pick_document(&self) -> Option<PathBuf>;
}

#[derive(Clone)]
pub struct AttachmentPipeline {
    picker: Arc<dyn FilePicker>,
    image_store: Option<Arc<dyn RemoteImageStore>>,
}

impl AttachmentPipeline {
    pub fn new(picker: Arc<dyn FilePicker>) -> Self {
        Self {
            picker,
            image_store: None,
        }
    }

    pub fn with_image_store(mut self, store: Arc<dyn RemoteImageStore>) -> Self {
        self.image_store = Some(store);
        self
    }

    pub async fn pick_image(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AttachmentResult<ImageAttachment>, AttachmentError> {
        let picked = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            path = self.picker.pick_image() => path,
        };
        let Some(path) = picked else {
            tracing::debug!("image pick canceled");
            return Ok(AttachmentResult::Canceled);
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(AttachmentResult::Canceled),
            image = self.image_from_path(&path) => image.map(AttachmentResult::Ready),
        }
    }

    pub async fn pick_document(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AttachmentResult<DocumentAttachment>, AttachmentError> {
        let picked = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            path = self.picker.pick_document() => path,
        };
        let Some(path) = picked else {
            tracing::debug!("document pick canceled");
            return Ok(AttachmentResult::Canceled);
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(AttachmentResult::Canceled),
            doc = document_from_path(&path) => doc.map(AttachmentResult::Ready),
        }
    }

    /// Starts the image flow now so an ask can wait on it later.
    pub fn pending_image(&self, cancel: CancellationToken) -> PendingAttachment {
        let pipeline = self.clone();
        let token = cancel.clone();
        PendingAttachment::spawn(cancel, async move {
            Ok(pipeline.pick_image(&token).await?.map(Attachment::Image))
        })
    }

    pub fn pending_document(&self, cancel: CancellationToken) -> PendingAttachment {
        let pipeline = self.clone();
        let token = cancel.clone();
        PendingAttachment::spawn(cancel, async move {
            Ok(pipeline.pick_document(&token).await?.map(Attachment::Document))
        })
    }

    /// Normalises to JPEG, then uploads when an image store is configured.
    pub async fn image_from_path(&self, path: &Path) -> Result<ImageAttachment, AttachmentError> {
        let bytes = read(path).await?;
        let jpeg = tokio::task::spawn_blocking(move || to_jpeg(&bytes))
            .await
            .map_err(|e| AttachmentError::Unsupported(format!("image conversion aborted: {e}")))??;

        let base64_url = format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&jpeg)
        );
        let bing_url = match &self.image_store {
            Some(store) => Some(store.upload_jpeg(jpeg).await?),
            None => None,
        };
        tracing::debug!(path = %path.display(), uploaded = bing_url.is_some(), "image attached");
        Ok(ImageAttachment {
            base64_url,
            bing_url,
        })
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, AttachmentError> {
    tokio::fs::read(path).await.map_err(|source| AttachmentError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn to_jpeg(bytes: &[u8]) -> Result<Vec<u8>, AttachmentError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| AttachmentError::Unsupported(format!("unreadable image: {e}")))?;
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(decoded.to_rgb8())
        .write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY))
        .map_err(|e| AttachmentError::Unsupported(format!("jpeg encoding failed: {e}")))?;
    Ok(out)
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

pub async fn document_from_path(path: &Path) -> Result<DocumentAttachment, AttachmentError> {
    let ext = extension(path);
    let text = if ext == "pdf" {
        let bytes = read(path).await?;
        tokio::task::spawn_blocking(move || pdf_text(&bytes))
            .await
            .map_err(|e| AttachmentError::Unsupported(format!("pdf extraction aborted: {e}")))??
    } else if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        String::from_utf8_lossy(&read(path).await?).into_owned()
    } else {
        return Err(AttachmentError::Unsupported(if ext.is_empty() {
            "file has no extension".to_string()
        } else {
            format!("documents of type .{ext} are not supported")
        }));
    };

    tracing::debug!(path = %path.display(), %ext, chars = text.len(), "document attached");
    Ok(DocumentAttachment { text, ext })
}

fn pdf_text(bytes: &[u8]) -> Result<String, AttachmentError> {
    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| AttachmentError::Unsupported(format!("unreadable pdf: {e}")))?;
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    doc.extract_text(&pages)
        .map_err(|e| AttachmentError::Unsupported(format!("pdf text extraction failed: {e}")))
}
