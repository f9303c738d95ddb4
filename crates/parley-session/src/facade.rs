use parley_config::{Config, Workspace};
use parley_core::Bus;
use parley_provider::{
    HttpTransportFactory, KblobImageStore, ProviderError, RemoteImageStore, SydneySettings,
    TransportFactory,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::attachment::{
    AttachmentError, AttachmentPipeline, AttachmentResult, DocumentAttachment, FilePicker,
    ImageAttachment, PendingAttachment,
};
use crate::dispatch::{AskHandle, AskRequest, DispatchError, Dispatcher};
use crate::webfetch::{FetchError, PageFetcher, WebFetchResult, WebFetcher};
use crate::workspace::{WorkspaceError, WorkspaceManager};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Everything the shell calls into, wired from one `Config`.
pub struct ChatCore {
    bus: Arc<Bus>,
    workspaces: Arc<WorkspaceManager>,
    dispatcher: Dispatcher,
    attachments: AttachmentPipeline,
    fetcher: Arc<dyn PageFetcher>,
}

impl ChatCore {
    /// Production wiring: HTTP transports, Bing image upload and the page
    /// fetcher all go through the configured proxy.
    pub fn new(
        config: &Config,
        cookies: HashMap<String, String>,
        picker: Arc<dyn FilePicker>,
    ) -> Result<Self, CoreError> {
        let client = parley_provider::http::build_client(config.proxy(), None)?;
        let image_store: Arc<dyn RemoteImageStore> = Arc::new(KblobImageStore::new(
            client,
            &SydneySettings::from_config(config, cookies.clone()),
        ));
        let transports = Arc::new(HttpTransportFactory::new(config, cookies)?);
        let fetcher = Arc::new(WebFetcher::new(config.proxy())?);

        Ok(Self::with_parts(
            config,
            transports,
            AttachmentPipeline::new(picker).with_image_store(image_store),
            fetcher,
        ))
    }

    pub fn with_parts(
        config: &Config,
        transports: Arc<dyn TransportFactory>,
        attachments: AttachmentPipeline,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        let bus = Arc::new(Bus::new());
        let workspaces = Arc::new(WorkspaceManager::from_config(config).with_bus(bus.clone()));
        let dispatcher = Dispatcher::builder(workspaces.clone(), transports)
            .fetcher(fetcher.clone())
            .bus(bus.clone())
            .build(config);
        tracing::info!(
            workspaces = workspaces.len(),
            backends = config.open_ai_backends.len(),
            "chat core ready"
        );
        Self {
            bus,
            workspaces,
            dispatcher,
            attachments,
            fetcher,
        }
    }

    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Applies edited settings without dropping in-flight asks.
    pub fn reload(&self, config: &Config) {
        self.dispatcher.reload(config);
    }

    pub fn ask(&self, workspace_id: u64, request: AskRequest) -> Result<AskHandle, DispatchError> {
        self.dispatcher.ask(workspace_id, request)
    }

    pub fn send(
        &self,
        workspace_id: u64,
        prompt: impl Into<String>,
        attachment: Option<PendingAttachment>,
    ) -> Result<AskHandle, DispatchError> {
        self.dispatcher.send(workspace_id, prompt, attachment)
    }

    pub fn regenerate(&self, workspace_id: u64) -> Result<AskHandle, DispatchError> {
        self.dispatcher.regenerate(workspace_id)
    }

    pub async fn pick_image(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AttachmentResult<ImageAttachment>, AttachmentError> {
        self.attachments.pick_image(cancel).await
    }

    pub async fn pick_document(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AttachmentResult<DocumentAttachment>, AttachmentError> {
        self.attachments.pick_document(cancel).await
    }

    /// Starts an image pick that a later `send` can wait on.
    pub fn pending_image(&self, cancel: CancellationToken) -> PendingAttachment {
        self.attachments.pending_image(cancel)
    }

    pub fn pending_document(&self, cancel: CancellationToken) -> PendingAttachment {
        self.attachments.pending_document(cancel)
    }

    pub async fn fetch_webpage(&self, url: &str) -> Result<WebFetchResult, FetchError> {
        self.fetcher.fetch(url).await
    }

    pub fn create_workspace(&self, title: impl Into<String>) -> Workspace {
        self.workspaces.create(title)
    }

    pub fn switch_workspace(&self, id: u64) -> Result<(), WorkspaceError> {
        self.workspaces.switch_current(id)
    }

    pub fn update_workspace<F>(&self, id: u64, mutator: F) -> Result<Workspace, WorkspaceError>
    where
        F: FnOnce(&mut Workspace),
    {
        self.workspaces.update(id, mutator)
    }

    pub fn delete_workspace(&self, id: u64) -> Result<(), WorkspaceError> {
        self.workspaces.delete(id)?;
        self.dispatcher.forget(id);
        Ok(())
    }

    pub fn current_workspace(&self) -> Option<Workspace> {
        self.workspaces.current()
    }

    /// `(workspaces, current_workspace_id)` for persistence.
    pub fn snapshot(&self) -> (Vec<Workspace>, Option<u64>) {
        self.workspaces.snapshot()
    }

    pub fn export_into(&self, config: &mut Config) {
        self.workspaces.export_into(config);
    }
}
