//! The dispatch engine: one spawned task per ask.
//!
//! ```text
//! Idle -> [AttachmentPending] -> Dispatched -> Streaming -> Completed
//!                    |                |            |-----> Failed
//!                    `----------------`------------`-----> Canceled
//! ```
//!
//! Deltas flow through a bounded channel in transport order; the terminal
//! [`ChatOutcome`] arrives on its own oneshot once the workspace is released.

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use parley_config::{Config, Preset, Workspace};
use parley_core::bus::{Bus, BusEventDef};
use parley_core::{id, ErrorKind};
use parley_provider::context::{self, Role};
use parley_provider::{
    model, BackendKind, BackendRegistry, OpenAiRequest, StreamEvent, SydneyRequest, Transport,
    TransportFactory, TransportRequest,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::attachment::{Attachment, AttachmentResult, DocumentAttachment, ImageAttachment, PendingAttachment};
use crate::outcome::{ChatOutcome, DispatchState};
use crate::status::{BusyGuard, BusyTracker};
use crate::webfetch::{extract_urls, PageFetcher};
use crate::workspace::{WorkspaceError, WorkspaceManager};

pub static ASK_FINISHED_EVENT: BusEventDef = BusEventDef::new("ask.finished");

const DEFAULT_CANCEL_ACK_SECS: u64 = 5;
const DEFAULT_DELTA_CAPACITY: usize = 64;
const SEARCH_URL_LIMIT: usize = 3;

/// One ask as the shell sends it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskRequest {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    /// Profile name; empty for Sydney.
    #[serde(rename = "openai_backend", default)]
    pub backend: String,
    #[serde(default)]
    pub chat_context: String,
    pub prompt: String,
    /// The shell sends `""` for no image.
    #[serde(
        default,
        deserialize_with = "blank_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub image_url: Option<String>,
}

fn non_blank(url: Option<String>) -> Option<String> {
    url.filter(|url| !url.trim().is_empty())
}

fn blank_as_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(non_blank(Option::<String>::deserialize(deserializer)?))
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    /// Zero disables the regenerate guard.
    pub revoke_reply_count: u32,
    pub revoke_reply_text: String,
    /// How long a transport gets to confirm a cancel.
    pub cancel_ack_timeout: Duration,
    pub delta_capacity: usize,
    /// Keep the partial answer in the context when an ask is canceled.
    pub save_partial_on_cancel: bool,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            revoke_reply_count: config.revoke_reply_count,
            revoke_reply_text: config.revoke_reply_text.clone(),
            ..Self::default()
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            revoke_reply_count: 0,
            revoke_reply_text: parley_config::schema::DEFAULT_REVOKE_REPLY_TEXT.to_string(),
            cancel_ack_timeout: Duration::from_secs(DEFAULT_CANCEL_ACK_SECS),
            delta_capacity: DEFAULT_DELTA_CAPACITY,
            save_partial_on_cancel: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("Workspace {0} has no answer to regenerate")]
    NothingToRegenerate(u64),
}

/// The last turn of a workspace, kept for regeneration.
#[derive(Debug, Clone)]
struct TurnRecord {
    request: AskRequest,
    pre_context: String,
    revokes: u32,
}

enum AskSource {
    Request(AskRequest),
    Compose {
        prompt: String,
        attachment: Option<PendingAttachment>,
    },
    /// Re-asks a recorded turn. `pre_turn` is the context before it, which
    /// becomes the base of the new answer once that answer completes.
    Regenerate {
        request: AskRequest,
        pre_turn: String,
    },
}

struct Shared {
    workspaces: Arc<WorkspaceManager>,
    registry: RwLock<Arc<BackendRegistry>>,
    presets: RwLock<Vec<Preset>>,
    settings: RwLock<DispatchSettings>,
    transports: Arc<dyn TransportFactory>,
    fetcher: Option<Arc<dyn PageFetcher>>,
    busy: BusyTracker,
    turns: Mutex<HashMap<u64, TurnRecord>>,
    bus: Option<Arc<Bus>>,
}

#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        transports: Arc<dyn TransportFactory>,
        config: &Config,
    ) -> Self {
        Self::build(workspaces, transports, config, None, None)
    }

    pub fn builder(
        workspaces: Arc<WorkspaceManager>,
        transports: Arc<dyn TransportFactory>,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            workspaces,
            transports,
            fetcher: None,
            bus: None,
            settings: None,
        }
    }

    fn build(
        workspaces: Arc<WorkspaceManager>,
        transports: Arc<dyn TransportFactory>,
        config: &Config,
        fetcher: Option<Arc<dyn PageFetcher>>,
        bus: Option<Arc<Bus>>,
    ) -> Self {
        let busy = match &bus {
            Some(bus) => BusyTracker::with_bus(bus.clone()),
            None => BusyTracker::new(),
        };
        Self {
            shared: Arc::new(Shared {
                workspaces,
                registry: RwLock::new(Arc::new(BackendRegistry::from_config(config))),
                presets: RwLock::new(config.presets.clone()),
                settings: RwLock::new(DispatchSettings::from_config(config)),
                transports,
                fetcher,
                busy,
                turns: Mutex::new(HashMap::new()),
                bus,
            }),
        }
    }

    /// Picks up changed backends, presets and revoke knobs. Asks already in
    /// flight keep what they resolved.
    pub fn reload(&self, config: &Config) {
        *self.shared.registry.write() = Arc::new(BackendRegistry::from_config(config));
        *self.shared.presets.write() = config.presets.clone();
        let mut settings = self.shared.settings.write();
        settings.revoke_reply_count = config.revoke_reply_count;
        settings.revoke_reply_text = config.revoke_reply_text.clone();
    }

    pub fn settings(&self) -> DispatchSettings {
        self.shared.settings.read().clone()
    }

    pub fn busy(&self) -> &BusyTracker {
        &self.shared.busy
    }

    pub fn is_busy(&self, workspace_id: u64) -> bool {
        self.shared.busy.is_busy(workspace_id)
    }

    /// Drops the regeneration record of a deleted workspace.
    pub fn forget(&self, workspace_id: u64) {
        self.shared.turns.lock().remove(&workspace_id);
    }

    pub(crate) fn tracked_turns(&self) -> usize {
        self.shared.turns.lock().len()
    }

    /// Builds the request the workspace would send for `prompt`.
    pub fn compose(&self, workspace_id: u64, prompt: &str) -> Result<AskRequest, DispatchError> {
        self.shared.compose(workspace_id, prompt, None, None)
    }

    /// Dispatches a request built by the caller.
    pub fn ask(&self, workspace_id: u64, mut request: AskRequest) -> Result<AskHandle, DispatchError> {
        request.image_url = non_blank(request.image_url.take());
        self.start(workspace_id, AskSource::Request(request))
    }

    /// Composes from the workspace, waiting for `attachment` first.
    pub fn send(
        &self,
        workspace_id: u64,
        prompt: impl Into<String>,
        attachment: Option<PendingAttachment>,
    ) -> Result<AskHandle, DispatchError> {
        self.start(
            workspace_id,
            AskSource::Compose {
                prompt: prompt.into(),
                attachment,
            },
        )
    }

    /// Discards the last answer and asks again, unless the regenerate guard
    /// has tripped, in which case the outcome carries the advisory text and
    /// nothing is sent.
    pub fn regenerate(&self, workspace_id: u64) -> Result<AskHandle, DispatchError> {
        if !self.shared.workspaces.contains(workspace_id) {
            return Err(WorkspaceError::NotFound(workspace_id).into());
        }
        let ask_id = id::ask();
        let guard = match self.shared.busy.try_begin(workspace_id, &ask_id) {
            Ok(guard) => guard,
            Err(busy) => return Ok(self.busy_handle(workspace_id, ask_id, busy.to_string())),
        };

        let settings = self.settings();
        let record = {
            let mut turns = self.shared.turns.lock();
            let record = turns
                .get_mut(&workspace_id)
                .ok_or(DispatchError::NothingToRegenerate(workspace_id))?;
            if settings.revoke_reply_count > 0 && record.revokes >= settings.revoke_reply_count {
                None
            } else {
                record.revokes += 1;
                Some(record.clone())
            }
        };

        let Some(record) = record else {
            tracing::info!(
                workspace_id,
                limit = settings.revoke_reply_count,
                "regenerate limit reached, returning advisory"
            );
            drop(guard);
            let outcome = ChatOutcome::advisory(settings.revoke_reply_text);
            self.shared.publish_finished(workspace_id, &ask_id, &outcome);
            return Ok(AskHandle::settled(ask_id, workspace_id, outcome));
        };

        tracing::debug!(workspace_id, revokes = record.revokes, "regenerating last answer");
        Ok(self.spawn(
            workspace_id,
            ask_id,
            guard,
            AskSource::Regenerate {
                request: record.request,
                pre_turn: record.pre_context,
            },
        ))
    }

    fn start(&self, workspace_id: u64, source: AskSource) -> Result<AskHandle, DispatchError> {
        if !self.shared.workspaces.contains(workspace_id) {
            return Err(WorkspaceError::NotFound(workspace_id).into());
        }
        let ask_id = id::ask();
        match self.shared.busy.try_begin(workspace_id, &ask_id) {
            Ok(guard) => Ok(self.spawn(workspace_id, ask_id, guard, source)),
            Err(busy) => Ok(self.busy_handle(workspace_id, ask_id, busy.to_string())),
        }
    }

    fn busy_handle(&self, workspace_id: u64, ask_id: String, message: String) -> AskHandle {
        tracing::warn!(workspace_id, %ask_id, "rejecting ask, workspace busy");
        AskHandle::settled(ask_id, workspace_id, ChatOutcome::failure(ErrorKind::Busy, message))
    }

    fn spawn(&self, workspace_id: u64, ask_id: String, guard: BusyGuard, source: AskSource) -> AskHandle {
        let capacity = self.shared.settings.read().delta_capacity.max(1);
        let (delta_tx, delta_rx) = mpsc::channel(capacity);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(DispatchState::Idle);
        let cancel = CancellationToken::new();

        let run = Run {
            shared: self.shared.clone(),
            workspace_id,
            ask_id: ask_id.clone(),
            guard,
            state: state_tx,
            deltas: delta_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(async move {
            let outcome = run.drive(source).await;
            run.finish(outcome, outcome_tx);
        });

        AskHandle {
            ask_id,
            workspace_id,
            deltas: delta_rx,
            outcome: outcome_rx,
            state: state_rx,
            cancel,
        }
    }
}

pub struct DispatcherBuilder {
    workspaces: Arc<WorkspaceManager>,
    transports: Arc<dyn TransportFactory>,
    fetcher: Option<Arc<dyn PageFetcher>>,
    bus: Option<Arc<Bus>>,
    settings: Option<DispatchSettings>,
}

impl DispatcherBuilder {
    pub fn fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn bus(mut self, bus: Arc<Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Overrides what would be derived from the config.
    pub fn settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn build(self, config: &Config) -> Dispatcher {
        let dispatcher = Dispatcher::build(
            self.workspaces,
            self.transports,
            config,
            self.fetcher,
            self.bus,
        );
        if let Some(settings) = self.settings {
            *dispatcher.shared.settings.write() = settings;
        }
        dispatcher
    }
}

impl Shared {
    fn compose(
        &self,
        workspace_id: u64,
        prompt: &str,
        image: Option<&ImageAttachment>,
        document: Option<&DocumentAttachment>,
    ) -> Result<AskRequest, DispatchError> {
        let ws = self
            .workspaces
            .get(workspace_id)
            .ok_or(WorkspaceError::NotFound(workspace_id))?;
        let kind = if ws.uses_sydney() {
            BackendKind::Sydney
        } else {
            BackendKind::OpenAiCompatible
        };

        let mut chat_context = match self.preset_content(&ws) {
            Some(preset) => context::concat(&preset, &ws.context),
            None => ws.context.clone(),
        };
        if let Some(doc) = document {
            context::append_block(&mut chat_context, Role::User, context::KIND_DOCUMENT, &doc.text);
        }

        Ok(AskRequest {
            kind,
            backend: match kind {
                BackendKind::Sydney => String::new(),
                BackendKind::OpenAiCompatible => ws.backend.clone(),
            },
            chat_context,
            prompt: prompt.to_string(),
            image_url: image.map(|i| i.reference_for(kind).to_string()),
        })
    }

    fn preset_content(&self, ws: &Workspace) -> Option<String> {
        if ws.preset.is_empty() {
            return None;
        }
        let presets = self.presets.read();
        match presets.iter().find(|p| p.name == ws.preset) {
            Some(preset) => Some(preset.content.clone()),
            None => {
                tracing::warn!(workspace_id = ws.id, preset = %ws.preset, "preset not found, ignoring");
                None
            }
        }
    }

    /// Appends `[system](#webpage_context)` blocks for links in the prompt.
    async fn augment(&self, prompt: &str, chat_context: &mut String) {
        let Some(fetcher) = &self.fetcher else {
            return;
        };
        let urls = extract_urls(prompt, SEARCH_URL_LIMIT);
        if urls.is_empty() {
            return;
        }
        let pages = futures::future::join_all(urls.iter().map(|url| fetcher.fetch(url))).await;
        for (url, page) in urls.iter().zip(pages) {
            match page {
                Ok(page) => {
                    let text = format!("{}\n{}\n\n{}", page.title, url, page.content.trim());
                    context::append_block(chat_context, Role::System, context::KIND_WEBPAGE, &text);
                }
                Err(err) => tracing::warn!(%url, %err, "skipping page for search augmentation"),
            }
        }
    }

    fn publish_finished(&self, workspace_id: u64, ask_id: &str, outcome: &ChatOutcome) {
        if let Some(bus) = &self.bus {
            bus.publish(
                &ASK_FINISHED_EVENT,
                serde_json::json!({
                    "workspaceID": workspace_id,
                    "askID": ask_id,
                    "outcome": outcome,
                }),
            );
        }
    }
}

/// What a single spawned ask owns.
struct Run {
    shared: Arc<Shared>,
    workspace_id: u64,
    ask_id: String,
    guard: BusyGuard,
    state: watch::Sender<DispatchState>,
    deltas: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

enum Streamed {
    Completed(String),
    Canceled(String),
}

impl Run {
    fn set_state(&self, state: DispatchState) {
        tracing::debug!(workspace_id = self.workspace_id, ask_id = %self.ask_id, %state, "dispatch state");
        self.guard.set_state(state);
        let _ = self.state.send(state);
    }

    async fn drive(&self, source: AskSource) -> ChatOutcome {
        let pre_context = match self.shared.workspaces.get(self.workspace_id) {
            Some(ws) => ws.context,
            None => return self.workspace_gone(),
        };

        let (request, pre_turn) = match source {
            AskSource::Request(request) => (request, None),
            AskSource::Regenerate { request, pre_turn } => (request, Some(pre_turn)),
            AskSource::Compose { prompt, attachment } => {
                let (image, document) = match attachment {
                    Some(pending) => match self.await_attachment(pending).await {
                        Ok(resolved) => resolved,
                        Err(outcome) => return outcome,
                    },
                    None => (None, None),
                };
                match self
                    .shared
                    .compose(self.workspace_id, &prompt, image.as_ref(), document.as_ref())
                {
                    Ok(request) => (request, None),
                    Err(_) => return self.workspace_gone(),
                }
            }
        };

        self.set_state(DispatchState::Dispatched);
        let transport_request = match self.resolve(&request).await {
            Ok(Some(req)) => req,
            Ok(None) => return ChatOutcome::canceled(),
            Err(outcome) => return outcome,
        };

        if pre_turn.is_none() {
            let mut turns = self.shared.turns.lock();
            turns.retain(|id, _| self.shared.workspaces.contains(*id));
            turns.insert(
                self.workspace_id,
                TurnRecord {
                    request: request.clone(),
                    pre_context,
                    revokes: 0,
                },
            );
        }

        let transport = self.shared.transports.create(request.kind);
        let streamed = match self.stream(transport.as_ref(), transport_request).await {
            Ok(streamed) => streamed,
            Err(outcome) => return outcome,
        };

        match streamed {
            Streamed::Completed(response) => {
                if let Err(err) = self.save_turn(pre_turn.as_deref(), &request.prompt, &response) {
                    tracing::warn!(%err, "workspace vanished before the answer was saved");
                }
                ChatOutcome::success()
            }
            Streamed::Canceled(partial) => {
                let save = self.shared.settings.read().save_partial_on_cancel;
                if save && !partial.is_empty() {
                    let _ = self.save_turn(pre_turn.as_deref(), &request.prompt, &partial);
                }
                ChatOutcome::canceled()
            }
        }
    }

    /// Context is only written here, after the transport is done. A
    /// regeneration swaps out the answer it replaces.
    fn save_turn(&self, pre_turn: Option<&str>, prompt: &str, response: &str) -> Result<(), WorkspaceError> {
        let workspaces = &self.shared.workspaces;
        match pre_turn {
            Some(pre_turn) => workspaces.replace_turn(self.workspace_id, pre_turn, prompt, response),
            None => workspaces.append_turn(self.workspace_id, prompt, response),
        }
    }

    fn workspace_gone(&self) -> ChatOutcome {
        ChatOutcome::failure(
            ErrorKind::BackendError,
            WorkspaceError::NotFound(self.workspace_id).to_string(),
        )
    }

    async fn await_attachment(
        &self,
        pending: PendingAttachment,
    ) -> Result<(Option<ImageAttachment>, Option<DocumentAttachment>), ChatOutcome> {
        self.set_state(DispatchState::AttachmentPending);
        let resolved = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ChatOutcome::canceled()),
            resolved = pending => resolved,
        };
        match resolved {
            Ok(AttachmentResult::Canceled) => Err(ChatOutcome::canceled()),
            Ok(AttachmentResult::Ready(Attachment::Image(image))) => Ok((Some(image), None)),
            Ok(AttachmentResult::Ready(Attachment::Document(doc))) => Ok((None, Some(doc))),
            Err(err) => Err(ChatOutcome::failure(err.kind(), err.to_string())),
        }
    }

    /// Resolves backend and model and builds the transport request. `None`
    /// means the ask was canceled while pages were being fetched.
    async fn resolve(&self, request: &AskRequest) -> Result<Option<TransportRequest>, ChatOutcome> {
        match request.kind {
            BackendKind::OpenAiCompatible => {
                let registry = self.shared.registry.read().clone();
                let profile = registry
                    .resolve(&request.backend)
                    .map_err(|e| ChatOutcome::from(&e))?;
                let size = model::context_size(&request.chat_context, &request.prompt);
                let choice = model::select(profile, size).map_err(|e| ChatOutcome::from(&e))?;
                tracing::debug!(
                    ask_id = %self.ask_id,
                    backend = %profile.name,
                    model = %choice.model,
                    tier = ?choice.tier,
                    context_tokens = size,
                    "model selected"
                );
                Ok(Some(TransportRequest::OpenAi(OpenAiRequest {
                    ask_id: self.ask_id.clone(),
                    profile: profile.clone(),
                    model: choice.model,
                    context: request.chat_context.clone(),
                    prompt: request.prompt.clone(),
                    image_url: request.image_url.clone(),
                })))
            }
            BackendKind::Sydney => {
                let ws = self
                    .shared
                    .workspaces
                    .get(self.workspace_id)
                    .ok_or_else(|| self.workspace_gone())?;
                let mut chat_context = request.chat_context.clone();
                if !ws.no_search {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok(None),
                        _ = self.shared.augment(&request.prompt, &mut chat_context) => {}
                    }
                }
                Ok(Some(TransportRequest::Sydney(SydneyRequest {
                    ask_id: self.ask_id.clone(),
                    prompt: request.prompt.clone(),
                    context: chat_context,
                    image_url: request.image_url.clone(),
                    locale: ws.locale,
                    conversation_style: ws.conversation_style,
                    no_search: ws.no_search,
                })))
            }
        }
    }

    async fn stream(
        &self,
        transport: &dyn Transport,
        request: TransportRequest,
    ) -> Result<Streamed, ChatOutcome> {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            opened = transport.send(request) => Some(opened),
        };
        let mut events = match opened {
            None => {
                self.stop(transport).await;
                return Ok(Streamed::Canceled(String::new()));
            }
            Some(Err(err)) => return Err(ChatOutcome::from(&err)),
            Some(Ok(events)) => events,
        };

        self.set_state(DispatchState::Streaming);
        let mut response = String::new();
        let mut listening = true;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.stop(transport).await;
                    return Ok(Streamed::Canceled(response));
                }
                next = events.next() => next,
            };

            let event = match next {
                None | Some(Ok(StreamEvent::Done)) => return Ok(Streamed::Completed(response)),
                Some(Err(err)) => return Err(ChatOutcome::from(&err)),
                Some(Ok(event)) => event,
            };
            if let StreamEvent::TextDelta(text) = &event {
                response.push_str(text);
            }

            // A caller that stopped reading still gets the outcome.
            if listening {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        self.stop(transport).await;
                        return Ok(Streamed::Canceled(response));
                    }
                    sent = self.deltas.send(event) => listening = sent.is_ok(),
                }
            }
        }
    }

    async fn stop(&self, transport: &dyn Transport) {
        let ack = self.shared.settings.read().cancel_ack_timeout;
        if parley_util::timeout::with_timeout(ack, transport.cancel())
            .await
            .is_none()
        {
            tracing::warn!(ask_id = %self.ask_id, "transport did not confirm cancel in time");
        }
    }

    fn finish(self, outcome: ChatOutcome, reply: oneshot::Sender<ChatOutcome>) {
        let Run {
            shared,
            workspace_id,
            ask_id,
            guard,
            state,
            deltas,
            ..
        } = self;
        drop(deltas);

        let terminal = outcome.terminal_state();
        guard.set_state(terminal);
        let _ = state.send(terminal);
        drop(guard);

        if outcome.is_failure() {
            tracing::warn!(
                workspace_id,
                %ask_id,
                err_type = ?outcome.err_type,
                err_msg = %outcome.err_msg,
                "ask failed"
            );
        } else {
            tracing::info!(workspace_id, %ask_id, state = %terminal, "ask finished");
        }
        shared.publish_finished(workspace_id, &ask_id, &outcome);
        let _ = reply.send(outcome);
    }
}

/// The caller's side of one ask.
pub struct AskHandle {
    ask_id: String,
    workspace_id: u64,
    deltas: mpsc::Receiver<StreamEvent>,
    outcome: oneshot::Receiver<ChatOutcome>,
    state: watch::Receiver<DispatchState>,
    cancel: CancellationToken,
}

impl AskHandle {
    /// A handle whose outcome is already known; nothing was dispatched.
    fn settled(ask_id: String, workspace_id: u64, outcome: ChatOutcome) -> Self {
        let (_, deltas) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (_, state) = watch::channel(outcome.terminal_state());
        let _ = outcome_tx.send(outcome);
        Self {
            ask_id,
            workspace_id,
            deltas,
            outcome: outcome_rx,
            state,
            cancel: CancellationToken::new(),
        }
    }

    pub fn ask_id(&self) -> &str {
        &self.ask_id
    }

    pub fn workspace_id(&self) -> u64 {
        self.workspace_id
    }

    pub fn state(&self) -> DispatchState {
        *self.state.borrow()
    }

    /// Next streamed event in transport order. Returns `None` at the end of
    /// the stream and as soon as the ask is canceled.
    pub async fn next_delta(&mut self) -> Option<StreamEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.deltas.recv() => event,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the terminal outcome, discarding undelivered deltas.
    pub async fn outcome(mut self) -> ChatOutcome {
        self.deltas.close();
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => ChatOutcome::failure(
                ErrorKind::BackendError,
                "dispatch task ended without an outcome",
            ),
        }
    }

    /// Drains every delta, then returns them with the outcome.
    pub async fn collect(mut self) -> (Vec<StreamEvent>, ChatOutcome) {
        let mut events = Vec::new();
        while let Some(event) = self.next_delta().await {
            events.push(event);
        }
        let outcome = self.outcome().await;
        (events, outcome)
    }
}

/// Concatenated answer text of `events`.
pub fn answer_text(events: &[StreamEvent]) -> String {
    events.iter().filter_map(StreamEvent::text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_provider::{ProviderError, StreamResult};

    struct EchoTransport;

    #[async_trait]
    impl Transport for EchoTransport {
        fn kind(&self) -> BackendKind {
            BackendKind::OpenAiCompatible
        }

        async fn send(&self, request: TransportRequest) -> Result<StreamResult, ProviderError> {
            let TransportRequest::OpenAi(req) = request else {
                return Err(ProviderError::InvalidRequest("wrong kind".into()));
            };
            let events = vec![
                Ok(StreamEvent::TextDelta(format!("{}:", req.model))),
                Ok(StreamEvent::TextDelta(req.prompt)),
                Ok(StreamEvent::Done),
            ];
            Ok(Box::pin(futures::stream::iter(events)))
        }

        async fn cancel(&self) {}
    }

    struct EchoFactory;

    impl TransportFactory for EchoFactory {
        fn create(&self, _kind: BackendKind) -> Arc<dyn Transport> {
            Arc::new(EchoTransport)
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.open_ai_backends.push(parley_config::BackendProfile {
            name: "gpt".into(),
            key: "k".into(),
            endpoint: String::new(),
            short_model: "mini".into(),
            long_model: "maxi".into(),
            threshold: 100,
            temperature: 1.0,
        });
        config.presets.push(Preset {
            name: "terse".into(),
            content: "[system](#additional_instructions)\nBe terse.".into(),
        });
        config
    }

    fn setup() -> (Dispatcher, Arc<WorkspaceManager>, u64) {
        let workspaces = Arc::new(WorkspaceManager::new());
        let ws = workspaces.create("t");
        workspaces
            .update(ws.id, |w| w.backend = "gpt".into())
            .unwrap();
        let dispatcher = Dispatcher::new(workspaces.clone(), Arc::new(EchoFactory), &config());
        (dispatcher, workspaces, ws.id)
    }

    #[test]
    fn ask_request_uses_the_shell_field_names() {
        let json = serde_json::json!({
            "type": 1,
            "openai_backend": "gpt",
            "chat_context": "",
            "prompt": "hi",
        });
        let request: AskRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.kind, BackendKind::OpenAiCompatible);
        assert_eq!(request.backend, "gpt");
        assert!(request.image_url.is_none());
    }

    #[test]
    fn blank_image_url_means_no_image() {
        for blank in ["", "   "] {
            let json = serde_json::json!({
                "type": 0,
                "openai_backend": "",
                "chat_context": "",
                "prompt": "hi",
                "image_url": blank,
            });
            let request: AskRequest = serde_json::from_value(json).unwrap();
            assert!(request.image_url.is_none(), "{blank:?}");
        }
        assert_eq!(non_blank(Some("data:x".into())), Some("data:x".to_string()));
    }

    #[tokio::test]
    async fn records_of_deleted_workspaces_are_pruned() {
        let (dispatcher, workspaces, id) = setup();
        assert!(dispatcher.send(id, "a", None).unwrap().outcome().await.success);
        assert_eq!(dispatcher.tracked_turns(), 1);

        let other = workspaces.create("other");
        workspaces.update(other.id, |w| w.backend = "gpt".into()).unwrap();
        workspaces.delete(id).unwrap();
        assert!(dispatcher.send(other.id, "b", None).unwrap().outcome().await.success);
        assert_eq!(dispatcher.tracked_turns(), 1);

        dispatcher.forget(other.id);
        assert_eq!(dispatcher.tracked_turns(), 0);
    }

    #[tokio::test]
    async fn compose_prefixes_the_preset() {
        let (dispatcher, workspaces, id) = setup();
        workspaces
            .update(id, |w| {
                w.preset = "terse".into();
                w.context = "[user](#message)\nearlier".into();
            })
            .unwrap();
        let request = dispatcher.compose(id, "now").unwrap();
        assert_eq!(
            request.chat_context,
            "[system](#additional_instructions)\nBe terse.\n\n[user](#message)\nearlier"
        );
        assert_eq!(request.backend, "gpt");

        workspaces.update(id, |w| w.preset = "missing".into()).unwrap();
        assert_eq!(
            dispatcher.compose(id, "now").unwrap().chat_context,
            "[user](#message)\nearlier"
        );
    }

    #[tokio::test]
    async fn completed_ask_appends_the_turn() {
        let (dispatcher, workspaces, id) = setup();
        let handle = dispatcher.send(id, "hello", None).unwrap();
        let (events, outcome) = handle.collect().await;
        assert!(outcome.success);
        assert_eq!(answer_text(&events), "mini:hello");
        assert_eq!(
            workspaces.get(id).unwrap().context,
            "[user](#message)\nhello\n\n[assistant](#message)\nmini:hello"
        );
        assert!(!dispatcher.is_busy(id));
    }

    #[tokio::test]
    async fn unknown_workspace_is_a_caller_error() {
        let (dispatcher, _, _) = setup();
        assert!(matches!(
            dispatcher.send(404, "x", None),
            Err(DispatchError::Workspace(WorkspaceError::NotFound(404)))
        ));
        assert!(matches!(
            dispatcher.regenerate(404),
            Err(DispatchError::Workspace(_))
        ));
    }

    #[tokio::test]
    async fn regenerate_needs_a_previous_turn() {
        let (dispatcher, _, id) = setup();
        assert!(matches!(
            dispatcher.regenerate(id),
            Err(DispatchError::NothingToRegenerate(_))
        ));
        assert!(!dispatcher.is_busy(id));
    }
}
