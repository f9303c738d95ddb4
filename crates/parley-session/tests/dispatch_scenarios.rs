use async_trait::async_trait;
use parking_lot::Mutex;
use parley_config::{BackendProfile, Config, Preset};
use parley_core::ErrorKind;
use parley_provider::task::StreamTask;
use parley_provider::{
    BackendKind, ProviderError, SearchResult, StreamEvent, StreamResult, Transport,
    TransportFactory, TransportRequest,
};
use parley_session::dispatch::{answer_text, ASK_FINISHED_EVENT};
use parley_session::{
    AskRequest, AttachmentPipeline, ChatCore, DispatchState, FetchError, FilePicker, PageFetcher,
    WebFetchResult,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum Step {
    Delta(&'static str),
    Event(StreamEvent),
    Error(u16),
    Hang,
    Done,
}

#[derive(Clone)]
enum Script {
    Stream(Vec<Step>),
    Reject(u16),
}

#[derive(Default)]
struct Recorder {
    requests: Mutex<Vec<TransportRequest>>,
    creates: AtomicUsize,
    cancels: AtomicUsize,
}

impl Recorder {
    fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    fn last(&self) -> TransportRequest {
        self.requests.lock().last().cloned().expect("no request recorded")
    }
}

struct ScriptedTransport {
    kind: BackendKind,
    script: Script,
    recorder: Arc<Recorder>,
    task: StreamTask,
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn send(&self, request: TransportRequest) -> Result<StreamResult, ProviderError> {
        self.recorder.requests.lock().push(request);
        let steps = match &self.script {
            Script::Reject(status) => return Err(ProviderError::from_status(*status, "rejected")),
            Script::Stream(steps) => steps.clone(),
        };
        Ok(self.task.spawn(8, move |tx| async move {
            for step in steps {
                let item = match step {
                    Step::Delta(text) => Ok(StreamEvent::TextDelta(text.to_string())),
                    Step::Event(event) => Ok(event),
                    Step::Error(status) => Err(ProviderError::from_status(status, "scripted")),
                    Step::Done => Ok(StreamEvent::Done),
                    Step::Hang => {
                        futures::future::pending::<()>().await;
                        return;
                    }
                };
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        }))
    }

    async fn cancel(&self) {
        self.recorder.cancels.fetch_add(1, Ordering::SeqCst);
        self.task.cancel().await;
    }
}

/// Hands out queued scripts in order, then `fallback`.
struct ScriptedFactory {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    recorder: Arc<Recorder>,
}

impl TransportFactory for ScriptedFactory {
    fn create(&self, kind: BackendKind) -> Arc<dyn Transport> {
        self.recorder.creates.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Arc::new(ScriptedTransport {
            kind,
            script,
            recorder: self.recorder.clone(),
            task: StreamTask::new(),
        })
    }
}

struct ScriptedPicker(Option<PathBuf>);

#[async_trait]
impl FilePicker for ScriptedPicker {
    async fn pick_image(&self) -> Option<PathBuf> {
        self.0.clone()
    }
    async fn pick_document(&self) -> Option<PathBuf> {
        self.0.clone()
    }
}

#[derive(Default)]
struct StubFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl PageFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<WebFetchResult, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if url.contains("broken") {
            return Err(FetchError::Status(500));
        }
        Ok(WebFetchResult {
            title: "Example Page".to_string(),
            content: format!("content of {url}"),
        })
    }
}

struct Harness {
    core: ChatCore,
    recorder: Arc<Recorder>,
    fetcher: Arc<StubFetcher>,
    ws: u64,
}

fn config(revoke_reply_count: u32) -> Config {
    let mut config = Config::default();
    config.revoke_reply_count = revoke_reply_count;
    config.open_ai_backends.push(BackendProfile {
        name: "gpt-fast".to_string(),
        key: "sk".to_string(),
        endpoint: "https://api.example.com/v1".to_string(),
        short_model: "gpt-short".to_string(),
        long_model: "gpt-long".to_string(),
        threshold: 4000,
        temperature: 0.7,
    });
    config.presets.push(Preset {
        name: "pirate".to_string(),
        content: "[system](#additional_instructions)\nTalk like a pirate.".to_string(),
    });
    config
}

fn harness_with(config: Config, scripts: Vec<Script>, picked: Option<PathBuf>) -> Harness {
    let recorder = Arc::new(Recorder::default());
    let factory = Arc::new(ScriptedFactory {
        scripts: Mutex::new(scripts.into()),
        fallback: Script::Stream(vec![Step::Delta("ok"), Step::Done]),
        recorder: recorder.clone(),
    });
    let fetcher = Arc::new(StubFetcher::default());
    let pipeline = AttachmentPipeline::new(Arc::new(ScriptedPicker(picked)));
    let core = ChatCore::with_parts(&config, factory, pipeline, fetcher.clone());
    let ws = core.create_workspace("test").id;
    core.update_workspace(ws, |w| w.backend = "gpt-fast".to_string())
        .unwrap();
    Harness {
        core,
        recorder,
        fetcher,
        ws,
    }
}

fn harness(scripts: Vec<Script>) -> Harness {
    harness_with(config(0), scripts, None)
}

fn context_of(h: &Harness) -> String {
    h.core.workspaces().get(h.ws).unwrap().context
}

async fn bounded<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

#[tokio::test]
async fn scenario_a_short_model_for_small_context() {
    let h = harness(vec![Script::Stream(vec![
        Step::Delta("Hello"),
        Step::Delta(", world"),
        Step::Done,
    ])]);

    let request = AskRequest {
        kind: BackendKind::OpenAiCompatible,
        backend: "gpt-fast".to_string(),
        chat_context: "x".repeat(3000),
        prompt: "hi".to_string(),
        image_url: None,
    };
    let (events, outcome) = bounded(h.core.ask(h.ws, request).unwrap().collect()).await;

    assert!(outcome.success);
    assert_eq!(answer_text(&events), "Hello, world");
    match h.recorder.last() {
        TransportRequest::OpenAi(req) => {
            assert_eq!(req.model, "gpt-short");
            assert_eq!(req.profile.name, "gpt-fast");
        }
        other => panic!("unexpected request {other:?}"),
    }
    assert!(context_of(&h).ends_with("[assistant](#message)\nHello, world"));
}

#[tokio::test]
async fn long_context_escalates_to_long_model() {
    let h = harness(vec![]);
    h.core
        .update_workspace(h.ws, |w| w.context = "y".repeat(20_000))
        .unwrap();
    let outcome = bounded(h.core.send(h.ws, "summarise", None).unwrap().outcome()).await;
    assert!(outcome.success);
    match h.recorder.last() {
        TransportRequest::OpenAi(req) => assert_eq!(req.model, "gpt-long"),
        other => panic!("unexpected request {other:?}"),
    }
}

#[tokio::test]
async fn scenario_b_unknown_backend_fails_without_transport() {
    let h = harness(vec![]);
    let request = AskRequest {
        kind: BackendKind::OpenAiCompatible,
        backend: "unknown".to_string(),
        chat_context: String::new(),
        prompt: "hi".to_string(),
        image_url: None,
    };
    let outcome = bounded(h.core.ask(h.ws, request).unwrap().outcome()).await;

    assert!(!outcome.success);
    assert_eq!(outcome.err_type, Some(ErrorKind::BackendNotFound));
    assert_eq!(h.recorder.creates(), 0);
    assert!(context_of(&h).is_empty());
}

#[tokio::test]
async fn scenario_c_canceled_image_pick_then_plain_ask() {
    let h = harness_with(config(0), vec![], None);

    let picked = bounded(h.core.pick_image(&CancellationToken::new()))
        .await
        .unwrap();
    assert!(picked.is_canceled());

    let outcome = bounded(h.core.send(h.ws, "no picture", None).unwrap().outcome()).await;
    assert!(outcome.success);
    match h.recorder.last() {
        TransportRequest::OpenAi(req) => assert!(req.image_url.is_none()),
        other => panic!("unexpected request {other:?}"),
    }
}

#[tokio::test]
async fn canceled_pending_attachment_cancels_the_ask() {
    let h = harness_with(config(0), vec![], None);
    let pending = h.core.pending_image(CancellationToken::new());
    let outcome = bounded(h.core.send(h.ws, "with picture", Some(pending)).unwrap().outcome()).await;

    assert!(outcome.is_canceled());
    assert!(!outcome.is_failure());
    assert_eq!(h.recorder.creates(), 0);
}

#[tokio::test]
async fn scenario_d_mid_stream_cancel_leaves_context_untouched() {
    let h = harness(vec![Script::Stream(vec![Step::Delta("partial"), Step::Hang])]);
    h.core
        .update_workspace(h.ws, |w| w.context = "[user](#message)\nbefore".to_string())
        .unwrap();
    let before = context_of(&h);

    let mut handle = h.core.send(h.ws, "go", None).unwrap();
    let first = bounded(handle.next_delta()).await;
    assert_eq!(first, Some(StreamEvent::TextDelta("partial".to_string())));
    assert_eq!(handle.state(), DispatchState::Streaming);

    handle.cancel();
    assert_eq!(handle.next_delta().await, None);
    let outcome = bounded(handle.outcome()).await;

    assert!(outcome.is_canceled());
    assert_eq!(outcome.err_type, Some(ErrorKind::Canceled));
    assert_eq!(context_of(&h), before);
    assert_eq!(h.recorder.cancels.load(Ordering::SeqCst), 1);
    assert!(!h.core.dispatcher().is_busy(h.ws));
}

#[tokio::test]
async fn second_ask_on_busy_workspace_is_rejected() {
    let h = harness(vec![Script::Stream(vec![Step::Delta("working"), Step::Hang])]);

    let mut first = h.core.send(h.ws, "one", None).unwrap();
    bounded(first.next_delta()).await;
    assert_eq!(first.state(), DispatchState::Streaming);

    let second = bounded(h.core.send(h.ws, "two", None).unwrap().outcome()).await;
    assert_eq!(second.err_type, Some(ErrorKind::Busy));
    assert_eq!(first.state(), DispatchState::Streaming);
    assert_eq!(h.recorder.creates(), 1);

    let other = h.core.create_workspace("other");
    h.core
        .update_workspace(other.id, |w| w.backend = "gpt-fast".to_string())
        .unwrap();
    let parallel = bounded(h.core.send(other.id, "three", None).unwrap().outcome()).await;
    assert!(parallel.success);

    first.cancel();
    assert!(bounded(first.outcome()).await.is_canceled());
}

#[tokio::test]
async fn transport_errors_are_classified() {
    let h = harness(vec![
        Script::Reject(401),
        Script::Stream(vec![Step::Delta("so"), Step::Error(429)]),
        Script::Stream(vec![Step::Error(503)]),
    ]);

    let auth = bounded(h.core.send(h.ws, "a", None).unwrap().outcome()).await;
    assert_eq!(auth.err_type, Some(ErrorKind::AuthRejected));

    let limited = bounded(h.core.send(h.ws, "b", None).unwrap().outcome()).await;
    assert_eq!(limited.err_type, Some(ErrorKind::RateLimited));
    assert!(!limited.err_msg.is_empty());

    let down = bounded(h.core.send(h.ws, "c", None).unwrap().outcome()).await;
    assert_eq!(down.err_type, Some(ErrorKind::NetworkFailure));

    assert!(context_of(&h).is_empty());
}

#[tokio::test]
async fn revoke_guard_trips_after_configured_regenerations() {
    let h = harness_with(
        config(2),
        vec![
            Script::Stream(vec![Step::Delta("first"), Step::Done]),
            Script::Stream(vec![Step::Delta("second"), Step::Done]),
            Script::Stream(vec![Step::Delta("third"), Step::Done]),
        ],
        None,
    );

    assert!(bounded(h.core.send(h.ws, "q", None).unwrap().outcome()).await.success);
    for _ in 0..2 {
        let outcome = bounded(h.core.regenerate(h.ws).unwrap().outcome()).await;
        assert!(outcome.success);
        assert!(outcome.advisory.is_none());
    }
    let context = context_of(&h);
    assert!(context.ends_with("[assistant](#message)\nthird"));
    assert!(!context.contains("first"));
    assert_eq!(context.matches("[user](#message)").count(), 1);
    assert_eq!(h.recorder.creates(), 3);

    let advisory = bounded(h.core.regenerate(h.ws).unwrap().outcome()).await;
    assert!(advisory.success);
    assert_eq!(advisory.advisory.as_deref(), Some("Continue."));
    assert_eq!(h.recorder.creates(), 3);
    assert_eq!(context_of(&h), context);

    // A fresh ask resets the counter.
    assert!(bounded(h.core.send(h.ws, "next", None).unwrap().outcome()).await.success);
    let again = bounded(h.core.regenerate(h.ws).unwrap().outcome()).await;
    assert!(again.advisory.is_none());
    assert_eq!(h.recorder.creates(), 5);
}

#[tokio::test]
async fn canceled_regeneration_keeps_the_previous_answer() {
    let h = harness(vec![
        Script::Stream(vec![Step::Delta("first"), Step::Done]),
        Script::Stream(vec![Step::Delta("half"), Step::Hang]),
    ]);
    assert!(bounded(h.core.send(h.ws, "q", None).unwrap().outcome()).await.success);
    let before = context_of(&h);
    assert!(before.ends_with("[assistant](#message)\nfirst"));

    let mut handle = h.core.regenerate(h.ws).unwrap();
    bounded(handle.next_delta()).await;
    assert_eq!(context_of(&h), before);
    handle.cancel();
    assert!(bounded(handle.outcome()).await.is_canceled());

    assert_eq!(context_of(&h), before);
}

#[tokio::test]
async fn failed_regeneration_keeps_the_previous_answer() {
    let h = harness(vec![
        Script::Stream(vec![Step::Delta("first"), Step::Done]),
        Script::Stream(vec![Step::Error(503)]),
        Script::Stream(vec![Step::Delta("second"), Step::Done]),
    ]);
    assert!(bounded(h.core.send(h.ws, "q", None).unwrap().outcome()).await.success);
    let before = context_of(&h);

    let failed = bounded(h.core.regenerate(h.ws).unwrap().outcome()).await;
    assert_eq!(failed.err_type, Some(ErrorKind::NetworkFailure));
    assert_eq!(context_of(&h), before);

    // The turn can still be regenerated afterwards, replacing the same answer.
    assert!(bounded(h.core.regenerate(h.ws).unwrap().outcome()).await.success);
    let context = context_of(&h);
    assert!(context.ends_with("[assistant](#message)\nsecond"));
    assert!(!context.contains("first"));
    assert_eq!(context.matches("[user](#message)").count(), 1);
}

#[tokio::test]
async fn blank_image_url_is_not_sent() {
    let h = harness(vec![]);
    let request = AskRequest {
        kind: BackendKind::OpenAiCompatible,
        backend: "gpt-fast".to_string(),
        chat_context: String::new(),
        prompt: "hi".to_string(),
        image_url: Some(String::new()),
    };
    assert!(bounded(h.core.ask(h.ws, request).unwrap().outcome()).await.success);
    match h.recorder.last() {
        TransportRequest::OpenAi(req) => assert!(req.image_url.is_none()),
        other => panic!("unexpected request {other:?}"),
    }
}

#[tokio::test]
async fn zero_revoke_count_never_trips() {
    let h = harness(vec![]);
    assert!(bounded(h.core.send(h.ws, "q", None).unwrap().outcome()).await.success);
    for _ in 0..4 {
        let outcome = bounded(h.core.regenerate(h.ws).unwrap().outcome()).await;
        assert!(outcome.advisory.is_none());
    }
    assert_eq!(h.recorder.creates(), 5);
}

#[tokio::test]
async fn preset_is_prefixed_to_the_sent_context() {
    let h = harness(vec![]);
    h.core
        .update_workspace(h.ws, |w| w.preset = "pirate".to_string())
        .unwrap();
    bounded(h.core.send(h.ws, "ahoy", None).unwrap().outcome()).await;

    match h.recorder.last() {
        TransportRequest::OpenAi(req) => {
            assert!(req.context.starts_with("[system](#additional_instructions)\nTalk like a pirate."));
        }
        other => panic!("unexpected request {other:?}"),
    }
    assert!(!context_of(&h).contains("pirate"));
}

#[tokio::test]
async fn sydney_search_augmentation_fetches_prompt_links() {
    let h = harness(vec![]);
    h.core
        .update_workspace(h.ws, |w| {
            w.backend = parley_config::SYDNEY_BACKEND.to_string();
            w.locale = "de-DE".to_string();
        })
        .unwrap();

    let prompt = "Summarise https://example.com/a and https://broken.example/b";
    bounded(h.core.send(h.ws, prompt, None).unwrap().outcome()).await;

    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 2);
    match h.recorder.last() {
        TransportRequest::Sydney(req) => {
            assert!(req.context.contains("[system](#webpage_context)\nExample Page"));
            assert!(req.context.contains("content of https://example.com/a"));
            assert!(!req.context.contains("broken.example/b\n"));
            assert_eq!(req.locale, "de-DE");
            assert!(!req.no_search);
        }
        other => panic!("unexpected request {other:?}"),
    }
}

#[tokio::test]
async fn no_search_suppresses_augmentation() {
    let h = harness(vec![]);
    h.core
        .update_workspace(h.ws, |w| {
            w.backend = parley_config::SYDNEY_BACKEND.to_string();
            w.no_search = true;
        })
        .unwrap();

    bounded(h.core.send(h.ws, "read https://example.com", None).unwrap().outcome()).await;

    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
    match h.recorder.last() {
        TransportRequest::Sydney(req) => {
            assert!(!req.context.contains("webpage_context"));
            assert!(req.no_search);
        }
        other => panic!("unexpected request {other:?}"),
    }
}

#[tokio::test]
async fn auxiliary_events_keep_transport_order() {
    let search = StreamEvent::SearchResults(vec![SearchResult {
        title: "Docs".to_string(),
        url: "https://docs.rs".to_string(),
        snippet: String::new(),
    }]);
    let h = harness(vec![Script::Stream(vec![
        Step::Event(StreamEvent::SearchQuery("rust".to_string())),
        Step::Event(search.clone()),
        Step::Delta("A"),
        Step::Delta("B"),
        Step::Event(StreamEvent::Suggestions(vec!["More?".to_string()])),
        Step::Done,
    ])]);
    h.core
        .update_workspace(h.ws, |w| w.backend = parley_config::SYDNEY_BACKEND.to_string())
        .unwrap();

    let (events, outcome) = bounded(h.core.send(h.ws, "q", None).unwrap().collect()).await;
    assert!(outcome.success);
    assert_eq!(
        events,
        vec![
            StreamEvent::SearchQuery("rust".to_string()),
            search,
            StreamEvent::TextDelta("A".to_string()),
            StreamEvent::TextDelta("B".to_string()),
            StreamEvent::Suggestions(vec!["More?".to_string()]),
        ]
    );
    assert!(context_of(&h).ends_with("[assistant](#message)\nAB"));
}

#[tokio::test]
async fn document_attachment_is_folded_into_the_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "the secret is 42").unwrap();

    let h = harness_with(config(0), vec![], Some(path));
    let pending = h.core.pending_document(CancellationToken::new());
    let outcome = bounded(h.core.send(h.ws, "what is the secret?", Some(pending)).unwrap().outcome()).await;

    assert!(outcome.success);
    match h.recorder.last() {
        TransportRequest::OpenAi(req) => {
            assert!(req.context.contains("[user](#document_context)\nthe secret is 42"));
        }
        other => panic!("unexpected request {other:?}"),
    }
}

#[tokio::test]
async fn unsupported_document_fails_the_ask() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.zip");
    std::fs::write(&path, [0x50, 0x4b, 0x03, 0x04]).unwrap();

    let h = harness_with(config(0), vec![], Some(path));
    let pending = h.core.pending_document(CancellationToken::new());
    let outcome = bounded(h.core.send(h.ws, "open it", Some(pending)).unwrap().outcome()).await;

    assert_eq!(outcome.err_type, Some(ErrorKind::AttachmentUnsupported));
    assert_eq!(h.recorder.creates(), 0);
}

#[tokio::test]
async fn finished_asks_are_published() {
    let h = harness(vec![]);
    let mut events = h.core.bus().subscribe_channel();

    bounded(h.core.send(h.ws, "q", None).unwrap().outcome()).await;

    let finished = bounded(async {
        loop {
            let event = events.recv().await.unwrap();
            if event.event_type == ASK_FINISHED_EVENT.event_type {
                return event;
            }
        }
    })
    .await;
    assert_eq!(finished.properties["workspaceID"], h.ws);
    assert_eq!(finished.properties["outcome"]["success"], true);
}
