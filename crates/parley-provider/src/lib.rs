pub mod context;
pub mod http;
pub mod model;
pub mod openai;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod stream;
pub mod sydney;
pub mod task;

pub use model::{ModelChoice, ModelTier};
pub use openai::OpenAiTransport;
pub use provider::{
    BackendKind, HttpTransportFactory, OpenAiRequest, ProviderError, SydneyRequest, Transport,
    TransportFactory, TransportRequest,
};
pub use registry::{BackendRegistry, ResolvedBackend};
pub use stream::{SearchResult, StreamEvent, StreamResult};
pub use sydney::{KblobImageStore, RemoteImageStore, SydneySettings, SydneyTransport};
pub use task::StreamTask;
