pub mod attachment;
pub mod dispatch;
pub mod facade;
pub mod outcome;
pub mod status;
pub mod webfetch;
pub mod workspace;

pub use attachment::{
    Attachment, AttachmentError, AttachmentPipeline, AttachmentResult, DocumentAttachment,
    FilePicker, ImageAttachment, PendingAttachment,
};
pub use facade::{ChatCore, CoreError};
pub use dispatch::{AskHandle, AskRequest, DispatchError, DispatchSettings, Dispatcher};
pub use outcome::{ChatOutcome, DispatchState};
pub use status::{BusyError, BusyGuard, BusyTracker};
pub use webfetch::{FetchError, PageFetcher, WebFetchResult, WebFetcher};
pub use workspace::{WorkspaceError, WorkspaceManager};
