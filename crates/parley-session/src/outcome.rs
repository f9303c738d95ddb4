use parley_core::ErrorKind;
use parley_provider::ProviderError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an ask is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Idle,
    AttachmentPending,
    Dispatched,
    Streaming,
    Completed,
    Failed,
    Canceled,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchState::Idle => "idle",
            DispatchState::AttachmentPending => "attachment_pending",
            DispatchState::Dispatched => "dispatched",
            DispatchState::Streaming => "streaming",
            DispatchState::Completed => "completed",
            DispatchState::Failed => "failed",
            DispatchState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchState::Completed | DispatchState::Failed | DispatchState::Canceled
        )
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of one ask.
///
/// A canceled ask has `success: false` and `err_type: Canceled`, but is not a
/// failure: check [`ChatOutcome::is_canceled`] before treating it as one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_type: Option<ErrorKind>,
    #[serde(default)]
    pub err_msg: String,
    /// Set when the regenerate guard tripped instead of asking again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory: Option<String>,
}

impl ChatOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            err_type: None,
            err_msg: String::new(),
            advisory: None,
        }
    }

    pub fn advisory(text: impl Into<String>) -> Self {
        Self {
            advisory: Some(text.into()),
            ..Self::success()
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            err_type: Some(kind),
            err_msg: message.into(),
            advisory: None,
        }
    }

    pub fn canceled() -> Self {
        Self::failure(ErrorKind::Canceled, "canceled by user")
    }

    pub fn is_canceled(&self) -> bool {
        self.err_type == Some(ErrorKind::Canceled)
    }

    pub fn is_failure(&self) -> bool {
        !self.success && !self.is_canceled()
    }

    pub fn terminal_state(&self) -> DispatchState {
        if self.success {
            DispatchState::Completed
        } else if self.is_canceled() {
            DispatchState::Canceled
        } else {
            DispatchState::Failed
        }
    }
}

impl From<&ProviderError> for ChatOutcome {
    fn from(err: &ProviderError) -> Self {
        ChatOutcome::failure(err.kind(), err.to_string())
    }
}
