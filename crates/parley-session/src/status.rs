use parking_lot::Mutex;
use parley_core::bus::{Bus, BusEventDef};
use std::collections::HashMap;
use std::sync::Arc;

use crate::outcome::DispatchState;

/// Published whenever an in-flight ask changes state.
pub static ASK_STATE_EVENT: BusEventDef = BusEventDef::new("ask.state");

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveAsk {
    ask_id: String,
    state: DispatchState,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Workspace {workspace_id} already has an ask in flight ({ask_id})")]
pub struct BusyError {
    pub workspace_id: u64,
    pub ask_id: String,
}

type ActiveMap = Arc<Mutex<HashMap<u64, ActiveAsk>>>;

/// At most one in-flight ask per workspace.
#[derive(Clone, Default)]
pub struct BusyTracker {
    active: ActiveMap,
    bus: Option<Arc<Bus>>,
}

impl BusyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bus(bus: Arc<Bus>) -> Self {
        Self {
            active: Arc::default(),
            bus: Some(bus),
        }
    }

    /// Claims the workspace for `ask_id`. The claim lasts as long as the
    /// returned guard.
    pub fn try_begin(&self, workspace_id: u64, ask_id: &str) -> Result<BusyGuard, BusyError> {
        let mut active = self.active.lock();
        if let Some(existing) = active.get(&workspace_id) {
            return Err(BusyError {
                workspace_id,
                ask_id: existing.ask_id.clone(),
            });
        }
        active.insert(
            workspace_id,
            ActiveAsk {
                ask_id: ask_id.to_string(),
                state: DispatchState::Idle,
            },
        );
        Ok(BusyGuard {
            workspace_id,
            ask_id: ask_id.to_string(),
            active: self.active.clone(),
            bus: self.bus.clone(),
        })
    }

    pub fn is_busy(&self, workspace_id: u64) -> bool {
        self.active.lock().contains_key(&workspace_id)
    }

    /// State of the workspace's in-flight ask, `Idle` when there is none.
    pub fn state(&self, workspace_id: u64) -> DispatchState {
        self.active
            .lock()
            .get(&workspace_id)
            .map(|a| a.state)
            .unwrap_or(DispatchState::Idle)
    }

    pub fn list(&self) -> HashMap<u64, (String, DispatchState)> {
        self.active
            .lock()
            .iter()
            .map(|(id, a)| (*id, (a.ask_id.clone(), a.state)))
            .collect()
    }
}

pub struct BusyGuard {
    workspace_id: u64,
    ask_id: String,
    active: ActiveMap,
    bus: Option<Arc<Bus>>,
}

impl BusyGuard {
    pub fn workspace_id(&self) -> u64 {
        self.workspace_id
    }

    pub fn ask_id(&self) -> &str {
        &self.ask_id
    }

    pub fn set_state(&self, state: DispatchState) {
        if let Some(entry) = self.active.lock().get_mut(&self.workspace_id) {
            if entry.ask_id == self.ask_id {
                entry.state = state;
            }
        }
        if let Some(bus) = &self.bus {
            bus.publish(
                &ASK_STATE_EVENT,
                serde_json::json!({
                    "workspaceID": self.workspace_id,
                    "askID": self.ask_id,
                    "state": state,
                }),
            );
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        if active
            .get(&self.workspace_id)
            .is_some_and(|a| a.ask_id == self.ask_id)
        {
            active.remove(&self.workspace_id);
        }
    }
}
