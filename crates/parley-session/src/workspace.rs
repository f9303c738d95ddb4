use parking_lot::RwLock;
use parley_config::{Config, Workspace};
use parley_core::bus::{Bus, BusEventDef};
use parley_provider::context;
use std::collections::HashMap;
use std::sync::Arc;

pub static WORKSPACE_CREATED_EVENT: BusEventDef = BusEventDef::new("workspace.created");
pub static WORKSPACE_UPDATED_EVENT: BusEventDef = BusEventDef::new("workspace.updated");
pub static WORKSPACE_DELETED_EVENT: BusEventDef = BusEventDef::new("workspace.deleted");
pub static WORKSPACE_SWITCHED_EVENT: BusEventDef = BusEventDef::new("workspace.switched");

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Workspace not found: {0}")]
    NotFound(u64),
}

#[derive(Default)]
struct State {
    workspaces: Vec<Workspace>,
    index: HashMap<u64, usize>,
    current: Option<u64>,
    next_id: u64,
}

impl State {
    fn reindex(&mut self) {
        self.index = self
            .workspaces
            .iter()
            .enumerate()
            .map(|(pos, ws)| (ws.id, pos))
            .collect();
    }

    fn get_mut(&mut self, id: u64) -> Result<&mut Workspace, WorkspaceError> {
        let pos = *self.index.get(&id).ok_or(WorkspaceError::NotFound(id))?;
        Ok(&mut self.workspaces[pos])
    }

    /// Latest `created_at`, ties broken by the higher id.
    fn most_recent(&self) -> Option<u64> {
        self.workspaces
            .iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .map(|ws| ws.id)
    }
}

/// Owns every workspace and the "current" pointer.
///
/// Workspaces are kept in creation order with an id -> position index; the
/// current workspace is referenced by id only. Ids grow monotonically and are
/// never handed out twice, even after deletion.
pub struct WorkspaceManager {
    state: RwLock<State>,
    bus: Option<Arc<Bus>>,
}

impl WorkspaceManager {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                next_id: 1,
                ..State::default()
            }),
            bus: None,
        }
    }

    /// Loads the persisted workspaces. Duplicate ids keep the first entry and
    /// a dangling current id falls back to the most recent workspace.
    pub fn from_config(config: &Config) -> Self {
        let mut state = State::default();
        for ws in &config.workspaces {
            if state.index.contains_key(&ws.id) {
                tracing::warn!(workspace_id = ws.id, "skipping duplicate workspace id");
                continue;
            }
            state.index.insert(ws.id, state.workspaces.len());
            state.workspaces.push(ws.clone());
        }
        state.next_id = state.workspaces.iter().map(|ws| ws.id).max().unwrap_or(0) + 1;
        state.current = config
            .current_workspace_id
            .filter(|id| state.index.contains_key(id))
            .or_else(|| state.most_recent());

        tracing::debug!(
            count = state.workspaces.len(),
            current = ?state.current,
            "loaded workspaces"
        );
        Self {
            state: RwLock::new(state),
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Arc<Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn publish(&self, def: &BusEventDef, properties: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(def, properties);
        }
    }

    /// Creates an empty workspace. It becomes current when none is.
    pub fn create(&self, title: impl Into<String>) -> Workspace {
        let ws = {
            let mut state = self.state.write();
            let id = state.next_id;
            state.next_id += 1;
            let ws = Workspace::new(id, title);
            let position = state.workspaces.len();
            state.index.insert(id, position);
            state.workspaces.push(ws.clone());
            if state.current.is_none() {
                state.current = Some(id);
            }
            ws
        };
        tracing::debug!(workspace_id = ws.id, "workspace created");
        self.publish(
            &WORKSPACE_CREATED_EVENT,
            serde_json::json!({ "workspace": ws }),
        );
        ws
    }

    pub fn switch_current(&self, id: u64) -> Result<(), WorkspaceError> {
        let previous = {
            let mut state = self.state.write();
            if !state.index.contains_key(&id) {
                return Err(WorkspaceError::NotFound(id));
            }
            state.current.replace(id)
        };
        self.publish(
            &WORKSPACE_SWITCHED_EVENT,
            serde_json::json!({ "from": previous, "to": id }),
        );
        Ok(())
    }

    /// Applies `mutator` to the workspace. Its `id` and `created_at` cannot
    /// be changed this way.
    pub fn update<F>(&self, id: u64, mutator: F) -> Result<Workspace, WorkspaceError>
    where
        F: FnOnce(&mut Workspace),
    {
        let updated = {
            let mut state = self.state.write();
            let ws = state.get_mut(id)?;
            let created_at = ws.created_at;
            mutator(ws);
            ws.id = id;
            ws.created_at = created_at;
            ws.clone()
        };
        self.publish(
            &WORKSPACE_UPDATED_EVENT,
            serde_json::json!({ "workspace": updated }),
        );
        Ok(updated)
    }

    pub fn delete(&self, id: u64) -> Result<(), WorkspaceError> {
        let current = {
            let mut state = self.state.write();
            let pos = *state.index.get(&id).ok_or(WorkspaceError::NotFound(id))?;
            state.workspaces.remove(pos);
            state.reindex();
            if state.current == Some(id) {
                state.current = state.most_recent();
            }
            state.current
        };
        tracing::debug!(workspace_id = id, current = ?current, "workspace deleted");
        self.publish(
            &WORKSPACE_DELETED_EVENT,
            serde_json::json!({ "id": id, "current": current }),
        );
        Ok(())
    }

    /// Appends one exchange to the workspace context.
    pub fn append_turn(&self, id: u64, prompt: &str, response: &str) -> Result<(), WorkspaceError> {
        self.update(id, |ws| context::append_turn(&mut ws.context, prompt, response))
            .map(|_| ())
    }

    /// Replaces the last exchange: the context becomes `pre_turn` followed by
    /// the new prompt and answer.
    pub(crate) fn replace_turn(
        &self,
        id: u64,
        pre_turn: &str,
        prompt: &str,
        response: &str,
    ) -> Result<(), WorkspaceError> {
        self.update(id, |ws| {
            ws.context = pre_turn.to_string();
            context::append_turn(&mut ws.context, prompt, response);
        })
        .map(|_| ())
    }

    pub fn get(&self, id: u64) -> Option<Workspace> {
        let state = self.state.read();
        state.index.get(&id).map(|&pos| state.workspaces[pos].clone())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.state.read().index.contains_key(&id)
    }

    pub fn current(&self) -> Option<Workspace> {
        let id = self.current_id()?;
        self.get(id)
    }

    pub fn current_id(&self) -> Option<u64> {
        self.state.read().current
    }

    pub fn list(&self) -> Vec<Workspace> {
        self.state.read().workspaces.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(workspaces, current_workspace_id)` for the settings writer.
    pub fn snapshot(&self) -> (Vec<Workspace>, Option<u64>) {
        let state = self.state.read();
        (state.workspaces.clone(), state.current)
    }

    pub fn export_into(&self, config: &mut Config) {
        let (workspaces, current) = self.snapshot();
        config.workspaces = workspaces;
        config.current_workspace_id = current;
    }
}

impl Default for WorkspaceManager {
    fn default() -> Self {
        Self::new()
    }
}
