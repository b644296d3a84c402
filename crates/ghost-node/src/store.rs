//! Reducer host: the only owner of [`AppState`].

use std::sync::Arc;

use ghost_world::{reduce, Action, AppState, WorldStateSnapshot};
use parking_lot::{Mutex, RwLock};
use tracing::trace;

/// Result of one dispatch.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub state: AppState,
    /// The world snapshot differs from before the action.
    pub world_changed: bool,
}

type Listener = Arc<dyn Fn(&Action, &AppState) + Send + Sync>;

/// Applies actions in call order and notifies listeners afterwards.
#[derive(Default)]
pub struct WorldStore {
    state: Mutex<AppState>,
    listeners: RwLock<Vec<Listener>>,
}

impl WorldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&self, action: &Action) -> StateChange {
        let change = {
            let mut state = self.state.lock();
            let next = reduce(&state, action);
            let world_changed = next.world != state.world;
            *state = next.clone();
            StateChange {
                state: next,
                world_changed,
            }
        };
        trace!("Dispatched {:?}", action);

        let listeners: Vec<Listener> = self.listeners.read().clone();
        for f in listeners {
            f(action, &change.state);
        }
        change
    }

    pub fn state(&self) -> AppState {
        self.state.lock().clone()
    }

    pub fn world(&self) -> WorldStateSnapshot {
        self.state.lock().world.clone()
    }

    /// Called after every dispatch with the action and resulting state.
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&Action, &AppState) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(f));
    }
}

impl std::fmt::Debug for WorldStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorldStore")
            .field("entities", &state.world.entities.len())
            .field("mode", &state.mode)
            .finish_non_exhaustive()
    }
}
