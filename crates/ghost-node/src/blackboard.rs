//! Shared context store ("blackboard").
//!
//! One instance per process, passed by `Arc`. State changes only through
//! [`Blackboard::update`] and [`Blackboard::log`], and every change fans out
//! to all subscribers. Subscribers run after the internal locks are
//! released, so they may read from or write to the blackboard.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

/// Pseudo-key reported in [`ContextChange::changed`] for log appends.
pub const LOG_KEY: &str = "log";

/// Retained log lines.
pub const BLACKBOARD_LOG_CAP: usize = 500;

/// Who produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// This process.
    Local,
    /// An inbound mesh flush.
    Mesh,
}

/// Notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct ContextChange {
    /// Full context after the change.
    pub values: BTreeMap<String, Value>,
    /// Keys that changed.
    pub changed: Vec<String>,
    pub source: UpdateSource,
}

/// Subscription token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Subscriber = Arc<dyn Fn(&ContextChange) + Send + Sync>;

/// Process-wide mutable context with subscribe/notify.
pub struct Blackboard {
    values: RwLock<BTreeMap<String, Value>>,
    logs: Mutex<VecDeque<String>>,
    subscribers: RwLock<Vec<(SubscriberId, Subscriber)>>,
    next_id: AtomicU64,
}

impl Blackboard {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(BTreeMap::new()),
            logs: Mutex::new(VecDeque::new()),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Merge `patch` into the context. Keys whose value is unchanged are
    /// skipped; subscribers are notified once if anything changed.
    /// Returns the changed keys.
    pub fn update(&self, patch: BTreeMap<String, Value>, source: UpdateSource) -> Vec<String> {
        let (changed, values) = {
            let mut values = self.values.write();
            let mut changed = Vec::new();
            for (key, value) in patch {
                if values.get(&key) != Some(&value) {
                    values.insert(key.clone(), value);
                    changed.push(key);
                }
            }
            (changed, values.clone())
        };

        if !changed.is_empty() {
            debug!("Blackboard {:?} update: {:?}", source, changed);
            self.notify(&ContextChange {
                values,
                changed: changed.clone(),
                source,
            });
        }
        changed
    }

    /// Set one key.
    pub fn set(&self, key: impl Into<String>, value: Value, source: UpdateSource) -> bool {
        let mut patch = BTreeMap::new();
        patch.insert(key.into(), value);
        !self.update(patch, source).is_empty()
    }

    /// Append a line to the shared log.
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        info!("{}", line);
        {
            let mut logs = self.logs.lock();
            logs.push_back(line);
            while logs.len() > BLACKBOARD_LOG_CAP {
                logs.pop_front();
            }
        }
        self.notify(&ContextChange {
            values: self.snapshot(),
            changed: vec![LOG_KEY.to_string()],
            source: UpdateSource::Local,
        });
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    /// Copy of the whole context.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.values.read().clone()
    }

    /// Copy of the log, oldest first.
    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().iter().cloned().collect()
    }

    pub fn subscribe<F>(&self, f: F) -> SubscriberId
    where
        F: Fn(&ContextChange) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(f)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    fn notify(&self, change: &ContextChange) {
        let subs: Vec<Subscriber> = self.subscribers.read().iter().map(|(_, f)| Arc::clone(f)).collect();
        for f in subs {
            f(change);
        }
    }
}

impl Default for Blackboard {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Blackboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blackboard")
            .field("keys", &self.values.read().keys().collect::<Vec<_>>())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}
