//! Permission store: the current user's held permissions.
//!
//! The store caches the set per user, coalesces concurrent refreshes into one
//! fetch and publishes every state change through a `watch` channel so the
//! reconciler can wait for an in-flight load to settle.
//!
//! Failure policy:
//! - `401`: the unauthorized handler runs, the set is cleared, no retry.
//! - transient failure: retried with doubling delay, then the last set loaded
//!   for the same user is kept and the error recorded.
//! - unknown user: fail closed (empty set).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, watch};

use modgate_auth::{Action, PermissionName, PermissionSet, PermissionVocabulary, Session};
use modgate_core::{FetchError, ModuleId, UserId};
use modgate_events::{Event, EventBus};

use crate::config::EngineConfig;
use crate::payloads::{PERMISSION_STORE_SOURCE, PermissionsChanged};

/// One entry of `GET /api/users/{id}/permissions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRecord {
    #[serde(default)]
    pub id: Option<Value>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
}

impl PermissionRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            module: None,
            action: None,
        }
    }
}

/// Source of the user's permission list.
#[async_trait]
pub trait PermissionSource: Send + Sync {
    async fn fetch_permissions(&self, session: &Session) -> Result<Vec<PermissionRecord>, FetchError>;
}

/// Hook into the auth layer, invoked when the backend rejects the token.
pub trait UnauthorizedHandler: Send + Sync {
    fn on_unauthorized(&self);
}

impl<F> UnauthorizedHandler for F
where
    F: Fn() + Send + Sync,
{
    fn on_unauthorized(&self) {
        self()
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.permission_max_retries,
            base_delay: config.retry_base_delay(),
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Read-only view of the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PermissionSnapshot {
    pub permissions: PermissionSet,
    /// User the set was successfully loaded for. `None` when cleared.
    pub loaded_for: Option<UserId>,
    pub is_loading: bool,
    pub last_error: Option<FetchError>,
    /// Number of completed fetches (successful or not).
    pub completed: u64,
}

/// Shared handle; clones refer to the same store.
#[derive(Clone)]
pub struct PermissionStore {
    inner: Arc<Inner>,
}

struct Inner {
    source: Arc<dyn PermissionSource>,
    vocabulary: PermissionVocabulary,
    bus: EventBus,
    unauthorized: Option<Arc<dyn UnauthorizedHandler>>,
    retry: RetryPolicy,
    state: watch::Sender<PermissionSnapshot>,
    // Held for the duration of one fetch.
    flight: Mutex<()>,
}

impl std::fmt::Debug for PermissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionStore")
            .field("snapshot", &*self.inner.state.borrow())
            .field("retry", &self.inner.retry)
            .finish_non_exhaustive()
    }
}

impl PermissionStore {
    pub fn new(
        source: Arc<dyn PermissionSource>,
        vocabulary: PermissionVocabulary,
        bus: EventBus,
        retry: RetryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(PermissionSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                source,
                vocabulary,
                bus,
                unauthorized: None,
                retry,
                state,
                flight: Mutex::new(()),
            }),
        }
    }

    /// Attach the unauthorized handler. Only valid before the store is shared.
    pub fn with_unauthorized_handler(mut self, handler: Arc<dyn UnauthorizedHandler>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.unauthorized = Some(handler);
        } else {
            tracing::warn!("unauthorized handler ignored: permission store already shared");
        }
        self
    }

    pub fn snapshot(&self) -> PermissionSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn permissions(&self) -> PermissionSet {
        self.inner.state.borrow().permissions.clone()
    }

    /// The held set if it was loaded for `user_id`, otherwise empty.
    pub fn permissions_for(&self, user_id: UserId) -> PermissionSet {
        let state = self.inner.state.borrow();
        if state.loaded_for == Some(user_id) {
            state.permissions.clone()
        } else {
            PermissionSet::empty()
        }
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().is_loading
    }

    pub fn last_error(&self) -> Option<FetchError> {
        self.inner.state.borrow().last_error.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PermissionSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn vocabulary(&self) -> &PermissionVocabulary {
        &self.inner.vocabulary
    }

    /// `false` for malformed names.
    pub fn has_permission(&self, name: &str) -> bool {
        PermissionName::parse(name)
            .map(|name| self.inner.state.borrow().permissions.contains(&name))
            .unwrap_or(false)
    }

    /// Whether the held set contains `module.action`.
    pub fn can(&self, module: &ModuleId, action: Action) -> bool {
        self.inner
            .state
            .borrow()
            .permissions
            .contains(&PermissionName::for_action(module, action))
    }

    /// Load permissions for `session`, reusing the set already loaded for the
    /// same user.
    pub async fn load(&self, session: Option<&Session>) -> PermissionSet {
        let Some(session) = session else {
            self.clear();
            return PermissionSet::empty();
        };

        {
            let state = self.inner.state.borrow();
            if state.loaded_for == Some(session.user_id()) && state.last_error.is_none() {
                return state.permissions.clone();
            }
        }

        self.refresh(Some(session)).await
    }

    /// Force a re-fetch.
    ///
    /// A caller that queues behind a running fetch for the same user returns
    /// that fetch's result instead of starting another one.
    pub async fn refresh(&self, session: Option<&Session>) -> PermissionSet {
        let Some(session) = session else {
            self.clear();
            return PermissionSet::empty();
        };

        let ticket = self.inner.state.borrow().completed;
        let _flight = self.inner.flight.lock().await;

        {
            let state = self.inner.state.borrow();
            if state.completed > ticket && state.loaded_for == Some(session.user_id()) {
                tracing::debug!(user_id = %session.user_id(), "permission refresh coalesced");
                return state.permissions.clone();
            }
        }

        let foreign = self
            .inner
            .state
            .borrow()
            .loaded_for
            .is_some_and(|owner| owner != session.user_id());
        if foreign {
            tracing::debug!(user_id = %session.user_id(), "dropping permissions loaded for another user");
            self.clear();
        }

        self.inner.state.send_modify(|s| s.is_loading = true);
        let outcome = self.fetch_with_retry(session).await;
        self.settle(session.user_id(), outcome)
    }

    /// Drop the held set (logout).
    pub fn clear(&self) {
        let previous = self.permissions();
        let mut cleared = false;
        self.inner.state.send_if_modified(|s| {
            cleared = s.loaded_for.is_some() || !s.permissions.is_empty() || s.last_error.is_some();
            s.permissions = PermissionSet::empty();
            s.loaded_for = None;
            s.last_error = None;
            cleared
        });
        if cleared {
            self.publish(None, &previous, &PermissionSet::empty());
        }
    }

    /// Wait until no load is in flight, at most `timeout`.
    ///
    /// Returns `false` when the wait timed out.
    pub async fn settled(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| !s.is_loading)).await {
            Ok(Ok(_)) => true,
            // The sender lives as long as `self`.
            Ok(Err(_)) => true,
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "permission load did not settle in time");
                false
            }
        }
    }

    async fn fetch_with_retry(&self, session: &Session) -> Result<Vec<PermissionRecord>, FetchError> {
        let retry = self.inner.retry;
        let mut delay = retry.base_delay;
        let mut attempt = 0u32;

        loop {
            match self.inner.source.fetch_permissions(session).await {
                Ok(records) => return Ok(records),
                Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        user_id = %session.user_id(),
                        attempt,
                        error = %err,
                        "permission fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn settle(&self, user_id: UserId, outcome: Result<Vec<PermissionRecord>, FetchError>) -> PermissionSet {
        let previous = self.snapshot();

        let (permissions, loaded_for, last_error) = match outcome {
            Ok(records) => {
                let set: PermissionSet = records.iter().filter_map(|r| self.admit(r)).collect();
                tracing::info!(user_id = %user_id, count = set.len(), "permissions loaded");
                (set, Some(user_id), None)
            }
            Err(FetchError::Unauthorized) => {
                tracing::warn!(user_id = %user_id, "permission fetch unauthorized, clearing permissions");
                if let Some(handler) = &self.inner.unauthorized {
                    handler.on_unauthorized();
                }
                (PermissionSet::empty(), None, Some(FetchError::Unauthorized))
            }
            Err(err) if previous.loaded_for == Some(user_id) => {
                tracing::warn!(user_id = %user_id, error = %err, "permission fetch failed, keeping last known set");
                (previous.permissions.clone(), Some(user_id), Some(err))
            }
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "permission fetch failed, no set to fall back on");
                (PermissionSet::empty(), None, Some(err))
            }
        };

        self.inner.state.send_modify(|s| {
            s.permissions = permissions.clone();
            s.loaded_for = loaded_for;
            s.last_error = last_error;
            s.is_loading = false;
            s.completed += 1;
        });

        self.publish(Some(user_id), &previous.permissions, &permissions);
        permissions
    }

    /// Map a server record into the vocabulary.
    ///
    /// Falls back to `module.action` when the name itself is not understood.
    fn admit(&self, record: &PermissionRecord) -> Option<PermissionName> {
        let vocabulary = &self.inner.vocabulary;
        match vocabulary.validate(&record.name) {
            Ok(name) => Some(name),
            Err(err) => {
                let fallback = record
                    .module
                    .as_deref()
                    .and_then(|m| ModuleId::parse(m).ok())
                    .zip(record.action.as_deref().and_then(|a| a.parse::<Action>().ok()))
                    .map(|(module, action)| PermissionName::for_action(&module, action))
                    .filter(|name| vocabulary.contains(name));
                if fallback.is_none() {
                    tracing::warn!(permission = %record.name, error = %err, "dropping unknown permission");
                }
                fallback
            }
        }
    }

    fn publish(&self, user_id: Option<UserId>, previous: &PermissionSet, current: &PermissionSet) {
        let delta = current.delta_from(previous);
        if delta.is_empty() {
            return;
        }
        let payload = PermissionsChanged {
            user_id,
            added: delta.added,
            removed: delta.removed,
            total: current.len(),
        };
        self.inner.bus.emit(Event::from_payload(PERMISSION_STORE_SOURCE, &payload));
    }
}

/// In-memory source with scripted answers, for tests and demos.
///
/// Answers are consumed front to back; the last one repeats.
#[derive(Debug)]
pub struct ScriptedPermissionSource {
    answers: std::sync::Mutex<Vec<Result<Vec<PermissionRecord>, FetchError>>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl ScriptedPermissionSource {
    pub fn new(answers: Vec<Result<Vec<PermissionRecord>, FetchError>>) -> Self {
        Self {
            answers: std::sync::Mutex::new(answers),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Always answers with `names`.
    pub fn granting<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(vec![Ok(names.into_iter().map(PermissionRecord::named).collect())])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionSource for ScriptedPermissionSource {
    async fn fetch_permissions(&self, _session: &Session) -> Result<Vec<PermissionRecord>, FetchError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut answers = match self.answers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match answers.len() {
            0 => Ok(Vec::new()),
            1 => answers[0].clone(),
            _ => answers.remove(0),
        }
    }
}
