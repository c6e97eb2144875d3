//! `ModuleGate`: the context object consumers hold.
//!
//! One gate owns one registry, one permission store, one event bus and one
//! reconciler. Gates share nothing with each other.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};

use modgate_auth::{Action, PermissionName, PermissionSet, Session};
use modgate_core::{EngineResult, ListenerError, ModuleId};
use modgate_events::{Event, EventBus, EventKind, EventPayload, Unsubscribe};
use modgate_registry::{MenuEntry, ModuleDescriptor, ModuleRegistry, ModuleStatusSource};

use crate::config::EngineConfig;
use crate::payloads::{DataSynced, ModuleChanged, PermissionsChanged, QUERY_CACHE_SOURCE, StateChanged};
use crate::permission_store::{
    PermissionSource, PermissionStore, RetryPolicy, ScriptedPermissionSource, UnauthorizedHandler,
};
use crate::reconcile::{self, ReconcileInputs, ReconcilerHandle, Trigger};
use crate::resolver::{self, ActivationState, Decision};

pub struct ModuleGateBuilder {
    registry: ModuleRegistry,
    permission_source: Option<Arc<dyn PermissionSource>>,
    status_source: Option<Arc<dyn ModuleStatusSource>>,
    unauthorized: Option<Arc<dyn UnauthorizedHandler>>,
    bus: Option<EventBus>,
    config: EngineConfig,
}

impl ModuleGateBuilder {
    pub fn permission_source(mut self, source: Arc<dyn PermissionSource>) -> Self {
        self.permission_source = Some(source);
        self
    }

    pub fn status_source(mut self, source: Arc<dyn ModuleStatusSource>) -> Self {
        self.status_source = Some(source);
        self
    }

    pub fn unauthorized_handler(mut self, handler: Arc<dyn UnauthorizedHandler>) -> Self {
        self.unauthorized = Some(handler);
        self
    }

    /// Use an existing bus instead of a fresh one.
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the gate. Must be called from within a Tokio runtime.
    pub fn build(self) -> ModuleGate {
        let config = self.config;
        let bus = self
            .bus
            .unwrap_or_else(|| EventBus::with_capacity(config.history_capacity));

        let source = self
            .permission_source
            .unwrap_or_else(|| Arc::new(ScriptedPermissionSource::new(Vec::new())));
        let mut permissions = PermissionStore::new(
            source,
            self.registry.vocabulary().clone(),
            bus.clone(),
            RetryPolicy::from_config(&config),
        );
        if let Some(handler) = self.unauthorized {
            permissions = permissions.with_unauthorized_handler(handler);
        }

        let (registry, registry_rx) = watch::channel(self.registry.clone());
        let (session, session_rx) = watch::channel(None);

        let reconciler = reconcile::spawn(
            ReconcileInputs {
                registry: registry_rx,
                session: session_rx,
                permissions: permissions.clone(),
                bus: bus.clone(),
                settle_timeout: config.permission_settle_timeout(),
            },
            config.debounce(),
        );

        tracing::info!(
            registry_version = self.registry.version(),
            modules = self.registry.len(),
            debounce_ms = config.debounce_ms,
            "module gate started"
        );

        ModuleGate {
            inner: Arc::new(Inner {
                base_registry: self.registry,
                registry,
                session,
                session_guard: Mutex::new(()),
                permissions,
                status_source: self.status_source,
                bus,
                reconciler,
            }),
        }
    }
}

/// Shared handle; clones refer to the same gate.
#[derive(Clone)]
pub struct ModuleGate {
    inner: Arc<Inner>,
}

struct Inner {
    /// Registry as loaded, before any remote overlay.
    base_registry: ModuleRegistry,
    registry: watch::Sender<ModuleRegistry>,
    session: watch::Sender<Option<Session>>,
    // Serializes session switches so loads for two users never interleave.
    session_guard: Mutex<()>,
    permissions: PermissionStore,
    status_source: Option<Arc<dyn ModuleStatusSource>>,
    bus: EventBus,
    reconciler: ReconcilerHandle,
}

impl std::fmt::Debug for ModuleGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleGate")
            .field("registry_version", &self.inner.registry.borrow().version())
            .field("authenticated", &self.is_authenticated())
            .field("passes", &self.pass_count())
            .field("bus", &self.inner.bus)
            .finish_non_exhaustive()
    }
}

impl ModuleGate {
    pub fn builder(registry: ModuleRegistry) -> ModuleGateBuilder {
        ModuleGateBuilder {
            registry,
            permission_source: None,
            status_source: None,
            unauthorized: None,
            bus: None,
            config: EngineConfig::default(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    pub fn is_module_enabled(&self, id: &str) -> bool {
        self.inner.reconciler.activation().is_enabled(id)
    }

    pub fn activation(&self) -> ActivationState {
        self.inner.reconciler.activation()
    }

    /// Receiver that observes every committed activation.
    pub fn activation_watch(&self) -> watch::Receiver<ActivationState> {
        self.inner.reconciler.activation_watch()
    }

    pub fn registry(&self) -> ModuleRegistry {
        self.inner.registry.borrow().clone()
    }

    /// Enabled modules in registration order.
    pub fn enabled_modules(&self) -> Vec<ModuleDescriptor> {
        let activation = self.activation();
        self.registry()
            .iter()
            .filter(|m| activation.is_enabled(m.id.as_str()))
            .cloned()
            .collect()
    }

    pub fn enabled_routes(&self) -> Vec<String> {
        self.enabled_modules()
            .into_iter()
            .flat_map(|m| m.routes)
            .collect()
    }

    /// Whether `path` matches a route of an enabled module. Route segments
    /// starting with `:` match any single non-empty segment.
    pub fn is_route_enabled(&self, path: &str) -> bool {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        self.enabled_modules()
            .iter()
            .flat_map(|m| m.routes.iter())
            .any(|route| route_matches(route, path))
    }

    /// Menu entries of enabled modules, ascending by `order`; ties keep
    /// registration order.
    pub fn enabled_menu_items(&self) -> Vec<MenuEntry> {
        let mut items: Vec<MenuEntry> = self
            .enabled_modules()
            .into_iter()
            .flat_map(|m| m.menu_entries)
            .collect();
        items.sort_by_key(|entry| entry.order);
        items
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.session.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.session.borrow().is_some()
    }

    /// Permissions held by the current user; empty without a session or
    /// while the store still holds another user's set.
    pub fn permissions(&self) -> PermissionSet {
        match self.inner.session.borrow().as_ref() {
            Some(session) => self.inner.permissions.permissions_for(session.user_id()),
            None => PermissionSet::empty(),
        }
    }

    pub fn is_loading_permissions(&self) -> bool {
        self.inner.permissions.is_loading()
    }

    pub fn permission_store(&self) -> &PermissionStore {
        &self.inner.permissions
    }

    /// `false` for malformed names.
    pub fn has_permission(&self, name: &str) -> bool {
        PermissionName::parse(name)
            .map(|name| self.permissions().contains(&name))
            .unwrap_or(false)
    }

    /// Whether the user holds `module.action`.
    pub fn can(&self, module: &str, action: Action) -> bool {
        ModuleId::parse(module)
            .map(|module| self.permissions().contains(&PermissionName::for_action(&module, action)))
            .unwrap_or(false)
    }

    /// Why `id` is on or off under the current inputs.
    pub fn explain(&self, id: &str) -> Decision {
        resolver::explain(&self.registry(), &self.permissions(), self.is_authenticated(), id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────

    pub fn on_module_change<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&ModuleChanged) + Send + Sync + 'static,
    {
        self.subscribe_typed(listener)
    }

    pub fn on_permission_change<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&PermissionsChanged) + Send + Sync + 'static,
    {
        self.subscribe_typed(listener)
    }

    pub fn on_state_change<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&StateChanged) + Send + Sync + 'static,
    {
        self.subscribe_typed(listener)
    }

    fn subscribe_typed<P, F>(&self, listener: F) -> Unsubscribe
    where
        P: EventPayload + 'static,
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.inner.bus.on(P::KIND, move |event: &Event| match event.decode::<P>() {
            Some(payload) => {
                listener(&payload);
                Ok(())
            }
            None => Err(ListenerError::new(format!("malformed {} payload", P::KIND))),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn history(&self, kind: Option<EventKind>, limit: Option<usize>) -> Vec<Event> {
        self.inner.bus.history(kind, limit)
    }

    /// Publish a `data_sync` event on behalf of the data-fetch layer.
    pub fn emit_data_sync(&self, payload: &DataSynced) -> usize {
        self.inner.bus.emit(Event::from_payload(QUERY_CACHE_SOURCE, payload))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Control
    // ─────────────────────────────────────────────────────────────────────

    /// Switch the authenticated identity (`None` = logged out).
    pub async fn set_session(&self, session: Option<Session>) -> EngineResult<()> {
        let _guard = self.inner.session_guard.lock().await;

        tracing::info!(
            user_id = session.as_ref().map(|s| s.user_id().to_string()),
            "session changed"
        );
        self.inner.session.send_replace(session.clone());
        self.inner.reconciler.trigger(Trigger::AuthChanged)?;

        self.inner.permissions.load(session.as_ref()).await;
        self.inner.reconciler.trigger(Trigger::PermissionsLoaded)
    }

    /// Re-fetch the current user's permissions.
    pub async fn refresh_permissions(&self) -> EngineResult<PermissionSet> {
        let session = self.session();
        let permissions = self.inner.permissions.refresh(session.as_ref()).await;
        self.inner.reconciler.trigger(Trigger::PermissionsLoaded)?;
        Ok(permissions)
    }

    /// Re-apply the remote module overlay to the loaded registry.
    ///
    /// Without a status source this only re-triggers reconciliation.
    pub async fn refresh_registry(&self) -> EngineResult<ModuleRegistry> {
        let registry = match &self.inner.status_source {
            Some(source) => self.inner.base_registry.load(source.as_ref()).await,
            None => self.inner.base_registry.clone(),
        };
        self.inner.registry.send_replace(registry.clone());
        self.inner.reconciler.trigger(Trigger::RegistryRefreshed)?;
        Ok(registry)
    }

    /// Ask for a debounced pass.
    pub fn request_reconcile(&self) -> EngineResult<()> {
        self.inner.reconciler.trigger(Trigger::Manual)
    }

    /// Run a pass now and wait for it.
    pub async fn reconcile_now(&self) -> EngineResult<()> {
        self.inner.reconciler.flush().await
    }

    pub fn pass_count(&self) -> u64 {
        self.inner.reconciler.pass_count()
    }

    pub async fn shutdown(&self) {
        self.inner.reconciler.shutdown().await;
        tracing::info!(passes = self.pass_count(), "module gate stopped");
    }
}

fn route_matches(route: &str, path: &str) -> bool {
    let route = route.trim_end_matches('/');
    let path = path.trim_end_matches('/');
    let mut route_segments = route.split('/');
    let mut path_segments = path.split('/');

    loop {
        match (route_segments.next(), path_segments.next()) {
            (None, None) => return true,
            (Some(r), Some(p)) if r.starts_with(':') && !p.is_empty() => {}
            (Some(r), Some(p)) if r == p => {}
            _ => return false,
        }
    }
}
