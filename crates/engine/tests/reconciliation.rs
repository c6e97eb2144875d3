use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep, sleep_until};

use modgate_auth::{Action, PermissionName, Session};
use modgate_core::{FetchError, ModuleId, UserId};
use modgate_engine::{
    Decision, EngineConfig, ModuleChanged, ModuleGate, PermissionRecord, PermissionSource,
    ScriptedPermissionSource, StateChanged,
};
use modgate_events::EventKind;
use modgate_registry::{ModuleStatus, ModuleStatusSource, StaticStatusSource, catalog};

fn config() -> EngineConfig {
    EngineConfig {
        debounce_ms: 300,
        retry_base_delay_ms: 100,
        permission_max_retries: 3,
        ..EngineConfig::default()
    }
}

fn session() -> Session {
    Session::new(UserId::new(), "token")
}

fn records(names: &[&str]) -> Vec<PermissionRecord> {
    names.iter().map(|n| PermissionRecord::named(*n)).collect()
}

fn module_changes(gate: &ModuleGate) -> Vec<ModuleChanged> {
    gate.history(Some(EventKind::ModuleChange), None)
        .iter()
        .filter_map(|e| e.decode::<ModuleChanged>())
        .collect()
}

/// Overlay whose answer for `tracking` can be flipped between fetches.
struct ToggleStatusSource {
    tracking: AtomicBool,
}

#[async_trait]
impl ModuleStatusSource for ToggleStatusSource {
    async fn fetch_statuses(&self) -> Result<Vec<ModuleStatus>, FetchError> {
        Ok(vec![ModuleStatus::new("tracking", self.tracking.load(Ordering::SeqCst))])
    }
}

/// Blocks every fetch until released.
struct HeldPermissionSource {
    release: Notify,
    calls: AtomicUsize,
    grants: Vec<PermissionRecord>,
}

#[async_trait]
impl PermissionSource for HeldPermissionSource {
    async fn fetch_permissions(&self, _session: &Session) -> Result<Vec<PermissionRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(self.grants.clone())
    }
}

#[tokio::test(start_paused = true)]
async fn burst_within_debounce_window_runs_one_pass_with_last_state() {
    let overlay = Arc::new(ToggleStatusSource {
        tracking: AtomicBool::new(false),
    });
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .status_source(overlay.clone())
        .config(config())
        .build();
    let start = Instant::now();

    gate.refresh_registry().await.unwrap();

    sleep_until(start + Duration::from_millis(50)).await;
    overlay.tracking.store(true, Ordering::SeqCst);
    gate.refresh_registry().await.unwrap();

    sleep_until(start + Duration::from_millis(100)).await;
    overlay.tracking.store(false, Ordering::SeqCst);
    gate.refresh_registry().await.unwrap();

    sleep_until(start + Duration::from_millis(399)).await;
    assert_eq!(gate.pass_count(), 0);
    assert!(gate.is_module_enabled("tracking"));

    sleep_until(start + Duration::from_millis(1_000)).await;
    assert_eq!(gate.pass_count(), 1);
    assert!(!gate.is_module_enabled("tracking"));

    let changes = module_changes(&gate);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].module_id, ModuleId::new("tracking"));
    assert!(!changes[0].enabled);
    assert_eq!(gate.history(Some(EventKind::StateChange), None).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn trigger_during_running_pass_yields_one_trailing_pass() {
    let source = Arc::new(HeldPermissionSource {
        release: Notify::new(),
        calls: AtomicUsize::new(0),
        grants: records(&["dashboard.read"]),
    });
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .permission_source(source.clone())
        .config(config())
        .build();
    let start = Instant::now();

    let login = tokio::spawn({
        let gate = gate.clone();
        async move { gate.set_session(Some(session())).await }
    });

    // The first pass starts at 300 ms and waits for the permission load.
    sleep_until(start + Duration::from_millis(400)).await;
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert!(gate.is_loading_permissions());
    assert_eq!(gate.pass_count(), 0);

    gate.request_reconcile().unwrap();
    gate.request_reconcile().unwrap();

    sleep_until(start + Duration::from_millis(800)).await;
    source.release.notify_one();
    login.await.unwrap().unwrap();

    sleep_until(start + Duration::from_millis(3_000)).await;
    assert_eq!(gate.pass_count(), 2);
    assert!(gate.is_module_enabled("dashboard"));

    // The first pass already saw the loaded set; the trailing one changes nothing.
    let changes = module_changes(&gate);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].generation, 1);
}

#[tokio::test(start_paused = true)]
async fn trailing_pass_commits_inputs_changed_during_the_running_pass() {
    let overlay = Arc::new(ToggleStatusSource {
        tracking: AtomicBool::new(true),
    });
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .permission_source(Arc::new(ScriptedPermissionSource::granting(["dashboard.read"])))
        .status_source(overlay.clone())
        .config(config())
        .build();
    let start = Instant::now();

    // While pass 1 is emitting, switch `tracking` off in the overlay.
    let flipped = Arc::new(AtomicBool::new(false));
    let _flip = {
        let gate = gate.clone();
        let overlay = overlay.clone();
        let flipped = flipped.clone();
        gate.clone().on_module_change(move |_| {
            if flipped.swap(true, Ordering::SeqCst) {
                return;
            }
            overlay.tracking.store(false, Ordering::SeqCst);
            gate.request_reconcile().unwrap();
            let gate = gate.clone();
            tokio::spawn(async move {
                let _ = gate.refresh_registry().await;
            });
        })
    };

    gate.refresh_registry().await.unwrap();
    gate.set_session(Some(session())).await.unwrap();

    sleep_until(start + Duration::from_millis(3_000)).await;
    assert!(flipped.load(Ordering::SeqCst));
    assert_eq!(gate.pass_count(), 2);
    assert!(gate.is_module_enabled("dashboard"));
    assert!(!gate.is_module_enabled("tracking"));

    let changes = module_changes(&gate);
    let first: Vec<&str> = changes
        .iter()
        .filter(|c| c.generation == 1)
        .map(|c| c.module_id.as_str())
        .collect();
    assert_eq!(first, vec!["dashboard"]);

    let trailing: Vec<&ModuleChanged> = changes.iter().filter(|c| c.generation == 2).collect();
    assert_eq!(trailing.len(), 1);
    assert_eq!(trailing[0].module_id, ModuleId::new("tracking"));
    assert!(!trailing[0].enabled);

    let summaries = gate.history(Some(EventKind::StateChange), None);
    let last = summaries.last().unwrap().decode::<StateChanged>().unwrap();
    assert_eq!(last.generation, 2);
    assert_eq!(last.changed, vec![ModuleId::new("tracking")]);
}

#[tokio::test(start_paused = true)]
async fn account_switch_never_exposes_previous_users_modules() {
    let source = Arc::new(HeldPermissionSource {
        release: Notify::new(),
        calls: AtomicUsize::new(0),
        grants: records(&["dashboard.read"]),
    });
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .permission_source(source.clone())
        .config(EngineConfig {
            permission_settle_timeout_ms: 1_000,
            ..config()
        })
        .build();
    let alice = session();
    let bob = session();

    let login = tokio::spawn({
        let gate = gate.clone();
        let alice = alice.clone();
        async move { gate.set_session(Some(alice)).await }
    });
    while source.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    source.release.notify_one();
    login.await.unwrap().unwrap();
    gate.reconcile_now().await.unwrap();
    assert!(gate.is_module_enabled("dashboard"));
    let passes_as_alice = gate.pass_count();

    // Bob's fetch never answers.
    let _switch = tokio::spawn({
        let gate = gate.clone();
        let bob = bob.clone();
        async move { gate.set_session(Some(bob)).await }
    });
    while gate.session().map(|s| s.user_id()) != Some(bob.user_id()) {
        tokio::task::yield_now().await;
    }
    assert!(gate.permissions().is_empty());
    assert!(!gate.has_permission("dashboard.read"));
    assert!(!gate.can("dashboard", Action::Read));

    sleep(Duration::from_secs(3)).await;
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    assert!(gate.pass_count() > passes_as_alice);
    assert!(!gate.is_module_enabled("dashboard"));
    assert!(gate.permissions().is_empty());
    assert_eq!(gate.permission_store().snapshot().loaded_for, None);

    let last = module_changes(&gate).pop().unwrap();
    assert_eq!(last.module_id, ModuleId::new("dashboard"));
    assert!(!last.enabled);
}

#[tokio::test(start_paused = true)]
async fn late_refresh_for_previous_user_is_not_applied_to_the_next() {
    let source = Arc::new(HeldPermissionSource {
        release: Notify::new(),
        calls: AtomicUsize::new(0),
        grants: records(&["dashboard.read"]),
    });
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .permission_source(source.clone())
        .config(EngineConfig {
            permission_settle_timeout_ms: 1_000,
            ..config()
        })
        .build();
    let alice = session();
    let bob = session();

    let login = tokio::spawn({
        let gate = gate.clone();
        let alice = alice.clone();
        async move { gate.set_session(Some(alice)).await }
    });
    while source.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    source.release.notify_one();
    login.await.unwrap().unwrap();
    gate.reconcile_now().await.unwrap();
    assert!(gate.is_module_enabled("dashboard"));

    // Alice's refresh is still in flight when Bob signs in.
    let refresh = tokio::spawn({
        let gate = gate.clone();
        async move { gate.refresh_permissions().await }
    });
    while source.calls.load(Ordering::SeqCst) == 1 {
        tokio::task::yield_now().await;
    }
    let _switch = tokio::spawn({
        let gate = gate.clone();
        let bob = bob.clone();
        async move { gate.set_session(Some(bob)).await }
    });
    while gate.session().map(|s| s.user_id()) != Some(bob.user_id()) {
        tokio::task::yield_now().await;
    }

    assert_eq!(gate.permission_store().snapshot().loaded_for, Some(alice.user_id()));
    assert!(gate.permissions().is_empty());
    assert!(!gate.can("dashboard", Action::Read));

    sleep(Duration::from_secs(3)).await;
    assert!(!gate.is_module_enabled("dashboard"));

    // Alice's answer lands; Bob's own fetch then starts and hangs.
    source.release.notify_one();
    refresh.await.unwrap().unwrap();
    while source.calls.load(Ordering::SeqCst) == 2 {
        tokio::task::yield_now().await;
    }

    sleep(Duration::from_secs(3)).await;
    assert!(!gate.is_module_enabled("dashboard"));
    assert!(gate.permissions().is_empty());
    assert_eq!(gate.permission_store().snapshot().loaded_for, None);
}

#[tokio::test(start_paused = true)]
async fn pass_waits_at_most_the_settle_timeout() {
    let source = Arc::new(HeldPermissionSource {
        release: Notify::new(),
        calls: AtomicUsize::new(0),
        grants: records(&["dashboard.read"]),
    });
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .permission_source(source.clone())
        .config(EngineConfig {
            permission_settle_timeout_ms: 1_000,
            ..config()
        })
        .build();
    let start = Instant::now();

    let _login = tokio::spawn({
        let gate = gate.clone();
        async move { gate.set_session(Some(session())).await }
    });

    sleep_until(start + Duration::from_millis(1_200)).await;
    assert_eq!(gate.pass_count(), 0);

    sleep_until(start + Duration::from_millis(1_400)).await;
    assert_eq!(gate.pass_count(), 1);
    // Authenticated but nothing loaded yet: fail closed.
    assert!(!gate.is_module_enabled("dashboard"));
    assert!(gate.is_module_enabled("tracking"));
}

#[tokio::test(start_paused = true)]
async fn unauthorized_refresh_clears_permissions_and_disables_modules() {
    let source = Arc::new(ScriptedPermissionSource::new(vec![
        Ok(records(&["dashboard.read"])),
        Err(FetchError::Unauthorized),
    ]));
    let rejected = Arc::new(AtomicUsize::new(0));
    let counter = rejected.clone();
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .permission_source(source.clone())
        .unauthorized_handler(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .config(config())
        .build();

    gate.set_session(Some(session())).await.unwrap();
    gate.reconcile_now().await.unwrap();
    assert!(gate.is_module_enabled("dashboard"));

    let after = gate.refresh_permissions().await.unwrap();
    assert!(after.is_empty());
    gate.reconcile_now().await.unwrap();

    assert!(!gate.is_module_enabled("dashboard"));
    assert_eq!(rejected.load(Ordering::SeqCst), 1);
    assert_eq!(source.calls(), 2);

    let last = module_changes(&gate).pop().unwrap();
    assert_eq!(last.module_id, ModuleId::new("dashboard"));
    assert!(!last.enabled);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_keeps_last_loaded_permissions() {
    let source = Arc::new(ScriptedPermissionSource::new(vec![
        Ok(records(&["dashboard.read"])),
        Err(FetchError::Network("connection reset".into())),
    ]));
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .permission_source(source.clone())
        .config(config())
        .build();

    gate.set_session(Some(session())).await.unwrap();
    gate.reconcile_now().await.unwrap();

    let kept = gate.refresh_permissions().await.unwrap();
    gate.reconcile_now().await.unwrap();

    assert!(kept.contains(&PermissionName::from_static("dashboard.read")));
    assert!(gate.is_module_enabled("dashboard"));
    assert_eq!(source.calls(), 1 + 4);
    assert!(gate.permission_store().last_error().is_some());
}

#[tokio::test(start_paused = true)]
async fn missing_own_permission_keeps_module_off_until_granted() {
    let partial = ModuleGate::builder(catalog::default_registry().unwrap())
        .permission_source(Arc::new(ScriptedPermissionSource::granting([
            "products.read",
            "warehouses.read",
        ])))
        .config(config())
        .build();
    partial.set_session(Some(session())).await.unwrap();
    partial.reconcile_now().await.unwrap();

    assert!(partial.is_module_enabled("products"));
    assert!(partial.is_module_enabled("warehouses"));
    assert!(!partial.is_module_enabled("inventory"));
    assert!(matches!(partial.explain("inventory"), Decision::MissingPermission { .. }));

    let full = ModuleGate::builder(catalog::default_registry().unwrap())
        .permission_source(Arc::new(ScriptedPermissionSource::granting([
            "inventory.read",
            "products.read",
            "warehouses.read",
        ])))
        .config(config())
        .build();
    full.set_session(Some(session())).await.unwrap();
    full.reconcile_now().await.unwrap();

    assert!(full.is_module_enabled("inventory"));
    assert!(full.is_route_enabled("/inventory"));
}

#[tokio::test(start_paused = true)]
async fn disabling_a_dependency_cascades() {
    let everything = [
        "products.read",
        "warehouses.read",
        "inventory.read",
        "orders.read",
        "picking.read",
        "packing.read",
    ];
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .permission_source(Arc::new(ScriptedPermissionSource::granting(everything)))
        .status_source(Arc::new(StaticStatusSource::ok(vec![ModuleStatus::new("products", false)])))
        .config(config())
        .build();

    gate.refresh_registry().await.unwrap();
    gate.set_session(Some(session())).await.unwrap();
    gate.reconcile_now().await.unwrap();

    for id in ["products", "inventory", "orders", "picking", "packing"] {
        assert!(!gate.is_module_enabled(id), "{id} should be off");
    }
    assert!(gate.is_module_enabled("warehouses"));
    assert_eq!(
        gate.explain("packing"),
        Decision::DependencyDisabled {
            dependency: ModuleId::new("picking")
        }
    );
}

#[tokio::test(start_paused = true)]
async fn module_changes_precede_the_summary_and_listeners_see_committed_state() {
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .permission_source(Arc::new(ScriptedPermissionSource::granting([
            "dashboard.read",
            "products.read",
        ])))
        .config(config())
        .build();

    let mismatches = Arc::new(AtomicUsize::new(0));
    let _check = {
        let observer = gate.clone();
        let mismatches = mismatches.clone();
        gate.on_module_change(move |change| {
            if observer.is_module_enabled(change.module_id.as_str()) != change.enabled {
                mismatches.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    gate.set_session(Some(session())).await.unwrap();
    gate.reconcile_now().await.unwrap();

    let kinds: Vec<EventKind> = gate
        .history(None, None)
        .iter()
        .map(|e| e.kind())
        .filter(|k| *k != EventKind::PermissionChange)
        .collect();
    assert_eq!(
        kinds,
        vec![EventKind::ModuleChange, EventKind::ModuleChange, EventKind::StateChange]
    );

    let summary = gate.history(Some(EventKind::StateChange), None)[0]
        .decode::<StateChanged>()
        .unwrap();
    assert_eq!(summary.changed, vec![ModuleId::new("dashboard"), ModuleId::new("products")]);
    assert!(summary.authenticated);
    assert_eq!(mismatches.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn failing_listener_does_not_block_other_consumers() {
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .permission_source(Arc::new(ScriptedPermissionSource::granting(["dashboard.read"])))
        .config(config())
        .build();

    let _boom = gate.on_module_change(|_| panic!("listener bug"));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sink = {
        let seen = seen.clone();
        gate.on_module_change(move |change| seen.lock().unwrap().push(change.module_id.clone()))
    };

    gate.set_session(Some(session())).await.unwrap();
    gate.reconcile_now().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![ModuleId::new("dashboard")]);
    assert!(gate.is_module_enabled("dashboard"));
}

#[tokio::test(start_paused = true)]
async fn history_keeps_the_most_recent_events() {
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .config(config())
        .build();

    for n in 0..101 {
        gate.emit_data_sync(&modgate_engine::DataSynced::new(format!("entity-{n}")));
    }

    let history = gate.history(Some(EventKind::DataSync), None);
    assert_eq!(history.len(), 100);
    assert_eq!(history[0].payload()["entity"], "entity-1");
    assert_eq!(history[99].payload()["entity"], "entity-100");
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_listener_is_not_called() {
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .permission_source(Arc::new(ScriptedPermissionSource::granting(["dashboard.read"])))
        .config(config())
        .build();

    let calls = Arc::new(AtomicUsize::new(0));
    let subscription = {
        let calls = calls.clone();
        gate.on_module_change(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    assert!(subscription.unsubscribe());
    assert!(!subscription.unsubscribe());

    gate.set_session(Some(session())).await.unwrap();
    gate.reconcile_now().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_gate_runs_no_passes() {
    let gate = ModuleGate::builder(catalog::default_registry().unwrap())
        .config(config())
        .build();

    sleep(Duration::from_secs(10)).await;
    assert_eq!(gate.pass_count(), 0);
    assert!(gate.history(None, None).is_empty());
    assert!(gate.is_module_enabled("tracking"));
}
