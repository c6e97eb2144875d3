//! Bridge from activation events to a query cache.
//!
//! | event               | invalidates                 |
//! |---------------------|-----------------------------|
//! | `module_change`     | queries of that module      |
//! | `permission_change` | everything                  |
//! | `data_sync`         | queries of the synced entity |

use std::sync::Arc;

use modgate_core::{ListenerError, ModuleId};
use modgate_events::{Event, EventBus, EventKind, Unsubscribe};

use crate::payloads::{DataSynced, ModuleChanged};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    All,
    Module(ModuleId),
    Entity(String),
}

/// The cache side of the bridge.
pub trait QueryInvalidator: Send + Sync {
    fn invalidate(&self, scope: &QueryScope);
}

/// Keeps the bridge's subscriptions alive; dropping it detaches.
#[derive(Debug)]
pub struct CacheInvalidationBridge {
    subscriptions: Vec<Unsubscribe>,
}

impl CacheInvalidationBridge {
    pub fn attach(bus: &EventBus, invalidator: Arc<dyn QueryInvalidator>) -> Self {
        let on_module = {
            let invalidator = invalidator.clone();
            bus.on(EventKind::ModuleChange, move |event: &Event| {
                let change = event
                    .decode::<ModuleChanged>()
                    .ok_or_else(|| ListenerError::new("malformed module_change payload"))?;
                invalidator.invalidate(&QueryScope::Module(change.module_id));
                Ok(())
            })
        };

        let on_permissions = {
            let invalidator = invalidator.clone();
            bus.on(EventKind::PermissionChange, move |_event: &Event| {
                invalidator.invalidate(&QueryScope::All);
                Ok(())
            })
        };

        let on_sync = bus.on(EventKind::DataSync, move |event: &Event| {
            let sync = event
                .decode::<DataSynced>()
                .ok_or_else(|| ListenerError::new("malformed data_sync payload"))?;
            invalidator.invalidate(&QueryScope::Entity(sync.entity));
            Ok(())
        });

        tracing::debug!("cache invalidation bridge attached");
        Self {
            subscriptions: vec![on_module, on_permissions, on_sync],
        }
    }

    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for CacheInvalidationBridge {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::{PERMISSION_STORE_SOURCE, PermissionsChanged, RECONCILER_SOURCE};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<QueryScope>>);

    impl QueryInvalidator for Recorder {
        fn invalidate(&self, scope: &QueryScope) {
            self.0.lock().unwrap().push(scope.clone());
        }
    }

    fn module_changed(id: &'static str) -> Event {
        Event::from_payload(
            RECONCILER_SOURCE,
            &ModuleChanged {
                module_id: ModuleId::new(id),
                enabled: false,
                generation: 1,
            },
        )
    }

    #[test]
    fn events_map_to_scopes() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let _bridge = CacheInvalidationBridge::attach(&bus, recorder.clone());

        bus.emit(module_changed("orders"));
        bus.emit(Event::from_payload(
            PERMISSION_STORE_SOURCE,
            &PermissionsChanged {
                user_id: None,
                added: Vec::new(),
                removed: Vec::new(),
                total: 0,
            },
        ));
        bus.emit(Event::from_payload("query-cache", &DataSynced::new("shipments")));

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                QueryScope::Module(ModuleId::new("orders")),
                QueryScope::All,
                QueryScope::Entity("shipments".into()),
            ]
        );
    }

    #[test]
    fn malformed_payload_is_isolated() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let _bridge = CacheInvalidationBridge::attach(&bus, recorder.clone());

        let delivered = bus.emit(Event::new(EventKind::ModuleChange, "test", serde_json::json!({ "x": 1 })));
        assert_eq!(delivered, 0);
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn detach_unsubscribes() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let bridge = CacheInvalidationBridge::attach(&bus, recorder.clone());
        assert_eq!(bus.listener_count(), 3);

        bridge.detach();
        assert_eq!(bus.listener_count(), 0);
        bus.emit(module_changed("orders"));
        assert!(recorder.0.lock().unwrap().is_empty());
    }
}
