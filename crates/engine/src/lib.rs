//! `modgate-engine`: decides which feature modules are active for the
//! current user and keeps that decision in sync with permissions and the
//! remote module registry.
//!
//! The entry point is [`ModuleGate`]:
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use modgate_engine::ModuleGate;
//! use modgate_registry::catalog;
//!
//! let gate = ModuleGate::builder(catalog::default_registry()?).build();
//! gate.reconcile_now().await?;
//! assert!(gate.is_module_enabled("tracking"));
//! # Ok(())
//! # }
//! ```

pub mod cache_bridge;
pub mod config;
pub mod gate;
pub mod payloads;
pub mod permission_store;
pub mod reconcile;
pub mod remote;
pub mod resolver;

pub use cache_bridge::{CacheInvalidationBridge, QueryInvalidator, QueryScope};
pub use config::EngineConfig;
pub use gate::{ModuleGate, ModuleGateBuilder};
pub use payloads::{DataSynced, ModuleChanged, PermissionsChanged, StateChanged};
pub use permission_store::{
    PermissionRecord, PermissionSnapshot, PermissionSource, PermissionStore, RetryPolicy,
    ScriptedPermissionSource, UnauthorizedHandler,
};
pub use reconcile::{ReconcileMachine, ReconcilerHandle, Trigger};
pub use remote::{HttpModuleStatusSource, HttpPermissionSource};
pub use resolver::{ActivationState, Decision, explain, resolve};
