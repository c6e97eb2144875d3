//! `modgate-registry`: the static description of every feature module.
//!
//! A [`ModuleRegistry`] is validated once at construction (no cycles, no
//! dangling dependencies, no malformed ids or permissions) and is afterwards
//! immutable. Remote overlays produce a new registry instead of editing one.

pub mod catalog;
pub mod descriptor;
pub mod overlay;
pub mod registry;

pub use descriptor::{MenuEntry, ModuleDescriptor};
pub use overlay::{ModuleStatus, ModuleStatusSource, StaticStatusSource};
pub use registry::{ModuleRegistry, validate};
