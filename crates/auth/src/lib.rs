//! `modgate-auth`: permission value objects and the session boundary.
//!
//! This crate is intentionally decoupled from HTTP and storage. It does not
//! authenticate anyone; it only models what an authenticated session holds.

pub mod permission_set;
pub mod permissions;
pub mod session;
pub mod vocabulary;

pub use permission_set::{PermissionDelta, PermissionSet};
pub use permissions::{Action, PermissionError, PermissionName};
pub use session::Session;
pub use vocabulary::PermissionVocabulary;
