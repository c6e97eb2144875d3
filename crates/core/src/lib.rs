//! `modgate-core`: identifiers and the error taxonomy shared by every crate.
//!
//! This crate has no IO and no async; it only describes things.

pub mod error;
pub mod id;

pub use error::{ConfigurationError, EngineError, EngineResult, FetchError, IdError, ListenerError};
pub use id::{ModuleId, UserId};
