//! In-process activation events and the bus that distributes them.

pub mod bus;
pub mod event;

pub use bus::{DEFAULT_HISTORY_CAPACITY, EventBus, Listener, ListenerId, Topic, Unsubscribe};
pub use event::{Event, EventKind, EventPayload};
