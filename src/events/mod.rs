//! Event bus and event catalogue
//!
//! The bus is the only coupling between components: the network layer,
//! the handlers and any domain consumer talk exclusively through it.

pub mod bus;
pub mod event;

pub use bus::{DispatchMode, EventBus, EventHandler, SubscriptionId};
pub use event::{Event, EventKind};
