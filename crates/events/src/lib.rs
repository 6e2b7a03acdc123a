//! Ledger events and their distribution.
//!
//! State machines emit events (facts); infrastructure persists the resulting state,
//! then publishes envelopes so side-effect consumers never run ahead of a commit.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
