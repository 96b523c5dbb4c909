//! Events and the bus capability the outbox relay publishes through.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod message;

pub use bus::{Delivery, Publisher, Subscriber, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBus, InMemoryBusError};
pub use message::{Message, Metadata};
