// crates/conduitcore/src/events/mod.rs

mod bus;
mod dead_letter;

pub use bus::{
    EventBus, EventBusConfig, EventHandler, EventId, IntegrationEvent, Subscription, WILDCARD,
};
pub use dead_letter::{DeadLetter, DeadLetterQueue};
