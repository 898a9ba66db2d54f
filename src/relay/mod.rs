//! Cross-account event relay
//!
//! Hub and spoke only talk through events on each other's bus. An event
//! carries a signed URL to the payload, never the payload or a task token.

pub mod bus;
pub mod consumer;
pub mod events;

pub use bus::{EventPublisher, MemoryEventBus, PublishError};
pub use consumer::{
    spawn_pump, HubRelayConsumer, RelayConsumer, RelayDisposition, RelayError, SpokeRelayConsumer,
};
pub use events::{CompletionDetail, HandoffDetail, RelayEnvelope, RelayEvent};
