//! Grow node runtime: leaves with typed, persisted parameters, an event bus
//! with a single dispatcher, and MQTT synchronization of leaf state.

pub mod broker;
pub mod bus;
pub mod context;
pub mod error;
pub mod event;
pub mod journal;
pub mod leaf;
pub mod leaves;
pub mod maintenance;
pub mod node;
pub mod param;
pub mod protocol;
pub mod settings;
pub mod store;
pub mod web;

#[cfg(test)]
pub(crate) mod testing;

pub use broker::BrokerHandle;
pub use bus::EventBus;
pub use context::{Context, Status};
pub use error::{GrowError, Result};
pub use event::{Event, EventKind};
pub use leaf::{Descriptor, LeafHandle, LeafState, LeafTask, LeafType, Mailbox};
pub use node::Node;
pub use param::{Access, ParamValue, Storage, Validation};
pub use store::Store;
