//! Application Services
//!
//! - `ComponentRegistry`: who receives which events
//! - `Orchestrator`: the host-facing subscription API and task owner

mod orchestrator;
mod registry;

pub use orchestrator::{MuxStatus, Orchestrator, SubscribeError};
pub use registry::{ComponentRegistry, ExpiryListener, RegistryError, StreamConsumer};
