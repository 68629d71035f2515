//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (sockets, credentials).
pub mod ports;

/// Component registry and the orchestrator.
pub mod services;
