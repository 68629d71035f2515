//! Port Interfaces
//!
//! Contracts the multiplexer consumes from its host, following the
//! Hexagonal Architecture pattern. Infrastructure adapters implement them.
//!
//! ## Driven Ports (Outbound)
//!
//! - `CredentialProvider`: bearer tokens for the private channel
//! - `Transport`: opens a framed socket to an exchange endpoint

mod credential_port;
mod transport_port;

#[cfg(test)]
pub use credential_port::MockCredentialProvider;
pub use credential_port::{BearerToken, CredentialProvider};
pub use transport_port::{
    Frame, FrameSink, FrameStream, Transport, TransportConnection, TransportError,
};
