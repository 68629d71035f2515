//! Domain Layer - Core streaming types and subscription bookkeeping.
//!
//! No I/O lives here: the types describe what components ask for and what
//! the exchange delivers, and the ledger decides what the sockets should
//! carry.

/// Channels, data kinds, stream specs, and decoded events.
pub mod streaming;

/// Desired-versus-reconciled subscription ledger.
pub mod subscription;
