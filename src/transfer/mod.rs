//! One-sided READ transfers between peers.
//!
//! A transfer session goes through these steps:
//!
//! 1. Create an [`RdmaConnection`] and [`initialize`](RdmaConnection::initialize)
//!    it on a device port.
//! 2. Register local memory with [`register_memory`](RdmaConnection::register_memory).
//! 3. Exchange [`ExchangePayload`]s with the peer over any side channel.
//! 4. [`connect`](RdmaConnection::connect) to the peer and store its region
//!    descriptors.
//! 5. Issue reads described by [`Assignment`]s and await their
//!    [`ReadHandle`]s.
//!
//! [`TransferEngine`] keeps connections by session id.

mod assignment;
mod connection;
mod engine;
mod exchange;
mod memory;
mod pending;
mod poller;

use std::fmt;

pub use self::assignment::Assignment;
pub use self::connection::{connect_local, RdmaConnection};
pub use self::engine::TransferEngine;
pub use self::exchange::{ExchangePayload, RemoteRegionDescriptor};
pub use self::memory::MemoryRegion;
pub use self::pending::{ConnectionStats, ReadHandle};

/// Identifier of a transfer session.
pub type SessionId = u64;

/// Lifecycle state of an [`RdmaConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, no device resources yet.
    Uninitialized,

    /// Device opened and queue pair created; memory can be registered.
    Initialized,

    /// Queue pair connected; reads can be issued.
    Connected,

    /// Torn down. Terminal.
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
