//! An RDMA transfer engine that moves memory between peer processes with
//! one-sided READs.
//!
//! `rdxfer` owns the RC connection lifecycle, memory registration and the
//! completion machinery that turns work completions into resolvable
//! [`ReadHandle`]s. Exchanging connection parameters with the peer is left
//! to the caller: [`ExchangePayload`] serializes to JSON and can travel over
//! any side channel.
//!
//! Devices are reached through a [`Provider`](rdma::Provider). The crate
//! ships [`SoftFabric`], an in-process emulation of RC queue pairs, and the
//! `libibverbs` provider behind the `verbs` feature.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use rdxfer::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let fabric = Arc::new(SoftFabric::new());
//!     let (mut src, mut dst) = (vec![42u8; 4096], vec![0u8; 4096]);
//!
//!     let a = RdmaConnection::new(fabric.clone(), ConnectionConfig::default())?;
//!     let b = RdmaConnection::new(fabric, ConnectionConfig::default())?;
//!     a.initialize(SoftFabric::ROCE_DEVICE, 1, LinkType::Ethernet)?;
//!     b.initialize(SoftFabric::ROCE_DEVICE, 1, LinkType::Ethernet)?;
//!
//!     // SAFETY: the buffers outlive both connections.
//!     unsafe {
//!         a.register_memory("kv", dst.as_mut_ptr(), dst.len())?;
//!         b.register_memory("kv", src.as_mut_ptr(), src.len())?;
//!     }
//!     connect_local(&a, &b)?;
//!
//!     a.read_async(&Assignment::new("kv", 0, 0, 4096))?.wait()?;
//!     drop((a, b));
//!     assert_eq!(src, dst);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod prelude;
pub mod rdma;
pub mod transfer;

mod utils;

pub use config::{ConfigError, ConnectionConfig, EngineConfig};
pub use error::{Error, Result};
pub use rdma::SoftFabric;
pub use transfer::{
    connect_local, Assignment, ConnectionState, ConnectionStats, ExchangePayload, MemoryRegion,
    RdmaConnection, ReadHandle, RemoteRegionDescriptor, SessionId, TransferEngine,
};
