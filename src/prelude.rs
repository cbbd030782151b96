//! The rdxfer prelude.
//!
//! The purpose of this module is to alleviate imports of common transfer
//! functionalities.

pub use crate::config::{ConnectionConfig, EngineConfig};
pub use crate::error::{Error, Result};
pub use crate::rdma::{ExchangeParameters, LinkType, Mtu, PortInfo, Provider, SoftFabric, WcStatus};
#[cfg(feature = "verbs")]
pub use crate::rdma::verbs::VerbsProvider;
pub use crate::transfer::{
    connect_local, Assignment, ConnectionState, ConnectionStats, ExchangePayload, MemoryRegion,
    RdmaConnection, ReadHandle, RemoteRegionDescriptor, SessionId, TransferEngine,
};
