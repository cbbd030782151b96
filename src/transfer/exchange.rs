use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::rdma::{ExchangeParameters, RKey};

/// The peer's view of a registered region.
///
/// Reads at `source_offset` target `address + offset + source_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRegionDescriptor {
    pub address: u64,
    pub offset: u64,
    pub remote_key: RKey,
}

/// Everything a peer needs to connect to a connection and read from its
/// regions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangePayload {
    pub rdma_info: ExchangeParameters,

    /// Region descriptors keyed by region key.
    pub regions: BTreeMap<String, RemoteRegionDescriptor>,
}

impl ExchangePayload {
    /// Serialize into JSON text for the side channel.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse JSON text received from the side channel.
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
