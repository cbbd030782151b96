//! RDMA functionalities.
//!
//! The transfer layer talks to devices through the traits in this module.
//! Two providers implement them: [`soft::SoftFabric`], an in-process
//! emulation of RC queue pairs, and (with the `verbs` feature)
//! [`verbs::VerbsProvider`] on top of `libibverbs`.
//!
//! Every resource handle is owned by exactly one holder and releases its
//! native counterpart on drop.

pub mod endpoint;
pub mod gid;
pub mod port;
pub mod soft;
pub mod type_alias;
pub mod wc;

#[cfg(feature = "verbs")]
pub mod verbs;

use std::io;
use std::time::Duration;

pub use self::endpoint::ExchangeParameters;
pub use self::gid::Gid;
pub use self::port::{LinkType, Mtu, PortInfo};
pub use self::soft::SoftFabric;
pub use self::type_alias::*;
pub use self::wc::{Wc, WcOpcode, WcStatus};

/// Queue pair capability attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    /// Maximum number of outstanding send work requests.
    pub max_send_wr: u32,

    /// Maximum number of outstanding receive work requests.
    pub max_recv_wr: u32,

    /// Maximum number of scatter/gather elements per send work request.
    pub max_send_sge: u32,

    /// Maximum number of scatter/gather elements per receive work request.
    pub max_recv_sge: u32,

    /// Number of entries of the completion queue created with the QP.
    pub cq_depth: u32,
}

/// RC transport attributes applied when driving a QP to RTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAttr {
    pub max_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub hop_limit: u8,
}

/// A one-sided RDMA READ work request with a single scatter/gather entry.
///
/// Reads `length` bytes at `remote_addr` (protected by `rkey`) into the
/// local buffer at `local_addr` (protected by `lkey`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWr {
    pub wr_id: WrId,
    pub local_addr: u64,
    pub length: u32,
    pub lkey: LKey,
    pub remote_addr: u64,
    pub rkey: RKey,
}

/// A work request list the device refused part of.
///
/// Work requests before index `posted` were accepted and will complete;
/// the rest were never posted.
#[derive(Debug, thiserror::Error)]
#[error("device accepted {posted} work requests of the list")]
pub struct PostError {
    pub posted: usize,
    #[source]
    pub source: io::Error,
}

impl PostError {
    /// Nothing of the list was posted.
    #[inline]
    pub fn none(source: io::Error) -> Self {
        Self { posted: 0, source }
    }
}

/// Source of device contexts.
pub trait Provider: Send + Sync {
    /// List the names of the devices this provider can open.
    fn device_names(&self) -> io::Result<Vec<String>>;

    /// Open a port of a device.
    ///
    /// Fails with [`crate::Error::DeviceNotFound`] if the device or port does
    /// not exist, or if the port's link layer is not `link_type`.
    fn open(
        &self,
        dev_name: &str,
        port_num: PortNum,
        link_type: LinkType,
    ) -> crate::Result<Box<dyn DeviceContext>>;
}

/// An opened device port together with its protection domain.
pub trait DeviceContext: Send + Sync {
    /// Get the attributes of the opened port.
    fn port(&self) -> &PortInfo;

    /// Register a memory area with the protection domain, permitting local
    /// write and remote read.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must stay valid and must not be freed until the
    /// returned handle is dropped.
    unsafe fn reg_mr(&self, addr: *mut u8, len: usize) -> io::Result<Box<dyn MemoryHandle>>;

    /// Create an RC queue pair in INIT state together with the completion
    /// queue that serves both of its work queues.
    fn create_qp(&self, caps: &QpCaps)
        -> io::Result<(Box<dyn QueuePair>, Box<dyn CompletionQueue>)>;
}

/// A registered memory region. Deregistered on drop.
pub trait MemoryHandle: Send + Sync {
    fn lkey(&self) -> LKey;
    fn rkey(&self) -> RKey;
}

/// An RC queue pair. Destroyed on drop.
pub trait QueuePair: Send + Sync {
    /// Get the QP number.
    fn qp_num(&self) -> Qpn;

    /// Drive the QP from INIT through RTR to RTS towards `remote`.
    fn handshake(
        &mut self,
        local: &ExchangeParameters,
        remote: &ExchangeParameters,
        attr: &ConnectAttr,
    ) -> io::Result<()>;

    /// Post a chained list of signaled READ work requests.
    ///
    /// Posting never blocks on the transfer itself; completions are reported
    /// through the completion queue. On failure, the error tells how long a
    /// prefix of `wrs` was accepted anyway.
    fn post_read(&self, wrs: &[ReadWr]) -> Result<(), PostError>;
}

/// A completion queue. Destroyed on drop, after the QP using it.
pub trait CompletionQueue: Send + Sync {
    /// Non-blockingly poll into the given buffer. Return the number of work
    /// completions polled.
    fn poll(&mut self, wc: &mut [Wc]) -> io::Result<usize>;

    /// Wait up to `timeout` for completions to arrive. Busy-polling providers
    /// may return immediately.
    fn wait(&mut self, timeout: Duration);
}
