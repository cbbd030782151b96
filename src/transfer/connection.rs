use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::{fmt, mem};

use log::{debug, info, warn};

use super::assignment::Assignment;
use super::exchange::{ExchangePayload, RemoteRegionDescriptor};
use super::memory::{MemoryRegion, MemoryRegistry};
use super::pending::{ConnectionStats, PendingTable, ReadHandle};
use super::poller::CompletionPoller;
use super::ConnectionState;
use crate::config::ConnectionConfig;
use crate::rdma::*;
use crate::utils::psn::random_psn;
use crate::utils::sync::{read, write};
use crate::{Error, Result};

/// Device resources of an initialized connection.
///
/// Fields are declared in release order.
struct Resources {
    qp: Box<dyn QueuePair>,
    ctx: Box<dyn DeviceContext>,
    local: ExchangeParameters,
}

enum Lifecycle {
    Uninitialized,
    Initialized {
        res: Resources,
        cq: Box<dyn CompletionQueue>,
    },
    Connected {
        res: Resources,
        poller: CompletionPoller,
        remote: ExchangeParameters,
    },
    Stopped,
}

impl Lifecycle {
    fn state(&self) -> ConnectionState {
        match self {
            Lifecycle::Uninitialized => ConnectionState::Uninitialized,
            Lifecycle::Initialized { .. } => ConnectionState::Initialized,
            Lifecycle::Connected { .. } => ConnectionState::Connected,
            Lifecycle::Stopped => ConnectionState::Stopped,
        }
    }

    /// Get the device resources if the connection holds any.
    fn resources(&self) -> Option<&Resources> {
        match self {
            Lifecycle::Initialized { res, .. } | Lifecycle::Connected { res, .. } => Some(res),
            _ => None,
        }
    }
}

/// An RC connection to one peer, reading from the peer's memory with
/// one-sided RDMA READs.
///
/// All methods take `&self`; a connection can be shared between threads.
/// Internal locks are always taken in the order lifecycle, memory, pending.
///
/// Dropping a connection stops it.
pub struct RdmaConnection {
    provider: Arc<dyn Provider>,
    config: ConnectionConfig,
    lifecycle: RwLock<Lifecycle>,
    memory: MemoryRegistry,
    pending: Arc<PendingTable>,
    next_wr_id: AtomicU64,
}

impl fmt::Debug for RdmaConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaConnection")
            .field("state", &self.state())
            .field("memory", &self.memory)
            .field("stats", &self.stats())
            .finish()
    }
}

impl RdmaConnection {
    /// Create an uninitialized connection that will open devices through
    /// `provider`.
    pub fn new(provider: Arc<dyn Provider>, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            config,
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            memory: MemoryRegistry::default(),
            pending: Arc::new(PendingTable::default()),
            next_wr_id: AtomicU64::new(1),
        })
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        read(&self.lifecycle).state()
    }

    /// Get the configuration.
    #[inline]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open a device port and create the queue pair. Return the local
    /// parameters for the peer.
    pub fn initialize(
        &self,
        dev_name: &str,
        port_num: PortNum,
        link_type: LinkType,
    ) -> Result<ExchangeParameters> {
        let mut lifecycle = write(&self.lifecycle);
        if !matches!(*lifecycle, Lifecycle::Uninitialized) {
            return Err(Error::InvalidState {
                op: "initialize",
                state: lifecycle.state(),
            });
        }

        let ctx = self.provider.open(dev_name, port_num, link_type)?;
        let (qp, cq) = ctx
            .create_qp(&self.config.qp_caps())
            .map_err(Error::Device)?;
        let local = ExchangeParameters::new(ctx.port(), qp.qp_num(), random_psn());
        info!(
            "initialized QP {:#x} on {} port {} ({}, {})",
            local.queue_pair_number,
            dev_name,
            port_num,
            link_type,
            local.mtu
        );

        *lifecycle = Lifecycle::Initialized {
            res: Resources { qp, ctx, local },
            cq,
        };
        Ok(local)
    }

    /// Get the local parameters, if initialized.
    pub fn local_parameters(&self) -> Option<ExchangeParameters> {
        read(&self.lifecycle).resources().map(|res| res.local)
    }

    /// Get the parameters of the connected peer.
    pub fn remote_parameters(&self) -> Option<ExchangeParameters> {
        match &*read(&self.lifecycle) {
            Lifecycle::Connected { remote, .. } => Some(*remote),
            _ => None,
        }
    }

    /// Get the attributes of the bound port, if initialized.
    pub fn port(&self) -> Option<PortInfo> {
        read(&self.lifecycle)
            .resources()
            .map(|res| res.ctx.port().clone())
    }

    /// Register `length` bytes at `addr` under `key`, permitting the peer to
    /// read them.
    ///
    /// # Safety
    ///
    /// The memory area must stay valid until the connection is stopped or
    /// dropped. Bytes may be written into it by reads targeting this region.
    pub unsafe fn register_memory(
        &self,
        key: &str,
        addr: *mut u8,
        length: usize,
    ) -> Result<MemoryRegion> {
        let lifecycle = read(&self.lifecycle);
        let res = lifecycle.resources().ok_or(Error::InvalidState {
            op: "register memory",
            state: lifecycle.state(),
        })?;

        let region = self.memory.register(key, || {
            let handle = res
                .ctx
                .reg_mr(addr, length)
                .map_err(|source| Error::RegistrationFailure {
                    key: key.to_owned(),
                    source,
                })?;
            let region = MemoryRegion {
                key: key.to_owned(),
                base_address: addr as u64,
                length: length as u64,
                local_key: handle.lkey(),
                remote_key: handle.rkey(),
            };
            Ok((region, handle))
        })?;
        debug!(
            "registered `{}` at {:#x}+{} (rkey {:#x})",
            key, region.base_address, region.length, region.remote_key
        );
        Ok(region)
    }

    /// Store the peer's descriptor of region `key`, replacing any previous one.
    pub fn register_remote_memory(&self, key: &str, desc: RemoteRegionDescriptor) -> Result<()> {
        let lifecycle = read(&self.lifecycle);
        if lifecycle.resources().is_none() {
            return Err(Error::InvalidState {
                op: "register remote memory",
                state: lifecycle.state(),
            });
        }
        if self.memory.insert_remote(key, desc).is_some() {
            debug!("replaced remote descriptor of `{}`", key);
        }
        Ok(())
    }

    /// Store every region descriptor of the peer's payload.
    pub fn apply_remote_regions(&self, payload: &ExchangePayload) -> Result<()> {
        for (key, desc) in &payload.regions {
            self.register_remote_memory(key, *desc)?;
        }
        Ok(())
    }

    /// Get a registered local region.
    pub fn region(&self, key: &str) -> Option<MemoryRegion> {
        self.memory.local(key)
    }

    /// Get all registered local regions.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.memory.regions()
    }

    /// Get the stored descriptor of a peer region.
    pub fn remote_region(&self, key: &str) -> Option<RemoteRegionDescriptor> {
        self.memory.remote(key)
    }

    /// Build the payload the peer needs to connect and read from this
    /// connection's regions.
    pub fn exchange_payload(&self) -> Result<ExchangePayload> {
        let lifecycle = read(&self.lifecycle);
        let res = lifecycle.resources().ok_or(Error::InvalidState {
            op: "build exchange payload",
            state: lifecycle.state(),
        })?;
        Ok(ExchangePayload {
            rdma_info: res.local,
            regions: self.memory.descriptors(),
        })
    }

    /// Connect the queue pair to the peer and start polling completions.
    ///
    /// On a rejected handshake the connection stays initialized.
    pub fn connect(&self, remote: &ExchangeParameters) -> Result<()> {
        let mut lifecycle = write(&self.lifecycle);
        let (mut res, cq) = match mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Initialized { res, cq } => (res, cq),
            other => {
                let state = other.state();
                *lifecycle = other;
                return Err(Error::InvalidState {
                    op: "connect",
                    state,
                });
            }
        };

        let attr = self.config.connect_attr();
        if let Err(e) = res.qp.handshake(&res.local, remote, &attr) {
            warn!(
                "handshake of QP {:#x} with {:#x} failed: {}",
                res.local.queue_pair_number, remote.queue_pair_number, e
            );
            *lifecycle = Lifecycle::Initialized { res, cq };
            return Err(Error::HandshakeFailure(e));
        }

        let poller = CompletionPoller::spawn(
            format!("rdxfer-cq-{:#x}", res.local.queue_pair_number),
            cq,
            self.pending.clone(),
            self.config.poll_batch,
            self.config.poll_idle_timeout(),
        );
        let poller = match poller {
            Ok(poller) => poller,
            Err(e) => {
                // The CQ went down with the thread closure; nothing can be
                // polled anymore.
                self.release(res, None);
                return Err(Error::Device(e));
            }
        };

        info!(
            "QP {:#x} connected to {:#x} (path MTU {})",
            res.local.queue_pair_number,
            remote.queue_pair_number,
            res.local.mtu.min(remote.mtu)
        );
        *lifecycle = Lifecycle::Connected {
            res,
            poller,
            remote: *remote,
        };
        Ok(())
    }

    /// Read one assignment. The returned handle resolves once the read
    /// completes.
    pub fn read_async(&self, assignment: &Assignment) -> Result<ReadHandle> {
        self.post(std::slice::from_ref(assignment))
    }

    /// Read a batch of assignments as one operation. The returned handle
    /// resolves once every constituent completed, with the first failure if
    /// any failed.
    pub fn read_batch_async(&self, assignments: &[Assignment]) -> Result<ReadHandle> {
        if assignments.is_empty() {
            return Err(Error::InvalidAssignment("empty batch".into()));
        }
        self.post(assignments)
    }

    /// Read one assignment and block until it completes.
    pub fn read(&self, assignment: &Assignment) -> Result<()> {
        self.read_async(assignment)?.wait()
    }

    fn post(&self, assignments: &[Assignment]) -> Result<ReadHandle> {
        let lifecycle = read(&self.lifecycle);
        let res = match &*lifecycle {
            Lifecycle::Connected { res, .. } => res,
            Lifecycle::Stopped => {
                return Err(Error::InvalidState {
                    op: "read",
                    state: ConnectionState::Stopped,
                })
            }
            _ => return Err(Error::NotConnected),
        };

        let mut wrs = self.build_wrs(assignments)?;
        let n = wrs.len() as u64;
        let first = self.next_wr_id.fetch_add(n, Ordering::Relaxed);
        for (wr, wr_id) in wrs.iter_mut().zip(first..) {
            wr.wr_id = wr_id;
        }

        let handle = self.pending.insert(first..first + n);
        if let Err(e) = res.qp.post_read(&wrs) {
            // The accepted prefix stays tracked until it completes.
            self.pending.cancel(first + e.posted as u64..first + n);
            if e.posted > 0 {
                warn!(
                    "read {}: device accepted {} of {} WRs: {}",
                    first, e.posted, n, e.source
                );
            }
            return Err(Error::PostFailure(e.source));
        }
        debug!(
            "posted read {} ({} WRs, {} bytes)",
            first,
            n,
            wrs.iter().map(|wr| wr.length as u64).sum::<u64>()
        );
        Ok(handle)
    }

    /// Translate assignments into work requests, splitting long ones. Work
    /// request ids are left for the caller to assign.
    ///
    /// The whole list must fit the send queue.
    fn build_wrs(&self, assignments: &[Assignment]) -> Result<Vec<ReadWr>> {
        let chunk = self.config.max_read_chunk;
        let mut resolved = Vec::with_capacity(assignments.len());
        let mut count = 0u64;
        for a in assignments {
            if a.length == 0 {
                return Err(Error::InvalidAssignment(format!("{} is empty", a)));
            }
            let (local, remote) = self.memory.resolve(&a.region_key)?;
            if !local.contains(a.target_offset, a.length) {
                return Err(Error::InvalidAssignment(format!(
                    "{} exceeds local region of {} bytes",
                    a, local.length
                )));
            }
            let remote_base = remote
                .address
                .checked_add(remote.offset)
                .and_then(|addr| addr.checked_add(a.source_offset))
                .filter(|addr| addr.checked_add(a.length).is_some())
                .ok_or_else(|| {
                    Error::InvalidAssignment(format!("{} overflows the remote address space", a))
                })?;

            count = count.saturating_add(a.length.div_ceil(chunk));
            if count > self.config.max_send_wr as u64 {
                return Err(Error::InvalidAssignment(format!(
                    "read needs more than {} work requests of at most {} bytes",
                    self.config.max_send_wr, chunk
                )));
            }
            resolved.push((a, local, remote.remote_key, remote_base));
        }

        let mut wrs = Vec::with_capacity(count as usize);
        for (a, local, rkey, remote_base) in resolved {
            for piece in a.pieces(chunk) {
                let skip = piece.source_offset - a.source_offset;
                wrs.push(ReadWr {
                    wr_id: 0,
                    local_addr: local.base_address + piece.target_offset,
                    length: piece.length as u32,
                    lkey: local.local_key,
                    remote_addr: remote_base + skip,
                    rkey,
                });
            }
        }
        Ok(wrs)
    }

    /// Get the work request counters.
    pub fn stats(&self) -> ConnectionStats {
        self.pending.stats()
    }

    /// Number of unresolved read operations.
    pub fn pending_reads(&self) -> usize {
        self.pending.len()
    }

    /// Tear the connection down: stop polling, fail unresolved reads with
    /// [`Error::Disconnected`], then release the queue pair, the completion
    /// queue, the memory regions and the device, in this order.
    ///
    /// Stopping a stopped connection does nothing.
    pub fn stop(&self) {
        let mut lifecycle = write(&self.lifecycle);
        match mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Stopped => return,
            Lifecycle::Uninitialized => {}
            Lifecycle::Initialized { res, cq } => self.release(res, Some(cq)),
            Lifecycle::Connected { res, poller, .. } => {
                let cq = poller.stop();
                self.release(res, cq);
            }
        }
        info!("connection stopped");
    }

    fn release(&self, res: Resources, cq: Option<Box<dyn CompletionQueue>>) {
        let failed = self.pending.fail_all();
        if failed > 0 {
            warn!("{} pending reads failed on teardown", failed);
        }

        let Resources { qp, ctx, local } = res;
        drop(qp);
        drop(cq);
        self.memory.clear();
        drop(ctx);
        debug!("released QP {:#x}", local.queue_pair_number);
    }
}

impl Drop for RdmaConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Connect two connections of this process to each other and exchange their
/// region descriptors.
///
/// Regions registered on either side after this call must be exchanged
/// separately.
pub fn connect_local(a: &RdmaConnection, b: &RdmaConnection) -> Result<()> {
    let pa = a.exchange_payload()?;
    let pb = b.exchange_payload()?;
    a.connect(&pb.rdma_info)?;
    b.connect(&pa.rdma_info)?;
    a.apply_remote_regions(&pb)?;
    b.apply_remote_regions(&pa)?;
    Ok(())
}
