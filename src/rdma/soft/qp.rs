//! Soft queue pairs and completion queues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::{io, ptr};

use log::{debug, error};

use super::FabricInner;
use crate::rdma::*;
use crate::utils::sync::{lock, read};

/// Largest number of outstanding RDMA READs a soft QP accepts as initiator.
const MAX_RD_ATOMIC: u8 = 16;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QpState {
    Init,
    Rtr,
    Rts,
    Error,
}

#[derive(Debug)]
struct QpStatus {
    state: QpState,
    remote: Option<Qpn>,
    path_mtu: Option<Mtu>,
}

impl QpStatus {
    /// Move to `next`, permitting only the transitions a QP can take while
    /// connecting.
    fn modify(&mut self, next: QpState) -> io::Result<()> {
        match (self.state, next) {
            (QpState::Init, QpState::Rtr) | (QpState::Rtr, QpState::Rts) => {
                self.state = next;
                Ok(())
            }
            (from, to) => Err(invalid(format!("cannot modify QP from {:?} to {:?}", from, to))),
        }
    }
}

/// State shared between a QP handle, its worker thread and the fabric.
pub(super) struct QpShared {
    fabric: Arc<FabricInner>,
    port: PortInfo,
    pd: u64,
    qpn: Qpn,
    max_send_wr: u32,
    status: Mutex<QpStatus>,

    /// Posted work requests whose completion has not been generated.
    outstanding: AtomicU32,
    cq: Arc<CqShared>,
}

impl QpShared {
    fn state(&self) -> QpState {
        lock(&self.status).state
    }

    /// Find a live QP on the fabric.
    fn lookup(&self, qpn: Qpn) -> Option<Arc<QpShared>> {
        lock(&self.fabric.qps).get(&qpn).and_then(Weak::upgrade)
    }

    /// Execute one work request and produce its completion status.
    fn execute(&self, wr: &ReadWr) -> WcStatus {
        let remote = {
            let status = lock(&self.status);
            match (status.state, status.remote) {
                (QpState::Rts, Some(remote)) => remote,
                _ => return WcStatus::WrFlushErr,
            }
        };

        match self.transfer(wr, remote) {
            Ok(()) => WcStatus::Success,
            Err(status) => {
                debug!(
                    "soft QP {:#x}: WR {} failed with {}, entering error state",
                    self.qpn, wr.wr_id, status
                );
                lock(&self.status).state = QpState::Error;
                status
            }
        }
    }

    fn transfer(&self, wr: &ReadWr, remote: Qpn) -> Result<(), WcStatus> {
        // A vanished or unconnected responder never acknowledges.
        let peer = self.lookup(remote).ok_or(WcStatus::RetryExcErr)?;
        if !matches!(peer.state(), QpState::Rtr | QpState::Rts) {
            return Err(WcStatus::RetryExcErr);
        }

        let regions = read(&self.fabric.regions);
        let local_ok = regions
            .get(&wr.lkey)
            .is_some_and(|r| r.pd == self.pd && r.contains(wr.local_addr, wr.length));
        if !local_ok {
            return Err(WcStatus::LocProtErr);
        }
        let remote_ok = regions
            .get(&wr.rkey)
            .is_some_and(|r| r.pd == peer.pd && r.contains(wr.remote_addr, wr.length));
        if !remote_ok {
            return Err(WcStatus::RemAccessErr);
        }

        // SAFETY: both ranges lie in registered regions. Their owners keep
        // them valid until deregistration, which needs the write lock and thus
        // waits for this copy.
        unsafe {
            ptr::copy(
                wr.remote_addr as *const u8,
                wr.local_addr as *mut u8,
                wr.length as usize,
            )
        };
        Ok(())
    }
}

/// Worker loop of a soft QP.
fn run(shared: Arc<QpShared>, rx: Receiver<ReadWr>) {
    for wr in rx {
        let status = shared.execute(&wr);
        let byte_len = match status {
            WcStatus::Success => wr.length,
            _ => 0,
        };
        shared.outstanding.fetch_sub(1, Ordering::AcqRel);
        shared.cq.push(Wc {
            wr_id: wr.wr_id,
            status,
            opcode: WcOpcode::RdmaRead,
            byte_len,
        });
    }
}

/// Soft RC queue pair.
pub(super) struct SoftQp {
    shared: Arc<QpShared>,
    tx: Option<Sender<ReadWr>>,
    worker: Option<JoinHandle<()>>,
}

impl SoftQp {
    /// Create a QP in INIT state and the CQ serving it, and publish the QP on
    /// the fabric.
    pub(super) fn new(
        fabric: Arc<FabricInner>,
        port: PortInfo,
        pd: u64,
        caps: &QpCaps,
    ) -> io::Result<(Self, SoftCq)> {
        let qpn = fabric.next_qpn.fetch_add(1, Ordering::Relaxed);
        let cq = Arc::new(CqShared::default());
        let shared = Arc::new(QpShared {
            fabric: fabric.clone(),
            port,
            pd,
            qpn,
            max_send_wr: caps.max_send_wr,
            status: Mutex::new(QpStatus {
                state: QpState::Init,
                remote: None,
                path_mtu: None,
            }),
            outstanding: AtomicU32::new(0),
            cq: cq.clone(),
        });

        let (tx, rx) = mpsc::channel();
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("soft-qp-{:#x}", qpn))
                .spawn(move || run(shared, rx))?
        };
        lock(&fabric.qps).insert(qpn, Arc::downgrade(&shared));

        Ok((
            Self {
                shared,
                tx: Some(tx),
                worker: Some(worker),
            },
            SoftCq { shared: cq },
        ))
    }
}

impl QueuePair for SoftQp {
    fn qp_num(&self) -> Qpn {
        self.shared.qpn
    }

    fn handshake(
        &mut self,
        local: &ExchangeParameters,
        remote: &ExchangeParameters,
        attr: &ConnectAttr,
    ) -> io::Result<()> {
        let shared = &self.shared;
        if local.queue_pair_number != shared.qpn {
            return Err(invalid("local parameters describe another QP"));
        }
        if attr.timeout > 31 || attr.min_rnr_timer > 31 {
            return Err(invalid("timer values must be 5-bit"));
        }
        if attr.retry_cnt > 7 || attr.rnr_retry > 7 {
            return Err(invalid("retry counts must be 3-bit"));
        }
        if attr.max_rd_atomic > MAX_RD_ATOMIC {
            return Err(invalid(format!(
                "max_rd_atomic exceeds device limit {}",
                MAX_RD_ATOMIC
            )));
        }

        let peer = shared
            .lookup(remote.queue_pair_number)
            .ok_or_else(|| invalid(format!("no QP {:#x} on the fabric", remote.queue_pair_number)))?;
        if peer.port.link_type != shared.port.link_type {
            return Err(invalid("peer port has a different link layer"));
        }
        if shared.port.link_type.is_global() {
            if remote.gid_index < 0 {
                return Err(invalid("GID index required on Ethernet ports"));
            }
            if remote.gid != peer.port.gid {
                return Err(invalid(format!("no port with GID {:?}", remote.gid)));
            }
        } else if remote.lid != peer.port.lid {
            return Err(invalid(format!("no port with LID {}", remote.lid)));
        }

        let mut status = lock(&shared.status);
        if status.state != QpState::Init {
            return Err(invalid(format!("QP is in {:?} state", status.state)));
        }
        status.modify(QpState::Rtr)?;
        status.remote = Some(remote.queue_pair_number);
        status.path_mtu = Some(local.mtu.min(remote.mtu));
        status.modify(QpState::Rts)?;
        debug!(
            "soft QP {:#x} connected to {:#x} (path MTU {:?})",
            shared.qpn, remote.queue_pair_number, status.path_mtu
        );
        Ok(())
    }

    fn post_read(&self, wrs: &[ReadWr]) -> Result<(), PostError> {
        let shared = &self.shared;
        match shared.state() {
            QpState::Rts | QpState::Error => {}
            state => {
                return Err(PostError::none(invalid(format!(
                    "cannot post send in {:?} state",
                    state
                ))))
            }
        }

        let n = wrs.len() as u32;
        let reserved = shared
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(n).filter(|&x| x <= shared.max_send_wr)
            });
        if reserved.is_err() {
            return Err(PostError::none(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "send queue full",
            )));
        }

        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PostError::none(io::Error::from(io::ErrorKind::BrokenPipe)))?;
        for (posted, wr) in wrs.iter().enumerate() {
            tx.send(*wr).map_err(|_| PostError {
                posted,
                source: io::Error::new(io::ErrorKind::BrokenPipe, "QP worker exited"),
            })?;
        }
        Ok(())
    }
}

impl Drop for SoftQp {
    fn drop(&mut self) {
        lock(&self.shared.status).state = QpState::Error;
        lock(&self.shared.fabric.qps).remove(&self.shared.qpn);

        // Queued work requests are flushed, then the worker exits.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("worker of soft QP {:#x} panicked", self.shared.qpn);
            }
        }
    }
}

/// Completion entries shared between a QP worker and the CQ handle.
#[derive(Default)]
pub(super) struct CqShared {
    queue: Mutex<VecDeque<Wc>>,
    ready: Condvar,
}

impl CqShared {
    fn push(&self, wc: Wc) {
        lock(&self.queue).push_back(wc);
        self.ready.notify_all();
    }
}

/// Soft completion queue.
pub(super) struct SoftCq {
    shared: Arc<CqShared>,
}

impl CompletionQueue for SoftCq {
    fn poll(&mut self, wc: &mut [Wc]) -> io::Result<usize> {
        let mut queue = lock(&self.shared.queue);
        let n = wc.len().min(queue.len());
        for (slot, entry) in wc.iter_mut().zip(queue.drain(..n)) {
            *slot = entry;
        }
        Ok(n)
    }

    fn wait(&mut self, timeout: Duration) {
        let queue = lock(&self.shared.queue);
        if queue.is_empty() {
            let _ = self.shared.ready.wait_timeout(queue, timeout);
        }
    }
}
