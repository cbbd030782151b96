use std::collections::HashMap;
use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::oneshot;
use futures::FutureExt;
use log::{trace, warn};

use crate::rdma::{Wc, WcStatus, WrId};
use crate::utils::sync::lock;
use crate::{Error, Result};

/// Counters of a connection's work requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Work requests posted.
    pub posted: u64,

    /// Completions matched to a posted work request.
    pub completed: u64,

    /// Matched completions with an error status.
    pub failed: u64,

    /// Completions whose work request id was not pending.
    pub unknown: u64,

    /// Posted work requests still awaiting their completion.
    pub in_flight: u64,

    /// Read operations resolved by completions.
    pub resolved: u64,

    /// Post-to-resolution time summed over resolved operations.
    pub total_latency: Duration,
}

impl ConnectionStats {
    /// Mean post-to-resolution time of resolved operations.
    pub fn mean_latency(&self) -> Option<Duration> {
        match self.resolved {
            0 => None,
            n => {
                let nanos = self.total_latency.as_nanos() / n as u128;
                Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
            }
        }
    }
}

/// An in-flight read operation made of one or more work requests.
struct Operation {
    sink: oneshot::Sender<Result<()>>,
    outstanding: usize,
    first_error: Option<WcStatus>,
    posted_at: quanta::Instant,
}

#[derive(Default)]
struct Table {
    /// Work request id to operation id.
    wrs: HashMap<WrId, WrId>,
    ops: HashMap<WrId, Operation>,
    stats: ConnectionStats,
}

/// Pending read operations of one connection, keyed by work request id.
///
/// An operation is identified by the id of its first work request; its work
/// requests carry consecutive ids.
#[derive(Default)]
pub(crate) struct PendingTable {
    table: Mutex<Table>,
}

impl PendingTable {
    /// Track an operation whose work requests carry `wr_ids`, before they are
    /// posted.
    pub fn insert(&self, wr_ids: Range<WrId>) -> ReadHandle {
        let (tx, rx) = oneshot::channel();
        let id = wr_ids.start;
        let count = (wr_ids.end - wr_ids.start) as usize;

        let mut table = lock(&self.table);
        for wr_id in wr_ids.clone() {
            table.wrs.insert(wr_id, id);
        }
        table.ops.insert(
            id,
            Operation {
                sink: tx,
                outstanding: count,
                first_error: None,
                posted_at: quanta::Instant::now(),
            },
        );
        table.stats.posted += count as u64;
        table.stats.in_flight += count as u64;

        ReadHandle { id, wr_ids, rx }
    }

    /// Forget the work requests of `wr_ids` that were never posted.
    ///
    /// Work requests of the range that already completed are left alone. The
    /// operation is dropped without resolving once nothing of it remains
    /// outstanding; otherwise it resolves silently when the rest completes.
    pub fn cancel(&self, wr_ids: Range<WrId>) {
        let mut table = lock(&self.table);
        let mut removed = HashMap::<WrId, usize>::new();
        for wr_id in wr_ids {
            if let Some(id) = table.wrs.remove(&wr_id) {
                *removed.entry(id).or_default() += 1;
            }
        }

        for (id, count) in removed {
            table.stats.posted -= count as u64;
            table.stats.in_flight -= count as u64;
            let Some(op) = table.ops.get_mut(&id) else {
                continue;
            };
            op.outstanding -= count;
            if op.outstanding == 0 {
                table.ops.remove(&id);
            }
        }
    }

    /// Account one work completion, resolving its operation once all of the
    /// operation's work requests have completed.
    ///
    /// Return `false` if the work request is not pending.
    pub fn complete(&self, wc: &Wc) -> bool {
        let mut table = lock(&self.table);
        let Some(id) = table.wrs.remove(&wc.wr_id) else {
            table.stats.unknown += 1;
            return false;
        };
        table.stats.completed += 1;
        table.stats.in_flight -= 1;
        if wc.status != WcStatus::Success {
            table.stats.failed += 1;
        }

        let Some(op) = table.ops.get_mut(&id) else {
            return true;
        };
        op.outstanding -= 1;
        if let Err(status) = wc.ok() {
            warn!("WR {} of read {} failed: {}", wc.wr_id, id, status);
            op.first_error.get_or_insert(status);
        }
        if op.outstanding > 0 {
            return true;
        }

        let Some(op) = table.ops.remove(&id) else {
            return true;
        };
        let latency = quanta::Instant::now().duration_since(op.posted_at);
        table.stats.resolved += 1;
        table.stats.total_latency += latency;
        drop(table);

        trace!("read {} resolved in {:?}", id, latency);
        let result = match op.first_error {
            None => Ok(()),
            Some(status) => Err(Error::CompletionError(status)),
        };
        // The waiter may have given up.
        let _ = op.sink.send(result);
        true
    }

    /// Resolve every pending operation with [`Error::Disconnected`]. Return
    /// the number of operations failed.
    pub fn fail_all(&self) -> usize {
        let ops = {
            let mut table = lock(&self.table);
            table.wrs.clear();
            table.stats.in_flight = 0;
            table.ops.drain().map(|(_, op)| op).collect::<Vec<_>>()
        };
        let n = ops.len();
        for op in ops {
            let _ = op.sink.send(Err(Error::Disconnected));
        }
        n
    }

    pub fn stats(&self) -> ConnectionStats {
        lock(&self.table).stats
    }

    /// Number of unresolved operations.
    pub fn len(&self) -> usize {
        lock(&self.table).ops.len()
    }
}

/// Handle of a posted read operation.
///
/// Resolves to `Ok(())` once every work request of the operation completed
/// successfully, to [`Error::CompletionError`] with the first failure status
/// otherwise, or to [`Error::Disconnected`] if the connection was torn down
/// first. Await it, or block on it with [`ReadHandle::wait`].
#[must_use = "a read handle does nothing unless awaited"]
#[derive(Debug)]
pub struct ReadHandle {
    id: WrId,
    wr_ids: Range<WrId>,
    rx: oneshot::Receiver<Result<()>>,
}

impl ReadHandle {
    /// Get the operation id, which is the id of its first work request.
    #[inline]
    pub fn id(&self) -> WrId {
        self.id
    }

    /// Get the ids of the operation's work requests.
    #[inline]
    pub fn wr_ids(&self) -> Range<WrId> {
        self.wr_ids.clone()
    }

    /// Block the current thread until the operation resolves.
    pub fn wait(self) -> Result<()> {
        futures::executor::block_on(self)
    }
}

impl Future for ReadHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::WcOpcode;

    fn wc(wr_id: WrId, status: WcStatus) -> Wc {
        Wc {
            wr_id,
            status,
            opcode: WcOpcode::RdmaRead,
            byte_len: 8,
        }
    }

    #[test]
    fn single_read_resolves_once() {
        let table = PendingTable::default();
        let handle = table.insert(1..2);
        assert_eq!(handle.id(), 1);

        assert!(table.complete(&wc(1, WcStatus::Success)));
        assert!(!table.complete(&wc(1, WcStatus::Success)));
        assert!(handle.wait().is_ok());

        let stats = table.stats();
        assert_eq!((stats.posted, stats.completed, stats.unknown), (1, 1, 1));
        assert_eq!((stats.in_flight, stats.resolved), (0, 1));
        assert!(stats.mean_latency().is_some());
    }

    #[test]
    fn batch_waits_for_every_completion() {
        let table = PendingTable::default();
        let mut handle = table.insert(10..14);
        assert_eq!(handle.wr_ids(), 10..14);

        // Completions arrive in any order.
        for wr_id in [12, 10, 13] {
            let status = if wr_id == 12 {
                WcStatus::RemAccessErr
            } else {
                WcStatus::Success
            };
            table.complete(&wc(wr_id, status));
            assert!((&mut handle).now_or_never().is_none());
        }
        assert_eq!(table.len(), 1);

        table.complete(&wc(11, WcStatus::WrFlushErr));
        let result = handle.wait();
        assert!(matches!(
            result,
            Err(Error::CompletionError(WcStatus::RemAccessErr))
        ));

        let stats = table.stats();
        assert_eq!((stats.completed, stats.failed), (4, 2));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn fail_all_disconnects() {
        let table = PendingTable::default();
        let a = table.insert(1..2);
        let b = table.insert(2..5);
        assert_eq!(table.fail_all(), 2);
        assert!(matches!(a.wait(), Err(Error::Disconnected)));
        assert!(matches!(b.wait(), Err(Error::Disconnected)));

        // Late completions are tolerated.
        assert!(!table.complete(&wc(3, WcStatus::Success)));
        assert_eq!(table.stats().in_flight, 0);
    }

    #[test]
    fn cancel_spares_completed_prefix() {
        let table = PendingTable::default();
        let handle = table.insert(20..23);

        // The device took the first WR only, and it completed before the
        // rest of the list was withdrawn.
        assert!(table.complete(&wc(20, WcStatus::Success)));
        table.cancel(20..23);

        let stats = table.stats();
        assert_eq!((stats.posted, stats.completed), (1, 1));
        assert_eq!((stats.in_flight, stats.unknown), (0, 0));
        assert_eq!(table.len(), 0);
        assert!(matches!(handle.wait(), Err(Error::Disconnected)));
    }

    #[test]
    fn cancel_keeps_accepted_prefix_pending() {
        let table = PendingTable::default();
        let handle = table.insert(30..33);
        table.cancel(31..33);
        assert_eq!(table.len(), 1);
        assert_eq!(table.stats().in_flight, 1);

        // The accepted WR completes later without counting as unknown.
        assert!(table.complete(&wc(30, WcStatus::Success)));
        assert!(handle.wait().is_ok());
        let stats = table.stats();
        assert_eq!((stats.posted, stats.completed, stats.unknown), (1, 1, 0));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn mean_latency_over_many_reads() {
        let stats = ConnectionStats {
            resolved: 1 << 32,
            total_latency: Duration::from_secs(1 << 32),
            ..Default::default()
        };
        assert_eq!(stats.mean_latency(), Some(Duration::from_secs(1)));

        let stats = ConnectionStats {
            resolved: 3,
            total_latency: Duration::from_nanos(10),
            ..Default::default()
        };
        assert_eq!(stats.mean_latency(), Some(Duration::from_nanos(3)));
        assert_eq!(ConnectionStats::default().mean_latency(), None);
    }

    #[test]
    fn cancel_forgets() {
        let table = PendingTable::default();
        let handle = table.insert(7..9);
        table.cancel(7..9);
        assert_eq!(table.len(), 0);
        assert_eq!(table.stats(), ConnectionStats::default());
        assert!(matches!(handle.wait(), Err(Error::Disconnected)));
    }
}
