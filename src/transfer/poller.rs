use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

use super::pending::PendingTable;
use crate::rdma::{CompletionQueue, Wc};

/// Background thread draining a completion queue into a [`PendingTable`].
///
/// The thread owns the CQ while it runs and hands it back when joined, so the
/// CQ is never released while it may still be polled.
pub(crate) struct CompletionPoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Box<dyn CompletionQueue>>>,
}

impl CompletionPoller {
    /// Start polling `cq`, draining up to `batch` completions at a time and
    /// waiting up to `idle` when the CQ is empty.
    pub fn spawn(
        name: String,
        cq: Box<dyn CompletionQueue>,
        pending: Arc<PendingTable>,
        batch: usize,
        idle: Duration,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name(name)
                .spawn(move || run(cq, &pending, &stop, batch, idle))?
        };
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the thread to exit, join it, and take back the CQ.
    ///
    /// Return `None` if the thread panicked, in which case the CQ is already
    /// gone.
    pub fn stop(mut self) -> Option<Box<dyn CompletionQueue>> {
        self.join()
    }

    fn join(&mut self) -> Option<Box<dyn CompletionQueue>> {
        let handle = self.handle.take()?;
        self.stop.store(true, Ordering::Release);
        match handle.join() {
            Ok(cq) => Some(cq),
            Err(_) => {
                error!("completion poller panicked");
                None
            }
        }
    }
}

impl Drop for CompletionPoller {
    fn drop(&mut self) {
        drop(self.join());
    }
}

fn run(
    mut cq: Box<dyn CompletionQueue>,
    pending: &PendingTable,
    stop: &AtomicBool,
    batch: usize,
    idle: Duration,
) -> Box<dyn CompletionQueue> {
    let mut wc = vec![Wc::default(); batch.max(1)];
    while !stop.load(Ordering::Acquire) {
        match cq.poll(&mut wc) {
            Ok(0) => cq.wait(idle),
            Ok(n) => {
                for wc in &wc[..n] {
                    if !pending.complete(wc) {
                        warn!("dropping completion of unknown WR {} ({})", wc.wr_id, wc.status);
                    }
                }
            }
            Err(e) => {
                warn!("cannot poll CQ: {}", e);
                thread::sleep(idle);
            }
        }
    }
    debug!("completion poller exiting");
    cq
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;

    use super::*;
    use crate::rdma::{WcOpcode, WcStatus};

    /// A CQ fed by the test through a shared queue.
    struct ScriptedCq(Arc<Mutex<VecDeque<Wc>>>);

    impl CompletionQueue for ScriptedCq {
        fn poll(&mut self, wc: &mut [Wc]) -> io::Result<usize> {
            let mut queue = self.0.lock().unwrap();
            let n = wc.len().min(queue.len());
            for slot in wc.iter_mut().take(n) {
                *slot = queue.pop_front().unwrap();
            }
            Ok(n)
        }

        fn wait(&mut self, timeout: Duration) {
            thread::sleep(timeout);
        }
    }

    fn wc(wr_id: u64) -> Wc {
        Wc {
            wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::RdmaRead,
            byte_len: 1,
        }
    }

    #[test]
    fn resolves_and_returns_cq() {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let pending = Arc::new(PendingTable::default());
        let poller = CompletionPoller::spawn(
            "test-poller".into(),
            Box::new(ScriptedCq(queue.clone())),
            pending.clone(),
            2,
            Duration::from_micros(100),
        )
        .unwrap();

        let handles = (0..5).map(|i| pending.insert(i..i + 1)).collect::<Vec<_>>();
        queue.lock().unwrap().extend([wc(4), wc(99), wc(0), wc(3), wc(1), wc(2)]);
        for handle in handles {
            handle.wait().unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while pending.stats().unknown == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        assert!(poller.stop().is_some());
        assert_eq!(pending.stats().completed, 5);
        assert_eq!(pending.stats().unknown, 1);
    }
}
