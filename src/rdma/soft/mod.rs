//! Software RDMA provider.
//!
//! [`SoftFabric`] emulates a set of RDMA ports inside one process. Memory
//! regions are published in a fabric-wide key table, and every queue pair
//! executes its READs on a worker thread that checks protection keys and
//! copies bytes between registered regions. Completion and error semantics
//! follow reliable-connected hardware: the first failed work request moves
//! the QP to the error state and flushes everything posted after it.

mod qp;

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::{fmt, io};

use log::{debug, info};

use self::qp::{QpShared, SoftQp};
use super::*;
use crate::utils::sync::{lock, read, write};
use crate::{Error, Result};

/// Largest send queue a soft QP accepts.
const MAX_QP_WR: u32 = 32768;

/// Largest completion queue a soft QP accepts.
const MAX_CQE: u32 = 1 << 22;

/// A registered byte range.
#[derive(Debug, Clone, Copy)]
struct Region {
    addr: u64,
    len: u64,
    pd: u64,
}

impl Region {
    /// Whether `addr..addr + len` lies in this region.
    fn contains(&self, addr: u64, len: u32) -> bool {
        match addr.checked_add(len as u64) {
            Some(end) => addr >= self.addr && end <= self.addr + self.len,
            None => false,
        }
    }
}

struct FabricInner {
    ports: Vec<PortInfo>,

    /// Registered regions, keyed by their (shared) lkey and rkey.
    ///
    /// Workers hold the read lock while copying, so deregistration waits for
    /// in-progress copies touching the region.
    regions: RwLock<HashMap<u32, Region>>,
    qps: Mutex<HashMap<Qpn, Weak<QpShared>>>,

    next_key: AtomicU32,
    next_qpn: AtomicU32,
    next_pd: AtomicU64,
}

/// In-process RDMA fabric.
///
/// This type is a simple wrapper of an `Arc`; clones share the same fabric,
/// so connections opened through different clones can reach each other.
#[derive(Clone)]
pub struct SoftFabric {
    inner: Arc<FabricInner>,
}

impl SoftFabric {
    /// Name of the default RoCE device.
    pub const ROCE_DEVICE: &'static str = "soft_roce0";

    /// Name of the default InfiniBand device.
    pub const IB_DEVICE: &'static str = "soft_ib0";

    /// Create a fabric with one RoCE and one InfiniBand device, each with a
    /// single port numbered 1.
    pub fn new() -> Self {
        Self::with_ports(vec![
            PortInfo {
                dev_name: Self::ROCE_DEVICE.to_owned(),
                num: 1,
                link_type: LinkType::Ethernet,
                lid: 0,
                gid: Gid::from(Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x7f00, 0x0001)),
                gid_index: 3,
                mtu: Mtu::Mtu1024,
            },
            PortInfo {
                dev_name: Self::IB_DEVICE.to_owned(),
                num: 1,
                link_type: LinkType::InfiniBand,
                lid: 1,
                gid: Gid::ZERO,
                gid_index: -1,
                mtu: Mtu::Mtu4096,
            },
        ])
    }

    /// Create a fabric with the given ports.
    pub fn with_ports(ports: Vec<PortInfo>) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                ports,
                regions: RwLock::new(HashMap::new()),
                qps: Mutex::new(HashMap::new()),
                next_key: AtomicU32::new(0x100),
                next_qpn: AtomicU32::new(0x10),
                next_pd: AtomicU64::new(1),
            }),
        }
    }

    /// Get all ports of the fabric.
    #[inline]
    pub fn ports(&self) -> &[PortInfo] {
        &self.inner.ports
    }

    /// Get the number of currently registered memory regions.
    pub fn region_count(&self) -> usize {
        read(&self.inner.regions).len()
    }

    /// Get the number of live queue pairs.
    pub fn qp_count(&self) -> usize {
        lock(&self.inner.qps)
            .values()
            .filter(|qp| qp.strong_count() > 0)
            .count()
    }
}

impl Default for SoftFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SoftFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftFabric")
            .field("ports", &self.inner.ports.len())
            .field("regions", &self.region_count())
            .field("qps", &self.qp_count())
            .finish()
    }
}

impl Provider for SoftFabric {
    fn device_names(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::<String>::new();
        for port in &self.inner.ports {
            if !names.contains(&port.dev_name) {
                names.push(port.dev_name.clone());
            }
        }
        Ok(names)
    }

    fn open(
        &self,
        dev_name: &str,
        port_num: PortNum,
        link_type: LinkType,
    ) -> Result<Box<dyn DeviceContext>> {
        let port = self
            .inner
            .ports
            .iter()
            .find(|p| p.dev_name == dev_name && p.num == port_num)
            .ok_or_else(|| Error::DeviceNotFound(format!("{} port {}", dev_name, port_num)))?;
        if port.link_type != link_type {
            return Err(Error::DeviceNotFound(format!(
                "{} port {} is {}, not {}",
                dev_name, port_num, port.link_type, link_type
            )));
        }

        let pd = self.inner.next_pd.fetch_add(1, Ordering::Relaxed);
        info!(
            "opened soft device {} port {} ({}, {})",
            dev_name, port_num, port.link_type, port.mtu
        );
        Ok(Box::new(SoftContext {
            fabric: self.inner.clone(),
            port: port.clone(),
            pd,
        }))
    }
}

/// An opened soft port with its own protection domain.
struct SoftContext {
    fabric: Arc<FabricInner>,
    port: PortInfo,
    pd: u64,
}

impl DeviceContext for SoftContext {
    fn port(&self) -> &PortInfo {
        &self.port
    }

    unsafe fn reg_mr(&self, addr: *mut u8, len: usize) -> io::Result<Box<dyn MemoryHandle>> {
        if addr.is_null() || len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty memory area",
            ));
        }
        let addr = addr as u64;
        if addr.checked_add(len as u64).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "memory area wraps around the address space",
            ));
        }

        let key = self.fabric.next_key.fetch_add(1, Ordering::Relaxed);
        let region = Region {
            addr,
            len: len as u64,
            pd: self.pd,
        };
        write(&self.fabric.regions).insert(key, region);
        debug!("soft MR {:#x}: {:#x}+{}", key, addr, len);

        Ok(Box::new(SoftMr {
            fabric: self.fabric.clone(),
            key,
        }))
    }

    fn create_qp(
        &self,
        caps: &QpCaps,
    ) -> io::Result<(Box<dyn QueuePair>, Box<dyn CompletionQueue>)> {
        if caps.max_send_wr == 0 || caps.max_send_wr > MAX_QP_WR {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("max_send_wr must be in 1..={}", MAX_QP_WR),
            ));
        }
        if caps.cq_depth == 0 || caps.cq_depth > MAX_CQE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("CQ depth must be in 1..={}", MAX_CQE),
            ));
        }

        let (qp, cq) = SoftQp::new(self.fabric.clone(), self.port.clone(), self.pd, caps)?;
        Ok((Box::new(qp), Box::new(cq)))
    }
}

/// Registration of a soft memory region. Removes the region from the fabric
/// on drop.
struct SoftMr {
    fabric: Arc<FabricInner>,
    key: u32,
}

impl MemoryHandle for SoftMr {
    fn lkey(&self) -> LKey {
        self.key
    }

    fn rkey(&self) -> RKey {
        self.key
    }
}

impl Drop for SoftMr {
    fn drop(&mut self) {
        write(&self.fabric.regions).remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn attr() -> ConnectAttr {
        ConnectAttr {
            max_rd_atomic: 16,
            min_rnr_timer: 12,
            timeout: 14,
            retry_cnt: 7,
            rnr_retry: 7,
            hop_limit: 1,
        }
    }

    fn caps() -> QpCaps {
        QpCaps {
            max_send_wr: 16,
            max_recv_wr: 16,
            max_send_sge: 1,
            max_recv_sge: 1,
            cq_depth: 32,
        }
    }

    fn poll_one(cq: &mut dyn CompletionQueue) -> Wc {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut wc = [Wc::default()];
        loop {
            if cq.poll(&mut wc).unwrap() == 1 {
                return wc[0];
            }
            assert!(Instant::now() < deadline, "no completion arrived");
            cq.wait(Duration::from_millis(10));
        }
    }

    struct Side {
        ctx: Box<dyn DeviceContext>,
        qp: Box<dyn QueuePair>,
        cq: Box<dyn CompletionQueue>,
        ep: ExchangeParameters,
    }

    fn side(fabric: &SoftFabric, dev: &str, link_type: LinkType) -> Side {
        let ctx = fabric.open(dev, 1, link_type).unwrap();
        let (qp, cq) = ctx.create_qp(&caps()).unwrap();
        let ep = ExchangeParameters::new(ctx.port(), qp.qp_num(), 0x42);
        Side { ctx, qp, cq, ep }
    }

    fn connected_pair(fabric: &SoftFabric) -> (Side, Side) {
        let mut a = side(fabric, SoftFabric::ROCE_DEVICE, LinkType::Ethernet);
        let mut b = side(fabric, SoftFabric::ROCE_DEVICE, LinkType::Ethernet);
        a.qp.handshake(&a.ep, &b.ep, &attr()).unwrap();
        b.qp.handshake(&b.ep, &a.ep, &attr()).unwrap();
        (a, b)
    }

    fn read_wr(wr_id: WrId, dst: &mut [u8], lkey: LKey, src: &[u8], rkey: RKey) -> ReadWr {
        ReadWr {
            wr_id,
            local_addr: dst.as_mut_ptr() as u64,
            length: dst.len() as u32,
            lkey,
            remote_addr: src.as_ptr() as u64,
            rkey,
        }
    }

    #[test]
    fn open_checks_device_port_and_link() {
        let fabric = SoftFabric::new();
        assert_eq!(
            fabric.device_names().unwrap(),
            vec![SoftFabric::ROCE_DEVICE, SoftFabric::IB_DEVICE]
        );
        assert!(fabric
            .open(SoftFabric::ROCE_DEVICE, 1, LinkType::Ethernet)
            .is_ok());
        for (dev, port, link) in [
            ("mlx5_9", 1, LinkType::Ethernet),
            (SoftFabric::ROCE_DEVICE, 2, LinkType::Ethernet),
            (SoftFabric::ROCE_DEVICE, 1, LinkType::InfiniBand),
        ] {
            assert!(matches!(
                fabric.open(dev, port, link),
                Err(Error::DeviceNotFound(_))
            ));
        }
    }

    #[test]
    fn registration_lifetime() {
        let fabric = SoftFabric::new();
        let ctx = fabric
            .open(SoftFabric::IB_DEVICE, 1, LinkType::InfiniBand)
            .unwrap();
        let mut buf = vec![0u8; 64];

        let mr = unsafe { ctx.reg_mr(buf.as_mut_ptr(), buf.len()) }.unwrap();
        assert_eq!(mr.lkey(), mr.rkey());
        assert_eq!(fabric.region_count(), 1);
        drop(mr);
        assert_eq!(fabric.region_count(), 0);

        assert!(unsafe { ctx.reg_mr(std::ptr::null_mut(), 64) }.is_err());
        assert!(unsafe { ctx.reg_mr(buf.as_mut_ptr(), 0) }.is_err());
    }

    #[test]
    fn loopback_read() {
        let fabric = SoftFabric::new();
        let (mut a, b) = connected_pair(&fabric);

        let src: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut dst = vec![0u8; 4096];
        let src_mr = unsafe { b.ctx.reg_mr(src.as_ptr() as *mut u8, src.len()) }.unwrap();
        let dst_mr = unsafe { a.ctx.reg_mr(dst.as_mut_ptr(), dst.len()) }.unwrap();

        let wr = read_wr(7, &mut dst, dst_mr.lkey(), &src, src_mr.rkey());
        a.qp.post_read(&[wr]).unwrap();
        let wc = poll_one(a.cq.as_mut());
        assert_eq!(wc.wr_id, 7);
        assert_eq!(wc.ok(), Ok(4096));
        assert_eq!(wc.opcode, WcOpcode::RdmaRead);
        assert_eq!(dst, src);
    }

    #[test]
    fn infiniband_addresses_by_lid() {
        let fabric = SoftFabric::new();
        let mut a = side(&fabric, SoftFabric::IB_DEVICE, LinkType::InfiniBand);
        let b = side(&fabric, SoftFabric::IB_DEVICE, LinkType::InfiniBand);
        assert_eq!(b.ep.gid_index, -1);
        a.qp.handshake(&a.ep, &b.ep, &attr()).unwrap();

        let mut bad = b.ep;
        bad.lid = 99;
        let mut c = side(&fabric, SoftFabric::IB_DEVICE, LinkType::InfiniBand);
        assert!(c.qp.handshake(&c.ep, &bad, &attr()).is_err());
    }

    #[test]
    fn bad_rkey_errors_then_flushes() {
        let fabric = SoftFabric::new();
        let (mut a, b) = connected_pair(&fabric);

        let src = vec![1u8; 128];
        let mut dst = vec![0u8; 128];
        let src_mr = unsafe { b.ctx.reg_mr(src.as_ptr() as *mut u8, src.len()) }.unwrap();
        let dst_mr = unsafe { a.ctx.reg_mr(dst.as_mut_ptr(), dst.len()) }.unwrap();

        let bad = read_wr(1, &mut dst, dst_mr.lkey(), &src, src_mr.rkey() + 1000);
        let good = read_wr(2, &mut dst, dst_mr.lkey(), &src, src_mr.rkey());
        a.qp.post_read(&[bad, good]).unwrap();

        let first = poll_one(a.cq.as_mut());
        let second = poll_one(a.cq.as_mut());
        assert_eq!((first.wr_id, first.status), (1, WcStatus::RemAccessErr));
        assert_eq!((second.wr_id, second.status), (2, WcStatus::WrFlushErr));
        assert!(dst.iter().all(|&x| x == 0));
    }

    #[test]
    fn local_key_must_belong_to_own_pd() {
        let fabric = SoftFabric::new();
        let (mut a, b) = connected_pair(&fabric);

        let src = vec![1u8; 16];
        let mut dst = vec![0u8; 16];
        let src_mr = unsafe { b.ctx.reg_mr(src.as_ptr() as *mut u8, src.len()) }.unwrap();
        // Registered through the peer's protection domain.
        let foreign = unsafe { b.ctx.reg_mr(dst.as_mut_ptr(), dst.len()) }.unwrap();

        let wr = read_wr(5, &mut dst, foreign.lkey(), &src, src_mr.rkey());
        a.qp.post_read(&[wr]).unwrap();
        assert_eq!(poll_one(a.cq.as_mut()).status, WcStatus::LocProtErr);
    }

    #[test]
    fn handshake_rejections() {
        let fabric = SoftFabric::new();
        let mut a = side(&fabric, SoftFabric::ROCE_DEVICE, LinkType::Ethernet);
        let b = side(&fabric, SoftFabric::ROCE_DEVICE, LinkType::Ethernet);

        let mut no_gid = b.ep;
        no_gid.gid_index = -1;
        assert!(a.qp.handshake(&a.ep, &no_gid, &attr()).is_err());

        let mut wrong_gid = b.ep;
        wrong_gid.gid = Gid::from_words([0xfe80 << 48, 1]);
        assert!(a.qp.handshake(&a.ep, &wrong_gid, &attr()).is_err());

        let mut unknown = b.ep;
        unknown.queue_pair_number = 0xdead;
        assert!(a.qp.handshake(&a.ep, &unknown, &attr()).is_err());

        let bad_attr = ConnectAttr {
            retry_cnt: 9,
            ..attr()
        };
        assert!(a.qp.handshake(&a.ep, &b.ep, &bad_attr).is_err());

        // Rejections leave the QP in INIT.
        a.qp.handshake(&a.ep, &b.ep, &attr()).unwrap();
        assert!(a.qp.handshake(&a.ep, &b.ep, &attr()).is_err());
    }

    #[test]
    fn post_requires_rts_and_room() {
        let fabric = SoftFabric::new();
        let a = side(&fabric, SoftFabric::ROCE_DEVICE, LinkType::Ethernet);
        let wr = ReadWr {
            wr_id: 1,
            local_addr: 0,
            length: 0,
            lkey: 0,
            remote_addr: 0,
            rkey: 0,
        };
        assert!(matches!(a.qp.post_read(&[wr]), Err(PostError { posted: 0, .. })));

        let (a, _b) = connected_pair(&fabric);
        let err = a.qp.post_read(&[wr; 17]).unwrap_err();
        assert_eq!(err.posted, 0);
        assert_eq!(err.source.kind(), io::ErrorKind::OutOfMemory);
    }

    #[test]
    fn qp_drop_unregisters() {
        let fabric = SoftFabric::new();
        let (a, b) = connected_pair(&fabric);
        assert_eq!(fabric.qp_count(), 2);
        drop(a);
        assert_eq!(fabric.qp_count(), 1);
        drop(b);
        assert_eq!(fabric.qp_count(), 0);
    }
}
