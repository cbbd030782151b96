use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::time::Duration;
use std::{io, mem};

use log::error;

use super::bindings::*;
use super::context::ContextInner;
use crate::rdma::*;
use crate::utils::interop::{from_c_ret, from_c_ret_explained};

/// Ownership holder of a completion queue and its completion channel.
struct CqInner {
    _ctx: Arc<ContextInner>,
    cq: NonNull<ibv_cq>,
    channel: NonNull<ibv_comp_channel>,
}

unsafe impl Send for CqInner {}
unsafe impl Sync for CqInner {}

impl Drop for CqInner {
    fn drop(&mut self) {
        // SAFETY: the QP using this CQ keeps this holder alive, so the CQ is
        // idle by now. Destroyed exactly once.
        let ret = unsafe { ibv_destroy_cq(self.cq.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            error!("cannot destroy CQ: {}", e);
        }
        let ret = unsafe { ibv_destroy_comp_channel(self.channel.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            error!("cannot destroy completion channel: {}", e);
        }
    }
}

/// Completion queue with an event channel for idle waits.
pub(super) struct VerbsCq {
    inner: Arc<CqInner>,
    buf: Vec<ibv_wc>,
}

impl VerbsCq {
    pub fn new(ctx: Arc<ContextInner>, depth: u32) -> io::Result<Self> {
        // SAFETY: FFI.
        let channel = unsafe { ibv_create_comp_channel(ctx.ctx.as_ptr()) };
        let channel = NonNull::new(channel).ok_or_else(io::Error::last_os_error)?;

        // SAFETY: FFI.
        let cq = unsafe {
            ibv_create_cq(
                ctx.ctx.as_ptr(),
                depth as i32,
                ptr::null_mut(),
                channel.as_ptr(),
                0,
            )
        };
        let Some(cq) = NonNull::new(cq) else {
            let err = io::Error::last_os_error();
            // SAFETY: FFI; the channel has no other user.
            unsafe { ibv_destroy_comp_channel(channel.as_ptr()) };
            return Err(err);
        };

        Ok(Self {
            inner: Arc::new(CqInner {
                _ctx: ctx,
                cq,
                channel,
            }),
            buf: Vec::new(),
        })
    }
}

impl CompletionQueue for VerbsCq {
    fn poll(&mut self, wc: &mut [Wc]) -> io::Result<usize> {
        if wc.is_empty() {
            return Ok(0);
        }
        // SAFETY: POD type.
        self.buf.resize(wc.len(), unsafe { mem::zeroed() });

        // SAFETY: FFI; `buf` holds `wc.len()` entries.
        let num = unsafe {
            ibv_poll_cq(
                self.inner.cq.as_ptr(),
                wc.len() as i32,
                self.buf.as_mut_ptr(),
            )
        };
        if num < 0 {
            return Err(io::Error::from_raw_os_error(-num));
        }

        let num = num as usize;
        for (dst, src) in wc.iter_mut().zip(&self.buf[..num]) {
            *dst = Wc {
                wr_id: src.wr_id,
                status: WcStatus::from(src.status),
                opcode: WcOpcode::from(src.opcode),
                byte_len: src.byte_len,
            };
        }
        Ok(num)
    }

    fn wait(&mut self, timeout: Duration) {
        let cq = self.inner.cq.as_ptr();
        let channel = self.inner.channel.as_ptr();

        // SAFETY: FFI.
        if unsafe { ibv_req_notify_cq(cq, 0) } != 0 {
            return;
        }
        let mut pfd = libc::pollfd {
            // SAFETY: the channel is valid while the CQ is alive.
            fd: unsafe { (*channel).fd },
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().clamp(1, i32::MAX as u128) as i32;
        // SAFETY: FFI.
        if unsafe { libc::poll(&mut pfd, 1, millis) } <= 0 {
            return;
        }

        let mut ev_cq = ptr::null_mut();
        let mut ev_ctx = ptr::null_mut();
        // SAFETY: FFI; the channel is readable so this does not block.
        if unsafe { ibv_get_cq_event(channel, &mut ev_cq, &mut ev_ctx) } == 0 {
            unsafe { ibv_ack_cq_events(ev_cq, 1) };
        }
    }
}

/// RC queue pair. Destroyed on drop.
pub(super) struct VerbsQp {
    _ctx: Arc<ContextInner>,
    _cq: Arc<CqInner>,
    qp: NonNull<ibv_qp>,
    port_num: PortNum,
}

unsafe impl Send for VerbsQp {}
unsafe impl Sync for VerbsQp {}

fn modify_qp_explained(errno: i32) -> Option<&'static str> {
    match errno {
        libc::EINVAL => Some("invalid QP attribute (check MTU, GID index, and LID)"),
        libc::ETIMEDOUT => Some("timed out modifying QP"),
        _ => None,
    }
}

impl VerbsQp {
    /// Create an RC QP on `cq` and bring it to INIT.
    pub fn new(
        ctx: Arc<ContextInner>,
        cq: &VerbsCq,
        port_num: PortNum,
        caps: &QpCaps,
    ) -> io::Result<Self> {
        // SAFETY: POD type.
        let mut init_attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.send_cq = cq.inner.cq.as_ptr();
        init_attr.recv_cq = cq.inner.cq.as_ptr();
        init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        init_attr.cap.max_send_wr = caps.max_send_wr;
        init_attr.cap.max_recv_wr = caps.max_recv_wr;
        init_attr.cap.max_send_sge = caps.max_send_sge;
        init_attr.cap.max_recv_sge = caps.max_recv_sge;
        init_attr.sq_sig_all = 0;

        // SAFETY: FFI.
        let qp = unsafe { ibv_create_qp(ctx.pd.as_ptr(), &mut init_attr) };
        let qp = NonNull::new(qp).ok_or_else(io::Error::last_os_error)?;
        let qp = Self {
            _ctx: ctx,
            _cq: cq.inner.clone(),
            qp,
            port_num,
        };
        qp.modify_reset2init()?;
        Ok(qp)
    }

    fn modify(&self, attr: &mut ibv_qp_attr, mask: ibv_qp_attr_mask) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { ibv_modify_qp(self.qp.as_ptr(), attr, mask.0 as i32) };
        from_c_ret_explained(ret, modify_qp_explained)
    }

    fn modify_reset2init(&self) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = self.port_num;
        attr.qp_access_flags =
            (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE | ibv_access_flags::IBV_ACCESS_REMOTE_READ).0;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        self.modify(&mut attr, mask)
    }

    fn modify_init2rtr(
        &self,
        local: &ExchangeParameters,
        remote: &ExchangeParameters,
        cattr: &ConnectAttr,
    ) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = local.mtu.min(remote.mtu) as u32;
        attr.dest_qp_num = remote.queue_pair_number;
        attr.rq_psn = remote.packet_sequence_number;
        attr.max_dest_rd_atomic = cattr.max_rd_atomic;
        attr.min_rnr_timer = cattr.min_rnr_timer;

        attr.ah_attr.sl = 0;
        attr.ah_attr.src_path_bits = 0;
        attr.ah_attr.port_num = self.port_num;
        if remote.gid_index < 0 {
            attr.ah_attr.is_global = 0;
            attr.ah_attr.dlid = remote.lid;
        } else {
            if local.gid_index < 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "peer uses GID addressing but the local port does not",
                ));
            }
            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid.raw = remote.gid.raw();
            attr.ah_attr.grh.flow_label = 0;
            attr.ah_attr.grh.sgid_index = local.gid_index as u8;
            attr.ah_attr.grh.hop_limit = cattr.hop_limit;
            attr.ah_attr.grh.traffic_class = 0;
        }

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        self.modify(&mut attr, mask)
    }

    fn modify_rtr2rts(&self, local: &ExchangeParameters, cattr: &ConnectAttr) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = local.packet_sequence_number;
        attr.max_rd_atomic = cattr.max_rd_atomic;
        attr.timeout = cattr.timeout;
        attr.retry_cnt = cattr.retry_cnt;
        attr.rnr_retry = cattr.rnr_retry;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY;
        self.modify(&mut attr, mask)
    }
}

impl QueuePair for VerbsQp {
    fn qp_num(&self) -> Qpn {
        // SAFETY: the QP is valid while the handle is alive.
        unsafe { (*self.qp.as_ptr()).qp_num }
    }

    fn handshake(
        &mut self,
        local: &ExchangeParameters,
        remote: &ExchangeParameters,
        attr: &ConnectAttr,
    ) -> io::Result<()> {
        self.modify_init2rtr(local, remote, attr)?;
        self.modify_rtr2rts(local, attr)
    }

    fn post_read(&self, wrs: &[ReadWr]) -> Result<(), PostError> {
        if wrs.is_empty() {
            return Ok(());
        }

        let mut sges = wrs
            .iter()
            .map(|wr| ibv_sge {
                addr: wr.local_addr,
                length: wr.length,
                lkey: wr.lkey,
            })
            .collect::<Vec<_>>();

        let mut send_wrs = Vec::with_capacity(wrs.len());
        for (wr, sge) in wrs.iter().zip(sges.iter_mut()) {
            // SAFETY: POD type.
            let mut swr = unsafe { mem::zeroed::<ibv_send_wr>() };
            swr.wr_id = wr.wr_id;
            swr.sg_list = sge;
            swr.num_sge = 1;
            swr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
            swr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            // SAFETY: `rdma` is the active member for RDMA opcodes.
            let rdma = unsafe { &mut swr.wr.rdma };
            rdma.remote_addr = wr.remote_addr;
            rdma.rkey = wr.rkey;
            send_wrs.push(swr);
        }
        let head = send_wrs.as_mut_ptr();
        for i in 1..send_wrs.len() {
            // SAFETY: both indices are in bounds, and `send_wrs` is not
            // reallocated afterwards.
            unsafe { (*head.add(i - 1)).next = head.add(i) };
        }

        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; `sges` and `send_wrs` outlive the call.
        let ret = unsafe { ibv_post_send(self.qp.as_ptr(), head, &mut bad_wr) };
        from_c_ret(ret).map_err(|source| {
            // `bad_wr` points at the first refused element of `send_wrs`.
            let posted = if bad_wr.is_null() {
                0
            } else {
                (bad_wr as usize - head as usize) / mem::size_of::<ibv_send_wr>()
            };
            PostError {
                posted: posted.min(wrs.len()),
                source,
            }
        })
    }
}

impl Drop for VerbsQp {
    fn drop(&mut self) {
        // SAFETY: FFI; destroyed exactly once.
        let ret = unsafe { ibv_destroy_qp(self.qp.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            error!("cannot destroy QP: {}", e);
        }
    }
}
