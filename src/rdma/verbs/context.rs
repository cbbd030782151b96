use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::Arc;
use std::{fs, io, mem, slice};

use log::{debug, error, info};

use super::bindings::*;
use super::qp::{VerbsCq, VerbsQp};
use crate::rdma::*;
use crate::utils::interop::from_c_ret;
use crate::{Error, Result};

/// List of RDMA devices. Freed on drop.
pub(super) struct DeviceList {
    list: NonNull<*mut ibv_device>,
    len: usize,
}

impl DeviceList {
    pub fn new() -> io::Result<Self> {
        let mut num = 0;
        // SAFETY: FFI.
        let list = unsafe { ibv_get_device_list(&mut num) };
        let list = NonNull::new(list).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            list,
            len: num.max(0) as usize,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = *mut ibv_device> + '_ {
        // SAFETY: `ibv_get_device_list` returns `num` valid entries.
        unsafe { slice::from_raw_parts(self.list.as_ptr(), self.len) }
            .iter()
            .copied()
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        // SAFETY: FFI; the list is freed exactly once.
        unsafe { ibv_free_device_list(self.list.as_ptr()) };
    }
}

/// Get the kernel name of a device.
pub(super) fn device_name(dev: *mut ibv_device) -> String {
    // SAFETY: `dev` comes from a live device list; the name is NUL-terminated.
    let name = unsafe { ibv_get_device_name(dev) };
    if name.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(name) }
        .to_string_lossy()
        .into_owned()
}

/// Ownership holder of a device context and its protection domain.
pub(super) struct ContextInner {
    pub ctx: NonNull<ibv_context>,
    pub pd: NonNull<ibv_pd>,
}

unsafe impl Send for ContextInner {}
unsafe impl Sync for ContextInner {}

impl ContextInner {
    /// Take over an opened device and allocate a protection domain on it.
    /// Closes the device on failure.
    fn new(ctx: NonNull<ibv_context>) -> io::Result<Self> {
        // SAFETY: FFI.
        let pd = unsafe { ibv_alloc_pd(ctx.as_ptr()) };
        match NonNull::new(pd) {
            Some(pd) => Ok(Self { ctx, pd }),
            None => {
                let err = io::Error::last_os_error();
                // SAFETY: FFI; the context has no other owner.
                unsafe { ibv_close_device(ctx.as_ptr()) };
                Err(err)
            }
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // SAFETY: every QP, CQ and MR keeps this holder alive, so the PD and
        // context are no longer in use.
        let ret = unsafe { ibv_dealloc_pd(self.pd.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            error!("cannot deallocate PD: {}", e);
        }
        let ret = unsafe { ibv_close_device(self.ctx.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            error!("cannot close device: {}", e);
        }
    }
}

/// An opened device port.
pub(super) struct VerbsContext {
    inner: Arc<ContextInner>,
    port: PortInfo,
}

impl VerbsContext {
    /// Open a device port and allocate a protection domain.
    pub fn open(dev_name: &str, port_num: PortNum, link_type: LinkType) -> Result<Self> {
        let list = DeviceList::new().map_err(Error::Device)?;
        let dev = list
            .iter()
            .find(|&dev| device_name(dev) == dev_name)
            .ok_or_else(|| Error::DeviceNotFound(dev_name.to_owned()))?;

        // SAFETY: FFI.
        let ctx = unsafe { ibv_open_device(dev) };
        let ctx = NonNull::new(ctx).ok_or_else(|| Error::Device(io::Error::last_os_error()))?;
        drop(list);
        let inner = ContextInner::new(ctx).map_err(Error::Device)?;

        let port = query_port(&inner, dev_name, port_num, link_type)?;
        info!(
            "opened {} port {} ({}, {}, GID index {})",
            dev_name, port_num, port.link_type, port.mtu, port.gid_index
        );
        Ok(Self {
            inner: Arc::new(inner),
            port,
        })
    }
}

fn query_port(
    inner: &ContextInner,
    dev_name: &str,
    port_num: PortNum,
    link_type: LinkType,
) -> Result<PortInfo> {
    let ctx = inner.ctx.as_ptr();

    // SAFETY: POD type.
    let mut dev_attr = unsafe { mem::zeroed::<ibv_device_attr>() };
    // SAFETY: FFI.
    from_c_ret(unsafe { ibv_query_device(ctx, &mut dev_attr) }).map_err(Error::Device)?;
    if port_num == 0 || port_num > dev_attr.phys_port_cnt {
        return Err(Error::DeviceNotFound(format!(
            "{} has no port {}",
            dev_name, port_num
        )));
    }

    // SAFETY: POD type.
    let mut port_attr = unsafe { mem::zeroed::<ibv_port_attr>() };
    // SAFETY: FFI.
    from_c_ret(unsafe { ibv_query_port(ctx, port_num, &mut port_attr) })
        .map_err(Error::Device)?;
    if port_attr.state != ibv_port_state::IBV_PORT_ACTIVE {
        return Err(Error::DeviceNotFound(format!(
            "{} port {} is not active",
            dev_name, port_num
        )));
    }

    let port_link = match port_attr.link_layer {
        IBV_LINK_LAYER_ETHERNET => LinkType::Ethernet,
        _ => LinkType::InfiniBand,
    };
    if port_link != link_type {
        return Err(Error::DeviceNotFound(format!(
            "{} port {} is {}, not {}",
            dev_name, port_num, port_link, link_type
        )));
    }

    let mtu = Mtu::try_from(port_attr.active_mtu)
        .map_err(|e| Error::Device(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    let (gid, gid_index) = if link_type.is_global() {
        find_roce_v2_gid(inner, dev_name, port_num, port_attr.gid_tbl_len).ok_or_else(|| {
            Error::DeviceNotFound(format!("{} port {} has no usable GID", dev_name, port_num))
        })?
    } else {
        (Gid::ZERO, -1)
    };

    Ok(PortInfo {
        dev_name: dev_name.to_owned(),
        num: port_num,
        link_type: port_link,
        lid: port_attr.lid,
        gid,
        gid_index,
        mtu,
    })
}

fn query_gid(inner: &ContextInner, port_num: PortNum, index: GidIndex) -> io::Result<Gid> {
    // SAFETY: POD type.
    let mut gid = unsafe { mem::zeroed::<ibv_gid>() };
    // SAFETY: FFI.
    from_c_ret(unsafe { ibv_query_gid(inner.ctx.as_ptr(), port_num, index, &mut gid) })?;
    // SAFETY: every bit pattern is a valid `raw`.
    Ok(Gid::from(unsafe { gid.raw }))
}

/// Whether the GID table entry is a RoCE v2 GID, according to sysfs.
fn is_roce_v2(dev_name: &str, port_num: PortNum, index: GidIndex) -> bool {
    let path = format!(
        "/sys/class/infiniband/{}/ports/{}/gid_attrs/types/{}",
        dev_name, port_num, index
    );
    fs::read_to_string(path)
        .map(|ty| ty.trim().eq_ignore_ascii_case("RoCE v2"))
        .unwrap_or(false)
}

/// Find the GID to address peers with on a RoCE port.
///
/// Prefer an IPv4-mapped RoCE v2 GID, then any RoCE v2 GID, then any
/// non-zero GID.
fn find_roce_v2_gid(
    inner: &ContextInner,
    dev_name: &str,
    port_num: PortNum,
    gid_tbl_len: i32,
) -> Option<(Gid, GidIndex)> {
    let mut v2 = None;
    let mut any = None;
    for index in 0..gid_tbl_len {
        let Ok(gid) = query_gid(inner, port_num, index) else {
            continue;
        };
        if gid == Gid::ZERO {
            continue;
        }
        if is_roce_v2(dev_name, port_num, index) {
            if gid.is_ipv4_mapped() {
                return Some((gid, index));
            }
            v2.get_or_insert((gid, index));
        }
        any.get_or_insert((gid, index));
    }
    v2.or(any)
}

impl DeviceContext for VerbsContext {
    fn port(&self) -> &PortInfo {
        &self.port
    }

    unsafe fn reg_mr(&self, addr: *mut u8, len: usize) -> io::Result<Box<dyn MemoryHandle>> {
        let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE | ibv_access_flags::IBV_ACCESS_REMOTE_READ;
        // SAFETY: FFI; the caller keeps the area valid for the lifetime of the
        // returned handle.
        let mr = ibv_reg_mr(self.inner.pd.as_ptr(), addr.cast(), len, access.0 as _);
        let mr = NonNull::new(mr).ok_or_else(io::Error::last_os_error)?;
        debug!("registered MR {:p}+{}", addr, len);
        Ok(Box::new(VerbsMr {
            _ctx: self.inner.clone(),
            mr,
        }))
    }

    fn create_qp(
        &self,
        caps: &QpCaps,
    ) -> io::Result<(Box<dyn QueuePair>, Box<dyn CompletionQueue>)> {
        let cq = VerbsCq::new(self.inner.clone(), caps.cq_depth)?;
        let qp = VerbsQp::new(self.inner.clone(), &cq, self.port.num, caps)?;
        Ok((Box::new(qp), Box::new(cq)))
    }
}

/// Registered memory region. Deregistered on drop.
struct VerbsMr {
    _ctx: Arc<ContextInner>,
    mr: NonNull<ibv_mr>,
}

unsafe impl Send for VerbsMr {}
unsafe impl Sync for VerbsMr {}

impl MemoryHandle for VerbsMr {
    fn lkey(&self) -> LKey {
        // SAFETY: the MR is valid while the handle is alive.
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    fn rkey(&self) -> RKey {
        // SAFETY: the MR is valid while the handle is alive.
        unsafe { (*self.mr.as_ptr()).rkey }
    }
}

impl Drop for VerbsMr {
    fn drop(&mut self) {
        // SAFETY: FFI; deregistered exactly once.
        let ret = unsafe { ibv_dereg_mr(self.mr.as_ptr()) };
        if let Err(e) = from_c_ret(ret) {
            error!("cannot deregister MR: {}", e);
        }
    }
}
