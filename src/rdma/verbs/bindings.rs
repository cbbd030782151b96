//! Bindings of libibverbs C interfaces.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(unused)]

mod private {
    use libc::*;
    include!(concat!(env!("OUT_DIR"), "/verbs_bindings.rs"));
}

pub(crate) use self::private::*;

pub const IBV_LINK_LAYER_UNSPECIFIED: u8 = 0;
pub const IBV_LINK_LAYER_INFINIBAND: u8 = 1;
pub const IBV_LINK_LAYER_ETHERNET: u8 = 2;

extern "C" {
    /// Query the attributes of a device port.
    ///
    /// `verbs.h` redirects this name to an inline wrapper; the exported symbol
    /// fills the leading fields of `ibv_port_attr`, which include every field
    /// this crate reads.
    pub fn ibv_query_port(
        context: *mut ibv_context,
        port_num: u8,
        port_attr: *mut ibv_port_attr,
    ) -> ::std::os::raw::c_int;
}

/// Poll a CQ for (possibly multiple) completions.
///
/// If the return value is non-negative and strictly less than `num_entries`,
/// then the CQ was emptied.
#[inline]
pub unsafe fn ibv_poll_cq(
    cq: *mut ibv_cq,
    num_entries: ::std::os::raw::c_int,
    wc: *mut ibv_wc,
) -> ::std::os::raw::c_int {
    match (*(*cq).context).ops.poll_cq {
        Some(poll_cq) => poll_cq(cq, num_entries, wc),
        None => -libc::EOPNOTSUPP,
    }
}

/// Post a list of work requests to a send queue.
#[inline]
pub unsafe fn ibv_post_send(
    qp: *mut ibv_qp,
    wr: *mut ibv_send_wr,
    bad_wr: *mut *mut ibv_send_wr,
) -> ::std::os::raw::c_int {
    match (*(*qp).context).ops.post_send {
        Some(post_send) => post_send(qp, wr, bad_wr),
        None => libc::EOPNOTSUPP,
    }
}

/// Request a completion notification on a CQ.
#[inline]
pub unsafe fn ibv_req_notify_cq(
    cq: *mut ibv_cq,
    solicited_only: ::std::os::raw::c_int,
) -> ::std::os::raw::c_int {
    match (*(*cq).context).ops.req_notify_cq {
        Some(req_notify_cq) => req_notify_cq(cq, solicited_only),
        None => libc::EOPNOTSUPP,
    }
}
