use std::fmt;

use thiserror::Error;

use super::type_alias::WrId;

/// Opcode of a completion queue entry.
///
/// Only the opcodes this crate posts are distinguished.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    /// RDMA read request.
    RdmaRead,

    /// Any other opcode, carrying the raw `ibv_wc_opcode` value.
    Other(u32),
}

impl WcOpcode {
    /// Raw value of `IBV_WC_RDMA_READ`.
    pub const RAW_RDMA_READ: u32 = 2;
}

impl From<u32> for WcOpcode {
    fn from(raw: u32) -> Self {
        match raw {
            Self::RAW_RDMA_READ => Self::RdmaRead,
            x => Self::Other(x),
        }
    }
}

/// Status of a completion queue entry.
///
/// Discriminants equal the `ibv_wc_status` values reported by hardware.
/// Messages follow [RDMAmojo](https://www.rdmamojo.com/2013/02/15/ibv_poll_cq/).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// The work request and the buffers it references are complete.
    #[error("success")]
    Success = 0,

    /// Message larger than the port supports, or local buffer too small.
    #[error("local length error")]
    LocLenErr = 1,

    /// Internal QP consistency error while processing the request.
    #[error("local QP operation error")]
    LocQpOpErr = 2,

    /// Unused (RD QPs only).
    #[error("local EE context operation error")]
    LocEecOpErr = 3,

    /// The scatter/gather list references a memory region invalid for the operation.
    #[error("local protection error")]
    LocProtErr = 4,

    /// The request was outstanding when the QP transitioned into the error state.
    #[error("WR flush error")]
    WrFlushErr = 5,

    /// Memory window binding failed.
    #[error("memory window bind error")]
    MwBindErr = 6,

    /// The responder returned an unexpected transport opcode.
    #[error("bad response error")]
    BadRespErr = 7,

    /// Protection error on a local data buffer.
    #[error("local access error")]
    LocAccessErr = 8,

    /// The responder detected an invalid request.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// Protection error on the remote buffer, e.g. a bad remote key or range.
    #[error("remote access error")]
    RemAccessErr = 10,

    /// The responder could not complete the operation.
    #[error("remote operation error")]
    RemOpErr = 11,

    /// The remote side did not acknowledge; usually wrong connection attributes
    /// or a vanished peer QP.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// The RNR NAK retry count was exceeded.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    /// Unused (RD QPs only).
    #[error("local RDD violation error")]
    LocRddViolErr = 14,

    /// Unused (RD QPs only).
    #[error("remote invalid RD request")]
    RemInvRdReqErr = 15,

    /// The responder aborted the operation.
    #[error("remote aborted error")]
    RemAbortErr = 16,

    /// Unused (RD QPs only).
    #[error("invalid EE context number")]
    InvEecnErr = 17,

    /// Unused (RD QPs only).
    #[error("invalid EE context state error")]
    InvEecStateErr = 18,

    /// A fatal error that may not be recoverable.
    #[error("fatal error")]
    FatalErr = 19,

    /// A response timed out.
    #[error("response timeout error")]
    RespTimeoutErr = 20,

    /// Any other error, including codes this crate does not recognize.
    #[error("general error")]
    GeneralErr = 21,
}

impl WcStatus {
    /// Get the raw status code.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl From<u32> for WcStatus {
    fn from(code: u32) -> Self {
        use WcStatus::*;
        match code {
            0 => Success,
            1 => LocLenErr,
            2 => LocQpOpErr,
            3 => LocEecOpErr,
            4 => LocProtErr,
            5 => WrFlushErr,
            6 => MwBindErr,
            7 => BadRespErr,
            8 => LocAccessErr,
            9 => RemInvReqErr,
            10 => RemAccessErr,
            11 => RemOpErr,
            12 => RetryExcErr,
            13 => RnrRetryExcErr,
            14 => LocRddViolErr,
            15 => RemInvRdReqErr,
            16 => RemAbortErr,
            17 => InvEecnErr,
            18 => InvEecStateErr,
            19 => FatalErr,
            20 => RespTimeoutErr,
            _ => GeneralErr,
        }
    }
}

/// Work completion entry, decoded from the provider's native representation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Wc {
    /// The work request ID.
    pub wr_id: WrId,

    /// The completion status.
    pub status: WcStatus,

    /// The opcode of the completed work request.
    pub opcode: WcOpcode,

    /// The number of bytes transferred.
    pub byte_len: u32,
}

impl Wc {
    /// Get the completion status as a `Result`.
    ///
    /// - If the status is success, return the number of bytes transferred.
    /// - Otherwise, return the status as an error.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.byte_len as usize),
            status => Err(status),
        }
    }
}

impl Default for Wc {
    fn default() -> Self {
        Self {
            wr_id: 0,
            status: WcStatus::Success,
            opcode: WcOpcode::RdmaRead,
            byte_len: 0,
        }
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id)
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for code in 0..=21 {
            assert_eq!(WcStatus::from(code).code(), code);
        }
        assert_eq!(WcStatus::from(999), WcStatus::GeneralErr);
    }

    #[test]
    fn wc_ok() {
        let wc = Wc {
            wr_id: 7,
            byte_len: 64,
            ..Default::default()
        };
        assert_eq!(wc.ok(), Ok(64));

        let wc = Wc {
            status: WcStatus::RemAccessErr,
            ..wc
        };
        assert_eq!(wc.ok(), Err(WcStatus::RemAccessErr));
        assert_eq!(WcStatus::RemAccessErr.to_string(), "remote access error");
    }
}
