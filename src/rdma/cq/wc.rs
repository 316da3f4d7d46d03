use std::ops::{BitOr, BitOrAssign};

use thiserror::Error;

use crate::rdma::types::*;
use crate::rdma::wr::WrOpcode;
use crate::wire::{NAK_INVALID_REQUEST, NAK_REMOTE_ACCESS, NAK_REMOTE_OP};

/// Opcode of a completion queue entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    Send,
    /// RDMA write request.
    RdmaWrite,
    /// RDMA read request.
    RdmaRead,
    /// RDMA compare-and-swap request.
    CompSwap,
    /// RDMA fetch-and-add request.
    FetchAdd,
    /// Receive request.
    Recv,
    /// Receive of an RDMA write with immediate data.
    RecvRdmaImm,
}

impl WcOpcode {
    /// The completion opcode of a requester-side work request.
    pub fn from_wr(op: WrOpcode) -> Self {
        match op {
            WrOpcode::Send | WrOpcode::SendWithImm | WrOpcode::SendWithInv => Self::Send,
            WrOpcode::Write | WrOpcode::WriteWithImm => Self::RdmaWrite,
            WrOpcode::Read => Self::RdmaRead,
            WrOpcode::CompSwap => Self::CompSwap,
            WrOpcode::FetchAdd => Self::FetchAdd,
        }
    }

}

/// Status of a completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    /// Operation completed successfully.
    #[error("success")]
    Success,

    /// **Local Length Error:** an assembled message did not match the length
    /// its request announced, or a landing buffer was too small.
    #[error("local length error")]
    LocLenErr,

    /// **Local Protection Error:** a locally posted work request's buffers do
    /// not reference a memory region valid for the requested operation.
    #[error("local protection error")]
    LocProtErr,

    /// **Work Request Flushed Error:** the work request was outstanding when
    /// the queue pair transitioned into the error state.
    #[error("WR flush error")]
    WrFlushErr,

    /// **Remote Invalid Request Error:** the responder detected an invalid
    /// message on the channel, e.g. an out-of-sequence opcode, a length
    /// violation, or an operation the remote queue pair does not support.
    #[error("remote invalid request error")]
    RemInvReqErr,

    /// **Remote Access Error:** a protection error on the remote data buffer
    /// named by an RDMA read, write, or atomic operation.
    #[error("remote access error")]
    RemAccessErr,

    /// **Remote Operation Error:** the responder could not complete the
    /// operation.
    #[error("remote operation error")]
    RemOpErr,

    /// **RNR Retry Counter Exceeded:** the receiver kept answering
    /// receiver-not-ready more times than the configured retry count.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr,
}

impl WcStatus {
    /// Map a fatal AETH NAK value to the status the requester surfaces.
    pub(crate) fn from_nak(value: u8) -> Self {
        match value {
            NAK_INVALID_REQUEST => Self::RemInvReqErr,
            NAK_REMOTE_ACCESS => Self::RemAccessErr,
            NAK_REMOTE_OP => Self::RemOpErr,
            _ => Self::RemOpErr,
        }
    }
}

/// Flag bits of a completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct WcFlags(u32);

impl WcFlags {
    pub const EMPTY: Self = Self(0);
    pub const WITH_IMM: Self = Self(1);
    pub const WITH_INV: Self = Self(2);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for WcFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for WcFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Completion queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cqe {
    /// Identifier of the completed work request.
    pub wr_id: WrId,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    /// Number of bytes processed or transferred.
    pub byte_len: usize,
    /// The local queue pair the completion belongs to.
    pub qpn: Qpn,
    /// The remote queue pair the message travelled to or from.
    pub src_qp: Qpn,
    pub flags: WcFlags,
    /// Immediate data or invalidated rkey, when `flags` says one is present.
    pub imm_data_or_inv_rkey: Option<u32>,
}

impl Cqe {
    /// Get the completion status as a `Result` over the transferred length.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.byte_len),
            status => Err(status),
        }
    }

    /// Get the immediate data if the completion carries one.
    #[inline]
    pub fn imm(&self) -> Option<ImmData> {
        self.flags
            .contains(WcFlags::WITH_IMM)
            .then_some(self.imm_data_or_inv_rkey)
            .flatten()
    }
}
