use crate::rdma::gid::Gid;
use crate::rdma::mr::Permission;
use crate::rdma::types::*;

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    /// Freshly created; neither side active.
    Init,

    /// Ready to receive: peer addressing is known, the responder is active.
    Rtr,

    /// Ready to send: the requester is active as well.
    Rts,

    /// Error: entered on a fatal NAK; all send work requests flush.
    Err,
}

/// Named attributes accepted by [`Qp::modify_qp`](super::Qp::modify_qp).
///
/// Only attributes that are `Some` are applied. The retry, timeout and
/// rd-atomic parameters are recorded on the queue pair but not driven by an
/// internal timer.
#[derive(Debug, Clone, Default)]
pub struct QpAttr {
    pub qps: Option<QpState>,
    pub pmtu: Option<Pmtu>,
    pub rq_psn: Option<Psn>,
    pub sq_psn: Option<Psn>,
    pub dgid: Option<Gid>,
    pub dst_qpn: Option<Qpn>,
    pub access_flags: Option<Permission>,
    pub pkey: Option<u16>,
    pub sq_draining: Option<bool>,
    pub max_rd_atomic: Option<u8>,
    pub max_dest_rd_atomic: Option<u8>,
    pub min_rnr_timer: Option<u8>,
    pub timeout: Option<u8>,
    pub retry_cnt: Option<u8>,
    pub rnr_retry: Option<u8>,
}

impl QpAttr {
    /// Attributes bringing a queue pair to RTR against the given peer.
    pub fn rtr(dgid: Gid, dst_qpn: Qpn, rq_psn: Psn) -> Self {
        Self {
            qps: Some(QpState::Rtr),
            dgid: Some(dgid),
            dst_qpn: Some(dst_qpn),
            rq_psn: Some(rq_psn),
            ..Default::default()
        }
    }

    /// Attributes bringing a queue pair to RTS.
    pub fn rts(sq_psn: Psn) -> Self {
        Self {
            qps: Some(QpState::Rts),
            sq_psn: Some(sq_psn),
            ..Default::default()
        }
    }
}
