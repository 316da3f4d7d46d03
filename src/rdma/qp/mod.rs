//! Queue pair and related types.

mod attr;
mod rq;
mod sq;

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::rc::Rc;

use log::{debug, warn};
use thiserror::Error;

pub use self::attr::*;
use self::rq::Rq;
use self::sq::Sq;
use crate::rdma::cq::{Cq, Cqe};
use crate::rdma::gid::Gid;
use crate::rdma::mr::MrError;
use crate::rdma::mr::Permission;
use crate::rdma::pd::{AccessError, Pd};
use crate::rdma::types::*;
use crate::rdma::wr::{RecvWr, SendWr};
use crate::roce::Transport;
use crate::wire::{legal_after, Opcode, Packet};

/// Width of an atomic operand in bytes.
pub(crate) const ATOMIC_BYTE_SIZE: usize = 8;

/// Number of packets a message of `len` bytes occupies at the given MTU.
/// A zero-length message still occupies one packet.
pub(crate) fn num_pkts(len: usize, pmtu: Pmtu) -> u32 {
    if len == 0 {
        1
    } else {
        len.div_ceil(pmtu.bytes()) as u32
    }
}

/// Send work request posting error type.
///
/// These are the immediate errors: the request is rejected and never
/// enqueued.
#[derive(Debug, Error)]
pub enum PostSendError {
    /// The queue pair is not ready to send.
    #[error("QP state is not RTS")]
    NotRts,

    /// The opcode requires immediate data or an invalidate rkey and the
    /// request carries none.
    #[error("work request requires immediate data or an invalidate rkey")]
    MissingImm,

    /// An atomic request's scatter element cannot hold the returned value.
    #[error("atomic landing buffer of {0} bytes cannot hold an 8-byte operand")]
    AtomicBufTooSmall(usize),

    /// The scatter element names an unknown local key.
    #[error("no MR registered under lkey {0:#x}")]
    InvalidLkey(LKey),

    /// The scatter element window is not within its memory region.
    #[error("scatter element not within its MR")]
    SgOutOfBounds(#[from] MrError),
}

/// Work request processing error type.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// No work request is queued.
    #[error("send queue is empty")]
    EmptyQueue,

    /// The queue pair has not been told its peer yet.
    #[error("QP has no destination; modify it to RTR first")]
    NoDestination,

    /// A local scatter buffer could not be read.
    #[error("local memory access failed")]
    LocalAccess(#[from] AccessError),

    /// The socket refused the packet.
    #[error("I/O error")]
    Io(#[from] io::Error),
}

/// QP state transition error type.
#[derive(Debug, Error)]
pub enum ModifyQpError {
    /// The requested state is not reachable from the current one.
    #[error("illegal QP state transition {from:?} -> {to:?}")]
    InvalidTransition { from: QpState, to: QpState },
}

/// Endpoint data identifying one side of a connection, exchanged through the
/// side-band rendezvous before the QPs are brought up.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct QpEndpoint {
    pub gid: Gid,
    pub qpn: Qpn,
}

/// Ownership holder of queue pair state.
struct QpInner {
    sq: Sq,
    rq: Rq,
}

/// Queue pair: one send queue and one receive queue under a single QPN.
///
/// The queue pair routes inbound packets: requests go to the receive queue,
/// responses to the send queue. Cloned handles share the same state.
pub struct Qp {
    qpn: Qpn,
    cq: Cq,
    local_gid: Gid,
    inner: Rc<RefCell<QpInner>>,
}

impl Qp {
    pub(crate) fn new(
        pd: &Pd,
        cq: &Cq,
        qpn: Qpn,
        pmtu: Pmtu,
        access_flags: Permission,
        tx: Transport,
    ) -> Self {
        pd.add_qp(qpn);
        let local_gid = tx.local_gid();
        let sq = Sq::new(pd, cq, qpn, pmtu, access_flags, tx.clone());
        let rq = Rq::new(pd, cq, qpn, pmtu, access_flags, tx);
        Self {
            qpn,
            cq: cq.clone(),
            local_gid,
            inner: Rc::new(RefCell::new(QpInner { sq, rq })),
        }
    }

    /// Make a clone of the queue pair handle.
    pub(crate) fn clone(&self) -> Self {
        Self {
            qpn: self.qpn,
            cq: self.cq.clone(),
            local_gid: self.local_gid,
            inner: self.inner.clone(),
        }
    }

    /// Get the queue pair number.
    #[inline]
    pub fn qpn(&self) -> Qpn {
        self.qpn
    }

    /// Get the current state of the queue pair.
    #[inline]
    pub fn state(&self) -> QpState {
        self.inner.borrow().sq.state
    }

    /// Get the endpoint data of this queue pair for the side-band exchange.
    pub fn endpoint(&self) -> QpEndpoint {
        QpEndpoint {
            gid: self.local_gid,
            qpn: self.qpn,
        }
    }

    /// Apply the given attributes to both queues.
    ///
    /// State changes are validated: INIT goes to RTR (the responder becomes
    /// active), RTR to RTS (the requester as well), and any state may enter
    /// ERR.
    pub fn modify_qp(&self, attr: &QpAttr) -> Result<(), ModifyQpError> {
        let mut inner = self.inner.borrow_mut();
        if let Some(to) = attr.qps {
            let from = inner.sq.state;
            let legal = matches!(
                (from, to),
                (QpState::Init, QpState::Rtr) | (QpState::Rtr, QpState::Rts) | (_, QpState::Err)
            );
            if !legal {
                return Err(ModifyQpError::InvalidTransition { from, to });
            }
        }
        inner.sq.modify(attr);
        inner.rq.modify(attr);
        Ok(())
    }

    /// Post a send-type work request.
    pub fn post_send(&self, wr: SendWr) -> Result<(), PostSendError> {
        self.inner.borrow_mut().sq.push(wr)
    }

    /// Post a receive work request. Posting never blocks and never fails.
    pub fn post_recv(&self, wr: RecvWr) {
        self.inner.borrow_mut().rq.post_recv(wr);
    }

    /// Process one queued send work request: segment it into packets and
    /// put them on the wire.
    pub fn process_one_sr(&self) -> Result<(), ProcessError> {
        self.inner.borrow_mut().sq.process_one()
    }

    /// Poll one completion entry off the completion queue.
    pub fn poll_cq(&self) -> Option<Cqe> {
        self.cq.poll_one()
    }

    /// Dispatch one inbound packet.
    pub(crate) fn recv_pkt(&self, pkt: Packet) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let op = pkt.opcode();

        if pkt.bth.dqpn != self.qpn {
            warn!("QP={}: packet for QPN {} dropped", self.qpn, pkt.bth.dqpn);
            return Ok(());
        }
        if op == Opcode::Cnp {
            debug!("QP={}: congestion notification received", self.qpn);
            return Ok(());
        }
        if !op.is_rc() {
            warn!("QP={}: non-RC opcode {op:?} dropped", self.qpn);
            return Ok(());
        }
        if pkt.bth.version != 0 {
            warn!("QP={}: unsupported header version {}", self.qpn, pkt.bth.version);
            return Ok(());
        }

        // Out-of-sequence opcode pairs are invalid requests (responder
        // class C).
        if !legal_after(inner.rq.prev_op, op) {
            warn!(
                "QP={}: opcode {op:?} illegal after {:?}",
                self.qpn, inner.rq.prev_op
            );
            if op.is_request() {
                inner.rq.nak_invalid(pkt.psn())?;
            }
            return Ok(());
        }

        if op.is_request() {
            inner.rq.recv_req(&pkt)?;
            inner.rq.prev_op = Some(op);
        } else if inner.sq.is_expected_resp(pkt.psn()) {
            inner.sq.handle_normal_resp(&pkt)?;
            inner.rq.prev_op = Some(op);
        } else {
            // Ghost, duplicate or illegal responses do not move prev_op.
            inner.sq.handle_dup_or_illegal_resp(&pkt);
        }
        Ok(())
    }
}

impl fmt::Debug for Qp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Qp").field("qpn", &self.qpn).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
    use std::time::Duration;

    use super::*;
    use crate::rdma::cq::{WcOpcode, WcStatus};
    use crate::rdma::remote_mem::RemoteMem;
    use crate::rdma::wr::Sge;
    use crate::roce::{Roce, RoceConfig};
    use crate::wire::*;

    fn endpoint(ip: Ipv4Addr, port: u16) -> Roce {
        Roce::new(RoceConfig {
            bind: ip,
            port,
            pmtu: Pmtu::Mtu256,
            recv_timeout: Duration::from_millis(500),
        })
        .unwrap()
    }

    fn fake_peer(ip: Ipv4Addr, port: u16) -> UdpSocket {
        let sock = UdpSocket::bind(SocketAddrV4::new(ip, port)).unwrap();
        sock.set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        sock
    }

    fn capture(sock: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 8192];
        let (len, _) = sock.recv_from(&mut buf).unwrap();
        buf[..len].to_vec()
    }

    fn inject(sock: &UdpSocket, to: SocketAddrV4, pkt: &Packet) {
        // The receive path does not verify the ICRC, so any context works.
        let ctx = IcrcContext {
            src: Ipv4Addr::LOCALHOST,
            dst: Ipv4Addr::LOCALHOST,
            sport: to.port(),
            dport: to.port(),
        };
        sock.send_to(&pkt.encode(&ctx), to).unwrap();
    }

    #[test]
    fn modify_qp_transitions() {
        let mut roce = endpoint(Ipv4Addr::new(127, 0, 0, 1), 15811);
        let pd = roce.alloc_pd();
        let cq = roce.create_cq();
        let qp = roce.create_qp(&pd, &cq, Permission::default());
        assert_eq!(qp.state(), QpState::Init);

        let peer = Gid::from(Ipv4Addr::new(127, 0, 0, 2));
        assert!(matches!(
            qp.modify_qp(&QpAttr::rts(0)),
            Err(ModifyQpError::InvalidTransition { .. })
        ));
        qp.modify_qp(&QpAttr::rtr(peer, 9, 0)).unwrap();
        assert_eq!(qp.state(), QpState::Rtr);
        assert!(qp.modify_qp(&QpAttr::rtr(peer, 9, 0)).is_err());
        qp.modify_qp(&QpAttr::rts(0)).unwrap();
        assert_eq!(qp.state(), QpState::Rts);

        qp.modify_qp(&QpAttr {
            qps: Some(QpState::Err),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(qp.state(), QpState::Err);
    }

    #[test]
    fn post_send_validation() {
        let mut roce = endpoint(Ipv4Addr::new(127, 0, 0, 1), 15812);
        let pd = roce.alloc_pd();
        let cq = roce.create_cq();
        let qp = roce.create_qp(&pd, &cq, Permission::default());
        let mr = pd.reg_mr(0, 64, Permission::default() | Permission::ZERO_BASED);

        let sge = Sge::new(0, 8, mr.lkey());
        assert!(matches!(
            qp.post_send(SendWr::send(sge, 1)),
            Err(PostSendError::NotRts)
        ));

        qp.modify_qp(&QpAttr::rtr(Gid::from(Ipv4Addr::new(127, 0, 0, 2)), 9, 0))
            .unwrap();
        qp.modify_qp(&QpAttr::rts(0)).unwrap();

        let mut wr = SendWr::send(sge, 2);
        wr.opcode = crate::rdma::wr::WrOpcode::SendWithImm;
        assert!(matches!(qp.post_send(wr), Err(PostSendError::MissingImm)));

        let small = Sge::new(0, 4, mr.lkey());
        assert!(matches!(
            qp.post_send(SendWr::compare_swap(small, 3, RemoteMem::dummy(), 0, 1)),
            Err(PostSendError::AtomicBufTooSmall(4))
        ));

        let bad_key = Sge::new(0, 8, 0xBAD);
        assert!(matches!(
            qp.post_send(SendWr::send(bad_key, 4)),
            Err(PostSendError::InvalidLkey(0xBAD))
        ));

        let oversized = Sge::new(0, 65, mr.lkey());
        assert!(matches!(
            qp.post_send(SendWr::send(oversized, 5)),
            Err(PostSendError::SgOutOfBounds(_))
        ));

        assert!(qp.post_send(SendWr::send(sge, 6)).is_ok());
    }

    #[test]
    fn rnr_retry_exhaustion() {
        let a_ip = Ipv4Addr::new(127, 0, 0, 1);
        let b_ip = Ipv4Addr::new(127, 0, 0, 2);
        let mut a = endpoint(a_ip, 15813);
        let mut b = endpoint(b_ip, 15813);

        let (a_pd, a_cq) = (a.alloc_pd(), a.create_cq());
        let a_qp = a.create_qp(&a_pd, &a_cq, Permission::default());
        let (b_pd, b_cq) = (b.alloc_pd(), b.create_cq());
        let b_qp = b.create_qp(&b_pd, &b_cq, Permission::default());

        a_qp.modify_qp(&QpAttr::rtr(b.local_gid(), b_qp.qpn(), 0))
            .unwrap();
        a_qp.modify_qp(&QpAttr::rts(0)).unwrap();
        a_qp.modify_qp(&QpAttr {
            rnr_retry: Some(1),
            ..Default::default()
        })
        .unwrap();
        b_qp.modify_qp(&QpAttr::rtr(a.local_gid(), a_qp.qpn(), 0))
            .unwrap();

        let a_mr = a_pd.reg_mr(0, 64, Permission::default() | Permission::ZERO_BASED);
        a_mr.write(0, b"ping").unwrap();
        a_qp.post_send(SendWr::send(Sge::new(0, 4, a_mr.lkey()), 77).signaled())
            .unwrap();
        a_qp.process_one_sr().unwrap();

        // B has no receive WR: every delivery provokes an RNR NAK. With
        // rnr_retry = 1, the second NAK for the same PSN gives up.
        b.recv_pkts(1).unwrap();
        a.recv_pkts(1).unwrap();
        b.recv_pkts(1).unwrap();
        a.recv_pkts(1).unwrap();

        let cqe = a_qp.poll_cq().unwrap();
        assert_eq!(cqe.wr_id, 77);
        assert_eq!(cqe.status, WcStatus::RnrRetryExcErr);
        assert_eq!(a_qp.state(), QpState::Err);
        assert!(b_qp.poll_cq().is_none());
    }

    #[test]
    fn rnr_retry_is_bit_identical() {
        let port = 15814;
        let a_ip = Ipv4Addr::new(127, 0, 0, 1);
        let peer_ip = Ipv4Addr::new(127, 0, 0, 2);
        let mut a = endpoint(a_ip, port);
        let peer = fake_peer(peer_ip, port);

        let (pd, cq) = (a.alloc_pd(), a.create_cq());
        let qp = a.create_qp(&pd, &cq, Permission::default());
        qp.modify_qp(&QpAttr::rtr(Gid::from(peer_ip), 9, 0)).unwrap();
        qp.modify_qp(&QpAttr::rts(0)).unwrap();

        let mr = pd.reg_mr(0, 64, Permission::default() | Permission::ZERO_BASED);
        mr.write(0, b"retryable payload").unwrap();
        qp.post_send(SendWr::send(Sge::new(0, 17, mr.lkey()), 1).signaled())
            .unwrap();
        qp.process_one_sr().unwrap();
        let first = capture(&peer);

        let bth = Bth::new(Opcode::Acknowledge, qp.qpn(), 0);
        let rnr = Packet::new(bth, ExtHdr::Aeth(Aeth::rnr(10, 0)), Vec::new());
        inject(&peer, SocketAddrV4::new(a_ip, port), &rnr);
        a.recv_pkts(1).unwrap();

        let second = capture(&peer);
        assert_eq!(first, second);
    }

    #[test]
    fn nak_seq_rebuilds_partial_read() {
        let port = 15815;
        let a_ip = Ipv4Addr::new(127, 0, 0, 1);
        let peer_ip = Ipv4Addr::new(127, 0, 0, 2);
        let mut a = endpoint(a_ip, port);
        let peer = fake_peer(peer_ip, port);
        let a_addr = SocketAddrV4::new(a_ip, port);

        let (pd, cq) = (a.alloc_pd(), a.create_cq());
        let qp = a.create_qp(&pd, &cq, Permission::default());
        qp.modify_qp(&QpAttr::rtr(Gid::from(peer_ip), 9, 0)).unwrap();
        qp.modify_qp(&QpAttr::rts(0)).unwrap();

        let mr = pd.reg_mr(0, 1024, Permission::default() | Permission::ZERO_BASED);
        let remote = RemoteMem::new(0x5000, 768, 0x208);
        qp.post_send(SendWr::read(Sge::new(0, 768, mr.lkey()), 42, remote))
            .unwrap();
        qp.process_one_sr().unwrap();
        // One PSN reserved per expected response packet.
        assert_eq!(qp.inner.borrow().sq.sq_psn(), 3);

        let req = Packet::decode(&capture(&peer)).unwrap();
        assert_eq!(req.opcode(), Opcode::RdmaReadRequest);
        assert_eq!(req.reth(), Some((0x5000, 0x208, 768)));
        let p0 = req.psn();

        // First response packet carries the first 256 bytes.
        let first = Packet::new(
            Bth::new(Opcode::RdmaReadResponseFirst, qp.qpn(), p0),
            ExtHdr::Aeth(Aeth::ack(1)),
            vec![0xAA; 256],
        );
        inject(&peer, a_addr, &first);
        a.recv_pkts(1).unwrap();

        // Mid-stream sequence error at the second response PSN.
        let nak = Packet::new(
            Bth::new(Opcode::Acknowledge, qp.qpn(), psn::next(p0)),
            ExtHdr::Aeth(Aeth::nak(NAK_PSN_SEQ_ERR, 1)),
            Vec::new(),
        );
        inject(&peer, a_addr, &nak);
        a.recv_pkts(1).unwrap();

        // The requester rebuilds a narrowed read for the missing 512 bytes.
        let retry = Packet::decode(&capture(&peer)).unwrap();
        assert_eq!(retry.opcode(), Opcode::RdmaReadRequest);
        assert_eq!(retry.psn(), psn::next(p0));
        assert_eq!(retry.reth(), Some((0x5000 + 256, 0x208, 512)));

        // Serve the narrowed request.
        let resume_first = Packet::new(
            Bth::new(Opcode::RdmaReadResponseFirst, qp.qpn(), psn::next(p0)),
            ExtHdr::Aeth(Aeth::ack(1)),
            vec![0xBB; 256],
        );
        let resume_last = Packet::new(
            Bth::new(Opcode::RdmaReadResponseLast, qp.qpn(), psn::advance(p0, 2)),
            ExtHdr::Aeth(Aeth::ack(1)),
            vec![0xCC; 256],
        );
        inject(&peer, a_addr, &resume_first);
        inject(&peer, a_addr, &resume_last);
        a.recv_pkts(2).unwrap();

        let cqe = qp.poll_cq().unwrap();
        assert_eq!(cqe.wr_id, 42);
        assert_eq!(cqe.status, WcStatus::Success);
        assert_eq!(cqe.opcode, WcOpcode::RdmaRead);
        assert_eq!(cqe.byte_len, 768);

        assert_eq!(mr.read(0, 256).unwrap(), vec![0xAA; 256]);
        assert_eq!(mr.read(256, 256).unwrap(), vec![0xBB; 256]);
        assert_eq!(mr.read(512, 256).unwrap(), vec![0xCC; 256]);

        // The unacknowledged window has drained.
        assert_eq!(qp.inner.borrow().sq.min_unacked_psn(), 3);
    }

    #[test]
    fn fatal_nak_flushes_in_posting_order() {
        let port = 15816;
        let a_ip = Ipv4Addr::new(127, 0, 0, 1);
        let peer_ip = Ipv4Addr::new(127, 0, 0, 2);
        let mut a = endpoint(a_ip, port);
        let peer = fake_peer(peer_ip, port);

        let (pd, cq) = (a.alloc_pd(), a.create_cq());
        let qp = a.create_qp(&pd, &cq, Permission::default());
        qp.modify_qp(&QpAttr::rtr(Gid::from(peer_ip), 9, 0)).unwrap();
        qp.modify_qp(&QpAttr::rts(0)).unwrap();

        let mr = pd.reg_mr(0, 64, Permission::default() | Permission::ZERO_BASED);
        let remote = RemoteMem::new(0x9000, 16, 0xBAD);
        for wr_id in 1..=3 {
            qp.post_send(
                SendWr::write(Sge::new(0, 16, mr.lkey()), wr_id, remote).signaled(),
            )
            .unwrap();
            qp.process_one_sr().unwrap();
            capture(&peer);
        }

        // The responder rejects the first write's rkey.
        let nak = Packet::new(
            Bth::new(Opcode::Acknowledge, qp.qpn(), 0),
            ExtHdr::Aeth(Aeth::nak(NAK_REMOTE_ACCESS, 0)),
            Vec::new(),
        );
        inject(&peer, SocketAddrV4::new(a_ip, port), &nak);
        a.recv_pkts(1).unwrap();

        let first = qp.poll_cq().unwrap();
        assert_eq!(first.wr_id, 1);
        assert_eq!(first.status, WcStatus::RemAccessErr);
        assert_eq!(first.opcode, WcOpcode::RdmaWrite);
        for wr_id in 2..=3 {
            let cqe = qp.poll_cq().unwrap();
            assert_eq!(cqe.wr_id, wr_id);
            assert_eq!(cqe.status, WcStatus::WrFlushErr);
        }
        assert!(qp.poll_cq().is_none());
        assert_eq!(qp.state(), QpState::Err);

        // Posting after the flush sweep is refused.
        assert!(matches!(
            qp.post_send(SendWr::write(Sge::new(0, 16, mr.lkey()), 4, remote)),
            Err(PostSendError::NotRts)
        ));
    }

    #[test]
    fn duplicate_send_replays_patched_ack() {
        let port = 15817;
        let b_ip = Ipv4Addr::new(127, 0, 0, 2);
        let peer_ip = Ipv4Addr::new(127, 0, 0, 1);
        let mut b = endpoint(b_ip, port);
        let peer = fake_peer(peer_ip, port);
        let b_addr = SocketAddrV4::new(b_ip, port);

        let (pd, cq) = (b.alloc_pd(), b.create_cq());
        let qp = b.create_qp(&pd, &cq, Permission::default());
        qp.modify_qp(&QpAttr::rtr(Gid::from(peer_ip), 7, 0)).unwrap();

        let mr = pd.reg_mr(0, 256, Permission::default() | Permission::ZERO_BASED);
        qp.post_recv(RecvWr::new(Sge::new(0, 128, mr.lkey()), 1));
        qp.post_recv(RecvWr::new(Sge::new(128, 128, mr.lkey()), 2));

        let send = |psn: Psn, data: &[u8]| {
            let mut bth = Bth::new(Opcode::SendOnly, qp.qpn(), psn);
            bth.ackreq = true;
            inject(&peer, b_addr, &Packet::new(bth, ExtHdr::None, data.to_vec()));
        };

        send(0, b"first");
        b.recv_pkts(1).unwrap();
        let ack0 = Packet::decode(&capture(&peer)).unwrap();
        assert_eq!(ack0.psn(), 0);
        assert_eq!(ack0.aeth().unwrap().msn, 1);

        send(1, b"second");
        b.recv_pkts(1).unwrap();
        let ack1 = Packet::decode(&capture(&peer)).unwrap();
        assert_eq!(ack1.psn(), 1);
        assert_eq!(qp.poll_cq().unwrap().wr_id, 1);
        assert_eq!(qp.poll_cq().unwrap().wr_id, 2);

        // The duplicate of PSN 0 replays the cached ACK, patched to the
        // newest consumed PSN, and consumes nothing.
        send(0, b"first");
        b.recv_pkts(1).unwrap();
        let replay = Packet::decode(&capture(&peer)).unwrap();
        assert_eq!(replay.opcode(), Opcode::Acknowledge);
        assert_eq!(replay.psn(), 1);
        assert_eq!(replay.aeth().unwrap().code, AethCode::Ack);
        assert!(qp.poll_cq().is_none());
        assert_eq!(mr.read(0, 5).unwrap(), b"first");
        assert_eq!(qp.inner.borrow().rq.rq_psn(), 2);
    }
}
