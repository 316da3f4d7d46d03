//! Send queue: the requester half of the reliable-connected pipeline.
//!
//! Work requests are segmented into packets at the path MTU, assigned PSNs,
//! and retained per PSN for retransmission and duplicate bookkeeping until a
//! response acknowledges them. A single response acknowledges every earlier
//! send/write (coalesced ACK); reads and atomics must be answered
//! explicitly, so finding one below an acknowledged PSN is an implicit NAK.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;

use log::{debug, trace, warn};

use super::attr::{QpAttr, QpState};
use super::{num_pkts, PostSendError, ProcessError, ATOMIC_BYTE_SIZE};
use crate::rdma::cq::{Cq, Cqe, WcFlags, WcOpcode, WcStatus};
use crate::rdma::gid::Gid;
use crate::rdma::mr::{Mr, Permission};
use crate::rdma::pd::{AccessError, Pd};
use crate::rdma::types::*;
use crate::rdma::wr::{SendFlags, SendWr, WrOpcode};
use crate::roce::Transport;
use crate::wire::*;

/// A request packet retained for retransmission, keyed by its PSN.
struct Retained {
    pkt: Packet,
    ssn: Ssn,
}

/// Requester-side assembly state for an in-flight multi-packet read
/// response. Created on the first/only response packet, discarded on
/// last/only.
struct ReadRespCtx {
    mr: Mr,
    dlen: u32,
    laddr: u64,
    offset: u32,
    ssn: Ssn,
    orig_psn: Psn,
}

/// Map a local access validation failure to the status class B surfaces.
fn local_status(err: &AccessError) -> WcStatus {
    match err {
        AccessError::OutOfBounds(_) => WcStatus::LocLenErr,
        _ => WcStatus::LocProtErr,
    }
}

/// Check a read-response payload length against its position in the message.
fn resp_size_ok(pmtu: Pmtu, op: Opcode, len: usize) -> bool {
    use Opcode::*;
    match op {
        RdmaReadResponseFirst | RdmaReadResponseMiddle => len == pmtu.bytes(),
        RdmaReadResponseLast => len >= 1 && len <= pmtu.bytes(),
        RdmaReadResponseOnly => len <= pmtu.bytes(),
        _ => true,
    }
}

enum AckOutcome {
    /// The retained packet was a send/write; completed if terminal.
    Acked,
    /// No packet is retained at this PSN (a read-response reservation).
    Skipped,
    /// The retained packet is a read or atomic request; coalescing stops.
    Stopped,
}

pub(crate) struct Sq {
    qpn: Qpn,
    pub(crate) state: QpState,
    pd: Pd,
    cq: Cq,
    tx: Transport,

    pmtu: Pmtu,
    sq_psn: Psn,
    ssn: Ssn,
    min_unacked_psn: Psn,

    dgid: Option<Gid>,
    dst_qpn: Option<Qpn>,
    access_flags: Permission,
    #[allow(dead_code)]
    pkey: u16,

    // Recorded tunables; retries here are driven by peer NAKs, not timers.
    #[allow(dead_code)]
    draining: bool,
    #[allow(dead_code)]
    max_rd_atomic: u8,
    #[allow(dead_code)]
    max_dest_rd_atomic: u8,
    #[allow(dead_code)]
    min_rnr_timer: u8,
    #[allow(dead_code)]
    timeout: u8,
    #[allow(dead_code)]
    retry_cnt: u8,
    rnr_retry: u8,

    queue: VecDeque<SendWr>,
    /// Emitted request packets keyed by PSN.
    req_pkts: HashMap<Psn, Retained>,
    /// Posted-but-uncompleted work requests keyed by SSN.
    pending: BTreeMap<Ssn, SendWr>,
    read_resp_ctx: Option<ReadRespCtx>,
    /// Consecutive RNR NAKs seen for one PSN.
    rnr_counter: Option<(Psn, u8)>,
}

impl Sq {
    pub(crate) fn new(
        pd: &Pd,
        cq: &Cq,
        qpn: Qpn,
        pmtu: Pmtu,
        access_flags: Permission,
        tx: Transport,
    ) -> Self {
        Self {
            qpn,
            state: QpState::Init,
            pd: pd.clone(),
            cq: cq.clone(),
            tx,
            pmtu,
            sq_psn: 0,
            ssn: 1,
            min_unacked_psn: 0,
            dgid: None,
            dst_qpn: None,
            access_flags,
            pkey: PKEY_DEFAULT,
            draining: false,
            max_rd_atomic: 10,
            max_dest_rd_atomic: 10,
            min_rnr_timer: 10,
            timeout: 10,
            retry_cnt: 3,
            rnr_retry: 3,
            queue: VecDeque::new(),
            req_pkts: HashMap::new(),
            pending: BTreeMap::new(),
            read_resp_ctx: None,
            rnr_counter: None,
        }
    }

    pub(crate) fn modify(&mut self, attr: &QpAttr) {
        if let Some(qps) = attr.qps {
            self.state = qps;
        }
        if let Some(pmtu) = attr.pmtu {
            self.pmtu = pmtu;
        }
        if let Some(sq_psn) = attr.sq_psn {
            // Re-basing the flow moves the unacknowledged window with it.
            self.sq_psn = psn::mask(sq_psn);
            self.min_unacked_psn = self.sq_psn;
        }
        if let Some(dgid) = attr.dgid {
            self.dgid = Some(dgid);
        }
        if let Some(dst_qpn) = attr.dst_qpn {
            self.dst_qpn = Some(dst_qpn);
        }
        if let Some(flags) = attr.access_flags {
            self.access_flags = flags;
        }
        if let Some(pkey) = attr.pkey {
            self.pkey = pkey;
        }
        if let Some(draining) = attr.sq_draining {
            self.draining = draining;
        }
        if let Some(v) = attr.max_rd_atomic {
            self.max_rd_atomic = v;
        }
        if let Some(v) = attr.max_dest_rd_atomic {
            self.max_dest_rd_atomic = v;
        }
        if let Some(v) = attr.min_rnr_timer {
            self.min_rnr_timer = v;
        }
        if let Some(v) = attr.timeout {
            self.timeout = v;
        }
        if let Some(v) = attr.retry_cnt {
            self.retry_cnt = v;
        }
        if let Some(v) = attr.rnr_retry {
            self.rnr_retry = v;
        }
    }

    #[inline]
    pub(crate) fn sq_psn(&self) -> Psn {
        self.sq_psn
    }

    #[inline]
    pub(crate) fn min_unacked_psn(&self) -> Psn {
        self.min_unacked_psn
    }

    fn dqpn(&self) -> io::Result<Qpn> {
        self.dst_qpn
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "QP has no destination QPN"))
    }

    /// Validate and enqueue a send work request.
    pub(crate) fn push(&mut self, wr: SendWr) -> Result<(), PostSendError> {
        if self.state != QpState::Rts {
            return Err(PostSendError::NotRts);
        }
        if matches!(
            wr.opcode,
            WrOpcode::SendWithImm | WrOpcode::SendWithInv | WrOpcode::WriteWithImm
        ) && wr.imm_data_or_inv_rkey.is_none()
        {
            return Err(PostSendError::MissingImm);
        }
        if wr.opcode.is_atomic() && wr.sge.len < ATOMIC_BYTE_SIZE {
            return Err(PostSendError::AtomicBufTooSmall(wr.sge.len));
        }
        if wr.sge.len > 0 {
            let mr = self
                .pd
                .mr(wr.sge.lkey)
                .ok_or(PostSendError::InvalidLkey(wr.sge.lkey))?;
            mr.check_bounds(wr.sge.addr, wr.sge.len)?;
        }
        self.queue.push_back(wr);
        Ok(())
    }

    /// Pop one work request, assign it a fresh SSN, and emit its packets.
    pub(crate) fn process_one(&mut self) -> Result<(), ProcessError> {
        if self.dgid.is_none() || self.dst_qpn.is_none() {
            return Err(ProcessError::NoDestination);
        }
        let Some(wr) = self.queue.pop_front() else {
            return Err(ProcessError::EmptyQueue);
        };
        let cssn = self.ssn;
        self.pending.insert(cssn, wr.clone());
        self.ssn = psn::mask(self.ssn + 1);

        match wr.opcode {
            op if op.is_send() => self.process_send_req(&wr, cssn)?,
            op if op.is_write() => self.process_write_req(&wr, cssn)?,
            WrOpcode::Read => self.process_read_req(&wr, cssn)?,
            _ => self.process_atomic_req(&wr, cssn)?,
        }
        Ok(())
    }

    fn read_local(&self, wr: &SendWr) -> Result<Vec<u8>, ProcessError> {
        if wr.sge.len == 0 {
            return Ok(Vec::new());
        }
        let mr = self
            .pd
            .mr(wr.sge.lkey)
            .ok_or(AccessError::InvalidKey(wr.sge.lkey))?;
        let data = mr
            .read(wr.sge.addr, wr.sge.len)
            .map_err(AccessError::from)?;
        Ok(data)
    }

    fn process_send_req(&mut self, wr: &SendWr, cssn: Ssn) -> Result<(), ProcessError> {
        let data = self.read_local(wr)?;
        let n = num_pkts(data.len(), self.pmtu);
        let cpsn = self.sq_psn;
        let dqpn = self.dqpn()?;
        let pmtu = self.pmtu.bytes();
        let ackreq = wr.flags.contains(SendFlags::SIGNALED);
        let solicited = wr.flags.contains(SendFlags::SOLICITED);

        if n > 1 {
            let bth = Bth::new(Opcode::SendFirst, dqpn, cpsn);
            self.send_pkt(cssn, Packet::new(bth, ExtHdr::None, data[..pmtu].to_vec()), true)?;
            for i in 0..n - 2 {
                let at = (i as usize + 1) * pmtu;
                let bth = Bth::new(Opcode::SendMiddle, dqpn, psn::advance(cpsn, i + 1));
                self.send_pkt(cssn, Packet::new(bth, ExtHdr::None, data[at..at + pmtu].to_vec()), true)?;
            }
        }

        let op = match (n == 1, wr.opcode) {
            (true, WrOpcode::SendWithImm) => Opcode::SendOnlyWithImmediate,
            (true, WrOpcode::SendWithInv) => Opcode::SendOnlyWithInvalidate,
            (true, _) => Opcode::SendOnly,
            (false, WrOpcode::SendWithImm) => Opcode::SendLastWithImmediate,
            (false, WrOpcode::SendWithInv) => Opcode::SendLastWithInvalidate,
            (false, _) => Opcode::SendLast,
        };
        let mut bth = Bth::new(op, dqpn, psn::advance(cpsn, n - 1));
        bth.ackreq = ackreq;
        bth.solicited = solicited;
        let ext = if op.has_imm() {
            ExtHdr::ImmDt(ImmDt {
                data: wr.imm_data_or_inv_rkey.unwrap_or_default(),
            })
        } else if op.has_inv() {
            ExtHdr::Ieth(Ieth {
                rkey: wr.imm_data_or_inv_rkey.unwrap_or_default(),
            })
        } else {
            ExtHdr::None
        };
        let payload = data[(n as usize - 1) * pmtu..].to_vec();
        self.send_pkt(cssn, Packet::new(bth, ext, payload), true)?;
        self.sq_psn = psn::advance(self.sq_psn, n);
        Ok(())
    }

    fn process_write_req(&mut self, wr: &SendWr, cssn: Ssn) -> Result<(), ProcessError> {
        let data = self.read_local(wr)?;
        let dlen = data.len() as u32;
        let n = num_pkts(data.len(), self.pmtu);
        let cpsn = self.sq_psn;
        let dqpn = self.dqpn()?;
        let pmtu = self.pmtu.bytes();
        let ackreq = wr.flags.contains(SendFlags::SIGNALED);

        let reth = Reth {
            va: wr.raddr,
            rkey: wr.rkey,
            dlen,
        };
        if n > 1 {
            let bth = Bth::new(Opcode::RdmaWriteFirst, dqpn, cpsn);
            self.send_pkt(
                cssn,
                Packet::new(bth, ExtHdr::Reth(reth), data[..pmtu].to_vec()),
                true,
            )?;
            for i in 0..n - 2 {
                let at = (i as usize + 1) * pmtu;
                let bth = Bth::new(Opcode::RdmaWriteMiddle, dqpn, psn::advance(cpsn, i + 1));
                self.send_pkt(cssn, Packet::new(bth, ExtHdr::None, data[at..at + pmtu].to_vec()), true)?;
            }
        }

        let with_imm = wr.opcode == WrOpcode::WriteWithImm;
        let op = match (n == 1, with_imm) {
            (true, true) => Opcode::RdmaWriteOnlyWithImmediate,
            (true, false) => Opcode::RdmaWriteOnly,
            (false, true) => Opcode::RdmaWriteLastWithImmediate,
            (false, false) => Opcode::RdmaWriteLast,
        };
        let mut bth = Bth::new(op, dqpn, psn::advance(cpsn, n - 1));
        bth.ackreq = ackreq;
        bth.solicited = with_imm && wr.flags.contains(SendFlags::SOLICITED);
        // The write-with-immediate terminal carries the combined RETH and
        // immediate even in the last position; a bare terminal carries the
        // RETH only when it is the whole message.
        let ext = if with_imm {
            ExtHdr::RethImmDt(RethImmDt {
                va: wr.raddr,
                rkey: wr.rkey,
                dlen,
                data: wr.imm_data_or_inv_rkey.unwrap_or_default(),
            })
        } else if n == 1 {
            ExtHdr::Reth(reth)
        } else {
            ExtHdr::None
        };
        let payload = data[(n as usize - 1) * pmtu..].to_vec();
        self.send_pkt(cssn, Packet::new(bth, ext, payload), true)?;
        self.sq_psn = psn::advance(self.sq_psn, n);
        Ok(())
    }

    fn process_read_req(&mut self, wr: &SendWr, cssn: Ssn) -> Result<(), ProcessError> {
        if !self.access_flags.contains(Permission::LOCAL_WRITE) {
            warn!("SQ={}: read posted without local write permission", self.qpn);
            self.pending.remove(&cssn);
            self.push_cqe(wr.wr_id, WcOpcode::RdmaRead, WcStatus::LocProtErr, 0);
            return Ok(());
        }

        let dlen = wr.sge.len as u32;
        let n = num_pkts(wr.sge.len, self.pmtu);
        let dqpn = self.dqpn()?;
        let mut bth = Bth::new(Opcode::RdmaReadRequest, dqpn, self.sq_psn);
        bth.ackreq = true;
        let reth = Reth {
            va: wr.raddr,
            rkey: wr.rkey,
            dlen,
        };
        self.send_pkt(cssn, Packet::new(bth, ExtHdr::Reth(reth), Vec::new()), true)?;
        // Reserve one PSN per expected response packet.
        self.sq_psn = psn::advance(self.sq_psn, n);
        Ok(())
    }

    fn process_atomic_req(&mut self, wr: &SendWr, cssn: Ssn) -> Result<(), ProcessError> {
        if !self.access_flags.contains(Permission::LOCAL_WRITE) {
            warn!("SQ={}: atomic posted without local write permission", self.qpn);
            self.pending.remove(&cssn);
            self.push_cqe(wr.wr_id, WcOpcode::from_wr(wr.opcode), WcStatus::LocProtErr, 0);
            return Ok(());
        }

        let op = if wr.opcode == WrOpcode::CompSwap {
            Opcode::CompareSwap
        } else {
            Opcode::FetchAdd
        };
        let dqpn = self.dqpn()?;
        let mut bth = Bth::new(op, dqpn, self.sq_psn);
        bth.ackreq = true;
        let eth = AtomicEth {
            va: wr.raddr,
            rkey: wr.rkey,
            comp: wr.compare_add,
            swap: wr.swap,
        };
        self.send_pkt(cssn, Packet::new(bth, ExtHdr::AtomicEth(eth), Vec::new()), true)?;
        self.sq_psn = psn::advance(self.sq_psn, 1);
        Ok(())
    }

    fn send_pkt(&mut self, ssn: Ssn, pkt: Packet, save: bool) -> io::Result<()> {
        let dgid = self
            .dgid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "QP has no destination GID"))?;
        if save {
            self.req_pkts.insert(
                pkt.bth.psn,
                Retained {
                    pkt: pkt.clone(),
                    ssn,
                },
            );
        }
        self.tx.send_to(dgid, &pkt)
    }

    /// Classify a response PSN: expected iff it lies in
    /// `[min_unacked_psn, sq_psn)` under the PSN ordering.
    pub(crate) fn is_expected_resp(&self, resp_psn: Psn) -> bool {
        if self.min_unacked_psn == self.sq_psn {
            // Nothing outstanding.
            return false;
        }
        psn::compare(self.min_unacked_psn, resp_psn, self.sq_psn) != Ordering::Greater
            && psn::compare(self.sq_psn, resp_psn, self.sq_psn) == Ordering::Greater
    }

    /// Drop a ghost, duplicate, or illegal response, recognizing the
    /// unsolicited flow-control credit carried by a duplicate ACK right
    /// below the window.
    pub(crate) fn handle_dup_or_illegal_resp(&mut self, resp: &Packet) {
        if self.min_unacked_psn == self.sq_psn {
            debug!("SQ={}: ghost response at PSN {}", self.qpn, resp.psn());
            return;
        }
        if psn::compare(resp.psn(), self.min_unacked_psn, self.sq_psn) == Ordering::Less {
            if psn::next(resp.psn()) == self.min_unacked_psn {
                if let Some(aeth) = resp.aeth() {
                    if aeth.code == AethCode::Ack {
                        debug!(
                            "SQ={}: unsolicited flow control credit={}",
                            self.qpn, aeth.value
                        );
                        return;
                    }
                }
            }
            debug!("SQ={}: duplicate response at PSN {}", self.qpn, resp.psn());
        } else {
            debug!("SQ={}: illegal response at PSN {}", self.qpn, resp.psn());
        }
    }

    /// Handle an expected response.
    pub(crate) fn handle_normal_resp(&mut self, resp: &Packet) -> io::Result<()> {
        let (complete, stop) = self.coalesce_ack(resp.psn());
        self.min_unacked_psn = stop;
        if !complete {
            // A read or atomic request below the acknowledged PSN was never
            // answered: implicit NAK.
            debug!(
                "SQ={}: implicitly NAK'ed packets, retrying from PSN {stop}",
                self.qpn
            );
            self.retry_from(stop)?;
            self.gc_acked();
            return Ok(());
        }

        let advance = match resp.opcode() {
            op if op.is_read_resp() => self.handle_read_resp(resp)?,
            Opcode::AtomicAcknowledge => self.handle_atomic_ack(resp)?,
            Opcode::Acknowledge => self.handle_ack(resp)?,
            op => {
                warn!("SQ={}: unsupported response opcode {op:?}", self.qpn);
                false
            }
        };
        if advance {
            self.min_unacked_psn = psn::next(resp.psn());
            self.rnr_counter = None;
        }
        self.gc_acked();
        trace!(
            "SQ={}: min unacked PSN={}, next PSN={}",
            self.qpn,
            self.min_unacked_psn,
            self.sq_psn
        );
        Ok(())
    }

    /// Complete the send/write packet retained at `psn` if it terminates a
    /// message.
    fn ack_send_or_write(&mut self, psn: Psn) -> AckOutcome {
        let Some(retained) = self.req_pkts.get(&psn) else {
            return AckOutcome::Skipped;
        };
        let op = retained.pkt.opcode();
        if op == Opcode::RdmaReadRequest || op.is_atomic() {
            return AckOutcome::Stopped;
        }
        if op.is_last_req() || op.is_only_req() {
            let ssn = retained.ssn;
            if let Some(wr) = self.pending.remove(&ssn) {
                self.push_cqe(
                    wr.wr_id,
                    WcOpcode::from_wr(wr.opcode),
                    WcStatus::Success,
                    wr.sge.len,
                );
            }
        }
        AckOutcome::Acked
    }

    /// Acknowledge every send/write in `[min_unacked_psn, upper)`. Return
    /// `(false, psn)` when a read or atomic request at `psn` interrupts the
    /// range.
    fn coalesce_ack(&mut self, upper: Psn) -> (bool, Psn) {
        for p in psn::range(self.min_unacked_psn, upper) {
            if let AckOutcome::Stopped = self.ack_send_or_write(p) {
                return (false, p);
            }
        }
        (true, upper)
    }

    /// Re-emit every retained packet with PSN in `[start, sq_psn)`. Gaps are
    /// PSNs reserved for read responses and carry nothing to resend.
    fn retry_from(&mut self, start: Psn) -> io::Result<()> {
        let to_retry: Vec<(Packet, Ssn)> = psn::range(start, self.sq_psn)
            .filter_map(|p| self.req_pkts.get(&p).map(|r| (r.pkt.clone(), r.ssn)))
            .collect();
        for (pkt, ssn) in to_retry {
            self.send_pkt(ssn, pkt, false)?;
        }
        Ok(())
    }

    fn handle_ack(&mut self, resp: &Packet) -> io::Result<bool> {
        let Some(aeth) = resp.aeth().copied() else {
            warn!("SQ={}: ACKNOWLEDGE without AETH", self.qpn);
            return Ok(false);
        };
        match aeth.code {
            AethCode::Ack => {
                if let AckOutcome::Stopped = self.ack_send_or_write(resp.psn()) {
                    warn!(
                        "SQ={}: ACK names a read or atomic request at PSN {}",
                        self.qpn,
                        resp.psn()
                    );
                }
                Ok(true)
            }
            AethCode::Nak => match aeth.value {
                NAK_PSN_SEQ_ERR => {
                    self.retry_nak_seq(resp.psn())?;
                    Ok(false)
                }
                NAK_INVALID_REQUEST | NAK_REMOTE_ACCESS | NAK_REMOTE_OP => {
                    self.fail_and_flush(resp.psn(), WcStatus::from_nak(aeth.value));
                    Ok(false)
                }
                value => {
                    debug!("SQ={}: unsupported NAK value {value}", self.qpn);
                    Ok(false)
                }
            },
            AethCode::Rnr => {
                self.retry_rnr(resp.psn())?;
                Ok(false)
            }
            AethCode::Rsvd => {
                debug!("SQ={}: reserved AETH code", self.qpn);
                Ok(false)
            }
        }
    }

    /// Retransmit the packet an RNR NAK names, up to `rnr_retry` consecutive
    /// times for the same PSN.
    fn retry_rnr(&mut self, nak_psn: Psn) -> io::Result<()> {
        let count = match self.rnr_counter {
            Some((p, c)) if p == nak_psn => c.saturating_add(1),
            _ => 1,
        };
        if count > self.rnr_retry {
            warn!(
                "SQ={}: RNR retries for PSN {nak_psn} exhausted ({})",
                self.qpn, self.rnr_retry
            );
            self.rnr_counter = None;
            self.fail_and_flush(nak_psn, WcStatus::RnrRetryExcErr);
            return Ok(());
        }
        self.rnr_counter = Some((nak_psn, count));

        let Some(retained) = self.req_pkts.get(&nak_psn) else {
            warn!("SQ={}: RNR NAK names unknown PSN {nak_psn}", self.qpn);
            return Ok(());
        };
        let (pkt, ssn) = (retained.pkt.clone(), retained.ssn);
        debug!(
            "SQ={}: RNR NAK at PSN {nak_psn}, retry {count}/{}",
            self.qpn, self.rnr_retry
        );
        self.send_pkt(ssn, pkt, false)
    }

    /// Retry everything from the PSN a sequence-error NAK names. When the
    /// PSN falls inside a multi-packet read response, first rebuild a
    /// narrowed read request covering the bytes not yet received.
    fn retry_nak_seq(&mut self, nak_psn: Psn) -> io::Result<()> {
        let mut from = nak_psn;
        if !self.req_pkts.contains_key(&nak_psn) {
            let Some(ctx) = &self.read_resp_ctx else {
                warn!(
                    "SQ={}: sequence-error NAK at unknown PSN {nak_psn} with no read in flight",
                    self.qpn
                );
                return Ok(());
            };
            let Some(wr) = self.pending.get(&ctx.ssn) else {
                warn!("SQ={}: read response context names no pending WR", self.qpn);
                return Ok(());
            };
            let remaining = ctx.dlen - ctx.offset;
            let reth = Reth {
                va: wr.raddr + ctx.offset as u64,
                rkey: wr.rkey,
                dlen: remaining,
            };
            let ssn = ctx.ssn;
            debug!(
                "SQ={}: rebuilding read request at PSN {nak_psn} (original PSN {}) for the \
                 remaining {remaining} bytes",
                self.qpn, ctx.orig_psn
            );
            let mut bth = Bth::new(Opcode::RdmaReadRequest, self.dqpn()?, nak_psn);
            bth.ackreq = true;
            self.send_pkt(ssn, Packet::new(bth, ExtHdr::Reth(reth), Vec::new()), true)?;
            from = psn::advance(nak_psn, num_pkts(remaining as usize, self.pmtu));
        }
        self.retry_from(from)
    }

    /// Enter the error state: complete the work request the NAK names with
    /// `status`, then flush everything else in posting order.
    fn fail_and_flush(&mut self, nak_psn: Psn, status: WcStatus) {
        self.state = QpState::Err;
        let _ = self.coalesce_ack(nak_psn);

        let named_ssn = self
            .req_pkts
            .get(&nak_psn)
            .map(|r| r.ssn)
            .or_else(|| self.read_resp_ctx.as_ref().map(|c| c.ssn));
        match named_ssn.and_then(|ssn| self.pending.remove(&ssn)) {
            Some(wr) => {
                self.push_cqe(wr.wr_id, WcOpcode::from_wr(wr.opcode), status, wr.sge.len);
            }
            None => warn!(
                "SQ={}: fatal NAK at PSN {nak_psn} names no pending WR",
                self.qpn
            ),
        }

        // Pending WRs complete as flushed in SSN order, then anything not
        // yet processed in posting order.
        let pending = std::mem::take(&mut self.pending);
        for (_, wr) in pending {
            self.push_cqe(wr.wr_id, WcOpcode::from_wr(wr.opcode), WcStatus::WrFlushErr, wr.sge.len);
        }
        let queued: Vec<SendWr> = self.queue.drain(..).collect();
        for wr in queued {
            self.push_cqe(wr.wr_id, WcOpcode::from_wr(wr.opcode), WcStatus::WrFlushErr, wr.sge.len);
        }

        self.req_pkts.clear();
        self.read_resp_ctx = None;
        self.rnr_counter = None;
    }

    fn handle_read_resp(&mut self, resp: &Packet) -> io::Result<bool> {
        let op = resp.opcode();
        if !resp_size_ok(self.pmtu, op, resp.payload.len()) {
            warn!(
                "SQ={}: read response at PSN {} has illegal payload size {}",
                self.qpn,
                resp.psn(),
                resp.payload.len()
            );
            return Ok(false);
        }

        if matches!(op, Opcode::RdmaReadResponseFirst | Opcode::RdmaReadResponseOnly) {
            let Some(retained) = self.req_pkts.get(&resp.psn()) else {
                warn!(
                    "SQ={}: read response at PSN {} matches no outstanding request",
                    self.qpn,
                    resp.psn()
                );
                return Ok(false);
            };
            let ssn = retained.ssn;
            let Some((_, _, dlen)) = retained.pkt.reth() else {
                warn!("SQ={}: retained packet at PSN {} is not a read", self.qpn, resp.psn());
                return Ok(false);
            };

            if self.read_resp_ctx.is_some() {
                debug!(
                    "SQ={}: read request was retried, responses resume at PSN {}",
                    self.qpn,
                    resp.psn()
                );
            } else if dlen == 0 {
                if let Some(wr) = self.pending.remove(&ssn) {
                    self.push_cqe(wr.wr_id, WcOpcode::RdmaRead, WcStatus::Success, 0);
                }
                return Ok(true);
            } else {
                let Some(wr) = self.pending.get(&ssn).cloned() else {
                    warn!("SQ={}: read response names no pending WR", self.qpn);
                    return Ok(false);
                };
                let validated = if self.access_flags.contains(Permission::LOCAL_WRITE) {
                    self.pd.validate_mr(op, wr.sge.lkey, wr.sge.addr, dlen as usize)
                } else {
                    Err(AccessError::NotPermitted(op))
                };
                match validated {
                    Ok(mr) => {
                        self.read_resp_ctx = Some(ReadRespCtx {
                            mr,
                            dlen,
                            laddr: wr.sge.addr,
                            offset: 0,
                            ssn,
                            orig_psn: resp.psn(),
                        });
                    }
                    Err(err) => {
                        warn!("SQ={}: read response landing failed: {err}", self.qpn);
                        self.pending.remove(&ssn);
                        self.push_cqe(wr.wr_id, WcOpcode::RdmaRead, local_status(&err), 0);
                        return Ok(false);
                    }
                }
            }
        }

        // Append the payload to the read buffer.
        let failed = {
            let Some(ctx) = self.read_resp_ctx.as_mut() else {
                warn!("SQ={}: read response without an active read", self.qpn);
                return Ok(false);
            };
            if resp.payload.is_empty() {
                None
            } else if ctx.offset as usize + resp.payload.len() > ctx.dlen as usize {
                Some(WcStatus::LocLenErr)
            } else {
                let addr = ctx.laddr + ctx.offset as u64;
                match ctx.mr.write(addr, &resp.payload) {
                    Ok(()) => {
                        ctx.offset += resp.payload.len() as u32;
                        None
                    }
                    Err(_) => Some(WcStatus::LocProtErr),
                }
            }
        };
        if let Some(status) = failed {
            if let Some(ctx) = self.read_resp_ctx.take() {
                if let Some(wr) = self.pending.remove(&ctx.ssn) {
                    self.push_cqe(wr.wr_id, WcOpcode::RdmaRead, status, ctx.offset as usize);
                }
            }
            return Ok(false);
        }

        if matches!(op, Opcode::RdmaReadResponseLast | Opcode::RdmaReadResponseOnly) {
            let Some(ctx) = self.read_resp_ctx.take() else {
                return Ok(false);
            };
            if ctx.offset != ctx.dlen {
                warn!(
                    "SQ={}: read response assembled {} bytes, request asked for {}",
                    self.qpn, ctx.offset, ctx.dlen
                );
                if let Some(wr) = self.pending.remove(&ctx.ssn) {
                    self.push_cqe(wr.wr_id, WcOpcode::RdmaRead, WcStatus::LocLenErr, ctx.offset as usize);
                }
                return Ok(false);
            }
            if let Some(wr) = self.pending.remove(&ctx.ssn) {
                self.push_cqe(wr.wr_id, WcOpcode::RdmaRead, WcStatus::Success, ctx.dlen as usize);
            }
        }
        Ok(true)
    }

    fn handle_atomic_ack(&mut self, resp: &Packet) -> io::Result<bool> {
        let Some(aeth) = resp.aeth().copied() else {
            warn!("SQ={}: atomic acknowledge without AETH", self.qpn);
            return Ok(false);
        };
        match aeth.code {
            AethCode::Ack => {}
            AethCode::Nak
                if matches!(
                    aeth.value,
                    NAK_INVALID_REQUEST | NAK_REMOTE_ACCESS | NAK_REMOTE_OP
                ) =>
            {
                self.fail_and_flush(resp.psn(), WcStatus::from_nak(aeth.value));
                return Ok(false);
            }
            _ => {
                debug!("SQ={}: unsupported AETH on atomic acknowledge", self.qpn);
                return Ok(false);
            }
        }

        let Some(orig) = resp.atomic_ack().map(|a| a.orig) else {
            warn!("SQ={}: atomic acknowledge without AtomicAckETH", self.qpn);
            return Ok(false);
        };
        let Some(ssn) = self.req_pkts.get(&resp.psn()).map(|r| r.ssn) else {
            warn!(
                "SQ={}: atomic acknowledge at PSN {} matches no request",
                self.qpn,
                resp.psn()
            );
            return Ok(false);
        };
        let Some(wr) = self.pending.get(&ssn).cloned() else {
            warn!("SQ={}: atomic acknowledge names no pending WR", self.qpn);
            return Ok(false);
        };

        let validated = if self.access_flags.contains(Permission::LOCAL_WRITE) {
            self.pd
                .validate_mr(Opcode::AtomicAcknowledge, wr.sge.lkey, wr.sge.addr, ATOMIC_BYTE_SIZE)
        } else {
            Err(AccessError::NotPermitted(Opcode::AtomicAcknowledge))
        };
        let mr = match validated {
            Ok(mr) => mr,
            Err(err) => {
                warn!("SQ={}: atomic acknowledge landing failed: {err}", self.qpn);
                self.pending.remove(&ssn);
                self.push_cqe(wr.wr_id, WcOpcode::from_wr(wr.opcode), local_status(&err), 0);
                return Ok(false);
            }
        };
        if mr.write(wr.sge.addr, &orig.to_ne_bytes()).is_err() {
            self.pending.remove(&ssn);
            self.push_cqe(wr.wr_id, WcOpcode::from_wr(wr.opcode), WcStatus::LocProtErr, 0);
            return Ok(false);
        }

        self.pending.remove(&ssn);
        self.push_cqe(
            wr.wr_id,
            WcOpcode::from_wr(wr.opcode),
            WcStatus::Success,
            ATOMIC_BYTE_SIZE,
        );
        Ok(true)
    }

    /// Drop retained packets below the unacknowledged window.
    fn gc_acked(&mut self) {
        let (min, cur) = (self.min_unacked_psn, self.sq_psn);
        self.req_pkts
            .retain(|&p, _| psn::compare(p, min, cur) != Ordering::Less);
    }

    fn push_cqe(&self, wr_id: WrId, opcode: WcOpcode, status: WcStatus, len: usize) {
        self.cq.push(Cqe {
            wr_id,
            status,
            opcode,
            byte_len: len,
            qpn: self.qpn,
            src_qp: self.dst_qpn.unwrap_or(0),
            flags: WcFlags::EMPTY,
            imm_data_or_inv_rkey: None,
        });
    }
}
