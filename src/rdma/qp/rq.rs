//! Receive queue: the responder half of the reliable-connected pipeline.
//!
//! Tracks the expected PSN, enforces packet-size and opcode-pair legality,
//! assembles multi-packet sends and writes into registered memory, executes
//! atomics, emits read responses, and answers duplicates from a response
//! cache. Protocol violations are answered with a NAK instead of being
//! raised; the requester turns them into completion statuses.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::io;

use log::{debug, trace, warn};

use super::attr::{QpAttr, QpState};
use super::{num_pkts, ATOMIC_BYTE_SIZE};
use crate::rdma::cq::{Cq, Cqe, WcFlags, WcOpcode, WcStatus};
use crate::rdma::gid::Gid;
use crate::rdma::mr::{Mr, Permission};
use crate::rdma::pd::Pd;
use crate::rdma::types::*;
use crate::rdma::wr::RecvWr;
use crate::roce::Transport;
use crate::wire::*;

/// A response retained for duplicate-request replay, keyed by its PSN.
/// Atomic responses also retain the request operands so a duplicate can be
/// matched before it is replayed.
struct CachedResp {
    pkt: Packet,
    atomic_args: Option<AtomicEth>,
}

/// Assembly state of an in-flight multi-packet send message.
struct SendAsm {
    wr: RecvWr,
    offset: usize,
}

/// Assembly state of an in-flight multi-packet write message. `mr` is absent
/// only for zero-length writes.
struct WriteAsm {
    mr: Option<Mr>,
    dlen: u32,
    addr: u64,
    offset: u32,
}

pub(crate) struct Rq {
    qpn: Qpn,
    pub(crate) state: QpState,
    pd: Pd,
    cq: Cq,
    tx: Transport,

    pmtu: Pmtu,
    rq_psn: Psn,
    msn: Msn,

    dgid: Option<Gid>,
    dst_qpn: Option<Qpn>,
    access_flags: Permission,
    #[allow(dead_code)]
    pkey: u16,
    min_rnr_timer: u8,

    queue: VecDeque<RecvWr>,
    /// Responses retained for duplicate replay, keyed by PSN.
    resp_pkts: HashMap<Psn, CachedResp>,
    /// Opcode of the previous packet on this connection.
    pub(crate) prev_op: Option<Opcode>,

    send_ctx: Option<SendAsm>,
    write_ctx: Option<WriteAsm>,
}

impl Rq {
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
            rq_psn: 0,
            msn: 0,
            dgid: None,
            dst_qpn: None,
            access_flags,
            pkey: PKEY_DEFAULT,
            min_rnr_timer: 10,
            queue: VecDeque::new(),
            resp_pkts: HashMap::new(),
            prev_op: None,
            send_ctx: None,
            write_ctx: None,
        }
    }

    pub(crate) fn modify(&mut self, attr: &QpAttr) {
        if let Some(qps) = attr.qps {
            self.state = qps;
        }
        if let Some(pmtu) = attr.pmtu {
            self.pmtu = pmtu;
        }
        if let Some(rq_psn) = attr.rq_psn {
            self.rq_psn = psn::mask(rq_psn);
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
        if let Some(v) = attr.min_rnr_timer {
            self.min_rnr_timer = v;
        }
    }

    pub(crate) fn post_recv(&mut self, wr: RecvWr) {
        self.queue.push_back(wr);
    }

    #[inline]
    pub(crate) fn rq_psn(&self) -> Psn {
        self.rq_psn
    }

    fn dqpn(&self) -> io::Result<Qpn> {
        self.dst_qpn
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "QP has no destination QPN"))
    }

    /// Check an inbound request's payload length against its position in the
    /// message.
    fn req_size_ok(&self, req: &Packet) -> bool {
        let op = req.opcode();
        let len = req.payload.len();
        if op.is_first_req() || op.is_mid_req() {
            len == self.pmtu.bytes()
        } else if op.is_last_req() {
            len >= 1 && len <= self.pmtu.bytes()
        } else if op.is_only_req() {
            len <= self.pmtu.bytes()
        } else {
            true
        }
    }

    /// NAK an invalid request (responder class C).
    pub(crate) fn nak_invalid(&mut self, req_psn: Psn) -> io::Result<()> {
        self.send_nak(NAK_INVALID_REQUEST, req_psn)
    }

    /// Handle an inbound request packet.
    pub(crate) fn recv_req(&mut self, req: &Packet) -> io::Result<()> {
        let op = req.opcode();
        if self.state == QpState::Init {
            warn!("RQ={}: request received before RTR", self.qpn);
            return Ok(());
        }
        if !self.req_size_ok(req) {
            warn!(
                "RQ={}: request at PSN {} has illegal payload size {}",
                self.qpn,
                req.psn(),
                req.payload.len()
            );
            return self.send_nak(NAK_INVALID_REQUEST, req.psn());
        }
        if !self.access_flags.contains(Permission::required_for(op)) {
            warn!(
                "RQ={}: operation {op:?} not permitted by QP access flags",
                self.qpn
            );
            return self.send_nak(NAK_INVALID_REQUEST, req.psn());
        }

        if req.psn() == self.rq_psn {
            if op.is_send() {
                self.handle_send_req(req)
            } else if op.is_write() {
                self.handle_write_req(req)
            } else if op == Opcode::RdmaReadRequest {
                self.handle_read_req(req, true)
            } else {
                self.handle_atomic_req(req)
            }
        } else {
            self.handle_dup_or_illegal_req(req)
        }
    }

    fn handle_send_req(&mut self, req: &Packet) -> io::Result<()> {
        let op = req.opcode();
        if op.is_first_req() || op.is_only_req() {
            let Some(wr) = self.queue.pop_front() else {
                debug!("RQ={}: no receive WR posted, RNR NAK", self.qpn);
                return self.send_rnr_nak(req.psn());
            };
            self.send_ctx = Some(SendAsm { wr, offset: 0 });
        }
        let Some(asm) = self.send_ctx.as_ref() else {
            warn!("RQ={}: send continuation without assembly context", self.qpn);
            return Ok(());
        };
        let (sge, wr_id, mut offset) = (asm.wr.sge, asm.wr.wr_id, asm.offset);

        if !req.payload.is_empty() {
            let addr = sge.addr + offset as u64;
            match self.pd.validate_mr(op, sge.lkey, addr, req.payload.len()) {
                Ok(mr) => {
                    if let Err(err) = mr.write(addr, &req.payload) {
                        warn!("RQ={}: send landing failed: {err}", self.qpn);
                        self.send_ctx = None;
                        return self.send_nak(NAK_INVALID_REQUEST, req.psn());
                    }
                }
                Err(err) => {
                    // Receive buffer cannot hold the message.
                    warn!("RQ={}: insufficient receive buffering: {err}", self.qpn);
                    self.send_ctx = None;
                    return self.send_nak(NAK_INVALID_REQUEST, req.psn());
                }
            }
            offset += req.payload.len();
        }

        if op.is_last_req() || op.is_only_req() {
            self.msn = psn::mask(self.msn + 1);
            self.send_ctx = None;

            let mut flags = WcFlags::EMPTY;
            let mut imm_or_inv = None;
            if op.has_imm() {
                flags |= WcFlags::WITH_IMM;
                imm_or_inv = req.imm();
            } else if op.has_inv() {
                flags |= WcFlags::WITH_INV;
                imm_or_inv = req.inv_rkey();
            }
            self.cq.push(Cqe {
                wr_id,
                status: WcStatus::Success,
                opcode: WcOpcode::Recv,
                byte_len: offset,
                qpn: self.qpn,
                src_qp: self.dst_qpn.unwrap_or(0),
                flags,
                imm_data_or_inv_rkey: imm_or_inv,
            });
        } else if let Some(asm) = self.send_ctx.as_mut() {
            asm.offset = offset;
        }

        self.rq_psn = psn::next(self.rq_psn);
        if req.bth.ackreq {
            self.send_ack(req.psn())?;
        }
        Ok(())
    }

    fn handle_write_req(&mut self, req: &Packet) -> io::Result<()> {
        let op = req.opcode();

        // A terminal with immediate data consumes a receive WR; refuse the
        // packet up front if none is posted so the requester can retry it.
        if op.has_imm() && self.queue.is_empty() {
            debug!("RQ={}: no receive WR for write with immediate, RNR NAK", self.qpn);
            return self.send_rnr_nak(req.psn());
        }

        if op.is_first_req() || op.is_only_req() {
            let Some((va, rkey, dlen)) = req.reth() else {
                warn!("RQ={}: write first/only without RETH", self.qpn);
                return self.send_nak(NAK_INVALID_REQUEST, req.psn());
            };
            if dlen > 0 {
                match self.pd.validate_mr(op, rkey, va, dlen as usize) {
                    Ok(mr) => {
                        self.write_ctx = Some(WriteAsm {
                            mr: Some(mr),
                            dlen,
                            addr: va,
                            offset: 0,
                        });
                    }
                    Err(err) => {
                        warn!("RQ={}: write request refused: {err}", self.qpn);
                        return self.send_nak(NAK_REMOTE_ACCESS, req.psn());
                    }
                }
            } else {
                if !(req.payload.is_empty() && op.is_only_req()) {
                    warn!("RQ={}: zero-length write carrying data", self.qpn);
                    return self.send_nak(NAK_INVALID_REQUEST, req.psn());
                }
                self.write_ctx = Some(WriteAsm {
                    mr: None,
                    dlen: 0,
                    addr: va,
                    offset: 0,
                });
            }
        }

        let Some(asm) = self.write_ctx.as_ref() else {
            warn!("RQ={}: write continuation without assembly context", self.qpn);
            return Ok(());
        };
        let (dlen, addr, mut offset) = (asm.dlen, asm.addr, asm.offset);

        if !req.payload.is_empty() {
            if offset as usize + req.payload.len() > dlen as usize {
                warn!("RQ={}: write data exceeds its DMA length", self.qpn);
                self.write_ctx = None;
                return self.send_nak(NAK_INVALID_REQUEST, req.psn());
            }
            let write_result = asm
                .mr
                .as_ref()
                .map(|mr| mr.write(addr + offset as u64, &req.payload));
            match write_result {
                Some(Ok(())) => offset += req.payload.len() as u32,
                Some(Err(err)) => {
                    warn!("RQ={}: write landing failed: {err}", self.qpn);
                    self.write_ctx = None;
                    return self.send_nak(NAK_REMOTE_ACCESS, req.psn());
                }
                None => {
                    warn!("RQ={}: zero-length write carrying data", self.qpn);
                    self.write_ctx = None;
                    return self.send_nak(NAK_INVALID_REQUEST, req.psn());
                }
            }
        }

        if op.is_last_req() || op.is_only_req() {
            if offset != dlen {
                warn!(
                    "RQ={}: write assembled {offset} bytes, RETH announced {dlen}",
                    self.qpn
                );
                self.write_ctx = None;
                return self.send_nak(NAK_INVALID_REQUEST, req.psn());
            }
            self.msn = psn::mask(self.msn + 1);
            self.write_ctx = None;

            if op.has_imm() {
                // Checked non-empty above.
                if let Some(wr) = self.queue.pop_front() {
                    self.cq.push(Cqe {
                        wr_id: wr.wr_id,
                        status: WcStatus::Success,
                        opcode: WcOpcode::RecvRdmaImm,
                        byte_len: dlen as usize,
                        qpn: self.qpn,
                        src_qp: self.dst_qpn.unwrap_or(0),
                        flags: WcFlags::WITH_IMM,
                        imm_data_or_inv_rkey: req.imm(),
                    });
                }
            }
        } else if let Some(asm) = self.write_ctx.as_mut() {
            asm.offset = offset;
        }

        self.rq_psn = psn::next(self.rq_psn);
        if req.bth.ackreq {
            self.send_ack(req.psn())?;
        }
        Ok(())
    }

    /// Execute a read request, emitting its response packets. Duplicate
    /// requests re-execute with `update_epsn == false`: the response stream
    /// is regenerated at the PSN the duplicate carries and neither the
    /// expected PSN nor the MSN moves.
    fn handle_read_req(&mut self, req: &Packet, update_epsn: bool) -> io::Result<()> {
        let Some((va, rkey, dlen)) = req.reth() else {
            warn!("RQ={}: read request without RETH", self.qpn);
            return self.send_nak(NAK_INVALID_REQUEST, req.psn());
        };

        let data = if dlen > 0 {
            match self
                .pd
                .validate_mr(Opcode::RdmaReadRequest, rkey, va, dlen as usize)
                .and_then(|mr| mr.read(va, dlen as usize).map_err(Into::into))
            {
                Ok(data) => data,
                Err(err) => {
                    warn!("RQ={}: read request refused: {err}", self.qpn);
                    return self.send_nak(NAK_REMOTE_ACCESS, req.psn());
                }
            }
        } else {
            Vec::new()
        };

        let cpsn = req.psn();
        let dqpn = self.dqpn()?;
        let pmtu = self.pmtu.bytes();
        if update_epsn {
            self.msn = psn::mask(self.msn + 1);
        }
        let n = num_pkts(data.len(), self.pmtu);
        let aeth = Aeth::ack(self.msn);

        if n > 1 {
            let bth = Bth::new(Opcode::RdmaReadResponseFirst, dqpn, cpsn);
            self.send_resp(
                Packet::new(bth, ExtHdr::Aeth(aeth), data[..pmtu].to_vec()),
                false,
                None,
            )?;
            for i in 0..n - 2 {
                let at = (i as usize + 1) * pmtu;
                let bth = Bth::new(Opcode::RdmaReadResponseMiddle, dqpn, psn::advance(cpsn, i + 1));
                self.send_resp(
                    Packet::new(bth, ExtHdr::None, data[at..at + pmtu].to_vec()),
                    false,
                    None,
                )?;
            }
        }

        let op = if n == 1 {
            Opcode::RdmaReadResponseOnly
        } else {
            Opcode::RdmaReadResponseLast
        };
        let bth = Bth::new(op, dqpn, psn::advance(cpsn, n - 1));
        let payload = if data.is_empty() {
            Vec::new()
        } else {
            data[(n as usize - 1) * pmtu..].to_vec()
        };
        self.send_resp(Packet::new(bth, ExtHdr::Aeth(aeth), payload), false, None)?;

        if update_epsn {
            self.rq_psn = psn::advance(self.rq_psn, n);
        }
        Ok(())
    }

    fn handle_atomic_req(&mut self, req: &Packet) -> io::Result<()> {
        let op = req.opcode();
        let Some(eth) = req.atomic_eth().copied() else {
            warn!("RQ={}: atomic request without AtomicETH", self.qpn);
            return self.send_nak(NAK_INVALID_REQUEST, req.psn());
        };

        let mr = match self
            .pd
            .validate_mr(op, eth.rkey, eth.va, ATOMIC_BYTE_SIZE)
        {
            Ok(mr) => mr,
            Err(err) => {
                warn!("RQ={}: atomic request refused: {err}", self.qpn);
                return self.send_nak(NAK_REMOTE_ACCESS, req.psn());
            }
        };

        let addr_in_mr = if mr.perm().contains(Permission::ZERO_BASED) {
            mr.addr() + eth.va
        } else {
            eth.va
        };
        if addr_in_mr % ATOMIC_BYTE_SIZE as u64 != 0 {
            warn!("RQ={}: misaligned atomic at {:#x}", self.qpn, eth.va);
            return self.send_nak(NAK_INVALID_REQUEST, req.psn());
        }

        // Read-modify-write is a single uninterrupted step in the
        // single-threaded loop.
        let orig_bytes = match mr.read(eth.va, ATOMIC_BYTE_SIZE) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("RQ={}: atomic read failed: {err}", self.qpn);
                return self.send_nak(NAK_REMOTE_ACCESS, req.psn());
            }
        };
        let orig = u64::from_ne_bytes(orig_bytes.try_into().unwrap_or_default());
        let new = match op {
            Opcode::CompareSwap => (orig == eth.comp).then_some(eth.swap),
            _ => Some(orig.wrapping_add(eth.comp)),
        };
        if let Some(new) = new {
            if let Err(err) = mr.write(eth.va, &new.to_ne_bytes()) {
                warn!("RQ={}: atomic write-back failed: {err}", self.qpn);
                return self.send_nak(NAK_REMOTE_OP, req.psn());
            }
        }

        self.msn = psn::mask(self.msn + 1);
        let bth = Bth::new(Opcode::AtomicAcknowledge, self.dqpn()?, req.psn());
        let resp = Packet::new(
            bth,
            ExtHdr::AtomicAck {
                aeth: Aeth::ack(self.msn),
                ack: AtomicAckEth { orig },
            },
            Vec::new(),
        );
        self.send_resp(resp, true, Some(eth))?;
        self.rq_psn = psn::next(self.rq_psn);
        Ok(())
    }

    /// Answer a request whose PSN is not the expected one: replay cached
    /// responses for older PSNs, drop out-of-order newer ones.
    fn handle_dup_or_illegal_req(&mut self, req: &Packet) -> io::Result<()> {
        let op = req.opcode();
        match psn::compare(self.rq_psn, req.psn(), self.rq_psn) {
            Ordering::Greater => {
                debug!("RQ={}: duplicate request at PSN {}", self.qpn, req.psn());
                if op.is_send() || op.is_write() {
                    let Some(cached) = self.resp_pkts.get(&req.psn()) else {
                        debug!("RQ={}: no cached response to replay", self.qpn);
                        return Ok(());
                    };
                    // Patch the replayed PSN up to the newest consumed
                    // request so the requester's coalescing still applies.
                    let mut pkt = cached.pkt.clone();
                    pkt.bth.psn = psn::prev(self.rq_psn);
                    self.send_raw(pkt)
                } else if op == Opcode::RdmaReadRequest {
                    self.handle_read_req(req, false)
                } else if op.is_atomic() {
                    let matches = self
                        .resp_pkts
                        .get(&req.psn())
                        .filter(|c| c.atomic_args.as_ref() == req.atomic_eth())
                        .map(|c| c.pkt.clone());
                    match matches {
                        Some(pkt) => self.send_raw(pkt),
                        None => {
                            debug!(
                                "RQ={}: duplicate atomic at PSN {} does not match the \
                                 cached response",
                                self.qpn,
                                req.psn()
                            );
                            Ok(())
                        }
                    }
                } else {
                    Ok(())
                }
            }
            _ => {
                // Out-of-order request; log and drop.
                debug!(
                    "RQ={}: sequence error, ePSN={} but received PSN {}",
                    self.qpn,
                    self.rq_psn,
                    req.psn()
                );
                Ok(())
            }
        }
    }

    fn send_ack(&mut self, req_psn: Psn) -> io::Result<()> {
        let bth = Bth::new(Opcode::Acknowledge, self.dqpn()?, req_psn);
        let ack = Packet::new(bth, ExtHdr::Aeth(Aeth::ack(self.msn)), Vec::new());
        self.send_resp(ack, true, None)
    }

    fn send_nak(&mut self, value: u8, req_psn: Psn) -> io::Result<()> {
        let bth = Bth::new(Opcode::Acknowledge, self.dqpn()?, req_psn);
        let nak = Packet::new(bth, ExtHdr::Aeth(Aeth::nak(value, self.msn)), Vec::new());
        self.send_resp(nak, false, None)
    }

    fn send_rnr_nak(&mut self, req_psn: Psn) -> io::Result<()> {
        let bth = Bth::new(Opcode::Acknowledge, self.dqpn()?, req_psn);
        let nak = Packet::new(
            bth,
            ExtHdr::Aeth(Aeth::rnr(self.min_rnr_timer, self.msn)),
            Vec::new(),
        );
        self.send_resp(nak, false, None)
    }

    fn send_resp(
        &mut self,
        pkt: Packet,
        save: bool,
        atomic_args: Option<AtomicEth>,
    ) -> io::Result<()> {
        let dgid = self
            .dgid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "QP has no destination GID"))?;
        if save {
            self.resp_pkts.insert(
                pkt.bth.psn,
                CachedResp {
                    pkt: pkt.clone(),
                    atomic_args,
                },
            );
        }
        trace!(
            "RQ={}: responding {:?} at PSN {}",
            self.qpn,
            pkt.opcode(),
            pkt.psn()
        );
        self.tx.send_to(dgid, &pkt)
    }

    /// Send a packet without touching the duplicate cache.
    fn send_raw(&self, pkt: Packet) -> io::Result<()> {
        let dgid = self
            .dgid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "QP has no destination GID"))?;
        self.tx.send_to(dgid, &pkt)
    }
}
