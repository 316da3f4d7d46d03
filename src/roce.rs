//! The RoCE v2 endpoint: UDP socket, resource registries, and the receive
//! loop.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::rdma::cq::Cq;
use crate::rdma::gid::Gid;
use crate::rdma::mr::Permission;
use crate::rdma::pd::Pd;
use crate::rdma::qp::Qp;
use crate::rdma::types::*;
use crate::wire::{IcrcContext, Packet};

/// UDP port carrying RoCE v2.
pub const ROCE_PORT: u16 = 4791;

/// Outbound packet path shared by every queue of an endpoint.
///
/// Resolves destination GIDs to IPv4 socket addresses, frames packets with
/// their ICRC, and writes them to the endpoint's socket. Destinations whose
/// GID is not IPv4-mapped are refused; IPv6 framing is reserved.
pub(crate) struct Transport {
    sock: Rc<UdpSocket>,
    src: Ipv4Addr,
    port: u16,
}

impl Transport {
    pub(crate) fn clone(&self) -> Self {
        Self {
            sock: self.sock.clone(),
            src: self.src,
            port: self.port,
        }
    }

    pub(crate) fn local_gid(&self) -> Gid {
        Gid::from(self.src)
    }

    pub(crate) fn send_to(&self, dgid: Gid, pkt: &Packet) -> io::Result<()> {
        let dst = dgid.to_ipv4().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "destination GID is not IPv4-mapped (IPv6 is reserved)",
            )
        })?;
        let ctx = IcrcContext {
            src: self.src,
            dst,
            sport: self.port,
            dport: self.port,
        };
        let wire = pkt.encode(&ctx);
        trace!(
            "sending {:?} psn={} dqpn={} ({} bytes) to {}",
            pkt.opcode(),
            pkt.psn(),
            pkt.bth.dqpn,
            wire.len(),
            dst
        );
        self.sock.send_to(&wire, SocketAddrV4::new(dst, self.port))?;
        Ok(())
    }
}

/// Endpoint configuration.
#[derive(Debug, Clone)]
pub struct RoceConfig {
    /// Address to bind. This address also seeds the endpoint's local GID,
    /// so it should be the address peers reach the endpoint at.
    pub bind: Ipv4Addr,

    /// UDP port to bind and to address peers on.
    pub port: u16,

    /// Path MTU for every queue pair of this endpoint.
    pub pmtu: Pmtu,

    /// Socket read timeout for [`Roce::recv_pkts`].
    pub recv_timeout: Duration,
}

impl Default for RoceConfig {
    fn default() -> Self {
        Self {
            bind: Ipv4Addr::UNSPECIFIED,
            port: ROCE_PORT,
            pmtu: Pmtu::default(),
            recv_timeout: Duration::from_secs(1),
        }
    }
}

/// A user-space RoCE v2 endpoint.
///
/// Owns the UDP socket and the protection domain, completion queue and queue
/// pair registries. The endpoint is single-threaded: [`Roce::recv_pkts`]
/// processes each arriving packet to completion before reading the next.
pub struct Roce {
    sock: Rc<UdpSocket>,
    transport: Transport,
    pmtu: Pmtu,
    qps: HashMap<Qpn, Qp>,
    cur_pdn: Pdn,
    cur_cqn: Cqn,
    cur_qpn: Qpn,
}

impl Roce {
    /// The first QPN handed out; lower values are reserved.
    const FIRST_QPN: Qpn = 2;

    /// Create an endpoint bound per the given configuration.
    pub fn new(config: RoceConfig) -> io::Result<Self> {
        let sock = UdpSocket::bind(SocketAddrV4::new(config.bind, config.port))?;
        sock.set_read_timeout(Some(config.recv_timeout))?;
        let sock = Rc::new(sock);

        Ok(Self {
            transport: Transport {
                sock: sock.clone(),
                src: config.bind,
                port: config.port,
            },
            sock,
            pmtu: config.pmtu,
            qps: HashMap::new(),
            cur_pdn: 0,
            cur_cqn: 0,
            cur_qpn: Self::FIRST_QPN,
        })
    }

    /// Get the endpoint's local GID.
    pub fn local_gid(&self) -> Gid {
        self.transport.local_gid()
    }

    /// Get the endpoint's path MTU.
    pub fn mtu(&self) -> Pmtu {
        self.pmtu
    }

    /// Allocate a protection domain.
    pub fn alloc_pd(&mut self) -> Pd {
        let pdn = self.cur_pdn;
        self.cur_pdn += 1;
        Pd::new(pdn)
    }

    /// Create a completion queue.
    pub fn create_cq(&mut self) -> Cq {
        let cqn = self.cur_cqn;
        self.cur_cqn += 1;
        Cq::new(cqn)
    }

    /// Create a queue pair under the given protection domain, pushing its
    /// completions to the given completion queue.
    pub fn create_qp(&mut self, pd: &Pd, cq: &Cq, access_flags: Permission) -> Qp {
        let qpn = self.cur_qpn;
        self.cur_qpn += 1;
        let qp = Qp::new(pd, cq, qpn, self.pmtu, access_flags, self.transport.clone());
        self.qps.insert(qpn, qp.clone());
        qp
    }

    /// Look up a queue pair by number.
    pub fn qp(&self, qpn: Qpn) -> Option<Qp> {
        self.qps.get(&qpn).map(Qp::clone)
    }

    /// Receive and process `npkt` packets.
    ///
    /// Blocks on the socket up to the configured read timeout per packet;
    /// a timeout surfaces as the corresponding I/O error. Malformed packets
    /// and packets for unknown QPNs are dropped with a log line.
    pub fn recv_pkts(&self, npkt: usize) -> io::Result<()> {
        let mut buf = vec![0u8; 65536];
        for _ in 0..npkt {
            let (len, peer) = self.sock.recv_from(&mut buf)?;
            let pkt = match Packet::decode(&buf[..len]) {
                Ok(pkt) => pkt,
                Err(err) => {
                    warn!("dropping malformed packet from {peer}: {err}");
                    continue;
                }
            };
            let Some(qp) = self.qps.get(&pkt.bth.dqpn) else {
                warn!("dropping packet from {peer} for unknown QPN {}", pkt.bth.dqpn);
                continue;
            };
            qp.recv_pkt(pkt)?;
        }
        debug!("received {npkt} RoCE packets");
        Ok(())
    }
}
