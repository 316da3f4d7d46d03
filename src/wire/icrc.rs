//! Invariant CRC over the RoCE v2 pseudo-header.
//!
//! The ICRC is a CRC-32 (the zlib polynomial) over a reconstruction of the
//! full IP/UDP datagram in which every field a router may rewrite is replaced
//! by all-ones: a pseudo-LRH of eight `0xFF` bytes, IP `tos`/`ttl`/`checksum`,
//! the UDP checksum, and the BTH `fecn`/`becn`/reserved bits. The length
//! fields count the 4-byte ICRC slot, but the slot itself is excluded from
//! the CRC input. The computed value is emitted little-endian after the
//! payload. IPv6 framing is reserved.

use std::net::Ipv4Addr;

use crc::{Crc, CRC_32_ISO_HDLC};

/// Length of the ICRC trailer in bytes.
pub const ICRC_LEN: usize = 4;

const PSEUDO_LRH_LEN: usize = 8;
const IPV4_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;

/// Offset of the fecn/becn/reserved byte within the BTH.
const BTH_FECN_BYTE: usize = 4;

/// IP identification field value used in the pseudo-header. The emitting
/// socket does not control the real IP header, so the value is fixed by
/// convention on both sides.
const PSEUDO_IP_ID: u16 = 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Addressing of the UDP datagram a packet travels in, needed to build the
/// ICRC pseudo-header.
#[derive(Debug, Clone, Copy)]
pub struct IcrcContext {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
}

/// Compute the ICRC of a packet.
///
/// `wire` is the serialized BTH, extension headers and payload, without the
/// ICRC trailer.
pub fn compute(ctx: &IcrcContext, wire: &[u8]) -> u32 {
    let ip_total_len = (IPV4_HDR_LEN + UDP_HDR_LEN + wire.len() + ICRC_LEN) as u16;
    let udp_len = (UDP_HDR_LEN + wire.len() + ICRC_LEN) as u16;

    let mut buf = Vec::with_capacity(PSEUDO_LRH_LEN + IPV4_HDR_LEN + UDP_HDR_LEN + wire.len());
    buf.extend_from_slice(&[0xFF; PSEUDO_LRH_LEN]);

    // IPv4 header with tos, ttl and checksum masked.
    buf.push(0x45);
    buf.push(0xFF);
    buf.extend_from_slice(&ip_total_len.to_be_bytes());
    buf.extend_from_slice(&PSEUDO_IP_ID.to_be_bytes());
    buf.extend_from_slice(&[0x00, 0x00]);
    buf.push(0xFF);
    buf.push(17);
    buf.extend_from_slice(&[0xFF, 0xFF]);
    buf.extend_from_slice(&ctx.src.octets());
    buf.extend_from_slice(&ctx.dst.octets());

    // UDP header with checksum masked.
    buf.extend_from_slice(&ctx.sport.to_be_bytes());
    buf.extend_from_slice(&ctx.dport.to_be_bytes());
    buf.extend_from_slice(&udp_len.to_be_bytes());
    buf.extend_from_slice(&[0xFF, 0xFF]);

    // BTH and payload with the fecn/becn/reserved byte masked. The ICRC
    // placeholder extends the length fields above but is not CRC input.
    buf.extend_from_slice(wire);
    let masked = PSEUDO_LRH_LEN + IPV4_HDR_LEN + UDP_HDR_LEN + BTH_FECN_BYTE;
    buf[masked] = 0xFF;

    CRC32.checksum(&buf)
}

/// Check the ICRC trailer of a full received datagram against the one
/// computed from `ctx`.
pub fn verify(ctx: &IcrcContext, datagram: &[u8]) -> bool {
    if datagram.len() < ICRC_LEN {
        return false;
    }
    let (wire, trailer) = datagram.split_at(datagram.len() - ICRC_LEN);
    compute(ctx, wire).to_le_bytes() == trailer
}
