//! The 8-bit BTH opcode space and classification predicates.
//!
//! The high 3 bits of an opcode select the transport family, the low 5 bits
//! the operation within a message. Only the reliable-connected (RC) family is
//! given semantics here, plus the CNP marker which is emitted but never part
//! of a message exchange.

use super::PacketError;

/// High-bits value of the RC transport family.
pub const TRANSPORT_RC: u8 = 0x00;

/// The congestion notification packet marker opcode.
pub const CNP_OPCODE: u8 = 0x81;

/// BTH opcode of an RC packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    SendFirst = 0x00,
    SendMiddle = 0x01,
    SendLast = 0x02,
    SendLastWithImmediate = 0x03,
    SendOnly = 0x04,
    SendOnlyWithImmediate = 0x05,
    RdmaWriteFirst = 0x06,
    RdmaWriteMiddle = 0x07,
    RdmaWriteLast = 0x08,
    RdmaWriteLastWithImmediate = 0x09,
    RdmaWriteOnly = 0x0a,
    RdmaWriteOnlyWithImmediate = 0x0b,
    RdmaReadRequest = 0x0c,
    RdmaReadResponseFirst = 0x0d,
    RdmaReadResponseMiddle = 0x0e,
    RdmaReadResponseLast = 0x0f,
    RdmaReadResponseOnly = 0x10,
    Acknowledge = 0x11,
    AtomicAcknowledge = 0x12,
    CompareSwap = 0x13,
    FetchAdd = 0x14,
    SendLastWithInvalidate = 0x16,
    SendOnlyWithInvalidate = 0x17,

    /// Congestion notification marker (not an RC message operation).
    Cnp = CNP_OPCODE,
}

impl TryFrom<u8> for Opcode {
    type Error = PacketError;

    fn try_from(op: u8) -> Result<Self, PacketError> {
        use Opcode::*;
        Ok(match op {
            0x00 => SendFirst,
            0x01 => SendMiddle,
            0x02 => SendLast,
            0x03 => SendLastWithImmediate,
            0x04 => SendOnly,
            0x05 => SendOnlyWithImmediate,
            0x06 => RdmaWriteFirst,
            0x07 => RdmaWriteMiddle,
            0x08 => RdmaWriteLast,
            0x09 => RdmaWriteLastWithImmediate,
            0x0a => RdmaWriteOnly,
            0x0b => RdmaWriteOnlyWithImmediate,
            0x0c => RdmaReadRequest,
            0x0d => RdmaReadResponseFirst,
            0x0e => RdmaReadResponseMiddle,
            0x0f => RdmaReadResponseLast,
            0x10 => RdmaReadResponseOnly,
            0x11 => Acknowledge,
            0x12 => AtomicAcknowledge,
            0x13 => CompareSwap,
            0x14 => FetchAdd,
            0x16 => SendLastWithInvalidate,
            0x17 => SendOnlyWithInvalidate,
            CNP_OPCODE => Cnp,
            _ => return Err(PacketError::UnknownOpcode(op)),
        })
    }
}

impl From<Opcode> for u8 {
    #[inline]
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

impl Opcode {
    /// Determine whether the opcode belongs to the RC transport family.
    #[inline]
    pub const fn is_rc(self) -> bool {
        (self as u8) & 0xE0 == TRANSPORT_RC
    }

    /// Determine whether the opcode is a send operation.
    pub const fn is_send(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            SendFirst
                | SendMiddle
                | SendLast
                | SendLastWithImmediate
                | SendOnly
                | SendOnlyWithImmediate
                | SendLastWithInvalidate
                | SendOnlyWithInvalidate
        )
    }

    /// Determine whether the opcode is an RDMA write operation.
    pub const fn is_write(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            RdmaWriteFirst
                | RdmaWriteMiddle
                | RdmaWriteLast
                | RdmaWriteLastWithImmediate
                | RdmaWriteOnly
                | RdmaWriteOnlyWithImmediate
        )
    }

    /// Determine whether the opcode is an atomic operation.
    #[inline]
    pub const fn is_atomic(self) -> bool {
        matches!(self, Opcode::CompareSwap | Opcode::FetchAdd)
    }

    /// Determine whether the opcode is an RDMA read response.
    pub const fn is_read_resp(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            RdmaReadResponseFirst
                | RdmaReadResponseMiddle
                | RdmaReadResponseLast
                | RdmaReadResponseOnly
        )
    }

    /// Determine whether the opcode is a request (requester to responder).
    #[inline]
    pub const fn is_request(self) -> bool {
        self.is_send() || self.is_write() || self.is_atomic() || matches!(self, Opcode::RdmaReadRequest)
    }

    /// Determine whether the opcode is a response (responder to requester).
    #[inline]
    pub const fn is_response(self) -> bool {
        self.is_read_resp() || matches!(self, Opcode::Acknowledge | Opcode::AtomicAcknowledge)
    }

    /// Determine whether the opcode is the first packet of a multi-packet
    /// request message.
    #[inline]
    pub const fn is_first_req(self) -> bool {
        matches!(self, Opcode::SendFirst | Opcode::RdmaWriteFirst)
    }

    /// Determine whether the opcode is a middle packet of a multi-packet
    /// request message.
    #[inline]
    pub const fn is_mid_req(self) -> bool {
        matches!(self, Opcode::SendMiddle | Opcode::RdmaWriteMiddle)
    }

    /// Determine whether the opcode is the last packet of a multi-packet
    /// request message.
    #[inline]
    pub const fn is_last_req(self) -> bool {
        self.is_send_last() || self.is_write_last()
    }

    /// Determine whether the opcode is a single-packet request message.
    pub const fn is_only_req(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            SendOnly
                | SendOnlyWithImmediate
                | SendOnlyWithInvalidate
                | RdmaWriteOnly
                | RdmaWriteOnlyWithImmediate
                | RdmaReadRequest
        )
    }

    /// Determine whether the opcode terminates a send message.
    #[inline]
    pub const fn is_send_last(self) -> bool {
        use Opcode::*;
        matches!(self, SendLast | SendLastWithImmediate | SendLastWithInvalidate)
    }

    /// Determine whether the opcode terminates a write message.
    #[inline]
    pub const fn is_write_last(self) -> bool {
        matches!(self, Opcode::RdmaWriteLast | Opcode::RdmaWriteLastWithImmediate)
    }

    /// Determine whether packets of this opcode carry immediate data.
    pub const fn has_imm(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            SendLastWithImmediate
                | SendOnlyWithImmediate
                | RdmaWriteLastWithImmediate
                | RdmaWriteOnlyWithImmediate
        )
    }

    /// Determine whether packets of this opcode carry an invalidate key.
    #[inline]
    pub const fn has_inv(self) -> bool {
        matches!(self, Opcode::SendLastWithInvalidate | Opcode::SendOnlyWithInvalidate)
    }
}

/// Check whether `cur` may legally follow `prev` on a connection.
///
/// A previous opcode that terminates a message (or no previous opcode at all)
/// admits anything that starts one: first/only requests, acknowledgments, and
/// read-response first/only. Mid-message opcodes admit only their own
/// continuation; an `Acknowledge` is tolerated in the middle of a read
/// response so a NAK can terminate it early.
pub fn legal_after(prev: Option<Opcode>, cur: Opcode) -> bool {
    use Opcode::*;
    match prev {
        Some(SendFirst) | Some(SendMiddle) => matches!(cur, SendMiddle) || cur.is_send_last(),
        Some(RdmaWriteFirst) | Some(RdmaWriteMiddle) => {
            matches!(cur, RdmaWriteMiddle) || cur.is_write_last()
        }
        Some(RdmaReadResponseFirst) | Some(RdmaReadResponseMiddle) => {
            matches!(cur, RdmaReadResponseMiddle | RdmaReadResponseLast | Acknowledge)
        }
        // Message boundary: anything that continues a message is illegal.
        _ => {
            !(cur.is_mid_req()
                || cur.is_last_req()
                || matches!(cur, RdmaReadResponseMiddle | RdmaReadResponseLast))
        }
    }
}
