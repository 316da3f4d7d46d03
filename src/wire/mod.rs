//! Bit-exact RoCE v2 wire codec: BTH and extension headers, opcode tables,
//! and the invariant CRC.

mod hdr;
mod icrc;
mod opcode;
mod packet;

pub use self::hdr::*;
pub use self::icrc::*;
pub use self::opcode::*;
pub use self::packet::*;
