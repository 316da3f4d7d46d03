//! A user-space RoCE v2 endpoint: the reliable-connected transport state
//! machine and the bit-exact packet codec that frames it, carried in plain
//! UDP datagrams.
//!
//! The verbs-like surface lives at the crate root: [`Roce`] builds an
//! endpoint and hands out protection domains, completion queues and queue
//! pairs; work requests go in through [`Qp::post_send`] and
//! [`Qp::post_recv`], packets move through [`Roce::recv_pkts`], and results
//! come back as completion entries from [`Qp::poll_cq`].
//!
//! The wire codec (BTH, extension headers, opcode tables, ICRC) is exposed
//! in the [`wire`] mod. TCP-based connection management utilities for the
//! side-band metadata exchange are in the [`ctrl`] mod.
//!
//! **WARNING: The interfaces are unstable and up to change!**

/// Bit-exact RoCE v2 wire codec.
pub mod wire;

/// RDMA resources and the RC state machines.
/// Not to be publicly exposed, instead `pub use` necessary items.
mod rdma;

pub use rdma::cq::*;
pub use rdma::gid::*;
pub use rdma::mr::*;
pub use rdma::pd::*;
pub use rdma::qp::*;
pub use rdma::remote_mem::*;
pub use rdma::wr::*;

/// Type aliases, path MTUs and PSN arithmetic.
pub use rdma::types;

/// The UDP endpoint.
mod roce;

pub use roce::*;

/// Connection management utilities.
pub mod ctrl;
