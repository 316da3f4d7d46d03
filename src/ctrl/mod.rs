//! Connection management utilities: a TCP side-band used to exchange QP
//! endpoints and memory region metadata between two peers before their
//! queue pairs are brought up.

mod connecter;

pub use self::connecter::*;
