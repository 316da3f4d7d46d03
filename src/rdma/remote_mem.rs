//! Remote registered memory.

use super::mr::Mr;
use super::types::*;

/// Remote registered memory.
///
/// This structure carries remote memory region information and holds no
/// local resources; it is what the side-band rendezvous ships to a peer so
/// the peer can name the region in RDMA requests.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RemoteMem {
    pub addr: u64,
    pub len: usize,
    pub rkey: RKey,
}

impl RemoteMem {
    /// Create a new piece of remote registered memory data.
    pub fn new(addr: u64, len: usize, rkey: RKey) -> Self {
        Self { addr, len, rkey }
    }

    /// Create a dummy remote registered memory data that can be used as a
    /// placeholder.
    pub fn dummy() -> Self {
        Self::new(0, 0, 0)
    }

    /// Get an address at the given offset into the remote region.
    #[inline]
    pub fn at(&self, offset: usize) -> u64 {
        self.addr + offset as u64
    }
}

/// Pack the shareable information of a local MR so that it can be sent to
/// the remote side.
impl From<&Mr> for RemoteMem {
    fn from(mr: &Mr) -> Self {
        Self {
            addr: mr.addr(),
            len: mr.len(),
            rkey: mr.rkey(),
        }
    }
}
