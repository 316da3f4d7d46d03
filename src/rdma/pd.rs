//! Protection domains.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use super::mr::{Mr, MrError, Permission};
use super::types::*;
use crate::wire::Opcode;

/// Memory access validation error type.
///
/// On the responder this maps to a remote-access NAK; on the requester it
/// maps to a local protection or local length completion status.
#[derive(Debug, Clone, Error)]
pub enum AccessError {
    /// No memory region is registered under the key.
    #[error("no MR registered under key {0:#x}")]
    InvalidKey(u32),

    /// The address range does not lie within the region.
    #[error(transparent)]
    OutOfBounds(#[from] MrError),

    /// The region does not permit the operation.
    #[error("operation {0:?} not permitted by MR access flags")]
    NotPermitted(Opcode),
}

/// Ownership holder of protection domain state.
struct PdInner {
    pdn: Pdn,
    /// Regions keyed by both lkey and rkey (the two may coincide).
    mrs: HashMap<u32, Mr>,
    qpns: HashSet<Qpn>,
    next_key: u32,
}

/// Protection domain: an arena of memory regions keyed by lkey and rkey,
/// plus the set of queue pairs created under it.
pub struct Pd {
    inner: Rc<RefCell<PdInner>>,
}

impl Pd {
    pub(crate) fn new(pdn: Pdn) -> Self {
        Self {
            inner: Rc::new(RefCell::new(PdInner {
                pdn,
                mrs: HashMap::new(),
                qpns: HashSet::new(),
                next_key: 1,
            })),
        }
    }

    /// Make a clone of the domain handle.
    pub(crate) fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }

    /// Get the protection domain number.
    #[inline]
    pub fn pdn(&self) -> Pdn {
        self.inner.borrow().pdn
    }

    /// Register a memory region of `len` zeroed bytes.
    pub fn reg_mr(&self, va: u64, len: usize, perm: Permission) -> Mr {
        let mut inner = self.inner.borrow_mut();
        let key = inner.next_key;
        inner.next_key += 1;

        let mr = Mr::new(va, len, perm, key, key);
        inner.mrs.insert(mr.lkey(), mr.clone());
        inner.mrs.insert(mr.rkey(), mr.clone());
        mr
    }

    /// Deregister a memory region.
    pub fn dereg_mr(&self, mr: &Mr) {
        let mut inner = self.inner.borrow_mut();
        inner.mrs.remove(&mr.rkey());
        inner.mrs.remove(&mr.lkey());
    }

    /// Determine whether a region is registered under the given key.
    pub fn has_mr(&self, key: u32) -> bool {
        self.inner.borrow().mrs.contains_key(&key)
    }

    /// Look up a region by lkey or rkey.
    pub fn mr(&self, key: u32) -> Option<Mr> {
        self.inner.borrow().mrs.get(&key).map(Mr::clone)
    }

    pub(crate) fn add_qp(&self, qpn: Qpn) {
        self.inner.borrow_mut().qpns.insert(qpn);
    }

    /// Validate that the region under `key` admits `op` touching
    /// `[addr, addr + len)`, and return it.
    pub(crate) fn validate_mr(
        &self,
        op: Opcode,
        key: u32,
        addr: u64,
        len: usize,
    ) -> Result<Mr, AccessError> {
        let mr = self.mr(key).ok_or(AccessError::InvalidKey(key))?;
        mr.check_bounds(addr, len)?;
        if !mr.perm().contains(Permission::required_for(op)) {
            return Err(AccessError::NotPermitted(op));
        }
        Ok(mr)
    }
}

impl fmt::Debug for Pd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pd").field("pdn", &self.pdn()).finish()
    }
}
