//! Local memory regions.

mod perm;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

pub use self::perm::*;
use crate::rdma::types::*;

/// Memory region access error type.
#[derive(Debug, Clone, Error)]
pub enum MrError {
    /// The accessed address range does not lie within the region.
    #[error("address {addr:#x} + {len} bytes not within MR")]
    OutOfBounds { addr: u64, len: usize },
}

/// Ownership holder of a memory region's backing buffer and metadata.
struct MrInner {
    va: u64,
    perm: Permission,
    lkey: LKey,
    rkey: RKey,
    buf: Vec<u8>,
}

impl MrInner {
    /// Resolve an address to an offset into the backing buffer, bounds-checked.
    fn offset_of(&self, addr: u64, len: usize) -> Result<usize, MrError> {
        let offset = if self.perm.contains(Permission::ZERO_BASED) {
            addr
        } else {
            match addr.checked_sub(self.va) {
                Some(offset) => offset,
                None => return Err(MrError::OutOfBounds { addr, len }),
            }
        };
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.buf.len() as u64 => Ok(offset as usize),
            _ => Err(MrError::OutOfBounds { addr, len }),
        }
    }
}

/// Local memory region: a byte-addressed buffer registered to a protection
/// domain under a local and a remote key.
///
/// Unless the region is [`Permission::ZERO_BASED`], addresses passed to
/// [`read`](Self::read) and [`write`](Self::write) are absolute and must lie
/// in `[addr, addr + len)`.
pub struct Mr {
    inner: Rc<RefCell<MrInner>>,
}

impl Mr {
    pub(crate) fn new(va: u64, len: usize, perm: Permission, lkey: LKey, rkey: RKey) -> Self {
        Self {
            inner: Rc::new(RefCell::new(MrInner {
                va,
                perm,
                lkey,
                rkey,
                buf: vec![0; len],
            })),
        }
    }

    /// Make a clone of the region handle.
    pub(crate) fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }

    /// Get the start address of the region.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.inner.borrow().va
    }

    /// Get the length of the region in bytes.
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.borrow().buf.len()
    }

    /// Get the local key of the region.
    #[inline]
    pub fn lkey(&self) -> LKey {
        self.inner.borrow().lkey
    }

    /// Get the remote key of the region.
    #[inline]
    pub fn rkey(&self) -> RKey {
        self.inner.borrow().rkey
    }

    /// Get the access permissions of the region.
    #[inline]
    pub fn perm(&self) -> Permission {
        self.inner.borrow().perm
    }

    /// Copy `size` bytes out of the region starting at `addr`.
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>, MrError> {
        let inner = self.inner.borrow();
        let offset = inner.offset_of(addr, size)?;
        Ok(inner.buf[offset..offset + size].to_vec())
    }

    /// Copy `data` into the region starting at `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MrError> {
        let mut inner = self.inner.borrow_mut();
        let offset = inner.offset_of(addr, data.len())?;
        inner.buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Check that `[addr, addr + len)` lies within the region without
    /// touching it.
    pub fn check_bounds(&self, addr: u64, len: usize) -> Result<(), MrError> {
        self.inner.borrow().offset_of(addr, len).map(|_| ())
    }
}

impl fmt::Debug for Mr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Mr")
            .field("va", &inner.va)
            .field("len", &inner.buf.len())
            .field("lkey", &inner.lkey)
            .field("rkey", &inner.rkey)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_addressing() {
        let mr = Mr::new(0x1000, 64, Permission::default(), 1, 1);
        mr.write(0x1000, b"hello").unwrap();
        mr.write(0x103B, b"tail!").unwrap();
        assert_eq!(mr.read(0x1000, 5).unwrap(), b"hello");
        assert_eq!(mr.read(0x103B, 5).unwrap(), b"tail!");

        assert!(matches!(
            mr.write(0x0FFF, b"x"),
            Err(MrError::OutOfBounds { .. })
        ));
        assert!(matches!(
            mr.write(0x103C, b"tail!"),
            Err(MrError::OutOfBounds { .. })
        ));
        assert!(matches!(
            mr.read(0x1040, 1),
            Err(MrError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn zero_based_addressing() {
        let perm = Permission::default() | Permission::ZERO_BASED;
        let mr = Mr::new(0x5648_2BB7_6120, 32, perm, 2, 2);
        mr.write(0, b"head").unwrap();
        mr.write(28, b"tail").unwrap();
        assert_eq!(mr.read(0, 4).unwrap(), b"head");
        assert!(matches!(
            mr.write(29, b"tail"),
            Err(MrError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn zero_length_access_at_end() {
        let mr = Mr::new(0, 16, Permission::default() | Permission::ZERO_BASED, 1, 1);
        assert!(mr.check_bounds(16, 0).is_ok());
        assert!(mr.check_bounds(17, 0).is_err());
    }
}
