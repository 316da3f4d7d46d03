//! Completion queue and completion entries.

mod wc;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

pub use self::wc::*;
use super::types::*;

/// Ownership holder of completion queue state.
struct CqInner {
    cqn: Cqn,
    queue: VecDeque<Cqe>,
}

/// Completion queue: a FIFO of completion entries drained by polling.
pub struct Cq {
    inner: Rc<RefCell<CqInner>>,
}

impl Cq {
    pub(crate) fn new(cqn: Cqn) -> Self {
        Self {
            inner: Rc::new(RefCell::new(CqInner {
                cqn,
                queue: VecDeque::new(),
            })),
        }
    }

    /// Make a clone of the queue handle.
    pub(crate) fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }

    /// Get the completion queue number.
    #[inline]
    pub fn cqn(&self) -> Cqn {
        self.inner.borrow().cqn
    }

    /// Append a completion entry.
    pub(crate) fn push(&self, cqe: Cqe) {
        self.inner.borrow_mut().queue.push_back(cqe);
    }

    /// Non-blockingly poll one completion entry.
    #[inline]
    pub fn poll_one(&self) -> Option<Cqe> {
        self.inner.borrow_mut().queue.pop_front()
    }

    /// Get the number of entries waiting to be polled.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Determine whether no entries are waiting.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().queue.is_empty()
    }
}

impl fmt::Debug for Cq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cq")
            .field("cqn", &self.cqn())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cqe(wr_id: WrId) -> Cqe {
        Cqe {
            wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: 0,
            qpn: 2,
            src_qp: 3,
            flags: WcFlags::EMPTY,
            imm_data_or_inv_rkey: None,
        }
    }

    #[test]
    fn fifo_order() {
        let cq = Cq::new(0);
        assert!(cq.is_empty());
        for id in 0..4 {
            cq.push(cqe(id));
        }
        assert_eq!(cq.len(), 4);
        for id in 0..4 {
            assert_eq!(cq.poll_one().unwrap().wr_id, id);
        }
        assert!(cq.poll_one().is_none());
    }
}
