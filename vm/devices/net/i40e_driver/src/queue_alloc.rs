// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Allocation of the device's hardware queue pairs to the PF and its VFs.

use bitvec::vec::BitVec;
use thiserror::Error;

/// The function a queue range belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueOwner {
    /// The physical function's own VSI.
    Pf,
    /// A virtual function, by VF number.
    Vf(u16),
}

/// Queue allocation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueAllocError {
    /// No contiguous free run of the requested length exists.
    #[error("no {0} contiguous queues available")]
    NoQueues(u16),
    /// A zero-length or larger-than-device request.
    #[error("invalid queue count {0}")]
    InvalidCount(u16),
    /// The tag was not issued by this manager or was already released.
    #[error("queue range {first}+{count} is not allocated")]
    UnknownTag {
        /// First queue of the range.
        first: u16,
        /// Length of the range.
        count: u16,
    },
}

/// A contiguous range of global queue indices. Returned to the manager by
/// [`QueueManager::release`].
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct QueueTag {
    first: u16,
    count: u16,
    owner: QueueOwner,
}

impl QueueTag {
    /// The first global queue index.
    pub fn first(&self) -> u16 {
        self.first
    }

    /// The number of queues.
    pub fn count(&self) -> u16 {
        self.count
    }

    /// The owning function.
    pub fn owner(&self) -> QueueOwner {
        self.owner
    }

    /// Translates a function-relative queue index to a global one.
    pub fn global(&self, index: u16) -> Option<u16> {
        (index < self.count).then(|| self.first + index)
    }

    /// Returns true if every bit of `mask` names a queue in this range.
    pub fn contains_mask(&self, mask: u32) -> bool {
        self.count >= 32 || mask >> self.count == 0
    }
}

/// First-fit allocator over the device's queue pairs.
pub struct QueueManager {
    used: BitVec,
}

impl QueueManager {
    /// Creates a manager for `total` queue pairs, all free.
    pub fn new(total: u16) -> Self {
        Self {
            used: BitVec::repeat(false, total.into()),
        }
    }

    /// The number of queue pairs managed.
    pub fn total(&self) -> u16 {
        self.used.len() as u16
    }

    /// Reserves `count` contiguous queues for `owner`. Nothing is reserved
    /// on failure.
    pub fn reserve_contiguous(
        &mut self,
        count: u16,
        owner: QueueOwner,
    ) -> Result<QueueTag, QueueAllocError> {
        let count_usize = count as usize;
        if count == 0 || count_usize > self.used.len() {
            return Err(QueueAllocError::InvalidCount(count));
        }
        let first = (0..=self.used.len() - count_usize)
            .find(|&start| self.used[start..start + count_usize].not_any())
            .ok_or(QueueAllocError::NoQueues(count))?;
        self.used[first..first + count_usize].fill(true);
        tracing::debug!(first, count, ?owner, "reserved queues");
        Ok(QueueTag {
            first: first as u16,
            count,
            owner,
        })
    }

    /// Returns a range to the free pool.
    pub fn release(&mut self, tag: QueueTag) -> Result<(), QueueAllocError> {
        let range = tag.first as usize..tag.first as usize + tag.count as usize;
        if range.end > self.used.len() || !self.used[range.clone()].all() {
            return Err(QueueAllocError::UnknownTag {
                first: tag.first,
                count: tag.count,
            });
        }
        self.used[range].fill(false);
        tracing::debug!(first = tag.first, count = tag.count, owner = ?tag.owner, "released queues");
        Ok(())
    }

    /// The number of unreserved queues.
    pub fn num_free(&self) -> u16 {
        self.used.count_zeros() as u16
    }

    /// The number of reserved queues.
    pub fn num_used(&self) -> u16 {
        self.used.count_ones() as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_without_overlap() {
        let mut qm = QueueManager::new(16);
        let pf = qm.reserve_contiguous(4, QueueOwner::Pf).unwrap();
        let vf0 = qm.reserve_contiguous(4, QueueOwner::Vf(0)).unwrap();
        let vf1 = qm.reserve_contiguous(4, QueueOwner::Vf(1)).unwrap();
        assert_eq!((pf.first(), vf0.first(), vf1.first()), (0, 4, 8));
        assert_eq!(vf1.global(3), Some(11));
        assert_eq!(vf1.global(4), None);
        assert_eq!(qm.num_used(), 12);

        qm.release(vf0).unwrap();
        let vf2 = qm.reserve_contiguous(2, QueueOwner::Vf(2)).unwrap();
        assert_eq!(vf2.first(), 4);
        assert_eq!(vf2.owner(), QueueOwner::Vf(2));
        assert_eq!(qm.num_free(), 6);
    }

    #[test]
    fn no_partial_allocation() {
        let mut qm = QueueManager::new(8);
        let a = qm.reserve_contiguous(3, QueueOwner::Pf).unwrap();
        let _b = qm.reserve_contiguous(2, QueueOwner::Vf(0)).unwrap();
        qm.release(a).unwrap();
        // Three free at the front and three at the back, but never four in a row.
        assert_eq!(
            qm.reserve_contiguous(4, QueueOwner::Vf(1)),
            Err(QueueAllocError::NoQueues(4))
        );
        assert_eq!(qm.num_free(), 6);
        assert_eq!(
            qm.reserve_contiguous(0, QueueOwner::Vf(1)),
            Err(QueueAllocError::InvalidCount(0))
        );
        assert_eq!(
            qm.reserve_contiguous(9, QueueOwner::Vf(1)),
            Err(QueueAllocError::InvalidCount(9))
        );
    }

    #[test]
    fn double_release_is_reported() {
        let mut qm = QueueManager::new(8);
        let tag = qm.reserve_contiguous(2, QueueOwner::Vf(0)).unwrap();
        let forged = QueueTag {
            first: tag.first,
            count: tag.count,
            owner: tag.owner,
        };
        qm.release(tag).unwrap();
        assert_eq!(
            qm.release(forged),
            Err(QueueAllocError::UnknownTag { first: 0, count: 2 })
        );
    }

    #[test]
    fn queue_masks() {
        let mut qm = QueueManager::new(8);
        let tag = qm.reserve_contiguous(4, QueueOwner::Vf(0)).unwrap();
        assert!(tag.contains_mask(0b1111));
        assert!(!tag.contains_mask(0b1_0000));
    }
}
