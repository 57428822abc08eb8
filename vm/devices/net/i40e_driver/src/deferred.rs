// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deferral of interrupt-time work to a task context.
//!
//! An interrupt handler calls [`WorkQueue::schedule`] and returns. The
//! servicing task takes items with [`WorkQueue::next`] or
//! [`WorkQueue::take`], then calls [`WorkQueue::rearm`] before sleeping.
//! The trigger flag plays the part of a masked interrupt: an interrupt source
//! can check it and skip signalling while the task is already running.

use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

/// A unit of deferred work.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Work {
    /// Process the admin receive queue.
    AdminQueue,
    /// Poll a receive ring.
    Rx(u16),
    /// Reclaim a transmit ring.
    Tx(u16),
    /// Reset the function.
    Reset,
}

/// A bounded queue of deferred work. Scheduling work that is already queued
/// is a no-op.
pub struct WorkQueue {
    items: Mutex<VecDeque<Work>>,
    capacity: usize,
    triggered: AtomicBool,
    dropped: AtomicU64,
    waker: AtomicWaker,
}

impl WorkQueue {
    /// Creates an empty queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            triggered: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            waker: AtomicWaker::new(),
        }
    }

    /// Queues `work`. Returns false if the queue was full and the work was
    /// dropped.
    pub fn schedule(&self, work: Work) -> bool {
        {
            let mut items = self.items.lock();
            if !items.contains(&work) {
                if items.len() == self.capacity {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(?work, "deferred work queue full");
                    return false;
                }
                items.push_back(work);
            }
        }
        self.triggered.store(true, Ordering::Release);
        self.waker.wake();
        true
    }

    /// Takes the oldest item.
    pub fn take(&self) -> Option<Work> {
        self.items.lock().pop_front()
    }

    /// Takes every queued item.
    pub fn drain(&self) -> Vec<Work> {
        self.items.lock().drain(..).collect()
    }

    /// Polls for the next item.
    pub fn poll_next(&self, cx: &mut Context<'_>) -> Poll<Work> {
        self.waker.register(cx.waker());
        match self.take() {
            Some(work) => Poll::Ready(work),
            None => Poll::Pending,
        }
    }

    /// Waits for the next item.
    pub async fn next(&self) -> Work {
        std::future::poll_fn(|cx| self.poll_next(cx)).await
    }

    /// Returns true between a [`Self::schedule`] and the following
    /// [`Self::rearm`].
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Clears the trigger once the task has run out of work. Returns true if
    /// work is still queued, in which case the trigger stays set and the
    /// task should keep going.
    pub fn rearm(&self) -> bool {
        let items = self.items.lock();
        if items.is_empty() {
            self.triggered.store(false, Ordering::Release);
            false
        } else {
            true
        }
    }

    /// The number of items dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn duplicates_coalesce() {
        let wq = WorkQueue::new(4);
        assert!(wq.schedule(Work::Rx(0)));
        assert!(wq.schedule(Work::Rx(0)));
        assert!(wq.schedule(Work::Tx(0)));
        assert_eq!(wq.drain(), [Work::Rx(0), Work::Tx(0)]);
    }

    #[test]
    fn full_queue_drops() {
        let wq = WorkQueue::new(2);
        assert!(wq.schedule(Work::Rx(0)));
        assert!(wq.schedule(Work::Rx(1)));
        assert!(!wq.schedule(Work::Rx(2)));
        assert!(wq.schedule(Work::Rx(1)));
        assert_eq!(wq.dropped(), 1);
    }

    #[test]
    fn trigger_until_rearmed() {
        let wq = WorkQueue::new(4);
        assert!(!wq.is_triggered());
        wq.schedule(Work::AdminQueue);
        assert!(wq.is_triggered());
        assert!(wq.rearm());
        assert_eq!(block_on(wq.next()), Work::AdminQueue);
        assert!(wq.is_triggered());
        assert!(!wq.rearm());
        assert!(!wq.is_triggered());
    }

    #[test]
    fn next_wakes_on_schedule() {
        let wq = std::sync::Arc::new(WorkQueue::new(4));
        let scheduler = std::thread::spawn({
            let wq = wq.clone();
            move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                wq.schedule(Work::Reset);
            }
        });
        assert_eq!(block_on(wq.next()), Work::Reset);
        scheduler.join().unwrap();
    }
}
