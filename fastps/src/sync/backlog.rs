/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The producer backlog: a fixed-capacity ring between application threads
//! and the completion dispatcher.
//!
//! Application threads [`push`](Backlog::push) without blocking. A push into
//! a full ring fails with [`TransportError::BacklogOverflow`] and leaves the
//! ring untouched; nothing is overwritten. The dispatcher
//! [`pop`](Backlog::pop)s the oldest record, blocking while the ring is
//! empty. After [`close`](Backlog::close) the remaining records drain in
//! order and `pop` then reports the end of the stream.

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::error::TransportError;

#[derive(Debug)]
struct Ring<T> {
    slots: Vec<Option<T>>,
    /// Next slot to write.
    head: usize,
    /// Next slot to read.
    tail: usize,
    closed: bool,
    aborted: bool,
}

/// A bounded FIFO ring. See the module documentation.
#[derive(Debug)]
pub struct Backlog<T> {
    ring: Mutex<Ring<T>>,
    ready: Condvar,
}

impl<T> Backlog<T> {
    /// Creates a ring with `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "backlog capacity must be positive");
        Self {
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                head: 0,
                tail: 0,
                closed: false,
                aborted: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        self.ring.lock().expect("backlog lock poisoned")
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// The number of records waiting to be sent.
    pub fn len(&self) -> usize {
        self.lock().slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `item` without blocking.
    pub fn push(&self, item: T) -> Result<(), TransportError> {
        let mut ring = self.lock();
        if ring.closed || ring.aborted {
            return Err(TransportError::Closed);
        }
        let head = ring.head;
        if ring.slots[head].is_some() {
            return Err(TransportError::BacklogOverflow {
                capacity: ring.slots.len(),
            });
        }
        ring.slots[head] = Some(item);
        ring.head = (head + 1) % ring.slots.len();
        drop(ring);
        self.ready.notify_one();
        Ok(())
    }

    /// Removes the oldest record, blocking while the ring is empty and open.
    /// Returns `Ok(None)` once the ring is closed and drained, and
    /// `Err(Closed)` once it is aborted.
    pub fn pop(&self) -> Result<Option<T>, TransportError> {
        let mut ring = self.lock();
        loop {
            if ring.aborted {
                return Err(TransportError::Closed);
            }
            let tail = ring.tail;
            if let Some(item) = ring.slots[tail].take() {
                ring.tail = (tail + 1) % ring.slots.len();
                return Ok(Some(item));
            }
            if ring.closed {
                return Ok(None);
            }
            ring = self.ready.wait(ring).expect("backlog lock poisoned");
        }
    }

    /// Refuses further pushes. Waiting records are still popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// Refuses further pushes and fails every pop.
    pub fn abort(&self) {
        let mut ring = self.lock();
        ring.aborted = true;
        ring.slots.iter_mut().for_each(|slot| *slot = None);
        drop(ring);
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_fifo_order() {
        let backlog = Backlog::with_capacity(4);
        for i in 0..4 {
            backlog.push(i).unwrap();
        }
        assert_eq!(backlog.len(), 4);
        assert_eq!(backlog.pop().unwrap(), Some(0));
        assert_eq!(backlog.pop().unwrap(), Some(1));
        // Wraps around.
        backlog.push(4).unwrap();
        backlog.push(5).unwrap();
        for i in 2..6 {
            assert_eq!(backlog.pop().unwrap(), Some(i));
        }
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_overflow_does_not_overwrite() {
        let backlog = Backlog::with_capacity(3);
        backlog.push("a").unwrap();
        backlog.push("b").unwrap();
        backlog.push("c").unwrap();
        assert!(matches!(
            backlog.push("d"),
            Err(TransportError::BacklogOverflow { capacity: 3 })
        ));
        assert_eq!(backlog.pop().unwrap(), Some("a"));
        assert_eq!(backlog.pop().unwrap(), Some("b"));
        assert_eq!(backlog.pop().unwrap(), Some("c"));
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let backlog = Arc::new(Backlog::with_capacity(2));
        let popper = {
            let backlog = backlog.clone();
            std::thread::spawn(move || backlog.pop())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!popper.is_finished());
        backlog.push(7).unwrap();
        assert_eq!(popper.join().unwrap().unwrap(), Some(7));
    }

    #[test]
    fn test_close_drains_then_ends() {
        let backlog = Backlog::with_capacity(2);
        backlog.push(1).unwrap();
        backlog.close();
        assert!(matches!(backlog.push(2), Err(TransportError::Closed)));
        assert_eq!(backlog.pop().unwrap(), Some(1));
        assert_eq!(backlog.pop().unwrap(), None);
        assert_eq!(backlog.pop().unwrap(), None);
    }

    #[test]
    fn test_close_wakes_blocked_pop() {
        let backlog = Arc::new(Backlog::<u32>::with_capacity(2));
        let popper = {
            let backlog = backlog.clone();
            std::thread::spawn(move || backlog.pop())
        };
        std::thread::sleep(Duration::from_millis(20));
        backlog.close();
        assert_eq!(popper.join().unwrap().unwrap(), None);
    }

    #[test]
    fn test_abort_discards() {
        let backlog = Backlog::with_capacity(2);
        backlog.push(1).unwrap();
        backlog.abort();
        assert!(matches!(backlog.pop(), Err(TransportError::Closed)));
        assert!(matches!(backlog.push(2), Err(TransportError::Closed)));
    }
}
