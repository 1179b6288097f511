/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A capacity-one rendezvous, in the style of an MVar.
//!
//! The dispatcher [`put`](Handoff::put)s a record and stays blocked until an
//! application thread [`take`](Handoff::take)s it, so at most one decoded
//! record is ever buffered. Either side can end the exchange:
//! [`finish`](Handoff::finish) marks a clean end of stream, after which
//! `take` returns `Ok(None)`; [`close`](Handoff::close) abandons it, after
//! which both sides fail with [`TransportError::Closed`].

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::error::TransportError;

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    finished: bool,
    closed: bool,
}

/// A synchronous channel of size one. See the module documentation.
#[derive(Debug)]
pub struct Handoff<T> {
    slot: Mutex<Slot<T>>,
    changed: Condvar,
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Handoff<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                finished: false,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().expect("handoff lock poisoned")
    }

    /// Deposits `value` and blocks until it has been taken.
    pub fn put(&self, value: T) -> Result<(), TransportError> {
        let mut slot = self.lock();
        while slot.value.is_some() && !slot.closed {
            slot = self.changed.wait(slot).expect("handoff lock poisoned");
        }
        if slot.closed || slot.finished {
            return Err(TransportError::Closed);
        }
        slot.value = Some(value);
        self.changed.notify_all();
        while slot.value.is_some() && !slot.closed {
            slot = self.changed.wait(slot).expect("handoff lock poisoned");
        }
        if slot.value.take().is_some() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Blocks until a value is deposited or the exchange ends.
    pub fn take(&self) -> Result<Option<T>, TransportError> {
        let mut slot = self.lock();
        loop {
            if slot.closed {
                return Err(TransportError::Closed);
            }
            if let Some(value) = slot.value.take() {
                self.changed.notify_all();
                return Ok(Some(value));
            }
            if slot.finished {
                return Ok(None);
            }
            slot = self.changed.wait(slot).expect("handoff lock poisoned");
        }
    }

    /// Marks the end of the stream. A value already deposited can still be
    /// taken.
    pub fn finish(&self) {
        self.lock().finished = true;
        self.changed.notify_all();
    }

    /// Abandons the exchange, waking both sides.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Whether the exchange has ended, cleanly or not.
    pub fn is_finished(&self) -> bool {
        let slot = self.lock();
        slot.finished || slot.closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_put_blocks_until_taken() {
        let handoff = Arc::new(Handoff::new());
        let putter = {
            let handoff = handoff.clone();
            std::thread::spawn(move || handoff.put(42))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!putter.is_finished());
        assert_eq!(handoff.take().unwrap(), Some(42));
        putter.join().unwrap().unwrap();
    }

    #[test]
    fn test_sequence() {
        let handoff = Arc::new(Handoff::new());
        let putter = {
            let handoff = handoff.clone();
            std::thread::spawn(move || {
                for i in 0..10 {
                    handoff.put(i)?;
                }
                handoff.finish();
                Ok::<_, TransportError>(())
            })
        };
        let mut received = Vec::new();
        while let Some(value) = handoff.take().unwrap() {
            received.push(value);
        }
        putter.join().unwrap().unwrap();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
        assert_eq!(handoff.take().unwrap(), None);
    }

    #[test]
    fn test_close_unblocks_put() {
        let handoff = Arc::new(Handoff::new());
        let putter = {
            let handoff = handoff.clone();
            std::thread::spawn(move || handoff.put("record"))
        };
        std::thread::sleep(Duration::from_millis(20));
        handoff.close();
        assert!(matches!(
            putter.join().unwrap(),
            Err(TransportError::Closed)
        ));
        assert!(matches!(handoff.take(), Err(TransportError::Closed)));
        assert!(handoff.is_closed());
    }

    #[test]
    fn test_finish_keeps_deposited_value() {
        let handoff = Arc::new(Handoff::new());
        let putter = {
            let handoff = handoff.clone();
            std::thread::spawn(move || handoff.put("last"))
        };
        while handoff.lock().value.is_none() {
            std::thread::yield_now();
        }
        handoff.finish();
        assert!(handoff.is_finished());
        assert!(!handoff.is_closed());
        // The putter is still parked on its value until it is taken.
        assert!(!putter.is_finished());
        assert_eq!(handoff.take().unwrap(), Some("last"));
        putter.join().unwrap().unwrap();
        assert_eq!(handoff.take().unwrap(), None);
        assert!(matches!(handoff.put("late"), Err(TransportError::Closed)));
    }

    #[test]
    fn test_close_unblocks_take() {
        let handoff = Arc::new(Handoff::<u8>::new());
        let taker = {
            let handoff = handoff.clone();
            std::thread::spawn(move || handoff.take())
        };
        std::thread::sleep(Duration::from_millis(20));
        handoff.close();
        assert!(matches!(taker.join().unwrap(), Err(TransportError::Closed)));
    }
}
