/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A one-shot flag that threads can block on.
//!
//! ```
//! # use fastps::sync::flag;
//! # use std::time::Duration;
//! let (flag, guard) = flag::guarded();
//! assert!(!flag.signalled());
//! std::thread::spawn(move || drop(guard));
//! assert!(flag.wait_timeout(Duration::from_secs(5)));
//! ```

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// Create a new guarded flag. The flag is set when the guard is dropped.
pub fn guarded() -> (Flag, Guard) {
    let state = Arc::new(State::default());
    (Flag(Arc::clone(&state)), Guard(state))
}

#[derive(Debug, Default)]
struct State {
    flagged: Mutex<bool>,
    changed: Condvar,
}

impl State {
    fn set(&self) {
        *self.flagged.lock().expect("flag lock poisoned") = true;
        self.changed.notify_all();
    }
}

/// A flag indicating that an event occurred.
#[derive(Debug, Clone)]
pub struct Flag(Arc<State>);

impl Flag {
    /// Returns true if the flag has been set.
    pub fn signalled(&self) -> bool {
        *self.0.flagged.lock().expect("flag lock poisoned")
    }

    /// Blocks until the flag is set or `timeout` elapses. Returns whether
    /// the flag is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flagged = self.0.flagged.lock().expect("flag lock poisoned");
        while !*flagged {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            flagged = self
                .0
                .changed
                .wait_timeout(flagged, deadline - now)
                .expect("flag lock poisoned")
                .0;
        }
        true
    }
}

/// Sets the flag when dropped.
#[derive(Debug)]
pub struct Guard(Arc<State>);

impl Guard {
    /// Sets the flag now.
    pub fn signal(self) {}
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.0.set();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic() {
        let (flag, guard) = guarded();
        assert!(!flag.signalled());
        assert!(!flag.wait_timeout(Duration::from_millis(10)));

        guard.signal();
        assert!(flag.signalled());
        assert!(flag.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn test_wakes_waiter() {
        let (flag, guard) = guarded();
        let waiter = {
            let flag = flag.clone();
            std::thread::spawn(move || flag.wait_timeout(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(waiter.join().unwrap());
    }
}
