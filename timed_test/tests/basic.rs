/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::thread::sleep;
use std::time::Duration;

use timed_test::timed_test;

#[timed_test(timeout_secs = 5)]
fn good() {
    sleep(Duration::from_millis(200));
}

#[timed_test(timeout_secs = 5)]
fn good_with_result() -> Result<(), String> {
    sleep(Duration::from_millis(200));
    Ok(())
}

#[timed_test(timeout_secs = 1)]
#[should_panic(expected = "test timed out")]
fn bad() {
    sleep(Duration::from_secs(3));
}

#[timed_test(timeout_secs = 5)]
#[should_panic(expected = "boom")]
fn panics_propagate() {
    panic!("boom");
}
