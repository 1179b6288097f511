/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Tracing subscriber setup for binaries and tests embedding the transport.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "FASTPS_LOG";

const DEFAULT_FILTER: &str = "info";

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Installs a global fmt subscriber writing to stderr, filtered by
/// `FASTPS_LOG` (default `info`). Does nothing if a global subscriber is
/// already installed.
pub fn initialize_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(DEFAULT_FILTER))
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init();
}

/// Like [`initialize_logging`], but captured by the test harness and
/// defaulting to `debug`.
pub fn initialize_logging_for_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("debug"))
        .with_test_writer()
        .with_thread_names(true)
        .try_init();
}
