/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A publish/subscribe transport over RDMA.
//!
//! Producers write records into a relay [`Server`] with one-sided writes;
//! consumers pull them out of the server's shared log with one-sided reads.
//! Every endpoint runs its connection manager and its completion dispatcher
//! on background threads; the application sees blocking calls only.
//!
//! The fabric is pluggable. [`fabric::local::LocalFabric`] connects endpoints
//! within one process; with the `verbs` feature, `fabric::verbs::VerbsFabric`
//! drives real hardware through librdmacm and libibverbs.

// RDMA requires frequent unsafe code blocks
#![allow(clippy::undocumented_unsafe_blocks)]

pub mod config;
pub mod consumer;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod fabric;
pub mod logging;
pub mod memory;
pub mod message;
pub mod producer;
pub mod server;
pub mod sync;

pub use config::TransportConfig;
pub use consumer::Consumer;
pub use error::TransportError;
pub use message::Record;
pub use producer::Producer;
pub use server::Server;

#[cfg(test)]
mod pubsub_tests;
#[cfg(test)]
mod test_utils;
