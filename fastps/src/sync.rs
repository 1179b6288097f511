/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Blocking rendezvous between application threads and the completion
//! dispatcher.

pub mod backlog;
pub mod flag;
pub mod handoff;
