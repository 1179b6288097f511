/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Errors surfaced at the application boundary, and the fault slot that
//! carries background-thread failures to it.
//!
//! Every failure in the transport is fatal: nothing is retried and nothing is
//! dropped. Failures on the dispatcher or connection-manager threads are
//! recorded once in a [`FaultSlot`]; the bridges they affect are then closed
//! so that blocked and subsequent application calls observe
//! [`TransportError::Faulted`].

use std::sync::Arc;
use std::sync::Mutex;

use crate::fabric::CmEventKind;
use crate::fabric::CmId;
use crate::fabric::WcOpcode;
use crate::fabric::WcStatus;

/// Errors returned by the producer, consumer and server APIs.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The producer backlog has no free slot. The record was not enqueued.
    #[error("producer backlog overflow: all {capacity} slots hold unsent records")]
    BacklogOverflow { capacity: usize },

    /// A key or value contains a byte the wire format reserves.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The serialized record does not fit the length prefix or the
    /// registered buffers.
    #[error("record of {len} bytes exceeds the maximum of {max}")]
    RecordTooLarge { len: usize, max: usize },

    /// The bridge was closed by a shutdown.
    #[error("transport closed")]
    Closed,

    /// A connection arrived on a second fabric device.
    #[error("a second fabric device {requested} was presented; context is bound to {existing}")]
    MultipleDevices { existing: u64, requested: u64 },

    /// The connection manager delivered an event the state machine does not
    /// handle.
    #[error("unknown connection manager event: {0:?}")]
    UnknownEvent(CmEventKind),

    /// A control message or connection private data failed to decode.
    #[error("malformed control message: {0}")]
    MalformedControlMessage(String),

    /// A length prefix read from the peer is neither unwritten nor decimal.
    #[error("malformed length prefix: {0:?}")]
    MalformedPrefix(Vec<u8>),

    /// A work completion finished with a non-success status.
    #[error("work completion {opcode:?} failed with status {status:?}, vendor error {vendor_err}")]
    WorkCompletion {
        status: WcStatus,
        opcode: WcOpcode,
        vendor_err: u32,
    },

    /// Work was posted on a connection that is down or whose queue pair
    /// has been destroyed.
    #[error("{0:?} is not connected")]
    NotConnected(CmId),

    /// The shared log cannot hold another record.
    #[error("shared log full: {needed} bytes needed, {available} available")]
    LogFull { needed: usize, available: usize },

    /// The shared log already carries its end-of-stream marker.
    #[error("shared log is sealed")]
    LogSealed,

    /// A background thread failed; the message is the first recorded failure.
    #[error("transport faulted: {0}")]
    Faulted(String),

    /// A fabric call failed.
    #[error(transparent)]
    Fabric(#[from] anyhow::Error),
}

/// Records the first fatal failure of a transport endpoint.
#[derive(Debug, Clone, Default)]
pub struct FaultSlot {
    fault: Arc<Mutex<Option<String>>>,
    abort_on_fault: bool,
}

impl FaultSlot {
    /// Creates an empty slot. With `abort_on_fault`, recording a fault
    /// terminates the process after logging it.
    pub fn new(abort_on_fault: bool) -> Self {
        Self {
            fault: Arc::new(Mutex::new(None)),
            abort_on_fault,
        }
    }

    /// Records `err` unless a fault is already recorded, and returns the
    /// recorded message.
    pub fn record(&self, err: &anyhow::Error) -> String {
        let message = format!("{:#}", err);
        tracing::error!("fatal transport fault: {}", message);
        if self.abort_on_fault {
            std::process::exit(1);
        }
        let mut fault = self.fault.lock().expect("fault lock poisoned");
        fault.get_or_insert(message).clone()
    }

    /// Returns the recorded fault, if any.
    pub fn get(&self) -> Option<String> {
        self.fault.lock().expect("fault lock poisoned").clone()
    }

    /// Returns `Err(Faulted)` if a fault has been recorded.
    pub fn check(&self) -> Result<(), TransportError> {
        match self.get() {
            Some(message) => Err(TransportError::Faulted(message)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fault_wins() {
        let slot = FaultSlot::new(false);
        assert!(slot.check().is_ok());

        let first = slot.record(&anyhow::anyhow!("cq overrun"));
        assert_eq!(first, "cq overrun");
        let second = slot.record(&anyhow::anyhow!("later failure"));
        assert_eq!(second, "cq overrun");

        match slot.check() {
            Err(TransportError::Faulted(message)) => assert_eq!(message, "cq overrun"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_clones_share_state() {
        let slot = FaultSlot::new(false);
        let clone = slot.clone();
        clone.record(&anyhow::anyhow!("boom").context("posting send"));
        assert_eq!(slot.get().as_deref(), Some("posting send: boom"));
    }

    #[test]
    fn test_typed_errors_survive_anyhow() {
        let err: anyhow::Error = TransportError::LogSealed.into();
        assert!(matches!(
            err.downcast_ref::<TransportError>(),
            Some(TransportError::LogSealed)
        ));
        let wrapped = TransportError::from(anyhow::anyhow!("reg_mr failed"));
        assert_eq!(wrapped.to_string(), "reg_mr failed");
    }
}
