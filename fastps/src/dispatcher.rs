/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The completion dispatcher.
//!
//! One thread per context blocks on the completion channel. For every
//! notification it acknowledges the event, re-arms the queue, and only then
//! drains it, so a completion that lands during the drain raises a fresh
//! notification instead of being stranded. Each completion is handed to the
//! role's [`ConnectionHooks::on_completion`]; a completion with any status
//! other than success is fatal.
//!
//! The dispatcher is the only thread that advances protocol state. The
//! channel wait is bounded by `poll_interval_ms` so that a context shutdown
//! is noticed.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::context::TransportContext;
use crate::error::TransportError;
use crate::event_loop::ConnectionHooks;

/// Name of the dispatcher thread.
pub const DISPATCHER_THREAD_NAME: &str = "fastps-cq-dispatch";

pub(crate) fn spawn_dispatcher(
    context: Arc<TransportContext>,
    hooks: Arc<dyn ConnectionHooks>,
) -> Result<JoinHandle<()>, anyhow::Error> {
    let handle = std::thread::Builder::new()
        .name(DISPATCHER_THREAD_NAME.to_string())
        .spawn(move || {
            if let Err(err) = run_dispatcher(&context, hooks.as_ref()) {
                let message = context.fault().record(&err);
                hooks.on_fault(&message);
            }
            tracing::debug!("completion dispatcher for {:?} exiting", context.device());
        })?;
    Ok(handle)
}

/// Runs the dispatch loop on the calling thread until the context stops or
/// a completion fails.
pub fn run_dispatcher(
    context: &Arc<TransportContext>,
    hooks: &dyn ConnectionHooks,
) -> Result<(), anyhow::Error> {
    let fabric = context.fabric();
    let wait = context.config().poll_interval();
    while !context.is_stopping() {
        let Some(cq) = fabric.get_cq_event(context.comp_channel(), wait)? else {
            continue;
        };
        fabric.ack_cq_events(cq, 1)?;
        fabric.req_notify_cq(cq)?;

        while let Some(wc) = fabric.poll_cq(cq)? {
            if !wc.is_success() {
                return Err(TransportError::WorkCompletion {
                    status: wc.status,
                    opcode: wc.opcode,
                    vendor_err: wc.vendor_err,
                }
                .into());
            }
            tracing::trace!(
                "completion {:?} on wr {} ({} bytes)",
                wc.opcode,
                wc.wr_id,
                wc.byte_len
            );
            hooks.on_completion(context, &wc)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::FaultSlot;
    use crate::fabric::AccessFlags;
    use crate::fabric::Fabric;
    use crate::fabric::RecvRequest;
    use crate::fabric::SendOp;
    use crate::fabric::SendRequest;
    use crate::fabric::WcOpcode;
    use crate::fabric::local::LOCAL_DEVICE;
    use crate::fabric::local::LocalFabric;
    use crate::test_utils::RecordingHooks;
    use crate::test_utils::loopback_pair;
    use crate::test_utils::test_config;

    const WAIT: Duration = Duration::from_secs(5);

    fn context_with(
        fabric: &Arc<dyn Fabric>,
        hooks: &Arc<RecordingHooks>,
    ) -> Result<Arc<TransportContext>, anyhow::Error> {
        TransportContext::create(
            fabric.clone(),
            LOCAL_DEVICE,
            test_config(),
            FaultSlot::new(false),
            hooks.clone(),
        )
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_dispatches_completions() -> Result<(), anyhow::Error> {
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let hooks = Arc::new(RecordingHooks::default());
        let context = context_with(&fabric, &hooks)?;
        let pair = loopback_pair(&fabric, &context)?;

        let source = context.register_buffer(16, AccessFlags::empty())?;
        let target = context.register_buffer(16, AccessFlags::LOCAL_WRITE)?;
        source.write_at(0, b"ping")?;
        fabric.post_recv(
            pair.server,
            &RecvRequest {
                wr_id: 2,
                local: Some(target.sge(0, 16)?),
            },
        )?;
        fabric.post_send(
            pair.client,
            &SendRequest {
                wr_id: 1,
                op: SendOp::Send,
                local: Some(source.sge(0, 4)?),
            },
        )?;

        let completions = hooks.wait_for_completions(2, WAIT);
        assert_eq!(completions.len(), 2);
        let recv = completions.iter().find(|wc| wc.wr_id == 2).unwrap();
        assert_eq!(recv.opcode, WcOpcode::Recv);
        assert_eq!(recv.byte_len, 4);
        assert!(completions.iter().any(|wc| wc.wr_id == 1 && wc.opcode == WcOpcode::Send));
        assert_eq!(target.read_at(0, 4)?, b"ping");

        // A second exchange needs the queue to have been re-armed.
        fabric.post_recv(
            pair.server,
            &RecvRequest {
                wr_id: 4,
                local: Some(target.sge(0, 16)?),
            },
        )?;
        fabric.post_send(
            pair.client,
            &SendRequest {
                wr_id: 3,
                op: SendOp::Send,
                local: Some(source.sge(0, 4)?),
            },
        )?;
        assert_eq!(hooks.wait_for_completions(4, WAIT).len(), 4);
        assert!(hooks.faults().is_empty());

        context.stop_dispatcher()?;
        drop((source, target));
        pair.close(&fabric)?;
        context.shutdown()?;
        Ok(())
    }

    #[timed_test::timed_test(timeout_secs = 30)]
    fn test_failed_completion_is_fatal() -> Result<(), anyhow::Error> {
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let hooks = Arc::new(RecordingHooks::default());
        let context = context_with(&fabric, &hooks)?;
        let pair = loopback_pair(&fabric, &context)?;

        let source = context.register_buffer(16, AccessFlags::empty())?;
        let target = context.register_buffer(16, AccessFlags::LOCAL_WRITE)?;
        // The receive is shorter than the message.
        fabric.post_recv(
            pair.server,
            &RecvRequest {
                wr_id: 2,
                local: Some(target.sge(0, 2)?),
            },
        )?;
        fabric.post_send(
            pair.client,
            &SendRequest {
                wr_id: 1,
                op: SendOp::Send,
                local: Some(source.sge(0, 8)?),
            },
        )?;

        let faults = hooks.wait_for_fault(WAIT);
        assert_eq!(faults.len(), 1);
        assert!(faults[0].contains("LocalLength"), "{}", faults[0]);
        assert_eq!(context.fault().get(), Some(faults[0].clone()));

        context.stop_dispatcher()?;
        drop((source, target));
        pair.close(&fabric)?;
        context.shutdown()?;
        Ok(())
    }
}
