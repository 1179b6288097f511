/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Helpers shared by the unit tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::ensure;

use crate::config::TransportConfig;
use crate::context::TransportContext;
use crate::event_loop::ConnectionHooks;
use crate::fabric::CmEvent;
use crate::fabric::CmEventKind;
use crate::fabric::CmId;
use crate::fabric::EventChannel;
use crate::fabric::Fabric;
use crate::fabric::WorkCompletion;

const EVENT_WAIT: Duration = Duration::from_secs(5);

/// A configuration with short waits, so that shutdowns are quick.
pub(crate) fn test_config() -> TransportConfig {
    TransportConfig {
        port: 0,
        poll_interval_ms: 20,
        probe_backoff_us: 50,
        ..Default::default()
    }
}

#[derive(Debug, Default)]
struct Recorded {
    completions: Vec<WorkCompletion>,
    faults: Vec<String>,
}

/// Hooks that record what the dispatcher hands them.
#[derive(Debug, Default)]
pub(crate) struct RecordingHooks {
    recorded: Mutex<Recorded>,
    changed: Condvar,
}

impl RecordingHooks {
    fn wait_until(
        &self,
        timeout: Duration,
        done: impl Fn(&Recorded) -> bool,
    ) -> std::sync::MutexGuard<'_, Recorded> {
        let deadline = Instant::now() + timeout;
        let mut recorded = self.recorded.lock().unwrap();
        while !done(&recorded) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            recorded = self.changed.wait_timeout(recorded, deadline - now).unwrap().0;
        }
        recorded
    }

    /// Waits until at least `count` completions arrived, and returns them.
    pub(crate) fn wait_for_completions(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Vec<WorkCompletion> {
        self.wait_until(timeout, |recorded| recorded.completions.len() >= count)
            .completions
            .clone()
    }

    pub(crate) fn wait_for_fault(&self, timeout: Duration) -> Vec<String> {
        self.wait_until(timeout, |recorded| !recorded.faults.is_empty())
            .faults
            .clone()
    }

    pub(crate) fn faults(&self) -> Vec<String> {
        self.recorded.lock().unwrap().faults.clone()
    }
}

impl ConnectionHooks for RecordingHooks {
    fn on_pre_connect(
        &self,
        _context: &Arc<TransportContext>,
        _event: &CmEvent,
    ) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn on_connect(&self, _context: &Arc<TransportContext>, _id: CmId) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn on_completion(
        &self,
        _context: &Arc<TransportContext>,
        wc: &WorkCompletion,
    ) -> Result<(), anyhow::Error> {
        self.recorded.lock().unwrap().completions.push(*wc);
        self.changed.notify_all();
        Ok(())
    }

    fn on_disconnect(
        &self,
        _context: &Arc<TransportContext>,
        _id: CmId,
    ) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn on_fault(&self, message: &str) {
        self.recorded.lock().unwrap().faults.push(message.to_string());
        self.changed.notify_all();
    }
}

fn expect_event(
    fabric: &Arc<dyn Fabric>,
    channel: EventChannel,
    kind: CmEventKind,
) -> Result<CmEvent, anyhow::Error> {
    let event = fabric
        .get_cm_event(channel, EVENT_WAIT)?
        .ok_or_else(|| anyhow!("no event on {:?}, expected {:?}", channel, kind))?;
    ensure!(event.kind == kind, "got {:?}, expected {:?}", event.kind, kind);
    Ok(event)
}

/// Two identifiers connected through a listener, with queue pairs built in
/// `context`. The connection manager is driven by hand.
pub(crate) struct LoopbackPair {
    pub(crate) client: CmId,
    pub(crate) server: CmId,
    listener: CmId,
    client_channel: EventChannel,
    server_channel: EventChannel,
}

pub(crate) fn loopback_pair(
    fabric: &Arc<dyn Fabric>,
    context: &TransportContext,
) -> Result<LoopbackPair, anyhow::Error> {
    let server_channel = fabric.create_event_channel()?;
    let listener = fabric.create_id(server_channel)?;
    fabric.bind_addr(listener, "127.0.0.1:0".parse::<SocketAddr>()?)?;
    fabric.listen(listener, 1)?;
    let addr = fabric.local_addr(listener)?;

    let client_channel = fabric.create_event_channel()?;
    let client = fabric.create_id(client_channel)?;
    fabric.resolve_addr(client, addr, EVENT_WAIT)?;
    expect_event(fabric, client_channel, CmEventKind::AddrResolved)?;
    context.build_queue_pair(client)?;
    fabric.resolve_route(client, EVENT_WAIT)?;
    expect_event(fabric, client_channel, CmEventKind::RouteResolved)?;
    fabric.connect(client, &context.connect_params(Vec::new()))?;

    let server = expect_event(fabric, server_channel, CmEventKind::ConnectRequest)?.id;
    context.build_queue_pair(server)?;
    fabric.accept(server, &context.connect_params(Vec::new()))?;
    expect_event(fabric, server_channel, CmEventKind::Established)?;
    expect_event(fabric, client_channel, CmEventKind::Established)?;

    Ok(LoopbackPair {
        client,
        server,
        listener,
        client_channel,
        server_channel,
    })
}

impl LoopbackPair {
    pub(crate) fn close(self, fabric: &Arc<dyn Fabric>) -> Result<(), anyhow::Error> {
        fabric.destroy_qp(self.client)?;
        fabric.destroy_qp(self.server)?;
        fabric.destroy_id(self.client)?;
        fabric.destroy_id(self.server)?;
        fabric.destroy_id(self.listener)?;
        fabric.destroy_event_channel(self.client_channel)?;
        fabric.destroy_event_channel(self.server_channel)?;
        Ok(())
    }
}
