/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The connection-manager event loop.
//!
//! Every endpoint runs one loop on a dedicated thread. The loop takes one
//! event at a time from its event channel and drives the connection state
//! machine:
//!
//! | event             | action                                                |
//! |-------------------|-------------------------------------------------------|
//! | `AddrResolved`    | build the connection, then resolve the route          |
//! | `RouteResolved`   | connect, carrying the role's private data             |
//! | `ConnectRequest`  | build the connection, then accept                     |
//! | `Established`     | [`ConnectionHooks::on_connect`]                       |
//! | `Disconnected`    | destroy the queue pair, `on_disconnect`, destroy the identifier |
//! | anything else     | fatal                                                 |
//!
//! Building a connection acquires the endpoint's [`TransportContext`] for
//! the event's device, creates the queue pair, and runs
//! [`ConnectionHooks::on_pre_connect`].
//!
//! A client loop ends when its single connection disconnects. A server loop
//! runs until its stop flag is raised. Either loop also ends as soon as a
//! fault has been recorded. On the way out the loop stops the dispatcher,
//! tears down whatever connections remain, and shuts the context down.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use anyhow::anyhow;
use anyhow::bail;

use crate::config::TransportConfig;
use crate::consumer::ConsumerRole;
use crate::context::ContextSlot;
use crate::context::TransportContext;
use crate::error::FaultSlot;
use crate::error::TransportError;
use crate::fabric::CmEvent;
use crate::fabric::CmEventKind;
use crate::fabric::CmId;
use crate::fabric::EventChannel;
use crate::fabric::Fabric;
use crate::fabric::WorkCompletion;
use crate::producer::ProducerRole;
use crate::server::ServerRole;

/// Name of the client connection-manager thread.
pub const CLIENT_THREAD_NAME: &str = "fastps-cm-client";
/// Name of the server connection-manager thread.
pub const SERVER_THREAD_NAME: &str = "fastps-cm-server";

/// The callbacks through which the event loop and the dispatcher drive a
/// role. Completions identify their connection by `wr_id`, which every role
/// sets to the connection's [`CmId`].
pub trait ConnectionHooks: Send + Sync + fmt::Debug {
    /// Private data sent with an active connect.
    fn private_data(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Allocates per-connection state. Runs after the queue pair exists and
    /// before the connection is established, so receives may be posted.
    fn on_pre_connect(
        &self,
        context: &Arc<TransportContext>,
        event: &CmEvent,
    ) -> Result<(), anyhow::Error>;

    fn on_connect(&self, context: &Arc<TransportContext>, id: CmId) -> Result<(), anyhow::Error>;

    /// Runs on the dispatcher thread for every successful completion.
    fn on_completion(
        &self,
        context: &Arc<TransportContext>,
        wc: &WorkCompletion,
    ) -> Result<(), anyhow::Error>;

    /// Releases per-connection state. Must tolerate identifiers that never
    /// got that far.
    fn on_disconnect(&self, context: &Arc<TransportContext>, id: CmId) -> Result<(), anyhow::Error>;

    /// Releases state shared across connections, before the context goes.
    fn on_shutdown(&self) {}

    /// Called after a fault has been recorded, to release application
    /// threads blocked on the role.
    fn on_fault(&self, message: &str);
}

/// The behavior an endpoint plays, selected when it is constructed.
#[derive(Debug, Clone)]
pub enum Role {
    Producer(Arc<ProducerRole>),
    Consumer(Arc<ConsumerRole>),
    Server(Arc<ServerRole>),
}

impl Role {
    fn hooks(&self) -> &dyn ConnectionHooks {
        match self {
            Role::Producer(role) => role.as_ref(),
            Role::Consumer(role) => role.as_ref(),
            Role::Server(role) => role.as_ref(),
        }
    }
}

impl ConnectionHooks for Role {
    fn private_data(&self) -> Vec<u8> {
        self.hooks().private_data()
    }

    fn on_pre_connect(
        &self,
        context: &Arc<TransportContext>,
        event: &CmEvent,
    ) -> Result<(), anyhow::Error> {
        self.hooks().on_pre_connect(context, event)
    }

    fn on_connect(&self, context: &Arc<TransportContext>, id: CmId) -> Result<(), anyhow::Error> {
        self.hooks().on_connect(context, id)
    }

    fn on_completion(
        &self,
        context: &Arc<TransportContext>,
        wc: &WorkCompletion,
    ) -> Result<(), anyhow::Error> {
        self.hooks().on_completion(context, wc)
    }

    fn on_disconnect(
        &self,
        context: &Arc<TransportContext>,
        id: CmId,
    ) -> Result<(), anyhow::Error> {
        self.hooks().on_disconnect(context, id)
    }

    fn on_shutdown(&self) {
        self.hooks().on_shutdown()
    }

    fn on_fault(&self, message: &str) {
        self.hooks().on_fault(message)
    }
}

enum Flow {
    Continue,
    Disconnected,
}

/// The state of one endpoint's connection manager.
#[derive(Debug)]
pub struct EventLoop {
    fabric: Arc<dyn Fabric>,
    config: TransportConfig,
    hooks: Arc<dyn ConnectionHooks>,
    fault: FaultSlot,
    contexts: ContextSlot,
    channel: EventChannel,
    listener: Option<(CmId, SocketAddr)>,
    connections: HashSet<CmId>,
}

impl EventLoop {
    fn new(
        fabric: Arc<dyn Fabric>,
        config: TransportConfig,
        hooks: Arc<dyn ConnectionHooks>,
        fault: FaultSlot,
    ) -> Result<Self, anyhow::Error> {
        let channel = fabric.create_event_channel()?;
        let contexts = ContextSlot::new(
            fabric.clone(),
            config.clone(),
            fault.clone(),
            hooks.clone(),
        );
        Ok(Self {
            fabric,
            config,
            hooks,
            fault,
            contexts,
            channel,
            listener: None,
            connections: HashSet::new(),
        })
    }

    /// Creates a loop listening on every address at the configured port.
    pub fn listen(
        fabric: Arc<dyn Fabric>,
        config: TransportConfig,
        hooks: Arc<dyn ConnectionHooks>,
        fault: FaultSlot,
    ) -> Result<Self, anyhow::Error> {
        let mut event_loop = Self::new(fabric, config, hooks, fault)?;
        let bound = event_loop.bind_listener();
        if let Err(err) = bound {
            event_loop.teardown();
            return Err(err);
        }
        Ok(event_loop)
    }

    fn bind_listener(&mut self) -> Result<(), anyhow::Error> {
        let any = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), self.config.port);
        let id = self.fabric.create_id(self.channel)?;
        // Recorded before binding so that teardown releases it.
        self.listener = Some((id, any));
        self.fabric.bind_addr(id, any)?;
        self.fabric.listen(id, self.config.listen_backlog)?;
        let addr = self.fabric.local_addr(id)?;
        self.listener = Some((id, addr));
        tracing::info!("listening on port {}", addr.port());
        Ok(())
    }

    /// The address the listener is bound to, if this is a server loop.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.map(|(_, addr)| addr)
    }

    pub fn contexts(&self) -> &ContextSlot {
        &self.contexts
    }

    fn context(&self) -> Result<Arc<TransportContext>, anyhow::Error> {
        self.contexts
            .get()
            .ok_or_else(|| anyhow!("connection event before any connection was built"))
    }

    fn build_connection(&mut self, event: &CmEvent) -> Result<(), anyhow::Error> {
        let device = event
            .device
            .ok_or_else(|| anyhow!("{:?} on {:?} carries no device", event.kind, event.id))?;
        let context = self.contexts.acquire(device)?;
        context.build_queue_pair(event.id)?;
        self.connections.insert(event.id);
        self.hooks.on_pre_connect(&context, event)
    }

    fn handle(&mut self, event: &CmEvent) -> Result<Flow, anyhow::Error> {
        tracing::debug!("{:?} on {:?}", event.kind, event.id);
        match event.kind {
            CmEventKind::AddrResolved => {
                self.build_connection(event)?;
                self.fabric
                    .resolve_route(event.id, self.config.resolve_timeout())?;
            }
            CmEventKind::RouteResolved => {
                let params = self.context()?.connect_params(self.hooks.private_data());
                self.fabric.connect(event.id, &params)?;
            }
            CmEventKind::ConnectRequest => {
                self.build_connection(event)?;
                let params = self.context()?.connect_params(Vec::new());
                self.fabric.accept(event.id, &params)?;
            }
            CmEventKind::Established => {
                self.hooks.on_connect(&self.context()?, event.id)?;
            }
            CmEventKind::Disconnected => {
                let context = self.context()?;
                self.fabric.destroy_qp(event.id)?;
                self.hooks.on_disconnect(&context, event.id)?;
                self.fabric.destroy_id(event.id)?;
                self.connections.remove(&event.id);
                return Ok(Flow::Disconnected);
            }
            CmEventKind::AddrError
            | CmEventKind::RouteError
            | CmEventKind::ConnectError
            | CmEventKind::Unreachable
            | CmEventKind::Rejected => {
                bail!(
                    "connection failed: {:?} (status {})",
                    event.kind,
                    event.status
                );
            }
            other => return Err(TransportError::UnknownEvent(other).into()),
        }
        Ok(Flow::Continue)
    }

    fn next_event(&self) -> Result<Option<CmEvent>, anyhow::Error> {
        self.fabric
            .get_cm_event(self.channel, self.config.poll_interval())
    }

    fn run_client(&mut self, server: SocketAddr) -> Result<(), anyhow::Error> {
        let id = self.fabric.create_id(self.channel)?;
        self.connections.insert(id);
        tracing::debug!("resolving {}", server);
        self.fabric
            .resolve_addr(id, server, self.config.resolve_timeout())?;
        while self.fault.get().is_none() {
            let Some(event) = self.next_event()? else {
                continue;
            };
            if let Flow::Disconnected = self.handle(&event)? {
                break;
            }
        }
        Ok(())
    }

    fn run_server(&mut self, stop: &AtomicBool) -> Result<(), anyhow::Error> {
        while !stop.load(Ordering::SeqCst) && self.fault.get().is_none() {
            let Some(event) = self.next_event()? else {
                continue;
            };
            self.handle(&event)?;
        }
        Ok(())
    }

    fn record_fault(&self, result: Result<(), anyhow::Error>) {
        if let Err(err) = result {
            let message = self.fault.record(&err);
            self.hooks.on_fault(&message);
        }
    }

    /// Releases everything the loop still holds. Failures are logged; the
    /// first one becomes the endpoint's fault unless one is recorded.
    fn teardown(&mut self) {
        let context = self.contexts.take();
        let mut failures = Vec::new();
        if let Some(context) = &context {
            failures.extend(context.stop_dispatcher().err());
        }
        for id in std::mem::take(&mut self.connections) {
            failures.extend(self.fabric.disconnect(id).err());
            failures.extend(self.fabric.destroy_qp(id).err());
            if let Some(context) = &context {
                failures.extend(self.hooks.on_disconnect(context, id).err());
            }
            failures.extend(self.fabric.destroy_id(id).err());
        }
        if let Some((id, _)) = self.listener.take() {
            failures.extend(self.fabric.destroy_id(id).err());
        }
        self.hooks.on_shutdown();
        if let Some(context) = &context {
            failures.extend(context.shutdown().err());
        }
        failures.extend(self.fabric.destroy_event_channel(self.channel).err());

        for failure in &failures {
            tracing::warn!("teardown: {:#}", failure);
        }
        if self.fault.get().is_none() {
            if let Some(first) = failures.into_iter().next() {
                self.record_fault(Err(first));
            }
        }
    }
}

/// Resolves `server` to a socket address. A bare host name or address uses
/// `port`; an explicit `host:port` overrides it.
pub fn resolve_server(server: &str, port: u16) -> Result<SocketAddr, anyhow::Error> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    (server, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("{} did not resolve to any address", server))
}

/// Starts a client loop connecting to `server` on its own thread. The
/// thread exits once the connection is disconnected, or on a fault.
pub fn spawn_client(
    fabric: Arc<dyn Fabric>,
    config: TransportConfig,
    server: SocketAddr,
    hooks: Arc<dyn ConnectionHooks>,
    fault: FaultSlot,
) -> Result<JoinHandle<()>, anyhow::Error> {
    let mut event_loop = EventLoop::new(fabric, config, hooks, fault)?;
    let handle = std::thread::Builder::new()
        .name(CLIENT_THREAD_NAME.to_string())
        .spawn(move || {
            let result = event_loop.run_client(server);
            event_loop.record_fault(result);
            event_loop.teardown();
        })?;
    Ok(handle)
}

/// Runs a listening loop on its own thread until `stop` is raised.
pub fn spawn_server(
    mut event_loop: EventLoop,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, anyhow::Error> {
    let handle = std::thread::Builder::new()
        .name(SERVER_THREAD_NAME.to_string())
        .spawn(move || {
            let result = event_loop.run_server(&stop);
            event_loop.record_fault(result);
            event_loop.teardown();
        })?;
    Ok(handle)
}
