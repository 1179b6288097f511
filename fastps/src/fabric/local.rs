/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A loopback fabric living inside one process.
//!
//! `LocalFabric` implements the connection manager and the verbs subset the
//! transport uses with plain memory copies, so that a server and any number
//! of producers and consumers can run as threads of a single test binary.
//! It keeps the semantics the protocols depend on:
//!
//! * a two-sided send, or a write with immediate data, waits in the peer's
//!   inbound queue until the peer posts a receive (an unlimited RNR retry);
//! * one-sided reads and writes are checked against registered regions and
//!   fail with `RemoteAccess` on a bad rkey, bound or permission;
//! * a completion queue raises one channel event per `req_notify_cq`;
//! * disconnecting flushes posted receives with `WrFlush`;
//! * destroying a connect request before accepting it, or the listener it
//!   arrived on, rejects the connecting side.
//!
//! All state sits behind one mutex; one condition variable wakes threads
//! blocked in `get_cm_event` and `get_cq_event`.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::ensure;

use crate::error::TransportError;
use crate::fabric::AccessFlags;
use crate::fabric::CmEvent;
use crate::fabric::CmEventKind;
use crate::fabric::CmId;
use crate::fabric::CompChannel;
use crate::fabric::CompletionQueue;
use crate::fabric::ConnectParams;
use crate::fabric::DeviceId;
use crate::fabric::EventChannel;
use crate::fabric::Fabric;
use crate::fabric::MemoryRegistration;
use crate::fabric::MrHandle;
use crate::fabric::ProtectionDomain;
use crate::fabric::QpCapabilities;
use crate::fabric::RecvRequest;
use crate::fabric::RemoteRegion;
use crate::fabric::SendOp;
use crate::fabric::SendRequest;
use crate::fabric::Sge;
use crate::fabric::WcOpcode;
use crate::fabric::WcStatus;
use crate::fabric::WorkCompletion;
use crate::memory::load_bytes;
use crate::memory::store_bytes;

/// The single device every local identifier binds to.
pub const LOCAL_DEVICE: DeviceId = DeviceId(1);

const FIRST_EPHEMERAL_PORT: u16 = 40000;
const MAX_PRIVATE_DATA: usize = 56;

#[derive(Debug)]
struct IdState {
    channel: EventChannel,
    bound: Option<SocketAddr>,
    dst: Option<SocketAddr>,
    listening: bool,
    peer: Option<CmId>,
    connected: bool,
    /// Set on a connect request's identifier until it is accepted.
    awaiting_accept: bool,
    /// The listener a connect request arrived on.
    listener: Option<CmId>,
    qp: Option<QpState>,
}

impl IdState {
    fn new(channel: EventChannel) -> Self {
        Self {
            channel,
            bound: None,
            dst: None,
            listening: false,
            peer: None,
            connected: false,
            awaiting_accept: false,
            listener: None,
            qp: None,
        }
    }
}

#[derive(Debug)]
struct QpState {
    cq: CompletionQueue,
    caps: QpCapabilities,
    recvs: VecDeque<RecvRequest>,
    inbound: VecDeque<Inbound>,
}

/// A message waiting for the receiver to post a receive.
#[derive(Debug)]
struct Inbound {
    data: Vec<u8>,
    write_to: Option<RemoteRegion>,
    imm: Option<u32>,
    sender: CmId,
    sender_wr_id: u64,
}

#[derive(Debug)]
struct CqState {
    channel: CompChannel,
    capacity: usize,
    armed: bool,
    entries: VecDeque<WorkCompletion>,
}

#[derive(Debug, Clone, Copy)]
struct MrState {
    addr: usize,
    length: usize,
    access: AccessFlags,
    lkey: u32,
    rkey: u32,
}

impl MrState {
    fn covers(&self, addr: u64, len: usize) -> bool {
        let start = self.addr as u64;
        let end = start + self.length as u64;
        addr >= start && addr + len as u64 <= end
    }
}

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    next_port: u16,
    event_channels: HashMap<EventChannel, VecDeque<CmEvent>>,
    ids: HashMap<CmId, IdState>,
    listeners: HashMap<u16, CmId>,
    pds: HashMap<ProtectionDomain, DeviceId>,
    comp_channels: HashMap<CompChannel, VecDeque<CompletionQueue>>,
    cqs: HashMap<CompletionQueue, CqState>,
    mrs: HashMap<MrHandle, MrState>,
}

impl State {
    fn alloc_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn alloc_port(&mut self) -> u16 {
        if self.next_port < FIRST_EPHEMERAL_PORT {
            self.next_port = FIRST_EPHEMERAL_PORT;
        }
        while self.listeners.contains_key(&self.next_port) {
            self.next_port = self.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
        }
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
        port
    }

    fn id(&self, id: CmId) -> Result<&IdState, anyhow::Error> {
        self.ids
            .get(&id)
            .ok_or_else(|| anyhow!("unknown cm id {:?}", id))
    }

    fn id_mut(&mut self, id: CmId) -> Result<&mut IdState, anyhow::Error> {
        self.ids
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown cm id {:?}", id))
    }

    fn qp_mut(&mut self, id: CmId) -> Result<&mut QpState, anyhow::Error> {
        self.id_mut(id)?
            .qp
            .as_mut()
            .ok_or_else(|| anyhow!("no queue pair on {:?}", id))
    }

    fn push_event(&mut self, channel: EventChannel, event: CmEvent) {
        match self.event_channels.get_mut(&channel) {
            Some(queue) => queue.push_back(event),
            None => tracing::debug!(
                "dropping {:?} for destroyed channel {:?}",
                event.kind,
                channel
            ),
        }
    }

    fn event(kind: CmEventKind, id: CmId) -> CmEvent {
        CmEvent {
            kind,
            id,
            listen_id: None,
            device: None,
            private_data: Vec::new(),
            status: 0,
        }
    }

    fn reject(&mut self, id: CmId) {
        let Some(state) = self.ids.get_mut(&id) else {
            return;
        };
        state.peer = None;
        let channel = state.channel;
        let mut event = Self::event(CmEventKind::Rejected, id);
        event.status = -libc::ECONNREFUSED;
        self.push_event(channel, event);
    }

    /// Rejects the connecting side of `request` if it was never accepted.
    fn abandon_request(&mut self, request: CmId) {
        let Some(state) = self.ids.get_mut(&request) else {
            return;
        };
        if !std::mem::take(&mut state.awaiting_accept) {
            return;
        }
        if let Some(peer) = state.peer.take() {
            tracing::debug!("{:?} destroyed before accept; rejecting {:?}", request, peer);
            self.reject(peer);
        }
    }

    /// Queues a completion for the work request `wr_id` posted on `id`.
    fn complete(
        &mut self,
        id: CmId,
        wr_id: u64,
        status: WcStatus,
        opcode: WcOpcode,
        byte_len: usize,
        imm: Option<u32>,
    ) {
        let Some(cq) = self
            .ids
            .get(&id)
            .and_then(|state| state.qp.as_ref())
            .map(|qp| qp.cq)
        else {
            tracing::debug!("dropping completion of wr {} on torn down {:?}", wr_id, id);
            return;
        };
        let Some(cq_state) = self.cqs.get_mut(&cq) else {
            return;
        };
        if cq_state.entries.len() >= cq_state.capacity {
            tracing::warn!("{:?} overrun: {} entries pending", cq, cq_state.entries.len());
        }
        cq_state.entries.push_back(WorkCompletion {
            wr_id,
            status,
            opcode,
            byte_len: byte_len as u32,
            imm,
            vendor_err: 0,
        });
        if cq_state.armed {
            cq_state.armed = false;
            let channel = cq_state.channel;
            if let Some(events) = self.comp_channels.get_mut(&channel) {
                events.push_back(cq);
            }
        }
    }

    fn local_mr(&self, sge: &Sge, need: AccessFlags) -> Option<MrState> {
        self.mrs
            .values()
            .find(|mr| {
                mr.lkey == sge.lkey
                    && mr.access.contains(need)
                    && mr.covers(sge.addr, sge.length as usize)
            })
            .copied()
    }

    fn remote_mr(&self, remote: &RemoteRegion, len: usize, need: AccessFlags) -> Option<MrState> {
        self.mrs
            .values()
            .find(|mr| {
                mr.rkey == remote.rkey && mr.access.contains(need) && mr.covers(remote.addr, len)
            })
            .copied()
    }

    /// Matches queued inbound messages on `id` with its posted receives.
    fn deliver(&mut self, id: CmId) {
        loop {
            let Some(qp) = self.ids.get_mut(&id).and_then(|state| state.qp.as_mut()) else {
                return;
            };
            if qp.recvs.is_empty() || qp.inbound.is_empty() {
                return;
            }
            let (Some(recv), Some(message)) = (qp.recvs.pop_front(), qp.inbound.pop_front())
            else {
                return;
            };
            match message.write_to {
                Some(remote) => self.deliver_write_with_imm(id, recv, message, remote),
                None => self.deliver_send(id, recv, message),
            }
        }
    }

    fn deliver_send(&mut self, id: CmId, recv: RecvRequest, message: Inbound) {
        let len = message.data.len();
        let capacity = recv.local.map(|sge| sge.length as usize).unwrap_or(0);
        if len > capacity {
            self.complete(id, recv.wr_id, WcStatus::LocalLength, WcOpcode::Recv, 0, None);
            self.complete(
                message.sender,
                message.sender_wr_id,
                WcStatus::RemoteInvalidRequest,
                WcOpcode::Send,
                0,
                None,
            );
            return;
        }
        if let Some(sge) = recv.local.filter(|_| len > 0) {
            if self.local_mr(&sge, AccessFlags::LOCAL_WRITE).is_none() {
                self.complete(id, recv.wr_id, WcStatus::LocalProtection, WcOpcode::Recv, 0, None);
                self.complete(
                    message.sender,
                    message.sender_wr_id,
                    WcStatus::RemoteOperation,
                    WcOpcode::Send,
                    0,
                    None,
                );
                return;
            }
            // SAFETY: the receive entry was just checked against a live
            // registration.
            unsafe { store_bytes(sge.addr, &message.data) };
        }
        self.complete(id, recv.wr_id, WcStatus::Success, WcOpcode::Recv, len, None);
        self.complete(
            message.sender,
            message.sender_wr_id,
            WcStatus::Success,
            WcOpcode::Send,
            len,
            None,
        );
    }

    fn deliver_write_with_imm(
        &mut self,
        id: CmId,
        recv: RecvRequest,
        message: Inbound,
        remote: RemoteRegion,
    ) {
        let len = message.data.len();
        if len > 0 {
            if self
                .remote_mr(&remote, len, AccessFlags::REMOTE_WRITE)
                .is_none()
            {
                // The receive is not consumed by a rejected write.
                if let Ok(qp) = self.qp_mut(id) {
                    qp.recvs.push_front(recv);
                }
                self.complete(
                    message.sender,
                    message.sender_wr_id,
                    WcStatus::RemoteAccess,
                    WcOpcode::RdmaWrite,
                    0,
                    None,
                );
                return;
            }
            // SAFETY: the target range was just checked against a live
            // registration.
            unsafe { store_bytes(remote.addr, &message.data) };
        }
        self.complete(
            id,
            recv.wr_id,
            WcStatus::Success,
            WcOpcode::RecvRdmaWithImm,
            len,
            message.imm,
        );
        self.complete(
            message.sender,
            message.sender_wr_id,
            WcStatus::Success,
            WcOpcode::RdmaWrite,
            len,
            None,
        );
    }

    /// Completes every posted receive on `id` with `WrFlush`.
    fn flush(&mut self, id: CmId) {
        let (recvs, inbound) = match self.ids.get_mut(&id).and_then(|state| state.qp.as_mut()) {
            Some(qp) => (
                std::mem::take(&mut qp.recvs),
                std::mem::take(&mut qp.inbound),
            ),
            None => return,
        };
        for recv in recvs {
            self.complete(id, recv.wr_id, WcStatus::WrFlush, WcOpcode::Recv, 0, None);
        }
        for message in inbound {
            let opcode = match message.write_to {
                Some(_) => WcOpcode::RdmaWrite,
                None => WcOpcode::Send,
            };
            self.complete(
                message.sender,
                message.sender_wr_id,
                WcStatus::WrFlush,
                opcode,
                0,
                None,
            );
        }
    }

    fn disconnect(&mut self, id: CmId) -> Result<(), anyhow::Error> {
        let state = self.id(id)?;
        if !state.connected {
            return Ok(());
        }
        let peer = state.peer;
        for side in std::iter::once(id).chain(peer) {
            let Some(side_state) = self.ids.get_mut(&side) else {
                continue;
            };
            side_state.connected = false;
            let channel = side_state.channel;
            self.flush(side);
            self.push_event(channel, Self::event(CmEventKind::Disconnected, side));
        }
        Ok(())
    }
}

/// An in-process loopback fabric. See the module documentation.
#[derive(Debug, Default)]
pub struct LocalFabric {
    state: Mutex<State>,
    changed: Condvar,
}

impl LocalFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("local fabric lock poisoned")
    }

    /// Runs `f` on the locked state and wakes every waiter.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut State) -> Result<T, anyhow::Error>,
    ) -> Result<T, anyhow::Error> {
        let mut state = self.lock();
        let result = f(&mut *state);
        drop(state);
        self.changed.notify_all();
        result
    }

    /// Blocks until `take` yields a value or `wait` elapses.
    fn wait_for<T>(
        &self,
        wait: Duration,
        mut take: impl FnMut(&mut State) -> Result<Option<T>, anyhow::Error>,
    ) -> Result<Option<T>, anyhow::Error> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock();
        loop {
            if let Some(value) = take(&mut *state)? {
                return Ok(Some(value));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .expect("local fabric lock poisoned")
                .0;
        }
    }
}

impl Fabric for LocalFabric {
    fn create_event_channel(&self) -> Result<EventChannel, anyhow::Error> {
        self.update(|state| {
            let channel = EventChannel(state.alloc_handle());
            state.event_channels.insert(channel, VecDeque::new());
            Ok(channel)
        })
    }

    fn destroy_event_channel(&self, channel: EventChannel) -> Result<(), anyhow::Error> {
        self.update(|state| {
            state
                .event_channels
                .remove(&channel)
                .map(|_| ())
                .ok_or_else(|| anyhow!("unknown event channel {:?}", channel))
        })
    }

    fn create_id(&self, channel: EventChannel) -> Result<CmId, anyhow::Error> {
        self.update(|state| {
            ensure!(
                state.event_channels.contains_key(&channel),
                "unknown event channel {:?}",
                channel
            );
            let id = CmId(state.alloc_handle());
            state.ids.insert(id, IdState::new(channel));
            Ok(id)
        })
    }

    fn destroy_id(&self, id: CmId) -> Result<(), anyhow::Error> {
        self.update(|state| {
            state.disconnect(id)?;
            state.abandon_request(id);
            let removed = state
                .ids
                .remove(&id)
                .ok_or_else(|| anyhow!("unknown cm id {:?}", id))?;
            if removed.listening {
                if let Some(port) = removed.bound.map(|addr| addr.port()) {
                    state.listeners.remove(&port);
                }
                // Requests nobody will accept go with their listener.
                let orphans: Vec<CmId> = state
                    .ids
                    .iter()
                    .filter(|(_, child)| child.awaiting_accept && child.listener == Some(id))
                    .map(|(child, _)| *child)
                    .collect();
                for child in orphans {
                    state.abandon_request(child);
                    state.ids.remove(&child);
                }
            }
            Ok(())
        })
    }

    fn resolve_addr(
        &self,
        id: CmId,
        dst: SocketAddr,
        _timeout: Duration,
    ) -> Result<(), anyhow::Error> {
        self.update(|state| {
            let id_state = state.id_mut(id)?;
            id_state.dst = Some(dst);
            let channel = id_state.channel;
            let mut event = State::event(CmEventKind::AddrResolved, id);
            event.device = Some(LOCAL_DEVICE);
            state.push_event(channel, event);
            Ok(())
        })
    }

    fn resolve_route(&self, id: CmId, _timeout: Duration) -> Result<(), anyhow::Error> {
        self.update(|state| {
            let id_state = state.id(id)?;
            ensure!(
                id_state.dst.is_some(),
                "route resolution before address resolution on {:?}",
                id
            );
            let channel = id_state.channel;
            let mut event = State::event(CmEventKind::RouteResolved, id);
            event.device = Some(LOCAL_DEVICE);
            state.push_event(channel, event);
            Ok(())
        })
    }

    fn bind_addr(&self, id: CmId, addr: SocketAddr) -> Result<(), anyhow::Error> {
        self.update(|state| {
            let port = match addr.port() {
                0 => state.alloc_port(),
                port => {
                    ensure!(!state.listeners.contains_key(&port), "address {} in use", addr);
                    port
                }
            };
            state.id_mut(id)?.bound = Some(SocketAddr::new(addr.ip(), port));
            Ok(())
        })
    }

    fn listen(&self, id: CmId, _backlog: i32) -> Result<(), anyhow::Error> {
        self.update(|state| {
            let addr = state
                .id(id)?
                .bound
                .ok_or_else(|| anyhow!("listen on unbound {:?}", id))?;
            ensure!(
                !state.listeners.contains_key(&addr.port()),
                "address {} in use",
                addr
            );
            state.listeners.insert(addr.port(), id);
            state.id_mut(id)?.listening = true;
            Ok(())
        })
    }

    fn local_addr(&self, id: CmId) -> Result<SocketAddr, anyhow::Error> {
        self.lock()
            .id(id)?
            .bound
            .ok_or_else(|| anyhow!("{:?} is not bound", id))
    }

    fn connect(&self, id: CmId, params: &ConnectParams) -> Result<(), anyhow::Error> {
        ensure!(
            params.private_data.len() <= MAX_PRIVATE_DATA,
            "private data of {} bytes exceeds {}",
            params.private_data.len(),
            MAX_PRIVATE_DATA
        );
        self.update(|state| {
            let id_state = state.id(id)?;
            ensure!(id_state.qp.is_some(), "connect without a queue pair on {:?}", id);
            let dst = id_state
                .dst
                .ok_or_else(|| anyhow!("connect before address resolution on {:?}", id))?;

            let Some(&listen_id) = state.listeners.get(&dst.port()) else {
                state.reject(id);
                return Ok(());
            };
            let listener = state.id(listen_id)?;
            let listen_channel = listener.channel;
            let mut child_state = IdState::new(listen_channel);
            child_state.bound = listener.bound;
            child_state.peer = Some(id);
            child_state.awaiting_accept = true;
            child_state.listener = Some(listen_id);

            let child = CmId(state.alloc_handle());
            state.ids.insert(child, child_state);
            state.id_mut(id)?.peer = Some(child);
            state.push_event(
                listen_channel,
                CmEvent {
                    kind: CmEventKind::ConnectRequest,
                    id: child,
                    listen_id: Some(listen_id),
                    device: Some(LOCAL_DEVICE),
                    private_data: params.private_data.clone(),
                    status: 0,
                },
            );
            Ok(())
        })
    }

    fn accept(&self, id: CmId, _params: &ConnectParams) -> Result<(), anyhow::Error> {
        self.update(|state| {
            let child = state.id(id)?;
            ensure!(child.qp.is_some(), "accept without a queue pair on {:?}", id);
            let peer = child
                .peer
                .ok_or_else(|| anyhow!("accept on {:?} without a connect request", id))?;
            let child_channel = child.channel;
            let peer_state = state
                .ids
                .get_mut(&peer)
                .ok_or_else(|| anyhow!("peer of {:?} went away", id))?;
            peer_state.connected = true;
            let peer_channel = peer_state.channel;
            let child = state.id_mut(id)?;
            child.connected = true;
            child.awaiting_accept = false;
            state.push_event(child_channel, State::event(CmEventKind::Established, id));
            state.push_event(peer_channel, State::event(CmEventKind::Established, peer));
            Ok(())
        })
    }

    fn disconnect(&self, id: CmId) -> Result<(), anyhow::Error> {
        self.update(|state| state.disconnect(id))
    }

    fn get_cm_event(
        &self,
        channel: EventChannel,
        wait: Duration,
    ) -> Result<Option<CmEvent>, anyhow::Error> {
        self.wait_for(wait, |state| {
            let queue = state
                .event_channels
                .get_mut(&channel)
                .ok_or_else(|| anyhow!("unknown event channel {:?}", channel))?;
            Ok(queue.pop_front())
        })
    }

    fn alloc_pd(&self, device: DeviceId) -> Result<ProtectionDomain, anyhow::Error> {
        self.update(|state| {
            let pd = ProtectionDomain(state.alloc_handle());
            state.pds.insert(pd, device);
            Ok(pd)
        })
    }

    fn dealloc_pd(&self, pd: ProtectionDomain) -> Result<(), anyhow::Error> {
        self.update(|state| {
            state
                .pds
                .remove(&pd)
                .map(|_| ())
                .ok_or_else(|| anyhow!("unknown protection domain {:?}", pd))
        })
    }

    fn create_comp_channel(&self, _device: DeviceId) -> Result<CompChannel, anyhow::Error> {
        self.update(|state| {
            let channel = CompChannel(state.alloc_handle());
            state.comp_channels.insert(channel, VecDeque::new());
            Ok(channel)
        })
    }

    fn destroy_comp_channel(&self, channel: CompChannel) -> Result<(), anyhow::Error> {
        self.update(|state| {
            state
                .comp_channels
                .remove(&channel)
                .map(|_| ())
                .ok_or_else(|| anyhow!("unknown completion channel {:?}", channel))
        })
    }

    fn create_cq(
        &self,
        _device: DeviceId,
        entries: i32,
        channel: CompChannel,
    ) -> Result<CompletionQueue, anyhow::Error> {
        ensure!(entries > 0, "completion queue needs at least one entry");
        self.update(|state| {
            ensure!(
                state.comp_channels.contains_key(&channel),
                "unknown completion channel {:?}",
                channel
            );
            let cq = CompletionQueue(state.alloc_handle());
            state.cqs.insert(
                cq,
                CqState {
                    channel,
                    capacity: entries as usize,
                    armed: false,
                    entries: VecDeque::new(),
                },
            );
            Ok(cq)
        })
    }

    fn destroy_cq(&self, cq: CompletionQueue) -> Result<(), anyhow::Error> {
        self.update(|state| {
            state
                .cqs
                .remove(&cq)
                .map(|_| ())
                .ok_or_else(|| anyhow!("unknown completion queue {:?}", cq))
        })
    }

    fn req_notify_cq(&self, cq: CompletionQueue) -> Result<(), anyhow::Error> {
        self.update(|state| {
            state
                .cqs
                .get_mut(&cq)
                .ok_or_else(|| anyhow!("unknown completion queue {:?}", cq))?
                .armed = true;
            Ok(())
        })
    }

    fn get_cq_event(
        &self,
        channel: CompChannel,
        wait: Duration,
    ) -> Result<Option<CompletionQueue>, anyhow::Error> {
        self.wait_for(wait, |state| {
            let queue = state
                .comp_channels
                .get_mut(&channel)
                .ok_or_else(|| anyhow!("unknown completion channel {:?}", channel))?;
            Ok(queue.pop_front())
        })
    }

    fn ack_cq_events(&self, cq: CompletionQueue, _count: u32) -> Result<(), anyhow::Error> {
        ensure!(
            self.lock().cqs.contains_key(&cq),
            "unknown completion queue {:?}",
            cq
        );
        Ok(())
    }

    fn poll_cq(&self, cq: CompletionQueue) -> Result<Option<WorkCompletion>, anyhow::Error> {
        let mut state = self.lock();
        let cq_state = state
            .cqs
            .get_mut(&cq)
            .ok_or_else(|| anyhow!("unknown completion queue {:?}", cq))?;
        Ok(cq_state.entries.pop_front())
    }

    fn create_qp(
        &self,
        id: CmId,
        pd: ProtectionDomain,
        cq: CompletionQueue,
        caps: &QpCapabilities,
    ) -> Result<(), anyhow::Error> {
        self.update(|state| {
            ensure!(state.pds.contains_key(&pd), "unknown protection domain {:?}", pd);
            ensure!(state.cqs.contains_key(&cq), "unknown completion queue {:?}", cq);
            let id_state = state.id_mut(id)?;
            ensure!(id_state.qp.is_none(), "{:?} already has a queue pair", id);
            id_state.qp = Some(QpState {
                cq,
                caps: *caps,
                recvs: VecDeque::new(),
                inbound: VecDeque::new(),
            });
            Ok(())
        })
    }

    fn destroy_qp(&self, id: CmId) -> Result<(), anyhow::Error> {
        self.update(|state| {
            state.id_mut(id)?.qp = None;
            Ok(())
        })
    }

    unsafe fn reg_mr(
        &self,
        pd: ProtectionDomain,
        addr: usize,
        length: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegistration, anyhow::Error> {
        ensure!(addr != 0, "cannot register a null address");
        self.update(|state| {
            ensure!(state.pds.contains_key(&pd), "unknown protection domain {:?}", pd);
            let fresh_key = || loop {
                let key = rand::random::<u32>();
                if key != 0 && !state.mrs.values().any(|mr| mr.lkey == key || mr.rkey == key) {
                    break key;
                }
            };
            let lkey = fresh_key();
            let rkey = fresh_key();
            let handle = MrHandle(state.alloc_handle());
            state.mrs.insert(
                handle,
                MrState {
                    addr,
                    length,
                    access,
                    lkey,
                    rkey,
                },
            );
            Ok(MemoryRegistration {
                handle,
                addr,
                length,
                lkey,
                rkey,
            })
        })
    }

    fn dereg_mr(&self, mr: MrHandle) -> Result<(), anyhow::Error> {
        self.update(|state| {
            state
                .mrs
                .remove(&mr)
                .map(|_| ())
                .ok_or_else(|| anyhow!("unknown memory region {:?}", mr))
        })
    }

    fn post_send(&self, id: CmId, request: &SendRequest) -> Result<(), anyhow::Error> {
        self.update(|state| {
            let id_state = state.id(id)?;
            let (Some(qp), true) = (&id_state.qp, id_state.connected) else {
                return Err(TransportError::NotConnected(id).into());
            };
            ensure!(
                request.local.is_none() || qp.caps.max_send_sge >= 1,
                "queue pair on {:?} takes no scatter/gather entries",
                id
            );
            let peer = id_state
                .peer
                .ok_or_else(|| anyhow!("{:?} has no peer", id))?;

            let (opcode, need) = match request.op {
                SendOp::Send => (WcOpcode::Send, AccessFlags::empty()),
                SendOp::RdmaWrite { .. } => (WcOpcode::RdmaWrite, AccessFlags::empty()),
                SendOp::RdmaRead { .. } => (WcOpcode::RdmaRead, AccessFlags::LOCAL_WRITE),
            };
            let len = request.local.map(|sge| sge.length as usize).unwrap_or(0);
            if let Some(sge) = &request.local {
                if state.local_mr(sge, need).is_none() {
                    state.complete(id, request.wr_id, WcStatus::LocalProtection, opcode, 0, None);
                    return Ok(());
                }
            }

            match (request.op, request.local) {
                (SendOp::RdmaRead { remote }, local) => {
                    if len > 0
                        && state
                            .remote_mr(&remote, len, AccessFlags::REMOTE_READ)
                            .is_none()
                    {
                        state.complete(id, request.wr_id, WcStatus::RemoteAccess, opcode, 0, None);
                        return Ok(());
                    }
                    if let Some(sge) = local.filter(|_| len > 0) {
                        // SAFETY: both ranges were checked against live
                        // registrations above.
                        unsafe { store_bytes(sge.addr, &load_bytes(remote.addr, len)) };
                    }
                    state.complete(id, request.wr_id, WcStatus::Success, opcode, len, None);
                }
                (SendOp::RdmaWrite { remote, imm: None }, local) => {
                    if len > 0
                        && state
                            .remote_mr(&remote, len, AccessFlags::REMOTE_WRITE)
                            .is_none()
                    {
                        state.complete(id, request.wr_id, WcStatus::RemoteAccess, opcode, 0, None);
                        return Ok(());
                    }
                    if let Some(sge) = local.filter(|_| len > 0) {
                        // SAFETY: both ranges were checked against live
                        // registrations above.
                        unsafe { store_bytes(remote.addr, &load_bytes(sge.addr, len)) };
                    }
                    state.complete(id, request.wr_id, WcStatus::Success, opcode, len, None);
                }
                (op, local) => {
                    let data = match local {
                        // SAFETY: the source was checked against a live
                        // registration above.
                        Some(sge) => unsafe { load_bytes(sge.addr, len) },
                        None => Vec::new(),
                    };
                    let (write_to, imm) = match op {
                        SendOp::RdmaWrite { remote, imm } => (Some(remote), imm),
                        _ => (None, None),
                    };
                    state.qp_mut(peer)?.inbound.push_back(Inbound {
                        data,
                        write_to,
                        imm,
                        sender: id,
                        sender_wr_id: request.wr_id,
                    });
                    state.deliver(peer);
                }
            }
            Ok(())
        })
    }

    fn post_recv(&self, id: CmId, request: &RecvRequest) -> Result<(), anyhow::Error> {
        self.update(|state| {
            let qp = state.qp_mut(id)?;
            ensure!(
                qp.recvs.len() < qp.caps.max_recv_wr as usize,
                "receive queue on {:?} is full",
                id
            );
            qp.recvs.push_back(*request);
            state.deliver(id);
            Ok(())
        })
    }
}
