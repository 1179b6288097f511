/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The relay server.
//!
//! Clients announce their role in the connect private data.
//!
//! A producer connection gets an inbound buffer the producer may write into
//! and a posted receive for the immediate data. After every write the
//! server appends the payload to the [`SharedLog`], re-posts the receive and
//! sends READY again; a zero-length write is answered with DONE.
//!
//! Every consumer connection is sent one READY naming the shared log, which
//! consumers then read on their own. The log is allocated and registered
//! once, by whichever connection or [`Server::publish`] needs it first, and
//! shared by all consumers. It is append-only and never wraps: each record
//! is the payload written first and its four-digit length prefix after it,
//! so a reader that sees a complete prefix sees a complete payload. Space
//! for one more prefix is always kept free for the end-of-stream marker.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use anyhow::anyhow;
use anyhow::bail;

use crate::config::TransportConfig;
use crate::context::TransportContext;
use crate::error::FaultSlot;
use crate::error::TransportError;
use crate::event_loop;
use crate::event_loop::ConnectionHooks;
use crate::event_loop::EventLoop;
use crate::event_loop::Role;
use crate::fabric::AccessFlags;
use crate::fabric::CmEvent;
use crate::fabric::CmId;
use crate::fabric::Fabric;
use crate::fabric::RecvRequest;
use crate::fabric::RemoteRegion;
use crate::fabric::SendOp;
use crate::fabric::SendRequest;
use crate::fabric::WcOpcode;
use crate::fabric::WorkCompletion;
use crate::memory;
use crate::memory::RegisteredBuffer;
use crate::message::CONTROL_MESSAGE_LEN;
use crate::message::ClientRole;
use crate::message::ControlMessage;
use crate::message::END_OF_STREAM;
use crate::message::MAX_PAYLOAD_LEN;
use crate::message::PREFIX_LEN;
use crate::message::Record;
use crate::message::encode_prefix;

#[derive(Debug, Default)]
struct LogState {
    /// Offset of the next prefix.
    cursor: usize,
    records: u64,
    sealed: bool,
}

/// The registered, consumer-readable record log. See the module
/// documentation.
#[derive(Debug)]
pub struct SharedLog {
    buffer: RegisteredBuffer,
    state: Mutex<LogState>,
}

impl SharedLog {
    pub fn new(context: &TransportContext, capacity: usize) -> Result<Self, anyhow::Error> {
        let buffer = context.register_buffer(
            capacity,
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ,
        )?;
        Ok(Self {
            buffer,
            state: Mutex::new(LogState::default()),
        })
    }

    pub fn remote(&self) -> RemoteRegion {
        self.buffer.remote()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes used, not counting an end-of-stream marker.
    pub fn len(&self) -> usize {
        self.state.lock().expect("log lock poisoned").cursor
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_count(&self) -> u64 {
        self.state.lock().expect("log lock poisoned").records
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().expect("log lock poisoned").sealed
    }

    /// Appends one payload and returns the offset of its prefix.
    pub fn append(&self, payload: &[u8]) -> Result<usize, TransportError> {
        let prefix = encode_prefix(payload.len())?;
        let mut state = self.state.lock().expect("log lock poisoned");
        if state.sealed {
            return Err(TransportError::LogSealed);
        }
        let needed = PREFIX_LEN + payload.len() + PREFIX_LEN;
        let available = self.capacity() - state.cursor;
        if needed > available {
            return Err(TransportError::LogFull { needed, available });
        }
        let offset = state.cursor;
        self.buffer.write_at(offset + PREFIX_LEN, payload)?;
        self.buffer.write_at(offset, &prefix)?;
        state.cursor += PREFIX_LEN + payload.len();
        state.records += 1;
        Ok(offset)
    }

    /// Writes the end-of-stream marker. Later appends fail with
    /// [`TransportError::LogSealed`]. Idempotent.
    pub fn seal(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("log lock poisoned");
        if !state.sealed {
            self.buffer.write_at(state.cursor, &END_OF_STREAM)?;
            state.sealed = true;
        }
        Ok(())
    }

    /// A copy of the log up to and including the next prefix slot.
    pub fn snapshot(&self) -> Result<Vec<u8>, anyhow::Error> {
        let cursor = self.len();
        self.buffer.read_at(0, cursor + PREFIX_LEN)
    }
}

#[derive(Debug, Default)]
struct LogSlot {
    log: Option<Arc<SharedLog>>,
    /// Payloads published before the log existed.
    pending: Vec<Vec<u8>>,
    /// Log bytes the pending payloads will take, prefixes included.
    pending_len: usize,
}

#[derive(Debug)]
struct ServerConnection {
    id: CmId,
    role: ClientRole,
    /// Source of control message sends.
    control: RegisteredBuffer,
    /// Producer connections only: the target of record writes.
    inbound: Option<RegisteredBuffer>,
    records: u64,
    end_of_stream: bool,
}

impl ServerConnection {
    fn send_control(
        &self,
        context: &TransportContext,
        message: ControlMessage,
    ) -> Result<(), anyhow::Error> {
        self.control.write_at(0, &message.encode())?;
        context.fabric().post_send(
            self.id,
            &SendRequest {
                wr_id: self.id.0,
                op: SendOp::Send,
                local: Some(self.control.sge(0, CONTROL_MESSAGE_LEN)?),
            },
        )
    }

    fn post_imm_recv(&self, context: &TransportContext) -> Result<(), anyhow::Error> {
        context.fabric().post_recv(
            self.id,
            &RecvRequest {
                wr_id: self.id.0,
                local: None,
            },
        )
    }

    fn inbound(&self) -> Result<&RegisteredBuffer, anyhow::Error> {
        self.inbound
            .as_ref()
            .ok_or_else(|| anyhow!("{:?} is not a producer connection", self.id))
    }
}

/// The server's connection hooks.
#[derive(Debug)]
pub struct ServerRole {
    config: TransportConfig,
    log: Mutex<LogSlot>,
    connections: Mutex<HashMap<CmId, Arc<Mutex<ServerConnection>>>>,
    producers: AtomicUsize,
    consumers: AtomicUsize,
    registrations: AtomicUsize,
}

impl ServerRole {
    fn new(config: TransportConfig) -> Self {
        Self {
            config,
            log: Mutex::new(LogSlot::default()),
            connections: Mutex::new(HashMap::new()),
            producers: AtomicUsize::new(0),
            consumers: AtomicUsize::new(0),
            registrations: AtomicUsize::new(0),
        }
    }

    /// The shared log, allocated and registered on first use.
    fn shared_log(&self, context: &TransportContext) -> Result<Arc<SharedLog>, anyhow::Error> {
        let mut slot = self.log.lock().expect("log lock poisoned");
        if let Some(log) = &slot.log {
            return Ok(log.clone());
        }
        let log = Arc::new(SharedLog::new(context, self.config.log_capacity)?);
        self.registrations.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            "registered shared log of {} bytes (rkey {})",
            log.capacity(),
            log.remote().rkey
        );
        slot.log = Some(log.clone());
        slot.pending_len = 0;
        // Admitted against the same capacity, so these cannot overflow.
        for payload in std::mem::take(&mut slot.pending) {
            log.append(&payload)?;
        }
        Ok(log)
    }

    fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut slot = self.log.lock().expect("log lock poisoned");
        if let Some(log) = &slot.log {
            return log.append(&payload).map(|_| ());
        }
        // Held back until the log is registered, with the same room check
        // the log applies, end-of-stream reserve included.
        let capacity = memory::padded_len(self.config.log_capacity);
        let needed = PREFIX_LEN + payload.len() + PREFIX_LEN;
        let available = capacity.saturating_sub(slot.pending_len);
        if needed > available {
            return Err(TransportError::LogFull { needed, available });
        }
        slot.pending_len += PREFIX_LEN + payload.len();
        slot.pending.push(payload);
        Ok(())
    }

    fn connection(&self, id: CmId) -> Result<Arc<Mutex<ServerConnection>>, anyhow::Error> {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("no server connection {:?}", id))
    }

    fn on_record_written(
        &self,
        context: &TransportContext,
        connection: &mut ServerConnection,
        len: usize,
    ) -> Result<(), anyhow::Error> {
        if len == 0 {
            connection.end_of_stream = true;
            connection.send_control(context, ControlMessage::Done)?;
            let remaining = self.producers.fetch_sub(1, Ordering::SeqCst) - 1;
            tracing::info!(
                "producer {:?} finished after {} records; {} producers remain",
                connection.id,
                connection.records,
                remaining
            );
            if remaining == 0 && self.config.seal_log_on_producer_exit {
                self.shared_log(context)?.seal()?;
                tracing::info!("shared log sealed");
            }
            return Ok(());
        }

        let payload = connection.inbound()?.read_at(0, len)?;
        self.shared_log(context)?.append(&payload)?;
        connection.records += 1;
        connection.post_imm_recv(context)?;
        let remote = connection.inbound()?.remote();
        connection.send_control(context, ControlMessage::Ready(remote))
    }
}

impl ConnectionHooks for ServerRole {
    fn on_pre_connect(
        &self,
        context: &Arc<TransportContext>,
        event: &CmEvent,
    ) -> Result<(), anyhow::Error> {
        let role = ClientRole::from_private_data(&event.private_data)?;
        let inbound = match role {
            ClientRole::Producer => Some(context.register_buffer(
                self.config.record_buffer_size,
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
            )?),
            ClientRole::Consumer => {
                self.shared_log(context)?;
                None
            }
        };
        let connection = ServerConnection {
            id: event.id,
            role,
            control: context.register_buffer(CONTROL_MESSAGE_LEN, AccessFlags::empty())?,
            inbound,
            records: 0,
            end_of_stream: false,
        };
        match role {
            ClientRole::Producer => {
                connection.post_imm_recv(context)?;
                self.producers.fetch_add(1, Ordering::SeqCst);
            }
            ClientRole::Consumer => {
                self.consumers.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .insert(event.id, Arc::new(Mutex::new(connection)));
        Ok(())
    }

    fn on_connect(&self, context: &Arc<TransportContext>, id: CmId) -> Result<(), anyhow::Error> {
        let connection = self.connection(id)?;
        let connection = connection.lock().expect("connection lock poisoned");
        let remote = match connection.role {
            ClientRole::Producer => connection.inbound()?.remote(),
            ClientRole::Consumer => self.shared_log(context)?.remote(),
        };
        tracing::info!("{:?} connected ({:?})", connection.role, id);
        connection.send_control(context, ControlMessage::Ready(remote))
    }

    fn on_completion(
        &self,
        context: &Arc<TransportContext>,
        wc: &WorkCompletion,
    ) -> Result<(), anyhow::Error> {
        let id = CmId(wc.wr_id);
        match wc.opcode {
            WcOpcode::RecvRdmaWithImm => {
                let len = wc
                    .imm
                    .ok_or_else(|| anyhow!("write on {:?} carried no immediate data", id))?;
                let connection = self.connection(id)?;
                let mut connection = connection.lock().expect("connection lock poisoned");
                self.on_record_written(context, &mut connection, len as usize)
            }
            WcOpcode::Send => Ok(()),
            other => bail!("unexpected {:?} completion on server {:?}", other, id),
        }
    }

    fn on_disconnect(
        &self,
        _context: &Arc<TransportContext>,
        id: CmId,
    ) -> Result<(), anyhow::Error> {
        let removed = self
            .connections
            .lock()
            .expect("connections lock poisoned")
            .remove(&id);
        let Some(connection) = removed else {
            return Ok(());
        };
        let connection = connection.lock().expect("connection lock poisoned");
        match connection.role {
            ClientRole::Producer if !connection.end_of_stream => {
                self.producers.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(
                    "producer {:?} disconnected after {} records without an end of stream",
                    id,
                    connection.records
                );
            }
            ClientRole::Producer => {}
            ClientRole::Consumer => {
                let remaining = self.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
                tracing::info!("consumer {:?} disconnected; {} remain", id, remaining);
            }
        }
        Ok(())
    }

    fn on_shutdown(&self) {
        let log = self.log.lock().expect("log lock poisoned").log.take();
        if let Some(log) = log {
            tracing::debug!("releasing shared log with {} records", log.record_count());
        }
    }

    fn on_fault(&self, _message: &str) {}
}

/// The application-facing relay server.
#[derive(Debug)]
pub struct Server {
    role: Arc<ServerRole>,
    fault: FaultSlot,
    stop: Arc<AtomicBool>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds the listener on every address at `config.port` (0 picks a free
    /// port) and starts serving in the background.
    pub fn start(fabric: Arc<dyn Fabric>, config: TransportConfig) -> Result<Self, TransportError> {
        tracing::debug!("starting server with configuration:\n{}", config);
        let fault = FaultSlot::new(config.abort_on_fault);
        let role = Arc::new(ServerRole::new(config.clone()));
        let event_loop = EventLoop::listen(
            fabric,
            config,
            Arc::new(Role::Server(role.clone())),
            fault.clone(),
        )?;
        let local_addr = event_loop
            .local_addr()
            .ok_or_else(|| anyhow!("listener has no address"))?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread = event_loop::spawn_server(event_loop, stop.clone())?;
        Ok(Self {
            role,
            fault,
            stop,
            local_addr,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Appends a record to the shared log directly.
    pub fn publish(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), TransportError> {
        self.fault.check()?;
        let record = Record::new(key, value)?;
        if record.payload_len() > MAX_PAYLOAD_LEN {
            return Err(TransportError::RecordTooLarge {
                len: record.payload_len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        self.role.publish(record.to_payload())
    }

    pub fn consumer_count(&self) -> usize {
        self.role.consumers.load(Ordering::SeqCst)
    }

    /// Producers connected and not yet finished.
    pub fn producer_count(&self) -> usize {
        self.role.producers.load(Ordering::SeqCst)
    }

    /// How many times the shared log has been registered: 0 or 1.
    pub fn log_registrations(&self) -> usize {
        self.role.registrations.load(Ordering::SeqCst)
    }

    /// The shared log, once it exists. Must be dropped before
    /// [`shutdown`](Self::shutdown) for the registration to be released.
    pub fn shared_log(&self) -> Option<Arc<SharedLog>> {
        self.role.log.lock().expect("log lock poisoned").log.clone()
    }

    /// Returns the fault that stopped the server, if any.
    pub fn check(&self) -> Result<(), TransportError> {
        self.fault.check()
    }

    /// Stops accepting, tears down every connection and releases all
    /// fabric resources.
    pub fn shutdown(mut self) -> Result<(), TransportError> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| anyhow!("server connection thread panicked"))?;
        }
        self.fault.check()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSlot;
    use crate::fabric::local::LOCAL_DEVICE;
    use crate::fabric::local::LocalFabric;
    use crate::test_utils::RecordingHooks;
    use crate::test_utils::test_config;

    fn context(fabric: &Arc<dyn Fabric>) -> Result<Arc<TransportContext>, anyhow::Error> {
        let slot = ContextSlot::new(
            fabric.clone(),
            test_config(),
            FaultSlot::new(false),
            Arc::new(RecordingHooks::default()),
        );
        Ok(slot.acquire(LOCAL_DEVICE)?)
    }

    #[test]
    fn test_append_writes_prefix_after_payload() -> Result<(), anyhow::Error> {
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let context = context(&fabric)?;
        let log = SharedLog::new(&context, 64)?;
        assert!(log.is_empty());

        assert_eq!(log.append(b"Arjun/Kingfisher")?, 0);
        assert_eq!(log.append(b"Danish/Corona")?, 20);
        assert_eq!(log.record_count(), 2);
        assert_eq!(log.len(), 37);
        assert_eq!(
            log.snapshot()?,
            b"0016Arjun/Kingfisher0013Danish/Corona\0\0\0\0"
        );

        log.seal()?;
        log.seal()?;
        assert!(log.is_sealed());
        assert_eq!(&log.snapshot()?[37..], b"0000");
        assert!(matches!(log.append(b"k/v"), Err(TransportError::LogSealed)));

        drop(log);
        context.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_append_reserves_end_of_stream() -> Result<(), anyhow::Error> {
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let context = context(&fabric)?;
        let log = SharedLog::new(&context, 1)?;
        let capacity = log.capacity();

        // Fill until 16 bytes remain: one 8 byte record and the marker.
        loop {
            let remaining = capacity - log.len();
            if remaining == 16 {
                break;
            }
            log.append(&vec![b'x'; (remaining - 16 - PREFIX_LEN).min(MAX_PAYLOAD_LEN)])?;
        }
        log.append(b"k/123456")?;
        assert!(matches!(
            log.append(b"k/v"),
            Err(TransportError::LogFull {
                needed: 11,
                available: 4
            })
        ));
        log.seal()?;
        assert_eq!(log.len() + PREFIX_LEN, capacity);

        drop(log);
        context.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_publish_before_and_after_registration() -> Result<(), anyhow::Error> {
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let context = context(&fabric)?;
        let role = ServerRole::new(test_config());

        role.publish(b"a/1".to_vec())?;
        let log = role.shared_log(&context)?;
        assert_eq!(log.record_count(), 1);
        role.publish(b"b/2".to_vec())?;
        assert_eq!(log.record_count(), 2);

        // Registered exactly once.
        assert!(Arc::ptr_eq(&log, &role.shared_log(&context)?));
        assert_eq!(role.registrations.load(Ordering::SeqCst), 1);

        drop(log);
        role.on_shutdown();
        context.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_pending_publishes_respect_capacity() -> Result<(), anyhow::Error> {
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let context = context(&fabric)?;
        let role = ServerRole::new(TransportConfig {
            log_capacity: 4096,
            ..test_config()
        });
        let capacity = memory::padded_len(4096);

        let payload = |len: usize| vec![b'v'; len];
        let mut admitted = 0;
        let mut used = 0;
        let refused = loop {
            match role.publish(payload(1000)) {
                Ok(()) => {
                    admitted += 1;
                    used += PREFIX_LEN + 1000;
                }
                Err(err) => break err,
            }
        };
        assert!(matches!(
            refused,
            TransportError::LogFull { needed: 1008, available } if available == capacity - used
        ));
        assert!(admitted > 0);
        assert_eq!(role.registrations.load(Ordering::SeqCst), 0);

        // Everything admitted lands in the log, with room left for the marker.
        let log = role.shared_log(&context)?;
        assert_eq!(log.record_count(), admitted);
        assert_eq!(log.len(), used);
        log.seal()?;
        assert!(Arc::ptr_eq(&log, &role.shared_log(&context)?));
        assert_eq!(role.registrations.load(Ordering::SeqCst), 1);

        drop(log);
        role.on_shutdown();
        context.shutdown()?;
        Ok(())
    }
}
