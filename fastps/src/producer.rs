/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The producer endpoint.
//!
//! Application threads append records to a bounded [`Backlog`] and return
//! immediately. The connection is driven entirely by the server's control
//! messages: every READY names a region, and the producer answers it with
//! exactly one one-sided write of the oldest unsent record, carrying the
//! payload length as immediate data. Nothing is written without a READY.
//!
//! Once [`Producer::terminate`] has closed the backlog and the remaining
//! records are written, the next READY is answered with a zero-length write
//! whose immediate data is 0. The server acknowledges it with DONE, the
//! producer disconnects, and `terminate` returns.
//!
//! A receive is always re-posted before the write that answers a READY, so
//! the server's next control message never arrives without one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;

use crate::config::TransportConfig;
use crate::context::TransportContext;
use crate::error::FaultSlot;
use crate::error::TransportError;
use crate::event_loop;
use crate::event_loop::ConnectionHooks;
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
use crate::memory::RegisteredBuffer;
use crate::message::CONTROL_MESSAGE_LEN;
use crate::message::ClientRole;
use crate::message::ControlMessage;
use crate::message::MAX_PAYLOAD_LEN;
use crate::message::Record;
use crate::sync::backlog::Backlog;
use crate::sync::flag;

#[derive(Debug)]
struct ProducerConnection {
    id: CmId,
    /// Source of record writes.
    staging: RegisteredBuffer,
    /// Target of control message receives.
    control: RegisteredBuffer,
    records_sent: u64,
    end_of_stream_sent: bool,
}

impl ProducerConnection {
    fn post_control_recv(&self, context: &TransportContext) -> Result<(), anyhow::Error> {
        context.fabric().post_recv(
            self.id,
            &RecvRequest {
                wr_id: self.id.0,
                local: Some(self.control.sge(0, CONTROL_MESSAGE_LEN)?),
            },
        )
    }
}

/// The producer's connection hooks.
#[derive(Debug)]
pub struct ProducerRole {
    backlog: Backlog<Record>,
    record_buffer_size: usize,
    connections: Mutex<HashMap<CmId, Arc<Mutex<ProducerConnection>>>>,
    connected: Mutex<Option<flag::Guard>>,
}

impl ProducerRole {
    fn new(config: &TransportConfig) -> (Self, flag::Flag) {
        let (connected, guard) = flag::guarded();
        let role = Self {
            backlog: Backlog::with_capacity(config.backlog_capacity),
            record_buffer_size: config.record_buffer_size,
            connections: Mutex::new(HashMap::new()),
            connected: Mutex::new(Some(guard)),
        };
        (role, connected)
    }

    pub fn backlog(&self) -> &Backlog<Record> {
        &self.backlog
    }

    fn connection(&self, id: CmId) -> Result<Arc<Mutex<ProducerConnection>>, anyhow::Error> {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("no producer connection {:?}", id))
    }

    fn signal_connected(&self) {
        self.connected.lock().expect("flag lock poisoned").take();
    }

    /// Answers a READY for `peer` with the oldest record, blocking until
    /// there is one, or with the end-of-stream marker once the backlog is
    /// closed and drained.
    fn send_next(
        &self,
        context: &TransportContext,
        connection: &Mutex<ProducerConnection>,
        peer: RemoteRegion,
    ) -> Result<(), anyhow::Error> {
        let next = self.backlog.pop()?;
        let mut connection = connection.lock().expect("connection lock poisoned");
        let (imm, local) = match next {
            Some(record) => {
                let payload = record.to_payload();
                connection.staging.write_at(0, &payload)?;
                connection.records_sent += 1;
                (
                    payload.len() as u32,
                    Some(connection.staging.sge(0, payload.len())?),
                )
            }
            None => {
                tracing::debug!(
                    "backlog drained after {} records; sending end of stream",
                    connection.records_sent
                );
                connection.end_of_stream_sent = true;
                (0, None)
            }
        };
        context.fabric().post_send(
            connection.id,
            &SendRequest {
                wr_id: connection.id.0,
                op: SendOp::RdmaWrite {
                    remote: peer,
                    imm: Some(imm),
                },
                local,
            },
        )
    }
}

impl ConnectionHooks for ProducerRole {
    fn private_data(&self) -> Vec<u8> {
        ClientRole::Producer.private_data()
    }

    fn on_pre_connect(
        &self,
        context: &Arc<TransportContext>,
        event: &CmEvent,
    ) -> Result<(), anyhow::Error> {
        let connection = ProducerConnection {
            id: event.id,
            staging: context.register_buffer(self.record_buffer_size, AccessFlags::empty())?,
            control: context.register_buffer(CONTROL_MESSAGE_LEN, AccessFlags::LOCAL_WRITE)?,
            records_sent: 0,
            end_of_stream_sent: false,
        };
        connection.post_control_recv(context)?;
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .insert(event.id, Arc::new(Mutex::new(connection)));
        Ok(())
    }

    fn on_connect(&self, _context: &Arc<TransportContext>, id: CmId) -> Result<(), anyhow::Error> {
        tracing::info!("producer connected ({:?})", id);
        self.signal_connected();
        Ok(())
    }

    fn on_completion(
        &self,
        context: &Arc<TransportContext>,
        wc: &WorkCompletion,
    ) -> Result<(), anyhow::Error> {
        let id = CmId(wc.wr_id);
        match wc.opcode {
            WcOpcode::Recv => {
                let connection = self.connection(id)?;
                let message = {
                    let connection = connection.lock().expect("connection lock poisoned");
                    let message = ControlMessage::decode(
                        &connection.control.read_at(0, CONTROL_MESSAGE_LEN)?,
                    )?;
                    if let ControlMessage::Ready(_) = message {
                        connection.post_control_recv(context)?;
                    }
                    message
                };
                match message {
                    ControlMessage::Ready(peer) => self.send_next(context, &connection, peer),
                    ControlMessage::Done => {
                        tracing::debug!("server acknowledged end of stream on {:?}", id);
                        context.fabric().disconnect(id)
                    }
                }
            }
            WcOpcode::RdmaWrite => Ok(()),
            other => bail!("unexpected {:?} completion on producer {:?}", other, id),
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
        tracing::info!(
            "producer disconnected after {} records ({:?})",
            connection.records_sent,
            id
        );
        if !connection.end_of_stream_sent {
            bail!(
                "server disconnected before the end of the stream, {} records unsent",
                self.backlog.len()
            );
        }
        Ok(())
    }

    fn on_fault(&self, _message: &str) {
        self.backlog.abort();
        self.signal_connected();
    }
}

/// The application-facing producer.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use fastps::{Producer, TransportConfig};
/// # use fastps::fabric::local::LocalFabric;
/// # fn main() -> Result<(), fastps::TransportError> {
/// let fabric = Arc::new(LocalFabric::new());
/// let producer = Producer::init(fabric, TransportConfig::default(), "10.0.0.1")?;
/// producer.produce_record("Arjun", "Kingfisher")?;
/// producer.terminate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Producer {
    role: Arc<ProducerRole>,
    fault: FaultSlot,
    connected: flag::Flag,
    max_payload_len: usize,
    thread: Option<JoinHandle<()>>,
}

impl Producer {
    /// Starts connecting to `server` in the background and returns at once.
    /// Records produced before the connection is up wait in the backlog.
    pub fn init(
        fabric: Arc<dyn Fabric>,
        config: TransportConfig,
        server: &str,
    ) -> Result<Self, TransportError> {
        let addr = event_loop::resolve_server(server, config.port)?;
        let fault = FaultSlot::new(config.abort_on_fault);
        let max_payload_len = MAX_PAYLOAD_LEN.min(config.record_buffer_size);
        let (role, connected) = ProducerRole::new(&config);
        let role = Arc::new(role);
        let thread = event_loop::spawn_client(
            fabric,
            config,
            addr,
            Arc::new(Role::Producer(role.clone())),
            fault.clone(),
        )?;
        tracing::debug!("producer connecting to {}", addr);
        Ok(Self {
            role,
            fault,
            connected,
            max_payload_len,
            thread: Some(thread),
        })
    }

    /// Blocks until the connection is established, a fault occurs, or
    /// `timeout` elapses. Returns whether the connection is up.
    pub fn wait_connected(&self, timeout: Duration) -> Result<bool, TransportError> {
        let connected = self.connected.wait_timeout(timeout);
        self.fault.check()?;
        Ok(connected)
    }

    /// Appends a record to the backlog without waiting for delivery. Fails
    /// with [`TransportError::BacklogOverflow`] when the backlog is full, in
    /// which case the record is not enqueued.
    pub fn produce_record(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), TransportError> {
        self.fault.check()?;
        let record = Record::new(key, value)?;
        if record.payload_len() > self.max_payload_len {
            return Err(TransportError::RecordTooLarge {
                len: record.payload_len(),
                max: self.max_payload_len,
            });
        }
        match self.role.backlog.push(record) {
            Err(TransportError::Closed) => {
                self.fault.check()?;
                Err(TransportError::Closed)
            }
            result => result,
        }
    }

    /// Records waiting to be written.
    pub fn backlog_len(&self) -> usize {
        self.role.backlog.len()
    }

    /// Sends every record still in the backlog, then the end-of-stream
    /// marker, and blocks until the server has acknowledged it and the
    /// connection is torn down.
    pub fn terminate(mut self) -> Result<(), TransportError> {
        self.role.backlog.close();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| anyhow!("producer connection thread panicked"))?;
        }
        self.fault.check()
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            // Without terminate the connection still drains in the
            // background.
            self.role.backlog.close();
        }
    }
}
