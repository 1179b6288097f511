/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The consumer endpoint.
//!
//! A consumer never receives record data through sends. The server's single
//! READY names the shared log, and from then on the consumer walks the log
//! with one-sided reads, alternating between two phases:
//!
//! * probe: read the four-byte length prefix at the cursor. If any byte is
//!   still NUL nothing has been published there yet, and the same probe is
//!   issued again. `0000` ends the stream. Otherwise the cursor moves past
//!   the prefix.
//! * fetch: read exactly that many bytes, split them into a record, hand it
//!   to the application, and move the cursor past the payload.
//!
//! The server writes a payload before its prefix, so a prefix that reads as
//! complete always guards a complete payload. Only one read is outstanding
//! at a time, and the next read is issued only after the application has
//! taken the current record.

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
use crate::message::PREFIX_LEN;
use crate::message::Prefix;
use crate::message::Record;
use crate::message::parse_prefix;
use crate::sync::flag;
use crate::sync::handoff::Handoff;

/// Where a [`ReadCursor`] is in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    ProbeLength,
    FetchPayload { len: usize },
}

/// A one-sided read to issue next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOp {
    pub remote: RemoteRegion,
    pub len: usize,
}

/// What to do after a read completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// The probed prefix is unwritten; probe the same place again.
    Retry(ReadOp),
    /// Issue the next read.
    Read(ReadOp),
    /// Deliver a record, then issue the next read.
    Deliver(Record, ReadOp),
    /// The log is sealed.
    EndOfStream,
}

/// The consumer's position in a remote log. Pure state; issuing the reads is
/// the caller's business.
#[derive(Debug, Clone)]
pub struct ReadCursor {
    base: RemoteRegion,
    offset: u64,
    phase: ReadPhase,
}

impl ReadCursor {
    /// A cursor at the start of the log at `base`, about to probe.
    pub fn new(base: RemoteRegion) -> Self {
        Self {
            base,
            offset: 0,
            phase: ReadPhase::ProbeLength,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn phase(&self) -> ReadPhase {
        self.phase
    }

    pub fn next_read(&self) -> ReadOp {
        let len = match self.phase {
            ReadPhase::ProbeLength => PREFIX_LEN,
            ReadPhase::FetchPayload { len } => len,
        };
        ReadOp {
            remote: self.base.offset(self.offset),
            len,
        }
    }

    /// Advances the cursor with the bytes returned by the read from
    /// [`next_read`](Self::next_read).
    pub fn on_read(&mut self, data: &[u8]) -> Result<Progress, TransportError> {
        match self.phase {
            ReadPhase::ProbeLength => match parse_prefix(data)? {
                Prefix::Unwritten => Ok(Progress::Retry(self.next_read())),
                Prefix::EndOfStream => Ok(Progress::EndOfStream),
                Prefix::Length(len) => {
                    self.offset += PREFIX_LEN as u64;
                    self.phase = ReadPhase::FetchPayload { len };
                    Ok(Progress::Read(self.next_read()))
                }
            },
            ReadPhase::FetchPayload { len } => {
                if data.len() != len {
                    return Err(TransportError::InvalidRecord(format!(
                        "read {} bytes of a {} byte payload",
                        data.len(),
                        len
                    )));
                }
                let record = Record::from_payload(data)?;
                self.offset += len as u64;
                self.phase = ReadPhase::ProbeLength;
                Ok(Progress::Deliver(record, self.next_read()))
            }
        }
    }
}

#[derive(Debug)]
struct ConsumerConnection {
    id: CmId,
    /// Target of every read.
    buffer: RegisteredBuffer,
    /// Target of the READY receive.
    control: RegisteredBuffer,
    cursor: Option<ReadCursor>,
    records_received: u64,
    end_of_stream: bool,
}

impl ConsumerConnection {
    fn issue(&self, context: &TransportContext, op: ReadOp) -> Result<(), anyhow::Error> {
        if op.len > self.buffer.len() {
            return Err(TransportError::RecordTooLarge {
                len: op.len,
                max: self.buffer.len(),
            }
            .into());
        }
        context.fabric().post_send(
            self.id,
            &SendRequest {
                wr_id: self.id.0,
                op: SendOp::RdmaRead { remote: op.remote },
                local: Some(self.buffer.sge(0, op.len)?),
            },
        )
    }
}

/// The consumer's connection hooks.
#[derive(Debug)]
pub struct ConsumerRole {
    handoff: Handoff<Record>,
    record_buffer_size: usize,
    probe_backoff: Duration,
    connections: Mutex<HashMap<CmId, Arc<Mutex<ConsumerConnection>>>>,
    connected: Mutex<Option<flag::Guard>>,
}

impl ConsumerRole {
    fn new(config: &TransportConfig) -> (Self, flag::Flag) {
        let (connected, guard) = flag::guarded();
        let role = Self {
            handoff: Handoff::new(),
            record_buffer_size: config.record_buffer_size,
            probe_backoff: config.probe_backoff(),
            connections: Mutex::new(HashMap::new()),
            connected: Mutex::new(Some(guard)),
        };
        (role, connected)
    }

    fn connection(&self, id: CmId) -> Result<Arc<Mutex<ConsumerConnection>>, anyhow::Error> {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("no consumer connection {:?}", id))
    }

    fn signal_connected(&self) {
        self.connected.lock().expect("flag lock poisoned").take();
    }

    fn on_ready(
        &self,
        context: &TransportContext,
        connection: &Mutex<ConsumerConnection>,
    ) -> Result<(), anyhow::Error> {
        let mut connection = connection.lock().expect("connection lock poisoned");
        let message =
            ControlMessage::decode(&connection.control.read_at(0, CONTROL_MESSAGE_LEN)?)?;
        match message {
            ControlMessage::Ready(log) => {
                tracing::debug!(
                    "shared log at 0x{:x} (rkey {}) on {:?}",
                    log.addr,
                    log.rkey,
                    connection.id
                );
                let cursor = ReadCursor::new(log);
                let op = cursor.next_read();
                connection.cursor = Some(cursor);
                connection.issue(context, op)
            }
            ControlMessage::Done => {
                let id = connection.id;
                drop(connection);
                self.disconnect(context, id)
            }
        }
    }

    /// Whether `id` is still connected and the stream still wanted. Once the
    /// server has gone its queue pair is destroyed, so nothing may be posted.
    fn is_live(&self, id: CmId) -> bool {
        !self.handoff.is_finished()
            && self
                .connections
                .lock()
                .expect("connections lock poisoned")
                .contains_key(&id)
    }

    fn resume(
        &self,
        context: &TransportContext,
        connection: &Mutex<ConsumerConnection>,
        id: CmId,
        op: ReadOp,
    ) -> Result<(), anyhow::Error> {
        if self.handoff.is_closed() {
            tracing::debug!("consumer closed; disconnecting {:?}", id);
            return self.disconnect(context, id);
        }
        if !self.is_live(id) {
            tracing::debug!("not resuming reads on departed {:?}", id);
            return Ok(());
        }
        let result = connection
            .lock()
            .expect("connection lock poisoned")
            .issue(context, op);
        match result {
            // The disconnect event that follows finishes the handoff.
            Err(err)
                if !self.is_live(id)
                    || matches!(
                        err.downcast_ref::<TransportError>(),
                        Some(TransportError::NotConnected(_))
                    ) =>
            {
                tracing::debug!("read on {:?} raced its disconnect: {:#}", id, err);
                Ok(())
            }
            result => result,
        }
    }

    fn disconnect(&self, context: &TransportContext, id: CmId) -> Result<(), anyhow::Error> {
        let known = self
            .connections
            .lock()
            .expect("connections lock poisoned")
            .contains_key(&id);
        if !known {
            return Ok(());
        }
        context.fabric().disconnect(id)
    }

    fn on_read(
        &self,
        context: &TransportContext,
        connection: &Mutex<ConsumerConnection>,
    ) -> Result<(), anyhow::Error> {
        let (id, progress) = {
            let mut guard = connection.lock().expect("connection lock poisoned");
            let id = guard.id;
            if self.handoff.is_closed() {
                drop(guard);
                tracing::debug!("consumer closed; disconnecting {:?}", id);
                return self.disconnect(context, id);
            }
            let connection = &mut *guard;
            let cursor = connection
                .cursor
                .as_mut()
                .ok_or_else(|| anyhow!("read completed before READY on {:?}", id))?;
            let data = connection.buffer.read_at(0, cursor.next_read().len)?;
            (id, cursor.on_read(&data)?)
        };

        match progress {
            Progress::Retry(op) => {
                if self.probe_backoff.is_zero() {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(self.probe_backoff);
                }
                self.resume(context, connection, id, op)
            }
            Progress::Read(op) => self.resume(context, connection, id, op),
            Progress::Deliver(record, op) => {
                // Blocks until the application takes the record.
                match self.handoff.put(record) {
                    Ok(()) => {
                        connection
                            .lock()
                            .expect("connection lock poisoned")
                            .records_received += 1;
                        self.resume(context, connection, id, op)
                    }
                    Err(TransportError::Closed) => self.disconnect(context, id),
                    Err(err) => Err(err.into()),
                }
            }
            Progress::EndOfStream => {
                let mut connection = connection.lock().expect("connection lock poisoned");
                tracing::info!(
                    "end of stream after {} records on {:?}",
                    connection.records_received,
                    id
                );
                connection.end_of_stream = true;
                drop(connection);
                self.handoff.finish();
                self.disconnect(context, id)
            }
        }
    }
}

impl ConnectionHooks for ConsumerRole {
    fn private_data(&self) -> Vec<u8> {
        ClientRole::Consumer.private_data()
    }

    fn on_pre_connect(
        &self,
        context: &Arc<TransportContext>,
        event: &CmEvent,
    ) -> Result<(), anyhow::Error> {
        let connection = ConsumerConnection {
            id: event.id,
            buffer: context.register_buffer(self.record_buffer_size, AccessFlags::LOCAL_WRITE)?,
            control: context.register_buffer(CONTROL_MESSAGE_LEN, AccessFlags::LOCAL_WRITE)?,
            cursor: None,
            records_received: 0,
            end_of_stream: false,
        };
        context.fabric().post_recv(
            event.id,
            &RecvRequest {
                wr_id: event.id.0,
                local: Some(connection.control.sge(0, CONTROL_MESSAGE_LEN)?),
            },
        )?;
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .insert(event.id, Arc::new(Mutex::new(connection)));
        Ok(())
    }

    fn on_connect(&self, _context: &Arc<TransportContext>, id: CmId) -> Result<(), anyhow::Error> {
        tracing::info!("consumer connected ({:?})", id);
        self.signal_connected();
        Ok(())
    }

    fn on_completion(
        &self,
        context: &Arc<TransportContext>,
        wc: &WorkCompletion,
    ) -> Result<(), anyhow::Error> {
        let id = CmId(wc.wr_id);
        let connection = self.connection(id)?;
        match wc.opcode {
            WcOpcode::Recv => self.on_ready(context, &connection),
            WcOpcode::RdmaRead => self.on_read(context, &connection),
            other => bail!("unexpected {:?} completion on consumer {:?}", other, id),
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
        if let Some(connection) = removed {
            let connection = connection.lock().expect("connection lock poisoned");
            if !connection.end_of_stream && !self.handoff.is_closed() {
                tracing::warn!(
                    "server disconnected {:?} after {} records without an end of stream",
                    id,
                    connection.records_received
                );
            }
        }
        // Whatever is still buffered can be taken; then the stream ends.
        self.handoff.finish();
        Ok(())
    }

    fn on_fault(&self, _message: &str) {
        self.handoff.close();
        self.signal_connected();
    }
}

/// The application-facing consumer.
#[derive(Debug)]
pub struct Consumer {
    role: Arc<ConsumerRole>,
    fault: FaultSlot,
    connected: flag::Flag,
    thread: Option<JoinHandle<()>>,
}

impl Consumer {
    /// Starts connecting to `server` in the background and returns at once.
    pub fn init(
        fabric: Arc<dyn Fabric>,
        config: TransportConfig,
        server: &str,
    ) -> Result<Self, TransportError> {
        let addr = event_loop::resolve_server(server, config.port)?;
        let fault = FaultSlot::new(config.abort_on_fault);
        let (role, connected) = ConsumerRole::new(&config);
        let role = Arc::new(role);
        let thread = event_loop::spawn_client(
            fabric,
            config,
            addr,
            Arc::new(Role::Consumer(role.clone())),
            fault.clone(),
        )?;
        tracing::debug!("consumer connecting to {}", addr);
        Ok(Self {
            role,
            fault,
            connected,
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

    /// Blocks until the next record is available. Returns `Ok(None)` once
    /// the stream has ended.
    pub fn consume_record(&self) -> Result<Option<Record>, TransportError> {
        self.fault.check()?;
        match self.role.handoff.take() {
            Err(TransportError::Closed) => {
                self.fault.check()?;
                Err(TransportError::Closed)
            }
            result => result,
        }
    }

    /// Stops consuming and blocks until the connection is torn down.
    pub fn terminate(mut self) -> Result<(), TransportError> {
        self.role.handoff.close();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| anyhow!("consumer connection thread panicked"))?;
        }
        self.fault.check()
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.role.handoff.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: RemoteRegion = RemoteRegion {
        addr: 0x10000,
        rkey: 7,
    };

    #[test]
    fn test_unwritten_prefix_retries_in_place() {
        let mut cursor = ReadCursor::new(BASE);
        let probe = cursor.next_read();
        assert_eq!(probe.remote, BASE);
        assert_eq!(probe.len, PREFIX_LEN);

        for data in [&b"\0\0\0\0"[..], &b"00\0\0"[..], &b"\x00016"[..]] {
            assert_eq!(cursor.on_read(data).unwrap(), Progress::Retry(probe));
            assert_eq!(cursor.offset(), 0);
            assert_eq!(cursor.phase(), ReadPhase::ProbeLength);
        }
    }

    #[test]
    fn test_phases_alternate() {
        let mut cursor = ReadCursor::new(BASE);

        let fetch = match cursor.on_read(b"0016").unwrap() {
            Progress::Read(op) => op,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(cursor.phase(), ReadPhase::FetchPayload { len: 16 });
        assert_eq!(fetch.remote, BASE.offset(4));
        assert_eq!(fetch.len, 16);

        let (record, probe) = match cursor.on_read(b"Arjun/Kingfisher").unwrap() {
            Progress::Deliver(record, op) => (record, op),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(record, Record::new("Arjun", "Kingfisher").unwrap());
        assert_eq!(cursor.phase(), ReadPhase::ProbeLength);
        // The next prefix starts right after the payload.
        assert_eq!(cursor.offset(), 20);
        assert_eq!(probe.remote, BASE.offset(20));
        assert_eq!(probe.len, PREFIX_LEN);

        assert_eq!(cursor.on_read(b"0000").unwrap(), Progress::EndOfStream);
    }

    #[test]
    fn test_walks_a_log() {
        let records = [("Arjun", "Kingfisher"), ("Danish", "Corona"), ("k", "v")];
        let mut log = Vec::new();
        for (key, value) in records {
            let payload = Record::new(key, value).unwrap().to_payload();
            log.extend_from_slice(format!("{:04}", payload.len()).as_bytes());
            log.extend_from_slice(&payload);
        }
        log.extend_from_slice(&[0; 4]);

        let mut cursor = ReadCursor::new(BASE);
        let mut delivered = Vec::new();
        let mut op = cursor.next_read();
        loop {
            let start = (op.remote.addr - BASE.addr) as usize;
            match cursor.on_read(&log[start..start + op.len]).unwrap() {
                Progress::Retry(_) => break,
                Progress::Read(next) => op = next,
                Progress::Deliver(record, next) => {
                    delivered.push(record.to_string());
                    op = next;
                }
                Progress::EndOfStream => panic!("log is not sealed"),
            }
        }
        assert_eq!(delivered, vec!["Arjun/Kingfisher", "Danish/Corona", "k/v"]);
        assert_eq!(cursor.offset() as usize, log.len() - PREFIX_LEN);
    }

    #[test]
    fn test_malformed_input() {
        let mut cursor = ReadCursor::new(BASE);
        assert!(matches!(
            cursor.on_read(b"12x4"),
            Err(TransportError::MalformedPrefix(_))
        ));

        let mut cursor = ReadCursor::new(BASE);
        cursor.on_read(b"0005").unwrap();
        assert!(matches!(
            cursor.on_read(b"abc"),
            Err(TransportError::InvalidRecord(_))
        ));
        assert!(matches!(
            cursor.on_read(b"nosep"),
            Err(TransportError::InvalidRecord(_))
        ));
    }
}
