/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Wire formats.
//!
//! Two kinds of bytes cross the fabric:
//!
//! * [`ControlMessage`]s, sent with two-sided sends. A control message is
//!   24 bytes, little-endian:
//!
//!   | bytes    | field                                |
//!   |----------|--------------------------------------|
//!   | `0..4`   | kind: 1 = READY, 2 = DONE            |
//!   | `4..8`   | reserved, zero                       |
//!   | `8..16`  | remote address (READY only)          |
//!   | `16..20` | remote key (READY only)              |
//!   | `20..24` | reserved, zero                       |
//!
//! * Records. A producer writes a record's payload, `key/value`, with the
//!   payload length as immediate data. In the shared log a payload is
//!   preceded by its length as four ASCII decimal digits, and the log ends
//!   where the next prefix is still unwritten (NUL bytes) or reads `0000`.

use std::fmt;

use crate::error::TransportError;
use crate::fabric::RemoteRegion;

/// Size of an encoded [`ControlMessage`].
pub const CONTROL_MESSAGE_LEN: usize = 24;

/// Size of a record length prefix.
pub const PREFIX_LEN: usize = 4;

/// The largest payload a four-digit prefix can describe.
pub const MAX_PAYLOAD_LEN: usize = 9999;

/// Separates key from value in a payload.
pub const SEPARATOR: u8 = b'/';

/// The prefix that ends a shared log.
pub const END_OF_STREAM: [u8; PREFIX_LEN] = *b"0000";

const KIND_READY: u32 = 1;
const KIND_DONE: u32 = 2;

/// Flow control between a peer and the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// The sender can accept (or serve) the next record at `region`.
    Ready(RemoteRegion),
    /// The sender saw the end of the stream; the receiver should disconnect.
    Done,
}

impl ControlMessage {
    pub fn encode(&self) -> [u8; CONTROL_MESSAGE_LEN] {
        let mut buf = [0u8; CONTROL_MESSAGE_LEN];
        match self {
            ControlMessage::Ready(region) => {
                buf[0..4].copy_from_slice(&KIND_READY.to_le_bytes());
                buf[8..16].copy_from_slice(&region.addr.to_le_bytes());
                buf[16..20].copy_from_slice(&region.rkey.to_le_bytes());
            }
            ControlMessage::Done => buf[0..4].copy_from_slice(&KIND_DONE.to_le_bytes()),
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TransportError> {
        if buf.len() < CONTROL_MESSAGE_LEN {
            return Err(TransportError::MalformedControlMessage(format!(
                "{} bytes, expected {}",
                buf.len(),
                CONTROL_MESSAGE_LEN
            )));
        }
        let word = |range: std::ops::Range<usize>| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&buf[range]);
            u32::from_le_bytes(bytes)
        };
        match word(0..4) {
            KIND_READY => {
                let mut addr = [0u8; 8];
                addr.copy_from_slice(&buf[8..16]);
                Ok(ControlMessage::Ready(RemoteRegion {
                    addr: u64::from_le_bytes(addr),
                    rkey: word(16..20),
                }))
            }
            KIND_DONE => Ok(ControlMessage::Done),
            kind => Err(TransportError::MalformedControlMessage(format!(
                "unknown kind {}",
                kind
            ))),
        }
    }
}

/// What a connecting client does, carried as connection private data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientRole {
    Producer = 1,
    Consumer = 2,
}

impl ClientRole {
    pub fn private_data(self) -> Vec<u8> {
        vec![self as u8]
    }

    pub fn from_private_data(data: &[u8]) -> Result<Self, TransportError> {
        match data.first() {
            Some(1) => Ok(ClientRole::Producer),
            Some(2) => Ok(ClientRole::Consumer),
            Some(other) => Err(TransportError::MalformedControlMessage(format!(
                "unknown client role {}",
                other
            ))),
            None => Err(TransportError::MalformedControlMessage(
                "connect request carries no client role".to_string(),
            )),
        }
    }
}

/// A key/value pair. Neither part contains [`SEPARATOR`] or NUL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Record {
    key: Vec<u8>,
    value: Vec<u8>,
}

fn validate(what: &str, bytes: &[u8]) -> Result<(), TransportError> {
    match bytes.iter().position(|b| *b == SEPARATOR || *b == 0) {
        Some(at) => Err(TransportError::InvalidRecord(format!(
            "{} contains reserved byte 0x{:02x} at {}",
            what, bytes[at], at
        ))),
        None => Ok(()),
    }
}

impl Record {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<Self, TransportError> {
        let (key, value) = (key.into(), value.into());
        validate("key", &key)?;
        validate("value", &value)?;
        Ok(Self { key, value })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        (self.key, self.value)
    }

    /// Length of `key/value`.
    pub fn payload_len(&self) -> usize {
        self.key.len() + 1 + self.value.len()
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.payload_len());
        payload.extend_from_slice(&self.key);
        payload.push(SEPARATOR);
        payload.extend_from_slice(&self.value);
        payload
    }

    /// Splits a payload at its first separator.
    pub fn from_payload(payload: &[u8]) -> Result<Self, TransportError> {
        let at = payload
            .iter()
            .position(|b| *b == SEPARATOR)
            .ok_or_else(|| {
                TransportError::InvalidRecord(format!(
                    "payload {:?} has no separator",
                    String::from_utf8_lossy(payload)
                ))
            })?;
        Ok(Self {
            key: payload[..at].to_vec(),
            value: payload[at + 1..].to_vec(),
        })
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.value)
        )
    }
}

/// A decoded length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    /// At least one byte is still NUL: nothing has been published here yet.
    Unwritten,
    /// `0000`.
    EndOfStream,
    /// A record of this many bytes follows.
    Length(usize),
}

pub fn encode_prefix(len: usize) -> Result<[u8; PREFIX_LEN], TransportError> {
    if len == 0 || len > MAX_PAYLOAD_LEN {
        return Err(TransportError::RecordTooLarge {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    let mut prefix = [0u8; PREFIX_LEN];
    prefix.copy_from_slice(format!("{:04}", len).as_bytes());
    Ok(prefix)
}

pub fn parse_prefix(bytes: &[u8]) -> Result<Prefix, TransportError> {
    if bytes.len() != PREFIX_LEN {
        return Err(TransportError::MalformedPrefix(bytes.to_vec()));
    }
    if bytes.contains(&0) {
        return Ok(Prefix::Unwritten);
    }
    if bytes == END_OF_STREAM {
        return Ok(Prefix::EndOfStream);
    }
    if !bytes.iter().all(u8::is_ascii_digit) {
        return Err(TransportError::MalformedPrefix(bytes.to_vec()));
    }
    let len = bytes
        .iter()
        .fold(0usize, |len, digit| len * 10 + (digit - b'0') as usize);
    Ok(Prefix::Length(len))
}
