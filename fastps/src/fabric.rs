/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The fabric seam: connection-manager and verbs primitives behind one
//! object-safe trait.
//!
//! Protocol code only ever holds opaque handles and talks to an
//! `Arc<dyn Fabric>`. Two backends implement the trait:
//!
//! * [`local::LocalFabric`], a loopback fabric living inside the process,
//!   used to run whole producer/server/consumer topologies in tests;
//! * `verbs::VerbsFabric` (feature `verbs`), which calls librdmacm and
//!   libibverbs through `rdmacm-sys`.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

pub mod local;
#[cfg(feature = "verbs")]
pub mod verbs;

macro_rules! declare_handle {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            #[derive(Serialize, Deserialize)]
            pub struct $name(pub u64);
        )+
    };
}

declare_handle!(
    /// A connection-manager event channel.
    EventChannel,
    /// A connection-manager identifier: one per listener or connection.
    CmId,
    /// A fabric device (an opened verbs context).
    DeviceId,
    /// A protection domain.
    ProtectionDomain,
    /// A completion event channel.
    CompChannel,
    /// A completion queue.
    CompletionQueue,
    /// A memory registration.
    MrHandle,
);

/// Memory region access permissions. Values match `enum ibv_access_flags`.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessFlags(pub u32);

impl AccessFlags {
    pub const LOCAL_WRITE: Self = Self(1 << 0);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);

    /// No access beyond local reads, enough for send and write sources.
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The result of registering memory with a protection domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegistration {
    pub handle: MrHandle,
    pub addr: usize,
    pub length: usize,
    pub lkey: u32,
    pub rkey: u32,
}

/// A peer's memory as advertised in a READY message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRegion {
    pub addr: u64,
    pub rkey: u32,
}

impl RemoteRegion {
    /// The same region, `by` bytes further in.
    pub fn offset(self, by: u64) -> Self {
        Self {
            addr: self.addr + by,
            rkey: self.rkey,
        }
    }
}

/// A local scatter/gather entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// The operation carried by a send work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOp {
    /// Two-sided send consumed by a receive on the peer.
    Send,
    /// One-sided write into `remote`; with `imm`, also consumes a receive on
    /// the peer and hands it the immediate value.
    RdmaWrite {
        remote: RemoteRegion,
        imm: Option<u32>,
    },
    /// One-sided read from `remote` into the local entry.
    RdmaRead { remote: RemoteRegion },
}

/// A signaled send work request. `local` is `None` for zero-length
/// operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRequest {
    pub wr_id: u64,
    pub op: SendOp,
    pub local: Option<Sge>,
}

/// A receive work request. `local` is `None` when only immediate data is
/// expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvRequest {
    pub wr_id: u64,
    pub local: Option<Sge>,
}

/// Queue pair sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCapabilities {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

/// Parameters of an active connect or a passive accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub initiator_depth: u8,
    pub responder_resources: u8,
    pub rnr_retry_count: u8,
    pub private_data: Vec<u8>,
}

/// Connection-manager event types, in `enum rdma_cm_event_type` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    MulticastJoin,
    MulticastError,
    AddrChange,
    TimewaitExit,
    Unknown(u32),
}

impl From<u32> for CmEventKind {
    fn from(raw: u32) -> Self {
        match raw {
            0 => CmEventKind::AddrResolved,
            1 => CmEventKind::AddrError,
            2 => CmEventKind::RouteResolved,
            3 => CmEventKind::RouteError,
            4 => CmEventKind::ConnectRequest,
            5 => CmEventKind::ConnectResponse,
            6 => CmEventKind::ConnectError,
            7 => CmEventKind::Unreachable,
            8 => CmEventKind::Rejected,
            9 => CmEventKind::Established,
            10 => CmEventKind::Disconnected,
            11 => CmEventKind::DeviceRemoval,
            12 => CmEventKind::MulticastJoin,
            13 => CmEventKind::MulticastError,
            14 => CmEventKind::AddrChange,
            15 => CmEventKind::TimewaitExit,
            other => CmEventKind::Unknown(other),
        }
    }
}

/// A connection-manager event, copied out of the fabric and already
/// acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmEvent {
    pub kind: CmEventKind,
    /// The identifier the event is about. For `ConnectRequest` this is the
    /// new identifier of the incoming connection.
    pub id: CmId,
    /// The listening identifier, for `ConnectRequest`.
    pub listen_id: Option<CmId>,
    /// The device the identifier is bound to, once known.
    pub device: Option<DeviceId>,
    /// Private data carried by the connect request.
    pub private_data: Vec<u8>,
    pub status: i32,
}

/// Work completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WcStatus {
    Success,
    LocalLength,
    LocalProtection,
    WrFlush,
    RemoteInvalidRequest,
    RemoteAccess,
    RemoteOperation,
    RetryExceeded,
    RnrRetryExceeded,
    General,
    Other(u32),
}

/// Work completion opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
    Other(u32),
}

/// A work completion, with immediate data already in host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    pub imm: Option<u32>,
    pub vendor_err: u32,
}

impl WorkCompletion {
    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// Connection-manager and verbs primitives.
///
/// Methods mirror the librdmacm/libibverbs calls of the same name. Every
/// method is callable from any thread.
pub trait Fabric: Send + Sync + std::fmt::Debug {
    fn create_event_channel(&self) -> Result<EventChannel, anyhow::Error>;
    fn destroy_event_channel(&self, channel: EventChannel) -> Result<(), anyhow::Error>;
    fn create_id(&self, channel: EventChannel) -> Result<CmId, anyhow::Error>;
    fn destroy_id(&self, id: CmId) -> Result<(), anyhow::Error>;
    fn resolve_addr(
        &self,
        id: CmId,
        dst: SocketAddr,
        timeout: Duration,
    ) -> Result<(), anyhow::Error>;
    fn resolve_route(&self, id: CmId, timeout: Duration) -> Result<(), anyhow::Error>;
    fn bind_addr(&self, id: CmId, addr: SocketAddr) -> Result<(), anyhow::Error>;
    fn listen(&self, id: CmId, backlog: i32) -> Result<(), anyhow::Error>;
    /// The address `id` is bound to, with the port actually assigned.
    fn local_addr(&self, id: CmId) -> Result<SocketAddr, anyhow::Error>;
    fn connect(&self, id: CmId, params: &ConnectParams) -> Result<(), anyhow::Error>;
    fn accept(&self, id: CmId, params: &ConnectParams) -> Result<(), anyhow::Error>;
    fn disconnect(&self, id: CmId) -> Result<(), anyhow::Error>;
    /// Waits up to `wait` for the next event on `channel`. The event is
    /// acknowledged before it is returned.
    fn get_cm_event(
        &self,
        channel: EventChannel,
        wait: Duration,
    ) -> Result<Option<CmEvent>, anyhow::Error>;

    fn alloc_pd(&self, device: DeviceId) -> Result<ProtectionDomain, anyhow::Error>;
    fn dealloc_pd(&self, pd: ProtectionDomain) -> Result<(), anyhow::Error>;
    fn create_comp_channel(&self, device: DeviceId) -> Result<CompChannel, anyhow::Error>;
    fn destroy_comp_channel(&self, channel: CompChannel) -> Result<(), anyhow::Error>;
    fn create_cq(
        &self,
        device: DeviceId,
        entries: i32,
        channel: CompChannel,
    ) -> Result<CompletionQueue, anyhow::Error>;
    fn destroy_cq(&self, cq: CompletionQueue) -> Result<(), anyhow::Error>;
    /// Arms `cq` to raise one event on its channel for the next completion.
    fn req_notify_cq(&self, cq: CompletionQueue) -> Result<(), anyhow::Error>;
    /// Waits up to `wait` for a completion event on `channel`.
    fn get_cq_event(
        &self,
        channel: CompChannel,
        wait: Duration,
    ) -> Result<Option<CompletionQueue>, anyhow::Error>;
    fn ack_cq_events(&self, cq: CompletionQueue, count: u32) -> Result<(), anyhow::Error>;
    /// Non-blocking poll for one completion.
    fn poll_cq(&self, cq: CompletionQueue) -> Result<Option<WorkCompletion>, anyhow::Error>;
    /// Creates a reliable-connected queue pair on `id`, completing sends
    /// and receives on `cq`.
    fn create_qp(
        &self,
        id: CmId,
        pd: ProtectionDomain,
        cq: CompletionQueue,
        caps: &QpCapabilities,
    ) -> Result<(), anyhow::Error>;
    fn destroy_qp(&self, id: CmId) -> Result<(), anyhow::Error>;
    /// Registers `length` bytes at `addr` with `pd`.
    ///
    /// # Safety
    ///
    /// The memory must stay allocated until the registration is passed to
    /// [`Fabric::dereg_mr`]; the fabric reads and writes it concurrently
    /// with the caller.
    unsafe fn reg_mr(
        &self,
        pd: ProtectionDomain,
        addr: usize,
        length: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegistration, anyhow::Error>;
    fn dereg_mr(&self, mr: MrHandle) -> Result<(), anyhow::Error>;
    fn post_send(&self, id: CmId, request: &SendRequest) -> Result<(), anyhow::Error>;
    fn post_recv(&self, id: CmId, request: &RecvRequest) -> Result<(), anyhow::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_flags() {
        let flags = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ;
        assert_eq!(flags.0, 0b101);
        assert!(flags.contains(AccessFlags::REMOTE_READ));
        assert!(!flags.contains(AccessFlags::REMOTE_WRITE));
        assert!(flags.contains(AccessFlags::empty()));
    }

    #[test]
    fn test_cm_event_kind_from_raw() {
        assert_eq!(CmEventKind::from(0), CmEventKind::AddrResolved);
        assert_eq!(CmEventKind::from(4), CmEventKind::ConnectRequest);
        assert_eq!(CmEventKind::from(9), CmEventKind::Established);
        assert_eq!(CmEventKind::from(10), CmEventKind::Disconnected);
        assert_eq!(CmEventKind::from(99), CmEventKind::Unknown(99));
    }

    #[test]
    fn test_remote_region_offset() {
        let region = RemoteRegion {
            addr: 0x1000,
            rkey: 7,
        };
        let moved = region.offset(4);
        assert_eq!(moved.addr, 0x1004);
        assert_eq!(moved.rkey, 7);
    }
}
