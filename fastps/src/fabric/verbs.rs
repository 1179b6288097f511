/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The librdmacm/libibverbs backend.
//!
//! Handles are the raw library pointers. Inline verbs (`post_send`,
//! `post_recv`, `poll_cq`, `req_notify_cq`) are not exported symbols and are
//! reached through the `ibv_context` ops table. Blocking waits on the event
//! and completion channels poll the channel descriptor with a timeout before
//! calling into the library, so callers can re-check for shutdown.

use std::collections::HashMap;
use std::ffi::c_void;
use std::io::Error;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

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
use crate::fabric::SendOp;
use crate::fabric::SendRequest;
use crate::fabric::WcOpcode;
use crate::fabric::WcStatus;
use crate::fabric::WorkCompletion;

fn os_error(call: &str) -> anyhow::Error {
    anyhow!("{} failed: {}", call, Error::last_os_error())
}

fn check(ret: i32, call: &str) -> Result<(), anyhow::Error> {
    if ret != 0 {
        return Err(os_error(call));
    }
    Ok(())
}

fn wait_ms(wait: Duration) -> i32 {
    wait.as_millis().min(i32::MAX as u128) as i32
}

/// Waits for `fd` to become readable. Returns false if `wait` elapsed.
fn wait_readable(fd: i32, wait: Duration) -> Result<bool, anyhow::Error> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: `pfd` is a valid pollfd for the duration of the call.
    let ret = unsafe { libc::poll(&mut pfd, 1, wait_ms(wait)) };
    if ret < 0 {
        let err = Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(anyhow!("poll failed: {}", err));
    }
    Ok(ret > 0)
}

fn to_sockaddr(addr: &SocketAddr) -> libc::sockaddr_storage {
    // SAFETY: sockaddr_storage is plain old data and all-zero is a valid
    // (unspecified) address.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            // SAFETY: sockaddr_storage is large enough and suitably aligned
            // for every socket address type.
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            // SAFETY: as above.
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                (*sin6).sin6_scope_id = v6.scope_id();
            }
        }
    }
    storage
}

fn wc_status(status: rdmacm_sys::ibv_wc_status::Type) -> WcStatus {
    use rdmacm_sys::ibv_wc_status::*;
    match status {
        IBV_WC_SUCCESS => WcStatus::Success,
        IBV_WC_LOC_LEN_ERR => WcStatus::LocalLength,
        IBV_WC_LOC_PROT_ERR => WcStatus::LocalProtection,
        IBV_WC_WR_FLUSH_ERR => WcStatus::WrFlush,
        IBV_WC_REM_INV_REQ_ERR => WcStatus::RemoteInvalidRequest,
        IBV_WC_REM_ACCESS_ERR => WcStatus::RemoteAccess,
        IBV_WC_REM_OP_ERR => WcStatus::RemoteOperation,
        IBV_WC_RETRY_EXC_ERR => WcStatus::RetryExceeded,
        IBV_WC_RNR_RETRY_EXC_ERR => WcStatus::RnrRetryExceeded,
        IBV_WC_GENERAL_ERR => WcStatus::General,
        other => WcStatus::Other(other),
    }
}

fn wc_opcode(opcode: rdmacm_sys::ibv_wc_opcode::Type) -> WcOpcode {
    use rdmacm_sys::ibv_wc_opcode::*;
    match opcode {
        IBV_WC_SEND => WcOpcode::Send,
        IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
        IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
        IBV_WC_RECV => WcOpcode::Recv,
        IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvRdmaWithImm,
        other => WcOpcode::Other(other),
    }
}

fn cm_id(id: CmId) -> *mut rdmacm_sys::rdma_cm_id {
    id.0 as usize as *mut rdmacm_sys::rdma_cm_id
}

fn device_context(device: DeviceId) -> *mut rdmacm_sys::ibv_context {
    device.0 as usize as *mut rdmacm_sys::ibv_context
}

/// Returns the number of verbs devices on this host.
pub fn device_count() -> usize {
    let mut num_devices = 0i32;
    // SAFETY: the list is freed right after counting.
    unsafe {
        let devices = rdmacm_sys::ibv_get_device_list(&mut num_devices);
        if devices.is_null() {
            return 0;
        }
        rdmacm_sys::ibv_free_device_list(devices);
    }
    num_devices.max(0) as usize
}

/// The librdmacm/libibverbs fabric.
#[derive(Debug, Default)]
pub struct VerbsFabric {
    bound: Mutex<HashMap<CmId, SocketAddr>>,
}

impl VerbsFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn conn_param(params: &ConnectParams) -> rdmacm_sys::rdma_conn_param {
        rdmacm_sys::rdma_conn_param {
            private_data: if params.private_data.is_empty() {
                std::ptr::null()
            } else {
                params.private_data.as_ptr() as *const c_void
            },
            private_data_len: params.private_data.len() as u8,
            responder_resources: params.responder_resources,
            initiator_depth: params.initiator_depth,
            rnr_retry_count: params.rnr_retry_count,
            ..Default::default()
        }
    }

    /// Copies an event out of the library and acknowledges it.
    ///
    /// # Safety
    ///
    /// `event` must be an unacknowledged event returned by
    /// `rdma_get_cm_event`.
    unsafe fn take_event(event: *mut rdmacm_sys::rdma_cm_event) -> Result<CmEvent, anyhow::Error> {
        let kind = CmEventKind::from((*event).event);
        let id = (*event).id;
        let listen_id = (*event).listen_id;
        let device = if id.is_null() || (*id).verbs.is_null() {
            None
        } else {
            Some(DeviceId((*id).verbs as usize as u64))
        };
        let private_data = match kind {
            CmEventKind::ConnectRequest | CmEventKind::Established => {
                let conn = &(*event).param.conn;
                if conn.private_data.is_null() {
                    Vec::new()
                } else {
                    std::slice::from_raw_parts(
                        conn.private_data as *const u8,
                        conn.private_data_len as usize,
                    )
                    .to_vec()
                }
            }
            _ => Vec::new(),
        };
        let taken = CmEvent {
            kind,
            id: CmId(id as usize as u64),
            listen_id: (!listen_id.is_null()).then(|| CmId(listen_id as usize as u64)),
            device,
            private_data,
            status: (*event).status,
        };
        check(rdmacm_sys::rdma_ack_cm_event(event), "rdma_ack_cm_event")?;
        Ok(taken)
    }
}

impl Fabric for VerbsFabric {
    fn create_event_channel(&self) -> Result<EventChannel, anyhow::Error> {
        // SAFETY: plain constructor call; null is checked.
        let channel = unsafe { rdmacm_sys::rdma_create_event_channel() };
        if channel.is_null() {
            return Err(os_error("rdma_create_event_channel"));
        }
        Ok(EventChannel(channel as usize as u64))
    }

    fn destroy_event_channel(&self, channel: EventChannel) -> Result<(), anyhow::Error> {
        // SAFETY: the handle came from `create_event_channel`.
        unsafe {
            rdmacm_sys::rdma_destroy_event_channel(
                channel.0 as usize as *mut rdmacm_sys::rdma_event_channel,
            )
        };
        Ok(())
    }

    fn create_id(&self, channel: EventChannel) -> Result<CmId, anyhow::Error> {
        let mut id: *mut rdmacm_sys::rdma_cm_id = std::ptr::null_mut();
        // SAFETY: the channel handle came from `create_event_channel`.
        let ret = unsafe {
            rdmacm_sys::rdma_create_id(
                channel.0 as usize as *mut rdmacm_sys::rdma_event_channel,
                &mut id,
                std::ptr::null_mut(),
                rdmacm_sys::rdma_port_space::RDMA_PS_TCP,
            )
        };
        check(ret, "rdma_create_id")?;
        Ok(CmId(id as usize as u64))
    }

    fn destroy_id(&self, id: CmId) -> Result<(), anyhow::Error> {
        self.bound.lock().expect("bound lock poisoned").remove(&id);
        // SAFETY: the handle came from `create_id` or a connect request.
        check(unsafe { rdmacm_sys::rdma_destroy_id(cm_id(id)) }, "rdma_destroy_id")
    }

    fn resolve_addr(
        &self,
        id: CmId,
        dst: SocketAddr,
        timeout: Duration,
    ) -> Result<(), anyhow::Error> {
        let mut storage = to_sockaddr(&dst);
        // SAFETY: `storage` outlives the call, which copies the address.
        let ret = unsafe {
            rdmacm_sys::rdma_resolve_addr(
                cm_id(id),
                std::ptr::null_mut(),
                &mut storage as *mut libc::sockaddr_storage as *mut rdmacm_sys::sockaddr,
                wait_ms(timeout),
            )
        };
        check(ret, "rdma_resolve_addr")
    }

    fn resolve_route(&self, id: CmId, timeout: Duration) -> Result<(), anyhow::Error> {
        // SAFETY: the handle came from `create_id`.
        check(
            unsafe { rdmacm_sys::rdma_resolve_route(cm_id(id), wait_ms(timeout)) },
            "rdma_resolve_route",
        )
    }

    fn bind_addr(&self, id: CmId, addr: SocketAddr) -> Result<(), anyhow::Error> {
        let mut storage = to_sockaddr(&addr);
        // SAFETY: `storage` outlives the call, which copies the address.
        let ret = unsafe {
            rdmacm_sys::rdma_bind_addr(
                cm_id(id),
                &mut storage as *mut libc::sockaddr_storage as *mut rdmacm_sys::sockaddr,
            )
        };
        check(ret, "rdma_bind_addr")?;
        self.bound
            .lock()
            .expect("bound lock poisoned")
            .insert(id, addr);
        Ok(())
    }

    fn listen(&self, id: CmId, backlog: i32) -> Result<(), anyhow::Error> {
        // SAFETY: the handle came from `create_id`.
        check(unsafe { rdmacm_sys::rdma_listen(cm_id(id), backlog) }, "rdma_listen")
    }

    fn local_addr(&self, id: CmId) -> Result<SocketAddr, anyhow::Error> {
        let ip = self
            .bound
            .lock()
            .expect("bound lock poisoned")
            .get(&id)
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        // SAFETY: the handle came from `create_id`.
        let port = u16::from_be(unsafe { rdmacm_sys::rdma_get_src_port(cm_id(id)) });
        Ok(SocketAddr::new(ip, port))
    }

    fn connect(&self, id: CmId, params: &ConnectParams) -> Result<(), anyhow::Error> {
        ensure!(params.private_data.len() <= u8::MAX as usize, "private data too long");
        let mut param = Self::conn_param(params);
        // SAFETY: `param` and the private data it points to outlive the call.
        check(unsafe { rdmacm_sys::rdma_connect(cm_id(id), &mut param) }, "rdma_connect")
    }

    fn accept(&self, id: CmId, params: &ConnectParams) -> Result<(), anyhow::Error> {
        let mut param = Self::conn_param(params);
        // SAFETY: `param` and the private data it points to outlive the call.
        check(unsafe { rdmacm_sys::rdma_accept(cm_id(id), &mut param) }, "rdma_accept")
    }

    fn disconnect(&self, id: CmId) -> Result<(), anyhow::Error> {
        // SAFETY: the handle came from `create_id` or a connect request.
        check(unsafe { rdmacm_sys::rdma_disconnect(cm_id(id)) }, "rdma_disconnect")
    }

    fn get_cm_event(
        &self,
        channel: EventChannel,
        wait: Duration,
    ) -> Result<Option<CmEvent>, anyhow::Error> {
        let channel = channel.0 as usize as *mut rdmacm_sys::rdma_event_channel;
        // SAFETY: the channel handle came from `create_event_channel`.
        if !wait_readable(unsafe { (*channel).fd }, wait)? {
            return Ok(None);
        }
        let mut event: *mut rdmacm_sys::rdma_cm_event = std::ptr::null_mut();
        // SAFETY: the channel is readable, so the call does not block; the
        // event is acknowledged by `take_event`.
        unsafe {
            check(rdmacm_sys::rdma_get_cm_event(channel, &mut event), "rdma_get_cm_event")?;
            Self::take_event(event).map(Some)
        }
    }

    fn alloc_pd(&self, device: DeviceId) -> Result<ProtectionDomain, anyhow::Error> {
        // SAFETY: the device handle is the verbs context of a cm id.
        let pd = unsafe { rdmacm_sys::ibv_alloc_pd(device_context(device)) };
        if pd.is_null() {
            return Err(os_error("ibv_alloc_pd"));
        }
        Ok(ProtectionDomain(pd as usize as u64))
    }

    fn dealloc_pd(&self, pd: ProtectionDomain) -> Result<(), anyhow::Error> {
        // SAFETY: the handle came from `alloc_pd`.
        check(
            unsafe { rdmacm_sys::ibv_dealloc_pd(pd.0 as usize as *mut rdmacm_sys::ibv_pd) },
            "ibv_dealloc_pd",
        )
    }

    fn create_comp_channel(&self, device: DeviceId) -> Result<CompChannel, anyhow::Error> {
        // SAFETY: the device handle is the verbs context of a cm id.
        let channel = unsafe { rdmacm_sys::ibv_create_comp_channel(device_context(device)) };
        if channel.is_null() {
            return Err(os_error("ibv_create_comp_channel"));
        }
        Ok(CompChannel(channel as usize as u64))
    }

    fn destroy_comp_channel(&self, channel: CompChannel) -> Result<(), anyhow::Error> {
        // SAFETY: the handle came from `create_comp_channel`.
        check(
            unsafe {
                rdmacm_sys::ibv_destroy_comp_channel(
                    channel.0 as usize as *mut rdmacm_sys::ibv_comp_channel,
                )
            },
            "ibv_destroy_comp_channel",
        )
    }

    fn create_cq(
        &self,
        device: DeviceId,
        entries: i32,
        channel: CompChannel,
    ) -> Result<CompletionQueue, anyhow::Error> {
        // SAFETY: both handles came from this fabric.
        let cq = unsafe {
            rdmacm_sys::ibv_create_cq(
                device_context(device),
                entries,
                std::ptr::null_mut(),
                channel.0 as usize as *mut rdmacm_sys::ibv_comp_channel,
                0,
            )
        };
        if cq.is_null() {
            return Err(os_error("ibv_create_cq"));
        }
        Ok(CompletionQueue(cq as usize as u64))
    }

    fn destroy_cq(&self, cq: CompletionQueue) -> Result<(), anyhow::Error> {
        // SAFETY: the handle came from `create_cq`.
        check(
            unsafe { rdmacm_sys::ibv_destroy_cq(cq.0 as usize as *mut rdmacm_sys::ibv_cq) },
            "ibv_destroy_cq",
        )
    }

    fn req_notify_cq(&self, cq: CompletionQueue) -> Result<(), anyhow::Error> {
        // SAFETY: the handle came from `create_cq`; its context stays open
        // while the cq exists.
        unsafe {
            let cq = cq.0 as usize as *mut rdmacm_sys::ibv_cq;
            let context = (*cq).context;
            let req_notify = (*context)
                .ops
                .req_notify_cq
                .ok_or_else(|| anyhow!("device has no req_notify_cq"))?;
            check(req_notify(cq, 0), "ibv_req_notify_cq")
        }
    }

    fn get_cq_event(
        &self,
        channel: CompChannel,
        wait: Duration,
    ) -> Result<Option<CompletionQueue>, anyhow::Error> {
        let channel = channel.0 as usize as *mut rdmacm_sys::ibv_comp_channel;
        // SAFETY: the handle came from `create_comp_channel`.
        if !wait_readable(unsafe { (*channel).fd }, wait)? {
            return Ok(None);
        }
        let mut cq: *mut rdmacm_sys::ibv_cq = std::ptr::null_mut();
        let mut context: *mut c_void = std::ptr::null_mut();
        // SAFETY: the channel is readable, so the call does not block.
        check(
            unsafe { rdmacm_sys::ibv_get_cq_event(channel, &mut cq, &mut context) },
            "ibv_get_cq_event",
        )?;
        Ok(Some(CompletionQueue(cq as usize as u64)))
    }

    fn ack_cq_events(&self, cq: CompletionQueue, count: u32) -> Result<(), anyhow::Error> {
        // SAFETY: the handle came from `create_cq`.
        unsafe { rdmacm_sys::ibv_ack_cq_events(cq.0 as usize as *mut rdmacm_sys::ibv_cq, count) };
        Ok(())
    }

    fn poll_cq(&self, cq: CompletionQueue) -> Result<Option<WorkCompletion>, anyhow::Error> {
        // SAFETY: the handle came from `create_cq`; `wc` lives on the stack
        // for the duration of the call.
        unsafe {
            let cq = cq.0 as usize as *mut rdmacm_sys::ibv_cq;
            let context = (*cq).context;
            let poll = (*context)
                .ops
                .poll_cq
                .ok_or_else(|| anyhow!("device has no poll_cq"))?;
            let mut wc = rdmacm_sys::ibv_wc::default();
            let ret = poll(cq, 1, &mut wc);
            if ret < 0 {
                return Err(anyhow!("failed to poll CQ: {}", Error::last_os_error()));
            }
            if ret == 0 {
                return Ok(None);
            }
            Ok(Some(WorkCompletion {
                wr_id: wc.wr_id(),
                status: wc_status(wc.status()),
                opcode: wc_opcode(wc.opcode()),
                byte_len: wc.byte_len(),
                imm: wc.imm_data().map(u32::from_be),
                vendor_err: wc.vendor_err(),
            }))
        }
    }

    fn create_qp(
        &self,
        id: CmId,
        pd: ProtectionDomain,
        cq: CompletionQueue,
        caps: &QpCapabilities,
    ) -> Result<(), anyhow::Error> {
        let cq = cq.0 as usize as *mut rdmacm_sys::ibv_cq;
        let mut attr = rdmacm_sys::ibv_qp_init_attr {
            send_cq: cq,
            recv_cq: cq,
            qp_type: rdmacm_sys::ibv_qp_type::IBV_QPT_RC,
            cap: rdmacm_sys::ibv_qp_cap {
                max_send_wr: caps.max_send_wr,
                max_recv_wr: caps.max_recv_wr,
                max_send_sge: caps.max_send_sge,
                max_recv_sge: caps.max_recv_sge,
                max_inline_data: 0,
            },
            ..Default::default()
        };
        // SAFETY: all handles came from this fabric; `attr` outlives the call.
        check(
            unsafe {
                rdmacm_sys::rdma_create_qp(
                    cm_id(id),
                    pd.0 as usize as *mut rdmacm_sys::ibv_pd,
                    &mut attr,
                )
            },
            "rdma_create_qp",
        )
    }

    fn destroy_qp(&self, id: CmId) -> Result<(), anyhow::Error> {
        // SAFETY: the handle came from `create_id` or a connect request.
        unsafe {
            let id = cm_id(id);
            if !(*id).qp.is_null() {
                rdmacm_sys::rdma_destroy_qp(id);
            }
        }
        Ok(())
    }

    unsafe fn reg_mr(
        &self,
        pd: ProtectionDomain,
        addr: usize,
        length: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegistration, anyhow::Error> {
        let mr = rdmacm_sys::ibv_reg_mr(
            pd.0 as usize as *mut rdmacm_sys::ibv_pd,
            addr as *mut c_void,
            length,
            access.0 as i32,
        );
        if mr.is_null() {
            return Err(os_error("ibv_reg_mr"));
        }
        Ok(MemoryRegistration {
            handle: MrHandle(mr as usize as u64),
            addr,
            length,
            lkey: (*mr).lkey,
            rkey: (*mr).rkey,
        })
    }

    fn dereg_mr(&self, mr: MrHandle) -> Result<(), anyhow::Error> {
        // SAFETY: the handle came from `reg_mr`.
        check(
            unsafe { rdmacm_sys::ibv_dereg_mr(mr.0 as usize as *mut rdmacm_sys::ibv_mr) },
            "ibv_dereg_mr",
        )
    }

    fn post_send(&self, id: CmId, request: &SendRequest) -> Result<(), anyhow::Error> {
        // SAFETY:
        // - the scatter/gather entry and work request live on the stack for
        //   the duration of the call
        // - local addresses are not dereferenced here, only handed to the
        //   device, and belong to live registrations
        // - remote address/key pairs come from a READY message
        unsafe {
            let qp = (*cm_id(id)).qp;
            if qp.is_null() {
                return Err(TransportError::NotConnected(id).into());
            }
            let context = (*qp).context;
            let post_send = (*context)
                .ops
                .post_send
                .ok_or_else(|| anyhow!("device has no post_send"))?;

            let mut sge = request.local.map(|local| rdmacm_sys::ibv_sge {
                addr: local.addr,
                length: local.length,
                lkey: local.lkey,
            });
            let (sg_list, num_sge) = match sge.as_mut() {
                Some(sge) => (sge as *mut rdmacm_sys::ibv_sge, 1),
                None => (std::ptr::null_mut(), 0),
            };
            let opcode = match request.op {
                SendOp::Send => rdmacm_sys::ibv_wr_opcode::IBV_WR_SEND,
                SendOp::RdmaWrite { imm: None, .. } => rdmacm_sys::ibv_wr_opcode::IBV_WR_RDMA_WRITE,
                SendOp::RdmaWrite { imm: Some(_), .. } => {
                    rdmacm_sys::ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM
                }
                SendOp::RdmaRead { .. } => rdmacm_sys::ibv_wr_opcode::IBV_WR_RDMA_READ,
            };
            let mut wr = rdmacm_sys::ibv_send_wr {
                wr_id: request.wr_id,
                next: std::ptr::null_mut(),
                sg_list,
                num_sge,
                opcode,
                send_flags: rdmacm_sys::ibv_send_flags::IBV_SEND_SIGNALED.0,
                wr: Default::default(),
                qp_type: Default::default(),
                __bindgen_anon_1: Default::default(),
                __bindgen_anon_2: Default::default(),
            };
            match request.op {
                SendOp::Send => {}
                SendOp::RdmaWrite { remote, imm } => {
                    wr.wr.rdma.remote_addr = remote.addr;
                    wr.wr.rdma.rkey = remote.rkey;
                    if let Some(imm) = imm {
                        wr.__bindgen_anon_1.imm_data = imm.to_be();
                    }
                }
                SendOp::RdmaRead { remote } => {
                    wr.wr.rdma.remote_addr = remote.addr;
                    wr.wr.rdma.rkey = remote.rkey;
                }
            }

            let mut bad_wr: *mut rdmacm_sys::ibv_send_wr = std::ptr::null_mut();
            let errno = post_send(qp, &mut wr, &mut bad_wr);
            if errno != 0 {
                return Err(anyhow!(
                    "failed to post send request: {}",
                    Error::from_raw_os_error(errno)
                ));
            }
            tracing::trace!("posted {:?} (wr {}) on {:?}", request.op, request.wr_id, id);
            Ok(())
        }
    }

    fn post_recv(&self, id: CmId, request: &RecvRequest) -> Result<(), anyhow::Error> {
        // SAFETY: as for `post_send`.
        unsafe {
            let qp = (*cm_id(id)).qp;
            ensure!(!qp.is_null(), "no queue pair on {:?}", id);
            let context = (*qp).context;
            let post_recv = (*context)
                .ops
                .post_recv
                .ok_or_else(|| anyhow!("device has no post_recv"))?;

            let mut sge = request.local.map(|local| rdmacm_sys::ibv_sge {
                addr: local.addr,
                length: local.length,
                lkey: local.lkey,
            });
            let (sg_list, num_sge) = match sge.as_mut() {
                Some(sge) => (sge as *mut rdmacm_sys::ibv_sge, 1),
                None => (std::ptr::null_mut(), 0),
            };
            let mut wr = rdmacm_sys::ibv_recv_wr {
                wr_id: request.wr_id,
                sg_list,
                num_sge,
                ..Default::default()
            };
            let mut bad_wr: *mut rdmacm_sys::ibv_recv_wr = std::ptr::null_mut();
            let errno = post_recv(qp, &mut wr, &mut bad_wr);
            if errno != 0 {
                return Err(anyhow!(
                    "failed to post receive request: {}",
                    Error::from_raw_os_error(errno)
                ));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_conversion() {
        let addr: SocketAddr = "[::1]:20079".parse().unwrap();
        let storage = to_sockaddr(&addr);
        assert_eq!(storage.ss_family as i32, libc::AF_INET6);

        let addr: SocketAddr = "10.0.0.1:7471".parse().unwrap();
        let storage = to_sockaddr(&addr);
        assert_eq!(storage.ss_family as i32, libc::AF_INET);
        let sin = &storage as *const libc::sockaddr_storage as *const libc::sockaddr_in;
        // SAFETY: the storage holds an AF_INET address.
        let port = unsafe { (*sin).sin_port };
        assert_eq!(u16::from_be(port), 7471);
    }

    #[test]
    fn test_listen_on_ephemeral_port() -> Result<(), anyhow::Error> {
        if device_count() == 0 {
            println!("Skipping test: RDMA devices not available");
            return Ok(());
        }
        let fabric = VerbsFabric::new();
        let channel = fabric.create_event_channel()?;
        let id = fabric.create_id(channel)?;
        fabric.bind_addr(id, "[::]:0".parse()?)?;
        fabric.listen(id, 10)?;
        assert_ne!(fabric.local_addr(id)?.port(), 0);
        assert!(fabric
            .get_cm_event(channel, Duration::from_millis(10))?
            .is_none());
        fabric.destroy_id(id)?;
        fabric.destroy_event_channel(channel)?;
        Ok(())
    }
}
