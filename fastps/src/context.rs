/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The per-process transport context.
//!
//! A [`TransportContext`] owns everything shared by the connections of one
//! endpoint: the device binding, a protection domain, one completion queue
//! with its completion channel, and the dispatcher thread draining that
//! queue. It is created lazily, for the device named by the first
//! connection event, through a [`ContextSlot`]. Later connections reuse it;
//! a connection on any other device is refused.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use anyhow::anyhow;

use crate::config::TransportConfig;
use crate::dispatcher;
use crate::error::FaultSlot;
use crate::error::TransportError;
use crate::event_loop::ConnectionHooks;
use crate::fabric::AccessFlags;
use crate::fabric::CmId;
use crate::fabric::CompChannel;
use crate::fabric::CompletionQueue;
use crate::fabric::ConnectParams;
use crate::fabric::DeviceId;
use crate::fabric::Fabric;
use crate::fabric::ProtectionDomain;
use crate::fabric::QpCapabilities;
use crate::memory::RegisteredBuffer;

fn release(what: &str, result: Result<(), anyhow::Error>) -> Result<(), anyhow::Error> {
    result.map_err(|err| err.context(format!("failed to release {}", what)))
}

/// Device-wide transport resources. See the module documentation.
#[derive(Debug)]
pub struct TransportContext {
    fabric: Arc<dyn Fabric>,
    config: TransportConfig,
    device: DeviceId,
    pd: ProtectionDomain,
    comp_channel: CompChannel,
    cq: CompletionQueue,
    fault: FaultSlot,
    stopping: AtomicBool,
    released: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TransportContext {
    /// Allocates the protection domain, completion channel and completion
    /// queue for `device`, arms the queue, and starts the dispatcher.
    /// Completions are delivered to `hooks`.
    pub fn create(
        fabric: Arc<dyn Fabric>,
        device: DeviceId,
        config: TransportConfig,
        fault: FaultSlot,
        hooks: Arc<dyn ConnectionHooks>,
    ) -> Result<Arc<Self>, anyhow::Error> {
        tracing::debug!("creating transport context for {:?}", device);
        let pd = fabric.alloc_pd(device)?;
        let comp_channel = match fabric.create_comp_channel(device) {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(release_err) = fabric.dealloc_pd(pd) {
                    tracing::warn!("dealloc_pd after failed create: {:#}", release_err);
                }
                return Err(err);
            }
        };
        let cq = match fabric.create_cq(device, config.cq_entries, comp_channel) {
            Ok(cq) => cq,
            Err(err) => {
                if let Err(release_err) = fabric.destroy_comp_channel(comp_channel) {
                    tracing::warn!(
                        "destroy_comp_channel after failed create: {:#}",
                        release_err
                    );
                }
                if let Err(release_err) = fabric.dealloc_pd(pd) {
                    tracing::warn!("dealloc_pd after failed create: {:#}", release_err);
                }
                return Err(err);
            }
        };
        let context = Arc::new(Self {
            fabric,
            config,
            device,
            pd,
            comp_channel,
            cq,
            fault,
            stopping: AtomicBool::new(false),
            released: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        });

        let started = context
            .fabric
            .req_notify_cq(cq)
            .and_then(|()| dispatcher::spawn_dispatcher(context.clone(), hooks));
        match started {
            Ok(handle) => {
                *context.dispatcher.lock().expect("dispatcher lock poisoned") = Some(handle);
                Ok(context)
            }
            Err(err) => {
                if let Err(release_err) = context.release_resources() {
                    tracing::warn!("{:#}", release_err);
                }
                Err(err)
            }
        }
    }

    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn pd(&self) -> ProtectionDomain {
        self.pd
    }

    pub fn cq(&self) -> CompletionQueue {
        self.cq
    }

    pub fn comp_channel(&self) -> CompChannel {
        self.comp_channel
    }

    pub fn fault(&self) -> &FaultSlot {
        &self.fault
    }

    /// True once shutdown has begun; the dispatcher exits at its next wake.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Allocates and registers a buffer in this context's protection domain.
    pub fn register_buffer(
        &self,
        len: usize,
        access: AccessFlags,
    ) -> Result<RegisteredBuffer, anyhow::Error> {
        RegisteredBuffer::new(self.fabric.clone(), self.pd, len, access)
    }

    pub fn capabilities(&self) -> QpCapabilities {
        QpCapabilities {
            max_send_wr: self.config.max_send_wr,
            max_recv_wr: self.config.max_recv_wr,
            max_send_sge: self.config.max_send_sge,
            max_recv_sge: self.config.max_recv_sge,
        }
    }

    /// Creates a reliable-connected queue pair on `id`, with both work
    /// queues completing to the shared completion queue.
    pub fn build_queue_pair(&self, id: CmId) -> Result<(), anyhow::Error> {
        self.fabric
            .create_qp(id, self.pd, self.cq, &self.capabilities())
    }

    pub fn connect_params(&self, private_data: Vec<u8>) -> ConnectParams {
        ConnectParams {
            initiator_depth: self.config.initiator_depth,
            responder_resources: self.config.responder_resources,
            rnr_retry_count: self.config.rnr_retry_count,
            private_data,
        }
    }

    /// Stops the dispatcher and waits for it to exit. Completions that
    /// arrive afterwards are not processed.
    pub fn stop_dispatcher(&self) -> Result<(), anyhow::Error> {
        self.stopping.store(true, Ordering::SeqCst);
        let handle = self
            .dispatcher
            .lock()
            .expect("dispatcher lock poisoned")
            .take();
        match handle {
            Some(handle) if handle.thread().id() != std::thread::current().id() => handle
                .join()
                .map_err(|_| anyhow!("completion dispatcher panicked")),
            _ => Ok(()),
        }
    }

    fn release_resources(&self) -> Result<(), anyhow::Error> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let results = [
            release("completion queue", self.fabric.destroy_cq(self.cq)),
            release(
                "completion channel",
                self.fabric.destroy_comp_channel(self.comp_channel),
            ),
            release("protection domain", self.fabric.dealloc_pd(self.pd)),
        ];
        results.into_iter().collect()
    }

    /// Stops the dispatcher, then releases the completion queue, the
    /// completion channel and the protection domain. Every queue pair and
    /// registration made through this context must already be gone.
    /// Idempotent.
    pub fn shutdown(&self) -> Result<(), anyhow::Error> {
        self.stop_dispatcher()?;
        self.release_resources()?;
        tracing::debug!("transport context for {:?} shut down", self.device);
        Ok(())
    }
}

/// Holds the context of one endpoint and creates it on first use.
#[derive(Debug)]
pub struct ContextSlot {
    fabric: Arc<dyn Fabric>,
    config: TransportConfig,
    fault: FaultSlot,
    hooks: Arc<dyn ConnectionHooks>,
    context: Mutex<Option<Arc<TransportContext>>>,
}

impl ContextSlot {
    pub fn new(
        fabric: Arc<dyn Fabric>,
        config: TransportConfig,
        fault: FaultSlot,
        hooks: Arc<dyn ConnectionHooks>,
    ) -> Self {
        Self {
            fabric,
            config,
            fault,
            hooks,
            context: Mutex::new(None),
        }
    }

    /// Returns the context bound to `device`, creating it if the slot is
    /// empty. Fails with [`TransportError::MultipleDevices`] if the context
    /// is bound to another device.
    pub fn acquire(&self, device: DeviceId) -> Result<Arc<TransportContext>, TransportError> {
        let mut slot = self.context.lock().expect("context lock poisoned");
        match &*slot {
            Some(context) if context.device() == device => Ok(context.clone()),
            Some(context) => Err(TransportError::MultipleDevices {
                existing: context.device().0,
                requested: device.0,
            }),
            None => {
                let context = TransportContext::create(
                    self.fabric.clone(),
                    device,
                    self.config.clone(),
                    self.fault.clone(),
                    self.hooks.clone(),
                )?;
                *slot = Some(context.clone());
                Ok(context)
            }
        }
    }

    pub fn get(&self) -> Option<Arc<TransportContext>> {
        self.context.lock().expect("context lock poisoned").clone()
    }

    pub fn take(&self) -> Option<Arc<TransportContext>> {
        self.context.lock().expect("context lock poisoned").take()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use std::time::Instant;

    use super::*;
    use crate::fabric::local::LOCAL_DEVICE;
    use crate::fabric::local::LocalFabric;
    use crate::test_utils::RecordingHooks;
    use crate::test_utils::test_config;

    fn slot(fabric: Arc<dyn Fabric>) -> ContextSlot {
        ContextSlot::new(
            fabric,
            test_config(),
            FaultSlot::new(false),
            Arc::new(RecordingHooks::default()),
        )
    }

    #[test]
    fn test_acquire_is_idempotent() -> Result<(), anyhow::Error> {
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let slot = slot(fabric);
        assert!(slot.get().is_none());

        let first = slot.acquire(LOCAL_DEVICE)?;
        let second = slot.acquire(LOCAL_DEVICE)?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.device(), LOCAL_DEVICE);

        slot.take().unwrap().shutdown()?;
        assert!(slot.get().is_none());
        Ok(())
    }

    #[test]
    fn test_second_device_is_refused() -> Result<(), anyhow::Error> {
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let slot = slot(fabric);
        let context = slot.acquire(LOCAL_DEVICE)?;
        match slot.acquire(DeviceId(7)) {
            Err(TransportError::MultipleDevices {
                existing,
                requested,
            }) => {
                assert_eq!(existing, LOCAL_DEVICE.0);
                assert_eq!(requested, 7);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // The first binding is untouched.
        assert!(Arc::ptr_eq(&slot.acquire(LOCAL_DEVICE)?, &context));
        context.shutdown()?;
        Ok(())
    }

    #[test]
    fn test_shutdown_releases_everything() -> Result<(), anyhow::Error> {
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let context = slot(fabric.clone()).acquire(LOCAL_DEVICE)?;
        let buffer = context.register_buffer(64, AccessFlags::LOCAL_WRITE)?;
        drop(buffer);

        let start = Instant::now();
        context.shutdown()?;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(context.is_stopping());
        // Idempotent, and the handles are gone.
        context.shutdown()?;
        assert!(fabric.destroy_cq(context.cq()).is_err());
        assert!(fabric.dealloc_pd(context.pd()).is_err());
        Ok(())
    }

    #[test]
    fn test_failed_create_releases_partial_state() -> Result<(), anyhow::Error> {
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let config = TransportConfig {
            cq_entries: 0,
            ..test_config()
        };
        let err = TransportContext::create(
            fabric.clone(),
            LOCAL_DEVICE,
            config,
            FaultSlot::new(false),
            Arc::new(RecordingHooks::default()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one entry"), "{:#}", err);
        // The local fabric numbers handles from 1: the domain, then the
        // channel. Both were released on the way out.
        assert!(fabric.dealloc_pd(ProtectionDomain(1)).is_err());
        assert!(fabric.destroy_comp_channel(CompChannel(2)).is_err());
        Ok(())
    }
}
