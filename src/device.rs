//! Device creation and management.
//!
//! A [`Device`] owns one [`HardwareQueue`] per configured [`QueueKind`] and the
//! [`GlobalStateTracker`] shared by all of them. It is reference-counted for cheap sharing
//! between recording threads.
//!
//! # Quick Start
//!
//! ```
//! use scoria::{Device, DeviceConfig, QueueKind};
//! use scoria::tracking::{ResourceId, Subresource, UsageState};
//!
//! let device = Device::new(DeviceConfig::default()).unwrap();
//! let texture = ResourceId::from_raw(1);
//! device.register_resource(texture, UsageState::COPY_DST);
//!
//! let queue = device.queue(QueueKind::Graphics).unwrap();
//! let mut cmd = queue.command_buffer();
//! cmd.transition(texture, Subresource::All, UsageState::SHADER_READ).unwrap();
//! cmd.draw(0..3, 0..1).unwrap();
//!
//! let value = device.submit(QueueKind::Graphics, vec![cmd]).unwrap();
//! queue.wait_until(value).unwrap();
//! ```

use std::{sync::Arc, time::Duration};

use crate::{
    Error, Result,
    backend::HostBackend,
    command::CommandBuffer,
    queue::{HardwareQueue, QueueBackend, QueueKind},
    tracking::{GlobalStateTracker, ResourceId, ResourceRecord, UsageState},
};

/// Configuration for [`Device::new`] and [`Device::with_backend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// How long a wait may block before the device is considered lost. `None` waits forever.
    pub wait_timeout: Option<Duration>,
    /// Simulated execution time of each submission on host-backed queues.
    pub host_latency: Option<Duration>,
    /// Queues to create. Duplicates are ignored.
    pub queues: Vec<QueueKind>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            wait_timeout: None,
            host_latency: None,
            queues: QueueKind::ALL.to_vec(),
        }
    }
}

struct DeviceInner {
    queues: Vec<HardwareQueue>,
    global: GlobalStateTracker,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        tracing::info!(resources = self.global.lock().len(), "Destroying device");
    }
}

/// A set of hardware queues sharing one device-wide resource state table.
///
/// Cloning a `Device` is cheap. The queues wait for their outstanding work when the last clone
/// is dropped.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

impl Device {
    /// Creates a device whose queues execute on host worker threads.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let mut queues = Vec::new();
        for kind in kinds(&config) {
            let name = format!("scoria {} queue", kind.name());
            let backend = HostBackend::new(name, config.host_latency)?;
            queues.push(HardwareQueue::new(kind, Arc::new(backend), config.wait_timeout));
        }
        Ok(Self::from_queues(queues))
    }

    /// Creates a device whose queues feed the backends returned by `backend`.
    pub fn with_backend(
        config: DeviceConfig,
        mut backend: impl FnMut(QueueKind) -> Arc<dyn QueueBackend>,
    ) -> Self {
        let queues = kinds(&config)
            .into_iter()
            .map(|kind| HardwareQueue::new(kind, backend(kind), config.wait_timeout))
            .collect();
        Self::from_queues(queues)
    }

    fn from_queues(queues: Vec<HardwareQueue>) -> Self {
        tracing::info!(queues = queues.len(), "Creating device");
        Self(Arc::new(DeviceInner {
            queues,
            global: GlobalStateTracker::new(),
        }))
    }

    pub fn queue(&self, kind: QueueKind) -> Option<&HardwareQueue> {
        self.0.queues.iter().find(|queue| queue.kind() == kind)
    }

    pub fn queues(&self) -> impl Iterator<Item = &HardwareQueue> {
        self.0.queues.iter()
    }

    pub fn global_tracker(&self) -> &GlobalStateTracker {
        &self.0.global
    }

    /// Makes a newly created resource known to every queue in `initial_state`.
    pub fn register_resource(&self, resource: ResourceId, initial_state: UsageState) {
        self.0.global.register(resource, initial_state);
    }

    /// Forgets a resource that is about to be destroyed.
    pub fn unregister_resource(&self, resource: ResourceId) -> Option<ResourceRecord> {
        self.0.global.unregister(resource)
    }

    /// Submits `buffers` on the queue of `kind`. See [`HardwareQueue::submit`].
    pub fn submit(&self, kind: QueueKind, buffers: Vec<CommandBuffer>) -> Result<u64> {
        self.queue(kind)
            .ok_or(Error::ProtocolViolation("no queue of the requested kind"))?
            .submit(&self.0.global, buffers)
    }

    /// Blocks until every queue has finished all work submitted so far.
    pub fn flush_all(&self) -> Result<()> {
        for queue in self.0.queues.iter() {
            queue.flush()?;
        }
        Ok(())
    }
}

fn kinds(config: &DeviceConfig) -> Vec<QueueKind> {
    let mut kinds = Vec::with_capacity(config.queues.len());
    for &kind in config.queues.iter() {
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    kinds
}
