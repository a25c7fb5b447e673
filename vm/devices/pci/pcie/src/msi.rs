// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Message signaled interrupts targeting the root complex.
//!
//! All functions share one 4-byte message address owned by the root
//! complex. Each configured function is given a block of
//! [`MAX_VECTORS`] consecutive data values, and a write of one of those
//! values to the message address signals the matching vector.

use crate::engine::TransactionError;
use crate::region::RegionHandler;
use crate::root::RootComplex;
use crate::tlp::PcieId;
use crate::tree::MsiConfiguration;
use async_trait::async_trait;
use event_listener::Event;
use futures::future::BoxFuture;
use futures::task::Spawn;
use futures::task::SpawnExt;
use parking_lot::Mutex;
use pci_core::spec::caps::CapabilityId;
use pci_core::spec::caps::msi::MAX_VECTORS;
use pci_core::spec::caps::msi::MSG_DATA_32;
use pci_core::spec::caps::msi::MessageControl;
use pci_core::spec::caps::msi::MsiCapabilityHeader;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;

/// Size of the message address region.
const MSI_REGION_SIZE: u64 = 4;

/// Largest multiple message encoding (32 vectors).
const MAX_MULTIPLE_MESSAGE: u8 = 5;

/// Errors configuring or using MSI.
#[derive(Debug, Error)]
pub enum MsiError {
    /// The function is not part of the enumerated tree.
    #[error("device {0} not found")]
    DeviceNotFound(PcieId),
    /// The function has no MSI capability.
    #[error("device {0} does not implement msi")]
    Unsupported(PcieId),
    /// MSI has not been configured on the function.
    #[error("msi is not configured on {0}")]
    NotConfigured(PcieId),
    /// The vector is beyond the number of enabled vectors.
    #[error("vector {vector} out of range for {pcie_id}, {count} vectors enabled")]
    VectorOutOfRange {
        /// Function the vector belongs to.
        pcie_id: PcieId,
        /// Requested vector.
        vector: u8,
        /// Number of enabled vectors.
        count: u32,
    },
    /// The message address does not fit a 32-bit only capability.
    #[error("msi address {address:#x} is not reachable from {pcie_id}")]
    AddressNotReachable {
        /// Function being configured.
        pcie_id: PcieId,
        /// Message address.
        address: u64,
    },
    /// Every message data value has been handed out.
    #[error("msi data values exhausted")]
    DataExhausted,
    /// Programming the capability failed.
    #[error("msi capability access failed")]
    Transaction(#[from] TransactionError),
}

/// Callback run when a vector fires.
pub type MsiCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct MsiEventInner {
    signaled: AtomicBool,
    event: Event,
}

/// A latching notification, set when its vector fires.
#[derive(Clone)]
pub struct MsiEvent(Arc<MsiEventInner>);

impl MsiEvent {
    /// Creates a cleared event.
    pub fn new() -> Self {
        Self(Arc::new(MsiEventInner {
            signaled: AtomicBool::new(false),
            event: Event::new(),
        }))
    }

    /// Sets the event and wakes every waiter.
    pub fn set(&self) {
        self.0.signaled.store(true, Ordering::SeqCst);
        self.0.event.notify(usize::MAX);
    }

    /// Clears the event.
    pub fn clear(&self) {
        self.0.signaled.store(false, Ordering::SeqCst);
    }

    /// Returns true if the event is set.
    pub fn is_set(&self) -> bool {
        self.0.signaled.load(Ordering::SeqCst)
    }

    /// Waits until the event is set.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let listener = self.0.event.listen();
            if self.is_set() {
                return;
            }
            listener.await;
        }
    }
}

impl Default for MsiEvent {
    fn default() -> Self {
        Self::new()
    }
}

struct MsiVector {
    event: MsiEvent,
    events: Vec<MsiEvent>,
    callbacks: Vec<MsiCallback>,
}

struct MsiDevice {
    base: u32,
    count: u32,
}

#[derive(Default)]
struct MsiState {
    address: Option<u64>,
    next_data: u32,
    devices: HashMap<PcieId, MsiDevice>,
    vectors: HashMap<(PcieId, u8), MsiVector>,
    data_map: HashMap<u32, (PcieId, u8)>,
}

/// Vector tables, and the handler behind the message address.
pub(crate) struct MsiController {
    state: Mutex<MsiState>,
    spawner: Arc<dyn Spawn + Send + Sync>,
}

impl MsiController {
    pub fn new(spawner: Arc<dyn Spawn + Send + Sync>) -> Self {
        Self {
            state: Mutex::new(MsiState::default()),
            spawner,
        }
    }

    /// Returns the data block of `dev`, reserving a new one on first use.
    fn reserve(&self, dev: PcieId) -> Result<u32, MsiError> {
        let mut state = self.state.lock();
        if let Some(device) = state.devices.get(&dev) {
            return Ok(device.base);
        }
        let base = state.next_data;
        state.next_data = base
            .checked_add(MAX_VECTORS)
            .ok_or(MsiError::DataExhausted)?;
        for vector in 0..MAX_VECTORS as u8 {
            state.vectors.insert(
                (dev, vector),
                MsiVector {
                    event: MsiEvent::new(),
                    events: Vec::new(),
                    callbacks: Vec::new(),
                },
            );
            state.data_map.insert(base + vector as u32, (dev, vector));
        }
        state.devices.insert(dev, MsiDevice { base, count: 0 });
        Ok(base)
    }

    fn set_count(&self, dev: PcieId, count: u32) {
        if let Some(device) = self.state.lock().devices.get_mut(&dev) {
            device.count = count;
        }
    }

    fn with_vector<R>(
        &self,
        dev: PcieId,
        vector: u8,
        f: impl FnOnce(&mut MsiVector) -> R,
    ) -> Result<R, MsiError> {
        let mut state = self.state.lock();
        let count = match state.devices.get(&dev) {
            Some(device) if device.count != 0 => device.count,
            _ => return Err(MsiError::NotConfigured(dev)),
        };
        if vector as u32 >= count {
            return Err(MsiError::VectorOutOfRange {
                pcie_id: dev,
                vector,
                count,
            });
        }
        let entry = state
            .vectors
            .get_mut(&(dev, vector))
            .ok_or(MsiError::NotConfigured(dev))?;
        Ok(f(entry))
    }

    fn deliver(&self, data: u32) {
        let (events, callbacks) = {
            let state = self.state.lock();
            let Some(entry) = state
                .data_map
                .get(&data)
                .and_then(|key| state.vectors.get(key))
            else {
                tracing::warn!(data, "msi write with unknown data");
                return;
            };
            let mut events = entry.events.clone();
            events.push(entry.event.clone());
            (events, entry.callbacks.clone())
        };
        tracing::debug!(data, callbacks = callbacks.len(), "msi");
        for event in events {
            event.set();
        }
        for callback in callbacks {
            if let Err(err) = self.spawner.spawn(callback()) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    data,
                    "failed to schedule msi callback"
                );
            }
        }
    }
}

#[async_trait]
impl RegionHandler for MsiController {
    async fn read(&self, _offset: u64, data: &mut [u8]) {
        data.fill(0);
    }

    async fn write(&self, offset: u64, data: &[u8]) {
        match <[u8; 4]>::try_from(data) {
            Ok(bytes) if offset == 0 => self.deliver(u32::from_le_bytes(bytes)),
            _ => {
                tracing::warn!(offset, len = data.len(), "ignoring partial msi write");
            }
        }
    }
}

impl RootComplex {
    /// The shared message address, allocated on first use.
    fn msi_address(&self) -> u64 {
        let mut state = self.msi.state.lock();
        *state.address.get_or_insert_with(|| {
            let addr = self
                .mem_regions
                .lock()
                .alloc(MSI_REGION_SIZE, self.msi.clone());
            tracing::debug!(addr, "allocated msi address");
            addr
        })
    }

    /// Programs the MSI capability at `cap` of `dev`, enabling every vector
    /// the function can request.
    pub(crate) async fn program_msi(
        &self,
        dev: PcieId,
        cap: u8,
        timeout: Duration,
    ) -> Result<MsiConfiguration, MsiError> {
        let cap = cap as u64;
        let header = self
            .config_read(
                dev,
                cap + MsiCapabilityHeader::CONTROL_CAPS.0 as u64,
                4,
                timeout,
            )
            .await?;
        let ctl = MessageControl::from_bits(u16::from_le_bytes([header[2], header[3]]));
        let mmcap = ctl.multiple_message_capable().min(MAX_MULTIPLE_MESSAGE);

        let address = self.msi_address();
        if !ctl.addr_64bit() && address > u32::MAX as u64 {
            return Err(MsiError::AddressNotReachable {
                pcie_id: dev,
                address,
            });
        }
        let data = self.msi.reserve(dev)?;

        self.config_write(
            dev,
            cap + MsiCapabilityHeader::MSG_ADDR_LO.0 as u64,
            &(address as u32).to_le_bytes(),
            timeout,
        )
        .await?;
        let data_offset = if ctl.addr_64bit() {
            self.config_write(
                dev,
                cap + MsiCapabilityHeader::MSG_ADDR_HI.0 as u64,
                &((address >> 32) as u32).to_le_bytes(),
                timeout,
            )
            .await?;
            MsiCapabilityHeader::MSG_DATA_64.0
        } else {
            MSG_DATA_32
        };
        self.config_write(dev, cap + data_offset as u64, &data.to_le_bytes(), timeout)
            .await?;

        let ctl = ctl
            .with_enable(true)
            .with_multiple_message_enable(mmcap);
        self.config_write(dev, cap + 2, &ctl.into_bits().to_le_bytes(), timeout)
            .await?;

        let count = 1 << mmcap;
        self.msi.set_count(dev, count);
        tracing::debug!(pcie_id = %dev, address, data, count, "configured msi");
        Ok(MsiConfiguration {
            address,
            data,
            count,
        })
    }

    /// Configures MSI on `dev`. Does nothing if MSI is already configured.
    pub async fn configure_msi(&self, dev: PcieId) -> Result<MsiConfiguration, MsiError> {
        let (cap, existing) = {
            let tree = self.tree.lock();
            let item = tree
                .find_child_dev(dev)
                .ok_or(MsiError::DeviceNotFound(dev))?;
            (item.capability_offset(CapabilityId::MSI), item.msi)
        };
        if let Some(msi) = existing {
            return Ok(msi);
        }
        let cap = cap.ok_or(MsiError::Unsupported(dev))?;
        let msi = self
            .program_msi(dev, cap, self.config.default_timeout)
            .await?;
        if let Some(item) = self.tree.lock().find_child_dev_mut(dev) {
            item.msi = Some(msi);
        }
        Ok(msi)
    }

    /// Returns the event signaled by `vector` of `dev`.
    pub fn msi_get_event(&self, dev: PcieId, vector: u8) -> Result<MsiEvent, MsiError> {
        self.msi.with_vector(dev, vector, |v| v.event.clone())
    }

    /// Adds `event` to the events signaled by `vector` of `dev`.
    pub fn msi_register_event(
        &self,
        dev: PcieId,
        event: MsiEvent,
        vector: u8,
    ) -> Result<(), MsiError> {
        self.msi.with_vector(dev, vector, |v| v.events.push(event))
    }

    /// Adds `callback` to the callbacks run when `vector` of `dev` fires.
    pub fn msi_register_callback(
        &self,
        dev: PcieId,
        callback: MsiCallback,
        vector: u8,
    ) -> Result<(), MsiError> {
        self.msi
            .with_vector(dev, vector, |v| v.callbacks.push(callback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enumerate::EnumerateOptions;
    use crate::test_helpers::*;
    use futures::FutureExt;
    use futures::executor::block_on;
    use std::sync::atomic::AtomicUsize;

    const DEV_A: PcieId = PcieId::new(0, 1, 0);
    const DEV_B: PcieId = PcieId::new(0, 2, 0);

    fn rig() -> TestRig {
        let t = TestRig::new(test_config());
        t.fabric.add(DEV_A, TestFunction::endpoint(0x1af4, 0x1000));
        t.fabric
            .add(DEV_B, TestFunction::endpoint(0x1af4, 0x1001).with_msi_32bit(1));
        block_on(t.rc.enumerate(&EnumerateOptions::default()));
        t
    }

    #[test]
    fn configure_programs_capability() {
        let t = rig();
        let msi_a = block_on(t.rc.configure_msi(DEV_A)).unwrap();
        let msi_b = block_on(t.rc.configure_msi(DEV_B)).unwrap();

        assert_eq!(msi_a.count, 8);
        assert_eq!(msi_a.data, 0);
        assert_eq!(msi_b.count, 2);
        assert_eq!(msi_b.data, MAX_VECTORS);
        assert_eq!(msi_a.address, msi_b.address);

        let a = t.fabric.msi_registers(DEV_A);
        assert!(a.control.enable());
        assert_eq!(a.control.multiple_message_enable(), 3);
        assert_eq!(a.address, msi_a.address);
        assert_eq!(a.data, 0);

        let b = t.fabric.msi_registers(DEV_B);
        assert!(b.control.enable());
        assert_eq!(b.control.multiple_message_enable(), 1);
        assert_eq!(b.data, MAX_VECTORS);

        assert_eq!(t.rc.tree().find_child_dev(DEV_A).unwrap().msi, Some(msi_a));
    }

    #[test]
    fn configure_is_idempotent() {
        let t = rig();
        let first = block_on(t.rc.configure_msi(DEV_A)).unwrap();
        let writes = t.fabric.take_requests().len();
        assert_ne!(writes, 0);
        let second = block_on(t.rc.configure_msi(DEV_A)).unwrap();
        assert_eq!(first, second);
        assert!(t.fabric.take_requests().is_empty());
    }

    #[test]
    fn configure_errors() {
        let t = TestRig::new(test_config());
        t.fabric
            .add(DEV_A, TestFunction::endpoint(0x1af4, 0x1000).without_msi());
        block_on(t.rc.enumerate(&EnumerateOptions::default()));
        assert!(matches!(
            block_on(t.rc.configure_msi(DEV_A)),
            Err(MsiError::Unsupported(DEV_A))
        ));
        assert!(matches!(
            block_on(t.rc.configure_msi(DEV_B)),
            Err(MsiError::DeviceNotFound(DEV_B))
        ));
    }

    #[test]
    fn vectors_are_validated() {
        let t = rig();
        assert!(matches!(
            t.rc.msi_get_event(DEV_A, 0),
            Err(MsiError::NotConfigured(DEV_A))
        ));
        block_on(t.rc.configure_msi(DEV_B)).unwrap();
        assert!(t.rc.msi_get_event(DEV_B, 1).is_ok());
        assert!(matches!(
            t.rc.msi_register_event(DEV_B, MsiEvent::new(), 2),
            Err(MsiError::VectorOutOfRange {
                vector: 2,
                count: 2,
                ..
            })
        ));
    }

    #[test]
    fn delivery_signals_only_the_target_vector() {
        let t = rig();
        block_on(t.rc.configure_msi(DEV_A)).unwrap();
        block_on(t.rc.configure_msi(DEV_B)).unwrap();

        let a1 = t.rc.msi_get_event(DEV_A, 1).unwrap();
        let extra = MsiEvent::new();
        t.rc.msi_register_event(DEV_A, extra.clone(), 1).unwrap();
        let a0 = t.rc.msi_get_event(DEV_A, 0).unwrap();
        let b1 = t.rc.msi_get_event(DEV_B, 1).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        t.rc.msi_register_callback(
            DEV_A,
            Arc::new(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }),
            1,
        )
        .unwrap();

        block_on(t.fabric.trigger_msi(DEV_A, 1)).unwrap();
        assert!(a1.is_set());
        assert!(extra.is_set());
        assert!(!a0.is_set());
        assert!(!b1.is_set());

        // callbacks run on the spawner, not inline
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        t.spawner.run_all();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        a1.clear();
        block_on(t.fabric.trigger_msi(DEV_B, 1)).unwrap();
        assert!(b1.is_set());
        assert!(!a1.is_set());
        block_on(b1.wait());
    }

    #[test]
    fn event_wait_blocks_until_set() {
        let event = MsiEvent::new();
        let mut wait = Box::pin(event.wait());
        assert!((&mut wait).now_or_never().is_none());
        event.set();
        assert!(wait.now_or_never().is_some());
    }

    #[test]
    fn enumeration_configures_msi() {
        let t = TestRig::new(test_config());
        t.fabric.add(DEV_A, TestFunction::endpoint(0x1af4, 0x1000));
        t.fabric
            .add(DEV_B, TestFunction::endpoint(0x1af4, 0x1001).without_msi());
        let tree = block_on(t.rc.enumerate(&EnumerateOptions {
            configure_msi: true,
            ..Default::default()
        }));
        assert_eq!(tree.find_child_dev(DEV_A).unwrap().msi.unwrap().count, 8);
        assert_eq!(tree.find_child_dev(DEV_B).unwrap().msi, None);
        assert!(t.rc.msi_get_event(DEV_A, 7).is_ok());
    }
}
