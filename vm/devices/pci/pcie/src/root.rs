// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI Express root complex.

use crate::completion::CompletionRouter;
use crate::completion::Timer;
use crate::msi::MsiController;
use crate::region::RegionHandler;
use crate::region::RegionMemory;
use crate::region::RegionTable;
use crate::tag::TagAllocator;
use crate::tlp::PcieId;
use crate::tlp::Tlp;
use crate::tree::AddressWindow;
use crate::tree::AddressWindows;
use crate::tree::TreeItem;
use async_trait::async_trait;
use futures::task::Spawn;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// The link below the root complex.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hands `tlp` to the link for delivery downstream.
    async fn send(&self, tlp: Tlp);
}

/// Root complex settings.
#[derive(Debug, Clone)]
pub struct RootComplexConfig {
    /// Requester and completer id used by the root complex.
    pub requester_id: PcieId,
    /// Number of tags available for outstanding requests, at most 256.
    pub tag_count: usize,
    /// Max payload size encoding (128 << n bytes).
    pub max_payload_size: u8,
    /// Max read request size encoding (128 << n bytes).
    pub max_read_request_size: u8,
    /// Read completion boundary in bytes, 64 or 128.
    pub read_completion_boundary: u16,
    /// Enable 8-bit tags on functions that support them.
    pub extended_tag_field_enable: bool,
    /// Base of the I/O window handed out to BARs.
    pub io_base: u64,
    /// Base of the non-prefetchable memory window handed out to BARs.
    pub mem_base: u64,
    /// Base of the prefetchable memory window handed out to BARs.
    pub prefetchable_mem_base: u64,
    /// Base of the memory regions owned by the root complex.
    pub region_base: u64,
    /// Base of the I/O regions owned by the root complex.
    pub io_region_base: u64,
    /// Completion timeout for access handles. Zero waits forever.
    pub default_timeout: Duration,
}

impl Default for RootComplexConfig {
    fn default() -> Self {
        Self {
            requester_id: PcieId::new(0, 0, 0),
            tag_count: 32,
            max_payload_size: 0,
            max_read_request_size: 2,
            read_completion_boundary: 128,
            extended_tag_field_enable: true,
            io_base: 0x8000_0000,
            mem_base: 0x8000_0000,
            prefetchable_mem_base: 0x8000_0000_0000_0000,
            region_base: 0,
            io_region_base: 0,
            default_timeout: Duration::ZERO,
        }
    }
}

/// A PCI Express root complex.
///
/// Issues configuration, I/O and memory transactions through its
/// [`Transport`], answers requests from downstream bus masters that land in
/// its own regions, enumerates the hierarchy below it and delivers MSIs.
pub struct RootComplex {
    pub(crate) config: RootComplexConfig,
    transport: Arc<dyn Transport>,
    pub(crate) tags: TagAllocator,
    pub(crate) completions: CompletionRouter,
    pub(crate) mem_regions: Mutex<RegionTable>,
    pub(crate) io_regions: Mutex<RegionTable>,
    pub(crate) windows: Mutex<AddressWindows>,
    pub(crate) tree: Mutex<TreeItem>,
    pub(crate) msi: Arc<MsiController>,
}

impl RootComplex {
    /// Creates a root complex sending through `transport`.
    ///
    /// `timer` provides completion timeouts and `spawner` runs MSI
    /// callbacks.
    pub fn new(
        config: RootComplexConfig,
        transport: Arc<dyn Transport>,
        timer: Arc<dyn Timer>,
        spawner: Arc<dyn Spawn + Send + Sync>,
    ) -> Self {
        let config = RootComplexConfig {
            max_payload_size: config.max_payload_size.min(5),
            max_read_request_size: config.max_read_request_size.min(5),
            read_completion_boundary: if config.read_completion_boundary == 64 {
                64
            } else {
                128
            },
            ..config
        };
        Self {
            tags: TagAllocator::new(config.tag_count),
            completions: CompletionRouter::new(timer),
            mem_regions: Mutex::new(RegionTable::new(config.region_base)),
            io_regions: Mutex::new(RegionTable::new(config.io_region_base)),
            windows: Mutex::new(AddressWindows {
                io: AddressWindow::new(config.io_base),
                mem: AddressWindow::new(config.mem_base),
                prefetchable: AddressWindow::new(config.prefetchable_mem_base),
            }),
            tree: Mutex::new(TreeItem::new(config.requester_id)),
            msi: Arc::new(MsiController::new(spawner)),
            transport,
            config,
        }
    }

    /// The settings in effect.
    pub fn config(&self) -> &RootComplexConfig {
        &self.config
    }

    /// The tag pool.
    pub fn tags(&self) -> &TagAllocator {
        &self.tags
    }

    /// The windows forwarded below the root complex, as left by the last
    /// enumeration.
    pub fn windows(&self) -> AddressWindows {
        *self.windows.lock()
    }

    /// The device tree found by the last enumeration.
    pub fn tree(&self) -> TreeItem {
        self.tree.lock().clone()
    }

    /// Registers a memory region backed by `size` bytes of zeroed memory.
    pub fn alloc_region(&self, size: usize) -> (u64, RegionMemory) {
        let mem = RegionMemory::new(size);
        let addr = self.alloc_region_with(size as u64, Arc::new(mem.clone()));
        (addr, mem)
    }

    /// Registers a memory region served by `handler`.
    pub fn alloc_region_with(&self, size: u64, handler: Arc<dyn RegionHandler>) -> u64 {
        let addr = self.mem_regions.lock().alloc(size, handler);
        tracing::debug!(addr, size, "allocated memory region");
        addr
    }

    /// Registers an I/O region backed by `size` bytes of zeroed memory.
    pub fn alloc_io_region(&self, size: usize) -> (u64, RegionMemory) {
        let mem = RegionMemory::new(size);
        let addr = self.alloc_io_region_with(size as u64, Arc::new(mem.clone()));
        (addr, mem)
    }

    /// Registers an I/O region served by `handler`.
    pub fn alloc_io_region_with(&self, size: u64, handler: Arc<dyn RegionHandler>) -> u64 {
        let addr = self.io_regions.lock().alloc(size, handler);
        tracing::debug!(addr, size, "allocated io region");
        addr
    }

    pub(crate) async fn send(&self, tlp: Tlp) {
        debug_assert!(tlp.check(), "sending malformed tlp {tlp:?}");
        tracing::debug!(
            fmt_type = ?tlp.fmt_type,
            tag = tlp.tag,
            address = tlp.address,
            length = tlp.length,
            "outbound tlp"
        );
        self.transport.send(tlp).await;
    }
}
