// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The device tree produced by enumeration, and the address windows that
//! enumeration allocates from.

use crate::tlp::PcieId;
use pci_core::spec::caps::CapabilityId;
use pci_core::spec::cfg_space::HEADER_LAYOUT_BRIDGE;
use pci_core::spec::cfg_space::HeaderType;
use pci_core::spec::cfg_space::TYPE0_BAR_COUNT;
use std::fmt;

/// Rounds `value` up to the next boundary described by the low-bit `mask`.
pub(crate) fn align_up(value: u64, mask: u64) -> u64 {
    value.wrapping_add(mask) & !mask
}

/// A bump allocator over an address range.
///
/// `limit` is the first address not yet handed out. It only moves up,
/// except when the window is reset for a fresh enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressWindow {
    /// First address of the window.
    pub base: u64,
    /// Allocation cursor.
    pub limit: u64,
}

impl AddressWindow {
    /// Creates an empty window starting at `base`.
    pub const fn new(base: u64) -> Self {
        Self { base, limit: base }
    }

    /// Rounds the cursor up to the boundary described by `mask`.
    pub fn align(&mut self, mask: u64) {
        self.limit = align_up(self.limit, mask);
    }

    /// Allocates `size` bytes aligned to `mask`, returning the address.
    pub fn alloc(&mut self, mask: u64, size: u64) -> u64 {
        self.align(mask);
        let addr = self.limit;
        self.limit = addr.wrapping_add(size);
        addr
    }

    /// Moves the cursor back to the base.
    pub fn reset(&mut self) {
        self.limit = self.base;
    }

    /// Returns true if nothing has been allocated.
    pub fn is_empty(&self) -> bool {
        self.limit == self.base
    }
}

/// The three windows a bridge forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressWindows {
    /// I/O space.
    pub io: AddressWindow,
    /// Non-prefetchable memory.
    pub mem: AddressWindow,
    /// Prefetchable memory.
    pub prefetchable: AddressWindow,
}

impl AddressWindows {
    /// Moves every cursor back to its base.
    pub fn reset(&mut self) {
        self.io.reset();
        self.mem.reset();
        self.prefetchable.reset();
    }
}

/// Address space decoded by a BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    /// I/O space.
    Io,
    /// 32-bit memory space.
    Memory32,
    /// 64-bit memory space, occupying two BAR slots.
    Memory64,
}

/// A sized and programmed base address register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bar {
    /// Address space decoded by the BAR.
    pub kind: BarKind,
    /// Prefetchable bit as advertised by the device.
    pub prefetchable: bool,
    /// Value read back after writing all ones.
    pub probed: u64,
    /// Value written into the BAR, including the flag bits.
    pub programmed: u64,
    /// Assigned base address.
    pub address: u64,
    /// Decoded size in bytes.
    pub size: u64,
}

/// A sized and programmed expansion ROM base address register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionRom {
    /// Value read back after writing the probe pattern.
    pub probed: u32,
    /// Value written into the register.
    pub programmed: u32,
    /// Assigned base address.
    pub address: u64,
    /// Decoded size in bytes.
    pub size: u64,
}

/// MSI programming applied to a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiConfiguration {
    /// Message address.
    pub address: u64,
    /// Message data of vector 0.
    pub data: u32,
    /// Number of vectors enabled.
    pub count: u32,
}

/// A function discovered by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeItem {
    /// Location of the function.
    pub pcie_id: PcieId,
    /// Vendor id.
    pub vendor_id: u16,
    /// Device id.
    pub device_id: u16,
    /// Revision id.
    pub revision_id: u8,
    /// 24-bit class code.
    pub class_code: u32,
    /// Raw header type register.
    pub header_type: u8,
    /// Subsystem vendor id (type 0 headers only).
    pub subsystem_vendor_id: u16,
    /// Subsystem id (type 0 headers only).
    pub subsystem_id: u16,
    /// BARs by slot; the upper slot of a 64-bit BAR stays empty.
    pub bars: [Option<Bar>; TYPE0_BAR_COUNT],
    /// Expansion ROM, if implemented.
    pub expansion_rom: Option<ExpansionRom>,
    /// Capabilities in list order, with their config space offsets.
    pub capabilities: Vec<(CapabilityId, u8)>,
    /// Primary bus number (bridges).
    pub pri_bus_num: u8,
    /// Secondary bus number (bridges).
    pub sec_bus_num: u8,
    /// Subordinate bus number (bridges).
    pub sub_bus_num: u8,
    /// Windows forwarded below this node (bridges and the root).
    pub windows: Option<AddressWindows>,
    /// MSI programming, once configured.
    pub msi: Option<MsiConfiguration>,
    /// Functions on the secondary bus.
    pub children: Vec<TreeItem>,
}

impl TreeItem {
    /// Creates an empty node for `pcie_id`.
    pub fn new(pcie_id: PcieId) -> Self {
        Self {
            pcie_id,
            vendor_id: 0,
            device_id: 0,
            revision_id: 0,
            class_code: 0,
            header_type: 0,
            subsystem_vendor_id: 0,
            subsystem_id: 0,
            bars: [None; TYPE0_BAR_COUNT],
            expansion_rom: None,
            capabilities: Vec::new(),
            pri_bus_num: 0,
            sec_bus_num: 0,
            sub_bus_num: 0,
            windows: None,
            msi: None,
            children: Vec::new(),
        }
    }

    /// Returns true for PCI-to-PCI bridges.
    pub fn is_bridge(&self) -> bool {
        HeaderType::from_bits(self.header_type).layout() == HEADER_LAYOUT_BRIDGE
    }

    /// Returns true if the device implements more than one function.
    pub fn is_multi_function(&self) -> bool {
        HeaderType::from_bits(self.header_type).multi_function()
    }

    /// Finds `pcie_id` in this node or anywhere below it.
    pub fn find_child_dev(&self, pcie_id: PcieId) -> Option<&TreeItem> {
        if self.pcie_id == pcie_id {
            return Some(self);
        }
        self.children
            .iter()
            .find_map(|child| child.find_child_dev(pcie_id))
    }

    /// Mutable variant of [`Self::find_child_dev`].
    pub fn find_child_dev_mut(&mut self, pcie_id: PcieId) -> Option<&mut TreeItem> {
        if self.pcie_id == pcie_id {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|child| child.find_child_dev_mut(pcie_id))
    }

    /// Config space offset of the first capability with id `cap`.
    pub fn capability_offset(&self, cap: CapabilityId) -> Option<u8> {
        self.capabilities
            .iter()
            .find(|(id, _)| *id == cap)
            .map(|&(_, offset)| offset)
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = depth * 2;
        writeln!(
            f,
            "{:pad$}{} [{:04x}:{:04x}] class {:06x} rev {:02x}",
            "", self.pcie_id, self.vendor_id, self.device_id, self.class_code, self.revision_id,
        )?;
        for (i, bar) in self.bars.iter().enumerate() {
            if let Some(bar) = bar {
                writeln!(
                    f,
                    "{:pad$}  BAR{} {:?}{} {:#x} size {:#x}",
                    "",
                    i,
                    bar.kind,
                    if bar.prefetchable { " prefetchable" } else { "" },
                    bar.address,
                    bar.size,
                )?;
            }
        }
        if let Some(rom) = &self.expansion_rom {
            writeln!(f, "{:pad$}  ROM {:#x} size {:#x}", "", rom.address, rom.size)?;
        }
        if !self.capabilities.is_empty() {
            write!(f, "{:pad$}  caps", "")?;
            for (id, offset) in &self.capabilities {
                write!(f, " {:#04x}@{:#x}", id.0, offset)?;
            }
            writeln!(f)?;
        }
        if let Some(msi) = &self.msi {
            writeln!(
                f,
                "{:pad$}  MSI {:#x} data {:#x} count {}",
                "", msi.address, msi.data, msi.count
            )?;
        }
        if let Some(w) = &self.windows {
            writeln!(
                f,
                "{:pad$}  bus {}/{}/{} io {:#x}-{:#x} mem {:#x}-{:#x} prefetch {:#x}-{:#x}",
                "",
                self.pri_bus_num,
                self.sec_bus_num,
                self.sub_bus_num,
                w.io.base,
                w.io.limit,
                w.mem.base,
                w.mem.limit,
                w.prefetchable.base,
                w.prefetchable.limit,
            )?;
        }
        for child in &self.children {
            child.fmt_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for TreeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}
