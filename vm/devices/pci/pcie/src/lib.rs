// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI Express root complex transaction engine.
//!
//! [`RootComplex`] sits at the top of a simulated PCIe hierarchy. Software
//! drives configuration, I/O and memory transactions through it, it
//! enumerates the hierarchy and programs BARs, bridge windows and MSI, and
//! it answers requests that downstream bus masters send upstream.

#![forbid(unsafe_code)]

mod completion;
mod dispatch;
mod engine;
mod enumerate;
mod msi;
mod region;
mod root;
mod tag;
pub mod tlp;
mod tree;

#[cfg(test)]
mod test_helpers;

pub use completion::CompletionRouter;
pub use completion::Timer;
pub use dispatch::DispatchError;
pub use engine::ByteOrder;
pub use engine::CapabilitySpace;
pub use engine::ConfigSpace;
pub use engine::IoSpace;
pub use engine::MemSpace;
pub use engine::Space;
pub use engine::TransactionError;
pub use enumerate::EnumerateOptions;
pub use msi::MsiCallback;
pub use msi::MsiError;
pub use msi::MsiEvent;
pub use region::Region;
pub use region::RegionError;
pub use region::RegionHandler;
pub use region::RegionMemory;
pub use region::RegionTable;
pub use root::RootComplex;
pub use root::RootComplexConfig;
pub use root::Transport;
pub use tag::TagAllocator;
pub use tag::TagGuard;
pub use tree::AddressWindow;
pub use tree::AddressWindows;
pub use tree::Bar;
pub use tree::BarKind;
pub use tree::ExpansionRom;
pub use tree::MsiConfiguration;
pub use tree::TreeItem;

const PAGE_SIZE: usize = 4096;
const PAGE_SIZE64: u64 = 4096;
const PAGE_OFFSET_MASK: u64 = PAGE_SIZE64 - 1;

/// Number of distinct tags addressable by an 8-bit tag field.
const MAX_TAGS: usize = 256;

const BDF_BUS_SHIFT: u16 = 8;
const BDF_DEVICE_SHIFT: u16 = 3;
const BDF_DEVICE_MASK: u16 = 0x1f;
const BDF_FUNCTION_MASK: u16 = 0x07;

const DEVICES_PER_BUS: u8 = 32;
const FUNCTIONS_PER_DEVICE: u8 = 8;
