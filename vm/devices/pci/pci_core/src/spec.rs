// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and constants specified by the PCI and PCI Express specs.
//!
//! This module MUST NOT contain any vendor-specific constants!

/// Configuration Space
///
/// Sources: PCI 2.3 Spec - Chapter 6
#[expect(missing_docs)] // primarily enums/structs with self-explanatory variants
pub mod cfg_space {
    use bitfield_struct::bitfield;
    use open_enum::open_enum;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// Offsets into the type 00h configuration space header.
    ///
    /// | Offset | Bits 31-24                 | Bits 23-16  | Bits 15-8           | Bits 7-0             |
    /// |--------|----------------------------|-------------|---------------------|--------------------- |
    /// | 0x0    | Device ID                  |             | Vendor ID           |                      |
    /// | 0x4    | Status                     |             | Command             |                      |
    /// | 0x8    | Class code                 |             |                     | Revision ID          |
    /// | 0xC    | BIST                       | Header type | Latency Timer       | Cache Line Size      |
    /// | 0x10   | Base address #0 (BAR0)     |             |                     |                      |
    /// | ...    |                            |             |                     |                      |
    /// | 0x24   | Base address #5 (BAR5)     |             |                     |                      |
    /// | 0x28   | Cardbus CIS Pointer        |             |                     |                      |
    /// | 0x2C   | Subsystem ID               |             | Subsystem Vendor ID |                      |
    /// | 0x30   | Expansion ROM base address |             |                     |                      |
    /// | 0x34   | Reserved                   |             |                     | Capabilities Pointer |
    /// | 0x38   | Reserved                   |             |                     |                      |
    /// | 0x3C   | Max latency                | Min Grant   | Interrupt PIN       | Interrupt Line       |
    #[open_enum]
    #[derive(Debug, Clone, Copy)]
    #[repr(u16)]
    pub enum HeaderType00 {
        DEVICE_VENDOR = 0x00,
        STATUS_COMMAND = 0x04,
        CLASS_REVISION = 0x08,
        BIST_HEADER = 0x0C,
        BAR0 = 0x10,
        BAR1 = 0x14,
        BAR2 = 0x18,
        BAR3 = 0x1C,
        BAR4 = 0x20,
        BAR5 = 0x24,
        CARDBUS_CIS_PTR = 0x28,
        SUBSYSTEM_ID = 0x2C,
        EXPANSION_ROM_BASE = 0x30,
        RESERVED_CAP_PTR = 0x34,
        RESERVED = 0x38,
        LATENCY_INTERRUPT = 0x3C,
    }

    /// Offsets into the type 01h configuration space header.
    ///
    /// | Offset | Bits 31-24                       | Bits 23-16             | Bits 15-8                | Bits 7-0             |
    /// |--------|----------------------------------|------------------------|--------------------------|--------------------- |
    /// | 0x0    | Device ID                        |                        | Vendor ID                |                      |
    /// | 0x4    | Status                           |                        | Command                  |                      |
    /// | 0x8    | Class code                       |                        |                          | Revision ID          |
    /// | 0xC    | BIST                             | Header Type            | Latency Timer            | Cache Line Size      |
    /// | 0x10   | Base address #0 (BAR0)           |                        |                          |                      |
    /// | 0x14   | Base address #1 (BAR1)           |                        |                          |                      |
    /// | 0x18   | Secondary Latency Timer          | Subordinate Bus Number | Secondary Bus Number     | Primary Bus Number   |
    /// | 0x1C   | Secondary Status                 |                        | I/O Limit                | I/O Base             |
    /// | 0x20   | Memory Limit                     |                        | Memory Base              |                      |
    /// | 0x24   | Prefetchable Memory Limit        |                        | Prefetchable Memory Base |                      |
    /// | 0x28   | Prefetchable Base Upper 32 Bits  |                        |                          |                      |
    /// | 0x2C   | Prefetchable Limit Upper 32 Bits |                        |                          |                      |
    /// | 0x30   | I/O Limit Upper 16 Bits          |                        | I/O Base Upper 16 Bits   |                      |
    /// | 0x34   | Reserved                         |                        |                          | Capabilities Pointer |
    /// | 0x38   | Expansion ROM Base Address       |                        |                          |                      |
    /// | 0x3C   | Bridge Control                   |                        | Interrupt PIN            | Interrupt Line       |
    #[open_enum]
    #[derive(Debug, Clone, Copy)]
    #[repr(u16)]
    pub enum HeaderType01 {
        DEVICE_VENDOR = 0x00,
        STATUS_COMMAND = 0x04,
        CLASS_REVISION = 0x08,
        BIST_HEADER = 0x0C,
        BAR0 = 0x10,
        BAR1 = 0x14,
        LATENCY_BUS_NUMBERS = 0x18,
        SEC_STATUS_IO_RANGE = 0x1C,
        MEMORY_RANGE = 0x20,
        PREFETCH_RANGE = 0x24,
        PREFETCH_BASE_UPPER = 0x28,
        PREFETCH_LIMIT_UPPER = 0x2C,
        IO_RANGE_UPPER = 0x30,
        RESERVED_CAP_PTR = 0x34,
        EXPANSION_ROM_BASE = 0x38,
        BRIDGE_CTRL_INTERRUPT = 0x3C,
    }

    /// Byte offset of the header type register within the BIST/header dword.
    pub const HEADER_TYPE_OFFSET: u16 = 0x0E;

    /// Size of a conventional (non-extended) configuration space.
    pub const CFG_SPACE_SIZE: u16 = 0x100;

    /// Size of a PCI Express extended configuration space.
    pub const EXT_CFG_SPACE_SIZE: u16 = 0x1000;

    /// Number of BARs in a type 00h header.
    pub const TYPE0_BAR_COUNT: usize = 6;

    /// Number of BARs in a type 01h header.
    pub const TYPE1_BAR_COUNT: usize = 2;

    /// Header type register.
    #[bitfield(u8)]
    pub struct HeaderType {
        /// 0 for a function, 1 for a PCI-to-PCI bridge.
        #[bits(7)]
        pub layout: u8,
        pub multi_function: bool,
    }

    /// Header layout value of a PCI-to-PCI bridge.
    pub const HEADER_LAYOUT_BRIDGE: u8 = 0x01;

    /// BAR in-band encoding bits.
    ///
    /// The low bits of the BAR are not actually part of the address.
    /// Instead, they are used to in-band encode various bits of
    /// metadata about the BAR, and are masked off when determining the
    /// actual address.
    #[bitfield(u32)]
    pub struct BarEncodingBits {
        pub use_pio: bool,

        _reserved: bool,

        /// False indicates 32 bit.
        /// Only used in MMIO
        pub type_64_bit: bool,
        pub prefetchable: bool,

        #[bits(28)]
        _reserved2: u32,
    }

    /// Low bits of an I/O BAR that never carry address information.
    pub const BAR_IO_FLAGS_MASK: u32 = 0x3;

    /// Low bits of a memory BAR that never carry address information.
    pub const BAR_MEM_FLAGS_MASK: u32 = 0xf;

    /// Value written to an expansion ROM register to probe its size. The
    /// enable bit stays clear.
    pub const EXPANSION_ROM_PROBE: u32 = 0xffff_f800;

    /// Low bits of an expansion ROM register that never carry address
    /// information.
    pub const EXPANSION_ROM_FLAGS_MASK: u32 = 0x7ff;

    /// Command Register
    #[bitfield(u16)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct Command {
        pub pio_enabled: bool,
        pub mmio_enabled: bool,
        pub bus_master: bool,
        pub special_cycles: bool,
        pub enable_memory_write_invalidate: bool,
        pub vga_palette_snoop: bool,
        pub parity_error_response: bool,
        /// must be 0
        #[bits(1)]
        _reserved: u16,
        pub enable_serr: bool,
        pub enable_fast_b2b: bool,
        pub intx_disable: bool,
        #[bits(5)]
        _reserved2: u16,
    }
}

/// Capabilities
pub mod caps {
    use open_enum::open_enum;

    /// Capability IDs
    ///
    /// Sources: PCI 2.3 Spec - Appendix H
    ///
    /// NOTE: this is a non-exhaustive list, so don't be afraid to add new
    /// variants on an as-needed basis!
    #[expect(missing_docs)] // self explanatory variants
    #[open_enum]
    #[derive(Debug, Clone, Copy, Hash)]
    #[repr(u8)]
    pub enum CapabilityId {
        POWER_MANAGEMENT = 0x01,
        MSI = 0x05,
        VENDOR_SPECIFIC = 0x09,
        PCI_EXPRESS = 0x10,
        MSIX = 0x11,
    }

    /// Upper bound on the number of entries in a capability list. A list
    /// longer than this must contain a loop.
    pub const MAX_CAPABILITIES: usize = 48;

    /// Mask applied to capability pointers; the low two bits are reserved.
    pub const CAP_PTR_MASK: u8 = 0xfc;

    /// MSI
    #[expect(missing_docs)] // primarily enums/structs with self-explanatory variants
    pub mod msi {
        use bitfield_struct::bitfield;
        use open_enum::open_enum;

        /// Offsets into the MSI Capability Header
        ///
        /// Based on PCI Local Bus Specification Rev 3.0, Section 6.8.1
        ///
        /// | Offset    | Bits 31-24    | Bits 23-16    | Bits 15-8     | Bits 7-0              |
        /// |-----------|---------------|---------------|---------------|-----------------------|
        /// | Cap + 0x0 | Message Control               | Next Pointer  | Capability ID (0x05)  |
        /// | Cap + 0x4 | Message Address (32-bit or lower 32-bit of 64-bit)                    |
        /// | Cap + 0x8 | Message Address Upper 32-bit (64-bit capable only)                    |
        /// | Cap + 0xC | Message Data  |               |               |                       |
        #[open_enum]
        #[derive(Debug, Clone, Copy)]
        #[repr(u16)]
        pub enum MsiCapabilityHeader {
            CONTROL_CAPS = 0x00,
            MSG_ADDR_LO = 0x04,
            MSG_ADDR_HI = 0x08,
            MSG_DATA_64 = 0x0C, // For 64-bit address capable
        }

        /// For 32-bit address capable functions the data register takes
        /// the slot of the upper address.
        pub const MSG_DATA_32: u16 = 0x08;

        /// Message Control register, the upper half of the capability's
        /// first dword.
        #[bitfield(u16)]
        pub struct MessageControl {
            pub enable: bool,
            /// log2 of the number of vectors the function can request.
            #[bits(3)]
            pub multiple_message_capable: u8,
            /// log2 of the number of vectors software granted.
            #[bits(3)]
            pub multiple_message_enable: u8,
            pub addr_64bit: bool,
            pub per_vector_masking: bool,
            #[bits(7)]
            _reserved: u16,
        }

        /// Maximum number of vectors a single MSI capability can address.
        pub const MAX_VECTORS: u32 = 32;
    }

    /// PCI Express
    #[expect(missing_docs)] // primarily enums/structs with self-explanatory variants
    pub mod pci_express {
        use bitfield_struct::bitfield;
        use open_enum::open_enum;
        use zerocopy::FromBytes;
        use zerocopy::Immutable;
        use zerocopy::IntoBytes;
        use zerocopy::KnownLayout;

        /// Offsets into the PCI Express Capability Header
        ///
        /// Table pulled from PCI Express Base Specification Rev. 3.0
        ///
        /// | Offset    | Bits 31-24       | Bits 23-16       | Bits 15-8        | Bits 7-0             |
        /// |-----------|------------------|----------------- |------------------|----------------------|
        /// | Cap + 0x0 | PCI Express Capabilities Register   | Next Pointer     | Capability ID (0x10) |
        /// | Cap + 0x4 | Device Capabilities Register                                                  |
        /// | Cap + 0x8 | Device Status    | Device Control                                             |
        /// | Cap + 0xC | Link Capabilities Register                                                    |
        /// | Cap + 0x10| Link Status      | Link Control                                               |
        #[open_enum]
        #[derive(Debug, Clone, Copy)]
        #[repr(u16)]
        pub enum PciExpressCapabilityHeader {
            PCIE_CAPS = 0x00,
            DEVICE_CAPS = 0x04,
            DEVICE_CTL_STS = 0x08,
            LINK_CAPS = 0x0C,
            LINK_CTL_STS = 0x10,
        }

        /// Largest encodable max payload / max read request size (4096 bytes).
        pub const MAX_SIZE_ENCODING: u8 = 5;

        /// Device Capabilities Register (From the 6.4 spec)
        #[bitfield(u32)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct DeviceCapabilities {
            #[bits(3)]
            pub max_payload_size: u32,
            #[bits(2)]
            pub phantom_functions: u32,
            pub ext_tag_field: bool,
            #[bits(3)]
            pub endpoint_l0s_latency: u32,
            #[bits(3)]
            pub endpoint_l1_latency: u32,
            #[bits(3)]
            _reserved1: u32,
            pub role_based_error: bool,
            pub err_cor_subclass_capable: bool,
            pub rx_mps_fixed: bool,
            #[bits(8)]
            pub captured_slot_power_limit: u32,
            #[bits(2)]
            pub captured_slot_power_scale: u32,
            pub function_level_reset: bool,
            pub mixed_mps_supported: bool,
            pub tee_io_supported: bool,
            _reserved3: bool,
        }

        /// Device Control Register
        #[bitfield(u16)]
        #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct DeviceControl {
            pub correctable_error_reporting_enable: bool,
            pub non_fatal_error_reporting_enable: bool,
            pub fatal_error_reporting_enable: bool,
            pub unsupported_request_reporting_enable: bool,
            pub enable_relaxed_ordering: bool,
            #[bits(3)]
            pub max_payload_size: u16,
            pub extended_tag_enable: bool,
            pub phantom_functions_enable: bool,
            pub aux_power_pm_enable: bool,
            pub enable_no_snoop: bool,
            #[bits(3)]
            pub max_read_request_size: u16,
            pub initiate_function_level_reset: bool,
        }
    }
}
