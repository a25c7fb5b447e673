// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transaction layer packets.
//!
//! [`Tlp`] is the unit exchanged between the root complex and the devices
//! below it. Packets are kept in decoded form everywhere inside the crate;
//! [`Tlp::pack`] and [`Tlp::unpack`] convert to and from the PCIe wire
//! layout (big-endian header dwords followed by the payload in address
//! order).

use crate::BDF_BUS_SHIFT;
use crate::BDF_DEVICE_MASK;
use crate::BDF_DEVICE_SHIFT;
use crate::BDF_FUNCTION_MASK;
use crate::PAGE_OFFSET_MASK;
use crate::PAGE_SIZE;
use bitfield_struct::bitfield;
use std::fmt;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;
use zerocopy::byteorder::big_endian::U32;

/// Largest payload a single TLP can carry, in dwords.
pub const MAX_TLP_DWORDS: u16 = 1024;

/// Identifies a PCI function by bus, device and function number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PcieId {
    /// Bus number.
    pub bus: u8,
    /// Device number, 0..32.
    pub device: u8,
    /// Function number, 0..8.
    pub function: u8,
}

impl PcieId {
    /// Creates a new id.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device: device & BDF_DEVICE_MASK as u8,
            function: function & BDF_FUNCTION_MASK as u8,
        }
    }

    /// Decodes the 16-bit requester/completer id form.
    pub const fn from_bits(bits: u16) -> Self {
        Self {
            bus: (bits >> BDF_BUS_SHIFT) as u8,
            device: ((bits >> BDF_DEVICE_SHIFT) & BDF_DEVICE_MASK) as u8,
            function: (bits & BDF_FUNCTION_MASK) as u8,
        }
    }

    /// Encodes the id in its 16-bit requester/completer id form.
    pub const fn into_bits(self) -> u16 {
        ((self.bus as u16) << BDF_BUS_SHIFT)
            | (((self.device as u16) & BDF_DEVICE_MASK) << BDF_DEVICE_SHIFT)
            | ((self.function as u16) & BDF_FUNCTION_MASK)
    }
}

impl fmt::Display for PcieId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

/// Combined format and type field of a TLP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlpType {
    /// Memory read, 32-bit address.
    MemRead = 0x00,
    /// Memory read, 64-bit address.
    MemRead64 = 0x20,
    /// Locked memory read, 32-bit address.
    MemReadLocked = 0x01,
    /// Locked memory read, 64-bit address.
    MemReadLocked64 = 0x21,
    /// Memory write, 32-bit address.
    MemWrite = 0x40,
    /// Memory write, 64-bit address.
    MemWrite64 = 0x60,
    /// I/O read.
    IoRead = 0x02,
    /// I/O write.
    IoWrite = 0x42,
    /// Configuration read, type 0.
    CfgRead0 = 0x04,
    /// Configuration write, type 0.
    CfgWrite0 = 0x44,
    /// Configuration read, type 1.
    CfgRead1 = 0x05,
    /// Configuration write, type 1.
    CfgWrite1 = 0x45,
    /// Completion without data.
    Cpl = 0x0a,
    /// Completion with data.
    CplData = 0x4a,
    /// Completion for a locked read, without data.
    CplLocked = 0x0b,
    /// Completion for a locked read, with data.
    CplLockedData = 0x4b,
}

const FMT_HAS_DATA: u8 = 0x40;
const FMT_4DW: u8 = 0x20;

impl TlpType {
    /// Returns true for the four completion kinds.
    pub fn is_completion(self) -> bool {
        matches!(
            self,
            Self::Cpl | Self::CplData | Self::CplLocked | Self::CplLockedData
        )
    }

    /// Returns true if packets of this kind carry a payload.
    pub fn has_data(self) -> bool {
        self as u8 & FMT_HAS_DATA != 0
    }

    /// Returns true if the header carries a 64-bit address.
    pub fn is_64bit(self) -> bool {
        self as u8 & FMT_4DW != 0
    }

    /// Returns true for memory read and write requests.
    pub fn is_memory(self) -> bool {
        matches!(
            self,
            Self::MemRead
                | Self::MemRead64
                | Self::MemReadLocked
                | Self::MemReadLocked64
                | Self::MemWrite
                | Self::MemWrite64
        )
    }

    /// Returns true for configuration requests of either type.
    pub fn is_config(self) -> bool {
        matches!(
            self,
            Self::CfgRead0 | Self::CfgWrite0 | Self::CfgRead1 | Self::CfgWrite1
        )
    }

    fn header_dwords(self) -> usize {
        if self.is_64bit() { 4 } else { 3 }
    }
}

impl TryFrom<u8> for TlpType {
    type Error = TlpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::MemRead,
            0x20 => Self::MemRead64,
            0x01 => Self::MemReadLocked,
            0x21 => Self::MemReadLocked64,
            0x40 => Self::MemWrite,
            0x60 => Self::MemWrite64,
            0x02 => Self::IoRead,
            0x42 => Self::IoWrite,
            0x04 => Self::CfgRead0,
            0x44 => Self::CfgWrite0,
            0x05 => Self::CfgRead1,
            0x45 => Self::CfgWrite1,
            0x0a => Self::Cpl,
            0x4a => Self::CplData,
            0x0b => Self::CplLocked,
            0x4b => Self::CplLockedData,
            _ => return Err(TlpError::UnknownFmtType(value)),
        })
    }
}

/// Completion status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CompletionStatus {
    /// Successful Completion.
    #[default]
    SuccessfulCompletion = 0x0,
    /// Unsupported Request.
    UnsupportedRequest = 0x1,
    /// Configuration Request Retry Status.
    ConfigRequestRetry = 0x2,
    /// Completer Abort.
    CompleterAbort = 0x4,
}

impl TryFrom<u8> for CompletionStatus {
    type Error = TlpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0 => Self::SuccessfulCompletion,
            0x1 => Self::UnsupportedRequest,
            0x2 => Self::ConfigRequestRetry,
            0x4 => Self::CompleterAbort,
            _ => return Err(TlpError::ReservedStatus(value)),
        })
    }
}

/// Errors produced while decoding or validating a TLP.
#[derive(Debug, Error, PartialEq, Eq)]
#[expect(missing_docs)] // self-explanatory variants
pub enum TlpError {
    #[error("tlp truncated: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown fmt/type {0:#04x}")]
    UnknownFmtType(u8),
    #[error("reserved completion status {0:#x}")]
    ReservedStatus(u8),
    #[error("length field {length} does not match {data} payload dwords")]
    LengthMismatch { length: u16, data: usize },
    #[error("invalid length {0} dwords")]
    InvalidLength(u16),
    #[error("invalid byte enables first={first:#x} last={last:#x}")]
    InvalidByteEnables { first: u8, last: u8 },
    #[error("address {0:#x} is not dword aligned")]
    MisalignedAddress(u64),
    #[error("address {0:#x} does not fit a 32-bit header")]
    AddressTooWide(u64),
    #[error("invalid byte count {0}")]
    InvalidByteCount(u16),
    #[error("invalid lower address {0:#x}")]
    InvalidLowerAddress(u8),
}

#[bitfield(u32)]
struct HeaderDw0 {
    #[bits(10)]
    length: u16,
    #[bits(2)]
    _at: u8,
    #[bits(2)]
    attr: u8,
    #[bits(4)]
    _ep_td_th_ln: u8,
    attr2: bool,
    #[bits(1)]
    _t8: u8,
    #[bits(3)]
    tc: u8,
    #[bits(1)]
    _t9: u8,
    fmt_type: u8,
}

#[bitfield(u32)]
struct RequestDw1 {
    #[bits(4)]
    first_be: u8,
    #[bits(4)]
    last_be: u8,
    tag: u8,
    requester_id: u16,
}

#[bitfield(u32)]
struct CompletionDw1 {
    #[bits(12)]
    byte_count: u16,
    #[bits(1)]
    _bcm: u8,
    #[bits(3)]
    status: u8,
    completer_id: u16,
}

#[bitfield(u32)]
struct CompletionDw2 {
    #[bits(7)]
    lower_address: u8,
    #[bits(1)]
    _reserved: u8,
    tag: u8,
    requester_id: u16,
}

#[bitfield(u32)]
struct ConfigDw2 {
    #[bits(2)]
    _reserved: u8,
    #[bits(10)]
    register_number: u16,
    #[bits(4)]
    _reserved2: u8,
    dest_id: u16,
}

/// A decoded transaction layer packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlp {
    /// Format and type.
    pub fmt_type: TlpType,
    /// Requester id (requests and completions).
    pub requester_id: PcieId,
    /// Completer id (completions only).
    pub completer_id: PcieId,
    /// Target function (configuration requests only).
    pub dest_id: PcieId,
    /// Transaction tag.
    pub tag: u8,
    /// Dword aligned byte address (memory and I/O requests).
    pub address: u64,
    /// Dword register number (configuration requests).
    pub register_number: u16,
    /// Payload or request length in dwords.
    pub length: u16,
    /// Byte enables of the first dword.
    pub first_be: u8,
    /// Byte enables of the last dword, zero for single dword requests.
    pub last_be: u8,
    /// Traffic class.
    pub tc: u8,
    /// Attributes, bit 2 is ID-based ordering.
    pub attr: u8,
    /// Completion status.
    pub status: CompletionStatus,
    /// Bytes remaining for the request, including this completion.
    pub byte_count: u16,
    /// Low address bits of the first byte returned by this completion.
    pub lower_address: u8,
    /// Payload dwords, lowest address first, each little-endian.
    pub data: Vec<u32>,
}

impl Tlp {
    /// Creates an empty packet of the given kind.
    pub fn new(fmt_type: TlpType) -> Self {
        Self {
            fmt_type,
            requester_id: PcieId::default(),
            completer_id: PcieId::default(),
            dest_id: PcieId::default(),
            tag: 0,
            address: 0,
            register_number: 0,
            length: 0,
            first_be: 0,
            last_be: 0,
            tc: 0,
            attr: 0,
            status: CompletionStatus::SuccessfulCompletion,
            byte_count: 0,
            lower_address: 0,
            data: Vec::new(),
        }
    }

    /// Sets address, length and byte enables for an access of `len` bytes
    /// starting at the unaligned byte address `addr`.
    pub fn set_addr_be(&mut self, addr: u64, len: usize) {
        let first_pad = (addr & 3) as usize;
        self.address = addr & !3;
        if len == 0 {
            self.length = 1;
            self.first_be = 0;
            self.last_be = 0;
            return;
        }
        let last_pad = (4 - (first_pad + len) % 4) % 4;
        self.length = ((first_pad + len + last_pad) / 4) as u16;
        self.first_be = (0xf << first_pad) & 0xf;
        self.last_be = 0xf >> last_pad;
        if self.length == 1 {
            self.first_be &= self.last_be;
            self.last_be = 0;
        }
    }

    /// Like [`Self::set_addr_be`], also storing `data` as the payload at
    /// the matching dword offsets.
    pub fn set_addr_be_data(&mut self, addr: u64, data: &[u8]) {
        self.set_addr_be(addr, data.len());
        let first_pad = (addr & 3) as usize;
        let mut bytes = vec![0; self.length as usize * 4];
        bytes[first_pad..first_pad + data.len()].copy_from_slice(data);
        self.set_data(&bytes);
    }

    /// Byte offset of the first enabled byte within the first dword.
    pub fn first_be_offset(&self) -> usize {
        (self.first_be.trailing_zeros() as usize).min(3)
    }

    /// Number of disabled bytes at the end of the last dword.
    pub fn last_be_offset(&self) -> usize {
        let be = if self.length == 1 {
            self.first_be
        } else {
            self.last_be
        } & 0xf;
        match be {
            0 => 0,
            be => (be.leading_zeros() - 4) as usize,
        }
    }

    /// Number of bytes covered by the byte enables.
    pub fn be_byte_count(&self) -> usize {
        (self.length as usize * 4).saturating_sub(self.first_be_offset() + self.last_be_offset())
    }

    /// Replaces the payload with `data`, padded to whole dwords, and updates
    /// the length field.
    pub fn set_data(&mut self, data: &[u8]) {
        self.data = data
            .chunks(4)
            .map(|chunk| {
                let mut dw = [0; 4];
                dw[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(dw)
            })
            .collect();
        self.length = self.data.len() as u16;
    }

    /// Returns the payload as bytes in address order.
    pub fn data_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|dw| dw.to_le_bytes()).collect()
    }

    fn completion_of(req: &Tlp, fmt_type: TlpType, completer_id: PcieId) -> Self {
        Self {
            requester_id: req.requester_id,
            completer_id,
            tag: req.tag,
            tc: req.tc,
            attr: req.attr,
            ..Self::new(fmt_type)
        }
    }

    /// Creates a successful completion without data for `req`.
    pub fn completion_for(req: &Tlp, completer_id: PcieId) -> Self {
        let fmt_type = if matches!(
            req.fmt_type,
            TlpType::MemReadLocked | TlpType::MemReadLocked64
        ) {
            TlpType::CplLocked
        } else {
            TlpType::Cpl
        };
        Self {
            byte_count: 4,
            ..Self::completion_of(req, fmt_type, completer_id)
        }
    }

    /// Creates a successful completion with data for `req`. The caller sets
    /// the payload, byte count and lower address.
    pub fn completion_data_for(req: &Tlp, completer_id: PcieId) -> Self {
        let fmt_type = if matches!(
            req.fmt_type,
            TlpType::MemReadLocked | TlpType::MemReadLocked64
        ) {
            TlpType::CplLockedData
        } else {
            TlpType::CplData
        };
        Self::completion_of(req, fmt_type, completer_id)
    }

    /// Creates an Unsupported Request completion for `req`.
    pub fn ur_completion_for(req: &Tlp, completer_id: PcieId) -> Self {
        Self {
            status: CompletionStatus::UnsupportedRequest,
            ..Self::completion_for(req, completer_id)
        }
    }

    /// Checks the packet for internal consistency.
    pub fn validate(&self) -> Result<(), TlpError> {
        let ty = self.fmt_type;
        if ty.is_completion() {
            if ty.has_data() {
                if self.length == 0 || self.length > MAX_TLP_DWORDS {
                    return Err(TlpError::InvalidLength(self.length));
                }
            } else if self.length != 0 {
                return Err(TlpError::InvalidLength(self.length));
            }
            if self.byte_count == 0 || self.byte_count as usize > PAGE_SIZE {
                return Err(TlpError::InvalidByteCount(self.byte_count));
            }
            if self.lower_address > 0x7f {
                return Err(TlpError::InvalidLowerAddress(self.lower_address));
            }
        } else {
            if self.length == 0 || self.length > MAX_TLP_DWORDS {
                return Err(TlpError::InvalidLength(self.length));
            }
            if (ty.is_config() || matches!(ty, TlpType::IoRead | TlpType::IoWrite))
                && self.length != 1
            {
                return Err(TlpError::InvalidLength(self.length));
            }
            let be_ok = if self.length == 1 {
                self.last_be == 0 && self.first_be <= 0xf
            } else {
                self.first_be != 0 && self.last_be != 0 && self.first_be <= 0xf && self.last_be <= 0xf
            };
            if !be_ok {
                return Err(TlpError::InvalidByteEnables {
                    first: self.first_be,
                    last: self.last_be,
                });
            }
            if !ty.is_config() {
                if self.address & 3 != 0 {
                    return Err(TlpError::MisalignedAddress(self.address));
                }
                if !ty.is_64bit() && self.address > u32::MAX as u64 {
                    return Err(TlpError::AddressTooWide(self.address));
                }
            }
        }
        if ty.has_data() {
            if self.data.len() != self.length as usize {
                return Err(TlpError::LengthMismatch {
                    length: self.length,
                    data: self.data.len(),
                });
            }
        } else if !self.data.is_empty() {
            return Err(TlpError::LengthMismatch {
                length: self.length,
                data: self.data.len(),
            });
        }
        Ok(())
    }

    /// Returns true if [`Self::validate`] passes.
    pub fn check(&self) -> bool {
        self.validate().is_ok()
    }

    /// Returns true if a memory request of this length at this address
    /// would cross a 4KB boundary.
    pub fn crosses_page(&self) -> bool {
        (self.address & PAGE_OFFSET_MASK) + self.length as u64 * 4 > PAGE_SIZE as u64
    }

    /// Encodes the packet in wire format.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.fmt_type.header_dwords() + self.data.len()) * 4);
        let mut push = |dw: u32| out.extend_from_slice(U32::new(dw).as_bytes());

        push(
            HeaderDw0::new()
                .with_length(self.length & (MAX_TLP_DWORDS - 1))
                .with_attr(self.attr & 3)
                .with_attr2(self.attr & 4 != 0)
                .with_tc(self.tc & 7)
                .with_fmt_type(self.fmt_type as u8)
                .into_bits(),
        );

        if self.fmt_type.is_completion() {
            push(
                CompletionDw1::new()
                    .with_byte_count(self.byte_count & 0xfff)
                    .with_status(self.status as u8)
                    .with_completer_id(self.completer_id.into_bits())
                    .into_bits(),
            );
            push(
                CompletionDw2::new()
                    .with_lower_address(self.lower_address & 0x7f)
                    .with_tag(self.tag)
                    .with_requester_id(self.requester_id.into_bits())
                    .into_bits(),
            );
        } else {
            push(
                RequestDw1::new()
                    .with_first_be(self.first_be & 0xf)
                    .with_last_be(self.last_be & 0xf)
                    .with_tag(self.tag)
                    .with_requester_id(self.requester_id.into_bits())
                    .into_bits(),
            );
            if self.fmt_type.is_config() {
                push(
                    ConfigDw2::new()
                        .with_register_number(self.register_number & 0x3ff)
                        .with_dest_id(self.dest_id.into_bits())
                        .into_bits(),
                );
            } else if self.fmt_type.is_64bit() {
                push((self.address >> 32) as u32);
                push(self.address as u32 & !3);
            } else {
                push(self.address as u32 & !3);
            }
        }

        for dw in &self.data {
            out.extend_from_slice(&dw.to_le_bytes());
        }
        out
    }

    /// Decodes a packet from wire format.
    pub fn unpack(bytes: &[u8]) -> Result<Self, TlpError> {
        let mut rest = bytes;
        let mut next = || -> Result<u32, TlpError> {
            let (dw, tail) = U32::read_from_prefix(rest).map_err(|_| TlpError::Truncated {
                expected: bytes.len() - rest.len() + 4,
                actual: bytes.len(),
            })?;
            rest = tail;
            Ok(dw.get())
        };

        let dw0 = HeaderDw0::from_bits(next()?);
        let fmt_type = TlpType::try_from(dw0.fmt_type())?;
        let mut tlp = Tlp::new(fmt_type);
        tlp.tc = dw0.tc();
        tlp.attr = dw0.attr() | if dw0.attr2() { 4 } else { 0 };
        tlp.length = match dw0.length() {
            0 if fmt_type.is_completion() && !fmt_type.has_data() => 0,
            0 => MAX_TLP_DWORDS,
            n => n,
        };

        if fmt_type.is_completion() {
            let dw1 = CompletionDw1::from_bits(next()?);
            let dw2 = CompletionDw2::from_bits(next()?);
            tlp.byte_count = match dw1.byte_count() {
                0 => PAGE_SIZE as u16,
                n => n,
            };
            tlp.status = CompletionStatus::try_from(dw1.status())?;
            tlp.completer_id = PcieId::from_bits(dw1.completer_id());
            tlp.lower_address = dw2.lower_address();
            tlp.tag = dw2.tag();
            tlp.requester_id = PcieId::from_bits(dw2.requester_id());
        } else {
            let dw1 = RequestDw1::from_bits(next()?);
            tlp.first_be = dw1.first_be();
            tlp.last_be = dw1.last_be();
            tlp.tag = dw1.tag();
            tlp.requester_id = PcieId::from_bits(dw1.requester_id());
            if fmt_type.is_config() {
                let dw2 = ConfigDw2::from_bits(next()?);
                tlp.register_number = dw2.register_number();
                tlp.dest_id = PcieId::from_bits(dw2.dest_id());
            } else if fmt_type.is_64bit() {
                let hi = next()? as u64;
                let lo = next()? as u64;
                tlp.address = (hi << 32) | (lo & !3);
            } else {
                tlp.address = next()? as u64 & !3;
            }
        }

        if fmt_type.has_data() {
            let len = tlp.length as usize * 4;
            if rest.len() < len {
                return Err(TlpError::Truncated {
                    expected: bytes.len() - rest.len() + len,
                    actual: bytes.len(),
                });
            }
            tlp.data = rest[..len]
                .chunks_exact(4)
                .map(|chunk| {
                    let mut dw = [0; 4];
                    dw.copy_from_slice(chunk);
                    u32::from_le_bytes(dw)
                })
                .collect();
        }
        Ok(tlp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcie_id_bits() {
        let id = PcieId::new(0x12, 0x1f, 7);
        assert_eq!(id.into_bits(), 0x12ff);
        assert_eq!(PcieId::from_bits(0x0108), PcieId::new(1, 1, 0));
        assert_eq!(id.to_string(), "12:1f.7");
    }

    #[test]
    fn addr_be_spanning_dwords() {
        let mut tlp = Tlp::new(TlpType::MemWrite);
        tlp.set_addr_be_data(0x1002, &[0xaa, 0xbb, 0xcc]);
        assert_eq!(tlp.address, 0x1000);
        assert_eq!(tlp.length, 2);
        assert_eq!(tlp.first_be, 0b1100);
        assert_eq!(tlp.last_be, 0b0001);
        assert_eq!(tlp.first_be_offset(), 2);
        assert_eq!(tlp.be_byte_count(), 3);
        assert_eq!(tlp.data, vec![0xbbaa_0000, 0x0000_00cc]);
        assert!(tlp.check());
    }

    #[test]
    fn addr_be_single_dword() {
        let mut tlp = Tlp::new(TlpType::IoWrite);
        tlp.set_addr_be_data(0x1002, &[0xaa, 0xbb]);
        assert_eq!(tlp.length, 1);
        assert_eq!(tlp.first_be, 0b1100);
        assert_eq!(tlp.last_be, 0);
        assert_eq!(tlp.be_byte_count(), 2);

        let mut tlp = Tlp::new(TlpType::MemRead);
        tlp.set_addr_be(0x101, 1);
        assert_eq!(tlp.first_be, 0b0010);
        assert_eq!(tlp.first_be_offset(), 1);
        assert_eq!(tlp.be_byte_count(), 1);
    }

    #[test]
    fn config_read_wire_layout() {
        let mut tlp = Tlp::new(TlpType::CfgRead0);
        tlp.tag = 5;
        tlp.length = 1;
        tlp.first_be = 0xf;
        tlp.dest_id = PcieId::new(1, 0, 0);
        tlp.register_number = 4;
        let bytes = tlp.pack();
        assert_eq!(
            bytes,
            [
                0x04, 0x00, 0x00, 0x01, 0x00, 0x00, 0x05, 0x0f, 0x01, 0x00, 0x00, 0x10
            ]
        );
        assert_eq!(Tlp::unpack(&bytes).unwrap(), tlp);
    }

    #[test]
    fn completion_wire_layout() {
        let mut req = Tlp::new(TlpType::MemRead64);
        req.requester_id = PcieId::new(0, 2, 0);
        req.tag = 0x33;
        let mut cpl = Tlp::completion_data_for(&req, PcieId::new(1, 0, 0));
        cpl.set_data(&[1, 2, 3, 4]);
        cpl.byte_count = 4096;
        cpl.lower_address = 0x40;
        let bytes = cpl.pack();
        // byte count 4096 encodes as zero
        assert_eq!(&bytes[..12], &[0x4a, 0, 0, 1, 0x01, 0x00, 0x00, 0x00, 0x00, 0x10, 0x33, 0x40]);
        assert_eq!(&bytes[12..], &[1, 2, 3, 4]);
        assert_eq!(Tlp::unpack(&bytes).unwrap(), cpl);
    }

    #[test]
    fn max_length_encodes_as_zero() {
        let mut tlp = Tlp::new(TlpType::MemWrite64);
        tlp.set_addr_be_data(0x1_0000_0000, &[0x5a; PAGE_SIZE]);
        assert_eq!(tlp.length, MAX_TLP_DWORDS);
        let bytes = tlp.pack();
        assert_eq!(&bytes[2..4], &[0, 0]);
        let decoded = Tlp::unpack(&bytes).unwrap();
        assert_eq!(decoded.length, MAX_TLP_DWORDS);
        assert_eq!(decoded.address, 0x1_0000_0000);
        assert_eq!(decoded, tlp);
    }

    #[test]
    fn unpack_rejects_garbage() {
        assert_eq!(
            Tlp::unpack(&[0x7f, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(TlpError::UnknownFmtType(0x7f))
        );
        assert!(matches!(
            Tlp::unpack(&[0x40, 0, 0, 1, 0, 0, 0, 0xf]),
            Err(TlpError::Truncated { .. })
        ));
        // completion status 3 is reserved
        assert_eq!(
            Tlp::unpack(&[0x0a, 0, 0, 0, 0, 0, 0x60, 4, 0, 0, 0, 0]),
            Err(TlpError::ReservedStatus(3))
        );
    }

    #[test]
    fn validate_catches_inconsistencies() {
        let mut tlp = Tlp::new(TlpType::MemWrite);
        tlp.set_addr_be_data(0x1_0000_0000, &[0; 4]);
        assert_eq!(
            tlp.validate(),
            Err(TlpError::AddressTooWide(0x1_0000_0000))
        );

        let mut tlp = Tlp::new(TlpType::IoRead);
        tlp.set_addr_be(0x10, 8);
        assert_eq!(tlp.validate(), Err(TlpError::InvalidLength(2)));

        let mut tlp = Tlp::new(TlpType::MemWrite);
        tlp.set_addr_be(0x10, 4);
        assert!(matches!(
            tlp.validate(),
            Err(TlpError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn page_crossing() {
        let mut tlp = Tlp::new(TlpType::MemRead);
        tlp.address = 0xffc;
        tlp.length = 2;
        assert!(tlp.crosses_page());
        tlp.length = 1;
        assert!(!tlp.crosses_page());
    }
}
