// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Outbound transactions: configuration, I/O and memory requests issued by
//! the root complex, and the typed access handles built on them.

use crate::PAGE_OFFSET_MASK;
use crate::PAGE_SIZE;
use crate::region::RegionError;
use crate::root::RootComplex;
use crate::tag::TagGuard;
use crate::tlp::CompletionStatus;
use crate::tlp::PcieId;
use crate::tlp::Tlp;
use crate::tlp::TlpType;
use async_trait::async_trait;
use pci_core::spec::caps::CapabilityId;
use pci_core::spec::cfg_space::EXT_CFG_SPACE_SIZE;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by outbound transactions.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// No completion arrived in time.
    #[error("completion timeout for tag {tag}")]
    Timeout {
        /// Tag of the request.
        tag: u8,
    },
    /// The completer returned a status other than Successful Completion.
    #[error("unsuccessful completion for tag {tag}: {status:?}")]
    UnsuccessfulCompletion {
        /// Tag of the request.
        tag: u8,
        /// Returned status.
        status: CompletionStatus,
    },
    /// A completion did not match its request.
    #[error("malformed completion for tag {tag}")]
    MalformedCompletion {
        /// Tag of the request.
        tag: u8,
    },
    /// The function is not part of the enumerated tree.
    #[error("device {0} not found")]
    DeviceNotFound(PcieId),
    /// The function does not implement the capability.
    #[error("capability {cap:?} not found on {pcie_id}")]
    CapabilityNotFound {
        /// Function that was searched.
        pcie_id: PcieId,
        /// Missing capability.
        cap: CapabilityId,
    },
    /// The access runs past the end of configuration space.
    #[error("config access of {len} bytes at {offset:#x} is out of range")]
    OutOfRange {
        /// Start of the access.
        offset: u64,
        /// Length of the access.
        len: usize,
    },
    /// A root complex owned region rejected the access.
    #[error(transparent)]
    Region(#[from] RegionError),
}

fn check_config_range(offset: u64, len: usize) -> Result<(), TransactionError> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= EXT_CFG_SPACE_SIZE as u64 => Ok(()),
        _ => Err(TransactionError::OutOfRange { offset, len }),
    }
}

fn check_status(cpl: &Tlp) -> Result<(), TransactionError> {
    if cpl.status != CompletionStatus::SuccessfulCompletion {
        return Err(TransactionError::UnsuccessfulCompletion {
            tag: cpl.tag,
            status: cpl.status,
        });
    }
    Ok(())
}

impl RootComplex {
    async fn allocate_tag(&self) -> TagGuard<'_> {
        let tag = self.tags.allocate().await;
        let stale = self.completions.flush(tag.tag());
        if stale != 0 {
            tracing::warn!(tag = tag.tag(), stale, "discarded late completions");
        }
        tag
    }

    /// Sends a non-posted request and waits for its single completion.
    async fn request(&self, tlp: Tlp, timeout: Duration) -> Result<Tlp, TransactionError> {
        let tag = tlp.tag;
        self.send(tlp).await;
        let cpl = self
            .completions
            .wait(tag, timeout)
            .await
            .ok_or(TransactionError::Timeout { tag })?;
        check_status(&cpl)?;
        Ok(cpl)
    }

    fn config_request(&self, dev: PcieId, write: bool) -> Tlp {
        let fmt_type = match (dev.bus == 0, write) {
            (true, false) => TlpType::CfgRead0,
            (true, true) => TlpType::CfgWrite0,
            (false, false) => TlpType::CfgRead1,
            (false, true) => TlpType::CfgWrite1,
        };
        let mut tlp = Tlp::new(fmt_type);
        tlp.requester_id = self.config.requester_id;
        tlp.dest_id = dev;
        tlp
    }

    /// Reads `len` bytes of configuration space of `dev` at `addr`.
    pub async fn config_read(
        &self,
        dev: PcieId,
        addr: u64,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransactionError> {
        check_config_range(addr, len)?;
        let mut data = Vec::with_capacity(len);
        let mut addr = addr;
        while data.len() < len {
            let first_pad = (addr % 4) as usize;
            let byte_length = (len - data.len()).min(4 - first_pad);

            let tag = self.allocate_tag().await;
            let mut tlp = self.config_request(dev, false);
            tlp.set_addr_be(addr, byte_length);
            tlp.register_number = (addr >> 2) as u16;
            tlp.address = 0;
            tlp.tag = tag.tag();

            let cpl = self.request(tlp, timeout).await?;
            let bytes = cpl.data_bytes();
            if bytes.len() < 4 {
                return Err(TransactionError::MalformedCompletion { tag: tag.tag() });
            }
            data.extend_from_slice(&bytes[first_pad..first_pad + byte_length]);
            addr += byte_length as u64;
        }
        Ok(data)
    }

    /// Writes `data` to configuration space of `dev` at `addr`.
    pub async fn config_write(
        &self,
        dev: PcieId,
        addr: u64,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransactionError> {
        check_config_range(addr, data.len())?;
        let mut n = 0;
        let mut addr = addr;
        while n < data.len() {
            let first_pad = (addr % 4) as usize;
            let byte_length = (data.len() - n).min(4 - first_pad);

            let tag = self.allocate_tag().await;
            let mut tlp = self.config_request(dev, true);
            tlp.set_addr_be_data(addr, &data[n..n + byte_length]);
            tlp.register_number = (addr >> 2) as u16;
            tlp.address = 0;
            tlp.tag = tag.tag();

            self.request(tlp, timeout).await?;
            n += byte_length;
            addr += byte_length as u64;
        }
        Ok(())
    }

    /// Returns the config space offset of capability `cap` of `dev`, as
    /// found by the last enumeration.
    pub fn capability_offset(&self, dev: PcieId, cap: CapabilityId) -> Result<u8, TransactionError> {
        let tree = self.tree.lock();
        let item = tree
            .find_child_dev(dev)
            .ok_or(TransactionError::DeviceNotFound(dev))?;
        item.capability_offset(cap)
            .ok_or(TransactionError::CapabilityNotFound { pcie_id: dev, cap })
    }

    /// Reads `len` bytes at `addr` relative to capability `cap` of `dev`.
    pub async fn capability_read(
        &self,
        dev: PcieId,
        cap: CapabilityId,
        addr: u64,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransactionError> {
        let offset = self.capability_offset(dev, cap)?;
        let addr = addr
            .checked_add(offset.into())
            .ok_or(TransactionError::OutOfRange { offset: addr, len })?;
        self.config_read(dev, addr, len, timeout).await
    }

    /// Writes `data` at `addr` relative to capability `cap` of `dev`.
    pub async fn capability_write(
        &self,
        dev: PcieId,
        cap: CapabilityId,
        addr: u64,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransactionError> {
        let offset = self.capability_offset(dev, cap)?;
        let addr = addr
            .checked_add(offset.into())
            .ok_or(TransactionError::OutOfRange {
                offset: addr,
                len: data.len(),
            })?;
        self.config_write(dev, addr, data, timeout).await
    }

    /// Reads `len` bytes of I/O space at `addr`.
    pub async fn io_read(
        &self,
        addr: u64,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransactionError> {
        let region = self.io_regions.lock().find(addr);
        if let Some(region) = region {
            let mut data = vec![0; len];
            region.read(addr, &mut data).await?;
            return Ok(data);
        }

        let mut data = Vec::with_capacity(len);
        let mut addr = addr;
        while data.len() < len {
            let first_pad = (addr % 4) as usize;
            let byte_length = (len - data.len()).min(4 - first_pad);

            let tag = self.allocate_tag().await;
            let mut tlp = Tlp::new(TlpType::IoRead);
            tlp.requester_id = self.config.requester_id;
            tlp.set_addr_be(addr, byte_length);
            tlp.tag = tag.tag();

            let cpl = self.request(tlp, timeout).await?;
            let bytes = cpl.data_bytes();
            if bytes.len() < 4 {
                return Err(TransactionError::MalformedCompletion { tag: tag.tag() });
            }
            data.extend_from_slice(&bytes[first_pad..first_pad + byte_length]);
            addr += byte_length as u64;
        }
        Ok(data)
    }

    /// Writes `data` to I/O space at `addr`.
    pub async fn io_write(
        &self,
        addr: u64,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransactionError> {
        let region = self.io_regions.lock().find(addr);
        if let Some(region) = region {
            region.write(addr, data).await?;
            return Ok(());
        }

        let mut n = 0;
        let mut addr = addr;
        while n < data.len() {
            let first_pad = (addr % 4) as usize;
            let byte_length = (data.len() - n).min(4 - first_pad);

            let tag = self.allocate_tag().await;
            let mut tlp = Tlp::new(TlpType::IoWrite);
            tlp.requester_id = self.config.requester_id;
            tlp.set_addr_be_data(addr, &data[n..n + byte_length]);
            tlp.tag = tag.tag();

            self.request(tlp, timeout).await?;
            n += byte_length;
            addr += byte_length as u64;
        }
        Ok(())
    }

    /// Reads `len` bytes of memory space at `addr`.
    pub async fn mem_read(
        &self,
        addr: u64,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransactionError> {
        self.mem_read_with_attr(addr, len, timeout, 0, 0).await
    }

    /// Reads `len` bytes of memory space at `addr`, tagging each request
    /// with attributes `attr` and traffic class `tc`.
    pub async fn mem_read_with_attr(
        &self,
        addr: u64,
        len: usize,
        timeout: Duration,
        attr: u8,
        tc: u8,
    ) -> Result<Vec<u8>, TransactionError> {
        let region = self.mem_regions.lock().find(addr);
        if let Some(region) = region {
            let mut data = vec![0; len];
            region.read(addr, &mut data).await?;
            return Ok(data);
        }

        let max_read_request = 128usize << self.config.max_read_request_size;
        let mut data = Vec::with_capacity(len);
        let mut addr = addr;
        while data.len() < len {
            let first_pad = (addr % 4) as usize;
            let byte_length = (len - data.len())
                .min(max_read_request - first_pad)
                .min(PAGE_SIZE - (addr & PAGE_OFFSET_MASK) as usize);

            let tag = self.allocate_tag().await;
            let mut tlp = Tlp::new(if addr > u32::MAX as u64 {
                TlpType::MemRead64
            } else {
                TlpType::MemRead
            });
            tlp.requester_id = self.config.requester_id;
            tlp.set_addr_be(addr, byte_length);
            tlp.tag = tag.tag();
            tlp.attr = attr;
            tlp.tc = tc;
            self.send(tlp).await;

            let mut m = 0;
            while m < byte_length {
                let cpl = self
                    .completions
                    .wait(tag.tag(), timeout)
                    .await
                    .ok_or(TransactionError::Timeout { tag: tag.tag() })?;
                check_status(&cpl)?;

                let offset = (cpl.lower_address & 3) as usize;
                let byte_count = cpl.byte_count as usize;
                if byte_count + 3 + offset < cpl.length as usize * 4
                    || byte_count != byte_length - m
                {
                    return Err(TransactionError::MalformedCompletion { tag: tag.tag() });
                }

                let bytes = cpl.data_bytes();
                let end = (offset + byte_count).min(bytes.len());
                if end <= offset {
                    return Err(TransactionError::MalformedCompletion { tag: tag.tag() });
                }
                data.extend_from_slice(&bytes[offset..end]);
                m += end - offset;
            }
            addr += byte_length as u64;
        }
        Ok(data)
    }

    /// Writes `data` to memory space at `addr`. Memory writes are posted.
    pub async fn mem_write(&self, addr: u64, data: &[u8]) -> Result<(), TransactionError> {
        self.mem_write_with_attr(addr, data, 0, 0).await
    }

    /// Writes `data` to memory space at `addr`, tagging each request with
    /// attributes `attr` and traffic class `tc`.
    pub async fn mem_write_with_attr(
        &self,
        addr: u64,
        data: &[u8],
        attr: u8,
        tc: u8,
    ) -> Result<(), TransactionError> {
        let region = self.mem_regions.lock().find(addr);
        if let Some(region) = region {
            region.write(addr, data).await?;
            return Ok(());
        }

        let max_payload = 128usize << self.config.max_payload_size;
        let mut n = 0;
        let mut addr = addr;
        while n < data.len() {
            let first_pad = (addr % 4) as usize;
            let byte_length = (data.len() - n)
                .min(max_payload - first_pad)
                .min(PAGE_SIZE - (addr & PAGE_OFFSET_MASK) as usize);

            let mut tlp = Tlp::new(if addr > u32::MAX as u64 {
                TlpType::MemWrite64
            } else {
                TlpType::MemWrite
            });
            tlp.requester_id = self.config.requester_id;
            tlp.set_addr_be_data(addr, &data[n..n + byte_length]);
            tlp.attr = attr;
            tlp.tc = tc;
            self.send(tlp).await;

            n += byte_length;
            addr += byte_length as u64;
        }
        Ok(())
    }

    /// Returns a handle for configuration space accesses to `dev`.
    pub fn config_space(&self, dev: PcieId) -> ConfigSpace<'_> {
        ConfigSpace {
            rc: self,
            dev,
            timeout: self.config.default_timeout,
        }
    }

    /// Returns a handle for accesses relative to capability `cap` of `dev`.
    pub fn capability_space(&self, dev: PcieId, cap: CapabilityId) -> CapabilitySpace<'_> {
        CapabilitySpace {
            rc: self,
            dev,
            cap,
            timeout: self.config.default_timeout,
        }
    }

    /// Returns a handle for I/O space accesses.
    pub fn io_space(&self) -> IoSpace<'_> {
        IoSpace {
            rc: self,
            timeout: self.config.default_timeout,
        }
    }

    /// Returns a handle for memory space accesses.
    pub fn mem_space(&self) -> MemSpace<'_> {
        MemSpace {
            rc: self,
            timeout: self.config.default_timeout,
            attr: 0,
            tc: 0,
        }
    }
}

/// Byte order of multi-byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Least significant byte at the lowest address.
    #[default]
    Little,
    /// Most significant byte at the lowest address.
    Big,
}

impl ByteOrder {
    fn decode(self, bytes: &[u8]) -> u64 {
        let fold = |acc: u64, &b: &u8| (acc << 8) | b as u64;
        match self {
            ByteOrder::Little => bytes.iter().rev().fold(0, fold),
            ByteOrder::Big => bytes.iter().fold(0, fold),
        }
    }

    fn encode(self, value: u64, size: usize) -> Vec<u8> {
        let mut bytes = value.to_le_bytes()[..size].to_vec();
        if self == ByteOrder::Big {
            bytes.reverse();
        }
        bytes
    }
}

/// A byte addressed space reachable through the root complex.
///
/// Only [`Space::read`] and [`Space::write`] need implementing; the sized
/// accessors are built on them.
#[async_trait]
pub trait Space: Send + Sync {
    /// Reads `len` bytes at `addr`.
    async fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, TransactionError>;

    /// Writes `data` at `addr`.
    async fn write(&self, addr: u64, data: &[u8]) -> Result<(), TransactionError>;

    /// Reads one byte.
    async fn read_byte(&self, addr: u64) -> Result<u8, TransactionError> {
        Ok(self.read(addr, 1).await?[0])
    }

    /// Reads a 16-bit value.
    async fn read_word(&self, addr: u64, order: ByteOrder) -> Result<u16, TransactionError> {
        Ok(order.decode(&self.read(addr, 2).await?) as u16)
    }

    /// Reads a 32-bit value.
    async fn read_dword(&self, addr: u64, order: ByteOrder) -> Result<u32, TransactionError> {
        Ok(order.decode(&self.read(addr, 4).await?) as u32)
    }

    /// Reads a 64-bit value.
    async fn read_qword(&self, addr: u64, order: ByteOrder) -> Result<u64, TransactionError> {
        Ok(order.decode(&self.read(addr, 8).await?))
    }

    /// Reads `count` consecutive 16-bit values.
    async fn read_words(
        &self,
        addr: u64,
        count: usize,
        order: ByteOrder,
    ) -> Result<Vec<u16>, TransactionError> {
        let data = self.read(addr, count * 2).await?;
        Ok(data.chunks(2).map(|c| order.decode(c) as u16).collect())
    }

    /// Reads `count` consecutive 32-bit values.
    async fn read_dwords(
        &self,
        addr: u64,
        count: usize,
        order: ByteOrder,
    ) -> Result<Vec<u32>, TransactionError> {
        let data = self.read(addr, count * 4).await?;
        Ok(data.chunks(4).map(|c| order.decode(c) as u32).collect())
    }

    /// Reads `count` consecutive 64-bit values.
    async fn read_qwords(
        &self,
        addr: u64,
        count: usize,
        order: ByteOrder,
    ) -> Result<Vec<u64>, TransactionError> {
        let data = self.read(addr, count * 8).await?;
        Ok(data.chunks(8).map(|c| order.decode(c)).collect())
    }

    /// Writes one byte.
    async fn write_byte(&self, addr: u64, value: u8) -> Result<(), TransactionError> {
        self.write(addr, &[value]).await
    }

    /// Writes a 16-bit value.
    async fn write_word(
        &self,
        addr: u64,
        value: u16,
        order: ByteOrder,
    ) -> Result<(), TransactionError> {
        self.write(addr, &order.encode(value.into(), 2)).await
    }

    /// Writes a 32-bit value.
    async fn write_dword(
        &self,
        addr: u64,
        value: u32,
        order: ByteOrder,
    ) -> Result<(), TransactionError> {
        self.write(addr, &order.encode(value.into(), 4)).await
    }

    /// Writes a 64-bit value.
    async fn write_qword(
        &self,
        addr: u64,
        value: u64,
        order: ByteOrder,
    ) -> Result<(), TransactionError> {
        self.write(addr, &order.encode(value, 8)).await
    }

    /// Writes consecutive 16-bit values.
    async fn write_words(
        &self,
        addr: u64,
        values: &[u16],
        order: ByteOrder,
    ) -> Result<(), TransactionError> {
        let data: Vec<u8> = values
            .iter()
            .flat_map(|&v| order.encode(v.into(), 2))
            .collect();
        self.write(addr, &data).await
    }

    /// Writes consecutive 32-bit values.
    async fn write_dwords(
        &self,
        addr: u64,
        values: &[u32],
        order: ByteOrder,
    ) -> Result<(), TransactionError> {
        let data: Vec<u8> = values
            .iter()
            .flat_map(|&v| order.encode(v.into(), 4))
            .collect();
        self.write(addr, &data).await
    }

    /// Writes consecutive 64-bit values.
    async fn write_qwords(
        &self,
        addr: u64,
        values: &[u64],
        order: ByteOrder,
    ) -> Result<(), TransactionError> {
        let data: Vec<u8> = values.iter().flat_map(|&v| order.encode(v, 8)).collect();
        self.write(addr, &data).await
    }
}

/// Configuration space of one function.
pub struct ConfigSpace<'a> {
    rc: &'a RootComplex,
    dev: PcieId,
    timeout: Duration,
}

impl ConfigSpace<'_> {
    /// Overrides the completion timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Space for ConfigSpace<'_> {
    async fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, TransactionError> {
        self.rc.config_read(self.dev, addr, len, self.timeout).await
    }

    async fn write(&self, addr: u64, data: &[u8]) -> Result<(), TransactionError> {
        self.rc.config_write(self.dev, addr, data, self.timeout).await
    }
}

/// Configuration space relative to one capability of one function.
pub struct CapabilitySpace<'a> {
    rc: &'a RootComplex,
    dev: PcieId,
    cap: CapabilityId,
    timeout: Duration,
}

impl CapabilitySpace<'_> {
    /// Overrides the completion timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Space for CapabilitySpace<'_> {
    async fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, TransactionError> {
        self.rc
            .capability_read(self.dev, self.cap, addr, len, self.timeout)
            .await
    }

    async fn write(&self, addr: u64, data: &[u8]) -> Result<(), TransactionError> {
        self.rc
            .capability_write(self.dev, self.cap, addr, data, self.timeout)
            .await
    }
}

/// I/O space.
pub struct IoSpace<'a> {
    rc: &'a RootComplex,
    timeout: Duration,
}

impl IoSpace<'_> {
    /// Overrides the completion timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Space for IoSpace<'_> {
    async fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, TransactionError> {
        self.rc.io_read(addr, len, self.timeout).await
    }

    async fn write(&self, addr: u64, data: &[u8]) -> Result<(), TransactionError> {
        self.rc.io_write(addr, data, self.timeout).await
    }
}

/// Memory space.
pub struct MemSpace<'a> {
    rc: &'a RootComplex,
    timeout: Duration,
    attr: u8,
    tc: u8,
}

impl MemSpace<'_> {
    /// Overrides the completion timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the attributes and traffic class of every request.
    pub fn with_attr(mut self, attr: u8, tc: u8) -> Self {
        self.attr = attr;
        self.tc = tc;
        self
    }
}

#[async_trait]
impl Space for MemSpace<'_> {
    async fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, TransactionError> {
        self.rc
            .mem_read_with_attr(addr, len, self.timeout, self.attr, self.tc)
            .await
    }

    async fn write(&self, addr: u64, data: &[u8]) -> Result<(), TransactionError> {
        self.rc
            .mem_write_with_attr(addr, data, self.attr, self.tc)
            .await
    }
}
