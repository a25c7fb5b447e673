// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bus enumeration: discovers functions below the root complex, sizes and
//! assigns BARs and expansion ROMs, walks capability lists, programs device
//! control and bridge bus numbers and windows.

use crate::DEVICES_PER_BUS;
use crate::FUNCTIONS_PER_DEVICE;
use crate::engine::ByteOrder;
use crate::engine::ConfigSpace;
use crate::engine::Space;
use crate::root::RootComplex;
use crate::tlp::PcieId;
use crate::tree::AddressWindow;
use crate::tree::AddressWindows;
use crate::tree::Bar;
use crate::tree::BarKind;
use crate::tree::ExpansionRom;
use crate::tree::TreeItem;
use anyhow::Context;
use futures::FutureExt;
use futures::future::BoxFuture;
use pci_core::spec::caps::CAP_PTR_MASK;
use pci_core::spec::caps::CapabilityId;
use pci_core::spec::caps::MAX_CAPABILITIES;
use pci_core::spec::caps::pci_express::DeviceCapabilities;
use pci_core::spec::caps::pci_express::DeviceControl;
use pci_core::spec::caps::pci_express::MAX_SIZE_ENCODING;
use pci_core::spec::caps::pci_express::PciExpressCapabilityHeader;
use pci_core::spec::cfg_space::BAR_IO_FLAGS_MASK;
use pci_core::spec::cfg_space::BAR_MEM_FLAGS_MASK;
use pci_core::spec::cfg_space::BarEncodingBits;
use pci_core::spec::cfg_space::Command;
use pci_core::spec::cfg_space::EXPANSION_ROM_FLAGS_MASK;
use pci_core::spec::cfg_space::EXPANSION_ROM_PROBE;
use pci_core::spec::cfg_space::HEADER_TYPE_OFFSET;
use pci_core::spec::cfg_space::HeaderType00;
use pci_core::spec::cfg_space::HeaderType01;
use pci_core::spec::cfg_space::TYPE0_BAR_COUNT;
use pci_core::spec::cfg_space::TYPE1_BAR_COUNT;
use std::time::Duration;

/// Bridge I/O windows have 4KB granularity.
const IO_WINDOW_MASK: u64 = 0xfff;
/// Bridge memory windows have 1MB granularity.
const MEM_WINDOW_MASK: u64 = 0xf_ffff;

const LE: ByteOrder = ByteOrder::Little;

/// Enumeration settings.
#[derive(Debug, Clone)]
pub struct EnumerateOptions {
    /// Completion timeout for each configuration request.
    pub timeout: Duration,
    /// Set the bus master enable bit of every function.
    pub enable_bus_mastering: bool,
    /// Configure MSI on every function that supports it.
    pub configure_msi: bool,
}

impl Default for EnumerateOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_nanos(1000),
            enable_bus_mastering: false,
            configure_msi: false,
        }
    }
}

impl AddressWindows {
    fn align_for_bridge(&mut self) {
        self.io.align(IO_WINDOW_MASK);
        self.mem.align(MEM_WINDOW_MASK);
        self.prefetchable.align(MEM_WINDOW_MASK);
    }
}

impl RootComplex {
    /// Walks the hierarchy below the root complex, assigning resources from
    /// the configured windows, and returns the resulting tree.
    ///
    /// Every call starts over from the window bases.
    pub async fn enumerate(&self, options: &EnumerateOptions) -> TreeItem {
        let mut windows = {
            let mut windows = self.windows.lock();
            windows.reset();
            *windows
        };

        let mut root = TreeItem::new(self.config.requester_id);
        self.enumerate_segment(0, &mut windows, &mut root, options)
            .await;

        *self.windows.lock() = windows;
        *self.tree.lock() = root.clone();
        tracing::info!(
            functions = root.children.len(),
            subordinate = root.sub_bus_num,
            "enumeration complete\n{root}"
        );
        root
    }

    /// Enumerates `bus` and everything below it into `parent`, returning
    /// the highest bus number used.
    fn enumerate_segment<'a>(
        &'a self,
        bus: u8,
        windows: &'a mut AddressWindows,
        parent: &'a mut TreeItem,
        options: &'a EnumerateOptions,
    ) -> BoxFuture<'a, u8> {
        async move {
            tracing::info!(bus, "enumerating bus");
            parent.sec_bus_num = bus;
            windows.align_for_bridge();
            let start = *windows;
            let mut sub_bus = bus;

            for device in 0..DEVICES_PER_BUS {
                // device 0 of bus 0 is the host bridge
                if bus == 0 && device == 0 {
                    continue;
                }
                for function in 0..FUNCTIONS_PER_DEVICE {
                    let pcie_id = PcieId::new(bus, device, function);
                    let Some(ids) = self.probe_function(pcie_id, options.timeout).await else {
                        if function == 0 {
                            break;
                        }
                        continue;
                    };

                    let mut item = TreeItem::new(pcie_id);
                    item.vendor_id = ids as u16;
                    item.device_id = (ids >> 16) as u16;
                    if let Err(err) = self
                        .configure_function(&mut item, windows, options)
                        .await
                    {
                        tracing::warn!(
                            pcie_id = %pcie_id,
                            error = err.as_ref() as &dyn std::error::Error,
                            "failed to configure function"
                        );
                    }

                    if item.is_bridge()
                        && let Err(err) = self
                            .enumerate_bridge(&mut item, &mut sub_bus, windows, options)
                            .await
                    {
                        tracing::warn!(
                            pcie_id = %pcie_id,
                            error = err.as_ref() as &dyn std::error::Error,
                            "failed to configure bridge"
                        );
                    }

                    let multi_function = item.is_multi_function();
                    parent.children.push(item);
                    if !multi_function {
                        break;
                    }
                }
            }

            windows.align_for_bridge();
            parent.sub_bus_num = sub_bus;
            parent.windows = Some(AddressWindows {
                io: AddressWindow {
                    base: start.io.limit,
                    limit: windows.io.limit,
                },
                mem: AddressWindow {
                    base: start.mem.limit,
                    limit: windows.mem.limit,
                },
                prefetchable: AddressWindow {
                    base: start.prefetchable.limit,
                    limit: windows.prefetchable.limit,
                },
            });
            sub_bus
        }
        .boxed()
    }

    /// Reads the vendor/device id dword of `pcie_id`, or `None` if no
    /// function responds.
    async fn probe_function(&self, pcie_id: PcieId, timeout: Duration) -> Option<u32> {
        let cfg = self.config_space(pcie_id).with_timeout(timeout);
        match cfg
            .read_dword(HeaderType00::DEVICE_VENDOR.0.into(), LE)
            .await
        {
            Ok(u32::MAX) => None,
            Ok(ids) => Some(ids),
            Err(err) => {
                tracing::trace!(
                    pcie_id = %pcie_id,
                    error = &err as &dyn std::error::Error,
                    "no function"
                );
                None
            }
        }
    }

    async fn configure_function(
        &self,
        item: &mut TreeItem,
        windows: &mut AddressWindows,
        options: &EnumerateOptions,
    ) -> anyhow::Result<()> {
        let pcie_id = item.pcie_id;
        let cfg = self.config_space(pcie_id).with_timeout(options.timeout);

        item.header_type = cfg
            .read_byte(HEADER_TYPE_OFFSET.into())
            .await
            .context("reading header type")?;
        let class_revision = cfg
            .read_dword(HeaderType00::CLASS_REVISION.0.into(), LE)
            .await
            .context("reading class code")?;
        item.revision_id = class_revision as u8;
        item.class_code = class_revision >> 8;
        if !item.is_bridge() {
            let subsystem = cfg
                .read_dword(HeaderType00::SUBSYSTEM_ID.0.into(), LE)
                .await
                .context("reading subsystem id")?;
            item.subsystem_vendor_id = subsystem as u16;
            item.subsystem_id = (subsystem >> 16) as u16;
        }
        tracing::info!(
            pcie_id = %pcie_id,
            ids = %format_args!("{:04x}:{:04x}", item.vendor_id, item.device_id),
            class = %format_args!("{:06x}", item.class_code),
            header_type = item.header_type,
            "found function"
        );

        self.size_bars(&cfg, item, windows)
            .await
            .context("sizing BARs")?;
        self.size_expansion_rom(&cfg, item, windows)
            .await
            .context("sizing expansion ROM")?;
        walk_capabilities(&cfg, item)
            .await
            .context("walking capability list")?;
        self.configure_device_control(&cfg, item)
            .await
            .context("configuring device control")?;

        if options.enable_bus_mastering {
            let offset = HeaderType00::STATUS_COMMAND.0.into();
            let command = Command::from_bits(cfg.read_word(offset, LE).await?);
            cfg.write_word(offset, command.with_bus_master(true).into_bits(), LE)
                .await
                .context("enabling bus mastering")?;
        }

        if options.configure_msi {
            match item.capability_offset(CapabilityId::MSI) {
                Some(cap) => match self.program_msi(pcie_id, cap, options.timeout).await {
                    Ok(msi) => item.msi = Some(msi),
                    Err(err) => tracing::debug!(
                        pcie_id = %pcie_id,
                        error = &err as &dyn std::error::Error,
                        "msi configuration failed"
                    ),
                },
                None => tracing::debug!(pcie_id = %pcie_id, "no msi capability"),
            }
        }
        Ok(())
    }

    async fn size_bars(
        &self,
        cfg: &ConfigSpace<'_>,
        item: &mut TreeItem,
        windows: &mut AddressWindows,
    ) -> anyhow::Result<()> {
        let bar_count = if item.is_bridge() {
            TYPE1_BAR_COUNT
        } else {
            TYPE0_BAR_COUNT
        };

        let mut bar = 0;
        while bar < bar_count {
            let offset = u64::from(HeaderType00::BAR0.0) + bar as u64 * 4;
            cfg.write_dword(offset, u32::MAX, LE).await?;
            let val = cfg.read_dword(offset, LE).await?;
            if val == 0 {
                bar += 1;
                continue;
            }

            let bits = BarEncodingBits::from_bits(val);
            let record = if bits.use_pio() {
                let mask = u64::from(!val | BAR_IO_FLAGS_MASK);
                let address = windows.io.alloc(mask, mask + 1);
                let programmed = u64::from(val & BAR_IO_FLAGS_MASK) | address;
                cfg.write_dword(offset, programmed as u32, LE).await?;
                Bar {
                    kind: BarKind::Io,
                    prefetchable: false,
                    probed: val.into(),
                    programmed,
                    address,
                    size: mask + 1,
                }
            } else if bits.type_64_bit() {
                if bar + 1 >= bar_count {
                    anyhow::bail!("64-bit BAR{bar} has no upper half");
                }
                cfg.write_dword(offset + 4, u32::MAX, LE).await?;
                let high = cfg.read_dword(offset + 4, LE).await?;
                let val = (u64::from(high) << 32) | u64::from(val);
                let mask = !val | u64::from(BAR_MEM_FLAGS_MASK);
                let window = if bits.prefetchable() {
                    &mut windows.prefetchable
                } else {
                    tracing::info!(
                        pcie_id = %item.pcie_id,
                        bar,
                        "64-bit BAR is not prefetchable, allocating below 4GB"
                    );
                    &mut windows.mem
                };
                let size = mask.wrapping_add(1);
                let address = window.alloc(mask, size);
                let programmed = (val & u64::from(BAR_MEM_FLAGS_MASK)) | address;
                cfg.write_dword(offset, programmed as u32, LE).await?;
                cfg.write_dword(offset + 4, (programmed >> 32) as u32, LE)
                    .await?;
                Bar {
                    kind: BarKind::Memory64,
                    prefetchable: bits.prefetchable(),
                    probed: val,
                    programmed,
                    address,
                    size,
                }
            } else {
                if bits.prefetchable() {
                    tracing::info!(
                        pcie_id = %item.pcie_id,
                        bar,
                        "allocating 32-bit prefetchable BAR from the memory window"
                    );
                }
                let mask = u64::from(!val | BAR_MEM_FLAGS_MASK);
                let address = windows.mem.alloc(mask, mask + 1);
                let programmed = u64::from(val & BAR_MEM_FLAGS_MASK) | address;
                cfg.write_dword(offset, programmed as u32, LE).await?;
                Bar {
                    kind: BarKind::Memory32,
                    prefetchable: bits.prefetchable(),
                    probed: val.into(),
                    programmed,
                    address,
                    size: mask + 1,
                }
            };

            tracing::info!(
                pcie_id = %item.pcie_id,
                bar,
                kind = ?record.kind,
                address = %format_args!("{:#x}", record.address),
                size = %format_args!("{:#x}", record.size),
                "assigned BAR"
            );
            item.bars[bar] = Some(record);
            bar += if record.kind == BarKind::Memory64 { 2 } else { 1 };
        }
        Ok(())
    }

    async fn size_expansion_rom(
        &self,
        cfg: &ConfigSpace<'_>,
        item: &mut TreeItem,
        windows: &mut AddressWindows,
    ) -> anyhow::Result<()> {
        let offset: u64 = if item.is_bridge() {
            HeaderType01::EXPANSION_ROM_BASE.0.into()
        } else {
            HeaderType00::EXPANSION_ROM_BASE.0.into()
        };
        cfg.write_dword(offset, EXPANSION_ROM_PROBE, LE).await?;
        let val = cfg.read_dword(offset, LE).await?;
        if val == 0 {
            return Ok(());
        }

        let mask = u64::from(!val | EXPANSION_ROM_FLAGS_MASK);
        let address = windows.mem.alloc(mask, mask + 1);
        let programmed = (val & 0xf) | address as u32;
        cfg.write_dword(offset, programmed, LE).await?;
        tracing::info!(
            pcie_id = %item.pcie_id,
            address = %format_args!("{:#x}", address),
            size = %format_args!("{:#x}", mask + 1),
            "assigned expansion ROM"
        );
        item.expansion_rom = Some(ExpansionRom {
            probed: val,
            programmed,
            address,
            size: mask + 1,
        });
        Ok(())
    }

    async fn configure_device_control(
        &self,
        cfg: &ConfigSpace<'_>,
        item: &TreeItem,
    ) -> anyhow::Result<()> {
        let Some(cap) = item.capability_offset(CapabilityId::PCI_EXPRESS) else {
            return Ok(());
        };
        let cap = u64::from(cap);
        let dev_cap = DeviceCapabilities::from_bits(
            cfg.read_dword(
                cap + u64::from(PciExpressCapabilityHeader::DEVICE_CAPS.0),
                LE,
            )
            .await?,
        );
        let ctl_offset = cap + u64::from(PciExpressCapabilityHeader::DEVICE_CTL_STS.0);
        let ctl = DeviceControl::from_bits(cfg.read_word(ctl_offset, LE).await?);

        let max_payload_size = self
            .config
            .max_payload_size
            .min(dev_cap.max_payload_size() as u8)
            .min(MAX_SIZE_ENCODING);
        let extended_tag = self.config.extended_tag_field_enable && dev_cap.ext_tag_field();
        let max_read_request_size = self.config.max_read_request_size.min(MAX_SIZE_ENCODING);
        let ctl = ctl
            .with_max_payload_size(max_payload_size.into())
            .with_extended_tag_enable(extended_tag)
            .with_max_read_request_size(max_read_request_size.into());

        // status bits are write-1-to-clear, leave them alone
        cfg.write_dword(ctl_offset, ctl.into_bits().into(), LE)
            .await?;
        tracing::debug!(
            pcie_id = %item.pcie_id,
            max_payload_size,
            max_read_request_size,
            extended_tag,
            "configured device control"
        );
        Ok(())
    }

    /// Assigns bus numbers to the bridge `item`, enumerates its secondary
    /// bus and programs its windows.
    async fn enumerate_bridge(
        &self,
        item: &mut TreeItem,
        sub_bus: &mut u8,
        windows: &mut AddressWindows,
        options: &EnumerateOptions,
    ) -> anyhow::Result<()> {
        let pcie_id = item.pcie_id;
        let bus = pcie_id.bus;
        let sec = sub_bus.checked_add(1).context("out of bus numbers")?;
        let cfg = self.config_space(pcie_id).with_timeout(options.timeout);
        let bus_numbers = u64::from(HeaderType01::LATENCY_BUS_NUMBERS.0);

        // open up every bus number below so the walk can reach it
        cfg.write(bus_numbers, &[bus, sec, u8::MAX])
            .await
            .context("setting bus numbers")?;
        item.pri_bus_num = bus;
        *sub_bus = self.enumerate_segment(sec, windows, item, options).await;
        cfg.write(bus_numbers, &[bus, sec, *sub_bus])
            .await
            .context("setting subordinate bus number")?;

        let Some(w) = item.windows else {
            anyhow::bail!("bridge windows missing after enumeration");
        };
        program_bridge_windows(&cfg, &w)
            .await
            .context("programming bridge windows")?;
        tracing::info!(
            pcie_id = %pcie_id,
            secondary = sec,
            subordinate = *sub_bus,
            io = %format_args!("{:#x}-{:#x}", w.io.base, w.io.limit),
            mem = %format_args!("{:#x}-{:#x}", w.mem.base, w.mem.limit),
            prefetchable = %format_args!("{:#x}-{:#x}", w.prefetchable.base, w.prefetchable.limit),
            "configured bridge"
        );
        Ok(())
    }
}

async fn walk_capabilities(cfg: &ConfigSpace<'_>, item: &mut TreeItem) -> anyhow::Result<()> {
    let mut ptr = cfg
        .read_byte(HeaderType00::RESERVED_CAP_PTR.0.into())
        .await?
        & CAP_PTR_MASK;
    while ptr != 0 {
        if item.capabilities.len() == MAX_CAPABILITIES {
            tracing::warn!(pcie_id = %item.pcie_id, "capability list does not terminate");
            break;
        }
        let header = cfg.read_word(ptr.into(), LE).await?;
        item.capabilities.push((CapabilityId(header as u8), ptr));
        ptr = (header >> 8) as u8 & CAP_PTR_MASK;
    }
    Ok(())
}

/// Writes the base/limit registers of a bridge. Window limits are
/// exclusive, the registers take the last address of each window.
async fn program_bridge_windows(
    cfg: &ConfigSpace<'_>,
    w: &AddressWindows,
) -> anyhow::Result<()> {
    let io_last = w.io.limit.wrapping_sub(1);
    let mem_last = w.mem.limit.wrapping_sub(1);
    let pf_last = w.prefetchable.limit.wrapping_sub(1);

    cfg.write(
        HeaderType01::SEC_STATUS_IO_RANGE.0.into(),
        &[
            ((w.io.base >> 8) & 0xf0) as u8,
            ((io_last >> 8) & 0xf0) as u8,
        ],
    )
    .await?;
    cfg.write_words(
        HeaderType01::IO_RANGE_UPPER.0.into(),
        &[(w.io.base >> 16) as u16, (io_last >> 16) as u16],
        LE,
    )
    .await?;
    cfg.write_words(
        HeaderType01::MEMORY_RANGE.0.into(),
        &[
            ((w.mem.base >> 16) & 0xfff0) as u16,
            ((mem_last >> 16) & 0xfff0) as u16,
        ],
        LE,
    )
    .await?;
    cfg.write_words(
        HeaderType01::PREFETCH_RANGE.0.into(),
        &[
            ((w.prefetchable.base >> 16) & 0xfff0) as u16,
            ((pf_last >> 16) & 0xfff0) as u16,
        ],
        LE,
    )
    .await?;
    cfg.write_dword(
        HeaderType01::PREFETCH_BASE_UPPER.0.into(),
        (w.prefetchable.base >> 32) as u32,
        LE,
    )
    .await?;
    cfg.write_dword(
        HeaderType01::PREFETCH_LIMIT_UPPER.0.into(),
        (pf_last >> 32) as u32,
        LE,
    )
    .await?;
    Ok(())
}
