// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A simulated hierarchy below the root complex: endpoint and bridge
//! configuration spaces, BAR-backed memory and I/O, and a log of the
//! traffic in both directions.

use crate::DispatchError;
use crate::completion::Timer;
use crate::dispatch::byte_enable_runs;
use crate::root::RootComplex;
use crate::root::RootComplexConfig;
use crate::root::Transport;
use crate::tlp::CompletionStatus;
use crate::tlp::PcieId;
use crate::tlp::Tlp;
use crate::tlp::TlpType;
use async_trait::async_trait;
use futures::FutureExt;
use futures::executor::block_on;
use futures::future::BoxFuture;
use futures::future::poll_fn;
use futures::task::FutureObj;
use futures::task::Spawn;
use futures::task::SpawnError;
use parking_lot::Mutex;
use pci_core::spec::caps::CapabilityId;
use pci_core::spec::caps::msi::MessageControl;
use pci_core::spec::caps::pci_express::DeviceCapabilities;
use pci_core::spec::cfg_space::BAR_IO_FLAGS_MASK;
use pci_core::spec::cfg_space::BAR_MEM_FLAGS_MASK;
use pci_core::spec::cfg_space::EXT_CFG_SPACE_SIZE;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::task::Poll;
use std::time::Duration;

const PCIE_CAP: usize = 0x40;
const MSI_CAP: usize = 0x50;
/// BAR memory larger than this is not backed.
const MAX_BACKED_BAR: u64 = 0x100_0000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Times out as soon as it is asked to.
pub struct ImmediateTimer;

impl Timer for ImmediateTimer {
    fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
        futures::future::ready(()).boxed()
    }
}

/// Never times out.
pub struct NeverTimer;

impl Timer for NeverTimer {
    fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
        futures::future::pending().boxed()
    }
}

/// Queues spawned tasks until [`QueueSpawner::run_all`].
#[derive(Default)]
pub struct QueueSpawner {
    tasks: Mutex<Vec<FutureObj<'static, ()>>>,
}

impl Spawn for QueueSpawner {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
        self.tasks.lock().push(future);
        Ok(())
    }
}

impl QueueSpawner {
    pub fn run_all(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                block_on(task);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BarSlot {
    writable: u32,
    flags: u32,
    size: u64,
    io: bool,
    is_64bit: bool,
}

/// MSI registers of a [`TestFunction`].
#[derive(Debug)]
pub struct MsiRegisters {
    pub control: MessageControl,
    pub address: u64,
    pub data: u32,
}

/// Configuration space and BAR backing of one simulated function.
pub struct TestFunction {
    cfg: Vec<u8>,
    bars: [BarSlot; 6],
    bar_memory: [Vec<u8>; 6],
    rom_writable: u32,
    rom_offset: usize,
}

impl TestFunction {
    fn new(vendor_id: u16, device_id: u16, header_type: u8, class_revision: u32) -> Self {
        let mut f = Self {
            cfg: vec![0; EXT_CFG_SPACE_SIZE as usize],
            bars: [BarSlot::default(); 6],
            bar_memory: Default::default(),
            rom_writable: 0,
            rom_offset: if header_type == 1 { 0x38 } else { 0x30 },
        };
        f.set_dword(0x00, u32::from(vendor_id) | (u32::from(device_id) << 16));
        f.set_dword(0x04, 0x0010_0000);
        f.set_dword(0x08, class_revision);
        f.cfg[0x0e] = header_type;
        f.cfg[0x34] = PCIE_CAP as u8;

        f.cfg[PCIE_CAP] = CapabilityId::PCI_EXPRESS.0;
        f.cfg[PCIE_CAP + 2] = 0x02;
        f.set_dword(
            PCIE_CAP + 4,
            DeviceCapabilities::new()
                .with_max_payload_size(2)
                .with_ext_tag_field(true)
                .into_bits(),
        );
        f.set_dword(PCIE_CAP + 8, 0x2810);
        f
    }

    /// A type 0 function with a PCI Express capability and a 64-bit MSI
    /// capability requesting 8 vectors.
    pub fn endpoint(vendor_id: u16, device_id: u16) -> Self {
        let mut f = Self::new(vendor_id, device_id, 0, 0x0200_0001);
        f.set_dword(0x2c, u32::from(vendor_id) | (u32::from(device_id) << 16));
        f.cfg[PCIE_CAP + 1] = MSI_CAP as u8;
        f.set_msi(
            MessageControl::new()
                .with_multiple_message_capable(3)
                .with_addr_64bit(true),
        );
        f
    }

    /// A PCI-to-PCI bridge with a PCI Express capability.
    pub fn bridge(vendor_id: u16, device_id: u16) -> Self {
        Self::new(vendor_id, device_id, 1, 0x0604_0000)
    }

    fn set_msi(&mut self, control: MessageControl) {
        self.cfg[MSI_CAP] = CapabilityId::MSI.0;
        self.cfg[MSI_CAP + 1] = 0;
        self.cfg[MSI_CAP + 2..MSI_CAP + 4].copy_from_slice(&control.into_bits().to_le_bytes());
    }

    fn add_bar(&mut self, slot: usize, bar: BarSlot) {
        if bar.size <= MAX_BACKED_BAR {
            self.bar_memory[slot] = vec![0; bar.size as usize];
        }
        self.bars[slot] = bar;
        self.set_dword(0x10 + slot * 4, bar.flags);
    }

    /// Adds a 32-bit memory or I/O BAR reading back `probe` after all ones
    /// are written.
    pub fn with_bar(mut self, slot: usize, probe: u32) -> Self {
        let io = probe & 1 != 0;
        let flags_mask = if io {
            BAR_IO_FLAGS_MASK
        } else {
            BAR_MEM_FLAGS_MASK
        };
        let writable = probe & !flags_mask;
        self.add_bar(
            slot,
            BarSlot {
                writable,
                flags: probe & flags_mask,
                size: u64::from(!writable) + 1,
                io,
                is_64bit: false,
            },
        );
        self
    }

    /// Adds a 64-bit memory BAR at `slot` and `slot + 1`.
    pub fn with_bar64(mut self, slot: usize, probe: u64) -> Self {
        let flags = probe as u32 & BAR_MEM_FLAGS_MASK;
        let writable = probe & !u64::from(BAR_MEM_FLAGS_MASK);
        self.add_bar(
            slot,
            BarSlot {
                writable: writable as u32,
                flags,
                size: (!writable).wrapping_add(1),
                io: false,
                is_64bit: true,
            },
        );
        self.bars[slot + 1] = BarSlot {
            writable: (writable >> 32) as u32,
            ..BarSlot::default()
        };
        self
    }

    /// Adds an expansion ROM whose address bits read back as `probe`.
    pub fn with_rom(mut self, probe: u32) -> Self {
        self.rom_writable = probe | 1;
        self
    }

    /// Removes the MSI capability.
    pub fn without_msi(mut self) -> Self {
        self.cfg[PCIE_CAP + 1] = 0;
        self.cfg[MSI_CAP..MSI_CAP + 0x10].fill(0);
        self
    }

    /// Replaces the MSI capability with a 32-bit one requesting
    /// `1 << multiple_message_capable` vectors.
    pub fn with_msi_32bit(mut self, multiple_message_capable: u8) -> Self {
        self.cfg[PCIE_CAP + 1] = MSI_CAP as u8;
        self.set_msi(MessageControl::new().with_multiple_message_capable(multiple_message_capable));
        self
    }

    pub fn with_multi_function(mut self) -> Self {
        self.cfg[0x0e] |= 0x80;
        self
    }

    fn dword(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.cfg[offset..offset + 4].try_into().unwrap())
    }

    fn set_dword(&mut self, offset: usize, value: u32) {
        self.cfg[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn bar_count(&self) -> usize {
        if self.cfg[0x0e] & 0x7f == 1 { 2 } else { 6 }
    }

    fn cfg_write(&mut self, offset: usize, first_be: u8, value: u32) {
        let old = self.dword(offset).to_le_bytes();
        let mut new = old;
        for (i, (b, v)) in new.iter_mut().zip(value.to_le_bytes()).enumerate() {
            if first_be & (1 << i) != 0 {
                *b = v;
            }
        }
        let new = u32::from_le_bytes(new);

        let bar_end = 0x10 + self.bar_count() * 4;
        if (0x10..bar_end).contains(&offset) {
            let bar = self.bars[(offset - 0x10) / 4];
            self.set_dword(offset, (new & bar.writable) | bar.flags);
        } else if offset == self.rom_offset {
            self.set_dword(offset, new & self.rom_writable);
        } else {
            let mut bytes = new.to_le_bytes();
            for (i, b) in bytes.iter_mut().enumerate() {
                if read_only(offset + i) {
                    *b = old[i];
                }
            }
            self.set_dword(offset, u32::from_le_bytes(bytes));
        }
    }

    fn bar_base(&self, slot: usize) -> u64 {
        let bar = self.bars[slot];
        let flags_mask = if bar.io {
            BAR_IO_FLAGS_MASK
        } else {
            BAR_MEM_FLAGS_MASK
        };
        let mut base = u64::from(self.dword(0x10 + slot * 4) & !flags_mask);
        if bar.is_64bit {
            base |= u64::from(self.dword(0x14 + slot * 4)) << 32;
        }
        base
    }

    /// Finds the backed BAR decoding `addr`, returning the slot and offset.
    fn decode(&self, addr: u64, len: usize, io: bool) -> Option<(usize, usize)> {
        (0..self.bar_count()).find_map(|slot| {
            let bar = self.bars[slot];
            if bar.size == 0 || bar.io != io || self.bar_memory[slot].is_empty() {
                return None;
            }
            let offset = addr.checked_sub(self.bar_base(slot))?;
            (offset + len as u64 <= bar.size).then_some((slot, offset as usize))
        })
    }
}

fn read_only(offset: usize) -> bool {
    matches!(offset, 0x00..=0x03 | 0x08..=0x0b | 0x0e | 0x34)
        || offset == PCIE_CAP
        || offset == PCIE_CAP + 1
        || (PCIE_CAP + 4..PCIE_CAP + 8).contains(&offset)
        || offset == MSI_CAP
        || offset == MSI_CAP + 1
}

#[derive(Default)]
struct FabricState {
    functions: BTreeMap<PcieId, TestFunction>,
    requests: Vec<Tlp>,
    upstream: Vec<Tlp>,
    drop_requests: bool,
    status: Option<CompletionStatus>,
    completion_split: Option<usize>,
    hold_completions: bool,
    held: Vec<Tlp>,
}

impl FabricState {
    /// Handles a request from the root complex, returning the completions.
    fn handle(&mut self, req: &Tlp) -> Vec<Tlp> {
        let completer = req.dest_id;
        if self.drop_requests {
            return Vec::new();
        }
        if let Some(status) = self.status {
            if matches!(req.fmt_type, TlpType::MemWrite | TlpType::MemWrite64) {
                return Vec::new();
            }
            return vec![Tlp {
                status,
                ..Tlp::completion_for(req, completer)
            }];
        }

        match req.fmt_type {
            TlpType::CfgRead0 | TlpType::CfgRead1 => {
                let Some(f) = self.functions.get(&req.dest_id) else {
                    return vec![Tlp::ur_completion_for(req, completer)];
                };
                let mut cpl = Tlp::completion_data_for(req, completer);
                cpl.set_data(&f.dword(req.register_number as usize * 4).to_le_bytes());
                cpl.byte_count = 4;
                vec![cpl]
            }
            TlpType::CfgWrite0 | TlpType::CfgWrite1 => {
                let Some(f) = self.functions.get_mut(&req.dest_id) else {
                    return vec![Tlp::ur_completion_for(req, completer)];
                };
                f.cfg_write(req.register_number as usize * 4, req.first_be, req.data[0]);
                vec![Tlp::completion_for(req, completer)]
            }
            TlpType::IoRead => {
                let Some((id, slot, offset)) = self.decode(req.address, 4, true) else {
                    return vec![Tlp::ur_completion_for(req, PcieId::default())];
                };
                let mut cpl = Tlp::completion_data_for(req, id);
                cpl.set_data(&self.functions[&id].bar_memory[slot][offset..offset + 4]);
                cpl.byte_count = 4;
                vec![cpl]
            }
            TlpType::IoWrite => {
                let Some((id, slot, offset)) = self.decode(req.address, 4, true) else {
                    return vec![Tlp::ur_completion_for(req, PcieId::default())];
                };
                self.write_bar(id, slot, offset, req);
                vec![Tlp::completion_for(req, id)]
            }
            TlpType::MemRead | TlpType::MemRead64 => {
                let len = req.length as usize * 4;
                let Some((id, slot, offset)) = self.decode(req.address, len, false) else {
                    return vec![Tlp::ur_completion_for(req, PcieId::default())];
                };
                let data = &self.functions[&id].bar_memory[slot][offset..offset + len];
                split_read_completions(req, id, data, self.completion_split)
            }
            TlpType::MemWrite | TlpType::MemWrite64 => {
                let len = req.length as usize * 4;
                if let Some((id, slot, offset)) = self.decode(req.address, len, false) {
                    self.write_bar(id, slot, offset, req);
                }
                Vec::new()
            }
            ty => panic!("unexpected request {ty:?}"),
        }
    }

    fn decode(&self, addr: u64, len: usize, io: bool) -> Option<(PcieId, usize, usize)> {
        self.functions
            .iter()
            .find_map(|(&id, f)| f.decode(addr, len, io).map(|(slot, offset)| (id, slot, offset)))
    }

    fn write_bar(&mut self, id: PcieId, slot: usize, offset: usize, req: &Tlp) {
        let data = req.data_bytes();
        let mem = &mut self.functions.get_mut(&id).unwrap().bar_memory[slot];
        for run in byte_enable_runs(req.first_be, req.last_be, req.length as usize) {
            mem[offset + run.start..offset + run.end].copy_from_slice(&data[run]);
        }
    }
}

/// Builds the completions for a memory read of `data`, ending each one
/// except the last on a multiple of `split` bytes.
fn split_read_completions(
    req: &Tlp,
    completer: PcieId,
    data: &[u8],
    split: Option<usize>,
) -> Vec<Tlp> {
    let mut addr = req.address + req.first_be_offset() as u64;
    let end = addr + req.be_byte_count() as u64;
    let mut cpls = Vec::new();
    while addr < end {
        let chunk_end = match split {
            Some(split) => ((addr / split as u64 + 1) * split as u64).min(end),
            None => end,
        };
        let dw_start = (addr & !3) - req.address;
        let dw_end = ((chunk_end + 3) & !3) - req.address;
        let mut cpl = Tlp::completion_data_for(req, completer);
        cpl.set_data(&data[dw_start as usize..dw_end as usize]);
        cpl.lower_address = (addr & 0x7f) as u8;
        cpl.byte_count = (end - addr) as u16;
        cpls.push(cpl);
        addr = chunk_end;
    }
    cpls
}

fn round_trip(tlp: &Tlp) {
    let decoded = Tlp::unpack(&tlp.pack()).unwrap();
    assert_eq!(&decoded, tlp);
}

/// The link below a [`RootComplex`], answering its requests from a set of
/// simulated functions.
#[derive(Default)]
pub struct TestFabric {
    rc: OnceLock<Weak<RootComplex>>,
    state: Mutex<FabricState>,
}

impl TestFabric {
    fn rc(&self) -> Arc<RootComplex> {
        self.rc.get().unwrap().upgrade().unwrap()
    }

    pub fn add(&self, pcie_id: PcieId, function: TestFunction) {
        self.state.lock().functions.insert(pcie_id, function);
    }

    /// Stops answering requests.
    pub fn set_drop_requests(&self, drop: bool) {
        self.state.lock().drop_requests = drop;
    }

    /// Answers every non-posted request with a completion carrying
    /// `status`.
    pub fn set_completion_status(&self, status: Option<CompletionStatus>) {
        self.state.lock().status = status;
    }

    /// Splits memory read completions on multiples of `split` bytes.
    pub fn set_completion_split(&self, split: Option<usize>) {
        self.state.lock().completion_split = split;
    }

    /// Queues completions instead of delivering them until
    /// [`Self::release_held`] is called.
    pub fn set_hold_completions(&self, hold: bool) {
        self.state.lock().hold_completions = hold;
    }

    /// Number of completions waiting to be delivered.
    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Delivers the queued completions, returning how many there were.
    pub async fn release_held(&self) -> usize {
        let held = std::mem::take(&mut self.state.lock().held);
        let rc = self.rc();
        for cpl in &held {
            rc.downstream_recv(cpl.clone()).await.unwrap();
        }
        held.len()
    }

    /// Requests sent by the root complex since the last call.
    pub fn take_requests(&self) -> Vec<Tlp> {
        std::mem::take(&mut self.state.lock().requests)
    }

    /// Completions sent by the root complex since the last call.
    pub fn take_upstream(&self) -> Vec<Tlp> {
        std::mem::take(&mut self.state.lock().upstream)
    }

    pub fn cfg_dword(&self, pcie_id: PcieId, offset: usize) -> u32 {
        self.state.lock().functions[&pcie_id].dword(offset)
    }

    pub fn bar_memory(&self, pcie_id: PcieId, slot: usize) -> Vec<u8> {
        self.state.lock().functions[&pcie_id].bar_memory[slot].clone()
    }

    pub fn write_bar_memory(&self, pcie_id: PcieId, slot: usize, offset: usize, data: &[u8]) {
        self.state.lock().functions.get_mut(&pcie_id).unwrap().bar_memory[slot]
            [offset..offset + data.len()]
            .copy_from_slice(data);
    }

    pub fn msi_registers(&self, pcie_id: PcieId) -> MsiRegisters {
        let state = self.state.lock();
        let f = &state.functions[&pcie_id];
        let control = MessageControl::from_bits((f.dword(MSI_CAP) >> 16) as u16);
        let mut address = u64::from(f.dword(MSI_CAP + 4));
        let data = if control.addr_64bit() {
            address |= u64::from(f.dword(MSI_CAP + 8)) << 32;
            f.dword(MSI_CAP + 0xc)
        } else {
            f.dword(MSI_CAP + 8)
        };
        MsiRegisters {
            control,
            address,
            data,
        }
    }

    /// Sends a request from a downstream bus master to the root complex.
    pub async fn device_request(&self, tlp: Tlp) -> Result<(), DispatchError> {
        round_trip(&tlp);
        self.rc().downstream_recv(tlp).await
    }

    /// Has `pcie_id` signal MSI `vector` as programmed in its capability.
    pub async fn trigger_msi(&self, pcie_id: PcieId, vector: u8) -> Result<(), DispatchError> {
        let msi = self.msi_registers(pcie_id);
        let mut tlp = Tlp::new(if msi.address > u32::MAX as u64 {
            TlpType::MemWrite64
        } else {
            TlpType::MemWrite
        });
        tlp.requester_id = pcie_id;
        tlp.set_addr_be_data(msi.address, &(msi.data + u32::from(vector)).to_le_bytes());
        self.device_request(tlp).await
    }
}

#[async_trait]
impl Transport for TestFabric {
    async fn send(&self, tlp: Tlp) {
        round_trip(&tlp);
        if tlp.fmt_type.is_completion() {
            self.state.lock().upstream.push(tlp);
            return;
        }
        let cpls = {
            let mut state = self.state.lock();
            let cpls = state.handle(&tlp);
            state.requests.push(tlp);
            for cpl in &cpls {
                round_trip(cpl);
            }
            if state.hold_completions {
                state.held.extend(cpls);
                return;
            }
            cpls
        };
        let rc = self.rc();
        for cpl in cpls {
            rc.downstream_recv(cpl).await.unwrap();
        }
    }
}

/// Returns `Pending` once after waking itself, letting other joined
/// futures run.
pub async fn yield_now() {
    let mut yielded = false;
    poll_fn(|cx| {
        if yielded {
            return Poll::Ready(());
        }
        yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    })
    .await
}

/// A root complex wired to a [`TestFabric`].
pub struct TestRig {
    pub rc: Arc<RootComplex>,
    pub fabric: Arc<TestFabric>,
    pub spawner: Arc<QueueSpawner>,
}

impl TestRig {
    pub fn new(config: RootComplexConfig) -> Self {
        Self::with_timer(config, Arc::new(ImmediateTimer))
    }

    pub fn with_timer(config: RootComplexConfig, timer: Arc<dyn Timer>) -> Self {
        init_tracing();
        let fabric = Arc::new(TestFabric::default());
        let spawner = Arc::new(QueueSpawner::default());
        let rc = Arc::new(RootComplex::new(
            config,
            fabric.clone(),
            timer,
            spawner.clone(),
        ));
        let _ = fabric.rc.set(Arc::downgrade(&rc));
        Self {
            rc,
            fabric,
            spawner,
        }
    }
}

/// Defaults, with a short completion timeout for the access handles.
pub fn test_config() -> RootComplexConfig {
    RootComplexConfig {
        default_timeout: Duration::from_micros(1),
        ..Default::default()
    }
}
