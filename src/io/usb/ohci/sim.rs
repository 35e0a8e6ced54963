// ============================================================================
// src/io/usb/ohci/sim.rs - Simulated OHCI Controller (tests only)
// ============================================================================
//!
//! テスト用のソフトウェア OHCI コントローラ。
//!
//! レジスタブロックとプラットフォームサービスを実装し、`delay_ms` の
//! 1ms ごとに1フレーム分のリスト走査を行う。
//!
//! - 周期リスト: HCCA[frame % 32] からたどり、ED あたり TD 1個
//! - Control/Bulk: ED ごとに停止するか空になるまで全 TD
//! - Done Queue: DelayInterrupt カウンタが 0 になったフレーム末に書き戻し
//!
//! デバイス側の応答は `push_outcome` / `set_nak` で差し込む。
//! IN データはオフセット `i` に `i as u8` を書く。
//!
//! `IrqMutex` には割り込み禁止の深さをスレッドごとに数えるフックを入れ、
//! 割り込み禁止中の `delay_ms` 呼び出しを記録する。

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::HcdResult;
use crate::sync::{install_interrupt_hooks, InterruptHooks};

use super::config::OhciConfig;
use super::controller::OhciController;
use super::descriptor::{
    ED_DIR_IN, ED_DIR_OUT, ED_DIR_SHIFT, ED_HALTED, ED_ISO, ED_MPS_MASK, ED_MPS_SHIFT,
    ED_PTR_MASK, ED_SKIP, ED_TOGGLE_CARRY, ISO_FC_SHIFT, PAGE_MASK, PSW_PAGE_SELECT,
    PSW_SIZE_MASK, TD_CC_SHIFT, TD_DI_SHIFT, TD_DP_SHIFT, TD_EC_SHIFT, TD_ROUNDING, TD_T_SHIFT,
};
use super::dma::{DmaBuffer, DmaRegion, HcdPlatform};
use super::hcca::INTERRUPT_TABLE_SIZE;
use super::regs::{
    port_status_offset, port_write, CommandStatus, HcControl, HcRegisters, InterruptFlags, PortStatusBits,
    RhStatus, FRAME_INTERVAL, HCFS_OPERATIONAL, HCFS_SUSPEND, HC_BULK_HEAD_ED,
    HC_COMMAND_STATUS, HC_CONTROL, HC_CONTROL_HEAD_ED, HC_FM_INTERVAL, HC_FM_NUMBER, HC_HCCA,
    HC_INTERRUPT_DISABLE, HC_INTERRUPT_ENABLE, HC_INTERRUPT_STATUS, HC_RH_DESCRIPTOR_A,
    HC_RH_PORT_STATUS, HC_RH_STATUS,
};

const REG_COUNT: usize = 64;
/// 1リストあたりの走査上限（循環リスト対策）
const WALK_LIMIT: usize = 1024;
const FIRST_BUS: u32 = 0x0010_0000;
/// PowerOnToPowerGoodTime (2ms 単位)
const POTPGT: u32 = 1;

// ============================================================================
// Interrupt Masking
// ============================================================================

std::thread_local! {
    static MASK_DEPTH: Cell<u32> = const { Cell::new(0) };
}

fn save_and_disable() -> bool {
    MASK_DEPTH.with(|depth| {
        let was_enabled = depth.get() == 0;
        depth.set(depth.get() + 1);
        was_enabled
    })
}

fn restore(_was_enabled: bool) {
    MASK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
}

fn interrupts_masked() -> bool {
    MASK_DEPTH.with(|depth| depth.get() > 0)
}

// ============================================================================
// Options / Outcomes
// ============================================================================

/// シミュレータの構成
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub ports: u32,
    /// HCR が落ちるまでの `delay_us` 呼び出し回数
    pub reset_polls: u32,
    /// HCR が落ちない
    pub stuck_reset: bool,
    /// 起動時に SMM が所有 (HcControl.IR)
    pub smm_owned: bool,
    /// OCR に応答しない
    pub smm_stuck: bool,
    /// n 回成功した後の DMA 確保を失敗させる
    pub fail_alloc_after: Option<usize>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            ports: 2,
            reset_polls: 1,
            stuck_reset: false,
            smm_owned: false,
            smm_stuck: false,
            fail_alloc_after: None,
        }
    }
}

/// 次の TD に対するデバイスの応答
#[derive(Debug, Clone, Copy, Default)]
pub struct SimOutcome {
    pub cc: u32,
    /// 転送バイト数（`None` なら TD 全長）
    pub bytes: Option<usize>,
}

impl SimOutcome {
    /// データなしでエラー終了
    pub fn error(cc: u32) -> Self {
        Self { cc, bytes: Some(0) }
    }

    /// `bytes` だけ転送して終了
    pub fn short(cc: u32, bytes: usize) -> Self {
        Self {
            cc,
            bytes: Some(bytes),
        }
    }
}

// ============================================================================
// State
// ============================================================================

struct Region {
    bus: u32,
    ptr: NonNull<u8>,
    layout: Layout,
    live: bool,
    /// `dma_alloc` 経由（コントローラ所有）か
    platform: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pid {
    Setup,
    Out,
    In,
}

struct SimState {
    opts: SimOptions,
    regs: [u32; REG_COUNT],
    frame: u16,
    us_elapsed: u32,
    reset_polls_left: Option<u32>,
    irq: bool,
    regions: Vec<Region>,
    next_bus: u32,
    allocations: usize,
    outcomes: HashMap<u32, VecDeque<SimOutcome>>,
    nak: HashSet<u32>,
    last_setup: Option<[u8; 8]>,
    done_head: u32,
    done_counter: Option<u32>,
    delay_calls: u32,
    masked_delay_calls: u32,
}

// SAFETY: 生ポインタはシミュレータが確保した領域だけを指し、
// アクセスは Mutex の内側で行う
unsafe impl Send for SimState {}

impl Drop for SimState {
    fn drop(&mut self) {
        for region in self.regions.drain(..) {
            unsafe { dealloc(region.ptr.as_ptr(), region.layout) };
        }
    }
}

impl SimState {
    fn new(opts: SimOptions) -> Self {
        let mut state = Self {
            regs: [0; REG_COUNT],
            frame: 0,
            us_elapsed: 0,
            reset_polls_left: None,
            irq: false,
            regions: Vec::new(),
            next_bus: FIRST_BUS,
            allocations: 0,
            outcomes: HashMap::new(),
            nak: HashSet::new(),
            last_setup: None,
            done_head: 0,
            done_counter: None,
            delay_calls: 0,
            masked_delay_calls: 0,
            opts,
        };
        state.hardware_reset();
        if state.opts.smm_owned {
            state.regs[HC_CONTROL / 4] |= HcControl::IR.bits();
        }
        state
    }

    fn hardware_reset(&mut self) {
        let ir = self.regs[HC_CONTROL / 4] & HcControl::IR.bits();
        for offset in [
            HC_CONTROL,
            HC_INTERRUPT_STATUS,
            HC_INTERRUPT_ENABLE,
            HC_HCCA,
            HC_CONTROL_HEAD_ED,
            HC_BULK_HEAD_ED,
        ] {
            self.regs[offset / 4] = 0;
        }
        self.regs[HC_CONTROL / 4] =
            ir | HcControl::empty().with_functional_state(HCFS_SUSPEND).bits();
        self.regs[HC_FM_INTERVAL / 4] = FRAME_INTERVAL;
        self.regs[HC_RH_DESCRIPTOR_A / 4] = (POTPGT << 24) | self.opts.ports;
        self.done_head = 0;
        self.done_counter = None;
    }

    // ------------------------------------------------------------------------
    // DMA memory
    // ------------------------------------------------------------------------

    fn alloc(&mut self, size: usize, align: usize, platform: bool) -> Option<(NonNull<u8>, u32)> {
        let align = align.max(16);
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        let bus = self.next_bus.next_multiple_of(align as u32);
        self.next_bus = bus + (size.max(1) as u32).next_multiple_of(0x1000) + 0x1000;
        self.regions.push(Region {
            bus,
            ptr,
            layout,
            live: true,
            platform,
        });
        Some((ptr, bus))
    }

    fn translate(&self, bus: u32, len: usize) -> *mut u8 {
        for region in &self.regions {
            let end = region.bus as usize + region.layout.size();
            if region.live && bus >= region.bus && bus as usize + len <= end {
                return unsafe { region.ptr.as_ptr().add((bus - region.bus) as usize) };
            }
        }
        panic!("simulated controller accessed unmapped bus address {:#x}", bus);
    }

    fn read32(&self, bus: u32) -> u32 {
        unsafe { ptr::read_unaligned(self.translate(bus, 4).cast::<u32>()) }
    }

    fn write32(&self, bus: u32, value: u32) {
        unsafe { ptr::write_unaligned(self.translate(bus, 4).cast::<u32>(), value) }
    }

    fn write8(&self, bus: u32, value: u8) {
        unsafe { ptr::write(self.translate(bus, 1), value) }
    }

    fn read8(&self, bus: u32) -> u8 {
        unsafe { ptr::read(self.translate(bus, 1)) }
    }

    fn psw(&self, td: u32, index: usize) -> u16 {
        let word = self.read32(td + 16 + (index as u32 / 2) * 4);
        (word >> ((index % 2) * 16)) as u16
    }

    fn set_psw(&self, td: u32, index: usize, value: u16) {
        let addr = td + 16 + (index as u32 / 2) * 4;
        let shift = (index % 2) * 16;
        let word = self.read32(addr);
        self.write32(addr, (word & !(0xFFFF << shift)) | ((value as u32) << shift));
    }

    // ------------------------------------------------------------------------
    // Registers
    // ------------------------------------------------------------------------

    fn read_reg(&self, offset: usize) -> u32 {
        match offset {
            HC_FM_NUMBER => self.frame as u32,
            HC_INTERRUPT_DISABLE => self.regs[HC_INTERRUPT_ENABLE / 4],
            _ => self.regs[offset / 4],
        }
    }

    fn write_reg(&mut self, offset: usize, value: u32) {
        match offset {
            HC_COMMAND_STATUS => self.write_command_status(value),
            HC_INTERRUPT_STATUS => self.regs[offset / 4] &= !value,
            HC_INTERRUPT_ENABLE => self.regs[offset / 4] |= value,
            HC_INTERRUPT_DISABLE => self.regs[HC_INTERRUPT_ENABLE / 4] &= !value,
            HC_FM_NUMBER => {}
            HC_RH_STATUS => self.write_rh_status(value),
            _ if offset >= HC_RH_PORT_STATUS
                && offset < port_status_offset(self.opts.ports as usize) =>
            {
                self.write_port((offset - HC_RH_PORT_STATUS) / 4, value)
            }
            _ => self.regs[offset / 4] = value,
        }
    }

    fn write_command_status(&mut self, value: u32) {
        let command = CommandStatus::from_bits_retain(value);
        if command.contains(CommandStatus::HCR) {
            self.hardware_reset();
            self.regs[HC_COMMAND_STATUS / 4] |= CommandStatus::HCR.bits();
            self.reset_polls_left = (!self.opts.stuck_reset).then_some(self.opts.reset_polls);
        }
        if command.contains(CommandStatus::OCR) {
            let control = &mut self.regs[HC_CONTROL / 4];
            if *control & HcControl::IR.bits() != 0 && !self.opts.smm_stuck {
                *control &= !HcControl::IR.bits();
                self.regs[HC_INTERRUPT_STATUS / 4] |= InterruptFlags::OC.bits();
            }
        }
        self.regs[HC_COMMAND_STATUS / 4] |=
            (command & (CommandStatus::CLF | CommandStatus::BLF)).bits();
    }

    fn write_rh_status(&mut self, value: u32) {
        let command = RhStatus::from_bits_retain(value);
        for port in 0..self.opts.ports as usize {
            let reg = &mut self.regs[port_status_offset(port) / 4];
            if command.contains(RhStatus::LPSC) {
                *reg |= PortStatusBits::PPS.bits();
            }
            if command.contains(RhStatus::LPS) {
                *reg &= !PortStatusBits::PPS.bits();
            }
        }
        if command.contains(RhStatus::OCIC) {
            self.regs[HC_RH_STATUS / 4] &= !RhStatus::OCIC.bits();
        }
    }

    fn write_port(&mut self, port: usize, value: u32) {
        let index = port_status_offset(port) / 4;
        let mut status = PortStatusBits::from_bits_retain(self.regs[index]);
        let before = status & PortStatusBits::from_bits_retain(PortStatusBits::CHANGE_MASK);
        let connected = status.contains(PortStatusBits::CCS);

        if value & port_write::CLEAR_PORT_ENABLE != 0 {
            status.remove(PortStatusBits::PES);
        }
        if value & port_write::SET_PORT_ENABLE != 0 {
            if connected {
                status.insert(PortStatusBits::PES);
            } else {
                status.insert(PortStatusBits::CSC);
            }
        }
        if value & port_write::SET_PORT_SUSPEND != 0 && connected {
            status.insert(PortStatusBits::PSS);
        }
        if value & port_write::CLEAR_SUSPEND_STATUS != 0 && status.contains(PortStatusBits::PSS) {
            status.remove(PortStatusBits::PSS);
            status.insert(PortStatusBits::PSSC);
        }
        if value & port_write::SET_PORT_RESET != 0 {
            // リセットは即座に完了する
            if connected {
                status.insert(PortStatusBits::PES | PortStatusBits::PRSC);
            } else {
                status.insert(PortStatusBits::CSC);
            }
        }
        if value & port_write::SET_PORT_POWER != 0 {
            status.insert(PortStatusBits::PPS);
        }
        if value & port_write::CLEAR_PORT_POWER != 0 {
            status.remove(PortStatusBits::PPS | PortStatusBits::PES | PortStatusBits::PSS);
        }
        let clear = PortStatusBits::from_bits_retain(value & PortStatusBits::CHANGE_MASK);
        let raised = (status - before) & PortStatusBits::from_bits_retain(PortStatusBits::CHANGE_MASK);
        status.remove(clear - raised);

        self.regs[index] = status.bits();
        if !raised.is_empty() {
            self.regs[HC_INTERRUPT_STATUS / 4] |= InterruptFlags::RHSC.bits();
        }
    }

    // ------------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------------

    fn is_operational(&self) -> bool {
        HcControl::from_bits_retain(self.regs[HC_CONTROL / 4]).functional_state()
            == HCFS_OPERATIONAL
    }

    fn delay_us(&mut self, us: u32) {
        if let Some(left) = self.reset_polls_left {
            let left = left.saturating_sub(1);
            if left == 0 {
                self.regs[HC_COMMAND_STATUS / 4] &= !CommandStatus::HCR.bits();
                self.reset_polls_left = None;
            } else {
                self.reset_polls_left = Some(left);
            }
        }
        self.us_elapsed += us;
        while self.us_elapsed >= 1000 {
            self.us_elapsed -= 1000;
            self.tick();
        }
    }

    fn tick(&mut self) {
        if self.is_operational() {
            self.run_frame();
        }
    }

    fn set_frame(&mut self, frame: u16) {
        self.frame = frame;
        let hcca = self.regs[HC_HCCA / 4];
        if hcca != 0 {
            self.write_hcca_frame(hcca);
        }
    }

    fn write_hcca_frame(&self, hcca: u32) {
        let word = self.read32(hcca + 0x80);
        self.write32(hcca + 0x80, (word & 0xFFFF_0000) | self.frame as u32);
    }

    // ------------------------------------------------------------------------
    // Frame processing
    // ------------------------------------------------------------------------

    fn run_frame(&mut self) {
        let previous = self.frame;
        self.frame = self.frame.wrapping_add(1);
        let status = &mut self.regs[HC_INTERRUPT_STATUS / 4];
        *status |= InterruptFlags::SF.bits();
        if (previous ^ self.frame) & 0x8000 != 0 {
            *status |= InterruptFlags::FNO.bits();
        }

        let hcca = self.regs[HC_HCCA / 4];
        let control = HcControl::from_bits_retain(self.regs[HC_CONTROL / 4]);
        if hcca != 0 {
            self.write_hcca_frame(hcca);
            if control.contains(HcControl::PLE) {
                self.run_periodic(hcca, control.contains(HcControl::IE));
            }
        }
        if control.contains(HcControl::CLE) {
            self.run_flat(HC_CONTROL_HEAD_ED);
        }
        if control.contains(HcControl::BLE) {
            self.run_flat(HC_BULK_HEAD_ED);
        }
        self.write_back_done_queue(hcca);
    }

    fn run_periodic(&mut self, hcca: u32, iso_enabled: bool) {
        let leaf = self.frame as usize % INTERRUPT_TABLE_SIZE;
        let mut ed = self.read32(hcca + leaf as u32 * 4) & ED_PTR_MASK;
        for _ in 0..WALK_LIMIT {
            if ed == 0 {
                break;
            }
            let control = self.read32(ed);
            if control & ED_SKIP == 0 {
                if control & ED_ISO != 0 {
                    if iso_enabled {
                        self.service_iso(ed);
                    }
                } else {
                    self.service_general(ed);
                }
            }
            ed = self.read32(ed + 12) & ED_PTR_MASK;
        }
    }

    fn run_flat(&mut self, head_register: usize) {
        let mut ed = self.regs[head_register / 4] & ED_PTR_MASK;
        for _ in 0..WALK_LIMIT {
            if ed == 0 {
                break;
            }
            if self.read32(ed) & ED_SKIP == 0 {
                for _ in 0..WALK_LIMIT {
                    if !self.service_general(ed) {
                        break;
                    }
                }
            }
            ed = self.read32(ed + 12) & ED_PTR_MASK;
        }
    }

    /// ED の先頭 TD を1個処理する。続けて処理できるなら true
    fn service_general(&mut self, ed: u32) -> bool {
        let head = self.read32(ed + 8);
        let td = head & ED_PTR_MASK;
        if head & ED_HALTED != 0 || td == 0 || td == self.read32(ed + 4) & ED_PTR_MASK {
            return false;
        }
        if self.nak.contains(&ed) {
            return false;
        }

        let ed_control = self.read32(ed);
        let control = self.read32(td);
        let cbp = self.read32(td + 4);
        let next = self.read32(td + 8);
        let be = self.read32(td + 12);
        let length = if cbp == 0 {
            0
        } else {
            (be.wrapping_sub(cbp) + 1) as usize
        };

        let pid = match (ed_control >> ED_DIR_SHIFT) & 0x3 {
            ED_DIR_OUT => Pid::Out,
            ED_DIR_IN => Pid::In,
            _ => match (control >> TD_DP_SHIFT) & 0x3 {
                0b00 => Pid::Setup,
                0b01 => Pid::Out,
                _ => Pid::In,
            },
        };

        let outcome = self
            .outcomes
            .get_mut(&ed)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        let bytes = outcome.bytes.unwrap_or(length).min(length);
        match pid {
            Pid::Setup => {
                let mut setup = [0u8; 8];
                for (i, byte) in setup.iter_mut().enumerate().take(bytes) {
                    *byte = self.read8(cbp + i as u32);
                }
                self.last_setup = Some(setup);
            }
            Pid::In => {
                for i in 0..bytes {
                    self.write8(cbp + i as u32, i as u8);
                }
            }
            Pid::Out => {}
        }

        let mut cc = outcome.cc;
        if cc == 0 && bytes < length && control & TD_ROUNDING == 0 {
            cc = 9;
        }

        let mps = (((ed_control >> ED_MPS_SHIFT) & ED_MPS_MASK) as usize).max(1);
        let t = (control >> TD_T_SHIFT) & 0x3;
        let toggle = if t & 0b10 != 0 {
            t & 1
        } else {
            (head & ED_TOGGLE_CARRY) >> 1
        };
        let packets = bytes.div_ceil(mps).max(1) as u32;
        let toggle = if cc == 0 || cc == 9 {
            toggle ^ (packets & 1)
        } else {
            toggle
        };

        self.write32(td + 4, if bytes == length { 0 } else { cbp + bytes as u32 });
        let cleared = control & !((0xF << TD_CC_SHIFT) | (0x3 << TD_T_SHIFT) | (0x3 << TD_EC_SHIFT));
        self.write32(
            td,
            cleared | (cc << TD_CC_SHIFT) | ((0b10 | toggle) << TD_T_SHIFT),
        );
        let halted = if cc != 0 { ED_HALTED } else { 0 };
        self.write32(ed + 8, (next & ED_PTR_MASK) | (toggle << 1) | halted);
        self.retire(td, control, cc);
        cc == 0
    }

    fn service_iso(&mut self, ed: u32) {
        let head = self.read32(ed + 8);
        let td = head & ED_PTR_MASK;
        if head & ED_HALTED != 0 || td == 0 || td == self.read32(ed + 4) & ED_PTR_MASK {
            return;
        }
        let control = self.read32(td);
        let start_frame = (control & 0xFFFF) as u16;
        let frame_count = ((control >> ISO_FC_SHIFT) & 0x7) as usize + 1;
        let relative = self.frame.wrapping_sub(start_frame) as i16;
        if relative < 0 {
            return;
        }

        let next = self.read32(td + 8);
        let cleared = control & !(0xF << TD_CC_SHIFT);
        let relative = relative as usize;
        if relative >= frame_count {
            // 時間切れ
            self.write32(td, cleared | (8 << TD_CC_SHIFT));
            self.write32(ed + 8, (next & ED_PTR_MASK) | (head & ED_TOGGLE_CARRY));
            self.retire(td, control, 0);
            return;
        }

        let bp0 = self.read32(td + 4) & !PAGE_MASK;
        let be = self.read32(td + 12);
        let address = |psw: u16| {
            let page = if psw & PSW_PAGE_SELECT != 0 {
                be & !PAGE_MASK
            } else {
                bp0
            };
            page | (psw as u32 & PAGE_MASK)
        };
        let start = address(self.psw(td, relative));
        let end = if relative + 1 < frame_count {
            address(self.psw(td, relative + 1)) - 1
        } else {
            be
        };
        let len = (end.wrapping_sub(start) + 1) as usize;

        let in_direction = (self.read32(ed) >> ED_DIR_SHIFT) & 0x3 == ED_DIR_IN;
        let psw = if in_direction {
            let outcome = self
                .outcomes
                .get_mut(&ed)
                .and_then(VecDeque::pop_front)
                .unwrap_or_default();
            let bytes = outcome.bytes.unwrap_or(len).min(len);
            for i in 0..bytes {
                self.write8(start + i as u32, i as u8);
            }
            let cc = if outcome.cc == 0 && bytes < len { 9 } else { outcome.cc };
            ((cc as u16) << 12) | (bytes as u16 & PSW_SIZE_MASK)
        } else {
            0
        };
        self.set_psw(td, relative, psw);

        if relative + 1 == frame_count {
            self.write32(td, cleared);
            self.write32(ed + 8, (next & ED_PTR_MASK) | (head & ED_TOGGLE_CARRY));
            self.retire(td, control, 0);
        }
    }

    /// TD を Done Queue に積み、割り込み遅延カウンタを更新
    fn retire(&mut self, td: u32, control: u32, cc: u32) {
        self.write32(td + 8, self.done_head);
        self.done_head = td;
        let delay = (control >> TD_DI_SHIFT) & 0x7;
        if cc != 0 {
            self.done_counter = Some(0);
        } else if delay != 7 {
            self.done_counter = Some(self.done_counter.map_or(delay, |c| c.min(delay)));
        }
    }

    fn write_back_done_queue(&mut self, hcca: u32) {
        let Some(counter) = self.done_counter else {
            return;
        };
        if counter > 0 {
            self.done_counter = Some(counter - 1);
            return;
        }
        let status = &mut self.regs[HC_INTERRUPT_STATUS / 4];
        if *status & InterruptFlags::WDH.bits() != 0 || hcca == 0 {
            return;
        }
        *status |= InterruptFlags::WDH.bits();
        self.write32(hcca + 0x84, self.done_head);
        self.done_head = 0;
        self.done_counter = None;
    }
}

// ============================================================================
// Simulated Controller
// ============================================================================

/// シミュレートされたコントローラ
pub struct SimHc {
    state: Mutex<SimState>,
}

impl SimHc {
    pub fn new(opts: SimOptions) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::new(opts)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn registers(self: &Arc<Self>) -> SimRegisters {
        SimRegisters(self.clone())
    }

    pub fn platform(self: &Arc<Self>) -> SimPlatform {
        SimPlatform(self.clone())
    }

    /// レジスタ読み出し（ドライバと同じ意味）
    pub fn reg(&self, offset: usize) -> u32 {
        self.lock().read_reg(offset)
    }

    /// レジスタへ生の値を書く（ハードウェア側の状態を作る）
    pub fn set_reg(&self, offset: usize, value: u32) {
        let mut state = self.lock();
        if offset == HC_FM_NUMBER {
            state.set_frame(value as u16);
        } else {
            state.regs[offset / 4] = value;
        }
    }

    pub fn set_frame(&self, frame: u16) {
        self.lock().set_frame(frame);
    }

    /// Operational ならフレームを `n` 個進める
    pub fn run_frames(&self, n: u32) {
        let mut state = self.lock();
        for _ in 0..n {
            state.tick();
        }
    }

    /// ED の次の TD に対する応答を積む
    pub fn push_outcome(&self, ed_bus: u32, outcome: SimOutcome) {
        self.lock()
            .outcomes
            .entry(ed_bus)
            .or_default()
            .push_back(outcome);
    }

    /// ED が NAK を返し続けるか
    pub fn set_nak(&self, ed_bus: u32, nak: bool) {
        let mut state = self.lock();
        if nak {
            state.nak.insert(ed_bus);
        } else {
            state.nak.remove(&ed_bus);
        }
    }

    /// 最後に受け取った SETUP パケット
    pub fn last_setup(&self) -> Option<[u8; 8]> {
        self.lock().last_setup
    }

    /// コントローラ外の DMA バッファ（4KiB 境界）
    pub fn dma_buffer(&self, len: usize) -> DmaBuffer {
        let (ptr, bus) = self
            .lock()
            .alloc(len, 0x1000, false)
            .expect("simulated buffer allocation");
        unsafe { DmaBuffer::from_raw(ptr, bus, len) }
    }

    /// TD を新しい順に連結して Done Head に書き、WDH を立てる
    pub fn deliver_done_list(&self, tds_newest_first: &[u32]) {
        let mut state = self.lock();
        for (i, &td) in tds_newest_first.iter().enumerate() {
            let next = tds_newest_first.get(i + 1).copied().unwrap_or(0);
            state.write32(td + 8, next);
        }
        let hcca = state.regs[HC_HCCA / 4];
        state.write32(hcca + 0x84, tds_newest_first.first().copied().unwrap_or(0));
        state.regs[HC_INTERRUPT_STATUS / 4] |= InterruptFlags::WDH.bits();
    }

    /// ポートにデバイスを接続する
    pub fn connect_device(&self, port: usize, low_speed: bool) {
        let mut state = self.lock();
        let mut bits = PortStatusBits::CCS | PortStatusBits::CSC;
        if low_speed {
            bits |= PortStatusBits::LSDA;
        }
        state.regs[port_status_offset(port) / 4] |= bits.bits();
        state.regs[HC_INTERRUPT_STATUS / 4] |= InterruptFlags::RHSC.bits();
    }

    /// ポートからデバイスを外す
    pub fn disconnect_device(&self, port: usize) {
        let mut state = self.lock();
        let reg = &mut state.regs[port_status_offset(port) / 4];
        *reg &= !(PortStatusBits::CCS | PortStatusBits::PES | PortStatusBits::LSDA).bits();
        *reg |= (PortStatusBits::CSC | PortStatusBits::PESC).bits();
        state.regs[HC_INTERRUPT_STATUS / 4] |= InterruptFlags::RHSC.bits();
    }

    /// `dma_alloc` で確保され、まだ解放されていない領域数
    pub fn live_regions(&self) -> usize {
        self.lock()
            .regions
            .iter()
            .filter(|r| r.live && r.platform)
            .count()
    }

    pub fn irq_registered(&self) -> bool {
        self.lock().irq
    }

    /// `delay_ms` の呼び出し回数と、そのうち割り込み禁止中だった回数
    pub fn delay_calls(&self) -> (u32, u32) {
        let state = self.lock();
        (state.delay_calls, state.masked_delay_calls)
    }
}

/// `HcRegisters` 実装
#[derive(Clone)]
pub struct SimRegisters(Arc<SimHc>);

impl HcRegisters for SimRegisters {
    fn read32(&self, offset: usize) -> u32 {
        self.0.lock().read_reg(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.0.lock().write_reg(offset, value)
    }
}

/// `HcdPlatform` 実装
#[derive(Clone)]
pub struct SimPlatform(Arc<SimHc>);

impl HcdPlatform for SimPlatform {
    fn delay_ms(&self, ms: u32) {
        let mut state = self.0.lock();
        state.delay_calls += 1;
        if interrupts_masked() {
            state.masked_delay_calls += 1;
        }
        for _ in 0..ms {
            state.tick();
        }
    }

    fn delay_us(&self, us: u32) {
        self.0.lock().delay_us(us)
    }

    fn register_interrupt(&self, _irq: u32) -> HcdResult<()> {
        self.0.lock().irq = true;
        Ok(())
    }

    fn unregister_interrupt(&self, _irq: u32) {
        self.0.lock().irq = false;
    }

    fn dma_alloc(&self, size: usize, align: usize) -> Option<DmaRegion> {
        let mut state = self.0.lock();
        if state
            .opts
            .fail_alloc_after
            .is_some_and(|limit| state.allocations >= limit)
        {
            return None;
        }
        state.allocations += 1;
        let (ptr, bus) = state.alloc(size, align, true)?;
        Some(unsafe { DmaRegion::new(ptr, bus, size) })
    }

    fn dma_free(&self, region: DmaRegion) {
        let mut state = self.0.lock();
        if let Some(entry) = state
            .regions
            .iter_mut()
            .find(|r| r.live && r.bus == region.bus())
        {
            entry.live = false;
        }
    }
}

/// 初期化して Operational にしたコントローラ
pub fn started_controller(
    config: OhciConfig,
) -> (OhciController<SimRegisters, SimPlatform>, Arc<SimHc>) {
    install_interrupt_hooks(InterruptHooks {
        save_and_disable,
        restore,
    });
    let sim = SimHc::new(SimOptions::default());
    let controller = OhciController::init(sim.registers(), sim.platform(), config)
        .expect("controller init");
    controller.start().expect("controller start");
    (controller, sim)
}
