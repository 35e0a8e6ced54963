// ============================================================================
// src/io/usb/ohci/controller.rs - OHCI Host Controller
// ============================================================================
//!
//! OHCI ホストコントローラ本体。
//!
//! ## 状態機械
//! ```text
//! Reset → Operational → Suspend → Resume → Operational
//!   ↑__________________________________________|  (stop: 任意 → Reset)
//! ```
//!
//! ## 初期化フロー
//! 1. DMA 領域（HCCA / ED / TD / SETUP / データバッファ）確保
//! 2. SMM/BIOS からの所有権移譲
//! 3. ソフトウェアリセット (HCR)
//! 4. フレーム間隔・周期開始・LS閾値の設定
//! 5. 周期ツリー構築、HCCA 設定
//!
//! ## 割り込み
//! スケジュールのロック内で Done List 等を処理し、
//! 完了コールバックとルートハブ通知はロック解放後に呼ぶ。
//!
//! ## ロック
//! - `schedule`: 割り込み禁止。ソフトウェア状態の短い更新のみ
//! - `endpoint_ops`: 割り込み許可のまま。ED を一時停止して待つ操作の直列化

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use log::{debug, error, info, warn};
use spin::{Mutex, RwLock};

use crate::error::{HcdError, HcdResult, HwOperation, PoolKind};
use crate::sync::IrqMutex;

use super::config::OhciConfig;
use super::descriptor::{ED_SIZE, TD_SIZE};
use super::dma::{DmaBuffer, DmaRegion, HcdPlatform};
use super::hcca::{Hcca, HCCA_ALIGN, HCCA_SIZE};
use super::pause;
use super::periodic;
use super::pool::{DescriptorArena, SlotPool};
use super::regs::{
    fs_max_packet, periodic_start, CommandStatus, HcControl, HcRegisters, InterruptFlags,
    RhStatus, FM_INTERVAL_FIT, HCFS_OPERATIONAL, HCFS_RESET, HCFS_RESUME, HCFS_SUSPEND,
    HC_BULK_CURRENT_ED, HC_BULK_HEAD_ED, HC_COMMAND_STATUS, HC_CONTROL, HC_CONTROL_CURRENT_ED,
    HC_CONTROL_HEAD_ED, HC_FM_INTERVAL, HC_HCCA, HC_INTERRUPT_DISABLE, HC_INTERRUPT_ENABLE,
    HC_INTERRUPT_STATUS, HC_LS_THRESHOLD, HC_PERIODIC_START, HC_RH_DESCRIPTOR_A, HC_RH_STATUS,
    LS_THRESHOLD, MAX_ROOT_PORTS,
};
use super::schedule::{Delivery, HwContext, Schedule};
use super::transfer::SETUP_PACKET_SIZE;
use super::vtrace;

/// 所有権移譲のポーリング回数（1回 = 1ms）
const OWNERSHIP_POLL_MS: u32 = 50;

/// データバッファのアライメント
const DATA_BUFFER_ALIGN: usize = 4096;

// ============================================================================
// Controller State
// ============================================================================

/// コントローラの機能状態 (HCFS)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcState {
    Reset,
    Operational,
    Suspend,
    Resume,
}

impl HcState {
    /// 許可された遷移か
    pub fn can_transition(self, to: HcState) -> bool {
        matches!(
            (self, to),
            (_, HcState::Reset)
                | (HcState::Reset, HcState::Operational)
                | (HcState::Operational, HcState::Suspend)
                | (HcState::Suspend, HcState::Resume)
                | (HcState::Resume, HcState::Operational)
        )
    }

    fn hcfs(self) -> u32 {
        match self {
            HcState::Reset => HCFS_RESET,
            HcState::Resume => HCFS_RESUME,
            HcState::Operational => HCFS_OPERATIONAL,
            HcState::Suspend => HCFS_SUSPEND,
        }
    }
}

pub(crate) struct ControllerState {
    pub current: HcState,
    /// サスペンド/停止で切ったリスト処理スイッチ
    pub saved_lists: HcControl,
}

impl ControllerState {
    fn transition(&mut self, to: HcState) -> HcdResult<()> {
        if !self.current.can_transition(to) {
            return Err(HcdError::InvalidState {
                from: self.current,
                to,
            });
        }
        debug!("OHCI: {:?} -> {:?}", self.current, to);
        self.current = to;
        Ok(())
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// 統計カウンタ（`stats` フィーチャ有効時のみ加算）
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    completed_tds: AtomicU32,
    done_interrupts: AtomicU32,
    scheduling_overruns: AtomicU32,
    pause_timeouts: AtomicU32,
    unrecoverable_errors: AtomicU32,
}

impl StatCounters {
    fn add(counter: &AtomicU32, n: u32) {
        if cfg!(feature = "stats") {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn record_pause_timeout(&self) {
        Self::add(&self.pause_timeouts, 1);
    }

    fn snapshot(&self) -> HcdStats {
        HcdStats {
            completed_tds: self.completed_tds.load(Ordering::Relaxed),
            done_interrupts: self.done_interrupts.load(Ordering::Relaxed),
            scheduling_overruns: self.scheduling_overruns.load(Ordering::Relaxed),
            pause_timeouts: self.pause_timeouts.load(Ordering::Relaxed),
            unrecoverable_errors: self.unrecoverable_errors.load(Ordering::Relaxed),
        }
    }
}

/// 統計スナップショット
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HcdStats {
    pub completed_tds: u32,
    pub done_interrupts: u32,
    pub scheduling_overruns: u32,
    pub pause_timeouts: u32,
    pub unrecoverable_errors: u32,
}

/// プールの空き状況
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub endpoints_free: usize,
    pub tds_free: usize,
    pub requests_free: usize,
    pub buffers_free: usize,
}

// ============================================================================
// DMA Region Allocation
// ============================================================================

/// 初期化途中で失敗したら自動的に返却される DMA 領域
struct PendingRegion<'p> {
    platform: &'p dyn HcdPlatform,
    region: DmaRegion,
}

impl<'p> PendingRegion<'p> {
    fn alloc(platform: &'p dyn HcdPlatform, size: usize, align: usize) -> HcdResult<Self> {
        let region = platform
            .dma_alloc(size, align)
            .filter(|r| r.len() >= size && r.bus() as usize % align == 0)
            .ok_or(HcdError::Alloc(PoolKind::DmaRegion))?;
        Ok(Self { platform, region })
    }

    fn into_inner(mut self) -> DmaRegion {
        self.region.take()
    }
}

impl Drop for PendingRegion<'_> {
    fn drop(&mut self) {
        if !self.region.is_empty() {
            self.platform.dma_free(self.region.take());
        }
    }
}

/// 完了コールバックを呼ぶ（ロック外で）
pub(crate) fn deliver(deliveries: Vec<Delivery>) {
    for (callback, completion) in deliveries {
        callback(completion);
    }
}

// ============================================================================
// OHCI Controller
// ============================================================================

/// OHCI ホストコントローラ
pub struct OhciController<R: HcRegisters, P: HcdPlatform> {
    pub(crate) regs: R,
    pub(crate) platform: P,
    pub(crate) config: OhciConfig,
    pub(crate) hcca: Hcca,
    pub(crate) ed_arena: DescriptorArena,
    pub(crate) td_arena: DescriptorArena,
    pub(crate) setup_arena: DescriptorArena,
    pub(crate) buffer_arena: Option<DescriptorArena>,
    /// タスク/割り込みコンテキスト共有のスケジュール
    pub(crate) schedule: IrqMutex<Schedule>,
    pub(crate) buffer_pool: IrqMutex<SlotPool>,
    pub(crate) state: Mutex<ControllerState>,
    /// クローズ/アボート/追加時の一時停止の所有権
    pub(crate) endpoint_ops: Mutex<()>,
    /// 拡張フレーム番号の上位部 (0x8000 単位、ビット15は観測済みの値)
    frame_hi: AtomicU32,
    pub(crate) port_count: AtomicUsize,
    pub(crate) rh_handler: RwLock<Option<fn(u32)>>,
    irq_registered: AtomicBool,
    pub(crate) stats: StatCounters,
}

impl<R: HcRegisters, P: HcdPlatform> OhciController<R, P> {
    /// コントローラを初期化し、Reset 状態で返す
    ///
    /// リセット完了待ちのタイムアウトは致命的エラー。
    pub fn init(regs: R, platform: P, config: OhciConfig) -> HcdResult<Self> {
        config.validate()?;

        let (hcca, eds, tds, setup, buffers) = {
            let p: &dyn HcdPlatform = &platform;
            let hcca = PendingRegion::alloc(p, HCCA_SIZE, HCCA_ALIGN)?;
            let eds = PendingRegion::alloc(p, config.ed_slots() * ED_SIZE, ED_SIZE)?;
            let td_count = config.max_transfer_descriptors as usize;
            let tds = PendingRegion::alloc(p, td_count * TD_SIZE, TD_SIZE)?;
            let setup_len = config.max_requests as usize * SETUP_PACKET_SIZE;
            let setup = PendingRegion::alloc(p, setup_len, SETUP_PACKET_SIZE)?;
            let buffers = if config.data_buffer_count > 0 {
                let len = config.data_buffer_count as usize * config.data_buffer_size;
                Some(PendingRegion::alloc(p, len, DATA_BUFFER_ALIGN)?)
            } else {
                None
            };
            (
                hcca.into_inner(),
                eds.into_inner(),
                tds.into_inner(),
                setup.into_inner(),
                buffers.map(PendingRegion::into_inner),
            )
        };

        let controller = Self {
            hcca: Hcca::new(hcca),
            ed_arena: DescriptorArena::new(eds, ED_SIZE, config.ed_slots()),
            td_arena: DescriptorArena::new(
                tds,
                TD_SIZE,
                config.max_transfer_descriptors as usize,
            ),
            setup_arena: DescriptorArena::new(
                setup,
                SETUP_PACKET_SIZE,
                config.max_requests as usize,
            ),
            buffer_arena: buffers.map(|region| {
                DescriptorArena::new(
                    region,
                    config.data_buffer_size,
                    config.data_buffer_count as usize,
                )
            }),
            schedule: IrqMutex::new(Schedule::new(&config)),
            buffer_pool: IrqMutex::new(SlotPool::new(0, config.data_buffer_count)),
            state: Mutex::new(ControllerState {
                current: HcState::Reset,
                saved_lists: HcControl::empty(),
            }),
            endpoint_ops: Mutex::new(()),
            frame_hi: AtomicU32::new(0),
            port_count: AtomicUsize::new(0),
            rh_handler: RwLock::new(None),
            irq_registered: AtomicBool::new(false),
            stats: StatCounters::default(),
            regs,
            platform,
            config,
        };

        controller.take_ownership()?;
        controller.reset_controller()?;
        controller.program_frame_timing();
        controller.setup_schedule();
        controller.read_port_count();

        info!(
            "OHCI: initialized, {} endpoints, {} TDs, {} root ports",
            controller.config.max_endpoints,
            controller.config.max_transfer_descriptors,
            controller.port_count.load(Ordering::Relaxed)
        );
        Ok(controller)
    }

    /// スケジュール操作用のハードウェアコンテキスト
    pub(crate) fn hw(&self) -> HwContext<'_> {
        HwContext {
            regs: &self.regs,
            platform: &self.platform,
            eds: &self.ed_arena,
            tds: &self.td_arena,
            setup: &self.setup_arena,
            config: &self.config,
            stats: &self.stats,
        }
    }

    fn control(&self) -> HcControl {
        HcControl::from_bits_retain(self.regs.read32(HC_CONTROL))
    }

    // ========================================================================
    // Initialization Steps
    // ========================================================================

    /// SMM ドライバが握っていれば OwnershipChangeRequest で譲ってもらう
    fn take_ownership(&self) -> HcdResult<()> {
        if !self.control().contains(HcControl::IR) {
            return Ok(());
        }
        info!("OHCI: requesting ownership from SMM");
        self.regs
            .write32(HC_COMMAND_STATUS, CommandStatus::OCR.bits());
        for _ in 0..OWNERSHIP_POLL_MS {
            self.platform.delay_ms(1);
            if !self.control().contains(HcControl::IR) {
                return Ok(());
            }
        }
        error!("OHCI: SMM did not release the controller");
        Err(HcdError::Timeout(HwOperation::OwnershipHandoff))
    }

    /// ソフトウェアリセット
    fn reset_controller(&self) -> HcdResult<()> {
        self.regs
            .write32(HC_COMMAND_STATUS, CommandStatus::HCR.bits());
        for _ in 0..self.config.reset_timeout_us {
            self.platform.delay_us(1);
            let status = CommandStatus::from_bits_retain(self.regs.read32(HC_COMMAND_STATUS));
            if !status.contains(CommandStatus::HCR) {
                return Ok(());
            }
        }
        error!(
            "OHCI: reset did not complete within {} us",
            self.config.reset_timeout_us
        );
        Err(HcdError::Timeout(HwOperation::Reset))
    }

    /// FmInterval / PeriodicStart / LSThreshold
    fn program_frame_timing(&self) {
        let fi = self.config.frame_interval;
        // FIT を反転させて新しい値を通知する
        let toggle = (self.regs.read32(HC_FM_INTERVAL) & FM_INTERVAL_FIT) ^ FM_INTERVAL_FIT;
        self.regs
            .write32(HC_FM_INTERVAL, fi | (fs_max_packet(fi) << 16) | toggle);
        self.regs.write32(HC_PERIODIC_START, periodic_start(fi));
        self.regs.write32(HC_LS_THRESHOLD, LS_THRESHOLD);
    }

    /// 周期ツリーと HCCA を設定し、リストを空にする
    fn setup_schedule(&self) {
        {
            let mut schedule = self.schedule.lock();
            periodic::build_tree(&mut schedule.eds, &self.ed_arena, &self.hcca);
        }
        self.regs.write32(HC_HCCA, self.hcca.bus());
        for offset in [
            HC_CONTROL_HEAD_ED,
            HC_CONTROL_CURRENT_ED,
            HC_BULK_HEAD_ED,
            HC_BULK_CURRENT_ED,
        ] {
            self.regs.write32(offset, 0);
        }

        self.regs
            .write32(HC_INTERRUPT_DISABLE, InterruptFlags::all().bits());
        self.regs
            .write32(HC_INTERRUPT_STATUS, InterruptFlags::all().bits());

        let control = HcControl::from_bits_retain(self.config.control_bulk_ratio as u32)
            .with_functional_state(HCFS_RESET);
        self.regs.write32(HC_CONTROL, control.bits());
    }

    fn read_port_count(&self) -> usize {
        let ndp = (self.regs.read32(HC_RH_DESCRIPTOR_A) & 0xFF) as usize;
        let count = ndp.min(MAX_ROOT_PORTS);
        self.port_count.store(count, Ordering::Relaxed);
        count
    }

    // ========================================================================
    // State Machine
    // ========================================================================

    /// 現在の状態
    pub fn state(&self) -> HcState {
        self.state.lock().current
    }

    /// Reset → Operational
    pub fn start(&self) -> HcdResult<()> {
        let mut state = self.state.lock();
        if state.current != HcState::Reset {
            return Err(HcdError::InvalidState {
                from: state.current,
                to: HcState::Operational,
            });
        }

        if !self.irq_registered.load(Ordering::Acquire) {
            self.platform.register_interrupt(self.config.irq)?;
            self.irq_registered.store(true, Ordering::Release);
        }

        self.regs
            .write32(HC_INTERRUPT_STATUS, InterruptFlags::all().bits());
        self.regs.write32(
            HC_INTERRUPT_ENABLE,
            (InterruptFlags::OPERATIONAL | InterruptFlags::MIE).bits(),
        );

        let control = (self.control() | state.saved_lists).with_functional_state(HcState::Operational.hcfs());
        self.regs.write32(HC_CONTROL, control.bits());
        state.saved_lists = HcControl::empty();
        state.transition(HcState::Operational)?;

        // ルートハブ給電
        self.regs.write32(HC_RH_STATUS, RhStatus::LPSC.bits());
        let potpgt = self.regs.read32(HC_RH_DESCRIPTOR_A) >> 24;
        self.platform.delay_ms(potpgt * 2);
        let ports = self.read_port_count();

        info!("OHCI: operational, {} root ports", ports);
        Ok(())
    }

    /// Operational → Suspend
    pub fn suspend(&self) -> HcdResult<()> {
        let mut state = self.state.lock();
        if state.current != HcState::Operational {
            return Err(HcdError::InvalidState {
                from: state.current,
                to: HcState::Suspend,
            });
        }

        let control = self.control();
        state.saved_lists = control & HcControl::LIST_ENABLES;
        let quiesced = control - HcControl::LIST_ENABLES;
        self.regs.write32(HC_CONTROL, quiesced.bits());
        let retries = self.config.pause_retries;
        if let Err(e) = pause::wait_frame_advance(&self.regs, &self.platform, retries) {
            warn!("OHCI: {} before suspend", e);
        }

        self.regs.write32(
            HC_CONTROL,
            quiesced.with_functional_state(HcState::Suspend.hcfs()).bits(),
        );
        state.transition(HcState::Suspend)
    }

    /// Suspend → Resume → Operational
    pub fn resume(&self) -> HcdResult<()> {
        let mut state = self.state.lock();
        state.transition(HcState::Resume)?;
        let control = self.control();
        self.regs.write32(
            HC_CONTROL,
            control.with_functional_state(HcState::Resume.hcfs()).bits(),
        );

        self.platform.delay_ms(self.config.resume_settle_ms);

        let restored = (control | state.saved_lists).with_functional_state(HcState::Operational.hcfs());
        self.regs.write32(HC_CONTROL, restored.bits());
        state.saved_lists = HcControl::empty();
        state.transition(HcState::Operational)
    }

    /// 任意の状態 → Reset（SOF 停止、割り込み無効化）
    pub fn stop(&self) -> HcdResult<()> {
        let mut state = self.state.lock();
        self.halt_hardware(&mut state);
        state.transition(HcState::Reset)?;

        if self.irq_registered.swap(false, Ordering::AcqRel) {
            self.platform.unregister_interrupt(self.config.irq);
        }
        info!("OHCI: stopped");
        Ok(())
    }

    fn halt_hardware(&self, state: &mut ControllerState) {
        let control = self.control();
        if state.current != HcState::Suspend {
            state.saved_lists = control & HcControl::LIST_ENABLES;
        }
        self.regs
            .write32(HC_INTERRUPT_DISABLE, InterruptFlags::MIE.bits());
        self.regs.write32(
            HC_CONTROL,
            (control - HcControl::LIST_ENABLES)
                .with_functional_state(HcState::Reset.hcfs())
                .bits(),
        );
    }

    // ========================================================================
    // Interrupt Handling
    // ========================================================================

    /// 割り込みハンドラ。自分の割り込みなら true
    pub fn handle_interrupt(&self) -> bool {
        let hw = self.hw();
        let mut deliveries = Vec::new();
        let mut port_changes = None;
        {
            let mut schedule = self.schedule.lock();
            let enabled = InterruptFlags::from_bits_truncate(self.regs.read32(HC_INTERRUPT_ENABLE));
            if !enabled.contains(InterruptFlags::MIE) {
                return false;
            }
            let status = InterruptFlags::from_bits_truncate(self.regs.read32(HC_INTERRUPT_STATUS))
                & enabled
                & !InterruptFlags::MIE;
            if status.is_empty() {
                return false;
            }

            if status.contains(InterruptFlags::WDH) {
                let head = self.hcca.take_done_head();
                StatCounters::add(&self.stats.done_interrupts, 1);
                if head != 0 {
                    let retired = schedule.process_done_list(&hw, head, &mut deliveries);
                    StatCounters::add(&self.stats.completed_tds, retired as u32);
                }
            }
            if status.contains(InterruptFlags::SO) {
                StatCounters::add(&self.stats.scheduling_overruns, 1);
                warn!("OHCI: scheduling overrun");
            }
            if status.contains(InterruptFlags::UE) {
                StatCounters::add(&self.stats.unrecoverable_errors, 1);
                error!("OHCI: unrecoverable error, controller needs reset");
            }
            if status.contains(InterruptFlags::FNO) {
                let frame = self.extend_frame_number();
                vtrace!("OHCI: frame number overflow, now {:#x}", frame);
            }
            if status.contains(InterruptFlags::RD) {
                info!("OHCI: resume detected");
            }
            if status.contains(InterruptFlags::RHSC) {
                port_changes = Some(self.port_change_bitmap());
            }

            self.regs.write32(HC_INTERRUPT_STATUS, status.bits());
        }

        deliver(deliveries);
        if let Some(bitmap) = port_changes {
            let handler = *self.rh_handler.read();
            if let Some(handler) = handler {
                handler(bitmap);
            }
        }
        true
    }

    /// 割り込みを使わない環境向けのポーリング
    pub fn poll(&self) -> bool {
        self.handle_interrupt()
    }

    // ========================================================================
    // Frame Number
    // ========================================================================

    /// 上位部のビット15を HCCA のフレーム番号に追従させ、32ビット値を返す
    ///
    /// ビット15の反転1回につき上位部を 0x8000 進める。FNO 割り込みと
    /// 読み出しのどちらが先に反転を観測しても同じ結果になる。
    fn extend_frame_number(&self) -> u32 {
        loop {
            let hi = self.frame_hi.load(Ordering::Acquire);
            let frame = self.hcca.frame_number() as u32;
            if (hi ^ frame) & 0x8000 == 0 {
                return (hi & !0xFFFF) | frame;
            }
            let next = hi.wrapping_add(0x8000);
            if self
                .frame_hi
                .compare_exchange(hi, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return (next & !0xFFFF) | frame;
            }
        }
    }

    /// HCCA の16ビットフレーム番号
    pub fn frame_number(&self) -> u16 {
        self.hcca.frame_number()
    }

    /// 32ビットに拡張したフレーム番号
    ///
    /// 単調増加。FNO 割り込みが処理される前に読んでも巻き戻らない。
    pub fn current_frame(&self) -> u32 {
        self.extend_frame_number()
    }

    // ========================================================================
    // Data Buffer Pool
    // ========================================================================

    /// データバッファプールから `len` バイトのバッファを確保
    pub fn alloc_buffer(&self, len: usize) -> HcdResult<DmaBuffer> {
        let arena = self
            .buffer_arena
            .as_ref()
            .ok_or(HcdError::Alloc(PoolKind::DataBuffer))?;
        if len > arena.stride() {
            return Err(HcdError::InvalidParameter);
        }
        let slot = self
            .buffer_pool
            .lock()
            .alloc()
            .ok_or(HcdError::Alloc(PoolKind::DataBuffer))?;
        let index = slot as usize;
        Ok(DmaBuffer::from_pool(arena.ptr(index), arena.bus(index), len, slot))
    }

    /// プールバッファを返却（外部バッファは何もしない）
    pub fn free_buffer(&self, buffer: DmaBuffer) {
        if let Some(slot) = buffer.pool_slot {
            self.buffer_pool.lock().free(slot);
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn stats(&self) -> HcdStats {
        self.stats.snapshot()
    }

    pub fn pool_usage(&self) -> PoolUsage {
        let schedule = self.schedule.lock();
        PoolUsage {
            endpoints_free: schedule.ed_pool.free_count(),
            tds_free: schedule.td_pool.free_count(),
            requests_free: schedule.request_pool.free_count(),
            buffers_free: self.buffer_pool.lock().free_count(),
        }
    }
}

impl<R: HcRegisters, P: HcdPlatform> Drop for OhciController<R, P> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.current != HcState::Reset {
            let control = HcControl::from_bits_retain(self.regs.read32(HC_CONTROL));
            self.regs
                .write32(HC_INTERRUPT_DISABLE, InterruptFlags::MIE.bits());
            self.regs.write32(
                HC_CONTROL,
                (control - HcControl::LIST_ENABLES)
                    .with_functional_state(HCFS_RESET)
                    .bits(),
            );
            state.current = HcState::Reset;
        }
        if *self.irq_registered.get_mut() {
            self.platform.unregister_interrupt(self.config.irq);
        }
        // コントローラが HCCA を参照しないようにしてから解放
        if self.regs.read32(HC_HCCA) == self.hcca.bus() {
            self.regs.write32(HC_HCCA, 0);
        }

        let mut regions = Vec::with_capacity(5);
        regions.push(self.hcca.take_region());
        regions.push(self.ed_arena.take_region());
        regions.push(self.td_arena.take_region());
        regions.push(self.setup_arena.take_region());
        if let Some(arena) = self.buffer_arena.as_mut() {
            regions.push(arena.take_region());
        }
        for region in regions {
            if !region.is_empty() {
                self.platform.dma_free(region);
            }
        }
    }
}
