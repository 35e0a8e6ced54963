// ============================================================================
// src/io/usb/ohci/regs.rs - OHCI Operational Registers
// ============================================================================
//!
//! OHCI オペレーショナルレジスタ（ビット精度）とアクセストレイト。
//!
//! レジスタブロックは固定オフセットの32ビットレジスタ群。
//! アクセスは `HcRegisters` トレイト経由で行い、実機では
//! `MmioRegisters`（volatile MMIO）、テストではシミュレータが実装する。

use bitflags::bitflags;
use core::ptr;

// ============================================================================
// Register Offsets
// ============================================================================

pub const HC_REVISION: usize = 0x00;
pub const HC_CONTROL: usize = 0x04;
pub const HC_COMMAND_STATUS: usize = 0x08;
pub const HC_INTERRUPT_STATUS: usize = 0x0C;
pub const HC_INTERRUPT_ENABLE: usize = 0x10;
pub const HC_INTERRUPT_DISABLE: usize = 0x14;
pub const HC_HCCA: usize = 0x18;
pub const HC_PERIOD_CURRENT_ED: usize = 0x1C;
pub const HC_CONTROL_HEAD_ED: usize = 0x20;
pub const HC_CONTROL_CURRENT_ED: usize = 0x24;
pub const HC_BULK_HEAD_ED: usize = 0x28;
pub const HC_BULK_CURRENT_ED: usize = 0x2C;
pub const HC_DONE_HEAD: usize = 0x30;
pub const HC_FM_INTERVAL: usize = 0x34;
pub const HC_FM_REMAINING: usize = 0x38;
pub const HC_FM_NUMBER: usize = 0x3C;
pub const HC_PERIODIC_START: usize = 0x40;
pub const HC_LS_THRESHOLD: usize = 0x44;
pub const HC_RH_DESCRIPTOR_A: usize = 0x48;
pub const HC_RH_DESCRIPTOR_B: usize = 0x4C;
pub const HC_RH_STATUS: usize = 0x50;
/// ポート1のステータスレジスタ（ポートnは +4*n）
pub const HC_RH_PORT_STATUS: usize = 0x54;

/// ルートハブポートの最大数 (HcRhDescriptorA.NDP)
pub const MAX_ROOT_PORTS: usize = 15;

/// ポートステータスレジスタのオフセット (0-indexed)
pub const fn port_status_offset(port: usize) -> usize {
    HC_RH_PORT_STATUS + port * 4
}

// ============================================================================
// Frame Interval Constants
// ============================================================================

/// FmInterval.FI の既定値 (11999 ビットタイム = 1ms)
pub const FRAME_INTERVAL: u32 = 0x2EDF;
/// FmInterval.FIT (Frame Interval Toggle)
pub const FM_INTERVAL_FIT: u32 = 1 << 31;
/// Low Speed しきい値
pub const LS_THRESHOLD: u32 = 0x628;

/// FSLargestDataPacket (ビットタイム)
pub const fn fs_max_packet(frame_interval: u32) -> u32 {
    ((frame_interval - 210) * 6) / 7
}

/// PeriodicStart = フレーム時間の90%
pub const fn periodic_start(frame_interval: u32) -> u32 {
    (frame_interval * 9) / 10
}

// ============================================================================
// HcControl
// ============================================================================

bitflags! {
    /// HcControl レジスタ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcControl: u32 {
        /// Control/Bulk Service Ratio
        const CBSR_MASK = 0x3;
        /// Periodic List Enable
        const PLE = 1 << 2;
        /// Isochronous Enable
        const IE = 1 << 3;
        /// Control List Enable
        const CLE = 1 << 4;
        /// Bulk List Enable
        const BLE = 1 << 5;
        /// Host Controller Functional State
        const HCFS_MASK = 0x3 << 6;
        /// Interrupt Routing (SMM 所有)
        const IR = 1 << 8;
        /// Remote Wakeup Connected
        const RWC = 1 << 9;
        /// Remote Wakeup Enable
        const RWE = 1 << 10;
    }
}

impl HcControl {
    /// 4つのリスト処理スイッチ
    pub const LIST_ENABLES: Self = Self::PLE.union(Self::IE).union(Self::CLE).union(Self::BLE);

    pub const HCFS_SHIFT: u32 = 6;

    /// HCFS フィールドの値 (00 Reset, 01 Resume, 10 Operational, 11 Suspend)
    pub fn functional_state(&self) -> u32 {
        (self.bits() & Self::HCFS_MASK.bits()) >> Self::HCFS_SHIFT
    }

    /// HCFS を置き換えた値
    pub fn with_functional_state(self, hcfs: u32) -> Self {
        Self::from_bits_retain(
            (self.bits() & !Self::HCFS_MASK.bits()) | ((hcfs & 0x3) << Self::HCFS_SHIFT),
        )
    }
}

pub const HCFS_RESET: u32 = 0b00;
pub const HCFS_RESUME: u32 = 0b01;
pub const HCFS_OPERATIONAL: u32 = 0b10;
pub const HCFS_SUSPEND: u32 = 0b11;

// ============================================================================
// HcCommandStatus
// ============================================================================

bitflags! {
    /// HcCommandStatus レジスタ（書き込み1でセット）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandStatus: u32 {
        /// Host Controller Reset
        const HCR = 1 << 0;
        /// Control List Filled
        const CLF = 1 << 1;
        /// Bulk List Filled
        const BLF = 1 << 2;
        /// Ownership Change Request
        const OCR = 1 << 3;
        /// Scheduling Overrun Count
        const SOC_MASK = 0x3 << 16;
    }
}

// ============================================================================
// HcInterruptStatus / Enable / Disable
// ============================================================================

bitflags! {
    /// 割り込みビット（Status は書き込み1でクリア）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptFlags: u32 {
        /// Scheduling Overrun
        const SO = 1 << 0;
        /// Writeback Done Head
        const WDH = 1 << 1;
        /// Start of Frame
        const SF = 1 << 2;
        /// Resume Detected
        const RD = 1 << 3;
        /// Unrecoverable Error
        const UE = 1 << 4;
        /// Frame Number Overflow
        const FNO = 1 << 5;
        /// Root Hub Status Change
        const RHSC = 1 << 6;
        /// Ownership Change
        const OC = 1 << 30;
        /// Master Interrupt Enable
        const MIE = 1 << 31;
    }
}

impl InterruptFlags {
    /// Start 時に有効化する割り込み集合
    pub const OPERATIONAL: Self = Self::WDH
        .union(Self::FNO)
        .union(Self::RD)
        .union(Self::SO)
        .union(Self::UE)
        .union(Self::RHSC);
}

// ============================================================================
// HcRhStatus
// ============================================================================

bitflags! {
    /// HcRhStatus レジスタ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RhStatus: u32 {
        /// Local Power Status（書き込み: ClearGlobalPower）
        const LPS = 1 << 0;
        /// Over Current Indicator
        const OCI = 1 << 1;
        /// Device Remote Wakeup Enable
        const DRWE = 1 << 15;
        /// Local Power Status Change（書き込み: SetGlobalPower）
        const LPSC = 1 << 16;
        /// Over Current Indicator Change
        const OCIC = 1 << 17;
        /// Clear Remote Wakeup Enable
        const CRWE = 1 << 31;
    }
}

// ============================================================================
// HcRhPortStatus
// ============================================================================

bitflags! {
    /// HcRhPortStatus レジスタ（読み出しの意味）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortStatusBits: u32 {
        /// Current Connect Status
        const CCS = 1 << 0;
        /// Port Enable Status
        const PES = 1 << 1;
        /// Port Suspend Status
        const PSS = 1 << 2;
        /// Port Over Current Indicator
        const POCI = 1 << 3;
        /// Port Reset Status
        const PRS = 1 << 4;
        /// Port Power Status
        const PPS = 1 << 8;
        /// Low Speed Device Attached
        const LSDA = 1 << 9;
        /// Connect Status Change
        const CSC = 1 << 16;
        /// Port Enable Status Change
        const PESC = 1 << 17;
        /// Port Suspend Status Change
        const PSSC = 1 << 18;
        /// Port Over Current Indicator Change
        const OCIC = 1 << 19;
        /// Port Reset Status Change
        const PRSC = 1 << 20;
    }
}

impl PortStatusBits {
    /// wPortStatus に相当する下位ビット
    pub const STATUS_MASK: u32 = 0x031F;
    /// wPortChange に相当する変化ビット
    pub const CHANGE_MASK: u32 = 0x001F_0000;
}

/// HcRhPortStatus への書き込みコマンド
pub mod port_write {
    /// ClearPortEnable (CCS 位置への書き込み)
    pub const CLEAR_PORT_ENABLE: u32 = 1 << 0;
    /// SetPortEnable
    pub const SET_PORT_ENABLE: u32 = 1 << 1;
    /// SetPortSuspend
    pub const SET_PORT_SUSPEND: u32 = 1 << 2;
    /// ClearSuspendStatus
    pub const CLEAR_SUSPEND_STATUS: u32 = 1 << 3;
    /// SetPortReset
    pub const SET_PORT_RESET: u32 = 1 << 4;
    /// SetPortPower
    pub const SET_PORT_POWER: u32 = 1 << 8;
    /// ClearPortPower (LSDA 位置への書き込み)
    pub const CLEAR_PORT_POWER: u32 = 1 << 9;
}

// ============================================================================
// Register Access
// ============================================================================

/// ホストコントローラレジスタブロックへのアクセス
pub trait HcRegisters: Send + Sync {
    /// 32ビットレジスタを読み取り
    fn read32(&self, offset: usize) -> u32;
    /// 32ビットレジスタへ書き込み
    fn write32(&self, offset: usize, value: u32);

    /// 読み取り→変更→書き込み
    fn modify32(&self, offset: usize, f: impl FnOnce(u32) -> u32)
    where
        Self: Sized,
    {
        let value = self.read32(offset);
        self.write32(offset, f(value));
    }
}

/// MMIO によるレジスタアクセス
pub struct MmioRegisters {
    base: usize,
}

impl MmioRegisters {
    /// # Safety
    /// `base` はマップ済みの OHCI レジスタブロック（最低 0x54 + 4*NDP バイト）を
    /// 指していなければならない。
    pub unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl HcRegisters for MmioRegisters {
    fn read32(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}
