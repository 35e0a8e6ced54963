// ============================================================================
// src/io/usb/ohci/descriptor.rs - ED/TD Hardware Formats
// ============================================================================
//!
//! # エンドポイント/転送ディスクリプタ
//!
//! ## Endpoint Descriptor (16バイト, 16バイト境界)
//! | ワード | 内容 |
//! |-------|------|
//! | 0 | FA[6:0] EN[10:7] D[12:11] S[13] K[14] F[15] MPS[26:16] |
//! | 1 | TailP (TD ポインタ) |
//! | 2 | HeadP (TD ポインタ) + C[1] + H[0] |
//! | 3 | NextED |
//!
//! ## General Transfer Descriptor (16バイト, 32バイトスロットに配置)
//! | ワード | 内容 |
//! |-------|------|
//! | 0 | R[18] DP[20:19] DI[23:21] T[25:24] EC[27:26] CC[31:28] |
//! | 1 | CurrentBufferPointer |
//! | 2 | NextTD |
//! | 3 | BufferEnd |
//!
//! ## Isochronous Transfer Descriptor (32バイト)
//! ワード0 は SF[15:0] DI[23:21] FC[26:24] CC[31:28]、ワード1 は BP0、
//! ワード4..7 は PSW0..PSW7 (各16ビット)。
//!
//! ハードウェアが並行して読み書きするため、アクセスは全て volatile。

use core::ptr::{self, NonNull};

use crate::io::usb::TransferError;

// ============================================================================
// Sizes
// ============================================================================

/// ED スロットサイズ
pub const ED_SIZE: usize = 16;
/// TD スロットサイズ（アイソクロナス TD が32バイトのため統一）
pub const TD_SIZE: usize = 32;

// ============================================================================
// ED Bits
// ============================================================================

pub const ED_FA_MASK: u32 = 0x7F;
pub const ED_EN_SHIFT: u32 = 7;
pub const ED_DIR_SHIFT: u32 = 11;
/// D = 00: 方向は TD から取得
pub const ED_DIR_FROM_TD: u32 = 0b00;
pub const ED_DIR_OUT: u32 = 0b01;
pub const ED_DIR_IN: u32 = 0b10;
pub const ED_LOW_SPEED: u32 = 1 << 13;
pub const ED_SKIP: u32 = 1 << 14;
pub const ED_ISO: u32 = 1 << 15;
pub const ED_MPS_SHIFT: u32 = 16;
pub const ED_MPS_MASK: u32 = 0x7FF;

/// HeadP.H: ハードウェアが停止させた
pub const ED_HALTED: u32 = 1 << 0;
/// HeadP.C: トグルキャリー
pub const ED_TOGGLE_CARRY: u32 = 1 << 1;
/// ポインタ部分
pub const ED_PTR_MASK: u32 = !0xF;

// ============================================================================
// TD Bits
// ============================================================================

pub const TD_ROUNDING: u32 = 1 << 18;
pub const TD_DP_SHIFT: u32 = 19;
pub const TD_DI_SHIFT: u32 = 21;
pub const TD_T_SHIFT: u32 = 24;
pub const TD_EC_SHIFT: u32 = 26;
pub const TD_CC_SHIFT: u32 = 28;

/// DelayInterrupt = 7: このTDでは割り込みを要求しない
pub const TD_DI_NONE: u8 = 7;

pub const ISO_FC_SHIFT: u32 = 24;
/// アイソクロナス TD 1つあたりの最大パケット数
pub const ISO_MAX_PACKETS: usize = 8;
/// PSW 初期値の CC (NotAccessed = 111x)
pub const PSW_NOT_ACCESSED: u16 = 0xE000;
pub const PSW_PAGE_SELECT: u16 = 1 << 12;
pub const PSW_SIZE_MASK: u16 = 0x7FF;

/// 1つの一般TDが扱える最大バイト数（2ページ）
pub const TD_MAX_SPAN: usize = 0x2000;
pub const PAGE_MASK: u32 = 0xFFF;

/// TD の PID (DP フィールド)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdPid {
    Setup = 0b00,
    Out = 0b01,
    In = 0b10,
}

/// TD のデータトグル指定 (T フィールド)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    /// ED のトグルキャリーを使用 (0x)
    Carry = 0b00,
    /// DATA0 (10)
    Data0 = 0b10,
    /// DATA1 (11)
    Data1 = 0b11,
}

/// 一般TDの制御ワードを構築（CC は NotAccessed で初期化）
pub fn td_control(pid: TdPid, toggle: Toggle, delay_interrupt: u8, rounding: bool) -> u32 {
    let mut control = ((pid as u32) << TD_DP_SHIFT)
        | (((delay_interrupt & 0x7) as u32) << TD_DI_SHIFT)
        | ((toggle as u32) << TD_T_SHIFT)
        | ((ConditionCode::NotAccessed as u32) << TD_CC_SHIFT);
    if rounding {
        control |= TD_ROUNDING;
    }
    control
}

/// アイソクロナスTDの制御ワードを構築
pub fn iso_td_control(start_frame: u16, frame_count: u8, delay_interrupt: u8) -> u32 {
    debug_assert!(frame_count >= 1 && frame_count as usize <= ISO_MAX_PACKETS);
    (start_frame as u32)
        | (((delay_interrupt & 0x7) as u32) << TD_DI_SHIFT)
        | ((((frame_count - 1) & 0x7) as u32) << ISO_FC_SHIFT)
        | ((ConditionCode::NotAccessed as u32) << TD_CC_SHIFT)
}

/// パケット開始アドレスの PSW オフセット
///
/// `bp0` と同じページならページ選択 0、次のページ（BE のページ）なら 1。
pub fn psw_offset(bp0: u32, addr: u32) -> u16 {
    let page_select = if (addr & !PAGE_MASK) != (bp0 & !PAGE_MASK) {
        PSW_PAGE_SELECT
    } else {
        0
    };
    PSW_NOT_ACCESSED | page_select | (addr & PAGE_MASK) as u16
}

// ============================================================================
// Condition Codes
// ============================================================================

/// OHCI コンディションコード (4ビット)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConditionCode {
    NoError = 0,
    Crc = 1,
    BitStuffing = 2,
    DataToggleMismatch = 3,
    Stall = 4,
    DeviceNotResponding = 5,
    PidCheckFailure = 6,
    UnexpectedPid = 7,
    DataOverrun = 8,
    DataUnderrun = 9,
    Reserved10 = 10,
    Reserved11 = 11,
    BufferOverrun = 12,
    BufferUnderrun = 13,
    NotAccessed = 14,
    NotAccessed2 = 15,
}

impl ConditionCode {
    /// 下位4ビットから変換
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0xF {
            0 => Self::NoError,
            1 => Self::Crc,
            2 => Self::BitStuffing,
            3 => Self::DataToggleMismatch,
            4 => Self::Stall,
            5 => Self::DeviceNotResponding,
            6 => Self::PidCheckFailure,
            7 => Self::UnexpectedPid,
            8 => Self::DataOverrun,
            9 => Self::DataUnderrun,
            10 => Self::Reserved10,
            11 => Self::Reserved11,
            12 => Self::BufferOverrun,
            13 => Self::BufferUnderrun,
            14 => Self::NotAccessed,
            _ => Self::NotAccessed2,
        }
    }

    /// TD 制御ワードから取得
    pub fn from_td_control(control: u32) -> Self {
        Self::from_bits((control >> TD_CC_SHIFT) as u8)
    }

    /// PSW から取得
    pub fn from_psw(psw: u16) -> Self {
        Self::from_bits((psw >> 12) as u8)
    }

    pub fn is_success(&self) -> bool {
        *self == Self::NoError
    }

    /// 要求レベルのエラーへ 1:1 で変換
    pub fn to_result(self) -> Result<(), TransferError> {
        let error = match self {
            Self::NoError => return Ok(()),
            Self::Crc => TransferError::Crc,
            Self::BitStuffing => TransferError::BitStuffing,
            Self::DataToggleMismatch => TransferError::DataToggleMismatch,
            Self::Stall => TransferError::Stall,
            Self::DeviceNotResponding => TransferError::DeviceNotResponding,
            Self::PidCheckFailure => TransferError::PidCheckFailure,
            Self::UnexpectedPid => TransferError::UnexpectedPid,
            Self::DataOverrun => TransferError::DataOverrun,
            Self::DataUnderrun => TransferError::DataUnderrun,
            Self::Reserved10 => TransferError::Reserved(10),
            Self::Reserved11 => TransferError::Reserved(11),
            Self::BufferOverrun => TransferError::BufferOverrun,
            Self::BufferUnderrun => TransferError::BufferUnderrun,
            Self::NotAccessed | Self::NotAccessed2 => TransferError::NotAccessed,
        };
        Err(error)
    }
}

// ============================================================================
// Volatile Views
// ============================================================================

/// DMA メモリ上の ED へのビュー
#[derive(Debug, Clone, Copy)]
pub struct HwEd {
    words: NonNull<u32>,
}

impl HwEd {
    const CONTROL: usize = 0;
    const TAIL_P: usize = 1;
    const HEAD_P: usize = 2;
    const NEXT_ED: usize = 3;

    /// # Safety
    /// `ptr` は16バイト境界の有効な ED スロットを指していなければならない。
    pub unsafe fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self { words: ptr.cast() }
    }

    #[inline]
    fn read(&self, word: usize) -> u32 {
        unsafe { ptr::read_volatile(self.words.as_ptr().add(word)) }
    }

    #[inline]
    fn write(&self, word: usize, value: u32) {
        unsafe { ptr::write_volatile(self.words.as_ptr().add(word), value) }
    }

    pub fn control(&self) -> u32 {
        self.read(Self::CONTROL)
    }

    pub fn set_control(&self, value: u32) {
        self.write(Self::CONTROL, value)
    }

    pub fn tail_p(&self) -> u32 {
        self.read(Self::TAIL_P)
    }

    pub fn set_tail_p(&self, value: u32) {
        self.write(Self::TAIL_P, value)
    }

    pub fn head_p(&self) -> u32 {
        self.read(Self::HEAD_P)
    }

    pub fn set_head_p(&self, value: u32) {
        self.write(Self::HEAD_P, value)
    }

    pub fn next_ed(&self) -> u32 {
        self.read(Self::NEXT_ED)
    }

    pub fn set_next_ed(&self, value: u32) {
        self.write(Self::NEXT_ED, value)
    }

    pub fn is_skipped(&self) -> bool {
        self.control() & ED_SKIP != 0
    }

    pub fn set_skip(&self, skip: bool) {
        let control = self.control();
        if skip {
            self.set_control(control | ED_SKIP);
        } else {
            self.set_control(control & !ED_SKIP);
        }
    }

    /// ハードウェアが停止させたか (HeadP.H)
    pub fn is_halted(&self) -> bool {
        self.head_p() & ED_HALTED != 0
    }

    pub fn clear(&self) {
        for word in 0..4 {
            self.write(word, 0);
        }
    }
}

/// DMA メモリ上の TD（一般/アイソクロナス共通）へのビュー
#[derive(Debug, Clone, Copy)]
pub struct HwTd {
    words: NonNull<u32>,
}

impl HwTd {
    const CONTROL: usize = 0;
    const CBP: usize = 1;
    const NEXT_TD: usize = 2;
    const BE: usize = 3;
    const PSW_BASE: usize = 4;

    /// # Safety
    /// `ptr` は32バイト境界の有効な TD スロットを指していなければならない。
    pub unsafe fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self { words: ptr.cast() }
    }

    #[inline]
    fn read(&self, word: usize) -> u32 {
        unsafe { ptr::read_volatile(self.words.as_ptr().add(word)) }
    }

    #[inline]
    fn write(&self, word: usize, value: u32) {
        unsafe { ptr::write_volatile(self.words.as_ptr().add(word), value) }
    }

    pub fn control(&self) -> u32 {
        self.read(Self::CONTROL)
    }

    pub fn set_control(&self, value: u32) {
        self.write(Self::CONTROL, value)
    }

    /// CurrentBufferPointer（アイソクロナスでは BP0）
    pub fn cbp(&self) -> u32 {
        self.read(Self::CBP)
    }

    pub fn set_cbp(&self, value: u32) {
        self.write(Self::CBP, value)
    }

    pub fn next_td(&self) -> u32 {
        self.read(Self::NEXT_TD)
    }

    pub fn set_next_td(&self, value: u32) {
        self.write(Self::NEXT_TD, value)
    }

    pub fn buffer_end(&self) -> u32 {
        self.read(Self::BE)
    }

    pub fn set_buffer_end(&self, value: u32) {
        self.write(Self::BE, value)
    }

    pub fn condition_code(&self) -> ConditionCode {
        ConditionCode::from_td_control(self.control())
    }

    /// PSW (Packet Status Word) を読み取り
    pub fn psw(&self, index: usize) -> u16 {
        debug_assert!(index < ISO_MAX_PACKETS);
        unsafe {
            let halfwords = self.words.as_ptr().add(Self::PSW_BASE).cast::<u16>();
            ptr::read_volatile(halfwords.add(index))
        }
    }

    pub fn set_psw(&self, index: usize, value: u16) {
        debug_assert!(index < ISO_MAX_PACKETS);
        unsafe {
            let halfwords = self.words.as_ptr().add(Self::PSW_BASE).cast::<u16>();
            ptr::write_volatile(halfwords.add(index), value)
        }
    }

    pub fn clear(&self) {
        for word in 0..(TD_SIZE / 4) {
            self.write(word, 0);
        }
    }
}
