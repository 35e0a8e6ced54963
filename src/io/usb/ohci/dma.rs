// ============================================================================
// src/io/usb/ohci/dma.rs - DMA Regions, Buffers and the Platform Interface
// ============================================================================
//!
//! # DMA領域とOS抽象
//!
//! ハードウェアが参照するメモリは全てプラットフォームから `DmaRegion` として
//! 受け取る。領域はCPUポインタとバスアドレスの組を持つので、
//! 仮想↔バスアドレス変換は領域内オフセットの算術で済む。
//!
//! ## 所有権
//! `DmaBuffer` は転送要求に所有権ごと移動し、完了通知で呼び出し側に戻る。
//! 転送中はCPUからアクセスできない（型状態DMAバッファと同じ考え方）。

use core::ptr::NonNull;

use crate::error::HcdResult;

// ============================================================================
// DMA Region
// ============================================================================

/// DMAから見える連続メモリ領域
#[derive(Debug)]
pub struct DmaRegion {
    /// CPUから見たアドレス
    virt: NonNull<u8>,
    /// コントローラから見たバスアドレス
    bus: u32,
    /// バイト長
    len: usize,
}

// SAFETY: 領域は所有者（コントローラ/プール）だけが解放し、
// 内容へのアクセスは volatile で行う
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// # Safety
    /// `virt` から `len` バイトが有効で、`bus` からの同じ範囲に
    /// コントローラがアクセスできなければならない。
    pub unsafe fn new(virt: NonNull<u8>, bus: u32, len: usize) -> Self {
        Self { virt, bus, len }
    }

    pub fn virt(&self) -> NonNull<u8> {
        self.virt
    }

    pub fn bus(&self) -> u32 {
        self.bus
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 領域内オフセットのバスアドレス
    pub fn bus_of(&self, offset: usize) -> u32 {
        debug_assert!(offset <= self.len);
        self.bus + offset as u32
    }

    /// バスアドレスから領域内オフセットを逆引き
    pub fn offset_of(&self, bus: u32) -> Option<usize> {
        let offset = bus.checked_sub(self.bus)? as usize;
        (offset < self.len).then_some(offset)
    }

    /// バスアドレスからCPUポインタを逆引き
    pub fn virt_of(&self, bus: u32) -> Option<NonNull<u8>> {
        let offset = self.offset_of(bus)?;
        // SAFETY: offset < len
        Some(unsafe { self.virt.add(offset) })
    }

    /// 中身を取り出し、空の領域を残す（解放用）
    pub(crate) fn take(&mut self) -> Self {
        core::mem::replace(
            self,
            Self {
                virt: NonNull::dangling(),
                bus: 0,
                len: 0,
            },
        )
    }

    /// 領域全体をゼロクリア
    pub(crate) fn zero(&self) {
        unsafe { core::ptr::write_bytes(self.virt.as_ptr(), 0, self.len) }
    }
}

// ============================================================================
// DMA Buffer
// ============================================================================

/// 転送データ用DMAバッファ
///
/// コントローラのデータバッファプール、または呼び出し側が用意した
/// DMAメモリ（`from_raw`）のどちらか。
#[derive(Debug)]
pub struct DmaBuffer {
    virt: NonNull<u8>,
    bus: u32,
    len: usize,
    /// データバッファプールのスロット（プール由来の場合）
    pub(crate) pool_slot: Option<u16>,
}

unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    /// 外部DMAメモリからバッファを作成
    ///
    /// # Safety
    /// `virt`/`bus` は `len` バイトの同一メモリを指し、
    /// バッファが完了通知で返されるまで有効でなければならない。
    pub unsafe fn from_raw(virt: NonNull<u8>, bus: u32, len: usize) -> Self {
        Self {
            virt,
            bus,
            len,
            pool_slot: None,
        }
    }

    pub(crate) fn from_pool(virt: NonNull<u8>, bus: u32, len: usize, slot: u16) -> Self {
        Self {
            virt,
            bus,
            len,
            pool_slot: Some(slot),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 先頭バイトのバスアドレス
    pub fn bus(&self) -> u32 {
        self.bus
    }

    /// 長さを `len` 以下に縮める（プールバッファの使用長指定）
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_ptr(), self.len) }
    }
}

// ============================================================================
// Platform (OS abstraction)
// ============================================================================

/// コアが下位（OS抽象層）から利用するサービス
pub trait HcdPlatform: Send + Sync {
    /// ミリ秒遅延
    fn delay_ms(&self, ms: u32);

    /// マイクロ秒遅延
    fn delay_us(&self, us: u32);

    /// 割り込みハンドラを登録
    fn register_interrupt(&self, irq: u32) -> HcdResult<()>;

    /// 割り込みハンドラを解除
    fn unregister_interrupt(&self, irq: u32);

    /// DMAから見える領域を確保（`align` はバスアドレスにも適用される）
    fn dma_alloc(&self, size: usize, align: usize) -> Option<DmaRegion>;

    /// `dma_alloc` で得た領域を解放
    fn dma_free(&self, region: DmaRegion);
}
