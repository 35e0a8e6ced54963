// ============================================================================
// src/io/usb/ohci/pool.rs - Fixed-Capacity Descriptor Pools
// ============================================================================
//!
//! # ディスクリプタプール
//!
//! 初期化時に一度だけ確保し、以後サイズを変えない固定容量プール。
//!
//! - `DescriptorArena`: DMA 領域を等間隔スロットに分割したアリーナ。
//!   インデックス↔バスアドレスの変換は O(1) の算術で、
//!   Done List から返るバスアドレスを直接ソフトウェアレコードへ引ける。
//! - `SlotPool`: インデックスのフリーリスト。容量分を事前確保するため
//!   割り当て/解放でヒープ確保は発生しない。

use alloc::vec::Vec;
use core::ptr::NonNull;

use super::descriptor::{HwEd, HwTd};
use super::dma::DmaRegion;

// ============================================================================
// Type-Safe Indices
// ============================================================================

/// ED アリーナのスロット番号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdIndex(pub u16);

impl EdIndex {
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// TD アリーナのスロット番号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TdIndex(pub u16);

impl TdIndex {
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

// ============================================================================
// Slot Pool
// ============================================================================

/// 固定容量のスロットフリーリスト
pub struct SlotPool {
    free: Vec<u16>,
    capacity: usize,
}

impl SlotPool {
    /// `first..first+count` のスロットを持つプールを作成
    pub fn new(first: u16, count: u16) -> Self {
        let mut free = Vec::with_capacity(count as usize);
        // 小さい番号から払い出すため逆順に積む
        free.extend((first..first + count).rev());
        Self {
            free,
            capacity: count as usize,
        }
    }

    pub fn alloc(&mut self) -> Option<u16> {
        self.free.pop()
    }

    pub fn free(&mut self, slot: u16) {
        debug_assert!(self.free.len() < self.capacity);
        debug_assert!(!self.free.contains(&slot), "double free of slot {}", slot);
        self.free.push(slot);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ============================================================================
// Descriptor Arena
// ============================================================================

/// DMA 領域上の等間隔スロット配列
pub struct DescriptorArena {
    region: DmaRegion,
    stride: usize,
    count: usize,
}

impl DescriptorArena {
    /// 領域をゼロクリアしてアリーナを作成
    pub fn new(region: DmaRegion, stride: usize, count: usize) -> Self {
        debug_assert!(region.len() >= stride * count);
        region.zero();
        Self {
            region,
            stride,
            count,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// スロットのバスアドレス
    pub fn bus(&self, index: usize) -> u32 {
        debug_assert!(index < self.count);
        self.region.bus_of(index * self.stride)
    }

    /// スロットのCPUポインタ
    pub fn ptr(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.count);
        // SAFETY: index < count なので領域内
        unsafe { self.region.virt().add(index * self.stride) }
    }

    /// バスアドレスからスロット番号を逆引き（O(1)）
    ///
    /// 範囲外やスロット境界に揃っていないアドレスは `None`。
    pub fn index_of(&self, bus: u32) -> Option<usize> {
        let offset = self.region.offset_of(bus)?;
        if offset % self.stride != 0 {
            return None;
        }
        let index = offset / self.stride;
        (index < self.count).then_some(index)
    }

    pub fn ed(&self, index: EdIndex) -> HwEd {
        // SAFETY: ED アリーナのスロットは16バイト境界
        unsafe { HwEd::from_ptr(self.ptr(index.as_usize())) }
    }

    pub fn td(&self, index: TdIndex) -> HwTd {
        // SAFETY: TD アリーナのスロットは32バイト境界
        unsafe { HwTd::from_ptr(self.ptr(index.as_usize())) }
    }

    pub fn ed_bus(&self, index: EdIndex) -> u32 {
        self.bus(index.as_usize())
    }

    pub fn td_bus(&self, index: TdIndex) -> u32 {
        self.bus(index.as_usize())
    }

    pub fn td_index_of(&self, bus: u32) -> Option<TdIndex> {
        self.index_of(bus).map(|i| TdIndex(i as u16))
    }

    pub fn ed_index_of(&self, bus: u32) -> Option<EdIndex> {
        self.index_of(bus).map(|i| EdIndex(i as u16))
    }

    pub(crate) fn take_region(&mut self) -> DmaRegion {
        self.region.take()
    }
}
