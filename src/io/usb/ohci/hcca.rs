// ============================================================================
// src/io/usb/ohci/hcca.rs - Host Controller Communications Area
// ============================================================================
//!
//! HCCA: コントローラと共有する256バイト境界の固定レイアウト領域。
//!
//! | オフセット | 内容 |
//! |-----------|------|
//! | 0x00 | 割り込みテーブル (32 × ED ポインタ) |
//! | 0x80 | フレーム番号 (16ビット) + パディング |
//! | 0x84 | Done Head |
//! | 0x88 | 予約 (116バイト) |

use core::mem::{offset_of, size_of};
use core::ptr;

use super::dma::DmaRegion;

/// 割り込みテーブルのエントリ数（= 周期ツリーの葉の数）
pub const INTERRUPT_TABLE_SIZE: usize = 32;

/// HCCA のサイズとアラインメント
pub const HCCA_SIZE: usize = 256;
pub const HCCA_ALIGN: usize = 256;

/// HCCA のハードウェアレイアウト
#[repr(C, align(256))]
pub struct HccaLayout {
    pub interrupt_table: [u32; INTERRUPT_TABLE_SIZE],
    pub frame_number: u16,
    pub pad1: u16,
    pub done_head: u32,
    pub reserved: [u8; 116],
}

const _: () = assert!(size_of::<HccaLayout>() == HCCA_SIZE);
const _: () = assert!(offset_of!(HccaLayout, frame_number) == 0x80);
const _: () = assert!(offset_of!(HccaLayout, done_head) == 0x84);

/// DMA 領域上の HCCA
pub struct Hcca {
    region: DmaRegion,
}

impl Hcca {
    /// 確保済み領域を HCCA として初期化（ゼロクリア）
    pub fn new(region: DmaRegion) -> Self {
        debug_assert!(region.len() >= HCCA_SIZE);
        debug_assert_eq!(region.bus() as usize % HCCA_ALIGN, 0);
        region.zero();
        Self { region }
    }

    /// HcHCCA に書くバスアドレス
    pub fn bus(&self) -> u32 {
        self.region.bus()
    }

    fn layout(&self) -> *mut HccaLayout {
        self.region.virt().as_ptr().cast()
    }

    pub fn set_interrupt_entry(&self, index: usize, ed_bus: u32) {
        unsafe {
            let table = ptr::addr_of_mut!((*self.layout()).interrupt_table);
            ptr::write_volatile(table.cast::<u32>().add(index), ed_bus);
        }
    }

    pub fn interrupt_entry(&self, index: usize) -> u32 {
        unsafe {
            let table = ptr::addr_of!((*self.layout()).interrupt_table);
            ptr::read_volatile(table.cast::<u32>().add(index))
        }
    }

    /// コントローラが書き込んだ現在のフレーム番号
    pub fn frame_number(&self) -> u16 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.layout()).frame_number)) }
    }

    /// Done Head を読み取り、0 に戻す
    ///
    /// 下位ビット0 は「他の割り込みも保留中」を示すため取り除く。
    pub fn take_done_head(&self) -> u32 {
        unsafe {
            let field = ptr::addr_of_mut!((*self.layout()).done_head);
            let head = ptr::read_volatile(field);
            ptr::write_volatile(field, 0);
            head & !0xF
        }
    }

    pub(crate) fn take_region(&mut self) -> DmaRegion {
        self.region.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        assert_eq!(offset_of!(HccaLayout, interrupt_table), 0x00);
        assert_eq!(offset_of!(HccaLayout, frame_number), 0x80);
        assert_eq!(offset_of!(HccaLayout, done_head), 0x84);
        assert_eq!(core::mem::align_of::<HccaLayout>(), 256);
    }
}
