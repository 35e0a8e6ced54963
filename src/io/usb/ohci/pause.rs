// ============================================================================
// src/io/usb/ohci/pause.rs - Endpoint Pause Protocol
// ============================================================================
//!
//! # エンドポイント一時停止プロトコル
//!
//! ハードウェアの DMA 走査と同期する唯一の手段。
//!
//! 1. ED のスキップビットを立てる
//! 2. 現在のフレーム番号を記録し、進むまで1ms単位でポーリング
//! 3. フレームが進めば、コントローラはスキップビットを観測済みで
//!    この ED のキューを新たに走査しない
//!
//! ED から到達できるディスクリプタの書き換えは、必ず
//! `EndpointPauseGuard` をスコープ内に持った状態で行う。
//! ガードのドロップでスキップビットを戻す。`resume` は停止 (H) も解除する。
//!
//! 待ちは `delay_ms` を繰り返すので、`IrqMutex` を保持したまま
//! 一時停止してはならない。
//!
//! フレームが進まなかった場合は警告ログのみで続行する（ベストエフォート）。

use core::marker::PhantomData;
use core::sync::atomic::{fence, Ordering};

use log::warn;

use crate::error::{HcdError, HcdResult, HwOperation};

use super::descriptor::{HwEd, ED_HALTED};
use super::dma::HcdPlatform;
use super::pool::{DescriptorArena, EdIndex};
use super::regs::{HcControl, HcRegisters, HC_CONTROL, HC_FM_NUMBER, HCFS_OPERATIONAL};

/// コントローラが Operational（リストを走査中）か
pub(crate) fn is_operational(regs: &dyn HcRegisters) -> bool {
    HcControl::from_bits_retain(regs.read32(HC_CONTROL)).functional_state() == HCFS_OPERATIONAL
}

/// 現在のハードウェアフレーム番号 (HcFmNumber 下位16ビット)
pub(crate) fn hw_frame_number(regs: &dyn HcRegisters) -> u16 {
    (regs.read32(HC_FM_NUMBER) & 0xFFFF) as u16
}

/// フレーム番号が進むまで待つ
///
/// Operational でなければコントローラはリストを走査しないので即座に成功。
pub(crate) fn wait_frame_advance(
    regs: &dyn HcRegisters,
    platform: &dyn HcdPlatform,
    retries: u32,
) -> HcdResult<()> {
    if !is_operational(regs) {
        return Ok(());
    }
    let start = hw_frame_number(regs);
    for _ in 0..retries {
        platform.delay_ms(1);
        if hw_frame_number(regs) != start {
            return Ok(());
        }
    }
    Err(HcdError::Timeout(HwOperation::FrameAdvance))
}

/// 一時停止中の ED を表す RAII ガード
pub struct EndpointPauseGuard<'a> {
    index: EdIndex,
    ed: HwEd,
    /// ドロップ時にスキップビットを戻すか
    resume_on_drop: bool,
    timed_out: bool,
    _arena: PhantomData<&'a DescriptorArena>,
}

impl<'a> EndpointPauseGuard<'a> {
    /// ED を一時停止する
    ///
    /// 既にスキップ中なら何もせず（ポーリングもしない）成功し、
    /// ドロップ時も再開しない。
    pub(crate) fn pause(
        arena: &'a DescriptorArena,
        index: EdIndex,
        regs: &dyn HcRegisters,
        platform: &dyn HcdPlatform,
        retries: u32,
    ) -> Self {
        let ed = arena.ed(index);
        if ed.is_skipped() {
            return Self {
                index,
                ed,
                resume_on_drop: false,
                timed_out: false,
                _arena: PhantomData,
            };
        }

        ed.set_skip(true);
        fence(Ordering::SeqCst);

        let timed_out = match wait_frame_advance(regs, platform, retries) {
            Ok(()) => false,
            Err(e) => {
                warn!(
                    "OHCI: {} while pausing ED {:#x}, proceeding",
                    e,
                    arena.ed_bus(index)
                );
                true
            }
        };

        Self {
            index,
            ed,
            resume_on_drop: true,
            timed_out,
            _arena: PhantomData,
        }
    }

    /// ハードウェアが既に停止 (HeadP.H) させた ED のガード
    ///
    /// 停止中の ED はコントローラが走査しないため待たない。
    pub(crate) fn from_halted(arena: &'a DescriptorArena, index: EdIndex) -> Option<Self> {
        let ed = arena.ed(index);
        ed.is_halted().then_some(Self {
            index,
            ed,
            resume_on_drop: false,
            timed_out: false,
            _arena: PhantomData,
        })
    }

    /// 一時停止中の ED
    pub(crate) fn index(&self) -> EdIndex {
        self.index
    }

    /// 既に一時停止されていて、このガードは何もしなかったか
    pub fn was_already_paused(&self) -> bool {
        !self.resume_on_drop
    }

    /// フレーム進行を確認できなかったか
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// 再開せずにガードを手放す（クローズ時）
    pub(crate) fn keep_paused(mut self) {
        self.resume_on_drop = false;
    }

    /// 停止ビットとスキップビットを外して再開する
    ///
    /// 誰が一時停止/停止させたかに関係なく再開する。トグルキャリーは保持。
    pub(crate) fn resume(mut self) {
        self.ed.set_head_p(self.ed.head_p() & !ED_HALTED);
        self.resume_on_drop = true;
    }
}

impl Drop for EndpointPauseGuard<'_> {
    fn drop(&mut self) {
        if self.resume_on_drop {
            // 書き換えを全て見せてからスキップを外す
            fence(Ordering::Release);
            self.ed.set_skip(false);
        }
    }
}
