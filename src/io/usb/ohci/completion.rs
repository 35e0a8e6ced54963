// ============================================================================
// src/io/usb/ohci/completion.rs - Done List Processing
// ============================================================================
//!
//! # 完了処理
//!
//! コントローラは処理を終えた TD を HCCA の Done Head に
//! 新しい順（LIFO）で連結して返す。ここでは
//!
//! 1. リストを反転して古い順に並べ、
//! 2. TD ごとにコンディションコードを記録し、
//! 3. 要求の最後の TD が回収され、かつ要求の全 TD が回収済みになった
//!    時点で要求を一度だけ完了させる。
//!
//! ## 短パケット
//! 丸めなし TD の短パケット (DataUnderrun) は IN 要求の正常終了。
//! ハードウェアが ED を停止させているので、要求の残り TD を
//! キューから外し、停止を解除する。
//! アイソクロナス IN のパケット単位の DataUnderrun も受信長付きの成功。

use alloc::vec::Vec;

use log::{error, warn};

use crate::error::HcdResult;
use crate::io::usb::{TransferDirection, TransferError};

use super::descriptor::{
    ConditionCode, ED_HALTED, ED_PTR_MASK, ED_TOGGLE_CARRY, PSW_SIZE_MASK,
};
use super::dma::DmaBuffer;
use super::endpoint::EndpointHandle;
use super::pause::EndpointPauseGuard;
use super::pool::{DescriptorArena, EdIndex, TdIndex};
use super::schedule::{Delivery, HwContext, Schedule, TdRecord, TdState};
use super::transfer::RequestId;
use super::vtrace;

// ============================================================================
// Completion Record
// ============================================================================

/// アイソクロナスパケット1個の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketStatus {
    /// 投入時は要求長、完了後は実転送長
    pub length: u16,
    pub result: Result<(), TransferError>,
}

/// 要求の完了通知
#[derive(Debug)]
pub struct Completion {
    pub request: RequestId,
    pub endpoint: EndpointHandle,
    /// 最初に観測したエラー（なければ成功）
    pub result: Result<(), TransferError>,
    /// データステージの実転送バイト数
    pub actual_length: usize,
    /// 投入時に渡したバッファ
    pub buffer: Option<DmaBuffer>,
    /// アイソクロナス要求のパケット別結果
    pub iso_packets: Vec<IsoPacketStatus>,
}

impl Completion {
    /// 成功なら実転送バイト数、失敗なら `HcdError::Transfer`
    pub fn status(&self) -> HcdResult<usize> {
        self.result?;
        Ok(self.actual_length)
    }
}

// ============================================================================
// Done List Reversal
// ============================================================================

/// Done List の NextTD リンクへのアクセス
pub(crate) trait DoneLinks {
    /// `td` の次（0 なら終端）。`td` が不正なら `None`
    fn next(&mut self, td: u32) -> Option<u32>;
    fn set_next(&mut self, td: u32, next: u32);
}

/// LIFO の Done List をその場で反転し、最も古い TD を返す
///
/// 不正なアドレスに当たったらそこで打ち切る。
pub(crate) fn reverse_done_list<L: DoneLinks>(links: &mut L, head: u32) -> u32 {
    let mut reversed = 0;
    let mut cursor = head & ED_PTR_MASK;
    while cursor != 0 {
        let Some(next) = links.next(cursor) else {
            error!("OHCI: done list contains invalid TD {:#x}", cursor);
            break;
        };
        links.set_next(cursor, reversed);
        reversed = cursor;
        cursor = next & ED_PTR_MASK;
    }
    reversed
}

struct ArenaLinks<'a>(&'a DescriptorArena);

impl DoneLinks for ArenaLinks<'_> {
    fn next(&mut self, td: u32) -> Option<u32> {
        let index = self.0.td_index_of(td)?;
        Some(self.0.td(index).next_td())
    }

    fn set_next(&mut self, td: u32, next: u32) {
        if let Some(index) = self.0.td_index_of(td) {
            self.0.td(index).set_next_td(next);
        }
    }
}

/// 回収した TD の転送バイト数
fn transferred_length(record: &TdRecord, cbp: u32) -> usize {
    if record.length == 0 {
        0
    } else if cbp == 0 {
        record.length as usize
    } else {
        cbp.wrapping_sub(record.buffer_start).min(record.length) as usize
    }
}

// ============================================================================
// Done List Processing
// ============================================================================

impl Schedule {
    /// Done Head から始まるリストを処理し、回収した TD 数を返す
    pub(crate) fn process_done_list(
        &mut self,
        hw: &HwContext<'_>,
        head: u32,
        deliveries: &mut Vec<Delivery>,
    ) -> usize {
        let mut cursor = reverse_done_list(&mut ArenaLinks(hw.tds), head);
        let mut retired = 0;
        while cursor != 0 && retired < self.tds.len() {
            let Some(td) = hw.tds.td_index_of(cursor) else {
                error!("OHCI: done list contains invalid TD {:#x}", cursor);
                break;
            };
            cursor = hw.tds.td(td).next_td() & ED_PTR_MASK;
            vtrace!(
                "OHCI: retire TD {:#x} cc={:?}",
                hw.tds.td_bus(td),
                hw.tds.td(td).condition_code()
            );
            self.retire_td(hw, td, deliveries);
            retired += 1;
        }
        retired
    }

    fn retire_td(&mut self, hw: &HwContext<'_>, td: TdIndex, deliveries: &mut Vec<Delivery>) {
        match self.tds[td.as_usize()].state {
            TdState::Pending => {}
            TdState::Cancelled => {
                self.free_td(hw, td);
                return;
            }
            other => {
                warn!(
                    "OHCI: done list returned TD {:#x} in state {:?}",
                    hw.tds.td_bus(td),
                    other
                );
                return;
            }
        }

        let hw_td = hw.tds.td(td);
        let cc = hw_td.condition_code();
        let record = self.tds[td.as_usize()].clone();
        self.tds[td.as_usize()].state = TdState::Completed(cc);

        let (Some(slot), Some(ed)) = (record.request, record.ed) else {
            self.free_td(hw, td);
            return;
        };
        let Some(request) = self.request_mut(slot) else {
            self.free_td(hw, td);
            return;
        };

        if let Some(iso) = record.iso {
            let direction = request.direction;
            let mut actual = 0;
            for k in 0..iso.packet_count as usize {
                let psw = hw_td.psw(k);
                let packet_cc = ConditionCode::from_psw(psw);
                let Some(packet) = request.iso_packets.get_mut(iso.first_packet as usize + k)
                else {
                    break;
                };
                packet.result = match (direction, packet_cc) {
                    (TransferDirection::In, ConditionCode::DataUnderrun) => Ok(()),
                    _ => packet_cc.to_result(),
                };
                packet.length = match (direction, packet_cc) {
                    (_, ConditionCode::NotAccessed | ConditionCode::NotAccessed2) => 0,
                    (TransferDirection::In, _) => psw & PSW_SIZE_MASK,
                    (TransferDirection::Out, ConditionCode::NoError) => packet.length,
                    (TransferDirection::Out, _) => 0,
                };
                actual += packet.length as usize;
            }
            request.actual += actual;
            // アイソクロナス ED はハードウェアに停止されない
            if let Err(e) = cc.to_result() {
                request.error.get_or_insert(e);
            }
        } else {
            if record.counts_length {
                request.actual += transferred_length(&record, hw_td.cbp());
            }
            let short_packet =
                cc == ConditionCode::DataUnderrun && request.direction == TransferDirection::In;
            if short_packet {
                self.end_halted_request(hw, ed, td, slot);
                let hw_ed = hw.eds.ed(ed);
                hw_ed.set_head_p(hw_ed.head_p() & !ED_HALTED);
                if let Some(list) = self.eds[ed.as_usize()].list() {
                    hw.enable_list(list, false);
                }
            } else if let Err(e) = cc.to_result() {
                if let Some(request) = self.request_mut(slot) {
                    request.error.get_or_insert(e);
                }
                self.eds[ed.as_usize()].halted = true;
                hw.eds.ed(ed).set_skip(true);
                warn!(
                    "OHCI: ED {:#x} halted with {:?}",
                    hw.eds.ed_bus(ed),
                    cc
                );
                self.end_halted_request(hw, ed, td, slot);
            }
        }

        self.complete_if_retired(hw, slot, deliveries);
    }

    /// 短パケット/エラーの TD が要求の途中なら、残り TD を取り除く
    fn end_halted_request(&mut self, hw: &HwContext<'_>, ed: EdIndex, td: TdIndex, slot: u16) {
        let Some(last) = self.request_mut(slot).and_then(|r| r.last_td) else {
            return;
        };
        if last == td {
            return;
        }
        // 停止中の ED はハードウェアが走査しないので待たずに書き換えられる
        match EndpointPauseGuard::from_halted(hw.eds, ed) {
            Some(guard) => self.end_request_early(hw, &guard, td, last, slot),
            None => warn!(
                "OHCI: ED {:#x} not halted after short/error TD",
                hw.eds.ed_bus(ed)
            ),
        }
    }

    /// 一時停止中の ED から `td` の後ろ `last` までを取り除き、`td` を要求の最後にする
    fn end_request_early(
        &mut self,
        hw: &HwContext<'_>,
        guard: &EndpointPauseGuard<'_>,
        td: TdIndex,
        last: TdIndex,
        slot: u16,
    ) {
        let ed = guard.index();

        let after_last = self.tds[last.as_usize()].next;
        let mut cursor = self.tds[td.as_usize()].next;
        while let Some(current) = cursor {
            let next = self.tds[current.as_usize()].next;
            self.free_td(hw, current);
            if current == last {
                break;
            }
            cursor = next;
        }
        self.tds[td.as_usize()].next = after_last;

        let hw_ed = hw.eds.ed(ed);
        let keep = hw_ed.head_p() & (ED_HALTED | ED_TOGGLE_CARRY);
        let next_bus = after_last.map_or(0, |n| hw.tds.td_bus(n));
        hw_ed.set_head_p(next_bus | keep);

        if let Some(request) = self.request_mut(slot) {
            request.last_td = Some(td);
        }
    }

    /// 要求の全 TD が回収済みなら TD を解放して完了させる
    fn complete_if_retired(&mut self, hw: &HwContext<'_>, slot: u16, deliveries: &mut Vec<Delivery>) {
        let Some(request) = self.request_mut(slot) else {
            return;
        };
        let (Some(first), Some(last)) = (request.first_td, request.last_td) else {
            return;
        };
        if !matches!(self.tds[last.as_usize()].state, TdState::Completed(_)) {
            return;
        }

        let mut cursor = first;
        let mut steps = 0;
        loop {
            if !matches!(self.tds[cursor.as_usize()].state, TdState::Completed(_)) {
                return;
            }
            if cursor == last {
                break;
            }
            steps += 1;
            match self.tds[cursor.as_usize()].next {
                Some(next) if steps < self.tds.len() => cursor = next,
                _ => {
                    error!("OHCI: request {} TD chain is broken", slot);
                    return;
                }
            }
        }

        let mut cursor = Some(first);
        while let Some(current) = cursor {
            cursor = self.tds[current.as_usize()].next;
            self.free_td(hw, current);
            if current == last {
                break;
            }
        }
        self.finish_request(slot, deliveries);
    }
}
