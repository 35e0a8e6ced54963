// ============================================================================
// src/io/usb/ohci/transfer.rs - Transfer Requests and TD Queueing
// ============================================================================
//!
//! # 転送要求
//!
//! 要求を TD 列に分解し、ED キューの末尾（番兵）へ追加する。
//!
//! ## 番兵TD方式
//! ED キューの最後の TD は常にハードウェアが処理しない番兵。
//! 追加時は新しい番兵を確保し、現在の番兵に内容を書き込んでから
//! TailP を新しい番兵へ進める。ハードウェアは HeadP == TailP を
//! 空キューと解釈するため、TailP の更新が公開点になる。
//!
//! ## TD 分割
//! 一般TD 1個は最大2ページ（8KB）をまたげる。最後以外の TD は
//! 最大パケットサイズの倍数に切り詰める。

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use log::{debug, warn};

use crate::error::{HcdError, HcdResult, HwOperation, PoolKind};
use crate::io::usb::{SetupPacket, TransferDirection, TransferError, TransferType};

use super::completion::{Completion, IsoPacketStatus};
use super::controller::OhciController;
use super::descriptor::{
    iso_td_control, psw_offset, td_control, TdPid, Toggle, ISO_MAX_PACKETS, PAGE_MASK,
    TD_DI_NONE, TD_MAX_SPAN,
};
use super::dma::{DmaBuffer, HcdPlatform};
use super::endpoint::{EndpointHandle, EndpointParams};
use super::pause;
use super::pool::{EdIndex, TdIndex};
use super::regs::HcRegisters;
use super::schedule::{
    HwContext, IsoTdInfo, ListKind, Notify, RequestRecord, RequestSlot, Schedule, TdRecord,
    TdState,
};
use super::vtrace;

/// SETUP パケット領域のスロットサイズ
pub const SETUP_PACKET_SIZE: usize = 8;

/// ASAP 指定のアイソクロナス要求を何フレーム先から始めるか
const ISO_START_DELAY: u16 = 2;

// ============================================================================
// Request Types
// ============================================================================

/// 投入済み要求の識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) u16);

/// 要求の種類と種類固有のパラメータ
#[derive(Debug)]
pub(crate) enum RequestKind {
    Control(SetupPacket),
    Bulk,
    Interrupt,
    Isochronous {
        frame_lengths: Vec<u16>,
        start_frame: Option<u16>,
    },
}

impl RequestKind {
    fn transfer_type(&self) -> TransferType {
        match self {
            RequestKind::Control(_) => TransferType::Control,
            RequestKind::Bulk => TransferType::Bulk,
            RequestKind::Interrupt => TransferType::Interrupt,
            RequestKind::Isochronous { .. } => TransferType::Isochronous,
        }
    }
}

/// 転送要求
#[derive(Debug)]
pub struct TransferRequest {
    endpoint: EndpointHandle,
    kind: RequestKind,
    buffer: Option<DmaBuffer>,
}

impl TransferRequest {
    /// コントロール転送（データステージ長は `setup.w_length`）
    pub fn control(endpoint: EndpointHandle, setup: SetupPacket, buffer: Option<DmaBuffer>) -> Self {
        Self {
            endpoint,
            kind: RequestKind::Control(setup),
            buffer,
        }
    }

    /// バルク転送（方向はエンドポイントに従う。長さ0も可）
    pub fn bulk(endpoint: EndpointHandle, buffer: DmaBuffer) -> Self {
        Self {
            endpoint,
            kind: RequestKind::Bulk,
            buffer: Some(buffer),
        }
    }

    /// インタラプト転送
    pub fn interrupt(endpoint: EndpointHandle, buffer: DmaBuffer) -> Self {
        Self {
            endpoint,
            kind: RequestKind::Interrupt,
            buffer: Some(buffer),
        }
    }

    /// アイソクロナス転送（1フレーム1パケット、バッファに連続配置）
    pub fn isochronous(endpoint: EndpointHandle, buffer: DmaBuffer, frame_lengths: Vec<u16>) -> Self {
        Self {
            endpoint,
            kind: RequestKind::Isochronous {
                frame_lengths,
                start_frame: None,
            },
            buffer: Some(buffer),
        }
    }

    /// アイソクロナス転送の開始フレームを指定
    pub fn with_start_frame(mut self, frame: u16) -> Self {
        if let RequestKind::Isochronous { start_frame, .. } = &mut self.kind {
            *start_frame = Some(frame);
        }
        self
    }

    pub fn endpoint(&self) -> EndpointHandle {
        self.endpoint
    }

    fn buffer_len(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.len())
    }

    pub(crate) fn pool_slot(&self) -> Option<u16> {
        self.buffer.as_ref().and_then(|b| b.pool_slot)
    }

    /// エンドポイントとの整合性を検証
    fn validate(&self, params: &EndpointParams) -> HcdResult<()> {
        if self.kind.transfer_type() != params.transfer_type {
            return Err(HcdError::InvalidParameter);
        }
        let len = self.buffer_len();
        if len > u32::MAX as usize / 2 {
            return Err(HcdError::InvalidParameter);
        }
        match &self.kind {
            RequestKind::Control(setup) if setup.w_length as usize > len => {
                Err(HcdError::InvalidParameter)
            }
            RequestKind::Isochronous { frame_lengths, .. } => {
                let total: usize = frame_lengths.iter().map(|&l| l as usize).sum();
                let oversized = frame_lengths.iter().any(|&l| l > params.max_packet_size);
                if frame_lengths.is_empty() || oversized || total == 0 || total > len {
                    return Err(HcdError::InvalidParameter);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

// ============================================================================
// TD Planning
// ============================================================================

/// TD 1個分の書き込み内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TdKind {
    General {
        pid: TdPid,
        toggle: Toggle,
        rounding: bool,
    },
    Isochronous {
        start_frame: u16,
        first_packet: u16,
        packet_count: u8,
        offsets: [u16; ISO_MAX_PACKETS],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TdPlan {
    pub kind: TdKind,
    pub buffer_start: u32,
    pub length: u32,
    /// 要求の転送長に数えるか
    pub counts_length: bool,
}

impl TdPlan {
    fn general(pid: TdPid, toggle: Toggle, rounding: bool, start: u32, length: u32, counts: bool) -> Self {
        Self {
            kind: TdKind::General {
                pid,
                toggle,
                rounding,
            },
            buffer_start: start,
            length,
            counts_length: counts,
        }
    }
}

fn data_pid(direction: TransferDirection) -> TdPid {
    match direction {
        TransferDirection::In => TdPid::In,
        TransferDirection::Out => TdPid::Out,
    }
}

/// バッファを一般TD 1個分ずつ (開始バスアドレス, 長さ) に分割
pub(crate) fn split_buffer(bus: u32, length: usize, max_packet_size: u16) -> Vec<(u32, u32)> {
    let mps = max_packet_size.max(1) as usize;
    let mut chunks = Vec::new();
    let mut offset = 0usize;
    while offset < length {
        let start = bus.wrapping_add(offset as u32);
        let span = TD_MAX_SPAN - (start & PAGE_MASK) as usize;
        let remaining = length - offset;
        let chunk = if remaining <= span {
            remaining
        } else {
            span / mps * mps
        };
        chunks.push((start, chunk as u32));
        offset += chunk;
    }
    chunks
}

/// バルク/インタラプト要求の TD 列
///
/// トグルは ED のキャリーに任せ、最後の IN TD だけ短パケットを許す。
pub(crate) fn plan_data(bus: u32, length: usize, mps: u16, direction: TransferDirection) -> Vec<TdPlan> {
    let pid = data_pid(direction);
    if length == 0 {
        return alloc::vec![TdPlan::general(pid, Toggle::Carry, false, 0, 0, true)];
    }
    let chunks = split_buffer(bus, length, mps);
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, (start, len))| {
            let rounding = direction == TransferDirection::In && i == last;
            TdPlan::general(pid, Toggle::Carry, rounding, start, len, true)
        })
        .collect()
}

/// コントロール要求の TD 列 (SETUP → DATA* → STATUS)
pub(crate) fn plan_control(setup_bus: u32, setup: &SetupPacket, data_bus: u32, mps: u16) -> Vec<TdPlan> {
    let mut plans = alloc::vec![TdPlan::general(
        TdPid::Setup,
        Toggle::Data0,
        false,
        setup_bus,
        SETUP_PACKET_SIZE as u32,
        false,
    )];

    let direction = setup.data_direction();
    let data_len = setup.w_length as usize;
    for (i, (start, len)) in split_buffer(data_bus, data_len, mps).into_iter().enumerate() {
        let toggle = if i == 0 { Toggle::Data1 } else { Toggle::Carry };
        plans.push(TdPlan::general(data_pid(direction), toggle, true, start, len, true));
    }

    let status_pid = if data_len > 0 && direction == TransferDirection::In {
        TdPid::Out
    } else {
        TdPid::In
    };
    plans.push(TdPlan::general(status_pid, Toggle::Data1, false, 0, 0, false));
    plans
}

/// アイソクロナス要求の TD 列
///
/// TD 1個は最大8パケット、かつ2ページ以内。パケットはバッファに連続配置。
pub(crate) fn plan_isochronous(bus: u32, frame_lengths: &[u16], start_frame: u16) -> Vec<TdPlan> {
    let mut plans = Vec::new();
    let mut packet = 0usize;
    let mut offset = 0u32;
    while packet < frame_lengths.len() {
        let td_start = bus.wrapping_add(offset);
        let bp0 = td_start & !PAGE_MASK;
        let mut offsets = [0u16; ISO_MAX_PACKETS];
        let mut count = 0usize;
        let mut td_len = 0u32;

        while packet + count < frame_lengths.len() && count < ISO_MAX_PACKETS {
            let len = frame_lengths[packet + count] as u32;
            let packet_start = td_start.wrapping_add(td_len);
            let end_page = packet_start.wrapping_add(len.max(1) - 1) & !PAGE_MASK;
            if count > 0 && end_page > bp0 + (PAGE_MASK + 1) {
                break;
            }
            offsets[count] = psw_offset(bp0, packet_start);
            td_len += len;
            count += 1;
        }

        plans.push(TdPlan {
            kind: TdKind::Isochronous {
                start_frame: start_frame.wrapping_add(packet as u16),
                first_packet: packet as u16,
                packet_count: count as u8,
                offsets,
            },
            buffer_start: td_start,
            length: td_len,
            counts_length: true,
        });
        packet += count;
        offset += td_len;
    }
    plans
}

// ============================================================================
// Queue Append Primitive
// ============================================================================

impl Schedule {
    /// 空の ED に最初の番兵を置く (HeadP == TailP、トグル DATA0)
    pub(crate) fn install_sentinel(&mut self, hw: &HwContext<'_>, ed: EdIndex) -> HcdResult<TdIndex> {
        let sentinel = self.alloc_td(hw, ed)?;
        let bus = hw.tds.td_bus(sentinel);
        let hw_ed = hw.eds.ed(ed);
        hw_ed.set_tail_p(bus);
        hw_ed.set_head_p(bus);
        self.eds[ed.as_usize()].tail = Some(sentinel);
        Ok(sentinel)
    }

    /// 現在の番兵 `tail` に `plan` を書き込み、`sentinel` を新しい番兵にする
    fn fill_td(
        &mut self,
        hw: &HwContext<'_>,
        ed: EdIndex,
        tail: TdIndex,
        sentinel: TdIndex,
        plan: &TdPlan,
        request: u16,
        delay_interrupt: u8,
    ) {
        let sentinel_bus = hw.tds.td_bus(sentinel);
        let td = hw.tds.td(tail);
        let mut iso = None;

        match plan.kind {
            TdKind::General {
                pid,
                toggle,
                rounding,
            } => {
                if plan.length == 0 {
                    td.set_cbp(0);
                    td.set_buffer_end(0);
                } else {
                    td.set_cbp(plan.buffer_start);
                    td.set_buffer_end(plan.buffer_start + plan.length - 1);
                }
                td.set_next_td(sentinel_bus);
                td.set_control(td_control(pid, toggle, delay_interrupt, rounding));
            }
            TdKind::Isochronous {
                start_frame,
                first_packet,
                packet_count,
                offsets,
            } => {
                td.set_cbp(plan.buffer_start & !PAGE_MASK);
                td.set_buffer_end(plan.buffer_start + plan.length.saturating_sub(1));
                td.set_next_td(sentinel_bus);
                for (i, &offset) in offsets.iter().enumerate().take(packet_count as usize) {
                    td.set_psw(i, offset);
                }
                td.set_control(iso_td_control(start_frame, packet_count, delay_interrupt));
                iso = Some(IsoTdInfo {
                    first_packet,
                    packet_count,
                });
            }
        }

        vtrace!(
            "OHCI: TD {:#x} ctrl={:#010x} len={} -> {:#x}",
            hw.tds.td_bus(tail),
            td.control(),
            plan.length,
            sentinel_bus
        );

        self.tds[tail.as_usize()] = TdRecord {
            state: TdState::Pending,
            ed: Some(ed),
            request: Some(request),
            next: Some(sentinel),
            buffer_start: plan.buffer_start,
            length: plan.length,
            counts_length: plan.counts_length,
            iso,
        };
        self.eds[ed.as_usize()].tail = Some(sentinel);

        // TD の内容を全て見せてから TailP で公開する
        fence(Ordering::Release);
        hw.eds.ed(ed).set_tail_p(sentinel_bus);
    }

    fn iso_start_frame(&self, hw: &HwContext<'_>, ed: EdIndex, requested: Option<u16>) -> u16 {
        if let Some(frame) = requested {
            return frame;
        }
        let now = pause::hw_frame_number(hw.regs);
        match self.eds[ed.as_usize()].next_iso_frame {
            Some(next) if (next.wrapping_sub(now) as i16) > 0 => next,
            _ => now.wrapping_add(ISO_START_DELAY),
        }
    }

    // ========================================================================
    // Submit
    // ========================================================================

    /// 要求を TD 列に分解してキューへ追加
    pub(crate) fn submit(
        &mut self,
        hw: &HwContext<'_>,
        request: TransferRequest,
        notify: Notify,
    ) -> HcdResult<RequestId> {
        let ed = self.open_ed(request.endpoint)?;
        let params = self.params(ed)?;
        if self.eds[ed.as_usize()].halted {
            return Err(HcdError::EndpointHalted);
        }
        request.validate(&params)?;
        let mut tail = self.eds[ed.as_usize()]
            .tail
            .ok_or(HcdError::InvalidEndpoint)?;

        let slot = self
            .request_pool
            .alloc()
            .ok_or(HcdError::Alloc(PoolKind::Request))?;

        let data_bus = request.buffer.as_ref().map_or(0, |b| b.bus());
        let data_len = request.buffer_len();
        let mut iso_frames = None;
        let (plans, direction) = match &request.kind {
            RequestKind::Control(setup) => {
                let setup_bus = hw.setup.bus(slot as usize);
                (
                    plan_control(setup_bus, setup, data_bus, params.max_packet_size),
                    setup.data_direction(),
                )
            }
            RequestKind::Bulk | RequestKind::Interrupt => (
                plan_data(data_bus, data_len, params.max_packet_size, params.direction),
                params.direction,
            ),
            RequestKind::Isochronous {
                frame_lengths,
                start_frame,
            } => {
                let start = self.iso_start_frame(hw, ed, *start_frame);
                iso_frames = Some((start, frame_lengths.len() as u16));
                (plan_isochronous(data_bus, frame_lengths, start), params.direction)
            }
        };

        // 全ての番兵を先に確保し、途中で枯渇しないようにする
        let mut sentinels = Vec::with_capacity(plans.len());
        if self.td_pool.free_count() >= plans.len() {
            for _ in 0..plans.len() {
                match self.alloc_td(hw, ed) {
                    Ok(td) => sentinels.push(td),
                    Err(_) => break,
                }
            }
        }
        if sentinels.len() < plans.len() {
            for td in sentinels {
                self.free_td(hw, td);
            }
            self.request_pool.free(slot);
            debug!("OHCI: request needs {} TDs, pool exhausted", plans.len());
            return Err(HcdError::Alloc(PoolKind::TransferDescriptor));
        }

        let TransferRequest { kind, buffer, .. } = request;
        let iso_packets = match kind {
            RequestKind::Control(setup) => {
                let bytes = setup.to_bytes();
                let dst = hw.setup.ptr(slot as usize).as_ptr();
                for (i, byte) in bytes.iter().enumerate() {
                    // SAFETY: セットアップ領域はスロットごとに8バイト確保済み
                    unsafe { core::ptr::write_volatile(dst.add(i), *byte) };
                }
                Vec::new()
            }
            RequestKind::Isochronous { frame_lengths, .. } => frame_lengths
                .into_iter()
                .map(|length| IsoPacketStatus {
                    length,
                    result: Err(TransferError::NotAccessed),
                })
                .collect(),
            _ => Vec::new(),
        };

        let isochronous = params.transfer_type == TransferType::Isochronous;
        self.requests[slot as usize] = RequestSlot::Active(RequestRecord {
            endpoint: ed,
            direction,
            isochronous,
            buffer,
            actual: 0,
            error: None,
            first_td: None,
            last_td: None,
            iso_packets,
            notify,
        });

        let count = plans.len();
        let mut first = None;
        let mut last = None;
        for (i, (plan, sentinel)) in plans.iter().zip(sentinels).enumerate() {
            let delay_interrupt = if i + 1 == count { 0 } else { TD_DI_NONE };
            self.fill_td(hw, ed, tail, sentinel, plan, slot, delay_interrupt);
            first.get_or_insert(tail);
            last = Some(tail);
            tail = sentinel;
        }

        if let Some(record) = self.request_mut(slot) {
            record.first_td = first;
            record.last_td = last;
        }
        if let Some((start, frames)) = iso_frames {
            self.eds[ed.as_usize()].next_iso_frame = Some(start.wrapping_add(frames));
        }
        hw.enable_list(ListKind::for_transfer(params.transfer_type), isochronous);

        vtrace!(
            "OHCI: request {} queued on ED {:#x} ({} TDs)",
            slot,
            hw.eds.ed_bus(ed),
            count
        );
        Ok(RequestId(slot))
    }
}

// ============================================================================
// Upward Interface
// ============================================================================

impl<R: HcRegisters, P: HcdPlatform> OhciController<R, P> {
    /// 要求を投入し、完了時に `on_complete` を呼ぶ
    ///
    /// コールバックは割り込み処理（または `poll`）の最後に、
    /// 内部ロックを解放した状態で呼ばれる。
    pub fn submit<F>(&self, request: TransferRequest, on_complete: F) -> HcdResult<RequestId>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.submit_with(request, Notify::Callback(Box::new(on_complete)))
    }

    fn submit_with(&self, request: TransferRequest, notify: Notify) -> HcdResult<RequestId> {
        let pool_slot = request.pool_slot();
        let result = self.queue_request(request, notify);
        if result.is_err() {
            // 受け取ったプールバッファは失敗時に返却する
            if let Some(slot) = pool_slot {
                self.buffer_pool.lock().free(slot);
            }
        }
        result
    }

    /// ハードウェアが処理中の ED なら一時停止してから TD を追加する
    ///
    /// 一時停止の待ちはスケジュールのロックの外で行う。他の操作が
    /// 一時停止を持っている間（コールバックからの再投入を含む）は
    /// 停止せずに追加する。
    fn queue_request(&self, request: TransferRequest, notify: Notify) -> HcdResult<RequestId> {
        let hw = self.hw();
        let (ed, list) = self.schedule.lock().endpoint_list(request.endpoint())?;

        let serial = if hw.is_current(list, ed) {
            self.endpoint_ops.try_lock()
        } else {
            None
        };
        let guard = serial.as_ref().map(|_| hw.pause(ed));

        let result = {
            let mut schedule = self.schedule.lock();
            let result = schedule.submit(&hw, request, notify);
            drop(guard);
            result
        };
        drop(serial);
        result
    }

    /// 要求を投入して完了まで待つ
    ///
    /// `control_timeout_ms` 以内に完了しなければエンドポイントを
    /// アボートし、`Timeout(Transfer)` を返す。
    pub fn submit_sync(&self, request: TransferRequest) -> HcdResult<Completion> {
        let endpoint = request.endpoint();
        let id = self.submit_with(request, Notify::Poll)?;

        let mut waited = 0;
        loop {
            self.poll();
            let parked = self.schedule.lock().take_parked(id);
            if let Some(completion) = parked {
                return Ok(completion);
            }
            if waited >= self.config.control_timeout_ms {
                break;
            }
            self.platform.delay_ms(1);
            waited += 1;
        }

        warn!("OHCI: request {} timed out after {} ms", id.0, waited);
        self.abort_with(endpoint, TransferError::Timeout)?;
        let parked = self.schedule.lock().take_parked(id);
        if let Some(buffer) = parked.and_then(|c| c.buffer) {
            self.free_buffer(buffer);
        }
        Err(HcdError::Timeout(HwOperation::Transfer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::usb::ohci::config::OhciConfig;
    use crate::io::usb::ohci::descriptor::{
        ED_PTR_MASK, TD_DI_SHIFT, TD_DP_SHIFT, TD_ROUNDING, TD_T_SHIFT,
    };
    use crate::io::usb::ohci::regs::{HcControl, HC_BULK_CURRENT_ED, HC_CONTROL, HC_FM_NUMBER};
    use crate::io::usb::ohci::sim::{started_controller, SimOutcome};
    use crate::io::usb::{DeviceAddress, EndpointAddress, UsbSpeed};
    use alloc::sync::Arc;
    use alloc::vec;
    use std::sync::Mutex;

    fn bulk_params(endpoint: EndpointAddress) -> EndpointParams {
        EndpointParams::bulk(DeviceAddress(1), endpoint, 64)
    }

    /// ED キュー上の TD 制御ワードを HeadP から TailP まで集める
    fn queued_controls<R: HcRegisters, P: HcdPlatform>(
        ctrl: &OhciController<R, P>,
        ep: EndpointHandle,
    ) -> Vec<u32> {
        let hw_ed = ctrl.ed_arena.ed(ep.index());
        let mut cursor = hw_ed.head_p() & ED_PTR_MASK;
        let mut controls = Vec::new();
        while cursor != hw_ed.tail_p() {
            let td = ctrl.td_arena.td_index_of(cursor).unwrap();
            controls.push(ctrl.td_arena.td(td).control());
            cursor = ctrl.td_arena.td(td).next_td() & ED_PTR_MASK;
        }
        controls
    }

    #[test]
    fn test_split_respects_pages_and_packets() {
        assert_eq!(split_buffer(0x10000, 130, 64), [(0x10000, 130)]);
        assert_eq!(
            split_buffer(0x10000, 20000, 64),
            [(0x10000, 8192), (0x12000, 8192), (0x14000, 3616)]
        );
        // ページ途中開始: 0x2000 - 0x10 = 8176 → 64の倍数 8128
        let chunks = split_buffer(0x10010, 9000, 64);
        assert_eq!(chunks[0], (0x10010, 8128));
        assert_eq!(chunks[1], (0x10010 + 8128, 872));
    }

    #[test]
    fn test_control_plan_stages() {
        let setup = SetupPacket::get_descriptor(1, 0, 18);
        let plans = plan_control(0x5000, &setup, 0x20000, 64);
        assert_eq!(plans.len(), 3);
        assert_eq!(
            plans[0].kind,
            TdKind::General {
                pid: TdPid::Setup,
                toggle: Toggle::Data0,
                rounding: false
            }
        );
        assert_eq!(
            plans[1].kind,
            TdKind::General {
                pid: TdPid::In,
                toggle: Toggle::Data1,
                rounding: true
            }
        );
        assert_eq!(
            plans[2].kind,
            TdKind::General {
                pid: TdPid::Out,
                toggle: Toggle::Data1,
                rounding: false
            }
        );
        assert!(!plans[0].counts_length && plans[1].counts_length && !plans[2].counts_length);

        // データなし: STATUS は IN
        let plans = plan_control(0x5000, &SetupPacket::set_address(DeviceAddress(3)), 0, 8);
        assert_eq!(plans.len(), 2);
        assert!(matches!(plans[1].kind, TdKind::General { pid: TdPid::In, .. }));
    }

    #[test]
    fn test_iso_plan_groups_packets() {
        let lengths = vec![100u16; 10];
        let plans = plan_isochronous(0x30000, &lengths, 500);
        assert_eq!(plans.len(), 2);
        match plans[0].kind {
            TdKind::Isochronous {
                start_frame,
                first_packet,
                packet_count,
                offsets,
            } => {
                assert_eq!((start_frame, first_packet, packet_count), (500, 0, 8));
                assert_eq!(offsets[1], psw_offset(0x30000, 0x30064));
            }
            _ => panic!("expected isochronous TD"),
        }
        assert_eq!(plans[0].length, 800);
        match plans[1].kind {
            TdKind::Isochronous {
                start_frame,
                first_packet,
                packet_count,
                ..
            } => assert_eq!((start_frame, first_packet, packet_count), (508, 8, 2)),
            _ => panic!("expected isochronous TD"),
        }
    }

    #[test]
    fn test_bulk_in_130_bytes() {
        let (ctrl, sim) = started_controller(OhciConfig::default());
        let ep = ctrl.open_endpoint(bulk_params(EndpointAddress::in_endpoint(1))).unwrap();
        let buffer = ctrl.alloc_buffer(130).unwrap();

        let done = Arc::new(Mutex::new(Vec::new()));
        let sink = done.clone();
        ctrl.submit(TransferRequest::bulk(ep, buffer), move |c| sink.lock().unwrap().push(c))
            .unwrap();

        let controls = queued_controls(&ctrl, ep);
        assert_eq!(controls.len(), 1);
        assert_eq!((controls[0] >> TD_DI_SHIFT) & 0x7, 0);
        assert_ne!(controls[0] & TD_ROUNDING, 0);
        assert_eq!((controls[0] >> TD_DP_SHIFT) & 0x3, TdPid::In as u32);
        assert!(HcControl::from_bits_retain(sim.reg(HC_CONTROL)).contains(HcControl::BLE));

        sim.run_frames(2);
        ctrl.poll();

        let mut done = done.lock().unwrap();
        assert_eq!(done.len(), 1);
        let completion = done.pop().unwrap();
        assert_eq!(completion.result, Ok(()));
        assert_eq!(completion.actual_length, 130);
        let data = completion.buffer.unwrap();
        assert_eq!(&data.as_slice()[..4], &[0, 1, 2, 3]);
    }

    #[test]
    fn test_large_request_interrupts_once() {
        let (ctrl, sim) = started_controller(OhciConfig::default());
        let ep = ctrl.open_endpoint(bulk_params(EndpointAddress::out_endpoint(2))).unwrap();
        let buffer = sim.dma_buffer(20000);

        let count = Arc::new(Mutex::new(0usize));
        let sink = count.clone();
        ctrl.submit(TransferRequest::bulk(ep, buffer), move |c| {
            assert_eq!(c.actual_length, 20000);
            *sink.lock().unwrap() += 1;
        })
        .unwrap();

        let controls = queued_controls(&ctrl, ep);
        assert_eq!(controls.len(), 3);
        let delays: Vec<u32> = controls.iter().map(|c| (c >> TD_DI_SHIFT) & 0x7).collect();
        assert_eq!(delays, [7, 7, 0]);
        // OUT は丸めない、トグルはキャリー
        assert!(controls.iter().all(|c| c & TD_ROUNDING == 0 && (c >> TD_T_SHIFT) & 0x3 == 0));

        sim.run_frames(3);
        ctrl.poll();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_zero_length_bulk() {
        let (ctrl, _sim) = started_controller(OhciConfig::default());
        let ep = ctrl.open_endpoint(bulk_params(EndpointAddress::out_endpoint(2))).unwrap();
        let buffer = ctrl.alloc_buffer(0).unwrap();
        ctrl.submit(TransferRequest::bulk(ep, buffer), |_| {}).unwrap();

        let hw_ed = ctrl.ed_arena.ed(ep.index());
        let td = ctrl.td_arena.td_index_of(hw_ed.head_p() & ED_PTR_MASK).unwrap();
        assert_eq!(ctrl.td_arena.td(td).cbp(), 0);
        assert_eq!(ctrl.td_arena.td(td).buffer_end(), 0);
    }

    #[test]
    fn test_control_transfer_sync() {
        let (ctrl, sim) = started_controller(OhciConfig::default());
        let ep = ctrl
            .open_endpoint(EndpointParams::control(DeviceAddress(0), UsbSpeed::Full, 64))
            .unwrap();
        let setup = SetupPacket::get_descriptor(1, 0, 18);
        let buffer = ctrl.alloc_buffer(64).unwrap();

        let completion = ctrl
            .submit_sync(TransferRequest::control(ep, setup, Some(buffer)))
            .unwrap();
        assert_eq!(completion.result, Ok(()));
        assert_eq!(completion.actual_length, 18);
        assert_eq!(sim.last_setup(), Some(setup.to_bytes()));
        ctrl.free_buffer(completion.buffer.unwrap());
    }

    #[test]
    fn test_short_packet_is_success() {
        let (ctrl, sim) = started_controller(OhciConfig::default());
        let ep = ctrl.open_endpoint(bulk_params(EndpointAddress::in_endpoint(1))).unwrap();
        let ed_bus = ctrl.ed_arena.ed_bus(ep.index());
        sim.push_outcome(ed_bus, SimOutcome::short(9, 50));

        let buffer = ctrl.alloc_buffer(256).unwrap();
        let completion = ctrl.submit_sync(TransferRequest::bulk(ep, buffer)).unwrap();
        assert_eq!(completion.result, Ok(()));
        assert_eq!(completion.actual_length, 50);
        assert!(!ctrl.is_halted(ep).unwrap());
    }

    #[test]
    fn test_short_packet_dequeues_remaining_tds() {
        let (ctrl, sim) = started_controller(OhciConfig::default());
        let ep = ctrl.open_endpoint(bulk_params(EndpointAddress::in_endpoint(1))).unwrap();
        let ed_bus = ctrl.ed_arena.ed_bus(ep.index());
        let before = ctrl.pool_usage();
        // 1個目の TD (丸めなし) で短パケット
        sim.push_outcome(ed_bus, SimOutcome::short(0, 100));

        let buffer = sim.dma_buffer(20000);
        let completion = ctrl.submit_sync(TransferRequest::bulk(ep, buffer)).unwrap();
        assert_eq!(completion.result, Ok(()));
        assert_eq!(completion.actual_length, 100);

        assert!(!ctrl.is_halted(ep).unwrap());
        let hw_ed = ctrl.ed_arena.ed(ep.index());
        assert_eq!(hw_ed.head_p() & ED_PTR_MASK, hw_ed.tail_p());
        assert_eq!(ctrl.pool_usage().tds_free, before.tds_free);

        // 後続の要求はそのまま流れる
        let buffer = ctrl.alloc_buffer(64).unwrap();
        let completion = ctrl.submit_sync(TransferRequest::bulk(ep, buffer)).unwrap();
        assert_eq!(completion.actual_length, 64);
    }

    #[test]
    fn test_sync_timeout_aborts() {
        let config = OhciConfig::default().with_control_timeout_ms(5);
        let (ctrl, sim) = started_controller(config);
        let ep = ctrl.open_endpoint(bulk_params(EndpointAddress::in_endpoint(1))).unwrap();
        sim.set_nak(ctrl.ed_arena.ed_bus(ep.index()), true);
        let before = ctrl.pool_usage();

        let buffer = ctrl.alloc_buffer(64).unwrap();
        assert!(matches!(
            ctrl.submit_sync(TransferRequest::bulk(ep, buffer)),
            Err(HcdError::Timeout(HwOperation::Transfer))
        ));
        assert_eq!(ctrl.pool_usage(), before);
    }

    #[test]
    fn test_validation_and_pool_exhaustion() {
        let config = OhciConfig::default()
            .with_max_endpoints(2)
            .with_max_transfer_descriptors(4);
        let (ctrl, sim) = started_controller(config);
        let ep = ctrl.open_endpoint(bulk_params(EndpointAddress::in_endpoint(1))).unwrap();
        let before = ctrl.pool_usage();

        // 種類の不一致
        let buffer = ctrl.alloc_buffer(8).unwrap();
        assert_eq!(
            ctrl.submit(TransferRequest::interrupt(ep, buffer), |_| {}),
            Err(HcdError::InvalidParameter)
        );
        assert_eq!(ctrl.pool_usage(), before);

        // 4 TD 必要だが空きは3
        let buffer = sim.dma_buffer(0x2000 * 3 + 1);
        assert_eq!(
            ctrl.submit(TransferRequest::bulk(ep, buffer), |_| {}),
            Err(HcdError::Alloc(PoolKind::TransferDescriptor))
        );
        assert_eq!(ctrl.pool_usage(), before);
    }

    #[test]
    fn test_append_pauses_current_endpoint() {
        let (ctrl, sim) = started_controller(OhciConfig::default());
        let ep = ctrl.open_endpoint(bulk_params(EndpointAddress::in_endpoint(1))).unwrap();
        let ed_bus = ctrl.ed_arena.ed_bus(ep.index());
        sim.set_nak(ed_bus, true);
        sim.set_reg(HC_BULK_CURRENT_ED, ed_bus);

        let frame = sim.reg(HC_FM_NUMBER);
        let buffer = ctrl.alloc_buffer(64).unwrap();
        ctrl.submit(TransferRequest::bulk(ep, buffer), |_| {}).unwrap();

        assert_ne!(sim.reg(HC_FM_NUMBER), frame);
        assert!(!ctrl.ed_arena.ed(ep.index()).is_skipped());
    }

    #[test]
    fn test_interrupt_transfer_on_periodic_list() {
        let (ctrl, sim) = started_controller(OhciConfig::default());
        let ep = ctrl
            .open_endpoint(EndpointParams::interrupt(
                DeviceAddress(2),
                EndpointAddress::in_endpoint(1),
                UsbSpeed::Low,
                8,
                4,
            ))
            .unwrap();
        let buffer = ctrl.alloc_buffer(8).unwrap();
        let done = Arc::new(Mutex::new(Vec::new()));
        let sink = done.clone();
        ctrl.submit(TransferRequest::interrupt(ep, buffer), move |c| {
            sink.lock().unwrap().push(c.actual_length)
        })
        .unwrap();

        sim.run_frames(6);
        ctrl.poll();
        assert_eq!(*done.lock().unwrap(), [8]);
    }

    #[test]
    fn test_isochronous_in_transfer() {
        let (ctrl, sim) = started_controller(OhciConfig::default());
        let ep = ctrl
            .open_endpoint(EndpointParams::isochronous(
                DeviceAddress(3),
                EndpointAddress::in_endpoint(1),
                192,
            ))
            .unwrap();
        let buffer = ctrl.alloc_buffer(192 * 3).unwrap();
        let done = Arc::new(Mutex::new(Vec::new()));
        let sink = done.clone();
        ctrl.submit(
            TransferRequest::isochronous(ep, buffer, vec![192, 192, 100]),
            move |c| sink.lock().unwrap().push(c),
        )
        .unwrap();

        sim.run_frames(6);
        ctrl.poll();

        let done = done.lock().unwrap();
        assert_eq!(done.len(), 1);
        let completion = &done[0];
        assert_eq!(completion.result, Ok(()));
        assert_eq!(completion.actual_length, 484);
        let lengths: Vec<u16> = completion.iso_packets.iter().map(|p| p.length).collect();
        assert_eq!(lengths, [192, 192, 100]);
        assert!(completion.iso_packets.iter().all(|p| p.result.is_ok()));
    }

    #[test]
    fn test_isochronous_short_in_packet_is_success() {
        let (ctrl, sim) = started_controller(OhciConfig::default());
        let ep = ctrl
            .open_endpoint(EndpointParams::isochronous(
                DeviceAddress(3),
                EndpointAddress::in_endpoint(2),
                192,
            ))
            .unwrap();
        let ed_bus = ctrl.ed_arena.ed_bus(ep.index());
        sim.push_outcome(ed_bus, SimOutcome::default());
        sim.push_outcome(ed_bus, SimOutcome::short(0, 50));
        sim.push_outcome(ed_bus, SimOutcome::default());

        let buffer = ctrl.alloc_buffer(192 * 3).unwrap();
        let done = Arc::new(Mutex::new(Vec::new()));
        let sink = done.clone();
        ctrl.submit(
            TransferRequest::isochronous(ep, buffer, vec![192, 192, 192]),
            move |c| sink.lock().unwrap().push(c),
        )
        .unwrap();

        sim.run_frames(6);
        ctrl.poll();

        let done = done.lock().unwrap();
        assert_eq!(done.len(), 1);
        let completion = &done[0];
        assert_eq!(completion.status(), Ok(434));
        let lengths: Vec<u16> = completion.iso_packets.iter().map(|p| p.length).collect();
        assert_eq!(lengths, [192, 50, 192]);
        assert!(completion.iso_packets.iter().all(|p| p.result == Ok(())));
    }

    #[test]
    fn test_sync_timeout_completes_queued_requests_with_timeout() {
        let config = OhciConfig::default().with_control_timeout_ms(3);
        let (ctrl, sim) = started_controller(config);
        let ep = ctrl.open_endpoint(bulk_params(EndpointAddress::in_endpoint(1))).unwrap();
        sim.set_nak(ctrl.ed_arena.ed_bus(ep.index()), true);

        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        ctrl.submit(TransferRequest::bulk(ep, sim.dma_buffer(64)), move |c| {
            sink.lock().unwrap().push(c.status())
        })
        .unwrap();

        let buffer = ctrl.alloc_buffer(64).unwrap();
        assert!(matches!(
            ctrl.submit_sync(TransferRequest::bulk(ep, buffer)),
            Err(HcdError::Timeout(HwOperation::Transfer))
        ));
        assert_eq!(
            *results.lock().unwrap(),
            [Err(HcdError::Transfer(TransferError::Timeout))]
        );
        assert!(!ctrl.is_halted(ep).unwrap());
    }
}
