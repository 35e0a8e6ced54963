// ============================================================================
// src/io/usb/ohci/endpoint.rs - Endpoint (Pipe) Manager
// ============================================================================
//!
//! # エンドポイント管理
//!
//! ED の生成/破棄と、3つの論理リスト（コントロール、バルク、周期ツリー）への
//! 連結/切り離しを担当する。
//!
//! ## クローズ手順
//! 1. 新しい要求の受け付けを止め、該当リストの処理スイッチを切る
//! 2. ED を一時停止し、残っている要求をアボート
//! 3. リストから切り離す（先頭 / 途中 / 見つからない）
//! 4. 1フレーム待ってハードウェアの参照が消えてから番兵TDとEDを解放
//! 5. 処理スイッチを戻す
//!
//! フレーム待ち（2 と 4）は `IrqMutex<Schedule>` を解放して行う。
//! クローズとアボートは `endpoint_ops` で直列化する。

use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use log::{debug, error, warn};

use crate::error::{HcdError, HcdResult, PoolKind};
use crate::io::usb::{
    DeviceAddress, EndpointAddress, TransferDirection, TransferError, TransferType, UsbSpeed,
};

use super::controller::{deliver, OhciController};
use super::descriptor::{
    ED_DIR_FROM_TD, ED_DIR_IN, ED_DIR_OUT, ED_DIR_SHIFT, ED_EN_SHIFT, ED_FA_MASK, ED_HALTED,
    ED_ISO, ED_LOW_SPEED, ED_MPS_MASK, ED_MPS_SHIFT, ED_PTR_MASK, ED_TOGGLE_CARRY,
};
use super::dma::HcdPlatform;
use super::pause::{self, EndpointPauseGuard};
use super::periodic::{self, bandwidth_cost, clamp_interval};
use super::pool::{EdIndex, TdIndex};
use super::regs::{HcControl, HcRegisters, HC_BULK_HEAD_ED, HC_CONTROL_HEAD_ED};
use super::schedule::{Delivery, EdRecord, HwContext, ListKind, RequestSlot, Schedule, TdState};

/// ハードウェア最大パケットサイズ（USB 1.1 アイソクロナス上限）
pub const MAX_PACKET_SIZE_LIMIT: u16 = 1023;

// ============================================================================
// Endpoint Parameters
// ============================================================================

/// エンドポイントのオープンパラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointParams {
    /// デバイスアドレス
    pub address: DeviceAddress,
    /// エンドポイント番号 (0-15)
    pub number: u8,
    /// 転送方向（コントロールでは TD ごとに決まるため無視）
    pub direction: TransferDirection,
    /// 転送タイプ
    pub transfer_type: TransferType,
    /// デバイス速度
    pub speed: UsbSpeed,
    /// 最大パケットサイズ
    pub max_packet_size: u16,
    /// ポーリング間隔 (ms、インタラプトのみ)
    pub interval: u8,
}

impl EndpointParams {
    /// コントロールエンドポイント
    pub fn control(address: DeviceAddress, speed: UsbSpeed, max_packet_size: u16) -> Self {
        Self {
            address,
            number: 0,
            direction: TransferDirection::Out,
            transfer_type: TransferType::Control,
            speed,
            max_packet_size,
            interval: 0,
        }
    }

    /// バルクエンドポイント（フルスピードのみ）
    pub fn bulk(address: DeviceAddress, endpoint: EndpointAddress, max_packet_size: u16) -> Self {
        Self {
            address,
            number: endpoint.number(),
            direction: endpoint.direction(),
            transfer_type: TransferType::Bulk,
            speed: UsbSpeed::Full,
            max_packet_size,
            interval: 0,
        }
    }

    /// インタラプトエンドポイント
    pub fn interrupt(
        address: DeviceAddress,
        endpoint: EndpointAddress,
        speed: UsbSpeed,
        max_packet_size: u16,
        interval: u8,
    ) -> Self {
        Self {
            address,
            number: endpoint.number(),
            direction: endpoint.direction(),
            transfer_type: TransferType::Interrupt,
            speed,
            max_packet_size,
            interval,
        }
    }

    /// アイソクロナスエンドポイント（毎フレーム）
    pub fn isochronous(
        address: DeviceAddress,
        endpoint: EndpointAddress,
        max_packet_size: u16,
    ) -> Self {
        Self {
            address,
            number: endpoint.number(),
            direction: endpoint.direction(),
            transfer_type: TransferType::Isochronous,
            speed: UsbSpeed::Full,
            max_packet_size,
            interval: 1,
        }
    }

    /// パラメータの妥当性を検証
    pub fn validate(&self) -> HcdResult<()> {
        if !self.address.is_valid() || self.number > 15 {
            return Err(HcdError::InvalidParameter);
        }
        if self.max_packet_size == 0 || self.max_packet_size > MAX_PACKET_SIZE_LIMIT {
            return Err(HcdError::InvalidParameter);
        }
        if self.speed == UsbSpeed::Low {
            // ロースピードはコントロール/インタラプトのみ、8バイトまで
            if matches!(
                self.transfer_type,
                TransferType::Bulk | TransferType::Isochronous
            ) || self.max_packet_size > 8
            {
                return Err(HcdError::InvalidParameter);
            }
        }
        Ok(())
    }

    /// ED 制御ワード (FA/EN/D/S/F/MPS)
    pub fn ed_control(&self) -> u32 {
        let direction = match (self.transfer_type, self.direction) {
            (TransferType::Control, _) => ED_DIR_FROM_TD,
            (_, TransferDirection::In) => ED_DIR_IN,
            (_, TransferDirection::Out) => ED_DIR_OUT,
        };
        let mut control = (self.address.as_u8() as u32 & ED_FA_MASK)
            | ((self.number as u32 & 0xF) << ED_EN_SHIFT)
            | (direction << ED_DIR_SHIFT)
            | ((self.max_packet_size as u32 & ED_MPS_MASK) << ED_MPS_SHIFT);
        if self.speed == UsbSpeed::Low {
            control |= ED_LOW_SPEED;
        }
        if self.transfer_type == TransferType::Isochronous {
            control |= ED_ISO;
        }
        control
    }
}

/// オープン中のエンドポイントのハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointHandle(u16);

impl EndpointHandle {
    pub(crate) fn from_index(index: EdIndex) -> Self {
        Self(index.0)
    }

    pub(crate) fn index(&self) -> EdIndex {
        EdIndex(self.0)
    }
}

// ============================================================================
// Flat Lists (Control / Bulk)
// ============================================================================

/// 先頭レジスタで始まる単純リスト
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlatList {
    Control,
    Bulk,
}

impl FlatList {
    pub fn from_list(list: ListKind) -> Option<Self> {
        match list {
            ListKind::Control => Some(FlatList::Control),
            ListKind::Bulk => Some(FlatList::Bulk),
            ListKind::Periodic => None,
        }
    }

    fn head_register(&self) -> usize {
        match self {
            FlatList::Control => HC_CONTROL_HEAD_ED,
            FlatList::Bulk => HC_BULK_HEAD_ED,
        }
    }

    fn kind(&self) -> ListKind {
        match self {
            FlatList::Control => ListKind::Control,
            FlatList::Bulk => ListKind::Bulk,
        }
    }
}

impl Schedule {
    fn flat_head(&mut self, list: FlatList) -> &mut Option<EdIndex> {
        match list {
            FlatList::Control => &mut self.control_head,
            FlatList::Bulk => &mut self.bulk_head,
        }
    }

    /// リスト末尾に連結
    pub(crate) fn link_flat(&mut self, hw: &HwContext<'_>, list: FlatList, ed: EdIndex) {
        self.eds[ed.as_usize()].next = None;
        hw.eds.ed(ed).set_next_ed(0);
        fence(Ordering::Release);

        let Some(mut tail) = *self.flat_head(list) else {
            *self.flat_head(list) = Some(ed);
            hw.regs.write32(list.head_register(), hw.eds.ed_bus(ed));
            return;
        };
        while let Some(next) = self.eds[tail.as_usize()].next {
            tail = next;
        }
        self.eds[tail.as_usize()].next = Some(ed);
        hw.eds.ed(tail).set_next_ed(hw.eds.ed_bus(ed));
    }

    /// リストから切り離す（先頭 / 途中 / 見つからなければ何もしない）
    pub(crate) fn unlink_flat(&mut self, hw: &HwContext<'_>, list: FlatList, ed: EdIndex) -> bool {
        let next = self.eds[ed.as_usize()].next;
        let next_bus = next.map_or(0, |n| hw.eds.ed_bus(n));

        let head = *self.flat_head(list);
        if head == Some(ed) {
            *self.flat_head(list) = next;
            hw.regs.write32(list.head_register(), next_bus);
        } else {
            let Some(mut prev) = head else {
                return false;
            };
            loop {
                match self.eds[prev.as_usize()].next {
                    Some(n) if n == ed => break,
                    Some(n) => prev = n,
                    None => return false,
                }
            }
            self.eds[prev.as_usize()].next = next;
            hw.eds.ed(prev).set_next_ed(next_bus);
        }

        // 処理中レジスタがこの ED を指したままなら外す
        let kind = list.kind();
        if hw.is_current(kind, ed) {
            hw.regs.write32(kind.current_ed_register(), 0);
        }
        self.eds[ed.as_usize()].next = None;
        true
    }

    // ========================================================================
    // Open / Close
    // ========================================================================

    /// ED を確保し、番兵TDを入れて該当リストに連結
    pub(crate) fn open_endpoint(
        &mut self,
        hw: &HwContext<'_>,
        params: EndpointParams,
    ) -> HcdResult<EdIndex> {
        params.validate()?;

        let slot = self
            .ed_pool
            .alloc()
            .ok_or(HcdError::Alloc(PoolKind::EndpointDescriptor))?;
        let ed = EdIndex(slot);
        let hw_ed = hw.eds.ed(ed);
        hw_ed.clear();
        hw_ed.set_control(params.ed_control());
        self.eds[ed.as_usize()] = EdRecord {
            params: Some(params),
            ..EdRecord::empty()
        };

        if let Err(e) = self.install_sentinel(hw, ed) {
            self.release_ed(hw, ed);
            return Err(e);
        }

        let list = ListKind::for_transfer(params.transfer_type);
        match FlatList::from_list(list) {
            Some(flat) => self.link_flat(hw, flat, ed),
            None => {
                let isochronous = params.transfer_type == TransferType::Isochronous;
                let interval = if isochronous {
                    1
                } else {
                    clamp_interval(params.interval)
                };
                let cost = bandwidth_cost(params.max_packet_size, params.speed, isochronous);
                let Some(group) =
                    self.tree
                        .select_group(interval, cost, hw.config.bandwidth_ceiling)
                else {
                    debug!(
                        "OHCI: no bandwidth for {:?} endpoint (interval {} ms, cost {})",
                        params.transfer_type, interval, cost
                    );
                    self.release_ed(hw, ed);
                    return Err(HcdError::NoBandwidth);
                };

                self.tree.charge(interval, group, cost);
                let record = &mut self.eds[ed.as_usize()];
                record.interval = interval;
                record.branch = group;
                record.bandwidth = cost;
                periodic::link(&mut self.eds, hw.eds, interval, group, ed);
            }
        }

        debug!(
            "OHCI: opened {:?} endpoint {}:{} as ED {:#x}",
            params.transfer_type,
            params.address.as_u8(),
            params.number,
            hw.eds.ed_bus(ed)
        );
        Ok(ed)
    }

    /// 番兵TDと ED をプールへ戻す（リストからは切り離し済みであること）
    fn release_ed(&mut self, hw: &HwContext<'_>, ed: EdIndex) {
        if let Some(sentinel) = self.eds[ed.as_usize()].tail.take() {
            self.free_td(hw, sentinel);
        }
        hw.eds.ed(ed).clear();
        self.eds[ed.as_usize()] = EdRecord::empty();
        self.ed_pool.free(ed.0);
    }

    /// クローズ開始: 以降の要求を拒否し、リスト処理スイッチを切る
    pub(crate) fn begin_close(
        &mut self,
        hw: &HwContext<'_>,
        ed: EdIndex,
    ) -> HcdResult<(EndpointParams, HcControl)> {
        let params = self.params(ed)?;
        self.eds[ed.as_usize()].closing = true;
        let disabled = hw.disable_list(ListKind::for_transfer(params.transfer_type));
        Ok((params, disabled))
    }

    /// 一時停止中の ED の要求をアボートし、リストから切り離す
    pub(crate) fn detach_endpoint(
        &mut self,
        hw: &HwContext<'_>,
        guard: &EndpointPauseGuard<'_>,
        deliveries: &mut Vec<Delivery>,
    ) {
        let ed = guard.index();
        self.drain_endpoint(hw, guard, TransferError::Aborted, deliveries);

        let record = &self.eds[ed.as_usize()];
        let Some(list) = record.list() else {
            return;
        };
        let (interval, branch, bandwidth) = (record.interval, record.branch, record.bandwidth);
        let unlinked = match FlatList::from_list(list) {
            Some(flat) => self.unlink_flat(hw, flat, ed),
            None => {
                let unlinked = periodic::unlink(&mut self.eds, hw.eds, interval, branch, ed);
                if unlinked {
                    self.tree.release(interval, branch, bandwidth);
                }
                unlinked
            }
        };
        if !unlinked {
            error!("OHCI: ED {:#x} was not on its list", hw.eds.ed_bus(ed));
        }
    }

    /// 切り離し済みの ED を解放し、処理スイッチを戻す
    pub(crate) fn finish_close(&mut self, hw: &HwContext<'_>, ed: EdIndex, disabled: HcControl) {
        self.release_ed(hw, ed);
        hw.restore_list(disabled);
    }

    // ========================================================================
    // Drain (Abort)
    // ========================================================================

    /// 一時停止中の ED から全ての TD を取り除き、要求を `error` で完了させる
    ///
    /// - ハードウェアキューに残る TD: その場で解放
    /// - 既に回収されて Done List 配送待ちの TD: Cancelled にして後で解放
    /// - 回収済みで要求の完了待ちの TD: その場で解放
    pub(crate) fn drain_endpoint(
        &mut self,
        hw: &HwContext<'_>,
        guard: &EndpointPauseGuard<'_>,
        error: TransferError,
        deliveries: &mut Vec<Delivery>,
    ) {
        let ed = guard.index();
        let Some(tail) = self.eds[ed.as_usize()].tail else {
            return;
        };
        let tail_bus = hw.tds.td_bus(tail);
        let hw_ed = hw.eds.ed(ed);

        let mut cursor = hw_ed.head_p() & ED_PTR_MASK;
        let mut budget = self.tds.len();
        while cursor != tail_bus {
            let Some(td) = hw.tds.td_index_of(cursor) else {
                error!("OHCI: ED {:#x} queue holds invalid TD {:#x}", hw.eds.ed_bus(ed), cursor);
                break;
            };
            if budget == 0 {
                error!("OHCI: ED {:#x} queue does not reach its tail", hw.eds.ed_bus(ed));
                break;
            }
            budget -= 1;
            cursor = hw.tds.td(td).next_td() & ED_PTR_MASK;
            self.free_td(hw, td);
        }

        for index in 0..self.tds.len() {
            if self.tds[index].ed != Some(ed) {
                continue;
            }
            match self.tds[index].state {
                TdState::Pending => {
                    let record = &mut self.tds[index];
                    record.state = TdState::Cancelled;
                    record.request = None;
                }
                TdState::Completed(_) => self.free_td(hw, TdIndex(index as u16)),
                _ => {}
            }
        }

        for slot in 0..self.requests.len() {
            let owned = matches!(&self.requests[slot], RequestSlot::Active(r) if r.endpoint == ed);
            if owned {
                if let Some(request) = self.request_mut(slot as u16) {
                    request.error = Some(error);
                }
                self.finish_request(slot as u16, deliveries);
            }
        }

        let keep = hw_ed.head_p() & (ED_HALTED | ED_TOGGLE_CARRY);
        hw_ed.set_head_p(tail_bus | keep);
        self.eds[ed.as_usize()].next_iso_frame = None;
    }
}

// ============================================================================
// Upward Interface
// ============================================================================

impl<R: HcRegisters, P: HcdPlatform> OhciController<R, P> {
    /// エンドポイントをオープン
    pub fn open_endpoint(&self, params: EndpointParams) -> HcdResult<EndpointHandle> {
        let hw = self.hw();
        let ed = self.schedule.lock().open_endpoint(&hw, params)?;
        Ok(EndpointHandle::from_index(ed))
    }

    /// エンドポイントをクローズ（未完了の要求はアボートで完了）
    pub fn close_endpoint(&self, handle: EndpointHandle) -> HcdResult<()> {
        let hw = self.hw();
        let _serial = self.endpoint_ops.lock();
        let (ed, params, disabled) = {
            let mut schedule = self.schedule.lock();
            let ed = schedule.open_ed(handle)?;
            let (params, disabled) = schedule.begin_close(&hw, ed)?;
            (ed, params, disabled)
        };

        let guard = hw.pause(ed);
        let mut deliveries = Vec::new();
        self.schedule
            .lock()
            .detach_endpoint(&hw, &guard, &mut deliveries);

        // 切り離し前に読まれた NextED をハードウェアが使い終えるまで待つ
        if let Err(e) = pause::wait_frame_advance(hw.regs, hw.platform, hw.config.pause_retries) {
            warn!("OHCI: {} after unlinking ED {:#x}", e, hw.eds.ed_bus(ed));
        }
        guard.keep_paused();
        self.schedule.lock().finish_close(&hw, ed, disabled);

        deliver(deliveries);
        debug!(
            "OHCI: closed {:?} endpoint {}:{}",
            params.transfer_type,
            params.address.as_u8(),
            params.number
        );
        Ok(())
    }

    /// 全ての未完了要求をアボートし、エンドポイントを再開（ED は残す）
    ///
    /// エラーで停止していた場合も停止を解除する。トグルは保持。
    pub fn abort(&self, handle: EndpointHandle) -> HcdResult<()> {
        self.abort_with(handle, TransferError::Aborted)
    }

    /// 未完了要求を `error` で完了させるアボート
    pub(crate) fn abort_with(&self, handle: EndpointHandle, error: TransferError) -> HcdResult<()> {
        let hw = self.hw();
        let _serial = self.endpoint_ops.lock();
        let ed = self.schedule.lock().open_ed(handle)?;

        let guard = hw.pause(ed);
        let mut deliveries = Vec::new();
        {
            let mut schedule = self.schedule.lock();
            schedule.drain_endpoint(&hw, &guard, error, &mut deliveries);
            schedule.eds[ed.as_usize()].halted = false;
            guard.resume();
        }
        debug!("OHCI: aborted {} request(s) with {:?}", deliveries.len(), error);
        deliver(deliveries);
        Ok(())
    }

    /// エンドポイントが停止中か
    pub fn is_halted(&self, handle: EndpointHandle) -> HcdResult<bool> {
        let schedule = self.schedule.lock();
        let ed = schedule.open_ed(handle)?;
        Ok(schedule.eds[ed.as_usize()].halted || self.ed_arena.ed(ed).is_halted())
    }

    /// 停止を解除し、トグルを DATA0 に戻して処理を再開
    pub fn clear_halt(&self, handle: EndpointHandle) -> HcdResult<()> {
        let hw = self.hw();
        let mut schedule = self.schedule.lock();
        let ed = schedule.open_ed(handle)?;
        let params = schedule.params(ed)?;

        let hw_ed = hw.eds.ed(ed);
        let head = hw_ed.head_p();
        hw_ed.set_head_p(head & ED_PTR_MASK);
        schedule.eds[ed.as_usize()].halted = false;
        fence(Ordering::Release);
        hw_ed.set_skip(false);

        let pending = (head & ED_PTR_MASK) != (hw_ed.tail_p() & ED_PTR_MASK);
        if pending {
            hw.enable_list(
                ListKind::for_transfer(params.transfer_type),
                params.transfer_type == TransferType::Isochronous,
            );
        }
        debug!("OHCI: cleared halt on ED {:#x}", hw.eds.ed_bus(ed));
        Ok(())
    }
}
