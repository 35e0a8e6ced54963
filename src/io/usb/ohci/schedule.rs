// ============================================================================
// src/io/usb/ohci/schedule.rs - Software Schedule State
// ============================================================================
//!
//! # ソフトウェア側スケジュール状態
//!
//! ハードウェア ED/TD と同じスロット番号で並ぶソフトウェアレコードと、
//! 各プールのフリーリスト、周期ツリーの帯域台帳をまとめた構造体。
//! タスクコンテキストと割り込みコンテキストの双方から
//! `IrqMutex<Schedule>` 越しに操作される。

use alloc::boxed::Box;
use alloc::vec::Vec;

use log::trace;

use crate::error::{HcdError, HcdResult, PoolKind};
use crate::io::usb::{TransferDirection, TransferError, TransferType};

use super::completion::{Completion, IsoPacketStatus};
use super::config::OhciConfig;
use super::controller::StatCounters;
use super::descriptor::ConditionCode;
use super::dma::{DmaBuffer, HcdPlatform};
use super::endpoint::{EndpointHandle, EndpointParams};
use super::pause::EndpointPauseGuard;
use super::periodic::{PeriodicTree, TREE_NODE_COUNT};
use super::pool::{DescriptorArena, EdIndex, SlotPool, TdIndex};
use super::regs::{
    CommandStatus, HcControl, HcRegisters, HC_BULK_CURRENT_ED, HC_COMMAND_STATUS, HC_CONTROL,
    HC_CONTROL_CURRENT_ED, HC_PERIOD_CURRENT_ED,
};
use super::transfer::RequestId;

/// 割り込みコンテキスト外で呼ぶ完了コールバック
pub(crate) type CompletionCallback = Box<dyn FnOnce(Completion) + Send>;

/// ロック解放後に配送する完了通知
pub(crate) type Delivery = (CompletionCallback, Completion);

// ============================================================================
// Lists
// ============================================================================

/// ED が属する論理リスト
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Control,
    Bulk,
    /// インタラプト/アイソクロナス（周期ツリー）
    Periodic,
}

impl ListKind {
    pub fn for_transfer(transfer_type: TransferType) -> Self {
        match transfer_type {
            TransferType::Control => ListKind::Control,
            TransferType::Bulk => ListKind::Bulk,
            TransferType::Interrupt | TransferType::Isochronous => ListKind::Periodic,
        }
    }

    /// このリストの処理スイッチ
    pub fn enable_bits(&self, isochronous: bool) -> HcControl {
        match self {
            ListKind::Control => HcControl::CLE,
            ListKind::Bulk => HcControl::BLE,
            ListKind::Periodic if isochronous => HcControl::PLE | HcControl::IE,
            ListKind::Periodic => HcControl::PLE,
        }
    }

    /// ハードウェアが処理中の ED を示すレジスタ
    pub fn current_ed_register(&self) -> usize {
        match self {
            ListKind::Control => HC_CONTROL_CURRENT_ED,
            ListKind::Bulk => HC_BULK_CURRENT_ED,
            ListKind::Periodic => HC_PERIOD_CURRENT_ED,
        }
    }

    /// List Filled ヒント（周期リストには無い）
    pub fn filled_bit(&self) -> CommandStatus {
        match self {
            ListKind::Control => CommandStatus::CLF,
            ListKind::Bulk => CommandStatus::BLF,
            ListKind::Periodic => CommandStatus::empty(),
        }
    }
}

// ============================================================================
// Software Records
// ============================================================================

/// ED のソフトウェア側レコード
#[derive(Debug, Clone)]
pub(crate) struct EdRecord {
    /// オープン中の利用者EDなら Some（ダミー/空きは None）
    pub params: Option<EndpointParams>,
    /// 同じリスト内の次の ED
    pub next: Option<EdIndex>,
    /// 周期ツリー上の間隔 (ms)
    pub interval: u8,
    /// 周期ツリー上のグループ
    pub branch: u8,
    /// 課金済み帯域
    pub bandwidth: u16,
    /// ソフトウェアが停止状態として扱っているか
    pub halted: bool,
    /// クローズ処理中（新しい要求を受け付けない）
    pub closing: bool,
    /// 番兵TD
    pub tail: Option<TdIndex>,
    /// アイソクロナス: 次の要求の開始フレーム
    pub next_iso_frame: Option<u16>,
}

impl EdRecord {
    pub const fn empty() -> Self {
        Self {
            params: None,
            next: None,
            interval: 0,
            branch: 0,
            bandwidth: 0,
            halted: false,
            closing: false,
            tail: None,
            next_iso_frame: None,
        }
    }

    pub const fn tree_node(interval: u8, branch: u8) -> Self {
        let mut record = Self::empty();
        record.interval = interval;
        record.branch = branch;
        record
    }

    pub fn is_open(&self) -> bool {
        self.params.is_some() && !self.closing
    }

    pub fn is_isochronous(&self) -> bool {
        self.params
            .is_some_and(|p| p.transfer_type == TransferType::Isochronous)
    }

    pub fn list(&self) -> Option<ListKind> {
        self.params.map(|p| ListKind::for_transfer(p.transfer_type))
    }
}

/// TD のライフサイクル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TdState {
    Free,
    /// ED キュー末尾の番兵
    Sentinel,
    /// ハードウェアに渡した
    Pending,
    /// Done List から回収済み（要求の完了待ち）
    Completed(ConditionCode),
    /// アボート済み。Done List に現れたら黙って解放する
    Cancelled,
}

/// アイソクロナス TD が受け持つパケット範囲
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IsoTdInfo {
    pub first_packet: u16,
    pub packet_count: u8,
}

/// TD のソフトウェア側レコード
#[derive(Debug, Clone)]
pub(crate) struct TdRecord {
    pub state: TdState,
    pub ed: Option<EdIndex>,
    pub request: Option<u16>,
    /// ED キュー内の次の TD
    pub next: Option<TdIndex>,
    /// 転送開始バスアドレス
    pub buffer_start: u32,
    pub length: u32,
    /// 要求の転送長に数えるか（SETUP/STATUS は数えない）
    pub counts_length: bool,
    pub iso: Option<IsoTdInfo>,
}

impl TdRecord {
    pub const fn free() -> Self {
        Self {
            state: TdState::Free,
            ed: None,
            request: None,
            next: None,
            buffer_start: 0,
            length: 0,
            counts_length: false,
            iso: None,
        }
    }
}

/// 完了通知の配送方法
pub(crate) enum Notify {
    /// 割り込み処理の最後にコールバック
    Callback(CompletionCallback),
    /// スロットに残し、同期待ち側が回収する
    Poll,
}

/// 実行中の要求
pub(crate) struct RequestRecord {
    pub endpoint: EdIndex,
    pub direction: TransferDirection,
    pub isochronous: bool,
    pub buffer: Option<DmaBuffer>,
    pub actual: usize,
    pub error: Option<TransferError>,
    pub first_td: Option<TdIndex>,
    /// 完了判定に使う最後の TD（同一性で比較）
    pub last_td: Option<TdIndex>,
    pub iso_packets: Vec<IsoPacketStatus>,
    pub notify: Notify,
}

pub(crate) enum RequestSlot {
    Free,
    Active(RequestRecord),
    /// 完了済みで同期待ち側の回収待ち
    Parked(Completion),
}

// ============================================================================
// Hardware Context
// ============================================================================

/// スケジュール操作が使うハードウェア資源への参照
pub(crate) struct HwContext<'a> {
    pub regs: &'a dyn HcRegisters,
    pub platform: &'a dyn HcdPlatform,
    pub eds: &'a DescriptorArena,
    pub tds: &'a DescriptorArena,
    pub setup: &'a DescriptorArena,
    pub config: &'a OhciConfig,
    pub stats: &'a StatCounters,
}

impl<'a> HwContext<'a> {
    /// ED を一時停止
    pub fn pause(&self, ed: EdIndex) -> EndpointPauseGuard<'a> {
        let guard = EndpointPauseGuard::pause(
            self.eds,
            ed,
            self.regs,
            self.platform,
            self.config.pause_retries,
        );
        if guard.timed_out() {
            self.stats.record_pause_timeout();
        }
        guard
    }

    fn control(&self) -> HcControl {
        HcControl::from_bits_retain(self.regs.read32(HC_CONTROL))
    }

    /// リスト処理スイッチを入れ、Control/Bulk なら List Filled を立てる
    pub fn enable_list(&self, list: ListKind, isochronous: bool) {
        let bits = list.enable_bits(isochronous);
        let control = self.control();
        if !control.contains(bits) {
            self.regs.write32(HC_CONTROL, (control | bits).bits());
        }
        let filled = list.filled_bit();
        if !filled.is_empty() {
            self.regs.write32(HC_COMMAND_STATUS, filled.bits());
        }
    }

    /// リスト処理スイッチを切り、切る前に立っていたビットを返す
    pub fn disable_list(&self, list: ListKind) -> HcControl {
        let bits = match list {
            ListKind::Periodic => HcControl::PLE | HcControl::IE,
            other => other.enable_bits(false),
        };
        let control = self.control();
        let was = control & bits;
        if !was.is_empty() {
            self.regs.write32(HC_CONTROL, (control - bits).bits());
        }
        was
    }

    /// `disable_list` で切ったビットを戻す
    pub fn restore_list(&self, bits: HcControl) {
        if !bits.is_empty() {
            let control = self.control();
            self.regs.write32(HC_CONTROL, (control | bits).bits());
        }
    }

    /// ハードウェアが今この ED を処理中か
    pub fn is_current(&self, list: ListKind, ed: EdIndex) -> bool {
        let current = self.regs.read32(list.current_ed_register()) & !0xF;
        current == self.eds.ed_bus(ed)
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// コントローラ1台分のソフトウェアスケジュール
pub(crate) struct Schedule {
    pub eds: Vec<EdRecord>,
    pub tds: Vec<TdRecord>,
    pub requests: Vec<RequestSlot>,
    pub ed_pool: SlotPool,
    pub td_pool: SlotPool,
    pub request_pool: SlotPool,
    pub tree: PeriodicTree,
    pub control_head: Option<EdIndex>,
    pub bulk_head: Option<EdIndex>,
}

impl Schedule {
    pub fn new(config: &OhciConfig) -> Self {
        let ed_slots = config.ed_slots();
        let mut eds = Vec::with_capacity(ed_slots);
        eds.resize(ed_slots, EdRecord::empty());

        let td_count = config.max_transfer_descriptors as usize;
        let mut tds = Vec::with_capacity(td_count);
        tds.resize(td_count, TdRecord::free());

        let request_count = config.max_requests as usize;
        let mut requests = Vec::with_capacity(request_count);
        requests.resize_with(request_count, || RequestSlot::Free);

        Self {
            eds,
            tds,
            requests,
            ed_pool: SlotPool::new(TREE_NODE_COUNT as u16, config.max_endpoints),
            td_pool: SlotPool::new(0, config.max_transfer_descriptors),
            request_pool: SlotPool::new(0, config.max_requests),
            tree: PeriodicTree::new(),
            control_head: None,
            bulk_head: None,
        }
    }

    /// ハンドルを検証してオープン中の ED を返す
    pub fn open_ed(&self, handle: EndpointHandle) -> HcdResult<EdIndex> {
        let index = handle.index();
        match self.eds.get(index.as_usize()) {
            Some(record) if index.as_usize() >= TREE_NODE_COUNT && record.is_open() => Ok(index),
            _ => Err(HcdError::InvalidEndpoint),
        }
    }

    /// オープン中の ED と、それが属するリスト
    pub fn endpoint_list(&self, handle: EndpointHandle) -> HcdResult<(EdIndex, ListKind)> {
        let ed = self.open_ed(handle)?;
        let list = ListKind::for_transfer(self.params(ed)?.transfer_type);
        Ok((ed, list))
    }

    pub fn params(&self, ed: EdIndex) -> HcdResult<EndpointParams> {
        self.eds[ed.as_usize()]
            .params
            .ok_or(HcdError::InvalidEndpoint)
    }

    /// TD をプールから取り出し、番兵として初期化
    pub fn alloc_td(&mut self, hw: &HwContext<'_>, ed: EdIndex) -> HcdResult<TdIndex> {
        let slot = self
            .td_pool
            .alloc()
            .ok_or(HcdError::Alloc(PoolKind::TransferDescriptor))?;
        let td = TdIndex(slot);
        hw.tds.td(td).clear();
        self.tds[td.as_usize()] = TdRecord {
            state: TdState::Sentinel,
            ed: Some(ed),
            ..TdRecord::free()
        };
        Ok(td)
    }

    /// TD をプールへ戻す
    pub fn free_td(&mut self, hw: &HwContext<'_>, td: TdIndex) {
        if self.tds[td.as_usize()].state == TdState::Free {
            return;
        }
        hw.tds.td(td).clear();
        self.tds[td.as_usize()] = TdRecord::free();
        self.td_pool.free(td.0);
    }

    pub fn request_mut(&mut self, slot: u16) -> Option<&mut RequestRecord> {
        match self.requests.get_mut(slot as usize) {
            Some(RequestSlot::Active(record)) => Some(record),
            _ => None,
        }
    }

    /// 要求を完了させ、通知を配送キューまたはスロットに置く
    ///
    /// TD の解放は呼び出し側の責任。
    pub fn finish_request(&mut self, slot: u16, deliveries: &mut Vec<Delivery>) {
        let record = match core::mem::replace(&mut self.requests[slot as usize], RequestSlot::Free) {
            RequestSlot::Active(record) => record,
            other => {
                self.requests[slot as usize] = other;
                return;
            }
        };

        let completion = Completion {
            request: RequestId(slot),
            endpoint: EndpointHandle::from_index(record.endpoint),
            result: record.error.map_or(Ok(()), Err),
            actual_length: record.actual,
            buffer: record.buffer,
            iso_packets: record.iso_packets,
        };
        trace!(
            "OHCI: request {} finished: {:?}, {} bytes",
            slot,
            completion.result,
            completion.actual_length
        );

        match record.notify {
            Notify::Callback(callback) => {
                self.request_pool.free(slot);
                deliveries.push((callback, completion));
            }
            Notify::Poll => {
                self.requests[slot as usize] = RequestSlot::Parked(completion);
            }
        }
    }

    /// 同期待ちの完了を回収
    pub fn take_parked(&mut self, id: RequestId) -> Option<Completion> {
        let slot = self.requests.get_mut(id.0 as usize)?;
        if !matches!(slot, RequestSlot::Parked(_)) {
            return None;
        }
        match core::mem::replace(slot, RequestSlot::Free) {
            RequestSlot::Parked(completion) => {
                self.request_pool.free(id.0);
                Some(completion)
            }
            _ => None,
        }
    }
}
