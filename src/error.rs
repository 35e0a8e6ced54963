//! 統一エラーハンドリングモジュール
//!
//! ホストコントローラコア全体で使用される統一エラー型を定義し、
//! 転送レベルのエラー（コンディションコード）から変換を提供します。

use core::fmt;

use crate::io::usb::ohci::HcState;
use crate::io::usb::TransferError;

/// コア全体の統一エラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcdError {
    /// プール枯渇（呼び出し側で回復可能）
    Alloc(PoolKind),
    /// 周期スケジュールに帯域が残っていない
    NoBandwidth,
    /// ハードウェアのタイミング失敗
    Timeout(HwOperation),
    /// 不正な状態遷移
    InvalidState { from: HcState, to: HcState },
    /// 無効な引数
    InvalidParameter,
    /// 無効なエンドポイントハンドル
    InvalidEndpoint,
    /// エンドポイントが停止（halt）中
    EndpointHalted,
    /// 転送エラー
    Transfer(TransferError),
}

/// 固定容量プールの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// エンドポイントディスクリプタ（ソフトウェア＋ハードウェア）
    EndpointDescriptor,
    /// 転送ディスクリプタ（ソフトウェア＋ハードウェア）
    TransferDescriptor,
    /// 要求スロット
    Request,
    /// DMAデータバッファ
    DataBuffer,
    /// プラットフォームからのDMA領域
    DmaRegion,
}

/// タイムアウトしたハードウェア操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwOperation {
    /// HcCommandStatus.HCR のクリア待ち
    Reset,
    /// SMM/BIOS からの所有権移譲
    OwnershipHandoff,
    /// フレーム番号の進行待ち
    FrameAdvance,
    /// 同期転送の完了待ち
    Transfer,
}

pub type HcdResult<T> = Result<T, HcdError>;

// ===== Display implementations =====

impl fmt::Display for HcdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HcdError::Alloc(kind) => write!(f, "{} pool exhausted", kind),
            HcdError::NoBandwidth => write!(f, "no periodic bandwidth available"),
            HcdError::Timeout(op) => write!(f, "hardware timeout: {}", op),
            HcdError::InvalidState { from, to } => {
                write!(f, "invalid controller transition {:?} -> {:?}", from, to)
            }
            HcdError::InvalidParameter => write!(f, "invalid parameter"),
            HcdError::InvalidEndpoint => write!(f, "invalid endpoint handle"),
            HcdError::EndpointHalted => write!(f, "endpoint halted"),
            HcdError::Transfer(e) => write!(f, "transfer error: {}", e),
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::EndpointDescriptor => write!(f, "endpoint descriptor"),
            PoolKind::TransferDescriptor => write!(f, "transfer descriptor"),
            PoolKind::Request => write!(f, "request"),
            PoolKind::DataBuffer => write!(f, "data buffer"),
            PoolKind::DmaRegion => write!(f, "DMA region"),
        }
    }
}

impl fmt::Display for HwOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwOperation::Reset => write!(f, "controller reset"),
            HwOperation::OwnershipHandoff => write!(f, "ownership handoff"),
            HwOperation::FrameAdvance => write!(f, "frame advance"),
            HwOperation::Transfer => write!(f, "transfer completion"),
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Crc => write!(f, "CRC error"),
            TransferError::BitStuffing => write!(f, "bit stuffing violation"),
            TransferError::DataToggleMismatch => write!(f, "data toggle mismatch"),
            TransferError::Stall => write!(f, "stall"),
            TransferError::DeviceNotResponding => write!(f, "device not responding"),
            TransferError::PidCheckFailure => write!(f, "PID check failure"),
            TransferError::UnexpectedPid => write!(f, "unexpected PID"),
            TransferError::DataOverrun => write!(f, "data overrun"),
            TransferError::DataUnderrun => write!(f, "data underrun"),
            TransferError::BufferOverrun => write!(f, "buffer overrun"),
            TransferError::BufferUnderrun => write!(f, "buffer underrun"),
            TransferError::NotAccessed => write!(f, "not accessed"),
            TransferError::Reserved(cc) => write!(f, "reserved condition code {}", cc),
            TransferError::Aborted => write!(f, "aborted"),
            TransferError::Timeout => write!(f, "timeout"),
        }
    }
}

// ===== Conversions =====

impl From<TransferError> for HcdError {
    fn from(e: TransferError) -> Self {
        HcdError::Transfer(e)
    }
}
