// ============================================================================
// src/io/usb/ohci/mod.rs - OHCI Host Controller Engine
// ============================================================================
//!
//! # OHCI (Open Host Controller Interface) 転送エンジン
//!
//! USB 1.1 ホストコントローラのディスクリプタリスト方式の転送スケジューラ。
//!
//! ## 構成（葉から順に）
//! - `regs`: オペレーショナルレジスタとアクセストレイト
//! - `dma`: DMA領域/バッファとプラットフォーム抽象
//! - `hcca`: ホストコントローラ通信領域
//! - `descriptor`: ED/TD のハードウェア形式とコンディションコード
//! - `pool`: 固定容量アリーナとフリーリスト
//! - `periodic`: 32分岐の周期スケジュールツリー
//! - `pause`: エンドポイント一時停止ガード
//! - `transfer`: 転送要求と TD キュー追加
//! - `endpoint`: エンドポイントのオープン/クローズ/アボート
//! - `completion`: Done List 処理
//! - `controller`: 状態機械と割り込み処理
//! - `root_hub`: ルートハブポート操作
//!
//! ## 並行性
//! タスクコンテキストと割り込みコンテキストが共有するソフトウェア状態は
//! `IrqMutex<Schedule>` で保護する。ハードウェアの DMA 走査との同期は
//! `EndpointPauseGuard` による一時停止プロトコルのみで行う。

/// `verbose_logging` 有効時のみ出力する trace ログ
macro_rules! vtrace {
    ($($arg:tt)*) => {
        if cfg!(feature = "verbose_logging") {
            log::trace!($($arg)*);
        }
    };
}
pub(crate) use vtrace;

pub mod completion;
pub mod config;
pub mod controller;
pub mod descriptor;
pub mod dma;
pub mod endpoint;
pub mod hcca;
pub mod pause;
pub mod periodic;
pub mod pool;
pub mod regs;
pub mod root_hub;
pub mod schedule;
pub mod transfer;

#[cfg(test)]
pub(crate) mod sim;

pub use completion::{Completion, IsoPacketStatus};
pub use config::OhciConfig;
pub use controller::{HcState, HcdStats, OhciController, PoolUsage};
pub use descriptor::ConditionCode;
pub use dma::{DmaBuffer, DmaRegion, HcdPlatform};
pub use endpoint::{EndpointHandle, EndpointParams};
pub use pause::EndpointPauseGuard;
pub use regs::{HcRegisters, MmioRegisters};
pub use root_hub::{PortChange, PortFeature};
pub use transfer::{RequestId, TransferRequest};
