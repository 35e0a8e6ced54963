// ============================================================================
// src/lib.rs - OHCI Host Controller Core
// ============================================================================
//!
//! # OHCI ホストコントローラ転送スケジューリングコア
//!
//! 論理I/O要求（URB）をハードウェアが読めるディスクリプタリストへ変換し、
//! ホストコントローラのレジスタを電源/動作状態に沿って駆動し、
//! 非同期な完了通知（Done List）を要求の完了へと戻す。
//!
//! ## モジュール構造
//! - `error`: 統一エラー型
//! - `sync`: 割り込み禁止Mutex
//! - `io::usb`: USB 共通型
//! - `io::usb::ohci`: OHCI エンジン本体

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod io;
pub mod sync;

pub use error::{HcdError, HcdResult, HwOperation, PoolKind};
pub use io::usb::ohci::{
    Completion, DmaBuffer, DmaRegion, EndpointHandle, EndpointParams, HcState, HcdPlatform,
    HcRegisters, MmioRegisters, OhciConfig, OhciController, RequestId, TransferRequest,
};
