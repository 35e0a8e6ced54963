// ============================================================================
// src/io/usb/ohci/config.rs - Controller Configuration
// ============================================================================
//!
//! プールサイズ・帯域上限・タイミング定数などの設定。
//! 全て初期化時に一度だけ参照され、以後変更されない。

use crate::error::{HcdError, HcdResult};

use super::periodic::TREE_NODE_COUNT;
use super::regs::FRAME_INTERVAL;

/// OHCI コントローラ設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OhciConfig {
    /// 利用者がオープンできるエンドポイント数（ダミーEDは別枠）
    pub max_endpoints: u16,
    /// TD プール容量
    pub max_transfer_descriptors: u16,
    /// 同時に未完了でいられる要求数
    pub max_requests: u16,
    /// データバッファプールのバッファ数
    pub data_buffer_count: u16,
    /// データバッファ1個のバイト数
    pub data_buffer_size: usize,
    /// 周期スケジュールの帯域上限（フレーム時間の千分率）
    pub bandwidth_ceiling: u16,
    /// 同期転送のタイムアウト (ms)
    pub control_timeout_ms: u32,
    /// リセット完了待ちのポーリング回数（1回 = 1us）
    pub reset_timeout_us: u32,
    /// 一時停止時のフレーム進行待ち回数（1回 = 1ms）
    pub pause_retries: u32,
    /// レジューム後の安定待ち (ms)
    pub resume_settle_ms: u32,
    /// FmInterval.FI
    pub frame_interval: u32,
    /// Control/Bulk Service Ratio (0..=3 → 1:1..4:1)
    pub control_bulk_ratio: u8,
    /// 割り込み線
    pub irq: u32,
}

impl Default for OhciConfig {
    fn default() -> Self {
        Self {
            max_endpoints: 32,
            max_transfer_descriptors: 128,
            max_requests: 32,
            data_buffer_count: 8,
            data_buffer_size: 4096,
            bandwidth_ceiling: 900,
            control_timeout_ms: 500,
            reset_timeout_us: 30,
            pause_retries: 5,
            resume_settle_ms: 20,
            frame_interval: FRAME_INTERVAL,
            control_bulk_ratio: 3,
            irq: 0,
        }
    }
}

impl OhciConfig {
    pub fn with_max_endpoints(mut self, count: u16) -> Self {
        self.max_endpoints = count;
        self
    }

    pub fn with_max_transfer_descriptors(mut self, count: u16) -> Self {
        self.max_transfer_descriptors = count;
        self
    }

    pub fn with_max_requests(mut self, count: u16) -> Self {
        self.max_requests = count;
        self
    }

    pub fn with_data_buffers(mut self, count: u16, size: usize) -> Self {
        self.data_buffer_count = count;
        self.data_buffer_size = size;
        self
    }

    pub fn with_bandwidth_ceiling(mut self, per_mille: u16) -> Self {
        self.bandwidth_ceiling = per_mille;
        self
    }

    pub fn with_control_timeout_ms(mut self, ms: u32) -> Self {
        self.control_timeout_ms = ms;
        self
    }

    pub fn with_reset_timeout_us(mut self, us: u32) -> Self {
        self.reset_timeout_us = us;
        self
    }

    pub fn with_pause_retries(mut self, retries: u32) -> Self {
        self.pause_retries = retries;
        self
    }

    pub fn with_resume_settle_ms(mut self, ms: u32) -> Self {
        self.resume_settle_ms = ms;
        self
    }

    pub fn with_frame_interval(mut self, interval: u32) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_control_bulk_ratio(mut self, ratio: u8) -> Self {
        self.control_bulk_ratio = ratio;
        self
    }

    pub fn with_irq(mut self, irq: u32) -> Self {
        self.irq = irq;
        self
    }

    /// ED アリーナの総スロット数（ダミー + 利用者）
    pub fn ed_slots(&self) -> usize {
        TREE_NODE_COUNT + self.max_endpoints as usize
    }

    /// 設定値の整合性を検証
    pub fn validate(&self) -> HcdResult<()> {
        if self.max_endpoints == 0 || self.ed_slots() > u16::MAX as usize {
            return Err(HcdError::InvalidParameter);
        }
        // 各エンドポイントは最低1個の番兵TDを保持する
        if self.max_transfer_descriptors < self.max_endpoints.saturating_add(1) {
            return Err(HcdError::InvalidParameter);
        }
        if self.max_requests == 0 {
            return Err(HcdError::InvalidParameter);
        }
        if self.data_buffer_count > 0 && self.data_buffer_size == 0 {
            return Err(HcdError::InvalidParameter);
        }
        if self.bandwidth_ceiling == 0 || self.bandwidth_ceiling > 1000 {
            return Err(HcdError::InvalidParameter);
        }
        if self.frame_interval <= 210 || self.frame_interval > 0x3FFF {
            return Err(HcdError::InvalidParameter);
        }
        if self.control_bulk_ratio > 3 {
            return Err(HcdError::InvalidParameter);
        }
        Ok(())
    }
}
