// ============================================================================
// src/io/usb/ohci/root_hub.rs - Root Hub Port Operations
// ============================================================================
//!
//! ルートハブのポート操作。
//!
//! HcRhPortStatus の下位16ビットはハブクラスの wPortStatus と、
//! ビット16..20 は wPortChange と同じ並びなので、そのまま切り出して返す。
//! 書き込みは「1を書いたビットだけが作用する」コマンド形式。

use core::sync::atomic::Ordering;

use log::{debug, info};

use crate::error::{HcdError, HcdResult};
use crate::io::usb::{PortNumber, PortStatus};

use super::controller::OhciController;
use super::dma::HcdPlatform;
use super::regs::{
    port_status_offset, port_write, HcRegisters, PortStatusBits, RhStatus, HC_RH_STATUS,
};

/// SetPortFeature / ClearPortFeature の対象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFeature {
    Enable,
    Suspend,
    Reset,
    Power,
}

/// 確認（クリア）するポート変化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChange {
    Connection,
    Enable,
    Suspend,
    OverCurrent,
    Reset,
}

impl PortChange {
    fn bit(self) -> PortStatusBits {
        match self {
            PortChange::Connection => PortStatusBits::CSC,
            PortChange::Enable => PortStatusBits::PESC,
            PortChange::Suspend => PortStatusBits::PSSC,
            PortChange::OverCurrent => PortStatusBits::OCIC,
            PortChange::Reset => PortStatusBits::PRSC,
        }
    }
}

impl<R: HcRegisters, P: HcdPlatform> OhciController<R, P> {
    /// ルートハブのポート数 (HcRhDescriptorA.NDP)
    pub fn port_count(&self) -> usize {
        self.port_count.load(Ordering::Relaxed)
    }

    fn port_offset(&self, port: PortNumber) -> HcdResult<usize> {
        if port.as_usize() >= self.port_count() {
            return Err(HcdError::InvalidParameter);
        }
        Ok(port_status_offset(port.as_usize()))
    }

    /// ポートの状態と変化ビット
    pub fn port_status(&self, port: PortNumber) -> HcdResult<PortStatus> {
        let raw = self.regs.read32(self.port_offset(port)?);
        Ok(PortStatus {
            status: (raw & PortStatusBits::STATUS_MASK) as u16,
            change: ((raw & PortStatusBits::CHANGE_MASK) >> 16) as u16,
        })
    }

    pub fn set_port_feature(&self, port: PortNumber, feature: PortFeature) -> HcdResult<()> {
        let offset = self.port_offset(port)?;
        let command = match feature {
            PortFeature::Enable => port_write::SET_PORT_ENABLE,
            PortFeature::Suspend => port_write::SET_PORT_SUSPEND,
            PortFeature::Reset => port_write::SET_PORT_RESET,
            PortFeature::Power => port_write::SET_PORT_POWER,
        };
        debug!("OHCI: port {} set {:?}", port.0, feature);
        self.regs.write32(offset, command);
        Ok(())
    }

    /// ClearPortFeature（リセットは解除できない）
    pub fn clear_port_feature(&self, port: PortNumber, feature: PortFeature) -> HcdResult<()> {
        let offset = self.port_offset(port)?;
        let command = match feature {
            PortFeature::Enable => port_write::CLEAR_PORT_ENABLE,
            // 書き込みでレジューム開始
            PortFeature::Suspend => port_write::CLEAR_SUSPEND_STATUS,
            PortFeature::Power => port_write::CLEAR_PORT_POWER,
            PortFeature::Reset => return Err(HcdError::InvalidParameter),
        };
        debug!("OHCI: port {} clear {:?}", port.0, feature);
        self.regs.write32(offset, command);
        Ok(())
    }

    /// 変化ビットを確認済みにする
    pub fn clear_port_change(&self, port: PortNumber, change: PortChange) -> HcdResult<()> {
        let offset = self.port_offset(port)?;
        self.regs.write32(offset, change.bit().bits());
        Ok(())
    }

    /// RHSC 割り込み時に呼ぶハンドラを登録
    pub fn set_root_hub_handler(&self, handler: fn(u32)) {
        *self.rh_handler.write() = Some(handler);
        info!("OHCI: root hub handler registered");
    }

    /// ハブクラスのステータス変化ビットマップ
    ///
    /// ビット0 がハブ自身、ビット n+1 がポート n。
    pub(crate) fn port_change_bitmap(&self) -> u32 {
        let mut bitmap = 0;
        let hub = RhStatus::from_bits_retain(self.regs.read32(HC_RH_STATUS));
        if hub.contains(RhStatus::OCIC) {
            bitmap |= 1;
        }
        for port in 0..self.port_count() {
            if self.regs.read32(port_status_offset(port)) & PortStatusBits::CHANGE_MASK != 0 {
                bitmap |= 1 << (port + 1);
            }
        }
        bitmap
    }
}
