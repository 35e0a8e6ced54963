// ============================================================================
// src/io/usb/mod.rs - USB Subsystem
// ============================================================================
//!
//! # USBサブシステム
//!
//! ホストコントローラコアが上位層（列挙層・クラスドライバ）と共有する型。
//! OHCI (USB 1.1) コントローラの転送エンジンを中心とした実装。
//!
//! ## 型安全性
//! - Newtype パターンによるアドレス/エンドポイント/ポート管理
//! - 転送エラーはコンディションコードと1対1の列挙型

pub mod ohci;

// ============================================================================
// USB Constants
// ============================================================================

/// USB 速度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    /// Low Speed (1.5 Mbps)
    Low,
    /// Full Speed (12 Mbps)
    Full,
}

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// USBデバイスアドレス (型安全)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddress(pub u8);

impl DeviceAddress {
    pub fn is_valid(&self) -> bool {
        self.0 <= 127
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// エンドポイントアドレス (型安全)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    /// コントロールエンドポイント
    pub const CONTROL: Self = Self(0);

    /// エンドポイント番号を取得 (0-15)
    pub fn number(&self) -> u8 {
        self.0 & 0x0F
    }

    pub fn is_in(&self) -> bool {
        (self.0 & 0x80) != 0
    }

    /// INエンドポイントを作成
    pub fn in_endpoint(num: u8) -> Self {
        Self(0x80 | (num & 0x0F))
    }

    /// OUTエンドポイントを作成
    pub fn out_endpoint(num: u8) -> Self {
        Self(num & 0x0F)
    }

    pub fn direction(&self) -> TransferDirection {
        if self.is_in() {
            TransferDirection::In
        } else {
            TransferDirection::Out
        }
    }
}

/// ルートハブのポート番号 (0-indexed, 型安全)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortNumber(pub u8);

impl PortNumber {
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

// ============================================================================
// USB Transfer Types
// ============================================================================

/// USB転送タイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// コントロール転送
    Control,
    /// バルク転送
    Bulk,
    /// インタラプト転送
    Interrupt,
    /// アイソクロナス転送
    Isochronous,
}

impl TransferType {
    /// 周期スケジュール（インタラプト/アイソクロナス）か
    pub fn is_periodic(&self) -> bool {
        matches!(self, TransferType::Interrupt | TransferType::Isochronous)
    }
}

/// USB転送方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// ホストからデバイス
    Out,
    /// デバイスからホスト
    In,
}

/// 要求レベルの転送エラー
///
/// OHCI コンディションコードと1対1に対応し、加えてソフトウェア起因の
/// `Aborted` / `Timeout` を持つ。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    Crc,
    BitStuffing,
    DataToggleMismatch,
    Stall,
    DeviceNotResponding,
    PidCheckFailure,
    UnexpectedPid,
    DataOverrun,
    DataUnderrun,
    BufferOverrun,
    BufferUnderrun,
    NotAccessed,
    /// 予約コード (10, 11)
    Reserved(u8),
    /// 中断（アボート）
    Aborted,
    /// 同期転送のタイムアウト
    Timeout,
}

// ============================================================================
// USB Setup Packet
// ============================================================================

/// USBセットアップパケット (8バイト)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    /// リクエストタイプ
    pub bm_request_type: u8,
    /// リクエスト
    pub b_request: u8,
    /// 値
    pub w_value: u16,
    /// インデックス
    pub w_index: u16,
    /// 長さ
    pub w_length: u16,
}

impl SetupPacket {
    /// GET_DESCRIPTOR リクエスト
    pub fn get_descriptor(desc_type: u8, desc_index: u8, length: u16) -> Self {
        Self {
            bm_request_type: 0x80, // Device-to-host, Standard, Device
            b_request: 0x06,       // GET_DESCRIPTOR
            w_value: ((desc_type as u16) << 8) | (desc_index as u16),
            w_index: 0,
            w_length: length,
        }
    }

    /// SET_ADDRESS リクエスト
    pub fn set_address(address: DeviceAddress) -> Self {
        Self {
            bm_request_type: 0x00, // Host-to-device, Standard, Device
            b_request: 0x05,       // SET_ADDRESS
            w_value: address.as_u8() as u16,
            w_index: 0,
            w_length: 0,
        }
    }

    /// データステージの方向
    pub fn data_direction(&self) -> TransferDirection {
        if self.bm_request_type & 0x80 != 0 {
            TransferDirection::In
        } else {
            TransferDirection::Out
        }
    }

    /// ワイヤ形式（リトルエンディアン8バイト）
    pub fn to_bytes(&self) -> [u8; 8] {
        let v = self.w_value.to_le_bytes();
        let i = self.w_index.to_le_bytes();
        let l = self.w_length.to_le_bytes();
        [self.bm_request_type, self.b_request, v[0], v[1], i[0], i[1], l[0], l[1]]
    }
}

// ============================================================================
// USB Hub Port Status
// ============================================================================

/// ハブクラスのポートステータス（wPortStatus / wPortChange と同じビット配置）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatus {
    /// wPortStatus
    pub status: u16,
    /// wPortChange
    pub change: u16,
}

impl PortStatus {
    pub const CONNECTION: u16 = 1 << 0;
    pub const ENABLE: u16 = 1 << 1;
    pub const SUSPEND: u16 = 1 << 2;
    pub const OVER_CURRENT: u16 = 1 << 3;
    pub const RESET: u16 = 1 << 4;
    pub const POWER: u16 = 1 << 8;
    pub const LOW_SPEED: u16 = 1 << 9;

    pub const C_CONNECTION: u16 = 1 << 0;
    pub const C_ENABLE: u16 = 1 << 1;
    pub const C_SUSPEND: u16 = 1 << 2;
    pub const C_OVER_CURRENT: u16 = 1 << 3;
    pub const C_RESET: u16 = 1 << 4;

    pub fn connected(&self) -> bool {
        self.status & Self::CONNECTION != 0
    }

    pub fn enabled(&self) -> bool {
        self.status & Self::ENABLE != 0
    }

    /// 接続デバイスの速度
    pub fn speed(&self) -> UsbSpeed {
        if self.status & Self::LOW_SPEED != 0 {
            UsbSpeed::Low
        } else {
            UsbSpeed::Full
        }
    }
}
