//! 数据模型
//!
//! 传输方式、派生状态、接口快照，以及对外（UI 协作方）可观察的视图。
//! 状态由引擎在每个事件周期内整体重算，这里的类型本身不持有业务逻辑。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// 传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Usb,
    WifiAp,
    Bluetooth,
    P2pGo,
    /// 没有待处理的选择
    Invalid,
}

impl TransportKind {
    /// 可以被用户切换的传输方式，按 UI 展示顺序排列
    pub const ALL: [TransportKind; 4] = [
        TransportKind::Usb,
        TransportKind::WifiAp,
        TransportKind::Bluetooth,
        TransportKind::P2pGo,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Usb => "usb",
            TransportKind::WifiAp => "wifi_ap",
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::P2pGo => "p2p_go",
            TransportKind::Invalid => "invalid",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "usb" => Ok(TransportKind::Usb),
            "wifi" | "wifi_ap" | "hotspot" => Ok(TransportKind::WifiAp),
            "bt" | "bluetooth" => Ok(TransportKind::Bluetooth),
            "p2p" | "p2p_go" => Ok(TransportKind::P2pGo),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// 单个传输方式的派生状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    Unavailable,
    Available,
    Active,
    Errored,
    TurningOn,
    TurningOff,
}

impl TransportStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TransportStatus::Unavailable => "unavailable",
            TransportStatus::Available => "available",
            TransportStatus::Active => "active",
            TransportStatus::Errored => "errored",
            TransportStatus::TurningOn => "turning_on",
            TransportStatus::TurningOff => "turning_off",
        }
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 网络栈返回的 tether 错误码，0 表示成功
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const NO_ERROR: ErrorCode = ErrorCode(0);
    /// 后端不支持该操作
    pub const UNSUPPORTED: ErrorCode = ErrorCode(1);
    /// 接口不可用
    pub const UNAVAIL_IFACE: ErrorCode = ErrorCode(2);
    /// 内部错误
    pub const SERVICE_UNAVAIL: ErrorCode = ErrorCode(4);

    pub fn is_ok(self) -> bool {
        self == Self::NO_ERROR
    }
}

/// 接口快照
///
/// 每个事件整体重建，不做增量修改。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    pub available: BTreeSet<String>,
    pub tethered: BTreeSet<String>,
    pub errored: BTreeSet<String>,
    /// 可用接口上最近一次 tether 失败的错误码（只记录非零值）
    #[serde(default)]
    pub last_errors: BTreeMap<String, ErrorCode>,
}

impl InterfaceSnapshot {
    pub fn new<A, T, E, S>(available: A, tethered: T, errored: E) -> Self
    where
        A: IntoIterator<Item = S>,
        T: IntoIterator<Item = S>,
        E: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            available: available.into_iter().map(Into::into).collect(),
            tethered: tethered.into_iter().map(Into::into).collect(),
            errored: errored.into_iter().map(Into::into).collect(),
            last_errors: BTreeMap::new(),
        }
    }

    pub fn with_last_error(mut self, iface: impl Into<String>, code: ErrorCode) -> Self {
        if !code.is_ok() {
            self.last_errors.insert(iface.into(), code);
        }
        self
    }

    pub fn last_error(&self, iface: &str) -> ErrorCode {
        self.last_errors.get(iface).copied().unwrap_or_default()
    }
}

/// 蓝牙适配器电源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    Off,
    TurningOn,
    On,
    TurningOff,
    /// 适配器报告错误
    Error,
}

/// Wi-Fi AP 子系统状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WifiApState {
    #[default]
    Disabled,
    Enabling,
    Enabled,
    Disabling,
    Failed,
}

/// Wi-Fi AP 安全类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApSecurity {
    Open,
    #[default]
    Wpa2Psk,
}

impl ApSecurity {
    pub fn name(&self) -> &'static str {
        match self {
            ApSecurity::Open => "None",
            ApSecurity::Wpa2Psk => "WPA2 PSK",
        }
    }
}

/// Wi-Fi AP 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiApConfig {
    pub ssid: String,
    pub security: ApSecurity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl WifiApConfig {
    pub const DEFAULT_SSID: &'static str = "TetherAP";

    /// 校验配置：SSID 非空，WPA2 密码至少 8 位
    pub fn validate(&self) -> Result<(), String> {
        if self.ssid.trim().is_empty() {
            return Err("SSID must not be empty".to_string());
        }
        if self.ssid.len() > 32 {
            return Err("SSID must be at most 32 bytes".to_string());
        }
        match (self.security, self.passphrase.as_deref()) {
            (ApSecurity::Wpa2Psk, Some(p)) if (8..=63).contains(&p.len()) => Ok(()),
            (ApSecurity::Wpa2Psk, _) => Err("WPA2 passphrase must be 8-63 characters".to_string()),
            (ApSecurity::Open, _) => Ok(()),
        }
    }
}

/// 摘要文本
///
/// 状态文本保持为结构化数据，由渲染方决定如何展示；`Display` 给出默认英文文本。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Summary {
    Empty,
    Restricted,
    ProvisioningUnavailable,

    UsbActive,
    UsbAvailable,
    UsbErrored,
    UsbMassStorage,
    UsbUnavailable,

    WifiAp { ssid: String, security: ApSecurity },
    WifiApTurningOn,
    WifiApTurningOff,
    WifiApErrored,

    BluetoothTurningOn,
    BluetoothTurningOff,
    BluetoothAvailable,
    BluetoothDevicesConnected { count: usize },
    BluetoothErrored,
    BluetoothOff,
    BluetoothUnavailable,

    P2pDisabled,
    P2pStarting,
    P2pGettingNetworkInfo,
    P2pStarted,
    P2pFailed,
    P2pRestarting,
    P2pNetworkInfo { network_name: String, passphrase: String },
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Summary::Empty => Ok(()),
            Summary::Restricted => write!(f, "Tethering settings are not available for this user"),
            Summary::ProvisioningUnavailable => write!(f, "Tethering approval app not installed"),
            Summary::UsbActive => write!(f, "Tethered"),
            Summary::UsbAvailable => write!(f, "USB connected, check to tether"),
            Summary::UsbErrored => write!(f, "USB tethering error"),
            Summary::UsbMassStorage => write!(f, "Can't tether when USB storage is in use"),
            Summary::UsbUnavailable => write!(f, "USB not connected"),
            Summary::WifiAp { ssid, security } => {
                write!(f, "{} {} portable Wi-Fi hotspot", ssid, security.name())
            }
            Summary::WifiApTurningOn => write!(f, "Turning hotspot on\u{2026}"),
            Summary::WifiApTurningOff => write!(f, "Turning hotspot off\u{2026}"),
            Summary::WifiApErrored => write!(f, "Wi-Fi hotspot error"),
            Summary::BluetoothTurningOn => write!(f, "Turning Bluetooth on\u{2026}"),
            Summary::BluetoothTurningOff => write!(f, "Turning Bluetooth off\u{2026}"),
            Summary::BluetoothAvailable => write!(f, "Sharing this device's Internet connection"),
            Summary::BluetoothDevicesConnected { count: 1 } => {
                write!(f, "Sharing this device's Internet connection to 1 device")
            }
            Summary::BluetoothDevicesConnected { count } => {
                write!(f, "Sharing this device's Internet connection to {} devices", count)
            }
            Summary::BluetoothErrored => write!(f, "Bluetooth tethering error"),
            Summary::BluetoothOff => write!(f, "Not sharing this device's Internet connection"),
            Summary::BluetoothUnavailable => write!(f, "Bluetooth not available"),
            Summary::P2pDisabled => write!(f, "P2P-GO hotspot disabled"),
            Summary::P2pStarting => write!(f, "Starting P2P-GO hotspot\u{2026}"),
            Summary::P2pGettingNetworkInfo => write!(f, "Fetching network info\u{2026}"),
            Summary::P2pStarted => write!(f, "P2P-GO hotspot started"),
            Summary::P2pFailed => write!(f, "Failed to start P2P-GO hotspot"),
            Summary::P2pRestarting => write!(f, "P2P-GO hotspot stopped, restarting\u{2026}"),
            Summary::P2pNetworkInfo {
                network_name,
                passphrase,
            } => write!(f, "Network name: {}\nPassphrase: {}", network_name, passphrase),
        }
    }
}

/// 单个传输方式的可观察视图（开关状态）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportView {
    pub kind: TransportKind,
    pub status: TransportStatus,
    pub enabled: bool,
    pub checked: bool,
    pub visible: bool,
    pub summary: Summary,
}

impl TransportView {
    pub fn hidden(kind: TransportKind) -> Self {
        Self {
            kind,
            status: TransportStatus::Unavailable,
            enabled: false,
            checked: false,
            visible: false,
            summary: Summary::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("usb".parse::<TransportKind>(), Ok(TransportKind::Usb));
        assert_eq!("wifi-ap".parse::<TransportKind>(), Ok(TransportKind::WifiAp));
        assert_eq!("BT".parse::<TransportKind>(), Ok(TransportKind::Bluetooth));
        assert_eq!("p2p".parse::<TransportKind>(), Ok(TransportKind::P2pGo));
        assert!("ethernet".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_snapshot_last_error_ignores_success() {
        let snapshot = InterfaceSnapshot::new(["usb0"], [], [])
            .with_last_error("usb0", ErrorCode::NO_ERROR)
            .with_last_error("rndis0", ErrorCode(5));

        assert_eq!(snapshot.last_error("usb0"), ErrorCode::NO_ERROR);
        assert_eq!(snapshot.last_error("rndis0"), ErrorCode(5));
        assert_eq!(snapshot.last_errors.len(), 1);
    }

    #[test]
    fn test_ap_config_validation() {
        let mut config = WifiApConfig {
            ssid: "Home".to_string(),
            security: ApSecurity::Wpa2Psk,
            passphrase: Some("short".to_string()),
        };
        assert!(config.validate().is_err());

        config.passphrase = Some("longenough".to_string());
        assert!(config.validate().is_ok());

        config.ssid = "  ".to_string();
        assert!(config.validate().is_err());

        let open = WifiApConfig {
            ssid: "Cafe".to_string(),
            security: ApSecurity::Open,
            passphrase: None,
        };
        assert!(open.validate().is_ok());
    }

    #[test]
    fn test_network_info_summary_contains_credentials() {
        let summary = Summary::P2pNetworkInfo {
            network_name: "DIRECT-xy-Tether".to_string(),
            passphrase: "abcd1234".to_string(),
        };
        let text = summary.to_string();
        assert!(text.contains("DIRECT-xy-Tether"));
        assert!(text.contains("abcd1234"));
    }

    #[test]
    fn test_bluetooth_device_count_summary() {
        assert_eq!(
            Summary::BluetoothDevicesConnected { count: 1 }.to_string(),
            "Sharing this device's Internet connection to 1 device"
        );
        assert!(Summary::BluetoothDevicesConnected { count: 3 }
            .to_string()
            .contains("3 devices"));
    }
}
