//! 传输状态解析
//!
//! 把 available / tethered / errored 三组接口名按各传输方式的接口名模式归类，
//! 得到每个传输方式的状态。所有函数都是纯函数：相同的快照、模式和链路状态
//! 总是得到相同的结果。

use std::collections::BTreeSet;

use regex::Regex;

use crate::error::{Result, TetherError};
use crate::model::{AdapterState, InterfaceSnapshot, TransportKind, TransportStatus, WifiApState};

/// 一组接口名匹配规则
///
/// 每条规则都按整串匹配（`^(?:...)$`）。
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    regexes: Vec<Regex>,
}

impl PatternSet {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let regexes = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Regex::new(&format!("^(?:{})$", p)).map_err(|source| TetherError::InvalidPattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { regexes })
    }

    pub fn is_empty(&self) -> bool {
        self.regexes.is_empty()
    }

    pub fn matches(&self, iface: &str) -> bool {
        self.regexes.iter().any(|r| r.is_match(iface))
    }

    pub fn matches_any(&self, ifaces: &BTreeSet<String>) -> bool {
        self.find(ifaces).is_some()
    }

    /// 返回第一个匹配的接口名
    pub fn find<'a>(&self, ifaces: &'a BTreeSet<String>) -> Option<&'a str> {
        ifaces.iter().map(String::as_str).find(|i| self.matches(i))
    }
}

/// 各传输方式的接口名模式，启动时建立一次
#[derive(Debug, Clone, Default)]
pub struct TransportPatterns {
    pub usb: PatternSet,
    pub wifi: PatternSet,
    pub bluetooth: PatternSet,
}

impl TransportPatterns {
    pub fn for_kind(&self, kind: TransportKind) -> Option<&PatternSet> {
        match kind {
            TransportKind::Usb => Some(&self.usb),
            TransportKind::WifiAp => Some(&self.wifi),
            TransportKind::Bluetooth => Some(&self.bluetooth),
            TransportKind::P2pGo | TransportKind::Invalid => None,
        }
    }
}

/// PAN profile 的一次读数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanReading {
    pub tethering_on: bool,
    pub connected_devices: usize,
}

/// 接口列表以外、参与解析的链路状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkState {
    pub usb_connected: bool,
    pub mass_storage_active: bool,
    /// `None` 表示设备没有蓝牙适配器
    pub adapter: Option<AdapterState>,
    /// `None` 表示 PAN profile 尚未连接
    pub pan: Option<PanReading>,
    pub wifi_ap: WifiApState,
}

/// USB 解析结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbDetail {
    Tethered,
    /// `last_error` 为真时可用接口上有未清除的 tether 错误
    Available { last_error: bool },
    Errored,
    /// 大容量存储正在共享，仅影响显示
    MassStorage,
    Unavailable,
}

impl UsbDetail {
    pub fn status(&self) -> TransportStatus {
        match self {
            UsbDetail::Tethered => TransportStatus::Active,
            UsbDetail::Available { .. } => TransportStatus::Available,
            UsbDetail::Errored => TransportStatus::Errored,
            UsbDetail::MassStorage | UsbDetail::Unavailable => TransportStatus::Unavailable,
        }
    }
}

/// 蓝牙解析结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BluetoothDetail {
    Unavailable,
    TurningOn,
    TurningOff,
    Active { devices: usize, errored: bool },
    Idle { errored: bool },
}

impl BluetoothDetail {
    pub fn status(&self) -> TransportStatus {
        match self {
            BluetoothDetail::Unavailable => TransportStatus::Unavailable,
            BluetoothDetail::TurningOn => TransportStatus::TurningOn,
            BluetoothDetail::TurningOff => TransportStatus::TurningOff,
            BluetoothDetail::Active { .. } => TransportStatus::Active,
            BluetoothDetail::Idle { errored: true } => TransportStatus::Errored,
            BluetoothDetail::Idle { errored: false } => TransportStatus::Available,
        }
    }
}

/// 一次事件周期内所有传输方式的解析结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub usb: UsbDetail,
    pub wifi: TransportStatus,
    pub bluetooth: BluetoothDetail,
}

impl Resolution {
    /// P2P-GO 的状态由生命周期控制器维护，这里返回 `Unavailable`
    pub fn status(&self, kind: TransportKind) -> TransportStatus {
        match kind {
            TransportKind::Usb => self.usb.status(),
            TransportKind::WifiAp => self.wifi,
            TransportKind::Bluetooth => self.bluetooth.status(),
            TransportKind::P2pGo | TransportKind::Invalid => TransportStatus::Unavailable,
        }
    }
}

pub fn resolve_usb(snapshot: &InterfaceSnapshot, usb: &PatternSet, link: &LinkState) -> UsbDetail {
    if usb.matches_any(&snapshot.tethered) {
        return UsbDetail::Tethered;
    }

    let available: Vec<&str> = snapshot
        .available
        .iter()
        .map(String::as_str)
        .filter(|i| usb.matches(i))
        .collect();

    if link.usb_connected && !link.mass_storage_active && !available.is_empty() {
        let last_error = available.iter().any(|i| !snapshot.last_error(i).is_ok());
        return UsbDetail::Available { last_error };
    }
    if usb.matches_any(&snapshot.errored) {
        return UsbDetail::Errored;
    }
    if link.mass_storage_active {
        return UsbDetail::MassStorage;
    }
    UsbDetail::Unavailable
}

pub fn resolve_wifi(snapshot: &InterfaceSnapshot, wifi: &PatternSet, link: &LinkState) -> TransportStatus {
    if wifi.is_empty() {
        return TransportStatus::Unavailable;
    }
    if wifi.matches_any(&snapshot.tethered) || link.wifi_ap == WifiApState::Enabled {
        return TransportStatus::Active;
    }
    match link.wifi_ap {
        WifiApState::Enabling => TransportStatus::TurningOn,
        WifiApState::Disabling => TransportStatus::TurningOff,
        WifiApState::Failed => TransportStatus::Errored,
        _ if wifi.matches_any(&snapshot.errored) => TransportStatus::Errored,
        _ => TransportStatus::Available,
    }
}

pub fn resolve_bluetooth(
    snapshot: &InterfaceSnapshot,
    bluetooth: &PatternSet,
    link: &LinkState,
) -> BluetoothDetail {
    let (Some(adapter), Some(pan)) = (link.adapter, link.pan) else {
        return BluetoothDetail::Unavailable;
    };
    let errored = bluetooth.matches_any(&snapshot.errored);

    match adapter {
        AdapterState::TurningOn => BluetoothDetail::TurningOn,
        AdapterState::TurningOff => BluetoothDetail::TurningOff,
        AdapterState::On if pan.tethering_on || bluetooth.matches_any(&snapshot.tethered) => {
            BluetoothDetail::Active {
                devices: pan.connected_devices,
                errored,
            }
        }
        _ => BluetoothDetail::Idle { errored },
    }
}

/// 一次性解析所有传输方式
pub fn resolve_all(
    snapshot: &InterfaceSnapshot,
    patterns: &TransportPatterns,
    link: &LinkState,
) -> Resolution {
    Resolution {
        usb: resolve_usb(snapshot, &patterns.usb, link),
        wifi: resolve_wifi(snapshot, &patterns.wifi, link),
        bluetooth: resolve_bluetooth(snapshot, &patterns.bluetooth, link),
    }
}

/// 解析单个传输方式
pub fn resolve(
    kind: TransportKind,
    snapshot: &InterfaceSnapshot,
    patterns: &TransportPatterns,
    link: &LinkState,
) -> TransportStatus {
    resolve_all(snapshot, patterns, link).status(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> TransportPatterns {
        TransportPatterns {
            usb: PatternSet::new(["usb\\d+", "rndis\\d+"]).unwrap(),
            wifi: PatternSet::new(["wlan.*"]).unwrap(),
            bluetooth: PatternSet::new(["bnep\\d+"]).unwrap(),
        }
    }

    fn bt_link(adapter: AdapterState, tethering_on: bool) -> LinkState {
        LinkState {
            adapter: Some(adapter),
            pan: Some(PanReading {
                tethering_on,
                connected_devices: 0,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_patterns_match_whole_name() {
        let set = PatternSet::new(["usb\\d+"]).unwrap();
        assert!(set.matches("usb0"));
        assert!(!set.matches("myusb0"));
        assert!(!set.matches("usb0x"));
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let err = PatternSet::new(["wlan(["]).unwrap_err();
        assert!(matches!(err, TetherError::InvalidPattern { .. }));
    }

    #[test]
    fn test_pattern_sets_are_isolated() {
        let snapshot = InterfaceSnapshot::new(["wlan0"], ["wlan0"], []);
        let patterns = patterns();
        let link = LinkState::default();

        assert_eq!(
            resolve(TransportKind::Usb, &snapshot, &patterns, &link),
            TransportStatus::Unavailable
        );
        assert_eq!(
            resolve(TransportKind::Bluetooth, &snapshot, &patterns, &link),
            TransportStatus::Unavailable
        );
        assert_eq!(
            resolve(TransportKind::WifiAp, &snapshot, &patterns, &link),
            TransportStatus::Active
        );
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let snapshot = InterfaceSnapshot::new(["usb0", "wlan0"], ["bnep0"], ["rndis0"]);
        let patterns = patterns();
        let link = LinkState {
            usb_connected: true,
            ..bt_link(AdapterState::On, true)
        };

        let first = resolve_all(&snapshot, &patterns, &link);
        for _ in 0..5 {
            assert_eq!(resolve_all(&snapshot, &patterns, &link), first);
        }
    }

    #[test]
    fn test_usb_tethered_wins_over_errored() {
        let snapshot = InterfaceSnapshot::new([], ["usb0"], ["rndis0"]);
        let detail = resolve_usb(&snapshot, &patterns().usb, &LinkState::default());
        assert_eq!(detail, UsbDetail::Tethered);
        assert_eq!(detail.status(), TransportStatus::Active);
    }

    #[test]
    fn test_usb_available_requires_link_and_iface() {
        let patterns = patterns();
        let snapshot = InterfaceSnapshot::new(["usb0"], [], []);

        let disconnected = LinkState::default();
        assert_eq!(
            resolve_usb(&snapshot, &patterns.usb, &disconnected),
            UsbDetail::Unavailable
        );

        let connected = LinkState {
            usb_connected: true,
            ..Default::default()
        };
        assert_eq!(
            resolve_usb(&snapshot, &patterns.usb, &connected),
            UsbDetail::Available { last_error: false }
        );

        let no_iface = InterfaceSnapshot::default();
        assert_eq!(
            resolve_usb(&no_iface, &patterns.usb, &connected),
            UsbDetail::Unavailable
        );
    }

    #[test]
    fn test_usb_available_with_last_error() {
        let snapshot =
            InterfaceSnapshot::new(["usb0"], [], []).with_last_error("usb0", crate::model::ErrorCode(3));
        let link = LinkState {
            usb_connected: true,
            ..Default::default()
        };
        let detail = resolve_usb(&snapshot, &patterns().usb, &link);
        assert_eq!(detail, UsbDetail::Available { last_error: true });
        assert_eq!(detail.status(), TransportStatus::Available);
    }

    #[test]
    fn test_usb_mass_storage_suppresses_availability() {
        let snapshot = InterfaceSnapshot::new(["usb0"], [], []);
        let link = LinkState {
            usb_connected: true,
            mass_storage_active: true,
            ..Default::default()
        };
        let detail = resolve_usb(&snapshot, &patterns().usb, &link);
        assert_eq!(detail, UsbDetail::MassStorage);
        assert_eq!(detail.status(), TransportStatus::Unavailable);
    }

    #[test]
    fn test_usb_mass_storage_does_not_hide_active_session() {
        let snapshot = InterfaceSnapshot::new([], ["usb0"], []);
        let link = LinkState {
            usb_connected: true,
            mass_storage_active: true,
            ..Default::default()
        };
        assert_eq!(
            resolve_usb(&snapshot, &patterns().usb, &link),
            UsbDetail::Tethered
        );
    }

    #[test]
    fn test_usb_errored() {
        let snapshot = InterfaceSnapshot::new([], [], ["usb0"]);
        assert_eq!(
            resolve_usb(&snapshot, &patterns().usb, &LinkState::default()),
            UsbDetail::Errored
        );
    }

    #[test]
    fn test_bluetooth_without_pan_handle_is_unavailable() {
        let link = LinkState {
            adapter: Some(AdapterState::On),
            pan: None,
            ..Default::default()
        };
        let detail = resolve_bluetooth(&InterfaceSnapshot::default(), &patterns().bluetooth, &link);
        assert_eq!(detail, BluetoothDetail::Unavailable);
    }

    #[test]
    fn test_bluetooth_transitional_states() {
        let patterns = patterns();
        let snapshot = InterfaceSnapshot::new([], ["bnep0"], []);
        assert_eq!(
            resolve_bluetooth(&snapshot, &patterns.bluetooth, &bt_link(AdapterState::TurningOn, true)),
            BluetoothDetail::TurningOn
        );
        assert_eq!(
            resolve_bluetooth(&snapshot, &patterns.bluetooth, &bt_link(AdapterState::TurningOff, true)),
            BluetoothDetail::TurningOff
        );
    }

    #[test]
    fn test_bluetooth_active_and_errored_overlay() {
        let patterns = patterns();
        let errored = InterfaceSnapshot::new([], [], ["bnep0"]);

        let active = resolve_bluetooth(&errored, &patterns.bluetooth, &bt_link(AdapterState::On, true));
        assert_eq!(active.status(), TransportStatus::Active);

        let idle = resolve_bluetooth(&errored, &patterns.bluetooth, &bt_link(AdapterState::On, false));
        assert_eq!(idle.status(), TransportStatus::Errored);

        let off = resolve_bluetooth(
            &InterfaceSnapshot::default(),
            &patterns.bluetooth,
            &bt_link(AdapterState::Off, false),
        );
        assert_eq!(off.status(), TransportStatus::Available);
    }

    #[test]
    fn test_bluetooth_tethered_interface_is_active() {
        let patterns = patterns();
        let snapshot = InterfaceSnapshot::new(["bnep0"], ["bnep0"], []);
        let link = LinkState {
            adapter: Some(AdapterState::On),
            pan: Some(PanReading {
                tethering_on: false,
                connected_devices: 1,
            }),
            ..Default::default()
        };
        assert_eq!(
            resolve_bluetooth(&snapshot, &patterns.bluetooth, &link),
            BluetoothDetail::Active {
                devices: 1,
                errored: false
            }
        );
        assert_eq!(
            resolve(TransportKind::Bluetooth, &snapshot, &patterns, &link),
            TransportStatus::Active
        );
    }

    #[test]
    fn test_wifi_follows_ap_state() {
        let patterns = patterns();
        let snapshot = InterfaceSnapshot::default();
        let status = |state| {
            let link = LinkState {
                wifi_ap: state,
                ..Default::default()
            };
            resolve_wifi(&snapshot, &patterns.wifi, &link)
        };

        assert_eq!(status(WifiApState::Disabled), TransportStatus::Available);
        assert_eq!(status(WifiApState::Enabling), TransportStatus::TurningOn);
        assert_eq!(status(WifiApState::Enabled), TransportStatus::Active);
        assert_eq!(status(WifiApState::Disabling), TransportStatus::TurningOff);
        assert_eq!(status(WifiApState::Failed), TransportStatus::Errored);
    }

    #[test]
    fn test_wifi_without_patterns_is_unavailable() {
        let link = LinkState {
            wifi_ap: WifiApState::Enabled,
            ..Default::default()
        };
        assert_eq!(
            resolve_wifi(&InterfaceSnapshot::default(), &PatternSet::default(), &link),
            TransportStatus::Unavailable
        );
    }
}
