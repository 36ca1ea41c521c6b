//! 外部协作方接口
//!
//! 引擎只通过这里的 trait 与网络栈、无线电、授权流程和持久化交互。
//! 所有调用都必须立即返回：需要异步完成的操作（建组、删组、授权、
//! 持久组信息查询）由实现方稍后通过 [`EventSink`](crate::event::EventSink)
//! 投递结果事件。

use std::sync::{Arc, RwLock};

use crate::model::{AdapterState, ErrorCode, InterfaceSnapshot, TransportKind, WifiApConfig, WifiApState};
use crate::provisioning::Ticket;

/// 网络栈 / 无线电抽象
pub trait TetherHal: Send + Sync {
    /// 当前 available / tethered / errored 接口
    fn list_interfaces(&self) -> InterfaceSnapshot;

    fn tether(&self, iface: &str) -> ErrorCode;
    fn untether(&self, iface: &str) -> ErrorCode;

    fn usb_connected(&self) -> bool;
    fn mass_storage_shared(&self) -> bool {
        false
    }
    fn set_usb_tethering_enabled(&self, enabled: bool) -> ErrorCode;

    /// `config` 为 `None` 时使用已保存的配置
    fn set_wifi_ap_enabled(&self, config: Option<&WifiApConfig>, enabled: bool) -> ErrorCode;
    fn wifi_ap_state(&self) -> WifiApState;
    fn wifi_ap_configuration(&self) -> Option<WifiApConfig>;
    fn set_wifi_ap_configuration(&self, config: &WifiApConfig) -> ErrorCode;

    /// `None` 表示没有蓝牙适配器
    fn bluetooth_adapter_state(&self) -> Option<AdapterState>;
    fn bluetooth_adapter_power(&self, on: bool);

    fn p2p_supported(&self) -> bool;
    fn p2p_enable_tethering(&self);
    fn p2p_disable_tethering(&self);
    /// 结果以 `P2pActionCompleted { action: CreateGroup, cycle, .. }` 投递
    fn p2p_create_group(&self, cycle: u64);
    /// 结果以 `P2pActionCompleted { action: RemoveGroup, cycle, .. }` 投递
    fn p2p_remove_group(&self, cycle: u64);
    fn p2p_tether_interface(&self) -> Option<String>;
    /// 结果以 `PersistentGroupsAvailable` 投递
    fn p2p_request_persistent_group_info(&self);
    /// 自治组当前是否在运行（用于启动时恢复）
    fn p2p_group_active(&self) -> bool {
        false
    }
}

/// 蓝牙 PAN profile 代理
pub trait PanProfile: Send + Sync {
    fn set_tethering(&self, on: bool);
    fn is_tethering_on(&self) -> bool;
    fn connected_device_count(&self) -> usize;
}

/// PAN profile 句柄
///
/// 连接回调可能运行在其他线程上，通过整体替换引用交接；
/// 读取方看到的要么是旧句柄，要么是新句柄。
#[derive(Default)]
pub struct PanHandle {
    inner: RwLock<Option<Arc<dyn PanProfile>>>,
}

impl PanHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, profile: Option<Arc<dyn PanProfile>>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = profile,
            Err(poisoned) => *poisoned.into_inner() = profile,
        }
    }

    pub fn get(&self) -> Option<Arc<dyn PanProfile>> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.get().is_some()
    }
}

/// 授权（provisioning）协作方
pub trait Provisioner: Send + Sync {
    fn is_provisioning_required(&self) -> bool;
    /// 是否注册了授权应用
    fn is_approval_app_available(&self) -> bool;
    /// 结果以 `ProvisioningCompleted { ticket, approved }` 投递
    fn launch(&self, ticket: Ticket);
    /// 复查结果以 `RecheckCompleted` 投递
    fn schedule_recheck(&self, kind: TransportKind);
    fn cancel_recheck(&self, kind: TransportKind);
}

/// P2P 自治组凭据
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GroupCredentials {
    #[serde(rename = "auto_network_name")]
    pub network_name: String,
    #[serde(rename = "auto_passphrase")]
    pub passphrase: String,
}

/// 凭据持久化协作方
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Option<GroupCredentials>>;
    fn save(&self, credentials: &GroupCredentials) -> anyhow::Result<()>;
    fn clear(&self) -> anyhow::Result<()>;
}

/// 不需要授权的默认实现
pub struct NoProvisioning;

impl Provisioner for NoProvisioning {
    fn is_provisioning_required(&self) -> bool {
        false
    }

    fn is_approval_app_available(&self) -> bool {
        false
    }

    fn launch(&self, ticket: Ticket) {
        log::warn!("Provisioning launched for {} without a provisioner", ticket.kind);
    }

    fn schedule_recheck(&self, _kind: TransportKind) {}

    fn cancel_recheck(&self, _kind: TransportKind) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakePan(AtomicBool);

    impl PanProfile for FakePan {
        fn set_tethering(&self, on: bool) {
            self.0.store(on, Ordering::SeqCst);
        }

        fn is_tethering_on(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn connected_device_count(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_pan_handle_swap() {
        let handle = PanHandle::new();
        assert!(!handle.is_connected());

        let pan: Arc<dyn PanProfile> = Arc::new(FakePan(AtomicBool::new(true)));
        handle.set(Some(pan));
        assert!(handle.get().is_some_and(|p| p.is_tethering_on()));

        handle.set(None);
        assert!(handle.get().is_none());
    }

    #[test]
    fn test_pan_handle_shared_across_threads() {
        let handle = Arc::new(PanHandle::new());
        let writer = {
            let handle = handle.clone();
            std::thread::spawn(move || {
                let pan: Arc<dyn PanProfile> = Arc::new(FakePan(AtomicBool::new(false)));
                handle.set(Some(pan));
            })
        };
        writer.join().unwrap();
        assert!(handle.is_connected());
    }

    #[test]
    fn test_credentials_field_names() {
        let creds = GroupCredentials {
            network_name: "DIRECT-ab".to_string(),
            passphrase: "secret12".to_string(),
        };
        let json = serde_json::to_string(&creds).unwrap();
        assert!(json.contains("\"auto_network_name\":\"DIRECT-ab\""));
        assert!(json.contains("\"auto_passphrase\":\"secret12\""));
    }
}
