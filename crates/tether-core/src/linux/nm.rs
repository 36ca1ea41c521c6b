//! NetworkManager D-Bus 客户端
//!
//! tethering 通过 NetworkManager 的 `ipv4.method=shared` 连接实现：
//! 共享连接激活后 NM 负责 DHCP 和 NAT。Wi-Fi AP 使用 AP 模式的共享连接。
//!
//! 引擎创建的连接都以固定前缀命名，便于识别和清理。

use std::collections::{BTreeSet, HashMap};
use std::ops::Deref;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use zbus::Connection;
use zbus::proxy;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

use crate::model::{ApSecurity, WifiApConfig};

/// 共享连接名前缀，后接接口名
pub const SHARED_PREFIX: &str = "tetherd-shared-";
/// Wi-Fi AP 连接名
pub const HOTSPOT_ID: &str = "tetherd-hotspot";

#[proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
trait NetworkManager {
    fn get_devices(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    fn activate_connection(
        &self,
        connection: &ObjectPath<'_>,
        device: &ObjectPath<'_>,
        specific_object: &ObjectPath<'_>,
    ) -> zbus::Result<OwnedObjectPath>;

    #[zbus(property)]
    fn version(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn active_connections(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager/Settings"
)]
trait NmSettings {
    fn add_connection(
        &self,
        connection: HashMap<&str, HashMap<&str, Value<'_>>>,
    ) -> zbus::Result<OwnedObjectPath>;

    fn list_connections(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings.Connection",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmConnection {
    fn get_settings(&self) -> zbus::Result<HashMap<String, HashMap<String, OwnedValue>>>;

    fn delete(&self) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Device",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmDevice {
    /// 设备接口名 (如 usb0)
    #[zbus(property)]
    fn interface(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn state(&self) -> zbus::Result<u32>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Connection.Active",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmActiveConnection {
    #[zbus(property)]
    fn id(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn state(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn devices(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
}

/// 设备状态常量
pub mod device_state {
    pub const ACTIVATED: u32 = 100;
    pub const FAILED: u32 = 120;
}

/// 连接状态常量
pub mod active_connection_state {
    pub const UNKNOWN: u32 = 0;
    pub const ACTIVATING: u32 = 1;
    pub const ACTIVATED: u32 = 2;
    pub const DEACTIVATING: u32 = 3;
    pub const DEACTIVATED: u32 = 4;

    pub fn name(state: u32) -> &'static str {
        match state {
            UNKNOWN => "UNKNOWN",
            ACTIVATING => "ACTIVATING",
            ACTIVATED => "ACTIVATED",
            DEACTIVATING => "DEACTIVATING",
            DEACTIVATED => "DEACTIVATED",
            _ => "INVALID",
        }
    }
}

/// 活动连接
#[derive(Debug, Clone)]
pub struct ActiveConnection {
    pub path: OwnedObjectPath,
    pub id: String,
    pub state: u32,
    pub interfaces: Vec<String>,
}

/// 一次查询得到的 tethering 相关状态
#[derive(Debug, Clone, Default)]
pub struct NmSnapshot {
    /// 共享连接已激活的接口
    pub shared: BTreeSet<String>,
    /// 设备状态为 FAILED 的接口
    pub failed: BTreeSet<String>,
    /// Wi-Fi AP 连接状态，未激活时为 `None`
    pub hotspot_state: Option<u32>,
    pub hotspot_interface: Option<String>,
}

#[derive(Clone)]
pub struct NmClient {
    connection: Connection,
}

impl NmClient {
    pub async fn new() -> Result<Self> {
        let connection = Connection::system()
            .await
            .context("Failed to connect to system D-Bus")?;

        let nm = NetworkManagerProxy::new(&connection).await?;
        let version = nm.version().await?;
        info!("Connected to NetworkManager {}", version);

        Ok(Self { connection })
    }

    pub async fn version(&self) -> Result<String> {
        let nm = NetworkManagerProxy::new(&self.connection).await?;
        nm.version().await.context("Failed to get NM version")
    }

    async fn device_interface(&self, path: &OwnedObjectPath) -> Result<(String, u32)> {
        let device = NmDeviceProxy::builder(&self.connection)
            .path(path)?
            .build()
            .await?;
        let interface = device.interface().await.unwrap_or_default();
        let state = device.state().await.unwrap_or(0);
        Ok((interface, state))
    }

    async fn find_device(&self, iface: &str) -> Result<Option<OwnedObjectPath>> {
        let nm = NetworkManagerProxy::new(&self.connection).await?;
        for path in nm.get_devices().await? {
            let (interface, _) = self.device_interface(&path).await?;
            if interface == iface {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    pub async fn active_connections(&self) -> Result<Vec<ActiveConnection>> {
        let nm = NetworkManagerProxy::new(&self.connection).await?;
        let mut result = Vec::new();

        for path in nm.active_connections().await? {
            let active = NmActiveConnectionProxy::builder(&self.connection)
                .path(&path)?
                .build()
                .await?;
            let id = active.id().await.unwrap_or_default();
            let state = active.state().await.unwrap_or(0);
            let mut interfaces = Vec::new();
            for device in active.devices().await.unwrap_or_default() {
                let (interface, _) = self.device_interface(&device).await?;
                interfaces.push(interface);
            }
            result.push(ActiveConnection {
                path,
                id,
                state,
                interfaces,
            });
        }
        Ok(result)
    }

    /// 查询共享连接、失败设备和热点状态
    pub async fn snapshot(&self) -> Result<NmSnapshot> {
        let mut snapshot = NmSnapshot::default();

        for active in self.active_connections().await? {
            if active.id == HOTSPOT_ID {
                snapshot.hotspot_state = Some(active.state);
                snapshot.hotspot_interface = active.interfaces.first().cloned();
                if active.state == active_connection_state::ACTIVATED {
                    snapshot.shared.extend(active.interfaces);
                }
            } else if active.id.starts_with(SHARED_PREFIX)
                && active.state == active_connection_state::ACTIVATED
            {
                snapshot.shared.extend(active.interfaces);
            }
        }

        let nm = NetworkManagerProxy::new(&self.connection).await?;
        for path in nm.get_devices().await? {
            let (interface, state) = self.device_interface(&path).await?;
            if state == device_state::FAILED {
                snapshot.failed.insert(interface);
            }
        }
        Ok(snapshot)
    }

    /// 为接口创建并激活共享连接
    pub async fn share_interface(&self, iface: &str) -> Result<()> {
        let id = format!("{}{}", SHARED_PREFIX, iface);
        let _ = self.delete_connection_by_name(&id).await;

        let device = self
            .find_device(iface)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Device {} not managed by NetworkManager", iface))?;

        let settings = NmSettingsProxy::new(&self.connection).await?;
        let conn_path = settings
            .add_connection(build_shared_settings(&id, iface))
            .await
            .with_context(|| format!("Failed to create shared connection for {}", iface))?;

        let active = self.activate_connection(&conn_path, &device).await?;
        self.wait_for_activation(&active.as_ref(), Duration::from_secs(15))
            .await?;
        info!("Sharing connection on {}", iface);
        Ok(())
    }

    /// 停用并删除接口的共享连接
    pub async fn unshare_interface(&self, iface: &str) -> Result<bool> {
        let id = format!("{}{}", SHARED_PREFIX, iface);
        let deleted = self.delete_connection_by_name(&id).await?;
        if deleted {
            info!("Stopped sharing on {}", iface);
        }
        Ok(deleted)
    }

    pub async fn start_hotspot(&self, iface: &str, config: &WifiApConfig) -> Result<()> {
        let _ = self.delete_connection_by_name(HOTSPOT_ID).await;

        let device = self
            .find_device(iface)
            .await?
            .ok_or_else(|| anyhow::anyhow!("WiFi device {} not found", iface))?;

        let settings = NmSettingsProxy::new(&self.connection).await?;
        let conn_path = settings
            .add_connection(build_hotspot_settings(config, iface))
            .await
            .context("Failed to create hotspot connection")?;

        let active = self.activate_connection(&conn_path, &device).await?;
        self.wait_for_activation(&active.as_ref(), Duration::from_secs(15))
            .await?;
        info!("Hotspot {} active on {}", config.ssid, iface);
        Ok(())
    }

    pub async fn stop_hotspot(&self) -> Result<()> {
        self.delete_connection_by_name(HOTSPOT_ID).await?;
        Ok(())
    }

    async fn activate_connection(
        &self,
        connection_path: &OwnedObjectPath,
        device: &OwnedObjectPath,
    ) -> Result<OwnedObjectPath> {
        let nm = NetworkManagerProxy::new(&self.connection).await?;
        let active_conn = nm
            .activate_connection(
                &connection_path.as_ref(),
                &device.as_ref(),
                &ObjectPath::from_static_str_unchecked("/"),
            )
            .await
            .context("Failed to activate connection")?;

        debug!("Activated connection: {:?}", active_conn);
        Ok(active_conn)
    }

    /// 删除连接（通过名称），激活中的连接会被一并停用
    pub async fn delete_connection_by_name(&self, name: &str) -> Result<bool> {
        let settings = NmSettingsProxy::new(&self.connection).await?;
        let connections = settings.list_connections().await?;

        for conn_path in connections {
            let conn = NmConnectionProxy::builder(&self.connection)
                .path(&conn_path)?
                .build()
                .await?;

            if let Ok(conn_settings) = conn.get_settings().await
                && let Some(connection_section) = conn_settings.get("connection")
                && let Some(id_value) = connection_section.get("id")
                && let Value::Str(id_str) = id_value.deref()
                && id_str.as_str() == name
            {
                conn.delete().await?;
                debug!("Deleted connection by name: {}", name);
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// 等待连接激活（不等待IP配置）
    pub async fn wait_for_activation(
        &self,
        active_connection: &ObjectPath<'_>,
        timeout: Duration,
    ) -> Result<()> {
        let start = std::time::Instant::now();
        let mut last_state = 0u32;

        loop {
            if start.elapsed() > timeout {
                return Err(anyhow::anyhow!(
                    "Timeout waiting for connection activation (last state: {})",
                    active_connection_state::name(last_state)
                ));
            }

            let active = NmActiveConnectionProxy::builder(&self.connection)
                .path(active_connection)?
                .build()
                .await?;

            let state = active.state().await.unwrap_or(0);
            if state != last_state {
                debug!(
                    "Connection state changed: {} -> {}",
                    active_connection_state::name(last_state),
                    active_connection_state::name(state)
                );
                last_state = state;
            }

            match state {
                active_connection_state::ACTIVATED => return Ok(()),
                active_connection_state::DEACTIVATED | active_connection_state::DEACTIVATING => {
                    return Err(anyhow::anyhow!(
                        "Connection failed to activate (state: {})",
                        active_connection_state::name(state)
                    ));
                }
                _ => {}
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// 有线类接口（USB gadget、bnep）的共享连接设置
fn build_shared_settings<'a>(id: &'a str, iface: &'a str) -> HashMap<&'a str, HashMap<&'a str, Value<'a>>> {
    let mut settings: HashMap<&str, HashMap<&str, Value>> = HashMap::new();

    let mut connection: HashMap<&str, Value> = HashMap::new();
    connection.insert("id", Value::Str(id.into()));
    connection.insert("type", Value::Str("802-3-ethernet".into()));
    connection.insert("autoconnect", Value::Bool(false));
    connection.insert("interface-name", Value::Str(iface.into()));
    settings.insert("connection", connection);

    let mut ipv4: HashMap<&str, Value> = HashMap::new();
    ipv4.insert("method", Value::Str("shared".into()));
    settings.insert("ipv4", ipv4);

    let mut ipv6: HashMap<&str, Value> = HashMap::new();
    ipv6.insert("method", Value::Str("ignore".into()));
    settings.insert("ipv6", ipv6);

    settings
}

/// AP 模式共享连接设置
fn build_hotspot_settings<'a>(
    config: &'a WifiApConfig,
    iface: &'a str,
) -> HashMap<&'a str, HashMap<&'a str, Value<'a>>> {
    let mut settings: HashMap<&str, HashMap<&str, Value>> = HashMap::new();

    let mut connection: HashMap<&str, Value> = HashMap::new();
    connection.insert("id", Value::Str(HOTSPOT_ID.into()));
    connection.insert("type", Value::Str("802-11-wireless".into()));
    connection.insert("autoconnect", Value::Bool(false));
    connection.insert("interface-name", Value::Str(iface.into()));
    settings.insert("connection", connection);

    let mut wireless: HashMap<&str, Value> = HashMap::new();
    wireless.insert("ssid", Value::Array(config.ssid.as_bytes().into()));
    wireless.insert("mode", Value::Str("ap".into()));
    settings.insert("802-11-wireless", wireless);

    if config.security == ApSecurity::Wpa2Psk
        && let Some(psk) = config.passphrase.as_deref()
    {
        let mut wireless_security: HashMap<&str, Value> = HashMap::new();
        wireless_security.insert("key-mgmt", Value::Str("wpa-psk".into()));
        wireless_security.insert("psk", Value::Str(psk.into()));
        settings.insert("802-11-wireless-security", wireless_security);
    }

    let mut ipv4: HashMap<&str, Value> = HashMap::new();
    ipv4.insert("method", Value::Str("shared".into()));
    settings.insert("ipv4", ipv4);

    let mut ipv6: HashMap<&str, Value> = HashMap::new();
    ipv6.insert("method", Value::Str("ignore".into()));
    settings.insert("ipv6", ipv6);

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_settings() {
        let settings = build_shared_settings("tetherd-shared-usb0", "usb0");
        assert_eq!(
            settings["connection"]["interface-name"],
            Value::Str("usb0".into())
        );
        assert_eq!(settings["ipv4"]["method"], Value::Str("shared".into()));
    }

    #[test]
    fn test_open_hotspot_has_no_security_section() {
        let config = WifiApConfig {
            ssid: "Cafe".to_string(),
            security: ApSecurity::Open,
            passphrase: None,
        };
        let settings = build_hotspot_settings(&config, "wlan0");
        assert!(!settings.contains_key("802-11-wireless-security"));
        assert_eq!(settings["802-11-wireless"]["mode"], Value::Str("ap".into()));
    }

    #[test]
    fn test_wpa2_hotspot_settings() {
        let config = WifiApConfig {
            ssid: "Home".to_string(),
            security: ApSecurity::Wpa2Psk,
            passphrase: Some("longenough".to_string()),
        };
        let settings = build_hotspot_settings(&config, "wlan0");
        assert_eq!(
            settings["802-11-wireless-security"]["psk"],
            Value::Str("longenough".into())
        );
        assert_eq!(settings["connection"]["id"], Value::Str(HOTSPOT_ID.into()));
    }

    #[tokio::test]
    #[ignore = "requires system D-Bus and NetworkManager"]
    async fn test_nm_client_version() {
        let client = NmClient::new().await.unwrap();
        let version = client.version().await.unwrap();
        assert!(!version.is_empty());
    }

    #[tokio::test]
    #[ignore = "requires system D-Bus and NetworkManager"]
    async fn test_nm_snapshot() {
        let client = NmClient::new().await.unwrap();
        let snapshot = client.snapshot().await.unwrap();
        println!("Shared interfaces: {:?}", snapshot.shared);
    }
}
