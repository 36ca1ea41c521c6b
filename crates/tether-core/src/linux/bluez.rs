//! BlueZ D-Bus 客户端
//!
//! 适配器电源通过 `org.bluez.Adapter1.Powered` 控制；
//! 蓝牙 PAN tethering 通过 `org.bluez.NetworkServer1` 注册 NAP 服务，
//! 连接上来的设备会得到 `bnepN` 接口并加入网桥。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use zbus::Connection;
use zbus::proxy;

use crate::hal::PanProfile;
use crate::model::AdapterState;
use crate::resolver::PatternSet;

use super::sysfs::Sysfs;

/// NAP 服务注册使用的网桥名
pub const PAN_BRIDGE: &str = "bt-pan";

#[proxy(
    interface = "org.bluez.Adapter1",
    default_service = "org.bluez",
    default_path = "/org/bluez/hci0"
)]
trait Adapter1 {
    #[zbus(property)]
    fn powered(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_powered(&self, value: bool) -> zbus::Result<()>;

    /// "on" / "off" / "off-enabling" / "on-disabling" / "off-blocked"
    #[zbus(property)]
    fn power_state(&self) -> zbus::Result<String>;
}

#[proxy(
    interface = "org.bluez.NetworkServer1",
    default_service = "org.bluez",
    default_path = "/org/bluez/hci0"
)]
trait NetworkServer1 {
    fn register(&self, uuid: &str, bridge: &str) -> zbus::Result<()>;

    fn unregister(&self, uuid: &str) -> zbus::Result<()>;
}

/// `Adapter1.PowerState` 映射到适配器状态
pub fn parse_power_state(value: &str) -> AdapterState {
    match value {
        "on" => AdapterState::On,
        "off" => AdapterState::Off,
        "off-enabling" => AdapterState::TurningOn,
        "on-disabling" => AdapterState::TurningOff,
        _ => AdapterState::Error,
    }
}

pub struct BluezClient {
    connection: Connection,
}

impl BluezClient {
    pub async fn new() -> Result<Self> {
        let connection = Connection::system()
            .await
            .context("Failed to connect to system D-Bus")?;
        Ok(Self { connection })
    }

    /// 读取适配器状态，适配器不存在时返回 `None`
    pub async fn adapter_state(&self) -> Option<AdapterState> {
        let adapter = Adapter1Proxy::new(&self.connection).await.ok()?;
        match adapter.power_state().await {
            Ok(state) => Some(parse_power_state(&state)),
            // 旧版 BlueZ 没有 PowerState
            Err(_) => match adapter.powered().await {
                Ok(true) => Some(AdapterState::On),
                Ok(false) => Some(AdapterState::Off),
                Err(e) => {
                    debug!("No Bluetooth adapter: {}", e);
                    None
                }
            },
        }
    }

    pub async fn set_powered(&self, on: bool) -> Result<()> {
        let adapter = Adapter1Proxy::new(&self.connection).await?;
        adapter
            .set_powered(on)
            .await
            .context("Failed to set adapter power")?;
        info!("Bluetooth adapter powered {}", if on { "on" } else { "off" });
        Ok(())
    }

    pub async fn register_nap(&self) -> Result<()> {
        let server = NetworkServer1Proxy::new(&self.connection).await?;
        server
            .register("nap", PAN_BRIDGE)
            .await
            .context("Failed to register NAP server")?;
        Ok(())
    }

    pub async fn unregister_nap(&self) -> Result<()> {
        let server = NetworkServer1Proxy::new(&self.connection).await?;
        server
            .unregister("nap")
            .await
            .context("Failed to unregister NAP server")?;
        Ok(())
    }
}

/// 基于 BlueZ NAP 服务的 PAN profile
pub struct BluezPan {
    client: Arc<BluezClient>,
    runtime: tokio::runtime::Handle,
    sysfs: Sysfs,
    bnep: PatternSet,
    tethering: Arc<AtomicBool>,
}

impl BluezPan {
    pub fn new(client: Arc<BluezClient>, runtime: tokio::runtime::Handle, sysfs: Sysfs) -> Self {
        Self {
            client,
            runtime,
            sysfs,
            bnep: PatternSet::new([r"bnep\d+"]).unwrap_or_default(),
            tethering: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl PanProfile for BluezPan {
    fn set_tethering(&self, on: bool) {
        self.tethering.store(on, Ordering::SeqCst);
        let client = self.client.clone();
        let tethering = self.tethering.clone();
        self.runtime.spawn(async move {
            let result = if on {
                client.register_nap().await
            } else {
                client.unregister_nap().await
            };
            match result {
                Ok(()) => info!("Bluetooth NAP {}", if on { "registered" } else { "unregistered" }),
                Err(e) => {
                    warn!("Bluetooth NAP update failed: {:#}", e);
                    if on {
                        tethering.store(false, Ordering::SeqCst);
                    }
                }
            }
        });
    }

    fn is_tethering_on(&self) -> bool {
        self.tethering.load(Ordering::SeqCst)
    }

    fn connected_device_count(&self) -> usize {
        self.sysfs
            .interfaces()
            .iter()
            .filter(|iface| self.bnep.matches(iface))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_power_state() {
        assert_eq!(parse_power_state("on"), AdapterState::On);
        assert_eq!(parse_power_state("off-enabling"), AdapterState::TurningOn);
        assert_eq!(parse_power_state("on-disabling"), AdapterState::TurningOff);
        assert_eq!(parse_power_state("off-blocked"), AdapterState::Error);
    }

    #[tokio::test]
    #[ignore = "requires system D-Bus and BlueZ"]
    async fn test_adapter_state() {
        let client = BluezClient::new().await.unwrap();
        println!("Adapter state: {:?}", client.adapter_state().await);
    }
}
