//! wpa_supplicant P2P 控制
//!
//! 通过 `wpa_cli` 创建/删除自治组，查询组的 SSID 和密码。

use anyhow::{Context, Result};
use log::debug;
use tokio::process::Command;

use crate::hal::GroupCredentials;

/// 自治组接口名前缀，例如 `p2p-wlan0-0`
pub const GROUP_PREFIX: &str = "p2p-";

#[derive(Debug, Clone)]
pub struct WpaCli {
    /// P2P 设备接口（通常是 wlan0）
    interface: String,
}

impl WpaCli {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    async fn run(&self, iface: &str, args: &[&str]) -> Result<String> {
        let output = Command::new("wpa_cli")
            .arg("-i")
            .arg(iface)
            .args(args)
            .output()
            .await
            .context("Failed to run wpa_cli")?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!("wpa_cli {} failed: {}", args.join(" "), err.trim()));
        }
        debug!("wpa_cli -i {} {} -> {}", iface, args.join(" "), stdout.trim());
        Ok(stdout)
    }

    /// 创建持久自治组
    pub async fn group_add(&self) -> Result<()> {
        let out = self.run(&self.interface, &["p2p_group_add", "persistent"]).await?;
        expect_ok(&out)
    }

    pub async fn group_remove(&self, group_iface: &str) -> Result<()> {
        let out = self.run(&self.interface, &["p2p_group_remove", group_iface]).await?;
        expect_ok(&out)
    }

    /// 查询组的网络名和密码
    pub async fn group_credentials(&self, group_iface: &str) -> Result<GroupCredentials> {
        let status = self.run(group_iface, &["status"]).await?;
        let network_name = status_field(&status, "ssid")
            .ok_or_else(|| anyhow::anyhow!("No ssid in status of {}", group_iface))?
            .to_string();

        let passphrase = self.run(group_iface, &["p2p_get_passphrase"]).await?;
        let passphrase = passphrase.trim();
        if passphrase.is_empty() || passphrase == "FAIL" {
            return Err(anyhow::anyhow!("No passphrase for group {}", group_iface));
        }

        Ok(GroupCredentials {
            network_name,
            passphrase: passphrase.to_string(),
        })
    }
}

fn expect_ok(output: &str) -> Result<()> {
    match output.trim() {
        "OK" => Ok(()),
        other => Err(anyhow::anyhow!("wpa_cli returned {}", other)),
    }
}

/// 从 `status` 输出中取 `key=value` 字段
pub fn status_field<'a>(status: &'a str, key: &str) -> Option<&'a str> {
    status.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then_some(v.trim())
    })
}

/// 在接口列表中找到自治组接口
pub fn find_group_interface<'a, I>(interfaces: I) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    interfaces
        .into_iter()
        .find(|iface| iface.starts_with(GROUP_PREFIX) && !iface.starts_with("p2p-dev-"))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "bssid=02:00:00:00:01:00\nfreq=5180\nssid=DIRECT-xy-tetherd\nid=0\nmode=P2P GO\nwpa_state=COMPLETED\n";

    #[test]
    fn test_status_field() {
        assert_eq!(status_field(STATUS, "ssid"), Some("DIRECT-xy-tetherd"));
        assert_eq!(status_field(STATUS, "mode"), Some("P2P GO"));
        // bssid 不应匹配 ssid
        assert_eq!(status_field("bssid=aa\n", "ssid"), None);
    }

    #[test]
    fn test_expect_ok() {
        assert!(expect_ok("OK\n").is_ok());
        assert!(expect_ok("FAIL\n").is_err());
    }

    #[test]
    fn test_find_group_interface() {
        let ifaces = vec![
            "lo".to_string(),
            "p2p-dev-wlan0".to_string(),
            "p2p-wlan0-3".to_string(),
            "wlan0".to_string(),
        ];
        assert_eq!(find_group_interface(&ifaces), Some("p2p-wlan0-3".to_string()));
        assert_eq!(find_group_interface(&ifaces[..2]), None);
    }
}
