//! 守护进程配置和持久化
//!
//! 提供接口名模式、授权命令、无线接口等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::EngineOptions;
use crate::error::Result;
use crate::model::WifiApConfig;
use crate::resolver::{PatternSet, TransportPatterns};

/// 授权（provisioning）设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningSettings {
    /// 授权命令，退出码 0 表示批准；为空时不需要授权
    pub app: Option<String>,
    pub args: Vec<String>,
    /// 批准后的复查间隔（秒）
    pub recheck_interval_secs: u64,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            app: None,
            args: Vec::new(),
            recheck_interval_secs: 24 * 60 * 60,
        }
    }
}

impl ProvisioningSettings {
    pub fn is_required(&self) -> bool {
        self.app.is_some()
    }
}

/// 守护进程设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// USB 网络接口名模式
    pub usb_patterns: Vec<String>,
    /// Wi-Fi AP 接口名模式
    pub wifi_patterns: Vec<String>,
    /// 蓝牙 PAN 接口名模式
    pub bluetooth_patterns: Vec<String>,
    /// 禁止当前用户使用 tethering
    pub restricted: bool,
    pub p2p_enabled: bool,
    /// 用于 Wi-Fi AP 的无线接口
    pub wifi_interface: String,
    /// wpa_supplicant 的 P2P 设备接口
    pub p2p_interface: String,
    /// 轮询系统状态的间隔（秒）
    pub bridge_poll_interval_secs: u64,
    /// P2P-GO 凭据文件，默认放在数据目录
    pub credentials_path: Option<PathBuf>,
    /// 启动时使用的 Wi-Fi AP 配置
    pub wifi_ap: Option<WifiApConfig>,
    pub provisioning: ProvisioningSettings,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            usb_patterns: vec![r"usb\d+".to_string(), r"rndis\d+".to_string()],
            wifi_patterns: vec![r"wlan\d+".to_string(), r"ap\d+".to_string()],
            bluetooth_patterns: vec![r"bnep\d+".to_string(), "bt-pan".to_string()],
            restricted: false,
            p2p_enabled: true,
            wifi_interface: "wlan0".to_string(),
            p2p_interface: "wlan0".to_string(),
            bridge_poll_interval_secs: 2,
            credentials_path: None,
            wifi_ap: None,
            provisioning: ProvisioningSettings::default(),
        }
    }
}

impl TetherConfig {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tetherd")
            .join("config.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        debug!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse config: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved config to {:?}", path);
        Ok(())
    }

    /// 编译接口名模式，任一模式无效即失败
    pub fn patterns(&self) -> Result<TransportPatterns> {
        Ok(TransportPatterns {
            usb: PatternSet::new(&self.usb_patterns)?,
            wifi: PatternSet::new(&self.wifi_patterns)?,
            bluetooth: PatternSet::new(&self.bluetooth_patterns)?,
        })
    }

    pub fn engine_options(&self) -> Result<EngineOptions> {
        Ok(EngineOptions {
            patterns: self.patterns()?,
            restricted: self.restricted,
            p2p_enabled: self.p2p_enabled,
        })
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_path
            .clone()
            .unwrap_or_else(crate::p2p::FileCredentialStore::default_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TetherError;

    #[test]
    fn test_default_patterns_compile() {
        let patterns = TetherConfig::default().patterns().unwrap();
        assert!(patterns.usb.matches("rndis0"));
        assert!(patterns.wifi.matches("wlan1"));
        assert!(patterns.bluetooth.matches("bt-pan"));
        assert!(!patterns.usb.matches("wlan0"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let config = TetherConfig {
            usb_patterns: vec!["usb(".to_string()],
            ..Default::default()
        };
        let err = config.patterns().unwrap_err();
        assert!(matches!(err, TetherError::InvalidPattern { .. }));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "restricted = true\n\n[provisioning]\napp = \"/usr/bin/true\"\n",
        )
        .unwrap();

        let config = TetherConfig::load_from(&path);
        assert!(config.restricted);
        assert!(config.provisioning.is_required());
        assert_eq!(config.provisioning.recheck_interval_secs, 24 * 60 * 60);
        assert_eq!(config.wifi_interface, "wlan0");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tetherd").join("config.toml");
        let config = TetherConfig {
            p2p_enabled: false,
            bluetooth_patterns: Vec::new(),
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(TetherConfig::load_from(&path), config);
    }

    #[test]
    fn test_wifi_ap_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[wifi_ap]\nssid = \"MyHotspot\"\nsecurity = \"wpa2_psk\"\npassphrase = \"abc12345\"\n",
        )
        .unwrap();

        let config = TetherConfig::load_from(&path);
        let ap = config.wifi_ap.unwrap();
        assert_eq!(ap.ssid, "MyHotspot");
        assert!(ap.validate().is_ok());
    }

    #[test]
    fn test_unparsable_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "restricted = [").unwrap();
        assert_eq!(TetherConfig::load_from(&path), TetherConfig::default());
    }
}
