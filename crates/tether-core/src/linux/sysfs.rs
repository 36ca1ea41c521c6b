//! sysfs 读取
//!
//! 网络接口列表来自 `/sys/class/net`，USB gadget 连接状态来自 `/sys/class/udc/*/state`。

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

/// UDC 处于该状态时表示已被主机枚举
const UDC_CONFIGURED: &str = "configured";

#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn net_dir(&self) -> PathBuf {
        self.root.join("class").join("net")
    }

    /// 所有网络接口名（不含 `lo`），按名称排序
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(self.net_dir()) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|name| name != "lo")
                .collect(),
            Err(e) => {
                debug!("Failed to list {:?}: {}", self.net_dir(), e);
                Vec::new()
            }
        };
        names.sort();
        names
    }

    pub fn has_interface(&self, iface: &str) -> bool {
        self.net_dir().join(iface).exists()
    }

    /// 接口是否为无线网卡
    pub fn is_wireless(&self, iface: &str) -> bool {
        let dir = self.net_dir().join(iface);
        dir.join("wireless").exists() || dir.join("phy80211").exists()
    }

    /// 任一 UDC 已被主机配置即视为 USB 已连接
    pub fn usb_connected(&self) -> bool {
        let udc_dir = self.root.join("class").join("udc");
        let Ok(entries) = fs::read_dir(&udc_dir) else {
            return false;
        };
        entries
            .filter_map(|e| e.ok())
            .any(|e| read_trimmed(&e.path().join("state")).is_some_and(|s| s == UDC_CONFIGURED))
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs() -> (tempfile::TempDir, Sysfs) {
        let dir = tempfile::tempdir().unwrap();
        let net = dir.path().join("class").join("net");
        for iface in ["lo", "usb0", "wlan0", "bnep0"] {
            fs::create_dir_all(net.join(iface)).unwrap();
        }
        fs::create_dir_all(net.join("wlan0").join("phy80211")).unwrap();
        let sysfs = Sysfs::new(dir.path());
        (dir, sysfs)
    }

    #[test]
    fn test_interfaces_skip_loopback() {
        let (_dir, sysfs) = fake_sysfs();
        assert_eq!(sysfs.interfaces(), vec!["bnep0", "usb0", "wlan0"]);
        assert!(sysfs.has_interface("usb0"));
        assert!(sysfs.is_wireless("wlan0"));
        assert!(!sysfs.is_wireless("usb0"));
    }

    #[test]
    fn test_usb_connected_from_udc_state() {
        let (dir, sysfs) = fake_sysfs();
        assert!(!sysfs.usb_connected());

        let udc = dir.path().join("class").join("udc").join("musb-hdrc.0");
        fs::create_dir_all(&udc).unwrap();
        fs::write(udc.join("state"), "not attached\n").unwrap();
        assert!(!sysfs.usb_connected());

        fs::write(udc.join("state"), "configured\n").unwrap();
        assert!(sysfs.usb_connected());
    }

    #[test]
    fn test_missing_root_is_empty() {
        let sysfs = Sysfs::new("/nonexistent/sysfs/root");
        assert!(sysfs.interfaces().is_empty());
        assert!(!sysfs.usb_connected());
    }
}
