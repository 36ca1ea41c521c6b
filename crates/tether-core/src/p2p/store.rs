//! P2P-GO 凭据持久化
//!
//! 以 TOML 保存 `auto_network_name` 和 `auto_passphrase` 两个字段。

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use log::debug;

use crate::hal::{CredentialStore, GroupCredentials};

pub struct FileCredentialStore {
    path: PathBuf,
    // 串行化同一文件的读写
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// 默认路径: `<data_dir>/tetherd/p2p_credentials.toml`
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tetherd")
            .join("p2p_credentials.toml")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> anyhow::Result<Option<GroupCredentials>> {
        let _guard = self.lock.lock().map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?;
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {:?}", self.path))?;
        let creds = toml::from_str(&content).context("Failed to parse P2P-GO credentials")?;
        Ok(Some(creds))
    }

    fn save(&self, credentials: &GroupCredentials) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(credentials)?;
        fs::write(&self.path, content)?;
        debug!("Saved P2P-GO credentials to {:?}", self.path);
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?;
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            debug!("Removed P2P-GO credentials at {:?}", self.path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("nested").join("creds.toml"));

        assert!(store.load().unwrap().is_none());

        let creds = GroupCredentials {
            network_name: "DIRECT-Tether".to_string(),
            passphrase: "abc12345".to_string(),
        };
        store.save(&creds).unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("auto_network_name"));
        assert!(content.contains("auto_passphrase"));
        assert_eq!(store.load().unwrap(), Some(creds));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        // 重复清除不报错
        store.clear().unwrap();
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.toml");
        std::fs::write(&path, "not = [valid").unwrap();

        let store = FileCredentialStore::new(path);
        assert!(store.load().is_err());
    }
}
