//! IPC 协议
//!
//! 守护进程和命令行客户端之间通过 Unix Socket 交换 JSON 行，每行一条请求或响应。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::engine::TetherSnapshot;
use crate::model::{TransportKind, WifiApConfig};

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("tetherd.sock")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum IpcRequest {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "enable")]
    Enable { transport: TransportKind },
    #[serde(rename = "disable")]
    Disable { transport: TransportKind },
    #[serde(rename = "configure_wifi_ap")]
    ConfigureWifiAp { config: WifiApConfig },
    /// 每次状态变化推送一条 `status` 响应，直到连接关闭
    #[serde(rename = "watch")]
    Watch,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum IpcResponse {
    #[serde(rename = "ok")]
    Ok { message: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "status")]
    Status { snapshot: TetherSnapshot },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = IpcRequest::Enable {
            transport: TransportKind::WifiAp,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"type":"enable","transport":"wifi_ap"}"#);

        let parsed: IpcRequest = serde_json::from_str(r#"{"type":"status"}"#).unwrap();
        assert_eq!(parsed, IpcRequest::Status);
    }

    #[test]
    fn test_configure_request_parses() {
        let line = r#"{"type":"configure_wifi_ap","config":{"ssid":"MyHotspot","security":"wpa2_psk","passphrase":"abc12345"}}"#;
        match serde_json::from_str::<IpcRequest>(line).unwrap() {
            IpcRequest::ConfigureWifiAp { config } => {
                assert_eq!(config.ssid, "MyHotspot");
                assert_eq!(config.passphrase.as_deref(), Some("abc12345"));
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_status_response_carries_snapshot() {
        let response = IpcResponse::Status {
            snapshot: TetherSnapshot::default(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.starts_with(r#"{"type":"status","snapshot":"#));
        let parsed: IpcResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, response);
    }
}
