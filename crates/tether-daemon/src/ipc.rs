//! IPC Server - Unix Domain Socket 通信

use anyhow::Result;
use tether_core::ipc::{socket_path, IpcRequest, IpcResponse};
use tether_core::{DispatcherHandle, TetherError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};

pub async fn run_ipc_server(handle: DispatcherHandle) -> Result<()> {
    let path = socket_path();

    // 删除旧的 socket 文件
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    tracing::info!("IPC server listening on {:?}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, handle).await {
                        tracing::debug!("IPC client error: {:#}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &IpcResponse) -> Result<()> {
    writer
        .write_all(serde_json::to_string(response)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

fn command_response(result: tether_core::Result<()>, message: String) -> IpcResponse {
    match result {
        Ok(()) => IpcResponse::Ok { message },
        Err(e) => IpcResponse::Error {
            message: e.to_string(),
        },
    }
}

async fn handle_client(stream: UnixStream, handle: DispatcherHandle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let request: IpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = IpcResponse::Error {
                    message: format!("Invalid request: {}", e),
                };
                write_response(&mut writer, &resp).await?;
                line.clear();
                continue;
            }
        };

        tracing::debug!("Request: {:?}", request);

        let response = match request {
            IpcRequest::Status => IpcResponse::Status {
                snapshot: handle.snapshot(),
            },
            IpcRequest::Enable { transport } => {
                tracing::info!("Enabling {} tethering", transport);
                command_response(
                    handle.set_enabled(transport, true).await,
                    format!("{} tethering enabling", transport),
                )
            }
            IpcRequest::Disable { transport } => {
                tracing::info!("Disabling {} tethering", transport);
                command_response(
                    handle.set_enabled(transport, false).await,
                    format!("{} tethering disabled", transport),
                )
            }
            IpcRequest::ConfigureWifiAp { config } => {
                let ssid = config.ssid.clone();
                command_response(
                    handle.configure_wifi_ap(config).await,
                    format!("Wi-Fi AP configured as {}", ssid),
                )
            }
            IpcRequest::Watch => return watch_status(&mut writer, &handle).await,
        };

        write_response(&mut writer, &response).await?;
        line.clear();
    }

    Ok(())
}

/// 推送状态快照，直到客户端断开或调度器停止
async fn watch_status(writer: &mut OwnedWriteHalf, handle: &DispatcherHandle) -> Result<()> {
    let mut state = handle.subscribe();
    loop {
        let snapshot = state.borrow_and_update().clone();
        write_response(writer, &IpcResponse::Status { snapshot }).await?;
        if state.changed().await.is_err() {
            let resp = IpcResponse::Error {
                message: TetherError::Closed.to_string(),
            };
            return write_response(writer, &resp).await;
        }
    }
}
