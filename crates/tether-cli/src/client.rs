//! IPC Client - 与守护进程通信

use anyhow::Result;
use tether_core::TetherSnapshot;
use tether_core::ipc::{IpcRequest, IpcResponse, socket_path};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;

async fn connect(request: &IpcRequest) -> Result<BufReader<OwnedReadHalf>> {
    let path = socket_path();

    let stream = match UnixStream::connect(&path).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ 无法连接到守护进程: {}", e);
            eprintln!("   请确保 tetherd 正在运行");
            return Err(e.into());
        }
    };

    let (reader, mut writer) = stream.into_split();

    // 发送请求
    let json = serde_json::to_string(request)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    Ok(BufReader::new(reader))
}

async fn read_response(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<IpcResponse>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&line)?))
}

pub async fn send_request(request: IpcRequest) -> Result<IpcResponse> {
    let mut reader = connect(&request).await?;
    let response = read_response(&mut reader)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Daemon closed the connection"))?;

    match &response {
        IpcResponse::Ok { message } => println!("✅ {}", message),
        IpcResponse::Error { message } => {
            eprintln!("❌ {}", message);
            anyhow::bail!("{}", message);
        }
        IpcResponse::Status { .. } => {}
    }

    Ok(response)
}

/// 订阅状态变化，每收到一个快照调用一次 `on_snapshot`
pub async fn watch(mut on_snapshot: impl FnMut(&TetherSnapshot)) -> Result<()> {
    let mut reader = connect(&IpcRequest::Watch).await?;
    while let Some(response) = read_response(&mut reader).await? {
        match response {
            IpcResponse::Status { snapshot } => on_snapshot(&snapshot),
            IpcResponse::Error { message } => anyhow::bail!("{}", message),
            IpcResponse::Ok { .. } => {}
        }
    }
    Ok(())
}
