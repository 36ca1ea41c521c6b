//! Tether Daemon
//!
//! 后台守护进程，负责：
//! - 持有编排引擎，在单个调度器任务上串行处理事件
//! - 轮询 NetworkManager / BlueZ / sysfs 状态
//! - 通过 Unix Socket 与 CLI 通信

mod ipc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::linux::{CommandProvisioner, LinuxHal};
use tether_core::{
    Dispatcher, Engine, FileCredentialStore, NoProvisioning, PanHandle, Provisioner, TetherConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tetherd", version, about = "Tethering orchestration daemon")]
struct Args {
    /// 配置文件路径 (默认: ~/.config/tetherd/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（tether-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tether_core=debug")),
        )
        .try_init();

    let args = Args::parse();
    tracing::info!("Tether daemon starting...");

    let config = match &args.config {
        Some(path) => TetherConfig::load_from(path),
        None => TetherConfig::load(),
    };
    let options = config
        .engine_options()
        .context("Invalid interface patterns in config")?;

    let runtime = tokio::runtime::Handle::current();
    let (sink, inbox) = tether_core::channel();
    let pan = Arc::new(PanHandle::new());

    let hal = LinuxHal::new(&config, sink.clone(), runtime.clone(), pan.clone())
        .context("Failed to initialize Linux backend")?;
    hal.prime().await;

    let provisioner: Arc<dyn Provisioner> = if config.provisioning.is_required() {
        Arc::new(CommandProvisioner::new(
            config.provisioning.clone(),
            sink.clone(),
            runtime,
        ))
    } else {
        Arc::new(NoProvisioning)
    };
    let store = Arc::new(FileCredentialStore::new(config.credentials_path()));

    let engine = Engine::new(Arc::new(hal.clone()), pan, provisioner, store, options);
    let (dispatcher, handle) = Dispatcher::new(engine, inbox, sink);

    let poll_interval = Duration::from_secs(config.bridge_poll_interval_secs.max(1));
    let dispatcher_handle = tokio::spawn(dispatcher.run());
    let monitor_handle = tokio::spawn(hal.monitor(poll_interval));
    let ipc_handle = tokio::spawn(ipc::run_ipc_server(handle.clone()));

    // 等待任一任务完成
    tokio::select! {
        res = dispatcher_handle => {
            tracing::error!("Dispatcher exited: {:?}", res);
        }
        res = monitor_handle => {
            tracing::error!("Monitor exited: {:?}", res);
        }
        res = ipc_handle => {
            tracing::error!("IPC server exited: {:?}", res);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            handle.shutdown();
        }
    }

    let _ = std::fs::remove_file(tether_core::ipc::socket_path());
    Ok(())
}
