//! Tether CLI
//!
//! 命令行客户端，通过 Unix Socket 与守护进程通信

mod client;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tether_core::ipc::{IpcRequest, IpcResponse};
use tether_core::{ApSecurity, TetherSnapshot, TransportKind, TransportView, WifiApConfig};

#[derive(Parser)]
#[command(name = "tetherctl", version, about = "USB / Wi-Fi / Bluetooth / P2P tethering control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 查看所有传输方式的状态
    Status,
    /// 开启共享 (usb, wifi, bluetooth, p2p)
    Enable { transport: TransportKind },
    /// 关闭共享
    Disable { transport: TransportKind },
    /// 设置 Wi-Fi 热点
    WifiApConfig {
        #[arg(long)]
        ssid: String,
        #[arg(long, value_enum, default_value = "wpa2")]
        security: Security,
        /// WPA2 密码 (8-63 位)
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// 持续输出状态变化
    Watch,
}

#[derive(Clone, Copy, ValueEnum)]
enum Security {
    Open,
    Wpa2,
}

impl From<Security> for ApSecurity {
    fn from(value: Security) -> Self {
        match value {
            Security::Open => ApSecurity::Open,
            Security::Wpa2 => ApSecurity::Wpa2Psk,
        }
    }
}

fn format_view(view: &TransportView) -> String {
    let switch = match (view.checked, view.enabled) {
        (true, true) => "[x]",
        (false, true) => "[ ]",
        (true, false) => "[-]",
        (false, false) => " - ",
    };
    // 多行摘要（P2P 网络信息）缩进显示
    let summary = view.summary.to_string().replace('\n', "\n                          ");
    format!("{:<10} {:<11} {} {}", view.kind.name(), view.status.name(), switch, summary)
}

fn print_snapshot(snapshot: &TetherSnapshot) {
    if snapshot.restricted {
        println!("Tethering is restricted on this device");
        return;
    }
    for view in snapshot.views.iter().filter(|v| v.visible) {
        println!("{}", format_view(view));
    }
    if let Some(choice) = snapshot.choice {
        println!("Waiting for approval: {}", choice);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            if let IpcResponse::Status { snapshot } = client::send_request(IpcRequest::Status).await? {
                print_snapshot(&snapshot);
            }
        }
        Commands::Enable { transport } => {
            client::send_request(IpcRequest::Enable { transport }).await?;
        }
        Commands::Disable { transport } => {
            client::send_request(IpcRequest::Disable { transport }).await?;
        }
        Commands::WifiApConfig {
            ssid,
            security,
            passphrase,
        } => {
            let config = WifiApConfig {
                ssid,
                security: security.into(),
                passphrase,
            };
            if let Err(reason) = config.validate() {
                anyhow::bail!("Invalid hotspot configuration: {}", reason);
            }
            client::send_request(IpcRequest::ConfigureWifiAp { config }).await?;
        }
        Commands::Watch => {
            client::watch(|snapshot| {
                println!("----");
                print_snapshot(snapshot);
            })
            .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{Summary, TransportStatus};

    #[test]
    fn test_format_view() {
        let view = TransportView {
            kind: TransportKind::Usb,
            status: TransportStatus::Active,
            enabled: true,
            checked: true,
            visible: true,
            summary: Summary::UsbActive,
        };
        assert_eq!(format_view(&view), "usb        active      [x] Tethered");
    }

    #[test]
    fn test_cli_parses_transport() {
        let cli = Cli::try_parse_from(["tetherctl", "enable", "wifi"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Enable {
                transport: TransportKind::WifiAp
            }
        ));
        assert!(Cli::try_parse_from(["tetherctl", "enable", "ethernet"]).is_err());
    }
}
