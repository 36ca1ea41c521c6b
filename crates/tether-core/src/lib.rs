//! Tether Core Library
//!
//! tethering 编排引擎：协调 USB、Wi-Fi AP、蓝牙 PAN 和 Wi-Fi Direct 自治组（P2P-GO）
//! 四种共享方式的开启和关闭，把用户意图与网络栈、无线电、USB 子系统的异步状态对齐。
//!
//! # 模块
//!
//! - **resolver**: 由接口快照和链路状态推导每种传输方式的状态
//! - **provisioning**: 授权门，开启前的运营商授权和周期复查
//! - **machine**: USB / Wi-Fi AP / 蓝牙的传输状态机
//! - **p2p**: P2P-GO 自治组生命周期
//! - **engine** / **dispatcher**: 单任务串行处理事件和命令，发布状态快照
//! - **linux**: 基于 NetworkManager、BlueZ、wpa_supplicant 的硬件抽象实现
//!
//! # 使用示例
//!
//! ```ignore
//! use tether_core::{channel, Dispatcher, Engine, TransportKind};
//!
//! let (sink, inbox) = channel();
//! let engine = Engine::new(hal, pan, provisioner, store, options);
//! let (dispatcher, handle) = Dispatcher::new(engine, inbox, sink);
//! tokio::spawn(dispatcher.run());
//!
//! handle.set_enabled(TransportKind::Usb, true).await?;
//! println!("{:?}", handle.snapshot().view(TransportKind::Usb));
//! ```

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod hal;
pub mod ipc;
pub mod linux;
pub mod machine;
pub mod model;
pub mod p2p;
pub mod provisioning;
pub mod resolver;

pub use config::{ProvisioningSettings, TetherConfig};
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use engine::{Engine, EngineOptions, TetherSnapshot};
pub use error::{Result, TetherError};
pub use event::{channel, EventSink, GoNotification, GoRadioState, GoReason, P2pAction, TetherEvent};
pub use hal::{CredentialStore, GroupCredentials, NoProvisioning, PanHandle, PanProfile, Provisioner, TetherHal};
pub use machine::MachineState;
pub use model::{
    AdapterState, ApSecurity, ErrorCode, InterfaceSnapshot, Summary, TransportKind, TransportStatus,
    TransportView, WifiApConfig, WifiApState,
};
pub use p2p::{FileCredentialStore, P2pGroupState, P2pSubState};
pub use provisioning::Ticket;
pub use resolver::{PatternSet, TransportPatterns};
