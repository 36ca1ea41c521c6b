//! 事件与命令
//!
//! 所有外部通知和协作方的异步结果都封装为 [`TetherEvent`]，
//! 与用户命令一起进入同一个串行队列，由调度器逐个处理。

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::hal::GroupCredentials;
use crate::model::{AdapterState, InterfaceSnapshot, TransportKind, WifiApConfig, WifiApState};
use crate::provisioning::Ticket;

/// 无线电报告的 P2P 自治组子状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoRadioState {
    Starting,
    Started,
    Stopped,
    StoppedRestarting,
    Unknown(i32),
}

impl GoRadioState {
    /// wpa_supplicant / 驱动上报的原始值
    pub fn from_raw(value: i32) -> Self {
        match value {
            0 => GoRadioState::Stopped,
            1 => GoRadioState::Started,
            2 => GoRadioState::Starting,
            3 => GoRadioState::StoppedRestarting,
            other => GoRadioState::Unknown(other),
        }
    }
}

/// 子状态变化原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoReason {
    Default,
    /// DFS 信道检测到雷达
    RadarDetected,
    /// 信道可用性检查完成
    CacCompleted,
    /// 信道切换完成
    CsaFinished,
    Other(i32),
}

impl GoReason {
    pub fn from_raw(value: i32) -> Self {
        match value {
            0 => GoReason::Default,
            1 => GoReason::RadarDetected,
            2 => GoReason::CacCompleted,
            3 => GoReason::CsaFinished,
            other => GoReason::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoNotification {
    pub state: GoRadioState,
    pub reason: GoReason,
}

impl GoNotification {
    pub fn new(state: GoRadioState, reason: GoReason) -> Self {
        Self { state, reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum P2pAction {
    CreateGroup,
    RemoveGroup,
}

/// 外部事件
#[derive(Debug, Clone, PartialEq)]
pub enum TetherEvent {
    InterfacesChanged(InterfaceSnapshot),
    UsbStateChanged { connected: bool },
    MassStorageChanged { shared: bool },
    BluetoothAdapterChanged(AdapterState),
    /// PAN 句柄已被替换，`connected` 表示新句柄是否存在
    PanProfileChanged { connected: bool },
    WifiApStateChanged(WifiApState),
    P2pGoStateChanged(GoNotification),
    /// `Err` 携带底层失败原因码
    P2pActionCompleted {
        action: P2pAction,
        cycle: u64,
        result: std::result::Result<(), i32>,
    },
    PersistentGroupsAvailable(Vec<GroupCredentials>),
    ProvisioningCompleted { ticket: Ticket, approved: bool },
    RecheckCompleted { kind: TransportKind, approved: bool },
    /// 重新查询接口列表
    Refresh,
}

/// 需要同步回复的用户命令
#[derive(Debug)]
pub enum Command {
    SetEnabled {
        kind: TransportKind,
        enable: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    ConfigureWifiAp {
        config: WifiApConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

#[derive(Debug)]
pub enum Message {
    Event(TetherEvent),
    Command(Command),
}

/// 事件投递端，可以克隆给任意线程上的协作方
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Message>,
}

impl EventSink {
    /// 投递事件；调度器已停止时返回 `false`
    pub fn post(&self, event: TetherEvent) -> bool {
        self.tx.send(Message::Event(event)).is_ok()
    }

    /// 调度器是否已停止
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// 调度器的接收端
#[derive(Debug)]
pub struct Inbox {
    pub(crate) rx: mpsc::UnboundedReceiver<Message>,
}

/// 创建事件队列
pub fn channel() -> (EventSink, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, Inbox { rx })
}
