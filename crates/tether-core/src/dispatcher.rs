//! 事件调度器
//!
//! 单个 tokio 任务独占 [`Engine`]，串行处理事件队列里的每条消息；
//! 每条消息处理完后通过 watch 通道发布最新的 [`TetherSnapshot`]。

use log::{debug, info};
use tokio::sync::{oneshot, watch};

use crate::engine::{Engine, TetherSnapshot};
use crate::error::{Result, TetherError};
use crate::event::{Command, EventSink, Inbox, Message, TetherEvent};
use crate::model::{TransportKind, WifiApConfig};

pub struct Dispatcher {
    engine: Engine,
    inbox: Inbox,
    state_tx: watch::Sender<TetherSnapshot>,
}

impl Dispatcher {
    /// `sink` 必须与 `inbox` 来自同一个 [`channel`](crate::event::channel)
    pub fn new(engine: Engine, inbox: Inbox, sink: EventSink) -> (Self, DispatcherHandle) {
        let (state_tx, state_rx) = watch::channel(engine.snapshot());
        let handle = DispatcherHandle {
            sink,
            state: state_rx,
        };
        (
            Self {
                engine,
                inbox,
                state_tx,
            },
            handle,
        )
    }

    /// 运行直到收到 `Shutdown` 或所有发送端都被丢弃
    pub async fn run(mut self) {
        self.engine.start();
        self.publish();
        info!("Dispatcher started");

        while let Some(message) = self.inbox.rx.recv().await {
            match message {
                Message::Event(event) => self.engine.handle_event(event),
                Message::Command(Command::SetEnabled { kind, enable, reply }) => {
                    let result = self.engine.set_enabled(kind, enable);
                    if reply.send(result).is_err() {
                        debug!("Caller dropped before set_enabled({}) replied", kind);
                    }
                }
                Message::Command(Command::ConfigureWifiAp { config, reply }) => {
                    let result = self.engine.configure_wifi_ap(config);
                    let _ = reply.send(result);
                }
                Message::Command(Command::Shutdown) => {
                    info!("Dispatcher shutting down");
                    break;
                }
            }
            self.publish();
        }
    }

    fn publish(&self) {
        let next = self.engine.snapshot();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// 调度器的客户端句柄，可以克隆到 IPC 等任意任务中
#[derive(Clone)]
pub struct DispatcherHandle {
    sink: EventSink,
    state: watch::Receiver<TetherSnapshot>,
}

impl DispatcherHandle {
    pub async fn set_enabled(&self, kind: TransportKind, enable: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SetEnabled { kind, enable, reply }, rx).await
    }

    pub async fn configure_wifi_ap(&self, config: WifiApConfig) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::ConfigureWifiAp { config, reply }, rx).await
    }

    async fn request(&self, command: Command, rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        if !self.sink.send(Message::Command(command)) {
            return Err(TetherError::Closed);
        }
        rx.await.map_err(|_| TetherError::Closed)?
    }

    pub fn post(&self, event: TetherEvent) -> bool {
        self.sink.post(event)
    }

    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn snapshot(&self) -> TetherSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TetherSnapshot> {
        self.state.clone()
    }

    pub fn shutdown(&self) -> bool {
        self.sink.send(Message::Command(Command::Shutdown))
    }
}
