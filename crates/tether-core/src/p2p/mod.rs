//! P2P-GO 生命周期控制器
//!
//! 管理 Wi-Fi Direct 自治组（Autonomous Group Owner）热点：
//!
//! 1. 用户开启：启用 P2P tethering 能力并创建自治组
//! 2. 组建立（Started / Default）：把 P2P 虚拟接口绑定到 tethering，再查询持久组信息
//! 3. 收到持久组信息：保存网络名和密码，开关标记为已开启
//! 4. 用户关闭：先解除 tethering 绑定，再删除组
//!
//! DFS 信道上的雷达检测、CAC、CSA 等无线电事件只是暂时的，不会被当作失败。

pub mod store;

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::event::{GoNotification, GoRadioState, GoReason, P2pAction};
use crate::hal::{CredentialStore, GroupCredentials, TetherHal};
use crate::model::{ErrorCode, Summary, TransportKind, TransportStatus, TransportView};

pub use store::FileCredentialStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum P2pSubState {
    Starting,
    Started,
    StoppedRestarting,
    #[default]
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct P2pGroupState {
    pub sub_state: P2pSubState,
    pub network_name: Option<String>,
    pub passphrase: Option<String>,
}

impl P2pGroupState {
    pub fn credentials(&self) -> Option<GroupCredentials> {
        match (&self.network_name, &self.passphrase) {
            (Some(name), Some(pass)) => Some(GroupCredentials {
                network_name: name.clone(),
                passphrase: pass.clone(),
            }),
            _ => None,
        }
    }
}

pub struct P2pController {
    hal: Arc<dyn TetherHal>,
    store: Arc<dyn CredentialStore>,
    state: P2pGroupState,
    /// 用户发起的建组/删组周期，用于丢弃过期的异步结果
    cycle: u64,
    /// 用户是否要求开启；关闭后迟到的 Started 只会触发拆除
    wanted: bool,
    available: bool,
    enabled: bool,
    checked: bool,
    summary: Summary,
}

impl P2pController {
    pub fn new(hal: Arc<dyn TetherHal>, store: Arc<dyn CredentialStore>, available: bool) -> Self {
        Self {
            hal,
            store,
            state: P2pGroupState::default(),
            cycle: 0,
            wanted: false,
            available,
            enabled: available,
            checked: false,
            summary: Summary::P2pDisabled,
        }
    }

    pub fn state(&self) -> &P2pGroupState {
        &self.state
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// 启动时恢复：读取保存的凭据，自治组已在运行时直接进入 Started
    pub fn restore(&mut self) {
        if !self.available {
            return;
        }
        match self.store.load() {
            Ok(Some(creds)) => {
                self.state.network_name = Some(creds.network_name);
                self.state.passphrase = Some(creds.passphrase);
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to load P2P-GO credentials: {:#}", e),
        }

        if self.hal.p2p_group_active() {
            info!("Autonomous group already running, restoring Started state");
            self.state.sub_state = P2pSubState::Started;
            self.wanted = true;
            self.checked = true;
            self.show_network_info();
        }
    }

    /// 用户开启
    pub fn start(&mut self) {
        if matches!(self.state.sub_state, P2pSubState::Starting | P2pSubState::Started) {
            debug!("P2P-GO already {:?}, ignoring start", self.state.sub_state);
            return;
        }
        self.cycle += 1;
        self.wanted = true;
        info!("Starting autonomous GO (cycle {})", self.cycle);
        self.hal.p2p_enable_tethering();
        self.hal.p2p_create_group(self.cycle);
        self.summary = Summary::P2pStarting;
    }

    /// 用户关闭：解除绑定、删除组并清除凭据
    pub fn stop(&mut self) {
        // 新周期让仍在路上的建组结果失效
        self.cycle += 1;
        self.wanted = false;
        self.teardown();
        self.state.network_name = None;
        self.state.passphrase = None;
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear P2P-GO credentials: {:#}", e);
        }
        self.summary = Summary::P2pDisabled;
    }

    /// 先 untether 再删除组；两步都尽力而为
    fn teardown(&mut self) {
        debug!("Stopping autonomous GO");
        match self.hal.p2p_tether_interface() {
            Some(iface) => {
                let code = self.hal.untether(&iface);
                if !code.is_ok() {
                    warn!("Untether of {} failed with code {}", iface, code.0);
                }
            }
            None => debug!("No P2P tether interface to untether"),
        }
        self.hal.p2p_remove_group(self.cycle);
        self.state.sub_state = P2pSubState::Stopped;
        self.checked = false;
    }

    pub fn on_action_result(&mut self, action: P2pAction, cycle: u64, result: Result<(), i32>) {
        if cycle != self.cycle {
            debug!(
                "Dropping stale {:?} result (cycle {}, current {})",
                action, cycle, self.cycle
            );
            return;
        }

        match (action, result) {
            (P2pAction::CreateGroup, Ok(())) => {
                if self.state.sub_state == P2pSubState::Stopped {
                    self.state.sub_state = P2pSubState::Starting;
                }
                self.summary = Summary::P2pGettingNetworkInfo;
                self.checked = false;
            }
            (P2pAction::CreateGroup, Err(reason)) => {
                error!("Failed to start P2P-GO hotspot, reason {}", reason);
                self.state.sub_state = P2pSubState::Stopped;
                self.checked = false;
                self.summary = Summary::P2pFailed;
            }
            (P2pAction::RemoveGroup, Ok(())) => debug!("Autonomous group removed"),
            (P2pAction::RemoveGroup, Err(reason)) => {
                warn!("Failed to remove autonomous group, reason {}", reason);
            }
        }
    }

    pub fn on_notification(&mut self, notification: GoNotification) {
        let GoNotification { state, reason } = notification;
        debug!("P2P-GO sub-state {:?} reason {:?}", state, reason);

        match state {
            GoRadioState::Started => self.on_started(reason),
            GoRadioState::Starting => {
                if !self.wanted {
                    debug!("Ignoring Starting while P2P-GO is off");
                    return;
                }
                self.summary = Summary::P2pStarting;
                if reason != GoReason::RadarDetected
                    && matches!(
                        self.state.sub_state,
                        P2pSubState::Stopped | P2pSubState::StoppedRestarting
                    )
                {
                    self.state.sub_state = P2pSubState::Starting;
                }
            }
            GoRadioState::Stopped => {
                self.checked = false;
                self.enabled = true;
                self.summary = Summary::P2pDisabled;
                self.hal.p2p_disable_tethering();
                self.state.sub_state = P2pSubState::Stopped;
            }
            GoRadioState::StoppedRestarting => {
                self.checked = false;
                self.enabled = false;
                self.summary = Summary::P2pRestarting;
                self.state.sub_state = P2pSubState::StoppedRestarting;
            }
            GoRadioState::Unknown(value) => {
                error!("Invalid sub-state {} in the P2P-GO state", value);
            }
        }
    }

    fn on_started(&mut self, reason: GoReason) {
        match reason {
            GoReason::Default if !self.wanted => {
                info!("Autonomous group came up after stop, removing it");
                self.teardown();
                self.summary = Summary::P2pDisabled;
            }
            GoReason::Default => {
                let code = match self.hal.p2p_tether_interface() {
                    Some(iface) => self.hal.tether(&iface),
                    None => ErrorCode::UNAVAIL_IFACE,
                };
                if code.is_ok() {
                    info!("P2P-GO hotspot tethered");
                    self.state.sub_state = P2pSubState::Started;
                    self.summary = Summary::P2pStarted;
                    self.hal.p2p_request_persistent_group_info();
                } else {
                    warn!("P2P-GO hotspot tethering failed, code {}", code.0);
                    // 绑定失败时保留自治组没有意义
                    self.teardown();
                    self.summary = Summary::P2pFailed;
                }
            }
            GoReason::CacCompleted | GoReason::CsaFinished => {
                if self.state.sub_state == P2pSubState::Stopped {
                    debug!("Ignoring {:?} confirmation while stopped", reason);
                    return;
                }
                self.state.sub_state = P2pSubState::Started;
                self.summary = Summary::P2pStarted;
                self.hal.p2p_request_persistent_group_info();
            }
            GoReason::RadarDetected | GoReason::Other(_) => {
                debug!("Transient radio event {:?}, keeping {:?}", reason, self.state.sub_state);
            }
        }
    }

    pub fn on_persistent_groups(&mut self, groups: Vec<GroupCredentials>) {
        if self.state.sub_state != P2pSubState::Started {
            debug!("Ignoring persistent group info while {:?}", self.state.sub_state);
            return;
        }

        for group in groups {
            debug!("Group info network name: {}", group.network_name);
            if let Err(e) = self.store.save(&group) {
                warn!("Failed to persist P2P-GO credentials: {:#}", e);
            }
            self.state.network_name = Some(group.network_name);
            self.state.passphrase = Some(group.passphrase);
        }
        self.show_network_info();
        self.enabled = true;
        self.checked = true;
    }

    fn show_network_info(&mut self) {
        self.summary = match self.state.credentials() {
            Some(creds) => Summary::P2pNetworkInfo {
                network_name: creds.network_name,
                passphrase: creds.passphrase,
            },
            None => Summary::P2pStarted,
        };
    }

    pub fn view(&self) -> TransportView {
        if !self.available {
            return TransportView::hidden(TransportKind::P2pGo);
        }
        let status = match self.state.sub_state {
            P2pSubState::Stopped => TransportStatus::Available,
            P2pSubState::Starting => TransportStatus::TurningOn,
            P2pSubState::Started => TransportStatus::Active,
            P2pSubState::StoppedRestarting => TransportStatus::TurningOff,
        };
        TransportView {
            kind: TransportKind::P2pGo,
            status,
            enabled: self.enabled,
            checked: self.checked,
            visible: true,
            summary: self.summary.clone(),
        }
    }
}
