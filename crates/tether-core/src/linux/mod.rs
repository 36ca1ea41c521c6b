//! Linux 后端
//!
//! 把 [`TetherHal`] 映射到 NetworkManager（接口共享和 Wi-Fi AP）、BlueZ（适配器电源和 NAP）、
//! wpa_supplicant（P2P 自治组）和 sysfs（接口列表、USB 连接状态）。
//!
//! `TetherHal` 的方法必须立即返回，因此查询读的是缓存，命令在 tokio 运行时上执行，
//! 完成后重新轮询，变化以事件投递给调度器。

pub mod bluez;
pub mod nm;
pub mod provisioner;
pub mod sysfs;
pub mod wpa;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::runtime::Handle;

pub use bluez::{BluezClient, BluezPan};
pub use nm::{NmClient, NmSnapshot};
pub use provisioner::CommandProvisioner;
pub use sysfs::Sysfs;
pub use wpa::WpaCli;

use crate::config::TetherConfig;
use crate::error::Result;
use crate::event::{EventSink, GoNotification, GoRadioState, GoReason, P2pAction, TetherEvent};
use crate::hal::{PanHandle, PanProfile, TetherHal};
use crate::model::{AdapterState, ErrorCode, InterfaceSnapshot, WifiApConfig, WifiApState};
use crate::resolver::PatternSet;

use nm::active_connection_state;

#[derive(Debug, Default)]
struct Cache {
    interfaces: InterfaceSnapshot,
    usb_connected: bool,
    adapter: Option<AdapterState>,
    wifi_ap: WifiApState,
    /// 热点命令执行期间覆盖轮询结果
    wifi_transition: Option<WifiApState>,
    /// 最近一次启动热点失败
    wifi_failed: bool,
    wifi_config: Option<WifiApConfig>,
    p2p_group: Option<String>,
    p2p_tethering: bool,
    /// USB tethering 已开启，新出现的 USB 接口会自动共享
    usb_requested: bool,
    /// 正在共享或取消共享的接口
    pending: BTreeSet<String>,
    last_errors: BTreeMap<String, ErrorCode>,
}

/// 一次轮询读到的系统状态
struct Observed {
    names: Vec<String>,
    nm: NmSnapshot,
    usb_connected: bool,
    adapter: Option<AdapterState>,
    p2p_group: Option<String>,
}

struct Shared {
    sysfs: Sysfs,
    sink: EventSink,
    runtime: Handle,
    wifi_interface: String,
    usb: PatternSet,
    bluetooth: PatternSet,
    wpa: WpaCli,
    pan: Arc<PanHandle>,
    nm: tokio::sync::Mutex<Option<NmClient>>,
    bluez: tokio::sync::Mutex<Option<Arc<BluezClient>>>,
    cache: Mutex<Cache>,
}

/// 基于 NetworkManager / BlueZ / wpa_supplicant 的硬件抽象
#[derive(Clone)]
pub struct LinuxHal {
    inner: Arc<Shared>,
}

impl LinuxHal {
    pub fn new(config: &TetherConfig, sink: EventSink, runtime: Handle, pan: Arc<PanHandle>) -> Result<Self> {
        Self::with_sysfs(config, Sysfs::default(), sink, runtime, pan)
    }

    pub fn with_sysfs(
        config: &TetherConfig,
        sysfs: Sysfs,
        sink: EventSink,
        runtime: Handle,
        pan: Arc<PanHandle>,
    ) -> Result<Self> {
        let patterns = config.patterns()?;
        let cache = Cache {
            wifi_config: config.wifi_ap.clone(),
            ..Default::default()
        };

        Ok(Self {
            inner: Arc::new(Shared {
                sysfs,
                sink,
                runtime,
                wifi_interface: config.wifi_interface.clone(),
                usb: patterns.usb,
                bluetooth: patterns.bluetooth,
                wpa: WpaCli::new(config.p2p_interface.clone()),
                pan,
                nm: tokio::sync::Mutex::new(None),
                bluez: tokio::sync::Mutex::new(None),
                cache: Mutex::new(cache),
            }),
        })
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        match self.inner.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 初始化 NM 客户端
    async fn nm(&self) -> anyhow::Result<NmClient> {
        let mut client = self.inner.nm.lock().await;
        if client.is_none() {
            match NmClient::new().await {
                Ok(c) => {
                    info!("NetworkManager D-Bus client initialized");
                    *client = Some(c);
                }
                Err(e) => {
                    debug!("Failed to initialize NM client: {:#}", e);
                    return Err(e);
                }
            }
        }
        client
            .clone()
            .ok_or_else(|| anyhow::anyhow!("NetworkManager client unavailable"))
    }

    async fn bluez(&self) -> Option<Arc<BluezClient>> {
        let mut client = self.inner.bluez.lock().await;
        if client.is_none() {
            match BluezClient::new().await {
                Ok(c) => *client = Some(Arc::new(c)),
                Err(e) => debug!("Failed to initialize BlueZ client: {:#}", e),
            }
        }
        client.clone()
    }

    /// 首次读取系统状态，不投递事件；在调度器启动前调用
    pub async fn prime(&self) {
        self.refresh(false).await;
    }

    /// 轮询系统状态，把变化投递给调度器
    pub async fn poll(&self) {
        self.refresh(true).await;
    }

    /// 按固定间隔轮询，直到调度器停止
    pub async fn monitor(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if self.inner.sink.is_closed() {
                debug!("Dispatcher stopped, ending monitor");
                break;
            }
            self.poll().await;
        }
    }

    async fn refresh(&self, notify: bool) {
        let observed = self.observe().await;
        let (events, pan_change) = self.apply(observed);

        if let Some(present) = pan_change {
            self.update_pan(present).await;
        }

        if notify {
            for event in events {
                self.inner.sink.post(event);
            }
            if let Some(connected) = pan_change {
                self.inner.sink.post(TetherEvent::PanProfileChanged { connected });
            }
        }

        self.reconcile();
    }

    async fn observe(&self) -> Observed {
        let names = self.inner.sysfs.interfaces();
        let nm = match self.nm().await {
            Ok(client) => client.snapshot().await.unwrap_or_else(|e| {
                warn!("Failed to query NetworkManager: {:#}", e);
                NmSnapshot::default()
            }),
            Err(_) => NmSnapshot::default(),
        };
        let adapter = match self.bluez().await {
            Some(client) => client.adapter_state().await,
            None => None,
        };
        let p2p_group = wpa::find_group_interface(&names);

        Observed {
            usb_connected: self.inner.sysfs.usb_connected(),
            names,
            nm,
            adapter,
            p2p_group,
        }
    }

    /// 更新缓存，返回需要投递的事件和适配器出现/消失
    fn apply(&self, observed: Observed) -> (Vec<TetherEvent>, Option<bool>) {
        let mut events = Vec::new();
        let mut pan_change = None;
        let mut cache = self.cache();

        let names: BTreeSet<&String> = observed.names.iter().collect();
        cache.last_errors.retain(|iface, _| names.contains(iface));

        let snapshot = build_snapshot(&observed.names, &observed.nm, &cache.last_errors);
        if snapshot != cache.interfaces {
            debug!(
                "Interfaces: available={:?} tethered={:?} errored={:?}",
                snapshot.available, snapshot.tethered, snapshot.errored
            );
            cache.interfaces = snapshot.clone();
            events.push(TetherEvent::InterfacesChanged(snapshot));
        }

        if observed.usb_connected != cache.usb_connected {
            cache.usb_connected = observed.usb_connected;
            events.push(TetherEvent::UsbStateChanged {
                connected: observed.usb_connected,
            });
        }

        if observed.adapter != cache.adapter {
            if observed.adapter.is_some() != cache.adapter.is_some() {
                pan_change = Some(observed.adapter.is_some());
            }
            cache.adapter = observed.adapter;
            if let Some(state) = observed.adapter {
                events.push(TetherEvent::BluetoothAdapterChanged(state));
            }
        }

        let wifi = cache
            .wifi_transition
            .unwrap_or_else(|| hotspot_state(observed.nm.hotspot_state, cache.wifi_failed));
        if wifi != cache.wifi_ap {
            cache.wifi_ap = wifi;
            events.push(TetherEvent::WifiApStateChanged(wifi));
        }

        if observed.p2p_group != cache.p2p_group {
            let state = match &observed.p2p_group {
                Some(iface) => {
                    info!("P2P group interface {} is up", iface);
                    GoRadioState::Started
                }
                None => GoRadioState::Stopped,
            };
            cache.p2p_group = observed.p2p_group;
            events.push(TetherEvent::P2pGoStateChanged(GoNotification::new(
                state,
                GoReason::Default,
            )));
        }

        (events, pan_change)
    }

    /// 适配器出现时连接 PAN profile，消失时断开
    async fn update_pan(&self, present: bool) {
        let profile: Option<Arc<dyn PanProfile>> = if present {
            self.bluez().await.map(|client| {
                Arc::new(BluezPan::new(
                    client,
                    self.inner.runtime.clone(),
                    self.inner.sysfs.clone(),
                )) as Arc<dyn PanProfile>
            })
        } else {
            None
        };
        info!(
            "PAN profile {}",
            if profile.is_some() { "connected" } else { "disconnected" }
        );
        self.inner.pan.set(profile);
    }

    /// 自动共享 USB tethering 开启后出现的 USB 接口，以及 PAN 开启后出现的蓝牙接口
    fn reconcile(&self) {
        let pan_on = self.inner.pan.get().is_some_and(|pan| pan.is_tethering_on());
        let wanted: Vec<String> = {
            let cache = self.cache();
            cache
                .interfaces
                .available
                .iter()
                .filter(|iface| !cache.pending.contains(*iface) && !cache.last_errors.contains_key(*iface))
                .filter(|iface| {
                    (cache.usb_requested && self.inner.usb.matches(iface))
                        || (pan_on && self.inner.bluetooth.matches(iface))
                })
                .cloned()
                .collect()
        };
        for iface in wanted {
            debug!("Auto-sharing {}", iface);
            self.spawn_share(iface, true);
        }
    }

    fn spawn_share(&self, iface: String, share: bool) {
        self.cache().pending.insert(iface.clone());
        let hal = self.clone();

        self.inner.runtime.spawn(async move {
            let result = match hal.nm().await {
                Ok(nm) if share => nm.share_interface(&iface).await,
                Ok(nm) => nm.unshare_interface(&iface).await.map(|_| ()),
                Err(e) => Err(e),
            };
            {
                let mut cache = hal.cache();
                cache.pending.remove(&iface);
                match result {
                    Ok(()) => {
                        cache.last_errors.remove(&iface);
                    }
                    Err(e) => {
                        warn!(
                            "Failed to {} {}: {:#}",
                            if share { "tether" } else { "untether" },
                            iface,
                            e
                        );
                        if share {
                            cache.last_errors.insert(iface.clone(), ErrorCode::SERVICE_UNAVAIL);
                        }
                    }
                }
            }
            hal.poll().await;
        });
    }

    fn begin_wifi_transition(&self, state: WifiApState) {
        {
            let mut cache = self.cache();
            cache.wifi_transition = Some(state);
            cache.wifi_failed = false;
            if cache.wifi_ap == state {
                return;
            }
            cache.wifi_ap = state;
        }
        self.inner.sink.post(TetherEvent::WifiApStateChanged(state));
    }

    fn end_wifi_transition(&self, failed: bool) {
        let mut cache = self.cache();
        cache.wifi_transition = None;
        cache.wifi_failed = failed;
    }

    fn post_action(&self, action: P2pAction, cycle: u64, result: std::result::Result<(), i32>) {
        self.inner
            .sink
            .post(TetherEvent::P2pActionCompleted { action, cycle, result });
    }
}

/// 由接口列表和 NM 状态构建接口快照
fn build_snapshot(
    names: &[String],
    nm: &NmSnapshot,
    last_errors: &BTreeMap<String, ErrorCode>,
) -> InterfaceSnapshot {
    let mut snapshot = InterfaceSnapshot::default();
    for name in names {
        if nm.shared.contains(name) {
            snapshot.tethered.insert(name.clone());
        } else if nm.failed.contains(name) {
            snapshot.errored.insert(name.clone());
        } else {
            snapshot.available.insert(name.clone());
        }
    }
    for (iface, code) in last_errors {
        if snapshot.available.contains(iface) {
            snapshot = snapshot.with_last_error(iface.clone(), *code);
        }
    }
    snapshot
}

/// 热点连接状态映射到 Wi-Fi AP 状态
fn hotspot_state(state: Option<u32>, failed: bool) -> WifiApState {
    match state {
        Some(active_connection_state::ACTIVATING) => WifiApState::Enabling,
        Some(active_connection_state::ACTIVATED) => WifiApState::Enabled,
        Some(active_connection_state::DEACTIVATING) => WifiApState::Disabling,
        _ if failed => WifiApState::Failed,
        _ => WifiApState::Disabled,
    }
}

impl TetherHal for LinuxHal {
    fn list_interfaces(&self) -> InterfaceSnapshot {
        self.cache().interfaces.clone()
    }

    fn tether(&self, iface: &str) -> ErrorCode {
        {
            let mut cache = self.cache();
            if !cache.interfaces.available.contains(iface) {
                return ErrorCode::UNAVAIL_IFACE;
            }
            cache.last_errors.remove(iface);
        }
        self.spawn_share(iface.to_string(), true);
        ErrorCode::NO_ERROR
    }

    fn untether(&self, iface: &str) -> ErrorCode {
        if !self.cache().interfaces.tethered.contains(iface) {
            return ErrorCode::UNAVAIL_IFACE;
        }
        self.spawn_share(iface.to_string(), false);
        ErrorCode::NO_ERROR
    }

    fn usb_connected(&self) -> bool {
        self.cache().usb_connected
    }

    fn set_usb_tethering_enabled(&self, enabled: bool) -> ErrorCode {
        let ifaces: Vec<String> = {
            let mut cache = self.cache();
            let source = if enabled {
                &cache.interfaces.available
            } else {
                &cache.interfaces.tethered
            };
            let ifaces: Vec<String> = source
                .iter()
                .filter(|iface| self.inner.usb.matches(iface))
                .cloned()
                .collect();
            if enabled && ifaces.is_empty() {
                warn!("No USB network interface to tether");
                return ErrorCode::UNAVAIL_IFACE;
            }
            cache.usb_requested = enabled;
            for iface in &ifaces {
                cache.last_errors.remove(iface);
            }
            ifaces
        };

        info!("USB tethering {} on {:?}", if enabled { "enabled" } else { "disabled" }, ifaces);
        for iface in ifaces {
            self.spawn_share(iface, enabled);
        }
        ErrorCode::NO_ERROR
    }

    fn set_wifi_ap_enabled(&self, config: Option<&WifiApConfig>, enabled: bool) -> ErrorCode {
        let iface = self.inner.wifi_interface.clone();
        let hal = self.clone();

        if enabled {
            let Some(config) = config.cloned().or_else(|| self.cache().wifi_config.clone()) else {
                warn!("No Wi-Fi AP configuration saved");
                return ErrorCode::SERVICE_UNAVAIL;
            };
            if !self.inner.sysfs.has_interface(&iface) {
                warn!("Wi-Fi interface {} not present", iface);
                return ErrorCode::UNAVAIL_IFACE;
            }

            self.begin_wifi_transition(WifiApState::Enabling);
            self.inner.runtime.spawn(async move {
                let result = match hal.nm().await {
                    Ok(nm) => nm.start_hotspot(&iface, &config).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    warn!("Failed to start hotspot: {:#}", e);
                }
                hal.end_wifi_transition(result.is_err());
                hal.poll().await;
            });
        } else {
            self.begin_wifi_transition(WifiApState::Disabling);
            self.inner.runtime.spawn(async move {
                let result = match hal.nm().await {
                    Ok(nm) => nm.stop_hotspot().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    warn!("Failed to stop hotspot: {:#}", e);
                }
                hal.end_wifi_transition(false);
                hal.poll().await;
            });
        }
        ErrorCode::NO_ERROR
    }

    fn wifi_ap_state(&self) -> WifiApState {
        self.cache().wifi_ap
    }

    fn wifi_ap_configuration(&self) -> Option<WifiApConfig> {
        self.cache().wifi_config.clone()
    }

    fn set_wifi_ap_configuration(&self, config: &WifiApConfig) -> ErrorCode {
        if let Err(reason) = config.validate() {
            warn!("Rejecting Wi-Fi AP configuration: {}", reason);
            return ErrorCode::UNSUPPORTED;
        }
        self.cache().wifi_config = Some(config.clone());
        ErrorCode::NO_ERROR
    }

    fn bluetooth_adapter_state(&self) -> Option<AdapterState> {
        self.cache().adapter
    }

    fn bluetooth_adapter_power(&self, on: bool) {
        let hal = self.clone();
        self.inner.runtime.spawn(async move {
            match hal.bluez().await {
                Some(client) => {
                    if let Err(e) = client.set_powered(on).await {
                        warn!("{:#}", e);
                    }
                }
                None => warn!("BlueZ not available"),
            }
            hal.poll().await;
        });
    }

    fn p2p_supported(&self) -> bool {
        self.inner.sysfs.is_wireless(self.inner.wpa.interface())
    }

    fn p2p_enable_tethering(&self) {
        self.cache().p2p_tethering = true;
        debug!("P2P tethering enabled");
    }

    fn p2p_disable_tethering(&self) {
        self.cache().p2p_tethering = false;
        debug!("P2P tethering disabled");
    }

    fn p2p_create_group(&self, cycle: u64) {
        let hal = self.clone();
        self.inner.runtime.spawn(async move {
            let result = hal.inner.wpa.group_add().await.map_err(|e| {
                warn!("Failed to create P2P group: {:#}", e);
                ErrorCode::SERVICE_UNAVAIL.0
            });
            hal.post_action(P2pAction::CreateGroup, cycle, result);
            hal.poll().await;
        });
    }

    fn p2p_remove_group(&self, cycle: u64) {
        let Some(group) = self.cache().p2p_group.clone() else {
            debug!("No P2P group to remove");
            self.post_action(P2pAction::RemoveGroup, cycle, Err(ErrorCode::UNAVAIL_IFACE.0));
            return;
        };
        let hal = self.clone();
        self.inner.runtime.spawn(async move {
            let result = hal.inner.wpa.group_remove(&group).await.map_err(|e| {
                warn!("Failed to remove P2P group {}: {:#}", group, e);
                ErrorCode::SERVICE_UNAVAIL.0
            });
            hal.post_action(P2pAction::RemoveGroup, cycle, result);
            hal.poll().await;
        });
    }

    fn p2p_tether_interface(&self) -> Option<String> {
        let cache = self.cache();
        if !cache.p2p_tethering {
            debug!("P2P tethering not enabled");
        }
        cache.p2p_group.clone()
    }

    fn p2p_request_persistent_group_info(&self) {
        let Some(group) = self.cache().p2p_group.clone() else {
            self.inner.sink.post(TetherEvent::PersistentGroupsAvailable(Vec::new()));
            return;
        };
        let hal = self.clone();
        self.inner.runtime.spawn(async move {
            let groups = match hal.inner.wpa.group_credentials(&group).await {
                Ok(credentials) => vec![credentials],
                Err(e) => {
                    warn!("Failed to read P2P group credentials: {:#}", e);
                    Vec::new()
                }
            };
            hal.inner.sink.post(TetherEvent::PersistentGroupsAvailable(groups));
        });
    }

    fn p2p_group_active(&self) -> bool {
        self.cache().p2p_group.is_some()
    }
}
