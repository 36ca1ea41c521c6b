//! 编排引擎
//!
//! 引擎是所有 tethering 状态的唯一持有者：接口快照、链路状态、三个传输状态机、
//! 授权门和 P2P-GO 控制器。它本身是同步的，只由调度器任务串行驱动，
//! 每处理完一条消息就整体重算一次解析结果和视图。


use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TetherError};
use crate::event::TetherEvent;
use crate::hal::{CredentialStore, PanHandle, Provisioner, TetherHal};
use crate::machine::{MachineInput, MachineState, TransportMachine};
use crate::model::{
    AdapterState, ErrorCode, InterfaceSnapshot, Summary, TransportKind, TransportStatus, TransportView,
    WifiApConfig, WifiApState,
};
use crate::p2p::{P2pController, P2pGroupState};
use crate::provisioning::{Activation, ProvisioningGate, Ticket};
use crate::resolver::{
    resolve_all, BluetoothDetail, LinkState, PanReading, Resolution, TransportPatterns, UsbDetail,
};

/// 引擎选项，由配置构建
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub patterns: TransportPatterns,
    /// 当前用户不允许使用 tethering
    pub restricted: bool,
    pub p2p_enabled: bool,
}

/// 对外发布的完整状态
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TetherSnapshot {
    pub views: Vec<TransportView>,
    pub machines: BTreeMap<TransportKind, MachineState>,
    pub p2p: P2pGroupState,
    /// 正在等待授权的传输方式
    pub choice: Option<TransportKind>,
    pub restricted: bool,
}

impl TetherSnapshot {
    pub fn view(&self, kind: TransportKind) -> Option<&TransportView> {
        self.views.iter().find(|v| v.kind == kind)
    }
}

pub struct Engine {
    hal: Arc<dyn TetherHal>,
    pan: Arc<PanHandle>,
    gate: ProvisioningGate,
    patterns: TransportPatterns,
    restricted: bool,

    snapshot: InterfaceSnapshot,
    link: LinkState,
    resolution: Resolution,

    usb: TransportMachine,
    wifi: TransportMachine,
    bluetooth: TransportMachine,
    /// 蓝牙适配器正在上电，PAN tethering 推迟到适配器 On 之后
    bluetooth_enable_pending: bool,
    /// 最近一次停用蓝牙时 untether 失败
    bluetooth_untether_failed: bool,

    p2p: P2pController,
    choice: TransportKind,
    wifi_config: Option<WifiApConfig>,
}

impl Engine {
    pub fn new(
        hal: Arc<dyn TetherHal>,
        pan: Arc<PanHandle>,
        provisioner: Arc<dyn Provisioner>,
        store: Arc<dyn CredentialStore>,
        options: EngineOptions,
    ) -> Self {
        let p2p_available = options.p2p_enabled && hal.p2p_supported();
        let snapshot = InterfaceSnapshot::default();
        let link = LinkState::default();
        let resolution = resolve_all(&snapshot, &options.patterns, &link);

        Self {
            p2p: P2pController::new(hal.clone(), store, p2p_available),
            hal,
            pan,
            gate: ProvisioningGate::new(provisioner),
            patterns: options.patterns,
            restricted: options.restricted,
            snapshot,
            link,
            resolution,
            usb: TransportMachine::new(TransportKind::Usb),
            wifi: TransportMachine::new(TransportKind::WifiAp),
            bluetooth: TransportMachine::new(TransportKind::Bluetooth),
            bluetooth_enable_pending: false,
            bluetooth_untether_failed: false,
            choice: TransportKind::Invalid,
            wifi_config: None,
        }
    }

    /// 读取初始状态，恢复 P2P-GO 自治组
    pub fn start(&mut self) {
        info!("Starting tether engine");
        self.link.usb_connected = self.hal.usb_connected();
        self.link.mass_storage_active = self.hal.mass_storage_shared();
        self.link.adapter = self.hal.bluetooth_adapter_state();
        self.link.wifi_ap = self.hal.wifi_ap_state();
        self.wifi_config = self.hal.wifi_ap_configuration();
        self.snapshot = self.hal.list_interfaces();
        self.p2p.restore();
        self.recompute();
    }

    pub fn machine_state(&self, kind: TransportKind) -> Option<MachineState> {
        self.machine(kind).map(TransportMachine::state)
    }

    pub fn p2p_state(&self) -> &P2pGroupState {
        self.p2p.state()
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    fn machine(&self, kind: TransportKind) -> Option<&TransportMachine> {
        match kind {
            TransportKind::Usb => Some(&self.usb),
            TransportKind::WifiAp => Some(&self.wifi),
            TransportKind::Bluetooth => Some(&self.bluetooth),
            TransportKind::P2pGo | TransportKind::Invalid => None,
        }
    }

    fn machine_mut(&mut self, kind: TransportKind) -> Option<&mut TransportMachine> {
        match kind {
            TransportKind::Usb => Some(&mut self.usb),
            TransportKind::WifiAp => Some(&mut self.wifi),
            TransportKind::Bluetooth => Some(&mut self.bluetooth),
            TransportKind::P2pGo | TransportKind::Invalid => None,
        }
    }

    fn apply(&mut self, kind: TransportKind, input: MachineInput) -> Result<MachineState> {
        match self.machine_mut(kind) {
            Some(machine) => machine.apply(input),
            None => Err(TetherError::Unsupported(kind)),
        }
    }

    // ========================================================================
    // 用户命令
    // ========================================================================

    /// 用户切换开关；命令处理完后立即重算视图
    pub fn set_enabled(&mut self, kind: TransportKind, enable: bool) -> Result<()> {
        let result = self.toggle(kind, enable);
        self.refresh();
        result
    }

    fn toggle(&mut self, kind: TransportKind, enable: bool) -> Result<()> {
        if self.restricted {
            return Err(TetherError::Restricted);
        }
        debug!("set_enabled({}, {})", kind, enable);

        if kind == TransportKind::P2pGo {
            if !self.p2p.is_available() {
                return Err(TetherError::Unsupported(kind));
            }
            if enable {
                self.p2p.start();
            } else {
                self.p2p.stop();
            }
            return Ok(());
        }

        match self.patterns.for_kind(kind) {
            Some(patterns) if !patterns.is_empty() => {}
            _ => return Err(TetherError::Unsupported(kind)),
        }

        if enable { self.enable(kind) } else { self.disable(kind) }
    }

    fn enable(&mut self, kind: TransportKind) -> Result<()> {
        if self.gate.is_unavailable() {
            return Err(TetherError::ProvisioningUnavailable(kind));
        }
        let Some(machine) = self.machine(kind) else {
            return Err(TetherError::Unsupported(kind));
        };
        if matches!(machine.state(), MachineState::Activating | MachineState::Active) {
            debug!("{} already {:?}", kind, machine.state());
            return Ok(());
        }

        let ticket = Ticket {
            kind,
            cycle: machine.cycle() + 1,
        };
        let activation = self.gate.request_activation(ticket)?;
        self.apply(
            kind,
            MachineInput::UserEnable {
                needs_approval: activation.is_pending(),
            },
        )?;

        match activation {
            Activation::Pending(_) => {
                self.choice = kind;
                Ok(())
            }
            Activation::Approved => self.start_tethering(kind),
        }
    }

    fn disable(&mut self, kind: TransportKind) -> Result<()> {
        self.gate.cancel_recheck(kind);
        if self.gate.abandon(kind).is_some() && self.choice == kind {
            self.choice = TransportKind::Invalid;
        }
        if kind == TransportKind::Bluetooth {
            self.bluetooth_enable_pending = false;
        }

        let previous = self.machine_state(kind).unwrap_or_default();
        self.apply(kind, MachineInput::UserDisable)?;
        if matches!(previous, MachineState::Off | MachineState::AwaitingProvisioning) {
            return Ok(());
        }
        self.stop_tethering(kind);
        Ok(())
    }

    /// 修改 Wi-Fi AP 配置；AP 正在运行时用新配置重启
    pub fn configure_wifi_ap(&mut self, config: WifiApConfig) -> Result<()> {
        let result = self.reconfigure_wifi_ap(config);
        self.refresh();
        result
    }

    fn reconfigure_wifi_ap(&mut self, config: WifiApConfig) -> Result<()> {
        if self.restricted {
            return Err(TetherError::Restricted);
        }
        if self.patterns.wifi.is_empty() {
            return Err(TetherError::Unsupported(TransportKind::WifiAp));
        }
        config.validate().map_err(TetherError::InvalidApConfig)?;

        let code = self.hal.set_wifi_ap_configuration(&config);
        if !code.is_ok() {
            return Err(TetherError::HardwareRejected {
                kind: TransportKind::WifiAp,
                code: code.0,
            });
        }
        info!("Wi-Fi AP configuration updated (ssid {})", config.ssid);

        let running = self.wifi.state() == MachineState::Active || self.link.wifi_ap == WifiApState::Enabled;
        if running {
            debug!("Restarting Wi-Fi AP with new configuration");
            let code = self.hal.set_wifi_ap_enabled(None, false);
            if !code.is_ok() {
                warn!("Stopping Wi-Fi AP for restart failed with code {}", code.0);
            }
            let code = self.hal.set_wifi_ap_enabled(Some(&config), true);
            if !code.is_ok() {
                self.hardware_error(TransportKind::WifiAp, code);
            }
        }
        self.wifi_config = Some(config);
        Ok(())
    }

    // ========================================================================
    // 硬件调用
    // ========================================================================

    fn start_tethering(&mut self, kind: TransportKind) -> Result<()> {
        match kind {
            TransportKind::Usb => {
                let code = self.hal.set_usb_tethering_enabled(true);
                if !code.is_ok() {
                    self.hardware_error(kind, code);
                }
            }
            TransportKind::WifiAp => {
                let code = self.hal.set_wifi_ap_enabled(self.wifi_config.as_ref(), true);
                if !code.is_ok() {
                    self.hardware_error(kind, code);
                }
            }
            TransportKind::Bluetooth => {
                self.bluetooth_untether_failed = false;
                return self.start_bluetooth();
            }
            TransportKind::P2pGo | TransportKind::Invalid => {}
        }
        Ok(())
    }

    fn start_bluetooth(&mut self) -> Result<()> {
        let kind = TransportKind::Bluetooth;
        self.link.adapter = self.hal.bluetooth_adapter_state();

        match self.link.adapter {
            None => {
                warn!("Bluetooth tethering requested without an adapter");
                self.apply(kind, MachineInput::Abandon)?;
                Err(TetherError::AdapterUnavailable)
            }
            Some(AdapterState::On) => self.enable_pan(),
            Some(AdapterState::TurningOn) => {
                debug!("Adapter is turning on, deferring PAN tethering");
                self.bluetooth_enable_pending = true;
                Ok(())
            }
            Some(state) => {
                info!("Powering on Bluetooth adapter (was {:?})", state);
                self.bluetooth_enable_pending = true;
                self.hal.bluetooth_adapter_power(true);
                Ok(())
            }
        }
    }

    fn enable_pan(&mut self) -> Result<()> {
        match self.pan.get() {
            Some(pan) => {
                pan.set_tethering(true);
                Ok(())
            }
            None => {
                warn!("PAN profile not connected, abandoning Bluetooth tethering");
                self.apply(TransportKind::Bluetooth, MachineInput::Abandon)?;
                Err(TetherError::AdapterUnavailable)
            }
        }
    }

    fn stop_tethering(&mut self, kind: TransportKind) {
        match kind {
            TransportKind::Usb => {
                let code = self.hal.set_usb_tethering_enabled(false);
                if !code.is_ok() {
                    self.hardware_error(kind, code);
                }
            }
            TransportKind::WifiAp => {
                let code = self.hal.set_wifi_ap_enabled(None, false);
                if !code.is_ok() {
                    self.hardware_error(kind, code);
                }
            }
            TransportKind::Bluetooth => self.stop_bluetooth(),
            TransportKind::P2pGo | TransportKind::Invalid => {}
        }
    }

    fn stop_bluetooth(&mut self) {
        let interfaces = self.hal.list_interfaces();
        if let Some(iface) = self.patterns.bluetooth.find(&interfaces.tethered) {
            let code = self.hal.untether(iface);
            if !code.is_ok() {
                self.bluetooth_untether_failed = true;
                self.hardware_error(TransportKind::Bluetooth, code);
            }
        }
        if let Some(pan) = self.pan.get() {
            pan.set_tethering(false);
        }
    }

    /// 硬件调用失败：转入 Errored，由 UI 回滚开关，不自动重试
    fn hardware_error(&mut self, kind: TransportKind, code: ErrorCode) {
        warn!("{}", TetherError::HardwareRejected { kind, code: code.0 });
        let _ = self.apply(kind, MachineInput::HardwareError);
    }

    // ========================================================================
    // 事件
    // ========================================================================

    pub fn handle_event(&mut self, event: TetherEvent) {
        debug!("Event: {:?}", event);

        match event {
            TetherEvent::InterfacesChanged(snapshot) => {
                self.snapshot = snapshot;
                self.recompute();
                return;
            }
            TetherEvent::UsbStateChanged { connected } => self.link.usb_connected = connected,
            TetherEvent::MassStorageChanged { shared } => self.link.mass_storage_active = shared,
            TetherEvent::BluetoothAdapterChanged(state) => self.on_adapter_changed(state),
            TetherEvent::PanProfileChanged { connected } => {
                info!("PAN profile {}", if connected { "connected" } else { "disconnected" });
                self.link.adapter = self.hal.bluetooth_adapter_state();
            }
            TetherEvent::WifiApStateChanged(state) => self.link.wifi_ap = state,
            TetherEvent::P2pGoStateChanged(notification) => self.p2p.on_notification(notification),
            TetherEvent::P2pActionCompleted { action, cycle, result } => {
                self.p2p.on_action_result(action, cycle, result)
            }
            TetherEvent::PersistentGroupsAvailable(groups) => self.p2p.on_persistent_groups(groups),
            TetherEvent::ProvisioningCompleted { ticket, approved } => {
                self.on_provisioning_result(ticket, approved)
            }
            TetherEvent::RecheckCompleted { kind, approved } => self.on_recheck(kind, approved),
            TetherEvent::Refresh => {}
        }

        self.refresh();
    }

    fn on_adapter_changed(&mut self, state: AdapterState) {
        self.link.adapter = Some(state);
        if !self.bluetooth_enable_pending {
            return;
        }
        match state {
            AdapterState::On => {
                self.bluetooth_enable_pending = false;
                if let Err(e) = self.enable_pan() {
                    warn!("Deferred Bluetooth tethering failed: {}", e);
                }
            }
            AdapterState::Off | AdapterState::Error => {
                info!("Adapter went {:?} before PAN tethering started", state);
                self.bluetooth_enable_pending = false;
                let _ = self.apply(TransportKind::Bluetooth, MachineInput::Abandon);
            }
            AdapterState::TurningOn | AdapterState::TurningOff => {}
        }
    }

    fn on_provisioning_result(&mut self, ticket: Ticket, approved: bool) {
        if let Err(e) = self.gate.on_approval_result(ticket, approved) {
            debug!("Dropping provisioning result: {}", e);
            return;
        }
        if self.choice == ticket.kind {
            self.choice = TransportKind::Invalid;
        }

        if approved {
            if self.apply(ticket.kind, MachineInput::Approved).is_ok()
                && let Err(e) = self.start_tethering(ticket.kind)
            {
                warn!("Failed to start {} tethering: {}", ticket.kind, e);
            }
        } else {
            info!("{}", TetherError::ProvisioningDenied(ticket.kind));
            let _ = self.apply(ticket.kind, MachineInput::Denied);
        }
    }

    fn on_recheck(&mut self, kind: TransportKind, approved: bool) {
        if approved {
            debug!("Provisioning recheck passed for {}", kind);
            return;
        }
        let wants_on = self.machine_state(kind).is_some_and(|s| s.wants_on());
        if wants_on {
            warn!("Provisioning recheck failed for {}, disabling", kind);
            if let Err(e) = self.disable(kind) {
                warn!("Failed to disable {}: {}", kind, e);
            }
        }
    }

    // ========================================================================
    // 重算
    // ========================================================================

    fn refresh(&mut self) {
        self.snapshot = self.hal.list_interfaces();
        self.recompute();
    }

    fn recompute(&mut self) {
        self.link.pan = self.pan.get().map(|pan| PanReading {
            tethering_on: pan.is_tethering_on(),
            connected_devices: pan.connected_device_count(),
        });
        self.resolution = resolve_all(&self.snapshot, &self.patterns, &self.link);

        for kind in [TransportKind::Usb, TransportKind::WifiAp, TransportKind::Bluetooth] {
            let status = self.resolution.status(kind);
            let _ = self.apply(kind, MachineInput::Observed(status));
        }
    }

    pub fn snapshot(&self) -> TetherSnapshot {
        let machines = [TransportKind::Usb, TransportKind::WifiAp, TransportKind::Bluetooth]
            .into_iter()
            .filter_map(|kind| self.machine_state(kind).map(|state| (kind, state)))
            .collect();

        TetherSnapshot {
            views: TransportKind::ALL.iter().map(|&kind| self.view(kind)).collect(),
            machines,
            p2p: self.p2p.state().clone(),
            choice: (self.choice != TransportKind::Invalid).then_some(self.choice),
            restricted: self.restricted,
        }
    }

    pub fn view(&self, kind: TransportKind) -> TransportView {
        if self.restricted {
            return TransportView {
                summary: Summary::Restricted,
                ..TransportView::hidden(kind)
            };
        }
        if kind == TransportKind::P2pGo {
            return self.p2p.view();
        }
        let Some(machine) = self.machine(kind) else {
            return TransportView::hidden(kind);
        };
        if self.patterns.for_kind(kind).is_none_or(|p| p.is_empty()) {
            return TransportView::hidden(kind);
        }

        let state = machine.state();
        let status = self.resolution.status(kind);
        let checked = (status == TransportStatus::Active && state != MachineState::Deactivating)
            || matches!(state, MachineState::AwaitingProvisioning | MachineState::Activating);
        let errored = state == MachineState::Errored;

        let (enabled, summary) = match kind {
            TransportKind::Usb => self.usb_summary(errored),
            TransportKind::WifiAp => self.wifi_summary(status, errored),
            _ => self.bluetooth_summary(errored),
        };

        let mut view = TransportView {
            kind,
            status,
            enabled,
            checked,
            visible: true,
            summary,
        };
        if self.gate.is_unavailable() {
            view.enabled = false;
            view.summary = Summary::ProvisioningUnavailable;
        }
        view
    }

    fn usb_summary(&self, errored: bool) -> (bool, Summary) {
        match self.resolution.usb {
            UsbDetail::Tethered => (true, Summary::UsbActive),
            UsbDetail::Available { last_error } if last_error || errored => (true, Summary::UsbErrored),
            UsbDetail::Available { .. } => (true, Summary::UsbAvailable),
            UsbDetail::Errored => (false, Summary::UsbErrored),
            UsbDetail::MassStorage => (false, Summary::UsbMassStorage),
            UsbDetail::Unavailable => (false, Summary::UsbUnavailable),
        }
    }

    fn wifi_summary(&self, status: TransportStatus, errored: bool) -> (bool, Summary) {
        let configured = || match &self.wifi_config {
            Some(config) => Summary::WifiAp {
                ssid: config.ssid.clone(),
                security: config.security,
            },
            None => Summary::WifiAp {
                ssid: WifiApConfig::DEFAULT_SSID.to_string(),
                security: Default::default(),
            },
        };

        match status {
            TransportStatus::TurningOn => (false, Summary::WifiApTurningOn),
            TransportStatus::TurningOff => (false, Summary::WifiApTurningOff),
            TransportStatus::Errored => (true, Summary::WifiApErrored),
            TransportStatus::Available if errored => (true, Summary::WifiApErrored),
            TransportStatus::Active | TransportStatus::Available => (true, configured()),
            TransportStatus::Unavailable => (false, Summary::Empty),
        }
    }

    fn bluetooth_summary(&self, errored: bool) -> (bool, Summary) {
        match self.resolution.bluetooth {
            BluetoothDetail::Unavailable => (false, Summary::BluetoothUnavailable),
            BluetoothDetail::TurningOn => (false, Summary::BluetoothTurningOn),
            BluetoothDetail::TurningOff => (false, Summary::BluetoothTurningOff),
            BluetoothDetail::Active { devices, .. } if devices > 0 => {
                (true, Summary::BluetoothDevicesConnected { count: devices })
            }
            BluetoothDetail::Active { errored: true, .. } => (true, Summary::BluetoothErrored),
            BluetoothDetail::Active { .. } => (true, Summary::BluetoothAvailable),
            BluetoothDetail::Idle { errored: iface_errored } => {
                if iface_errored || errored || self.bluetooth_untether_failed {
                    (true, Summary::BluetoothErrored)
                } else {
                    (true, Summary::BluetoothOff)
                }
            }
        }
    }
}
