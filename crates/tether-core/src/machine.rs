//! 传输状态机（USB / Wi-Fi AP / 蓝牙）
//!
//! ```text
//! Off ──enable──> AwaitingProvisioning ──approved──> Activating ──confirmed──> Active
//!  ^  \──enable (无需授权)──────────────────────────────^                          │
//!  │                          └──denied──> Off                              disable
//!  └──────────────── confirmed (inactive) ── Deactivating <──────────────────────┘
//! 任意状态 ──hardware error──> Errored ──enable──> (重试)
//! ```
//!
//! 状态机本身不做任何硬件调用，只负责转换和周期编号；副作用由引擎执行。

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TetherError};
use crate::model::{TransportKind, TransportStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    #[default]
    Off,
    AwaitingProvisioning,
    Activating,
    Active,
    Deactivating,
    Errored,
}

impl MachineState {
    /// 用户意图为“开启”的状态
    pub fn wants_on(&self) -> bool {
        matches!(
            self,
            MachineState::AwaitingProvisioning | MachineState::Activating | MachineState::Active
        )
    }
}

/// 状态机输入
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineInput {
    UserEnable { needs_approval: bool },
    Approved,
    Denied,
    UserDisable,
    /// 解析器得到的最新状态
    Observed(TransportStatus),
    /// 硬件调用返回失败
    HardwareError,
    /// 启用流程被放弃（例如蓝牙适配器在开启前关闭）
    Abandon,
}

#[derive(Debug, Clone)]
pub struct TransportMachine {
    kind: TransportKind,
    state: MachineState,
    cycle: u64,
}

impl TransportMachine {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            state: MachineState::Off,
            cycle: 0,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    /// 当前启用周期编号，每次用户启用时递增
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn apply(&mut self, input: MachineInput) -> Result<MachineState> {
        use MachineInput as I;
        use MachineState as S;

        let next = match (self.state, input) {
            (S::AwaitingProvisioning, I::UserEnable { .. }) => {
                return Err(TetherError::Busy(self.kind));
            }
            (S::Activating | S::Active, I::UserEnable { .. }) => self.state,
            (_, I::UserEnable { needs_approval }) => {
                self.cycle += 1;
                if needs_approval {
                    S::AwaitingProvisioning
                } else {
                    S::Activating
                }
            }

            (S::AwaitingProvisioning, I::Approved) => S::Activating,
            (S::AwaitingProvisioning, I::Denied) => S::Off,
            (state, I::Approved | I::Denied) => state,

            (S::Active | S::Activating, I::UserDisable) => S::Deactivating,
            (S::Deactivating, I::UserDisable) => S::Deactivating,
            (_, I::UserDisable) => S::Off,

            (_, I::HardwareError) => S::Errored,

            (S::AwaitingProvisioning | S::Activating, I::Abandon) => S::Off,
            (state, I::Abandon) => state,

            (state, I::Observed(status)) => Self::observe(state, status),
        };

        if next != self.state {
            debug!("{} machine: {:?} -> {:?} ({:?})", self.kind, self.state, next, input);
            self.state = next;
        }
        Ok(next)
    }

    fn observe(state: MachineState, status: TransportStatus) -> MachineState {
        use MachineState as S;
        use TransportStatus as T;

        match (state, status) {
            (S::Off | S::Errored | S::Activating, T::Active) => S::Active,
            (S::Activating | S::Active, T::Errored) => S::Errored,
            (S::Active | S::Deactivating, T::Available | T::Unavailable | T::Errored) => S::Off,
            (state, _) => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> TransportMachine {
        TransportMachine::new(TransportKind::Usb)
    }

    #[test]
    fn test_enable_with_provisioning() {
        let mut m = machine();
        assert_eq!(
            m.apply(MachineInput::UserEnable { needs_approval: true }).unwrap(),
            MachineState::AwaitingProvisioning
        );
        assert_eq!(m.cycle(), 1);
        assert_eq!(m.apply(MachineInput::Approved).unwrap(), MachineState::Activating);
        assert_eq!(
            m.apply(MachineInput::Observed(TransportStatus::Available)).unwrap(),
            MachineState::Activating
        );
        assert_eq!(
            m.apply(MachineInput::Observed(TransportStatus::Active)).unwrap(),
            MachineState::Active
        );
    }

    #[test]
    fn test_enable_without_provisioning() {
        let mut m = machine();
        assert_eq!(
            m.apply(MachineInput::UserEnable { needs_approval: false }).unwrap(),
            MachineState::Activating
        );
    }

    #[test]
    fn test_denied_rolls_back() {
        let mut m = machine();
        m.apply(MachineInput::UserEnable { needs_approval: true }).unwrap();
        assert_eq!(m.apply(MachineInput::Denied).unwrap(), MachineState::Off);
    }

    #[test]
    fn test_enable_while_awaiting_is_busy() {
        let mut m = machine();
        m.apply(MachineInput::UserEnable { needs_approval: true }).unwrap();
        let err = m
            .apply(MachineInput::UserEnable { needs_approval: true })
            .unwrap_err();
        assert!(matches!(err, TetherError::Busy(TransportKind::Usb)));
        assert_eq!(m.cycle(), 1);
    }

    #[test]
    fn test_disable_cycle() {
        let mut m = machine();
        m.apply(MachineInput::UserEnable { needs_approval: false }).unwrap();
        m.apply(MachineInput::Observed(TransportStatus::Active)).unwrap();

        assert_eq!(m.apply(MachineInput::UserDisable).unwrap(), MachineState::Deactivating);
        // 硬件尚未确认
        assert_eq!(
            m.apply(MachineInput::Observed(TransportStatus::Active)).unwrap(),
            MachineState::Deactivating
        );
        assert_eq!(
            m.apply(MachineInput::Observed(TransportStatus::Available)).unwrap(),
            MachineState::Off
        );
    }

    #[test]
    fn test_hardware_error_then_retry() {
        let mut m = machine();
        m.apply(MachineInput::UserEnable { needs_approval: false }).unwrap();
        assert_eq!(m.apply(MachineInput::HardwareError).unwrap(), MachineState::Errored);

        // 不会自动重试
        assert_eq!(
            m.apply(MachineInput::Observed(TransportStatus::Available)).unwrap(),
            MachineState::Errored
        );

        assert_eq!(
            m.apply(MachineInput::UserEnable { needs_approval: false }).unwrap(),
            MachineState::Activating
        );
        assert_eq!(m.cycle(), 2);
    }

    #[test]
    fn test_abandon_returns_to_off() {
        let mut m = TransportMachine::new(TransportKind::Bluetooth);
        m.apply(MachineInput::UserEnable { needs_approval: false }).unwrap();
        assert_eq!(m.apply(MachineInput::Abandon).unwrap(), MachineState::Off);
    }

    #[test]
    fn test_external_activation_is_adopted() {
        let mut m = machine();
        assert_eq!(
            m.apply(MachineInput::Observed(TransportStatus::Active)).unwrap(),
            MachineState::Active
        );
        assert_eq!(
            m.apply(MachineInput::Observed(TransportStatus::Unavailable)).unwrap(),
            MachineState::Off
        );
    }
}
