//! 授权门（provisioning gate）
//!
//! 决定某个传输方式的启用是否需要外部授权，记录未完成的请求，
//! 并把授权结果转换为“继续启用”或“回滚开关”。
//! 每个传输方式同一时间最多只有一个未完成的请求。

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{Result, TetherError};
use crate::hal::Provisioner;
use crate::model::TransportKind;

/// 待处理请求的句柄，`cycle` 用于识别过期结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Ticket {
    pub kind: TransportKind,
    pub cycle: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Approved,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningRequest {
    pub ticket: Ticket,
    pub outcome: Outcome,
}

/// `request_activation` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// 不需要授权，可以直接启用
    Approved,
    /// 已启动授权流程
    Pending(Ticket),
}

impl Activation {
    pub fn is_pending(&self) -> bool {
        matches!(self, Activation::Pending(_))
    }
}

pub struct ProvisioningGate {
    provisioner: Arc<dyn Provisioner>,
    pending: HashMap<TransportKind, ProvisioningRequest>,
}

impl ProvisioningGate {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            pending: HashMap::new(),
        }
    }

    pub fn is_required(&self) -> bool {
        self.provisioner.is_provisioning_required()
    }

    /// 需要授权但没有授权应用
    pub fn is_unavailable(&self) -> bool {
        self.is_required() && !self.provisioner.is_approval_app_available()
    }

    pub fn pending(&self, kind: TransportKind) -> Option<&ProvisioningRequest> {
        self.pending.get(&kind)
    }

    pub fn request_activation(&mut self, ticket: Ticket) -> Result<Activation> {
        if self.pending.contains_key(&ticket.kind) {
            return Err(TetherError::Busy(ticket.kind));
        }
        if !self.is_required() {
            return Ok(Activation::Approved);
        }
        if !self.provisioner.is_approval_app_available() {
            return Err(TetherError::ProvisioningUnavailable(ticket.kind));
        }

        self.pending.insert(
            ticket.kind,
            ProvisioningRequest {
                ticket,
                outcome: Outcome::Pending,
            },
        );
        info!("Provisioning {} (cycle {})", ticket.kind, ticket.cycle);
        self.provisioner.launch(ticket);
        Ok(Activation::Pending(ticket))
    }

    /// 处理授权结果，返回带最终结果的请求
    ///
    /// 批准时安排复查定时器；拒绝时只清除请求，由调用方回滚开关。
    pub fn on_approval_result(&mut self, ticket: Ticket, approved: bool) -> Result<ProvisioningRequest> {
        let stale = |expected| TetherError::StaleEvent {
            kind: ticket.kind,
            expected,
            got: ticket.cycle,
        };
        let mut request = match self.pending.remove(&ticket.kind) {
            Some(request) if request.ticket == ticket => request,
            Some(other) => {
                let expected = other.ticket.cycle;
                self.pending.insert(ticket.kind, other);
                return Err(stale(expected));
            }
            None => return Err(stale(0)),
        };

        if approved {
            request.outcome = Outcome::Approved;
            self.provisioner.schedule_recheck(ticket.kind);
            info!("Provisioning approved for {}", ticket.kind);
        } else {
            request.outcome = Outcome::Denied;
            warn!("Provisioning denied for {}", ticket.kind);
        }
        Ok(request)
    }

    /// 用户在等待授权期间关闭了传输方式，之后到达的结果视为过期
    pub fn abandon(&mut self, kind: TransportKind) -> Option<ProvisioningRequest> {
        let request = self.pending.remove(&kind);
        if request.is_some() {
            debug!("Abandoned pending provisioning for {}", kind);
        }
        request
    }

    /// 取消复查定时器，没有定时器时为空操作
    pub fn cancel_recheck(&self, kind: TransportKind) {
        if self.is_required() {
            self.provisioner.cancel_recheck(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        required: bool,
        app: bool,
        calls: Mutex<Vec<String>>,
    }

    impl Provisioner for Recorder {
        fn is_provisioning_required(&self) -> bool {
            self.required
        }

        fn is_approval_app_available(&self) -> bool {
            self.app
        }

        fn launch(&self, ticket: Ticket) {
            self.calls.lock().unwrap().push(format!("launch {}", ticket.kind));
        }

        fn schedule_recheck(&self, kind: TransportKind) {
            self.calls.lock().unwrap().push(format!("schedule {}", kind));
        }

        fn cancel_recheck(&self, kind: TransportKind) {
            self.calls.lock().unwrap().push(format!("cancel {}", kind));
        }
    }

    fn gate(required: bool, app: bool) -> (ProvisioningGate, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            required,
            app,
            ..Default::default()
        });
        (ProvisioningGate::new(recorder.clone()), recorder)
    }

    fn ticket(kind: TransportKind, cycle: u64) -> Ticket {
        Ticket { kind, cycle }
    }

    #[test]
    fn test_not_required_is_approved_immediately() {
        let (mut gate, recorder) = gate(false, false);
        let activation = gate.request_activation(ticket(TransportKind::Usb, 1)).unwrap();
        assert_eq!(activation, Activation::Approved);
        assert!(gate.pending(TransportKind::Usb).is_none());
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_second_request_is_busy() {
        let (mut gate, _) = gate(true, true);
        let first = gate.request_activation(ticket(TransportKind::WifiAp, 1)).unwrap();
        assert!(first.is_pending());

        let err = gate.request_activation(ticket(TransportKind::WifiAp, 2)).unwrap_err();
        assert!(matches!(err, TetherError::Busy(TransportKind::WifiAp)));
        assert_eq!(gate.pending(TransportKind::WifiAp).unwrap().ticket.cycle, 1);

        // 其他传输方式不受影响
        assert!(gate.request_activation(ticket(TransportKind::Usb, 1)).is_ok());
    }

    #[test]
    fn test_missing_app_is_unavailable() {
        let (mut gate, _) = gate(true, false);
        assert!(gate.is_unavailable());
        let err = gate.request_activation(ticket(TransportKind::Usb, 1)).unwrap_err();
        assert!(matches!(err, TetherError::ProvisioningUnavailable(TransportKind::Usb)));
    }

    #[test]
    fn test_approval_schedules_recheck() {
        let (mut gate, recorder) = gate(true, true);
        let t = ticket(TransportKind::Bluetooth, 3);
        gate.request_activation(t).unwrap();

        let request = gate.on_approval_result(t, true).unwrap();
        assert_eq!(request.outcome, Outcome::Approved);
        assert!(gate.pending(TransportKind::Bluetooth).is_none());
        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["launch bluetooth".to_string(), "schedule bluetooth".to_string()]
        );
    }

    #[test]
    fn test_denial_clears_request() {
        let (mut gate, _) = gate(true, true);
        let t = ticket(TransportKind::WifiAp, 1);
        gate.request_activation(t).unwrap();

        let request = gate.on_approval_result(t, false).unwrap();
        assert_eq!(request.outcome, Outcome::Denied);
        assert!(gate.request_activation(ticket(TransportKind::WifiAp, 2)).is_ok());
    }

    #[test]
    fn test_stale_result_is_rejected() {
        let (mut gate, _) = gate(true, true);
        gate.request_activation(ticket(TransportKind::Usb, 2)).unwrap();

        let err = gate.on_approval_result(ticket(TransportKind::Usb, 1), true).unwrap_err();
        assert!(matches!(
            err,
            TetherError::StaleEvent {
                expected: 2,
                got: 1,
                ..
            }
        ));
        assert!(gate.pending(TransportKind::Usb).is_some());

        gate.abandon(TransportKind::Usb);
        assert!(gate.on_approval_result(ticket(TransportKind::Usb, 2), true).is_err());
    }

    #[test]
    fn test_cancel_recheck_only_when_required() {
        let (gate_off, recorder_off) = gate(false, false);
        gate_off.cancel_recheck(TransportKind::Usb);
        assert!(recorder_off.calls.lock().unwrap().is_empty());

        let (gate_on, recorder_on) = gate(true, true);
        gate_on.cancel_recheck(TransportKind::Usb);
        gate_on.cancel_recheck(TransportKind::Usb);
        assert_eq!(recorder_on.calls.lock().unwrap().len(), 2);
    }
}
