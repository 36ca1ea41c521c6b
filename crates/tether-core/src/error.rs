//! 错误类型
//!
//! 编排引擎内的所有失败都只会降级单个传输方式，不会影响进程本身。

use crate::model::TransportKind;

#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// 硬件层拒绝了启用/停用调用
    #[error("{kind} rejected by hardware (code {code})")]
    HardwareRejected { kind: TransportKind, code: i32 },

    #[error("provisioning denied for {0}")]
    ProvisioningDenied(TransportKind),

    /// 需要授权但没有注册授权应用，该传输方式永久不可用
    #[error("provisioning required for {0} but no approval app is registered")]
    ProvisioningUnavailable(TransportKind),

    #[error("Bluetooth adapter or PAN profile not available")]
    AdapterUnavailable,

    /// 同一传输方式已有未完成的授权请求
    #[error("{0} already has a pending activation request")]
    Busy(TransportKind),

    #[error("stale event for {kind}: expected cycle {expected}, got {got}")]
    StaleEvent {
        kind: TransportKind,
        expected: u64,
        got: u64,
    },

    #[error("tethering is restricted on this device")]
    Restricted,

    #[error("{0} tethering is not supported")]
    Unsupported(TransportKind),

    #[error("invalid interface pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid Wi-Fi AP configuration: {0}")]
    InvalidApConfig(String),

    /// 调度器已关闭
    #[error("dispatcher is not running")]
    Closed,
}

impl TetherError {
    /// 是否属于在本地恢复、只需回滚开关的错误
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TetherError::HardwareRejected { .. } | TetherError::ProvisioningDenied(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
