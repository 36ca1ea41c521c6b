//! 基于外部命令的授权
//!
//! 配置的授权命令以传输方式名作为最后一个参数运行，退出码 0 表示批准。
//! 批准后按固定间隔复查，复查失败时投递 `RecheckCompleted { approved: false }`。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::ProvisioningSettings;
use crate::event::{EventSink, TetherEvent};
use crate::hal::Provisioner;
use crate::model::TransportKind;
use crate::provisioning::Ticket;

pub struct CommandProvisioner {
    settings: ProvisioningSettings,
    sink: EventSink,
    runtime: Handle,
    rechecks: Mutex<HashMap<TransportKind, JoinHandle<()>>>,
}

impl CommandProvisioner {
    pub fn new(settings: ProvisioningSettings, sink: EventSink, runtime: Handle) -> Self {
        Self {
            settings,
            sink,
            runtime,
            rechecks: Mutex::new(HashMap::new()),
        }
    }
}

/// 运行授权命令，无法启动时视为拒绝
async fn run_approval(app: &str, args: &[String], kind: TransportKind) -> bool {
    match Command::new(app).args(args).arg(kind.name()).status().await {
        Ok(status) => {
            debug!("Approval command for {} exited with {}", kind, status);
            status.success()
        }
        Err(e) => {
            warn!("Failed to run approval command {}: {}", app, e);
            false
        }
    }
}

/// 在 PATH 中查找命令
fn command_exists(app: &str) -> bool {
    if app.contains('/') {
        return Path::new(app).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(app).is_file()))
        .unwrap_or(false)
}

impl Provisioner for CommandProvisioner {
    fn is_provisioning_required(&self) -> bool {
        self.settings.is_required()
    }

    fn is_approval_app_available(&self) -> bool {
        self.settings.app.as_deref().is_some_and(command_exists)
    }

    fn launch(&self, ticket: Ticket) {
        let Some(app) = self.settings.app.clone() else {
            return;
        };
        let args = self.settings.args.clone();
        let sink = self.sink.clone();
        info!("Launching approval for {}", ticket.kind);

        self.runtime.spawn(async move {
            let approved = run_approval(&app, &args, ticket.kind).await;
            sink.post(TetherEvent::ProvisioningCompleted { ticket, approved });
        });
    }

    fn schedule_recheck(&self, kind: TransportKind) {
        let Some(app) = self.settings.app.clone() else {
            return;
        };
        let args = self.settings.args.clone();
        let sink = self.sink.clone();
        let interval = Duration::from_secs(self.settings.recheck_interval_secs.max(1));

        let task = self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let approved = run_approval(&app, &args, kind).await;
                if !sink.post(TetherEvent::RecheckCompleted { kind, approved }) || !approved {
                    break;
                }
            }
        });

        let mut rechecks = match self.rechecks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = rechecks.insert(kind, task) {
            previous.abort();
        }
        debug!("Scheduled provisioning recheck for {} every {:?}", kind, interval);
    }

    fn cancel_recheck(&self, kind: TransportKind) {
        let mut rechecks = match self.rechecks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(task) = rechecks.remove(&kind) {
            task.abort();
            debug!("Cancelled provisioning recheck for {}", kind);
        }
    }
}
