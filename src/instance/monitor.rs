//! Per-instance watcher: waits out the time budget and records how the
//! worker ended.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::manager::{Instance, InstanceStatus, ManagerInner};
use super::worker::{ExitClass, WorkerExit};

pub(super) async fn watch(inner: Arc<ManagerInner>, instance: Arc<Instance>) {
    match instance.worker.wait(instance.duration).await {
        Ok(Some(exit)) => record_exit(&instance, exit).await,
        Ok(None) => {
            warn!(
                instance_id = %instance.id,
                budget_secs = instance.duration.as_secs(),
                "instance exceeded its time budget, terminating"
            );
            if let Err(e) = inner.kill_and_settle(&instance, InstanceStatus::Timeout).await {
                error!(instance_id = %instance.id, error = %format!("{e:#}"), "failed to kill timed out instance");
                instance.lifecycle.lock().await.settle(InstanceStatus::Timeout);
            }
        }
        Err(e) => {
            error!(instance_id = %instance.id, error = %format!("{e:#}"), "error monitoring instance");
            instance.lifecycle.lock().await.settle(InstanceStatus::Error);
        }
    }
}

async fn record_exit(instance: &Instance, exit: WorkerExit) {
    let status = InstanceStatus::from_exit(exit);
    if !instance.lifecycle.lock().await.settle(status) {
        debug!(instance_id = %instance.id, observed = %status, "instance was already settled");
    }

    match exit.class() {
        ExitClass::Success => info!(instance_id = %instance.id, "instance completed"),
        ExitClass::Killed => {
            info!(instance_id = %instance.id, "instance was killed");
            match instance.worker.drain_output().await {
                Ok(output) if !output.stderr.is_empty() => {
                    debug!(instance_id = %instance.id, stderr = %output.stderr, "killed instance stderr");
                }
                Ok(_) => {}
                Err(e) => debug!(instance_id = %instance.id, error = %e, "could not read killed instance output"),
            }
        }
        ExitClass::Failed => {
            error!(
                instance_id = %instance.id,
                code = ?exit.code,
                signal = ?exit.signal,
                "instance failed"
            );
            match instance.worker.drain_output().await {
                Ok(output) if !output.stderr.is_empty() => {
                    error!(instance_id = %instance.id, stderr = %output.stderr, "failed instance stderr");
                }
                Ok(_) => {}
                Err(e) => error!(instance_id = %instance.id, error = %e, "could not read failed instance output"),
            }
        }
    }
}
