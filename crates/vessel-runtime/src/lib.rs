//! Lower-layer collaborators for the Vessel lifecycle orchestrator.
//!
//! This crate implements the execution layer behind four traits:
//! `KernelDriver` (container create/enter/stop, resource limits, network
//! identity, checkpoint/restore), `ImageStore` (plain-directory and ploop
//! storage), `QuotaTool` (directory quota) and `GuestConfigurator` (action
//! scripts run against the container root). It also provides timed child
//! execution, per-distribution action tables, prerequisite checks and
//! journalled mock implementations used by tests.

pub mod cgroup;
pub mod dist;
pub mod exec;
pub mod guest;
pub mod image;
pub mod kernel;
pub mod mock;
pub mod prereq;
pub mod quota;

pub use cgroup::CgroupDriver;
pub use dist::{DistActions, GuestAction};
pub use exec::{run_checked, run_with_timeout, shell_quote, CommandOutput, HELPER_TIMEOUT};
pub use guest::{run_host_script, GuestConfigurator, ScriptConfigurator, ScriptRequest};
pub use image::{
    is_mountpoint, select_image_store, ImageStore, MountRequest, PlainStore, PloopStore, Snapshot,
};
pub use kernel::{
    select_driver, CheckpointOp, CreateRequest, InitHandle, KernelDriver, RestoreOp, StopMode,
};
pub use mock::{FailPoint, Journal, MockDriver, MockGuest, MockImageStore, MockQuota};
pub use prereq::{check_driver_prereqs, check_storage_prereqs, format_missing, MissingPrereq};
pub use quota::{QuotaRequest, QuotaTool, VzQuota};

use std::time::Duration;
use thiserror::Error;
use vessel_schema::ConfigError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("kernel driver '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("container {0} is not running")]
    NotRunning(String),
    #[error("container {0} is already running")]
    AlreadyRunning(String),
    #[error("execution failed: {0}")]
    ExecFailed(String),
    #[error("'{command}' timed out after {}s", .after.as_secs())]
    Timeout { command: String, after: Duration },
    #[error("checkpoint failed: {0}")]
    Checkpoint(String),
    #[error("restore failed: {0}")]
    Restore(String),
    #[error("mount failed: {0}")]
    Mount(String),
    #[error("unmount failed: {0}")]
    Umount(String),
    #[error("quota operation failed: {0}")]
    Quota(String),
    #[error("image operation failed: {0}")]
    Image(String),
    #[error("network setup failed: {0}")]
    Network(String),
    #[error("action script {script} exited with code {code}")]
    Script { script: String, code: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_distinct_from_exec_failure() {
        let t = RuntimeError::Timeout {
            command: "criu dump".to_owned(),
            after: Duration::from_secs(30),
        };
        assert!(t.to_string().contains("30s"));
        assert!(!matches!(t, RuntimeError::ExecFailed(_)));
    }

    #[test]
    fn script_error_names_script_and_code() {
        let e = RuntimeError::Script {
            script: "set_hostname.sh".to_owned(),
            code: 3,
        };
        let msg = e.to_string();
        assert!(msg.contains("set_hostname.sh"));
        assert!(msg.contains('3'));
    }
}
