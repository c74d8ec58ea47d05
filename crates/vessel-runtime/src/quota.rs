//! Directory disk quota through the `vzquota` helper.

use crate::exec::{run_checked, run_with_timeout, HELPER_TIMEOUT};
use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};
use vessel_schema::{BarrierLimit, ContainerId, QuotaParams, UNLIMITED};

/// Limits for one container's quota. Space is in KiB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRequest {
    pub id: ContainerId,
    pub private: PathBuf,
    pub diskspace: BarrierLimit,
    pub diskinodes: BarrierLimit,
    pub quotatime: u64,
    /// Second-level quota group count, 0 when disabled.
    pub ugidlimit: u64,
}

impl QuotaRequest {
    pub fn from_params(id: ContainerId, private: &Path, q: &QuotaParams) -> Self {
        Self {
            id,
            private: private.to_path_buf(),
            diskspace: q.diskspace.unwrap_or_else(BarrierLimit::unlimited),
            diskinodes: q.diskinodes.unwrap_or_else(BarrierLimit::unlimited),
            quotatime: q.quotatime.unwrap_or(0),
            ugidlimit: q.ugidlimit.unwrap_or(0),
        }
    }

    /// Limits doubled, used while the container's own setup runs.
    #[must_use]
    pub fn inflated(&self) -> Self {
        let double = |p: BarrierLimit| {
            BarrierLimit::new(p.barrier.saturating_mul(2), p.limit.saturating_mul(2))
        };
        Self {
            diskspace: double(self.diskspace),
            diskinodes: double(self.diskinodes),
            ..self.clone()
        }
    }
}

pub trait QuotaTool: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self, req: &QuotaRequest) -> Result<(), RuntimeError>;

    fn on(&self, req: &QuotaRequest) -> Result<(), RuntimeError>;

    fn off(&self, id: ContainerId) -> Result<(), RuntimeError>;

    fn set_limits(&self, req: &QuotaRequest) -> Result<(), RuntimeError>;

    /// Remove quota accounting files.
    fn drop_quota(&self, id: ContainerId) -> Result<(), RuntimeError>;
}

pub struct VzQuota {
    binary: PathBuf,
}

impl Default for VzQuota {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("vzquota"),
        }
    }
}

fn limit_arg(v: u64) -> String {
    // vzquota takes the largest 32-bit value as "no limit".
    if v == UNLIMITED {
        u32::MAX.to_string()
    } else {
        v.to_string()
    }
}

fn quota_err(e: RuntimeError) -> RuntimeError {
    match e {
        RuntimeError::ExecFailed(m) => RuntimeError::Quota(m),
        other => other,
    }
}

impl VzQuota {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn limit_args(req: &QuotaRequest) -> Vec<String> {
        let mut args = vec![
            "-b".to_owned(),
            limit_arg(req.diskspace.barrier),
            "-B".to_owned(),
            limit_arg(req.diskspace.limit),
            "-i".to_owned(),
            limit_arg(req.diskinodes.barrier),
            "-I".to_owned(),
            limit_arg(req.diskinodes.limit),
            "-e".to_owned(),
            req.quotatime.to_string(),
            "-n".to_owned(),
            req.quotatime.to_string(),
        ];
        if req.ugidlimit > 0 {
            args.extend(["-s".to_owned(), "1".to_owned()]);
            args.extend(["-u".to_owned(), req.ugidlimit.to_string()]);
        }
        args
    }

    fn run(&self, sub: &str, id: ContainerId, extra: &[String]) -> Result<(), RuntimeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(sub).arg(id.to_string()).args(extra);
        run_checked(cmd, HELPER_TIMEOUT).map_err(quota_err)?;
        debug!("vzquota {sub} {id}");
        Ok(())
    }
}

impl QuotaTool for VzQuota {
    fn name(&self) -> &'static str {
        "vzquota"
    }

    fn init(&self, req: &QuotaRequest) -> Result<(), RuntimeError> {
        let mut args = Self::limit_args(req);
        args.push("-p".to_owned());
        args.push(req.private.to_string_lossy().into_owned());
        self.run("init", req.id, &args)?;
        info!("quota initialized for container {}", req.id);
        Ok(())
    }

    fn on(&self, req: &QuotaRequest) -> Result<(), RuntimeError> {
        let mut args = Self::limit_args(req);
        args.push("-p".to_owned());
        args.push(req.private.to_string_lossy().into_owned());
        self.run("on", req.id, &args)
    }

    fn off(&self, id: ContainerId) -> Result<(), RuntimeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("off").arg(id.to_string());
        let out = run_with_timeout(cmd, None, HELPER_TIMEOUT)?;
        // exit 6: quota is not running
        if !out.success() && out.code != 6 {
            return Err(RuntimeError::Quota(format!(
                "vzquota off {id} exited with {}: {}",
                out.code,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    fn set_limits(&self, req: &QuotaRequest) -> Result<(), RuntimeError> {
        self.run("setlimit", req.id, &Self::limit_args(req))
    }

    fn drop_quota(&self, id: ContainerId) -> Result<(), RuntimeError> {
        self.run("drop", id, &[])
    }
}
