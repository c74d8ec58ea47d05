use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vessel_schema::{ContainerId, CpuParams, DeviceGrant, IpEntry, ResourceSet, VethDevice};

/// What the kernel needs to create a container's init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub id: ContainerId,
    pub root: PathBuf,
    pub hostname: Option<String>,
    /// Guest init command line.
    pub init: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CreateRequest {
    pub fn new(id: ContainerId, root: &Path) -> Self {
        Self {
            id,
            root: root.to_path_buf(),
            hostname: None,
            init: vec!["/sbin/init".to_owned()],
            env: vec![
                (
                    "PATH".to_owned(),
                    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_owned(),
                ),
                ("TERM".to_owned(), "linux".to_owned()),
            ],
        }
    }
}

/// A freshly created container whose init is parked until the caller has
/// finished setting it up.
pub trait InitHandle: Send {
    fn pid(&self) -> u32;

    /// Let the guest init run.
    fn proceed(self: Box<Self>) -> Result<(), RuntimeError>;

    /// Tear the parked container down.
    fn abort(self: Box<Self>) -> Result<(), RuntimeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Ask the guest init to halt.
    Graceful,
    /// Kill every process and release kernel state.
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOp {
    /// Suspend, dump, then kill.
    Full,
    Suspend,
    Dump,
    Resume,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOp {
    /// Undump, then resume.
    Full,
    Undump,
    Resume,
    Kill,
}

pub trait KernelDriver: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Whether kernel state exists for `id`, running or not.
    fn exists(&self, id: ContainerId) -> Result<bool, RuntimeError>;

    fn is_running(&self, id: ContainerId) -> Result<bool, RuntimeError>;

    fn is_frozen(&self, id: ContainerId) -> Result<bool, RuntimeError>;

    /// Host pid of the container's init, when running.
    fn init_pid(&self, id: ContainerId) -> Result<Option<u32>, RuntimeError>;

    fn create(&self, req: &CreateRequest) -> Result<Box<dyn InitHandle>, RuntimeError>;

    /// Interactive shell inside a running container. Returns its exit code.
    fn enter(&self, id: ContainerId) -> Result<i32, RuntimeError>;

    /// Run `argv` inside a running container with inherited stdio.
    fn exec(&self, id: ContainerId, argv: &[String]) -> Result<i32, RuntimeError>;

    fn stop(&self, id: ContainerId, mode: StopMode) -> Result<(), RuntimeError>;

    fn apply_resource_limits(&self, id: ContainerId, res: &ResourceSet)
        -> Result<(), RuntimeError>;

    fn set_cpu(&self, id: ContainerId, cpu: &CpuParams) -> Result<(), RuntimeError>;

    fn set_ioprio(&self, id: ContainerId, prio: u8) -> Result<(), RuntimeError>;

    fn set_device_permission(
        &self,
        id: ContainerId,
        root: &Path,
        grant: &DeviceGrant,
    ) -> Result<(), RuntimeError>;

    fn set_capabilities(&self, id: ContainerId, mask: u64) -> Result<(), RuntimeError>;

    fn add_ip(&self, id: ContainerId, ip: &IpEntry) -> Result<(), RuntimeError>;

    fn del_ip(&self, id: ContainerId, ip: &IpEntry) -> Result<(), RuntimeError>;

    /// Addresses currently bound to the container.
    fn list_ips(&self, id: ContainerId) -> Result<Vec<IpEntry>, RuntimeError>;

    fn add_veth(&self, id: ContainerId, dev: &VethDevice) -> Result<(), RuntimeError>;

    fn del_veth(&self, id: ContainerId, dev: &VethDevice) -> Result<(), RuntimeError>;

    fn checkpoint(
        &self,
        id: ContainerId,
        op: CheckpointOp,
        dump: &Path,
        timeout: Duration,
    ) -> Result<(), RuntimeError>;

    fn restore(
        &self,
        req: &CreateRequest,
        op: RestoreOp,
        dump: &Path,
        timeout: Duration,
    ) -> Result<(), RuntimeError>;

    /// Block until the guest init reports a runlevel.
    fn wait_for_runlevel(&self, id: ContainerId, timeout: Duration) -> Result<(), RuntimeError>;
}

pub fn select_driver(name: &str) -> Result<Box<dyn KernelDriver>, RuntimeError> {
    match name {
        "cgroup" => Ok(Box::new(crate::cgroup::CgroupDriver::new())),
        "mock" => Ok(Box::new(crate::mock::MockDriver::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
