//! In-process collaborators that record every call into a shared journal.
//!
//! Clones share state, so a test can hand one clone to the orchestrator and
//! inspect another. Failures are injected per call site with [`FailPoint`].

use crate::guest::{GuestConfigurator, ScriptRequest};
use crate::image::{ImageStore, MountRequest, Snapshot};
use crate::kernel::{CheckpointOp, CreateRequest, InitHandle, KernelDriver, RestoreOp, StopMode};
use crate::quota::{QuotaRequest, QuotaTool};
use crate::RuntimeError;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use vessel_schema::{
    ContainerId, CpuParams, DeviceGrant, Entry, IpEntry, ResourceSet, VethDevice,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Create,
    ApplyLimits,
    AddIp(IpAddr),
    AddVeth(String),
    Stop,
    Checkpoint,
    Restore,
    SetCaps,
    Mount,
    Umount,
    Quota,
    /// Action script by file name.
    Script(String),
}

#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        if let Ok(mut j) = self.0.lock() {
            j.push(entry.into());
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().map(|j| j.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut j) = self.0.lock() {
            j.clear();
        }
    }

    /// Entries starting with `prefix`, in call order.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    /// Index of the first entry starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.starts_with(prefix))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.entries()).unwrap_or_else(|_| "[]".to_owned())
    }
}

#[derive(Debug, Clone, Default)]
struct Failures(Arc<Mutex<HashSet<FailPoint>>>);

impl Failures {
    fn set(&self, point: FailPoint) {
        if let Ok(mut f) = self.0.lock() {
            f.insert(point);
        }
    }

    fn clear(&self) {
        if let Ok(mut f) = self.0.lock() {
            f.clear();
        }
    }

    fn hit(&self, point: &FailPoint) -> bool {
        self.0.lock().is_ok_and(|f| f.contains(point))
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> RuntimeError {
    RuntimeError::ExecFailed(format!("mutex poisoned: {e}"))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockContainer {
    pub running: bool,
    pub frozen: bool,
    pub ips: Vec<IpEntry>,
    pub veths: Vec<VethDevice>,
    pub caps: Option<u64>,
    pub limits: Option<ResourceSet>,
    pub cpu: Option<CpuParams>,
    pub ioprio: Option<u8>,
    pub devices: Vec<DeviceGrant>,
}

type DriverState = Arc<Mutex<HashMap<ContainerId, MockContainer>>>;

#[derive(Clone, Default)]
pub struct MockDriver {
    state: DriverState,
    journal: Journal,
    failures: Failures,
    ignore_graceful: Arc<Mutex<bool>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn fail_on(&self, point: FailPoint) {
        self.failures.set(point);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    /// Make graceful stops a no-op, so callers fall back to a kill.
    pub fn ignore_graceful_stop(&self, ignore: bool) {
        if let Ok(mut g) = self.ignore_graceful.lock() {
            *g = ignore;
        }
    }

    /// Seed a running container with bound addresses.
    pub fn set_running(&self, id: ContainerId, ips: &[IpEntry]) {
        if let Ok(mut s) = self.state.lock() {
            let c = s.entry(id).or_default();
            c.running = true;
            c.ips = ips.to_vec();
        }
    }

    pub fn container(&self, id: ContainerId) -> Option<MockContainer> {
        self.state.lock().ok().and_then(|s| s.get(&id).cloned())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ContainerId, MockContainer>>, RuntimeError> {
        self.state.lock().map_err(poisoned)
    }

    fn with_running<T>(
        &self,
        id: ContainerId,
        f: impl FnOnce(&mut MockContainer) -> T,
    ) -> Result<T, RuntimeError> {
        let mut s = self.lock()?;
        match s.get_mut(&id) {
            Some(c) => Ok(f(c)),
            None => Err(RuntimeError::NotRunning(id.to_string())),
        }
    }
}

struct MockInit {
    id: ContainerId,
    state: DriverState,
    journal: Journal,
}

impl InitHandle for MockInit {
    fn pid(&self) -> u32 {
        10_000 + self.id.get()
    }

    fn proceed(self: Box<Self>) -> Result<(), RuntimeError> {
        let mut s = self.state.lock().map_err(poisoned)?;
        s.entry(self.id).or_default().running = true;
        self.journal.record(format!("driver.proceed {}", self.id));
        Ok(())
    }

    fn abort(self: Box<Self>) -> Result<(), RuntimeError> {
        self.state.lock().map_err(poisoned)?.remove(&self.id);
        self.journal.record(format!("driver.abort {}", self.id));
        Ok(())
    }
}

impl KernelDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn exists(&self, id: ContainerId) -> Result<bool, RuntimeError> {
        Ok(self.lock()?.contains_key(&id))
    }

    fn is_running(&self, id: ContainerId) -> Result<bool, RuntimeError> {
        Ok(self.lock()?.get(&id).is_some_and(|c| c.running))
    }

    fn is_frozen(&self, id: ContainerId) -> Result<bool, RuntimeError> {
        Ok(self.lock()?.get(&id).is_some_and(|c| c.frozen))
    }

    fn init_pid(&self, id: ContainerId) -> Result<Option<u32>, RuntimeError> {
        Ok(self.is_running(id)?.then(|| 10_000 + id.get()))
    }

    fn create(&self, req: &CreateRequest) -> Result<Box<dyn InitHandle>, RuntimeError> {
        self.journal.record(format!("driver.create {}", req.id));
        if self.failures.hit(&FailPoint::Create) {
            return Err(RuntimeError::ExecFailed("injected create failure".to_owned()));
        }
        let mut s = self.lock()?;
        if s.get(&req.id).is_some_and(|c| c.running) {
            return Err(RuntimeError::AlreadyRunning(req.id.to_string()));
        }
        s.insert(req.id, MockContainer::default());
        Ok(Box::new(MockInit {
            id: req.id,
            state: Arc::clone(&self.state),
            journal: self.journal.clone(),
        }))
    }

    fn enter(&self, id: ContainerId) -> Result<i32, RuntimeError> {
        if !self.is_running(id)? {
            return Err(RuntimeError::NotRunning(id.to_string()));
        }
        self.journal.record(format!("driver.enter {id}"));
        Ok(0)
    }

    fn exec(&self, id: ContainerId, argv: &[String]) -> Result<i32, RuntimeError> {
        if !self.is_running(id)? {
            return Err(RuntimeError::NotRunning(id.to_string()));
        }
        self.journal
            .record(format!("driver.exec {id} {}", argv.join(" ")));
        Ok(0)
    }

    fn stop(&self, id: ContainerId, mode: StopMode) -> Result<(), RuntimeError> {
        let label = match mode {
            StopMode::Graceful => "graceful",
            StopMode::Kill => "kill",
        };
        self.journal.record(format!("driver.stop {id} {label}"));
        if self.failures.hit(&FailPoint::Stop) {
            return Err(RuntimeError::ExecFailed("injected stop failure".to_owned()));
        }
        if mode == StopMode::Graceful && self.ignore_graceful.lock().is_ok_and(|g| *g) {
            return Ok(());
        }
        self.lock()?.remove(&id);
        Ok(())
    }

    fn apply_resource_limits(
        &self,
        id: ContainerId,
        res: &ResourceSet,
    ) -> Result<(), RuntimeError> {
        self.journal.record(format!("driver.limits {id}"));
        if self.failures.hit(&FailPoint::ApplyLimits) {
            return Err(RuntimeError::ExecFailed("injected limits failure".to_owned()));
        }
        self.with_running(id, |c| c.limits = Some(res.clone()))
    }

    fn set_cpu(&self, id: ContainerId, cpu: &CpuParams) -> Result<(), RuntimeError> {
        self.journal.record(format!("driver.cpu {id}"));
        self.with_running(id, |c| c.cpu = Some(cpu.clone()))
    }

    fn set_ioprio(&self, id: ContainerId, prio: u8) -> Result<(), RuntimeError> {
        self.journal.record(format!("driver.ioprio {id} {prio}"));
        self.with_running(id, |c| c.ioprio = Some(prio))
    }

    fn set_device_permission(
        &self,
        id: ContainerId,
        _root: &Path,
        grant: &DeviceGrant,
    ) -> Result<(), RuntimeError> {
        self.journal.record(format!("driver.device {id} {grant}"));
        self.with_running(id, |c| {
            c.devices.retain(|g| !g.same_entry(grant));
            c.devices.push(*grant);
        })
    }

    fn set_capabilities(&self, id: ContainerId, mask: u64) -> Result<(), RuntimeError> {
        self.journal.record(format!("driver.caps {id} {mask:#x}"));
        if self.failures.hit(&FailPoint::SetCaps) {
            return Err(RuntimeError::ExecFailed("injected caps failure".to_owned()));
        }
        self.with_running(id, |c| c.caps = Some(mask))
    }

    fn add_ip(&self, id: ContainerId, ip: &IpEntry) -> Result<(), RuntimeError> {
        self.journal.record(format!("driver.add_ip {id} {ip}"));
        if self.failures.hit(&FailPoint::AddIp(ip.addr)) {
            return Err(RuntimeError::Network(format!("injected failure adding {ip}")));
        }
        self.with_running(id, |c| {
            c.ips.retain(|b| b.addr != ip.addr);
            c.ips.push(*ip);
        })
    }

    fn del_ip(&self, id: ContainerId, ip: &IpEntry) -> Result<(), RuntimeError> {
        self.journal.record(format!("driver.del_ip {id} {ip}"));
        self.with_running(id, |c| c.ips.retain(|b| b.addr != ip.addr))
    }

    fn list_ips(&self, id: ContainerId) -> Result<Vec<IpEntry>, RuntimeError> {
        Ok(self
            .lock()?
            .get(&id)
            .map(|c| c.ips.clone())
            .unwrap_or_default())
    }

    fn add_veth(&self, id: ContainerId, dev: &VethDevice) -> Result<(), RuntimeError> {
        self.journal
            .record(format!("driver.add_veth {id} {}", dev.guest_ifname));
        if self
            .failures
            .hit(&FailPoint::AddVeth(dev.guest_ifname.clone()))
        {
            return Err(RuntimeError::Network(format!(
                "injected failure adding {}",
                dev.guest_ifname
            )));
        }
        self.with_running(id, |c| {
            c.veths.retain(|v| !v.same_entry(dev));
            c.veths.push(dev.clone());
        })
    }

    fn del_veth(&self, id: ContainerId, dev: &VethDevice) -> Result<(), RuntimeError> {
        self.journal
            .record(format!("driver.del_veth {id} {}", dev.guest_ifname));
        self.with_running(id, |c| c.veths.retain(|v| !v.same_entry(dev)))
    }

    fn checkpoint(
        &self,
        id: ContainerId,
        op: CheckpointOp,
        dump: &Path,
        _timeout: Duration,
    ) -> Result<(), RuntimeError> {
        self.journal.record(format!("driver.checkpoint {id} {op:?}"));
        if self.failures.hit(&FailPoint::Checkpoint) {
            return Err(RuntimeError::Checkpoint("injected checkpoint failure".to_owned()));
        }
        match op {
            CheckpointOp::Suspend => self.with_running(id, |c| c.frozen = true),
            CheckpointOp::Resume => self.with_running(id, |c| c.frozen = false),
            CheckpointOp::Kill => {
                self.lock()?.remove(&id);
                Ok(())
            }
            CheckpointOp::Dump | CheckpointOp::Full => {
                let snapshot = self
                    .container(id)
                    .ok_or_else(|| RuntimeError::NotRunning(id.to_string()))?;
                let ips: Vec<String> = snapshot.ips.iter().map(ToString::to_string).collect();
                fs::write(dump, format!("mock-dump {id} {}", ips.join(",")))?;
                if op == CheckpointOp::Full {
                    self.lock()?.remove(&id);
                }
                Ok(())
            }
        }
    }

    fn restore(
        &self,
        req: &CreateRequest,
        op: RestoreOp,
        dump: &Path,
        _timeout: Duration,
    ) -> Result<(), RuntimeError> {
        let id = req.id;
        self.journal.record(format!("driver.restore {id} {op:?}"));
        if self.failures.hit(&FailPoint::Restore) {
            return Err(RuntimeError::Restore("injected restore failure".to_owned()));
        }
        match op {
            RestoreOp::Full | RestoreOp::Undump => {
                let content = fs::read_to_string(dump).map_err(|e| {
                    RuntimeError::Restore(format!("dump {}: {e}", dump.display()))
                })?;
                let ips = content
                    .split_whitespace()
                    .nth(2)
                    .map(|s| s.split(',').filter_map(|ip| ip.parse().ok()).collect())
                    .unwrap_or_default();
                let mut s = self.lock()?;
                if s.get(&id).is_some_and(|c| c.running) {
                    return Err(RuntimeError::AlreadyRunning(id.to_string()));
                }
                s.insert(
                    id,
                    MockContainer {
                        running: true,
                        frozen: op == RestoreOp::Undump,
                        ips,
                        ..MockContainer::default()
                    },
                );
                Ok(())
            }
            RestoreOp::Resume => self.with_running(id, |c| c.frozen = false),
            RestoreOp::Kill => {
                self.lock()?.remove(&id);
                Ok(())
            }
        }
    }

    fn wait_for_runlevel(&self, id: ContainerId, _timeout: Duration) -> Result<(), RuntimeError> {
        self.journal.record(format!("driver.runlevel {id}"));
        if self.is_running(id)? {
            Ok(())
        } else {
            Err(RuntimeError::NotRunning(id.to_string()))
        }
    }
}

#[derive(Clone)]
pub struct MockImageStore {
    name: &'static str,
    mounted: Arc<Mutex<HashSet<PathBuf>>>,
    snapshots: Arc<Mutex<HashMap<PathBuf, Vec<Snapshot>>>>,
    journal: Journal,
    failures: Failures,
}

impl MockImageStore {
    pub fn new(name: &'static str, journal: Journal) -> Self {
        Self {
            name,
            mounted: Arc::default(),
            snapshots: Arc::default(),
            journal,
            failures: Failures::default(),
        }
    }

    pub fn fail_on(&self, point: FailPoint) {
        self.failures.set(point);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    pub fn set_mounted(&self, root: &Path) {
        if let Ok(mut m) = self.mounted.lock() {
            m.insert(root.to_path_buf());
        }
    }
}

impl ImageStore for MockImageStore {
    fn name(&self) -> &str {
        self.name
    }

    fn is_mounted(&self, root: &Path) -> Result<bool, RuntimeError> {
        Ok(self.mounted.lock().map_err(poisoned)?.contains(root))
    }

    fn mount(&self, req: &MountRequest<'_>) -> Result<(), RuntimeError> {
        self.journal
            .record(format!("{}.mount {}", self.name, req.id));
        if self.failures.hit(&FailPoint::Mount) {
            return Err(RuntimeError::Mount("injected mount failure".to_owned()));
        }
        if !req.private.exists() {
            return Err(RuntimeError::Mount(format!(
                "private area {} does not exist",
                req.private.display()
            )));
        }
        fs::create_dir_all(req.root)?;
        self.mounted
            .lock()
            .map_err(poisoned)?
            .insert(req.root.to_path_buf());
        Ok(())
    }

    fn umount(&self, root: &Path) -> Result<(), RuntimeError> {
        self.journal
            .record(format!("{}.umount {}", self.name, root.display()));
        if self.failures.hit(&FailPoint::Umount) {
            return Err(RuntimeError::Umount("injected umount failure".to_owned()));
        }
        self.mounted.lock().map_err(poisoned)?.remove(root);
        Ok(())
    }

    fn create_image(&self, private: &Path, size_kb: u64) -> Result<(), RuntimeError> {
        self.journal
            .record(format!("{}.create_image {size_kb}", self.name));
        let dir = private.join("root.hdd");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("DiskDescriptor.xml"), format!("<size>{size_kb}</size>\n"))?;
        Ok(())
    }

    fn resize(&self, _private: &Path, size_kb: u64) -> Result<(), RuntimeError> {
        self.journal.record(format!("{}.resize {size_kb}", self.name));
        Ok(())
    }

    fn snapshot_create(&self, private: &Path) -> Result<String, RuntimeError> {
        let mut all = self.snapshots.lock().map_err(poisoned)?;
        let list = all.entry(private.to_path_buf()).or_default();
        let uuid = format!("{{mock-{}}}", list.len() + 1);
        let parent = list.iter().find(|s| s.current).map(|s| s.uuid.clone());
        for s in list.iter_mut() {
            s.current = false;
        }
        list.push(Snapshot {
            uuid: uuid.clone(),
            parent,
            current: true,
        });
        self.journal
            .record(format!("{}.snapshot_create {uuid}", self.name));
        Ok(uuid)
    }

    fn snapshot_delete(&self, private: &Path, uuid: &str) -> Result<(), RuntimeError> {
        let mut all = self.snapshots.lock().map_err(poisoned)?;
        let list = all.entry(private.to_path_buf()).or_default();
        let before = list.len();
        list.retain(|s| s.uuid != uuid);
        if list.len() == before {
            return Err(RuntimeError::Image(format!("no snapshot {uuid}")));
        }
        self.journal
            .record(format!("{}.snapshot_delete {uuid}", self.name));
        Ok(())
    }

    fn snapshot_switch(&self, private: &Path, uuid: &str) -> Result<(), RuntimeError> {
        let mut all = self.snapshots.lock().map_err(poisoned)?;
        let list = all.entry(private.to_path_buf()).or_default();
        if !list.iter().any(|s| s.uuid == uuid) {
            return Err(RuntimeError::Image(format!("no snapshot {uuid}")));
        }
        for s in list.iter_mut() {
            s.current = s.uuid == uuid;
        }
        self.journal
            .record(format!("{}.snapshot_switch {uuid}", self.name));
        Ok(())
    }

    fn snapshot_list(&self, private: &Path) -> Result<Vec<Snapshot>, RuntimeError> {
        Ok(self
            .snapshots
            .lock()
            .map_err(poisoned)?
            .get(private)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Clone, Default)]
pub struct MockQuota {
    journal: Journal,
    failures: Failures,
}

impl MockQuota {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            failures: Failures::default(),
        }
    }

    pub fn fail_on(&self, point: FailPoint) {
        self.failures.set(point);
    }

    fn call(&self, entry: String) -> Result<(), RuntimeError> {
        self.journal.record(entry);
        if self.failures.hit(&FailPoint::Quota) {
            return Err(RuntimeError::Quota("injected quota failure".to_owned()));
        }
        Ok(())
    }
}

impl QuotaTool for MockQuota {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn init(&self, req: &QuotaRequest) -> Result<(), RuntimeError> {
        self.call(format!("quota.init {}", req.id))
    }

    fn on(&self, req: &QuotaRequest) -> Result<(), RuntimeError> {
        self.call(format!("quota.on {} {}", req.id, req.diskspace))
    }

    fn off(&self, id: ContainerId) -> Result<(), RuntimeError> {
        self.call(format!("quota.off {id}"))
    }

    fn set_limits(&self, req: &QuotaRequest) -> Result<(), RuntimeError> {
        self.call(format!("quota.setlimit {} {}", req.id, req.diskspace))
    }

    fn drop_quota(&self, id: ContainerId) -> Result<(), RuntimeError> {
        self.call(format!("quota.drop {id}"))
    }
}

#[derive(Clone, Default)]
pub struct MockGuest {
    journal: Journal,
    failures: Failures,
    envs: Arc<Mutex<Vec<(String, Vec<(String, String)>)>>>,
}

impl MockGuest {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn fail_on(&self, point: FailPoint) {
        self.failures.set(point);
    }

    /// Environment passed to each script run, by script file name.
    pub fn runs(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.envs.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl GuestConfigurator for MockGuest {
    fn run_action_script(&self, req: &ScriptRequest<'_>) -> Result<(), RuntimeError> {
        let name = req
            .script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.journal.record(format!("guest.{name} {}", req.id));
        if let Ok(mut e) = self.envs.lock() {
            e.push((name.clone(), req.env.clone()));
        }
        if self.failures.hit(&FailPoint::Script(name.clone())) {
            return Err(RuntimeError::Script {
                script: name,
                code: 1,
            });
        }
        Ok(())
    }
}
