use crate::concurrency::{shutdown_requested, ContainerLock};
use crate::context::Context;
use crate::guest::{dist_name, GuestPush};
use crate::lifecycle::{classify, validate_transition, LifecycleState, Observation, Transition};
use crate::modules::ModuleContext;
use crate::network::{IpOp, NetworkBinder};
use crate::rollback::RollbackLog;
use crate::CoreError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vessel_runtime::{
    run_host_script, CreateRequest, DistActions, ImageStore, MountRequest, QuotaRequest,
    RestoreOp, ScriptRequest, StopMode, HELPER_TIMEOUT,
};
use vessel_schema::{
    compute_derived, merge_three_way, ContainerId, ContainerSpec, OrderedSet, StorageLayout,
};
use vessel_store::ActionScript;

const STOP_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Block until the guest init reaches a runlevel.
    pub wait: bool,
    /// Cold start even if a dump file is present.
    pub skip_restore: bool,
    /// Do not run distribution scripts inside the guest.
    pub skip_guest: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Kill without asking the guest to halt.
    pub fast: bool,
    /// Leave storage mounted after the stop.
    pub skip_umount: bool,
}

/// Observed state of one container, as reported by `status` and `list`.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub id: ContainerId,
    pub name: Option<String>,
    pub state: LifecycleState,
    pub exists: bool,
    pub mounted: bool,
    pub running: bool,
    pub suspended: bool,
    pub dump: bool,
    pub layout: StorageLayout,
    pub private: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub hostname: Option<String>,
    pub ips: Vec<String>,
    pub init_pid: Option<u32>,
}

/// Sequences the lifecycle operations over one [`Context`].
///
/// Every operation reads the configuration layers and observes the container
/// afresh; nothing about a container is cached between calls.
pub struct Orchestrator {
    pub(crate) ctx: Context,
}

pub(crate) fn host_cpus() -> u32 {
    std::thread::available_parallelism()
        .map_or(1, |n| u32::try_from(n.get()).unwrap_or(u32::MAX))
}

/// Quota is driven for plain-directory storage with a space limit unless
/// `DISK_QUOTA="no"`.
pub(crate) fn quota_active(spec: &ContainerSpec) -> bool {
    spec.layout() == StorageLayout::Simfs
        && spec.quota.enabled != Some(false)
        && spec.quota.diskspace.is_some()
}

pub(crate) fn paths(spec: &ContainerSpec) -> Result<(&Path, &Path), CoreError> {
    let private = spec
        .private_path()
        .ok_or_else(|| CoreError::InvalidParameter("VE_PRIVATE is not set".to_owned()))?;
    let root = spec
        .root_path()
        .ok_or_else(|| CoreError::InvalidParameter("VE_ROOT is not set".to_owned()))?;
    Ok((private, root))
}

impl Orchestrator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    pub(crate) fn lock(&self, id: ContainerId) -> Result<Option<ContainerLock>, CoreError> {
        if self.ctx.skip_lock {
            debug!("lock for container {id} skipped");
            return Ok(None);
        }
        ContainerLock::acquire(&self.ctx.layout.lock_file(id), id).map(Some)
    }

    /// The persisted layer; empty when the container has no config file.
    pub fn load_persisted(&self, id: ContainerId) -> Result<ContainerSpec, CoreError> {
        Ok(self
            .ctx
            .confs
            .load_optional(id, &self.ctx.modules)?
            .map(|(spec, _)| spec)
            .unwrap_or_default())
    }

    /// Merge the three layers and fill in derived values, without validation.
    pub fn merged(
        &self,
        id: ContainerId,
        persisted: &ContainerSpec,
        cmd: &ContainerSpec,
    ) -> ContainerSpec {
        let mut eff = merge_three_way(&self.ctx.defaults, persisted, cmd);
        let derived = compute_derived(&mut eff.res);
        if !derived.is_empty() {
            debug!("container {id}: derived {derived:?}");
        }
        eff.resolve_paths(id);
        eff
    }

    /// The effective spec an operation acts on.
    pub fn effective(
        &self,
        id: ContainerId,
        persisted: &ContainerSpec,
        cmd: &ContainerSpec,
    ) -> Result<ContainerSpec, CoreError> {
        let eff = self.merged(id, persisted, cmd);
        eff.res.validate()?;
        eff.cpu.validate(host_cpus())?;
        Ok(eff)
    }

    pub(crate) fn images(&self, spec: &ContainerSpec) -> &dyn ImageStore {
        self.ctx.images(spec.layout())
    }

    pub(crate) fn dist_actions(&self, spec: &ContainerSpec) -> Result<DistActions, CoreError> {
        Ok(DistActions::load(&self.ctx.settings.dist_dir, dist_name(spec))?)
    }

    pub fn observe(&self, id: ContainerId, spec: &ContainerSpec) -> Result<Observation, CoreError> {
        let driver = &self.ctx.collaborators.driver;
        let exists = spec.private_path().is_some_and(Path::exists);
        let mounted = match spec.root_path() {
            Some(root) => self.images(spec).is_mounted(root)?,
            None => false,
        };
        let running = driver.is_running(id)?;
        let kernel_state = !running && driver.exists(id)?;
        let frozen = running && driver.is_frozen(id)?;
        let dump = self.ctx.layout.dump_file(id).exists();
        let state = classify(exists, mounted, running, kernel_state, dump);
        debug!("container {id} observed as {state}");
        Ok(Observation {
            state,
            exists,
            mounted,
            running,
            frozen,
            kernel_state,
            dump,
        })
    }

    pub fn status(&self, id: ContainerId) -> Result<Status, CoreError> {
        let persisted = self.load_persisted(id)?;
        let eff = self.merged(id, &persisted, &ContainerSpec::default());
        let obs = self.observe(id, &eff)?;
        let driver = &self.ctx.collaborators.driver;
        let (ips, init_pid) = if obs.running {
            let ips = driver
                .list_ips(id)?
                .iter()
                .map(ToString::to_string)
                .collect();
            (ips, driver.init_pid(id)?)
        } else {
            (Vec::new(), None)
        };
        Ok(Status {
            id,
            name: eff.misc.name.clone(),
            state: obs.state,
            exists: obs.exists,
            mounted: obs.mounted,
            running: obs.running,
            suspended: obs.frozen,
            dump: obs.dump,
            layout: eff.layout(),
            private: eff.fs.private.clone(),
            root: eff.fs.root.clone(),
            hostname: eff.misc.hostname.clone(),
            ips,
            init_pid,
        })
    }

    /// Status of every container with a config file.
    pub fn list(&self) -> Result<Vec<Status>, CoreError> {
        self.ctx
            .confs
            .list()?
            .into_iter()
            .map(|id| self.status(id))
            .collect()
    }

    fn host_script_env(&self, id: ContainerId, spec: &ContainerSpec) -> Vec<(String, String)> {
        let mut env = vec![
            ("VEID".to_owned(), id.to_string()),
            (
                "VE_CONFFILE".to_owned(),
                self.ctx.layout.conf_path(id).display().to_string(),
            ),
        ];
        if let Some(root) = spec.root_path() {
            env.push(("VE_ROOT".to_owned(), root.display().to_string()));
        }
        if let Some(private) = spec.private_path() {
            env.push(("VE_PRIVATE".to_owned(), private.display().to_string()));
        }
        env
    }

    fn run_host_action(
        &self,
        id: ContainerId,
        spec: &ContainerSpec,
        kind: ActionScript,
    ) -> Result<(), CoreError> {
        let script = self.ctx.layout.action_script(id, kind);
        if !script.is_file() {
            return Ok(());
        }
        info!("running {}", script.display());
        run_host_script(&script, &self.host_script_env(id, spec), HELPER_TIMEOUT)?;
        Ok(())
    }

    /// Run `<id>.start` or `<id>.stop` inside the guest.
    fn run_guest_action(
        &self,
        id: ContainerId,
        root: &Path,
        init_pid: Option<u32>,
        kind: ActionScript,
    ) -> Result<(), CoreError> {
        let script = self.ctx.layout.action_script(id, kind);
        if !script.is_file() {
            return Ok(());
        }
        let req = ScriptRequest {
            id,
            root,
            script: &script,
            env: Vec::new(),
            timeout: HELPER_TIMEOUT,
            init_pid,
        };
        self.ctx.collaborators.guest.run_action_script(&req)?;
        Ok(())
    }

    pub(crate) fn quota_request(&self, id: ContainerId, spec: &ContainerSpec) -> Option<QuotaRequest> {
        let private = spec.private_path()?;
        quota_active(spec).then(|| QuotaRequest::from_params(id, private, &spec.quota))
    }

    /// Turn quota on, mount the image, run the `.mount` script and the
    /// modules' Mounted setup. Undone in reverse if a step fails.
    pub(crate) fn mount_storage(
        &self,
        id: ContainerId,
        spec: &ContainerSpec,
        inflate_quota: bool,
    ) -> Result<(), CoreError> {
        let (private, root) = paths(spec)?;
        if !private.exists() {
            return Err(CoreError::NoPrivate(private.to_path_buf()));
        }
        let quota = self.ctx.collaborators.quota.as_ref();
        let images = self.images(spec);
        let mut rollback = RollbackLog::new("mount");

        if let Some(req) = self.quota_request(id, spec) {
            let req = if inflate_quota { req.inflated() } else { req };
            quota.on(&req)?;
            rollback.push("quota off", move || Ok(quota.off(id)?));
        }

        images.mount(&MountRequest {
            id,
            private,
            root,
            mount_opts: spec.fs.mount_opts.as_deref(),
        })?;
        rollback.push("umount", move || Ok(images.umount(root)?));

        self.run_host_action(id, spec, ActionScript::Mount)?;
        self.ctx.modules.setup_all(&ModuleContext {
            id,
            spec,
            root,
            state: LifecycleState::Mounted,
        })?;

        rollback.disarm();
        info!("container {id} mounted at {}", root.display());
        Ok(())
    }

    /// Reverse of [`mount_storage`](Self::mount_storage).
    pub(crate) fn umount_storage(&self, id: ContainerId, spec: &ContainerSpec) -> Result<(), CoreError> {
        let (_, root) = paths(spec)?;
        self.ctx.modules.cleanup_all(&ModuleContext {
            id,
            spec,
            root,
            state: LifecycleState::Mounted,
        });
        self.run_host_action(id, spec, ActionScript::Umount)?;
        self.images(spec).umount(root)?;
        if quota_active(spec) {
            self.ctx.collaborators.quota.off(id)?;
        }
        info!("container {id} unmounted");
        Ok(())
    }

    pub fn mount(&self, id: ContainerId) -> Result<(), CoreError> {
        let _lock = self.lock(id)?;
        let persisted = self.load_persisted(id)?;
        let eff = self.effective(id, &persisted, &ContainerSpec::default())?;
        let obs = self.observe(id, &eff)?;
        validate_transition(id, obs.state, Transition::Mount)?;
        self.mount_storage(id, &eff, false)
    }

    pub fn umount(&self, id: ContainerId) -> Result<(), CoreError> {
        let _lock = self.lock(id)?;
        let persisted = self.load_persisted(id)?;
        let eff = self.effective(id, &persisted, &ContainerSpec::default())?;
        let obs = self.observe(id, &eff)?;
        validate_transition(id, obs.state, Transition::Umount)?;
        self.umount_storage(id, &eff)
    }

    pub fn start(&self, id: ContainerId, opts: StartOptions) -> Result<(), CoreError> {
        let _lock = self.lock(id)?;
        let persisted = self.load_persisted(id)?;
        let eff = self.effective(id, &persisted, &ContainerSpec::default())?;
        self.start_inner(id, &eff, opts)
    }

    pub(crate) fn start_inner(
        &self,
        id: ContainerId,
        eff: &ContainerSpec,
        opts: StartOptions,
    ) -> Result<(), CoreError> {
        let obs = self.observe(id, eff)?;
        validate_transition(id, obs.state, Transition::Start)?;

        if obs.dump {
            let dump = self.ctx.layout.dump_file(id);
            if opts.skip_restore {
                warn!(
                    "container {id}: ignoring dump {} and starting fresh",
                    dump.display()
                );
            } else {
                info!("container {id}: restoring from {}", dump.display());
                return self.restore_inner(id, eff, RestoreOp::Full, &dump, &obs);
            }
        }
        self.cold_start(id, eff, &obs, opts)
    }

    fn cold_start(
        &self,
        id: ContainerId,
        eff: &ContainerSpec,
        obs: &Observation,
        opts: StartOptions,
    ) -> Result<(), CoreError> {
        let (_, root) = paths(eff)?;
        let collab = &self.ctx.collaborators;
        let quota_req = self.quota_request(id, eff);
        let mut rollback = RollbackLog::new("start");

        if obs.mounted {
            if let Some(req) = &quota_req {
                collab.quota.set_limits(&req.inflated())?;
                rollback.push("restore quota limits", move || {
                    Ok(collab.quota.set_limits(req)?)
                });
            }
        } else {
            self.mount_storage(id, eff, true)?;
            rollback.push("umount storage", || self.umount_storage(id, eff));
        }

        let actions = self.dist_actions(eff)?;
        let mut req = CreateRequest::new(id, root);
        req.hostname.clone_from(&eff.misc.hostname);
        let init = collab.driver.create(&req)?;
        let pid = init.pid();
        debug!("container {id}: init {pid} parked");

        if let Err(e) = self.setup_running(id, eff, root, pid, &actions, opts) {
            if let Err(ae) = init.abort() {
                warn!("container {id}: abort after failed setup: {ae}");
            }
            return Err(e);
        }
        if let Err(e) = init.proceed() {
            if let Err(ke) = collab.driver.stop(id, StopMode::Kill) {
                warn!("container {id}: kill after failed release: {ke}");
            }
            return Err(e.into());
        }
        rollback.disarm();

        if let Some(req) = &quota_req {
            if let Err(e) = collab.quota.set_limits(req) {
                warn!("container {id}: restoring quota limits: {e}");
            }
        }
        info!("container {id} started");

        if opts.wait {
            collab
                .driver
                .wait_for_runlevel(id, self.ctx.settings.stop_timeout)?;
        }
        Ok(())
    }

    /// Everything between kernel create and releasing init.
    fn setup_running(
        &self,
        id: ContainerId,
        eff: &ContainerSpec,
        root: &Path,
        pid: u32,
        actions: &DistActions,
        opts: StartOptions,
    ) -> Result<(), CoreError> {
        let collab = &self.ctx.collaborators;
        let driver = collab.driver.as_ref();

        driver.apply_resource_limits(id, &eff.res)?;
        if !eff.cpu.is_empty() {
            driver.set_cpu(id, &eff.cpu)?;
        }
        if let Some(prio) = eff.ioprio {
            driver.set_ioprio(id, prio)?;
        }

        let binder = NetworkBinder::new(driver, collab.guest.as_ref(), actions, id, root)
            .init_pid(Some(pid))
            .skip_guest(opts.skip_guest)
            .ve_state("starting");
        binder.apply_ip_change(IpOp::Add, &eff.net.ip)?;
        if !eff.net.veth.items.is_empty() {
            let mut veth = eff.net.veth.clone();
            binder.apply_veth_change(&OrderedSet::new(), &mut veth)?;
        }

        for grant in &eff.devices.items {
            driver.set_device_permission(id, root, grant)?;
        }
        driver.set_capabilities(id, eff.caps.effective())?;

        if !opts.skip_guest {
            GuestPush::new(collab.guest.as_ref(), actions, id, root, Some(pid)).apply(eff, None)?;
        }
        self.ctx.modules.setup_all(&ModuleContext {
            id,
            spec: eff,
            root,
            state: LifecycleState::Running,
        })?;
        self.run_guest_action(id, root, Some(pid), ActionScript::Start)
    }

    pub fn stop(&self, id: ContainerId, opts: StopOptions) -> Result<(), CoreError> {
        let _lock = self.lock(id)?;
        let persisted = self.load_persisted(id)?;
        let eff = self.merged(id, &persisted, &ContainerSpec::default());
        self.stop_inner(id, &eff, opts)
    }

    pub(crate) fn stop_inner(
        &self,
        id: ContainerId,
        eff: &ContainerSpec,
        opts: StopOptions,
    ) -> Result<(), CoreError> {
        let obs = self.observe(id, eff)?;
        validate_transition(id, obs.state, Transition::Stop)?;
        let (_, root) = paths(eff)?;
        let collab = &self.ctx.collaborators;
        let driver = collab.driver.as_ref();

        if obs.running {
            let pid = driver.init_pid(id)?;
            if let Err(e) = self.run_guest_action(id, root, pid, ActionScript::Stop) {
                warn!("container {id}: stop script failed: {e}");
            }
        }
        let ips = driver.list_ips(id).unwrap_or_else(|e| {
            warn!("container {id}: cannot list addresses: {e}");
            Vec::new()
        });

        if obs.running && !opts.fast {
            driver.stop(id, StopMode::Graceful)?;
            self.wait_stopped(id)?;
        }
        if driver.exists(id)? {
            if obs.running && !opts.fast {
                warn!(
                    "container {id} did not stop within {}s, killing it",
                    self.ctx.settings.stop_timeout.as_secs()
                );
            }
            driver.stop(id, StopMode::Kill)?;
        }
        info!("container {id} stopped");

        self.ctx.modules.cleanup_all(&ModuleContext {
            id,
            spec: eff,
            root,
            state: LifecycleState::Running,
        });

        if !ips.is_empty() && obs.mounted {
            let actions = self.dist_actions(eff)?;
            NetworkBinder::new(driver, collab.guest.as_ref(), &actions, id, root)
                .ve_state("stopped")
                .guest_del_ip(&ips, true);
        }
        if obs.mounted && !opts.skip_umount {
            self.umount_storage(id, eff)?;
        }
        Ok(())
    }

    fn wait_stopped(&self, id: ContainerId) -> Result<(), CoreError> {
        let deadline = Instant::now() + self.ctx.settings.stop_timeout;
        while self.ctx.collaborators.driver.is_running(id)? {
            if shutdown_requested() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(STOP_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
        Ok(())
    }

    /// Stop if running, then start, under one lock. A failed stop is
    /// returned as-is and start is not attempted.
    pub fn restart(
        &self,
        id: ContainerId,
        stop: StopOptions,
        start: StartOptions,
    ) -> Result<(), CoreError> {
        let _lock = self.lock(id)?;
        let persisted = self.load_persisted(id)?;
        let eff = self.effective(id, &persisted, &ContainerSpec::default())?;
        let obs = self.observe(id, &eff)?;
        if obs.running || obs.kernel_state {
            self.stop_inner(id, &eff, stop)?;
        }
        self.start_inner(id, &eff, start)
    }

    /// Attach an interactive shell; returns its exit status.
    pub fn enter(&self, id: ContainerId) -> Result<i32, CoreError> {
        if !self.ctx.collaborators.driver.is_running(id)? {
            return Err(CoreError::NotRunning(id));
        }
        Ok(self.ctx.collaborators.driver.enter(id)?)
    }

    pub fn exec(&self, id: ContainerId, argv: &[String]) -> Result<i32, CoreError> {
        if argv.is_empty() {
            return Err(CoreError::InvalidParameter("no command given".to_owned()));
        }
        if !self.ctx.collaborators.driver.is_running(id)? {
            return Err(CoreError::NotRunning(id));
        }
        Ok(self.ctx.collaborators.driver.exec(id, argv)?)
    }

    /// Resolve a container name or numeric id.
    pub fn resolve(&self, what: &str) -> Result<ContainerId, CoreError> {
        if let Ok(id) = what.parse::<ContainerId>() {
            return Ok(id);
        }
        self.ctx
            .confs
            .resolve(what)?
            .ok_or_else(|| vessel_store::StoreError::NameNotFound(what.to_owned()).into())
    }
}
