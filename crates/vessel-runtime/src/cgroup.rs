//! Kernel driver on cgroup v2 and Linux namespaces.
//!
//! Each container gets a cgroup at `<cgroup_root>/<id>`. Its init is
//! started with `unshare` in fresh pid, mount, uts, ipc and net namespaces
//! and parked on a pipe read until the orchestrator has applied limits,
//! network and capabilities. Addresses live on a dummy `venet0` device in
//! the container's network namespace. Checkpoint and restore go through
//! `criu`.

use crate::exec::{describe, kill_pid, run_checked, run_with_timeout, shell_quote, HELPER_TIMEOUT};
use crate::kernel::{CheckpointOp, CreateRequest, InitHandle, KernelDriver, RestoreOp, StopMode};
use crate::RuntimeError;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vessel_schema::{
    capability_name, ContainerId, CpuMask, CpuParams, DeviceGrant, DeviceKind, IpEntry,
    ResourceSet, UbResource, VethDevice, PAGE_SIZE, UNLIMITED,
};

const CGROUP_ROOT: &str = "/sys/fs/cgroup/vessel";
const RUN_DIR: &str = "/run/vessel";
const VENET: &str = "venet0";
const CONTROLLERS: &str = "+cpu +cpuset +io +memory +pids";
const POLL: Duration = Duration::from_millis(100);
const TEARDOWN_WAIT: Duration = Duration::from_secs(10);

pub struct CgroupDriver {
    cgroup_root: PathBuf,
    run_dir: PathBuf,
}

impl Default for CgroupDriver {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from(CGROUP_ROOT),
            run_dir: PathBuf::from(RUN_DIR),
        }
    }
}

impl CgroupDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths(cgroup_root: impl Into<PathBuf>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            run_dir: run_dir.into(),
        }
    }

    fn cgroup_dir(&self, id: ContainerId) -> PathBuf {
        self.cgroup_root.join(id.to_string())
    }

    fn pid_file(&self, id: ContainerId) -> PathBuf {
        self.run_dir.join(format!("{id}.pid"))
    }

    fn caps_file(&self, id: ContainerId) -> PathBuf {
        self.run_dir.join(format!("{id}.caps"))
    }

    fn write_control(&self, id: ContainerId, file: &str, value: &str) -> Result<(), RuntimeError> {
        let path = self.cgroup_dir(id).join(file);
        fs::write(&path, value).map_err(|e| {
            RuntimeError::ExecFailed(format!("writing '{value}' to {}: {e}", path.display()))
        })?;
        debug!("{id}: {file} = {value}");
        Ok(())
    }

    fn require_pid(&self, id: ContainerId) -> Result<u32, RuntimeError> {
        self.init_pid(id)?
            .ok_or_else(|| RuntimeError::NotRunning(id.to_string()))
    }

    fn procs(&self, id: ContainerId) -> Vec<u32> {
        fs::read_to_string(self.cgroup_dir(id).join("cgroup.procs"))
            .map(|s| s.lines().filter_map(|l| l.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    fn enable_controllers(&self) {
        if let Err(e) = fs::write(self.cgroup_root.join("cgroup.subtree_control"), CONTROLLERS) {
            debug!("enabling controllers under {}: {e}", self.cgroup_root.display());
        }
    }

    fn release(&self, id: ContainerId) {
        let dir = self.cgroup_dir(id);
        let deadline = Instant::now() + TEARDOWN_WAIT;
        while dir.exists() {
            match fs::remove_dir(&dir) {
                Ok(()) => break,
                Err(e) if Instant::now() > deadline => {
                    warn!("cannot remove {}: {e}", dir.display());
                    break;
                }
                Err(_) => thread::sleep(POLL),
            }
        }
        let _ = fs::remove_file(self.pid_file(id));
    }

    fn kill_all(&self, id: ContainerId) -> Result<(), RuntimeError> {
        if !self.cgroup_dir(id).exists() {
            return Ok(());
        }
        self.write_control(id, "cgroup.kill", "1")?;
        let deadline = Instant::now() + TEARDOWN_WAIT;
        while !self.procs(id).is_empty() {
            if Instant::now() > deadline {
                return Err(RuntimeError::ExecFailed(format!(
                    "processes of container {id} survived cgroup.kill"
                )));
            }
            thread::sleep(POLL);
        }
        self.release(id);
        info!("container {id} killed");
        Ok(())
    }

    fn freeze(&self, id: ContainerId, frozen: bool, timeout: Duration) -> Result<(), RuntimeError> {
        let want = if frozen { "1" } else { "0" };
        self.write_control(id, "cgroup.freeze", want)?;
        let deadline = Instant::now() + timeout;
        loop {
            let events = fs::read_to_string(self.cgroup_dir(id).join("cgroup.events"))?;
            if events.lines().any(|l| l == format!("frozen {want}")) {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(RuntimeError::Timeout {
                    command: format!("cgroup.freeze={want}"),
                    after: timeout,
                });
            }
            thread::sleep(POLL);
        }
    }

    fn ensure_venet(pid: u32) -> Result<(), RuntimeError> {
        let mut probe = nsenter(pid, &["-n"]);
        probe.args(["ip", "link", "show", VENET]);
        if run_with_timeout(probe, None, HELPER_TIMEOUT)?.success() {
            return Ok(());
        }
        for args in [
            &["ip", "link", "add", VENET, "type", "dummy"][..],
            &["ip", "link", "set", VENET, "up"],
            &["ip", "link", "set", "lo", "up"],
        ] {
            let mut cmd = nsenter(pid, &["-n"]);
            cmd.args(args);
            run_checked(cmd, HELPER_TIMEOUT).map_err(network_err)?;
        }
        Ok(())
    }
}

fn nsenter(pid: u32, namespaces: &[&str]) -> Command {
    let mut cmd = Command::new("nsenter");
    cmd.arg("-t").arg(pid.to_string()).args(namespaces);
    cmd
}

fn network_err(e: RuntimeError) -> RuntimeError {
    match e {
        RuntimeError::ExecFailed(m) => RuntimeError::Network(m),
        other => other,
    }
}

fn checkpoint_err(e: RuntimeError) -> RuntimeError {
    match e {
        RuntimeError::ExecFailed(m) => RuntimeError::Checkpoint(m),
        other => other,
    }
}

fn restore_err(e: RuntimeError) -> RuntimeError {
    match e {
        RuntimeError::ExecFailed(m) => RuntimeError::Restore(m),
        other => other,
    }
}

/// cgroup file value for a counter, `max` for the unlimited sentinel.
fn control_value(v: u64) -> String {
    if v == UNLIMITED {
        "max".to_owned()
    } else {
        v.to_string()
    }
}

fn pages_to_bytes(pages: u64) -> u64 {
    if pages == UNLIMITED {
        UNLIMITED
    } else {
        pages.checked_mul(PAGE_SIZE).unwrap_or(UNLIMITED)
    }
}

/// Map CPUUNITS (8..=500000, 1000 nominal) onto cpu.weight (1..=10000, 100 nominal).
fn cpu_weight(units: u32) -> u32 {
    (units / 10).clamp(1, 10_000)
}

/// Map IOPRIO 0..=7 onto io.weight, 4 being the cgroup default of 100.
fn io_weight(prio: u8) -> u32 {
    (u32::from(prio.min(7)) + 1) * 20
}

/// `setpriv --bounding-set` argument keeping exactly the bits of `mask`.
fn bounding_set(mask: u64) -> String {
    let mut s = String::from("-all");
    for bit in 0..64 {
        if mask & (1u64 << bit) == 0 {
            continue;
        }
        if let Some(name) = capability_name(bit) {
            let _ = write!(s, ",+{}", name.to_ascii_lowercase());
        }
    }
    s
}

/// Addresses from `ip -o addr show` output.
fn parse_addr_show(out: &str) -> Vec<IpEntry> {
    let mut ips = Vec::new();
    for line in out.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(t) = tokens.next() {
            if t == "inet" || t == "inet6" {
                if let Some(ip) = tokens.next().and_then(|a| a.parse().ok()) {
                    ips.push(ip);
                }
                break;
            }
        }
    }
    ips
}

fn gate_script(req: &CreateRequest, caps_file: &Path) -> String {
    let init = req
        .init
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ");
    let root = shell_quote(&req.root.to_string_lossy());
    let mut inner = String::from("read _go || exit 1; ");
    if let Some(h) = &req.hostname {
        let _ = write!(inner, "hostname {} 2>/dev/null; ", shell_quote(h));
    }
    let _ = write!(
        inner,
        "caps=$(cat {caps} 2>/dev/null); \
         if [ -n \"$caps\" ] && command -v setpriv >/dev/null 2>&1; then \
         exec setpriv --bounding-set \"$caps\" chroot {root} {init}; fi; \
         exec chroot {root} {init}",
        caps = shell_quote(&caps_file.to_string_lossy()),
    );
    let proc_dir = req.root.join("proc");
    format!(
        "read _attached || exit 1; exec unshare --fork --pid --mount --uts --ipc --net \
         --mount-proc={} -- /bin/sh -c {}",
        shell_quote(&proc_dir.to_string_lossy()),
        shell_quote(&inner)
    )
}

/// First child of `pid`, polled until it appears.
fn wait_first_child(pid: u32, timeout: Duration) -> Result<u32, RuntimeError> {
    let path = format!("/proc/{pid}/task/{pid}/children");
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(child) = fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.split_whitespace().next().and_then(|c| c.parse().ok()))
        {
            return Ok(child);
        }
        if Instant::now() > deadline {
            return Err(RuntimeError::Timeout {
                command: format!("waiting for init of pid {pid}"),
                after: timeout,
            });
        }
        thread::sleep(Duration::from_millis(20));
    }
}

struct CgroupInit {
    id: ContainerId,
    outer: Child,
    gate: Option<ChildStdin>,
    init_pid: u32,
    cgroup: PathBuf,
    pid_file: PathBuf,
}

impl InitHandle for CgroupInit {
    fn pid(&self) -> u32 {
        self.init_pid
    }

    fn proceed(mut self: Box<Self>) -> Result<(), RuntimeError> {
        let mut gate = self
            .gate
            .take()
            .ok_or_else(|| RuntimeError::ExecFailed("init gate already closed".to_owned()))?;
        gate.write_all(b"\n")?;
        drop(gate);
        info!("container {} init released (pid {})", self.id, self.init_pid);
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<(), RuntimeError> {
        drop(self.gate.take());
        if let Err(e) = fs::write(self.cgroup.join("cgroup.kill"), "1") {
            debug!("cgroup.kill for {}: {e}", self.id);
        }
        let _ = self.outer.kill();
        let _ = self.outer.wait();
        let deadline = Instant::now() + TEARDOWN_WAIT;
        while self.cgroup.exists() && fs::remove_dir(&self.cgroup).is_err() {
            if Instant::now() > deadline {
                warn!("cgroup {} left behind", self.cgroup.display());
                break;
            }
            thread::sleep(POLL);
        }
        let _ = fs::remove_file(&self.pid_file);
        warn!("container {} creation aborted", self.id);
        Ok(())
    }
}

impl KernelDriver for CgroupDriver {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    fn available(&self) -> bool {
        Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
            && Command::new("unshare")
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .is_ok_and(|s| s.success())
    }

    fn exists(&self, id: ContainerId) -> Result<bool, RuntimeError> {
        Ok(self.cgroup_dir(id).is_dir())
    }

    fn is_running(&self, id: ContainerId) -> Result<bool, RuntimeError> {
        Ok(self.init_pid(id)?.is_some())
    }

    fn is_frozen(&self, id: ContainerId) -> Result<bool, RuntimeError> {
        match fs::read_to_string(self.cgroup_dir(id).join("cgroup.freeze")) {
            Ok(s) => Ok(s.trim() == "1"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn init_pid(&self, id: ContainerId) -> Result<Option<u32>, RuntimeError> {
        let content = match fs::read_to_string(self.pid_file(id)) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Ok(pid) = content.trim().parse::<u32>() else {
            warn!("ignoring corrupt pid file for container {id}");
            return Ok(None);
        };
        Ok(Path::new(&format!("/proc/{pid}")).exists().then_some(pid))
    }

    fn create(&self, req: &CreateRequest) -> Result<Box<dyn InitHandle>, RuntimeError> {
        if self.is_running(req.id)? {
            return Err(RuntimeError::AlreadyRunning(req.id.to_string()));
        }
        fs::create_dir_all(&self.cgroup_root)?;
        self.enable_controllers();
        let cgroup = self.cgroup_dir(req.id);
        fs::create_dir_all(&cgroup)?;
        fs::create_dir_all(&self.run_dir)?;
        let caps = self.caps_file(req.id);
        let _ = fs::remove_file(&caps);

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(gate_script(req, &caps))
            .env_clear()
            .envs(req.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let what = describe(&cmd);
        let mut outer = cmd
            .spawn()
            .map_err(|e| RuntimeError::ExecFailed(format!("failed to spawn {what}: {e}")))?;
        let mut gate = outer.stdin.take();

        let mut attach = || -> Result<u32, RuntimeError> {
            fs::write(cgroup.join("cgroup.procs"), outer.id().to_string())?;
            let pipe = gate
                .as_mut()
                .ok_or_else(|| RuntimeError::ExecFailed("init gate missing".to_owned()))?;
            pipe.write_all(b"\n")?;
            let unshare = outer.id();
            wait_first_child(unshare, TEARDOWN_WAIT)
        };
        let init_pid = match attach() {
            Ok(pid) => pid,
            Err(e) => {
                drop(gate);
                let _ = outer.kill();
                let _ = outer.wait();
                let _ = fs::remove_dir(&cgroup);
                return Err(e);
            }
        };
        let pid_file = self.pid_file(req.id);
        fs::write(&pid_file, init_pid.to_string())?;
        debug!("container {} parked as pid {init_pid}", req.id);
        Ok(Box::new(CgroupInit {
            id: req.id,
            outer,
            gate,
            init_pid,
            cgroup,
            pid_file,
        }))
    }

    fn enter(&self, id: ContainerId) -> Result<i32, RuntimeError> {
        let pid = self.require_pid(id)?;
        let status = nsenter(pid, &["--all", "--root", "--wd"])
            .args(["/bin/sh", "-l"])
            .status()
            .map_err(|e| RuntimeError::ExecFailed(format!("failed to enter container {id}: {e}")))?;
        Ok(status.code().unwrap_or(1))
    }

    fn exec(&self, id: ContainerId, argv: &[String]) -> Result<i32, RuntimeError> {
        let pid = self.require_pid(id)?;
        if argv.is_empty() {
            return Err(RuntimeError::ExecFailed("empty command".to_owned()));
        }
        let status = nsenter(pid, &["--all", "--root", "--wd"])
            .args(argv)
            .status()
            .map_err(|e| RuntimeError::ExecFailed(format!("exec in container {id} failed: {e}")))?;
        Ok(status.code().unwrap_or(1))
    }

    fn stop(&self, id: ContainerId, mode: StopMode) -> Result<(), RuntimeError> {
        match mode {
            StopMode::Graceful => {
                let pid = self.require_pid(id)?;
                debug!("sending SIGPWR to init of container {id}");
                kill_pid(pid, libc::SIGPWR);
                Ok(())
            }
            StopMode::Kill => self.kill_all(id),
        }
    }

    fn apply_resource_limits(
        &self,
        id: ContainerId,
        res: &ResourceSet,
    ) -> Result<(), RuntimeError> {
        for (&name, pair) in &res.ub {
            match name {
                UbResource::Physpages => {
                    self.write_control(
                        id,
                        "memory.max",
                        &control_value(pages_to_bytes(pair.limit)),
                    )?;
                    if pair.barrier < pair.limit {
                        self.write_control(
                            id,
                            "memory.high",
                            &control_value(pages_to_bytes(pair.barrier)),
                        )?;
                    }
                }
                UbResource::Swappages => self.write_control(
                    id,
                    "memory.swap.max",
                    &control_value(pages_to_bytes(pair.limit)),
                )?,
                UbResource::Numproc => {
                    self.write_control(id, "pids.max", &control_value(pair.limit))?;
                }
                other => debug!("{} has no cgroup v2 counterpart, skipped", other.name()),
            }
        }
        Ok(())
    }

    fn set_cpu(&self, id: ContainerId, cpu: &CpuParams) -> Result<(), RuntimeError> {
        if let Some(units) = cpu.units {
            self.write_control(id, "cpu.weight", &cpu_weight(units).to_string())?;
        }
        let quota_pct = cpu.limit.or(cpu.vcpus.map(|n| n.saturating_mul(100)));
        if let Some(pct) = quota_pct.filter(|p| *p > 0) {
            self.write_control(id, "cpu.max", &format!("{} 100000", u64::from(pct) * 1000))?;
        }
        if let Some(mask @ CpuMask::List(_)) = &cpu.mask {
            self.write_control(id, "cpuset.cpus", &mask.to_string())?;
        }
        Ok(())
    }

    fn set_ioprio(&self, id: ContainerId, prio: u8) -> Result<(), RuntimeError> {
        self.write_control(id, "io.weight", &format!("default {}", io_weight(prio)))
    }

    fn set_device_permission(
        &self,
        id: ContainerId,
        root: &Path,
        grant: &DeviceGrant,
    ) -> Result<(), RuntimeError> {
        let Some(minor) = grant.minor else {
            debug!("{id}: whole-major grant {grant} needs no device node");
            return Ok(());
        };
        let kind = match grant.kind {
            DeviceKind::Char => "c",
            DeviceKind::Block => "b",
        };
        let node = root
            .join("dev")
            .join(format!("vessel-{kind}{}-{minor}", grant.major));
        match fs::remove_file(&node) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if !(grant.perms.read || grant.perms.write) {
            return Ok(());
        }
        let mut mode = 0;
        if grant.perms.read {
            mode |= 0o444;
        }
        if grant.perms.write {
            mode |= 0o222;
        }
        fs::create_dir_all(root.join("dev"))?;
        let mut cmd = Command::new("mknod");
        cmd.arg("-m")
            .arg(format!("{mode:o}"))
            .arg(&node)
            .arg(kind)
            .arg(grant.major.to_string())
            .arg(minor.to_string());
        run_checked(cmd, HELPER_TIMEOUT)?;
        Ok(())
    }

    fn set_capabilities(&self, id: ContainerId, mask: u64) -> Result<(), RuntimeError> {
        fs::create_dir_all(&self.run_dir)?;
        fs::write(self.caps_file(id), bounding_set(mask))?;
        debug!("container {id} capability mask {mask:#x}");
        Ok(())
    }

    fn add_ip(&self, id: ContainerId, ip: &IpEntry) -> Result<(), RuntimeError> {
        let pid = self.require_pid(id)?;
        Self::ensure_venet(pid)?;
        let full = host_prefix(ip);
        let mut cmd = nsenter(pid, &["-n"]);
        cmd.args(["ip", "addr", "add", &full, "dev", VENET]);
        run_checked(cmd, HELPER_TIMEOUT).map_err(network_err)?;
        Ok(())
    }

    fn del_ip(&self, id: ContainerId, ip: &IpEntry) -> Result<(), RuntimeError> {
        let pid = self.require_pid(id)?;
        let bound = self
            .list_ips(id)?
            .into_iter()
            .find(|b| b.addr == ip.addr);
        let Some(bound) = bound else {
            debug!("{} not bound to container {id}", ip.addr);
            return Ok(());
        };
        let mut cmd = nsenter(pid, &["-n"]);
        cmd.args(["ip", "addr", "del", &host_prefix(&bound), "dev", VENET]);
        run_checked(cmd, HELPER_TIMEOUT).map_err(network_err)?;
        Ok(())
    }

    fn list_ips(&self, id: ContainerId) -> Result<Vec<IpEntry>, RuntimeError> {
        let pid = self.require_pid(id)?;
        let mut cmd = nsenter(pid, &["-n"]);
        cmd.args(["ip", "-o", "addr", "show", "dev", VENET]);
        let out = run_with_timeout(cmd, None, HELPER_TIMEOUT)?;
        if !out.success() {
            return Ok(Vec::new());
        }
        Ok(parse_addr_show(&out.stdout))
    }

    fn add_veth(&self, id: ContainerId, dev: &VethDevice) -> Result<(), RuntimeError> {
        let pid = self.require_pid(id)?;
        let host = dev.host_ifname.as_deref().ok_or_else(|| {
            RuntimeError::Network(format!("veth {} has no host interface name", dev.guest_ifname))
        })?;
        let mut cmd = Command::new("ip");
        cmd.args(["link", "add", host]);
        if let Some(mac) = &dev.host_mac {
            cmd.args(["address", mac]);
        }
        cmd.args(["type", "veth", "peer", "name", &dev.guest_ifname]);
        if let Some(mac) = &dev.guest_mac {
            cmd.args(["address", mac]);
        }
        cmd.args(["netns", &pid.to_string()]);
        run_checked(cmd, HELPER_TIMEOUT).map_err(network_err)?;

        let finish = || -> Result<(), RuntimeError> {
            if let Some(br) = &dev.bridge {
                let mut cmd = Command::new("ip");
                cmd.args(["link", "set", host, "master", br]);
                run_checked(cmd, HELPER_TIMEOUT)?;
            }
            let mut cmd = Command::new("ip");
            cmd.args(["link", "set", host, "up"]);
            run_checked(cmd, HELPER_TIMEOUT)?;
            Ok(())
        };
        if let Err(e) = finish() {
            let mut cmd = Command::new("ip");
            cmd.args(["link", "del", host]);
            let _ = run_with_timeout(cmd, None, HELPER_TIMEOUT);
            return Err(network_err(e));
        }
        info!("veth {host} <-> {} added to container {id}", dev.guest_ifname);
        Ok(())
    }

    fn del_veth(&self, id: ContainerId, dev: &VethDevice) -> Result<(), RuntimeError> {
        let Some(host) = dev.host_ifname.as_deref() else {
            return Ok(());
        };
        let mut cmd = Command::new("ip");
        cmd.args(["link", "del", host]);
        let out = run_with_timeout(cmd, None, HELPER_TIMEOUT)?;
        if !out.success() && !out.stderr.contains("Cannot find device") {
            return Err(RuntimeError::Network(format!(
                "removing {host} from container {id}: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    fn checkpoint(
        &self,
        id: ContainerId,
        op: CheckpointOp,
        dump: &Path,
        timeout: Duration,
    ) -> Result<(), RuntimeError> {
        match op {
            CheckpointOp::Suspend => self.freeze(id, true, timeout).map_err(checkpoint_err),
            CheckpointOp::Resume => self.freeze(id, false, timeout).map_err(checkpoint_err),
            CheckpointOp::Kill => self.kill_all(id).map_err(checkpoint_err),
            CheckpointOp::Dump | CheckpointOp::Full => {
                let pid = self.require_pid(id)?;
                fs::create_dir_all(dump)?;
                let mut cmd = Command::new("criu");
                cmd.args(["dump", "--tcp-established", "--file-locks", "-t"])
                    .arg(pid.to_string())
                    .arg("-D")
                    .arg(dump)
                    .arg("--freeze-cgroup")
                    .arg(self.cgroup_dir(id));
                if op == CheckpointOp::Dump {
                    cmd.arg("--leave-running");
                }
                run_checked(cmd, timeout).map_err(checkpoint_err)?;
                if op == CheckpointOp::Full {
                    self.release(id);
                }
                info!("container {id} dumped to {}", dump.display());
                Ok(())
            }
        }
    }

    fn restore(
        &self,
        req: &CreateRequest,
        op: RestoreOp,
        dump: &Path,
        timeout: Duration,
    ) -> Result<(), RuntimeError> {
        let id = req.id;
        match op {
            RestoreOp::Kill => self.kill_all(id).map_err(restore_err),
            RestoreOp::Resume => {
                for pid in self.procs(id) {
                    kill_pid(pid, libc::SIGCONT);
                }
                Ok(())
            }
            RestoreOp::Undump | RestoreOp::Full => {
                if !dump.exists() {
                    return Err(RuntimeError::Restore(format!(
                        "dump {} not found",
                        dump.display()
                    )));
                }
                if self.is_running(id)? {
                    return Err(RuntimeError::AlreadyRunning(id.to_string()));
                }
                fs::create_dir_all(self.cgroup_dir(id))?;
                fs::create_dir_all(&self.run_dir)?;
                let mut cmd = Command::new("criu");
                cmd.args(["restore", "--restore-detached", "--tcp-established", "--file-locks"])
                    .arg("-D")
                    .arg(dump)
                    .arg("--root")
                    .arg(&req.root)
                    .arg("--pidfile")
                    .arg(self.pid_file(id));
                if op == RestoreOp::Undump {
                    cmd.arg("--leave-stopped");
                }
                if let Err(e) = run_checked(cmd, timeout) {
                    self.release(id);
                    return Err(restore_err(e));
                }
                info!("container {id} restored from {}", dump.display());
                Ok(())
            }
        }
    }

    fn wait_for_runlevel(&self, id: ContainerId, timeout: Duration) -> Result<(), RuntimeError> {
        let deadline = Instant::now() + timeout;
        loop {
            let pid = self.require_pid(id)?;
            let mut cmd = nsenter(pid, &["-m", "-p", "-r"]);
            cmd.arg("runlevel");
            if let Ok(out) = run_with_timeout(cmd, None, Duration::from_secs(5)) {
                let level = out.stdout.split_whitespace().nth(1).unwrap_or("");
                if out.success() && matches!(level, "1" | "2" | "3" | "4" | "5") {
                    debug!("container {id} reached runlevel {level}");
                    return Ok(());
                }
            }
            if Instant::now() > deadline {
                return Err(RuntimeError::Timeout {
                    command: "runlevel".to_owned(),
                    after: timeout,
                });
            }
            thread::sleep(Duration::from_millis(500));
        }
    }
}

fn host_prefix(ip: &IpEntry) -> String {
    let p = ip
        .prefix
        .unwrap_or(if ip.addr.is_ipv4() { 32 } else { 128 });
    format!("{}/{p}", ip.addr)
}
