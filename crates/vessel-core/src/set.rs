//! Applying a configuration delta to an existing container.
//!
//! Most settings take effect on a running container immediately. A few
//! cannot be changed under a live init; what happens to those is decided by
//! the caller's [`SetMode`], or by the unconfigured default when none is
//! given.

use crate::engine::{paths, quota_active, Orchestrator, StartOptions, StopOptions};
use crate::guest::GuestPush;
use crate::lifecycle::{validate_transition, LifecycleState, Transition};
use crate::network::{IpOp, NetworkBinder};
use crate::CoreError;
use serde::Serialize;
use tracing::{info, warn};
use vessel_schema::{apply_overrides, ContainerId, ContainerSpec, ListParam};

/// What to do with unsafe changes on a running container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SetMode {
    /// Stop and start the container so every change takes effect.
    Restart,
    /// Apply the safe changes, skip the rest.
    Ignore,
    /// Refuse the whole operation.
    Error,
}

impl std::str::FromStr for SetMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restart" => Ok(Self::Restart),
            "ignore" => Ok(Self::Ignore),
            "error" => Ok(Self::Error),
            other => Err(format!(
                "unknown set mode '{other}' (expected restart, ignore or error)"
            )),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Command-line layer carrying the requested changes.
    pub cmd: ContainerSpec,
    /// Extension module options as `(name, value)`.
    pub module_options: Vec<(String, Option<String>)>,
    pub save: bool,
    /// `None` is the unconfigured default: warn and skip unsafe changes.
    pub mode: Option<SetMode>,
    pub skip_guest: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SetOutcome {
    /// The config file was rewritten.
    pub saved: bool,
    /// Changes were pushed to a running container.
    pub applied_live: bool,
    /// Unsafe keys left for the next start.
    pub skipped: Vec<String>,
    pub restarted: bool,
    /// User passwords were written into a stopped container.
    pub passwords_set: bool,
}

/// Keys in `cmd` that must not change under a running init.
pub fn unsafe_changes(current: &ContainerSpec, cmd: &ContainerSpec) -> Vec<String> {
    let mut fields = Vec::new();
    if !cmd.caps.is_empty() {
        fields.push("CAPABILITY");
    }
    if cmd.net.netfilter.is_some_and(|n| current.net.netfilter != Some(n)) {
        fields.push("NETFILTER");
    }
    if cmd
        .quota
        .enabled
        .is_some_and(|on| current.quota.enabled.unwrap_or(true) != on)
    {
        fields.push("DISK_QUOTA");
    }
    if let Some(limit) = cmd.quota.ugidlimit {
        if current.quota.ugid_enabled() != (limit > 0) {
            fields.push("QUOTAUGIDLIMIT");
        }
    }
    if cmd
        .fs
        .mount_opts
        .as_ref()
        .is_some_and(|o| current.fs.mount_opts.as_ref() != Some(o))
    {
        fields.push("MOUNT_OPTS");
    }
    fields.into_iter().map(str::to_owned).collect()
}

fn quota_touched(cmd: &ContainerSpec) -> bool {
    let q = &cmd.quota;
    q.diskspace.is_some() || q.diskinodes.is_some() || q.quotatime.is_some() || q.ugidlimit.is_some()
}

impl Orchestrator {
    /// Apply `opts.cmd` to container `id`, live where possible, and persist
    /// it when `opts.save` is set.
    pub fn set(&self, id: ContainerId, opts: SetOptions) -> Result<SetOutcome, CoreError> {
        let _lock = self.lock(id)?;
        let persisted = self.load_persisted(id)?;
        let mut cmd = opts.cmd;
        for (option, value) in &opts.module_options {
            self.ctx
                .modules
                .apply_option(&persisted, &mut cmd, option, value.as_deref())?;
        }

        let current = self.merged(id, &persisted, &ContainerSpec::default());
        let obs = self.observe(id, &current)?;
        if !(obs.state == LifecycleState::NonExistent && self.ctx.confs.exists(id)) {
            validate_transition(id, obs.state, Transition::Set)?;
        }
        let mut eff = self.effective(id, &persisted, &cmd)?;
        let mut outcome = SetOutcome::default();

        let live = obs.running;
        let unsafe_fields = if live {
            unsafe_changes(&current, &cmd)
        } else {
            Vec::new()
        };
        let mut restart = false;
        if !unsafe_fields.is_empty() {
            match opts.mode {
                Some(SetMode::Error) => {
                    return Err(CoreError::UnsafeWhileRunning {
                        id,
                        fields: unsafe_fields,
                    })
                }
                Some(SetMode::Restart) => restart = true,
                Some(SetMode::Ignore) => {
                    info!(
                        "container {id}: {} will apply on next start",
                        unsafe_fields.join(", ")
                    );
                    outcome.skipped = unsafe_fields;
                }
                None => {
                    warn!(
                        "container {id}: cannot change {} while running; skipped (use --setmode restart)",
                        unsafe_fields.join(", ")
                    );
                    outcome.skipped = unsafe_fields;
                }
            }
        }

        if live && !restart {
            self.apply_live(id, &current, &mut eff, &mut cmd, opts.skip_guest)?;
            outcome.applied_live = true;
        } else if obs.mounted && !live && quota_touched(&cmd) {
            if let Some(req) = self.quota_request(id, &eff) {
                self.ctx.collaborators.quota.set_limits(&req)?;
            }
        }

        if !live && !cmd.misc.userpw.items.is_empty() {
            if opts.skip_guest {
                warn!("container {id}: passwords not set, guest configuration skipped");
            } else if !obs.exists {
                warn!("container {id}: passwords not set, no private area");
            } else {
                self.push_passwords_offline(id, &eff, &cmd, obs.mounted)?;
                outcome.passwords_set = true;
            }
        }

        if opts.save {
            let mut next = persisted.clone();
            apply_overrides(&mut next, &cmd);
            self.ctx.modules.store_all(&mut next);
            outcome.saved = self.ctx.confs.save(id, &next, &persisted)?;
            if let Some(name) = &cmd.misc.name {
                self.ctx.confs.set_name(id, name)?;
            }
        } else if !live {
            warn!("container {id}: settings were not saved and will be lost");
        }

        if restart {
            info!("container {id}: restarting to apply changes");
            self.stop_inner(id, &eff, StopOptions::default())?;
            self.start_inner(
                id,
                &eff,
                StartOptions {
                    skip_guest: opts.skip_guest,
                    ..StartOptions::default()
                },
            )?;
            outcome.restarted = true;
        }
        Ok(outcome)
    }

    /// Set user passwords in a stopped container, mounting its storage for
    /// the duration when needed.
    fn push_passwords_offline(
        &self,
        id: ContainerId,
        eff: &ContainerSpec,
        cmd: &ContainerSpec,
        mounted: bool,
    ) -> Result<(), CoreError> {
        let actions = self.dist_actions(eff)?;
        let (_, root) = paths(eff)?;
        let mut only = ContainerSpec::default();
        only.misc.userpw = cmd.misc.userpw.clone();
        if mounted {
            return GuestPush::new(self.ctx.collaborators.guest.as_ref(), &actions, id, root, None)
                .apply(eff, Some(&only));
        }
        self.mount_storage(id, eff, false)?;
        let pushed = GuestPush::new(self.ctx.collaborators.guest.as_ref(), &actions, id, root, None)
            .apply(eff, Some(&only));
        if let Err(e) = self.umount_storage(id, eff) {
            warn!("container {id}: unmount after setting passwords: {e}");
            pushed?;
            return Err(e);
        }
        pushed
    }

    /// Push the safe part of `cmd` into a running container.
    ///
    /// Veth names and MAC addresses generated here are written back into
    /// `cmd` so they are persisted.
    fn apply_live(
        &self,
        id: ContainerId,
        current: &ContainerSpec,
        eff: &mut ContainerSpec,
        cmd: &mut ContainerSpec,
        skip_guest: bool,
    ) -> Result<(), CoreError> {
        let collab = &self.ctx.collaborators;
        let driver = collab.driver.as_ref();
        let (_, root) = paths(current)?;
        let root = root.to_path_buf();

        if !cmd.res.is_empty() {
            driver.apply_resource_limits(id, &eff.res)?;
        }
        if !cmd.cpu.is_empty() {
            driver.set_cpu(id, &eff.cpu)?;
        }
        if let Some(prio) = cmd.ioprio {
            driver.set_ioprio(id, prio)?;
        }
        for grant in &cmd.devices.items {
            driver.set_device_permission(id, &root, grant)?;
        }

        let actions = self.dist_actions(eff)?;
        let pid = driver.init_pid(id)?;
        let binder = NetworkBinder::new(driver, collab.guest.as_ref(), &actions, id, &root)
            .init_pid(pid)
            .skip_guest(skip_guest);
        if !cmd.net.ip.delete.is_empty() || cmd.net.ip.delete_all {
            binder.apply_ip_change(IpOp::Delete, &cmd.net.ip)?;
        }
        let fresh: ListParam<_> = ListParam::from_items(
            cmd.net
                .ip
                .items
                .iter()
                .filter(|ip| cmd.net.ip.delete_all || !current.net.ip.items.contains(ip))
                .copied(),
        );
        if !fresh.items.is_empty() {
            binder.apply_ip_change(IpOp::Add, &fresh)?;
        }
        if !cmd.net.veth.is_untouched() {
            binder.apply_veth_change(&current.net.veth.items, &mut cmd.net.veth)?;
            eff.net.veth = current.net.veth.clone();
            apply_overrides(eff, cmd);
        }

        if !skip_guest {
            GuestPush::new(collab.guest.as_ref(), &actions, id, &root, pid).apply(eff, Some(cmd))?;
        }
        if quota_active(eff) && quota_touched(cmd) {
            if let Some(req) = self.quota_request(id, eff) {
                collab.quota.set_limits(&req)?;
            }
        }
        info!("container {id}: changes applied");
        Ok(())
    }
}
