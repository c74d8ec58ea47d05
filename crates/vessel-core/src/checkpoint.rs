//! Checkpoint and restore of running containers.

use crate::engine::{paths, Orchestrator};
use crate::lifecycle::{validate_transition, LifecycleState, Observation, Transition};
use crate::modules::ModuleContext;
use crate::network::NetworkBinder;
use crate::rollback::RollbackLog;
use crate::CoreError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vessel_runtime::{CheckpointOp, CreateRequest, RestoreOp, RuntimeError, HELPER_TIMEOUT};
use vessel_schema::{ContainerId, ContainerSpec};

impl Orchestrator {
    fn dump_path(&self, id: ContainerId, dumpfile: Option<&Path>) -> PathBuf {
        dumpfile.map_or_else(|| self.ctx.layout.dump_file(id), Path::to_path_buf)
    }

    /// Checkpoint a running container.
    ///
    /// `Full` suspends, dumps and kills, then clears guest networking and
    /// unmounts storage. The other operations only signal the kernel.
    pub fn chkpnt(
        &self,
        id: ContainerId,
        op: CheckpointOp,
        dumpfile: Option<&Path>,
    ) -> Result<(), CoreError> {
        let _lock = self.lock(id)?;
        let persisted = self.load_persisted(id)?;
        let eff = self.merged(id, &persisted, &ContainerSpec::default());
        let obs = self.observe(id, &eff)?;
        validate_transition(id, obs.state, Transition::Checkpoint)?;

        let dump = self.dump_path(id, dumpfile);
        let driver = self.ctx.collaborators.driver.as_ref();
        if op != CheckpointOp::Full {
            if matches!(op, CheckpointOp::Dump) {
                if let Some(parent) = dump.parent() {
                    fs::create_dir_all(parent)?;
                }
            }
            driver.checkpoint(id, op, &dump, HELPER_TIMEOUT)?;
            info!("container {id}: checkpoint {op:?} done");
            return Ok(());
        }

        let (_, root) = paths(&eff)?;
        if let Some(parent) = dump.parent() {
            fs::create_dir_all(parent)?;
        }
        let ips = driver.list_ips(id).unwrap_or_else(|e| {
            warn!("container {id}: cannot list addresses: {e}");
            Vec::new()
        });
        driver.checkpoint(id, CheckpointOp::Full, &dump, HELPER_TIMEOUT)?;
        info!("container {id} checkpointed to {}", dump.display());

        self.ctx.modules.cleanup_all(&ModuleContext {
            id,
            spec: &eff,
            root,
            state: LifecycleState::Running,
        });
        if obs.mounted {
            if !ips.is_empty() {
                let actions = self.dist_actions(&eff)?;
                NetworkBinder::new(driver, self.ctx.collaborators.guest.as_ref(), &actions, id, root)
                    .ve_state("stopped")
                    .guest_del_ip(&ips, true);
            }
            self.umount_storage(id, &eff)?;
        }
        Ok(())
    }

    /// Restore from a dump. `Full` and `Undump` rebuild the container;
    /// `Resume` and `Kill` only signal one that was undumped.
    pub fn restore(
        &self,
        id: ContainerId,
        op: RestoreOp,
        dumpfile: Option<&Path>,
    ) -> Result<(), CoreError> {
        let _lock = self.lock(id)?;
        let persisted = self.load_persisted(id)?;
        let eff = self.effective(id, &persisted, &ContainerSpec::default())?;
        let obs = self.observe(id, &eff)?;
        let dump = self.dump_path(id, dumpfile);

        match op {
            RestoreOp::Full | RestoreOp::Undump => {
                validate_transition(id, obs.state, Transition::Restore)?;
                self.restore_inner(id, &eff, op, &dump, &obs)
            }
            RestoreOp::Resume | RestoreOp::Kill => {
                if !obs.running && !obs.kernel_state {
                    return Err(CoreError::NotRunning(id));
                }
                let (_, root) = paths(&eff)?;
                let req = CreateRequest::new(id, root);
                self.ctx
                    .collaborators
                    .driver
                    .restore(&req, op, &dump, HELPER_TIMEOUT)?;
                info!("container {id}: restore {op:?} done");
                Ok(())
            }
        }
    }

    pub(crate) fn restore_inner(
        &self,
        id: ContainerId,
        eff: &ContainerSpec,
        op: RestoreOp,
        dump: &Path,
        obs: &Observation,
    ) -> Result<(), CoreError> {
        if obs.running {
            return Err(CoreError::AlreadyRunning(id));
        }
        if !dump.is_file() {
            return Err(RuntimeError::Restore(format!("dump file {} not found", dump.display())).into());
        }
        let (_, root) = paths(eff)?;
        let mut rollback = RollbackLog::new("restore");
        if !obs.mounted {
            self.mount_storage(id, eff, false)?;
            rollback.push("umount storage", || self.umount_storage(id, eff));
        }

        let mut req = CreateRequest::new(id, root);
        req.hostname.clone_from(&eff.misc.hostname);
        self.ctx
            .collaborators
            .driver
            .restore(&req, op, dump, HELPER_TIMEOUT)?;
        rollback.disarm();

        if op == RestoreOp::Full {
            if let Err(e) = fs::remove_file(dump) {
                warn!("container {id}: cannot remove dump {}: {e}", dump.display());
            }
        }
        info!("container {id} restored from {}", dump.display());
        Ok(())
    }

    /// Full checkpoint to the default dump file.
    pub fn suspend(&self, id: ContainerId) -> Result<(), CoreError> {
        self.chkpnt(id, CheckpointOp::Full, None)
    }

    /// Full restore from the default dump file.
    pub fn resume(&self, id: ContainerId) -> Result<(), CoreError> {
        self.restore(id, RestoreOp::Full, None)
    }
}
