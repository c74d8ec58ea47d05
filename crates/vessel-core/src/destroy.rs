use crate::concurrency::shutdown_requested;
use crate::engine::Orchestrator;
use crate::lifecycle::{validate_transition, LifecycleState, Transition};
use crate::CoreError;
use std::fs;
use tracing::{info, warn};
use vessel_schema::{ContainerId, ContainerSpec};
use vessel_store::{remove_tree_async, sweep_trash};

impl Orchestrator {
    /// Remove a stopped, unmounted container.
    ///
    /// The private tree is handed to a background delete; config files are
    /// renamed aside, never deleted. A container that only has a config file
    /// left gets that file backed up.
    pub fn destroy(&self, id: ContainerId) -> Result<(), CoreError> {
        let _lock = self.lock(id)?;
        let persisted = self.load_persisted(id)?;
        let eff = self.merged(id, &persisted, &ContainerSpec::default());
        let obs = self.observe(id, &eff)?;

        let config_only = obs.state == LifecycleState::NonExistent && self.ctx.confs.exists(id);
        if !config_only {
            validate_transition(id, obs.state, Transition::Destroy)?;
        }

        let quota = self.ctx.collaborators.quota.as_ref();
        if let Err(e) = quota.off(id) {
            warn!("container {id}: quota off: {e}");
        }
        if let Err(e) = quota.drop_quota(id) {
            warn!("container {id}: quota drop: {e}");
        }

        if let Some(private) = eff.private_path() {
            if let Some(parent) = private.parent() {
                match sweep_trash(parent, &shutdown_requested) {
                    Ok(0) => {}
                    Ok(n) => info!("swept {n} leftover tree(s) under {}", parent.display()),
                    Err(e) => warn!("sweeping {}: {e}", parent.display()),
                }
            }
            remove_tree_async(private)?;
        }

        let dump = self.ctx.layout.dump_file(id);
        match fs::remove_file(&dump) {
            Ok(()) => info!("removed dump {}", dump.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("container {id}: cannot remove dump {}: {e}", dump.display()),
        }

        self.ctx.confs.backup(id)?;
        info!("container {id} destroyed");
        Ok(())
    }
}
