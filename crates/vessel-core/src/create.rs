use crate::engine::{paths, quota_active, Orchestrator};
use crate::guest::GuestPush;
use crate::lifecycle::LifecycleState;
use crate::modules::ModuleContext;
use crate::rollback::RollbackLog;
use crate::CoreError;
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, warn};
use vessel_runtime::{
    run_checked, GuestAction, ImageStore, MountRequest, QuotaRequest, HELPER_TIMEOUT,
};
use vessel_schema::{apply_overrides, ContainerId, ContainerSpec, StorageLayout};
use vessel_store::{expand_template, StoreError};

/// Image size used when no disk space limit is configured, in KiB.
pub const DEFAULT_IMAGE_KB: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Command-line layer: template, paths, layout, and any other settings
    /// to persist with the new container.
    pub cmd: ContainerSpec,
    /// Config sample to install; falls back to `CONFIGFILE`.
    pub sample: Option<String>,
    pub skip_guest: bool,
}

/// Image size for `spec`: the hard disk space limit, else the default.
pub(crate) fn image_size_kb(spec: &ContainerSpec) -> u64 {
    spec.quota
        .diskspace
        .map(|d| d.limit)
        .filter(|&l| l > 0 && l != vessel_schema::UNLIMITED)
        .unwrap_or(DEFAULT_IMAGE_KB)
}

/// Copy the contents of `src` into `dst` preserving ownership and modes.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<(), CoreError> {
    let mut cp = Command::new("cp");
    cp.arg("-a").arg(src.join(".")).arg(dst);
    run_checked(cp, HELPER_TIMEOUT)?;
    Ok(())
}

/// Create an image at `private` and fill it with the tree at `source`.
pub(crate) fn populate_image(
    images: &dyn ImageStore,
    id: ContainerId,
    private: &Path,
    root: &Path,
    source: &Path,
    size_kb: u64,
) -> Result<(), CoreError> {
    fs::create_dir_all(private)?;
    images.create_image(private, size_kb)?;
    images.mount(&MountRequest {
        id,
        private,
        root,
        mount_opts: None,
    })?;
    let copied = copy_tree(source, root);
    let unmounted = images.umount(root);
    copied?;
    unmounted?;
    debug!("populated image at {}", private.display());
    Ok(())
}

impl Orchestrator {
    /// Create a container: config, private area, quota and persisted spec.
    ///
    /// Everything created here is removed again if a later step fails.
    pub fn create(&self, id: ContainerId, opts: CreateOptions) -> Result<(), CoreError> {
        let _lock = self.lock(id)?;
        let confs = &self.ctx.confs;
        let mut cmd = opts.cmd;
        let mut rollback = RollbackLog::new("create");

        let sample = opts
            .sample
            .clone()
            .or_else(|| self.ctx.settings.config_sample.clone());
        if !confs.exists(id) {
            if let Some(sample) = sample {
                confs.install_sample(id, &sample)?;
                let conf = self.ctx.layout.conf_path(id);
                rollback.push("remove installed config", move || Ok(fs::remove_file(&conf)?));
                cmd.template.origin_sample = Some(sample);
            }
        }
        let persisted = self.load_persisted(id)?;

        if persisted.template.ostemplate.is_none() && cmd.template.ostemplate.is_none() {
            cmd.template
                .ostemplate
                .clone_from(&self.ctx.settings.def_ostemplate);
        }
        let eff = self.effective(id, &persisted, &cmd)?;
        let ostemplate = eff.template.ostemplate.clone().ok_or_else(|| {
            CoreError::InvalidParameter(
                "no OS template given and DEF_OSTEMPLATE is not set".to_owned(),
            )
        })?;
        let (private, root) = paths(&eff)?;

        if private.exists() {
            return Err(StoreError::PrivateExists(private.to_path_buf()).into());
        }
        if self.ctx.collaborators.driver.is_running(id)? {
            return Err(CoreError::AlreadyRunning(id));
        }

        let victim = private.to_path_buf();
        rollback.push("remove private area", move || {
            if victim.exists() {
                fs::remove_dir_all(&victim)?;
            }
            Ok(())
        });
        self.materialize(id, &eff, &ostemplate, private, root)?;

        if quota_active(&eff) {
            let quota = self.ctx.collaborators.quota.as_ref();
            quota.init(&QuotaRequest::from_params(id, private, &eff.quota))?;
            rollback.push("drop quota", move || Ok(quota.drop_quota(id)?));
        }

        if !opts.skip_guest {
            self.postcreate(id, &eff)?;
        }

        confs.discard_stale_scripts(id)?;
        let mut next = persisted.clone();
        apply_overrides(&mut next, &cmd);
        self.ctx.modules.store_all(&mut next);
        confs.save(id, &next, &persisted)?;
        if let Some(name) = &cmd.misc.name {
            confs.set_name(id, name)?;
        }

        rollback.disarm();
        info!("container {id} created from {ostemplate}");
        Ok(())
    }

    fn materialize(
        &self,
        id: ContainerId,
        eff: &ContainerSpec,
        ostemplate: &str,
        private: &Path,
        root: &Path,
    ) -> Result<(), CoreError> {
        let ctx = ModuleContext {
            id,
            spec: eff,
            root,
            state: LifecycleState::NonExistent,
        };
        if self.ctx.modules.materialize(&ctx, private)? {
            return Ok(());
        }

        let archive = self
            .ctx
            .layout
            .template_archive(ostemplate)
            .ok_or_else(|| StoreError::TemplateNotFound(ostemplate.to_owned()))?;

        match eff.layout() {
            StorageLayout::Simfs => expand_template(&archive, private)?,
            StorageLayout::Ploop => {
                let parent = private.parent().ok_or_else(|| {
                    CoreError::InvalidParameter(format!("{} has no parent", private.display()))
                })?;
                fs::create_dir_all(parent)?;
                let staging = tempfile::Builder::new()
                    .prefix(".vessel-create-")
                    .tempdir_in(parent)?;
                let tree = staging.path().join("tree");
                expand_template(&archive, &tree)?;
                populate_image(
                    self.images(eff),
                    id,
                    private,
                    root,
                    &tree,
                    image_size_kb(eff),
                )?;
            }
        }
        Ok(())
    }

    /// Run the POSTCREATE script inside a transient mount.
    fn postcreate(&self, id: ContainerId, eff: &ContainerSpec) -> Result<(), CoreError> {
        let actions = self.dist_actions(eff)?;
        if actions.script(GuestAction::Postcreate).is_none() {
            return Ok(());
        }
        let (_, root) = paths(eff)?;
        self.mount_storage(id, eff, false)?;
        let ran = GuestPush::new(
            self.ctx.collaborators.guest.as_ref(),
            &actions,
            id,
            root,
            None,
        )
        .run(GuestAction::Postcreate, Vec::new());
        if let Err(e) = self.umount_storage(id, eff) {
            warn!("container {id}: unmount after postcreate: {e}");
            ran?;
            return Err(e);
        }
        ran
    }
}
