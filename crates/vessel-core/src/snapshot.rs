//! Snapshots of image-backed containers and conversion of plain-directory
//! storage to an image.

use crate::create::{image_size_kb, populate_image};
use crate::engine::{paths, Orchestrator};
use crate::CoreError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vessel_runtime::Snapshot;
use vessel_schema::{apply_overrides, ContainerId, ContainerSpec, StorageLayout};
use vessel_store::remove_tree_async;

fn require_image(id: ContainerId, spec: &ContainerSpec) -> Result<(), CoreError> {
    if spec.layout() == StorageLayout::Ploop {
        Ok(())
    } else {
        Err(CoreError::Unsupported(format!(
            "container {id} uses {} storage; snapshots need ploop",
            spec.layout()
        )))
    }
}

fn sibling(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "private".into(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.{tag}-{}", std::process::id()))
}

impl Orchestrator {
    /// Effective spec of an existing image-backed container.
    fn image_spec(&self, id: ContainerId) -> Result<ContainerSpec, CoreError> {
        let persisted = self.load_persisted(id)?;
        let eff = self.merged(id, &persisted, &ContainerSpec::default());
        require_image(id, &eff)?;
        let (private, _) = paths(&eff)?;
        if !private.exists() {
            return Err(CoreError::NotExist(id));
        }
        Ok(eff)
    }

    /// Take a snapshot; returns its uuid.
    pub fn snapshot_create(&self, id: ContainerId) -> Result<String, CoreError> {
        let _lock = self.lock(id)?;
        let eff = self.image_spec(id)?;
        let (private, _) = paths(&eff)?;
        let uuid = self.images(&eff).snapshot_create(private)?;
        info!("container {id}: snapshot {uuid} created");
        Ok(uuid)
    }

    pub fn snapshot_delete(&self, id: ContainerId, uuid: &str) -> Result<(), CoreError> {
        let _lock = self.lock(id)?;
        let eff = self.image_spec(id)?;
        let (private, _) = paths(&eff)?;
        self.images(&eff).snapshot_delete(private, uuid)?;
        info!("container {id}: snapshot {uuid} deleted");
        Ok(())
    }

    /// Make `uuid` the current top of the image. The container must not be
    /// running.
    pub fn snapshot_switch(&self, id: ContainerId, uuid: &str) -> Result<(), CoreError> {
        let _lock = self.lock(id)?;
        let eff = self.image_spec(id)?;
        if self.ctx.collaborators.driver.is_running(id)? {
            return Err(CoreError::AlreadyRunning(id));
        }
        let (private, _) = paths(&eff)?;
        self.images(&eff).snapshot_switch(private, uuid)?;
        info!("container {id}: switched to snapshot {uuid}");
        Ok(())
    }

    pub fn snapshot_list(&self, id: ContainerId) -> Result<Vec<Snapshot>, CoreError> {
        let eff = self.image_spec(id)?;
        let (private, _) = paths(&eff)?;
        Ok(self.images(&eff).snapshot_list(private)?)
    }

    /// Move a stopped, unmounted plain-directory container into a fresh
    /// image and record `VE_LAYOUT="ploop"`.
    ///
    /// The old tree is kept until the new image is in place, then removed in
    /// the background.
    pub fn convert(&self, id: ContainerId) -> Result<(), CoreError> {
        let _lock = self.lock(id)?;
        let persisted = self.load_persisted(id)?;
        let eff = self.effective(id, &persisted, &ContainerSpec::default())?;
        let obs = self.observe(id, &eff)?;
        if obs.running || obs.kernel_state {
            return Err(CoreError::AlreadyRunning(id));
        }
        if obs.mounted {
            return Err(CoreError::AlreadyMounted(id));
        }
        if !obs.exists {
            return Err(CoreError::NotExist(id));
        }
        if eff.layout() == StorageLayout::Ploop {
            return Err(CoreError::InvalidParameter(format!(
                "container {id} already uses ploop storage"
            )));
        }
        let (private, root) = paths(&eff)?;

        let staged = sibling(private, "ploop");
        let images = self.ctx.images(StorageLayout::Ploop);
        if let Err(e) = populate_image(images, id, &staged, root, private, image_size_kb(&eff)) {
            if let Err(ce) = fs::remove_dir_all(&staged) {
                warn!("cleaning up {}: {ce}", staged.display());
            }
            return Err(e);
        }

        let old = sibling(private, "simfs");
        fs::rename(private, &old)?;
        if let Err(e) = fs::rename(&staged, private) {
            if let Err(re) = fs::rename(&old, private) {
                warn!("cannot move {} back: {re}", old.display());
            }
            return Err(e.into());
        }

        let mut cmd = ContainerSpec::default();
        cmd.fs.layout = Some(StorageLayout::Ploop);
        let mut next = persisted.clone();
        apply_overrides(&mut next, &cmd);
        self.ctx.confs.save(id, &next, &persisted)?;

        remove_tree_async(&old)?;
        if let Err(e) = self.ctx.collaborators.quota.drop_quota(id) {
            warn!("container {id}: dropping quota after convert: {e}");
        }
        info!("container {id} converted to ploop");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_is_hidden_next_to_path() {
        let s = sibling(Path::new("/vz/private/101"), "ploop");
        assert_eq!(s.parent(), Some(Path::new("/vz/private")));
        let name = s.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(".101.ploop-"));
    }

    #[test]
    fn snapshots_need_image_layout() {
        let id = ContainerId::new(101).unwrap();
        let mut s = ContainerSpec::default();
        assert!(matches!(require_image(id, &s), Err(CoreError::Unsupported(_))));
        s.fs.layout = Some(StorageLayout::Ploop);
        assert!(require_image(id, &s).is_ok());
    }
}
