use crate::layout::{ActionScript, HostLayout};
use crate::{fsync_dir, StoreError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use vessel_schema::{
    parse_file, save, write_atomic, ConfigError, ContainerId, ContainerName, ContainerSpec,
    KeyClaim, ParseReport,
};

/// Suffix given to config files of destroyed containers.
pub const DESTROYED_SUFFIX: &str = "destroyed";

/// Per-container config files, their action scripts, and the name index.
pub struct ConfStore {
    layout: HostLayout,
}

impl ConfStore {
    pub fn new(layout: HostLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub fn exists(&self, id: ContainerId) -> bool {
        self.layout.conf_path(id).is_file()
    }

    /// Parse the persisted layer of `id`.
    pub fn load(
        &self,
        id: ContainerId,
        claims: &dyn KeyClaim,
    ) -> Result<(ContainerSpec, ParseReport), StoreError> {
        let mut spec = ContainerSpec::default();
        let report = parse_file(&self.layout.conf_path(id), &mut spec, claims)?;
        Ok((spec, report))
    }

    /// Like [`load`](Self::load), but a missing file is an empty layer.
    pub fn load_optional(
        &self,
        id: ContainerId,
        claims: &dyn KeyClaim,
    ) -> Result<Option<(ContainerSpec, ParseReport)>, StoreError> {
        match self.load(id, claims) {
            Ok(v) => Ok(Some(v)),
            Err(StoreError::Config(ConfigError::NoConfig(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write the keys that differ between `old` and `new`.
    pub fn save(
        &self,
        id: ContainerId,
        new: &ContainerSpec,
        old: &ContainerSpec,
    ) -> Result<bool, StoreError> {
        fs::create_dir_all(self.layout.conf_dir())?;
        let written = save(&self.layout.conf_path(id), new, old)?;
        if written {
            debug!("saved config for container {id}");
        }
        Ok(written)
    }

    /// Parse a sample on top of `spec`.
    pub fn load_sample(
        &self,
        sample: &str,
        spec: &mut ContainerSpec,
        claims: &dyn KeyClaim,
    ) -> Result<ParseReport, StoreError> {
        let path = self.layout.sample_path(sample);
        match parse_file(&path, spec, claims) {
            Err(ConfigError::NoConfig(p)) => Err(StoreError::SampleNotFound(p)),
            other => Ok(other?),
        }
    }

    /// Copy a sample verbatim to the container's config path.
    pub fn install_sample(&self, id: ContainerId, sample: &str) -> Result<(), StoreError> {
        let src = self.layout.sample_path(sample);
        let content = match fs::read(&src) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::SampleNotFound(src))
            }
            Err(e) => return Err(e.into()),
        };
        write_atomic(&self.layout.conf_path(id), &content)?;
        info!("installed sample '{sample}' as config for container {id}");
        Ok(())
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(".");
        s.push(DESTROYED_SUFFIX);
        PathBuf::from(s)
    }

    fn move_aside(path: &Path) -> Result<bool, StoreError> {
        if !path.exists() {
            return Ok(false);
        }
        fs::rename(path, Self::backup_path(path))?;
        Ok(true)
    }

    /// Rename the config and action scripts of `id` with a `.destroyed` suffix.
    /// Nothing is deleted.
    pub fn backup(&self, id: ContainerId) -> Result<usize, StoreError> {
        let mut moved = 0;
        if Self::move_aside(&self.layout.conf_path(id))? {
            moved += 1;
        }
        moved += self.discard_stale_scripts(id)?;
        self.remove_names(id)?;
        fsync_dir(self.layout.conf_dir())?;
        if moved > 0 {
            info!("backed up {moved} config file(s) of container {id}");
        }
        Ok(moved)
    }

    /// Move leftover action scripts of a previous container with the same id
    /// out of the way.
    pub fn discard_stale_scripts(&self, id: ContainerId) -> Result<usize, StoreError> {
        let mut moved = 0;
        for kind in ActionScript::ALL {
            let path = self.layout.action_script(id, kind);
            if Self::move_aside(&path)? {
                warn!("moved stale {} aside", path.display());
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Ids with a config file, ascending.
    pub fn list(&self) -> Result<Vec<ContainerId>, StoreError> {
        let entries = match fs::read_dir(self.layout.conf_dir()) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".conf")) else {
                continue;
            };
            if let Ok(id) = stem.parse::<ContainerId>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Point `name` at `id`, replacing any other name `id` had.
    pub fn set_name(&self, id: ContainerId, name: &str) -> Result<(), StoreError> {
        let name = ContainerName::new(name)?;
        if let Some(existing) = self.resolve(&name)? {
            if existing == id {
                return Ok(());
            }
            if self.layout.conf_path(existing).exists() {
                return Err(StoreError::NameConflict {
                    name: name.into_inner(),
                    existing,
                });
            }
        }
        self.remove_names(id)?;
        let names = self.layout.names_dir();
        fs::create_dir_all(&names)?;
        let link = names.join(name.as_str());
        let _ = fs::remove_file(&link);
        std::os::unix::fs::symlink(format!("../{id}.conf"), &link)?;
        fsync_dir(&names)?;
        debug!("name '{name}' now refers to container {id}");
        Ok(())
    }

    /// Map a name to an id through the name index.
    pub fn resolve(&self, name: &str) -> Result<Option<ContainerId>, StoreError> {
        let target = match fs::read_link(self.layout.name_link(name)) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(target
            .file_name()
            .and_then(|f| f.to_str())
            .and_then(|f| f.strip_suffix(".conf"))
            .and_then(|s| s.parse().ok()))
    }

    /// Drop every name pointing at `id`.
    pub fn remove_names(&self, id: ContainerId) -> Result<(), StoreError> {
        let entries = match fs::read_dir(self.layout.names_dir()) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if self.resolve(&name)? == Some(id) {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_schema::NoClaim;

    fn id(n: u32) -> ContainerId {
        ContainerId::new(n).unwrap()
    }

    fn store() -> (tempfile::TempDir, ConfStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = HostLayout::under(dir.path());
        layout.initialize().unwrap();
        (dir, ConfStore::new(layout))
    }

    #[test]
    fn save_and_load_round_trip() {
        let (_dir, store) = store();
        let mut spec = ContainerSpec::default();
        spec.misc.hostname = Some("box".to_owned());
        assert!(store.save(id(101), &spec, &ContainerSpec::default()).unwrap());
        assert!(store.exists(id(101)));
        let (back, report) = store.load(id(101), &NoClaim).unwrap();
        assert!(report.is_clean());
        assert_eq!(back, spec);
    }

    #[test]
    fn load_optional_tolerates_missing() {
        let (_dir, store) = store();
        assert!(store.load_optional(id(5), &NoClaim).unwrap().is_none());
        assert!(matches!(
            store.load(id(5), &NoClaim),
            Err(StoreError::Config(ConfigError::NoConfig(_)))
        ));
    }

    #[test]
    fn samples_install_and_parse() {
        let (_dir, store) = store();
        fs::write(
            store.layout().sample_path("basic"),
            "# sample\nNUMPROC=\"100:100\"\n",
        )
        .unwrap();
        let mut spec = ContainerSpec::default();
        store.load_sample("basic", &mut spec, &NoClaim).unwrap();
        assert_eq!(spec.res.ub.len(), 1);

        store.install_sample(id(9), "basic").unwrap();
        let text = fs::read_to_string(store.layout().conf_path(id(9))).unwrap();
        assert!(text.starts_with("# sample"));

        assert!(matches!(
            store.install_sample(id(9), "missing"),
            Err(StoreError::SampleNotFound(_))
        ));
        assert!(matches!(
            store.load_sample("missing", &mut spec, &NoClaim),
            Err(StoreError::SampleNotFound(_))
        ));
    }

    #[test]
    fn backup_renames_instead_of_deleting() {
        let (_dir, store) = store();
        let l = store.layout().clone();
        fs::write(l.conf_path(id(3)), "ONBOOT=\"yes\"\n").unwrap();
        fs::write(l.action_script(id(3), ActionScript::Mount), "#!/bin/sh\n").unwrap();
        store.set_name(id(3), "three").unwrap();

        assert_eq!(store.backup(id(3)).unwrap(), 2);
        assert!(!l.conf_path(id(3)).exists());
        assert!(l.conf_dir().join("3.conf.destroyed").exists());
        assert!(l.conf_dir().join("3.mount.destroyed").exists());
        assert_eq!(store.resolve("three").unwrap(), None);
    }

    #[test]
    fn list_only_counts_numeric_configs() {
        let (_dir, store) = store();
        let l = store.layout().clone();
        for f in ["12.conf", "3.conf", "ve-basic.conf-sample", "4.conf.destroyed", "x.conf"] {
            fs::write(l.conf_dir().join(f), "").unwrap();
        }
        assert_eq!(store.list().unwrap(), vec![id(3), id(12)]);
    }

    #[test]
    fn names_resolve_and_conflict() {
        let (_dir, store) = store();
        let l = store.layout().clone();
        fs::write(l.conf_path(id(1)), "").unwrap();
        fs::write(l.conf_path(id(2)), "").unwrap();

        store.set_name(id(1), "web").unwrap();
        assert_eq!(store.resolve("web").unwrap(), Some(id(1)));
        assert!(matches!(
            store.set_name(id(2), "web"),
            Err(StoreError::NameConflict { .. })
        ));

        store.set_name(id(1), "www").unwrap();
        assert_eq!(store.resolve("web").unwrap(), None);
        assert_eq!(store.resolve("www").unwrap(), Some(id(1)));
        assert!(store.set_name(id(1), "bad name").is_err());
    }
}
