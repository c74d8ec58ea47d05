use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};
use vessel_schema::{ContainerId, GlobalSettings};

/// Per-container scripts kept next to the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionScript {
    /// Runs on the host after storage is mounted.
    Mount,
    /// Runs on the host before storage is unmounted.
    Umount,
    /// Runs inside the guest before init is released.
    Start,
    /// Runs inside the guest before shutdown.
    Stop,
}

impl ActionScript {
    pub const ALL: [ActionScript; 4] = [Self::Mount, Self::Umount, Self::Start, Self::Stop];

    pub fn suffix(self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Umount => "umount",
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

/// Directory layout of the host.
///
/// Paths come from the global settings; directories are created lazily on
/// [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct HostLayout {
    conf_dir: PathBuf,
    lock_dir: PathBuf,
    dump_dir: PathBuf,
    template_dir: PathBuf,
    dist_dir: PathBuf,
}

impl HostLayout {
    pub fn from_settings(settings: &GlobalSettings) -> Self {
        Self {
            conf_dir: settings.conf_dir.clone(),
            lock_dir: settings.lockdir.clone(),
            dump_dir: settings.dump_dir.clone(),
            template_dir: settings.template_dir.clone(),
            dist_dir: settings.dist_dir.clone(),
        }
    }

    /// Everything under one root; used by tests and by `--root`-style setups.
    pub fn under(root: &Path) -> Self {
        Self {
            conf_dir: root.join("conf"),
            lock_dir: root.join("lock"),
            dump_dir: root.join("dump"),
            template_dir: root.join("template"),
            dist_dir: root.join("dists"),
        }
    }

    #[inline]
    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    #[inline]
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    #[inline]
    pub fn dump_dir(&self) -> &Path {
        &self.dump_dir
    }

    #[inline]
    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    #[inline]
    pub fn dist_dir(&self) -> &Path {
        &self.dist_dir
    }

    #[inline]
    pub fn conf_path(&self, id: ContainerId) -> PathBuf {
        self.conf_dir.join(format!("{id}.conf"))
    }

    #[inline]
    pub fn sample_path(&self, sample: &str) -> PathBuf {
        self.conf_dir.join(format!("ve-{sample}.conf-sample"))
    }

    #[inline]
    pub fn action_script(&self, id: ContainerId, kind: ActionScript) -> PathBuf {
        self.conf_dir.join(format!("{id}.{}", kind.suffix()))
    }

    #[inline]
    pub fn names_dir(&self) -> PathBuf {
        self.conf_dir.join("names")
    }

    #[inline]
    pub fn name_link(&self, name: &str) -> PathBuf {
        self.names_dir().join(name)
    }

    /// Default checkpoint image for a container.
    #[inline]
    pub fn dump_file(&self, id: ContainerId) -> PathBuf {
        self.dump_dir.join(format!("Dump.{id}"))
    }

    #[inline]
    pub fn lock_file(&self, id: ContainerId) -> PathBuf {
        self.lock_dir.join(format!("{id}.lck"))
    }

    /// The cached archive for an OS template, `.tar.gz` preferred over `.tar`.
    pub fn template_archive(&self, ostemplate: &str) -> Option<PathBuf> {
        let cache = self.template_dir.join("cache");
        ["tar.gz", "tar"]
            .iter()
            .map(|ext| cache.join(format!("{ostemplate}.{ext}")))
            .find(|p| p.is_file())
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.conf_dir)?;
        fs::create_dir_all(self.names_dir())?;
        fs::create_dir_all(&self.lock_dir)?;
        fs::create_dir_all(&self.dump_dir)?;
        Ok(())
    }
}
