//! Container storage: plain directories and ploop images.

use crate::exec::{run_checked, run_with_timeout, HELPER_TIMEOUT};
use crate::RuntimeError;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};
use vessel_schema::{ContainerId, StorageLayout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest<'a> {
    pub id: ContainerId,
    pub private: &'a Path,
    pub root: &'a Path,
    pub mount_opts: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub uuid: String,
    pub parent: Option<String>,
    pub current: bool,
}

pub trait ImageStore: Send + Sync {
    fn name(&self) -> &str;

    fn is_mounted(&self, root: &Path) -> Result<bool, RuntimeError>;

    fn mount(&self, req: &MountRequest<'_>) -> Result<(), RuntimeError>;

    fn umount(&self, root: &Path) -> Result<(), RuntimeError>;

    fn create_image(&self, private: &Path, size_kb: u64) -> Result<(), RuntimeError> {
        let _ = (private, size_kb);
        Err(self.unsupported("image creation"))
    }

    fn resize(&self, private: &Path, size_kb: u64) -> Result<(), RuntimeError> {
        let _ = (private, size_kb);
        Err(self.unsupported("resize"))
    }

    /// Returns the new snapshot's uuid.
    fn snapshot_create(&self, private: &Path) -> Result<String, RuntimeError> {
        let _ = private;
        Err(self.unsupported("snapshots"))
    }

    fn snapshot_delete(&self, private: &Path, uuid: &str) -> Result<(), RuntimeError> {
        let _ = (private, uuid);
        Err(self.unsupported("snapshots"))
    }

    fn snapshot_switch(&self, private: &Path, uuid: &str) -> Result<(), RuntimeError> {
        let _ = (private, uuid);
        Err(self.unsupported("snapshots"))
    }

    fn snapshot_list(&self, private: &Path) -> Result<Vec<Snapshot>, RuntimeError> {
        let _ = private;
        Err(self.unsupported("snapshots"))
    }

    fn unsupported(&self, what: &str) -> RuntimeError {
        RuntimeError::Image(format!("{what} not supported by {} storage", self.name()))
    }
}

/// Whether `path` is a mount point according to /proc/mounts.
pub fn is_mountpoint(path: &Path) -> bool {
    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let canonical = canonical.to_string_lossy();
    match fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mounts
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(&*canonical)),
        Err(_) => false,
    }
}

fn mount_err(e: RuntimeError) -> RuntimeError {
    match e {
        RuntimeError::ExecFailed(m) => RuntimeError::Mount(m),
        other => other,
    }
}

fn umount_err(e: RuntimeError) -> RuntimeError {
    match e {
        RuntimeError::ExecFailed(m) => RuntimeError::Umount(m),
        other => other,
    }
}

fn image_err(e: RuntimeError) -> RuntimeError {
    match e {
        RuntimeError::ExecFailed(m) => RuntimeError::Image(m),
        other => other,
    }
}

/// Private area bind-mounted onto the root.
#[derive(Default)]
pub struct PlainStore;

impl PlainStore {
    pub fn new() -> Self {
        Self
    }
}

impl ImageStore for PlainStore {
    fn name(&self) -> &'static str {
        "simfs"
    }

    fn is_mounted(&self, root: &Path) -> Result<bool, RuntimeError> {
        Ok(is_mountpoint(root))
    }

    fn mount(&self, req: &MountRequest<'_>) -> Result<(), RuntimeError> {
        if !req.private.is_dir() {
            return Err(RuntimeError::Mount(format!(
                "private area {} does not exist",
                req.private.display()
            )));
        }
        fs::create_dir_all(req.root)?;
        let mut cmd = Command::new("mount");
        cmd.arg("--bind");
        if let Some(opts) = req.mount_opts {
            cmd.args(["-o", opts]);
        }
        cmd.arg(req.private).arg(req.root);
        run_checked(cmd, HELPER_TIMEOUT).map_err(mount_err)?;
        info!("container {} mounted at {}", req.id, req.root.display());
        Ok(())
    }

    fn umount(&self, root: &Path) -> Result<(), RuntimeError> {
        let mut cmd = Command::new("umount");
        cmd.arg(root);
        run_checked(cmd, HELPER_TIMEOUT).map_err(umount_err)?;
        debug!("unmounted {}", root.display());
        Ok(())
    }
}

/// Copy-on-write images managed by the `ploop` tool.
pub struct PloopStore {
    binary: PathBuf,
}

impl Default for PloopStore {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ploop"),
        }
    }
}

impl PloopStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn image_dir(private: &Path) -> PathBuf {
        private.join("root.hdd")
    }

    pub fn descriptor(private: &Path) -> PathBuf {
        Self::image_dir(private).join("DiskDescriptor.xml")
    }

    fn cmd(&self) -> Command {
        Command::new(&self.binary)
    }

    fn new_uuid() -> Result<String, RuntimeError> {
        let raw = fs::read_to_string("/proc/sys/kernel/random/uuid")?;
        Ok(format!("{{{}}}", raw.trim()))
    }
}

/// Parse `ploop snapshot-list -H -o current,uuid,parent_uuid` output.
fn parse_snapshot_list(out: &str) -> Vec<Snapshot> {
    out.lines()
        .filter_map(|line| {
            let current = line.starts_with('*');
            let mut fields = line.trim_start_matches('*').split_whitespace();
            let uuid = fields.next()?.to_owned();
            let parent = fields
                .next()
                .filter(|p| !p.trim_matches(['{', '}']).chars().all(|c| c == '0' || c == '-'))
                .map(str::to_owned);
            Some(Snapshot {
                uuid,
                parent,
                current,
            })
        })
        .collect()
}

impl ImageStore for PloopStore {
    fn name(&self) -> &'static str {
        "ploop"
    }

    fn is_mounted(&self, root: &Path) -> Result<bool, RuntimeError> {
        Ok(is_mountpoint(root))
    }

    fn mount(&self, req: &MountRequest<'_>) -> Result<(), RuntimeError> {
        let dd = Self::descriptor(req.private);
        if !dd.exists() {
            return Err(RuntimeError::Mount(format!("no ploop image at {}", dd.display())));
        }
        fs::create_dir_all(req.root)?;
        let mut cmd = self.cmd();
        cmd.arg("mount").arg("-m").arg(req.root);
        if let Some(opts) = req.mount_opts {
            cmd.args(["-o", opts]);
        }
        cmd.arg(&dd);
        run_checked(cmd, HELPER_TIMEOUT).map_err(mount_err)?;
        info!("container {} image mounted at {}", req.id, req.root.display());
        Ok(())
    }

    fn umount(&self, root: &Path) -> Result<(), RuntimeError> {
        let mut cmd = self.cmd();
        cmd.arg("umount").arg("-m").arg(root);
        run_checked(cmd, HELPER_TIMEOUT).map_err(umount_err)?;
        Ok(())
    }

    fn create_image(&self, private: &Path, size_kb: u64) -> Result<(), RuntimeError> {
        let dir = Self::image_dir(private);
        fs::create_dir_all(&dir)?;
        let mut cmd = self.cmd();
        cmd.args(["init", "-t", "ext4", "-s"])
            .arg(format!("{size_kb}K"))
            .arg(dir.join("root.hdd"));
        run_checked(cmd, HELPER_TIMEOUT).map_err(image_err)?;
        info!("created {size_kb}K image in {}", dir.display());
        Ok(())
    }

    fn resize(&self, private: &Path, size_kb: u64) -> Result<(), RuntimeError> {
        let mut cmd = self.cmd();
        cmd.args(["resize", "-s"])
            .arg(format!("{size_kb}K"))
            .arg(Self::descriptor(private));
        run_checked(cmd, HELPER_TIMEOUT).map_err(image_err)?;
        Ok(())
    }

    fn snapshot_create(&self, private: &Path) -> Result<String, RuntimeError> {
        let uuid = Self::new_uuid()?;
        let mut cmd = self.cmd();
        cmd.args(["snapshot", "-u", &uuid])
            .arg(Self::descriptor(private));
        run_checked(cmd, HELPER_TIMEOUT).map_err(image_err)?;
        Ok(uuid)
    }

    fn snapshot_delete(&self, private: &Path, uuid: &str) -> Result<(), RuntimeError> {
        let mut cmd = self.cmd();
        cmd.args(["snapshot-delete", "-u", uuid])
            .arg(Self::descriptor(private));
        run_checked(cmd, HELPER_TIMEOUT).map_err(image_err)?;
        Ok(())
    }

    fn snapshot_switch(&self, private: &Path, uuid: &str) -> Result<(), RuntimeError> {
        let mut cmd = self.cmd();
        cmd.args(["snapshot-switch", "-u", uuid])
            .arg(Self::descriptor(private));
        run_checked(cmd, HELPER_TIMEOUT).map_err(image_err)?;
        Ok(())
    }

    fn snapshot_list(&self, private: &Path) -> Result<Vec<Snapshot>, RuntimeError> {
        let mut cmd = self.cmd();
        cmd.args(["snapshot-list", "-H", "-o", "current,uuid,parent_uuid"])
            .arg(Self::descriptor(private));
        let out = run_with_timeout(cmd, None, HELPER_TIMEOUT)?;
        if !out.success() {
            return Err(RuntimeError::Image(out.stderr.trim().to_owned()));
        }
        Ok(parse_snapshot_list(&out.stdout))
    }
}

pub fn select_image_store(layout: StorageLayout) -> Box<dyn ImageStore> {
    match layout {
        StorageLayout::Simfs => Box::new(PlainStore::new()),
        StorageLayout::Ploop => Box::new(PloopStore::new()),
    }
}
