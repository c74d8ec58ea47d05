//! Two-phase removal of large directory trees.
//!
//! Phase one renames the victim into a hidden per-filesystem staging
//! directory, which is atomic and immediate. Phase two deletes the staged
//! tree in a detached process; the caller does not wait for it.
//!
//! Every staged tree has a sibling `<name>.lock`. The caller locks it before
//! the rename and hands the locked descriptor to the deleting process as its
//! stdin, so the lock is held for as long as the delete runs. A sweep only
//! touches trees whose lock it can take, i.e. leftovers of removals that
//! were interrupted.

use crate::{fsync_dir, StoreError};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Staging directory created next to each removed tree.
pub const TRASH_DIR: &str = ".vessel-trash";
const LOCK_SUFFIX: &str = ".lock";

static STAGE_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn lock_path(staged: &Path) -> PathBuf {
    let mut name = staged.as_os_str().to_owned();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

fn open_lock(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
}

/// Rename `victim` into the staging directory under a held lock.
fn stage(victim: &Path) -> Result<(PathBuf, File), StoreError> {
    let parent = victim
        .parent()
        .ok_or_else(|| StoreError::Io(std::io::Error::other("cannot remove filesystem root")))?;
    let trash = parent.join(TRASH_DIR);
    fs::create_dir_all(&trash)?;
    let base = victim
        .file_name()
        .map_or_else(|| "tree".into(), |n| n.to_string_lossy().into_owned());
    let staged = trash.join(format!(
        "{base}-{}-{}",
        std::process::id(),
        STAGE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let lock = open_lock(&lock_path(&staged))?;
    lock.try_lock_exclusive()?;
    if let Err(e) = fs::rename(victim, &staged) {
        let _ = fs::remove_file(lock_path(&staged));
        return Err(e.into());
    }
    fsync_dir(parent)?;
    Ok((staged, lock))
}

/// Stage `victim` and delete it in the background.
///
/// Returns the pid of the deleting process, or `None` when there was
/// nothing to remove. Success means the delete was started.
#[allow(clippy::zombie_processes)]
pub fn remove_tree_async(victim: &Path) -> Result<Option<u32>, StoreError> {
    if fs::symlink_metadata(victim).is_err() {
        return Ok(None);
    }
    let (staged, lock) = stage(victim)?;
    let child = Command::new("rm")
        .arg("-rf")
        .arg("--")
        .arg(&staged)
        .arg(lock_path(&staged))
        .stdin(Stdio::from(lock))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;
    info!(
        "removing {} in background (pid {})",
        victim.display(),
        child.id()
    );
    Ok(Some(child.id()))
}

/// Synchronously delete leftovers of interrupted background removals.
///
/// Trees whose lock is held by a running delete are skipped. `should_stop`
/// is polled between entries. Returns how many trees were removed.
pub fn sweep_trash(parent: &Path, should_stop: &dyn Fn() -> bool) -> Result<usize, StoreError> {
    let trash = parent.join(TRASH_DIR);
    if !trash.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(&trash)? {
        if should_stop() {
            warn!("sweep of {} interrupted", trash.display());
            break;
        }
        let path = entry?.path();
        let is_lock = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().ends_with(LOCK_SUFFIX));
        let (tree, lock_file) = if is_lock {
            let tree = path.with_extension("");
            if fs::symlink_metadata(&tree).is_ok() {
                continue;
            }
            (None, path)
        } else {
            let lock_file = lock_path(&path);
            (Some(path), lock_file)
        };

        let lock = match open_lock(&lock_file) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if lock.try_lock_exclusive().is_err() {
            debug!("{} is being removed, skipping", lock_file.display());
            continue;
        }
        if let Some(tree) = tree {
            let res = match fs::symlink_metadata(&tree) {
                Ok(m) if m.is_dir() => fs::remove_dir_all(&tree),
                Ok(_) => fs::remove_file(&tree),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            };
            match res {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!("failed to remove {}: {e}", tree.display());
                    continue;
                }
            }
        }
        if let Err(e) = fs::remove_file(&lock_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {}: {e}", lock_file.display());
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn staged_tree_disappears_from_original_path_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("101");
        fs::create_dir_all(victim.join("etc")).unwrap();
        fs::write(victim.join("etc/hosts"), "x").unwrap();

        let pid = remove_tree_async(&victim).unwrap();
        assert!(pid.is_some());
        assert!(!victim.exists());

        let trash = dir.path().join(TRASH_DIR);
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let left = fs::read_dir(&trash).unwrap().count();
            if left == 0 || Instant::now() > deadline {
                assert_eq!(left, 0);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn missing_victim_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(remove_tree_async(&dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn sweep_removes_leftovers_and_honors_stop() {
        let dir = tempfile::tempdir().unwrap();
        let trash = dir.path().join(TRASH_DIR);
        fs::create_dir_all(trash.join("old-1/a")).unwrap();
        fs::write(trash.join("old-2"), "x").unwrap();

        fs::write(trash.join("gone-3.lock"), "").unwrap();

        assert_eq!(sweep_trash(dir.path(), &|| true).unwrap(), 0);
        assert_eq!(sweep_trash(dir.path(), &|| false).unwrap(), 2);
        assert_eq!(fs::read_dir(&trash).unwrap().count(), 0);
        assert_eq!(sweep_trash(&dir.path().join("none"), &|| false).unwrap(), 0);
    }

    #[test]
    fn sweep_skips_tree_whose_delete_is_running() {
        let dir = tempfile::tempdir().unwrap();
        let trash = dir.path().join(TRASH_DIR);
        fs::create_dir_all(trash.join("101-7-0/etc")).unwrap();
        fs::create_dir_all(trash.join("102-7-1")).unwrap();

        let held = open_lock(&trash.join("101-7-0.lock")).unwrap();
        held.try_lock_exclusive().unwrap();

        assert_eq!(sweep_trash(dir.path(), &|| false).unwrap(), 1);
        assert!(trash.join("101-7-0/etc").is_dir());
        assert!(!trash.join("102-7-1").exists());

        drop(held);
        assert_eq!(sweep_trash(dir.path(), &|| false).unwrap(), 1);
        assert_eq!(fs::read_dir(&trash).unwrap().count(), 0);
    }

    #[test]
    fn staging_takes_the_tree_lock_before_the_rename() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("101");
        fs::create_dir_all(&victim).unwrap();

        let (staged, lock) = stage(&victim).unwrap();
        assert!(!victim.exists());
        assert!(staged.is_dir());
        let other = open_lock(&lock_path(&staged)).unwrap();
        assert!(other.try_lock_exclusive().is_err());
        assert_eq!(sweep_trash(dir.path(), &|| false).unwrap(), 0);
        assert!(staged.is_dir());

        drop(lock);
        assert_eq!(sweep_trash(dir.path(), &|| false).unwrap(), 1);
    }
}
