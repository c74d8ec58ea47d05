use crate::CoreError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use vessel_schema::ContainerId;

const LOCK_ATTEMPTS: u32 = 3;
const LOCK_RETRY: Duration = Duration::from_millis(200);

/// Advisory per-container lock held for the duration of one mutating
/// operation. The file records the holder and is removed on drop.
pub struct ContainerLock {
    file: File,
    path: PathBuf,
}

impl ContainerLock {
    pub fn acquire(lock_path: &Path, id: ContainerId) -> Result<Self, CoreError> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        for attempt in 1..=LOCK_ATTEMPTS {
            if file.try_lock_exclusive().is_ok() {
                let mut lock = Self {
                    file,
                    path: lock_path.to_path_buf(),
                };
                lock.record_holder()?;
                debug!("locked container {id}");
                return Ok(lock);
            }
            if attempt < LOCK_ATTEMPTS {
                std::thread::sleep(LOCK_RETRY);
            }
        }

        let holder = fs::read_to_string(lock_path)
            .ok()
            .and_then(|s| s.lines().next().map(|pid| format!("pid {}", pid.trim())))
            .unwrap_or_else(|| "another process".to_owned());
        Err(CoreError::Locked { id, holder })
    }

    fn record_holder(&mut self) -> Result<(), CoreError> {
        self.file.set_len(0)?;
        let stamp = chrono::Utc::now().to_rfc3339();
        writeln!(self.file, "{}\n{stamp}", std::process::id())?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ContainerLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to remove lock file {}: {e}", self.path.display());
        }
        let _ = self.file.unlock();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\ninterrupt received, finishing current step...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ContainerId {
        ContainerId::new(101).unwrap()
    }

    #[test]
    fn lock_records_holder_and_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("lock/101.lck");

        {
            let lock = ContainerLock::acquire(&lock_path, id()).unwrap();
            let content = fs::read_to_string(lock.path()).unwrap();
            let mut lines = content.lines();
            assert_eq!(lines.next().unwrap(), std::process::id().to_string());
            assert!(chrono::DateTime::parse_from_rfc3339(lines.next().unwrap()).is_ok());
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn second_acquire_reports_locked() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("101.lck");

        let _held = ContainerLock::acquire(&lock_path, id()).unwrap();
        match ContainerLock::acquire(&lock_path, id()) {
            Err(CoreError::Locked { holder, .. }) => {
                assert!(holder.contains(&std::process::id().to_string()));
            }
            other => panic!("expected Locked, got {:?}", other.err()),
        }
    }

    #[test]
    fn lock_available_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("101.lck");

        drop(ContainerLock::acquire(&lock_path, id()).unwrap());
        assert!(ContainerLock::acquire(&lock_path, id()).is_ok());
    }
}
