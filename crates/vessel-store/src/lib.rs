//! Host-side persistent state for Vessel.
//!
//! This crate provides the storage layer: `HostLayout` for the directory
//! structure (config dir, lock dir, dump dir, templates), `ConfStore` for
//! per-container config files, backups and the name index, template
//! expansion into a fresh private area, and the two-phase background removal
//! of large directory trees.

pub mod confstore;
pub mod layout;
pub mod removal;
pub mod template;

pub use confstore::{ConfStore, DESTROYED_SUFFIX};
pub use layout::{ActionScript, HostLayout};
pub use removal::{remove_tree_async, sweep_trash, TRASH_DIR};
pub use template::expand_template;

use std::path::{Path, PathBuf};
use thiserror::Error;
use vessel_schema::{ConfigError, ContainerId};

/// Fsync a directory so a preceding `rename()` survives a crash.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("config sample not found: {}", .0.display())]
    SampleNotFound(PathBuf),
    #[error("OS template '{0}' not found in template cache")]
    TemplateNotFound(String),
    #[error("template expansion failed: {0}")]
    Template(String),
    #[error("private area already exists: {}", .0.display())]
    PrivateExists(PathBuf),
    #[error("name '{name}' is already used by container {existing}")]
    NameConflict { name: String, existing: ContainerId },
    #[error("no container named '{0}'")]
    NameNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_name_conflict() {
        let e = StoreError::NameConflict {
            name: "web".to_owned(),
            existing: ContainerId::new(101).unwrap(),
        };
        let msg = e.to_string();
        assert!(msg.contains("web"));
        assert!(msg.contains("101"));
    }

    #[test]
    fn config_errors_pass_through() {
        let e: StoreError = ConfigError::NoConfig(PathBuf::from("/x/1.conf")).into();
        assert!(e.to_string().contains("1.conf"));
    }
}
