use crate::{fsync_dir, StoreError};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info};

fn is_gzip(path: &Path) -> Result<bool, StoreError> {
    let mut magic = [0u8; 2];
    let mut f = File::open(path)?;
    let n = f.read(&mut magic)?;
    Ok(n == 2 && magic == [0x1f, 0x8b])
}

fn unpack<R: Read>(reader: R, target: &Path) -> Result<(), StoreError> {
    let mut ar = tar::Archive::new(reader);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(true);
    ar.set_unpack_xattrs(false);
    ar.unpack(target)
        .map_err(|e| StoreError::Template(format!("unpack into {}: {e}", target.display())))
}

/// Expand a template archive into `dest`, which must not exist yet.
///
/// The archive is unpacked into a temporary directory next to `dest` and
/// renamed over it only after the whole archive has been written. On any
/// failure the temporary directory is removed and `dest` is untouched.
pub fn expand_template(archive: &Path, dest: &Path) -> Result<(), StoreError> {
    if dest.exists() {
        return Err(StoreError::PrivateExists(dest.to_path_buf()));
    }
    let parent = dest
        .parent()
        .ok_or_else(|| StoreError::Template(format!("{} has no parent", dest.display())))?;
    fs::create_dir_all(parent)?;

    let staging = tempfile::Builder::new()
        .prefix(".vessel-tmpl-")
        .tempdir_in(parent)?;
    debug!(
        "expanding {} into {}",
        archive.display(),
        staging.path().display()
    );

    let file = BufReader::new(File::open(archive)?);
    if is_gzip(archive)? {
        unpack(GzDecoder::new(file), staging.path())?;
    } else {
        unpack(file, staging.path())?;
    }

    fs::set_permissions(staging.path(), fs::Permissions::from_mode(0o755))?;
    fs::rename(staging.path(), dest)?;
    fsync_dir(parent)?;
    info!("private area created at {}", dest.display());
    Ok(())
}
