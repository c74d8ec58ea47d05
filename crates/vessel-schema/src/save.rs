//! Diff-based, atomic rewrite of a configuration file.

use crate::keys::{check_value, lookup_key, ConfigKey};
use crate::parse::split_assignment;
use crate::spec::ContainerSpec;
use crate::{fsync_dir, ConfigError};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Every persisted `(KEY, value)` of `spec` in canonical order.
/// Module keys follow the static table, grouped by module.
pub fn render_lines(spec: &ContainerSpec) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = ConfigKey::all()
        .filter_map(|k| k.render(spec).map(|v| (k.name().to_owned(), v)))
        .collect();
    for values in spec.module_data.values() {
        for (k, v) in values {
            out.push((k.clone(), v.clone()));
        }
    }
    out
}

fn canonical(key: &str) -> String {
    lookup_key(key).map_or_else(|| key.to_owned(), |k| k.name().to_owned())
}

fn format_line(key: &str, value: &str) -> String {
    format!("{key}=\"{value}\"")
}

/// Write only the keys whose rendered value differs between `old` and `new`.
///
/// Existing comments, unknown keys, and untouched lines are kept verbatim.
/// Changed keys are replaced where they stand, unset keys are removed, new
/// keys are appended. Returns `false` when nothing differed and nothing was
/// written.
pub fn save(path: &Path, new: &ContainerSpec, old: &ContainerSpec) -> Result<bool, ConfigError> {
    let new_lines: BTreeMap<String, String> = render_lines(new).into_iter().collect();
    let old_lines: BTreeMap<String, String> = render_lines(old).into_iter().collect();

    let mut changed: Vec<(String, Option<String>)> = Vec::new();
    for (k, v) in render_lines(new) {
        if old_lines.get(&k) != Some(&v) {
            check_value(&k, &v)?;
            changed.push((k, Some(v)));
        }
    }
    for k in old_lines.keys() {
        if !new_lines.contains_key(k) {
            changed.push((k.clone(), None));
        }
    }

    let existing = match std::fs::read_to_string(path) {
        Ok(s) => Some(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    if changed.is_empty() && existing.is_some() {
        debug!("{}: no changes to save", path.display());
        return Ok(false);
    }

    let changed_map: BTreeMap<&str, Option<&str>> = changed
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_deref()))
        .collect();
    let mut handled: HashSet<String> = HashSet::new();
    let mut out: Vec<String> = Vec::new();

    for line in existing.as_deref().unwrap_or("").lines() {
        let Ok(Some((key, _))) = split_assignment(line) else {
            out.push(line.to_owned());
            continue;
        };
        let canon = canonical(key);
        let Some(new_value) = changed_map.get(canon.as_str()) else {
            out.push(line.to_owned());
            continue;
        };
        if !handled.insert(canon.clone()) {
            // later duplicate of a rewritten key
            continue;
        }
        if let Some(v) = new_value {
            out.push(format_line(&canon, v));
        }
    }
    for (k, v) in &changed {
        if let (Some(v), false) = (v, handled.contains(k)) {
            out.push(format_line(k, v));
        }
    }

    let mut content = out.join("\n");
    content.push('\n');
    write_atomic(path, content.as_bytes())?;
    debug!("{}: saved {} changed key(s)", path.display(), changed.len());
    Ok(true)
}

/// Write via a temp file in the same directory, then rename over `path`.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), ConfigError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ConfigError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}
