//! Line-oriented `KEY="value"` reader.
//!
//! Policy:
//! - the first occurrence of a key wins; later duplicates warn and are ignored
//! - keys outside the static table are offered to a [`KeyClaim`]; unclaimed
//!   keys warn and are dropped
//! - malformed values warn and parsing continues
//! - oversize files and allocation failure abort with [`ConfigError::Resource`]

use crate::keys::lookup_key;
use crate::spec::ContainerSpec;
use crate::ConfigError;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// Files larger than this are refused outright.
pub const MAX_CONFIG_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    NotMine,
}

/// Something that may own keys outside the static table.
pub trait KeyClaim {
    fn claim(
        &self,
        spec: &mut ContainerSpec,
        key: &str,
        value: &str,
    ) -> Result<Claim, ConfigError>;
}

/// Claims nothing.
pub struct NoClaim;

impl KeyClaim for NoClaim {
    fn claim(&self, _: &mut ContainerSpec, _: &str, _: &str) -> Result<Claim, ConfigError> {
        Ok(Claim::NotMine)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub line: usize,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseWarning {
    Duplicate {
        line: usize,
        key: String,
        first_line: usize,
    },
    UnknownKey {
        line: usize,
        key: String,
    },
    InvalidValue {
        line: usize,
        key: String,
        message: String,
    },
    Malformed {
        line: usize,
        text: String,
    },
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate {
                line,
                key,
                first_line,
            } => write!(
                f,
                "line {line}: duplicate {key} ignored (first set on line {first_line})"
            ),
            Self::UnknownKey { line, key } => write!(f, "line {line}: unknown key {key}"),
            Self::InvalidValue { line, key, message } => {
                write!(f, "line {line}: invalid {key}: {message}")
            }
            Self::Malformed { line, text } => write!(f, "line {line}: cannot parse '{text}'"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseReport {
    pub warnings: Vec<ParseWarning>,
    /// Number of assignments that took effect.
    pub applied: usize,
}

impl ParseReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warn(&mut self, w: ParseWarning, source: &str) {
        warn!("{source}: {w}");
        self.warnings.push(w);
    }
}

fn unquote(v: &str) -> &str {
    let v = v.trim();
    for q in ['"', '\''] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            return &v[1..v.len() - 1];
        }
    }
    v
}

/// Split one line into key and unquoted value.
///
/// Returns `Ok(None)` for blank and comment lines, `Err(())` for lines
/// that are neither.
#[allow(clippy::result_unit_err)]
pub fn split_assignment(line: &str) -> Result<Option<(&str, &str)>, ()> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let (key, value) = trimmed.split_once('=').ok_or(())?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(());
    }
    Ok(Some((key, unquote(value))))
}

/// Collect every well-formed assignment; malformed lines become warnings.
pub fn read_assignments(
    content: &str,
) -> Result<(Vec<Assignment>, Vec<ParseWarning>), ConfigError> {
    let mut out = Vec::new();
    out.try_reserve(content.lines().count())
        .map_err(|e| ConfigError::Resource(e.to_string()))?;
    let mut malformed = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        match split_assignment(line) {
            Ok(Some((key, value))) => out.push(Assignment {
                line: idx + 1,
                key: key.to_owned(),
                value: value.to_owned(),
            }),
            Ok(None) => {}
            Err(()) => malformed.push(ParseWarning::Malformed {
                line: idx + 1,
                text: line.trim().to_owned(),
            }),
        }
    }
    Ok((out, malformed))
}

/// Parse `content` on top of `spec`.
pub fn parse_str(
    content: &str,
    spec: &mut ContainerSpec,
    claims: &dyn KeyClaim,
    source: &str,
) -> Result<ParseReport, ConfigError> {
    if content.len() as u64 > MAX_CONFIG_SIZE {
        return Err(ConfigError::Resource(format!(
            "{source} exceeds {MAX_CONFIG_SIZE} bytes"
        )));
    }
    let (assignments, malformed) = read_assignments(content)?;
    let mut report = ParseReport::default();
    for w in malformed {
        report.warn(w, source);
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    seen.try_reserve(assignments.len())
        .map_err(|e| ConfigError::Resource(e.to_string()))?;

    for a in assignments {
        let known = lookup_key(&a.key);
        let identity = known.map_or_else(|| a.key.clone(), |k| k.name().to_owned());
        if let Some(&first_line) = seen.get(&identity) {
            report.warn(
                ParseWarning::Duplicate {
                    line: a.line,
                    key: a.key,
                    first_line,
                },
                source,
            );
            continue;
        }
        seen.insert(identity, a.line);

        let result = match known {
            Some(key) => key.apply(spec, &a.value).map(|()| Claim::Claimed),
            None => claims.claim(spec, &a.key, &a.value),
        };
        match result {
            Ok(Claim::Claimed) => report.applied += 1,
            Ok(Claim::NotMine) => report.warn(
                ParseWarning::UnknownKey {
                    line: a.line,
                    key: a.key,
                },
                source,
            ),
            Err(ConfigError::InvalidValue { message, .. }) => report.warn(
                ParseWarning::InvalidValue {
                    line: a.line,
                    key: a.key,
                    message,
                },
                source,
            ),
            Err(ConfigError::InvalidSyntax(message)) => report.warn(
                ParseWarning::InvalidValue {
                    line: a.line,
                    key: a.key,
                    message,
                },
                source,
            ),
            Err(e) => return Err(e),
        }
    }
    debug!(
        "{source}: {} assignment(s) applied, {} warning(s)",
        report.applied,
        report.warnings.len()
    );
    Ok(report)
}

/// Parse a file on top of `spec`. A missing file is [`ConfigError::NoConfig`].
pub fn parse_file(
    path: &Path,
    spec: &mut ContainerSpec,
    claims: &dyn KeyClaim,
) -> Result<ParseReport, ConfigError> {
    let content = read_config(path)?;
    parse_str(&content, spec, claims, &path.display().to_string())
}

pub(crate) fn read_config(path: &Path) -> Result<String, ConfigError> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NoConfig(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    if meta.len() > MAX_CONFIG_SIZE {
        return Err(ConfigError::Resource(format!(
            "{} exceeds {MAX_CONFIG_SIZE} bytes",
            path.display()
        )));
    }
    Ok(std::fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{BarrierLimit, UbResource};
    use std::path::PathBuf;

    struct ClaimPrefix(&'static str);

    impl KeyClaim for ClaimPrefix {
        fn claim(
            &self,
            spec: &mut ContainerSpec,
            key: &str,
            value: &str,
        ) -> Result<Claim, ConfigError> {
            if !key.starts_with(self.0) {
                return Ok(Claim::NotMine);
            }
            if value == "bad" {
                return Err(ConfigError::invalid(key, "rejected"));
            }
            spec.module_data
                .entry("test".to_owned())
                .or_default()
                .insert(key.to_owned(), value.to_owned());
            Ok(Claim::Claimed)
        }
    }

    fn parse(content: &str) -> (ContainerSpec, ParseReport) {
        let mut spec = ContainerSpec::default();
        let report = parse_str(content, &mut spec, &ClaimPrefix("MOD_"), "test").unwrap();
        (spec, report)
    }

    #[test]
    fn split_assignment_strips_quotes_and_comments() {
        assert_eq!(split_assignment("A=\"x y\""), Ok(Some(("A", "x y"))));
        assert_eq!(split_assignment("  B = 'z' "), Ok(Some(("B", "z"))));
        assert_eq!(split_assignment("C=a=b"), Ok(Some(("C", "a=b"))));
        assert_eq!(split_assignment("# D=1"), Ok(None));
        assert_eq!(split_assignment("   "), Ok(None));
        assert_eq!(split_assignment("garbage"), Err(()));
        assert_eq!(split_assignment("two words=1"), Err(()));
    }

    #[test]
    fn first_occurrence_wins() {
        let (spec, report) = parse("HOSTNAME=\"first\"\nHOSTNAME=\"second\"\n");
        assert_eq!(spec.misc.hostname.as_deref(), Some("first"));
        assert!(matches!(
            report.warnings.as_slice(),
            [ParseWarning::Duplicate { line: 2, first_line: 1, .. }]
        ));
    }

    #[test]
    fn alias_counts_as_duplicate_of_canonical_key() {
        let (spec, report) = parse("IP_ADDRESS=\"10.0.0.1\"\nIPADDR=\"10.0.0.2\"\n");
        assert_eq!(spec.net.ip.items.len(), 1);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn unknown_keys_warn_and_claimed_keys_are_kept() {
        let (spec, report) = parse("FOO=1\nMOD_X=\"on\"\n");
        assert_eq!(spec.module_value("test", "MOD_X"), Some("on"));
        assert!(matches!(
            report.warnings.as_slice(),
            [ParseWarning::UnknownKey { line: 1, .. }]
        ));
        assert_eq!(report.applied, 1);
    }

    #[test]
    fn invalid_values_do_not_stop_parsing() {
        let (spec, report) = parse(
            "NUMPROC=\"50:10\"\nMOD_Y=bad\nnonsense line\nNUMFILE=\"100:200\"\n",
        );
        assert!(spec.res.get(UbResource::Numproc).is_none());
        assert_eq!(
            spec.res.get(UbResource::Numfile),
            Some(BarrierLimit::new(100, 200))
        );
        assert_eq!(report.warnings.len(), 3);
    }

    #[test]
    fn oversize_content_is_a_resource_error() {
        let big = "#".repeat(MAX_CONFIG_SIZE as usize + 1);
        let mut spec = ContainerSpec::default();
        let err = parse_str(&big, &mut spec, &NoClaim, "big").unwrap_err();
        assert!(matches!(err, ConfigError::Resource(_)));
    }

    #[test]
    fn missing_file_is_no_config() {
        let mut spec = ContainerSpec::default();
        let err = parse_file(
            &PathBuf::from("/nonexistent/vessel/101.conf"),
            &mut spec,
            &NoClaim,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NoConfig(_)));
    }

    #[test]
    fn parse_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("101.conf");
        std::fs::write(&path, "# comment\nVE_ROOT=\"/vz/root/101\"\nONBOOT=yes\n").unwrap();
        let mut spec = ContainerSpec::default();
        let report = parse_file(&path, &mut spec, &NoClaim).unwrap();
        assert!(report.is_clean());
        assert_eq!(spec.misc.onboot, Some(true));
        assert_eq!(spec.root_path(), Some(Path::new("/vz/root/101")));
    }
}
