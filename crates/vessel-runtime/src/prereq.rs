use std::fmt;
use std::path::Path;
use std::process::{Command, Stdio};
use vessel_schema::StorageLayout;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

const UTIL_LINUX: &str = "part of util-linux (usually pre-installed)";

/// Helpers the named kernel driver shells out to.
pub fn check_driver_prereqs(driver: &str) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    if driver != "cgroup" {
        return missing;
    }
    if !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
        missing.push(MissingPrereq {
            name: "cgroup v2",
            purpose: "resource limits and container tracking",
            install_hint: "boot with systemd.unified_cgroup_hierarchy=1",
        });
    }
    for (name, purpose) in [
        ("unshare", "namespace creation"),
        ("nsenter", "entering running containers"),
    ] {
        if !command_exists(name) {
            missing.push(MissingPrereq {
                name,
                purpose,
                install_hint: UTIL_LINUX,
            });
        }
    }
    if !command_exists("ip") {
        missing.push(MissingPrereq {
            name: "ip",
            purpose: "container network identity",
            install_hint: "zypper install iproute2 | apt install iproute2 | dnf install iproute",
        });
    }
    if !command_exists("criu") {
        missing.push(MissingPrereq {
            name: "criu",
            purpose: "checkpoint and restore",
            install_hint: "zypper install criu | apt install criu | dnf install criu",
        });
    }
    missing
}

/// Helpers needed for a storage layout and, optionally, disk quota.
pub fn check_storage_prereqs(layout: StorageLayout, quota: bool) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    if layout == StorageLayout::Ploop && !command_exists("ploop") {
        missing.push(MissingPrereq {
            name: "ploop",
            purpose: "image-backed container storage",
            install_hint: "install the ploop package from the OpenVZ repositories",
        });
    }
    if quota && !command_exists("vzquota") {
        missing.push(MissingPrereq {
            name: "vzquota",
            purpose: "per-container disk quota",
            install_hint: "install the vzquota package from the OpenVZ repositories",
        });
    }
    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nVessel needs these host tools to manage containers.");
    msg
}
