//! Action scripts run against a container root or on the host.

use crate::exec::run_with_timeout;
use crate::RuntimeError;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};
use vessel_schema::ContainerId;

const GUEST_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone)]
pub struct ScriptRequest<'a> {
    pub id: ContainerId,
    pub root: &'a Path,
    pub script: &'a Path,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Init of the running container; `None` runs the script under `chroot`.
    pub init_pid: Option<u32>,
}

pub trait GuestConfigurator: Send + Sync {
    fn run_action_script(&self, req: &ScriptRequest<'_>) -> Result<(), RuntimeError>;
}

fn script_name(script: &Path) -> String {
    script
        .file_name()
        .map_or_else(|| script.display().to_string(), |n| n.to_string_lossy().into_owned())
}

fn read_script(script: &Path) -> Result<Vec<u8>, RuntimeError> {
    fs::read(script).map_err(|e| {
        RuntimeError::ExecFailed(format!("cannot read action script {}: {e}", script.display()))
    })
}

/// Feeds the script to `/bin/sh` on stdin inside the container.
#[derive(Default)]
pub struct ScriptConfigurator;

impl ScriptConfigurator {
    pub fn new() -> Self {
        Self
    }

    fn command(req: &ScriptRequest<'_>) -> Command {
        let mut cmd = match req.init_pid {
            Some(pid) => {
                let mut c = Command::new("nsenter");
                c.arg("-t")
                    .arg(pid.to_string())
                    .args(["--all", "--root", "--wd", "/bin/sh"]);
                c
            }
            None => {
                let mut c = Command::new("chroot");
                c.arg(req.root).arg("/bin/sh");
                c
            }
        };
        cmd.env_clear()
            .env("PATH", GUEST_PATH)
            .env("VEID", req.id.to_string())
            .envs(req.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }
}

impl GuestConfigurator for ScriptConfigurator {
    fn run_action_script(&self, req: &ScriptRequest<'_>) -> Result<(), RuntimeError> {
        let body = read_script(req.script)?;
        let name = script_name(req.script);
        debug!("running {name} in container {}", req.id);
        let out = run_with_timeout(Self::command(req), Some(&body), req.timeout)?;
        if !out.success() {
            if !out.stderr.trim().is_empty() {
                info!("{name}: {}", out.stderr.trim());
            }
            return Err(RuntimeError::Script {
                script: name,
                code: out.code,
            });
        }
        Ok(())
    }
}

/// Run a per-container host script with `/bin/sh`.
pub fn run_host_script(
    script: &Path,
    env: &[(String, String)],
    timeout: Duration,
) -> Result<(), RuntimeError> {
    let name = script_name(script);
    let mut cmd = Command::new("/bin/sh");
    cmd.arg(script)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    debug!("running host script {}", script.display());
    let out = run_with_timeout(cmd, None, timeout)?;
    if !out.success() {
        return Err(RuntimeError::Script {
            script: name,
            code: out.code,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ContainerId {
        ContainerId::new(101).unwrap()
    }

    #[test]
    fn chroot_command_carries_env() {
        let req = ScriptRequest {
            id: id(),
            root: Path::new("/vz/root/101"),
            script: Path::new("/etc/vessel/dists/scripts/set_hostname.sh"),
            env: vec![("HOSTNAME".to_owned(), "web".to_owned())],
            timeout: Duration::from_secs(5),
            init_pid: None,
        };
        let cmd = ScriptConfigurator::command(&req);
        assert_eq!(cmd.get_program(), "chroot");
        let envs: Vec<_> = cmd
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_owned(), v?.to_str()?.to_owned())))
            .collect();
        assert!(envs.contains(&("VEID".to_owned(), "101".to_owned())));
        assert!(envs.contains(&("HOSTNAME".to_owned(), "web".to_owned())));
    }

    #[test]
    fn running_container_uses_nsenter() {
        let req = ScriptRequest {
            id: id(),
            root: Path::new("/vz/root/101"),
            script: Path::new("/x.sh"),
            env: Vec::new(),
            timeout: Duration::from_secs(5),
            init_pid: Some(4242),
        };
        let cmd = ScriptConfigurator::command(&req);
        assert_eq!(cmd.get_program(), "nsenter");
        assert!(cmd.get_args().any(|a| a == "4242"));
    }

    #[test]
    fn missing_script_is_exec_failure() {
        let req = ScriptRequest {
            id: id(),
            root: Path::new("/"),
            script: Path::new("/nonexistent/vessel.sh"),
            env: Vec::new(),
            timeout: Duration::from_secs(5),
            init_pid: None,
        };
        assert!(matches!(
            ScriptConfigurator::new().run_action_script(&req),
            Err(RuntimeError::ExecFailed(_))
        ));
    }

    #[test]
    fn host_script_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ok = dir.path().join("101.mount");
        fs::write(&ok, "test \"$VEID\" = 101\n").unwrap();
        run_host_script(&ok, &[("VEID".to_owned(), "101".to_owned())], Duration::from_secs(5))
            .unwrap();

        let bad = dir.path().join("101.umount");
        fs::write(&bad, "exit 4\n").unwrap();
        match run_host_script(&bad, &[], Duration::from_secs(5)) {
            Err(RuntimeError::Script { script, code }) => {
                assert_eq!(script, "101.umount");
                assert_eq!(code, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
