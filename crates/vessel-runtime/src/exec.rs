//! Running external helpers with a bounded wait.

use crate::RuntimeError;
use std::io::Write as _;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Default bound for helpers that should return promptly.
pub const HELPER_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or 128 + signal number when killed by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

pub(crate) fn describe(cmd: &Command) -> String {
    let mut s = cmd.get_program().to_string_lossy().into_owned();
    for a in cmd.get_args() {
        s.push(' ');
        s.push_str(&a.to_string_lossy());
    }
    s
}

/// Send `signal` to `pid`. Errors (e.g. the process is gone) are ignored.
#[allow(unsafe_code)]
pub(crate) fn kill_pid(pid: u32, signal: i32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and has no memory-safety
    // preconditions.
    unsafe {
        libc::kill(pid, signal);
    }
}

/// Spawn `cmd`, feed it `stdin`, and wait at most `timeout` for it to exit.
///
/// A waiter thread owns the child and reports over a channel; the caller
/// blocks in `recv_timeout`. On expiry the child is killed and
/// [`RuntimeError::Timeout`] is returned.
pub fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput, RuntimeError> {
    let what = describe(&cmd);
    debug!("running {what}");
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| {
        RuntimeError::ExecFailed(format!("failed to spawn {what}: {e}"))
    })?;
    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        if let Err(e) = pipe.write_all(data) {
            warn!("writing stdin of {what}: {e}");
        }
    }
    let pid = child.id();

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(child.wait_with_output());
    });
    match rx.recv_timeout(timeout) {
        Ok(res) => {
            let out = res?;
            let code = out
                .status
                .code()
                .unwrap_or_else(|| 128 + out.status.signal().unwrap_or(0));
            Ok(CommandOutput {
                code,
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            })
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            kill_pid(pid, libc::SIGKILL);
            Err(RuntimeError::Timeout {
                command: what,
                after: timeout,
            })
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(RuntimeError::ExecFailed(format!(
            "waiter for {what} exited without a result"
        ))),
    }
}

/// Like [`run_with_timeout`] with no stdin, failing on a non-zero exit.
pub fn run_checked(cmd: Command, timeout: Duration) -> Result<CommandOutput, RuntimeError> {
    let what = describe(&cmd);
    let out = run_with_timeout(cmd, None, timeout)?;
    if !out.success() {
        return Err(RuntimeError::ExecFailed(format!(
            "{what} exited with {}: {}",
            out.code,
            out.stderr.trim()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut c = Command::new("/bin/sh");
        c.arg("-c").arg(script);
        c
    }

    #[test]
    fn captures_output_and_code() {
        let out = run_with_timeout(sh("echo hi; echo err >&2; exit 3"), None, HELPER_TIMEOUT)
            .unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[test]
    fn feeds_stdin() {
        let out = run_with_timeout(sh("cat"), Some(b"payload"), HELPER_TIMEOUT).unwrap();
        assert_eq!(out.stdout, "payload");
    }

    #[test]
    fn expiry_kills_and_reports_timeout() {
        let start = Instant::now();
        let err = run_with_timeout(sh("sleep 30"), None, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn checked_rejects_nonzero() {
        let err = run_checked(sh("echo boom >&2; exit 1"), HELPER_TIMEOUT).unwrap_err();
        match err {
            RuntimeError::ExecFailed(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_exec_failure() {
        let err = run_with_timeout(
            Command::new("/nonexistent/vessel-helper"),
            None,
            HELPER_TIMEOUT,
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::ExecFailed(_)));
    }

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
