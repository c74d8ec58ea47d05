pub mod checkpoint;
pub mod completions;
pub mod convert;
pub mod create;
pub mod destroy;
pub mod exec;
pub mod list;
pub mod man_pages;
pub mod modules;
pub mod mount;
pub mod restart;
pub mod set;
pub mod snapshot;
pub mod spec_args;
pub mod start;
pub mod status;
pub mod stop;

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use vessel_core::{CoreError, ErrorKind, Orchestrator};
use vessel_schema::ContainerId;

pub const EXIT_SUCCESS: u8 = 0;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CoreError> {
    Ok(serde_json::to_string_pretty(value)?)
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Run `op` behind a spinner (skipped in JSON mode) and print the outcome.
pub fn with_spinner<T>(
    json: bool,
    busy: &str,
    done: &str,
    op: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, CoreError> {
    if json {
        return op();
    }
    let pb = spinner(busy);
    match op() {
        Ok(v) => {
            spin_ok(&pb, done);
            Ok(v)
        }
        Err(e) => {
            spin_fail(&pb, busy);
            Err(e)
        }
    }
}

/// Print `{"id": .., "action": ..}` for scripted callers.
pub fn print_action(id: ContainerId, action: &str) -> Result<u8, CoreError> {
    let payload = serde_json::json!({ "id": id, "action": action });
    println!("{}", json_pretty(&payload)?);
    Ok(EXIT_SUCCESS)
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "running" => Style::new().green().bold().apply_to(state).to_string(),
        "mounted" => Style::new().cyan().apply_to(state).to_string(),
        "created" | "stopped" => Style::new().yellow().apply_to(state).to_string(),
        "suspended" => Style::new().blue().apply_to(state).to_string(),
        "stopping" => Style::new().red().apply_to(state).to_string(),
        "nonexistent" => Style::new().dim().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

/// A numeric ID or a registered container name.
pub fn resolve(orch: &Orchestrator, input: &str) -> Result<ContainerId, CoreError> {
    orch.resolve(input)
}

/// Exit status of a command run inside a container, as a process exit code.
pub fn child_exit_code(status: i32) -> u8 {
    u8::try_from(status).unwrap_or_else(|_| ErrorKind::ExecutionError.exit_code())
}
