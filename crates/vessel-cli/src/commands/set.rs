use super::spec_args::SpecArgs;
use super::{json_pretty, resolve, EXIT_SUCCESS};
use vessel_core::{CoreError, Orchestrator, SetMode, SetOptions};

#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    pub save: bool,
    pub mode: Option<SetMode>,
    pub skip_guest: bool,
}

/// Split `NAME[=VALUE]`, tolerating a leading `--`.
fn module_option(raw: &str) -> (String, Option<String>) {
    let raw = raw.trim_start_matches("--");
    match raw.split_once('=') {
        Some((name, value)) => (name.to_owned(), Some(value.to_owned())),
        None => (raw.to_owned(), None),
    }
}

pub fn run(
    orch: &Orchestrator,
    id: &str,
    spec: &SpecArgs,
    module_options: &[String],
    flags: Flags,
    json: bool,
) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    let opts = SetOptions {
        cmd: spec.to_spec()?,
        module_options: module_options.iter().map(|o| module_option(o)).collect(),
        save: flags.save,
        mode: flags.mode,
        skip_guest: flags.skip_guest,
    };
    let outcome = orch.set(id, opts)?;
    if json {
        let payload = serde_json::json!({ "id": id, "outcome": outcome });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }
    if outcome.restarted {
        println!("container {id} restarted with new settings");
    } else if outcome.applied_live {
        println!("settings applied to running container {id}");
    }
    if outcome.passwords_set {
        println!("passwords set in container {id}");
    }
    if !outcome.skipped.is_empty() {
        println!("deferred to next start: {}", outcome.skipped.join(", "));
    }
    if outcome.saved {
        println!("saved parameters for container {id}");
    }
    Ok(EXIT_SUCCESS)
}
