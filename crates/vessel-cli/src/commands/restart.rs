use super::{print_action, resolve, with_spinner, EXIT_SUCCESS};
use vessel_core::{CoreError, Orchestrator, StartOptions, StopOptions};

pub fn run(orch: &Orchestrator, id: &str, fast: bool, wait: bool, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    let stop = StopOptions {
        fast,
        ..StopOptions::default()
    };
    let start = StartOptions {
        wait,
        ..StartOptions::default()
    };
    with_spinner(
        json,
        &format!("restarting container {id}..."),
        &format!("container {id} restarted"),
        || orch.restart(id, stop, start),
    )?;
    if json {
        return print_action(id, "restarted");
    }
    Ok(EXIT_SUCCESS)
}
