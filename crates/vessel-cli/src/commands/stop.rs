use super::{print_action, resolve, with_spinner, EXIT_SUCCESS};
use vessel_core::{CoreError, Orchestrator, StopOptions};

pub fn run(orch: &Orchestrator, id: &str, opts: StopOptions, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    with_spinner(
        json,
        &format!("stopping container {id}..."),
        &format!("container {id} stopped"),
        || orch.stop(id, opts),
    )?;
    if json {
        return print_action(id, "stopped");
    }
    Ok(EXIT_SUCCESS)
}
