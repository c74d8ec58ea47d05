use super::{print_action, resolve, with_spinner, EXIT_SUCCESS};
use vessel_core::{CoreError, Orchestrator, StartOptions};

pub fn run(orch: &Orchestrator, id: &str, opts: StartOptions, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    with_spinner(
        json,
        &format!("starting container {id}..."),
        &format!("container {id} started"),
        || orch.start(id, opts),
    )?;
    if json {
        return print_action(id, "started");
    }
    Ok(EXIT_SUCCESS)
}
