use super::{print_action, resolve, with_spinner, EXIT_SUCCESS};
use vessel_core::{CoreError, Orchestrator};

pub fn run(orch: &Orchestrator, id: &str, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    with_spinner(
        json,
        &format!("destroying container {id}..."),
        &format!("destroyed container {id}"),
        || orch.destroy(id),
    )?;
    if json {
        return print_action(id, "destroyed");
    }
    Ok(EXIT_SUCCESS)
}
