use super::{print_action, resolve, with_spinner, EXIT_SUCCESS};
use vessel_core::{CoreError, Orchestrator};

pub fn run(orch: &Orchestrator, id: &str, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    with_spinner(
        json,
        &format!("converting container {id} to ploop..."),
        &format!("container {id} converted to ploop"),
        || orch.convert(id),
    )?;
    if json {
        return print_action(id, "converted");
    }
    Ok(EXIT_SUCCESS)
}
