use super::{print_action, resolve, EXIT_SUCCESS};
use vessel_core::{CoreError, Orchestrator};

pub fn mount(orch: &Orchestrator, id: &str, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    orch.mount(id)?;
    if json {
        return print_action(id, "mounted");
    }
    println!("container {id} mounted");
    Ok(EXIT_SUCCESS)
}

pub fn umount(orch: &Orchestrator, id: &str, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    orch.umount(id)?;
    if json {
        return print_action(id, "unmounted");
    }
    println!("container {id} unmounted");
    Ok(EXIT_SUCCESS)
}
