use super::{child_exit_code, json_pretty, resolve};
use vessel_core::{CoreError, Orchestrator};

pub fn enter(orch: &Orchestrator, id: &str) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    let status = orch.enter(id)?;
    Ok(child_exit_code(status))
}

pub fn run(orch: &Orchestrator, id: &str, command: &[String], json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    let status = orch.exec(id, command)?;
    if json {
        let payload = serde_json::json!({
            "id": id,
            "command": command,
            "exit_code": status,
        });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(child_exit_code(status))
}
