use super::{json_pretty, print_action, resolve, EXIT_SUCCESS};
use vessel_core::{CoreError, Orchestrator};

pub fn create(orch: &Orchestrator, id: &str, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    let uuid = orch.snapshot_create(id)?;
    if json {
        let payload = serde_json::json!({ "id": id, "uuid": uuid });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("snapshot {uuid} created for container {id}");
    }
    Ok(EXIT_SUCCESS)
}

pub fn delete(orch: &Orchestrator, id: &str, uuid: &str, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    orch.snapshot_delete(id, uuid)?;
    if json {
        return print_action(id, "snapshot-deleted");
    }
    println!("snapshot {uuid} deleted");
    Ok(EXIT_SUCCESS)
}

pub fn switch(orch: &Orchestrator, id: &str, uuid: &str, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    orch.snapshot_switch(id, uuid)?;
    if json {
        return print_action(id, "snapshot-switched");
    }
    println!("container {id} switched to snapshot {uuid}");
    Ok(EXIT_SUCCESS)
}

pub fn list(orch: &Orchestrator, id: &str, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    let snapshots = orch.snapshot_list(id)?;
    if json {
        let payload = serde_json::json!({ "id": id, "snapshots": snapshots });
        println!("{}", json_pretty(&payload)?);
    } else if snapshots.is_empty() {
        println!("no snapshots for container {id}");
    } else {
        println!("{:<40} {:<40} CURRENT", "UUID", "PARENT");
        for s in &snapshots {
            println!(
                "{:<40} {:<40} {}",
                s.uuid,
                s.parent.as_deref().unwrap_or("-"),
                if s.current { "*" } else { "" }
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
