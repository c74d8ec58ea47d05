use super::{json_pretty, EXIT_SUCCESS};
use vessel_core::{CoreError, Orchestrator};

pub fn run(orch: &Orchestrator, json: bool) -> Result<u8, CoreError> {
    let registry = &orch.context().modules;
    if json {
        let modules: Vec<_> = registry
            .iter()
            .map(|m| {
                let options: Vec<_> = m
                    .options()
                    .iter()
                    .map(|o| {
                        serde_json::json!({
                            "name": o.name,
                            "help": o.help,
                            "takes_value": o.takes_value,
                        })
                    })
                    .collect();
                serde_json::json!({
                    "name": m.name(),
                    "description": m.description(),
                    "config_keys": m.config_keys(),
                    "options": options,
                })
            })
            .collect();
        println!("{}", json_pretty(&modules)?);
    } else if registry.is_empty() {
        println!("no extension modules loaded");
    } else {
        print!("{}", registry.describe());
    }
    Ok(EXIT_SUCCESS)
}
