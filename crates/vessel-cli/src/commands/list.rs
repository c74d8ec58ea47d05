use super::{colorize_state, json_pretty, EXIT_SUCCESS};
use vessel_core::{CoreError, Orchestrator};

pub fn run(orch: &Orchestrator, json: bool) -> Result<u8, CoreError> {
    let all = orch.list()?;
    if json {
        println!("{}", json_pretty(&all)?);
    } else if all.is_empty() {
        println!("no containers found");
    } else {
        println!("{:<8} {:<16} {:<12} {:<20} HOSTNAME", "ID", "NAME", "STATE", "IP");
        for s in &all {
            let ip = s.ips.first().map_or("-", String::as_str);
            println!(
                "{:<8} {:<16} {:<12} {:<20} {}",
                s.id,
                s.name.as_deref().unwrap_or("-"),
                colorize_state(&s.state.to_string()),
                ip,
                s.hostname.as_deref().unwrap_or("-"),
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
