use super::{colorize_state, json_pretty, resolve, EXIT_SUCCESS};
use vessel_core::{CoreError, Orchestrator, Status};

/// One-line summary in the traditional `CTID <id> exist mounted running`
/// form, followed by the observed lifecycle state.
pub fn summary(s: &Status) -> String {
    let mut line = format!(
        "CTID {} {} {} {}",
        s.id,
        if s.exists { "exist" } else { "deleted" },
        if s.mounted { "mounted" } else { "unmounted" },
        if s.running { "running" } else { "down" },
    );
    if s.suspended {
        line.push_str(" suspended");
    }
    if s.dump {
        line.push_str(" dump");
    }
    line
}

pub fn run(orch: &Orchestrator, id: &str, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    let status = orch.status(id)?;
    if json {
        println!("{}", json_pretty(&status)?);
        return Ok(EXIT_SUCCESS);
    }
    println!("{}", summary(&status));
    println!("  state:    {}", colorize_state(&status.state.to_string()));
    if let Some(name) = &status.name {
        println!("  name:     {name}");
    }
    println!("  layout:   {}", status.layout);
    if let Some(p) = &status.private {
        println!("  private:  {}", p.display());
    }
    if let Some(r) = &status.root {
        println!("  root:     {}", r.display());
    }
    if let Some(h) = &status.hostname {
        println!("  hostname: {h}");
    }
    if !status.ips.is_empty() {
        println!("  ip:       {}", status.ips.join(" "));
    }
    if let Some(pid) = status.init_pid {
        println!("  init pid: {pid}");
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_core::LifecycleState;
    use vessel_schema::{ContainerId, StorageLayout};

    fn status(exists: bool, mounted: bool, running: bool) -> Status {
        Status {
            id: ContainerId::new(101).unwrap(),
            name: None,
            state: LifecycleState::Created,
            exists,
            mounted,
            running,
            suspended: false,
            dump: false,
            layout: StorageLayout::Simfs,
            private: None,
            root: None,
            hostname: None,
            ips: Vec::new(),
            init_pid: None,
        }
    }

    #[test]
    fn summary_uses_traditional_words() {
        assert_eq!(
            summary(&status(false, false, false)),
            "CTID 101 deleted unmounted down"
        );
        assert_eq!(
            summary(&status(true, true, true)),
            "CTID 101 exist mounted running"
        );
        let mut s = status(true, false, false);
        s.dump = true;
        assert_eq!(summary(&s), "CTID 101 exist unmounted down dump");
    }
}
