use super::{print_action, resolve, with_spinner, EXIT_SUCCESS};
use clap::Args;
use std::path::Path;
use vessel_core::{CoreError, Orchestrator};
use vessel_runtime::{CheckpointOp, RestoreOp};

/// Single checkpoint step; none of them means the full sequence.
#[derive(Debug, Default, Args)]
#[group(multiple = false)]
pub struct ChkpntStep {
    /// Only freeze the container.
    #[arg(long)]
    suspend: bool,
    /// Only dump a frozen container.
    #[arg(long)]
    dump: bool,
    /// Thaw a frozen container.
    #[arg(long)]
    resume: bool,
    /// Kill a frozen container.
    #[arg(long)]
    kill: bool,
}

impl ChkpntStep {
    pub fn op(&self) -> CheckpointOp {
        if self.suspend {
            CheckpointOp::Suspend
        } else if self.dump {
            CheckpointOp::Dump
        } else if self.resume {
            CheckpointOp::Resume
        } else if self.kill {
            CheckpointOp::Kill
        } else {
            CheckpointOp::Full
        }
    }
}

#[derive(Debug, Default, Args)]
#[group(multiple = false)]
pub struct RestoreStep {
    /// Only rebuild the container from the dump, leaving it frozen.
    #[arg(long)]
    undump: bool,
    /// Thaw an undumped container.
    #[arg(long)]
    resume: bool,
    /// Kill an undumped container.
    #[arg(long)]
    kill: bool,
}

impl RestoreStep {
    pub fn op(&self) -> RestoreOp {
        if self.undump {
            RestoreOp::Undump
        } else if self.resume {
            RestoreOp::Resume
        } else if self.kill {
            RestoreOp::Kill
        } else {
            RestoreOp::Full
        }
    }
}

pub fn chkpnt(
    orch: &Orchestrator,
    id: &str,
    op: CheckpointOp,
    dumpfile: Option<&Path>,
    json: bool,
) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    with_spinner(
        json,
        &format!("checkpointing container {id}..."),
        &format!("container {id} checkpointed"),
        || orch.chkpnt(id, op, dumpfile),
    )?;
    if json {
        return print_action(id, "checkpointed");
    }
    Ok(EXIT_SUCCESS)
}

pub fn restore(
    orch: &Orchestrator,
    id: &str,
    op: RestoreOp,
    dumpfile: Option<&Path>,
    json: bool,
) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    with_spinner(
        json,
        &format!("restoring container {id}..."),
        &format!("container {id} restored"),
        || orch.restore(id, op, dumpfile),
    )?;
    if json {
        return print_action(id, "restored");
    }
    Ok(EXIT_SUCCESS)
}

pub fn suspend(orch: &Orchestrator, id: &str, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    with_spinner(
        json,
        &format!("suspending container {id}..."),
        &format!("container {id} suspended"),
        || orch.suspend(id),
    )?;
    if json {
        return print_action(id, "suspended");
    }
    Ok(EXIT_SUCCESS)
}

pub fn resume(orch: &Orchestrator, id: &str, json: bool) -> Result<u8, CoreError> {
    let id = resolve(orch, id)?;
    with_spinner(
        json,
        &format!("resuming container {id}..."),
        &format!("container {id} resumed"),
        || orch.resume(id),
    )?;
    if json {
        return print_action(id, "resumed");
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flag_means_full_sequence() {
        assert_eq!(ChkpntStep::default().op(), CheckpointOp::Full);
        assert_eq!(RestoreStep::default().op(), RestoreOp::Full);
    }

    #[test]
    fn flags_select_one_step() {
        let step = ChkpntStep {
            dump: true,
            ..ChkpntStep::default()
        };
        assert_eq!(step.op(), CheckpointOp::Dump);
        let step = RestoreStep {
            kill: true,
            ..RestoreStep::default()
        };
        assert_eq!(step.op(), RestoreOp::Kill);
    }
}
