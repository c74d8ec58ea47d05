use super::spec_args::SpecArgs;
use super::{print_action, with_spinner, EXIT_SUCCESS};
use vessel_core::{CoreError, CreateOptions, Orchestrator};
use vessel_schema::ContainerId;

pub fn run(
    orch: &Orchestrator,
    id: &str,
    sample: Option<String>,
    skip_guest: bool,
    spec: &SpecArgs,
    json: bool,
) -> Result<u8, CoreError> {
    let id: ContainerId = id.parse()?;
    let opts = CreateOptions {
        cmd: spec.to_spec()?,
        sample,
        skip_guest,
    };
    with_spinner(
        json,
        &format!("creating container {id}..."),
        &format!("created container {id}"),
        || orch.create(id, opts),
    )?;
    if json {
        return print_action(id, "created");
    }
    Ok(EXIT_SUCCESS)
}
