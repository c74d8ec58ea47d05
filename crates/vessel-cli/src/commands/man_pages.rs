use super::EXIT_SUCCESS;
use clap::CommandFactory;
use std::path::Path;
use vessel_core::CoreError;

fn render(cmd: clap::Command, dir: &Path, name: &str) -> Result<(), CoreError> {
    let mut buf = Vec::new();
    clap_mangen::Man::new(cmd).render(&mut buf)?;
    std::fs::write(dir.join(format!("{name}.1")), &buf)?;
    Ok(())
}

pub fn run<C: CommandFactory>(dir: &Path) -> Result<u8, CoreError> {
    std::fs::create_dir_all(dir)?;
    let cmd = C::command();
    for sub in cmd.get_subcommands() {
        render(sub.clone(), dir, &format!("vesselctl-{}", sub.get_name()))?;
    }
    render(cmd, dir, "vesselctl")?;
    println!("man pages written to {}", dir.display());
    Ok(EXIT_SUCCESS)
}
