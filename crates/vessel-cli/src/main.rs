mod commands;
mod logging;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::spec_args::SpecArgs;
use std::path::PathBuf;
use std::process::ExitCode;
use vessel_core::{
    install_signal_handler, Collaborators, Context, CoreError, ErrorKind, ModuleRegistry,
    Orchestrator, SetMode,
};
use vessel_schema::GlobalConfig;

#[derive(Debug, Parser)]
#[command(
    name = "vesselctl",
    version,
    about = "Control plane for OS-level containers"
)]
struct Cli {
    /// Global configuration file.
    #[arg(
        long,
        env = "VESSEL_CONF",
        default_value = vessel_schema::DEFAULT_GLOBAL_CONFIG,
        global = true
    )]
    config_file: PathBuf,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors.
    #[arg(short, long, default_value_t = false, global = true)]
    quiet: bool,

    /// Do not take the per-container lock.
    #[arg(long, default_value_t = false, global = true)]
    skiplock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a container from an OS template.
    Create {
        /// Numeric container ID.
        id: String,
        /// Config sample to install (ve-<SAMPLE>.conf-sample).
        #[arg(long = "config")]
        sample: Option<String>,
        /// Do not run guest scripts.
        #[arg(long, default_value_t = false)]
        skip_guest: bool,
        #[command(flatten)]
        spec: SpecArgs,
    },
    /// Destroy a stopped container and its private area.
    Destroy {
        /// Container ID or name.
        id: String,
    },
    /// Start a container, restoring it from a dump if one is present.
    Start {
        /// Container ID or name.
        id: String,
        /// Wait for the guest init to come up.
        #[arg(long, default_value_t = false)]
        wait: bool,
        /// Cold start even if a dump file exists.
        #[arg(long, default_value_t = false)]
        skip_restore: bool,
        /// Do not push configuration into the guest.
        #[arg(long, default_value_t = false)]
        skip_guest: bool,
    },
    /// Stop a running container.
    Stop {
        /// Container ID or name.
        id: String,
        /// Kill immediately without a graceful shutdown.
        #[arg(long, default_value_t = false)]
        fast: bool,
        /// Leave the container storage mounted.
        #[arg(long, default_value_t = false)]
        skip_umount: bool,
    },
    /// Stop (if running) and start a container.
    Restart {
        /// Container ID or name.
        id: String,
        /// Kill immediately without a graceful shutdown.
        #[arg(long, default_value_t = false)]
        fast: bool,
        /// Wait for the guest init to come up.
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Mount container storage.
    Mount {
        /// Container ID or name.
        id: String,
    },
    /// Unmount container storage.
    Umount {
        /// Container ID or name.
        id: String,
    },
    /// Change container parameters.
    Set {
        /// Container ID or name.
        id: String,
        /// Write the changes to the container config file.
        #[arg(long, default_value_t = false)]
        save: bool,
        /// What to do with changes that cannot apply to a running container.
        #[arg(long)]
        setmode: Option<SetMode>,
        /// Extension module option, as NAME or NAME=VALUE (see `vesselctl modules`).
        #[arg(short = 'o', long = "module-option", value_name = "NAME[=VALUE]")]
        module_options: Vec<String>,
        /// Do not push configuration into the guest.
        #[arg(long, default_value_t = false)]
        skip_guest: bool,
        #[command(flatten)]
        spec: SpecArgs,
    },
    /// Show container state.
    Status {
        /// Container ID or name.
        id: String,
    },
    /// List all configured containers.
    List,
    /// Open a shell inside a running container.
    Enter {
        /// Container ID or name.
        id: String,
    },
    /// Run a command inside a running container.
    Exec {
        /// Container ID or name.
        id: String,
        /// Command and arguments to run (after --).
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
    /// Checkpoint a running container.
    Chkpnt {
        /// Container ID or name.
        id: String,
        #[command(flatten)]
        step: commands::checkpoint::ChkpntStep,
        /// Dump file (defaults to DUMPDIR/Dump.<ID>).
        #[arg(long)]
        dumpfile: Option<PathBuf>,
    },
    /// Restore a container from a dump.
    Restore {
        /// Container ID or name.
        id: String,
        #[command(flatten)]
        step: commands::checkpoint::RestoreStep,
        /// Dump file (defaults to DUMPDIR/Dump.<ID>).
        #[arg(long)]
        dumpfile: Option<PathBuf>,
    },
    /// Checkpoint a container to its default dump file.
    Suspend {
        /// Container ID or name.
        id: String,
    },
    /// Restore a container from its default dump file.
    Resume {
        /// Container ID or name.
        id: String,
    },
    /// Take a snapshot of an image-backed container.
    Snapshot {
        /// Container ID or name.
        id: String,
    },
    /// Delete a snapshot.
    SnapshotDelete {
        /// Container ID or name.
        id: String,
        /// Snapshot UUID.
        uuid: String,
    },
    /// Switch an image-backed container to a snapshot.
    SnapshotSwitch {
        /// Container ID or name.
        id: String,
        /// Snapshot UUID.
        uuid: String,
    },
    /// List snapshots of an image-backed container.
    SnapshotList {
        /// Container ID or name.
        id: String,
    },
    /// Convert plain directory storage to an image.
    Convert {
        /// Container ID or name.
        id: String,
    },
    /// Describe the extension modules and their options.
    Modules,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

impl Commands {
    /// Sub-commands that may start container processes.
    fn needs_driver(&self) -> bool {
        matches!(
            self,
            Self::Start { .. }
                | Self::Restart { .. }
                | Self::Enter { .. }
                | Self::Exec { .. }
                | Self::Chkpnt { .. }
                | Self::Restore { .. }
                | Self::Suspend { .. }
                | Self::Resume { .. }
        )
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = if e.use_stderr() {
                ErrorKind::InvalidParameterSyntax.exit_code()
            } else {
                0
            };
            return ExitCode::from(code);
        }
    };

    match cli.command {
        Commands::Completions { shell } => {
            return finish(commands::completions::run::<Cli>(shell));
        }
        Commands::ManPages { ref dir } => return finish(commands::man_pages::run::<Cli>(dir)),
        _ => {}
    }

    let modules = ModuleRegistry::builtin();
    let (global, report) = match GlobalConfig::load(&cli.config_file, &modules) {
        Ok(loaded) => loaded,
        Err(e) => return finish(Err(e.into())),
    };
    logging::init(&logging::LogOptions {
        verbose: cli.verbose || global.settings.verbose,
        quiet: cli.quiet,
        level: global.settings.log_level,
        logfile: global
            .settings
            .logfile
            .clone()
            .filter(|_| global.settings.logging),
    });
    for w in &report.warnings {
        tracing::warn!("{}: {w}", cli.config_file.display());
    }
    install_signal_handler();

    if cli.command.needs_driver() && std::env::var("VESSEL_SKIP_PREREQS").as_deref() != Ok("1") {
        let missing = vessel_runtime::check_driver_prereqs(&global.settings.kernel_driver);
        if !missing.is_empty() {
            eprintln!("error: {}", vessel_runtime::format_missing(&missing));
            return ExitCode::from(ErrorKind::SystemError.exit_code());
        }
    }

    let collaborators = match Collaborators::host(&global.settings) {
        Ok(c) => c,
        Err(e) => return finish(Err(e)),
    };
    let ctx = Context::new(global, collaborators, modules).with_skip_lock(cli.skiplock);
    let orch = Orchestrator::new(ctx);
    finish(dispatch(&orch, cli.command, cli.json))
}

fn dispatch(orch: &Orchestrator, command: Commands, json: bool) -> Result<u8, CoreError> {
    match command {
        Commands::Create {
            id,
            sample,
            skip_guest,
            spec,
        } => commands::create::run(orch, &id, sample, skip_guest, &spec, json),
        Commands::Destroy { id } => commands::destroy::run(orch, &id, json),
        Commands::Start {
            id,
            wait,
            skip_restore,
            skip_guest,
        } => commands::start::run(
            orch,
            &id,
            vessel_core::StartOptions {
                wait,
                skip_restore,
                skip_guest,
            },
            json,
        ),
        Commands::Stop {
            id,
            fast,
            skip_umount,
        } => commands::stop::run(
            orch,
            &id,
            vessel_core::StopOptions { fast, skip_umount },
            json,
        ),
        Commands::Restart { id, fast, wait } => commands::restart::run(orch, &id, fast, wait, json),
        Commands::Mount { id } => commands::mount::mount(orch, &id, json),
        Commands::Umount { id } => commands::mount::umount(orch, &id, json),
        Commands::Set {
            id,
            save,
            setmode,
            module_options,
            skip_guest,
            spec,
        } => commands::set::run(
            orch,
            &id,
            &spec,
            &module_options,
            commands::set::Flags {
                save,
                mode: setmode,
                skip_guest,
            },
            json,
        ),
        Commands::Status { id } => commands::status::run(orch, &id, json),
        Commands::List => commands::list::run(orch, json),
        Commands::Enter { id } => commands::exec::enter(orch, &id),
        Commands::Exec { id, command } => commands::exec::run(orch, &id, &command, json),
        Commands::Chkpnt { id, step, dumpfile } => {
            commands::checkpoint::chkpnt(orch, &id, step.op(), dumpfile.as_deref(), json)
        }
        Commands::Restore { id, step, dumpfile } => {
            commands::checkpoint::restore(orch, &id, step.op(), dumpfile.as_deref(), json)
        }
        Commands::Suspend { id } => commands::checkpoint::suspend(orch, &id, json),
        Commands::Resume { id } => commands::checkpoint::resume(orch, &id, json),
        Commands::Snapshot { id } => commands::snapshot::create(orch, &id, json),
        Commands::SnapshotDelete { id, uuid } => commands::snapshot::delete(orch, &id, &uuid, json),
        Commands::SnapshotSwitch { id, uuid } => commands::snapshot::switch(orch, &id, &uuid, json),
        Commands::SnapshotList { id } => commands::snapshot::list(orch, &id, json),
        Commands::Convert { id } => commands::convert::run(orch, &id, json),
        Commands::Modules => commands::modules::run(orch, json),
        Commands::Completions { .. } | Commands::ManPages { .. } => Ok(commands::EXIT_SUCCESS),
    }
}

fn finish(result: Result<u8, CoreError>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::debug!("{e:?}");
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
