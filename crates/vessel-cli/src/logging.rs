use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive; wins over every
/// other source.
pub const LOG_ENV: &str = "VESSEL_LOG";

#[derive(Debug, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub quiet: bool,
    /// `LOG_LEVEL` from the global config, 0..=3.
    pub level: u8,
    /// Also append events here.
    pub logfile: Option<PathBuf>,
}

fn default_level(opts: &LogOptions) -> &'static str {
    if opts.verbose {
        return "debug";
    }
    if opts.quiet {
        return "error";
    }
    match opts.level {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    }
}

pub fn init(opts: &LogOptions) {
    let level = default_level(opts);
    let filter = || EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = opts.logfile.as_ref().and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(filter()),
            ),
            Err(e) => {
                eprintln!("warning: cannot open log file {}: {e}", path.display());
                None
            }
        }
    });

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr)
                .with_filter(filter()),
        )
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_level() {
        let mut opts = LogOptions {
            level: 2,
            ..LogOptions::default()
        };
        assert_eq!(default_level(&opts), "info");
        opts.quiet = true;
        assert_eq!(default_level(&opts), "error");
        opts.verbose = true;
        assert_eq!(default_level(&opts), "debug");
    }

    #[test]
    fn config_levels_map_to_filters() {
        let levels: Vec<_> = (0..=5)
            .map(|level| {
                default_level(&LogOptions {
                    level,
                    ..LogOptions::default()
                })
            })
            .collect();
        assert_eq!(levels, ["error", "warn", "info", "debug", "debug", "debug"]);
    }
}
