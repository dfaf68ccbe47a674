use clap::Args;
use std::path::PathBuf;

/// Logging flags shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Filter directives, e.g. "kdtune_core=debug"
    #[arg(long = "log-filter", env = "KDTUNE_LOG")]
    pub log_filter: Option<String>,

    /// Also write logs to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

impl LoggingOptions {
    pub fn get_effective_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RecipeArgs {
    /// Recipe configuration file (TOML) layered over the built-in defaults
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Overrides in key=value form, e.g. optimizer.lr=1e-4
    #[arg(value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Hide the per-epoch progress bar
    #[arg(long = "no-progress")]
    pub no_progress: bool,

    #[command(flatten)]
    pub logging: LoggingOptions,
}
