//! kdtune binary.
//!
//! Entry point for the single-device LoRA/DoRA fine-tuning recipe.

use clap::Parser;
use kdtune_core::cli::{commands::Commands, handle_run, handle_validate};
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let logging = cli.command.logging().clone();

    let filter = || {
        EnvFilter::builder()
            .with_default_directive(
                logging
                    .get_effective_level()
                    .parse()
                    .unwrap_or(Level::INFO)
                    .into(),
            )
            .parse_lossy(logging.log_filter.as_deref().unwrap_or(""))
    };

    let console = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(filter());

    // Keep the guard alive so buffered file logs are flushed on exit
    let _guard = match &logging.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("--log-file must name a file: {:?}", path))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(filter());
            tracing_subscriber::registry().with(console).with(file).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(console).init();
            None
        }
    };

    info!("kdtune starting up");

    match cli.command {
        Commands::Run(args) => handle_run(args)?,
        Commands::Validate(args) => handle_validate(args)?,
    }

    Ok(())
}
