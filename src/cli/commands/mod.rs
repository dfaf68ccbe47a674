//! Command definitions for the `kdtune` binary

pub mod recipe;

pub use recipe::{LoggingOptions, RecipeArgs};

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Set up the recipe, train for every configured epoch, then clean up
    Run(RecipeArgs),
    /// Load and validate a configuration, then print it resolved as JSON
    Validate(RecipeArgs),
}

impl Commands {
    pub fn logging(&self) -> &LoggingOptions {
        match self {
            Commands::Run(args) | Commands::Validate(args) => &args.logging,
        }
    }
}
