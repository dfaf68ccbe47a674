use anyhow::{Context, Result};
use tracing::info;

use crate::cli::commands::RecipeArgs;
use crate::config::RecipeConfig;
use crate::recipe::LoraFinetuneRecipe;
use crate::registry::ComponentRegistry;
use crate::runtime::HostCapabilities;

fn load_config(args: &RecipeArgs) -> Result<RecipeConfig> {
    RecipeConfig::load(args.config.as_deref(), &args.overrides).with_context(|| match &args.config {
        Some(path) => format!("Failed to load configuration from {:?}", path),
        None => "Failed to load the default configuration".to_string(),
    })
}

/// Set up, train and clean up
pub fn handle_run(args: RecipeArgs) -> Result<()> {
    let config = load_config(&args)?;
    let registry = ComponentRegistry::with_defaults();
    registry.check_config(&config)?;

    let recipe = LoraFinetuneRecipe::new(config, registry, Box::new(HostCapabilities::new()))?
        .with_progress(!args.no_progress);
    let mut session = recipe.setup().context("Recipe setup failed")?;

    session.train().context("Training failed")?;
    session.cleanup()?;

    let state = session.state();
    info!(
        "Finished {} epochs at global step {}",
        state.epochs_run, state.global_step
    );
    Ok(())
}

/// Print the resolved configuration after checking every component name
pub fn handle_validate(args: RecipeArgs) -> Result<()> {
    let config = load_config(&args)?;
    ComponentRegistry::with_defaults().check_config(&config)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
