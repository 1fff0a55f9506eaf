//! First-time setup: database and a default config file

use anyhow::Result;
use rewire_core::config::{default_config_path, EngineConfig};
use rewire_storage::Database;

/// Initialize rewire
///
/// # Errors
///
/// Returns an error if the database or config file cannot be created
pub fn init_command() -> Result<()> {
    println!("Initializing Rewire...\n");

    println!("Step 1/2: Database Setup");
    println!("{}", "-".repeat(40));
    let db = Database::new(None)?;
    let settings = db.get_settings()?;
    let state = db.get_budget_state()?;
    println!("Database ready.");
    println!(
        "  {} extractive app(s), {} URL pattern(s), {} DU in the budget",
        settings.extractive_apps.len(),
        settings.forbidden_urls.len(),
        state.remaining_units
    );

    println!("\nStep 2/2: Configuration");
    println!("{}", "-".repeat(40));
    let config_path = default_config_path()?;
    if config_path.exists() {
        println!("Keeping existing config at: {}", config_path.display());
        // Fails loudly on a malformed file before the daemon trips over it
        EngineConfig::load(&config_path)?;
    } else {
        EngineConfig::default().save(&config_path)?;
        println!("Default config written to: {}", config_path.display());
    }

    println!("\n========================================");
    println!("  Setup Complete!");
    println!("========================================");
    println!("\nAdd apps with 'rewire apps add <package>', then 'rewire start'.");

    Ok(())
}
