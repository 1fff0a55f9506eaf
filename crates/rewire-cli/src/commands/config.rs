/// Configuration management command handlers
use anyhow::Result;
use rewire_core::config::{default_config_path, EngineConfig};

pub fn handle_config_get(key: &str) -> Result<()> {
    let config = EngineConfig::load_default()?;
    match config.get_value(key)? {
        Some(v) => println!("{key} = {v}"),
        None => println!("{key} is not set"),
    }
    Ok(())
}

pub fn handle_config_set(key: &str, value: &str) -> Result<()> {
    let path = default_config_path()?;
    let mut config = EngineConfig::load(&path)?;
    config.set_value(key, value)?;
    config.save(&path)?;
    println!("Set {key} = {value}");
    println!("Restart the daemon to apply.");
    Ok(())
}

pub fn handle_config_list() -> Result<()> {
    let path = default_config_path()?;
    let config = EngineConfig::load(&path)?;
    println!("# {}", path.display());
    println!("{}", config.to_toml()?);
    Ok(())
}
