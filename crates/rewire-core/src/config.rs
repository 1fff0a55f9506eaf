use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Get the local data directory for rewire.
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn get_data_dir() -> Result<PathBuf> {
    let mut path =
        dirs::data_local_dir().ok_or_else(|| anyhow::anyhow!("Failed to get local data dir"))?;
    path.push("rewire");
    Ok(path)
}

/// Default location of `config.toml`
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("config.toml"))
}

/// Economic tunables of the budget engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Units added at every day boundary (1800 = 30 minutes at 1.0x)
    pub daily_allowance_units: i64,
    pub base_wait_seconds: u32,
    /// Cost factor relief per decay step
    pub decay_step: f64,
    /// Scales within-session escalation
    pub grace_multiplier: f64,
    /// Compulsion clamp applied while the day has fewer than `day_one_sessions`
    pub day_one_cap: f64,
    pub day_one_sessions: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_allowance_units: 1800,
            base_wait_seconds: 30,
            decay_step: 0.25,
            grace_multiplier: 1.0,
            day_one_cap: 0.3,
            day_one_sessions: 3,
        }
    }
}

/// A browser whose address bar can be read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub package: String,
    /// View ids of the address bar, tried in order
    pub address_bar_ids: Vec<String>,
}

impl BrowserConfig {
    fn new(package: &str, ids: &[&str]) -> Self {
        Self {
            package: package.to_string(),
            address_bar_ids: ids.iter().map(|id| format!("{package}:id/{id}")).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub foreground_debounce_ms: i64,
    pub url_stable_ms: i64,
    /// Package of the firewall itself; its events are always noise
    pub own_package: String,
    /// Input methods and system overlays discovered by the host at startup
    pub transient_packages: Vec<String>,
    /// Home launchers discovered by the host at startup
    pub launcher_packages: Vec<String>,
    pub browsers: Vec<BrowserConfig>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            foreground_debounce_ms: 300,
            url_stable_ms: 800,
            own_package: String::from("com.example.modernhabitrewire"),
            transient_packages: Vec::new(),
            launcher_packages: Vec::new(),
            browsers: vec![
                BrowserConfig::new("com.android.chrome", &["url_bar", "url_edit_text"]),
                BrowserConfig::new(
                    "com.brave.browser",
                    &["url_bar", "url_edit_text", "location_bar"],
                ),
                BrowserConfig::new(
                    "org.mozilla.firefox",
                    &["mozac_browser_toolbar_url_view", "url_bar_title"],
                ),
                BrowserConfig::new("com.opera.browser", &["url_field"]),
                BrowserConfig::new("com.duckduckgo.mobile.android", &["omnibarTextInput"]),
                BrowserConfig::new("com.microsoft.emmx", &["url_bar"]),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum spacing between URL-triggered gate requests
    pub gate_cooldown_ms: i64,
    /// Live exhaustion re-check period while a forbidden segment is open
    pub tick_interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            gate_cooldown_ms: 5000,
            tick_interval_ms: 1000,
        }
    }
}

/// Full engine configuration, read from `config.toml`.
///
/// Every field has a default, so a missing or partial file is valid.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub budget: BudgetConfig,
    pub classifier: ClassifierConfig,
    pub tracker: TrackerConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to defaults when absent
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    /// Load from the default location
    ///
    /// # Errors
    ///
    /// Returns an error if the data dir is unknown or the file is malformed
    pub fn load_default() -> Result<Self> {
        Self::load(&default_config_path()?)
    }

    /// Write configuration as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        std::fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Render as pretty TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Look up a dotted key such as `budget.daily_allowance_units`
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be converted to a TOML tree
    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        let tree = toml::Value::try_from(self).context("Failed to serialize config")?;
        let mut node = &tree;
        for part in key.split('.') {
            match node.get(part) {
                Some(next) => node = next,
                None => return Ok(None),
            }
        }
        Ok(Some(match node {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        }))
    }

    /// Set a dotted scalar key, validating the result against the schema
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the value has the wrong type
    pub fn set_value(&mut self, key: &str, raw: &str) -> Result<()> {
        let mut tree = toml::Value::try_from(&*self).context("Failed to serialize config")?;
        let (path, leaf) = key
            .rsplit_once('.')
            .ok_or_else(|| anyhow::anyhow!("Key must be qualified, e.g. budget.{key}"))?;

        let mut node = &mut tree;
        for part in path.split('.') {
            node = node
                .get_mut(part)
                .ok_or_else(|| anyhow::anyhow!("Unknown config section: {part}"))?;
        }
        let table = node
            .as_table_mut()
            .ok_or_else(|| anyhow::anyhow!("{path} is not a section"))?;
        let current = table
            .get(leaf)
            .ok_or_else(|| anyhow::anyhow!("Unknown config key: {key}"))?;

        let value = match current {
            toml::Value::Integer(_) => toml::Value::Integer(
                raw.parse()
                    .with_context(|| format!("{key} expects an integer"))?,
            ),
            toml::Value::Float(_) => {
                toml::Value::Float(raw.parse().with_context(|| format!("{key} expects a number"))?)
            }
            toml::Value::Boolean(_) => toml::Value::Boolean(
                raw.parse()
                    .with_context(|| format!("{key} expects true or false"))?,
            ),
            toml::Value::String(_) => toml::Value::String(raw.to_string()),
            _ => anyhow::bail!("{key} is not a scalar; edit config.toml directly"),
        };
        table.insert(leaf.to_string(), value);

        *self = tree.try_into().context("Config rejected after update")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[budget]\ndaily_allowance_units = 600\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.budget.daily_allowance_units, 600);
        assert_eq!(config.budget.base_wait_seconds, 30);
        assert_eq!(config.classifier.url_stable_ms, 800);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = EngineConfig::default();
        config.tracker.gate_cooldown_ms = 1234;
        config.save(&path).unwrap();

        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_get_and_set_dotted_keys() {
        let mut config = EngineConfig::default();
        assert_eq!(
            config.get_value("budget.decay_step").unwrap().as_deref(),
            Some("0.25")
        );
        assert_eq!(config.get_value("budget.nope").unwrap(), None);

        config.set_value("budget.decay_step", "0.5").unwrap();
        assert!((config.budget.decay_step - 0.5).abs() < f64::EPSILON);

        config.set_value("classifier.own_package", "org.rewire").unwrap();
        assert_eq!(config.classifier.own_package, "org.rewire");
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = EngineConfig::default();
        assert!(config.set_value("budget.base_wait_seconds", "soon").is_err());
        assert!(config.set_value("budget.unknown", "1").is_err());
        assert!(config.set_value("classifier.browsers", "x").is_err());
        assert!(config.set_value("decay_step", "1").is_err());
    }

    #[test]
    fn test_default_browsers_use_qualified_view_ids() {
        let config = ClassifierConfig::default();
        let chrome = &config.browsers[0];
        assert_eq!(chrome.package, "com.android.chrome");
        assert_eq!(chrome.address_bar_ids[0], "com.android.chrome:id/url_bar");
    }
}
