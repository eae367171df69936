//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use crate::config::schema::AppConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "NEWSLETTERD_";

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load configuration from an optional TOML file, apply `NEWSLETTERD_*`
/// environment overrides, and validate the result.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    load_config_with_env(path, std::env::vars())
}

/// Like [`load_config`] with an explicit environment.
pub fn load_config_with_env<I>(path: Option<&Path>, vars: I) -> Result<AppConfig, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut table = match path {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            toml::from_str::<toml::Table>(&content)?
        }
        None => toml::Table::new(),
    };

    apply_env_overrides(&mut table, vars);

    let config: AppConfig = toml::Value::Table(table).try_into()?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Merge `NEWSLETTERD_SECTION__KEY=value` variables into the table.
///
/// The prefix is stripped, the rest is lowercased and `__` separates
/// path segments. Values are typed as bool, integer or float when they
/// parse as one, otherwise they are strings.
pub fn apply_env_overrides<I>(table: &mut toml::Table, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, raw) in vars {
        let Some(stripped) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path: Vec<String> = stripped
            .to_lowercase()
            .split("__")
            .map(str::to_string)
            .collect();
        if path.iter().any(|segment| segment.is_empty()) {
            continue;
        }

        tracing::debug!(key = %key, "Applying environment override");
        set_path(table, &path, env_value(&raw));
    }
}

fn set_path(table: &mut toml::Table, path: &[String], value: toml::Value) {
    let (last, parents) = match path.split_last() {
        Some(split) => split,
        None => return,
    };

    let mut current = table;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if !entry.is_table() {
            *entry = toml::Value::Table(toml::Table::new());
        }
        current = match entry {
            toml::Value::Table(t) => t,
            _ => return,
        };
    }
    current.insert(last.clone(), value);
}

fn env_value(raw: &str) -> toml::Value {
    if let Ok(b) = raw.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(raw.to_string())
}

/// Write a sample configuration file, refusing to overwrite an existing one.
pub fn write_sample_config(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path.display().to_string()));
    }
    let content = toml::to_string_pretty(&AppConfig::default())?;
    fs::write(path, content)?;
    Ok(())
}
