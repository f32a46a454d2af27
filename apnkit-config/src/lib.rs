// Configuration loading for apnkit

pub mod env;
pub mod error;
pub mod loader;
pub mod validation;

pub use env::EnvLoader;
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use validation::{ConfigValidator, Validate};

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Layered key/value configuration.
///
/// Later loads override earlier ones, so load defaults first, then files,
/// then the environment.
#[derive(Clone, Default)]
pub struct ConfigManager {
    config: Arc<RwLock<HashMap<String, Value>>>,
    env_prefix: Option<String>,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with environment variable prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            config: Arc::default(),
            env_prefix: Some(prefix.into()),
        }
    }

    /// Load configuration from environment variables
    pub fn load_env(&self) -> Result<()> {
        let loader = EnvLoader::new(self.env_prefix.clone());
        let env_vars = loader.load()?;

        let mut config = self.config.write();
        for (key, value) in env_vars {
            config.insert(key, Value::String(value));
        }

        Ok(())
    }

    /// Export a `.env` file into the process, then load the environment.
    ///
    /// Variables already set in the process win over the file. Without a
    /// path, a `.env` in the working directory or its parents is used if
    /// present.
    pub fn load_dotenv(&self, path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) => {
                dotenvy::from_path(path).map_err(|e| ConfigError::LoadError(e.to_string()))?;
            }
            None => match dotenvy::dotenv() {
                Ok(_) => {}
                Err(e) if e.not_found() => {}
                Err(e) => return Err(ConfigError::LoadError(e.to_string())),
            },
        }
        self.load_env()
    }

    /// Load configuration from file, detecting the format from its name
    pub fn load_file_auto(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = ConfigLoader::auto(path.as_ref())?.load_file(path)?;
        self.merge_value(data)
    }

    fn merge_value(&self, data: Value) -> Result<()> {
        let Value::Object(map) = data else {
            return Err(ConfigError::ParseError(
                "configuration root must be a table".to_string(),
            ));
        };

        let mut config = self.config.write();
        for (key, value) in map {
            config.insert(key, value);
        }
        Ok(())
    }

    /// Set a configuration value
    pub fn set<T: serde::Serialize>(&self, key: &str, value: T) -> Result<()> {
        let json_value = serde_json::to_value(value)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        self.config.write().insert(key.to_string(), json_value);
        Ok(())
    }

    /// Get a value through its `FromStr` impl.
    ///
    /// Environment variables and `.env` files only produce strings, so
    /// `"30"` and `30` both parse as a number here. Returns `None` for a
    /// missing key.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = match self.config.read().get(key) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::String(s)) => s.trim().to_string(),
            Some(other) => other.to_string(),
        };

        raw.parse().map(Some).map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}
