// Environment variable loading

use crate::Result;
use std::collections::HashMap;
use std::env;
use std::ffi::OsString;

/// Environment variable loader
///
/// With a prefix, only `PREFIX_*` variables are read and the prefix is
/// stripped: `APNKIT_GATEWAY_HOST` becomes `gateway_host`.
pub struct EnvLoader {
    prefix: Option<String>,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    /// Load all matching environment variables
    ///
    /// Variables whose name or value is not valid UTF-8 are skipped.
    pub fn load(&self) -> Result<HashMap<String, String>> {
        Ok(self.collect(env::vars_os()))
    }

    fn collect(&self, vars: impl IntoIterator<Item = (OsString, OsString)>) -> HashMap<String, String> {
        let mut config = HashMap::new();

        for (key, value) in vars {
            let (Ok(key), Ok(value)) = (key.into_string(), value.into_string()) else {
                continue;
            };
            match &self.prefix {
                Some(prefix) => {
                    if let Some(rest) = key.strip_prefix(prefix.as_str()) {
                        if let Some(trimmed) = rest.strip_prefix('_') {
                            config.insert(trimmed.to_lowercase(), value);
                        }
                    }
                }
                None => {
                    config.insert(key.to_lowercase(), value);
                }
            }
        }

        config
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(None)
    }
}
