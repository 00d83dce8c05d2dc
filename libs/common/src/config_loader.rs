//! Layered configuration loading
//!
//! Sources are merged lowest to highest priority:
//! built-in defaults, then the config file (YAML, TOML or JSON by extension),
//! then environment variables under a service prefix.

use crate::Result;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Separator for nested keys in environment variables
/// (`ALARMSRV_MODEM__PORT` sets `modem.port`)
pub const ENV_SPLIT: &str = "__";

/// Build the figment for `T` without extracting it
pub fn figment_for<T: Serialize + Default>(path: Option<&Path>, env_prefix: &str) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            figment = match ext.as_deref() {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Yaml::file(path)),
            };
        } else {
            warn!(
                "Config file {} not found, using defaults and environment",
                path.display()
            );
        }
    }

    figment.merge(Env::prefixed(env_prefix).split(ENV_SPLIT))
}

/// Load configuration `T` from defaults, an optional file and the environment
pub fn load_layered<T>(path: Option<&Path>, env_prefix: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    Ok(figment_for::<T>(path, env_prefix).extract()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        name: String,
        port: u16,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                name: "default".to_string(),
                port: 1,
            }
        }
    }

    #[test]
    fn test_defaults_when_no_file() {
        let sample: Sample = load_layered(None, "COMMON_TEST_NOFILE_").unwrap();
        assert_eq!(sample, Sample::default());
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "port: 8080").unwrap();

        let sample: Sample = load_layered(Some(file.path()), "COMMON_TEST_YAML_").unwrap();
        assert_eq!(sample.port, 8080);
        assert_eq!(sample.name, "default");
    }

    #[test]
    fn test_missing_file_falls_back() {
        let path = Path::new("/nonexistent/aquawatch.yaml");
        let sample: Sample = load_layered(Some(path), "COMMON_TEST_MISSING_").unwrap();
        assert_eq!(sample, Sample::default());
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "port = \"not a number\"").unwrap();

        let err = load_layered::<Sample>(Some(file.path()), "COMMON_TEST_BAD_").unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.starts_with("Failed to load configuration")));
    }
}
