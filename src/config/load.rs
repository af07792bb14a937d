//! Loading a session configuration from its layers
//!
//! Precedence, lowest first:
//! 1. Built-in defaults
//! 2. Host config file (`$XDG_CONFIG_HOME/s3-netcdf/config.toml`)
//! 3. Environment (`S3_NETCDF_CACHE_*`, `S3_NETCDF_MAX_OPEN_FILES`)
//! 4. CLI overrides

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::defaults::{SessionConfig, MAX_OPEN_LIMIT};
use super::merge::{merge_layers, set_path};

/// Environment variables read as overrides, with the config path each sets.
const ENV_OVERRIDES: &[(&str, &str, EnvKind)] = &[
    ("S3_NETCDF_CACHE_ENABLED", "cache.enabled", EnvKind::Bool),
    ("S3_NETCDF_CACHE_MAX_SIZE", "cache.max_size_bytes", EnvKind::Size),
    ("S3_NETCDF_CACHE_TTL", "cache.ttl_seconds", EnvKind::Integer),
    ("S3_NETCDF_CACHE_VALIDATE_ETAG", "cache.validate_integrity_token", EnvKind::Bool),
    ("S3_NETCDF_MAX_OPEN_FILES", "handles.max_open", EnvKind::Integer),
];

#[derive(Debug, Clone, Copy)]
enum EnvKind {
    Bool,
    Integer,
    Size,
}

/// Where a layer came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Env,
    Cli,
}

/// A contributing layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,
    /// File path for file layers, variable names for env layers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: String, value: String },

    #[error("validation error: {0}")]
    Validation(String),
}

/// A merged configuration plus the layers that produced it.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: SessionConfig,
    pub sources: Vec<ConfigSource>,
}

/// Default host config path, if a config directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(s3nc_store::APP_NAME).join("config.toml"))
}

impl SessionConfig {
    /// Load from the process environment.
    ///
    /// `file` is an explicit config path (must exist); when `None`, the
    /// default host path is used if present.
    pub fn load(file: Option<&Path>, cli_overrides: Option<Value>) -> Result<LoadedConfig, ConfigError> {
        let (path, required) = match file {
            Some(path) => (Some(path.to_path_buf()), true),
            None => (default_config_path(), false),
        };
        Self::load_with(
            path.as_deref(),
            required,
            |name| std::env::var(name).ok(),
            cli_overrides,
        )
    }

    /// Load with an injectable environment lookup.
    pub fn load_with<F>(
        file: Option<&Path>,
        file_required: bool,
        env: F,
        cli_overrides: Option<Value>,
    ) -> Result<LoadedConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut layers = vec![Self::defaults_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            detail: None,
        }];

        if let Some(path) = file {
            if file_required || path.exists() {
                layers.push(load_toml_file(path)?);
                sources.push(ConfigSource {
                    origin: ConfigOrigin::File,
                    detail: Some(path.display().to_string()),
                });
            }
        }

        let (env_layer, env_names) = env_layer(&env)?;
        if !env_names.is_empty() {
            layers.push(env_layer);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Env,
                detail: Some(env_names.join(",")),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                detail: None,
            });
        }

        let merged = merge_layers(layers);
        let config: SessionConfig = serde_json::from_value(merged)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        config.validate()?;

        debug!(?sources, "session configuration loaded");
        Ok(LoadedConfig { config, sources })
    }

    /// Check value ranges the types alone don't enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handles.max_open == 0 || self.handles.max_open > MAX_OPEN_LIMIT {
            return Err(ConfigError::Validation(format!(
                "handles.max_open must be in [1, {}]",
                MAX_OPEN_LIMIT
            )));
        }
        if self.cache.lock_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "cache.lock_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn load_toml_file(path: &Path) -> Result<Value, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let table: toml::Value = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(toml_to_json(table))
}

fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

fn env_layer<F>(env: &F) -> Result<(Value, Vec<&'static str>), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut layer = Value::Null;
    let mut names = Vec::new();

    for &(name, path, kind) in ENV_OVERRIDES {
        let Some(raw) = env(name).filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        let invalid = || ConfigError::InvalidEnv {
            name: name.to_string(),
            value: raw.clone(),
        };
        let value = match kind {
            EnvKind::Bool => Value::Bool(parse_bool(&raw).ok_or_else(invalid)?),
            EnvKind::Integer => Value::from(raw.trim().parse::<u64>().map_err(|_| invalid())?),
            EnvKind::Size => Value::from(parse_size(&raw).ok_or_else(invalid)?),
        };
        set_path(&mut layer, path, value);
        names.push(name);
    }

    Ok((layer, names))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a byte count with an optional binary suffix (`K`, `M`, `G`, `T`).
fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let upper = raw.to_ascii_uppercase();
    let trimmed = upper.trim_end_matches('B').trim_end_matches('I');
    let (digits, shift) = match trimmed.chars().last()? {
        'K' => (&trimmed[..trimmed.len() - 1], 10),
        'M' => (&trimmed[..trimmed.len() - 1], 20),
        'G' => (&trimmed[..trimmed.len() - 1], 30),
        'T' => (&trimmed[..trimmed.len() - 1], 40),
        _ => (trimmed, 0),
    };
    let n: u64 = digits.trim().parse().ok()?;
    n.checked_mul(1u64 << shift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_only() {
        let loaded = SessionConfig::load_with(None, false, no_env, None).unwrap();
        assert_eq!(loaded.config, SessionConfig::default());
        assert_eq!(loaded.sources.len(), 1);
        assert_eq!(loaded.sources[0].origin, ConfigOrigin::Builtin);
    }

    #[test]
    fn test_toml_file_layer() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[cache]").unwrap();
        writeln!(file, "cache_root = \"/data/nc-cache\"").unwrap();
        writeln!(file, "ttl_seconds = 3600").unwrap();
        writeln!(file, "[scratch]").unwrap();
        writeln!(file, "ram_dirs = []").unwrap();

        let loaded = SessionConfig::load_with(Some(file.path()), true, no_env, None).unwrap();

        assert_eq!(loaded.config.cache.cache_root, Some(PathBuf::from("/data/nc-cache")));
        assert_eq!(loaded.config.cache.ttl_seconds, 3600);
        assert!(loaded.config.cache.enabled);
        assert!(loaded.config.scratch.ram_dirs.is_empty());
        assert_eq!(loaded.sources[1].origin, ConfigOrigin::File);
    }

    #[test]
    fn test_missing_optional_file_skipped() {
        let loaded = SessionConfig::load_with(
            Some(Path::new("/nonexistent/s3-netcdf/config.toml")),
            false,
            no_env,
            None,
        )
        .unwrap();
        assert_eq!(loaded.sources.len(), 1);
    }

    #[test]
    fn test_missing_required_file_is_error() {
        let result = SessionConfig::load_with(
            Some(Path::new("/nonexistent/s3-netcdf/config.toml")),
            true,
            no_env,
            None,
        );
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[cache").unwrap();

        let result = SessionConfig::load_with(Some(file.path()), true, no_env, None);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides_file_and_cli_overrides_env() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\nenabled = true\nmax_size_bytes = 100").unwrap();

        let env = env_of(&[
            ("S3_NETCDF_CACHE_ENABLED", "off"),
            ("S3_NETCDF_CACHE_MAX_SIZE", "2G"),
            ("S3_NETCDF_MAX_OPEN_FILES", "8"),
        ]);
        let cli = serde_json::json!({"handles": {"max_open": 16}});

        let loaded = SessionConfig::load_with(Some(file.path()), true, env, Some(cli)).unwrap();

        assert!(!loaded.config.cache.enabled);
        assert_eq!(loaded.config.cache.max_size_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(loaded.config.handles.max_open, 16);
        let origins: Vec<_> = loaded.sources.iter().map(|s| s.origin.clone()).collect();
        assert_eq!(
            origins,
            vec![ConfigOrigin::Builtin, ConfigOrigin::File, ConfigOrigin::Env, ConfigOrigin::Cli]
        );
    }

    #[test]
    fn test_invalid_env_value() {
        let env = env_of(&[("S3_NETCDF_CACHE_TTL", "a week")]);
        let result = SessionConfig::load_with(None, false, env, None);
        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }

    #[test]
    fn test_validation_max_open() {
        let cli = serde_json::json!({"handles": {"max_open": 0}});
        let result = SessionConfig::load_with(None, false, no_env, Some(cli));
        assert!(result.unwrap_err().to_string().contains("max_open"));
    }

    #[test]
    fn test_wrong_type_is_validation_error() {
        let cli = serde_json::json!({"cache": {"ttl_seconds": "soon"}});
        let result = SessionConfig::load_with(None, false, no_env, Some(cli));
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("4k"), Some(4096));
        assert_eq!(parse_size("10MiB"), Some(10 * 1024 * 1024));
        assert_eq!(parse_size("1GB"), Some(1 << 30));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
