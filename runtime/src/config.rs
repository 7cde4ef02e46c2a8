//! Host configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Environment variable naming the wasm module to load.
pub const ENV_MODULE_PATH: &str = "CHAINCODE_WASM_FILE";
/// Environment variable overriding [`HostConfig::pool_size`].
pub const ENV_POOL_SIZE: &str = "CHAINCODE_POOL_SIZE";
/// Environment variable overriding [`HostConfig::acquire_timeout`], in milliseconds.
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "CHAINCODE_ACQUIRE_TIMEOUT_MS";

/// Configuration for a chaincode host.
///
/// ```
/// use wasmcc_runtime::HostConfig;
///
/// let config: HostConfig = serde_json::from_str(r#"{"pool_size": 4}"#).unwrap();
/// assert_eq!(config.pool_size, 4);
/// assert_eq!(config.acquire_timeout, HostConfig::default().acquire_timeout);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Wasm module implementing the chaincode.
    pub module_path: Option<PathBuf>,

    /// Number of pooled wasm instances.
    pub pool_size: usize,

    /// How long a transaction waits for a free instance.
    #[serde(rename = "acquire_timeout_ms", with = "millis")]
    pub acquire_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            module_path: None,
            pool_size: 10,
            acquire_timeout: Duration::from_millis(10),
        }
    }
}

impl HostConfig {
    /// Defaults overlaid with the `CHAINCODE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`, keyed by env var name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_MODULE_PATH) {
            config.module_path = Some(PathBuf::from(path));
        }
        if let Some(size) = lookup(ENV_POOL_SIZE) {
            config.pool_size = parse_number(ENV_POOL_SIZE, &size)?;
        }
        if let Some(ms) = lookup(ENV_ACQUIRE_TIMEOUT_MS) {
            config.acquire_timeout =
                Duration::from_millis(parse_number(ENV_ACQUIRE_TIMEOUT_MS, &ms)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| RuntimeError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(RuntimeError::Config("pool_size must be at least 1".to_string()));
        }
        Ok(())
    }

    /// The module path, or a configuration error if none was given.
    pub fn require_module_path(&self) -> Result<&Path> {
        self.module_path.as_deref().ok_or_else(|| {
            RuntimeError::Config(format!("no wasm module configured (set {})", ENV_MODULE_PATH))
        })
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| RuntimeError::Config(format!("{}={:?}: {}", name, value, e)))
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collection_literals::btree;
    use std::collections::BTreeMap;
    use std::io::Write;

    fn lookup(vars: BTreeMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |name| vars.get(name).map(|v| v.to_string())
    }

    #[test]
    fn defaults() {
        let config = HostConfig::default();
        assert_eq!(config.module_path, None);
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.acquire_timeout, Duration::from_millis(10));
    }

    #[test]
    fn env_overrides() {
        let vars: BTreeMap<&'static str, &'static str> = btree! {
            ENV_MODULE_PATH => "/opt/chaincode/contract.wasm",
            ENV_POOL_SIZE => "4",
            ENV_ACQUIRE_TIMEOUT_MS => "250",
        };
        let config = HostConfig::from_lookup(lookup(vars)).unwrap();
        assert_eq!(
            config.module_path,
            Some(PathBuf::from("/opt/chaincode/contract.wasm"))
        );
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
    }

    #[test]
    fn env_unset_keeps_defaults() {
        let config = HostConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn malformed_env_number() {
        let vars: BTreeMap<&'static str, &'static str> = btree! { ENV_POOL_SIZE => "ten" };
        let err = HostConfig::from_lookup(lookup(vars)).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(ref m) if m.contains(ENV_POOL_SIZE)));
    }

    #[test]
    fn zero_pool_size_rejected() {
        let vars: BTreeMap<&'static str, &'static str> = btree! { ENV_POOL_SIZE => "0" };
        assert!(matches!(
            HostConfig::from_lookup(lookup(vars)),
            Err(RuntimeError::Config(_))
        ));
    }

    #[test]
    fn json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"module_path": "cc.wasm", "pool_size": 3, "acquire_timeout_ms": 1500}}"#
        )
        .unwrap();

        let config = HostConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.module_path, Some(PathBuf::from("cc.wasm")));
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.acquire_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn json_file_partial_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"pool_size": 2}}"#).unwrap();

        let config = HostConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.acquire_timeout, Duration::from_millis(10));
        assert_eq!(config.module_path, None);
    }

    #[test]
    fn json_file_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "pool_size = 2").unwrap();
        assert!(matches!(
            HostConfig::from_json_file(file.path()),
            Err(RuntimeError::Config(_))
        ));
    }

    #[test]
    fn json_file_missing() {
        assert!(matches!(
            HostConfig::from_json_file("/nonexistent/wasmcc.json"),
            Err(RuntimeError::Io(_))
        ));
    }

    #[test]
    fn serializes_timeout_as_millis() {
        let json = serde_json::to_value(HostConfig::default()).unwrap();
        assert_eq!(json["acquire_timeout_ms"], 10);
        assert_eq!(json["pool_size"], 10);
    }

    #[test]
    fn require_module_path() {
        assert!(matches!(
            HostConfig::default().require_module_path(),
            Err(RuntimeError::Config(_))
        ));
        let config = HostConfig {
            module_path: Some(PathBuf::from("cc.wasm")),
            ..HostConfig::default()
        };
        assert_eq!(config.require_module_path().unwrap(), Path::new("cc.wasm"));
    }
}
