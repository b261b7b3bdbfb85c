//! Config from pushgate.json or ~/.pushgate.json (JSON). Merged with env and CLI.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PushError, Result};

pub const CONFIG_FILE: &str = "pushgate.json";
pub const DEFAULT_BIND: &str = "127.0.0.1:5080";
pub const DEFAULT_MAX_PACKAGE_BYTES: u64 = 250 * 1024 * 1024;

/// Validation policy applied by the background validator.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Policy {
    /// Maximum number of archive entries.
    pub max_entries: usize,
    /// Manifest must carry a non-empty `description`.
    pub require_description: bool,
    /// Manifest must carry a non-empty `license`.
    pub require_license: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            require_description: false,
            require_license: false,
        }
    }
}

/// Server configuration. File values are overridden by env, env by CLI flags.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub bind: String,
    pub data_dir: PathBuf,
    pub workers: usize,
    pub max_package_bytes: u64,
    /// Upper bound on bytes read from a body that is going to be rejected anyway.
    pub drain_limit_bytes: u64,
    /// Accepted API keys; empty disables push authentication.
    pub api_keys: Vec<String>,
    pub policy: Policy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            data_dir: default_data_dir(),
            workers: num_cpus::get().max(1),
            max_package_bytes: DEFAULT_MAX_PACKAGE_BYTES,
            drain_limit_bytes: DEFAULT_MAX_PACKAGE_BYTES,
            api_keys: Vec::new(),
            policy: Policy::default(),
        }
    }
}

impl Config {
    /// Config rooted at `data_dir` with every other field defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Apply `PUSHGATE_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_nonempty("PUSHGATE_BIND") {
            self.bind = v;
        }
        if let Some(v) = env_nonempty("PUSHGATE_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_nonempty("PUSHGATE_WORKERS") {
            self.workers = parse_env("PUSHGATE_WORKERS", &v)?;
        }
        if let Some(v) = env_nonempty("PUSHGATE_MAX_PACKAGE_BYTES") {
            self.max_package_bytes = parse_env("PUSHGATE_MAX_PACKAGE_BYTES", &v)?;
        }
        if let Some(v) = env_nonempty("PUSHGATE_API_KEYS") {
            self.api_keys = v
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }
        self.raise_drain_limit();
        Ok(())
    }

    /// A losing upload of any admissible size must be read to the end.
    pub fn raise_drain_limit(&mut self) {
        self.drain_limit_bytes = self.drain_limit_bytes.max(self.max_package_bytes);
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PushError::Config("workers must be at least 1".to_string()));
        }
        if self.max_package_bytes == 0 {
            return Err(PushError::Config("maxPackageBytes must be positive".to_string()));
        }
        if self.drain_limit_bytes < self.max_package_bytes {
            return Err(PushError::Config(format!(
                "drainLimitBytes ({}) must be at least maxPackageBytes ({})",
                self.drain_limit_bytes, self.max_package_bytes
            )));
        }
        if self.policy.max_entries == 0 {
            return Err(PushError::Config("policy.maxEntries must be positive".to_string()));
        }
        Ok(())
    }
}

/// Load config from pushgate.json in dir, then ~/.pushgate.json, then env.
/// A missing file means defaults; an unreadable or invalid one is an error.
pub fn load_config(dir: &Path) -> Result<Config> {
    let mut candidates = vec![dir.join(CONFIG_FILE)];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(format!(".{}", CONFIG_FILE)));
    }

    let mut cfg = Config::default();
    for path in &candidates {
        if path.is_file() {
            let s = std::fs::read_to_string(path)?;
            cfg = serde_json::from_str(&s).map_err(|e| {
                PushError::Config(format!("{}: {}", path.display(), e))
            })?;
            tracing::debug!(path = %path.display(), "loaded config file");
            cfg.raise_drain_limit();
            break;
        }
    }
    cfg.apply_env()?;
    cfg.validate()?;
    Ok(cfg)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pushgate")
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| PushError::Config(format!("{} has invalid value '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"{ "bind": "0.0.0.0:9000", "apiKeys": ["k1"], "policy": { "requireLicense": true } }"#,
        )
        .unwrap();

        let cfg = load_config(tmp.path()).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:9000");
        assert_eq!(cfg.api_keys, vec!["k1".to_string()]);
        assert!(cfg.policy.require_license);
        assert_eq!(cfg.policy.max_entries, 10_000);
        assert_eq!(cfg.max_package_bytes, DEFAULT_MAX_PACKAGE_BYTES);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "{ not json").unwrap();
        assert!(matches!(load_config(tmp.path()), Err(PushError::Config(_))));
    }

    #[test]
    fn test_large_max_package_raises_drain_limit() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"{ "maxPackageBytes": 1073741824, "drainLimitBytes": 1024 }"#,
        )
        .unwrap();

        let cfg = load_config(tmp.path()).unwrap();
        assert_eq!(cfg.max_package_bytes, 1 << 30);
        assert!(cfg.drain_limit_bytes >= cfg.max_package_bytes);
    }

    #[test]
    fn test_validate_rejects_drain_limit_below_max() {
        let mut cfg = Config::with_data_dir("/tmp/x");
        cfg.max_package_bytes = 1 << 30;
        assert!(matches!(cfg.validate(), Err(PushError::Config(_))));
        cfg.raise_drain_limit();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut cfg = Config::with_data_dir("/tmp/x");
        cfg.workers = 0;
        assert!(cfg.validate().is_err());
    }
}
