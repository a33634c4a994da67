// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session configuration
//!
//! Values come from built-in defaults, optionally a JSON file, and finally
//! the session environment, in that order of increasing precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cpufs_gateway::GatewayConfig;
use serde::{Deserialize, Serialize};

/// Session secret; removed from the environment once read.
pub const NONCE_ENV: &str = "CPUNONCE";
pub const NAMESPACE_ENV: &str = "CPU_NAMESPACE";
pub const FUSE_ENV: &str = "CPUD_FUSE";
pub const MSIZE_ENV: &str = "CPUD_MSIZE";
pub const LOOKUP_TTL_ENV: &str = "CPUD_LOOKUP_TTL_MS";
pub const ATTR_TTL_ENV: &str = "CPUD_ATTR_TTL_MS";
pub const KEEP_CACHE_ENV: &str = "CPUD_KEEP_CACHE";
pub const PORT_ENV: &str = "CPUD_PORT9P";
pub const TMP_MNT_ENV: &str = "CPUD_TMPMNT";
pub const USER_ENV: &str = "USER";

/// Read access to the session environment.
#[cfg_attr(test, mockall::automock)]
pub trait Environment {
    fn get(&self, key: &str) -> Option<String>;

    /// Read `key` and remove it from the environment.
    fn take(&self, key: &str) -> Option<String>;
}

/// The process environment.
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn take(&self, key: &str) -> Option<String> {
        let value = std::env::var(key).ok()?;
        std::env::remove_var(key);
        Some(value)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// How the remote tree reaches the local namespace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServeMode {
    /// The kernel's own 9p client speaks to the server.
    #[default]
    KernelNative,
    /// A FUSE mount backed by the gateway.
    Gateway,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheConfig {
    pub lookup_ttl_ms: u64,
    pub attr_ttl_ms: u64,
    pub keep_page_cache: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { lookup_ttl_ms: 5000, attr_ttl_ms: 5000, keep_page_cache: false }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionConfig {
    pub mode: ServeMode,
    /// msize for the kernel-native mount.
    pub msize: u32,
    /// msize the gateway's client negotiates.
    pub gateway_msize: u32,
    pub port9p: String,
    pub tmp_mnt: PathBuf,
    /// User name presented to the server.
    pub user: String,
    /// Extra options appended to the kernel mount data.
    pub mount_options: Option<String>,
    /// `local[=remote]` elements separated by colons.
    pub namespace: String,
    pub cache: CacheConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: ServeMode::KernelNative,
            msize: 1024 * 1024,
            gateway_msize: 128 * 1024,
            port9p: "17010".to_string(),
            tmp_mnt: PathBuf::from("/tmp"),
            user: "nouser".to_string(),
            mount_options: None,
            namespace: String::new(),
            cache: CacheConfig::default(),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid { key, value })
}

fn parse_flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => Ok(false),
        "1" | "true" | "yes" | "on" => Ok(true),
        _ => Err(ConfigError::Invalid { key, value }),
    }
}

impl SessionConfig {
    /// Defaults overridden by the environment.
    pub fn from_env(env: &dyn Environment) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(env)?;
        Ok(config)
    }

    /// A JSON file overridden by the environment.
    pub fn load(path: &Path, env: &dyn Environment) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let mut config: Self = serde_json::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.apply_env(env)?;
        Ok(config)
    }

    pub fn apply_env(&mut self, env: &dyn Environment) -> Result<(), ConfigError> {
        if env.get(FUSE_ENV).is_some_and(|v| !v.is_empty()) {
            self.mode = ServeMode::Gateway;
        }
        if let Some(v) = env.get(MSIZE_ENV) {
            self.msize = parse(MSIZE_ENV, v)?;
        }
        if let Some(v) = env.get(LOOKUP_TTL_ENV) {
            self.cache.lookup_ttl_ms = parse(LOOKUP_TTL_ENV, v)?;
        }
        if let Some(v) = env.get(ATTR_TTL_ENV) {
            self.cache.attr_ttl_ms = parse(ATTR_TTL_ENV, v)?;
        }
        if let Some(v) = env.get(KEEP_CACHE_ENV) {
            self.cache.keep_page_cache = parse_flag(KEEP_CACHE_ENV, v)?;
        }
        if let Some(v) = env.get(PORT_ENV).filter(|v| !v.is_empty()) {
            self.port9p = v;
        }
        if let Some(v) = env.get(TMP_MNT_ENV).filter(|v| !v.is_empty()) {
            self.tmp_mnt = PathBuf::from(v);
        }
        if let Some(v) = env.get(USER_ENV).filter(|v| !v.is_empty()) {
            self.user = v;
        }
        if let Some(v) = env.get(NAMESPACE_ENV) {
            self.namespace = v;
        }
        Ok(())
    }

    /// Where the remote tree is mounted.
    pub fn mount_target(&self) -> PathBuf {
        self.tmp_mnt.join("cpu")
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            lookup_ttl: Duration::from_millis(self.cache.lookup_ttl_ms),
            attr_ttl: Duration::from_millis(self.cache.attr_ttl_ms),
            keep_page_cache: self.cache.keep_page_cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_with(vars: &[(&'static str, &'static str)]) -> MockEnvironment {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let mut env = MockEnvironment::new();
        env.expect_get().returning(move |key| vars.get(key).cloned());
        env
    }

    #[test]
    fn defaults_match_cpud() {
        let config = SessionConfig::from_env(&env_with(&[])).unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.msize, 1_048_576);
        assert_eq!(config.gateway_msize, 131_072);
        assert_eq!(config.mount_target(), PathBuf::from("/tmp/cpu"));
        assert_eq!(config.gateway_config(), GatewayConfig::default());
    }

    #[test]
    fn environment_overrides_defaults() {
        let env = env_with(&[
            (FUSE_ENV, "1"),
            (MSIZE_ENV, "65536"),
            (LOOKUP_TTL_ENV, "250"),
            (KEEP_CACHE_ENV, "true"),
            (PORT_ENV, "5640"),
            (TMP_MNT_ENV, "/run/cpu"),
            (USER_ENV, "glenda"),
            (NAMESPACE_ENV, "/bin:/lib"),
        ]);
        let config = SessionConfig::from_env(&env).unwrap();
        assert_eq!(config.mode, ServeMode::Gateway);
        assert_eq!(config.msize, 65536);
        assert_eq!(config.cache.lookup_ttl_ms, 250);
        assert_eq!(config.cache.attr_ttl_ms, 5000);
        assert!(config.cache.keep_page_cache);
        assert_eq!(config.port9p, "5640");
        assert_eq!(config.mount_target(), PathBuf::from("/run/cpu/cpu"));
        assert_eq!(config.user, "glenda");
        assert_eq!(config.namespace, "/bin:/lib");
    }

    #[test]
    fn empty_fuse_variable_keeps_kernel_mode() {
        let config = SessionConfig::from_env(&env_with(&[(FUSE_ENV, "")])).unwrap();
        assert_eq!(config.mode, ServeMode::KernelNative);
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = SessionConfig::from_env(&env_with(&[(MSIZE_ENV, "lots")])).unwrap_err();
        assert_eq!(err.to_string(), "invalid value \"lots\" for CPUD_MSIZE");
    }

    #[test]
    fn json_file_is_overridden_by_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            r#"{ "mode": "gateway", "user": "file-user", "cache": { "attr-ttl-ms": 10 } }"#,
        )
        .unwrap();
        let config = SessionConfig::load(&path, &env_with(&[(USER_ENV, "env-user")])).unwrap();
        assert_eq!(config.mode, ServeMode::Gateway);
        assert_eq!(config.user, "env-user");
        assert_eq!(config.cache.attr_ttl_ms, 10);
        assert_eq!(config.cache.lookup_ttl_ms, 5000);
    }
}
