use std::env;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::extract::KeyPolicy;
use crate::retry::RetryPolicy;

pub const DEFAULT_BATCH_SIZE: usize = 2000;

/// Where the graph store lives and how to authenticate against it.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub uri: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("uri", &self.uri)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl StoreConfig {
    /// Reads `key=value` lines (`uri`, `user`, `password`). The file is parsed
    /// on its own and never leaks into the process environment.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("open store config {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("parse store config {}", path.display()))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut uri = None;
        let mut user = None;
        let mut password = None;
        for item in dotenvy::from_read_iter(reader) {
            let (key, value) = item.context("invalid config line")?;
            match key.trim().to_ascii_lowercase().as_str() {
                "uri" => uri = Some(value),
                "user" => user = Some(value),
                "password" => password = Some(value),
                _ => {}
            }
        }
        let uri = uri
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| anyhow!("store config has no `uri` entry"))?;
        Ok(Self {
            uri,
            user: user.filter(|u| !u.is_empty()),
            password: password.filter(|p| !p.is_empty()),
        })
    }

    pub fn from_env() -> Option<Self> {
        let uri = non_empty_env("FPL_GRAPH_URI")?;
        Some(Self {
            uri,
            user: non_empty_env("FPL_GRAPH_USER"),
            password: non_empty_env("FPL_GRAPH_PASSWORD"),
        })
    }

    /// Applies `FPL_GRAPH_*` environment overrides on top of file values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(uri) = non_empty_env("FPL_GRAPH_URI") {
            self.uri = uri;
        }
        if let Some(user) = non_empty_env("FPL_GRAPH_USER") {
            self.user = Some(user);
        }
        if let Some(password) = non_empty_env("FPL_GRAPH_PASSWORD") {
            self.password = Some(password);
        }
        self
    }
}

/// Knobs for one load run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSettings {
    /// PLAYED_IN records per gateway call.
    pub batch_size: usize,
    /// 1 keeps the pipeline strictly sequential.
    pub workers: usize,
    pub retry: RetryPolicy,
    pub key_policy: KeyPolicy,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: 1,
            retry: RetryPolicy::default(),
            key_policy: KeyPolicy::Strict,
        }
    }
}

impl LoadSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: env_parse::<u32>("FPL_RETRY_ATTEMPTS")
                .unwrap_or(defaults.retry.max_attempts)
                .clamp(1, 10),
            base_delay: env_parse::<u64>("FPL_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            max_delay: defaults.retry.max_delay,
        };
        Self {
            batch_size: env_parse::<usize>("FPL_BATCH_SIZE")
                .unwrap_or(defaults.batch_size)
                .clamp(1, 100_000),
            workers: env_parse::<usize>("FPL_LOAD_WORKERS")
                .unwrap_or(defaults.workers)
                .clamp(1, 32),
            retry,
            key_policy: env::var("FPL_KEY_POLICY")
                .ok()
                .and_then(|raw| KeyPolicy::parse(&raw))
                .unwrap_or(defaults.key_policy),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}
