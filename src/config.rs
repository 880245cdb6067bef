//! Engine configuration, read once at startup from the process environment.
//!
//! Replaces the ad-hoc `AppConfig`/`Config` pair used for a single push
//! target with one typed config covering every source the engine can pull
//! from, plus the scheduler and storage knobs configurable per deployment.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crate::coord::Source;
use crate::error::{Error, Result};

/// Host and optional basic credentials for one registry source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SourceConfig {
    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address the control-plane HTTP+WebSocket server binds to.
    pub bind_addr: String,
    /// Root directory under which `tasks/<id>/...` is laid out.
    pub downloads_root: PathBuf,
    /// `N_tasks`: global concurrent-task bound.
    pub max_tasks: usize,
    /// `N_blobs`: per-task concurrent-blob bound.
    pub max_blobs_per_task: usize,
    /// Transient-failure retry budget per task.
    pub max_retries: u32,
    /// Whether on-disk artifacts are kept after an explicit cancel.
    pub retain_on_cancel: bool,
    /// Known registry sources, keyed by lowercase name (`dockerhub`, `quay`, `ghcr`, ...).
    pub sources: HashMap<String, SourceConfig>,
}

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7878";
const DEFAULT_DOWNLOADS_ROOT: &str = "./downloads";
const DEFAULT_MAX_TASKS: usize = 3;
const DEFAULT_MAX_BLOBS_PER_TASK: usize = 5;
const DEFAULT_MAX_RETRIES: u32 = 3;

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// sensible defaults for local development.
    pub fn from_env() -> Self {
        let mut sources = HashMap::new();
        sources.insert(
            "dockerhub".to_string(),
            SourceConfig {
                host: env_or("FETCHD_REGISTRY_HOST_DOCKERHUB", "https://registry-1.docker.io"),
                username: env::var("FETCHD_REGISTRY_USER_DOCKERHUB").ok(),
                password: env::var("FETCHD_REGISTRY_PASS_DOCKERHUB").ok(),
            },
        );
        sources.insert(
            "quay".to_string(),
            SourceConfig {
                host: env_or("FETCHD_REGISTRY_HOST_QUAY", "https://quay.io"),
                username: env::var("FETCHD_REGISTRY_USER_QUAY").ok(),
                password: env::var("FETCHD_REGISTRY_PASS_QUAY").ok(),
            },
        );
        sources.insert(
            "ghcr".to_string(),
            SourceConfig {
                host: env_or("FETCHD_REGISTRY_HOST_GHCR", "https://ghcr.io"),
                username: env::var("FETCHD_REGISTRY_USER_GHCR").ok(),
                password: env::var("FETCHD_REGISTRY_PASS_GHCR").ok(),
            },
        );

        Self {
            bind_addr: env_or("FETCHD_BIND_ADDR", DEFAULT_BIND_ADDR),
            downloads_root: PathBuf::from(env_or("FETCHD_DOWNLOADS_ROOT", DEFAULT_DOWNLOADS_ROOT)),
            max_tasks: env_parsed("FETCHD_MAX_TASKS", DEFAULT_MAX_TASKS),
            max_blobs_per_task: env_parsed("FETCHD_MAX_BLOBS_PER_TASK", DEFAULT_MAX_BLOBS_PER_TASK),
            max_retries: env_parsed("FETCHD_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            retain_on_cancel: env::var("FETCHD_RETAIN_ON_CANCEL")
                .map(|v| v != "false")
                .unwrap_or(true),
            sources,
        }
    }

    /// Register or override a custom source at runtime (used for the
    /// `source: "host.example.com"` case where the caller names an
    /// arbitrary host rather than one of the three built-ins).
    pub fn register_custom_source(&mut self, name: &str, host: String, username: Option<String>, password: Option<String>) {
        self.sources.insert(
            name.to_lowercase(),
            SourceConfig { host, username, password },
        );
    }

    /// Resolve a [`Source`] to its configured host and credentials.
    /// Unknown custom hosts that were never registered are accepted
    /// anonymously: only unknown *named* sources are `InvalidArgument`.
    pub fn resolve_source(&self, source: &Source) -> Result<SourceConfig> {
        match source {
            Source::DockerHub => Ok(self.sources["dockerhub"].clone()),
            Source::Quay => Ok(self.sources["quay"].clone()),
            Source::Ghcr => Ok(self.sources["ghcr"].clone()),
            Source::Custom(host) => {
                if let Some(cfg) = self.sources.get(&host.to_lowercase()) {
                    Ok(cfg.clone())
                } else {
                    let normalized = if host.contains("://") {
                        host.clone()
                    } else {
                        format!("https://{host}")
                    };
                    Ok(SourceConfig {
                        host: normalized,
                        username: None,
                        password: None,
                    })
                }
            }
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Validate a user-requested platform string `os/arch[/variant]`.
pub fn parse_platform(s: &str) -> Result<(String, String, Option<String>)> {
    let mut parts = s.splitn(3, '/');
    let os = parts.next().filter(|p| !p.is_empty());
    let arch = parts.next().filter(|p| !p.is_empty());
    let variant = parts.next().map(|p| p.to_string());
    match (os, arch) {
        (Some(os), Some(arch)) => Ok((os.to_string(), arch.to_string(), variant)),
        _ => Err(Error::InvalidArgument(format!(
            "invalid platform '{s}', expected os/architecture[/variant]"
        ))),
    }
}
