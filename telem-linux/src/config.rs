//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use telem_core::identity::{
    DEFAULT_MACHINE_ID_EXPIRY, DEFAULT_MACHINE_ID_FILE, DEFAULT_MACHINE_ID_OVERRIDE_FILE,
};
use telem_core::stage::DEFAULT_SPOOL_DIR;
use telem_core::HeaderSchema;
use tracing::warn;

/// Daemon configuration. File: ~/.config/telemetrics/config.toml or
/// /etc/telemetrics/config.toml. Env overrides: TELEM_SOCKET_PATH, TELEM_SPOOL_DIR,
/// TELEM_MACHINE_ID_FILE, TELEM_READ_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Unix socket clients submit records to.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Directory staged records are written to.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    #[serde(default = "default_machine_id_file")]
    pub machine_id_file: PathBuf,
    /// Static id that replaces the generated one when present.
    #[serde(default = "default_machine_id_override_file")]
    pub machine_id_override_file: PathBuf,
    /// Age after which the machine id is regenerated (default 3 days).
    #[serde(default = "default_machine_id_expiry_secs")]
    pub machine_id_expiry_secs: u64,
    /// How often the machine id age is checked (default 1 hour).
    #[serde(default = "default_machine_id_refresh_secs")]
    pub machine_id_refresh_secs: u64,
    /// Deadline for a whole frame, from its size field to its last body byte; 0 waits
    /// forever (default 30).
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Header names every record must carry, in order.
    #[serde(default)]
    pub headers: HeaderSchema,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/telem-0")
}
fn default_spool_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SPOOL_DIR)
}
fn default_machine_id_file() -> PathBuf {
    PathBuf::from(DEFAULT_MACHINE_ID_FILE)
}
fn default_machine_id_override_file() -> PathBuf {
    PathBuf::from(DEFAULT_MACHINE_ID_OVERRIDE_FILE)
}
fn default_machine_id_expiry_secs() -> u64 {
    DEFAULT_MACHINE_ID_EXPIRY.as_secs()
}
fn default_machine_id_refresh_secs() -> u64 {
    3600
}
fn default_read_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            spool_dir: default_spool_dir(),
            machine_id_file: default_machine_id_file(),
            machine_id_override_file: default_machine_id_override_file(),
            machine_id_expiry_secs: default_machine_id_expiry_secs(),
            machine_id_refresh_secs: default_machine_id_refresh_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            headers: HeaderSchema::default(),
        }
    }
}

impl Config {
    pub fn machine_id_expiry(&self) -> Duration {
        Duration::from_secs(self.machine_id_expiry_secs)
    }

    pub fn machine_id_refresh(&self) -> Duration {
        Duration::from_secs(self.machine_id_refresh_secs.max(1))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout_secs {
            0 => None,
            s => Some(Duration::from_secs(s)),
        }
    }
}

/// Load config: explicit file if given (errors are fatal), else the first config file
/// found (errors are logged, defaults used), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => load_default_file().unwrap_or_default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("TELEM_SOCKET_PATH") {
        c.socket_path = PathBuf::from(s);
    }
    if let Some(s) = var("TELEM_SPOOL_DIR") {
        c.spool_dir = PathBuf::from(s);
    }
    if let Some(s) = var("TELEM_MACHINE_ID_FILE") {
        c.machine_id_file = PathBuf::from(s);
    }
    if let Some(s) = var("TELEM_READ_TIMEOUT_SECS") {
        match s.parse::<u64>() {
            Ok(n) => c.read_timeout_secs = n,
            Err(_) => warn!("ignoring invalid TELEM_READ_TIMEOUT_SECS={s:?}"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/telemetrics/config.toml"));
    }
    out.push(PathBuf::from("/etc/telemetrics/config.toml"));
    out
}

fn load_default_file() -> Option<Config> {
    let p = config_paths().into_iter().find(|p| p.exists())?;
    match load_file(&p) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("{e:#}; using defaults");
            None
        }
    }
}

fn load_file(p: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(p)
        .with_context(|| format!("failed to read config {}", p.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("invalid config {}", p.display()))
}
