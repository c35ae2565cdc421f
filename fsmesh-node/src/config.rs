//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fsmesh_core::NodeId;
use serde::Deserialize;

/// Daemon configuration. File: `--config <path>`, ~/.config/fsmesh/config.toml or
/// /etc/fsmesh/config.toml.
/// Env overrides: FSMESH_HOST, FSMESH_PORT, FSMESH_STORAGE_ROOT, FSMESH_SNAPSHOT_FILE,
/// FSMESH_PEERS (comma separated).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen host; also the host part of this node's id (default 127.0.0.1).
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port (default 30000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding stored file versions (default `files`).
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// JSON snapshot of the metadata table (default `files.json`).
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: PathBuf,
    /// Other servers, `host:port`.
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    30000
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("files")
}
fn default_snapshot_file() -> PathBuf {
    PathBuf::from("files.json")
}
fn default_reconnect_interval_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            storage_root: default_storage_root(),
            snapshot_file: default_snapshot_file(),
            peers: Vec::new(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
        }
    }
}

impl Config {
    pub fn local_id(&self) -> NodeId {
        NodeId::new(self.host.clone(), self.port)
    }

    pub fn peer_ids(&self) -> Result<Vec<NodeId>> {
        self.peers
            .iter()
            .map(|p| NodeId::from_addr(p).with_context(|| format!("bad peer address {p:?}")))
            .collect()
    }

    /// Apply environment overrides. Unparsable numeric values are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = var("FSMESH_HOST") {
            self.host = s;
        }
        if let Some(p) = var("FSMESH_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.port = p;
        }
        if let Some(s) = var("FSMESH_STORAGE_ROOT") {
            self.storage_root = PathBuf::from(s);
        }
        if let Some(s) = var("FSMESH_SNAPSHOT_FILE") {
            self.snapshot_file = PathBuf::from(s);
        }
        if let Some(s) = var("FSMESH_PEERS") {
            self.peers = s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
    }
}

/// Load config: defaults, then the config file (explicit path or first one found), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/fsmesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/fsmesh/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}
