//! Load daemon config from file and environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

/// Daemon configuration. File: ~/.config/burrow/config.toml or
/// /etc/burrow/config.toml. Env overrides: BURROW_PEER_ID, BURROW_VERSION,
/// BURROW_DIRECT_PORT, BURROW_CONTROL_PORT, BURROW_STORAGE_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Numeric peer identity, unique within the group.
    #[serde(default = "default_peer_id")]
    pub peer_id: u32,
    /// Protocol version string; "1.0" is the baseline, anything else runs
    /// the enhanced policy.
    #[serde(default = "default_version")]
    pub version: String,
    /// Multicast address of the control group.
    #[serde(default = "default_control_group")]
    pub control_group: SocketAddr,
    /// Multicast address of the backup-data group (PUTCHUNK traffic).
    #[serde(default = "default_backup_group")]
    pub backup_group: SocketAddr,
    /// Multicast address of the restore-data group (CHUNK traffic).
    #[serde(default = "default_restore_group")]
    pub restore_group: SocketAddr,
    /// TCP port for point-to-point chunk delivery (enhanced restore).
    /// Shared by every peer in the group.
    #[serde(default = "default_direct_port")]
    pub direct_port: u16,
    /// Local control-surface TCP port (loopback only).
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Root directory for stored chunks, restored files and the ledger
    /// snapshot.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Storage capacity offered to the group, in bytes.
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,
    /// Interval between ledger snapshots, in seconds.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

fn default_peer_id() -> u32 {
    1
}
fn default_version() -> String {
    "1.0".to_string()
}
fn default_control_group() -> SocketAddr {
    "239.77.10.1:48431".parse().unwrap()
}
fn default_backup_group() -> SocketAddr {
    "239.77.10.2:48432".parse().unwrap()
}
fn default_restore_group() -> SocketAddr {
    "239.77.10.3:48433".parse().unwrap()
}
fn default_direct_port() -> u16 {
    48440
}
fn default_control_port() -> u16 {
    48450
}
fn default_storage_dir() -> PathBuf {
    match std::env::var_os("HOME").map(PathBuf::from) {
        Some(home) => home.join(".local/share/burrow"),
        None => PathBuf::from("burrow-data"),
    }
}
fn default_capacity_bytes() -> u64 {
    1_000_000_000
}
fn default_snapshot_interval_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            version: default_version(),
            control_group: default_control_group(),
            backup_group: default_backup_group(),
            restore_group: default_restore_group(),
            direct_port: default_direct_port(),
            control_port: default_control_port(),
            storage_dir: default_storage_dir(),
            capacity_bytes: default_capacity_bytes(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("BURROW_PEER_ID") {
        if let Ok(id) = s.parse::<u32>() {
            c.peer_id = id;
        }
    }
    if let Ok(s) = std::env::var("BURROW_VERSION") {
        if !s.is_empty() {
            c.version = s;
        }
    }
    if let Ok(s) = std::env::var("BURROW_DIRECT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.direct_port = p;
        }
    }
    if let Ok(s) = std::env::var("BURROW_CONTROL_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.control_port = p;
        }
    }
    if let Ok(s) = std::env::var("BURROW_STORAGE_DIR") {
        if !s.is_empty() {
            c.storage_dir = PathBuf::from(s);
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/burrow/config.toml"));
    }
    out.push(PathBuf::from("/etc/burrow/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
