//! Layered configuration: defaults, then an optional TOML file, then
//! environment variables. CLI flags (parsed in `main`) are applied last and
//! take precedence over all of these.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: `~/.config/landrop/config.toml` or
/// `/etc/landrop/config.toml`. Env overrides: `LANDROP_NAME`,
/// `LANDROP_PORT`, `LANDROP_DEST_DIR`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name this node announces itself as.
    #[serde(default = "default_name")]
    pub name: String,
    /// UDP port to bind and to broadcast HEARTBEAT on (default 5000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory received files are written into (default: current directory).
    #[serde(default = "default_dest_dir")]
    pub dest_dir: PathBuf,
}

fn default_name() -> String {
    format!("landrop-{}", std::process::id())
}
fn default_port() -> u16 {
    5000
}
fn default_dest_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Config {
    fn default() -> Self {
        Self { name: default_name(), port: default_port(), dest_dir: default_dest_dir() }
    }
}

/// Merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("LANDROP_NAME") {
        c.name = s;
    }
    if let Ok(s) = std::env::var("LANDROP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Ok(s) = std::env::var("LANDROP_DEST_DIR") {
        c.dest_dir = PathBuf::from(s);
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/landrop/config.toml"));
    }
    out.push(PathBuf::from("/etc/landrop/config.toml"));
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
