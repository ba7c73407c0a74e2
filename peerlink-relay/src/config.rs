//! Load relay config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use peerlink_core::signaling::RelayConfig;

/// Daemon configuration. File: ~/.config/peerlink/relay.toml or /etc/peerlink/relay.toml.
/// Env overrides: PEERLINK_BIND, PEERLINK_OFFER_TIMEOUT_MS, PEERLINK_TICK_MS.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayDaemonConfig {
    /// WebSocket listen address (default 127.0.0.1:8787).
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Unanswered offers are reported `peer-offline` after this long.
    #[serde(default = "default_offer_timeout_ms")]
    pub offer_timeout_ms: u64,
    /// How often the relay checks offer deadlines.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_offer_timeout_ms() -> u64 {
    RelayConfig::default().offer_timeout_ms
}
fn default_tick_ms() -> u64 {
    250
}

impl Default for RelayDaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            offer_timeout_ms: default_offer_timeout_ms(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl RelayDaemonConfig {
    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            offer_timeout_ms: self.offer_timeout_ms,
        }
    }
}

/// Load config: defaults, then `explicit` or the first standard file found, then env vars.
/// An explicit path that cannot be read or parsed is an error; standard paths are best effort.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<RelayDaemonConfig> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut RelayDaemonConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("PEERLINK_BIND") {
        if !s.is_empty() {
            c.bind = s;
        }
    }
    if let Some(s) = var("PEERLINK_OFFER_TIMEOUT_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.offer_timeout_ms = ms;
        }
    }
    if let Some(s) = var("PEERLINK_TICK_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.tick_ms = ms.max(1);
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/relay.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/relay.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<RelayDaemonConfig> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
    toml::from_str(&s).map_err(|e| anyhow::anyhow!("parsing {}: {}", path.display(), e))
}

fn load_file() -> Option<RelayDaemonConfig> {
    for p in config_paths() {
        if p.exists() {
            match read_file(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!("ignoring config: {}", e),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_values_then_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "bind = \"0.0.0.0:9000\"\noffer_timeout_ms = 2500\n").unwrap();
        let mut c = read_file(&path).unwrap();
        assert_eq!(c.bind, "0.0.0.0:9000");
        assert_eq!(c.offer_timeout_ms, 2500);
        assert_eq!(c.tick_ms, 250);

        let env: HashMap<&str, &str> = [
            ("PEERLINK_OFFER_TIMEOUT_MS", "700"),
            ("PEERLINK_TICK_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.offer_timeout_ms, 700);
        assert_eq!(c.tick_ms, 250);
        assert_eq!(c.relay().offer_timeout_ms, 700);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "proxy_port = 3128\n").unwrap();
        assert!(read_file(&path).is_err());
        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
