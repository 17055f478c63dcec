//! Broker configuration.
//!
//! Loaded from a JSON file (default `~/.config/sshmux/config.json`),
//! overridable per-field by CLI flags in `main`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The remote host this broker amortizes.
    pub remote: RemoteConfig,
    /// Logical endpoint name, selects the socket path.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Hold non-init callers until the init script has run.
    #[serde(default)]
    pub gated: bool,
    /// Automation script for the gated init connection.
    #[serde(default)]
    pub init_script: Option<PathBuf>,
    /// Per-read bound for automation expects, in seconds.
    #[serde(default = "default_expect_timeout")]
    pub expect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth: AuthConfig,
    #[serde(default)]
    pub host_key: HostKeyConfig,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthConfig {
    /// Private key file, OpenSSH format.
    Key {
        key_path: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
    /// Password taken from an environment variable, never from the file.
    Password { password_env: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostKeyConfig {
    /// Expected SHA-256 fingerprint (`SHA256:...`).
    #[serde(default)]
    pub pinned_sha256: Option<String>,
    /// Accept any key when no pin is set. Off by default.
    #[serde(default)]
    pub accept_unknown: bool,
}

fn default_endpoint() -> String {
    "default".into()
}

fn default_port() -> u16 {
    22
}

fn default_expect_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_path()?,
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parse config: {}", path.display()))?;
        cfg.expand_paths();
        Ok(cfg)
    }

    fn expand_paths(&mut self) {
        if let AuthConfig::Key { key_path, .. } = &mut self.remote.auth {
            *key_path = shellexpand::tilde(key_path).into_owned();
        }
        if let Some(script) = &self.init_script {
            let expanded = shellexpand::tilde(&script.to_string_lossy().into_owned()).into_owned();
            self.init_script = Some(PathBuf::from(expanded));
        }
    }
}

fn default_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("no config directory for this user")?;
    Ok(base.join("sshmux").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_key_config() {
        let raw = r#"{
            "remote": {
                "host": "bastion.example.com",
                "username": "deploy",
                "auth": { "key": { "key_path": "~/.ssh/id_ed25519" } }
            }
        }"#;
        let mut cfg: Config = serde_json::from_str(raw).unwrap();
        cfg.expand_paths();
        assert_eq!(cfg.remote.port, 22);
        assert_eq!(cfg.endpoint, "default");
        assert!(!cfg.gated);
        let AuthConfig::Key { key_path, passphrase } = &cfg.remote.auth else {
            panic!("expected key auth");
        };
        assert!(!key_path.starts_with('~'), "tilde not expanded: {key_path}");
        assert!(passphrase.is_none());
    }

    #[test]
    fn parses_gated_password_config() {
        let raw = r#"{
            "remote": {
                "host": "h",
                "port": 2222,
                "username": "u",
                "auth": { "password": { "password_env": "SSHMUX_PASSWORD" } },
                "host_key": { "accept_unknown": true }
            },
            "endpoint": "staging",
            "gated": true,
            "init_script": "/etc/sshmux/login.json"
        }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert!(cfg.gated);
        assert_eq!(cfg.endpoint, "staging");
        assert!(cfg.remote.host_key.accept_unknown);
        assert!(matches!(cfg.remote.auth, AuthConfig::Password { .. }));
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = Config {
            remote: RemoteConfig {
                host: "h".into(),
                port: 22,
                username: "u".into(),
                auth: AuthConfig::Password { password_env: "P".into() },
                host_key: HostKeyConfig::default(),
                connect_timeout_secs: 30,
            },
            endpoint: "e".into(),
            gated: true,
            init_script: None,
            expect_timeout_secs: 5,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.endpoint, "e");
        assert_eq!(back.expect_timeout_secs, 5);
    }
}
