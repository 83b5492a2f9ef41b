use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{error, info, warn};
use serde::Deserialize;

use crate::cipher_stream::KEY_LEN;

const RELOAD_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InKind {
    Socks5,
    Http,
    Tls,
    Wss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutKind {
    Tls,
    Wss,
    Direct,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    /// Shared cipher key, must be exactly 32 bytes of UTF-8.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub ecs_subnet: String,
    #[serde(rename = "in", default)]
    pub inbound: InConfig,
    #[serde(rename = "out", default)]
    pub outbound: OutConfig,
    #[serde(default)]
    pub white_list: Vec<String>,
    #[serde(default)]
    pub black_list: Vec<String>,
    #[serde(default)]
    pub china_ip_file: String,
    #[serde(default)]
    pub gfw_list_file: String,
    #[serde(default)]
    pub tun: TunConfig,
    #[serde(default)]
    pub system_proxy: SystemProxyConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InConfig {
    /// 1: socks5, 2: http, 3: tls, 4: wss
    #[serde(rename = "type", default)]
    pub kind: i8,
    #[serde(default)]
    pub port: u16,
    /// Domain presented when this host terminates TLS.
    #[serde(default)]
    pub server_name: String,
    /// Contact address handed to the certificate authority collaborator.
    #[serde(default)]
    pub email: String,
    /// PEM files produced by the certificate collaborator.
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutConfig {
    /// 1: tls, 2: wss, 3: direct
    #[serde(rename = "type", default)]
    pub kind: i8,
    /// Peer address; a domain, since the TLS handshake needs a server name.
    #[serde(default)]
    pub remote_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TunConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub mtu: u16,
    #[serde(default)]
    pub dns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemProxyConfig {
    #[serde(default)]
    pub enable: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub file_name: String,
}

impl Config {
    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("failed to read config file {}: {}", path.display(), e),
            )
        })?;
        let config: Config = serde_json::from_str(&contents).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to parse config file {}: {}", path.display(), e),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::io::Result<()> {
        if self.user.len() != KEY_LEN && self.outbound.out_kind() != Some(OutKind::Direct) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "user key must be exactly {} bytes, got {}",
                    KEY_LEN,
                    self.user.len()
                ),
            ));
        }

        if self.inbound.in_kind().is_none() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown inbound type: {}", self.inbound.kind),
            ));
        }

        if self.outbound.out_kind().is_none() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown outbound type: {}", self.outbound.kind),
            ));
        }

        if self.inbound.port == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "inbound port must be set",
            ));
        }

        let in_kind = self.inbound.in_kind().unwrap();
        if matches!(in_kind, InKind::Tls | InKind::Wss) {
            if self.inbound.server_name.len() < 3 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad server name: {}", self.inbound.server_name),
                ));
            }
            if self.inbound.cert_file.is_empty() || self.inbound.key_file.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "tls/wss inbound requires cert_file and key_file",
                ));
            }
        }

        if self.outbound.out_kind() != Some(OutKind::Direct)
            && self.outbound.remote_addr.trim().is_empty()
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "tunneled outbound requires remote_addr",
            ));
        }

        Ok(())
    }

    pub fn cipher_key(&self) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        let bytes = self.user.as_bytes();
        let len = bytes.len().min(KEY_LEN);
        key[..len].copy_from_slice(&bytes[..len]);
        key
    }
}

impl InConfig {
    pub fn in_kind(&self) -> Option<InKind> {
        match self.kind {
            1 => Some(InKind::Socks5),
            2 => Some(InKind::Http),
            3 => Some(InKind::Tls),
            4 => Some(InKind::Wss),
            _ => None,
        }
    }
}

impl OutConfig {
    pub fn out_kind(&self) -> Option<OutKind> {
        match self.kind {
            1 => Some(OutKind::Tls),
            2 => Some(OutKind::Wss),
            3 => Some(OutKind::Direct),
            _ => None,
        }
    }
}

/// Watches the config file for changes and invokes `on_change` with each
/// successfully parsed replacement. Modifications are detected by polling
/// file metadata and debounced so editors that write in several steps only
/// trigger one reload; parse failures keep the previous config active.
pub async fn watch_config<F>(path: PathBuf, mut on_change: F)
where
    F: FnMut(Config) + Send + 'static,
{
    let mut last_modified = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.modified().ok(),
        Err(_) => None,
    };

    let mut interval = tokio::time::interval(RELOAD_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let modified = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.modified().ok(),
            Err(_) => continue,
        };

        if modified == last_modified {
            continue;
        }

        // Debounce: wait for the file to stop changing before reloading.
        tokio::time::sleep(RELOAD_POLL_INTERVAL).await;
        let settled = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.modified().ok(),
            Err(_) => continue,
        };
        if settled != modified {
            last_modified = modified;
            continue;
        }
        last_modified = modified;

        match Config::load(&path).await {
            Ok(config) => {
                info!("Config file reloaded");
                on_change(config);
            }
            Err(e) => {
                error!("Config reload failed, keeping previous config: {}", e);
            }
        }
    }
}

/// Resolves the config path from CLI arguments (`-c <file>`), defaulting to
/// `config.json` in the working directory.
pub fn config_path_from_args(args: &[String]) -> PathBuf {
    let mut path = "config.json".to_string();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-c" {
            match iter.next() {
                Some(value) => path = value.clone(),
                None => {
                    warn!("-c flag given without a value, using {}", path);
                }
            }
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_json() -> serde_json::Value {
        serde_json::json!({
            "debug": false,
            "user": "0123456789abcdef0123456789abcdef",
            "ecs_subnet": "110.242.68.0/24",
            "in": {"type": 1, "port": 1080},
            "out": {"type": 1, "remote_addr": "peer.example.com"},
            "white_list": ["10.0.0.0/8"],
            "black_list": [],
            "tun": {"enable": false}
        })
    }

    fn parse(value: serde_json::Value) -> std::io::Result<Config> {
        let config: Config = serde_json::from_value(value).unwrap();
        config.validate().map(|_| config)
    }

    #[test]
    fn test_valid_config() {
        let config = parse(valid_json()).unwrap();
        assert_eq!(config.inbound.in_kind(), Some(InKind::Socks5));
        assert_eq!(config.outbound.out_kind(), Some(OutKind::Tls));
        assert_eq!(config.cipher_key().len(), KEY_LEN);
    }

    #[test]
    fn test_user_key_length_enforced() {
        let mut value = valid_json();
        value["user"] = serde_json::json!("short");
        assert!(parse(value).is_err());
    }

    #[test]
    fn test_direct_out_allows_missing_key() {
        let mut value = valid_json();
        value["user"] = serde_json::json!("");
        value["out"] = serde_json::json!({"type": 3, "remote_addr": ""});
        assert!(parse(value).is_ok());
    }

    #[test]
    fn test_unknown_types_rejected() {
        let mut value = valid_json();
        value["in"]["type"] = serde_json::json!(9);
        assert!(parse(value).is_err());

        let mut value = valid_json();
        value["out"]["type"] = serde_json::json!(0);
        assert!(parse(value).is_err());
    }

    #[test]
    fn test_tls_inbound_requires_cert() {
        let mut value = valid_json();
        value["in"] = serde_json::json!({"type": 3, "port": 443, "server_name": "example.com"});
        assert!(parse(value).is_err());

        let mut value = valid_json();
        value["in"] = serde_json::json!({
            "type": 3, "port": 443, "server_name": "example.com",
            "cert_file": "cert.pem", "key_file": "key.pem"
        });
        assert!(parse(value).is_ok());
    }

    #[test]
    fn test_config_path_from_args() {
        assert_eq!(
            config_path_from_args(&[]),
            PathBuf::from("config.json")
        );
        assert_eq!(
            config_path_from_args(&["-c".to_string(), "/etc/ferry.json".to_string()]),
            PathBuf::from("/etc/ferry.json")
        );
    }
}
