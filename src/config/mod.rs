//! Configuration loading (§10): a flat YAML document with one optional block
//! per protocol plus a `server` block and a `dashboard` block.
//!
//! Grounded on the teacher's serde_yaml-based `Config::load`/`validate`/`save`
//! idiom, restructured to original_source's `server.py::ServerConfig`/
//! `_load_config` schema (`server`, `shadowsocks`, `socks5`, `http`, `vmess`,
//! `trojan`, `dashboard` top-level keys, each protocol block carrying its own
//! `enabled` flag).

use crate::crypto::CipherKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    1000
}

fn default_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_log_level", rename = "log_level")]
    pub log_level: String,
    #[serde(default = "default_max_connections", rename = "max_connections")]
    pub max_connections: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            host: default_host(),
            log_level: default_log_level(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowsocksSection {
    #[serde(default)]
    pub enabled: bool,
    pub port: u16,
    pub method: String,
    pub password: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Socks5Section {
    #[serde(default)]
    pub enabled: bool,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default)]
    pub enabled: bool,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmessSection {
    #[serde(default)]
    pub enabled: bool,
    pub port: u16,
    pub uuid: String,
    #[serde(default, rename = "alter_id")]
    pub alter_id: u32,
    #[serde(default)]
    pub tls: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrojanSection {
    #[serde(default)]
    pub enabled: bool,
    pub port: u16,
    pub password: String,
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
}

fn default_dashboard_port() -> u16 {
    9999
}

impl Default for DashboardSection {
    fn default() -> Self {
        DashboardSection {
            enabled: false,
            port: default_dashboard_port(),
        }
    }
}

/// Top-level configuration document (§6). Unknown keys are ignored (no
/// `deny_unknown_fields`), matching the source's permissive `dict.get`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    pub shadowsocks: Option<ShadowsocksSection>,
    pub socks5: Option<Socks5Section>,
    pub http: Option<HttpSection>,
    pub vmess: Option<VmessSection>,
    pub trojan: Option<TrojanSection>,
    #[serde(default)]
    pub dashboard: DashboardSection,
}

impl Config {
    /// Default config file path, matching the CLI default in §6/§11.
    pub fn default_path() -> PathBuf {
        PathBuf::from("./config.yaml")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.as_ref().display())))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Config> {
        serde_yaml::from_str(content).map_err(Error::from)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).map_err(Error::from)
    }

    /// §10 validation: at least one protocol enabled, ports non-zero and
    /// non-conflicting, shadowsocks method known, trojan/vmess stubs non-empty.
    pub fn validate(&self) -> Result<()> {
        let mut enabled_any = false;
        let mut ports = HashSet::new();

        let mut check_port = |port: u16, label: &str| -> Result<()> {
            if port == 0 {
                return Err(Error::Config(format!("{label} port must be non-zero")));
            }
            if !ports.insert(port) {
                return Err(Error::Config(format!("{label} port {port} conflicts with another enabled listener")));
            }
            Ok(())
        };

        if let Some(ss) = &self.shadowsocks {
            if ss.enabled {
                enabled_any = true;
                check_port(ss.port, "shadowsocks")?;
                CipherKind::try_from(ss.method.as_str())
                    .map_err(|_| Error::Config(format!("unknown shadowsocks method: {}", ss.method)))?;
            }
        }
        if let Some(s5) = &self.socks5 {
            if s5.enabled {
                enabled_any = true;
                check_port(s5.port, "socks5")?;
            }
        }
        if let Some(http) = &self.http {
            if http.enabled {
                enabled_any = true;
                check_port(http.port, "http")?;
            }
        }
        if let Some(vmess) = &self.vmess {
            if vmess.enabled {
                enabled_any = true;
                check_port(vmess.port, "vmess")?;
                if vmess.uuid.is_empty() {
                    return Err(Error::Config("vmess.uuid must be non-empty".to_string()));
                }
            }
        }
        if let Some(trojan) = &self.trojan {
            if trojan.enabled {
                enabled_any = true;
                check_port(trojan.port, "trojan")?;
                if trojan.password.is_empty() {
                    return Err(Error::Config("trojan.password must be non-empty".to_string()));
                }
            }
        }
        if self.dashboard.enabled {
            check_port(self.dashboard.port, "dashboard")?;
        }

        if !enabled_any {
            return Err(Error::Config("at least one protocol block must be enabled".to_string()));
        }
        Ok(())
    }

    /// Emit a Clash-style client configuration: one `proxies:` entry per
    /// enabled protocol, a default select group, and GEOIP/MATCH rules.
    /// Grounded on original_source's `generate_clash_config`.
    pub fn generate_client_config(&self) -> String {
        let mut proxies: Vec<serde_yaml::Value> = Vec::new();

        if let Some(ss) = &self.shadowsocks {
            if ss.enabled {
                proxies.push(serde_yaml::to_value(serde_json::json!({
                    "name": "SS-Server",
                    "type": "ss",
                    "server": "your-server-ip",
                    "port": ss.port,
                    "cipher": ss.method,
                    "password": ss.password,
                    "udp": true,
                }))
                .unwrap());
            }
        }
        if let Some(vmess) = &self.vmess {
            if vmess.enabled {
                proxies.push(serde_yaml::to_value(serde_json::json!({
                    "name": "VMess-Server",
                    "type": "vmess",
                    "server": "your-server-ip",
                    "port": vmess.port,
                    "uuid": vmess.uuid,
                    "alterId": vmess.alter_id,
                    "cipher": "auto",
                    "tls": vmess.tls,
                }))
                .unwrap());
            }
        }
        if let Some(trojan) = &self.trojan {
            if trojan.enabled {
                proxies.push(serde_yaml::to_value(serde_json::json!({
                    "name": "Trojan-Server",
                    "type": "trojan",
                    "server": "your-server-ip",
                    "port": trojan.port,
                    "password": trojan.password,
                    "sni": "your-domain.com",
                    "udp": true,
                }))
                .unwrap());
            }
        }
        if let Some(s5) = &self.socks5 {
            if s5.enabled {
                let mut entry = serde_json::json!({
                    "name": "SOCKS5-Server",
                    "type": "socks5",
                    "server": "your-server-ip",
                    "port": s5.port,
                });
                if let (Some(u), Some(p)) = (&s5.username, &s5.password) {
                    entry["username"] = serde_json::Value::String(u.clone());
                    entry["password"] = serde_json::Value::String(p.clone());
                }
                proxies.push(serde_yaml::to_value(entry).unwrap());
            }
        }
        if let Some(http) = &self.http {
            if http.enabled {
                let mut entry = serde_json::json!({
                    "name": "HTTP-Server",
                    "type": "http",
                    "server": "your-server-ip",
                    "port": http.port,
                });
                if let (Some(u), Some(p)) = (&http.username, &http.password) {
                    entry["username"] = serde_json::Value::String(u.clone());
                    entry["password"] = serde_json::Value::String(p.clone());
                }
                proxies.push(serde_yaml::to_value(entry).unwrap());
            }
        }

        let proxy_names: Vec<String> = proxies
            .iter()
            .filter_map(|p| p.get("name").and_then(|n| n.as_str()).map(str::to_string))
            .collect();
        let group_name = "Proxy Select".to_string();

        let mut group_members = proxy_names.clone();
        group_members.push("DIRECT".to_string());

        let doc = serde_json::json!({
            "port": 7890,
            "socks-port": 7891,
            "allow-lan": true,
            "mode": "rule",
            "log-level": "info",
            "proxies": proxies,
            "proxy-groups": [
                {
                    "name": group_name,
                    "type": "select",
                    "proxies": group_members,
                }
            ],
            "rules": [
                "GEOIP,CN,DIRECT",
                format!("MATCH,{group_name}"),
            ],
        });

        serde_yaml::to_string(&serde_yaml::to_value(doc).unwrap()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
server:
  host: "0.0.0.0"
  log_level: "debug"
shadowsocks:
  enabled: true
  port: 8388
  method: "aes-256-gcm"
  password: "test-password"
socks5:
  enabled: true
  port: 1080
"#
    }

    #[test]
    fn test_load_from_str_applies_defaults() {
        let config = Config::from_yaml_str(sample_yaml()).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.shadowsocks.as_ref().unwrap().timeout, 300);
        assert!(config.http.is_none());
    }

    #[test]
    fn test_validate_accepts_sample() {
        let config = Config::from_yaml_str(sample_yaml()).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_no_protocol_enabled() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_port_conflict() {
        let yaml = r#"
shadowsocks:
  enabled: true
  port: 1080
  method: "aes-256-gcm"
  password: "x"
socks5:
  enabled: true
  port: 1080
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_cipher() {
        let yaml = r#"
shadowsocks:
  enabled: true
  port: 8388
  method: "rot13"
  password: "x"
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generate_client_config_includes_enabled_protocols_only() {
        let config = Config::from_yaml_str(sample_yaml()).unwrap();
        let client = config.generate_client_config();
        assert!(client.contains("SS-Server"));
        assert!(client.contains("SOCKS5-Server"));
        assert!(!client.contains("VMess-Server"));
    }
}
