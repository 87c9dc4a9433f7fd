//! Runtime configuration: TOML file with SNAKE_UPPER environment fallback.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration fields, matching the wire names in the external interface
/// table exactly (`sub_addresses`, `port`, ...). Every field falls back to
/// its SNAKE_UPPER environment variable when absent from the TOML document,
/// mirroring the original's `loadEnv`/`osEnvWithDefault` behavior but
/// field-by-field rather than "whole file vs. whole environment".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sub_addresses: String,
    pub port: String,
    pub register_url: String,
    pub register_token: String,
    pub allow_users: String,
    pub log_file: String,
    pub debug_level: String,
    pub interval_second: String,
    pub is_user_traffic_stat: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sub_addresses: "127.0.0.1:80".to_string(),
            port: "80".to_string(),
            register_url: String::new(),
            register_token: String::new(),
            allow_users: String::new(),
            log_file: String::new(),
            debug_level: "INFO".to_string(),
            interval_second: "3600".to_string(),
            is_user_traffic_stat: "false".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file at `path`, falling back to environment
    /// variables for any field the file doesn't set, and finally to
    /// [`Config::default`]'s value if neither is present.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(_) => Config::default(),
        };
        config.apply_env_fallback();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_fallback(&mut self) {
        fallback(&mut self.sub_addresses, "SUB_ADDRESSES");
        fallback(&mut self.port, "PORT");
        fallback(&mut self.register_url, "REGISTER_URL");
        fallback(&mut self.register_token, "REGISTER_TOKEN");
        fallback(&mut self.allow_users, "ALLOW_USERS");
        fallback(&mut self.log_file, "LOG_FILE");
        fallback(&mut self.debug_level, "DEBUG_LEVEL");
        fallback(&mut self.interval_second, "INTERVAL_SECOND");
        fallback(&mut self.is_user_traffic_stat, "IS_USER_TRAFFIC_STAT");
    }

    pub fn validate(&self) -> Result<()> {
        if self.port.parse::<u16>().is_err() {
            return Err(Error::config(format!("invalid port: {}", self.port)));
        }
        Ok(())
    }

    /// `0.0.0.0:<port>` for the node HTTP listener.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn listen_port(&self) -> u16 {
        self.port.parse().unwrap_or(80)
    }

    pub fn push_interval(&self) -> Duration {
        let secs: u64 = self.interval_second.parse().unwrap_or(0);
        if secs == 0 {
            Duration::from_secs(3600)
        } else {
            Duration::from_secs(secs)
        }
    }

    /// Comma-separated `ALLOW_USERS` split into individual UUID strings.
    pub fn user_ids(&self) -> Vec<String> {
        self.allow_users
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    /// Comma-separated `SUB_ADDRESSES`, normalized to always carry a port
    /// (default 443), with any `http(s)://` scheme prefix stripped.
    pub fn sub_host_with_port(&self) -> Vec<String> {
        self.sub_addresses
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|addr| {
                let addr = addr.trim_start_matches("https://").trim_start_matches("http://");
                if addr.contains(':') {
                    addr.to_string()
                } else {
                    format!("{}:443", addr)
                }
            })
            .collect()
    }

    pub fn disable_user_traffic(&self) -> bool {
        self.is_user_traffic_stat.eq_ignore_ascii_case("false")
    }
}

fn fallback(field: &mut String, env_key: &str) {
    if field.is_empty() {
        if let Ok(v) = std::env::var(env_key) {
            *field = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.listen_port(), 80);
        assert_eq!(config.push_interval(), Duration::from_secs(3600));
        assert!(config.disable_user_traffic());
    }

    #[test]
    fn parses_toml_document() {
        let toml = r#"
            sub_addresses = "node1.example.com:443,node2.example.com:80"
            port = "8080"
            register_url = "https://control.example.com/api/node"
            register_token = "secret"
            allow_users = "uuid-a, uuid-b"
            log_file = ""
            debug_level = "DEBUG"
            interval_second = "60"
            is_user_traffic_stat = "true"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.listen_port(), 8080);
        assert_eq!(config.user_ids(), vec!["uuid-a", "uuid-b"]);
        assert_eq!(
            config.sub_host_with_port(),
            vec!["node1.example.com:443", "node2.example.com:80"]
        );
        assert!(!config.disable_user_traffic());
    }

    #[test]
    fn sub_host_with_port_defaults_to_443() {
        let mut config = Config::default();
        config.sub_addresses = "example.com".to_string();
        assert_eq!(config.sub_host_with_port(), vec!["example.com:443"]);
    }
}
