use dotenvy::dotenv;
use ipnet::IpNet;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::archiver::{DEFAULT_MAX_DOWNLOADS, DEFAULT_REQUEST_TIMEOUT};
use crate::error::ConfigError;
use crate::extract::ProxyMatch;

/// Ranges an extraction never connects to, unless configured otherwise.
const DEFAULT_DENIED_IPS: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "127.0.0.0/8",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// Extraction configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Where bookmark archives are written
    pub data_dir: PathBuf,
    pub denied_ips: Vec<IpNet>,
    pub proxies: Vec<ProxyMatch>,
    pub max_downloads: usize,
    pub fetch_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/bookmarks"),
            denied_ips: default_denied_ips(),
            proxies: Vec::new(),
            max_downloads: DEFAULT_MAX_DOWNLOADS,
            fetch_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = var("SNAPSHOT_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            config.data_dir = PathBuf::from(dir.trim());
        }
        if let Some(value) = var("SNAPSHOT_DENIED_IPS") {
            config.denied_ips = parse_denied_ips(&value)?;
        }
        if let Some(value) = var("SNAPSHOT_PROXY_MATCH") {
            config.proxies = parse_proxies(&value)?;
        }
        if let Some(value) = var("SNAPSHOT_MAX_DOWNLOADS") {
            config.max_downloads = parse_number("SNAPSHOT_MAX_DOWNLOADS", &value)?;
        }
        if let Some(value) = var("SNAPSHOT_FETCH_TIMEOUT") {
            let secs = parse_number("SNAPSHOT_FETCH_TIMEOUT", &value)?;
            config.fetch_timeout = Duration::from_secs(secs as u64);
        }

        Ok(config)
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_denied_ips(mut self, denied: Vec<IpNet>) -> Self {
        self.denied_ips = denied;
        self
    }
}

pub fn default_denied_ips() -> Vec<IpNet> {
    DEFAULT_DENIED_IPS.iter().filter_map(|net| net.parse().ok()).collect()
}

/// Parses comma separated CIDRs or single addresses. An empty value
/// denies nothing.
pub fn parse_denied_ips(value: &str) -> Result<Vec<IpNet>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<IpNet>()
                .or_else(|_| v.parse::<IpAddr>().map(IpNet::from))
                .map_err(|e| invalid("SNAPSHOT_DENIED_IPS", format!("{v}: {e}")))
        })
        .collect()
}

/// Parses `host-glob=proxy-url` pairs separated by `;`.
pub fn parse_proxies(value: &str) -> Result<Vec<ProxyMatch>, ConfigError> {
    value
        .split(';')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|pair| {
            let (host, url) = pair
                .split_once('=')
                .ok_or_else(|| invalid("SNAPSHOT_PROXY_MATCH", format!("{pair}: expected host=url")))?;
            let url = Url::parse(url.trim())
                .map_err(|e| invalid("SNAPSHOT_PROXY_MATCH", format!("{pair}: {e}")))?;
            Ok(ProxyMatch {
                host: host.trim().to_string(),
                url,
            })
        })
        .collect()
}

fn parse_number(var: &str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err(invalid(var, "must be greater than 0".to_string())),
        Err(e) => Err(invalid(var, e.to_string())),
    }
}

fn invalid(var: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("data/bookmarks"));
        assert_eq!(config.denied_ips.len(), DEFAULT_DENIED_IPS.len());
        assert!(config.proxies.is_empty());
        assert_eq!(config.max_downloads, 4);
        assert_eq!(config.fetch_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_from_lookup() {
        let config = Config::from_lookup(lookup(&[
            ("SNAPSHOT_DATA_DIR", "/var/lib/snapshot"),
            ("SNAPSHOT_DENIED_IPS", "10.0.0.0/8, 192.0.2.1"),
            ("SNAPSHOT_PROXY_MATCH", "*.example.net=http://proxy:3128; example.org = socks5://127.0.0.1:1080"),
            ("SNAPSHOT_MAX_DOWNLOADS", "8"),
            ("SNAPSHOT_FETCH_TIMEOUT", "10"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/snapshot"));
        assert_eq!(
            config.denied_ips,
            vec!["10.0.0.0/8".parse::<IpNet>().unwrap(), "192.0.2.1/32".parse().unwrap()]
        );
        assert_eq!(config.proxies.len(), 2);
        assert_eq!(config.proxies[0].host, "*.example.net");
        assert_eq!(config.proxies[1].url.as_str(), "socks5://127.0.0.1:1080");
        assert_eq!(config.max_downloads, 8);
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_empty_deny_list() {
        let config = Config::from_lookup(lookup(&[("SNAPSHOT_DENIED_IPS", "")])).unwrap();
        assert!(config.denied_ips.is_empty());
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup(&[("SNAPSHOT_DENIED_IPS", "10.0.0.0/99")])).unwrap_err();
        assert!(err.to_string().starts_with("SNAPSHOT_DENIED_IPS: 10.0.0.0/99"));

        assert!(Config::from_lookup(lookup(&[("SNAPSHOT_PROXY_MATCH", "no-separator")])).is_err());
        assert!(Config::from_lookup(lookup(&[("SNAPSHOT_MAX_DOWNLOADS", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("SNAPSHOT_FETCH_TIMEOUT", "soon")])).is_err());
    }
}
