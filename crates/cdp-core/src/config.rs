use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CDP_LISTEN_ADDR: &str = "localhost:9229";
pub const DEFAULT_PROXY_LISTEN_ADDR: &str = "localhost:8080";

const ENV_CDP_LISTEN_ADDR: &str = "CDP_PROXY_CDP_ADDR";
const ENV_PROXY_LISTEN_ADDR: &str = "CDP_PROXY_PROXY_ADDR";
const ENV_VERBOSE_PREFIXES: &str = "CDP_PROXY_VERBOSE_PREFIXES";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub cdp_listen_addr: String,
    pub proxy_listen_addr: String,
    pub verbose_prefixes: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            cdp_listen_addr: DEFAULT_CDP_LISTEN_ADDR.to_string(),
            proxy_listen_addr: DEFAULT_PROXY_LISTEN_ADDR.to_string(),
            verbose_prefixes: Vec::new(),
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(ENV_CDP_LISTEN_ADDR) {
            if !value.trim().is_empty() {
                config.cdp_listen_addr = value;
            }
        }
        if let Ok(value) = std::env::var(ENV_PROXY_LISTEN_ADDR) {
            if !value.trim().is_empty() {
                config.proxy_listen_addr = value;
            }
        }
        if let Ok(value) = std::env::var(ENV_VERBOSE_PREFIXES) {
            config.verbose_prefixes = parse_prefix_list(&value);
        }
        config
    }

    pub fn validate(&self) -> Result<(), ProxyConfigError> {
        validate_listen_addr(&self.cdp_listen_addr, "cdp_listen_addr")?;
        validate_listen_addr(&self.proxy_listen_addr, "proxy_listen_addr")?;
        if self.verbose_prefixes.iter().any(|p| p.trim().is_empty()) {
            return Err(ProxyConfigError::EmptyPrefixEntry);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyConfigError {
    #[error("{0} must not be empty")]
    EmptyListenAddr(&'static str),
    #[error("{field} must be host:port, got {value:?}")]
    MissingPort { field: &'static str, value: String },
    #[error("{field} has an invalid port in {value:?}")]
    InvalidPort { field: &'static str, value: String },
    #[error("verbose_prefixes contains an empty entry")]
    EmptyPrefixEntry,
}

fn validate_listen_addr(addr: &str, field: &'static str) -> Result<(), ProxyConfigError> {
    if addr.trim().is_empty() {
        return Err(ProxyConfigError::EmptyListenAddr(field));
    }
    let (host, port_text) = addr.rsplit_once(':').ok_or_else(|| ProxyConfigError::MissingPort {
        field,
        value: addr.to_string(),
    })?;
    if host.is_empty() || port_text.is_empty() {
        return Err(ProxyConfigError::MissingPort {
            field,
            value: addr.to_string(),
        });
    }
    if port_text.parse::<u16>().is_err() {
        return Err(ProxyConfigError::InvalidPort {
            field,
            value: addr.to_string(),
        });
    }
    Ok(())
}

fn parse_prefix_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
