mod config;
mod request_id;
mod target;

pub use config::{ProxyConfig, ProxyConfigError, DEFAULT_CDP_LISTEN_ADDR, DEFAULT_PROXY_LISTEN_ADDR};
pub use request_id::RequestIdGenerator;
pub use target::{
    parse_connect_authority, resolve_forward_target, ForwardTarget, TargetError, TargetScheme,
};
