use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScheme {
    Http,
    Https,
}

impl TargetScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// Where a forward-proxied request should be dialed, plus the textual forms
/// needed to rewrite the request line and report the URL to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub scheme: TargetScheme,
    pub host: String,
    pub port: u16,
    /// Authority exactly as the client spelled it (port included only when
    /// the client included one).
    pub authority: String,
    /// Path and query in origin form, always starting with `/`.
    pub origin_form_target: String,
}

impl ForwardTarget {
    pub fn url(&self) -> String {
        format!(
            "{}://{}{}",
            self.scheme.as_str(),
            self.authority,
            self.origin_form_target
        )
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("request target is empty")]
    EmptyTarget,
    #[error("absolute request target has an unsupported scheme")]
    UnsupportedScheme,
    #[error("request authority is invalid")]
    InvalidAuthority,
    #[error("request authority is missing a port")]
    MissingPort,
    #[error("request authority has an invalid port")]
    InvalidPort,
    #[error("request has no Host header to resolve a target from")]
    MissingHost,
}

impl TargetError {
    pub fn code(self) -> &'static str {
        match self {
            Self::EmptyTarget => "empty_target",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::InvalidAuthority => "invalid_authority",
            Self::MissingPort => "missing_port",
            Self::InvalidPort => "invalid_port",
            Self::MissingHost => "missing_host",
        }
    }
}

/// Parses the `host:port` authority of a CONNECT request. Bracketed IPv6
/// authorities are accepted; a port is required.
pub fn parse_connect_authority(authority: &str) -> Result<(String, u16), TargetError> {
    let (host, port) = split_authority(authority)?;
    let port = port.ok_or(TargetError::MissingPort)?;
    Ok((host, port))
}

/// Resolves the upstream for a non-CONNECT proxy request. Absolute-form
/// targets carry their own scheme and authority; origin-form targets fall
/// back to the `Host` header with the port heuristic: 443 means https,
/// anything else means http.
pub fn resolve_forward_target(
    target: &str,
    host_header: Option<&str>,
) -> Result<ForwardTarget, TargetError> {
    if target.is_empty() {
        return Err(TargetError::EmptyTarget);
    }

    if let Some(rest) = target.strip_prefix("http://") {
        return resolve_absolute(TargetScheme::Http, rest);
    }
    if let Some(rest) = target.strip_prefix("https://") {
        return resolve_absolute(TargetScheme::Https, rest);
    }
    if target.contains("://") {
        return Err(TargetError::UnsupportedScheme);
    }

    let authority = host_header.ok_or(TargetError::MissingHost)?.trim();
    if authority.is_empty() {
        return Err(TargetError::MissingHost);
    }
    let (host, port) = split_authority(authority)?;
    let scheme = match port {
        Some(443) => TargetScheme::Https,
        _ => TargetScheme::Http,
    };
    let origin_form_target = if target.starts_with('/') {
        target.to_string()
    } else {
        format!("/{target}")
    };
    Ok(ForwardTarget {
        scheme,
        host,
        port: port.unwrap_or_else(|| scheme.default_port()),
        authority: authority.to_string(),
        origin_form_target,
    })
}

fn resolve_absolute(scheme: TargetScheme, rest: &str) -> Result<ForwardTarget, TargetError> {
    let (authority, origin_form_target) = match rest.find('/') {
        Some(slash) => (&rest[..slash], rest[slash..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = split_authority(authority)?;
    Ok(ForwardTarget {
        scheme,
        host,
        port: port.unwrap_or_else(|| scheme.default_port()),
        authority: authority.to_string(),
        origin_form_target,
    })
}

fn split_authority(authority: &str) -> Result<(String, Option<u16>), TargetError> {
    if authority.is_empty() {
        return Err(TargetError::InvalidAuthority);
    }

    if let Some(after_bracket) = authority.strip_prefix('[') {
        let close = after_bracket
            .find(']')
            .ok_or(TargetError::InvalidAuthority)?;
        let host = &after_bracket[..close];
        if host.is_empty() {
            return Err(TargetError::InvalidAuthority);
        }
        let suffix = &after_bracket[close + 1..];
        if suffix.is_empty() {
            return Ok((host.to_string(), None));
        }
        let port_text = suffix
            .strip_prefix(':')
            .ok_or(TargetError::InvalidAuthority)?;
        if port_text.is_empty() {
            return Err(TargetError::MissingPort);
        }
        let port = port_text
            .parse::<u16>()
            .map_err(|_| TargetError::InvalidPort)?;
        return Ok((host.to_string(), Some(port)));
    }

    match authority.rsplit_once(':') {
        Some((host, port_text)) => {
            if host.is_empty() || host.contains(':') {
                return Err(TargetError::InvalidAuthority);
            }
            if port_text.is_empty() {
                return Err(TargetError::MissingPort);
            }
            let port = port_text
                .parse::<u16>()
                .map_err(|_| TargetError::InvalidPort)?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((authority.to_string(), None)),
    }
}
