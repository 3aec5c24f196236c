#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ws,
    Wss,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Wss)
    }
}

/// Endpoint of a connection, owned so it can outlive the input string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl WsUrl {
    /// Value of the `Host` request header; the port is only spelled out when
    /// it differs from the scheme default.
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum UrlError {
    #[error("URL must start with ws:// or wss://")]
    Scheme,
    #[error("missing host")]
    Host,
    #[error("invalid port")]
    Port,
}

pub fn parse_ws_or_wss(input: &str) -> Result<WsUrl, UrlError> {
    let (scheme, rest) = if let Some(s) = input.strip_prefix("wss://") {
        (Scheme::Wss, s)
    } else if let Some(s) = input.strip_prefix("ws://") {
        (Scheme::Ws, s)
    } else {
        return Err(UrlError::Scheme);
    };

    let (host_port, path) = match rest.find(['/', '?']) {
        Some(i) if rest[i..].starts_with('?') => (&rest[..i], format!("/{}", &rest[i..])),
        Some(i) => (&rest[..i], rest[i..].to_owned()),
        None => (rest, "/".to_owned()),
    };

    let (host, port) = match host_port.rsplit_once(':') {
        // bracketed IPv6 literal without a port, e.g. `[::1]`
        Some((h, _)) if h.starts_with('[') && !h.ends_with(']') => {
            (host_port, scheme.default_port())
        }
        Some((h, p)) => (h, p.parse().map_err(|_| UrlError::Port)?),
        None => (host_port, scheme.default_port()),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(UrlError::Host);
    }

    Ok(WsUrl {
        scheme,
        host: host.to_owned(),
        port,
        path,
    })
}
