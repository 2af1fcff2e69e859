//! Client endpoint URLs
//!
//! Validates `ws://` / `wss://` URLs and fills in the defaults the handshake
//! needs (port 80/443, path `/`).

use std::fmt;
use std::str::FromStr;

use url::{Host, Url};

use crate::error::EndpointError;

/// A validated WebSocket endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
    host: String,
    port: u16,
    secure: bool,
}

impl Endpoint {
    /// Parse and validate a `ws` or `wss` URL
    pub fn parse(input: &str) -> Result<Self, EndpointError> {
        let url = Url::parse(input.trim())?;

        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => return Err(EndpointError::Scheme(other.to_string())),
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(EndpointError::MissingHost),
        };

        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });

        Ok(Self {
            url,
            host,
            port,
            secure,
        })
    }

    /// `true` for `wss://`
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Host name or address literal, without IPv6 brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, or 80/443 by scheme
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path component, `/` when empty
    pub fn path(&self) -> &str {
        match self.url.path() {
            "" => "/",
            path => path,
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    /// Request target sent in the handshake (`/path?query`)
    pub fn path_and_query(&self) -> String {
        match self.query() {
            Some(query) => format!("{}?{}", self.path(), query),
            None => self.path().to_string(),
        }
    }

    /// URI the handshake request is built from
    ///
    /// Always carries the port and a path, so the `Host` header is
    /// `host:port`; credentials and fragment are left out.
    pub fn request_uri(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{scheme}://{host}:{}{}", self.port, self.path_and_query())
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}
