//! Client key derivation.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request};

/// Key used when a request carries no address information at all.
const UNKNOWN_CLIENT: &str = "unknown";

/// The identity a quota is tracked against.
///
/// By default this is the remote IP address with the port stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a key from a raw remote address string.
    ///
    /// `ip:port` and bare IPs are reduced to the IP; anything else is kept
    /// verbatim so the derivation never fails.
    pub fn from_remote_addr(addr: &str) -> Self {
        let addr = addr.trim();

        if let Ok(socket) = addr.parse::<SocketAddr>() {
            return Self(socket.ip().to_string());
        }

        if let Ok(ip) = addr.parse::<IpAddr>() {
            return Self(ip.to_string());
        }

        Self(addr.to_string())
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The effective remote address of a request, as a raw string.
///
/// Inserted by the real-IP middleware. When the gateway trusts a reverse
/// proxy this holds the forwarded client address, otherwise the peer
/// socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

/// Derives a [`ClientKey`] from an inbound request.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, request: &Request) -> ClientKey;
}

/// Keys requests by their remote IP address.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteAddrKey;

impl KeyExtractor for RemoteAddrKey {
    fn extract(&self, request: &Request) -> ClientKey {
        let extensions = request.extensions();

        if let Some(RemoteAddr(addr)) = extensions.get::<RemoteAddr>() {
            return ClientKey::from_remote_addr(addr);
        }

        if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
            return ClientKey::new(addr.ip().to_string());
        }

        ClientKey::new(UNKNOWN_CLIENT)
    }
}
