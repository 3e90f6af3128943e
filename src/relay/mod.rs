use std::time::Duration;

pub mod dial;
pub mod endpoint;
pub mod session;

/// Process-wide proxy settings, fixed at startup and shared by every
/// session.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Connect timeout for the server leg.
    pub connect_timeout: Duration,
    /// Second-hop proxy; when set, non-443 traffic is dialed here instead of
    /// the request target.
    pub upstream: Option<(String, u16)>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(120),
            upstream: None,
        }
    }
}
