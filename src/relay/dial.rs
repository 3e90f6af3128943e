use std::fmt;
use std::time::Duration;

use anyhow::Result;
use bstr::ByteSlice;
use smol::net::TcpStream;
use smol::{Timer, future};

use crate::http::parser::HttpParser;
use crate::relay::ProxyConfig;
use crate::relay::endpoint::Endpoint;

/// Dial failure toward the origin (or upstream proxy). The session turns
/// this into the 502 reply instead of tearing down silently.
#[derive(Debug)]
pub struct ConnectionFailed {
    pub host: String,
    pub port: u16,
    pub reason: String,
}

impl fmt::Display for ConnectionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connection to {}:{} failed: {}",
            self.host, self.port, self.reason
        )
    }
}

impl std::error::Error for ConnectionFailed {}

/// Where a completed request should be dialed.
///
/// CONNECT targets are the `host:port` authority carried in the URL path,
/// split on the first colon. Anything else resolves to the URL's host and
/// port (80 when absent). With an upstream proxy configured, non-443 traffic
/// is redirected to it.
pub fn resolve_target(request: &HttpParser, config: &ProxyConfig) -> Result<(String, u16)> {
    let url = request
        .url()
        .ok_or_else(|| anyhow::anyhow!("request has no target"))?;

    let (host, port) = if request.is_connect() {
        let path = url.path();
        let (host, port) = path
            .split_once_str(":")
            .ok_or_else(|| anyhow::anyhow!("CONNECT target is not host:port: {path:?}"))?;
        let port = std::str::from_utf8(port)
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| anyhow::anyhow!("CONNECT target has a bad port: {path:?}"))?;
        (host.to_vec(), port)
    } else {
        let host = url
            .hostname()
            .ok_or_else(|| anyhow::anyhow!("request target has no host"))?;
        (host.into(), url.port()?.unwrap_or(80))
    };
    let host = String::from_utf8(host)
        .map_err(|_| anyhow::anyhow!("request target host is not valid UTF-8"))?;

    if port != 443 {
        if let Some((upstream_host, upstream_port)) = &config.upstream {
            return Ok((upstream_host.clone(), *upstream_port));
        }
    }
    Ok((host, port))
}

/// Open the server leg with the given connect timeout.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<Endpoint, ConnectionFailed> {
    log::debug!("connecting to server {host}:{port}");
    let connect = async {
        TcpStream::connect((host, port))
            .await
            .map_err(|err| ConnectionFailed {
                host: host.to_string(),
                port,
                reason: err.to_string(),
            })
    };
    let deadline = async {
        Timer::after(timeout).await;
        Err(ConnectionFailed {
            host: host.to_string(),
            port,
            reason: format!("connect timed out after {}s", timeout.as_secs()),
        })
    };
    let stream = future::or(connect, deadline).await?;
    log::debug!("connected to server {host}:{port}");
    Ok(Endpoint::server(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parser::ParseState;

    fn request(head: &[u8]) -> HttpParser {
        let mut parser = HttpParser::request();
        parser.feed(head).unwrap();
        assert_eq!(parser.state(), ParseState::Complete);
        parser
    }

    fn upstream(host: &str, port: u16) -> ProxyConfig {
        ProxyConfig {
            upstream: Some((host.to_string(), port)),
            ..ProxyConfig::default()
        }
    }

    #[test]
    fn test_get_defaults_to_port_80() {
        let req = request(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let target = resolve_target(&req, &ProxyConfig::default()).unwrap();
        assert_eq!(target, ("example.com".to_string(), 80));
    }

    #[test]
    fn test_get_with_explicit_port() {
        let req = request(b"GET http://example.com:8080/x HTTP/1.1\r\n\r\n");
        let target = resolve_target(&req, &ProxyConfig::default()).unwrap();
        assert_eq!(target, ("example.com".to_string(), 8080));
    }

    #[test]
    fn test_connect_splits_on_the_first_colon() {
        let req = request(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");
        let target = resolve_target(&req, &ProxyConfig::default()).unwrap();
        assert_eq!(target, ("example.com".to_string(), 443));
    }

    #[test]
    fn test_connect_without_port_is_an_error() {
        let req = request(b"CONNECT example.com HTTP/1.1\r\n\r\n");
        assert!(resolve_target(&req, &ProxyConfig::default()).is_err());
    }

    #[test]
    fn test_upstream_overrides_plain_http() {
        let req = request(b"GET http://example.com/ HTTP/1.1\r\n\r\n");
        let target = resolve_target(&req, &upstream("upstream.test", 8899)).unwrap();
        assert_eq!(target, ("upstream.test".to_string(), 8899));
    }

    #[test]
    fn test_upstream_skips_port_443() {
        let req = request(b"CONNECT secure.test:443 HTTP/1.1\r\n\r\n");
        let target = resolve_target(&req, &upstream("upstream.test", 8899)).unwrap();
        assert_eq!(target, ("secure.test".to_string(), 443));
    }

    #[test]
    fn test_upstream_reroutes_connect_to_other_ports() {
        let req = request(b"CONNECT mail.test:8443 HTTP/1.1\r\n\r\n");
        let target = resolve_target(&req, &upstream("upstream.test", 8899)).unwrap();
        assert_eq!(target, ("upstream.test".to_string(), 8899));
    }

    #[test]
    fn test_dial_refused_port_reports_connection_failed() {
        smol::block_on(async {
            // bind then drop to find a port with no listener
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);

            let err = dial("127.0.0.1", port, Duration::from_secs(5))
                .await
                .unwrap_err();
            assert_eq!(err.host, "127.0.0.1");
            assert_eq!(err.port, port);
        });
    }
}
