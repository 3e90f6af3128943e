use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bstr::BStr;
use smol::net::TcpStream;
use smol::{Timer, future};

use crate::http::parser::{HttpParser, ParseState};
use crate::relay::ProxyConfig;
use crate::relay::dial::{self, ConnectionFailed};
use crate::relay::endpoint::Endpoint;

/// A session ends once both sides have gone quiet for this long and nothing
/// is left to flush to the client.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on one readiness wait, so the idle check keeps running while
/// both sockets are silent.
const TICK: Duration = Duration::from_secs(1);

const PROXY_AGENT: &str = concat!("proxy.py v", env!("CARGO_PKG_VERSION"));

fn connection_established() -> Vec<u8> {
    format!("HTTP/1.1 200 Connection established\r\nProxy-agent: {PROXY_AGENT}\r\n\r\n")
        .into_bytes()
}

fn bad_gateway() -> Vec<u8> {
    format!(
        "HTTP/1.1 502 Bad Gateway\r\nProxy-agent: {PROXY_AGENT}\r\nContent-Length: 11\r\nConnection: close\r\n\r\nBad Gateway"
    )
    .into_bytes()
}

/// Hop-by-hop headers dropped from the outbound request.
const DEL_HEADERS: &[&[u8]] = &[b"proxy-connection", b"connection", b"keep-alive"];
const ADD_HEADERS: &[(&[u8], &[u8])] = &[(b"Connection", b"Close")];

enum Event {
    ClientWritable(io::Result<usize>),
    ServerWritable(io::Result<usize>),
    ClientReadable(Option<Vec<u8>>),
    ServerReadable(Option<Vec<u8>>),
    Tick,
}

/// One accepted client connection, proxied end to end.
///
/// The session owns the client endpoint, the server endpoint once dialed,
/// and one parser per direction. It drives a single readiness loop: at most
/// one read and one write per socket per iteration, with bytes moving
/// between the sockets only through the destination endpoint's outbound
/// buffer. Writes take priority over reads so pending buffers drain first.
pub struct ProxySession {
    client: Endpoint,
    peer: SocketAddr,
    server: Option<Endpoint>,
    target: Option<(String, u16)>,
    request: HttpParser,
    response: HttpParser,
    parse_response: bool,
    config: Arc<ProxyConfig>,
    started_at: Instant,
    last_activity: Instant,
}

impl ProxySession {
    pub fn new(stream: TcpStream, peer: SocketAddr, config: Arc<ProxyConfig>) -> Self {
        let now = Instant::now();
        Self {
            client: Endpoint::client(stream),
            peer,
            server: None,
            target: None,
            request: HttpParser::request(),
            response: HttpParser::response(),
            parse_response: true,
            config,
            started_at: now,
            last_activity: now,
        }
    }

    /// Drive the relay loop to completion, then tear down. Never propagates:
    /// every exit path closes the client and emits the access-log record.
    pub async fn run(mut self) {
        log::debug!("proxying connection from {}", self.peer);
        if let Err(err) = self.process().await {
            log::warn!("error while handling connection {}: {err:#}", self.peer);
        }
        log::debug!(
            "closing connection from {} after {:.3}s with {} bytes pending",
            self.peer,
            self.started_at.elapsed().as_secs_f64(),
            self.client.buffer_size()
        );
        self.client.close();
        self.access_log();
    }

    async fn process(&mut self) -> Result<()> {
        loop {
            match self.next_event().await {
                Event::ClientWritable(sent) => {
                    let sent = sent?;
                    self.client.consume(sent);
                }
                Event::ServerWritable(sent) => {
                    let sent = sent?;
                    if let Some(server) = &mut self.server {
                        server.consume(sent);
                    }
                }
                Event::ClientReadable(None) => {
                    log::debug!("client closed connection, breaking");
                    return Ok(());
                }
                Event::ClientReadable(Some(data)) => {
                    self.last_activity = Instant::now();
                    if let Err(err) = self.process_request(&data).await {
                        let failed = match err.downcast::<ConnectionFailed>() {
                            Ok(failed) => failed,
                            Err(err) => return Err(err),
                        };
                        log::warn!("{failed}");
                        self.client.queue(&bad_gateway());
                        let _ = self.client.flush().await;
                        return Ok(());
                    }
                }
                Event::ServerReadable(None) => {
                    // the client may still have buffered data to drain
                    log::debug!("server closed connection");
                    if let Some(server) = &mut self.server {
                        server.close();
                    }
                }
                Event::ServerReadable(Some(data)) => {
                    self.last_activity = Instant::now();
                    self.process_response(&data);
                }
                Event::Tick => {}
            }

            if !self.client.has_buffer() {
                if self.response.state() == ParseState::Complete {
                    log::debug!("client buffer is empty and response is complete, breaking");
                    return Ok(());
                }
                if self.last_activity.elapsed() > IDLE_TIMEOUT {
                    log::debug!("client buffer is empty and maximum inactivity reached, breaking");
                    return Ok(());
                }
            }
        }
    }

    /// Wait for the next ready socket operation or the tick. Writes are
    /// polled before reads, the client before the server.
    async fn next_event(&self) -> Event {
        let client_write = async {
            if self.client.has_buffer() {
                Event::ClientWritable(self.client.send().await)
            } else {
                future::pending().await
            }
        };
        let server_write = async {
            match &self.server {
                Some(server) if !server.is_closed() && server.has_buffer() => {
                    Event::ServerWritable(server.send().await)
                }
                _ => future::pending().await,
            }
        };
        let client_read = async { Event::ClientReadable(self.client.recv().await) };
        let server_read = async {
            match &self.server {
                Some(server) if !server.is_closed() => {
                    Event::ServerReadable(server.recv().await)
                }
                _ => future::pending().await,
            }
        };
        let tick = async {
            Timer::after(TICK).await;
            Event::Tick
        };

        future::or(
            client_write,
            future::or(
                server_write,
                future::or(client_read, future::or(server_read, tick)),
            ),
        )
        .await
    }

    /// Bytes read from the client. Until the server leg exists they feed the
    /// request parser; afterwards they are tunneled verbatim.
    async fn process_request(&mut self, data: &[u8]) -> Result<()> {
        if let Some(server) = &mut self.server {
            if !server.is_closed() {
                server.queue(data);
                return Ok(());
            }
        }

        self.request.feed(data)?;
        if self.request.state() != ParseState::Complete {
            return Ok(());
        }
        log::debug!("request parser is in state complete");

        let (host, port) = dial::resolve_target(&self.request, &self.config)?;
        self.target = Some((host.clone(), port));
        let mut server = dial::dial(&host, port, self.config.connect_timeout).await?;

        if self.request.is_connect() {
            // from here on the channel is a raw tunnel
            self.client.queue(&connection_established());
        } else {
            let rebuilt = self.request.rebuild(DEL_HEADERS, ADD_HEADERS);
            server.queue(&rebuilt);
        }
        self.server = Some(server);
        Ok(())
    }

    /// Bytes read from the server: parsed (unless tunneling) so the loop can
    /// detect response completion, and queued for the client regardless of
    /// the parse outcome.
    ///
    /// A malformed response (bad start line, header, or chunk size) stops
    /// further parsing but not the relay; the body then ends when the server
    /// closes.
    fn process_response(&mut self, data: &[u8]) {
        if !self.request.is_connect() && self.parse_response {
            if let Err(err) = self.response.feed(data) {
                log::warn!("response parse error from {}: {err:#}", self.peer);
                self.parse_response = false;
            }
        }
        self.client.queue(data);
    }

    fn access_log(&self) {
        let Some(method) = self.request.method() else {
            return;
        };
        let target = match &self.target {
            Some((host, port)) => format!("{host}:{port}"),
            None => String::from("-"),
        };
        if self.request.is_connect() {
            log::info!("{} - {} {}", self.peer, method, target);
        } else {
            log::info!(
                "{} - {} {}{} - {} {} - {} bytes",
                self.peer,
                method,
                target,
                self.request.build_url(),
                self.response.code().unwrap_or_else(|| BStr::new("")),
                self.response.reason().unwrap_or_else(|| BStr::new("")),
                self.response.raw_len()
            );
        }
    }
}
