use std::fmt;
use std::io;
use std::net::Shutdown;

use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;

/// Upper bound for a single socket read.
pub const RECV_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// One side of a proxied connection: the socket plus an outbound byte queue.
///
/// Reads and writes are single syscalls; the session's readiness loop
/// decides when to issue them. A partial write leaves the remainder queued
/// for the next round.
#[derive(Debug)]
pub struct Endpoint {
    role: Role,
    stream: TcpStream,
    buffer: Vec<u8>,
    closed: bool,
}

impl Endpoint {
    pub fn client(stream: TcpStream) -> Self {
        Self::new(Role::Client, stream)
    }

    pub fn server(stream: TcpStream) -> Self {
        Self::new(Role::Server, stream)
    }

    fn new(role: Role, stream: TcpStream) -> Self {
        Self {
            role,
            stream,
            buffer: Vec::new(),
            closed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_buffer(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// One socket read of up to [`RECV_SIZE`] bytes. `None` means the peer
    /// closed or the read failed; either way this side is done.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; RECV_SIZE];
        let mut reader = self.stream.clone();
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::debug!("recvd 0 bytes from {}", self.role);
                None
            }
            Ok(n) => {
                log::debug!("rcvd {n} bytes from {}", self.role);
                buf.truncate(n);
                Some(buf)
            }
            Err(err) => {
                log::warn!("error while receiving from {}: {err}", self.role);
                None
            }
        }
    }

    /// One socket write from the front of the outbound buffer; returns how
    /// many bytes the socket accepted.
    pub async fn send(&self) -> io::Result<usize> {
        let mut writer = self.stream.clone();
        writer.write(&self.buffer).await
    }

    /// Drop exactly the prefix a completed [`send`](Endpoint::send) reported
    /// as accepted.
    pub fn consume(&mut self, sent: usize) {
        self.buffer.drain(..sent);
        log::debug!("flushed {sent} bytes to {}", self.role);
    }

    /// One send, remainder stays queued.
    pub async fn flush(&mut self) -> io::Result<()> {
        let sent = self.send().await?;
        self.consume(sent);
        Ok(())
    }

    pub fn queue(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Shut the socket down both ways; safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.closed = true;
    }
}
