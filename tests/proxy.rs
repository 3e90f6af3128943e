use std::sync::Arc;
use std::time::Duration;

use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::{TcpListener, TcpStream};
use smol::{Timer, future};

use fproxy::relay::ProxyConfig;
use fproxy::relay::session::ProxySession;

const PROXY_AGENT: &str = concat!("proxy.py v", env!("CARGO_PKG_VERSION"));

/// Connected client socket plus a running session serving its other end.
async fn connect_session(config: ProxyConfig) -> (TcpStream, smol::Task<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted, client) = future::zip(listener.accept(), TcpStream::connect(addr)).await;
    let (stream, peer) = accepted.unwrap();
    let task = smol::spawn(ProxySession::new(stream, peer, Arc::new(config)).run());
    (client.unwrap(), task)
}

async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = stream.read(&mut tmp).await.unwrap();
        assert!(n > 0, "peer closed before the end of the headers");
        head.extend_from_slice(&tmp[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return head;
        }
    }
}

fn refused_port() -> u16 {
    // bind then drop to find a port nothing listens on
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[test]
fn test_simple_get_is_rewritten_and_response_piped_back() {
    smol::block_on(async {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();

        let origin_task = smol::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            let expected = format!(
                "GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\nX-Trace: t\r\nConnection: Close\r\n\r\n"
            );
            assert_eq!(head, expected.as_bytes());
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
            stream.flush().await.unwrap();
        });

        let (mut client, session) = connect_session(ProxyConfig::default()).await;
        let request = format!(
            "GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\nProxy-Connection: keep-alive\r\nKeep-Alive: 300\r\nX-Trace: t\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");

        origin_task.await;
        session.await;
    });
}

#[test]
fn test_connect_tunnel_passes_bytes_verbatim() {
    smol::block_on(async {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();

        let origin_task = smol::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
            stream.flush().await.unwrap();
            // the tunnel stays up until the client goes away
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        });

        let (mut client, session) = connect_session(ProxyConfig::default()).await;
        let request = format!("CONNECT {origin_addr} HTTP/1.1\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let established =
            format!("HTTP/1.1 200 Connection established\r\nProxy-agent: {PROXY_AGENT}\r\n\r\n");
        let mut reply = vec![0u8; established.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, established.as_bytes());

        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");

        drop(client);
        session.await;
        origin_task.await;
    });
}

#[test]
fn test_dial_failure_returns_the_502_payload() {
    smol::block_on(async {
        let port = refused_port();

        let (mut client, session) = connect_session(ProxyConfig::default()).await;
        let request =
            format!("GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let expected = format!(
            "HTTP/1.1 502 Bad Gateway\r\nProxy-agent: {PROXY_AGENT}\r\nContent-Length: 11\r\nConnection: close\r\n\r\nBad Gateway"
        );
        assert_eq!(response, expected.as_bytes());

        session.await;
    });
}

#[test]
fn test_chunked_response_reaches_the_client_unchanged() {
    smol::block_on(async {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();

        let origin_task = smol::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let _head = read_head(&mut stream).await;
            // two writes so the session sees the body fragmented
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel")
                .await
                .unwrap();
            stream.flush().await.unwrap();
            Timer::after(Duration::from_millis(20)).await;
            stream.write_all(b"lo\r\n0\r\n\r\n").await.unwrap();
            stream.flush().await.unwrap();
        });

        let (mut client, session) = connect_session(ProxyConfig::default()).await;
        let request = format!("GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(
            response,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
        );

        origin_task.await;
        session.await;
    });
}

#[test]
fn test_malformed_chunk_size_keeps_relaying() {
    smol::block_on(async {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();

        let payload: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nXYZ\r\nnot a chunk";
        let origin_task = smol::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let _head = read_head(&mut stream).await;
            stream.write_all(payload).await.unwrap();
            stream.flush().await.unwrap();
            // the session must keep the leg open despite the bad framing
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        });

        let (mut client, session) = connect_session(ProxyConfig::default()).await;
        let request = format!("GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        // every server byte still reaches the client
        let mut relayed = vec![0u8; payload.len()];
        client.read_exact(&mut relayed).await.unwrap();
        assert_eq!(relayed, payload);

        drop(client);
        session.await;
        origin_task.await;
    });
}

#[test]
fn test_upstream_proxy_receives_non_443_traffic() {
    smol::block_on(async {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let upstream_task = smol::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let head = read_head(&mut stream).await;
            // the request line still carries the absolute URL of the real target
            let expected =
                b"GET http://unroutable.test/ HTTP/1.1\r\nHost: unroutable.test\r\nConnection: Close\r\n\r\n";
            assert_eq!(head, expected);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            stream.flush().await.unwrap();
        });

        let config = ProxyConfig {
            upstream: Some((upstream_addr.ip().to_string(), upstream_addr.port())),
            ..ProxyConfig::default()
        };
        let (mut client, session) = connect_session(config).await;
        client
            .write_all(b"GET http://unroutable.test/ HTTP/1.1\r\nHost: unroutable.test\r\n\r\n")
            .await
            .unwrap();
        client.flush().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

        upstream_task.await;
        session.await;
    });
}
