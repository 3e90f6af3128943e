use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use smol::future;
use smol::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

use crate::init::shutdown::ShutdownSignal;
use crate::relay::ProxyConfig;
use crate::relay::session::ProxySession;

mod counter;

use counter::SessionCounter;

/// Accept loop: every client gets its own session task, bounded by the
/// worker pool, until shutdown is requested; then the counter drains the
/// sessions still running. Bind or listen failure is the one error that
/// escapes and terminates the process.
pub async fn serve(
    bind_addr: SocketAddr,
    backlog: u64,
    workers: u64,
    config: ProxyConfig,
    shutdown: &ShutdownSignal,
) -> Result<()> {
    let listener = bind_listener(bind_addr, backlog)?;
    log::info!("fproxy listening on {bind_addr}");

    let config = Arc::new(config);
    let sessions = SessionCounter::new(workers.max(1));

    loop {
        let Some((stream, peer)) = accept_or_shutdown(&listener, shutdown).await? else {
            break;
        };
        log::info!("accepted connection from {peer} ({} active)", sessions.get());

        let sessions = sessions.clone();
        let config = config.clone();
        smol::spawn(async move {
            let _slot = sessions.acquire().await;
            ProxySession::new(stream, peer, config).run().await;
        })
        .detach();
    }

    sessions.wait_idle().await;
    Ok(())
}

fn bind_listener(addr: SocketAddr, backlog: u64) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("failed to create the listening socket")?;
    socket.set_reuse_address(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {addr}"))?;
    socket
        .listen(backlog.min(i32::MAX as u64) as i32)
        .with_context(|| format!("failed to listen on {addr}"))?;
    socket.set_nonblocking(true)?;
    let listener: std::net::TcpListener = socket.into();
    TcpListener::try_from(listener).context("failed to register the listener with the reactor")
}

async fn accept_or_shutdown(
    listener: &TcpListener,
    shutdown: &ShutdownSignal,
) -> std::io::Result<Option<(TcpStream, SocketAddr)>> {
    let accept = async { listener.accept().await.map(Some) };
    let wait = async {
        shutdown.wait().await;
        Ok(None)
    };
    future::or(accept, wait).await
}
