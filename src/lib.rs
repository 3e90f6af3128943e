use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;

mod cmd;
pub mod http;
mod init;
pub mod relay;
mod start;

use relay::ProxyConfig;

pub async fn run() -> Result<()> {
    let shutdown = init::shutdown::init()?;
    let args = init::cmd::init()?;

    let bind_addr = args
        .bind
        .map(|b| *b)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    let backlog = args.backlog.map(|b| *b).unwrap_or(100);
    let workers = args.workers.map(|w| *w).unwrap_or(50);
    let config = ProxyConfig {
        connect_timeout: Duration::from_secs(args.timeout.map(|t| *t).unwrap_or(120)),
        upstream: args.upstream.map(|u| (u.host, u.port)),
    };

    start::serve(bind_addr, backlog, workers, config, &shutdown).await?;
    log::info!("Shutdown complete.");
    Ok(())
}
