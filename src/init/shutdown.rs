//! Ctrl-C wiring: a one-shot signal the accept loop races against. Draining
//! the sessions that are still running is the session counter's job.

use std::sync::Arc;

use anyhow::{Context, Result};
use mea::latch::Latch;

/// One-shot shutdown signal. `trigger` releases every `wait` caller, present
/// and future.
#[derive(Clone, Debug)]
pub(crate) struct ShutdownSignal {
    latch: Arc<Latch>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            latch: Arc::new(Latch::new(1)),
        }
    }

    pub fn trigger(&self) {
        self.latch.count_down();
    }

    pub async fn wait(&self) {
        self.latch.wait().await;
    }
}

pub fn init() -> Result<ShutdownSignal> {
    let ctrlc = ctrlc2::AsyncCtrlC::new(|| {
        println!("Ctrl-C received, shutting down...");
        true
    })
    .context("failed to install the Ctrl-C handler")?;

    let signal = ShutdownSignal::new();
    let signal_for_ctrlc = signal.clone();
    smol::spawn(async move {
        let _ = ctrlc.await;
        log::info!("Shutdown requested (Ctrl+C). Draining active sessions...");
        signal_for_ctrlc.trigger();
    })
    .detach();
    Ok(signal)
}
