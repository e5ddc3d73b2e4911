//! External cancellation for probe runs.
//!
//! An [`Interrupter`] fires once; every cloned [`InterruptListener`] observes
//! it. Dropping the interrupter without firing never cancels anything.

use tokio::sync::watch;

/// Create a connected interrupter/listener pair.
pub fn interrupt_channel() -> (Interrupter, InterruptListener) {
    let (tx, rx) = watch::channel(false);
    (Interrupter { tx }, InterruptListener { rx })
}

/// Sending half, held by whoever owns the cancellation decision (e.g. a Ctrl-C handler).
#[derive(Debug)]
pub struct Interrupter {
    tx: watch::Sender<bool>,
}

impl Interrupter {
    /// Request cancellation of every listener. Idempotent.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    /// Fire on the first Ctrl-C (SIGINT) or SIGTERM delivered to this process.
    pub fn fire_on_ctrl_c(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            tracing::info!("interrupt received, stopping probe runs");
            self.fire();
        })
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGTERM handler, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Receiving half, cloned into every supervisor and the driver.
#[derive(Debug, Clone)]
pub struct InterruptListener {
    rx: watch::Receiver<bool>,
}

impl InterruptListener {
    /// A listener that is never interrupted.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Pends forever if the
    /// interrupter is dropped without firing.
    pub async fn fired(&mut self) {
        let closed = self.rx.wait_for(|fired| *fired).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}
