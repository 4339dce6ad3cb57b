// Process shutdown coordination.
//
// Long-lived tasks hold a `ShutdownListener`. Triggering asks them to stop;
// `drained` resolves once every listener has been dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

#[derive(Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender: Arc::new(sender) }
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener { receiver: self.sender.subscribe() }
    }

    /// Number of tasks still holding a listener.
    pub fn listeners(&self) -> usize {
        self.sender.receiver_count()
    }

    pub async fn drained(&self) {
        self.sender.closed().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn triggered(&mut self) {
        // A dropped controller also means stop.
        let _ = self.receiver.wait_for(|stopping| *stopping).await;
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let signal = tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    };

    info!(signal, "shutdown signal received");
}

/// Exit with status 1 if the process is still alive after `grace`.
pub fn arm_force_exit(grace: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        error!(grace_ms = grace.as_millis() as u64, "graceful shutdown timed out, forcing exit");
        std::process::exit(1);
    });
}
