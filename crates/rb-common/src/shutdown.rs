//! Process-wide shutdown broadcast, fanned out to every long-lived task.

use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        // No receivers is not an error: some components may not have
        // subscribed yet, or all have already exited.
        let _ = self.tx.send(());
    }

    /// Spawn a task that waits for SIGINT and triggers shutdown.
    pub fn listen_for_sigint(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            use signal_hook::consts::SIGINT;
            use signal_hook_tokio::Signals;
            use tokio_stream::StreamExt;

            let mut signals = match Signals::new([SIGINT]) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to register SIGINT handler: {}", e);
                    return;
                }
            };

            if signals.next().await.is_some() {
                info!("received SIGINT, shutting down");
                shutdown.trigger();
            }
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_subscriber() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        shutdown.trigger();
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_trigger_with_no_subscribers_does_not_panic() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
    }
}
