use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;

/// Process-wide shutdown flag. Periodic loops check it on each wake and
/// running pipelines sample it every second and on every stream chunk.
#[derive(Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking every second so a shutdown request is
    /// never ignored for longer than that. Returns true if shutdown was
    /// requested while sleeping.
    pub async fn sleep_interruptible(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_triggered() {
                return true;
            }
            let step = remaining.min(Duration::from_secs(1));
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
        self.is_triggered()
    }
}

/// Installs SIGINT/SIGTERM handlers that flip the shutdown flag.
pub fn listen_for_signals(shutdown: Shutdown) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Shutdown signal received, stopping background work");
        shutdown.trigger();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_returns_early_on_shutdown() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();

        let handle = tokio::spawn(async move {
            waiter.sleep_interruptible(Duration::from_secs(60)).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();

        let interrupted = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sleep did not observe shutdown in time")
            .unwrap();
        assert!(interrupted);
    }

    #[tokio::test]
    async fn sleep_runs_to_completion_without_shutdown() {
        let shutdown = Shutdown::new();
        let interrupted = shutdown.sleep_interruptible(Duration::from_millis(10)).await;
        assert!(!interrupted);
    }
}
