use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("now() is not later than UNIX_EPOCH")
        .as_secs()
}

pub struct HeartbeatMonitor {
    shared_heartbeat: Arc<AtomicU64>,
    max_age: Duration,
}

#[derive(Clone)]
pub struct HeartbeatUpdater {
    shared_heartbeat: Arc<AtomicU64>,
}

/// Initializes and returns both a [`HeartbeatMonitor`] and [`HeartbeatUpdater`].
/// The scheduler loop refreshes the updater each tick; the liveness endpoint
/// asks the monitor whether the last refresh is within `max_age`.
pub fn start(max_age: Duration) -> (HeartbeatMonitor, HeartbeatUpdater) {
    let heartbeat = Arc::new(AtomicU64::new(current_timestamp()));

    let heartbeat_monitor = HeartbeatMonitor {
        shared_heartbeat: heartbeat.clone(),
        max_age,
    };
    let heartbeat_updater = HeartbeatUpdater {
        shared_heartbeat: heartbeat,
    };

    (heartbeat_monitor, heartbeat_updater)
}

impl HeartbeatMonitor {
    pub fn is_heartbeat_active(&self) -> bool {
        let last_update = self.shared_heartbeat.load(Ordering::Relaxed);
        let current_time = current_timestamp();

        if current_time >= last_update {
            let elapsed = Duration::from_secs(current_time - last_update);
            elapsed < self.max_age
        } else {
            // System time went backwards or clock drift, consider the heartbeat stale
            false
        }
    }
}

impl HeartbeatUpdater {
    pub fn update_heartbeat(&self) {
        self.shared_heartbeat
            .store(current_timestamp(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::heartbeat;

    #[tokio::test]
    async fn check_heartbeat_monitor() {
        let (monitor, updater) = heartbeat::start(Duration::from_secs(2));

        // Alive since there's been an update within the window
        assert!(monitor.is_heartbeat_active());

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(monitor.is_heartbeat_active(), false);
        updater.update_heartbeat();

        assert!(monitor.is_heartbeat_active());
    }
}
