use std::sync::{Arc, Mutex};
use futures::StreamExt;
use log::{debug, info};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::device::constants::{HEARTBEAT_LOG_INTERVAL, HEARTBEAT_MARKER};
use crate::device::transport::NotificationStream;

/// Time of the most recent heartbeat, shared between the monitor task and the connection manager.
#[derive(Debug, Clone, Default)]
pub struct LastHeartbeat {
    inner: Arc<Mutex<Option<Instant>>>,
}

impl LastHeartbeat {
    pub fn get(&self) -> Option<Instant> {
        *self.inner.lock().expect("Failed to lock last heartbeat")
    }

    fn set(&self, at: Instant) {
        *self.inner.lock().expect("Failed to lock last heartbeat") = Some(at);
    }
}

/// Records heartbeat notifications from the peripheral. Purely observational: a silent heartbeat is
/// not treated as a lost link, only the transport's link events are.
pub struct HeartbeatMonitor {
    last_heartbeat: LastHeartbeat,
    last_log: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(last_heartbeat: LastHeartbeat) -> Self {
        HeartbeatMonitor { last_heartbeat, last_log: None }
    }

    /// Returns true if `data` is a heartbeat.
    pub fn observe(&mut self, data: &[u8], now: Instant) -> bool {
        if data.first() != Some(&HEARTBEAT_MARKER) {
            return false;
        }

        self.last_heartbeat.set(now);

        let should_log = match self.last_log {
            None => true,
            Some(last_log) => now.duration_since(last_log) > HEARTBEAT_LOG_INTERVAL,
        };
        if should_log {
            info!("Heartbeat received; connection healthy");
            self.last_log = Some(now);
        }

        true
    }

    pub fn spawn(mut self, cancel: CancellationToken, mut notifications: NotificationStream) -> JoinHandle<()> {
        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    data = notifications.next() => match data {
                        Some(data) => {
                            self.observe(&data, Instant::now());
                        },
                        None => {
                            debug!("Heartbeat notification stream ended");
                            break 'mainloop;
                        },
                    },
                }
            }
        })
    }
}
