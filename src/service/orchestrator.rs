use std::time::Duration;
use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::device::connection::ConnectionManager;
use crate::device::types::DeviceEvent;
use crate::error::{ConnectError, SendError};
use crate::status::source::StatusSource;
use crate::status::types::StatusCode;

/**
 * Unchanged status is re-sent this often. The radio link is torn down after roughly 50-60 seconds
 * without traffic.
 */
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/**
 * How often the status source is polled by default.
 */
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/**
 * Wait after a failed tick before polling again.
 */
pub const ERROR_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub check_interval: Duration,
    pub keepalive_interval: Duration,
    pub error_cooldown: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            check_interval: DEFAULT_CHECK_INTERVAL,
            keepalive_interval: KEEPALIVE_INTERVAL,
            error_cooldown: ERROR_COOLDOWN,
        }
    }
}

/// Mirrors the status source onto the peripheral: sends on change, keeps the link alive with
/// periodic resends, and restores the status after the link was recovered.
pub struct StatusDeliveryOrchestrator<S: StatusSource> {
    source: S,
    manager: ConnectionManager,
    config: DeliveryConfig,
    last_sent: StatusCode,
    last_send_time: Option<Instant>,
}

impl<S: StatusSource> StatusDeliveryOrchestrator<S> {
    pub fn new(source: S, manager: ConnectionManager, config: DeliveryConfig) -> Self {
        StatusDeliveryOrchestrator {
            source,
            manager,
            config,
            last_sent: StatusCode::Unknown,
            last_send_time: None,
        }
    }

    pub fn last_sent(&self) -> StatusCode {
        self.last_sent
    }

    /// Connects and then runs until `cancel` fires. Returns an error only when the initial connect
    /// fails; a link lost later is recovered in the background. `cancel` must be the shutdown token
    /// the manager was built with, or a parent of it.
    pub async fn start(mut self, cancel: CancellationToken) -> Result<(), ConnectError> {
        // subscribe before connecting, so no recovery event can be missed
        let mut events = self.manager.subscribe();

        // connect() watches the shutdown token itself and releases whatever it had opened
        match self.manager.connect().await {
            Ok(device) => info!("Connected to {}", device),
            Err(ConnectError::Cancelled) => {
                info!("Cancelled before the peripheral was connected");
                self.manager.close().await;
                return Ok(());
            },
            Err(err) => {
                error!("Failed to connect to {:?}: {}", self.manager.device_name(), err);
                self.manager.mark_failed().await;
                return Err(err);
            },
        }

        info!(
            "Monitoring status; check interval {}, keepalive {}",
            humantime::format_duration(self.config.check_interval),
            humantime::format_duration(self.config.keepalive_interval),
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'mainloop: loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = events.recv() => match event {
                    Ok(DeviceEvent::Reconnected) => self.resend_after_reconnect().await,
                    Ok(DeviceEvent::ReconnectExhausted { attempts }) => {
                        warn!("Peripheral unreachable after {} attempts; status will be delivered once it is back", attempts);
                    },
                    Err(RecvError::Lagged(missed)) => warn!("Missed {} device events", missed),
                    Err(RecvError::Closed) => {
                        error!("Device event channel closed");
                        break 'mainloop;
                    },
                },
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!("Error in status loop: {}", err);

                        tokio::select! {
                            _ = cancel.cancelled() => break 'mainloop,
                            _ = sleep(self.config.error_cooldown) => {},
                        }
                    }
                },
            }
        }

        info!("Shutting down");
        if let Some(Err(err)) = self.manager.close().await {
            debug!("Reconnection ended with: {}", err);
        }
        Ok(())
    }

    /// One poll of the status source and, when needed, one transmission.
    pub async fn tick(&mut self) -> Result<(), SendError> {
        let current = self.source.current_status();

        let since_last_send = self.last_send_time.map(|time| time.elapsed());
        let needs_keepalive = since_last_send.map_or(true, |elapsed| elapsed >= self.config.keepalive_interval)
            && self.last_sent.is_known()
            && self.manager.is_connected();
        let changed = current != self.last_sent && current.is_known();

        if !changed && !needs_keepalive {
            return Ok(());
        }

        let status = if current.is_known() { current } else { self.last_sent };

        match self.transmit(status).await {
            Ok(()) if changed => {
                info!("Sent: {} (code: {})", status, status as u8);
                Ok(())
            },
            Ok(()) => {
                debug!("Keepalive: {}", status);
                Ok(())
            },
            Err(SendError::NotConnected) => {
                debug!("Not connected; {} not delivered", status);
                self.manager.ensure_reconnecting();
                Ok(())
            },
            Err(err) => {
                self.manager.ensure_reconnecting();
                Err(err)
            },
        }
    }

    async fn transmit(&mut self, status: StatusCode) -> Result<(), SendError> {
        let byte = match status.wire_byte() {
            Some(byte) => byte,
            None => {
                debug!("Not sending {}", status);
                return Ok(());
            },
        };

        self.manager.send(byte).await?;
        self.last_sent = status;
        self.last_send_time = Some(Instant::now());
        Ok(())
    }

    async fn resend_after_reconnect(&mut self) {
        if !self.last_sent.is_known() {
            return;
        }

        let status = self.last_sent;
        info!("Resending last status after reconnection: {}", status);

        match self.transmit(status).await {
            Ok(()) => info!("Restored: {} (code: {})", status, status as u8),
            Err(err) => {
                warn!("Failed to restore {}: {}", status, err);
                self.manager.ensure_reconnecting();
            },
        }
    }
}
