use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::device::constants::{BACKOFF_SCHEDULE, MAX_RECONNECT_ATTEMPTS, RELEASE_SETTLE};
use crate::device::types::DeviceHandle;
use crate::error::{ConnectError, ReconnectError};

/// Counts reconnection attempts and maps them onto the backoff schedule. The last scheduled delay
/// repeats once the schedule is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    attempt_count: u32,
    max_attempts: u32,
    schedule: Vec<Duration>,
}

impl RetryBudget {
    pub fn new(max_attempts: u32, schedule: Vec<Duration>) -> Self {
        assert!(!schedule.is_empty(), "backoff schedule must not be empty");
        RetryBudget { attempt_count: 0, max_attempts, schedule }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Delay before the given attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) as usize - 1).min(self.schedule.len() - 1);
        self.schedule[index]
    }

    /// Consumes one attempt. Returns the attempt number and the delay to wait before it, or `None`
    /// when no attempts are left.
    pub fn begin_attempt(&mut self) -> Option<(u32, Duration)> {
        if self.is_exhausted() {
            return None;
        }

        self.attempt_count += 1;
        Some((self.attempt_count, self.delay_for(self.attempt_count)))
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        RetryBudget::new(MAX_RECONNECT_ATTEMPTS, BACKOFF_SCHEDULE.to_vec())
    }
}

/// The operations a recovery run needs from the link it is recovering.
#[async_trait]
pub trait Relink: Clone + Send + Sync + 'static {
    /// Tears down everything held for the previous link.
    async fn release_link(&self);

    /// Connects to the last known device directly, without discovery.
    async fn reconnect_cached(&self) -> Result<DeviceHandle, ConnectError>;

    /// Full discovery and connect.
    async fn connect(&self) -> Result<DeviceHandle, ConnectError>;

    async fn mark_reconnecting(&self);

    /// Whether the link is up right now.
    fn is_linked(&self) -> bool;

    /// Starts a new run. Called when the link dropped while a finishing run still held the gate.
    fn relink(&self);

    async fn recovered(&self, device: &DeviceHandle);

    async fn gave_up(&self, attempts: u32);
}

pub type ReconnectResult = Result<u32, ReconnectError>;

/// Runs at most one recovery at a time. A trigger while a run is active is dropped, not queued.
pub struct ReconnectionController {
    gate: Arc<tokio::sync::Mutex<()>>,
    budget: Arc<Mutex<RetryBudget>>,
    settle: Duration,
    task: Mutex<Option<JoinHandle<ReconnectResult>>>,
}

async fn wait(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

async fn run<L: Relink>(link: L, budget: Arc<Mutex<RetryBudget>>, settle: Duration, cancel: CancellationToken) -> ReconnectResult {
    let max_attempts = {
        let mut budget = budget.lock().expect("Failed to lock retry budget");
        if budget.is_exhausted() {
            // a previous run gave up; this is a new run with a fresh budget
            budget.reset();
        }
        budget.max_attempts()
    };

    loop {
        let next = budget.lock().expect("Failed to lock retry budget").begin_attempt();
        let (attempt, delay) = match next {
            Some(next) => next,
            None => break,
        };

        link.mark_reconnecting().await;
        info!(
            "Reconnection attempt {}/{} in {}",
            attempt,
            max_attempts,
            humantime::format_duration(delay + settle),
        );

        // release first, so the host stack has the whole delay to free its handles
        link.release_link().await;

        if !wait(settle, &cancel).await || !wait(delay, &cancel).await {
            info!("Reconnection cancelled");
            return Err(ReconnectError::Cancelled);
        }

        let result = match link.reconnect_cached().await {
            Ok(device) => Ok(device),
            Err(err) => {
                warn!("Reconnecting to the cached device failed ({}); performing full scan", err);
                if cancel.is_cancelled() {
                    return Err(ReconnectError::Cancelled);
                }
                link.connect().await
            },
        };

        match result {
            Ok(device) if !link.is_linked() => {
                warn!("Link to {} dropped right after attempt {}/{}", device, attempt, max_attempts);
                if cancel.is_cancelled() {
                    return Err(ReconnectError::Cancelled);
                }
            },
            Ok(device) => {
                info!("Reconnected to {} after {} attempts", device, attempt);
                link.recovered(&device).await;
                return Ok(attempt);
            },
            Err(err) => {
                warn!("Reconnection attempt {}/{} failed: {}", attempt, max_attempts, err);
                if cancel.is_cancelled() {
                    return Err(ReconnectError::Cancelled);
                }
            },
        }
    }

    error!("Failed to reconnect after {} attempts", max_attempts);
    link.gave_up(max_attempts).await;
    Err(ReconnectError::ReconnectExhausted { attempts: max_attempts })
}

impl ReconnectionController {
    pub fn new(budget: RetryBudget, settle: Duration) -> Self {
        ReconnectionController {
            gate: Arc::new(tokio::sync::Mutex::new(())),
            budget: Arc::new(Mutex::new(budget)),
            settle,
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    pub fn attempts(&self) -> u32 {
        self.budget.lock().expect("Failed to lock retry budget").attempts()
    }

    pub fn reset_budget(&self) {
        self.budget.lock().expect("Failed to lock retry budget").reset();
    }

    /// Starts a recovery run unless one is already active. Returns whether a run was started.
    pub fn trigger<L: Relink>(&self, link: L, cancel: CancellationToken) -> bool {
        let guard = match self.gate.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Reconnection already running");
                return false;
            },
        };

        let budget = self.budget.clone();
        let settle = self.settle;
        let handle = spawn(async move {
            let result = run(link.clone(), budget, settle, cancel.clone()).await;
            drop(guard);

            // a drop reported while the gate was still held could not start a run of its own
            if result.is_ok() && !cancel.is_cancelled() && !link.is_linked() {
                warn!("Link dropped while reconnection was finishing");
                link.relink();
            }
            result
        });

        let previous = self.task.lock().expect("Failed to lock reconnection task").replace(handle);
        if let Some(previous) = previous {
            if !previous.is_finished() {
                debug!("Replaced a reconnection task that is still finishing");
            }
        }

        true
    }

    /// Waits for the current run, if any, and returns its outcome.
    pub async fn join(&self) -> Option<ReconnectResult> {
        let handle = self.task.lock().expect("Failed to lock reconnection task").take()?;

        match handle.await {
            Ok(result) => Some(result),
            Err(err) => {
                error!("Reconnection task failed: {:?}", err);
                None
            },
        }
    }
}

impl Default for ReconnectionController {
    fn default() -> Self {
        ReconnectionController::new(RetryBudget::default(), RELEASE_SETTLE)
    }
}
