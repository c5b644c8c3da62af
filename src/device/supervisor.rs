//! ReconnectSupervisor - keeps a [`DeviceMonitor`] running for the process lifetime
//!
//! Every session end (removal, open failure, read error) leads back to
//! discovery after an exponential backoff. A session that stayed `Connected`
//! for at least the stable-run threshold resets the backoff; every other
//! session counts as a failure and doubles it up to the cap.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DeviceMonitor, DialBackend};

/// Backoff bounds for reconnection attempts
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after a stable session, and the base of the doubling
    pub base_delay: Duration,
    /// Backoff caps at this value
    pub max_delay: Duration,
    /// A connected session must last this long to reset the backoff
    pub stable_run_threshold: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(25), Duration::from_secs(60))
    }
}

impl RetryConfig {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            stable_run_threshold: Duration::from_secs(2),
        }
    }
}

/// Exponential backoff state: after N consecutive failures the next delay
/// is `min(base * 2^N, max)`
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Consecutive failures since the last successful session
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn delay(&self) -> Duration {
        2u32.checked_pow(self.attempt)
            .and_then(|factor| self.config.base_delay.checked_mul(factor))
            .map_or(self.config.max_delay, |delay| delay.min(self.config.max_delay))
    }

    /// Count a failed attempt and return the delay before the next one
    pub fn record_failure(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay()
    }

    /// Forget past failures and return the base delay
    pub fn reset(&mut self) -> Duration {
        self.attempt = 0;
        self.delay()
    }
}

pub struct ReconnectSupervisor<B: DialBackend> {
    monitor: DeviceMonitor<B>,
    config: RetryConfig,
    shutdown: CancellationToken,
}

impl<B: DialBackend> ReconnectSupervisor<B> {
    pub fn new(monitor: DeviceMonitor<B>, config: RetryConfig, shutdown: CancellationToken) -> Self {
        Self {
            monitor,
            config,
            shutdown,
        }
    }

    pub fn monitor(&self) -> &DeviceMonitor<B> {
        &self.monitor
    }

    /// Discover, run a session, back off, repeat. Returns only on shutdown.
    pub async fn run(self) {
        let name = self.monitor.backend().name();
        let mut backoff = Backoff::new(self.config.clone());

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if !self.monitor.wait_for_device(&self.shutdown).await {
                break;
            }

            let started = tokio::time::Instant::now();
            let outcome = self.monitor.run_session(&self.shutdown).await;
            if self.shutdown.is_cancelled() {
                break;
            }

            let ran_for = started.elapsed();
            let delay = if outcome.connected && ran_for >= self.config.stable_run_threshold {
                if backoff.attempt() > 0 {
                    info!("{}: ran for {:?}, resetting backoff", name, ran_for);
                }
                backoff.reset()
            } else {
                let delay = backoff.record_failure();
                if backoff.attempt() > 1 {
                    warn!(
                        "{}: {} consecutive failures, retrying in {:?}",
                        name,
                        backoff.attempt(),
                        delay
                    );
                }
                delay
            };
            debug!("{}: reconnecting in {:?}", name, delay);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("{}: device supervisor stopped", name);
    }
}
