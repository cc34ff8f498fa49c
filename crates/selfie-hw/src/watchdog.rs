//! Frame-health watchdog.
//!
//! Every tick checks that the camera reports non-zero frame dimensions and a
//! live, unmuted track. Three failed checks in a row trigger a restart with
//! loosened constraints; once the restart budget is spent, the next failure
//! streak is terminal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::camera::{CameraError, CameraSession, HealthSignals, PlaybackState};
use crate::media::TrackEvent;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WatchdogConfig {
    pub interval: Duration,
    /// Consecutive failed checks that trigger a restart.
    pub strike_limit: u32,
    pub max_restarts: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            strike_limit: 3,
            max_restarts: 3,
        }
    }
}

/// Watchdog bookkeeping. `restarts_used` never decreases within a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraHealth {
    pub consecutive_failures: u32,
    pub restarts_used: u32,
    pub last_known_frame_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    Healthy,
    /// Failed check; carries the current streak.
    Strike(u32),
    /// Streak hit the limit and budget remains; restart now.
    Restart,
    /// Streak hit the limit with the budget exhausted.
    Unrecoverable,
}

pub struct FrameWatchdog {
    config: WatchdogConfig,
    health: CameraHealth,
}

impl FrameWatchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            health: CameraHealth::default(),
        }
    }

    /// Continue supervising with a previous watchdog's restart count. The
    /// failure streak starts over.
    pub fn resume(config: WatchdogConfig, previous: &CameraHealth) -> Self {
        Self {
            config,
            health: CameraHealth {
                consecutive_failures: 0,
                restarts_used: previous.restarts_used,
                last_known_frame_at: previous.last_known_frame_at,
            },
        }
    }

    pub fn health(&self) -> &CameraHealth {
        &self.health
    }

    /// Evaluate one set of health signals.
    pub fn check(&mut self, signals: &HealthSignals, now: Instant) -> WatchdogVerdict {
        if signals.is_healthy() {
            self.health.consecutive_failures = 0;
            self.health.last_known_frame_at = Some(now);
            return WatchdogVerdict::Healthy;
        }

        self.health.consecutive_failures += 1;
        let strikes = self.health.consecutive_failures;
        tracing::debug!(
            strikes,
            dimensions = ?signals.dimensions,
            track = ?signals.track,
            "watchdog: frame check failed"
        );
        if strikes < self.config.strike_limit {
            return WatchdogVerdict::Strike(strikes);
        }

        if self.health.restarts_used >= self.config.max_restarts {
            return WatchdogVerdict::Unrecoverable;
        }
        self.health.restarts_used += 1;
        self.health.consecutive_failures = 0;
        WatchdogVerdict::Restart
    }

    /// Supervise `camera` until cancelled.
    ///
    /// Checks run on a fixed `interval` cadence. Track events are only
    /// logged; the health drop they report is picked up by the next tick.
    /// A restart holds the camera write lock for the whole teardown and
    /// reacquire, so frame readers wait it out. Returns
    /// `Err(CameraUnrecoverable)` once the restart budget is exhausted; the
    /// camera is torn down first.
    pub async fn run(
        mut self,
        camera: Arc<RwLock<CameraSession>>,
        mut events: mpsc::UnboundedReceiver<TrackEvent>,
        health_tx: &watch::Sender<CameraHealth>,
        cancel: CancellationToken,
    ) -> Result<(), CameraError> {
        tracing::debug!(interval_ms = self.config.interval.as_millis() as u64, "watchdog started");
        let mut ticks = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.interval,
            self.config.interval,
        );
        // A restart can outlast several ticks; never burst to catch up.
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {}
                Some(event) = events.recv() => {
                    tracing::info!(?event, "watchdog: camera track event");
                    continue;
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            let signals = camera.read().await.health_signals();
            let now = tokio::time::Instant::now().into_std();
            match self.check(&signals, now) {
                WatchdogVerdict::Healthy | WatchdogVerdict::Strike(_) => {}
                WatchdogVerdict::Restart => {
                    tracing::warn!(
                        restarts_used = self.health.restarts_used,
                        max = self.config.max_restarts,
                        "watchdog: camera stalled, restarting"
                    );
                    let mut cam = camera.write().await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    match cam.restart().await {
                        Ok(PlaybackState::Playing) => tracing::info!("watchdog: camera restarted"),
                        Ok(state) => tracing::warn!(?state, "watchdog: restart did not resume frames"),
                        Err(e) => tracing::warn!(error = %e, "watchdog: restart failed"),
                    }
                }
                WatchdogVerdict::Unrecoverable => {
                    let restarts = self.health.restarts_used;
                    tracing::error!(restarts, "watchdog: camera unrecoverable");
                    camera.write().await.teardown();
                    health_tx.send_replace(self.health.clone());
                    return Err(CameraError::CameraUnrecoverable { restarts });
                }
            }
            health_tx.send_replace(self.health.clone());
        }
        tracing::debug!("watchdog stopped");
        Ok(())
    }
}
