//! Periodic sync scheduler.
//!
//! The scheduler is an actor that owns the current [`RefreshInterval`] and
//! at most one pending timer. Every armed timer carries a generation number;
//! a tick whose generation no longer matches the actor's is stale (its timer
//! was cancelled after it had already fired) and is ignored.
//!
//! On a live tick the scheduler asks its [`SyncTrigger`] whether anything is
//! still syncing. If so the tick is skipped; otherwise a full pass is
//! launched in the background. Either way the next timer is armed at once,
//! so the cadence never depends on how long a pass takes.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex_lite::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{IntervalError, SchedulerError};
use crate::settings::SettingsStore;

/// Literal value that turns periodic syncing off.
pub const DISABLED: &str = "disabled";

const INTERVAL_PATTERN: &str = r"^(-?)(\d+)([A-Za-z]*)$";

fn interval_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(INTERVAL_PATTERN).expect("interval pattern is valid"))
}

// ---------------------------------------------------------------------------
// Refresh interval
// ---------------------------------------------------------------------------

/// A validated refresh interval: `"disabled"` or `<N>m` / `<N>h`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshInterval {
    Disabled,
    Every {
        /// The string exactly as the operator wrote it.
        canonical: String,
        period: Duration,
    },
}

impl RefreshInterval {
    /// Validate an interval string.
    ///
    /// The unit is case-insensitive and the magnitude must be a positive
    /// integer. The original spelling is preserved.
    pub fn parse(raw: &str) -> Result<Self, IntervalError> {
        if raw.trim().is_empty() {
            return Err(IntervalError::Empty);
        }
        if raw == DISABLED {
            return Ok(Self::Disabled);
        }

        let caps = interval_regex()
            .captures(raw)
            .ok_or_else(|| IntervalError::InvalidFormat(raw.to_string()))?;

        if !caps[1].is_empty() {
            return Err(IntervalError::NonPositive(raw.to_string()));
        }
        let unit = &caps[3];
        let seconds_per_unit = match unit {
            "m" | "M" => 60,
            "h" | "H" => 3600,
            "" => return Err(IntervalError::InvalidFormat(raw.to_string())),
            _ => {
                return Err(IntervalError::UnknownUnit {
                    value: raw.to_string(),
                    unit: unit.to_string(),
                })
            }
        };

        let magnitude: u64 = caps[2]
            .parse()
            .map_err(|_| IntervalError::InvalidFormat(raw.to_string()))?;
        if magnitude == 0 {
            return Err(IntervalError::NonPositive(raw.to_string()));
        }
        let seconds = magnitude
            .checked_mul(seconds_per_unit)
            .ok_or_else(|| IntervalError::InvalidFormat(raw.to_string()))?;

        Ok(Self::Every {
            canonical: raw.to_string(),
            period: Duration::from_secs(seconds),
        })
    }

    /// Validate an interval arriving as arbitrary JSON (e.g. an API body).
    pub fn from_json(value: &serde_json::Value) -> Result<Self, IntervalError> {
        match value {
            serde_json::Value::String(s) => Self::parse(s),
            serde_json::Value::Null => Err(IntervalError::Empty),
            other => Err(IntervalError::NotAString(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Disabled => DISABLED,
            Self::Every { canonical, .. } => canonical,
        }
    }

    /// Time between ticks, or `None` when disabled.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::Every { period, .. } => Some(*period),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

impl fmt::Display for RefreshInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Trigger seam
// ---------------------------------------------------------------------------

/// What the scheduler drives on each tick. Implemented by the sync engine.
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    /// Whether any provider pass is currently running.
    async fn any_syncing(&self) -> bool;

    /// Launch a pass for every available provider without waiting for it.
    async fn launch_all(&self);
}

// ---------------------------------------------------------------------------
// Scheduler actor
// ---------------------------------------------------------------------------

enum Command {
    Tick(u64),
    SetInterval {
        raw: String,
        reply: oneshot::Sender<Result<RefreshInterval, SchedulerError>>,
    },
    GetInterval {
        reply: oneshot::Sender<RefreshInterval>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the scheduler actor. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<Command>,
}

impl Scheduler {
    /// Start the scheduler.
    ///
    /// The interval comes from the settings store; if nothing is stored, or
    /// the stored value is invalid, `fallback` (normally the config file's
    /// `daemon.refresh_interval`) is used instead.
    pub fn spawn(
        trigger: Arc<dyn SyncTrigger>,
        settings: Arc<dyn SettingsStore>,
        fallback: &str,
    ) -> Self {
        let interval = initial_interval(settings.as_ref(), fallback);
        info!(interval = %interval, "scheduler starting");

        let (tx, rx) = mpsc::channel(16);
        let mut state = SchedulerState {
            interval,
            generation: 0,
            timer: None,
            trigger,
            settings,
            self_tx: tx.downgrade(),
        };
        state.arm();
        tokio::spawn(state.run(rx));
        Self { tx }
    }

    /// Validate, persist and apply a new interval. The old timer is
    /// cancelled and a new one armed before this returns.
    pub async fn set_interval(&self, raw: &str) -> Result<RefreshInterval, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::SetInterval {
                raw: raw.to_string(),
                reply,
            })
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        rx.await.map_err(|_| SchedulerError::Unavailable)?
    }

    pub async fn get_interval(&self) -> Result<RefreshInterval, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::GetInterval { reply })
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        rx.await.map_err(|_| SchedulerError::Unavailable)
    }

    /// Cancel the pending timer and stop the actor. Passes that are already
    /// running are not affected.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

fn initial_interval(settings: &dyn SettingsStore, fallback: &str) -> RefreshInterval {
    match settings.get_refresh_interval() {
        Ok(Some(stored)) => match RefreshInterval::parse(&stored) {
            Ok(interval) => return interval,
            Err(e) => warn!(stored = %stored, error = %e, "stored refresh interval is invalid, using configured default"),
        },
        Ok(None) => debug!("no stored refresh interval, using configured default"),
        Err(e) => warn!(error = %e, "failed to read stored refresh interval, using configured default"),
    }

    RefreshInterval::parse(fallback).unwrap_or_else(|e| {
        warn!(fallback, error = %e, "configured refresh interval is invalid, scheduler disabled");
        RefreshInterval::Disabled
    })
}

struct SchedulerState {
    interval: RefreshInterval,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    trigger: Arc<dyn SyncTrigger>,
    settings: Arc<dyn SettingsStore>,
    self_tx: mpsc::WeakSender<Command>,
}

impl SchedulerState {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Tick(generation) => self.on_tick(generation).await,
                Command::SetInterval { raw, reply } => {
                    let _ = reply.send(self.set_interval(&raw).await);
                }
                Command::GetInterval { reply } => {
                    let _ = reply.send(self.interval.clone());
                }
                Command::Shutdown { reply } => {
                    self.cancel_timer();
                    info!("scheduler stopped");
                    let _ = reply.send(());
                    return;
                }
            }
        }
        self.cancel_timer();
        debug!("scheduler handles dropped, stopping");
    }

    async fn on_tick(&mut self, generation: u64) {
        if generation != self.generation {
            debug!(
                tick = generation,
                current = self.generation,
                "ignoring stale scheduler tick"
            );
            return;
        }

        if self.trigger.any_syncing().await {
            info!("skipping scheduled sync: a pass is still running");
        } else {
            info!(interval = %self.interval, "scheduled sync starting");
            self.trigger.launch_all().await;
        }
        self.arm();
    }

    async fn set_interval(&mut self, raw: &str) -> Result<RefreshInterval, SchedulerError> {
        let interval = RefreshInterval::parse(raw)?;

        // The catalog connection may be held by a running pass.
        let settings = self.settings.clone();
        let stored = interval.as_str().to_string();
        tokio::task::spawn_blocking(move || settings.set_refresh_interval(&stored))
            .await
            .map_err(|e| SchedulerError::WriteAborted(e.to_string()))??;

        info!(old = %self.interval, new = %interval, "refresh interval changed");
        self.interval = interval.clone();
        self.arm();
        Ok(interval)
    }

    /// Cancel any pending timer and arm a new one under a fresh generation.
    fn arm(&mut self) {
        self.cancel_timer();
        self.generation += 1;

        let Some(period) = self.interval.period() else {
            debug!("refresh disabled, no timer armed");
            return;
        };

        let generation = self.generation;
        let tx = self.self_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(period).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::Tick(generation)).await;
            }
        }));
        debug!(generation, secs = period.as_secs(), "scheduler timer armed");
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
