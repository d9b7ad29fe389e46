//! Per-provider sync status registry.
//!
//! The registry is the single source of truth for "is provider X busy right
//! now". It runs as an actor: one task owns the state map and the bounded
//! run history, and every caller goes through a cloneable
//! [`SyncStatusRegistry`] handle that sends it commands. Nothing in here
//! performs I/O other than publishing to the notification channel, so the
//! request loop stays responsive while passes run elsewhere.
//!
//! State machine per provider:
//!
//! ```text
//!   (absent) --start--> syncing --complete--> idle
//!                          |                   |
//!                          +------fail------> error
//!   idle / error --start--> syncing
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::errors::StatusError;
use crate::models::{
    HistoryEntry, PassSummary, ProgressUpdate, ProviderStatus, SyncProgress, SyncState,
};
use crate::notify::{NotificationChannel, SYNC_STATUS_TOPIC};

/// Number of finished runs kept in memory.
pub const HISTORY_LIMIT: usize = 50;

const COMMAND_BUFFER: usize = 64;

enum Command {
    Start {
        name: String,
        total: Option<u64>,
        reply: oneshot::Sender<Result<(), StatusError>>,
    },
    UpdateProgress {
        name: String,
        update: ProgressUpdate,
    },
    Complete {
        name: String,
        result: PassSummary,
        reply: oneshot::Sender<()>,
    },
    Fail {
        name: String,
        error: String,
        reply: oneshot::Sender<()>,
    },
    AnySyncing {
        reply: oneshot::Sender<bool>,
    },
    IsSyncing {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    GetStatus {
        name: String,
        reply: oneshot::Sender<Option<ProviderStatus>>,
    },
    GetAll {
        reply: oneshot::Sender<Vec<ProviderStatus>>,
    },
    History {
        reply: oneshot::Sender<Vec<HistoryEntry>>,
    },
}

/// Handle to the status registry actor. Cheap to clone.
#[derive(Clone)]
pub struct SyncStatusRegistry {
    tx: mpsc::Sender<Command>,
}

impl SyncStatusRegistry {
    /// Spawn the registry actor on the current tokio runtime.
    pub fn spawn(channel: Arc<dyn NotificationChannel>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let state = RegistryState {
            statuses: BTreeMap::new(),
            history: VecDeque::with_capacity(HISTORY_LIMIT),
            channel,
        };
        tokio::spawn(state.run(rx));
        Self { tx }
    }

    /// Mark `name` as syncing. Fails with [`StatusError::AlreadySyncing`]
    /// if a pass is already running, leaving its progress untouched.
    pub async fn start(&self, name: &str, total: Option<u64>) -> Result<(), StatusError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start {
            name: name.to_string(),
            total,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StatusError::RegistryUnavailable)?
    }

    /// Merge counters into the running pass. Never fails; an unknown
    /// provider is logged and ignored.
    pub async fn update_progress(&self, name: &str, update: ProgressUpdate) {
        let cmd = Command::UpdateProgress {
            name: name.to_string(),
            update,
        };
        if self.send(cmd).await.is_err() {
            warn!(provider = name, "status registry unavailable, progress dropped");
        }
    }

    /// Record a finished pass and return the provider to `idle`.
    pub async fn complete(&self, name: &str, result: PassSummary) {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Complete {
            name: name.to_string(),
            result,
            reply,
        };
        if self.send(cmd).await.is_err() || rx.await.is_err() {
            warn!(provider = name, "status registry unavailable, completion dropped");
        }
    }

    /// Record a failed pass and move the provider to `error`.
    pub async fn fail(&self, name: &str, error: impl Into<String>) {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Fail {
            name: name.to_string(),
            error: error.into(),
            reply,
        };
        if self.send(cmd).await.is_err() || rx.await.is_err() {
            warn!(provider = name, "status registry unavailable, failure dropped");
        }
    }

    pub async fn any_syncing(&self) -> bool {
        self.query(|reply| Command::AnySyncing { reply })
            .await
            .unwrap_or(false)
    }

    pub async fn is_syncing(&self, name: &str) -> bool {
        let name = name.to_string();
        self.query(|reply| Command::IsSyncing { name, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn get_status(&self, name: &str) -> Option<ProviderStatus> {
        let name = name.to_string();
        self.query(|reply| Command::GetStatus { name, reply })
            .await
            .flatten()
    }

    /// Statuses of every provider that has ever started, ordered by name.
    pub async fn get_all(&self) -> Vec<ProviderStatus> {
        self.query(|reply| Command::GetAll { reply })
            .await
            .unwrap_or_default()
    }

    /// Finished runs, oldest first.
    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.query(|reply| Command::History { reply })
            .await
            .unwrap_or_default()
    }

    async fn send(&self, cmd: Command) -> Result<(), StatusError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| StatusError::RegistryUnavailable)
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        if self.send(build(reply)).await.is_err() {
            warn!("status registry unavailable");
            return None;
        }
        rx.await.ok()
    }
}

// ---------------------------------------------------------------------------
// Actor state
// ---------------------------------------------------------------------------

struct RegistryState {
    statuses: BTreeMap<String, ProviderStatus>,
    history: VecDeque<HistoryEntry>,
    channel: Arc<dyn NotificationChannel>,
}

impl RegistryState {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!("status registry started");
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd);
        }
        debug!("status registry stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Start { name, total, reply } => {
                let _ = reply.send(self.start(&name, total));
            }
            Command::UpdateProgress { name, update } => self.update_progress(&name, &update),
            Command::Complete {
                name,
                result,
                reply,
            } => {
                self.complete(&name, result);
                let _ = reply.send(());
            }
            Command::Fail { name, error, reply } => {
                self.fail(&name, error);
                let _ = reply.send(());
            }
            Command::AnySyncing { reply } => {
                let _ = reply.send(
                    self.statuses
                        .values()
                        .any(|s| s.state == SyncState::Syncing),
                );
            }
            Command::IsSyncing { name, reply } => {
                let _ = reply.send(
                    self.statuses
                        .get(&name)
                        .is_some_and(|s| s.state == SyncState::Syncing),
                );
            }
            Command::GetStatus { name, reply } => {
                let _ = reply.send(self.statuses.get(&name).cloned());
            }
            Command::GetAll { reply } => {
                let _ = reply.send(self.statuses.values().cloned().collect());
            }
            Command::History { reply } => {
                let _ = reply.send(self.history.iter().cloned().collect());
            }
        }
    }

    fn start(&mut self, name: &str, total: Option<u64>) -> Result<(), StatusError> {
        let status = self
            .statuses
            .entry(name.to_string())
            .or_insert_with(|| ProviderStatus {
                provider: name.to_string(),
                ..Default::default()
            });

        if status.state == SyncState::Syncing {
            debug!(provider = name, "rejecting start: already syncing");
            return Err(StatusError::AlreadySyncing(name.to_string()));
        }

        status.state = SyncState::Syncing;
        status.started_at = Some(Utc::now());
        status.progress = Some(SyncProgress {
            total,
            ..Default::default()
        });
        status.completed_at = None;
        status.error = None;

        info!(provider = name, "sync started");
        self.publish("started", name);
        Ok(())
    }

    fn update_progress(&mut self, name: &str, update: &ProgressUpdate) {
        let Some(status) = self.statuses.get_mut(name) else {
            warn!(provider = name, "progress update for provider that never started");
            return;
        };
        if status.state != SyncState::Syncing {
            warn!(provider = name, state = %status.state, "progress update while not syncing");
            return;
        }
        status
            .progress
            .get_or_insert_with(SyncProgress::default)
            .merge(update);
        self.publish("progress", name);
    }

    fn complete(&mut self, name: &str, result: PassSummary) {
        let now = Utc::now();
        let status = self.entry(name);
        status.state = SyncState::Idle;
        status.completed_at = Some(now);
        status.last_result = Some(result.clone());
        status.error = None;
        let started_at = status.started_at;

        info!(
            provider = name,
            total = result.total_books,
            new = result.new_books,
            errors = result.errors.len(),
            "sync completed"
        );
        self.push_history(HistoryEntry {
            provider: name.to_string(),
            state: SyncState::Idle,
            started_at,
            completed_at: now,
            result: Some(result),
            error: None,
        });
        self.publish("completed", name);
    }

    fn fail(&mut self, name: &str, error: String) {
        let now = Utc::now();
        let status = self.entry(name);
        status.state = SyncState::Error;
        status.completed_at = Some(now);
        status.error = Some(error.clone());
        let started_at = status.started_at;

        warn!(provider = name, error = %error, "sync failed");
        self.push_history(HistoryEntry {
            provider: name.to_string(),
            state: SyncState::Error,
            started_at,
            completed_at: now,
            result: None,
            error: Some(error),
        });
        self.publish("failed", name);
    }

    fn entry(&mut self, name: &str) -> &mut ProviderStatus {
        if !self.statuses.contains_key(name) {
            warn!(provider = name, "finishing a pass that was never started");
        }
        self.statuses
            .entry(name.to_string())
            .or_insert_with(|| ProviderStatus {
                provider: name.to_string(),
                ..Default::default()
            })
    }

    fn push_history(&mut self, entry: HistoryEntry) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    fn publish(&self, event: &str, name: &str) {
        let status = self.statuses.get(name);
        self.channel.publish(
            SYNC_STATUS_TOPIC,
            serde_json::json!({
                "event": event,
                "provider": name,
                "status": status,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{BroadcastChannel, Envelope};

    fn registry() -> (SyncStatusRegistry, BroadcastChannel) {
        let channel = BroadcastChannel::new();
        let registry = SyncStatusRegistry::spawn(Arc::new(channel.clone()));
        (registry, channel)
    }

    #[tokio::test]
    async fn test_start_transitions_to_syncing() {
        let (registry, _) = registry();
        assert!(registry.get_status("calibre").await.is_none());
        assert!(!registry.any_syncing().await);

        registry.start("calibre", Some(10)).await.unwrap();

        let status = registry.get_status("calibre").await.unwrap();
        assert_eq!(status.state, SyncState::Syncing);
        assert!(status.started_at.is_some());
        assert_eq!(status.progress.unwrap().total, Some(10));
        assert!(registry.any_syncing().await);
        assert!(registry.is_syncing("calibre").await);
        assert!(!registry.is_syncing("audiobookshelf").await);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected_and_keeps_progress() {
        let (registry, _) = registry();
        registry.start("calibre", None).await.unwrap();
        registry
            .update_progress(
                "calibre",
                ProgressUpdate {
                    processed: Some(7),
                    new: Some(3),
                    ..Default::default()
                },
            )
            .await;

        let err = registry.start("calibre", Some(99)).await.unwrap_err();
        assert_eq!(err, StatusError::AlreadySyncing("calibre".into()));

        let progress = registry.get_status("calibre").await.unwrap().progress.unwrap();
        assert_eq!(progress.processed, 7);
        assert_eq!(progress.new, 3);
        assert_eq!(progress.total, None);
    }

    #[tokio::test]
    async fn test_progress_for_unknown_provider_is_noop() {
        let (registry, _) = registry();
        registry
            .update_progress(
                "ghost",
                ProgressUpdate {
                    processed: Some(1),
                    ..Default::default()
                },
            )
            .await;
        assert!(registry.get_status("ghost").await.is_none());
        assert!(registry.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_complete_records_result_and_history() {
        let (registry, _) = registry();
        registry.start("calibre", None).await.unwrap();
        let mut summary = PassSummary::new("calibre");
        summary.total_books = 5;
        registry.complete("calibre", summary.clone()).await;

        let status = registry.get_status("calibre").await.unwrap();
        assert_eq!(status.state, SyncState::Idle);
        assert!(status.completed_at.is_some());
        assert_eq!(status.last_result, Some(summary.clone()));

        let history = registry.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, SyncState::Idle);
        assert_eq!(history[0].result, Some(summary));

        // Can start again after completing.
        registry.start("calibre", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_moves_to_error() {
        let (registry, _) = registry();
        registry.start("abs", None).await.unwrap();
        registry.fail("abs", "connection refused").await;

        let status = registry.get_status("abs").await.unwrap();
        assert_eq!(status.state, SyncState::Error);
        assert_eq!(status.error.as_deref(), Some("connection refused"));
        assert!(!registry.any_syncing().await);

        let history = registry.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, SyncState::Error);
        assert_eq!(history[0].error.as_deref(), Some("connection refused"));

        registry.start("abs", None).await.unwrap();
        let status = registry.get_status("abs").await.unwrap();
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (registry, _) = registry();
        for i in 0..(HISTORY_LIMIT + 5) {
            let name = format!("p{i}");
            registry.start(&name, None).await.unwrap();
            registry.complete(&name, PassSummary::new(name.clone())).await;
        }
        let history = registry.history().await;
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].provider, "p5");
        assert_eq!(history.last().unwrap().provider, format!("p{}", HISTORY_LIMIT + 4));
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let (registry, channel) = registry();
        let mut rx = channel.subscribe();

        registry.start("calibre", None).await.unwrap();
        registry
            .update_progress(
                "calibre",
                ProgressUpdate {
                    processed: Some(1),
                    ..Default::default()
                },
            )
            .await;
        registry.complete("calibre", PassSummary::new("calibre")).await;

        let mut events = Vec::new();
        for _ in 0..3 {
            let envelope: Envelope = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(envelope.topic, SYNC_STATUS_TOPIC);
            events.push(envelope.payload["event"].as_str().unwrap().to_string());
        }
        assert_eq!(events, vec!["started", "progress", "completed"]);
    }

    #[tokio::test]
    async fn test_get_all_is_ordered_by_name() {
        let (registry, _) = registry();
        registry.start("zeta", None).await.unwrap();
        registry.start("alpha", None).await.unwrap();
        let all = registry.get_all().await;
        let names: Vec<_> = all.iter().map(|s| s.provider.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
