//! shelfsync core library.
//!
//! This crate keeps a local book catalog in sync with external libraries:
//! configuration, the SQLite catalog and settings store, provider adapters,
//! the sync engine, the per-provider status registry, and the scheduler.

pub mod catalog;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod notify;
pub mod providers;
pub mod scheduler;
pub mod settings;
pub mod status;
pub mod sync_engine;

// Re-exports for convenience.
pub use catalog::CatalogStore;
pub use config::AppConfig;
pub use db::Database;
pub use notify::{BroadcastChannel, NotificationChannel};
pub use providers::{LibraryProvider, ProviderRegistry};
pub use scheduler::{RefreshInterval, Scheduler};
pub use settings::SettingsStore;
pub use status::SyncStatusRegistry;
pub use sync_engine::SyncEngine;
