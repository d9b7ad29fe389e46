//! Operator settings read by the scheduler.

use crate::errors::DatabaseError;

/// Key under which the refresh interval is persisted.
pub const REFRESH_INTERVAL_KEY: &str = "refresh_interval";

/// Persistent operator settings.
pub trait SettingsStore: Send + Sync {
    /// The stored refresh interval, or `None` if the operator never set one.
    fn get_refresh_interval(&self) -> Result<Option<String>, DatabaseError>;

    fn set_refresh_interval(&self, interval: &str) -> Result<(), DatabaseError>;
}
