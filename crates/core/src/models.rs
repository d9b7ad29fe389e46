//! Domain model types used throughout shelfsync.
//!
//! These types bridge the provider adapters, the sync engine, the catalog
//! store, and the web API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Title used when a provider supplies none.
pub const UNKNOWN_TITLE: &str = "Unknown Title";

/// Author used when a provider supplies none.
pub const UNKNOWN_AUTHOR: &str = "Unknown Author";

// ---------------------------------------------------------------------------
// Media type
// ---------------------------------------------------------------------------

/// Physical or digital format of a held copy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Hardcover,
    Paperback,
    Audiobook,
    Ebook,
    #[default]
    Unspecified,
}

impl MediaType {
    /// Parse a stored media type string. Unknown values become
    /// [`MediaType::Unspecified`].
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "hardcover" => Self::Hardcover,
            "paperback" => Self::Paperback,
            "audiobook" => Self::Audiobook,
            "ebook" => Self::Ebook,
            _ => Self::Unspecified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hardcover => "hardcover",
            Self::Paperback => "paperback",
            Self::Audiobook => "audiobook",
            Self::Ebook => "ebook",
            Self::Unspecified => "unspecified",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Book sync record
// ---------------------------------------------------------------------------

/// A normalized book produced by a provider adapter and consumed by the
/// sync engine. Transient: never stored as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookSyncRecord {
    pub title: String,
    pub author: String,
    pub isbn10: Option<String>,
    pub isbn13: Option<String>,
    pub publisher: Option<String>,
    /// Partial ISO date: `YYYY`, `YYYY-MM` or `YYYY-MM-DD`.
    pub publication_date: Option<String>,
    pub pages: Option<u32>,
    pub cover_url: Option<String>,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub genre: Option<String>,
    pub series: Option<String>,
    pub series_number: Option<String>,
    pub original_title: Option<String>,
    pub media_type: MediaType,
    pub external_id: Option<String>,
}

impl Default for BookSyncRecord {
    fn default() -> Self {
        Self {
            title: UNKNOWN_TITLE.to_string(),
            author: UNKNOWN_AUTHOR.to_string(),
            isbn10: None,
            isbn13: None,
            publisher: None,
            publication_date: None,
            pages: None,
            cover_url: None,
            subtitle: None,
            description: None,
            genre: None,
            series: None,
            series_number: None,
            original_title: None,
            media_type: MediaType::Unspecified,
            external_id: None,
        }
    }
}

impl BookSyncRecord {
    /// Build a record, substituting the placeholder title/author for
    /// missing or blank values.
    pub fn new(title: Option<&str>, author: Option<&str>) -> Self {
        Self {
            title: non_blank(title).unwrap_or(UNKNOWN_TITLE).to_string(),
            author: non_blank(author).unwrap_or(UNKNOWN_AUTHOR).to_string(),
            ..Default::default()
        }
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Catalog entities
// ---------------------------------------------------------------------------

/// A canonical catalog book.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Book {
    pub id: String,
    pub title: String,
    pub author: String,
    pub isbn10: Option<String>,
    pub isbn13: Option<String>,
    pub publisher: Option<String>,
    pub publication_date: Option<String>,
    pub pages: Option<u32>,
    pub cover_url: Option<String>,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub genre: Option<String>,
    pub series: Option<String>,
    pub series_number: Option<String>,
    pub original_title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes for creating a catalog book.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewBook {
    pub title: String,
    pub author: String,
    pub isbn10: Option<String>,
    pub isbn13: Option<String>,
    pub publisher: Option<String>,
    pub publication_date: Option<String>,
    pub pages: Option<u32>,
    pub cover_url: Option<String>,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub genre: Option<String>,
    pub series: Option<String>,
    pub series_number: Option<String>,
    pub original_title: Option<String>,
}

impl From<&BookSyncRecord> for NewBook {
    fn from(r: &BookSyncRecord) -> Self {
        Self {
            title: r.title.clone(),
            author: r.author.clone(),
            isbn10: r.isbn10.clone(),
            isbn13: r.isbn13.clone(),
            publisher: r.publisher.clone(),
            publication_date: r.publication_date.clone(),
            pages: r.pages,
            cover_url: r.cover_url.clone(),
            subtitle: r.subtitle.clone(),
            description: r.description.clone(),
            genre: r.genre.clone(),
            series: r.series.clone(),
            series_number: r.series_number.clone(),
            original_title: r.original_title.clone(),
        }
    }
}

/// A partial update to a catalog book. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookUpdate {
    pub cover_url: Option<String>,
}

/// Assertion that the library holds `book_id` in `media_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Membership {
    pub id: i64,
    pub book_id: String,
    pub media_type: MediaType,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sync status
// ---------------------------------------------------------------------------

/// Current sync state of one provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Error,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Live counters for a running pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncProgress {
    pub total: Option<u64>,
    pub processed: u64,
    pub new: u64,
    pub errors: u64,
}

/// Partial progress update; `None` fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub total: Option<u64>,
    pub processed: Option<u64>,
    pub new: Option<u64>,
    pub errors: Option<u64>,
}

impl SyncProgress {
    pub fn merge(&mut self, update: &ProgressUpdate) {
        if update.total.is_some() {
            self.total = update.total;
        }
        if let Some(processed) = update.processed {
            self.processed = processed;
        }
        if let Some(new) = update.new {
            self.new = new;
        }
        if let Some(errors) = update.errors {
            self.errors = errors;
        }
    }
}

/// Per-provider status held by the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderStatus {
    pub provider: String,
    pub state: SyncState,
    pub started_at: Option<DateTime<Utc>>,
    pub progress: Option<SyncProgress>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_result: Option<PassSummary>,
    pub error: Option<String>,
}

/// One finished pass, kept in the registry's bounded history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub provider: String,
    /// `idle` for a completed pass, `error` for a failed one.
    pub state: SyncState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub result: Option<PassSummary>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Pass results
// ---------------------------------------------------------------------------

/// Outcome counters for one provider pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassSummary {
    pub provider: String,
    pub total_books: u64,
    pub new_books: u64,
    /// Records whose (book, media type) membership already existed, either
    /// found up front or lost to a concurrent insert.
    pub duplicate_memberships: u64,
    pub errors: Vec<String>,
}

impl PassSummary {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }
}

/// Aggregate of several provider passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReport {
    pub total_books: u64,
    pub new_books: u64,
    pub errors: Vec<String>,
    /// Providers whose pass ended early on a provider failure.
    pub failed_providers: Vec<String>,
    pub providers: Vec<PassSummary>,
}

impl SyncReport {
    /// Fold one provider's summary into the report.
    pub fn add(&mut self, summary: PassSummary, failed: bool) {
        self.total_books += summary.total_books;
        self.new_books += summary.new_books;
        self.errors.extend(summary.errors.iter().cloned());
        if failed {
            self.failed_providers.push(summary.provider.clone());
        }
        self.providers.push(summary);
    }

    pub fn is_success(&self) -> bool {
        self.failed_providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_defaults_placeholder_title_and_author() {
        let r = BookSyncRecord::new(Some("   "), None);
        assert_eq!(r.title, UNKNOWN_TITLE);
        assert_eq!(r.author, UNKNOWN_AUTHOR);

        let r = BookSyncRecord::new(Some(" Dune "), Some("Frank Herbert"));
        assert_eq!(r.title, "Dune");
        assert_eq!(r.author, "Frank Herbert");
        assert_eq!(r.media_type, MediaType::Unspecified);
    }

    #[test]
    fn test_media_type_round_trip_strings() {
        assert_eq!(MediaType::from_str_val("audiobook"), MediaType::Audiobook);
        assert_eq!(MediaType::from_str_val("vinyl"), MediaType::Unspecified);
        assert_eq!(MediaType::Ebook.to_string(), "ebook");
    }

    #[test]
    fn test_progress_merge_keeps_unset_fields() {
        let mut p = SyncProgress {
            total: Some(10),
            processed: 4,
            new: 2,
            errors: 1,
        };
        p.merge(&ProgressUpdate {
            processed: Some(5),
            ..Default::default()
        });
        assert_eq!(p.total, Some(10));
        assert_eq!(p.processed, 5);
        assert_eq!(p.new, 2);
        assert_eq!(p.errors, 1);
    }

    #[test]
    fn test_report_aggregates_summaries() {
        let mut report = SyncReport::default();
        report.add(
            PassSummary {
                provider: "a".into(),
                total_books: 10,
                new_books: 3,
                duplicate_memberships: 0,
                errors: vec!["x".into()],
            },
            false,
        );
        report.add(
            PassSummary {
                provider: "b".into(),
                total_books: 5,
                new_books: 1,
                duplicate_memberships: 0,
                errors: vec!["y".into()],
            },
            true,
        );
        assert_eq!(report.total_books, 15);
        assert_eq!(report.new_books, 4);
        assert_eq!(report.errors, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(report.failed_providers, vec!["b".to_string()]);
        assert!(!report.is_success());
    }
}
