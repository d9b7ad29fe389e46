//! External library providers.
//!
//! Each provider adapter turns one external system's native paginated API
//! (or database) into a lazily produced [`RecordStream`] of
//! [`BookSyncRecord`]s. Adapters are registered once at startup in a
//! [`ProviderRegistry`] and looked up by name.

pub mod audiobookshelf;
pub mod calibre;
pub mod pagination;

use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::TryStreamExt;
use regex_lite::Regex;
use tracing::{debug, info};

use crate::config::ProvidersConfig;
use crate::errors::ProviderError;
use crate::models::BookSyncRecord;

pub use audiobookshelf::AudiobookshelfProvider;
pub use calibre::CalibreProvider;

/// A lazily produced sequence of records. Pages are pulled on demand and any
/// resource held by the adapter is released when the stream is dropped.
pub type RecordStream = BoxStream<'static, Result<BookSyncRecord, ProviderError>>;

/// Record count reported by the upstream while a stream is being read.
///
/// Shared between a [`RecordStream`] and its reader. A paginated source adds
/// its reported total when its first page arrives, so an adapter chaining
/// several sources sees the sum grow as each one starts.
#[derive(Debug, Clone, Default)]
pub struct TotalHint(Arc<Mutex<Option<u64>>>);

impl TotalHint {
    pub fn known(total: u64) -> Self {
        Self(Arc::new(Mutex::new(Some(total))))
    }

    pub fn add(&self, count: u64) {
        let mut total = self.0.lock().unwrap_or_else(|p| p.into_inner());
        *total = Some(total.unwrap_or(0) + count);
    }

    pub fn get(&self) -> Option<u64> {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A provider's record stream together with its total, once known.
pub struct ProviderStream {
    pub records: RecordStream,
    pub total: TotalHint,
}

impl ProviderStream {
    pub fn new(records: RecordStream, total: TotalHint) -> Self {
        Self { records, total }
    }
}

/// One external library system.
#[async_trait]
pub trait LibraryProvider: Send + Sync {
    /// Stable provider name used as the registry key (e.g. `"calibre"`).
    fn provider_name(&self) -> &str;

    /// Whether the provider has everything it needs to run a pass.
    fn is_configured(&self) -> bool;

    /// Fetch the whole catalog eagerly.
    async fn fetch_all(&self) -> Result<Vec<BookSyncRecord>, ProviderError>;

    /// Open a lazy stream over the catalog. Adapters without native
    /// pagination return `None` and callers fall back to
    /// [`fetch_all`](Self::fetch_all).
    async fn stream(&self) -> Result<Option<ProviderStream>, ProviderError> {
        Ok(None)
    }
}

/// Open a provider's record stream, wrapping `fetch_all` as a one-shot
/// stream when the adapter has no native streaming.
pub async fn open_stream(provider: &dyn LibraryProvider) -> Result<ProviderStream, ProviderError> {
    if let Some(stream) = provider.stream().await? {
        return Ok(stream);
    }
    debug!(
        provider = provider.provider_name(),
        "no native stream, falling back to fetch_all"
    );
    let records = provider.fetch_all().await?;
    let total = TotalHint::known(records.len() as u64);
    Ok(ProviderStream::new(
        Box::pin(stream::iter(records.into_iter().map(Ok))),
        total,
    ))
}

/// Drain a stream into a vector. Used by adapters to implement `fetch_all`
/// on top of their native stream.
pub(crate) async fn collect_stream(
    stream: RecordStream,
) -> Result<Vec<BookSyncRecord>, ProviderError> {
    stream.try_collect().await
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Ordered set of providers wired at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn LibraryProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from config. Every known adapter is registered;
    /// those without a config section report `is_configured() == false`.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self, ProviderError> {
        let mut registry = Self::new();
        registry.register(Arc::new(AudiobookshelfProvider::new(
            config.audiobookshelf.clone(),
        )?));
        registry.register(Arc::new(CalibreProvider::new(config.calibre.clone())));

        info!(
            registered = registry.len(),
            available = registry.available().len(),
            "provider registry built"
        );
        Ok(registry)
    }

    /// Add a provider, replacing any previous one with the same name.
    pub fn register(&mut self, provider: Arc<dyn LibraryProvider>) {
        let name = provider.provider_name().to_string();
        match self
            .providers
            .iter_mut()
            .find(|p| p.provider_name() == name)
        {
            Some(slot) => *slot = provider,
            None => self.providers.push(provider),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LibraryProvider>> {
        self.providers
            .iter()
            .find(|p| p.provider_name() == name)
            .cloned()
    }

    /// Providers that are configured and can run a pass, in registration
    /// order.
    pub fn available(&self) -> Vec<Arc<dyn LibraryProvider>> {
        self.providers
            .iter()
            .filter(|p| p.is_configured())
            .cloned()
            .collect()
    }

    pub fn all(&self) -> &[Arc<dyn LibraryProvider>] {
        &self.providers
    }

    pub fn names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.provider_name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Shared record helpers
// ---------------------------------------------------------------------------

/// A normalized ISBN, classified by length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isbn {
    Ten(String),
    Thirteen(String),
}

/// Strip separators and classify an ISBN. Anything that is not 10 characters
/// (digits with an optional trailing `X`) or 13 digits is rejected.
pub fn normalize_isbn(raw: &str) -> Option<Isbn> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '-' | ' '))
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if !cleaned.is_ascii() {
        return None;
    }

    match cleaned.len() {
        13 if cleaned.chars().all(|c| c.is_ascii_digit()) => Some(Isbn::Thirteen(cleaned)),
        10 if cleaned[..9].chars().all(|c| c.is_ascii_digit())
            && cleaned[9..].chars().all(|c| c.is_ascii_digit() || c == 'X') =>
        {
            Some(Isbn::Ten(cleaned))
        }
        _ => None,
    }
}

/// Put a raw ISBN into the matching field of `record`. Returns `false` if
/// the value is not a recognisable ISBN.
pub fn apply_isbn(record: &mut BookSyncRecord, raw: &str) -> bool {
    match normalize_isbn(raw) {
        Some(Isbn::Thirteen(isbn)) => {
            record.isbn13 = Some(isbn);
            true
        }
        Some(Isbn::Ten(isbn)) => {
            record.isbn10 = Some(isbn);
            true
        }
        None => false,
    }
}

fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{4})(?:-(\d{2})(?:-(\d{2}))?)?").expect("date pattern is valid")
    })
}

/// Reduce a date or timestamp to a partial ISO date (`YYYY`, `YYYY-MM` or
/// `YYYY-MM-DD`), keeping only the precision that is actually present.
pub fn partial_date(raw: &str) -> Option<String> {
    let caps = date_regex().captures(raw.trim())?;
    let year = caps.get(1)?.as_str();

    let Some(month) = caps.get(2).map(|m| m.as_str()) else {
        return Some(year.to_string());
    };
    if !matches!(month.parse::<u8>(), Ok(1..=12)) {
        return Some(year.to_string());
    }

    let Some(day) = caps.get(3).map(|d| d.as_str()) else {
        return Some(format!("{year}-{month}"));
    };
    if !matches!(day.parse::<u8>(), Ok(1..=31)) {
        return Some(format!("{year}-{month}"));
    }
    Some(format!("{year}-{month}-{day}"))
}

/// Trim a string field, mapping blank values to `None`.
pub fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
