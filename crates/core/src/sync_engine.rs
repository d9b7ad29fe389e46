//! Provider sync engine.
//!
//! The [`SyncEngine`] runs passes: one complete traversal of a provider's
//! catalog, reconciled record by record against the local
//! [`CatalogStore`]. For each record it
//!
//! 1. resolves an existing book by ISBN-13, then ISBN-10, then normalized
//!    title + author;
//! 2. creates the book and its membership if nothing matched;
//! 3. otherwise backfills a missing cover and makes sure the membership for
//!    the record's media type exists.
//!
//! Per-record failures are collected in the pass summary and never stop the
//! pass. A stream failure ends the pass early with the counts gathered so
//! far and moves the provider to `error` in the [`SyncStatusRegistry`].
//!
//! Every pass runs in its own task under a supervisor that reports the
//! outcome to the registry, including panics, so a crashed pass can never
//! leave its provider stuck in `syncing`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogStore;
use crate::errors::{CatalogError, ProviderError, SyncError};
use crate::models::{
    Book, BookSyncRecord, BookUpdate, NewBook, PassSummary, ProgressUpdate, SyncReport,
};
use crate::providers::{
    open_stream, LibraryProvider, ProviderRegistry, ProviderStream, TotalHint,
};
use crate::scheduler::SyncTrigger;
use crate::status::SyncStatusRegistry;

/// Registry progress is pushed after this many records.
pub const PROGRESS_EVERY: u64 = 50;

/// How a finished pass went.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PassOutcome {
    pub summary: PassSummary,
    /// Set when the pass ended early or crashed.
    pub failure: Option<String>,
}

impl PassOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Result of triggering every available provider at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerReport {
    pub accepted: Vec<String>,
    /// Providers that were skipped because a pass was already running.
    pub rejected: Vec<String>,
}

/// The provider sync engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    providers: Arc<ProviderRegistry>,
    catalog: Arc<dyn CatalogStore>,
    status: SyncStatusRegistry,
}

impl SyncEngine {
    pub fn new(
        providers: ProviderRegistry,
        catalog: Arc<dyn CatalogStore>,
        status: SyncStatusRegistry,
    ) -> Self {
        info!(providers = providers.len(), "initializing sync engine");
        Self {
            providers: Arc::new(providers),
            catalog,
            status,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn status(&self) -> &SyncStatusRegistry {
        &self.status
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Start a background pass for `name` and return as soon as it is
    /// accepted. Progress and outcome are reported through the registry.
    pub async fn trigger(&self, name: &str) -> Result<(), SyncError> {
        let provider = self.lookup(name)?;
        self.status.start(name, None).await?;
        // Detached: the supervisor reports the outcome itself.
        drop(self.spawn_supervised(provider));
        Ok(())
    }

    /// Trigger every available provider. Providers already syncing are
    /// reported as rejected rather than failing the whole call.
    pub async fn trigger_all(&self) -> TriggerReport {
        let mut report = TriggerReport::default();
        for provider in self.providers.available() {
            let name = provider.provider_name().to_string();
            match self.trigger(&name).await {
                Ok(()) => report.accepted.push(name),
                Err(SyncError::AlreadySyncing(_)) => {
                    debug!(provider = %name, "already syncing, not triggered");
                    report.rejected.push(name);
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "failed to trigger sync");
                    report.rejected.push(name);
                }
            }
        }
        info!(
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            "triggered sync for all providers"
        );
        report
    }

    /// Run a pass for `name` and wait for it. The pass is still gated by
    /// and reported to the registry.
    pub async fn run_provider(&self, name: &str) -> Result<PassOutcome, SyncError> {
        let provider = self.lookup(name)?;
        self.status.start(name, None).await?;
        match self.spawn_supervised(provider).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(provider = name, error = %e, "pass supervisor failed");
                Ok(PassOutcome {
                    summary: PassSummary::new(name),
                    failure: Some(format!("pass supervisor failed: {e}")),
                })
            }
        }
    }

    /// Run every available provider concurrently and aggregate the results.
    pub async fn run_all(&self) -> SyncReport {
        let names: Vec<String> = self
            .providers
            .available()
            .iter()
            .map(|p| p.provider_name().to_string())
            .collect();

        let results = join_all(names.iter().map(|name| self.run_provider(name))).await;

        let mut report = SyncReport::default();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(outcome) => {
                    let failed = !outcome.is_success();
                    report.add(outcome.summary, failed);
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "provider pass not started");
                    report.errors.push(format!("{name}: {e}"));
                }
            }
        }
        info!(
            total = report.total_books,
            new = report.new_books,
            errors = report.errors.len(),
            failed = report.failed_providers.len(),
            "sync run finished"
        );
        report
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn LibraryProvider>, SyncError> {
        let provider = self
            .providers
            .get(name)
            .ok_or_else(|| SyncError::UnknownProvider(name.to_string()))?;
        if !provider.is_configured() {
            return Err(SyncError::NotConfigured(name.to_string()));
        }
        Ok(provider)
    }

    /// Run the pass in its own task and report its outcome, panic included,
    /// to the registry. The provider must already be marked as syncing.
    fn spawn_supervised(
        &self,
        provider: Arc<dyn LibraryProvider>,
    ) -> tokio::task::JoinHandle<PassOutcome> {
        let engine = self.clone();
        tokio::spawn(async move {
            let name = provider.provider_name().to_string();

            let pass_engine = engine.clone();
            let pass = tokio::spawn(async move { pass_engine.run_pass(provider.as_ref()).await });

            match pass.await {
                Ok((summary, None)) => {
                    engine.status.complete(&name, summary.clone()).await;
                    PassOutcome {
                        summary,
                        failure: None,
                    }
                }
                Ok((summary, Some(source))) => {
                    let err = SyncError::Provider {
                        provider: name.clone(),
                        source,
                    };
                    error!(provider = %name, error = %err, total = summary.total_books, "sync pass failed");
                    engine.status.fail(&name, err.to_string()).await;
                    PassOutcome {
                        summary,
                        failure: Some(err.to_string()),
                    }
                }
                Err(join_err) => {
                    let reason = format!("pass crashed: {join_err}");
                    error!(provider = %name, error = %reason, "sync pass crashed");
                    engine.status.fail(&name, reason.clone()).await;
                    let mut summary = PassSummary::new(name);
                    summary.errors.push(reason.clone());
                    PassOutcome {
                        summary,
                        failure: Some(reason),
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // One pass
    // -----------------------------------------------------------------------

    /// Consume the provider's stream one record at a time. Returns the
    /// summary and, if the stream failed, the error that ended it.
    async fn run_pass(
        &self,
        provider: &dyn LibraryProvider,
    ) -> (PassSummary, Option<ProviderError>) {
        let name = provider.provider_name().to_string();
        let mut summary = PassSummary::new(name.clone());
        info!(provider = %name, "sync pass starting");

        let ProviderStream {
            records: mut stream,
            total,
        } = match open_stream(provider).await {
            Ok(opened) => opened,
            Err(e) => {
                summary.errors.push(format!("{name}: {e}"));
                return (summary, Some(e));
            }
        };
        let mut reported_total = None;
        self.forward_total(&name, &total, &mut reported_total).await;

        while let Some(item) = stream.next().await {
            self.forward_total(&name, &total, &mut reported_total).await;
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    warn!(provider = %name, processed = summary.total_books, error = %e, "provider stream failed, ending pass early");
                    summary.errors.push(format!("{name}: {e}"));
                    self.push_progress(&summary).await;
                    return (summary, Some(e));
                }
            };

            summary.total_books += 1;
            self.reconcile(&record, &mut summary);

            if summary.total_books % PROGRESS_EVERY == 0 {
                self.push_progress(&summary).await;
            }
        }

        self.push_progress(&summary).await;
        info!(
            provider = %name,
            total = summary.total_books,
            new = summary.new_books,
            duplicates = summary.duplicate_memberships,
            errors = summary.errors.len(),
            "sync pass finished"
        );
        (summary, None)
    }

    /// Publish the upstream total when it first becomes known or grows.
    async fn forward_total(&self, name: &str, total: &TotalHint, reported: &mut Option<u64>) {
        let current = total.get();
        if current.is_none() || current == *reported {
            return;
        }
        *reported = current;
        self.status
            .update_progress(
                name,
                ProgressUpdate {
                    total: current,
                    ..Default::default()
                },
            )
            .await;
    }

    async fn push_progress(&self, summary: &PassSummary) {
        self.status
            .update_progress(
                &summary.provider,
                ProgressUpdate {
                    total: None,
                    processed: Some(summary.total_books),
                    new: Some(summary.new_books),
                    errors: Some(summary.errors.len() as u64),
                },
            )
            .await;
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    fn reconcile(&self, record: &BookSyncRecord, summary: &mut PassSummary) {
        let existing = match self.resolve(record) {
            Ok(existing) => existing,
            Err(e) => {
                record_error(summary, record, "lookup failed", &e);
                return;
            }
        };

        if let Some(book) = existing {
            self.merge_into(&book, record, summary);
            return;
        }

        match self.catalog.create_book(&NewBook::from(record)) {
            Ok(book) => {
                summary.new_books += 1;
                debug!(book_id = %book.id, title = %book.title, "created book");
                self.add_membership(&book, record, summary);
            }
            Err(CatalogError::Conflict(detail)) => {
                // Another writer created the same book first.
                debug!(title = %record.title, detail = %detail, "book created concurrently, merging");
                match self.resolve(record) {
                    Ok(Some(book)) => self.merge_into(&book, record, summary),
                    Ok(None) => {
                        record_error(
                            summary,
                            record,
                            "create failed",
                            &CatalogError::Conflict(detail),
                        );
                    }
                    Err(e) => record_error(summary, record, "lookup failed", &e),
                }
            }
            Err(e) => record_error(summary, record, "create failed", &e),
        }
    }

    fn resolve(&self, record: &BookSyncRecord) -> Result<Option<Book>, CatalogError> {
        for isbn in [record.isbn13.as_deref(), record.isbn10.as_deref()]
            .into_iter()
            .flatten()
        {
            if let Some(book) = self.catalog.find_book_by_isbn(isbn)? {
                return Ok(Some(book));
            }
        }
        self.catalog
            .find_book_by_title_author(&record.title, &record.author)
    }

    fn merge_into(&self, book: &Book, record: &BookSyncRecord, summary: &mut PassSummary) {
        if book.cover_url.is_none() {
            if let Some(cover) = &record.cover_url {
                let update = BookUpdate {
                    cover_url: Some(cover.clone()),
                };
                match self.catalog.update_book(book, &update) {
                    Ok(_) => debug!(book_id = %book.id, "backfilled cover"),
                    Err(e) => record_error(summary, record, "cover update failed", &e),
                }
            }
        }

        match self.catalog.has_membership(book, record.media_type) {
            Ok(true) => summary.duplicate_memberships += 1,
            Ok(false) => self.add_membership(book, record, summary),
            Err(e) => record_error(summary, record, "membership lookup failed", &e),
        }
    }

    fn add_membership(&self, book: &Book, record: &BookSyncRecord, summary: &mut PassSummary) {
        match self.catalog.add_membership(book, record.media_type) {
            Ok(_) => {}
            Err(CatalogError::Conflict(_)) => {
                debug!(book_id = %book.id, media_type = %record.media_type, "membership created concurrently");
                summary.duplicate_memberships += 1;
            }
            Err(e) => record_error(summary, record, "membership failed", &e),
        }
    }
}

fn record_error(
    summary: &mut PassSummary,
    record: &BookSyncRecord,
    action: &str,
    err: &CatalogError,
) {
    warn!(
        provider = %summary.provider,
        title = %record.title,
        external_id = ?record.external_id,
        error = %err,
        "{action}"
    );
    summary
        .errors
        .push(format!("{} ({}): {action}: {err}", record.title, record.author));
}

#[async_trait]
impl SyncTrigger for SyncEngine {
    async fn any_syncing(&self) -> bool {
        self.status.any_syncing().await
    }

    async fn launch_all(&self) {
        self.trigger_all().await;
    }
}
