//! Pull-based pagination shared by the paginated adapters.
//!
//! An adapter implements [`PageSource`] (fetch page *n* of size *k*) and
//! [`paginate`] turns it into a [`RecordStream`], feeding the first reported
//! total into a [`TotalHint`]. The next page is only
//! requested once the buffered one has been consumed, so at most one page
//! is held in memory.
//!
//! The source's [`close`](PageSource::close) is called exactly once on every
//! exit path: exhaustion, a page error, or the stream being dropped early.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream;
use tracing::{debug, warn};

use super::{RecordStream, TotalHint};
use crate::errors::ProviderError;
use crate::models::BookSyncRecord;

/// One page as returned by a [`PageSource`].
#[derive(Debug, Default)]
pub struct Page {
    /// Every upstream item on the page, in order. `Err` carries the reason
    /// an item could not be turned into a record.
    pub items: Vec<Result<BookSyncRecord, String>>,
    /// Total item count, if the upstream reports one.
    pub total: Option<u64>,
}

/// A paginated upstream.
#[async_trait]
pub trait PageSource: Send + 'static {
    /// Label used in log lines.
    fn label(&self) -> &str;

    /// Fetch the zero-based page `page_index` with up to `page_size` items.
    async fn fetch_page(&mut self, page_index: u64, page_size: u64)
        -> Result<Page, ProviderError>;

    /// Release any held resource (connection, file handle).
    fn close(&mut self) {}
}

struct Cursor<S: PageSource> {
    source: S,
    page_size: u64,
    page_index: u64,
    known_total: Option<u64>,
    total_hint: TotalHint,
    fetched: u64,
    done: bool,
    closed: bool,
    buffer: VecDeque<BookSyncRecord>,
}

impl<S: PageSource> Cursor<S> {
    fn new(source: S, page_size: u64, total_hint: TotalHint) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
            page_index: 0,
            known_total: None,
            total_hint,
            fetched: 0,
            done: false,
            closed: false,
            buffer: VecDeque::new(),
        }
    }

    async fn fetch_next(&mut self) -> Result<(), ProviderError> {
        let page = self
            .source
            .fetch_page(self.page_index, self.page_size)
            .await?;
        let page_len = page.items.len() as u64;

        if self.known_total.is_none() {
            if let Some(total) = page.total {
                self.known_total = Some(total);
                self.total_hint.add(total);
            }
        }
        self.fetched += page_len;

        for (offset, item) in page.items.into_iter().enumerate() {
            match item {
                Ok(record) => self.buffer.push_back(record),
                Err(reason) => warn!(
                    source = self.source.label(),
                    page = self.page_index,
                    offset,
                    reason = %reason,
                    "skipping malformed record"
                ),
            }
        }

        let reached_total = self.known_total.is_some_and(|t| self.fetched >= t);
        if page_len < self.page_size || reached_total {
            self.done = true;
        }

        debug!(
            source = self.source.label(),
            page = self.page_index,
            page_len,
            fetched = self.fetched,
            total = ?self.known_total,
            done = self.done,
            "fetched page"
        );
        self.page_index += 1;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.source.close();
            debug!(source = self.source.label(), fetched = self.fetched, "page source closed");
        }
    }
}

impl<S: PageSource> Drop for Cursor<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Turn a page source into a lazy record stream. The first total the source
/// reports is added to `total_hint`.
pub fn paginate<S: PageSource>(source: S, page_size: u64, total_hint: TotalHint) -> RecordStream {
    let cursor = Cursor::new(source, page_size, total_hint);
    Box::pin(stream::try_unfold(cursor, |mut cursor| async move {
        loop {
            if let Some(record) = cursor.buffer.pop_front() {
                return Ok(Some((record, cursor)));
            }
            if cursor.done {
                cursor.close();
                return Ok(None);
            }
            if let Err(e) = cursor.fetch_next().await {
                warn!(source = cursor.source.label(), page = cursor.page_index, error = %e, "page fetch failed");
                cursor.close();
                return Err(e);
            }
        }
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use futures::StreamExt;

    use crate::providers::collect_stream;

    /// In-memory page source used by pagination and engine tests.
    pub(crate) struct FakePages {
        pub total_items: u64,
        pub report_total: bool,
        pub fail_on_page: Option<u64>,
        pub malformed: Vec<u64>,
        pub requested: Arc<Mutex<Vec<u64>>>,
        pub closes: Arc<AtomicUsize>,
    }

    impl FakePages {
        pub(crate) fn new(total_items: u64) -> Self {
            Self {
                total_items,
                report_total: true,
                fail_on_page: None,
                malformed: Vec::new(),
                requested: Arc::new(Mutex::new(Vec::new())),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    pub(crate) fn record(i: u64) -> BookSyncRecord {
        let mut r = BookSyncRecord::new(Some(&format!("Book {i}")), Some("Author"));
        r.isbn13 = Some(format!("978{:010}", i));
        r.external_id = Some(i.to_string());
        r
    }

    #[async_trait]
    impl PageSource for FakePages {
        fn label(&self) -> &str {
            "fake"
        }

        async fn fetch_page(
            &mut self,
            page_index: u64,
            page_size: u64,
        ) -> Result<Page, ProviderError> {
            self.requested.lock().unwrap().push(page_index);
            if self.fail_on_page == Some(page_index) {
                return Err(ProviderError::Api {
                    status: 500,
                    body: "boom".into(),
                });
            }
            let start = page_index * page_size;
            let end = (start + page_size).min(self.total_items);
            let items = (start..end)
                .map(|i| {
                    if self.malformed.contains(&i) {
                        Err(format!("item {i} has no id"))
                    } else {
                        Ok(record(i))
                    }
                })
                .collect();
            Ok(Page {
                items,
                total: self.report_total.then_some(self.total_items),
            })
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_pages_until_short_page() {
        let source = FakePages::new(2500);
        let requested = source.requested.clone();
        let closes = source.closes.clone();

        let records = collect_stream(paginate(source, 1000, TotalHint::default())).await.unwrap();
        assert_eq!(records.len(), 2500);
        assert_eq!(records[0].title, "Book 0");
        assert_eq!(records[2499].title, "Book 2499");
        assert_eq!(*requested.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reported_total_reaches_hint_after_first_page() {
        let hint = TotalHint::default();
        let mut stream = paginate(FakePages::new(2500), 1000, hint.clone());
        assert_eq!(hint.get(), None);

        stream.next().await.unwrap().unwrap();
        assert_eq!(hint.get(), Some(2500));

        // Later pages repeat the total without adding to it.
        while let Some(item) = stream.next().await {
            item.unwrap();
        }
        assert_eq!(hint.get(), Some(2500));
    }

    #[tokio::test]
    async fn test_unreported_total_leaves_hint_empty() {
        let mut source = FakePages::new(20);
        source.report_total = false;
        let hint = TotalHint::default();
        let records = collect_stream(paginate(source, 5, hint.clone())).await.unwrap();
        assert_eq!(records.len(), 20);
        assert_eq!(hint.get(), None);
    }

    #[tokio::test]
    async fn test_stops_at_reported_total_on_full_page() {
        // 2000 items in pages of 1000: the second page is full, but the
        // reported total says we are done, so no third request is made.
        let source = FakePages::new(2000);
        let requested = source.requested.clone();

        let records = collect_stream(paginate(source, 1000, TotalHint::default())).await.unwrap();
        assert_eq!(records.len(), 2000);
        assert_eq!(*requested.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_without_total_needs_empty_page() {
        let mut source = FakePages::new(2000);
        source.report_total = false;
        let requested = source.requested.clone();

        let records = collect_stream(paginate(source, 1000, TotalHint::default())).await.unwrap();
        assert_eq!(records.len(), 2000);
        assert_eq!(*requested.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_empty_source() {
        let source = FakePages::new(0);
        let closes = source.closes.clone();
        let records = collect_stream(paginate(source, 1000, TotalHint::default())).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped() {
        let mut source = FakePages::new(10);
        source.malformed = vec![3, 7];
        let requested = source.requested.clone();

        let records = collect_stream(paginate(source, 5, TotalHint::default())).await.unwrap();
        assert_eq!(records.len(), 8);
        assert!(records.iter().all(|r| r.title != "Book 3" && r.title != "Book 7"));
        // Malformed items still count towards the page length.
        assert_eq!(*requested.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_page_error_aborts_and_closes() {
        let mut source = FakePages::new(2500);
        source.fail_on_page = Some(1);
        let closes = source.closes.clone();

        let mut stream = paginate(source, 1000, TotalHint::default());
        let mut ok = 0;
        let mut err = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(_) => ok += 1,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        assert_eq!(ok, 1000);
        assert!(matches!(err, Some(ProviderError::Api { status: 500, .. })));
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // The stream is finished after the error.
        assert!(stream.next().await.is_none());
        drop(stream);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_early_drop_closes_source() {
        let source = FakePages::new(2500);
        let closes = source.closes.clone();
        let requested = source.requested.clone();

        let mut stream = paginate(source, 1000, TotalHint::default());
        for _ in 0..10 {
            stream.next().await.unwrap().unwrap();
        }
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        drop(stream);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(*requested.lock().unwrap(), vec![0]);
    }
}
