//! Calibre library adapter.
//!
//! Reads a local Calibre library's `metadata.db` directly, read-only, in
//! `LIMIT/OFFSET` pages ordered by book id. The connection lives only as
//! long as the stream and is closed explicitly when the stream finishes or
//! is dropped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, Row};
use tracing::{debug, info, warn};

use super::pagination::{paginate, Page, PageSource};
use super::{
    apply_isbn, collect_stream, non_blank, normalize_isbn, partial_date, Isbn, LibraryProvider,
    ProviderStream, TotalHint,
};
use crate::config::CalibreConfig;
use crate::errors::ProviderError;
use crate::models::{BookSyncRecord, MediaType};

pub const PROVIDER_NAME: &str = "calibre";

const METADATA_DB: &str = "metadata.db";

/// Calibre's placeholder for "no publication date".
const NULL_DATE_YEAR: &str = "0101";

const BOOKS_PAGE_SQL: &str = "
    SELECT b.id, b.title, b.pubdate, b.series_index, b.isbn, b.path, b.has_cover,
        (SELECT group_concat(name, ' & ') FROM (
            SELECT a.name FROM authors a
            JOIN books_authors_link l ON l.author = a.id
            WHERE l.book = b.id ORDER BY l.id)) AS authors,
        (SELECT p.name FROM publishers p
            JOIN books_publishers_link l ON l.publisher = p.id
            WHERE l.book = b.id LIMIT 1) AS publisher,
        (SELECT s.name FROM series s
            JOIN books_series_link l ON l.series = s.id
            WHERE l.book = b.id LIMIT 1) AS series,
        (SELECT t.name FROM tags t
            JOIN books_tags_link l ON l.tag = t.id
            WHERE l.book = b.id ORDER BY l.id LIMIT 1) AS genre,
        (SELECT i.val FROM identifiers i
            WHERE i.book = b.id AND lower(i.type) = 'isbn' LIMIT 1) AS isbn_identifier,
        (SELECT c.text FROM comments c WHERE c.book = b.id LIMIT 1) AS comments,
        (SELECT group_concat(d.format, ',') FROM data d WHERE d.book = b.id) AS formats
    FROM books b
    ORDER BY b.id
    LIMIT ?1 OFFSET ?2";

/// Adapter for a Calibre library directory.
pub struct CalibreProvider {
    config: Option<CalibreConfig>,
    open_connections: Arc<AtomicUsize>,
}

impl CalibreProvider {
    pub fn new(config: Option<CalibreConfig>) -> Self {
        Self {
            config,
            open_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of library connections currently held by live streams.
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    fn metadata_path(config: &CalibreConfig) -> PathBuf {
        config.library_path.join(METADATA_DB)
    }

    fn config(&self) -> Result<&CalibreConfig, ProviderError> {
        self.config
            .as_ref()
            .filter(|c| Self::metadata_path(c).is_file())
            .ok_or_else(|| ProviderError::NotConfigured(PROVIDER_NAME.into()))
    }
}

#[async_trait]
impl LibraryProvider for CalibreProvider {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn is_configured(&self) -> bool {
        self.config().is_ok()
    }

    async fn fetch_all(&self) -> Result<Vec<BookSyncRecord>, ProviderError> {
        match self.stream().await? {
            Some(stream) => collect_stream(stream.records).await,
            None => Ok(Vec::new()),
        }
    }

    async fn stream(&self) -> Result<Option<ProviderStream>, ProviderError> {
        let config = self.config()?;
        let pages = CalibrePages::open(&config.library_path, self.open_connections.clone())?;
        let total = TotalHint::default();
        let records = paginate(pages, u64::from(config.page_size), total.clone());
        Ok(Some(ProviderStream::new(records, total)))
    }
}

// ---------------------------------------------------------------------------
// Page source
// ---------------------------------------------------------------------------

struct CalibrePages {
    library: PathBuf,
    conn: Option<Connection>,
    total: u64,
    open_connections: Arc<AtomicUsize>,
}

impl CalibrePages {
    fn open(library: &Path, open_connections: Arc<AtomicUsize>) -> Result<Self, ProviderError> {
        let db_path = library.join(METADATA_DB);
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))?;
        open_connections.fetch_add(1, Ordering::SeqCst);

        info!(path = %db_path.display(), total, "opened calibre library");
        Ok(Self {
            library: library.to_path_buf(),
            conn: Some(conn),
            total: total.max(0) as u64,
            open_connections,
        })
    }

    fn query_page(
        &self,
        conn: &Connection,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Result<BookSyncRecord, String>>, ProviderError> {
        let mut stmt = conn.prepare_cached(BOOKS_PAGE_SQL)?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], |row| {
            Ok(decode_row(row).map(|raw| raw.into_record(&self.library)))
        })?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?.map_err(|e| e.to_string()));
        }
        Ok(items)
    }
}

#[async_trait]
impl PageSource for CalibrePages {
    fn label(&self) -> &str {
        PROVIDER_NAME
    }

    async fn fetch_page(
        &mut self,
        page_index: u64,
        page_size: u64,
    ) -> Result<Page, ProviderError> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| ProviderError::Parse("calibre connection already closed".into()))?;
        let items = self.query_page(conn, page_size, page_index * page_size)?;
        Ok(Page {
            items,
            total: Some(self.total),
        })
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.open_connections.fetch_sub(1, Ordering::SeqCst);
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "failed to close calibre library cleanly");
            } else {
                debug!(library = %self.library.display(), "closed calibre library");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct CalibreRow {
    id: i64,
    title: Option<String>,
    pubdate: Option<String>,
    series_index: Option<f64>,
    isbn: Option<String>,
    path: Option<String>,
    has_cover: bool,
    authors: Option<String>,
    publisher: Option<String>,
    series: Option<String>,
    genre: Option<String>,
    isbn_identifier: Option<String>,
    comments: Option<String>,
    formats: Option<String>,
}

/// Column decoding errors are per-row: the row is skipped, the page is not.
fn decode_row(row: &Row<'_>) -> rusqlite::Result<CalibreRow> {
    Ok(CalibreRow {
        id: row.get(0)?,
        title: row.get(1)?,
        pubdate: row.get(2)?,
        series_index: row.get(3)?,
        isbn: row.get(4)?,
        path: row.get(5)?,
        has_cover: row.get::<_, Option<bool>>(6)?.unwrap_or(false),
        authors: row.get(7)?,
        publisher: row.get(8)?,
        series: row.get(9)?,
        genre: row.get(10)?,
        isbn_identifier: row.get(11)?,
        comments: row.get(12)?,
        formats: row.get(13)?,
    })
}

impl CalibreRow {
    fn into_record(self, library: &Path) -> BookSyncRecord {
        let mut record = BookSyncRecord::new(self.title.as_deref(), self.authors.as_deref());
        record.external_id = Some(self.id.to_string());

        if let Some(raw) = self.isbn_identifier.as_deref() {
            apply_isbn(&mut record, raw);
        }
        // The legacy `books.isbn` column only fills what the identifier left empty.
        match self.isbn.as_deref().and_then(normalize_isbn) {
            Some(Isbn::Thirteen(isbn)) if record.isbn13.is_none() => record.isbn13 = Some(isbn),
            Some(Isbn::Ten(isbn)) if record.isbn10.is_none() => record.isbn10 = Some(isbn),
            _ => {}
        }

        record.publication_date = self
            .pubdate
            .as_deref()
            .and_then(partial_date)
            .filter(|d| !d.starts_with(NULL_DATE_YEAR));
        record.publisher = non_blank(self.publisher.as_deref());
        record.genre = non_blank(self.genre.as_deref());
        record.description = non_blank(self.comments.as_deref());

        record.series = non_blank(self.series.as_deref());
        if record.series.is_some() {
            record.series_number = self.series_index.map(format_series_index);
        }

        if self.has_cover {
            if let Some(path) = self.path.as_deref() {
                record.cover_url = Some(format!(
                    "file://{}/{}/cover.jpg",
                    library.display(),
                    path
                ));
            }
        }

        record.media_type = media_type_for_formats(self.formats.as_deref().unwrap_or(""));
        record
    }
}

/// `1.0` becomes `"1"`, `2.5` stays `"2.5"`.
fn format_series_index(index: f64) -> String {
    if index.fract() == 0.0 {
        format!("{}", index as i64)
    } else {
        format!("{index}")
    }
}

/// Map Calibre's comma-separated format list onto a media type. Ebook
/// formats win over audio when a book has both.
pub fn media_type_for_formats(formats: &str) -> MediaType {
    let mut media = MediaType::Unspecified;
    for format in formats.split(',').map(|f| f.trim().to_ascii_uppercase()) {
        match format.as_str() {
            "EPUB" | "KEPUB" | "MOBI" | "AZW" | "AZW3" | "AZW4" | "KFX" | "PDF" | "FB2" | "DJVU"
            | "CBZ" | "CBR" | "LIT" | "PDB" | "RTF" | "TXT" | "DOCX" | "HTMLZ" => {
                return MediaType::Ebook
            }
            "M4B" | "MP3" | "M4A" | "AAC" | "OGG" | "OPUS" | "FLAC" => {
                media = MediaType::Audiobook
            }
            _ => {}
        }
    }
    media
}
