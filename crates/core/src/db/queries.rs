//! Typed query helpers for every table in the shelfsync database.
//!
//! [`Database`] implements both collaborator traits used by the core:
//! [`CatalogStore`] for books and memberships, and [`SettingsStore`] for
//! the operator's refresh interval.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use super::Database;
use crate::catalog::{normalize_author, normalize_title, CatalogStore};
use crate::errors::{CatalogError, DatabaseError};
use crate::models::{Book, BookUpdate, MediaType, Membership, NewBook};
use crate::settings::{SettingsStore, REFRESH_INTERVAL_KEY};

const BOOK_COLUMNS: &str = "id, title, author, isbn10, isbn13, publisher, publication_date, pages, \
     cover_url, subtitle, description, genre, series, series_number, original_title, \
     created_at, updated_at";

fn parse_timestamp(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_book(row: &Row<'_>) -> rusqlite::Result<Book> {
    Ok(Book {
        id: row.get(0)?,
        title: row.get(1)?,
        author: row.get(2)?,
        isbn10: row.get(3)?,
        isbn13: row.get(4)?,
        publisher: row.get(5)?,
        publication_date: row.get(6)?,
        pages: row.get(7)?,
        cover_url: row.get(8)?,
        subtitle: row.get(9)?,
        description: row.get(10)?,
        genre: row.get(11)?,
        series: row.get(12)?,
        series_number: row.get(13)?,
        original_title: row.get(14)?,
        created_at: parse_timestamp(15, row.get(15)?)?,
        updated_at: parse_timestamp(16, row.get(16)?)?,
    })
}

/// Keep only the characters that can appear in an ISBN.
fn isbn_digits(isbn: &str) -> String {
    isbn.chars()
        .filter(|c| c.is_ascii_digit() || *c == 'X' || *c == 'x')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- books --------------------------------------------------------------

    /// Fetch a book by its id.
    pub fn get_book(&self, id: &str) -> Result<Book, DatabaseError> {
        let conn = self.conn();
        let sql = format!("SELECT {BOOK_COLUMNS} FROM books WHERE id = ?1");
        conn.query_row(&sql, params![id], row_to_book)
            .optional()?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "book".into(),
                id: id.into(),
            })
    }

    /// Total number of books in the catalog.
    pub fn count_books(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // -- memberships --------------------------------------------------------

    /// Total number of memberships in the catalog.
    pub fn count_memberships(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM memberships", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// All memberships of one book, oldest first.
    pub fn list_memberships(&self, book_id: &str) -> Result<Vec<Membership>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, book_id, media_type, created_at FROM memberships
             WHERE book_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![book_id], |row| {
                let media_type: String = row.get(2)?;
                Ok(Membership {
                    id: row.get(0)?,
                    book_id: row.get(1)?,
                    media_type: MediaType::from_str_val(&media_type),
                    created_at: parse_timestamp(3, row.get(3)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- kv_state -----------------------------------------------------------

    /// Get a value from the key-value state table.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Set a key-value state entry (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        debug!(key, value, "set kv_state");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Catalog store
// ---------------------------------------------------------------------------

impl CatalogStore for Database {
    fn find_book_by_isbn(&self, isbn: &str) -> Result<Option<Book>, CatalogError> {
        let isbn = isbn_digits(isbn);
        let where_clause = match isbn.len() {
            13 => "isbn13 = ?1",
            10 => "isbn10 = ?1",
            _ => return Ok(None),
        };
        let conn = self.conn();
        let sql = format!("SELECT {BOOK_COLUMNS} FROM books WHERE {where_clause} LIMIT 1");
        let book = conn.query_row(&sql, params![isbn], row_to_book).optional()?;
        Ok(book)
    }

    fn find_book_by_title_author(
        &self,
        title: &str,
        author: &str,
    ) -> Result<Option<Book>, CatalogError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {BOOK_COLUMNS} FROM books
             WHERE normalized_title = ?1 AND normalized_author = ?2
             ORDER BY created_at LIMIT 1"
        );
        let book = conn
            .query_row(
                &sql,
                params![normalize_title(title), normalize_author(author)],
                row_to_book,
            )
            .optional()?;
        Ok(book)
    }

    fn create_book(&self, attrs: &NewBook) -> Result<Book, CatalogError> {
        if attrs.title.trim().is_empty() {
            return Err(CatalogError::Invalid("title must not be empty".into()));
        }
        if attrs.author.trim().is_empty() {
            return Err(CatalogError::Invalid("author must not be empty".into()));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let isbn10 = attrs.isbn10.as_deref().map(isbn_digits);
        let isbn13 = attrs.isbn13.as_deref().map(isbn_digits);

        let conn = self.conn();
        conn.execute(
            "INSERT INTO books (id, title, author, isbn10, isbn13, publisher, publication_date,
                pages, cover_url, subtitle, description, genre, series, series_number,
                original_title, normalized_title, normalized_author, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18)",
            params![
                id,
                attrs.title,
                attrs.author,
                isbn10,
                isbn13,
                attrs.publisher,
                attrs.publication_date,
                attrs.pages,
                attrs.cover_url,
                attrs.subtitle,
                attrs.description,
                attrs.genre,
                attrs.series,
                attrs.series_number,
                attrs.original_title,
                normalize_title(&attrs.title),
                normalize_author(&attrs.author),
                now_str,
            ],
        )?;
        debug!(id = %id, title = %attrs.title, "inserted book");

        Ok(Book {
            id,
            title: attrs.title.clone(),
            author: attrs.author.clone(),
            isbn10,
            isbn13,
            publisher: attrs.publisher.clone(),
            publication_date: attrs.publication_date.clone(),
            pages: attrs.pages,
            cover_url: attrs.cover_url.clone(),
            subtitle: attrs.subtitle.clone(),
            description: attrs.description.clone(),
            genre: attrs.genre.clone(),
            series: attrs.series.clone(),
            series_number: attrs.series_number.clone(),
            original_title: attrs.original_title.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    fn update_book(&self, book: &Book, attrs: &BookUpdate) -> Result<Book, CatalogError> {
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.conn();
            let changed = conn.execute(
                "UPDATE books SET cover_url = COALESCE(?1, cover_url), updated_at = ?2
                 WHERE id = ?3",
                params![attrs.cover_url, now, book.id],
            )?;
            if changed == 0 {
                return Err(CatalogError::Storage(DatabaseError::NotFound {
                    entity: "book".into(),
                    id: book.id.clone(),
                }));
            }
        }
        debug!(id = %book.id, "updated book");
        Ok(self.get_book(&book.id)?)
    }

    fn add_membership(
        &self,
        book: &Book,
        media_type: MediaType,
    ) -> Result<Membership, CatalogError> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO memberships (book_id, media_type, created_at) VALUES (?1, ?2, ?3)",
            params![book.id, media_type.as_str(), now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, book_id = %book.id, %media_type, "inserted membership");
        Ok(Membership {
            id,
            book_id: book.id.clone(),
            media_type,
            created_at: now,
        })
    }

    fn has_membership(&self, book: &Book, media_type: MediaType) -> Result<bool, CatalogError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memberships WHERE book_id = ?1 AND media_type = ?2",
            params![book.id, media_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

// ---------------------------------------------------------------------------
// Settings store
// ---------------------------------------------------------------------------

impl SettingsStore for Database {
    fn get_refresh_interval(&self) -> Result<Option<String>, DatabaseError> {
        self.get_state(REFRESH_INTERVAL_KEY)
    }

    fn set_refresh_interval(&self, interval: &str) -> Result<(), DatabaseError> {
        self.set_state(REFRESH_INTERVAL_KEY, interval)
    }
}
