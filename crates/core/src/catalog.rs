//! The catalog collaborator: where synced books and memberships live.
//!
//! The sync engine only talks to the catalog through [`CatalogStore`], so
//! the storage backend can be swapped without touching reconciliation. The
//! SQLite [`Database`](crate::db::Database) is the production
//! implementation.
//!
//! Uniqueness (one book per ISBN, one membership per book + media type) is
//! enforced by the store. A losing writer gets [`CatalogError::Conflict`].

use std::sync::OnceLock;

use regex_lite::Regex;

use crate::errors::CatalogError;
use crate::models::{Book, BookUpdate, MediaType, Membership, NewBook};

/// Storage operations the sync engine needs from the catalog.
pub trait CatalogStore: Send + Sync {
    /// Find a book by ISBN-10 or ISBN-13 (matched against the column of
    /// the same length).
    fn find_book_by_isbn(&self, isbn: &str) -> Result<Option<Book>, CatalogError>;

    /// Find a book whose normalized title and author equal those of the
    /// arguments.
    fn find_book_by_title_author(
        &self,
        title: &str,
        author: &str,
    ) -> Result<Option<Book>, CatalogError>;

    fn create_book(&self, attrs: &NewBook) -> Result<Book, CatalogError>;

    fn update_book(&self, book: &Book, attrs: &BookUpdate) -> Result<Book, CatalogError>;

    fn add_membership(
        &self,
        book: &Book,
        media_type: MediaType,
    ) -> Result<Membership, CatalogError>;

    fn has_membership(&self, book: &Book, media_type: MediaType) -> Result<bool, CatalogError>;
}

// ---------------------------------------------------------------------------
// Title / author normalization
// ---------------------------------------------------------------------------

/// Trailing format and edition qualifiers stripped before comparing titles.
const TITLE_QUALIFIER_PATTERN: &str = r"(?i)\s*[(\[]\s*(?:unabridged|abridged|hardcover|hardback|paperback|mass market paperback|ebook|e-book|audiobook|audio cd|audible audio|\d+(?:st|nd|rd|th) edition|[a-z' -]*edition)\s*[)\]]\s*$";

fn title_qualifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(TITLE_QUALIFIER_PATTERN).expect("title qualifier pattern is valid"))
}

/// Strip trailing qualifiers such as `(Unabridged)`, `(Hardcover)` or
/// `(2nd Edition)` and trim whitespace. Repeated qualifiers are all removed.
pub fn normalize_title(title: &str) -> String {
    let re = title_qualifier_regex();
    let mut current = title.trim().to_string();
    loop {
        let stripped = re.replace(&current, "").trim().to_string();
        if stripped == current || stripped.is_empty() {
            return current;
        }
        current = stripped;
    }
}

/// Authors are compared after trimming and collapsing inner whitespace.
pub fn normalize_author(author: &str) -> String {
    author.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_title_strips_qualifiers() {
        assert_eq!(normalize_title("The Martian (Unabridged)"), "The Martian");
        assert_eq!(normalize_title("1984 (Kindle Edition)"), "1984");
        assert_eq!(normalize_title("Dune (Hardcover)"), "Dune");
        assert_eq!(normalize_title("SICP (2nd Edition)"), "SICP");
        assert_eq!(normalize_title("Emma [Paperback]"), "Emma");
    }

    #[test]
    fn test_normalize_title_without_qualifier_is_unchanged() {
        assert_eq!(normalize_title("The Hobbit"), "The Hobbit");
        assert_eq!(
            normalize_title("Harry Potter (Book 1) and more"),
            "Harry Potter (Book 1) and more"
        );
    }

    #[test]
    fn test_normalize_title_trims_and_repeats() {
        assert_eq!(
            normalize_title("  Project Hail Mary (Unabridged) (Audiobook)  "),
            "Project Hail Mary"
        );
    }

    #[test]
    fn test_normalize_title_never_empties() {
        assert_eq!(normalize_title("(Unabridged)"), "(Unabridged)");
    }

    #[test]
    fn test_normalize_author_collapses_whitespace() {
        assert_eq!(normalize_author("  Andy   Weir "), "Andy Weir");
    }
}
