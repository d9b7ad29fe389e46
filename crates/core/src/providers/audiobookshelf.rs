//! Audiobookshelf adapter.
//!
//! Talks to an Audiobookshelf server's REST API with a bearer token.
//! Libraries are discovered with `GET /api/libraries` unless specific ids
//! are configured; each book library is paged through
//! `GET /api/libraries/{id}/items?limit=N&page=n`.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::pagination::{paginate, Page, PageSource};
use super::{
    apply_isbn, collect_stream, non_blank, partial_date, LibraryProvider, ProviderStream,
    RecordStream, TotalHint,
};
use crate::config::AudiobookshelfConfig;
use crate::errors::ProviderError;
use crate::models::{BookSyncRecord, MediaType};

pub const PROVIDER_NAME: &str = "audiobookshelf";

/// Minimal HTTP client for the parts of the Audiobookshelf API we use.
#[derive(Clone)]
struct AbsClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct LibrariesResponse {
    libraries: Vec<LibrarySummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibrarySummary {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    media_type: String,
}

#[derive(Debug, Deserialize)]
struct ItemsPage {
    /// Items are kept as raw JSON so one bad item does not fail the page.
    #[serde(default)]
    results: Vec<Value>,
    total: Option<u64>,
}

impl AbsClient {
    fn new(config: &AudiobookshelfConfig, token: String) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("shelfsync/", env!("CARGO_PKG_VERSION"))),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body: if body.is_empty() {
                    format!("HTTP {status}")
                } else {
                    body
                },
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| ProviderError::Parse(format!("{path}: {e}")))
    }

    #[instrument(skip(self))]
    async fn book_library_ids(&self) -> Result<Vec<String>, ProviderError> {
        let resp: LibrariesResponse = self.get_json("/api/libraries", &[]).await?;
        let ids: Vec<String> = resp
            .libraries
            .into_iter()
            .filter(|l| l.media_type == "book")
            .inspect(|l| debug!(id = %l.id, name = %l.name, "found book library"))
            .map(|l| l.id)
            .collect();
        info!(count = ids.len(), "discovered audiobookshelf book libraries");
        Ok(ids)
    }
}

/// Adapter for an Audiobookshelf server.
pub struct AudiobookshelfProvider {
    config: Option<AudiobookshelfConfig>,
    client: Option<AbsClient>,
}

impl AudiobookshelfProvider {
    pub fn new(config: Option<AudiobookshelfConfig>) -> Result<Self, ProviderError> {
        let client = match &config {
            Some(c) if !c.url.trim().is_empty() => match c.token.as_deref() {
                Some(token) if !token.is_empty() => Some(AbsClient::new(c, token.to_string())?),
                _ => None,
            },
            _ => None,
        };
        Ok(Self { config, client })
    }

    fn parts(&self) -> Result<(&AudiobookshelfConfig, &AbsClient), ProviderError> {
        match (&self.config, &self.client) {
            (Some(config), Some(client)) => Ok((config, client)),
            _ => Err(ProviderError::NotConfigured(PROVIDER_NAME.into())),
        }
    }
}

#[async_trait]
impl LibraryProvider for AudiobookshelfProvider {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    async fn fetch_all(&self) -> Result<Vec<BookSyncRecord>, ProviderError> {
        match self.stream().await? {
            Some(stream) => collect_stream(stream.records).await,
            None => Ok(Vec::new()),
        }
    }

    async fn stream(&self) -> Result<Option<ProviderStream>, ProviderError> {
        let (config, client) = self.parts()?;

        let library_ids = if config.library_ids.is_empty() {
            client.book_library_ids().await?
        } else {
            config.library_ids.clone()
        };

        let page_size = u64::from(config.page_size);
        let total = TotalHint::default();
        let streams: Vec<RecordStream> = library_ids
            .into_iter()
            .map(|library_id| {
                let source = LibraryItems {
                    label: format!("{PROVIDER_NAME}:{library_id}"),
                    client: client.clone(),
                    library_id,
                };
                paginate(source, page_size, total.clone())
            })
            .collect();

        let records = stream::iter(streams).flatten().boxed();
        Ok(Some(ProviderStream::new(records, total)))
    }
}

// ---------------------------------------------------------------------------
// Page source
// ---------------------------------------------------------------------------

struct LibraryItems {
    label: String,
    client: AbsClient,
    library_id: String,
}

#[async_trait]
impl PageSource for LibraryItems {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch_page(
        &mut self,
        page_index: u64,
        page_size: u64,
    ) -> Result<Page, ProviderError> {
        let path = format!("/api/libraries/{}/items", self.library_id);
        let page: ItemsPage = self
            .client
            .get_json(
                &path,
                &[
                    ("limit", page_size.to_string()),
                    ("page", page_index.to_string()),
                    ("minified", "1".to_string()),
                ],
            )
            .await?;

        let base = &self.client.base_url;
        Ok(Page {
            items: page.results.iter().map(|item| item_to_record(base, item)).collect(),
            total: page.total,
        })
    }
}

// ---------------------------------------------------------------------------
// Item mapping
// ---------------------------------------------------------------------------

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn non_empty_array(value: &Value, pointer: &str) -> bool {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .is_some_and(|a| !a.is_empty())
}

fn positive_number(value: &Value, pointer: &str) -> bool {
    value
        .pointer(pointer)
        .and_then(Value::as_u64)
        .is_some_and(|n| n > 0)
}

/// Map one library item (minified or expanded form) to a record.
fn item_to_record(base_url: &str, item: &Value) -> Result<BookSyncRecord, String> {
    let id = str_at(item, "/id")
        .filter(|s| !s.is_empty())
        .ok_or("item has no id")?;
    let media = item
        .get("media")
        .filter(|m| m.is_object())
        .ok_or_else(|| format!("item {id} has no media"))?;
    let metadata = media.get("metadata").unwrap_or(&Value::Null);

    let author = match str_at(metadata, "/authorName") {
        Some(name) => Some(name.to_string()),
        None => metadata
            .get("authors")
            .and_then(Value::as_array)
            .map(|authors| {
                authors
                    .iter()
                    .filter_map(|a| a.get("name").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join(", ")
            }),
    };

    let mut record = BookSyncRecord::new(str_at(metadata, "/title"), author.as_deref());
    record.external_id = Some(id.to_string());
    record.subtitle = non_blank(str_at(metadata, "/subtitle"));
    record.publisher = non_blank(str_at(metadata, "/publisher"));
    record.description = non_blank(str_at(metadata, "/description"));
    record.genre = metadata
        .get("genres")
        .and_then(Value::as_array)
        .and_then(|g| g.first())
        .and_then(Value::as_str)
        .and_then(|g| non_blank(Some(g)));

    if let Some(isbn) = str_at(metadata, "/isbn") {
        apply_isbn(&mut record, isbn);
    }

    record.publication_date = str_at(metadata, "/publishedDate")
        .and_then(partial_date)
        .or_else(|| str_at(metadata, "/publishedYear").and_then(partial_date));

    let (series, series_number) = series_of(metadata);
    record.series = series;
    record.series_number = series_number;

    if media.get("coverPath").is_some_and(|c| !c.is_null()) {
        record.cover_url = Some(format!("{base_url}/api/items/{id}/cover"));
    }

    record.media_type = media_type_of(media);
    Ok(record)
}

/// Series from either the expanded `series: [{name, sequence}]` form or the
/// minified `seriesName: "Name #3"` form.
fn series_of(metadata: &Value) -> (Option<String>, Option<String>) {
    if let Some(first) = metadata
        .get("series")
        .and_then(Value::as_array)
        .and_then(|s| s.first())
    {
        return (
            non_blank(first.get("name").and_then(Value::as_str)),
            non_blank(first.get("sequence").and_then(Value::as_str)),
        );
    }

    let Some(raw) = non_blank(str_at(metadata, "/seriesName")) else {
        return (None, None);
    };
    // Only the first series of a comma-separated list is kept.
    let first = raw.split(", ").next().unwrap_or(&raw);
    match first.rsplit_once(" #") {
        Some((name, number)) => (non_blank(Some(name)), non_blank(Some(number))),
        None => (Some(first.to_string()), None),
    }
}

fn media_type_of(media: &Value) -> MediaType {
    let has_audio = positive_number(media, "/numAudioFiles")
        || positive_number(media, "/numTracks")
        || non_empty_array(media, "/audioFiles")
        || non_empty_array(media, "/tracks");
    if has_audio {
        return MediaType::Audiobook;
    }

    let has_ebook = media.get("ebookFormat").is_some_and(|f| !f.is_null())
        || media.get("ebookFile").is_some_and(|f| !f.is_null());
    if has_ebook {
        MediaType::Ebook
    } else {
        MediaType::Unspecified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str, library_ids: Vec<&str>, page_size: u32) -> AudiobookshelfConfig {
        AudiobookshelfConfig {
            url: url.to_string(),
            token_env: "ABS_TOKEN".into(),
            library_ids: library_ids.into_iter().map(String::from).collect(),
            page_size,
            request_timeout_secs: 5,
            connect_timeout_secs: 5,
            token: Some("secret-token".into()),
        }
    }

    fn audio_item(i: usize) -> Value {
        json!({
            "id": format!("li_{i}"),
            "mediaType": "book",
            "media": {
                "metadata": {
                    "title": format!("Title {i}"),
                    "authorName": "Some Author",
                    "isbn": format!("978{:010}", i),
                    "publishedYear": "2015",
                },
                "coverPath": "/metadata/items/cover.jpg",
                "numAudioFiles": 3,
                "numTracks": 3,
                "ebookFormat": null,
            }
        })
    }

    async fn mount_page(
        server: &MockServer,
        library: &str,
        page: usize,
        limit: usize,
        items: Vec<Value>,
        total: usize,
    ) {
        Mock::given(method("GET"))
            .and(path(format!("/api/libraries/{library}/items")))
            .and(query_param("page", page.to_string()))
            .and(query_param("limit", limit.to_string()))
            .and(header("authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": items,
                "total": total,
                "limit": limit,
                "page": page,
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[test]
    fn test_unconfigured_without_token_or_url() {
        assert!(!AudiobookshelfProvider::new(None).unwrap().is_configured());

        let mut c = config("http://abs.local", vec![], 10);
        c.token = None;
        assert!(!AudiobookshelfProvider::new(Some(c)).unwrap().is_configured());

        let c = config("  ", vec![], 10);
        assert!(!AudiobookshelfProvider::new(Some(c)).unwrap().is_configured());

        let c = config("http://abs.local", vec![], 10);
        assert!(AudiobookshelfProvider::new(Some(c)).unwrap().is_configured());
    }

    #[tokio::test]
    async fn test_pages_through_configured_library() {
        let server = MockServer::start().await;
        let items: Vec<Value> = (0..5).map(audio_item).collect();
        mount_page(&server, "lib1", 0, 2, items[0..2].to_vec(), 5).await;
        mount_page(&server, "lib1", 1, 2, items[2..4].to_vec(), 5).await;
        mount_page(&server, "lib1", 2, 2, items[4..5].to_vec(), 5).await;

        let p = AudiobookshelfProvider::new(Some(config(&server.uri(), vec!["lib1"], 2))).unwrap();
        let records = p.fetch_all().await.unwrap();

        assert_eq!(records.len(), 5);
        let first = &records[0];
        assert_eq!(first.title, "Title 0");
        assert_eq!(first.author, "Some Author");
        assert_eq!(first.media_type, MediaType::Audiobook);
        assert_eq!(first.isbn13.as_deref(), Some("9780000000000"));
        assert_eq!(first.publication_date.as_deref(), Some("2015"));
        assert_eq!(first.external_id.as_deref(), Some("li_0"));
        assert_eq!(
            first.cover_url,
            Some(format!("{}/api/items/li_0/cover", server.uri()))
        );
    }

    #[tokio::test]
    async fn test_discovers_book_libraries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/libraries"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "libraries": [
                    {"id": "books", "name": "Audiobooks", "mediaType": "book"},
                    {"id": "pods", "name": "Podcasts", "mediaType": "podcast"},
                    {"id": "ebooks", "name": "Ebooks", "mediaType": "book"},
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_page(&server, "books", 0, 10, vec![audio_item(1)], 1).await;
        mount_page(
            &server,
            "ebooks",
            0,
            10,
            vec![json!({
                "id": "eb_1",
                "media": {
                    "metadata": {"title": "Dune", "authorName": "Frank Herbert"},
                    "ebookFormat": "epub",
                    "numAudioFiles": 0,
                }
            })],
            1,
        )
        .await;

        let p = AudiobookshelfProvider::new(Some(config(&server.uri(), vec![], 10))).unwrap();
        let records = p.fetch_all().await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].media_type, MediaType::Audiobook);
        assert_eq!(records[1].title, "Dune");
        assert_eq!(records[1].media_type, MediaType::Ebook);
        assert_eq!(records[1].cover_url, None);
    }

    #[tokio::test]
    async fn test_malformed_items_are_skipped() {
        let server = MockServer::start().await;
        mount_page(
            &server,
            "lib1",
            0,
            10,
            vec![
                audio_item(1),
                json!({"media": {"metadata": {"title": "No id"}}}),
                json!({"id": "li_x", "media": "not an object"}),
                json!("garbage"),
                audio_item(2),
            ],
            5,
        )
        .await;

        let p = AudiobookshelfProvider::new(Some(config(&server.uri(), vec!["lib1"], 10))).unwrap();
        let records = p.fetch_all().await.unwrap();
        let titles: Vec<_> = records.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Title 1", "Title 2"]);
    }

    #[tokio::test]
    async fn test_page_failure_aborts_stream() {
        let server = MockServer::start().await;
        let items: Vec<Value> = (0..4).map(audio_item).collect();
        mount_page(&server, "lib1", 0, 2, items[0..2].to_vec(), 4).await;
        Mock::given(method("GET"))
            .and(path("/api/libraries/lib1/items"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let p = AudiobookshelfProvider::new(Some(config(&server.uri(), vec!["lib1"], 2))).unwrap();
        let mut stream = p.stream().await.unwrap().unwrap().records;

        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 502, ref body } if body == "bad gateway"));
    }

    #[tokio::test]
    async fn test_stalled_page_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/libraries/lib1/items"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"results": [], "total": 0}))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let mut c = config(&server.uri(), vec!["lib1"], 2);
        c.request_timeout_secs = 1;
        let p = AudiobookshelfProvider::new(Some(c)).unwrap();
        let mut stream = p.stream().await.unwrap().unwrap().records;

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ProviderError::Http(ref e) if e.is_timeout()), "{err}");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_reported_totals_add_up_across_libraries() {
        let server = MockServer::start().await;
        let items: Vec<Value> = (0..3).map(audio_item).collect();
        mount_page(&server, "lib1", 0, 2, items[0..2].to_vec(), 2).await;
        mount_page(&server, "lib2", 0, 2, items[2..3].to_vec(), 1).await;

        let p = AudiobookshelfProvider::new(Some(config(&server.uri(), vec!["lib1", "lib2"], 2)))
            .unwrap();
        let opened = p.stream().await.unwrap().unwrap();
        let total = opened.total.clone();
        let records = collect_stream(opened.records).await.unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(total.get(), Some(3));
    }

    #[tokio::test]
    async fn test_library_discovery_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/libraries"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let p = AudiobookshelfProvider::new(Some(config(&server.uri(), vec![], 10))).unwrap();
        let err = p.stream().await.err().unwrap();
        assert!(matches!(err, ProviderError::Api { status: 401, .. }));
    }

    #[test]
    fn test_expanded_item_mapping() {
        let item = json!({
            "id": "li_9",
            "media": {
                "metadata": {
                    "title": "Good Omens",
                    "subtitle": "The Nice and Accurate Prophecies",
                    "authors": [{"id": "a1", "name": "Neil Gaiman"}, {"id": "a2", "name": "Terry Pratchett"}],
                    "series": [{"id": "s1", "name": "Standalone", "sequence": "1"}],
                    "genres": ["Fantasy", "Humor"],
                    "publishedDate": "2006-11-28",
                    "publisher": "HarperCollins",
                    "isbn": "0-06-085398-4",
                },
                "coverPath": null,
                "audioFiles": [],
                "tracks": [],
                "ebookFile": {"ebookFormat": "epub"},
            }
        });
        let r = item_to_record("http://abs", &item).unwrap();
        assert_eq!(r.author, "Neil Gaiman, Terry Pratchett");
        assert_eq!(r.subtitle.as_deref(), Some("The Nice and Accurate Prophecies"));
        assert_eq!(r.series.as_deref(), Some("Standalone"));
        assert_eq!(r.series_number.as_deref(), Some("1"));
        assert_eq!(r.genre.as_deref(), Some("Fantasy"));
        assert_eq!(r.publication_date.as_deref(), Some("2006-11-28"));
        assert_eq!(r.isbn10.as_deref(), Some("0060853984"));
        assert_eq!(r.cover_url, None);
        assert_eq!(r.media_type, MediaType::Ebook);
    }

    #[test]
    fn test_minified_series_name() {
        let metadata = json!({"seriesName": "The Expanse #3, Other #1"});
        assert_eq!(
            series_of(&metadata),
            (Some("The Expanse".into()), Some("3".into()))
        );
        let metadata = json!({"seriesName": "Discworld"});
        assert_eq!(series_of(&metadata), (Some("Discworld".into()), None));
        assert_eq!(series_of(&json!({})), (None, None));
    }

    #[test]
    fn test_item_without_media_files_is_unspecified() {
        let item = json!({"id": "li_1", "media": {"metadata": {}}});
        let r = item_to_record("http://abs", &item).unwrap();
        assert_eq!(r.media_type, MediaType::Unspecified);
        assert_eq!(r.title, crate::models::UNKNOWN_TITLE);
    }
}
