//! Cursor-driven pagination over a [`RetryingFetcher`]
//!
//! A source describes its API through [`CursorProtocol`]: how to build the
//! request for a cursor, how to read a page out of the response body, and how
//! to derive the next cursor from the page just received. The [`Paginator`]
//! owns the cursor and decides when to stop.

use futures::stream::{self, Stream};
use serde_json::Value as Json;
use std::fmt::Debug;
use tracing::{debug, warn};

use crate::error::IngestResult;
use crate::http::{FetchRequest, RetryingFetcher};

/// What one response body contained
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome<T> {
    Items(Vec<T>),
    /// The API explicitly reported an empty result set. Terminates normally.
    NoResults,
}

pub trait CursorProtocol: Send + Sync {
    type Cursor: Clone + PartialOrd + Debug + Send + Sync;
    type Item: Send;

    fn request(&self, cursor: &Self::Cursor, page_size: usize) -> FetchRequest;

    /// Distinguish items, "no results" and errors. A transient error is
    /// retried with the same cursor; any other error ends pagination.
    fn interpret(&self, body: Json) -> IngestResult<PageOutcome<Self::Item>>;

    /// Next cursor derived from the page's items, `None` if none can be
    /// derived.
    fn advance(&self, cursor: &Self::Cursor, page: &[Self::Item]) -> Option<Self::Cursor>;
}

/// Lazy, finite, single-use page sequence.
///
/// Terminates after a "no results" response, an empty page, a short page
/// (fewer items than `page_size`), a cursor that fails to move strictly
/// forward, or the first error. Once terminated it never issues another
/// request; build a new paginator to start over.
pub struct Paginator<P: CursorProtocol> {
    fetcher: RetryingFetcher,
    protocol: P,
    page_size: usize,
    cursor: Option<P::Cursor>,
    pages_fetched: usize,
}

impl<P: CursorProtocol> Paginator<P> {
    pub fn new(fetcher: RetryingFetcher, protocol: P, initial: P::Cursor, page_size: usize) -> Self {
        Self {
            fetcher,
            protocol,
            page_size: page_size.max(1),
            cursor: Some(initial),
            pages_fetched: 0,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.is_none()
    }

    /// Fetch the next page. `Ok(None)` means the sequence is exhausted.
    pub async fn next_page(&mut self) -> IngestResult<Option<Vec<P::Item>>> {
        let Some(cursor) = self.cursor.take() else {
            return Ok(None);
        };

        let request = self.protocol.request(&cursor, self.page_size);
        let protocol = &self.protocol;
        let outcome = self
            .fetcher
            .fetch_with(&request, |body| protocol.interpret(body))
            .await?;

        let items = match outcome {
            PageOutcome::NoResults => {
                debug!(source = self.fetcher.source(), ?cursor, "No further results");
                return Ok(None);
            }
            PageOutcome::Items(items) if items.is_empty() => {
                debug!(source = self.fetcher.source(), ?cursor, "Empty page");
                return Ok(None);
            }
            PageOutcome::Items(items) => items,
        };

        self.pages_fetched += 1;
        debug!(
            source = self.fetcher.source(),
            ?cursor,
            page = self.pages_fetched,
            items = items.len(),
            "Fetched page"
        );

        if items.len() < self.page_size {
            return Ok(Some(items));
        }

        self.cursor = match self.protocol.advance(&cursor, &items) {
            Some(next) if next > cursor => Some(next),
            Some(next) => {
                warn!(
                    source = self.fetcher.source(),
                    ?cursor,
                    ?next,
                    "Cursor did not advance, stopping pagination"
                );
                None
            }
            None => None,
        };

        Ok(Some(items))
    }

    pub fn into_stream(self) -> impl Stream<Item = IngestResult<Vec<P::Item>>> {
        stream::try_unfold(self, |mut paginator| async move {
            Ok(paginator
                .next_page()
                .await?
                .map(|page| (page, paginator)))
        })
    }

    /// Drain every page into one vector
    pub async fn collect_all(mut self) -> IngestResult<Vec<P::Item>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::http::{RateLimiter, RetryPolicy};
    use futures::TryStreamExt;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// `GET /items?from=<n>&limit=<k>` returning `{"items": [n, ...]}`
    struct OffsetProtocol {
        base_url: String,
        stuck: bool,
    }

    impl CursorProtocol for OffsetProtocol {
        type Cursor = u64;
        type Item = u64;

        fn request(&self, cursor: &u64, page_size: usize) -> FetchRequest {
            FetchRequest::get(format!("{}/items", self.base_url))
                .query("from", cursor)
                .query("limit", page_size)
        }

        fn interpret(&self, body: Json) -> IngestResult<PageOutcome<u64>> {
            if body.get("error").is_some() {
                return Err(IngestError::permanent("items", None, "upstream error"));
            }
            match body.get("items").and_then(Json::as_array) {
                Some(items) => Ok(PageOutcome::Items(
                    items.iter().filter_map(Json::as_u64).collect(),
                )),
                None => Ok(PageOutcome::NoResults),
            }
        }

        fn advance(&self, cursor: &u64, page: &[u64]) -> Option<u64> {
            if self.stuck {
                return Some(*cursor);
            }
            page.iter().max().map(|last| last + 1)
        }
    }

    fn paginator(server: &MockServer, stuck: bool) -> Paginator<OffsetProtocol> {
        let fetcher = RetryingFetcher::new(
            "test",
            reqwest::Client::new(),
            Arc::new(RateLimiter::with_interval(Duration::ZERO)),
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
            CancellationToken::new(),
        );
        let protocol = OffsetProtocol {
            base_url: server.uri(),
            stuck,
        };
        Paginator::new(fetcher, protocol, 0, 3)
    }

    async fn mount_page(server: &MockServer, from: &str, body: Json) {
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("from", from))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_short_page_ends_without_extra_request() {
        let server = MockServer::start().await;
        mount_page(&server, "0", json!({"items": [0, 1, 2]})).await;
        mount_page(&server, "3", json!({"items": [3, 4]})).await;

        let items = paginator(&server, false).collect_all().await.unwrap();

        assert_eq!(items, vec![0, 1, 2, 3, 4]);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_first_page_yields_nothing() {
        let server = MockServer::start().await;
        mount_page(&server, "0", json!({"items": []})).await;

        let mut pages = paginator(&server, false);
        assert!(pages.next_page().await.unwrap().is_none());
        assert!(pages.is_exhausted());
        assert!(pages.next_page().await.unwrap().is_none());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_results_signal_after_full_page() {
        let server = MockServer::start().await;
        mount_page(&server, "0", json!({"items": [0, 1, 2]})).await;
        mount_page(&server, "3", json!({"status": "none"})).await;

        let pages: Vec<Vec<u64>> = paginator(&server, false)
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pages, vec![vec![0, 1, 2]]);
    }

    #[tokio::test]
    async fn test_hard_error_surfaces_and_terminates() {
        let server = MockServer::start().await;
        mount_page(&server, "0", json!({"items": [0, 1, 2]})).await;
        mount_page(&server, "3", json!({"error": "rate limited forever"})).await;

        let mut pages = paginator(&server, false);
        assert!(pages.next_page().await.unwrap().is_some());
        assert!(pages.next_page().await.is_err());
        assert!(pages.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_advancing_cursor_stops() {
        let server = MockServer::start().await;
        mount_page(&server, "0", json!({"items": [0, 1, 2]})).await;

        let mut pages = paginator(&server, true);
        assert_eq!(pages.next_page().await.unwrap(), Some(vec![0, 1, 2]));
        assert!(pages.next_page().await.unwrap().is_none());
        assert_eq!(pages.pages_fetched(), 1);
    }
}
