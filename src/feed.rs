use crate::config::SyncConfig;
use crate::http::build_client;
use crate::models::value_to_string;
use crate::sources::SourceAdapter;
use crate::sync::{SyncError, SyncErrorKind};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reqwest::{Client, StatusCode, header::ACCEPT};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

/// One record on the provider's offer/change stream. The snapshot and the
/// change feed share this envelope shape across every auto-api.com dialect.
#[derive(Debug, Clone, Deserialize)]
pub struct OfferEnvelope {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub inner_id: Value,
    #[serde(default)]
    pub change_type: ChangeType,
    #[serde(default)]
    pub data: Value,
    /// Some providers hoist option/equipment data to the envelope level.
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    #[default]
    Added,
    #[serde(alias = "updated")]
    Changed,
    Removed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub next_page: Option<u32>,
    #[serde(default)]
    pub next_change_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedPage {
    #[serde(default)]
    pub result: Vec<OfferEnvelope>,
    #[serde(default)]
    pub meta: PageMeta,
}

/// Everything one full-snapshot pagination pass produced. `offers` is
/// already deduplicated by `inner_id`; the raw sighting count stays in
/// `processed` so run stats can report both.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub offers: Vec<OfferEnvelope>,
    pub processed: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub pages_fetched: u32,
    pub page_errors: u64,
    /// True when the API itself signalled the end of the listing, false
    /// when pagination stopped on the page cap or a failed page.
    pub exhausted: bool,
}

#[derive(Debug, Default)]
pub struct ChangeBatch {
    pub changes: Vec<OfferEnvelope>,
    pub last_change_id: i64,
    pub pages_fetched: u32,
    pub page_errors: u64,
}

/// Paginates remote offer/change streams with pacing, bounded retry and
/// intra-run deduplication. Stateless between calls apart from the HTTP
/// client; the cursor always comes from the caller.
pub struct ChangeFeedReader {
    client: Client,
    page_delay: Duration,
    max_retries: u32,
    retry_base_delay_ms: u64,
    empty_page_limit: u32,
}

impl ChangeFeedReader {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            client: build_client(),
            page_delay: Duration::from_millis(config.page_delay_ms),
            max_retries: config.max_retries,
            retry_base_delay_ms: config.retry_base_delay_ms,
            empty_page_limit: config.empty_page_limit,
        }
    }

    /// Fetch one page, retrying transient failures (429/5xx/transport) with
    /// doubling backoff plus jitter. Auth failures surface immediately.
    pub async fn fetch_feed_page(&self, url: &str) -> Result<FeedPage, SyncError> {
        let mut rng = SmallRng::from_os_rng();
        let mut attempt = 0u32;
        loop {
            match self.try_fetch(url).await {
                Ok(page) => return Ok(page),
                Err(err) => {
                    attempt += 1;
                    if !err.is_retryable() || attempt > self.max_retries {
                        return Err(err);
                    }
                    let base = self.retry_base_delay_ms * (1u64 << (attempt - 1).min(4));
                    let jitter = rng.random_range(0..=base / 2);
                    warn!(
                        target = "sync.feed",
                        attempt,
                        delay_ms = base + jitter,
                        error = %err,
                        "retrying page fetch"
                    );
                    sleep(Duration::from_millis(base + jitter)).await;
                }
            }
        }
    }

    async fn try_fetch(&self, url: &str) -> Result<FeedPage, SyncError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| SyncError::transient("feed", err.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::auth("feed", format!("HTTP {status}")));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SyncError::rate_limited("feed", format!("HTTP {status}")));
        }
        if status.is_server_error() {
            return Err(SyncError::transient("feed", format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(SyncError::internal("feed", format!("HTTP {status}")));
        }
        // A body that does not decode will not decode on a retry either.
        response
            .json::<FeedPage>()
            .await
            .map_err(|err| SyncError::malformed("feed", format!("invalid page body: {err}")))
    }

    /// Resolve the first change id of a date via the `/change_id` endpoint.
    pub async fn fetch_change_id(&self, url: &str) -> Result<i64, SyncError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| SyncError::transient("feed", err.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::auth("feed", format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(SyncError::transient("feed", format!("HTTP {status}")));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| SyncError::malformed("feed", err.to_string()))?;
        body.get("change_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| SyncError::internal("feed", "change_id missing from response"))
    }

    /// Walk the full offer listing until the API signals the end, the page
    /// cap is hit, or flakiness produces too many empty pages in a row. A
    /// failed page stops this source's pagination but keeps what was already
    /// collected.
    pub async fn collect_snapshot(
        &self,
        adapter: &dyn SourceAdapter,
        max_pages: u32,
    ) -> Result<Snapshot, SyncError> {
        let mut snapshot = Snapshot::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut page = 1u32;
        let mut empty_pages = 0u32;

        while page <= max_pages {
            let feed = match self.fetch_feed_page(&adapter.offers_url(page)).await {
                Ok(feed) => feed,
                Err(err) if err.kind() == SyncErrorKind::Auth => return Err(err),
                Err(err) => {
                    warn!(
                        target = "sync.feed",
                        source = %adapter.source(),
                        page,
                        error = %err,
                        "stopping pagination after failed page"
                    );
                    snapshot.page_errors += 1;
                    break;
                }
            };
            snapshot.pages_fetched += 1;

            if feed.result.is_empty() {
                empty_pages += 1;
                if empty_pages >= self.empty_page_limit {
                    debug!(
                        target = "sync.feed",
                        source = %adapter.source(),
                        page,
                        "empty page limit reached"
                    );
                    snapshot.exhausted = true;
                    break;
                }
            } else {
                empty_pages = 0;
            }

            absorb_page(&mut snapshot, &mut seen, feed.result);

            match feed.meta.next_page {
                Some(next) if next > page => page = next,
                _ => {
                    snapshot.exhausted = true;
                    break;
                }
            }
            sleep(self.page_delay).await;
        }

        Ok(snapshot)
    }

    /// Walk the "changes since X" feed. Stops on `next_change_id == null`,
    /// a non-advancing cursor, an empty page, or the iteration cap.
    pub async fn collect_changes(
        &self,
        adapter: &dyn SourceAdapter,
        start_change_id: i64,
        max_iterations: u32,
    ) -> Result<ChangeBatch, SyncError> {
        let mut batch = ChangeBatch {
            last_change_id: start_change_id,
            ..ChangeBatch::default()
        };
        let mut cursor = start_change_id;

        for _ in 0..max_iterations {
            let Some(url) = adapter.changes_url(cursor) else {
                return Err(SyncError::invalid_input(
                    "feed",
                    "source has no change feed",
                ));
            };
            let feed = match self.fetch_feed_page(&url).await {
                Ok(feed) => feed,
                Err(err) if err.kind() == SyncErrorKind::Auth => return Err(err),
                Err(err) => {
                    warn!(
                        target = "sync.feed",
                        source = %adapter.source(),
                        change_id = cursor,
                        error = %err,
                        "stopping change feed after failed page"
                    );
                    batch.page_errors += 1;
                    break;
                }
            };
            batch.pages_fetched += 1;
            let empty = feed.result.is_empty();
            batch.changes.extend(feed.result);

            match feed.meta.next_change_id {
                Some(next) if next > cursor => {
                    cursor = next;
                    batch.last_change_id = next;
                }
                _ => break,
            }
            if empty {
                break;
            }
            sleep(self.page_delay).await;
        }

        Ok(batch)
    }
}

/// The provider's own listing identifier, wherever it happens to live on
/// this dialect (`data.inner_id` on most, envelope-level on some).
pub fn offer_identity(envelope: &OfferEnvelope) -> Option<String> {
    envelope
        .data
        .get("inner_id")
        .and_then(value_to_string)
        .or_else(|| value_to_string(&envelope.inner_id))
}

fn absorb_page(
    snapshot: &mut Snapshot,
    seen: &mut HashSet<String>,
    envelopes: Vec<OfferEnvelope>,
) {
    for envelope in envelopes {
        snapshot.processed += 1;
        match offer_identity(&envelope) {
            Some(id) => {
                if seen.insert(id) {
                    snapshot.offers.push(envelope);
                } else {
                    snapshot.duplicates += 1;
                }
            }
            None => snapshot.malformed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(inner_id: &str) -> OfferEnvelope {
        serde_json::from_value(json!({
            "id": 1,
            "inner_id": inner_id,
            "change_type": "added",
            "data": { "inner_id": inner_id, "mark": "Kia" },
        }))
        .unwrap()
    }

    #[test]
    fn page_deserializes_with_null_next_page() {
        let page: FeedPage = serde_json::from_value(json!({
            "result": [
                { "id": 9, "inner_id": 123, "change_type": "added", "data": {} }
            ],
            "meta": { "next_page": null }
        }))
        .unwrap();
        assert_eq!(page.result.len(), 1);
        assert_eq!(page.meta.next_page, None);
        assert_eq!(page.result[0].change_type, ChangeType::Added);
    }

    #[test]
    fn change_type_accepts_updated_alias_and_unknowns() {
        let page: FeedPage = serde_json::from_value(json!({
            "result": [
                { "change_type": "updated", "data": {} },
                { "change_type": "price_adjusted", "data": {} },
            ],
            "meta": {}
        }))
        .unwrap();
        assert_eq!(page.result[0].change_type, ChangeType::Changed);
        assert_eq!(page.result[1].change_type, ChangeType::Unknown);
    }

    #[test]
    fn identity_prefers_data_inner_id() {
        let env: OfferEnvelope = serde_json::from_value(json!({
            "inner_id": "outer",
            "data": { "inner_id": 42 },
        }))
        .unwrap();
        assert_eq!(offer_identity(&env), Some("42".to_string()));

        let env: OfferEnvelope = serde_json::from_value(json!({
            "inner_id": "outer",
            "data": {},
        }))
        .unwrap();
        assert_eq!(offer_identity(&env), Some("outer".to_string()));
    }

    #[test]
    fn duplicate_ids_across_pages_are_kept_once() {
        let mut snapshot = Snapshot::default();
        let mut seen = HashSet::new();
        absorb_page(
            &mut snapshot,
            &mut seen,
            vec![envelope("a"), envelope("b"), envelope("a")],
        );
        absorb_page(&mut snapshot, &mut seen, vec![envelope("b"), envelope("c")]);
        assert_eq!(snapshot.processed, 5);
        assert_eq!(snapshot.duplicates, 2);
        assert_eq!(snapshot.offers.len(), 3);
    }

    #[test]
    fn record_without_identity_counts_as_malformed() {
        let mut snapshot = Snapshot::default();
        let mut seen = HashSet::new();
        let env: OfferEnvelope =
            serde_json::from_value(json!({ "change_type": "added", "data": {} })).unwrap();
        absorb_page(&mut snapshot, &mut seen, vec![env]);
        assert_eq!(snapshot.malformed, 1);
        assert!(snapshot.offers.is_empty());
    }
}
