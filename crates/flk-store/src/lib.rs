//! Document store collaborator interface + HTTP fetch utilities for FLK.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use flk_core::PlatformName;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::info_span;

pub const CRATE_NAME: &str = "flk-store";

/// Hard ceiling on operations per atomic batch, matching the collaborating
/// store's per-batch limit. Exceeding it is an error, never a truncation.
pub const MAX_BATCH_OPS: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: JsonValue,
    pub version: u64,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.data.clone()).map_err(StoreError::Serialization)
    }
}

pub fn encode_entity<T: Serialize>(entity: &T) -> Result<JsonValue, StoreError> {
    serde_json::to_value(entity).map_err(StoreError::Serialization)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, JsonValue),
    In(String, Vec<JsonValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

/// Equality/"in"-list filtered query with optional ordering and cursor
/// pagination. The cursor is the id of the last document from the previous
/// page.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, OrderDirection)>,
    pub limit: Option<usize>,
    pub start_after: Option<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter_eq(mut self, field: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(JsonValue::Null);
        self.filters.push(Filter::Eq(field.into(), value));
        self
    }

    pub fn filter_in(mut self, field: impl Into<String>, values: Vec<JsonValue>) -> Self {
        self.filters.push(Filter::In(field.into(), values));
        self
    }

    pub fn order_by_asc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some((field.into(), OrderDirection::Ascending));
        self
    }

    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some((field.into(), OrderDirection::Descending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: impl Into<String>) -> Self {
        self.start_after = Some(cursor.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or replace the document wholesale.
    Set {
        collection: String,
        id: String,
        data: JsonValue,
    },
    /// Merge top-level fields into an existing document. When
    /// `expect_version` is set, the write fails with `Contention` unless the
    /// stored version still matches.
    Update {
        collection: String,
        id: String,
        fields: JsonValue,
        expect_version: Option<u64>,
    },
    Delete {
        collection: String,
        id: String,
    },
}

/// An atomic multi-document write: all operations apply, or none do.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ops(ops: Vec<WriteOp>) -> Self {
        Self { ops }
    }

    pub fn set(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        data: JsonValue,
    ) -> &mut Self {
        self.ops.push(WriteOp::Set {
            collection: collection.into(),
            id: id.into(),
            data,
        });
        self
    }

    pub fn update(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        fields: JsonValue,
    ) -> &mut Self {
        self.ops.push(WriteOp::Update {
            collection: collection.into(),
            id: id.into(),
            fields,
            expect_version: None,
        });
        self
    }

    pub fn update_if_version(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        fields: JsonValue,
        expect_version: u64,
    ) -> &mut Self {
        self.ops.push(WriteOp::Update {
            collection: collection.into(),
            id: id.into(),
            fields,
            expect_version: Some(expect_version),
        });
        self
    }

    pub fn delete(&mut self, collection: impl Into<String>, id: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            collection: collection.into(),
            id: id.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },
    #[error("write contention on {collection}/{id}")]
    Contention { collection: String, id: String },
    #[error("batch of {0} ops exceeds the {MAX_BATCH_OPS}-op ceiling")]
    BatchTooLarge(usize),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::Contention { .. })
    }
}

/// The single shared mutable resource: named collections of documents with
/// get-by-id, filtered queries, and atomic batched writes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    async fn query(&self, collection: &str, query: Query) -> Result<Vec<Document>, StoreError>;

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(collection, id).await? {
        Some(doc) => Ok(Some(doc.decode()?)),
        None => Ok(None),
    }
}

pub async fn query_typed<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    query: Query,
) -> Result<Vec<T>, StoreError> {
    let docs = store.query(collection, query).await?;
    docs.iter().map(|doc| doc.decode()).collect()
}

#[derive(Debug, Clone)]
struct VersionedDoc {
    data: JsonValue,
    version: u64,
}

/// In-memory `DocumentStore`. Commit validates every operation (ceiling,
/// version preconditions, update targets) before applying any of them, so a
/// failed batch leaves the store untouched.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, VersionedDoc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Field lookup with dotted-path descent, so filters and ordering can address
/// nested fields like `platform.name`.
fn lookup_field<'a>(data: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = data;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn doc_matches(data: &JsonValue, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| match filter {
        Filter::Eq(field, expected) => lookup_field(data, field) == Some(expected),
        Filter::In(field, values) => lookup_field(data, field)
            .map(|v| values.contains(v))
            .unwrap_or(false),
    })
}

fn order_rank(value: Option<&JsonValue>) -> (u8, String, f64) {
    match value {
        None | Some(JsonValue::Null) => (0, String::new(), 0.0),
        Some(JsonValue::Bool(b)) => (1, String::new(), *b as u8 as f64),
        Some(JsonValue::Number(n)) => (2, String::new(), n.as_f64().unwrap_or(0.0)),
        Some(JsonValue::String(s)) => (3, s.clone(), 0.0),
        Some(other) => (4, other.to_string(), 0.0),
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).and_then(|docs| {
            docs.get(id).map(|doc| Document {
                id: id.to_string(),
                data: doc.data.clone(),
                version: doc.version,
            })
        }))
    }

    async fn query(&self, collection: &str, query: Query) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.read().await;
        let mut matched: Vec<Document> = collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, doc)| doc_matches(&doc.data, &query.filters))
                    .map(|(id, doc)| Document {
                        id: id.clone(),
                        data: doc.data.clone(),
                        version: doc.version,
                    })
                    .collect()
            })
            .unwrap_or_default();

        if let Some((field, direction)) = &query.order_by {
            matched.sort_by(|a, b| {
                let ra = order_rank(lookup_field(&a.data, field));
                let rb = order_rank(lookup_field(&b.data, field));
                let ordering = ra
                    .0
                    .cmp(&rb.0)
                    .then_with(|| ra.1.cmp(&rb.1))
                    .then_with(|| ra.2.partial_cmp(&rb.2).unwrap_or(std::cmp::Ordering::Equal))
                    .then_with(|| a.id.cmp(&b.id));
                match direction {
                    OrderDirection::Ascending => ordering,
                    OrderDirection::Descending => ordering.reverse(),
                }
            });
        }

        if let Some(cursor) = &query.start_after {
            if let Some(pos) = matched.iter().position(|doc| &doc.id == cursor) {
                matched.drain(..=pos);
            }
        }

        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }

        Ok(matched)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.len() > MAX_BATCH_OPS {
            return Err(StoreError::BatchTooLarge(batch.len()));
        }

        let mut collections = self.collections.write().await;

        // Validate before touching anything so a rejected batch is a no-op.
        for op in batch.ops() {
            if let WriteOp::Update {
                collection,
                id,
                expect_version,
                ..
            } = op
            {
                let existing = collections.get(collection).and_then(|docs| docs.get(id));
                let Some(existing) = existing else {
                    return Err(StoreError::NotFound {
                        collection: collection.clone(),
                        id: id.clone(),
                    });
                };
                if let Some(expected) = expect_version {
                    if existing.version != *expected {
                        return Err(StoreError::Contention {
                            collection: collection.clone(),
                            id: id.clone(),
                        });
                    }
                }
            }
        }

        for op in batch.ops() {
            match op {
                WriteOp::Set {
                    collection,
                    id,
                    data,
                } => {
                    let docs = collections.entry(collection.clone()).or_default();
                    let version = docs.get(id).map(|d| d.version + 1).unwrap_or(1);
                    docs.insert(
                        id.clone(),
                        VersionedDoc {
                            data: data.clone(),
                            version,
                        },
                    );
                }
                WriteOp::Update {
                    collection,
                    id,
                    fields,
                    ..
                } => {
                    let docs = collections.entry(collection.clone()).or_default();
                    if let Some(doc) = docs.get_mut(id) {
                        if let (Some(target), Some(source)) =
                            (doc.data.as_object_mut(), fields.as_object())
                        {
                            for (key, value) in source {
                                target.insert(key.clone(), value.clone());
                            }
                        }
                        doc.version += 1;
                    }
                }
                WriteOp::Delete { collection, id } => {
                    if let Some(docs) = collections.get_mut(collection) {
                        docs.remove(id);
                    }
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_platform_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_platform_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Outbound JSON fetcher for external platform APIs. Rate limits (429) and
/// transient transport failures retry with exponential backoff; a global and
/// a per-platform semaphore bound in-flight requests.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_platform_limit: usize,
    per_platform: Mutex<HashMap<PlatformName, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    InvalidJson {
        url: String,
        source: serde_json::Error,
    },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_platform_limit: config.per_platform_concurrency.max(1),
            per_platform: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_platform_semaphore(&self, platform: PlatformName) -> Arc<Semaphore> {
        let mut map = self.per_platform.lock().await;
        map.entry(platform)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_platform_limit)))
            .clone()
    }

    pub async fn fetch_json(
        &self,
        platform: PlatformName,
        url: &str,
    ) -> Result<JsonValue, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_platform = self.per_platform_semaphore(platform).await;
        let _platform = per_platform.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("platform_fetch", platform = platform.as_str(), url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return serde_json::from_slice(&body).map_err(|source| {
                            FetchError::InvalidJson {
                                url: final_url,
                                source,
                            }
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_round_trips_with_versions() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.set("leagues", "a", json!({"name": "Dynasty", "season": 2024}));
        store.commit(batch).await.unwrap();

        let doc = store.get("leagues", "a").await.unwrap().unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.data["name"], "Dynasty");

        let mut batch = WriteBatch::new();
        batch.update("leagues", "a", json!({"season": 2025}));
        store.commit(batch).await.unwrap();

        let doc = store.get("leagues", "a").await.unwrap().unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.data["season"], 2025);
        assert_eq!(doc.data["name"], "Dynasty");
    }

    #[tokio::test]
    async fn version_precondition_failure_rejects_whole_batch() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.set("teams", "t1", json!({"wins": 1}));
        store.commit(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.set("teams", "t2", json!({"wins": 0}));
        batch.update_if_version("teams", "t1", json!({"wins": 2}), 99);
        let err = store.commit(batch).await.unwrap_err();
        assert!(err.is_contention());

        // The set in the same batch must not have applied.
        assert!(store.get("teams", "t2").await.unwrap().is_none());
        let t1 = store.get("teams", "t1").await.unwrap().unwrap();
        assert_eq!(t1.data["wins"], 1);
    }

    #[tokio::test]
    async fn update_of_missing_document_is_not_found() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.update("teams", "ghost", json!({"wins": 3}));
        let err = store.commit(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn query_filters_orders_and_paginates_by_cursor() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        for (id, season) in [("a", 2023), ("b", 2024), ("c", 2024), ("d", 2024)] {
            batch.set("leagues", id, json!({"season": season, "platform": "sleeper"}));
        }
        store.commit(batch).await.unwrap();

        let page = store
            .query(
                "leagues",
                Query::new()
                    .filter_eq("season", 2024)
                    .order_by_asc("season")
                    .limit(2),
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        let cursor = page.last().unwrap().id.clone();

        let rest = store
            .query(
                "leagues",
                Query::new()
                    .filter_eq("season", 2024)
                    .order_by_asc("season")
                    .start_after(cursor)
                    .limit(10),
            )
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "d");
    }

    #[tokio::test]
    async fn nested_field_paths_filter_documents() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.set(
            "leagues",
            "a",
            json!({"platform": {"name": "sleeper", "platform_id": "1"}}),
        );
        batch.set(
            "leagues",
            "b",
            json!({"platform": {"name": "fleaflicker", "platform_id": "2"}}),
        );
        store.commit(batch).await.unwrap();

        let found = store
            .query("leagues", Query::new().filter_eq("platform.name", "sleeper"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        for i in 0..(MAX_BATCH_OPS + 1) {
            batch.set("teams", format!("t{i}"), json!({"i": i}));
        }
        let err = store.commit(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::BatchTooLarge(_)));
        assert!(store.get("teams", "t0").await.unwrap().is_none());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limit_status_is_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
