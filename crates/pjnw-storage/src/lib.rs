//! Document store seam (in-memory + Firestore REST) and the WebDriver HTTP client for pjn-watch.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, RequestBuilder};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "pjnw-storage";

/// Hard cap on write operations in a single commit.
pub const MAX_BATCH_OPS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Timestamp(DateTime<Utc>),
    String(String),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

/// Fields to write on a merge-set.
///
/// `fields` always overwrite the stored values. `defaults` are written only when the stored
/// document does not already carry that field, so operator-edited values survive re-scrapes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePayload {
    pub fields: Fields,
    pub defaults: Fields,
}

impl MergePayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> &mut Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn default_if_absent(&mut self, name: &str, value: impl Into<FieldValue>) -> &mut Self {
        if !self.fields.contains_key(name) {
            self.defaults.insert(name.to_string(), value.into());
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeSet {
    pub collection: String,
    pub document_id: String,
    pub payload: MergePayload,
}

/// Queue of merge-set operations committed together.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<MergeSet>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge_set(
        &mut self,
        collection: &str,
        document_id: &str,
        payload: MergePayload,
    ) -> Result<(), StoreError> {
        if self.ops.len() >= MAX_BATCH_OPS {
            return Err(StoreError::BatchFull {
                limit: MAX_BATCH_OPS,
            });
        }
        validate_document_id(document_id)?;
        self.ops.push(MergeSet {
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            payload,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[MergeSet] {
        &self.ops
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDocument {
    pub id: String,
    pub fields: Fields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    pub writes: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch already holds {limit} operations")]
    BatchFull { limit: usize },
    #[error("invalid document id {0:?}")]
    InvalidDocumentId(String),
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("unexpected store response: {0}")]
    Protocol(String),
    #[error("commit rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn batch(&self) -> WriteBatch {
        WriteBatch::new()
    }

    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError>;

    /// Cheap reachability check run before a sync.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn list_documents(&self, collection: &str) -> Result<Vec<StoredDocument>, StoreError>;
}

/// Rejects ids the document store cannot address (Firestore naming rules).
pub fn validate_document_id(id: &str) -> Result<(), StoreError> {
    let reserved = id.len() >= 4 && id.starts_with("__") && id.ends_with("__");
    if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.len() > 1500 || reserved
    {
        return Err(StoreError::InvalidDocumentId(id.to_string()));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: BTreeMap<String, BTreeMap<String, Fields>>,
    commit_sizes: Vec<usize>,
    failing_commits: usize,
}

/// Process-local store with the same merge semantics as the Firestore backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document(&self, collection: &str, id: &str) -> Option<Fields> {
        let state = self.state.lock().await;
        state.collections.get(collection)?.get(id).cloned()
    }

    pub async fn document_count(&self, collection: &str) -> usize {
        let state = self.state.lock().await;
        state.collections.get(collection).map_or(0, BTreeMap::len)
    }

    /// Edits one field in place, the way an operator does from the UI.
    pub async fn set_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> bool {
        let mut state = self.state.lock().await;
        match state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
        {
            Some(doc) => {
                doc.insert(field.to_string(), value.into());
                true
            }
            None => false,
        }
    }

    /// Sizes of every successful commit, in order.
    pub async fn commit_sizes(&self) -> Vec<usize> {
        self.state.lock().await.commit_sizes.clone()
    }

    /// Makes the next `count` commits fail without applying anything.
    pub async fn fail_next_commits(&self, count: usize) {
        self.state.lock().await.failing_commits = count;
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(StoreError::Rejected("injected commit failure".to_string()));
        }
        if batch.len() > MAX_BATCH_OPS {
            return Err(StoreError::BatchFull {
                limit: MAX_BATCH_OPS,
            });
        }

        let writes = batch.len();
        for op in batch.ops {
            let doc = state
                .collections
                .entry(op.collection)
                .or_default()
                .entry(op.document_id)
                .or_default();
            for (name, value) in op.payload.fields {
                doc.insert(name, value);
            }
            for (name, value) in op.payload.defaults {
                doc.entry(name).or_insert(value);
            }
        }
        state.commit_sizes.push(writes);
        Ok(CommitReceipt { writes })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| StoredDocument {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub database: String,
    pub access_token: Option<String>,
    pub emulator_host: Option<String>,
    pub timeout: Duration,
}

impl FirestoreConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: "(default)".to_string(),
            access_token: None,
            emulator_host: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn base_url(&self) -> String {
        match &self.emulator_host {
            Some(host) => format!("http://{}/v1", host.trim_end_matches('/')),
            None => "https://firestore.googleapis.com/v1".to_string(),
        }
    }

    pub fn documents_root(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.project_id, self.database
        )
    }
}

/// Firestore REST v1 client.
///
/// Merge writes are expressed as `update` + `updateMask`; defaults are only added to the mask for
/// documents a preceding `batchGet` reported as missing.
#[derive(Debug)]
pub struct FirestoreStore {
    client: reqwest::Client,
    config: FirestoreConfig,
}

impl FirestoreStore {
    pub fn new(config: FirestoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building firestore http client")?;
        Ok(Self { client, config })
    }

    fn document_name(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}", self.config.documents_root(), collection, id)
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/{}{}",
            self.config.base_url(),
            self.config.documents_root(),
            suffix
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_json(&self, builder: RequestBuilder) -> Result<JsonValue, StoreError> {
        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }

    async fn existing_documents(&self, names: &[String]) -> Result<HashSet<String>, StoreError> {
        if names.is_empty() {
            return Ok(HashSet::new());
        }
        let body = json!({ "documents": names });
        let value = self
            .send_json(
                self.request(Method::POST, &self.url(":batchGet"))
                    .json(&body),
            )
            .await?;
        let entries = value
            .as_array()
            .ok_or_else(|| StoreError::Protocol("batchGet did not return an array".into()))?;
        Ok(entries
            .iter()
            .filter_map(|entry| entry.get("found")?.get("name")?.as_str())
            .map(ToString::to_string)
            .collect())
    }
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
        if batch.is_empty() {
            return Ok(CommitReceipt { writes: 0 });
        }
        if batch.len() > MAX_BATCH_OPS {
            return Err(StoreError::BatchFull {
                limit: MAX_BATCH_OPS,
            });
        }

        let span = info_span!("firestore_commit", ops = batch.len());
        async move {
            let names = batch
                .ops()
                .iter()
                .filter(|op| !op.payload.defaults.is_empty())
                .map(|op| self.document_name(&op.collection, &op.document_id))
                .collect::<Vec<_>>();
            let existing = self.existing_documents(&names).await?;
            debug!(checked = names.len(), existing = existing.len(), "resolved existing documents");

            let writes = batch
                .ops()
                .iter()
                .map(|op| {
                    let name = self.document_name(&op.collection, &op.document_id);
                    let include_defaults = !existing.contains(&name);
                    encode_merge_write(&name, &op.payload, include_defaults)
                })
                .collect::<Vec<_>>();
            let count = writes.len();

            self.send_json(
                self.request(Method::POST, &self.url(":commit"))
                    .json(&json!({ "writes": writes })),
            )
            .await?;
            Ok::<_, StoreError>(CommitReceipt { writes: count })
        }
        .instrument(span)
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.send_json(
            self.request(Method::POST, &self.url(":listCollectionIds"))
                .json(&json!({ "pageSize": 1 })),
        )
        .await?;
        Ok(())
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<StoredDocument>, StoreError> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut builder = self
                .request(Method::GET, &self.url(&format!("/{collection}")))
                .query(&[("pageSize", "300")]);
            if let Some(token) = &page_token {
                builder = builder.query(&[("pageToken", token.as_str())]);
            }
            let page = self.send_json(builder).await?;

            if let Some(docs) = page.get("documents").and_then(JsonValue::as_array) {
                for doc in docs {
                    out.push(decode_document(doc)?);
                }
            }
            page_token = page
                .get("nextPageToken")
                .and_then(JsonValue::as_str)
                .filter(|t| !t.is_empty())
                .map(ToString::to_string);
            if page_token.is_none() {
                break;
            }
        }
        Ok(out)
    }
}

pub fn encode_field_value(value: &FieldValue) -> JsonValue {
    match value {
        FieldValue::Null => json!({ "nullValue": null }),
        FieldValue::Bool(b) => json!({ "booleanValue": b }),
        FieldValue::String(s) => json!({ "stringValue": s }),
        FieldValue::Timestamp(ts) => {
            json!({ "timestampValue": ts.to_rfc3339_opts(SecondsFormat::Micros, true) })
        }
    }
}

pub fn decode_field_value(value: &JsonValue) -> FieldValue {
    if value.get("nullValue").is_some() {
        return FieldValue::Null;
    }
    if let Some(b) = value.get("booleanValue").and_then(JsonValue::as_bool) {
        return FieldValue::Bool(b);
    }
    if let Some(s) = value.get("stringValue").and_then(JsonValue::as_str) {
        return FieldValue::String(s.to_string());
    }
    if let Some(ts) = value.get("timestampValue").and_then(JsonValue::as_str) {
        return match DateTime::parse_from_rfc3339(ts) {
            Ok(parsed) => FieldValue::Timestamp(parsed.with_timezone(&Utc)),
            Err(_) => FieldValue::String(ts.to_string()),
        };
    }
    if let Some(i) = value.get("integerValue") {
        return FieldValue::String(i.as_str().map_or_else(|| i.to_string(), ToString::to_string));
    }
    FieldValue::String(value.to_string())
}

fn encode_merge_write(name: &str, payload: &MergePayload, include_defaults: bool) -> JsonValue {
    let mut fields = Map::new();
    let mut mask = Vec::new();
    for (key, value) in &payload.fields {
        fields.insert(key.clone(), encode_field_value(value));
        mask.push(key.clone());
    }
    if include_defaults {
        for (key, value) in &payload.defaults {
            if !fields.contains_key(key) {
                fields.insert(key.clone(), encode_field_value(value));
                mask.push(key.clone());
            }
        }
    }
    json!({
        "update": { "name": name, "fields": fields },
        "updateMask": { "fieldPaths": mask },
    })
}

fn decode_document(doc: &JsonValue) -> Result<StoredDocument, StoreError> {
    let name = doc
        .get("name")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| StoreError::Protocol("document without name".into()))?;
    let id = name.rsplit('/').next().unwrap_or(name).to_string();
    let fields = doc
        .get("fields")
        .and_then(JsonValue::as_object)
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), decode_field_value(v)))
                .collect::<Fields>()
        })
        .unwrap_or_default();
    Ok(StoredDocument { id, fields })
}

/// W3C key under which WebDriver returns element references.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub endpoint: String,
    pub browser_args: Vec<String>,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9515".to_string(),
            browser_args: [
                "--headless=new",
                "--disable-gpu",
                "--window-size=1920,1080",
                "--no-sandbox",
                "--disable-dev-shm-usage",
                "--disable-application-cache",
                "--log-level=3",
            ]
            .into_iter()
            .map(ToString::to_string)
            .collect(),
            request_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("timed out after {waited:?} waiting for `{selector}`")]
    Timeout { selector: String, waited: Duration },
    #[error("no element matches `{0}`")]
    NoSuchElement(String),
    #[error("webdriver request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webdriver error `{error}`: {message}")]
    Protocol { error: String, message: String },
}

/// One browser session driven over the W3C WebDriver HTTP protocol.
#[derive(Debug)]
pub struct WebDriverSession {
    client: reqwest::Client,
    session_url: String,
    poll_interval: Duration,
}

impl WebDriverSession {
    pub async fn start(config: &WebDriverConfig) -> Result<Self, DriverError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let endpoint = config.endpoint.trim_end_matches('/');
        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": config.browser_args,
                        "excludeSwitches": ["enable-logging"],
                    }
                }
            }
        });
        let resp = client
            .post(format!("{endpoint}/session"))
            .json(&body)
            .send()
            .await?;
        let value = unwrap_webdriver_value(resp.json().await?)?;
        let session_id = value
            .get("sessionId")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| DriverError::Protocol {
                error: "session not created".into(),
                message: "response carried no sessionId".into(),
            })?;
        Ok(Self {
            client,
            session_url: format!("{endpoint}/session/{session_id}"),
            poll_interval: config.poll_interval,
        })
    }

    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
    ) -> Result<JsonValue, DriverError> {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.session_url, path));
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let resp = builder.send().await?;
        unwrap_webdriver_value(resp.json().await?)
    }

    pub async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    pub async fn find_element(&self, css: &str) -> Result<Option<String>, DriverError> {
        let body = json!({ "using": "css selector", "value": css });
        match self.command(Method::POST, "/element", Some(body)).await {
            Ok(value) => Ok(value
                .get(ELEMENT_KEY)
                .and_then(JsonValue::as_str)
                .map(ToString::to_string)),
            Err(DriverError::Protocol { error, .. }) if error == "no such element" => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn wait_for_element(&self, css: &str, timeout: Duration) -> Result<String, DriverError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(element) = self.find_element(css).await? {
                return Ok(element);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::Timeout {
                    selector: css.to_string(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn require_element(&self, css: &str) -> Result<String, DriverError> {
        self.find_element(css)
            .await?
            .ok_or_else(|| DriverError::NoSuchElement(css.to_string()))
    }

    pub async fn send_keys(&self, css: &str, text: &str) -> Result<(), DriverError> {
        let element = self.require_element(css).await?;
        self.command(
            Method::POST,
            &format!("/element/{element}/value"),
            Some(json!({ "text": text })),
        )
        .await?;
        Ok(())
    }

    pub async fn click(&self, css: &str) -> Result<(), DriverError> {
        let element = self.require_element(css).await?;
        self.command(Method::POST, &format!("/element/{element}/click"), Some(json!({})))
            .await?;
        Ok(())
    }

    pub async fn page_source(&self) -> Result<String, DriverError> {
        let value = self.command(Method::GET, "/source", None).await?;
        value
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| DriverError::Protocol {
                error: "invalid response".into(),
                message: "page source was not a string".into(),
            })
    }

    pub async fn refresh(&self) -> Result<(), DriverError> {
        self.command(Method::POST, "/refresh", Some(json!({}))).await?;
        Ok(())
    }

    pub async fn quit(&self) -> Result<(), DriverError> {
        self.command(Method::DELETE, "", None).await?;
        Ok(())
    }
}

/// Extracts `value` from a WebDriver response, turning error payloads into [`DriverError`].
pub fn unwrap_webdriver_value(mut body: JsonValue) -> Result<JsonValue, DriverError> {
    let value = body
        .get_mut("value")
        .map(JsonValue::take)
        .unwrap_or(JsonValue::Null);
    if let Some(error) = value.get("error").and_then(JsonValue::as_str) {
        return Err(DriverError::Protocol {
            error: error.to_string(),
            message: value
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    Ok(value)
}
