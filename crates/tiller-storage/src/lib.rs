//! Collaborator interfaces and storage infrastructure for Tiller:
//! the booking store, notification and operator-alert contracts,
//! in-memory doubles for tests, an HTTP (REST table) store client
//! with bounded retry, a raw-payload archive, and per-code locks.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tiller_core::{Booking, NotificationState, Status};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tiller_adapters::{DateRange, PollError, PollSource, PolledPage};
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tiller-storage";

/// Well-known field keys in the storage collaborator's schema. The
/// schema itself belongs to the collaborator; this subsystem only
/// reads and writes these names.
pub mod fields {
    pub const BOOKING_CODE: &str = "Booking Code";
    pub const STATUS: &str = "Status";
    pub const CUSTOMER_NAME: &str = "Customer Name";
    pub const EMAIL: &str = "Email";
    pub const PHONE: &str = "Phone";
    pub const TOTAL_AMOUNT: &str = "Total Amount";
    pub const BOOKING_DATE: &str = "Booking Date";
    pub const START_TIME: &str = "Start Time";
    pub const FINISH_TIME: &str = "Finish Time";
    pub const CREATED: &str = "Created";
    pub const ITEM: &str = "Item";
    pub const ADD_ONS: &str = "Add-ons";
    pub const ONBOARDING_STAFF: &str = "Onboarding Staff";
    pub const DELOADING_STAFF: &str = "Deloading Staff";
    pub const NOTIFICATION_STATE: &str = "Notification State";
}

/// Opaque key-value field map as the storage collaborator sees it.
pub type FieldMap = BTreeMap<String, JsonValue>;

/// One persisted copy of a booking. A logical booking (one code) may
/// have 0, 1 or more rows at any time; converging them is the
/// reconciliation engine's job, not the store's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub fields: FieldMap,
}

impl StoredRow {
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(JsonValue::as_str)
    }

    pub fn code(&self) -> Option<&str> {
        self.str_field(fields::BOOKING_CODE)
    }

    pub fn status(&self) -> Option<Status> {
        self.str_field(fields::STATUS).map(Status::new)
    }

    pub fn total_amount(&self) -> Option<f64> {
        self.fields.get(fields::TOTAL_AMOUNT).and_then(JsonValue::as_f64)
    }

    pub fn add_ons_display(&self) -> &str {
        self.str_field(fields::ADD_ONS).unwrap_or_default()
    }

    pub fn notification_state(&self) -> NotificationState {
        match self.str_field(fields::NOTIFICATION_STATE) {
            Some("sent") => NotificationState::Sent,
            _ => NotificationState::Unsent,
        }
    }
}

/// Encodes a booking into the collaborator's field map.
///
/// Only fields the booking actually carries are emitted; absent
/// fields stay absent rather than clearing stored values. Staff
/// assignments are deliberately excluded: they are sticky fields
/// owned by the scheduling subsystem.
pub fn booking_to_fields(booking: &Booking) -> FieldMap {
    let mut map = FieldMap::new();
    map.insert(fields::BOOKING_CODE.into(), booking.code.clone().into());
    map.insert(fields::STATUS.into(), booking.status.as_str().into());
    if let Some(name) = &booking.customer.name {
        map.insert(fields::CUSTOMER_NAME.into(), name.clone().into());
    }
    if let Some(email) = &booking.customer.email {
        map.insert(fields::EMAIL.into(), email.clone().into());
    }
    if let Some(phone) = &booking.customer.phone {
        map.insert(fields::PHONE.into(), phone.clone().into());
    }
    if let Some(total) = booking.total_amount {
        map.insert(fields::TOTAL_AMOUNT.into(), total.into());
    }
    if let Some(date) = booking.schedule.booking_date {
        map.insert(fields::BOOKING_DATE.into(), date.to_string().into());
    }
    if let Some(start) = booking.schedule.start_time {
        map.insert(fields::START_TIME.into(), start.format("%H:%M").to_string().into());
    }
    if let Some(finish) = booking.schedule.finish_time {
        map.insert(fields::FINISH_TIME.into(), finish.format("%H:%M").to_string().into());
    }
    if let Some(created) = booking.schedule.created_at {
        map.insert(fields::CREATED.into(), created.to_rfc3339().into());
    }
    if let Some(item) = &booking.primary_item {
        map.insert(fields::ITEM.into(), item.clone().into());
    }
    if !booking.add_ons.is_empty() {
        map.insert(
            fields::ADD_ONS.into(),
            tiller_core::format_add_ons(&booking.add_ons).into(),
        );
    }
    map
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row {0} not found")]
    NotFound(String),
    #[error("store request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected store response shape: {0}")]
    Response(String),
}

/// Storage collaborator contract: an opaque row table keyed by its
/// own row ids, with at-least-one well-known code field.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn find_by_code(&self, code: &str) -> Result<Vec<StoredRow>, StoreError>;
    /// Rows created within the lookback window, for gap detection.
    async fn find_created_since(&self, since: DateTime<Utc>) -> Result<Vec<StoredRow>, StoreError>;
    async fn create(&self, fields: FieldMap) -> Result<String, StoreError>;
    async fn update(&self, row_id: &str, fields: FieldMap) -> Result<(), StoreError>;
    async fn delete(&self, row_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
#[error("notification send failed: {0}")]
pub struct NotifyError(pub String);

/// Notification collaborator: delivery mechanics are its concern,
/// whether/what to send is ours.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, message: &str) -> Result<(), NotifyError>;
}

/// Operator-alert collaborator, used by the sync scheduler's gap
/// report.
#[async_trait]
pub trait OperatorAlerts: Send + Sync {
    async fn alert(&self, message: &str);
}

/// In-memory booking store for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryBookingStore {
    rows: Mutex<Vec<StoredRow>>,
    next_id: Mutex<u64>,
}

impl MemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a row verbatim, bypassing id assignment. Test helper for
    /// duplicate-row and tie-break scenarios.
    pub async fn seed(&self, row: StoredRow) {
        self.rows.lock().await.push(row);
    }

    pub async fn all_rows(&self) -> Vec<StoredRow> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl BookingStore for MemoryBookingStore {
    async fn find_by_code(&self, code: &str) -> Result<Vec<StoredRow>, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|row| row.code() == Some(code))
            .cloned()
            .collect())
    }

    async fn find_created_since(&self, since: DateTime<Utc>) -> Result<Vec<StoredRow>, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|row| row.created_at >= since)
            .cloned()
            .collect())
    }

    async fn create(&self, fields: FieldMap) -> Result<String, StoreError> {
        let mut next_id = self.next_id.lock().await;
        *next_id += 1;
        let id = format!("row-{next_id}");
        self.rows.lock().await.push(StoredRow {
            id: id.clone(),
            created_at: Utc::now(),
            fields,
        });
        Ok(id)
    }

    async fn update(&self, row_id: &str, updates: FieldMap) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|row| row.id == row_id)
            .ok_or_else(|| StoreError::NotFound(row_id.to_string()))?;
        for (key, value) in updates {
            row.fields.insert(key, value);
        }
        Ok(())
    }

    async fn delete(&self, row_id: &str) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|row| row.id != row_id);
        if rows.len() == before {
            return Err(StoreError::NotFound(row_id.to_string()));
        }
        Ok(())
    }
}

/// Records sends instead of delivering them; can be flipped into a
/// failing mode for send-failure tests.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(String, String)>>,
    fail_next: Mutex<bool>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next_send(&self) {
        *self.fail_next.lock().await = true;
    }

    pub async fn sent_messages(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, recipient: &str, message: &str) -> Result<(), NotifyError> {
        let mut fail = self.fail_next.lock().await;
        if *fail {
            *fail = false;
            return Err(NotifyError("provider rejected message".to_string()));
        }
        self.sent
            .lock()
            .await
            .push((recipient.to_string(), message.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAlerts {
    messages: Mutex<Vec<String>>,
}

impl MemoryAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn raised(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl OperatorAlerts for MemoryAlerts {
    async fn alert(&self, message: &str) {
        self.messages.lock().await.push(message.to_string());
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
pub struct HttpStoreConfig {
    pub base_url: String,
    pub table: String,
    pub api_token: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// REST table client for the real storage collaborator. Every call
/// has a timeout and a bounded retry budget; exhausting retries
/// surfaces as a `StoreError` for the single unit of work, never a
/// panic.
#[derive(Debug)]
pub struct HttpBookingStore {
    client: reqwest::Client,
    base_url: String,
    table: String,
    backoff: BackoffPolicy,
}

impl HttpBookingStore {
    pub fn new(config: HttpStoreConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", config.api_token);
        headers.insert(
            reqwest::header::AUTHORIZATION,
            auth.parse().context("building authorization header")?,
        );
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("building store http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            table: config.table,
            backoff: config.backoff,
        })
    }

    fn table_url(&self) -> String {
        format!("{}/{}", self.base_url, self.table)
    }

    fn row_url(&self, row_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.table, row_id)
    }

    async fn send_with_retry(
        &self,
        method: Method,
        url: &str,
        query: Option<&[(&str, String)]>,
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, StoreError> {
        debug!(%method, url, "store request");
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.request(method.clone(), url);
            if let Some(query) = query {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        if status == StatusCode::NO_CONTENT {
                            return Ok(JsonValue::Null);
                        }
                        return Ok(resp.json::<JsonValue>().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    if status == StatusCode::NOT_FOUND {
                        return Err(StoreError::NotFound(final_url));
                    }
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }

        Err(StoreError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }

    fn rows_from_list(value: &JsonValue) -> Result<Vec<StoredRow>, StoreError> {
        let records = value
            .get("records")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| StoreError::Response("missing records array".to_string()))?;
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            rows.push(Self::row_from_record(record)?);
        }
        Ok(rows)
    }

    fn row_from_record(record: &JsonValue) -> Result<StoredRow, StoreError> {
        let id = record
            .get("id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| StoreError::Response("record without id".to_string()))?
            .to_string();
        let created_at = record
            .get("createdTime")
            .and_then(JsonValue::as_str)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| StoreError::Response(format!("record {id} without createdTime")))?;
        let fields = record
            .get("fields")
            .and_then(JsonValue::as_object)
            .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(StoredRow {
            id,
            created_at,
            fields,
        })
    }
}

#[async_trait]
impl BookingStore for HttpBookingStore {
    async fn find_by_code(&self, code: &str) -> Result<Vec<StoredRow>, StoreError> {
        let formula = format!("{{{}}} = '{}'", fields::BOOKING_CODE, code.replace('\'', ""));
        let value = self
            .send_with_retry(
                Method::GET,
                &self.table_url(),
                Some(&[("filterByFormula", formula)]),
                None,
            )
            .await?;
        Self::rows_from_list(&value)
    }

    async fn find_created_since(&self, since: DateTime<Utc>) -> Result<Vec<StoredRow>, StoreError> {
        let formula = format!("IS_AFTER(CREATED_TIME(), '{}')", since.to_rfc3339());
        let value = self
            .send_with_retry(
                Method::GET,
                &self.table_url(),
                Some(&[("filterByFormula", formula)]),
                None,
            )
            .await?;
        Self::rows_from_list(&value)
    }

    async fn create(&self, fields: FieldMap) -> Result<String, StoreError> {
        let body = serde_json::json!({ "fields": fields });
        let value = self
            .send_with_retry(Method::POST, &self.table_url(), None, Some(&body))
            .await?;
        value
            .get("id")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| StoreError::Response("create response without id".to_string()))
    }

    async fn update(&self, row_id: &str, fields: FieldMap) -> Result<(), StoreError> {
        let body = serde_json::json!({ "fields": fields });
        self.send_with_retry(Method::PATCH, &self.row_url(row_id), None, Some(&body))
            .await?;
        Ok(())
    }

    async fn delete(&self, row_id: &str) -> Result<(), StoreError> {
        self.send_with_retry(Method::DELETE, &self.row_url(row_id), None, None)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpPollConfig {
    pub base_url: String,
    pub api_token: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// Poll client for the external booking engine's list API. Pages are
/// `{"records": [...], "next_cursor": "..."}`; the records themselves
/// stay raw JSON because normalization is the adapter layer's job.
#[derive(Debug)]
pub struct HttpPollSource {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl HttpPollSource {
    pub fn new(config: HttpPollConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", config.api_token);
        headers.insert(
            reqwest::header::AUTHORIZATION,
            auth.parse().context("building authorization header")?,
        );
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("building poll http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    fn page_from_response(value: &JsonValue) -> Result<PolledPage, PollError> {
        let records = value
            .get("records")
            .and_then(JsonValue::as_array)
            .cloned()
            .ok_or_else(|| PollError::Message("poll response missing records array".to_string()))?;
        let next_cursor = value
            .get("next_cursor")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string);
        Ok(PolledPage {
            records,
            next_cursor,
        })
    }
}

#[async_trait]
impl PollSource for HttpPollSource {
    async fn fetch_page(
        &self,
        range: DateRange,
        cursor: Option<&str>,
    ) -> Result<PolledPage, PollError> {
        let url = format!("{}/bookings", self.base_url);
        let mut query = vec![
            ("from", range.start.to_rfc3339()),
            ("to", range.end.to_rfc3339()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        debug!(url, ?cursor, "poll request");

        let mut last_error: Option<String> = None;
        for attempt in 0..=self.backoff.max_retries {
            let result = self.client.get(&url).query(&query).send().await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let value = resp
                            .json::<JsonValue>()
                            .await
                            .map_err(|err| PollError::Message(err.to_string()))?;
                        return Self::page_from_response(&value);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_error = Some(format!("poll http status {status}"));
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(PollError::Message(format!(
                        "poll http status {status} for {url}"
                    )));
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_error = Some(err.to_string());
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(PollError::Message(err.to_string()));
                }
            }
        }
        Err(PollError::Message(
            last_error.unwrap_or_else(|| "poll retries exhausted".to_string()),
        ))
    }
}

/// Notifier for deployments without a messaging provider: every
/// would-be send lands in the log instead.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, message: &str) -> Result<(), NotifyError> {
        info!(recipient, message, "customer notification (log only)");
        Ok(())
    }
}

/// Operator alerts routed to the log.
#[derive(Debug, Default)]
pub struct LogAlerts;

#[async_trait]
impl OperatorAlerts for LogAlerts {
    async fn alert(&self, message: &str) {
        tracing::warn!(message, "operator alert");
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub duplicate: bool,
}

/// Immutable archive of raw inbound payloads, hash-addressed so
/// duplicate webhook deliveries land on the same path and can be
/// detected for free. Writes go through a temp file and an atomic
/// rename.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn payload_relative_path(
        received_at: DateTime<Utc>,
        source: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = received_at.format("%Y%m%d").to_string();
        PathBuf::from(stamp)
            .join(source)
            .join(format!("{content_hash}.json"))
    }

    pub async fn store_bytes(
        &self,
        received_at: DateTime<Utc>,
        source: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::payload_relative_path(received_at, source, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                duplicate: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("archive path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                duplicate: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedPayload {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    duplicate: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

/// Per-booking-code mutual exclusion. Two concurrent deliveries for
/// the same code serialize their read-modify-write; distinct codes
/// proceed independently.
#[derive(Debug, Default)]
pub struct CodeLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, code: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            // A strong count of 1 means no guard is outstanding: only
            // the map holds the Arc. Evicting those keeps the map
            // bounded by concurrent acquisitions, not by every code
            // ever seen.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(code.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tiller_core::AddOnItem;

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
    fn booking_fields_round_trip_the_well_known_keys() {
        let mut booking = Booking::new("B100", Status::new("PAID"));
        booking.customer.name = Some("Ada".to_string());
        booking.total_amount = Some(250.0);
        booking.add_ons = vec![AddOnItem::new("Kayak", 2, 12.5)];

        let map = booking_to_fields(&booking);
        assert_eq!(map[fields::BOOKING_CODE], "B100");
        assert_eq!(map[fields::STATUS], "PAID");
        assert_eq!(map[fields::ADD_ONS], "2 x Kayak - $12.50");
        // Absent fields stay absent; sticky staff fields never appear.
        assert!(!map.contains_key(fields::EMAIL));
        assert!(!map.contains_key(fields::ONBOARDING_STAFF));
        assert!(!map.contains_key(fields::DELOADING_STAFF));
    }

    #[tokio::test]
    async fn memory_store_crud_and_code_lookup() {
        let store = MemoryBookingStore::new();
        let mut map = FieldMap::new();
        map.insert(fields::BOOKING_CODE.into(), "X1".into());
        map.insert(fields::STATUS.into(), "PEND".into());
        let id = store.create(map.clone()).await.unwrap();

        let rows = store.find_by_code("X1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status(), Some(Status::new("PEND")));

        let mut update = FieldMap::new();
        update.insert(fields::STATUS.into(), "PAID".into());
        store.update(&id, update).await.unwrap();
        let rows = store.find_by_code("X1").await.unwrap();
        assert_eq!(rows[0].status(), Some(Status::new("PAID")));

        store.delete(&id).await.unwrap();
        assert!(store.find_by_code("X1").await.unwrap().is_empty());
        assert!(matches!(
            store.delete(&id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn archive_deduplicates_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let archive = PayloadArchive::new(dir.path());
        let received_at = DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_bytes(received_at, "booking-engine", br#"{"code":"X1"}"#)
            .await
            .expect("first store");
        let second = archive
            .store_bytes(received_at, "booking-engine", br#"{"code":"X1"}"#)
            .await
            .expect("second store");

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn code_locks_serialize_per_code() {
        let locks = Arc::new(CodeLocks::new());
        let in_section = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let in_section = Arc::clone(&in_section);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("X1").await;
                let inside = in_section.fetch_add(1, Ordering::SeqCst);
                assert_eq!(inside, 0, "two tasks inside the same code section");
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Different codes do not contend: both guards held at once.
        let a = locks.acquire("A1").await;
        let b = locks.acquire("B1").await;
        drop((a, b));
    }

    #[tokio::test]
    async fn code_locks_drop_released_codes() {
        let locks = CodeLocks::new();

        for n in 0..50 {
            let guard = locks.acquire(&format!("H{n}")).await;
            drop(guard);
        }

        // Only the held lock survives the sweep; the 50 released
        // codes are gone.
        let held = locks.acquire("LIVE").await;
        let tracked = locks.locks.lock().await.len();
        assert_eq!(tracked, 1);
        drop(held);
    }

    #[test]
    fn list_response_parsing_rejects_malformed_records() {
        let value = serde_json::json!({
            "records": [
                {"id": "rec1", "createdTime": "2026-03-01T09:00:00Z", "fields": {"Status": "PAID"}},
            ]
        });
        let rows = HttpBookingStore::rows_from_list(&value).unwrap();
        assert_eq!(rows[0].id, "rec1");
        assert_eq!(rows[0].status(), Some(Status::new("PAID")));

        let missing_id = serde_json::json!({"records": [{"createdTime": "2026-03-01T09:00:00Z"}]});
        assert!(matches!(
            HttpBookingStore::rows_from_list(&missing_id),
            Err(StoreError::Response(_))
        ));
    }

    #[test]
    fn poll_page_parsing_carries_the_cursor() {
        let value = serde_json::json!({
            "records": [{"booking_id": "X1"}],
            "next_cursor": "p2"
        });
        let page = HttpPollSource::page_from_response(&value).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("p2"));

        let last = serde_json::json!({"records": []});
        let page = HttpPollSource::page_from_response(&last).unwrap();
        assert!(page.next_cursor.is_none());

        let malformed = serde_json::json!({"items": []});
        assert!(matches!(
            HttpPollSource::page_from_response(&malformed),
            Err(PollError::Message(_))
        ));
    }
}
