//! Booking reconciliation and synchronization: converges the 0..n
//! storage rows that exist per booking code into one canonical row,
//! decides whether transitions warrant a customer notification, and
//! periodically sweeps the external booking engine for records that
//! event delivery missed.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tiller_adapters::{
    detect_shape, fetch_all_pages, normalize, DateRange, PayloadShape, PollError, PollSource,
};
use tiller_core::{
    format_add_ons, merge_add_ons, notification_for, parse_add_ons, Booking, CatalogRules,
    NotificationKind, NotificationState, Status,
};
use tiller_storage::{
    booking_to_fields, fields, BookingStore, CodeLocks, FieldMap, Notifier, OperatorAlerts,
    PayloadArchive, StoreError, StoredRow,
};
use tokio::sync::{Mutex, Semaphore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tiller-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_base_url: String,
    pub store_table: String,
    pub store_token: String,
    pub engine_base_url: Option<String>,
    pub engine_token: Option<String>,
    pub timezone: Tz,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub lookback_hours: i64,
    pub gap_parallelism: usize,
    pub alert_examples: usize,
    pub archive_dir: PathBuf,
    pub catalog_rules_path: PathBuf,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store_base_url: std::env::var("TILLER_STORE_URL")
                .unwrap_or_else(|_| "https://api.airtable.com/v0/appTILLER".to_string()),
            store_table: std::env::var("TILLER_STORE_TABLE")
                .unwrap_or_else(|_| "Bookings".to_string()),
            store_token: std::env::var("TILLER_STORE_TOKEN").unwrap_or_default(),
            engine_base_url: std::env::var("TILLER_ENGINE_URL").ok(),
            engine_token: std::env::var("TILLER_ENGINE_TOKEN").ok(),
            timezone: std::env::var("TILLER_TIMEZONE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(chrono_tz::Australia::Sydney),
            scheduler_enabled: std::env::var("TILLER_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("TILLER_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 */3 * * *".to_string()),
            lookback_hours: std::env::var("TILLER_LOOKBACK_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(72),
            gap_parallelism: std::env::var("TILLER_GAP_PARALLELISM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            alert_examples: std::env::var("TILLER_ALERT_EXAMPLES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            archive_dir: std::env::var("TILLER_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./payloads")),
            catalog_rules_path: std::env::var("TILLER_CATALOG_RULES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./catalog.yaml")),
            http_timeout_secs: std::env::var("TILLER_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// Loads catalog classification rules from a YAML file; a missing
/// file means the built-in defaults.
pub fn load_catalog_rules(path: &Path) -> anyhow::Result<CatalogRules> {
    if !path.exists() {
        return Ok(CatalogRules::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// The write-set for one booking code: at most one surviving row is
/// ever mutated, and all other rows are deleted only after it has
/// been updated.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub canonical_row_id: String,
    pub writes: FieldMap,
    pub deletions: Vec<String>,
    pub old_status: Option<Status>,
    pub new_status: Status,
}

/// Total order over candidate rows; the maximum is the canonical row.
///
/// A PAID row beats any non-PAID row. Among PAID rows the highest
/// amount wins, then the most recently created, then the row id (so
/// even pathological equal-amount equal-created duplicates resolve
/// deterministically, which idempotency requires). Among non-PAID
/// rows the highest status rank wins with the same tie-breaks.
fn cmp_candidates(a: &StoredRow, b: &StoredRow) -> Ordering {
    let status_a = a.status().unwrap_or_else(|| Status::new(""));
    let status_b = b.status().unwrap_or_else(|| Status::new(""));
    match (status_a.is_paid(), status_b.is_paid()) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (true, true) => {
            let amount_a = a.total_amount().unwrap_or(0.0);
            let amount_b = b.total_amount().unwrap_or(0.0);
            amount_a
                .partial_cmp(&amount_b)
                .unwrap_or(Ordering::Equal)
                .then(a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        }
        (false, false) => status_a
            .rank()
            .cmp(&status_b.rank())
            .then(a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id)),
    }
}

pub fn select_canonical(rows: &[StoredRow]) -> Option<&StoredRow> {
    rows.iter().max_by(|a, b| cmp_candidates(a, b))
}

/// Plans the reconciliation of one booking code.
///
/// With an incoming booking, its fields overwrite the canonical
/// row's except the sticky staff assignments (never touched here)
/// and the add-ons (merged, not replaced). Only fields whose value
/// actually changes enter the write-set, so replanning an already
/// converged state yields an empty one. Duplicate rows are marked
/// for deletion only once the booking resolves to PAID; before that
/// the outcome is still ambiguous and destructive action waits.
pub fn plan(rows: &[StoredRow], incoming: Option<&Booking>) -> Option<ReconcilePlan> {
    let canonical = select_canonical(rows)?;
    let old_status = canonical.status();

    let mut writes = FieldMap::new();
    let new_status = match incoming {
        Some(booking) => booking.status.clone(),
        None => old_status.clone().unwrap_or_else(|| Status::new("")),
    };

    if let Some(booking) = incoming {
        let mut desired = booking_to_fields(booking);
        let merged = merge_add_ons(&parse_add_ons(canonical.add_ons_display()), &booking.add_ons);
        if merged.is_empty() {
            desired.remove(fields::ADD_ONS);
        } else {
            desired.insert(fields::ADD_ONS.into(), format_add_ons(&merged).into());
        }
        if old_status.as_ref() != Some(&new_status) {
            // A real status change re-arms the notification machine.
            desired.insert(fields::NOTIFICATION_STATE.into(), "unsent".into());
        }
        for (key, value) in desired {
            if canonical.fields.get(&key) != Some(&value) {
                writes.insert(key, value);
            }
        }
    }

    let mut deletions: Vec<String> = if new_status.is_paid() {
        rows.iter()
            .filter(|row| row.id != canonical.id)
            .map(|row| row.id.clone())
            .collect()
    } else {
        Vec::new()
    };
    deletions.sort();

    Some(ReconcilePlan {
        canonical_row_id: canonical.id.clone(),
        writes,
        deletions,
        old_status,
        new_status,
    })
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub code: String,
    pub canonical_row_id: String,
    pub created: bool,
    pub updated_fields: usize,
    pub deleted_rows: usize,
    pub old_status: Option<Status>,
    pub new_status: Status,
    pub notification_state: NotificationState,
    pub recipient: Option<String>,
}

/// Applies reconciliation plans against the store, serialized per
/// booking code. Ordering is update-then-delete: a failed update
/// aborts before any deletion, so a partial failure can never leave
/// zero rows for a code.
pub struct Reconciler {
    store: Arc<dyn BookingStore>,
    locks: CodeLocks,
}

impl Reconciler {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self {
            store,
            locks: CodeLocks::new(),
        }
    }

    pub async fn apply(&self, incoming: &Booking) -> Result<ReconcileOutcome, StoreError> {
        let _guard = self.locks.acquire(&incoming.code).await;
        let rows = self.store.find_by_code(&incoming.code).await?;

        let Some(plan) = plan(&rows, Some(incoming)) else {
            // First sighting of this code.
            let row_id = self.store.create(booking_to_fields(incoming)).await?;
            info!(code = %incoming.code, status = %incoming.status, row_id, "created booking row");
            return Ok(ReconcileOutcome {
                code: incoming.code.clone(),
                canonical_row_id: row_id,
                created: true,
                updated_fields: 0,
                deleted_rows: 0,
                old_status: None,
                new_status: incoming.status.clone(),
                notification_state: NotificationState::Unsent,
                recipient: incoming.customer.phone.clone(),
            });
        };

        let canonical = rows
            .iter()
            .find(|row| row.id == plan.canonical_row_id)
            .expect("plan references a candidate row");
        let status_changed = plan.old_status.as_ref() != Some(&plan.new_status);
        let notification_state = if status_changed {
            NotificationState::Unsent
        } else {
            canonical.notification_state()
        };
        let recipient = incoming
            .customer
            .phone
            .clone()
            .or_else(|| canonical.str_field(fields::PHONE).map(ToString::to_string));

        let updated_fields = plan.writes.len();
        if !plan.writes.is_empty() {
            self.store
                .update(&plan.canonical_row_id, plan.writes.clone())
                .await?;
        }

        let deleted_rows = self.delete_rows(&incoming.code, &plan.deletions).await;

        Ok(ReconcileOutcome {
            code: incoming.code.clone(),
            canonical_row_id: plan.canonical_row_id,
            created: false,
            updated_fields,
            deleted_rows,
            old_status: plan.old_status,
            new_status: plan.new_status,
            notification_state,
            recipient,
        })
    }

    /// Converges an already-stored code with no new incoming data:
    /// a no-op unless PAID duplicate rows are waiting for cleanup.
    pub async fn converge(&self, code: &str) -> Result<usize, StoreError> {
        let _guard = self.locks.acquire(code).await;
        let rows = self.store.find_by_code(code).await?;
        let Some(plan) = plan(&rows, None) else {
            return Ok(0);
        };
        Ok(self.delete_rows(code, &plan.deletions).await)
    }

    async fn delete_rows(&self, code: &str, row_ids: &[String]) -> usize {
        let mut deleted = 0;
        for row_id in row_ids {
            match self.store.delete(row_id).await {
                Ok(()) => deleted += 1,
                // Per-unit failure; the next run retries the cleanup.
                Err(err) => warn!(code, row_id, %err, "failed to delete duplicate row"),
            }
        }
        deleted
    }
}

fn render_notification(kind: NotificationKind, code: &str) -> String {
    match kind {
        NotificationKind::Cancellation => {
            format!("Your booking {code} has been cancelled. Reply if this is unexpected.")
        }
        NotificationKind::PaymentConfirmed => {
            format!("Payment received - your booking {code} is confirmed. See you at the marina!")
        }
        NotificationKind::PartialPayment => {
            format!("We received your deposit for booking {code}. The balance is due on the day.")
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum IngestOutcome {
    /// Unrecoverable garbage was archived and skipped; redelivery
    /// cannot succeed so the sender gets a success acknowledgment.
    Skipped { reason: String },
    Processed {
        code: String,
        created: bool,
        updated_fields: usize,
        deleted_rows: usize,
        old_status: Option<String>,
        new_status: String,
        notified: bool,
    },
}

/// One parameterized ingest pipeline for every inbound event path:
/// archive the raw payload, normalize it, reconcile, then decide on
/// a customer notification.
pub struct WebhookPipeline {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn BookingStore>,
    notifier: Arc<dyn Notifier>,
    archive: Option<PayloadArchive>,
    rules: CatalogRules,
    timezone: Tz,
}

impl WebhookPipeline {
    pub fn new(
        store: Arc<dyn BookingStore>,
        notifier: Arc<dyn Notifier>,
        archive: Option<PayloadArchive>,
        rules: CatalogRules,
        timezone: Tz,
    ) -> Self {
        Self {
            reconciler: Arc::new(Reconciler::new(Arc::clone(&store))),
            store,
            notifier,
            archive,
            rules,
            timezone,
        }
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::clone(&self.reconciler)
    }

    /// Ingests one raw inbound payload. A `StoreError` is the only
    /// error surfaced: it means a transient collaborator failure and
    /// the sender should redeliver.
    pub async fn ingest(
        &self,
        source: &str,
        body: &[u8],
        shape: Option<PayloadShape>,
    ) -> Result<IngestOutcome, StoreError> {
        if let Some(archive) = &self.archive {
            if let Err(err) = archive.store_bytes(Utc::now(), source, body).await {
                warn!(source, %err, "failed to archive raw payload");
            }
        }

        let raw: serde_json::Value = match serde_json::from_slice(body) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(source, %err, "unparseable inbound payload");
                return Ok(IngestOutcome::Skipped {
                    reason: "payload is not valid JSON".to_string(),
                });
            }
        };
        let shape = shape.unwrap_or_else(|| detect_shape(&raw));
        let booking = match normalize(&raw, shape, &self.rules, self.timezone) {
            Ok(booking) => booking,
            Err(err) => {
                warn!(source, %err, ?shape, "skipping unnormalizable payload");
                return Ok(IngestOutcome::Skipped {
                    reason: err.to_string(),
                });
            }
        };

        let outcome = self.reconciler.apply(&booking).await?;
        let notified = self.maybe_notify(&outcome).await;

        Ok(IngestOutcome::Processed {
            code: outcome.code,
            created: outcome.created,
            updated_fields: outcome.updated_fields,
            deleted_rows: outcome.deleted_rows,
            old_status: outcome.old_status.map(|s| s.as_str().to_string()),
            new_status: outcome.new_status.as_str().to_string(),
            notified,
        })
    }

    async fn maybe_notify(&self, outcome: &ReconcileOutcome) -> bool {
        // First sighting has no transition to judge.
        let Some(old_status) = &outcome.old_status else {
            return false;
        };
        let Some(kind) = notification_for(old_status, &outcome.new_status) else {
            return false;
        };
        if outcome.notification_state == NotificationState::Sent {
            return false;
        }
        let Some(recipient) = &outcome.recipient else {
            warn!(code = %outcome.code, "significant transition but no customer phone on record");
            return false;
        };

        let message = render_notification(kind, &outcome.code);
        match self.notifier.send(recipient, &message).await {
            Ok(()) => {
                let mut update = FieldMap::new();
                update.insert(fields::NOTIFICATION_STATE.into(), "sent".into());
                if let Err(err) = self.store.update(&outcome.canonical_row_id, update).await {
                    warn!(code = %outcome.code, %err, "failed to record notification state");
                }
                info!(code = %outcome.code, ?kind, "customer notification sent");
                true
            }
            // A stale notification is worse than a missed one: log,
            // do not retry.
            Err(err) => {
                warn!(code = %outcome.code, %err, "notification send failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GapOutcome {
    pub code: String,
    pub status: String,
    pub created: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub external_records: usize,
    pub local_records: usize,
    pub gaps: Vec<GapOutcome>,
    pub duplicates_cleaned: usize,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a reconciliation run is already in flight")]
    AlreadyRunning,
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Periodic safety net over event delivery: fetches both sources of
/// truth in bulk, creates bookings the local store is missing, and
/// raises one operator alert per run when gaps exist.
pub struct SyncScheduler {
    engine: Arc<dyn PollSource>,
    store: Arc<dyn BookingStore>,
    alerts: Arc<dyn OperatorAlerts>,
    reconciler: Arc<Reconciler>,
    rules: CatalogRules,
    timezone: Tz,
    lookback: Duration,
    gap_parallelism: usize,
    alert_examples: usize,
    running: Mutex<()>,
    last_run: Mutex<Option<SyncReport>>,
}

impl SyncScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<dyn PollSource>,
        store: Arc<dyn BookingStore>,
        alerts: Arc<dyn OperatorAlerts>,
        reconciler: Arc<Reconciler>,
        rules: CatalogRules,
        timezone: Tz,
        lookback: Duration,
        gap_parallelism: usize,
        alert_examples: usize,
    ) -> Self {
        Self {
            engine,
            store,
            alerts,
            reconciler,
            rules,
            timezone,
            lookback,
            gap_parallelism: gap_parallelism.max(1),
            alert_examples: alert_examples.max(1),
            running: Mutex::new(()),
            last_run: Mutex::new(None),
        }
    }

    /// Last completed run, if any. Deliberately in-memory only: the
    /// state resets to "never run" on restart and the next scheduled
    /// run self-heals.
    pub async fn last_report(&self) -> Option<SyncReport> {
        self.last_run.lock().await.clone()
    }

    pub async fn run_once(&self) -> Result<SyncReport, SyncError> {
        // A run in flight means skip, not queue: the next run covers
        // the same lookback window anyway.
        let _running = self
            .running
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, lookback_hours = self.lookback.num_hours(), "reconciliation run started");

        let range = DateRange {
            start: started_at - self.lookback,
            end: started_at,
        };
        let raw_records = fetch_all_pages(self.engine.as_ref(), range).await?;
        let local_rows = self.store.find_created_since(range.start).await?;
        let local_codes: HashSet<String> = local_rows
            .iter()
            .filter_map(StoredRow::code)
            .map(ToString::to_string)
            .collect();

        let mut external = Vec::new();
        for raw in &raw_records {
            match normalize(raw, PayloadShape::PolledRecord, &self.rules, self.timezone) {
                Ok(booking) => external.push(booking),
                Err(err) => warn!(%err, "skipping unnormalizable polled record"),
            }
        }
        let external_records = external.len();

        // A gap is an external booking with money attached that the
        // local store has never seen. Unpaid externals are left for
        // normal event delivery.
        let gap_bookings: Vec<Booking> = external
            .into_iter()
            .filter(|b| matches!(b.status.as_str(), Status::PAID | Status::PARTIAL))
            .filter(|b| !local_codes.contains(&b.code))
            .collect();

        let mut gaps = self.fill_gaps(gap_bookings).await;
        gaps.sort_by(|a, b| a.code.cmp(&b.code));

        let duplicates_cleaned = self.clean_local_duplicates(&local_rows).await;

        if !gaps.is_empty() {
            self.alerts.alert(&gap_alert_message(&gaps, self.alert_examples)).await;
        }

        let report = SyncReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            external_records,
            local_records: local_rows.len(),
            gaps,
            duplicates_cleaned,
        };
        info!(
            external = report.external_records,
            local = report.local_records,
            gaps = report.gaps.len(),
            duplicates_cleaned,
            "reconciliation run finished"
        );
        *self.last_run.lock().await = Some(report.clone());
        Ok(report)
    }

    async fn fill_gaps(&self, gap_bookings: Vec<Booking>) -> Vec<GapOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.gap_parallelism));
        let mut handles = Vec::with_capacity(gap_bookings.len());
        for booking in gap_bookings {
            let semaphore = Arc::clone(&semaphore);
            let reconciler = Arc::clone(&self.reconciler);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                let code = booking.code.clone();
                let status = booking.status.as_str().to_string();
                match reconciler.apply(&booking).await {
                    Ok(outcome) => GapOutcome {
                        code,
                        status,
                        created: outcome.created,
                        error: None,
                    },
                    // One failed create must not abort the batch.
                    Err(err) => GapOutcome {
                        code,
                        status,
                        created: false,
                        error: Some(err.to_string()),
                    },
                }
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => warn!(%err, "gap-fill task panicked"),
            }
        }
        outcomes
    }

    async fn clean_local_duplicates(&self, local_rows: &[StoredRow]) -> usize {
        let mut seen = HashSet::new();
        let mut duplicated = Vec::new();
        for row in local_rows {
            if let Some(code) = row.code() {
                if !seen.insert(code.to_string()) {
                    duplicated.push(code.to_string());
                }
            }
        }
        duplicated.sort();
        duplicated.dedup();

        let mut cleaned = 0;
        for code in duplicated {
            match self.reconciler.converge(&code).await {
                Ok(deleted) => cleaned += deleted,
                Err(err) => warn!(code, %err, "duplicate cleanup failed"),
            }
        }
        cleaned
    }
}

fn gap_alert_message(gaps: &[GapOutcome], max_examples: usize) -> String {
    let failed = gaps.iter().filter(|g| g.error.is_some()).count();
    let examples = gaps
        .iter()
        .take(max_examples)
        .map(|g| g.code.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let mut message = format!(
        "reconciliation found {} paid booking(s) missing from the local store (e.g. {examples})",
        gaps.len()
    );
    if failed > 0 {
        message.push_str(&format!("; {failed} auto-create(s) failed"));
    }
    message
}

/// Wires the scheduler onto its cron cadence. A tick that lands
/// while a run is in flight is skipped.
pub async fn build_cron_scheduler(
    scheduler: Arc<SyncScheduler>,
    cron: &str,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating job scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let scheduler = Arc::clone(&scheduler);
        Box::pin(async move {
            match scheduler.run_once().await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    gaps = report.gaps.len(),
                    "scheduled reconciliation run finished"
                ),
                Err(SyncError::AlreadyRunning) => {
                    warn!("skipping scheduled run; previous run still in flight");
                }
                Err(err) => warn!(%err, "scheduled reconciliation run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
