//! Sync pipeline: fan out portal sessions, sort, and upsert into the document store.

use std::cmp::Reverse;
use std::future::Future;
use std::pin::pin;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use futures::FutureExt;
use pjnw_core::{Identity, IdentityTable, Record};
use pjnw_portal::{
    DriverLauncher, PortalSession, SessionStatus, SessionTimings, WebDriverLauncher,
};
use pjnw_storage::{
    validate_document_id, DocumentStore, FieldValue, FirestoreConfig, FirestoreStore,
    MemoryStore, MergePayload, StoreError, WebDriverConfig, MAX_BATCH_OPS,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pjnw-sync";

/// Stored field names, shared with the operator UI.
pub mod fields {
    pub const SUBJECT: &str = "Perito";
    pub const KIND: &str = "Tipo";
    pub const CASE_REF: &str = "Causa";
    pub const TITLE: &str = "Nombre";
    pub const EVENT_DATE: &str = "Fecha";
    pub const LINK: &str = "Link";
    pub const SCRAPED_AT: &str = "ScrapedAt";
    pub const ACCEPTED: &str = "Aceptada";
    pub const FILED: &str = "EscritoPresentado";
    pub const SUMMARY: &str = "Resumen";
}

pub const DEFAULT_COLLECTION: &str = "novedades";
pub const DEFAULT_BATCH_LIMIT: usize = 499;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub identities: IdentityTable,
    pub webdriver_url: String,
    pub max_workers: usize,
    pub collection: String,
    pub firestore_project_id: Option<String>,
    pub firestore_access_token: Option<String>,
    pub firestore_emulator_host: Option<String>,
    pub sync_cron: Option<String>,
    pub interval_minutes: u64,
    pub web_port: u16,
    pub dry_run: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            identities: identities_from_lookup(&lookup),
            webdriver_url: non_empty("WEBDRIVER_URL")
                .unwrap_or_else(|| "http://localhost:9515".to_string()),
            max_workers: non_empty("PJN_MAX_WORKERS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(4),
            collection: non_empty("PJN_COLLECTION")
                .unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
            firestore_project_id: non_empty("FIRESTORE_PROJECT_ID"),
            firestore_access_token: non_empty("FIRESTORE_ACCESS_TOKEN"),
            firestore_emulator_host: non_empty("FIRESTORE_EMULATOR_HOST"),
            sync_cron: non_empty("PJN_SYNC_CRON"),
            interval_minutes: non_empty("PJN_INTERVAL_MINUTES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(15),
            web_port: non_empty("PJN_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
            dry_run: false,
        }
    }
}

/// Builds the identity table from `PJN_DNIS` (falling back to `DNIS`) plus `PASS_<dni>` and
/// `NAME_<dni>`. Entries missing either value are skipped.
pub fn identities_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> IdentityTable {
    let Some(dnis) = lookup("PJN_DNIS").or_else(|| lookup("DNIS")) else {
        warn!("PJN_DNIS is not set; no identities configured");
        return IdentityTable::new();
    };

    dnis.split(',')
        .map(str::trim)
        .filter(|dni| !dni.is_empty())
        .filter_map(|dni| {
            let secret = lookup(&format!("PASS_{dni}")).filter(|v| !v.is_empty());
            let name = lookup(&format!("NAME_{dni}")).filter(|v| !v.trim().is_empty());
            match (secret, name) {
                (Some(secret), Some(display_name)) => Some(Identity {
                    key: dni.to_string(),
                    secret,
                    display_name: display_name.trim().to_string(),
                }),
                _ => {
                    warn!(dni, "missing PASS_/NAME_ entry; skipping identity");
                    None
                }
            }
        })
        .collect()
}

/// How a single identity's session ended, as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutcomeKind {
    Finished(SessionStatus),
    Panicked,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub identity: String,
    pub subject: String,
    pub kind: OutcomeKind,
    pub summary: String,
    pub records: usize,
    pub skipped_rows: usize,
}

impl SessionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self.kind,
            OutcomeKind::Panicked
                | OutcomeKind::Finished(
                    SessionStatus::AuthenticationTimeout | SessionStatus::TransportFault
                )
        )
    }
}

#[derive(Debug, Default)]
pub struct OrchestratorRun {
    pub records: Vec<Record>,
    pub outcomes: Vec<SessionOutcome>,
}

/// Runs one portal session per identity on a bounded pool.
pub struct SessionOrchestrator {
    launcher: Arc<dyn DriverLauncher>,
    timings: SessionTimings,
    max_workers: usize,
}

impl SessionOrchestrator {
    pub fn new(launcher: Arc<dyn DriverLauncher>, max_workers: usize) -> Self {
        Self {
            launcher,
            timings: SessionTimings::default(),
            max_workers,
        }
    }

    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Reports are gathered in completion order. A panicking session is contained here and
    /// contributes no records.
    pub async fn run(&self, identities: &IdentityTable) -> OrchestratorRun {
        let mut run = OrchestratorRun::default();
        if identities.is_empty() {
            return run;
        }

        let workers = self.max_workers.clamp(1, identities.len());
        info!(identities = identities.len(), workers, "starting portal sessions");
        let permits = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();

        for identity in identities.iter().cloned() {
            let permits = permits.clone();
            let session = PortalSession::new(identity.clone(), self.launcher.clone(), self.timings);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let report = AssertUnwindSafe(session.run()).catch_unwind().await;
                (identity, report)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (identity, report) = match joined {
                Ok(done) => done,
                Err(err) => {
                    error!(error = %err, "portal session task failed to join");
                    continue;
                }
            };
            match report {
                Ok(report) => {
                    run.outcomes.push(SessionOutcome {
                        identity: identity.key.clone(),
                        subject: report.subject,
                        kind: OutcomeKind::Finished(report.status),
                        summary: report.summary,
                        records: report.records.len(),
                        skipped_rows: report.skipped_rows,
                    });
                    run.records.extend(report.records);
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(identity = %identity.key, panic = %message, "portal session panicked");
                    run.outcomes.push(SessionOutcome {
                        identity: identity.key.clone(),
                        subject: identity.display_name.clone(),
                        kind: OutcomeKind::Panicked,
                        summary: format!("scrape for {} panicked: {message}", identity.display_name),
                        records: 0,
                        skipped_rows: 0,
                    });
                }
            }
        }
        run
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Newest event date first; undated records go last. Stable for equal dates.
pub fn sort_records_by_date_desc(records: &mut [Record]) {
    records.sort_by_key(|r| (r.event_date.is_none(), Reverse(r.event_date)));
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("document key {key:?} is not a usable document id")]
    InvalidKey {
        key: String,
        #[source]
        source: StoreError,
    },
}

/// Merge payload for one record. Operator fields only go in as defaults.
pub fn record_payload(record: &Record) -> MergePayload {
    let event_date = record
        .event_date
        .map_or(FieldValue::Null, |d| FieldValue::Timestamp(d.and_time(NaiveTime::MIN).and_utc()));

    let mut payload = MergePayload::new();
    payload
        .set(fields::SUBJECT, record.subject.as_str())
        .set(fields::KIND, record.kind.as_str())
        .set(fields::CASE_REF, record.case_ref.as_str())
        .set(fields::TITLE, record.title.as_str())
        .set(fields::EVENT_DATE, event_date)
        .set(fields::LINK, record.link.clone().unwrap_or_default())
        .set(fields::SCRAPED_AT, record.scraped_at)
        .default_if_absent(fields::ACCEPTED, record.accepted)
        .default_if_absent(fields::FILED, record.filed)
        .default_if_absent(fields::SUMMARY, record.summary.as_str());
    payload
}

pub fn prepare_record(record: &Record) -> Result<(String, MergePayload), PayloadError> {
    let key = record.document_key().as_str().to_string();
    validate_document_id(&key).map_err(|source| PayloadError::InvalidKey {
        key: key.clone(),
        source,
    })?;
    Ok((key, record_payload(record)))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub prepared: usize,
    pub skipped: usize,
    pub batches_committed: usize,
    pub batches_failed: usize,
    pub documents_written: usize,
}

/// Commits records as merge-sets in batches of at most `batch_limit` operations.
pub struct UpsertBatcher {
    store: Arc<dyn DocumentStore>,
    collection: String,
    batch_limit: usize,
}

impl UpsertBatcher {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.clamp(1, MAX_BATCH_OPS);
        self
    }

    pub async fn upsert(&self, records: &[Record]) -> UpsertSummary {
        let mut summary = UpsertSummary::default();
        let mut batch = self.store.batch();

        for record in records {
            let (key, payload) = match prepare_record(record) {
                Ok(prepared) => prepared,
                Err(err) => {
                    summary.skipped += 1;
                    warn!(error = %err, subject = %record.subject, case_ref = %record.case_ref, "skipping record");
                    continue;
                }
            };
            if let Err(err) = batch.merge_set(&self.collection, &key, payload) {
                summary.skipped += 1;
                warn!(error = %err, key = %key, "could not queue record");
                continue;
            }
            summary.prepared += 1;

            if batch.len() >= self.batch_limit {
                let full = std::mem::replace(&mut batch, self.store.batch());
                self.commit(full, &mut summary).await;
            }
        }
        if !batch.is_empty() {
            self.commit(batch, &mut summary).await;
        }

        info!(
            collection = %self.collection,
            prepared = summary.prepared,
            skipped = summary.skipped,
            batches = summary.batches_committed,
            failed_batches = summary.batches_failed,
            "upsert finished"
        );
        summary
    }

    async fn commit(&self, batch: pjnw_storage::WriteBatch, summary: &mut UpsertSummary) {
        let ops = batch.len();
        match self.store.commit(batch).await {
            Ok(receipt) => {
                summary.batches_committed += 1;
                summary.documents_written += receipt.writes;
                info!(ops, "committed batch");
            }
            Err(err) => {
                summary.batches_failed += 1;
                error!(ops, error = %err, "batch commit failed; continuing with next batch");
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub identities: usize,
    pub sessions_failed: usize,
    pub records: usize,
    pub upsert: UpsertSummary,
    pub outcomes: Vec<SessionOutcome>,
}

impl SyncRunSummary {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn DocumentStore>,
    orchestrator: SessionOrchestrator,
    run_lock: Arc<Mutex<()>>,
}

/// Exclusive right to run the next pass; held for the whole pass.
pub struct RunClaim(OwnedMutexGuard<()>);

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn DocumentStore>,
        launcher: Arc<dyn DriverLauncher>,
    ) -> Self {
        let orchestrator = SessionOrchestrator::new(launcher, config.max_workers);
        Self {
            config,
            store,
            orchestrator,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Wires the Firestore store (or the in-memory one for dry runs) and a WebDriver launcher.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let store: Arc<dyn DocumentStore> = if config.dry_run {
            info!("dry run: writing to the in-memory store");
            Arc::new(MemoryStore::new())
        } else {
            let project_id = config
                .firestore_project_id
                .clone()
                .context("FIRESTORE_PROJECT_ID is not set (use --dry-run to skip persistence)")?;
            let mut firestore = FirestoreConfig::new(project_id);
            firestore.access_token = config.firestore_access_token.clone();
            firestore.emulator_host = config.firestore_emulator_host.clone();
            Arc::new(FirestoreStore::new(firestore).context("building firestore client")?)
        };
        let launcher = Arc::new(WebDriverLauncher::new(WebDriverConfig {
            endpoint: config.webdriver_url.clone(),
            ..Default::default()
        }));
        Ok(Self::new(config, store, launcher))
    }

    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.orchestrator = self.orchestrator.with_timings(timings);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Claims the pipeline without waiting; `None` while another pass holds it.
    pub fn try_claim(&self) -> Option<RunClaim> {
        self.run_lock.clone().try_lock_owned().ok().map(RunClaim)
    }

    /// Resolves once no pass is in flight.
    pub async fn wait_idle(&self) {
        drop(self.run_lock.lock().await);
    }

    /// One full scrape-and-upsert pass, queued behind any pass already running. Fails only when
    /// the store is unreachable.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let claim = RunClaim(self.run_lock.clone().lock_owned().await);
        self.run_claimed(claim).await
    }

    pub async fn run_claimed(&self, claim: RunClaim) -> Result<SyncRunSummary> {
        let _claim = claim;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id);

        async move {
            self.store
                .ping()
                .await
                .context("document store is unreachable")?;

            let identities = &self.config.identities;
            if identities.is_empty() {
                warn!("no identities configured; nothing to scrape");
            }
            let run = self.orchestrator.run(identities).await;
            let sessions_failed = run.outcomes.iter().filter(|o| o.is_failure()).count();

            let mut records = run.records;
            sort_records_by_date_desc(&mut records);
            let upsert = UpsertBatcher::new(self.store.clone(), self.config.collection.clone())
                .upsert(&records)
                .await;

            let summary = SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                identities: identities.len(),
                sessions_failed,
                records: records.len(),
                upsert,
                outcomes: run.outcomes,
            };
            info!(
                identities = summary.identities,
                sessions_failed,
                records = summary.records,
                written = summary.upsert.documents_written,
                elapsed_ms = summary.elapsed().num_milliseconds(),
                "sync run finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Once,
    Interval(Duration),
    /// Six-field cron expression (seconds first).
    Cron(String),
}

pub struct ScheduleRunner {
    pipeline: Arc<SyncPipeline>,
    schedule: Schedule,
}

impl ScheduleRunner {
    pub fn new(pipeline: Arc<SyncPipeline>, schedule: Schedule) -> Self {
        Self { pipeline, schedule }
    }

    /// Runs until the schedule completes or Ctrl-C is received.
    pub async fn run(&self) -> Result<()> {
        self.run_until(ctrl_c_signal()).await
    }

    /// A pass already under way is always finished before returning, so every session
    /// releases its driver.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut shutdown = pin!(shutdown);
        match &self.schedule {
            Schedule::Once => run_once_until(&self.pipeline, shutdown).await.map(|_| ()),
            Schedule::Interval(every) => {
                info!(every_secs = every.as_secs(), "running on a fixed interval");
                loop {
                    let (_, interrupted) =
                        finish_pass(run_logged(&self.pipeline), shutdown.as_mut()).await;
                    if interrupted {
                        return Ok(());
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(*every) => {}
                        _ = &mut shutdown => return Ok(()),
                    }
                }
            }
            Schedule::Cron(expr) => {
                let mut sched = JobScheduler::new().await.context("creating scheduler")?;
                let pipeline = self.pipeline.clone();
                let job = Job::new_async(expr.as_str(), move |_uuid, _l| {
                    let pipeline = pipeline.clone();
                    Box::pin(async move {
                        cron_tick(&pipeline).await;
                    })
                })
                .with_context(|| format!("creating scheduler job for cron {expr}"))?;
                sched.add(job).await.context("adding scheduler job")?;
                sched.start().await.context("starting scheduler")?;
                info!(cron = %expr, "scheduler started");

                shutdown.await;
                sched.shutdown().await.context("stopping scheduler")?;
                if self.pipeline.is_running() {
                    info!("waiting for the in-flight sync to finish");
                }
                self.pipeline.wait_idle().await;
                Ok(())
            }
        }
    }
}

/// Resolves on Ctrl-C. If the signal cannot be installed it never resolves.
pub async fn ctrl_c_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("interrupt received; shutting down");
}

/// Runs a single pass. An interrupt while it runs is honoured only after the pass completes.
pub async fn run_once_until(
    pipeline: &SyncPipeline,
    shutdown: impl Future<Output = ()>,
) -> Result<SyncRunSummary> {
    finish_pass(pipeline.run_once(), pin!(shutdown)).await.0
}

/// Drives `pass` to completion and reports whether `shutdown` fired meanwhile.
async fn finish_pass<T>(
    pass: impl Future<Output = T>,
    mut shutdown: impl Future<Output = ()> + Unpin,
) -> (T, bool) {
    let mut pass = pin!(pass);
    tokio::select! {
        out = &mut pass => return (out, false),
        _ = &mut shutdown => {}
    }
    info!("shutdown requested; letting in-flight sessions finish");
    (pass.await, true)
}

/// One cron firing. Skipped when a pass is still holding the pipeline.
async fn cron_tick(pipeline: &SyncPipeline) -> bool {
    let Some(claim) = pipeline.try_claim() else {
        warn!("previous sync still running; skipping this tick");
        return false;
    };
    log_run(pipeline.run_claimed(claim).await);
    true
}

/// Runs one pass; failures are logged and swallowed so the schedule keeps going.
async fn run_logged(pipeline: &SyncPipeline) {
    log_run(pipeline.run_once().await);
}

fn log_run(result: Result<SyncRunSummary>) {
    match result {
        Ok(summary) => info!(
            run_id = %summary.run_id,
            records = summary.records,
            "scheduled sync completed"
        ),
        Err(err) => error!(error = %format!("{err:#}"), "sync run failed; will retry on next tick"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use pjnw_core::RecordKind;
    use pjnw_portal::{AutomationDriver, USERNAME_SELECTOR};
    use pjnw_storage::{CommitReceipt, DriverError, StoredDocument, WriteBatch};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    fn record(subject: &str, case_ref: &str, day: Option<u32>) -> Record {
        Record::scraped(
            subject,
            RecordKind::Novedad,
            case_ref,
            format!("Autos {case_ref}"),
            day.and_then(|d| NaiveDate::from_ymd_opt(2024, 1, d)),
            Some("https://portalpjn.pjn.gov.ar/causa/1".to_string()),
            Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).single().unwrap(),
        )
    }

    fn many(n: usize) -> Vec<Record> {
        (0..n).map(|i| record("Perito A", &format!("CIV {i}/2024"), Some(5))).collect()
    }

    #[tokio::test]
    async fn upsert_commits_in_batches_of_499() {
        let store = Arc::new(MemoryStore::new());
        let summary = UpsertBatcher::new(store.clone(), DEFAULT_COLLECTION)
            .upsert(&many(1001))
            .await;
        assert_eq!(store.commit_sizes().await, vec![499, 499, 3]);
        assert_eq!(summary.prepared, 1001);
        assert_eq!(summary.batches_committed, 3);
        assert_eq!(summary.documents_written, 1001);
        assert_eq!(store.document_count(DEFAULT_COLLECTION).await, 1001);
    }

    #[tokio::test]
    async fn batch_limit_is_configurable_within_store_cap() {
        let store = Arc::new(MemoryStore::new());
        let summary = UpsertBatcher::new(store.clone(), DEFAULT_COLLECTION)
            .with_batch_limit(2)
            .upsert(&many(5))
            .await;
        assert_eq!(store.commit_sizes().await, vec![2, 2, 1]);
        assert_eq!(summary.batches_committed, 3);

        let store = Arc::new(MemoryStore::new());
        UpsertBatcher::new(store.clone(), DEFAULT_COLLECTION)
            .with_batch_limit(10_000)
            .upsert(&many(1001))
            .await;
        assert_eq!(store.commit_sizes().await, vec![500, 500, 1]);

        let store = Arc::new(MemoryStore::new());
        UpsertBatcher::new(store.clone(), DEFAULT_COLLECTION)
            .with_batch_limit(0)
            .upsert(&many(2))
            .await;
        assert_eq!(store.commit_sizes().await, vec![1, 1]);
    }

    #[tokio::test]
    async fn rescrape_is_idempotent_and_keeps_operator_edits() {
        let store = Arc::new(MemoryStore::new());
        let batcher = UpsertBatcher::new(store.clone(), DEFAULT_COLLECTION);
        let first = vec![record("Perito A", "CIV 1/2024", Some(5)), record("Perito A", "CIV 2/2024", None)];
        batcher.upsert(&first).await;

        let key = first[0].document_key().to_string();
        assert!(store.set_field(DEFAULT_COLLECTION, &key, fields::ACCEPTED, true).await);
        assert!(store.set_field(DEFAULT_COLLECTION, &key, fields::SUMMARY, "revisado").await);

        let mut again = first.clone();
        again[0].title = "Autos actualizados".to_string();
        batcher.upsert(&again).await;

        assert_eq!(store.document_count(DEFAULT_COLLECTION).await, 2);
        let doc = store.document(DEFAULT_COLLECTION, &key).await.unwrap();
        assert_eq!(doc[fields::ACCEPTED], FieldValue::Bool(true));
        assert_eq!(doc[fields::SUMMARY], FieldValue::String("revisado".into()));
        assert_eq!(doc[fields::FILED], FieldValue::Bool(false));
        assert_eq!(doc[fields::TITLE], FieldValue::String("Autos actualizados".into()));

        let undated = store
            .document(DEFAULT_COLLECTION, &first[1].document_key().to_string())
            .await
            .unwrap();
        assert_eq!(undated[fields::EVENT_DATE], FieldValue::Null);
    }

    #[tokio::test]
    async fn failed_commit_does_not_stop_later_batches() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_commits(1).await;
        let summary = UpsertBatcher::new(store.clone(), DEFAULT_COLLECTION)
            .upsert(&many(1001))
            .await;
        assert_eq!(summary.batches_failed, 1);
        assert_eq!(summary.batches_committed, 2);
        assert_eq!(store.commit_sizes().await, vec![499, 3]);
        assert_eq!(store.document_count(DEFAULT_COLLECTION).await, 502);
    }

    #[tokio::test]
    async fn records_with_unusable_keys_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let mut bad = record("Perito A", "CIV 9/2024", Some(5));
        bad.kind = RecordKind::Unknown("a/b".into());
        let summary = UpsertBatcher::new(store.clone(), DEFAULT_COLLECTION)
            .upsert(&[bad, record("Perito A", "CIV 10/2024", Some(5))])
            .await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.prepared, 1);
        assert_eq!(store.document_count(DEFAULT_COLLECTION).await, 1);
    }

    #[test]
    fn payload_carries_operator_fields_as_defaults_only() {
        let payload = record_payload(&record("Perito A", "CIV 1/2024", Some(5)));
        assert!(payload.defaults.contains_key(fields::ACCEPTED));
        assert!(!payload.fields.contains_key(fields::ACCEPTED));
        assert_eq!(
            payload.fields[fields::EVENT_DATE],
            FieldValue::Timestamp(Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).single().unwrap())
        );
        assert_eq!(payload.fields[fields::KIND], FieldValue::String("NOVEDAD".into()));
    }

    #[test]
    fn date_sort_is_descending_with_undated_last() {
        let mut records = vec![
            record("P", "a", None),
            record("P", "b", Some(3)),
            record("P", "c", Some(9)),
            record("P", "d", None),
            record("P", "e", Some(3)),
        ];
        sort_records_by_date_desc(&mut records);
        let order: Vec<_> = records.iter().map(|r| r.case_ref.as_str()).collect();
        assert_eq!(order, ["c", "b", "e", "a", "d"]);
    }

    #[test]
    fn identities_load_from_env_style_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PJN_DNIS", "111, 222,333,"),
            ("PASS_111", "s1"),
            ("NAME_111", "Perito Uno"),
            ("PASS_222", "s2"),
            ("NAME_333", "Sin Clave"),
        ]);
        let table = identities_from_lookup(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("111").unwrap().display_name, "Perito Uno");
    }

    #[test]
    fn config_defaults_apply() {
        let config = SyncConfig::from_lookup(|_| None);
        assert!(config.identities.is_empty());
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.collection, "novedades");
        assert_eq!(config.webdriver_url, "http://localhost:9515");
        assert_eq!(config.interval_minutes, 15);
        assert_eq!(config.web_port, 8000);
        assert!(config.sync_cron.is_none());
    }

    #[test]
    fn pipeline_without_project_needs_dry_run() {
        let config = SyncConfig::from_lookup(|_| None);
        assert!(SyncPipeline::from_config(config.clone()).is_err());
        assert!(SyncPipeline::from_config(SyncConfig { dry_run: true, ..config }).is_ok());
    }

    fn row(case_ref: &str, date: &str) -> String {
        format!(
            r#"<tr class="MuiBox-root"><td>d</td><td>-</td><td>{date}</td><td><p class="MuiTypography-root MuiTypography-body1 w-full css-11dlpbt">{case_ref}</p><p class="MuiTypography-root MuiTypography-body1 w-full italic css-4icvzy">Autos</p></td></tr>"#
        )
    }

    #[derive(Default)]
    struct Gauge {
        launched: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        released: AtomicUsize,
    }

    struct FakeDriver {
        markup: String,
        gauge: Arc<Gauge>,
        content_delay: Duration,
        barrier: Option<Arc<Barrier>>,
        user: std::sync::Mutex<String>,
    }

    #[async_trait]
    impl AutomationDriver for FakeDriver {
        async fn navigate(&self, _url: &str) -> Result<(), DriverError> {
            Ok(())
        }

        async fn wait_for_element(&self, selector: &str, _timeout: Duration) -> Result<(), DriverError> {
            if selector == USERNAME_SELECTOR {
                return Ok(());
            }
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            let slow = self.user.lock().unwrap().contains("slow");
            tokio::time::sleep(self.content_delay).await;
            if slow {
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
            Ok(())
        }

        async fn send_keys(&self, selector: &str, text: &str) -> Result<(), DriverError> {
            if selector == USERNAME_SELECTOR {
                if text == "boom" {
                    panic!("driver crashed for {text}");
                }
                *self.user.lock().unwrap() = text.to_string();
            }
            Ok(())
        }

        async fn click(&self, _selector: &str) -> Result<(), DriverError> {
            Ok(())
        }

        async fn current_markup(&self) -> Result<String, DriverError> {
            Ok(self.markup.clone())
        }

        async fn refresh(&self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn release(&self) -> Result<(), DriverError> {
            self.gauge.active.fetch_sub(1, Ordering::SeqCst);
            self.gauge.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeLauncher {
        markup: String,
        gauge: Arc<Gauge>,
        content_delay: Duration,
        barrier: Option<Arc<Barrier>>,
    }

    #[async_trait]
    impl DriverLauncher for FakeLauncher {
        async fn launch(&self) -> Result<Box<dyn AutomationDriver>, DriverError> {
            self.gauge.launched.fetch_add(1, Ordering::SeqCst);
            let now = self.gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.gauge.peak.fetch_max(now, Ordering::SeqCst);
            Ok(Box::new(FakeDriver {
                markup: self.markup.clone(),
                gauge: self.gauge.clone(),
                content_delay: self.content_delay,
                barrier: self.barrier.clone(),
                user: std::sync::Mutex::new(String::new()),
            }))
        }
    }

    fn fake_launcher(rows: &[String]) -> (Arc<FakeLauncher>, Arc<Gauge>) {
        launcher_with(rows, Duration::from_millis(25), None)
    }

    fn launcher_with(
        rows: &[String],
        content_delay: Duration,
        barrier: Option<Arc<Barrier>>,
    ) -> (Arc<FakeLauncher>, Arc<Gauge>) {
        let gauge = Arc::new(Gauge::default());
        let launcher = Arc::new(FakeLauncher {
            markup: format!("<table><tbody>{}</tbody></table>", rows.join("")),
            gauge: gauge.clone(),
            content_delay,
            barrier,
        });
        (launcher, gauge)
    }

    fn pipeline_for(
        keys: &[&str],
        store: Arc<dyn DocumentStore>,
        launcher: Arc<FakeLauncher>,
    ) -> Arc<SyncPipeline> {
        let config = SyncConfig {
            identities: identities(keys),
            ..SyncConfig::from_lookup(|_| None)
        };
        Arc::new(SyncPipeline::new(config, store, launcher).with_timings(instant()))
    }

    fn identities(keys: &[&str]) -> IdentityTable {
        keys.iter()
            .map(|key| Identity {
                key: key.to_string(),
                secret: "secret".into(),
                display_name: format!("Perito {key}"),
            })
            .collect()
    }

    fn instant() -> SessionTimings {
        SessionTimings {
            login_wait: Duration::ZERO,
            content_wait: Duration::ZERO,
            retry_delay: Duration::ZERO,
            max_attempts: 3,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn orchestrator_caps_concurrent_sessions() {
        let (launcher, gauge) = fake_launcher(&[row("CIV 1/2024", "05/01/2024")]);
        let orchestrator = SessionOrchestrator::new(launcher, 4).with_timings(instant());
        let run = orchestrator
            .run(&identities(&["1", "2", "3", "4", "5", "6"]))
            .await;
        assert_eq!(run.outcomes.len(), 6);
        assert_eq!(run.records.len(), 6);
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!(peak > 1 && peak <= 4, "peak concurrency was {peak}");
        assert_eq!(gauge.released.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn orchestrator_fills_every_worker_slot() {
        // Each content wait blocks until four sessions are inside it at once.
        let barrier = Arc::new(Barrier::new(4));
        let (launcher, gauge) = launcher_with(
            &[row("CIV 1/2024", "05/01/2024")],
            Duration::ZERO,
            Some(barrier),
        );
        let orchestrator = SessionOrchestrator::new(launcher, 4).with_timings(instant());
        let run = tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.run(&identities(&["1", "2", "3", "4"])),
        )
        .await
        .expect("sessions did not run side by side");
        assert_eq!(run.records.len(), 4);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn outcomes_arrive_in_completion_order() {
        let (launcher, _) = launcher_with(&[row("CIV 1/2024", "05/01/2024")], Duration::ZERO, None);
        let orchestrator = SessionOrchestrator::new(launcher, 2).with_timings(instant());
        let run = orchestrator.run(&identities(&["a-slow", "b-fast"])).await;
        let order: Vec<_> = run.outcomes.iter().map(|o| o.identity.as_str()).collect();
        assert_eq!(order, ["b-fast", "a-slow"]);
        assert_eq!(run.records[0].subject, "Perito b-fast");
    }

    #[tokio::test]
    async fn panicking_session_is_isolated() {
        let (launcher, gauge) = fake_launcher(&[row("CIV 1/2024", "05/01/2024"), row("CIV 2/2024", "x")]);
        let orchestrator = SessionOrchestrator::new(launcher, 4).with_timings(instant());
        let run = orchestrator.run(&identities(&["111", "boom", "222"])).await;

        assert_eq!(run.outcomes.len(), 3);
        assert_eq!(run.records.len(), 4);
        let crashed = run.outcomes.iter().find(|o| o.identity == "boom").unwrap();
        assert_eq!(crashed.kind, OutcomeKind::Panicked);
        assert!(crashed.is_failure());
        assert_eq!(gauge.released.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_once_scrapes_sorts_and_persists() {
        let (launcher, _) = fake_launcher(&[
            row("CIV 1/2024", "03/01/2024"),
            row("CIV 2/2024", "sin fecha"),
            row("CIV 3/2024", "09/01/2024"),
        ]);
        let store = Arc::new(MemoryStore::new());
        let config = SyncConfig {
            identities: identities(&["111", "222"]),
            ..SyncConfig::from_lookup(|_| None)
        };
        let pipeline = SyncPipeline::new(config, store.clone(), launcher).with_timings(instant());

        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.identities, 2);
        assert_eq!(summary.sessions_failed, 0);
        assert_eq!(summary.records, 6);
        assert_eq!(summary.upsert.documents_written, 6);
        assert_eq!(store.document_count(DEFAULT_COLLECTION).await, 6);

        pipeline.run_once().await.unwrap();
        assert_eq!(store.document_count(DEFAULT_COLLECTION).await, 6);
    }

    /// Store whose reachability check fails a fixed number of times.
    struct FlakyStore {
        inner: MemoryStore,
        ping_failures: AtomicUsize,
        pings: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
            self.inner.commit(batch).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            let left = self.ping_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.ping_failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Protocol("store offline".into()));
            }
            Ok(())
        }

        async fn list_documents(&self, collection: &str) -> Result<Vec<StoredDocument>, StoreError> {
            self.inner.list_documents(collection).await
        }
    }

    #[tokio::test]
    async fn unreachable_store_fails_the_run() {
        let (launcher, gauge) = fake_launcher(&[]);
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            ping_failures: AtomicUsize::new(1),
            pings: AtomicUsize::new(0),
        });
        let config = SyncConfig {
            identities: identities(&["111"]),
            ..SyncConfig::from_lookup(|_| None)
        };
        let pipeline = SyncPipeline::new(config, store, launcher);
        let err = pipeline.run_once().await.unwrap_err();
        assert!(format!("{err:#}").contains("unreachable"));
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn interval_schedule_survives_failed_runs() {
        let (launcher, _) = fake_launcher(&[row("CIV 1/2024", "05/01/2024")]);
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            ping_failures: AtomicUsize::new(2),
            pings: AtomicUsize::new(0),
        });
        let config = SyncConfig {
            identities: identities(&["111"]),
            ..SyncConfig::from_lookup(|_| None)
        };
        let pipeline = Arc::new(
            SyncPipeline::new(config, store.clone(), launcher).with_timings(instant()),
        );
        let runner = ScheduleRunner::new(pipeline, Schedule::Interval(Duration::from_millis(5)));

        let stop = async {
            while store.inner.document_count(DEFAULT_COLLECTION).await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), runner.run_until(stop))
            .await
            .unwrap()
            .unwrap();
        assert!(store.pings.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn once_schedule_propagates_run_failure() {
        let (launcher, _) = fake_launcher(&[]);
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            ping_failures: AtomicUsize::new(1),
            pings: AtomicUsize::new(0),
        });
        let pipeline = Arc::new(SyncPipeline::new(SyncConfig::from_lookup(|_| None), store, launcher));
        let runner = ScheduleRunner::new(pipeline, Schedule::Once);
        assert!(runner.run_until(std::future::pending()).await.is_err());
    }

    #[tokio::test]
    async fn interrupted_interval_run_releases_every_driver() {
        let (launcher, gauge) =
            launcher_with(&[row("CIV 1/2024", "05/01/2024")], Duration::from_millis(300), None);
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_for(&["111", "222"], store.clone(), launcher);
        let runner = ScheduleRunner::new(pipeline, Schedule::Interval(Duration::from_secs(3600)));

        tokio::time::timeout(
            Duration::from_secs(5),
            runner.run_until(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(gauge.launched.load(Ordering::SeqCst), 2);
        assert_eq!(gauge.released.load(Ordering::SeqCst), 2);
        assert_eq!(store.document_count(DEFAULT_COLLECTION).await, 2);
    }

    #[tokio::test]
    async fn interrupted_single_run_still_completes() {
        let (launcher, gauge) =
            launcher_with(&[row("CIV 1/2024", "05/01/2024")], Duration::from_millis(200), None);
        let pipeline = pipeline_for(&["111"], Arc::new(MemoryStore::new()), launcher);

        let summary = run_once_until(&pipeline, tokio::time::sleep(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(gauge.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn claims_are_exclusive() {
        let (launcher, _) = fake_launcher(&[]);
        let pipeline = pipeline_for(&[], Arc::new(MemoryStore::new()), launcher);
        let claim = pipeline.try_claim().unwrap();
        assert!(pipeline.is_running());
        assert!(pipeline.try_claim().is_none());
        drop(claim);
        assert!(!pipeline.is_running());
        assert!(pipeline.try_claim().is_some());
    }

    #[tokio::test]
    async fn cron_tick_skips_while_a_pass_is_running() {
        let (launcher, gauge) = fake_launcher(&[row("CIV 1/2024", "05/01/2024")]);
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_for(&["111"], store.clone(), launcher);

        let held = pipeline.try_claim().unwrap();
        assert!(!cron_tick(&pipeline).await);
        assert_eq!(gauge.launched.load(Ordering::SeqCst), 0);

        drop(held);
        assert!(cron_tick(&pipeline).await);
        assert_eq!(store.document_count(DEFAULT_COLLECTION).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cron_schedule_runs_passes_until_shutdown() {
        let (launcher, gauge) = fake_launcher(&[row("CIV 1/2024", "05/01/2024")]);
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline_for(&["111"], store.clone(), launcher);
        let runner = ScheduleRunner::new(pipeline, Schedule::Cron("* * * * * *".to_string()));

        let stop = async {
            while store.document_count(DEFAULT_COLLECTION).await == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), runner.run_until(stop))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            gauge.launched.load(Ordering::SeqCst),
            gauge.released.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn invalid_cron_expression_is_rejected() {
        let (launcher, _) = fake_launcher(&[]);
        let pipeline = pipeline_for(&[], Arc::new(MemoryStore::new()), launcher);
        let runner = ScheduleRunner::new(pipeline, Schedule::Cron("every tuesday".to_string()));
        assert!(runner.run_until(std::future::pending()).await.is_err());
    }
}
