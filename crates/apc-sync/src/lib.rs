//! Reconciliation engine: tiering classifier, backoff policy, and the
//! control loop that re-checks known postings against the source.
//!
//! One posting is fully processed (fetch, ingest or archive, audit, commit)
//! before the next begins. The only suspension point is the politeness delay
//! between requests, and every posting's update is its own transaction, so
//! interruption leaves prior work durably committed and the rest simply
//! unprocessed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use apc_core::{parse_source_datetime, FetchOutcome, PostingRef, ScrapeAttempt, SourceDocument};
use apc_source::SourceClient;
use apc_storage::{Store, TierCandidate};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "apc-sync";

/// Priority buckets sharing a re-check policy, in check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Tier {
    Active,
    RecentlyClosed,
    PendingAward,
    AwardVerification,
}

impl Tier {
    pub const ALL: [Tier; 4] = [
        Tier::Active,
        Tier::RecentlyClosed,
        Tier::PendingAward,
        Tier::AwardVerification,
    ];

    pub fn number(self) -> u8 {
        match self {
            Tier::Active => 1,
            Tier::RecentlyClosed => 2,
            Tier::PendingAward => 3,
            Tier::AwardVerification => 4,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.number() == number)
    }

    pub fn label(self) -> &'static str {
        match self {
            Tier::Active => "active (OPEN) postings",
            Tier::RecentlyClosed => "recently closed postings",
            Tier::PendingAward => "pending awards (no age limit)",
            Tier::AwardVerification => "recent award verification",
        }
    }
}

/// Tier 3 eligibility by days since close: weekly-equivalent under 30 days,
/// then day-parity, then every seventh day. A coarse deterministic stand-in
/// for staged backoff that is only correct under a once-daily external
/// trigger; see DESIGN.md for the stored-timestamp alternative.
pub fn tier3_eligible(days_since_close: i64) -> bool {
    if days_since_close < 30 {
        true
    } else if days_since_close < 90 {
        days_since_close % 2 == 0
    } else {
        days_since_close % 7 == 0
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Minimum delay between consecutive source requests. A politeness
    /// contract with a shared upstream, not a tunable.
    pub request_delay: Duration,
    pub recent_close_window_days: i64,
    pub award_verify_window_days: i64,
    pub discovery_auto_stop: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://apc_watch.db".to_string()),
            api_base: std::env::var("APC_API_BASE")
                .unwrap_or_else(|_| apc_source::DEFAULT_API_BASE.to_string()),
            user_agent: std::env::var("APC_USER_AGENT")
                .unwrap_or_else(|_| "apc-watch/0.1".to_string()),
            http_timeout_secs: std::env::var("APC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            request_delay: Duration::from_millis(
                std::env::var("APC_REQUEST_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1000),
            ),
            recent_close_window_days: std::env::var("APC_RECENT_CLOSE_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            award_verify_window_days: std::env::var("APC_AWARD_VERIFY_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(90),
            discovery_auto_stop: std::env::var("APC_DISCOVERY_AUTO_STOP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    pub tier: Option<Tier>,
    pub dry_run: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TierStats {
    pub total: usize,
    pub checked: usize,
    pub would_check: usize,
    pub updated: usize,
    pub status_changes: usize,
    pub awards_added: usize,
    pub archived: usize,
    pub errors: usize,
    pub skipped: usize,
}

impl TierStats {
    fn absorb(&mut self, other: &TierStats) {
        self.total += other.total;
        self.checked += other.checked;
        self.would_check += other.would_check;
        self.updated += other.updated;
        self.status_changes += other.status_changes;
        self.awards_added += other.awards_added;
        self.archived += other.archived;
        self.errors += other.errors;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierReport {
    pub tier: u8,
    pub label: String,
    pub stats: TierStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub tiers: Vec<TierReport>,
}

impl RunSummary {
    pub fn totals(&self) -> TierStats {
        let mut totals = TierStats::default();
        for report in &self.tiers {
            totals.absorb(&report.stats);
        }
        totals
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub year: i32,
    pub started_from: u32,
    pub scanned: usize,
    pub found: usize,
    pub not_found: usize,
    pub errors: usize,
    pub highest_found: Option<u32>,
}

/// Per-candidate result of one reconciliation step.
#[derive(Debug)]
enum CheckOutcome {
    Updated { status_changed: bool, award_added: bool },
    WouldUpdate,
    Preserved { newly_archived: bool },
    WouldPreserve,
    Transient,
    Failed(String),
}

pub struct Reconciler<C> {
    store: Store,
    client: C,
    config: SyncConfig,
    cancel: Arc<AtomicBool>,
}

impl<C: SourceClient> Reconciler<C> {
    pub fn new(store: Store, client: C, config: SyncConfig) -> Self {
        Self {
            store,
            client,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between candidates. Setting it stops the run after the
    /// in-flight posting finishes committing; nothing already committed is
    /// rolled back.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Run the reconciliation loop across the selected tiers. Individual
    /// posting failures are counted, never propagated; only setup errors
    /// (store unreachable, schema behind) fail the run.
    pub async fn run(&self, options: &ReconcileOptions) -> Result<RunSummary> {
        self.store.require_current_schema().await?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, dry_run = options.dry_run, "starting reconciliation run");

        let mut tiers = Vec::new();
        for tier in Tier::ALL {
            if options.tier.is_some_and(|selected| selected != tier) {
                continue;
            }
            if self.cancelled() {
                warn!("cancellation requested; remaining tiers left for next run");
                break;
            }
            let stats = self.run_tier(tier, options).await?;
            tiers.push(TierReport {
                tier: tier.number(),
                label: tier.label().to_string(),
                stats,
            });
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: options.dry_run,
            tiers,
        };
        let totals = summary.totals();
        info!(
            %run_id,
            checked = totals.checked,
            updated = totals.updated,
            status_changes = totals.status_changes,
            awards_added = totals.awards_added,
            archived = totals.archived,
            errors = totals.errors,
            skipped = totals.skipped,
            "reconciliation run complete"
        );
        Ok(summary)
    }

    async fn candidates_for(&self, tier: Tier) -> Result<Vec<TierCandidate>> {
        let now = Utc::now();
        match tier {
            Tier::Active => self.store.tier1_candidates().await,
            Tier::RecentlyClosed => {
                self.store
                    .tier2_candidates(now, self.config.recent_close_window_days)
                    .await
            }
            Tier::PendingAward => self.store.tier3_candidates(now).await,
            Tier::AwardVerification => {
                self.store
                    .tier4_candidates(now, self.config.award_verify_window_days)
                    .await
            }
        }
    }

    async fn run_tier(&self, tier: Tier, options: &ReconcileOptions) -> Result<TierStats> {
        let mut candidates = self
            .candidates_for(tier)
            .await
            .with_context(|| format!("listing tier {} candidates", tier.number()))?;
        if let Some(limit) = options.limit {
            candidates.truncate(limit);
        }

        let mut stats = TierStats {
            total: candidates.len(),
            ..TierStats::default()
        };
        info!(tier = tier.number(), label = tier.label(), total = stats.total, "tier start");

        for candidate in candidates {
            if self.cancelled() {
                warn!(tier = tier.number(), "cancellation requested mid-tier");
                break;
            }

            // Backoff applies to Tier 3 only; the other tiers are checked
            // unconditionally every run.
            if tier == Tier::PendingAward {
                let days = candidate.days_since_close.unwrap_or(0);
                if !tier3_eligible(days) {
                    stats.skipped += 1;
                    continue;
                }
            }

            let key = candidate.reference;
            match self.check_candidate(key, options.dry_run).await {
                CheckOutcome::Updated {
                    status_changed,
                    award_added,
                } => {
                    stats.checked += 1;
                    stats.updated += 1;
                    if status_changed {
                        stats.status_changes += 1;
                    }
                    if award_added {
                        stats.awards_added += 1;
                        info!(reference = %key, "award added");
                    }
                }
                CheckOutcome::Preserved { newly_archived } => {
                    stats.checked += 1;
                    stats.updated += 1;
                    if newly_archived {
                        stats.archived += 1;
                        info!(reference = %key, "posting gone upstream; preserved and archived");
                    }
                }
                CheckOutcome::WouldUpdate | CheckOutcome::WouldPreserve => {
                    stats.would_check += 1;
                }
                CheckOutcome::Transient => {
                    // In a dry run nothing was written, so a transient fetch
                    // failure still counts toward the would-check tally.
                    if options.dry_run {
                        stats.would_check += 1;
                    } else {
                        stats.checked += 1;
                        stats.errors += 1;
                    }
                }
                CheckOutcome::Failed(detail) => {
                    stats.checked += 1;
                    stats.errors += 1;
                    error!(reference = %key, detail, "candidate failed");
                }
            }

            tokio::time::sleep(self.config.request_delay).await;
        }

        info!(
            tier = tier.number(),
            updated = stats.updated,
            status_changes = stats.status_changes,
            awards_added = stats.awards_added,
            errors = stats.errors,
            skipped = stats.skipped,
            "tier complete"
        );
        Ok(stats)
    }

    /// Steps 1-5 of the scheduler loop for one posting. Every early return
    /// is an isolated outcome; nothing here aborts the run.
    async fn check_candidate(&self, key: PostingRef, dry_run: bool) -> CheckOutcome {
        let before = match self.store.snapshot(key).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return CheckOutcome::Failed("not in store".to_string()),
            Err(err) => return CheckOutcome::Failed(format!("snapshot read: {err:#}")),
        };

        match self.client.fetch(key).await {
            FetchOutcome::Found(document) => {
                let now = Utc::now();
                let new_status = document
                    .opportunity
                    .status_code
                    .as_deref()
                    .unwrap_or("UNKNOWN")
                    .to_string();
                let new_awarded = document
                    .opportunity
                    .awarded_on_utc
                    .as_deref()
                    .and_then(parse_source_datetime);
                let status_changed = new_status != before.status.code();
                let award_added = before.awarded_on.is_none() && new_awarded.is_some();

                if dry_run {
                    return CheckOutcome::WouldUpdate;
                }

                if status_changed {
                    info!(
                        reference = %key,
                        old = before.status.code(),
                        new = new_status,
                        "status change"
                    );
                }

                match self
                    .apply_found(key, &document, Some(before.status.code()), status_changed, now)
                    .await
                {
                    Ok(()) => CheckOutcome::Updated {
                        status_changed,
                        award_added,
                    },
                    Err(err) => {
                        // Transaction rolled back: tracking fields untouched,
                        // so the posting stays a candidate. Log the attempt
                        // outside the failed transaction, best effort.
                        let attempt = ScrapeAttempt {
                            year: key.year,
                            number: key.number,
                            reference: Some(key.to_string()),
                            success: false,
                            error_message: Some(format!("ingest failed: {err:#}")),
                            http_status: Some(200),
                            attempted_at: now,
                        };
                        if let Err(log_err) = self.store.record_attempt(&attempt).await {
                            warn!(reference = %key, error = %log_err, "attempt log failed");
                        }
                        CheckOutcome::Failed(format!("{err:#}"))
                    }
                }
            }
            FetchOutcome::NotFound => {
                if dry_run {
                    return CheckOutcome::WouldPreserve;
                }
                match self.store.mark_absent(key, Utc::now()).await {
                    Ok(newly_archived) => CheckOutcome::Preserved { newly_archived },
                    Err(err) => CheckOutcome::Failed(format!("{err:#}")),
                }
            }
            FetchOutcome::Transient(transient) => {
                warn!(reference = %key, error = %transient, "transient fetch failure");
                if dry_run {
                    return CheckOutcome::Transient;
                }
                let attempt = ScrapeAttempt {
                    year: key.year,
                    number: key.number,
                    reference: Some(key.to_string()),
                    success: false,
                    error_message: Some(transient.to_string()),
                    http_status: transient.http_status,
                    attempted_at: Utc::now(),
                };
                if let Err(err) = self.store.record_attempt(&attempt).await {
                    warn!(reference = %key, error = %err, "attempt log failed");
                }
                CheckOutcome::Transient
            }
        }
    }

    /// Atomic success path: upsert + tracking + optional transition + audit,
    /// one transaction scoped to this posting.
    async fn apply_found(
        &self,
        key: PostingRef,
        document: &SourceDocument,
        previous_status: Option<&str>,
        status_changed: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let normalized = document.normalize(key, now);
        if normalized.fully_populated_awards() > 1 {
            // The source has only ever shown a single award; keep them all
            // but make the multiplicity visible.
            warn!(
                reference = %key,
                awards = normalized.awards.len(),
                "multiple fully populated awards observed"
            );
        }
        let raw = serde_json::to_string(document).context("serializing payload")?;

        let mut tx = self.store.begin().await?;
        Store::upsert_posting(&mut tx, &normalized, &raw).await?;
        Store::touch_tracking(&mut tx, key, previous_status, now).await?;
        if status_changed {
            Store::append_transition(
                &mut tx,
                key,
                previous_status,
                normalized.record.status.code(),
                normalized.record.close_date,
                normalized.record.awarded_on,
                now,
            )
            .await?;
        }
        Store::append_attempt(
            &mut tx,
            &ScrapeAttempt {
                year: key.year,
                number: key.number,
                reference: Some(key.to_string()),
                success: true,
                error_message: None,
                http_status: Some(200),
                attempted_at: now,
            },
        )
        .await?;
        tx.commit().await.context("committing posting update")?;
        Ok(())
    }

    /// Probe ascending sequence numbers past the highest known posting for
    /// `year`, stopping after a run of consecutive absences.
    pub async fn discover_year(&self, year: i32, auto_stop: usize) -> Result<DiscoveryReport> {
        self.store.require_current_schema().await?;

        let started_from = self.store.highest_posting_number(year).await?.unwrap_or(0) + 1;
        info!(year, started_from, auto_stop, "starting discovery scan");

        let mut report = DiscoveryReport {
            year,
            started_from,
            scanned: 0,
            found: 0,
            not_found: 0,
            errors: 0,
            highest_found: None,
        };
        let mut consecutive_missing = 0usize;

        // Hard upper bound mirrors the source's five-digit sequence space.
        for number in started_from..=99_999 {
            if self.cancelled() {
                warn!(year, "cancellation requested; discovery stopped");
                break;
            }
            let key = PostingRef::new(year, number);
            report.scanned += 1;

            match self.client.fetch(key).await {
                FetchOutcome::Found(document) => {
                    consecutive_missing = 0;
                    match self.apply_found(key, &document, None, false, Utc::now()).await {
                        Ok(()) => {
                            report.found += 1;
                            report.highest_found = Some(number);
                            info!(reference = %key, "new posting ingested");
                        }
                        Err(err) => {
                            report.errors += 1;
                            error!(reference = %key, error = %err, "ingest failed");
                        }
                    }
                }
                FetchOutcome::NotFound => {
                    report.not_found += 1;
                    consecutive_missing += 1;
                    let attempt = ScrapeAttempt {
                        year,
                        number,
                        reference: None,
                        success: false,
                        error_message: Some("Not found (404)".to_string()),
                        http_status: Some(404),
                        attempted_at: Utc::now(),
                    };
                    if let Err(err) = self.store.record_attempt(&attempt).await {
                        warn!(reference = %key, error = %err, "attempt log failed");
                    }
                    if consecutive_missing >= auto_stop {
                        info!(year, number, "auto-stop threshold reached");
                        break;
                    }
                }
                FetchOutcome::Transient(transient) => {
                    // Transient failures do not count toward auto-stop.
                    report.errors += 1;
                    warn!(reference = %key, error = %transient, "transient fetch failure");
                    let attempt = ScrapeAttempt {
                        year,
                        number,
                        reference: None,
                        success: false,
                        error_message: Some(transient.to_string()),
                        http_status: transient.http_status,
                        attempted_at: Utc::now(),
                    };
                    if let Err(err) = self.store.record_attempt(&attempt).await {
                        warn!(reference = %key, error = %err, "attempt log failed");
                    }
                }
            }

            tokio::time::sleep(self.config.request_delay).await;
        }

        info!(
            year,
            scanned = report.scanned,
            found = report.found,
            errors = report.errors,
            "discovery scan complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apc_core::TransientError;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::Mutex;

    /// Scripted stand-in for the HTTP client: outcomes are consumed per key
    /// in order; unknown keys report absence.
    struct ScriptedClient {
        responses: Mutex<HashMap<PostingRef, VecDeque<FetchOutcome>>>,
    }

    impl ScriptedClient {
        fn new(scripts: Vec<(PostingRef, Vec<FetchOutcome>)>) -> Self {
            let responses = scripts
                .into_iter()
                .map(|(key, outcomes)| (key, outcomes.into_iter().collect()))
                .collect();
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl SourceClient for ScriptedClient {
        async fn fetch(&self, key: PostingRef) -> FetchOutcome {
            let mut responses = self.responses.lock().await;
            responses
                .get_mut(&key)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(FetchOutcome::NotFound)
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            database_url: "sqlite::memory:".to_string(),
            api_base: "http://unused.test".to_string(),
            user_agent: "apc-watch/test".to_string(),
            http_timeout_secs: 5,
            request_delay: Duration::ZERO,
            recent_close_window_days: 60,
            award_verify_window_days: 90,
            discovery_auto_stop: 50,
        }
    }

    fn document(
        key: PostingRef,
        status: &str,
        closed_days_ago: Option<i64>,
        with_award: bool,
    ) -> SourceDocument {
        let now = Utc::now();
        let close = closed_days_ago.map(|d| (now - ChronoDuration::days(d)).to_rfc3339());
        let awards = if with_award {
            serde_json::json!([{
                "alternativeSupplierDisplayName": "Chinook Earthworks",
                "amount": 845000.0,
                "awardDate": now.to_rfc3339()
            }])
        } else {
            serde_json::json!([])
        };
        serde_json::from_value(serde_json::json!({
            "opportunity": {
                "referenceNumber": key.to_string(),
                "shortTitle": "Culvert replacement program",
                "statusCode": status,
                "closeDateTime": close,
                "awardedOnUtc": if with_award { Some(now.to_rfc3339()) } else { None },
            },
            "bidders": [],
            "awards": awards
        }))
        .unwrap()
    }

    async fn seeded_store(postings: &[(PostingRef, &str, Option<i64>)]) -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let now = Utc::now();
        for (key, status, closed_days_ago) in postings {
            let doc = document(*key, status, *closed_days_ago, false);
            let normalized = doc.normalize(*key, now);
            let raw = serde_json::to_string(&doc).unwrap();
            let mut tx = store.begin().await.unwrap();
            Store::upsert_posting(&mut tx, &normalized, &raw).await.unwrap();
            Store::touch_tracking(&mut tx, *key, None, now).await.unwrap();
            tx.commit().await.unwrap();
        }
        store
    }

    #[test]
    fn tier3_backoff_follows_staged_cadence() {
        assert!(tier3_eligible(0));
        assert!(tier3_eligible(29));
        assert!(!tier3_eligible(45));
        assert!(tier3_eligible(46));
        assert!(!tier3_eligible(89));
        assert!(!tier3_eligible(90));
        assert!(tier3_eligible(91));
        assert!(tier3_eligible(350));
        assert!(!tier3_eligible(400));
    }

    #[test]
    fn tier_numbers_round_trip() {
        for tier in Tier::ALL {
            assert_eq!(Tier::from_number(tier.number()), Some(tier));
        }
        assert_eq!(Tier::from_number(9), None);
    }

    #[tokio::test]
    async fn absence_twice_archives_once_and_preserves_fields() {
        let key = PostingRef::new(2025, 281);
        let store = seeded_store(&[(key, "CLOSED", Some(10))]).await;
        let client = ScriptedClient::new(vec![(key, vec![FetchOutcome::NotFound; 2])]);
        let reconciler = Reconciler::new(store.clone(), client, test_config());

        let options = ReconcileOptions {
            tier: Some(Tier::RecentlyClosed),
            ..Default::default()
        };
        let first = reconciler.run(&options).await.unwrap();
        assert_eq!(first.totals().archived, 1);

        let after_first = store.get_posting(key).await.unwrap().unwrap();
        assert!(after_first.archived);
        assert_eq!(
            after_first.short_title.as_deref(),
            Some("Culvert replacement program")
        );
        let archived_at = after_first.archived_at.unwrap();

        let second = reconciler.run(&options).await.unwrap();
        assert_eq!(second.totals().archived, 0);
        assert_eq!(second.totals().updated, 1);

        let after_second = store.get_posting(key).await.unwrap().unwrap();
        assert_eq!(after_second.archived_at, Some(archived_at));
        assert_eq!(after_second.check_count, after_first.check_count + 1);
    }

    #[tokio::test]
    async fn open_to_award_appends_one_transition_and_flags_award() {
        let key = PostingRef::new(2025, 77);
        let store = seeded_store(&[(key, "OPEN", Some(5))]).await;
        let client = ScriptedClient::new(vec![(
            key,
            vec![FetchOutcome::Found(document(key, "AWARD", Some(5), true))],
        )]);
        let reconciler = Reconciler::new(store.clone(), client, test_config());

        let summary = reconciler
            .run(&ReconcileOptions {
                tier: Some(Tier::Active),
                ..Default::default()
            })
            .await
            .unwrap();

        let totals = summary.totals();
        assert_eq!(totals.status_changes, 1);
        assert_eq!(totals.awards_added, 1);

        let transitions = store.transitions_for(key).await.unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].old_status.as_deref(), Some("OPEN"));
        assert_eq!(transitions[0].new_status, "AWARD");

        let record = store.get_posting(key).await.unwrap().unwrap();
        assert_eq!(record.previous_status.as_deref(), Some("OPEN"));
        assert_eq!(record.check_count, 2);
    }

    #[tokio::test]
    async fn multiple_awards_ingest_through_the_warning_path() {
        let key = PostingRef::new(2025, 55);
        let store = seeded_store(&[(key, "EVALUATION", Some(40))]).await;

        let mut doc = document(key, "AWARD", Some(40), true);
        doc.awards.push(apc_core::SourceAward {
            alternative_supplier_display_name: Some("Foothills Paving".to_string()),
            amount: Some(120_000.0),
            ..Default::default()
        });
        assert_eq!(doc.normalize(key, Utc::now()).fully_populated_awards(), 2);

        let client = ScriptedClient::new(vec![(key, vec![FetchOutcome::Found(doc)])]);
        let reconciler = Reconciler::new(store.clone(), client, test_config());

        let summary = reconciler
            .run(&ReconcileOptions {
                tier: Some(Tier::PendingAward),
                ..Default::default()
            })
            .await
            .unwrap();

        // Extras are kept and warned about, never dropped or treated as errors.
        let totals = summary.totals();
        assert_eq!(totals.updated, 1);
        assert_eq!(totals.awards_added, 1);
        assert_eq!(totals.errors, 0);

        assert_eq!(store.stats().await.unwrap().awards, 2);
        let record = store.get_posting(key).await.unwrap().unwrap();
        assert_eq!(record.status.code(), "AWARD");
    }

    #[tokio::test]
    async fn dry_run_reports_would_check_with_zero_writes() {
        let keys: Vec<PostingRef> = (1..=10).map(|n| PostingRef::new(2025, n)).collect();
        let seeds: Vec<(PostingRef, &str, Option<i64>)> =
            keys.iter().map(|k| (*k, "OPEN", Some(3))).collect();
        let store = seeded_store(&seeds).await;
        let client = ScriptedClient::new(
            keys.iter()
                .map(|k| (*k, vec![FetchOutcome::Found(document(*k, "CLOSED", Some(3), false))]))
                .collect(),
        );
        let reconciler = Reconciler::new(store.clone(), client, test_config());

        let summary = reconciler
            .run(&ReconcileOptions {
                tier: Some(Tier::Active),
                dry_run: true,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(summary.totals().would_check, 10);
        assert_eq!(summary.totals().updated, 0);

        for key in keys {
            let record = store.get_posting(key).await.unwrap().unwrap();
            assert_eq!(record.status.code(), "OPEN");
            assert_eq!(record.check_count, 1);
            assert!(store.attempts_for(key).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn dry_run_transient_counts_as_would_check() {
        let key = PostingRef::new(2025, 8);
        let store = seeded_store(&[(key, "OPEN", None)]).await;
        let client = ScriptedClient::new(vec![(
            key,
            vec![FetchOutcome::Transient(TransientError {
                http_status: Some(502),
                detail: "Bad Gateway".to_string(),
            })],
        )]);
        let reconciler = Reconciler::new(store.clone(), client, test_config());

        let summary = reconciler
            .run(&ReconcileOptions {
                tier: Some(Tier::Active),
                dry_run: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let totals = summary.totals();
        assert_eq!(totals.would_check, 1);
        assert_eq!(totals.checked, 0);
        assert_eq!(totals.errors, 0);
        assert!(store.attempts_for(key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_leaves_tracking_untouched() {
        let key = PostingRef::new(2025, 12);
        let store = seeded_store(&[(key, "CLOSED", Some(10))]).await;
        let client = ScriptedClient::new(vec![(
            key,
            vec![FetchOutcome::Transient(TransientError {
                http_status: Some(503),
                detail: "Service Unavailable".to_string(),
            })],
        )]);
        let reconciler = Reconciler::new(store.clone(), client, test_config());

        let summary = reconciler
            .run(&ReconcileOptions {
                tier: Some(Tier::RecentlyClosed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.totals().errors, 1);
        assert_eq!(summary.totals().updated, 0);

        let record = store.get_posting(key).await.unwrap().unwrap();
        assert_eq!(record.check_count, 1);
        assert!(!record.archived);

        let attempts = store.attempts_for(key).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(!attempts[0].success);
        assert!(attempts[0].error_message.as_deref().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn tier3_run_skips_by_parity_and_checks_old_postings() {
        // 45 days: odd, skipped. 46 days: even, checked. 350 days: multiple
        // of seven, checked despite its age.
        let skipped_key = PostingRef::new(2025, 1);
        let even_key = PostingRef::new(2025, 2);
        let old_key = PostingRef::new(2025, 3);
        let store = seeded_store(&[
            (skipped_key, "CLOSED", Some(45)),
            (even_key, "CLOSED", Some(46)),
            (old_key, "EVALUATION", Some(350)),
        ])
        .await;
        let client = ScriptedClient::new(vec![
            (even_key, vec![FetchOutcome::Found(document(even_key, "CLOSED", Some(46), false))]),
            (old_key, vec![FetchOutcome::Found(document(old_key, "AWARD", Some(350), true))]),
        ]);
        let reconciler = Reconciler::new(store.clone(), client, test_config());

        let summary = reconciler
            .run(&ReconcileOptions {
                tier: Some(Tier::PendingAward),
                ..Default::default()
            })
            .await
            .unwrap();

        let totals = summary.totals();
        assert_eq!(totals.total, 3);
        assert_eq!(totals.skipped, 1);
        assert_eq!(totals.checked, 2);
        assert_eq!(totals.awards_added, 1);

        // The skipped posting was never fetched.
        let record = store.get_posting(skipped_key).await.unwrap().unwrap();
        assert_eq!(record.check_count, 1);
    }

    #[tokio::test]
    async fn individual_failures_do_not_abort_the_run() {
        let failing = PostingRef::new(2025, 1);
        let healthy = PostingRef::new(2025, 2);
        let store = seeded_store(&[(failing, "OPEN", None), (healthy, "OPEN", None)]).await;
        let client = ScriptedClient::new(vec![
            (
                failing,
                vec![FetchOutcome::Transient(TransientError {
                    http_status: None,
                    detail: "connection reset".to_string(),
                })],
            ),
            (healthy, vec![FetchOutcome::Found(document(healthy, "OPEN", None, false))]),
        ]);
        let reconciler = Reconciler::new(store.clone(), client, test_config());

        let summary = reconciler
            .run(&ReconcileOptions {
                tier: Some(Tier::Active),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(summary.totals().errors, 1);
        assert_eq!(summary.totals().updated, 1);
    }

    #[tokio::test]
    async fn unmigrated_store_is_a_setup_failure() {
        let store = Store::open_in_memory().await.unwrap();
        let client = ScriptedClient::new(vec![]);
        let reconciler = Reconciler::new(store, client, test_config());
        assert!(reconciler.run(&ReconcileOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn discovery_stops_after_consecutive_absences() {
        let found_key = PostingRef::new(2025, 1);
        let store = seeded_store(&[]).await;
        let client = ScriptedClient::new(vec![(
            found_key,
            vec![FetchOutcome::Found(document(found_key, "OPEN", None, false))],
        )]);
        let reconciler = Reconciler::new(store.clone(), client, test_config());

        let report = reconciler.discover_year(2025, 3).await.unwrap();
        assert_eq!(report.started_from, 1);
        assert_eq!(report.found, 1);
        assert_eq!(report.not_found, 3);
        assert_eq!(report.scanned, 4);
        assert_eq!(report.highest_found, Some(1));

        assert!(store.get_posting(found_key).await.unwrap().is_some());
        assert_eq!(store.highest_posting_number(2025).await.unwrap(), Some(1));
        // Absences past the frontier are logged but create no postings.
        assert_eq!(
            store.attempts_for(PostingRef::new(2025, 2)).await.unwrap().len(),
            1
        );
        assert!(store.get_posting(PostingRef::new(2025, 4)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancellation_stops_between_candidates() {
        let keys: Vec<PostingRef> = (1..=5).map(|n| PostingRef::new(2025, n)).collect();
        let seeds: Vec<(PostingRef, &str, Option<i64>)> =
            keys.iter().map(|k| (*k, "OPEN", None)).collect();
        let store = seeded_store(&seeds).await;
        let client = ScriptedClient::new(vec![]);
        let reconciler = Reconciler::new(store, client, test_config());

        reconciler.cancel_flag().store(true, Ordering::Relaxed);
        let summary = reconciler
            .run(&ReconcileOptions {
                tier: Some(Tier::Active),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.totals().checked, 0);
    }
}
