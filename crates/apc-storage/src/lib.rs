//! Durable record store for postings, sub-records, and the audit trail.
//!
//! The store holds the system's central data-integrity guarantee: once a
//! posting exists here it is never deleted. Confirmed absence upstream is an
//! archival overlay (`is_archived` + write-once `archived_at`), not a
//! removal. Schema evolution goes through versioned migrations applied at
//! startup; after `migrate()` returns, column presence is assumed.

use anyhow::{bail, Context, Result};
use apc_core::{
    NormalizedPosting, PostingRecord, PostingRef, PostingStatus, ScrapeAttempt, StatusTransition,
};
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::str::FromStr;
use tracing::info;

pub const CRATE_NAME: &str = "apc-storage";

pub const LATEST_SCHEMA_VERSION: i64 = 3;

/// Timestamps are stored as RFC 3339 UTC text so that string comparison
/// orders them correctly in SQL.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// The "before" view the scheduler reads ahead of a fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct PostingSnapshot {
    pub reference: PostingRef,
    pub status: PostingStatus,
    pub awarded_on: Option<DateTime<Utc>>,
    pub check_count: i64,
    pub archived: bool,
}

/// One entry in a tier's work queue. `days_since_close` is populated for
/// Tier 3, where the backoff policy needs it.
#[derive(Debug, Clone, PartialEq)]
pub struct TierCandidate {
    pub reference: PostingRef,
    pub days_since_close: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub postings: i64,
    pub archived: i64,
    pub bids: i64,
    pub awards: i64,
    pub interested_suppliers: i64,
    pub documents: i64,
    pub scrape_attempts: i64,
    pub status_transitions: i64,
    pub by_status: Vec<(String, i64)>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path`. Unreachable or
    /// unopenable storage is a fatal setup error.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)
            .with_context(|| format!("parsing database path {path}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening database {path}"))?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same in-memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>> {
        self.pool.begin().await.context("beginning transaction")
    }

    // -----------------------------------------------------------------
    // Migrations

    pub async fn schema_version(&self) -> Result<i64> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        )
        .fetch_one(&self.pool)
        .await?;
        if !exists {
            return Ok(0);
        }
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version.unwrap_or(0))
    }

    /// Ensure the schema is at `LATEST_SCHEMA_VERSION`, or fail with a hint
    /// to migrate. This is the startup gate for a reconciliation run.
    pub async fn require_current_schema(&self) -> Result<()> {
        let version = self.schema_version().await?;
        if version != LATEST_SCHEMA_VERSION {
            bail!(
                "schema version {version} found, {LATEST_SCHEMA_VERSION} required; run `apc-cli migrate`"
            );
        }
        Ok(())
    }

    /// Apply all pending migrations. Idempotent: re-running applies nothing.
    pub async fn migrate(&self) -> Result<i64> {
        let mut tx = self.begin().await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut current = self.schema_version().await?;
        let mut applied = 0i64;
        for (version, statements) in migrations() {
            if version <= current {
                continue;
            }
            let mut tx = self.begin().await?;
            for statement in statements {
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("applying migration v{version}"))?;
            }
            sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
                .bind(version)
                .bind(ts(Utc::now()))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(version, "applied schema migration");
            current = version;
            applied += 1;
        }
        Ok(applied)
    }

    // -----------------------------------------------------------------
    // Reads

    pub async fn snapshot(&self, key: PostingRef) -> Result<Option<PostingSnapshot>> {
        let row = sqlx::query(
            "SELECT status_code, awarded_on, check_count, is_archived
             FROM postings WHERE year = ? AND posting_number = ?",
        )
        .bind(key.year)
        .bind(key.number as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| PostingSnapshot {
            reference: key,
            status: PostingStatus::from_code(&row.get::<String, _>("status_code")),
            awarded_on: parse_ts(row.get("awarded_on")),
            check_count: row.get("check_count"),
            archived: row.get("is_archived"),
        }))
    }

    pub async fn get_posting(&self, key: PostingRef) -> Result<Option<PostingRecord>> {
        let row = sqlx::query("SELECT * FROM postings WHERE year = ? AND posting_number = ?")
            .bind(key.year)
            .bind(key.number as i64)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| PostingRecord {
            reference: key,
            short_title: row.get("short_title"),
            title: row.get("full_title"),
            description: row.get("description"),
            solicitation_number: row.get("solicitation_number"),
            status: PostingStatus::from_code(&row.get::<String, _>("status_code")),
            category: row.get("category_code"),
            solicitation_type: row.get("solicitation_type"),
            posting_type: row.get("posting_type"),
            region: row.get("region"),
            post_date: parse_ts(row.get("post_date")),
            close_date: parse_ts(row.get("close_date")),
            delivery_start_date: parse_ts(row.get("delivery_start_date")),
            delivery_end_date: parse_ts(row.get("delivery_end_date")),
            awarded_on: parse_ts(row.get("awarded_on")),
            cancelled_on: parse_ts(row.get("cancelled_on")),
            estimated_value: row.get("estimated_value"),
            actual_value: row.get("actual_value"),
            amendment_number: row.get("amendment_number"),
            num_interested_suppliers: row.get("num_interested_suppliers"),
            num_bidders: row.get("num_bidders"),
            num_documents: row.get("num_documents"),
            first_seen_at: parse_ts(row.get("first_seen_at")).unwrap_or_default(),
            last_checked_at: parse_ts(row.get("last_checked_at")).unwrap_or_default(),
            check_count: row.get("check_count"),
            previous_status: row.get("previous_status"),
            archived: row.get("is_archived"),
            archived_at: parse_ts(row.get("archived_at")),
        }))
    }

    pub async fn transitions_for(&self, key: PostingRef) -> Result<Vec<StatusTransition>> {
        let rows = sqlx::query(
            "SELECT old_status, new_status, changed_at, days_in_previous_status, close_date, awarded_on
             FROM status_history WHERE reference_number = ? ORDER BY id",
        )
        .bind(key.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StatusTransition {
                reference: key,
                old_status: row.get("old_status"),
                new_status: row.get("new_status"),
                changed_at: parse_ts(row.get("changed_at")).unwrap_or_default(),
                days_in_previous_status: row.get("days_in_previous_status"),
                close_date: parse_ts(row.get("close_date")),
                awarded_on: parse_ts(row.get("awarded_on")),
            })
            .collect())
    }

    pub async fn attempts_for(&self, key: PostingRef) -> Result<Vec<ScrapeAttempt>> {
        let rows = sqlx::query(
            "SELECT year, posting_number, reference_number, success, error_message,
                    http_status_code, attempted_at
             FROM scrape_log WHERE year = ? AND posting_number = ? ORDER BY id",
        )
        .bind(key.year)
        .bind(key.number as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ScrapeAttempt {
                year: row.get::<i64, _>("year") as i32,
                number: row.get::<i64, _>("posting_number") as u32,
                reference: row.get("reference_number"),
                success: row.get("success"),
                error_message: row.get("error_message"),
                http_status: row.get::<Option<i64>, _>("http_status_code").map(|s| s as u16),
                attempted_at: parse_ts(row.get("attempted_at")).unwrap_or_default(),
            })
            .collect())
    }

    pub async fn highest_posting_number(&self, year: i32) -> Result<Option<u32>> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(posting_number) FROM postings WHERE year = ?")
                .bind(year)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.map(|n| n as u32))
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        stats.postings = self.count_rows("postings").await?;
        stats.bids = self.count_rows("bids").await?;
        stats.awards = self.count_rows("awards").await?;
        stats.interested_suppliers = self.count_rows("interested_suppliers").await?;
        stats.documents = self.count_rows("documents").await?;
        stats.scrape_attempts = self.count_rows("scrape_log").await?;
        stats.status_transitions = self.count_rows("status_history").await?;
        stats.archived =
            sqlx::query_scalar("SELECT COUNT(*) FROM postings WHERE is_archived = 1")
                .fetch_one(&self.pool)
                .await?;
        let rows = sqlx::query(
            "SELECT status_code, COUNT(*) AS n FROM postings GROUP BY status_code ORDER BY n DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        stats.by_status = rows
            .into_iter()
            .map(|row| (row.get::<String, _>("status_code"), row.get::<i64, _>("n")))
            .collect();
        Ok(stats)
    }

    // Table name comes from a fixed internal list, never from input.
    async fn count_rows(&self, table: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // -----------------------------------------------------------------
    // Tier candidate queries

    /// Tier 1: all OPEN postings, newest key first.
    pub async fn tier1_candidates(&self) -> Result<Vec<TierCandidate>> {
        let rows = sqlx::query(
            "SELECT year, posting_number FROM postings
             WHERE status_code = 'OPEN'
             ORDER BY year DESC, posting_number DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| candidate(&row, None)).collect())
    }

    /// Tier 2: CLOSED with a close date inside the recent window.
    pub async fn tier2_candidates(
        &self,
        now: DateTime<Utc>,
        window_days: i64,
    ) -> Result<Vec<TierCandidate>> {
        let cutoff = ts(now - Duration::days(window_days));
        let rows = sqlx::query(
            "SELECT year, posting_number FROM postings
             WHERE status_code = 'CLOSED' AND close_date >= ?
             ORDER BY close_date DESC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| candidate(&row, None)).collect())
    }

    /// Tier 3: CLOSED or EVALUATION with no award yet and a known close
    /// date. Deliberately unbounded by age: delayed awards are the reason
    /// this tier exists.
    pub async fn tier3_candidates(&self, now: DateTime<Utc>) -> Result<Vec<TierCandidate>> {
        let rows = sqlx::query(
            "SELECT year, posting_number, close_date FROM postings
             WHERE status_code IN ('CLOSED', 'EVALUATION')
               AND awarded_on IS NULL
               AND close_date IS NOT NULL
             ORDER BY close_date DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let days = parse_ts(row.get("close_date"))
                    .map(|close| (now - close).num_days());
                candidate(&row, days)
            })
            .collect())
    }

    /// Tier 4: recently awarded postings checked exactly once, for a
    /// one-time integrity re-check of the award data.
    pub async fn tier4_candidates(
        &self,
        now: DateTime<Utc>,
        window_days: i64,
    ) -> Result<Vec<TierCandidate>> {
        let cutoff = ts(now - Duration::days(window_days));
        let rows = sqlx::query(
            "SELECT year, posting_number FROM postings
             WHERE status_code = 'AWARD' AND awarded_on >= ? AND check_count = 1
             ORDER BY awarded_on DESC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| candidate(&row, None)).collect())
    }

    // -----------------------------------------------------------------
    // Writes (composable within a per-posting transaction)

    /// Replace the canonical record, all sub-records, and the raw payload
    /// for one posting. All-or-nothing within the caller's transaction;
    /// tracking and archival columns are never touched here, so re-ingesting
    /// the same payload is idempotent.
    pub async fn upsert_posting(
        conn: &mut SqliteConnection,
        posting: &NormalizedPosting,
        raw_json: &str,
    ) -> Result<()> {
        let record = &posting.record;
        let reference = record.reference.to_string();

        sqlx::query(
            "INSERT INTO postings (
                reference, year, posting_number,
                short_title, full_title, description, solicitation_number,
                status_code, category_code, solicitation_type, posting_type, region,
                post_date, close_date, delivery_start_date, delivery_end_date,
                awarded_on, cancelled_on,
                estimated_value, actual_value, amendment_number,
                num_interested_suppliers, num_bidders, num_documents,
                first_seen_at, last_checked_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(reference) DO UPDATE SET
                short_title = excluded.short_title,
                full_title = excluded.full_title,
                description = excluded.description,
                solicitation_number = excluded.solicitation_number,
                status_code = excluded.status_code,
                category_code = excluded.category_code,
                solicitation_type = excluded.solicitation_type,
                posting_type = excluded.posting_type,
                region = excluded.region,
                post_date = excluded.post_date,
                close_date = excluded.close_date,
                delivery_start_date = excluded.delivery_start_date,
                delivery_end_date = excluded.delivery_end_date,
                awarded_on = excluded.awarded_on,
                cancelled_on = excluded.cancelled_on,
                estimated_value = excluded.estimated_value,
                actual_value = excluded.actual_value,
                amendment_number = excluded.amendment_number,
                num_interested_suppliers = excluded.num_interested_suppliers,
                num_bidders = excluded.num_bidders,
                num_documents = excluded.num_documents",
        )
        .bind(&reference)
        .bind(record.reference.year)
        .bind(record.reference.number as i64)
        .bind(&record.short_title)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.solicitation_number)
        .bind(record.status.code())
        .bind(&record.category)
        .bind(&record.solicitation_type)
        .bind(&record.posting_type)
        .bind(&record.region)
        .bind(record.post_date.map(ts))
        .bind(record.close_date.map(ts))
        .bind(record.delivery_start_date.map(ts))
        .bind(record.delivery_end_date.map(ts))
        .bind(record.awarded_on.map(ts))
        .bind(record.cancelled_on.map(ts))
        .bind(record.estimated_value)
        .bind(record.actual_value)
        .bind(record.amendment_number)
        .bind(record.num_interested_suppliers)
        .bind(record.num_bidders)
        .bind(record.num_documents)
        .bind(ts(record.first_seen_at))
        .bind(ts(record.last_checked_at))
        .execute(&mut *conn)
        .await
        .context("upserting posting")?;

        let sha256 = {
            let mut hasher = Sha256::new();
            hasher.update(raw_json.as_bytes());
            hex::encode(hasher.finalize())
        };
        sqlx::query(
            "INSERT OR REPLACE INTO raw_payloads
             (reference, year, posting_number, json_data, sha256, fetched_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&reference)
        .bind(record.reference.year)
        .bind(record.reference.number as i64)
        .bind(raw_json)
        .bind(sha256)
        .bind(ts(record.last_checked_at))
        .execute(&mut *conn)
        .await
        .context("storing raw payload")?;

        for table in ["bids", "awards", "interested_suppliers", "documents", "contacts"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE opportunity_ref = ?"))
                .bind(&reference)
                .execute(&mut *conn)
                .await?;
        }

        for bid in &posting.bids {
            sqlx::query(
                "INSERT INTO bids
                 (opportunity_ref, company_name, supplier_id, city, province, bid_amount, is_winner)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&reference)
            .bind(&bid.company_name)
            .bind(&bid.supplier_id)
            .bind(&bid.city)
            .bind(&bid.province)
            .bind(bid.bid_amount)
            .bind(bid.is_winner)
            .execute(&mut *conn)
            .await?;
        }

        for award in &posting.awards {
            sqlx::query(
                "INSERT INTO awards
                 (opportunity_ref, winner_name, supplier_id, award_amount, award_date,
                  city, province, country)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&reference)
            .bind(&award.winner_name)
            .bind(&award.supplier_id)
            .bind(award.award_amount)
            .bind(award.award_date.map(ts))
            .bind(&award.city)
            .bind(&award.province)
            .bind(&award.country)
            .execute(&mut *conn)
            .await?;
        }

        for supplier in &posting.interested_suppliers {
            sqlx::query(
                "INSERT INTO interested_suppliers
                 (opportunity_ref, supplier_id, business_name, description, city, province, country)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&reference)
            .bind(&supplier.supplier_id)
            .bind(&supplier.business_name)
            .bind(&supplier.description)
            .bind(&supplier.city)
            .bind(&supplier.province)
            .bind(&supplier.country)
            .execute(&mut *conn)
            .await?;
        }

        for document in &posting.documents {
            sqlx::query(
                "INSERT INTO documents
                 (opportunity_ref, document_id, filename, title, type_code, mime_type,
                  size_bytes, amendment_number, uploaded_on)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&reference)
            .bind(&document.document_id)
            .bind(&document.filename)
            .bind(&document.title)
            .bind(&document.type_code)
            .bind(&document.mime_type)
            .bind(document.size_bytes)
            .bind(document.amendment_number)
            .bind(document.uploaded_on.map(ts))
            .execute(&mut *conn)
            .await?;
        }

        if let Some(contact) = &posting.contact {
            sqlx::query(
                "INSERT INTO contacts
                 (opportunity_ref, first_name, last_name, email, phone_number, city, province)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&reference)
            .bind(&contact.first_name)
            .bind(&contact.last_name)
            .bind(&contact.email)
            .bind(&contact.phone_number)
            .bind(&contact.city)
            .bind(&contact.province)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }

    /// Advance the tracking fields after a successful fetch. `check_count`
    /// only increases and `last_checked_at` only moves forward.
    pub async fn touch_tracking(
        conn: &mut SqliteConnection,
        key: PostingRef,
        previous_status: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE postings
             SET last_checked_at = ?, check_count = check_count + 1, previous_status = ?
             WHERE year = ? AND posting_number = ?",
        )
        .bind(ts(now))
        .bind(previous_status)
        .bind(key.year)
        .bind(key.number as i64)
        .execute(conn)
        .await
        .context("updating tracking fields")?;
        Ok(())
    }

    /// Append one status transition, computing the days spent in the
    /// previous status from the last recorded transition, or from first
    /// observation when none exists.
    pub async fn append_transition(
        conn: &mut SqliteConnection,
        key: PostingRef,
        old_status: Option<&str>,
        new_status: &str,
        close_date: Option<DateTime<Utc>>,
        awarded_on: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let reference = key.to_string();
        let last_change: Option<String> = sqlx::query_scalar(
            "SELECT changed_at FROM status_history
             WHERE reference_number = ? ORDER BY changed_at DESC LIMIT 1",
        )
        .bind(&reference)
        .fetch_optional(&mut *conn)
        .await?;

        let since = match parse_ts(last_change) {
            Some(changed) => Some(changed),
            None => {
                let first_seen: Option<String> = sqlx::query_scalar(
                    "SELECT first_seen_at FROM postings WHERE reference = ?",
                )
                .bind(&reference)
                .fetch_optional(&mut *conn)
                .await?;
                parse_ts(first_seen)
            }
        };
        let days_in_previous = since.map(|from| (now - from).num_days());

        sqlx::query(
            "INSERT INTO status_history
             (reference_number, old_status, new_status, changed_at,
              days_in_previous_status, close_date, awarded_on)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&reference)
        .bind(old_status)
        .bind(new_status)
        .bind(ts(now))
        .bind(days_in_previous)
        .bind(close_date.map(ts))
        .bind(awarded_on.map(ts))
        .execute(conn)
        .await
        .context("appending status transition")?;
        Ok(())
    }

    /// Append one scrape attempt. The log is append-only and deliberately
    /// carries no uniqueness constraint on (year, posting_number).
    pub async fn append_attempt(
        conn: &mut SqliteConnection,
        attempt: &ScrapeAttempt,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO scrape_log
             (year, posting_number, reference_number, success, error_message,
              http_status_code, attempted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.year)
        .bind(attempt.number as i64)
        .bind(&attempt.reference)
        .bind(attempt.success)
        .bind(&attempt.error_message)
        .bind(attempt.http_status.map(|s| s as i64))
        .bind(ts(attempt.attempted_at))
        .execute(conn)
        .await
        .context("appending scrape attempt")?;
        Ok(())
    }

    /// Standalone attempt append in its own transaction, for outcomes that
    /// touch nothing else (transient failures, unknown keys).
    pub async fn record_attempt(&self, attempt: &ScrapeAttempt) -> Result<()> {
        let mut tx = self.begin().await?;
        Self::append_attempt(&mut tx, attempt).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Handle a confirmed absence: preserve every stored field, overlay the
    /// archival flag (write-once `archived_at`), advance tracking, and log
    /// the preserved-on-absence attempt. One transaction.
    ///
    /// Returns true when this call newly archived the posting.
    pub async fn mark_absent(&self, key: PostingRef, now: DateTime<Utc>) -> Result<bool> {
        let already_archived: Option<bool> = sqlx::query_scalar(
            "SELECT is_archived FROM postings WHERE year = ? AND posting_number = ?",
        )
        .bind(key.year)
        .bind(key.number as i64)
        .fetch_optional(&self.pool)
        .await?;
        let Some(already_archived) = already_archived else {
            bail!("posting {key} not in store");
        };

        let mut tx = self.begin().await?;
        sqlx::query(
            "UPDATE postings
             SET is_archived = 1,
                 archived_at = COALESCE(archived_at, ?),
                 last_checked_at = ?,
                 check_count = check_count + 1
             WHERE year = ? AND posting_number = ?",
        )
        .bind(ts(now))
        .bind(ts(now))
        .bind(key.year)
        .bind(key.number as i64)
        .execute(&mut *tx)
        .await
        .context("marking posting archived")?;

        Self::append_attempt(
            &mut tx,
            &ScrapeAttempt {
                year: key.year,
                number: key.number,
                reference: Some(key.to_string()),
                success: true,
                error_message: Some(
                    "Preserved historical data - posting removed from source".to_string(),
                ),
                http_status: Some(404),
                attempted_at: now,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(!already_archived)
    }
}

fn candidate(row: &sqlx::sqlite::SqliteRow, days_since_close: Option<i64>) -> TierCandidate {
    TierCandidate {
        reference: PostingRef::new(
            row.get::<i64, _>("year") as i32,
            row.get::<i64, _>("posting_number") as u32,
        ),
        days_since_close,
    }
}

/// Schema history, mirroring how the store actually evolved: the base
/// tables, then re-check tracking, then the archival overlay.
fn migrations() -> Vec<(i64, Vec<&'static str>)> {
    vec![
        (
            1,
            vec![
                "CREATE TABLE postings (
                    reference TEXT PRIMARY KEY,
                    year INTEGER NOT NULL,
                    posting_number INTEGER NOT NULL,
                    short_title TEXT,
                    full_title TEXT,
                    description TEXT,
                    solicitation_number TEXT,
                    status_code TEXT NOT NULL,
                    category_code TEXT,
                    solicitation_type TEXT,
                    posting_type TEXT,
                    region TEXT,
                    post_date TEXT,
                    close_date TEXT,
                    delivery_start_date TEXT,
                    delivery_end_date TEXT,
                    awarded_on TEXT,
                    cancelled_on TEXT,
                    estimated_value REAL,
                    actual_value REAL,
                    amendment_number INTEGER NOT NULL DEFAULT 0,
                    num_interested_suppliers INTEGER NOT NULL DEFAULT 0,
                    num_bidders INTEGER NOT NULL DEFAULT 0,
                    num_documents INTEGER NOT NULL DEFAULT 0,
                    first_seen_at TEXT NOT NULL,
                    UNIQUE(year, posting_number)
                )",
                "CREATE TABLE raw_payloads (
                    reference TEXT PRIMARY KEY,
                    year INTEGER NOT NULL,
                    posting_number INTEGER NOT NULL,
                    json_data TEXT NOT NULL,
                    sha256 TEXT NOT NULL,
                    fetched_at TEXT NOT NULL,
                    UNIQUE(year, posting_number)
                )",
                "CREATE TABLE bids (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    opportunity_ref TEXT NOT NULL,
                    company_name TEXT NOT NULL,
                    supplier_id TEXT,
                    city TEXT,
                    province TEXT,
                    bid_amount REAL,
                    is_winner INTEGER NOT NULL DEFAULT 0,
                    FOREIGN KEY (opportunity_ref) REFERENCES postings(reference)
                )",
                "CREATE TABLE awards (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    opportunity_ref TEXT NOT NULL,
                    winner_name TEXT,
                    supplier_id TEXT,
                    award_amount REAL,
                    award_date TEXT,
                    city TEXT,
                    province TEXT,
                    country TEXT,
                    FOREIGN KEY (opportunity_ref) REFERENCES postings(reference)
                )",
                "CREATE TABLE interested_suppliers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    opportunity_ref TEXT NOT NULL,
                    supplier_id TEXT,
                    business_name TEXT NOT NULL,
                    description TEXT,
                    city TEXT,
                    province TEXT,
                    country TEXT,
                    FOREIGN KEY (opportunity_ref) REFERENCES postings(reference)
                )",
                "CREATE TABLE documents (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    opportunity_ref TEXT NOT NULL,
                    document_id TEXT,
                    filename TEXT,
                    title TEXT,
                    type_code TEXT,
                    mime_type TEXT,
                    size_bytes INTEGER,
                    amendment_number INTEGER NOT NULL DEFAULT 0,
                    uploaded_on TEXT,
                    FOREIGN KEY (opportunity_ref) REFERENCES postings(reference)
                )",
                "CREATE TABLE contacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    opportunity_ref TEXT NOT NULL,
                    first_name TEXT,
                    last_name TEXT,
                    email TEXT,
                    phone_number TEXT,
                    city TEXT,
                    province TEXT,
                    FOREIGN KEY (opportunity_ref) REFERENCES postings(reference)
                )",
                // No uniqueness on (year, posting_number): re-scraping writes
                // many attempts against the same key.
                "CREATE TABLE scrape_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    year INTEGER NOT NULL,
                    posting_number INTEGER NOT NULL,
                    reference_number TEXT,
                    success INTEGER NOT NULL,
                    error_message TEXT,
                    http_status_code INTEGER,
                    attempted_at TEXT NOT NULL
                )",
                "CREATE INDEX idx_postings_year ON postings(year)",
                "CREATE INDEX idx_postings_status ON postings(status_code)",
                "CREATE INDEX idx_bids_opp ON bids(opportunity_ref)",
                "CREATE INDEX idx_awards_opp ON awards(opportunity_ref)",
                "CREATE INDEX idx_interested_opp ON interested_suppliers(opportunity_ref)",
                "CREATE INDEX idx_docs_opp ON documents(opportunity_ref)",
                "CREATE INDEX idx_scrape_key ON scrape_log(year, posting_number)",
                "CREATE INDEX idx_scrape_reference ON scrape_log(reference_number)",
            ],
        ),
        (
            2,
            vec![
                "ALTER TABLE postings ADD COLUMN last_checked_at TEXT",
                "ALTER TABLE postings ADD COLUMN check_count INTEGER NOT NULL DEFAULT 0",
                "ALTER TABLE postings ADD COLUMN previous_status TEXT",
                "CREATE TABLE status_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    reference_number TEXT NOT NULL,
                    old_status TEXT,
                    new_status TEXT NOT NULL,
                    changed_at TEXT NOT NULL,
                    days_in_previous_status INTEGER,
                    close_date TEXT,
                    awarded_on TEXT,
                    FOREIGN KEY (reference_number) REFERENCES postings(reference)
                )",
                "CREATE INDEX idx_status_award ON postings(status_code, awarded_on)",
                "CREATE INDEX idx_last_checked ON postings(last_checked_at)",
                "CREATE INDEX idx_close_date ON postings(close_date)",
                "CREATE INDEX idx_history_reference ON status_history(reference_number)",
            ],
        ),
        (
            3,
            vec![
                "ALTER TABLE postings ADD COLUMN is_archived INTEGER NOT NULL DEFAULT 0",
                "ALTER TABLE postings ADD COLUMN archived_at TEXT",
                "CREATE INDEX idx_archived ON postings(is_archived, archived_at)",
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use apc_core::SourceDocument;

    async fn test_store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn document(reference: &str, status: &str, awarded_on: Option<&str>) -> SourceDocument {
        serde_json::from_value(serde_json::json!({
            "opportunity": {
                "referenceNumber": reference,
                "shortTitle": "Gravel haul contract",
                "statusCode": status,
                "categoryCode": "CNST",
                "closeDateTime": "2025-02-01T17:00:00Z",
                "awardedOnUtc": awarded_on,
                "estimatedValue": 500000.0
            },
            "bidders": [
                { "alternativeSupplierDisplayName": "Foothills Aggregate",
                  "bidAmounts": [ { "amount": 480000.0 } ] }
            ],
            "awards": []
        }))
        .unwrap()
    }

    async fn ingest(store: &Store, key: PostingRef, doc: &SourceDocument, now: DateTime<Utc>) {
        let normalized = doc.normalize(key, now);
        let raw = serde_json::to_string(doc).unwrap();
        let mut tx = store.begin().await.unwrap();
        Store::upsert_posting(&mut tx, &normalized, &raw).await.unwrap();
        Store::touch_tracking(&mut tx, key, None, now).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), 0);
        assert_eq!(store.migrate().await.unwrap(), 3);
        assert_eq!(store.schema_version().await.unwrap(), LATEST_SCHEMA_VERSION);
        assert_eq!(store.migrate().await.unwrap(), 0);
        assert!(store.require_current_schema().await.is_ok());
    }

    #[tokio::test]
    async fn unmigrated_store_fails_schema_gate() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.require_current_schema().await.is_err());
    }

    #[tokio::test]
    async fn ingestion_is_idempotent_except_tracking() {
        let store = test_store().await;
        let key = PostingRef::new(2025, 42);
        let doc = document("AB-2025-00042", "OPEN", None);
        let now = Utc::now();

        ingest(&store, key, &doc, now).await;
        let first = store.get_posting(key).await.unwrap().unwrap();
        assert_eq!(first.check_count, 1);

        ingest(&store, key, &doc, now + Duration::seconds(10)).await;
        let second = store.get_posting(key).await.unwrap().unwrap();

        assert_eq!(second.check_count, 2);
        assert!(second.last_checked_at > first.last_checked_at);
        assert_eq!(second.first_seen_at, first.first_seen_at);
        assert_eq!(second.short_title, first.short_title);
        assert_eq!(second.status, first.status);
        assert_eq!(second.estimated_value, first.estimated_value);

        // Children replaced, not duplicated.
        let bids: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bids")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(bids, 1);
    }

    #[tokio::test]
    async fn absence_preserves_everything_and_archives_once() {
        let store = test_store().await;
        let key = PostingRef::new(2025, 281);
        let doc = document("AB-2025-00281", "CLOSED", None);
        let now = Utc::now();
        ingest(&store, key, &doc, now).await;

        let newly = store.mark_absent(key, now + Duration::days(1)).await.unwrap();
        assert!(newly);
        let after_first = store.get_posting(key).await.unwrap().unwrap();
        assert!(after_first.archived);
        assert!(after_first.archived_at.is_some());
        assert_eq!(after_first.short_title.as_deref(), Some("Gravel haul contract"));
        assert_eq!(after_first.check_count, 2);

        let newly = store.mark_absent(key, now + Duration::days(2)).await.unwrap();
        assert!(!newly);
        let after_second = store.get_posting(key).await.unwrap().unwrap();
        // Write-once timestamp, tracking still advances.
        assert_eq!(after_second.archived_at, after_first.archived_at);
        assert_eq!(after_second.check_count, 3);

        let attempts = store.attempts_for(key).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| a.http_status == Some(404) && a.success));
    }

    #[tokio::test]
    async fn scrape_log_accepts_repeated_keys() {
        let store = test_store().await;
        let attempt = ScrapeAttempt {
            year: 2025,
            number: 7,
            reference: None,
            success: false,
            error_message: Some("HTTP 503: Service Unavailable".to_string()),
            http_status: Some(503),
            attempted_at: Utc::now(),
        };
        store.record_attempt(&attempt).await.unwrap();
        store.record_attempt(&attempt).await.unwrap();
        assert_eq!(
            store.attempts_for(PostingRef::new(2025, 7)).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn transition_days_come_from_last_change_or_first_seen() {
        let store = test_store().await;
        let key = PostingRef::new(2025, 9);
        let doc = document("AB-2025-00009", "OPEN", None);
        let start = Utc::now() - Duration::days(20);
        ingest(&store, key, &doc, start).await;

        let mut tx = store.begin().await.unwrap();
        Store::append_transition(&mut tx, key, Some("OPEN"), "CLOSED", None, None, start + Duration::days(14))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        Store::append_transition(&mut tx, key, Some("CLOSED"), "AWARD", None, None, start + Duration::days(19))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let transitions = store.transitions_for(key).await.unwrap();
        assert_eq!(transitions.len(), 2);
        // First change measured from first observation, second from the first change.
        assert_eq!(transitions[0].days_in_previous_status, Some(14));
        assert_eq!(transitions[1].days_in_previous_status, Some(5));
    }

    #[tokio::test]
    async fn tier_queries_partition_by_status_and_windows() {
        let store = test_store().await;
        let now = Utc::now();

        let specs: Vec<(u32, &str, Option<i64>, Option<i64>, i64)> = vec![
            // (number, status, days since close, days since award, checks)
            (1, "OPEN", None, None, 1),
            (2, "CLOSED", Some(10), None, 1),
            (3, "CLOSED", Some(100), None, 1),
            (4, "EVALUATION", Some(400), None, 1),
            (5, "AWARD", Some(30), Some(20), 1),
            (6, "AWARD", Some(200), Some(150), 1),
            (7, "CANCELLED", None, None, 1),
        ];
        for (number, status, closed_ago, awarded_ago, _) in &specs {
            let key = PostingRef::new(2025, *number);
            let mut doc = document(&key.to_string(), status, None);
            doc.opportunity.close_date_time =
                closed_ago.map(|d| (now - Duration::days(d)).to_rfc3339());
            doc.opportunity.awarded_on_utc =
                awarded_ago.map(|d| (now - Duration::days(d)).to_rfc3339());
            ingest(&store, key, &doc, now).await;
        }

        let tier1 = store.tier1_candidates().await.unwrap();
        assert_eq!(tier1.len(), 1);
        assert_eq!(tier1[0].reference.number, 1);

        let tier2 = store.tier2_candidates(now, 60).await.unwrap();
        assert_eq!(tier2.len(), 1);
        assert_eq!(tier2[0].reference.number, 2);

        // Tier 3: both CLOSED postings plus the 400-day-old EVALUATION one;
        // age alone never excludes a pending award.
        let tier3 = store.tier3_candidates(now).await.unwrap();
        let numbers: Vec<u32> = tier3.iter().map(|c| c.reference.number).collect();
        assert_eq!(numbers, vec![2, 3, 4]);
        assert_eq!(tier3[2].days_since_close, Some(400));

        let tier4 = store.tier4_candidates(now, 90).await.unwrap();
        assert_eq!(tier4.len(), 1);
        assert_eq!(tier4[0].reference.number, 5);
    }

    #[tokio::test]
    async fn tier4_excludes_rechecked_awards() {
        let store = test_store().await;
        let now = Utc::now();
        let key = PostingRef::new(2025, 5);
        let mut doc = document(&key.to_string(), "AWARD", None);
        doc.opportunity.awarded_on_utc = Some((now - Duration::days(20)).to_rfc3339());
        ingest(&store, key, &doc, now).await;
        assert_eq!(store.tier4_candidates(now, 90).await.unwrap().len(), 1);

        // Second check bumps check_count to 2; the one-time verification is done.
        ingest(&store, key, &doc, now).await;
        assert!(store.tier4_candidates(now, 90).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn highest_posting_number_tracks_per_year() {
        let store = test_store().await;
        let now = Utc::now();
        assert_eq!(store.highest_posting_number(2025).await.unwrap(), None);
        for number in [3, 17, 9] {
            let key = PostingRef::new(2025, number);
            ingest(&store, key, &document(&key.to_string(), "OPEN", None), now).await;
        }
        assert_eq!(store.highest_posting_number(2025).await.unwrap(), Some(17));
        assert_eq!(store.highest_posting_number(2024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stats_count_tables_and_statuses() {
        let store = test_store().await;
        let now = Utc::now();
        let key = PostingRef::new(2025, 1);
        ingest(&store, key, &document(&key.to_string(), "OPEN", None), now).await;
        store.mark_absent(key, now).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.postings, 1);
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.bids, 1);
        assert_eq!(stats.scrape_attempts, 1);
        assert_eq!(stats.by_status, vec![("OPEN".to_string(), 1)]);
    }
}
