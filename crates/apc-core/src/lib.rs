//! Core domain model for APC Watch: posting keys, lifecycle status,
//! canonical records, audit entries, and source payload documents.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "apc-core";

/// Immutable key of a posting: the (year, sequence number) pair behind a
/// reference identifier such as `AB-2025-04058`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostingRef {
    pub year: i32,
    pub number: u32,
}

#[derive(Debug, Error)]
pub enum RefParseError {
    #[error("malformed reference `{0}`: expected AB-<year>-<number>")]
    Malformed(String),
}

impl PostingRef {
    pub fn new(year: i32, number: u32) -> Self {
        Self { year, number }
    }

    pub fn parse(reference: &str) -> Result<Self, RefParseError> {
        let mut parts = reference.splitn(3, '-');
        let prefix = parts.next().unwrap_or_default();
        let year = parts.next().and_then(|p| p.parse::<i32>().ok());
        let number = parts.next().and_then(|p| p.parse::<u32>().ok());
        match (prefix, year, number) {
            ("AB", Some(year), Some(number)) => Ok(Self { year, number }),
            _ => Err(RefParseError::Malformed(reference.to_string())),
        }
    }
}

impl std::fmt::Display for PostingRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AB-{}-{:05}", self.year, self.number)
    }
}

/// Lifecycle status of a posting. Unknown codes are carried verbatim in
/// `Other` so nothing reported by the source is ever dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostingStatus {
    Open,
    Closed,
    Evaluation,
    Award,
    Cancelled,
    Other(String),
}

impl PostingStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "OPEN" => Self::Open,
            "CLOSED" => Self::Closed,
            "EVALUATION" => Self::Evaluation,
            "AWARD" => Self::Award,
            "CANCELLED" => Self::Cancelled,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Evaluation => "EVALUATION",
            Self::Award => "AWARD",
            Self::Cancelled => "CANCELLED",
            Self::Other(code) => code,
        }
    }
}

impl std::fmt::Display for PostingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Canonical posting record as held in the store. Tracking fields
/// (`last_checked_at`, `check_count`, `previous_status`) and the archival
/// overlay are owned by the reconciliation engine, not by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingRecord {
    pub reference: PostingRef,
    pub short_title: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub solicitation_number: Option<String>,
    pub status: PostingStatus,
    pub category: Option<String>,
    pub solicitation_type: Option<String>,
    pub posting_type: Option<String>,
    pub region: Option<String>,
    pub post_date: Option<DateTime<Utc>>,
    pub close_date: Option<DateTime<Utc>>,
    pub delivery_start_date: Option<DateTime<Utc>>,
    pub delivery_end_date: Option<DateTime<Utc>>,
    pub awarded_on: Option<DateTime<Utc>>,
    pub cancelled_on: Option<DateTime<Utc>>,
    pub estimated_value: Option<f64>,
    pub actual_value: Option<f64>,
    pub amendment_number: i64,
    pub num_interested_suppliers: i64,
    pub num_bidders: i64,
    pub num_documents: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
    pub check_count: i64,
    pub previous_status: Option<String>,
    pub archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
}

/// One bid per competing party per posting. At most one row per posting may
/// carry the winner flag, and only when an award exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidRecord {
    pub company_name: String,
    pub supplier_id: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub bid_amount: Option<f64>,
    pub is_winner: bool,
}

/// Award outcome. Modeled as a list on the posting: the source has only ever
/// shown one, but amendments are undocumented, so extras are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwardRecord {
    pub winner_name: Option<String>,
    pub supplier_id: Option<String>,
    pub award_amount: Option<f64>,
    pub award_date: Option<DateTime<Utc>>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub country: Option<String>,
}

impl AwardRecord {
    /// An award with both a named winner and an amount; the multiplicity
    /// warning only fires when more than one of these is present.
    pub fn is_fully_populated(&self) -> bool {
        self.winner_name.is_some() && self.award_amount.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterestedSupplierRecord {
    pub supplier_id: Option<String>,
    pub business_name: String,
    pub description: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: Option<String>,
    pub filename: Option<String>,
    pub title: Option<String>,
    pub type_code: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub amendment_number: i64,
    pub uploaded_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
}

/// Append-only audit entry for a detected lifecycle change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub reference: PostingRef,
    pub old_status: Option<String>,
    pub new_status: String,
    pub changed_at: DateTime<Utc>,
    pub days_in_previous_status: Option<i64>,
    pub close_date: Option<DateTime<Utc>>,
    pub awarded_on: Option<DateTime<Utc>>,
}

/// Append-only audit entry for every fetch attempt, success or not.
/// Multiple rows per key are expected: this is re-scraping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeAttempt {
    pub year: i32,
    pub number: u32,
    pub reference: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub http_status: Option<u16>,
    pub attempted_at: DateTime<Utc>,
}

/// Outcome of a single fetch against the source system. Distinguishing
/// `NotFound` from `Transient` is load-bearing: only a definitive absence
/// signal may trigger archival.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(SourceDocument),
    NotFound,
    Transient(TransientError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransientError {
    pub http_status: Option<u16>,
    pub detail: String,
}

impl std::fmt::Display for TransientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.http_status {
            Some(status) => write!(f, "HTTP {status}: {}", self.detail),
            None => f.write_str(&self.detail),
        }
    }
}

// ---------------------------------------------------------------------------
// Source payload documents

/// Full payload returned by the source for one posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    pub opportunity: SourceOpportunity,
    #[serde(default)]
    pub bidders: Vec<SourceBidder>,
    #[serde(default)]
    pub awards: Vec<SourceAward>,
    #[serde(default)]
    pub interested_suppliers: Vec<SourceSupplier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceOpportunity {
    pub reference_number: String,
    pub short_title: Option<String>,
    pub title: Option<String>,
    pub project_description: Option<String>,
    pub solicitation_number: Option<String>,
    pub status_code: Option<String>,
    pub category_code: Option<String>,
    pub solicitation_type_code: Option<String>,
    pub posting_type_code: Option<String>,
    pub region_of_delivery: Option<String>,
    pub post_date_time: Option<String>,
    pub close_date_time: Option<String>,
    pub delivery_start_date: Option<String>,
    pub delivery_end_date: Option<String>,
    pub awarded_on_utc: Option<String>,
    pub cancelled_on_utc: Option<String>,
    pub estimated_value: Option<f64>,
    pub actual_value: Option<f64>,
    pub amendment_number: Option<i64>,
    #[serde(default)]
    pub documents: Vec<SourceDocumentMeta>,
    pub contact_information: Option<SourceContact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceBidder {
    pub alternative_supplier_display_name: Option<String>,
    pub supplier_id: Option<String>,
    pub address: Option<SourceAddress>,
    #[serde(default)]
    pub bid_amounts: Vec<SourceBidAmount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceBidAmount {
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceAward {
    pub alternative_supplier_display_name: Option<String>,
    pub supplier_id: Option<String>,
    pub amount: Option<f64>,
    pub award_date: Option<String>,
    pub address: Option<SourceAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceSupplier {
    pub supplier_id: Option<String>,
    pub business_name: Option<String>,
    #[serde(default)]
    pub description: Vec<String>,
    pub physical_address: Option<SourceAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceAddress {
    pub address_line1: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceDocumentMeta {
    pub id: Option<String>,
    pub filename: Option<String>,
    pub title: Option<String>,
    pub type_code: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
    pub amendment_number: Option<i64>,
    pub uploaded_on_utc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceContact {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email_address: Option<String>,
    pub phone_number: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
}

/// Source timestamps arrive in several shapes; anything unparseable becomes
/// `None` rather than failing ingestion of the whole posting.
pub fn parse_source_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt));
    }
    None
}

fn parse_opt_datetime(raw: &Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().and_then(parse_source_datetime)
}

/// Normalized form of one posting ready for atomic replacement in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPosting {
    pub record: PostingRecord,
    pub bids: Vec<BidRecord>,
    pub awards: Vec<AwardRecord>,
    pub interested_suppliers: Vec<InterestedSupplierRecord>,
    pub documents: Vec<DocumentRecord>,
    pub contact: Option<ContactRecord>,
}

impl NormalizedPosting {
    pub fn fully_populated_awards(&self) -> usize {
        self.awards.iter().filter(|a| a.is_fully_populated()).count()
    }
}

impl SourceDocument {
    /// Extract the canonical record plus all sub-records from a payload.
    ///
    /// Pure field extraction: tracking fields are seeded with `now` and a
    /// zero check count, and the store preserves its own values for them on
    /// conflict. The winner flag on a bid is derived by matching the award's
    /// party name, as the source carries no explicit winner marker on bids.
    pub fn normalize(&self, key: PostingRef, now: DateTime<Utc>) -> NormalizedPosting {
        let opp = &self.opportunity;

        let awards: Vec<AwardRecord> = self
            .awards
            .iter()
            .map(|a| AwardRecord {
                winner_name: a.alternative_supplier_display_name.clone(),
                supplier_id: a.supplier_id.clone(),
                award_amount: a.amount,
                award_date: parse_opt_datetime(&a.award_date),
                city: a.address.as_ref().and_then(|ad| ad.city.clone()),
                province: a.address.as_ref().and_then(|ad| ad.province.clone()),
                country: a.address.as_ref().and_then(|ad| ad.country.clone()),
            })
            .collect();

        let winner_name = awards.first().and_then(|a| a.winner_name.clone());

        let bids: Vec<BidRecord> = self
            .bidders
            .iter()
            .filter_map(|b| {
                let company_name = b.alternative_supplier_display_name.clone()?;
                let is_winner = winner_name
                    .as_deref()
                    .is_some_and(|winner| winner == company_name);
                Some(BidRecord {
                    company_name,
                    supplier_id: b.supplier_id.clone(),
                    city: b.address.as_ref().and_then(|ad| ad.city.clone()),
                    province: b.address.as_ref().and_then(|ad| ad.province.clone()),
                    bid_amount: b.bid_amounts.first().and_then(|ba| ba.amount),
                    is_winner,
                })
            })
            .collect();

        let interested_suppliers: Vec<InterestedSupplierRecord> = self
            .interested_suppliers
            .iter()
            .filter_map(|s| {
                let business_name = s.business_name.clone()?;
                Some(InterestedSupplierRecord {
                    supplier_id: s.supplier_id.clone(),
                    business_name,
                    description: if s.description.is_empty() {
                        None
                    } else {
                        Some(s.description.join(", "))
                    },
                    city: s.physical_address.as_ref().and_then(|a| a.city.clone()),
                    province: s.physical_address.as_ref().and_then(|a| a.province.clone()),
                    country: s.physical_address.as_ref().and_then(|a| a.country.clone()),
                })
            })
            .collect();

        let documents: Vec<DocumentRecord> = opp
            .documents
            .iter()
            .map(|d| DocumentRecord {
                document_id: d.id.clone(),
                filename: d.filename.clone(),
                title: d.title.clone(),
                type_code: d.type_code.clone(),
                mime_type: d.mime_type.clone(),
                size_bytes: d.size,
                amendment_number: d.amendment_number.unwrap_or(0),
                uploaded_on: parse_opt_datetime(&d.uploaded_on_utc),
            })
            .collect();

        let contact = opp.contact_information.as_ref().map(|c| ContactRecord {
            first_name: c.first_name.clone(),
            last_name: c.last_name.clone(),
            email: c.email_address.clone(),
            phone_number: c.phone_number.clone(),
            city: c.city.clone(),
            province: c.province.clone(),
        });

        let record = PostingRecord {
            reference: key,
            short_title: opp.short_title.clone(),
            title: opp.title.clone(),
            description: opp.project_description.clone(),
            solicitation_number: opp.solicitation_number.clone(),
            status: PostingStatus::from_code(opp.status_code.as_deref().unwrap_or("UNKNOWN")),
            category: opp.category_code.clone(),
            solicitation_type: opp.solicitation_type_code.clone(),
            posting_type: opp.posting_type_code.clone(),
            region: opp.region_of_delivery.clone(),
            post_date: parse_opt_datetime(&opp.post_date_time),
            close_date: parse_opt_datetime(&opp.close_date_time),
            delivery_start_date: parse_opt_datetime(&opp.delivery_start_date),
            delivery_end_date: parse_opt_datetime(&opp.delivery_end_date),
            awarded_on: parse_opt_datetime(&opp.awarded_on_utc),
            cancelled_on: parse_opt_datetime(&opp.cancelled_on_utc),
            estimated_value: opp.estimated_value,
            actual_value: opp.actual_value,
            amendment_number: opp.amendment_number.unwrap_or(0),
            num_interested_suppliers: interested_suppliers.len() as i64,
            num_bidders: bids.len() as i64,
            num_documents: documents.len() as i64,
            first_seen_at: now,
            last_checked_at: now,
            check_count: 0,
            previous_status: None,
            archived: false,
            archived_at: None,
        };

        NormalizedPosting {
            record,
            bids,
            awards,
            interested_suppliers,
            documents,
            contact,
        }
    }
}
