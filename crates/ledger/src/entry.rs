use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use contentforge_core::{AgencyId, JobId, ReservationId};

/// Tokens added to an agency's available balance (top-up / grant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokensCredited {
    pub agency_id: AgencyId,
    pub amount: u64,
    pub balance_after: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Tokens withheld from the available balance for a reservation.
///
/// Also emitted when a commit overruns its reservation and the excess is
/// reserved on the spot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokensReserved {
    pub agency_id: AgencyId,
    pub reservation_id: ReservationId,
    pub job_id: Option<JobId>,
    pub amount: u64,
    pub balance_after: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Reserved tokens converted into recorded consumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokensCommitted {
    pub agency_id: AgencyId,
    pub reservation_id: ReservationId,
    pub job_id: Option<JobId>,
    pub amount: u64,
    /// Portion of `amount` reserved on the spot because it exceeded the hold.
    pub extended_by: u64,
    pub idempotency_key: String,
    pub balance_after: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Unused reserved tokens returned to the available balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokensRefunded {
    pub agency_id: AgencyId,
    pub reservation_id: ReservationId,
    pub job_id: Option<JobId>,
    pub amount: u64,
    pub balance_after: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Credit,
    Reserve,
    Commit,
    Refund,
}

/// One balance-affecting ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEntry {
    Credited(TokensCredited),
    Reserved(TokensReserved),
    Committed(TokensCommitted),
    Refunded(TokensRefunded),
}

impl LedgerEntry {
    pub fn event_type(&self) -> &'static str {
        match self {
            LedgerEntry::Credited(_) => "ledger.tokens.credited",
            LedgerEntry::Reserved(_) => "ledger.tokens.reserved",
            LedgerEntry::Committed(_) => "ledger.tokens.committed",
            LedgerEntry::Refunded(_) => "ledger.tokens.refunded",
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            LedgerEntry::Credited(_) => EntryKind::Credit,
            LedgerEntry::Reserved(_) => EntryKind::Reserve,
            LedgerEntry::Committed(_) => EntryKind::Commit,
            LedgerEntry::Refunded(_) => EntryKind::Refund,
        }
    }

    pub fn amount(&self) -> u64 {
        match self {
            LedgerEntry::Credited(e) => e.amount,
            LedgerEntry::Reserved(e) => e.amount,
            LedgerEntry::Committed(e) => e.amount,
            LedgerEntry::Refunded(e) => e.amount,
        }
    }

    /// Signed effect on the available balance.
    ///
    /// Commits move tokens that were already withheld, so their delta is zero.
    pub fn balance_delta(&self) -> i128 {
        match self {
            LedgerEntry::Credited(e) => i128::from(e.amount),
            LedgerEntry::Reserved(e) => -i128::from(e.amount),
            LedgerEntry::Committed(_) => 0,
            LedgerEntry::Refunded(e) => i128::from(e.amount),
        }
    }

    pub fn balance_after(&self) -> u64 {
        match self {
            LedgerEntry::Credited(e) => e.balance_after,
            LedgerEntry::Reserved(e) => e.balance_after,
            LedgerEntry::Committed(e) => e.balance_after,
            LedgerEntry::Refunded(e) => e.balance_after,
        }
    }

    pub fn agency_id(&self) -> AgencyId {
        match self {
            LedgerEntry::Credited(e) => e.agency_id,
            LedgerEntry::Reserved(e) => e.agency_id,
            LedgerEntry::Committed(e) => e.agency_id,
            LedgerEntry::Refunded(e) => e.agency_id,
        }
    }

    pub fn reservation_id(&self) -> Option<ReservationId> {
        match self {
            LedgerEntry::Credited(_) => None,
            LedgerEntry::Reserved(e) => Some(e.reservation_id),
            LedgerEntry::Committed(e) => Some(e.reservation_id),
            LedgerEntry::Refunded(e) => Some(e.reservation_id),
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            LedgerEntry::Credited(_) => None,
            LedgerEntry::Reserved(e) => e.job_id,
            LedgerEntry::Committed(e) => e.job_id,
            LedgerEntry::Refunded(e) => e.job_id,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEntry::Credited(e) => e.occurred_at,
            LedgerEntry::Reserved(e) => e.occurred_at,
            LedgerEntry::Committed(e) => e.occurred_at,
            LedgerEntry::Refunded(e) => e.occurred_at,
        }
    }
}
