use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use contentforge_core::{Aggregate, AggregateRoot, AgencyId, JobId, ReservationId};

use crate::entry::{LedgerEntry, TokensCommitted, TokensCredited, TokensRefunded, TokensReserved};

/// A hold on part of an agency's balance.
///
/// `committed + refunded <= reserved` always holds; the difference is what is
/// still withheld from the available balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub agency_id: AgencyId,
    pub job_id: Option<JobId>,
    pub reserved: u64,
    pub committed: u64,
    pub refunded: u64,
    pub created_at: DateTime<Utc>,
    receipts: HashMap<String, CommitReceipt>,
}

impl Reservation {
    pub fn remaining(&self) -> u64 {
        self.reserved - self.committed - self.refunded
    }

    pub fn is_settled(&self) -> bool {
        self.remaining() == 0
    }

    /// Receipt of an earlier commit made with `idempotency_key`.
    pub fn receipt(&self, idempotency_key: &str) -> Option<&CommitReceipt> {
        self.receipts.get(idempotency_key)
    }
}

/// Outcome of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub reservation_id: ReservationId,
    pub amount: u64,
    /// Tokens reserved on the spot because the commit overran the hold.
    pub extended_by: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerCommand {
    Credit {
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
    Reserve {
        reservation_id: ReservationId,
        job_id: Option<JobId>,
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
    Commit {
        reservation_id: ReservationId,
        amount: u64,
        idempotency_key: String,
        occurred_at: DateTime<Utc>,
    },
    Refund {
        reservation_id: ReservationId,
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: u64, available: u64 },

    #[error("commit exceeds reservation {reservation_id} by {excess} tokens (available {available})")]
    ExceedsReservation {
        reservation_id: ReservationId,
        excess: u64,
        available: u64,
    },

    #[error("unknown reservation: {0}")]
    UnknownReservation(ReservationId),

    #[error("reservation already exists: {0}")]
    DuplicateReservation(ReservationId),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// Aggregate root: one agency's token account.
///
/// Holds the available balance (credits minus outstanding holds and commits)
/// and every reservation made against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAccount {
    agency_id: AgencyId,
    available: u64,
    reservations: HashMap<ReservationId, Reservation>,
    version: u64,
}

impl TokenAccount {
    pub fn empty(agency_id: AgencyId) -> Self {
        Self {
            agency_id,
            available: 0,
            reservations: HashMap::new(),
            version: 0,
        }
    }

    pub fn agency_id(&self) -> AgencyId {
        self.agency_id
    }

    pub fn available(&self) -> u64 {
        self.available
    }

    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.get(&id)
    }

    fn require_reservation(&self, id: ReservationId) -> Result<&Reservation, LedgerError> {
        self.reservations
            .get(&id)
            .ok_or(LedgerError::UnknownReservation(id))
    }

    fn handle_credit(&self, amount: u64, occurred_at: DateTime<Utc>) -> Result<Vec<LedgerEntry>, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount("credit must be positive".to_string()));
        }
        let balance_after = self
            .available
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvalidAmount("balance overflow".to_string()))?;

        Ok(vec![LedgerEntry::Credited(TokensCredited {
            agency_id: self.agency_id,
            amount,
            balance_after,
            occurred_at,
        })])
    }

    fn handle_reserve(
        &self,
        reservation_id: ReservationId,
        job_id: Option<JobId>,
        amount: u64,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount("reservation must be positive".to_string()));
        }
        if self.reservations.contains_key(&reservation_id) {
            return Err(LedgerError::DuplicateReservation(reservation_id));
        }
        if amount > self.available {
            return Err(LedgerError::InsufficientBalance {
                requested: amount,
                available: self.available,
            });
        }

        Ok(vec![LedgerEntry::Reserved(TokensReserved {
            agency_id: self.agency_id,
            reservation_id,
            job_id,
            amount,
            balance_after: self.available - amount,
            occurred_at,
        })])
    }

    fn handle_commit(
        &self,
        reservation_id: ReservationId,
        amount: u64,
        idempotency_key: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let reservation = self.require_reservation(reservation_id)?;
        if reservation.receipt(idempotency_key).is_some() {
            return Ok(Vec::new());
        }

        let remaining = reservation.remaining();
        let mut entries = Vec::with_capacity(2);
        let mut balance_after = self.available;
        let mut extended_by = 0;

        if amount > remaining {
            // Over-generation is paid from the available balance or not at all.
            let excess = amount - remaining;
            if excess > self.available {
                return Err(LedgerError::ExceedsReservation {
                    reservation_id,
                    excess,
                    available: self.available,
                });
            }
            balance_after -= excess;
            extended_by = excess;
            entries.push(LedgerEntry::Reserved(TokensReserved {
                agency_id: self.agency_id,
                reservation_id,
                job_id: reservation.job_id,
                amount: excess,
                balance_after,
                occurred_at,
            }));
        }

        entries.push(LedgerEntry::Committed(TokensCommitted {
            agency_id: self.agency_id,
            reservation_id,
            job_id: reservation.job_id,
            amount,
            extended_by,
            idempotency_key: idempotency_key.to_string(),
            balance_after,
            occurred_at,
        }));
        Ok(entries)
    }

    fn handle_refund(
        &self,
        reservation_id: ReservationId,
        amount: u64,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let reservation = self.require_reservation(reservation_id)?;
        let refundable = amount.min(reservation.remaining());
        if refundable == 0 {
            return Ok(Vec::new());
        }

        Ok(vec![LedgerEntry::Refunded(TokensRefunded {
            agency_id: self.agency_id,
            reservation_id,
            job_id: reservation.job_id,
            amount: refundable,
            balance_after: self.available + refundable,
            occurred_at,
        })])
    }
}

impl AggregateRoot for TokenAccount {
    type Id = AgencyId;

    fn id(&self) -> &Self::Id {
        &self.agency_id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for TokenAccount {
    type Command = LedgerCommand;
    type Event = LedgerEntry;
    type Error = LedgerError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LedgerEntry::Credited(e) => {
                self.available = self.available.saturating_add(e.amount);
            }
            LedgerEntry::Reserved(e) => {
                self.available = self.available.saturating_sub(e.amount);
                self.reservations
                    .entry(e.reservation_id)
                    .and_modify(|r| r.reserved += e.amount)
                    .or_insert_with(|| Reservation {
                        id: e.reservation_id,
                        agency_id: e.agency_id,
                        job_id: e.job_id,
                        reserved: e.amount,
                        committed: 0,
                        refunded: 0,
                        created_at: e.occurred_at,
                        receipts: HashMap::new(),
                    });
            }
            LedgerEntry::Committed(e) => {
                if let Some(r) = self.reservations.get_mut(&e.reservation_id) {
                    r.committed += e.amount;
                    r.receipts.insert(
                        e.idempotency_key.clone(),
                        CommitReceipt {
                            reservation_id: e.reservation_id,
                            amount: e.amount,
                            extended_by: e.extended_by,
                        },
                    );
                }
            }
            LedgerEntry::Refunded(e) => {
                self.available = self.available.saturating_add(e.amount);
                if let Some(r) = self.reservations.get_mut(&e.reservation_id) {
                    r.refunded += e.amount;
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            LedgerCommand::Credit { amount, occurred_at } => self.handle_credit(*amount, *occurred_at),
            LedgerCommand::Reserve {
                reservation_id,
                job_id,
                amount,
                occurred_at,
            } => self.handle_reserve(*reservation_id, *job_id, *amount, *occurred_at),
            LedgerCommand::Commit {
                reservation_id,
                amount,
                idempotency_key,
                occurred_at,
            } => self.handle_commit(*reservation_id, *amount, idempotency_key, *occurred_at),
            LedgerCommand::Refund {
                reservation_id,
                amount,
                occurred_at,
            } => self.handle_refund(*reservation_id, *amount, *occurred_at),
        }
    }
}
