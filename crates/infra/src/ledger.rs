//! Token ledger service over per-agency [`TokenAccount`] aggregates.
//!
//! Every operation for one agency runs `handle` + `apply` under that agency's
//! mutex, so reserve/commit/refund are linearized per agency while different
//! agencies never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tracing::{debug, info};

use contentforge_core::{Aggregate, AgencyId, JobId, ReservationId};
use contentforge_ledger::{CommitReceipt, LedgerCommand, LedgerEntry, LedgerError, Reservation, TokenAccount};

pub trait TokenLedger: Send + Sync {
    /// Tops up an agency balance and returns the new available balance.
    fn credit(&self, agency_id: AgencyId, amount: u64) -> Result<u64, LedgerError>;

    /// Withholds `amount` from the available balance.
    fn reserve(&self, agency_id: AgencyId, amount: u64, job_id: Option<JobId>) -> Result<ReservationId, LedgerError>;

    /// Consumes `amount` from a reservation.
    ///
    /// An overrun is reserved from the available balance on the spot or the
    /// commit fails with `ExceedsReservation`. Repeating a commit with the same
    /// key returns the first receipt without charging again.
    fn commit(&self, reservation_id: ReservationId, amount: u64, idempotency_key: &str) -> Result<CommitReceipt, LedgerError>;

    /// Returns up to `amount` of the still-held tokens; yields the amount refunded.
    fn refund(&self, reservation_id: ReservationId, amount: u64) -> Result<u64, LedgerError>;

    /// Returns everything still held by the reservation.
    fn release(&self, reservation_id: ReservationId) -> Result<u64, LedgerError> {
        self.refund(reservation_id, u64::MAX)
    }

    /// Available balance, with open reservations already subtracted.
    fn balance_of(&self, agency_id: AgencyId) -> Result<u64, LedgerError>;

    fn reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>, LedgerError>;

    /// Audit trail of an agency, oldest first.
    fn entries(&self, agency_id: AgencyId) -> Result<Vec<LedgerEntry>, LedgerError>;
}

#[derive(Debug)]
struct AccountState {
    account: TokenAccount,
    entries: Vec<LedgerEntry>,
}

impl AccountState {
    fn execute(&mut self, command: &LedgerCommand) -> Result<Vec<LedgerEntry>, LedgerError> {
        let events = self.account.handle(command)?;
        for event in &events {
            self.account.apply(event);
        }
        self.entries.extend(events.iter().cloned());
        Ok(events)
    }
}

type SharedAccount = Arc<Mutex<AccountState>>;

/// In-memory ledger for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTokenLedger {
    accounts: RwLock<HashMap<AgencyId, SharedAccount>>,
    reservations: RwLock<HashMap<ReservationId, AgencyId>>,
}

fn poisoned<T>(_: T) -> LedgerError {
    LedgerError::Storage("lock poisoned".to_string())
}

impl InMemoryTokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn account(&self, agency_id: AgencyId) -> Result<SharedAccount, LedgerError> {
        if let Some(account) = self.accounts.read().map_err(poisoned)?.get(&agency_id) {
            return Ok(account.clone());
        }
        let mut accounts = self.accounts.write().map_err(poisoned)?;
        let account = accounts.entry(agency_id).or_insert_with(|| {
            Arc::new(Mutex::new(AccountState {
                account: TokenAccount::empty(agency_id),
                entries: Vec::new(),
            }))
        });
        Ok(account.clone())
    }

    fn account_of(&self, reservation_id: ReservationId) -> Result<SharedAccount, LedgerError> {
        let agency_id = *self
            .reservations
            .read()
            .map_err(poisoned)?
            .get(&reservation_id)
            .ok_or(LedgerError::UnknownReservation(reservation_id))?;
        self.account(agency_id)
    }
}

impl TokenLedger for InMemoryTokenLedger {
    fn credit(&self, agency_id: AgencyId, amount: u64) -> Result<u64, LedgerError> {
        let account = self.account(agency_id)?;
        let mut state = account.lock().map_err(poisoned)?;
        state.execute(&LedgerCommand::Credit {
            amount,
            occurred_at: Utc::now(),
        })?;
        let balance = state.account.available();
        info!(agency_id = %agency_id, amount, balance, "tokens credited");
        Ok(balance)
    }

    fn reserve(&self, agency_id: AgencyId, amount: u64, job_id: Option<JobId>) -> Result<ReservationId, LedgerError> {
        let account = self.account(agency_id)?;
        let mut state = account.lock().map_err(poisoned)?;
        let reservation_id = ReservationId::new();
        state.execute(&LedgerCommand::Reserve {
            reservation_id,
            job_id,
            amount,
            occurred_at: Utc::now(),
        })?;
        self.reservations
            .write()
            .map_err(poisoned)?
            .insert(reservation_id, agency_id);

        debug!(
            agency_id = %agency_id,
            reservation_id = %reservation_id,
            amount,
            available = state.account.available(),
            "tokens reserved"
        );
        Ok(reservation_id)
    }

    fn commit(&self, reservation_id: ReservationId, amount: u64, idempotency_key: &str) -> Result<CommitReceipt, LedgerError> {
        let account = self.account_of(reservation_id)?;
        let mut state = account.lock().map_err(poisoned)?;
        state.execute(&LedgerCommand::Commit {
            reservation_id,
            amount,
            idempotency_key: idempotency_key.to_string(),
            occurred_at: Utc::now(),
        })?;

        let receipt = state
            .account
            .reservation(reservation_id)
            .and_then(|r| r.receipt(idempotency_key))
            .copied()
            .ok_or(LedgerError::UnknownReservation(reservation_id))?;
        debug!(
            reservation_id = %reservation_id,
            amount = receipt.amount,
            extended_by = receipt.extended_by,
            key = idempotency_key,
            "tokens committed"
        );
        Ok(receipt)
    }

    fn refund(&self, reservation_id: ReservationId, amount: u64) -> Result<u64, LedgerError> {
        let account = self.account_of(reservation_id)?;
        let mut state = account.lock().map_err(poisoned)?;
        let refunded: u64 = state
            .execute(&LedgerCommand::Refund {
                reservation_id,
                amount,
                occurred_at: Utc::now(),
            })?
            .iter()
            .map(LedgerEntry::amount)
            .sum();
        if refunded > 0 {
            debug!(reservation_id = %reservation_id, refunded, "tokens refunded");
        }
        Ok(refunded)
    }

    fn balance_of(&self, agency_id: AgencyId) -> Result<u64, LedgerError> {
        let account = self.account(agency_id)?;
        let state = account.lock().map_err(poisoned)?;
        Ok(state.account.available())
    }

    fn reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>, LedgerError> {
        let account = match self.account_of(reservation_id) {
            Ok(account) => account,
            Err(LedgerError::UnknownReservation(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let state = account.lock().map_err(poisoned)?;
        Ok(state.account.reservation(reservation_id).cloned())
    }

    fn entries(&self, agency_id: AgencyId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let account = self.account(agency_id)?;
        let state = account.lock().map_err(poisoned)?;
        Ok(state.entries.clone())
    }
}

impl<L: TokenLedger + ?Sized> TokenLedger for Arc<L> {
    fn credit(&self, agency_id: AgencyId, amount: u64) -> Result<u64, LedgerError> {
        (**self).credit(agency_id, amount)
    }

    fn reserve(&self, agency_id: AgencyId, amount: u64, job_id: Option<JobId>) -> Result<ReservationId, LedgerError> {
        (**self).reserve(agency_id, amount, job_id)
    }

    fn commit(&self, reservation_id: ReservationId, amount: u64, idempotency_key: &str) -> Result<CommitReceipt, LedgerError> {
        (**self).commit(reservation_id, amount, idempotency_key)
    }

    fn refund(&self, reservation_id: ReservationId, amount: u64) -> Result<u64, LedgerError> {
        (**self).refund(reservation_id, amount)
    }

    fn balance_of(&self, agency_id: AgencyId) -> Result<u64, LedgerError> {
        (**self).balance_of(agency_id)
    }

    fn reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>, LedgerError> {
        (**self).reservation(reservation_id)
    }

    fn entries(&self, agency_id: AgencyId) -> Result<Vec<LedgerEntry>, LedgerError> {
        (**self).entries(agency_id)
    }
}
