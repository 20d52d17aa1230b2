//! Credit ledger: balances, grants, check-in issuance, and
//! oldest-expiry-first deduction.
//!
//! Grants are append-only rows that get decremented in place, so the full
//! issuance history stays auditable. Deduction and check-in both run under a
//! per-principal critical section; two concurrent spends for one principal
//! serialize instead of racing on the same grant set.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use quotapool_types::{CreditGrant, GrantSource, Principal, PrincipalId, ResolutionRecord};

mod store;

pub use store::{LedgerSnapshot, LedgerStore, MemoryStore, StoreError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds: need {needed}, balance {balance}")]
    InsufficientFunds { needed: i64, balance: i64 },

    #[error("amount must be positive")]
    InvalidAmount,

    #[error("unknown principal {0}")]
    UnknownPrincipal(PrincipalId),

    /// Ledger corruption (negative grant amount, or a deduction walk that
    /// could not consume the amount the balance check approved). Never
    /// clamped or repaired in place.
    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Check-in issuance policy.
#[derive(Debug, Clone)]
pub struct CheckInPolicy {
    /// Inclusive bounds of the uniformly drawn issuance amount.
    pub min_amount: i64,
    pub max_amount: i64,
    /// How long a check-in grant lives.
    pub grant_ttl: Duration,
    /// Fixed UTC offset anchoring the calendar day. Day boundaries are
    /// computed in this offset, never inferred from grant expiries.
    pub utc_offset_hours: i8,
}

impl Default for CheckInPolicy {
    fn default() -> Self {
        Self {
            min_amount: 15_000,
            max_amount: 40_000,
            grant_ttl: Duration::days(7),
            utc_offset_hours: 8,
        }
    }
}

impl CheckInPolicy {
    /// Calendar day of `now` in the anchor offset.
    fn anchored_day(&self, now: DateTime<Utc>) -> NaiveDate {
        let seconds = i32::from(self.utc_offset_hours.clamp(-23, 23)) * 3600;
        let offset = FixedOffset::east_opt(seconds).unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
        now.with_timezone(&offset).date_naive()
    }
}

/// Outcome of a check-in. `issued == 0` means the principal already checked
/// in during the current anchored day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckInReceipt {
    pub issued: i64,
    pub balance: i64,
}

/// The ledger service. Holds the storage handle plus the per-principal lock
/// table serializing mutations.
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    checkin: CheckInPolicy,
    locks: Mutex<HashMap<PrincipalId, Arc<Mutex<()>>>>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, checkin: CheckInPolicy) -> Self {
        Self {
            store,
            checkin,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Register or refresh a principal row.
    pub async fn ensure_principal(&self, principal: &Principal) -> Result<(), LedgerError> {
        self.store.upsert_principal(principal).await?;
        Ok(())
    }

    pub async fn principal(&self, id: PrincipalId) -> Result<Principal, LedgerError> {
        self.store.principal(id).await?.ok_or(LedgerError::UnknownPrincipal(id))
    }

    /// Sum of live grant amounts: positive and unexpired.
    pub async fn balance(&self, principal: PrincipalId) -> Result<i64, LedgerError> {
        let now = Utc::now();
        let grants = self.store.grants_for(principal).await?;
        live_total(&grants, now)
    }

    /// Issue a grant expiring at `now + ttl`.
    pub async fn grant(
        &self,
        principal: PrincipalId,
        amount: i64,
        source: GrantSource,
        ttl: Duration,
    ) -> Result<CreditGrant, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let grant = self.store.insert_grant(principal, amount, Utc::now() + ttl, source).await?;
        info!(%principal, grant = %grant.id, amount, %source, "credit granted");
        Ok(grant)
    }

    /// Daily check-in. Idempotent per anchored calendar day: the second call
    /// within one day issues nothing and leaves the balance untouched.
    pub async fn checkin(&self, principal: PrincipalId) -> Result<CheckInReceipt, LedgerError> {
        let lock = self.lock_for(principal).await;
        let _guard = lock.lock().await;

        let today = self.checkin.anchored_day(Utc::now());
        if self.store.last_checkin_day(principal).await? == Some(today) {
            debug!(%principal, %today, "check-in already issued today");
            return Ok(CheckInReceipt {
                issued: 0,
                balance: self.balance(principal).await?,
            });
        }

        let amount = {
            use rand::Rng;
            rand::thread_rng().gen_range(self.checkin.min_amount..=self.checkin.max_amount)
        };
        self.store
            .insert_grant(principal, amount, Utc::now() + self.checkin.grant_ttl, GrantSource::CheckIn)
            .await?;
        self.store.set_last_checkin_day(principal, today).await?;

        let balance = self.balance(principal).await?;
        info!(%principal, issued = amount, balance, "check-in issued");
        Ok(CheckInReceipt { issued: amount, balance })
    }

    /// Deduct `amount` from the principal's live grants, consuming the
    /// earliest-expiring grants first.
    pub async fn deduct(&self, principal: PrincipalId, amount: i64) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if amount == 0 {
            return Ok(());
        }

        let lock = self.lock_for(principal).await;
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut grants = self.store.grants_for(principal).await?;
        let balance = live_total(&grants, now)?;
        if balance < amount {
            return Err(LedgerError::InsufficientFunds {
                needed: amount,
                balance,
            });
        }

        grants.retain(|grant| grant.is_live(now));
        grants.sort_by_key(|grant| grant.expires_at);

        let mut remaining = amount;
        for grant in &grants {
            if remaining == 0 {
                break;
            }
            let take = grant.amount.min(remaining);
            self.store.set_grant_amount(grant.id, grant.amount - take).await?;
            remaining -= take;
        }

        if remaining != 0 {
            return Err(LedgerError::InvariantViolation(format!(
                "deduction of {amount} from {principal} left {remaining} unconsumed after balance check passed"
            )));
        }
        debug!(%principal, amount, "credit deducted");
        Ok(())
    }

    /// Append one immutable resolution record to the audit trail.
    pub async fn record_resolution(&self, record: &ResolutionRecord) -> Result<(), LedgerError> {
        self.store.append_resolution(record).await?;
        Ok(())
    }

    pub async fn history(&self, principal: PrincipalId) -> Result<Vec<ResolutionRecord>, LedgerError> {
        Ok(self.store.resolutions_for(principal).await?)
    }

    async fn lock_for(&self, principal: PrincipalId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(principal).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

/// Total of live grants, failing fast on a negative amount.
fn live_total(grants: &[CreditGrant], now: DateTime<Utc>) -> Result<i64, LedgerError> {
    let mut total = 0i64;
    for grant in grants {
        if grant.amount < 0 {
            return Err(LedgerError::InvariantViolation(format!(
                "grant {} holds negative amount {}",
                grant.id, grant.amount
            )));
        }
        if grant.is_live(now) {
            total += grant.amount;
        }
    }
    Ok(total)
}
