//! Ledger storage backends.
//!
//! The trait assumes the backing store provides atomic per-row
//! read-modify-write: `set_grant_amount` touches exactly one grant row, and
//! the check-in day marker is a single row per principal. Serialization of
//! multi-row walks (deduction) is the ledger's job, not the store's.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use quotapool_types::{CreditGrant, GrantId, GrantSource, Principal, PrincipalId, ResolutionRecord};

/// Failure inside a storage backend.
#[derive(Debug, Clone, thiserror::Error)]
#[error("ledger storage failure: {0}")]
pub struct StoreError(pub String);

/// Durable state behind the ledger: principals, grants, the per-principal
/// check-in day marker, and the append-only resolution history.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn upsert_principal(&self, principal: &Principal) -> Result<(), StoreError>;

    async fn principal(&self, id: PrincipalId) -> Result<Option<Principal>, StoreError>;

    /// All grants ever issued to a principal, spent ones included.
    async fn grants_for(&self, principal: PrincipalId) -> Result<Vec<CreditGrant>, StoreError>;

    async fn insert_grant(
        &self,
        principal: PrincipalId,
        amount: i64,
        expires_at: DateTime<Utc>,
        source: GrantSource,
    ) -> Result<CreditGrant, StoreError>;

    /// Atomic single-row update of a grant's remaining amount.
    async fn set_grant_amount(&self, grant: GrantId, amount: i64) -> Result<(), StoreError>;

    /// Calendar day (in the anchor timezone) of the last check-in issuance.
    async fn last_checkin_day(&self, principal: PrincipalId) -> Result<Option<NaiveDate>, StoreError>;

    async fn set_last_checkin_day(&self, principal: PrincipalId, day: NaiveDate) -> Result<(), StoreError>;

    async fn append_resolution(&self, record: &ResolutionRecord) -> Result<(), StoreError>;

    async fn resolutions_for(&self, principal: PrincipalId) -> Result<Vec<ResolutionRecord>, StoreError>;
}

/// In-memory [`LedgerStore`].
///
/// Backs tests and single-process deployments; a transactional store slots
/// in behind the same trait for durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    principals: RwLock<HashMap<PrincipalId, Principal>>,
    grants: RwLock<HashMap<GrantId, CreditGrant>>,
    checkin_days: RwLock<HashMap<PrincipalId, NaiveDate>>,
    resolutions: RwLock<Vec<ResolutionRecord>>,
    next_grant_id: AtomicU64,
}

/// Serializable dump of a [`MemoryStore`], used by operational tooling to
/// persist ledger state between invocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub principals: Vec<Principal>,
    pub grants: Vec<CreditGrant>,
    pub checkin_days: Vec<(PrincipalId, NaiveDate)>,
    pub resolutions: Vec<ResolutionRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a snapshot, keeping grant ids stable.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let next = snapshot.grants.iter().map(|grant| grant.id.0).max().unwrap_or(0);
        Self {
            principals: RwLock::new(snapshot.principals.into_iter().map(|p| (p.id, p)).collect()),
            grants: RwLock::new(snapshot.grants.into_iter().map(|g| (g.id, g)).collect()),
            checkin_days: RwLock::new(snapshot.checkin_days.into_iter().collect()),
            resolutions: RwLock::new(snapshot.resolutions),
            next_grant_id: AtomicU64::new(next),
        }
    }

    pub async fn export(&self) -> LedgerSnapshot {
        let mut principals: Vec<Principal> = self.principals.read().await.values().cloned().collect();
        principals.sort_by_key(|p| p.id);
        let mut grants: Vec<CreditGrant> = self.grants.read().await.values().cloned().collect();
        grants.sort_by_key(|g| g.id);
        let mut checkin_days: Vec<(PrincipalId, NaiveDate)> =
            self.checkin_days.read().await.iter().map(|(id, day)| (*id, *day)).collect();
        checkin_days.sort_by_key(|(id, _)| *id);
        LedgerSnapshot {
            principals,
            grants,
            checkin_days,
            resolutions: self.resolutions.read().await.clone(),
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn upsert_principal(&self, principal: &Principal) -> Result<(), StoreError> {
        self.principals.write().await.insert(principal.id, principal.clone());
        Ok(())
    }

    async fn principal(&self, id: PrincipalId) -> Result<Option<Principal>, StoreError> {
        Ok(self.principals.read().await.get(&id).cloned())
    }

    async fn grants_for(&self, principal: PrincipalId) -> Result<Vec<CreditGrant>, StoreError> {
        Ok(self
            .grants
            .read()
            .await
            .values()
            .filter(|grant| grant.principal == principal)
            .cloned()
            .collect())
    }

    async fn insert_grant(
        &self,
        principal: PrincipalId,
        amount: i64,
        expires_at: DateTime<Utc>,
        source: GrantSource,
    ) -> Result<CreditGrant, StoreError> {
        let id = GrantId(self.next_grant_id.fetch_add(1, Ordering::Relaxed) + 1);
        let grant = CreditGrant {
            id,
            principal,
            amount,
            expires_at,
            source,
        };
        self.grants.write().await.insert(id, grant.clone());
        Ok(grant)
    }

    async fn set_grant_amount(&self, grant: GrantId, amount: i64) -> Result<(), StoreError> {
        let mut grants = self.grants.write().await;
        let row = grants
            .get_mut(&grant)
            .ok_or_else(|| StoreError(format!("grant {grant} does not exist")))?;
        row.amount = amount;
        Ok(())
    }

    async fn last_checkin_day(&self, principal: PrincipalId) -> Result<Option<NaiveDate>, StoreError> {
        Ok(self.checkin_days.read().await.get(&principal).copied())
    }

    async fn set_last_checkin_day(&self, principal: PrincipalId, day: NaiveDate) -> Result<(), StoreError> {
        self.checkin_days.write().await.insert(principal, day);
        Ok(())
    }

    async fn append_resolution(&self, record: &ResolutionRecord) -> Result<(), StoreError> {
        self.resolutions.write().await.push(record.clone());
        Ok(())
    }

    async fn resolutions_for(&self, principal: PrincipalId) -> Result<Vec<ResolutionRecord>, StoreError> {
        Ok(self
            .resolutions
            .read()
            .await
            .iter()
            .filter(|record| record.principal == principal)
            .cloned()
            .collect())
    }
}
