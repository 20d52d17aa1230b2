//! The quotapool engine: selection, dispatch with failover, request
//! coalescing, and the response cache, tied together behind [`Pool`].
//!
//! Control flow for a resolve:
//!
//! caller → coalescer (cache / in-flight check) → selector → dispatcher →
//! remote node → on success: ledger deduction + resolution record + cache
//! population → outcome to every waiting caller.
//!
//! All collaborating services are explicit objects wired once in
//! [`Pool::new`] and shared by reference; nothing lives in module-level
//! state.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use quotapool_api::NodeTransport;
use quotapool_ledger::{CheckInReceipt, Ledger, LedgerError, LedgerStore};
use quotapool_registry::{HealthTracker, NodeRegistry};
use quotapool_types::{
    CostQuote, GrantSource, Principal, PrincipalGroup, PrincipalId, ResolutionRecord, ResourceRef, TimeoutClass, Variant,
};

mod coalesce;
mod config;
mod dispatch;
mod error;
mod queue;
mod select;

pub use coalesce::{CacheKey, Resolved, ResolveCache};
pub use config::{PoolConfig, default_config_path};
pub use dispatch::{DispatchRequest, DispatchSuccess, Dispatcher};
pub use error::ResolveError;
pub use queue::{QueueFull, WorkQueue};
pub use select::{SelectionRequest, eligible};

/// Failure while quoting the cost of a resource.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct QuoteError(pub String);

/// Narrow interface to the external metadata resolver: given a resource,
/// what does each variant cost and how long should attempts be allowed to
/// run. Implemented outside the core; tests use fixed tables.
#[async_trait]
pub trait CostResolver: Send + Sync {
    async fn quote(&self, resource: &ResourceRef) -> Result<CostQuote, QuoteError>;
}

/// A background resolution job, queued when a caller does not need the
/// answer inline.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveJob {
    pub principal: PrincipalId,
    pub resource: ResourceRef,
    pub variant: Variant,
}

/// The pool facade. Front ends call only this.
pub struct Pool {
    config: PoolConfig,
    ledger: Arc<Ledger>,
    registry: Arc<NodeRegistry>,
    tracker: Arc<HealthTracker>,
    dispatcher: Dispatcher,
    cache: ResolveCache,
    costs: Arc<dyn CostResolver>,
    jobs: WorkQueue<ResolveJob>,
}

impl Pool {
    pub fn new(
        config: PoolConfig,
        store: Arc<dyn LedgerStore>,
        transport: Arc<dyn NodeTransport>,
        costs: Arc<dyn CostResolver>,
    ) -> Self {
        let registry = Arc::new(NodeRegistry::new());
        let ledger = Arc::new(Ledger::new(store, config.checkin_policy()));
        let tracker = Arc::new(HealthTracker::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            config.probe_timeout(),
            config.degraded_credit_threshold,
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            transport,
            config.degraded_credit_threshold,
            config.dispatch_timeout(),
            config.extended_dispatch_timeout(),
        );
        let cache = ResolveCache::new(config.cache_ttl());
        let jobs = WorkQueue::new(config.queue_depth);
        Self {
            config,
            ledger,
            registry,
            tracker,
            dispatcher,
            cache,
            costs,
            jobs,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.tracker
    }

    pub fn jobs(&self) -> &WorkQueue<ResolveJob> {
        &self.jobs
    }

    /// Resolve a resource for a principal.
    ///
    /// Cached results are served without any spend; otherwise the request
    /// coalesces with any identical in-flight one, and at most a single
    /// dispatch sequence runs per key.
    pub async fn resolve(&self, principal: PrincipalId, resource: &ResourceRef, variant: Variant) -> Result<Resolved, ResolveError> {
        let who = self.ledger.principal(principal).await?;
        if who.group == PrincipalGroup::Banned {
            return Err(ResolveError::PrincipalBanned);
        }

        let quote = self
            .costs
            .quote(resource)
            .await
            .map_err(|err| ResolveError::QuoteFailed(err.to_string()))?;
        let cost = quote.cost_of(variant).ok_or(ResolveError::UnknownVariant(variant))?;

        let balance = self.ledger.balance(principal).await?;
        if balance < cost {
            return Err(ResolveError::InsufficientFunds { needed: cost, balance });
        }

        let key = CacheKey {
            principal,
            resource_id: resource.id.clone(),
            variant,
        };
        self.cache
            .get_or_compute(key, self.compute(who, resource.clone(), variant, cost, quote.timeout_class))
            .await
    }

    /// The computation behind a cache miss: select, dispatch, deduct,
    /// record. Runs at most once per key at a time.
    async fn compute(
        &self,
        who: Principal,
        resource: ResourceRef,
        variant: Variant,
        cost: i64,
        timeout_class: TimeoutClass,
    ) -> Result<Resolved, ResolveError> {
        let candidates = select::eligible(
            self.registry.snapshot(),
            &SelectionRequest {
                cost,
                timeout_class,
                allow_credit_spend: true,
            },
        );
        let request = DispatchRequest {
            principal_name: who.name.clone(),
            resource: resource.clone(),
            variant,
            timeout_class,
        };
        let success = self.dispatcher.dispatch(&candidates, &request).await?;

        // Confirmed success: deduction and the audit record are written
        // before the result becomes visible to anyone.
        self.ledger.deduct(who.id, cost).await?;
        let record = ResolutionRecord {
            principal: who.id,
            resource,
            variant,
            cost,
            node: success.node,
            resolved_at: Utc::now(),
        };
        self.ledger.record_resolution(&record).await?;

        Ok(Resolved {
            url: success.url,
            node: success.node,
            cost,
        })
    }

    pub async fn balance(&self, principal: PrincipalId) -> Result<i64, LedgerError> {
        self.ledger.balance(principal).await
    }

    /// Issue a manual grant; returns `(issued_amount, new_balance)`.
    pub async fn grant(&self, principal: PrincipalId, amount: i64, source: GrantSource) -> Result<(i64, i64), LedgerError> {
        self.ledger.grant(principal, amount, source, self.config.grant_ttl()).await?;
        let balance = self.ledger.balance(principal).await?;
        Ok((amount, balance))
    }

    /// Daily check-in; `issued` is zero when already checked in today.
    pub async fn checkin(&self, principal: PrincipalId) -> Result<CheckInReceipt, LedgerError> {
        self.ledger.checkin(principal).await
    }

    pub async fn register_principal(&self, principal: &Principal) -> Result<(), LedgerError> {
        self.ledger.ensure_principal(principal).await
    }

    /// Invalidate every cached resolution of a resource and ask the nodes
    /// that served them to drop their copies. Remote failures are
    /// tolerated; the local cache is always cleared.
    pub async fn destroy(&self, resource: &ResourceRef) -> bool {
        let dropped = self.cache.invalidate_resource(&resource.id);
        if dropped.is_empty() {
            info!(resource = %resource, "destroy: nothing cached");
            return false;
        }

        let mut acknowledged = false;
        let mut notified = HashSet::new();
        for entry in dropped {
            if notified.insert(entry.node) {
                acknowledged |= self.dispatcher.destroy_on(entry.node, resource).await;
            }
        }
        acknowledged
    }

    /// Drive the periodic health refresh forever at the configured
    /// interval. Spawn on its own task.
    pub async fn run_health_loop(&self) {
        Arc::clone(&self.tracker).run_refresh_loop(self.config.health_refresh_interval()).await;
    }

    /// Drain the background job queue forever. Spawn on its own task; run
    /// several for parallel workers.
    pub async fn run_queue_worker(self: Arc<Self>) {
        loop {
            let job = self.jobs.dequeue().await;
            let depth = self.jobs.depth();
            match self.resolve(job.principal, &job.resource, job.variant).await {
                Ok(resolved) => {
                    info!(principal = %job.principal, resource = %job.resource, node = %resolved.node, depth, "queued resolution finished");
                }
                Err(err) => {
                    warn!(principal = %job.principal, resource = %job.resource, error = %err, depth, "queued resolution failed");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil;
