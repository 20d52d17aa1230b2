//! Scripted collaborators for engine tests: a programmable node transport
//! and a fixed-table cost resolver.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use quotapool_api::{ApiError, DestroyReply, DestroyRequest, NodeStatus, NodeTransport, ResolveReply, ResolveRequest};
use quotapool_types::{CostQuote, ResourceRef, TimeoutClass, Variant};

use crate::{CostResolver, QuoteError};

/// How a scripted node answers `/resolve`.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    Succeed { url: &'static str, charged: i64 },
    Reject,
    Fail,
    Hang,
}

pub(crate) struct ScriptedTransport {
    scripts: HashMap<String, Script>,
    pub resolve_calls: AtomicUsize,
    pub resolve_order: Mutex<Vec<String>>,
    pub destroyed: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<(&str, Script)>) -> Self {
        Self {
            scripts: scripts.into_iter().map(|(url, script)| (url.to_string(), script)).collect(),
            resolve_calls: AtomicUsize::new(0),
            resolve_order: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    /// Make every subsequent resolve block until the gate is notified.
    pub fn gate_resolves(&self, gate: Arc<Notify>) {
        *self.gate.lock() = Some(gate);
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeTransport for ScriptedTransport {
    async fn resolve(&self, base_url: &str, _request: &ResolveRequest) -> Result<ResolveReply, ApiError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.resolve_order.lock().push(base_url.to_string());

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        match self.scripts.get(base_url) {
            Some(Script::Succeed { url, charged }) => Ok(ResolveReply {
                msg: "Success".into(),
                d_url: Some(url.to_string()),
                require_credit: *charged,
                status: Some(healthy_status()),
            }),
            Some(Script::Reject) => Ok(ResolveReply {
                msg: "Rejected".into(),
                d_url: None,
                require_credit: 0,
                status: Some(healthy_status()),
            }),
            Some(Script::Fail) => Ok(ResolveReply {
                msg: "Failed".into(),
                d_url: None,
                require_credit: 0,
                status: Some(drained_status()),
            }),
            Some(Script::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ApiError::Status {
                    code: 504,
                    body: "hung".into(),
                })
            }
            None => Err(ApiError::Status {
                code: 503,
                body: "unknown node".into(),
            }),
        }
    }

    async fn destroy(&self, base_url: &str, _request: &DestroyRequest) -> Result<DestroyReply, ApiError> {
        self.destroyed.lock().push(base_url.to_string());
        Ok(DestroyReply { msg: "Success".into() })
    }

    async fn status(&self, _base_url: &str) -> Result<NodeStatus, ApiError> {
        Ok(healthy_status())
    }
}

pub(crate) fn healthy_status() -> NodeStatus {
    NodeStatus {
        msg: "ok".into(),
        enable_credit_cost: true,
        extended_access: true,
        free_quota: true,
        credit_balance: Some(120_000),
    }
}

/// A status snapshot that classifies as degraded: credit only, balance low.
pub(crate) fn drained_status() -> NodeStatus {
    NodeStatus {
        msg: "quota exhausted".into(),
        enable_credit_cost: true,
        extended_access: true,
        free_quota: false,
        credit_balance: Some(2_000),
    }
}

/// Cost resolver answering from a fixed table.
pub(crate) struct FixedCosts {
    pub archive_cost: i64,
    pub timeout_class: TimeoutClass,
}

impl FixedCosts {
    pub fn standard(archive_cost: i64) -> Self {
        Self {
            archive_cost,
            timeout_class: TimeoutClass::Standard,
        }
    }
}

#[async_trait]
impl CostResolver for FixedCosts {
    async fn quote(&self, _resource: &ResourceRef) -> Result<CostQuote, QuoteError> {
        Ok(CostQuote {
            costs: BTreeMap::from([(Variant::Archive, self.archive_cost), (Variant::Resample, self.archive_cost / 2)]),
            timeout_class: self.timeout_class,
        })
    }
}
