use std::{collections::BTreeMap, error::Error, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a credited account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrincipalId(pub u64);

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access tier for a principal. Banned principals are refused before any
/// cost lookup or dispatch happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalGroup {
    #[default]
    Normal,
    Banned,
}

/// A credited account: the entity grants are issued to and deducted from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    /// Display name forwarded to nodes in resolve requests.
    pub name: String,
    #[serde(default)]
    pub group: PrincipalGroup,
}

/// Externally identified resource plus its access token.
///
/// Both parts are opaque to the pool; nodes interpret them. The `FromStr`
/// form is `<id>/<token>`, as accepted on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub id: String,
    pub token: String,
}

impl ResourceRef {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.token)
    }
}

impl FromStr for ResourceRef {
    type Err = ParseResourceRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, token) = s.split_once('/').ok_or(ParseResourceRefError)?;
        if id.is_empty() || token.is_empty() || token.contains('/') {
            return Err(ParseResourceRefError);
        }
        Ok(Self::new(id, token))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseResourceRefError;

impl fmt::Display for ParseResourceRefError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid resource reference; expected '<id>/<token>'")
    }
}

impl Error for ParseResourceRefError {}

/// Quality/format selection for a resolution. The variant determines the
/// credit cost a node will charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Original archive download.
    #[default]
    Archive,
    /// Resampled (reduced-size) edition.
    Resample,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Archive => f.write_str("archive"),
            Self::Resample => f.write_str("resample"),
        }
    }
}

impl FromStr for Variant {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "archive" => Ok(Self::Archive),
            "resample" => Ok(Self::Resample),
            _ => Err(ParseVariantError),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseVariantError;

impl fmt::Display for ParseVariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid variant; expected 'archive' or 'resample'")
    }
}

impl Error for ParseVariantError {}

/// Identifier of a single credit grant row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GrantId(pub u64);

impl fmt::Display for GrantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a grant came from. Check-in grants are subject to the
/// once-per-calendar-day rule; the others are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    CheckIn,
    Manual,
    Promotion,
}

impl fmt::Display for GrantSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckIn => f.write_str("check_in"),
            Self::Manual => f.write_str("manual"),
            Self::Promotion => f.write_str("promotion"),
        }
    }
}

/// One credit issuance. Grants are never deleted: deduction decrements
/// `amount` in place toward zero, leaving an auditable trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditGrant {
    pub id: GrantId,
    pub principal: PrincipalId,
    /// Remaining amount. Always >= 0; a negative value indicates ledger
    /// corruption and is treated as fatal by the ledger.
    pub amount: i64,
    pub expires_at: DateTime<Utc>,
    pub source: GrantSource,
}

impl CreditGrant {
    /// A grant counts toward the balance while it still holds credit and
    /// has not expired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.amount > 0 && self.expires_at > now
    }
}

/// Identifier of a registered resolver node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Computed health of a node. `Registered` is the initial state before the
/// first probe completes. The admin `disabled` flag on [`Node`] is
/// orthogonal: a disabled node is never selected regardless of health.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum NodeHealth {
    #[default]
    Registered,
    Healthy,
    Degraded(String),
    Unreachable,
}

impl NodeHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered => f.write_str("registered"),
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded(reason) => write!(f, "degraded ({reason})"),
            Self::Unreachable => f.write_str("unreachable"),
        }
    }
}

/// A resolver node contributing quota to the pool.
///
/// Capability and capacity fields mirror what the node last advertised; they
/// are refreshed by the periodic probe pass and opportunistically from
/// status metadata observed during dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub url: String,
    /// Principal operating this node.
    pub operator: PrincipalId,
    /// Whether the node is willing to spend its own credit on requests.
    pub accepts_credit_cost: bool,
    /// Whether the node can reach the extended catalog.
    pub extended_access: bool,
    /// Whether the node advertises free (non-credit) quota.
    pub free_quota: bool,
    /// Last advertised credit balance; `None` when the node did not report
    /// one.
    pub credit_balance: Option<i64>,
    #[serde(default)]
    pub health: NodeHealth,
    /// Admin kill switch. Suppresses selection and probing.
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub last_probed_at: Option<DateTime<Utc>>,
}

/// Immutable audit record of one successful resolution. Created together
/// with the ledger deduction, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub principal: PrincipalId,
    pub resource: ResourceRef,
    pub variant: Variant,
    /// Credit charged to the principal for this resolution.
    pub cost: i64,
    pub node: NodeId,
    pub resolved_at: DateTime<Utc>,
}

/// Classification of how long a resolution is expected to take, supplied by
/// the metadata collaborator. Extended work is only dispatched to
/// credit-capable nodes and runs under the longer per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutClass {
    #[default]
    Standard,
    Extended,
}

/// Cost quote for a resource, per variant, as computed by the external
/// metadata resolver.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CostQuote {
    pub costs: BTreeMap<Variant, i64>,
    #[serde(default)]
    pub timeout_class: TimeoutClass,
}

impl CostQuote {
    pub fn cost_of(&self, variant: Variant) -> Option<i64> {
        self.costs.get(&variant).copied()
    }
}
