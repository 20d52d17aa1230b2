//! Resolution error taxonomy.

use quotapool_ledger::LedgerError;
use quotapool_types::{PrincipalId, Variant};

/// Everything a `resolve` call can fail with.
///
/// The type is `Clone` because the coalescer delivers one outcome to every
/// caller waiting on the same key. `InsufficientFunds`, `NoEligibleNodes`,
/// and `DispatchExhausted` are recoverable from the caller's point of view;
/// the rest indicate configuration or ledger problems.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown principal {0}")]
    UnknownPrincipal(PrincipalId),

    #[error("principal is banned")]
    PrincipalBanned,

    #[error("cost quote failed: {0}")]
    QuoteFailed(String),

    #[error("no cost quoted for variant '{0}'")]
    UnknownVariant(Variant),

    #[error("insufficient funds: need {needed}, balance {balance}")]
    InsufficientFunds { needed: i64, balance: i64 },

    /// The selector produced an empty candidate list: nothing to try.
    #[error("no eligible nodes for this request")]
    NoEligibleNodes,

    /// Candidates existed and every attempt failed.
    #[error("all {attempts} candidate nodes failed")]
    DispatchExhausted { attempts: usize },

    /// The in-flight computation this caller was waiting on disappeared
    /// without delivering an outcome.
    #[error("resolution was abandoned")]
    Abandoned,

    #[error("ledger failure: {0}")]
    Ledger(String),
}

impl From<LedgerError> for ResolveError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { needed, balance } => Self::InsufficientFunds { needed, balance },
            LedgerError::UnknownPrincipal(id) => Self::UnknownPrincipal(id),
            other => Self::Ledger(other.to_string()),
        }
    }
}
