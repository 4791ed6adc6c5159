use thiserror::Error;

/// Quota ledger errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Balance cannot cover the debit
    #[error("insufficient balance for tenant {tenant_id}: {balance} available, {required} required")]
    InsufficientBalance { tenant_id: i64, balance: i64, required: i64 },

    /// Tenant has no ledger account
    #[error("unknown tenant {0}")]
    UnknownTenant(i64),

    /// Model has no configured price and no default ratio applies
    #[error("model '{0}' has no configured price")]
    UnpricedModel(String),
}
