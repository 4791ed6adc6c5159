use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::LedgerError;

/// Tenant balance storage
///
/// Every mutation is an atomic read-modify-write on one tenant.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn balance(&self, tenant_id: i64) -> Result<i64, LedgerError>;

    /// Subtract `amount`, never letting the balance go negative
    async fn debit(&self, tenant_id: i64, amount: i64) -> Result<i64, LedgerError>;

    /// Add `amount` back
    async fn credit(&self, tenant_id: i64, amount: i64) -> Result<i64, LedgerError>;
}

/// Balances held in process memory
#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    balances: DashMap<i64, i64>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an account, replacing any existing balance
    pub fn set_balance(&self, tenant_id: i64, balance: i64) {
        self.balances.insert(tenant_id, balance);
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn balance(&self, tenant_id: i64) -> Result<i64, LedgerError> {
        self.balances
            .get(&tenant_id)
            .map(|balance| *balance)
            .ok_or(LedgerError::UnknownTenant(tenant_id))
    }

    async fn debit(&self, tenant_id: i64, amount: i64) -> Result<i64, LedgerError> {
        let mut balance = self
            .balances
            .get_mut(&tenant_id)
            .ok_or(LedgerError::UnknownTenant(tenant_id))?;

        if amount <= 0 {
            return Ok(*balance);
        }

        if *balance < amount {
            return Err(LedgerError::InsufficientBalance {
                tenant_id,
                balance: *balance,
                required: amount,
            });
        }

        *balance -= amount;
        Ok(*balance)
    }

    async fn credit(&self, tenant_id: i64, amount: i64) -> Result<i64, LedgerError> {
        let mut balance = self
            .balances
            .get_mut(&tenant_id)
            .ok_or(LedgerError::UnknownTenant(tenant_id))?;

        if amount > 0 {
            *balance = balance.saturating_add(amount);
        }

        Ok(*balance)
    }
}
