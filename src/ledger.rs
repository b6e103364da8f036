use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::model::{ProviderKey, ProviderRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerError(pub String);

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ledger: {}", self.0)
    }
}

impl std::error::Error for LedgerError {}

/// Provider credit account. A failed debit never undoes a booking.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn debit(&self, provider: &ProviderRef, amount: i64, reason: &str)
        -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub provider: ProviderKey,
    /// Negative for debits.
    pub amount: i64,
    pub reason: String,
}

/// Balances kept in memory. Debits never take a balance below zero.
#[derive(Default)]
pub struct InMemoryLedger {
    balances: DashMap<ProviderKey, i64>,
    entries: Mutex<Vec<LedgerEntry>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn credit(&self, provider: &ProviderRef, amount: i64, reason: &str) {
        let key = provider.key();
        *self.balances.entry(key.clone()).or_insert(0) += amount;
        self.entries.lock().await.push(LedgerEntry {
            provider: key,
            amount,
            reason: reason.to_string(),
        });
    }

    pub fn balance(&self, provider: &ProviderRef) -> i64 {
        self.balances.get(&provider.key()).map_or(0, |b| *b)
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn debit(
        &self,
        provider: &ProviderRef,
        amount: i64,
        reason: &str,
    ) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError(format!("negative debit {amount}")));
        }
        let key = provider.key();
        {
            let mut balance = self.balances.entry(key.clone()).or_insert(0);
            if *balance < amount {
                return Err(LedgerError(format!(
                    "insufficient balance for {key}: {} < {amount}",
                    *balance
                )));
            }
            *balance -= amount;
        }
        self.entries.lock().await.push(LedgerEntry {
            provider: key,
            amount: -amount,
            reason: reason.to_string(),
        });
        Ok(())
    }
}
