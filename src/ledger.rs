//! Consumed asset-ledger interface.
//!
//! The ledger's token semantics are external; the executor only needs balance
//! queries plus mint/burn. A mint/burn returning `Ok(false)` means the ledger
//! refused the operation, distinct from a transport-level `Err`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("balance query failed: {0}")]
    Query(String),
    #[error("ledger operation on '{asset}' failed: {reason}")]
    Operation { asset: String, reason: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current balance per asset.
    async fn get_balances(&self) -> Result<HashMap<String, f64>, LedgerError>;

    /// Increase an asset's supply. `Ok(false)` means the ledger refused.
    async fn mint(&self, asset: &str, amount: f64) -> Result<bool, LedgerError>;

    /// Decrease an asset's supply. `Ok(false)` means the ledger refused.
    async fn burn(&self, asset: &str, amount: f64) -> Result<bool, LedgerError>;
}

/// In-memory ledger for the sandbox run mode and tests. Burning more than the
/// available balance is refused, mirroring a real supply-backed ledger.
#[derive(Default)]
pub struct MemoryLedger {
    balances: Mutex<HashMap<String, f64>>,
    operations: AtomicU64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balances(balances: HashMap<String, f64>) -> Self {
        Self {
            balances: Mutex::new(balances),
            operations: AtomicU64::new(0),
        }
    }

    /// Count of mint/burn calls seen, refused ones included.
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn get_balances(&self) -> Result<HashMap<String, f64>, LedgerError> {
        Ok(self.balances.lock().unwrap().clone())
    }

    async fn mint(&self, asset: &str, amount: f64) -> Result<bool, LedgerError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if amount < 0.0 {
            return Ok(false);
        }
        let mut balances = self.balances.lock().unwrap();
        *balances.entry(asset.to_string()).or_insert(0.0) += amount;
        debug!(asset = %asset, amount = amount, "minted");
        Ok(true)
    }

    async fn burn(&self, asset: &str, amount: f64) -> Result<bool, LedgerError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if amount < 0.0 {
            return Ok(false);
        }
        let mut balances = self.balances.lock().unwrap();
        match balances.get_mut(asset) {
            Some(balance) if *balance >= amount => {
                *balance -= amount;
                debug!(asset = %asset, amount = amount, "burned");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
