//! Rebalance execution against the asset ledger.
//!
//! Turns approved weight targets into mint/burn operations. Execution is
//! single-flight system-wide: one rebalance at a time, concurrent callers are
//! rejected, and the flag is released on every exit path. There is no
//! rollback on an append-only ledger; a refused or failed operation is
//! surfaced through the receipt, not retried.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::ledger::{Ledger, LedgerError};

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("a rebalance is already executing")]
    AlreadyExecuting,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Outcome of one execution: balances before and after, plus the assets whose
/// ledger operation did not go through.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReceipt {
    pub proposal_id: String,
    pub pre_balances: HashMap<String, f64>,
    pub post_balances: HashMap<String, f64>,
    pub executed_at: i64,
    pub failed_assets: Vec<String>,
}

/// Per-asset adjustment = `target_weight * total_value - current_balance`,
/// over the union of weighted and held assets (a held asset with no target
/// weight is wound down). Adjustments below the materiality threshold come
/// back as zero.
pub fn calculate_adjustments(
    balances: &HashMap<String, f64>,
    weights: &HashMap<String, f64>,
    materiality_threshold: f64,
) -> BTreeMap<String, f64> {
    let total_value: f64 = balances.values().sum();

    let mut assets: BTreeMap<&str, ()> = BTreeMap::new();
    for asset in weights.keys().chain(balances.keys()) {
        assets.insert(asset.as_str(), ());
    }

    assets
        .into_keys()
        .map(|asset| {
            let target = weights.get(asset).copied().unwrap_or(0.0) * total_value;
            let current = balances.get(asset).copied().unwrap_or(0.0);
            let adjustment = target - current;
            let adjustment = if adjustment.abs() < materiality_threshold {
                0.0
            } else {
                adjustment
            };
            (asset.to_string(), adjustment)
        })
        .collect()
}

pub struct RebalanceExecutor {
    ledger: Arc<dyn Ledger>,
    materiality_threshold: f64,
    executing: AtomicBool,
}

impl RebalanceExecutor {
    pub fn new(ledger: Arc<dyn Ledger>, materiality_threshold: f64) -> Self {
        Self {
            ledger,
            materiality_threshold,
            executing: AtomicBool::new(false),
        }
    }

    /// True while an execution is in progress.
    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    /// Apply the target weights to the ledger and return the receipt.
    pub async fn execute(
        &self,
        proposal_id: &str,
        new_weights: &HashMap<String, f64>,
    ) -> Result<ExecutionReceipt, ExecutionError> {
        if self
            .executing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(proposal_id = %proposal_id, "rebalance rejected: one already executing");
            return Err(ExecutionError::AlreadyExecuting);
        }

        let result = self.run(proposal_id, new_weights).await;
        self.executing.store(false, Ordering::SeqCst);
        result
    }

    async fn run(
        &self,
        proposal_id: &str,
        new_weights: &HashMap<String, f64>,
    ) -> Result<ExecutionReceipt, ExecutionError> {
        let pre_balances = self.ledger.get_balances().await?;
        let adjustments =
            calculate_adjustments(&pre_balances, new_weights, self.materiality_threshold);

        let mut failed_assets = Vec::new();
        for (asset, adjustment) in &adjustments {
            if *adjustment == 0.0 {
                continue;
            }
            let outcome = if *adjustment > 0.0 {
                self.ledger.mint(asset, *adjustment).await
            } else {
                self.ledger.burn(asset, adjustment.abs()).await
            };
            match outcome {
                Ok(true) => {
                    info!(proposal_id = %proposal_id, asset = %asset, adjustment = adjustment, "adjustment applied");
                }
                Ok(false) => {
                    warn!(proposal_id = %proposal_id, asset = %asset, adjustment = adjustment, "ledger refused adjustment");
                    failed_assets.push(asset.clone());
                }
                Err(e) => {
                    warn!(proposal_id = %proposal_id, asset = %asset, error = %e, "ledger operation failed");
                    failed_assets.push(asset.clone());
                }
            }
        }

        let post_balances = self.ledger.get_balances().await?;
        Ok(ExecutionReceipt {
            proposal_id: proposal_id.to_string(),
            pre_balances,
            post_balances,
            executed_at: chrono::Utc::now().timestamp_millis(),
            failed_assets,
        })
    }
}
