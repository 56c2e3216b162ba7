use std::collections::{HashSet, VecDeque};

use crate::bx::ledger::Transaction;
use crate::bx::pool::PoolError;

pub const MAX_PENDING_TRANSACTIONS: usize = 1_000;
pub const PROCESSED_ID_RETENTION: usize = 10_000;

/// Pending transactions awaiting inclusion, FIFO, plus the bounded record of
/// already-committed ids used to refuse replays.
#[derive(Debug, Default)]
pub struct Mempool {
    pending: VecDeque<Transaction>,
    pending_ids: HashSet<String>,
    processed_ids: HashSet<String>,
    processed_order: VecDeque<String>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admission pipeline: field validation first, then the deterministic id,
    /// then replay and capacity gates. Capacity is the only transient
    /// rejection; everything before it is permanent for this payload.
    pub fn submit(&mut self, tx: Transaction) -> Result<String, PoolError> {
        tx.validate()
            .map_err(|e| PoolError::Validation(e.to_string()))?;

        let id = tx.id();
        if self.pending_ids.contains(&id) || self.processed_ids.contains(&id) {
            return Err(PoolError::Replay(id));
        }
        if self.pending.len() >= MAX_PENDING_TRANSACTIONS {
            return Err(PoolError::PoolFull);
        }

        self.pending_ids.insert(id.clone());
        self.pending.push_back(tx);
        Ok(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.pending.iter().cloned().collect()
    }

    /// The first `limit` pending transactions in arrival order, cloned into a
    /// block template. They stay pending until the round actually commits.
    pub fn take_for_block(&self, limit: usize) -> Vec<Transaction> {
        self.pending.iter().take(limit).cloned().collect()
    }

    /// Called on block commit: drop the committed transactions from the
    /// pending queue and remember their ids for replay protection.
    pub fn mark_processed(&mut self, transactions: &[Transaction]) {
        let ids: HashSet<String> = transactions.iter().map(|tx| tx.id()).collect();
        self.pending.retain(|tx| !ids.contains(&tx.id()));
        self.pending_ids.retain(|id| !ids.contains(id));
        for id in ids {
            self.record_processed(id);
        }
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.processed_ids.contains(id)
    }

    // Retention is bounded; the oldest ids fall out first once the cap is
    // exceeded.
    pub(crate) fn record_processed(&mut self, id: String) {
        if self.processed_ids.insert(id.clone()) {
            self.processed_order.push_back(id);
            while self.processed_order.len() > PROCESSED_ID_RETENTION {
                if let Some(oldest) = self.processed_order.pop_front() {
                    self.processed_ids.remove(&oldest);
                }
            }
        }
    }
}
