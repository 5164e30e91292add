//! Append-only transaction log
//!
//! Records are appended by the store inside its commit critical section,
//! one per successful mutation, and never edited afterwards. Identifiers
//! are assigned sequentially from the persisted record count.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use crate::ledger::{LedgerBackend, LedgerError};
use crate::models::{TradeSide, TransactionRecord};

/// Everything a record needs except its id and timestamp, which the log
/// assigns at append time.
#[derive(Debug, Clone)]
pub struct TransactionDraft {
    pub userid: String,
    pub stock_symbol: String,
    pub side: TradeSide,
    pub shares: u64,
    pub price_per_share: Decimal,
    pub initiator: String,
}

#[derive(Clone)]
pub struct TransactionLog {
    backend: Arc<dyn LedgerBackend>,
}

impl TransactionLog {
    pub fn new(backend: Arc<dyn LedgerBackend>) -> Self {
        Self { backend }
    }

    /// Append one record and return it with its assigned id. Callers must
    /// hold the store's commit lock; the log itself does no locking.
    pub async fn append(&self, draft: TransactionDraft) -> Result<TransactionRecord, LedgerError> {
        let mut records = self.backend.load_transactions().await?;

        let record = TransactionRecord {
            id: next_id(&records),
            userid: draft.userid,
            stock_symbol: draft.stock_symbol,
            side: draft.side,
            shares: draft.shares,
            price_per_share: draft.price_per_share,
            date: Utc::now(),
            initiator: draft.initiator,
        };

        info!(
            id = %record.id,
            userid = %record.userid,
            symbol = %record.stock_symbol,
            side = ?record.side,
            shares = record.shares,
            "Appending transaction record"
        );

        records.push(record.clone());
        self.backend.persist_transactions(&records).await?;
        Ok(record)
    }

    /// Remove a record whose account-side commit failed. Only the store's
    /// persist-failure path may call this.
    pub(crate) async fn retract(&self, id: &str) -> Result<(), LedgerError> {
        let mut records = self.backend.load_transactions().await?;
        records.retain(|record| record.id != id);
        self.backend.persist_transactions(&records).await
    }

    pub async fn records_for(&self, userid: &str) -> Result<Vec<TransactionRecord>, LedgerError> {
        Ok(self
            .backend
            .load_transactions()
            .await?
            .into_iter()
            .filter(|record| record.userid == userid)
            .collect())
    }
}

/// Ids advance past the highest id ever persisted, not the record count,
/// so an id stays unique even after a retraction.
fn next_id(records: &[TransactionRecord]) -> String {
    let highest = records
        .iter()
        .filter_map(|record| record.id.strip_prefix("txn-")?.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    format!("txn-{:06}", highest + 1)
}
