//! Per-user ledger store
//!
//! Single writer of the account collection. Mutations are read-modify-write
//! over a snapshot of the whole collection, taken and persisted only while
//! holding the per-userid lock plus the store-wide commit lock, so no
//! interleaved mutation can be lost. The transaction log is written inside
//! the same critical section: an account change is never observable
//! without its record. The critical section runs on its own task, so a
//! cancelled caller cannot tear a commit mid-way.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::models::{TradeSide, TransactionRecord, UserAccount};

pub mod transactions;
pub use transactions::{TransactionDraft, TransactionLog};

/// Initiator recorded on agent-committed trades.
const AGENT_INITIATOR: &str = "agent";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("account not found: {0}")]
    NotFound(String),

    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    #[error("not enough {symbol} shares: hold {held}, asked to sell {requested}")]
    InsufficientShares {
        symbol: String,
        held: u64,
        requested: u64,
    },

    #[error("could not determine a price for {0}")]
    PriceUnavailable(String),

    #[error("trade quantity must be greater than zero")]
    InvalidQuantity,

    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Domain rejections are part of the tool-result contract and degrade
    /// to user-visible prose; storage errors fail the turn instead.
    pub fn is_domain_rejection(&self) -> bool {
        !matches!(self, LedgerError::Storage(_))
    }
}

/// The side effect a mutation asks the store to log.
#[derive(Debug, Clone)]
pub struct TradeEffect {
    pub symbol: String,
    pub side: TradeSide,
    pub shares: u64,
    pub price_per_share: Decimal,
}

/// A committed mutation: the new account state plus the record appended
/// for it (if the mutation carried a trade effect).
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub account: UserAccount,
    pub record: Option<TransactionRecord>,
}

/// Backing medium for accounts and transaction records. Implementations
/// persist whole collections; serialization of writers is the store's job.
#[async_trait::async_trait]
pub trait LedgerBackend: Send + Sync {
    async fn load_accounts(&self) -> Result<Vec<UserAccount>, LedgerError>;
    async fn persist_accounts(&self, accounts: &[UserAccount]) -> Result<(), LedgerError>;
    async fn load_transactions(&self) -> Result<Vec<TransactionRecord>, LedgerError>;
    async fn persist_transactions(&self, records: &[TransactionRecord])
        -> Result<(), LedgerError>;
}

/// Durable key-value store of user accounts with per-userid mutation
/// serialization and an append-only transaction log.
pub struct LedgerStore {
    backend: Arc<dyn LedgerBackend>,
    log: TransactionLog,
    /// Per-userid mutation locks: at most one in-flight mutation per user.
    user_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Commit lock for the whole-collection read-apply-persist cycle.
    store_lock: Arc<Mutex<()>>,
}

impl LedgerStore {
    pub fn new(backend: Arc<dyn LedgerBackend>) -> Self {
        Self {
            log: TransactionLog::new(backend.clone()),
            backend,
            user_locks: std::sync::Mutex::new(HashMap::new()),
            store_lock: Arc::new(Mutex::new(())),
        }
    }

    fn user_lock(&self, userid: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().expect("user lock registry poisoned");
        locks.entry(userid.to_string()).or_default().clone()
    }

    /// Apply `mutation` to a snapshot of the user's account and commit the
    /// result together with its transaction record. Later callers for the
    /// same userid observe the effects of earlier ones.
    ///
    /// The commit runs on a task of its own, joined here: if the caller is
    /// aborted mid-await, the record append and the account persist still
    /// finish (or roll back) together, never one without the other.
    pub async fn mutate_account<F>(
        &self,
        userid: &str,
        mutation: F,
    ) -> Result<MutationOutcome, LedgerError>
    where
        F: FnOnce(&UserAccount) -> Result<(UserAccount, Option<TradeEffect>), LedgerError>
            + Send
            + 'static,
    {
        let user_lock = self.user_lock(userid);
        let store_lock = self.store_lock.clone();
        let backend = self.backend.clone();
        let log = self.log.clone();
        let userid = userid.to_string();

        let commit = tokio::spawn(async move {
            let _user_guard = user_lock.lock_owned().await;
            let _commit_guard = store_lock.lock_owned().await;

            let mut accounts = backend.load_accounts().await?;
            let index = accounts
                .iter()
                .position(|account| account.userid == userid)
                .ok_or_else(|| LedgerError::NotFound(userid.clone()))?;

            let (updated, effect) = mutation(&accounts[index])?;

            debug_assert!(updated.bank_balance >= Decimal::ZERO);
            debug_assert!(updated.portfolio.values().all(|&count| count > 0));

            // Record first, account second: a committed account change must
            // never be observable without its record.
            let record = match effect {
                Some(effect) => Some(
                    log.append(TransactionDraft {
                        userid: userid.clone(),
                        stock_symbol: effect.symbol,
                        side: effect.side,
                        shares: effect.shares,
                        price_per_share: effect.price_per_share,
                        initiator: AGENT_INITIATOR.to_string(),
                    })
                    .await?,
                ),
                None => None,
            };

            accounts[index] = updated.clone();
            if let Err(error) = backend.persist_accounts(&accounts).await {
                if let Some(record) = &record {
                    if let Err(rollback) = log.retract(&record.id).await {
                        warn!(record_id = %record.id, %rollback, "Transaction rollback failed after account persist error");
                    }
                }
                return Err(error);
            }

            debug!(%userid, record = ?record.as_ref().map(|r| r.id.as_str()), "Ledger mutation committed");

            Ok(MutationOutcome {
                account: updated,
                record,
            })
        });

        commit
            .await
            .map_err(|e| LedgerError::Storage(format!("commit task failed: {}", e)))?
    }

    /// Debit the balance and credit the position at the given price.
    pub async fn buy(
        &self,
        userid: &str,
        symbol: &str,
        quantity: u64,
        price: Decimal,
    ) -> Result<MutationOutcome, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity);
        }
        let symbol = symbol.to_string();

        self.mutate_account(userid, move |account| {
            let cost = price * Decimal::from(quantity);
            if account.bank_balance < cost {
                return Err(LedgerError::InsufficientBalance {
                    required: cost,
                    available: account.bank_balance,
                });
            }

            let mut updated = account.clone();
            updated.bank_balance -= cost;
            *updated.portfolio.entry(symbol.clone()).or_insert(0) += quantity;

            Ok((
                updated,
                Some(TradeEffect {
                    symbol,
                    side: TradeSide::Buy,
                    shares: quantity,
                    price_per_share: price,
                }),
            ))
        })
        .await
    }

    /// Credit the balance and debit the position, removing the symbol key
    /// when the holding reaches zero.
    pub async fn sell(
        &self,
        userid: &str,
        symbol: &str,
        quantity: u64,
        price: Decimal,
    ) -> Result<MutationOutcome, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity);
        }
        let symbol = symbol.to_string();

        self.mutate_account(userid, move |account| {
            let held = account.shares_held(&symbol);
            if held < quantity {
                return Err(LedgerError::InsufficientShares {
                    symbol: symbol.clone(),
                    held,
                    requested: quantity,
                });
            }

            let mut updated = account.clone();
            updated.bank_balance += price * Decimal::from(quantity);
            let remaining = held - quantity;
            if remaining == 0 {
                updated.portfolio.remove(&symbol);
            } else {
                updated.portfolio.insert(symbol.clone(), remaining);
            }

            Ok((
                updated,
                Some(TradeEffect {
                    symbol,
                    side: TradeSide::Sell,
                    shares: quantity,
                    price_per_share: price,
                }),
            ))
        })
        .await
    }

    /// Read-only snapshot of one account.
    pub async fn profile(&self, userid: &str) -> Result<UserAccount, LedgerError> {
        self.backend
            .load_accounts()
            .await?
            .into_iter()
            .find(|account| account.userid == userid)
            .ok_or_else(|| LedgerError::NotFound(userid.to_string()))
    }

    /// Read-only snapshot of all accounts.
    pub async fn accounts(&self) -> Result<Vec<UserAccount>, LedgerError> {
        self.backend.load_accounts().await
    }

    /// Read-only listing of one user's transaction records.
    pub async fn transactions_for(
        &self,
        userid: &str,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        self.log.records_for(userid).await
    }

    /// Seed the backing store with starter accounts when it is empty.
    pub async fn seed_if_empty(&self, accounts: Vec<UserAccount>) -> Result<(), LedgerError> {
        let _commit_guard = self.store_lock.lock().await;
        if self.backend.load_accounts().await?.is_empty() {
            self.backend.persist_accounts(&accounts).await?;
        }
        Ok(())
    }
}

//
// ================= Backends =================
//

/// In-memory backend for development and tests.
#[derive(Default)]
pub struct InMemoryBackend {
    accounts: RwLock<Vec<UserAccount>>,
    transactions: RwLock<Vec<TransactionRecord>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: Vec<UserAccount>) -> Self {
        Self {
            accounts: RwLock::new(accounts),
            transactions: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl LedgerBackend for InMemoryBackend {
    async fn load_accounts(&self) -> Result<Vec<UserAccount>, LedgerError> {
        Ok(self.accounts.read().await.clone())
    }

    async fn persist_accounts(&self, accounts: &[UserAccount]) -> Result<(), LedgerError> {
        *self.accounts.write().await = accounts.to_vec();
        Ok(())
    }

    async fn load_transactions(&self) -> Result<Vec<TransactionRecord>, LedgerError> {
        Ok(self.transactions.read().await.clone())
    }

    async fn persist_transactions(
        &self,
        records: &[TransactionRecord],
    ) -> Result<(), LedgerError> {
        *self.transactions.write().await = records.to_vec();
        Ok(())
    }
}

/// JSON-file backend: one file for accounts, one append-growing file for
/// transaction records. Writes go to a temp file and are renamed into
/// place so a crashed write never truncates the collection.
pub struct JsonFileBackend {
    accounts_path: PathBuf,
    transactions_path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            accounts_path: data_dir.join("user_data.json"),
            transactions_path: data_dir.join("user_transaction.json"),
        }
    }

    async fn load_collection<T: serde::de::DeserializeOwned>(
        path: &Path,
    ) -> Result<Vec<T>, LedgerError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                LedgerError::Storage(format!("{} is corrupt: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(LedgerError::Storage(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn persist_collection<T: serde::Serialize>(
        path: &Path,
        items: &[T],
    ) -> Result<(), LedgerError> {
        let json = serde_json::to_string_pretty(items)
            .map_err(|e| LedgerError::Storage(format!("serialization failed: {}", e)))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                LedgerError::Storage(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(|e| {
            LedgerError::Storage(format!("failed to write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            LedgerError::Storage(format!("failed to replace {}: {}", path.display(), e))
        })
    }
}

#[async_trait::async_trait]
impl LedgerBackend for JsonFileBackend {
    async fn load_accounts(&self) -> Result<Vec<UserAccount>, LedgerError> {
        Self::load_collection(&self.accounts_path).await
    }

    async fn persist_accounts(&self, accounts: &[UserAccount]) -> Result<(), LedgerError> {
        Self::persist_collection(&self.accounts_path, accounts).await
    }

    async fn load_transactions(&self) -> Result<Vec<TransactionRecord>, LedgerError> {
        Self::load_collection(&self.transactions_path).await
    }

    async fn persist_transactions(
        &self,
        records: &[TransactionRecord],
    ) -> Result<(), LedgerError> {
        Self::persist_collection(&self.transactions_path, records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn store_with(account: UserAccount) -> LedgerStore {
        LedgerStore::new(Arc::new(InMemoryBackend::with_accounts(vec![account])))
    }

    #[tokio::test]
    async fn test_buy_debits_balance_and_credits_position() {
        let store = store_with(UserAccount::new("U1", dec!(1000)));

        let outcome = store.buy("U1", "AAPL", 5, dec!(100)).await.unwrap();

        assert_eq!(outcome.account.bank_balance, dec!(500));
        assert_eq!(outcome.account.shares_held("AAPL"), 5);

        let record = outcome.record.unwrap();
        assert_eq!(record.side, TradeSide::Buy);
        assert_eq!(record.shares, 5);
        assert_eq!(record.price_per_share, dec!(100));
        assert_eq!(store.transactions_for("U1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sell_credits_balance_and_removes_emptied_key() {
        let store = store_with(UserAccount::new("U1", dec!(1000)));
        store.buy("U1", "AAPL", 5, dec!(100)).await.unwrap();

        let outcome = store.sell("U1", "AAPL", 5, dec!(120)).await.unwrap();

        assert_eq!(outcome.account.bank_balance, dec!(1100));
        assert!(outcome.account.portfolio.is_empty());
        assert_eq!(outcome.record.unwrap().side, TradeSide::Sell);

        let records = store.transactions_for("U1").await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_sell_keeps_remaining_shares() {
        let store = store_with(UserAccount::new("U1", dec!(1000)));
        store.buy("U1", "AAPL", 5, dec!(100)).await.unwrap();

        let outcome = store.sell("U1", "AAPL", 2, dec!(100)).await.unwrap();
        assert_eq!(outcome.account.shares_held("AAPL"), 3);
    }

    #[tokio::test]
    async fn test_insufficient_balance_leaves_account_unchanged() {
        let store = store_with(UserAccount::new("U1", dec!(1000)));

        let error = store.buy("U1", "TSLA", 1000, dec!(250)).await.unwrap_err();
        assert!(matches!(error, LedgerError::InsufficientBalance { .. }));
        assert!(error.is_domain_rejection());

        let account = store.profile("U1").await.unwrap();
        assert_eq!(account.bank_balance, dec!(1000));
        assert!(account.portfolio.is_empty());
        assert!(store.transactions_for("U1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_shares_rejected() {
        let store = store_with(UserAccount::new("U1", dec!(1000)));
        store.buy("U1", "AAPL", 2, dec!(100)).await.unwrap();

        let error = store.sell("U1", "AAPL", 5, dec!(100)).await.unwrap_err();
        assert!(matches!(
            error,
            LedgerError::InsufficientShares {
                held: 2,
                requested: 5,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let store = store_with(UserAccount::new("U1", dec!(1000)));
        assert!(matches!(
            store.buy("nobody", "AAPL", 1, dec!(1)).await.unwrap_err(),
            LedgerError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_zero_quantity_rejected() {
        let store = store_with(UserAccount::new("U1", dec!(1000)));
        assert_eq!(
            store.buy("U1", "AAPL", 0, dec!(100)).await.unwrap_err(),
            LedgerError::InvalidQuantity
        );
    }

    #[tokio::test]
    async fn test_concurrent_same_user_mutations_lose_no_updates() {
        let store = Arc::new(store_with(UserAccount::new("U1", dec!(1000))));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.buy("U1", "AAPL", 1, dec!(100)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let account = store.profile("U1").await.unwrap();
        assert_eq!(account.bank_balance, dec!(600));
        assert_eq!(account.shares_held("AAPL"), 4);
        assert_eq!(store.transactions_for("U1").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_different_users_both_commit() {
        let backend = InMemoryBackend::with_accounts(vec![
            UserAccount::new("U1", dec!(500)),
            UserAccount::new("U2", dec!(500)),
        ]);
        let store = Arc::new(LedgerStore::new(Arc::new(backend)));

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.buy("U1", "AAPL", 1, dec!(100)).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.buy("U2", "TSLA", 2, dec!(50)).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(store.profile("U1").await.unwrap().bank_balance, dec!(400));
        assert_eq!(store.profile("U2").await.unwrap().bank_balance, dec!(400));
    }

    #[tokio::test]
    async fn test_aborted_caller_cannot_tear_a_commit() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use tokio::sync::Notify;

        // Delegating backend that stalls the first account persist until
        // released, signalling when the stall begins.
        struct GatedBackend {
            inner: InMemoryBackend,
            entered: Arc<Notify>,
            release: Arc<Notify>,
            stalled_once: AtomicBool,
        }

        #[async_trait::async_trait]
        impl LedgerBackend for GatedBackend {
            async fn load_accounts(&self) -> Result<Vec<UserAccount>, LedgerError> {
                self.inner.load_accounts().await
            }

            async fn persist_accounts(
                &self,
                accounts: &[UserAccount],
            ) -> Result<(), LedgerError> {
                if !self.stalled_once.swap(true, Ordering::SeqCst) {
                    self.entered.notify_one();
                    self.release.notified().await;
                }
                self.inner.persist_accounts(accounts).await
            }

            async fn load_transactions(&self) -> Result<Vec<TransactionRecord>, LedgerError> {
                self.inner.load_transactions().await
            }

            async fn persist_transactions(
                &self,
                records: &[TransactionRecord],
            ) -> Result<(), LedgerError> {
                self.inner.persist_transactions(records).await
            }
        }

        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let backend = Arc::new(GatedBackend {
            inner: InMemoryBackend::with_accounts(vec![UserAccount::new("U1", dec!(1000))]),
            entered: entered.clone(),
            release: release.clone(),
            stalled_once: AtomicBool::new(false),
        });
        let store = Arc::new(LedgerStore::new(backend));

        // Record is already appended by the time the account persist stalls.
        let caller = {
            let store = store.clone();
            tokio::spawn(async move { store.buy("U1", "AAPL", 5, dec!(100)).await })
        };
        entered.notified().await;

        // Abort the caller mid-commit, then let the persist proceed.
        caller.abort();
        release.notify_one();

        // The commit must land whole: record and account change together.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let account = store.profile("U1").await.unwrap();
            if account.bank_balance == dec!(500) {
                assert_eq!(account.shares_held("AAPL"), 5);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "commit never landed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.transactions_for("U1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_json_file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(JsonFileBackend::new(dir.path()));
        let store = LedgerStore::new(backend.clone());

        store
            .seed_if_empty(vec![UserAccount::new("U1", dec!(1000))])
            .await
            .unwrap();
        store.buy("U1", "AAPL", 5, dec!(100)).await.unwrap();

        // A fresh store over the same files sees the committed state.
        let reopened = LedgerStore::new(Arc::new(JsonFileBackend::new(dir.path())));
        let account = reopened.profile("U1").await.unwrap();
        assert_eq!(account.bank_balance, dec!(500));
        assert_eq!(account.shares_held("AAPL"), 5);
        assert_eq!(reopened.transactions_for("U1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_accounts_file_surfaces_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("user_data.json"), "not json").unwrap();

        let store = LedgerStore::new(Arc::new(JsonFileBackend::new(dir.path())));
        let error = store.profile("U1").await.unwrap_err();
        assert!(matches!(error, LedgerError::Storage(_)));
        assert!(!error.is_domain_rejection());
    }
}
