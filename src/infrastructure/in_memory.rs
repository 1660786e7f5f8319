use crate::domain::actor::{AuditEntity, AuditEntry};
use crate::domain::balance::{Balance, BalanceHistoryEntry, BalanceKey};
use crate::domain::merchant::{CommissionRate, ExchangeRate, MerchantStore};
use crate::domain::order::{
    IncomingOrder, IncomingOrderUpdate, NewIncomingOrder, NewOrderHistory, OrderHistory,
    OrderHistoryStatus, OrderHistoryUpdate, PaymentSession, SessionStatus,
};
use crate::domain::ports::{Store, StoreTx};
use crate::domain::requisite::{Candidate, CandidateQuery, Requisite, RequisiteLimits, Trader};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    IncomingOrder(i64),
    PaymentSession(String),
    OrderHistory(i64),
    Requisite(i64),
    Balance(BalanceKey),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::IncomingOrder(id) => write!(f, "incoming order {id}"),
            RowKey::PaymentSession(token) => write!(f, "payment session {token}"),
            RowKey::OrderHistory(id) => write!(f, "order history {id}"),
            RowKey::Requisite(id) => write!(f, "requisite {id}"),
            RowKey::Balance(key) => write!(f, "balance of {key}"),
        }
    }
}

#[derive(Default)]
struct Tables {
    traders: HashMap<i64, Trader>,
    requisites: BTreeMap<i64, Requisite>,
    limits: HashMap<i64, RequisiteLimits>,
    stores: HashMap<i64, MerchantStore>,
    store_commissions: Vec<CommissionRate>,
    trader_commissions: Vec<CommissionRate>,
    exchange_rates: Vec<ExchangeRate>,
    incoming_orders: BTreeMap<i64, IncomingOrder>,
    sessions: HashMap<String, PaymentSession>,
    histories: BTreeMap<i64, OrderHistory>,
    balances: BTreeMap<BalanceKey, Balance>,
    balance_history: Vec<BalanceHistoryEntry>,
    audit: Vec<AuditEntry>,
}

fn latest(rates: &[CommissionRate], owner_id: i64) -> Option<CommissionRate> {
    rates
        .iter()
        .filter(|r| r.owner_id == owner_id)
        .max_by_key(|r| r.updated_at)
        .cloned()
}

struct Shared {
    tables: RwLock<Tables>,
    locks: std::sync::Mutex<HashMap<RowKey, Arc<Mutex<()>>>>,
    next_incoming_id: AtomicI64,
    next_history_id: AtomicI64,
    available: AtomicBool,
    lock_timeout: Duration,
}

impl Shared {
    fn row_lock(&self, key: &RowKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.clone()).or_default().clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PaymentError::StorageError("in-memory store is offline".into()))
        }
    }
}

/// A transactional store kept entirely in memory.
///
/// Writes are staged per transaction and applied atomically on commit. Row
/// locks are per-row async mutexes held by the transaction until it ends, with
/// a bounded wait that surfaces as `LockTimeoutError`.
#[derive(Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }
}

impl InMemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::default(),
                locks: std::sync::Mutex::default(),
                next_incoming_id: AtomicI64::new(1),
                next_history_id: AtomicI64::new(1),
                available: AtomicBool::new(true),
                lock_timeout,
            }),
        }
    }

    /// Simulates an outage: while unavailable, `begin` and `commit` fail with
    /// a retryable storage error.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    pub async fn insert_trader(&self, trader: Trader) {
        self.shared
            .tables
            .write()
            .await
            .traders
            .insert(trader.id, trader);
    }

    pub async fn insert_requisite(&self, requisite: Requisite, limits: RequisiteLimits) {
        let mut tables = self.shared.tables.write().await;
        tables.limits.insert(requisite.id, limits);
        tables.requisites.insert(requisite.id, requisite);
    }

    pub async fn insert_merchant_store(&self, store: MerchantStore) {
        self.shared
            .tables
            .write()
            .await
            .stores
            .insert(store.id, store);
    }

    pub async fn insert_store_commission(&self, rate: CommissionRate) {
        self.shared.tables.write().await.store_commissions.push(rate);
    }

    pub async fn insert_trader_commission(&self, rate: CommissionRate) {
        self.shared.tables.write().await.trader_commissions.push(rate);
    }

    pub async fn insert_exchange_rate(&self, rate: ExchangeRate) {
        self.shared.tables.write().await.exchange_rates.push(rate);
    }

    pub async fn seed_balance(&self, key: BalanceKey, balance: Balance) {
        self.shared.tables.write().await.balances.insert(key, balance);
    }

    pub async fn requisite(&self, id: i64) -> Option<Requisite> {
        self.shared.tables.read().await.requisites.get(&id).cloned()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        self.shared.check_available()?;
        Ok(Box::new(InMemoryTx {
            shared: self.shared.clone(),
            guards: HashMap::new(),
            staged: Staged::default(),
        }))
    }
}

#[derive(Default)]
struct Staged {
    incoming_orders: BTreeMap<i64, IncomingOrder>,
    sessions: HashMap<String, PaymentSession>,
    histories: BTreeMap<i64, OrderHistory>,
    requisite_touches: HashMap<i64, DateTime<Utc>>,
    balances: BTreeMap<BalanceKey, Balance>,
    balance_history: Vec<BalanceHistoryEntry>,
    audit: Vec<AuditEntry>,
}

impl Staged {
    fn order(&self, t: &Tables, id: i64) -> Option<IncomingOrder> {
        self.incoming_orders
            .get(&id)
            .or_else(|| t.incoming_orders.get(&id))
            .cloned()
    }

    fn session(&self, t: &Tables, token: &str) -> Option<PaymentSession> {
        self.sessions
            .get(token)
            .or_else(|| t.sessions.get(token))
            .cloned()
    }

    fn history(&self, t: &Tables, id: i64) -> Option<OrderHistory> {
        self.histories
            .get(&id)
            .or_else(|| t.histories.get(&id))
            .cloned()
    }

    fn balance(&self, t: &Tables, key: &BalanceKey) -> Option<Balance> {
        self.balances
            .get(key)
            .or_else(|| t.balances.get(key))
            .copied()
    }

    /// Committed rows overlaid with this transaction's writes.
    fn histories(&self, t: &Tables) -> Vec<OrderHistory> {
        let mut merged = t.histories.clone();
        merged.extend(self.histories.clone());
        merged.into_values().collect()
    }
}

/// A unit of work on an `InMemoryStore`. Dropping it discards staged writes
/// and releases its row locks.
pub struct InMemoryTx {
    shared: Arc<Shared>,
    guards: HashMap<RowKey, OwnedMutexGuard<()>>,
    staged: Staged,
}

impl InMemoryTx {
    async fn lock_row(&mut self, key: RowKey) -> Result<()> {
        if self.guards.contains_key(&key) {
            return Ok(());
        }
        let mutex = self.shared.row_lock(&key);
        let guard = tokio::time::timeout(self.shared.lock_timeout, mutex.lock_owned())
            .await
            .map_err(|_| PaymentError::LockTimeoutError(key.to_string()))?;
        self.guards.insert(key, guard);
        Ok(())
    }

    fn try_lock_row(&mut self, key: RowKey) -> bool {
        if self.guards.contains_key(&key) {
            return true;
        }
        match self.shared.row_lock(&key).try_lock_owned() {
            Ok(guard) => {
                self.guards.insert(key, guard);
                true
            }
            Err(_) => false,
        }
    }

    async fn duplicate_of(&self, incoming_order_id: i64, own_id: i64) -> bool {
        let tables = self.shared.tables.read().await;
        tables
            .histories
            .values()
            .any(|h| h.incoming_order_id == incoming_order_id && h.id != own_id)
    }
}

#[async_trait]
impl StoreTx for InMemoryTx {
    async fn insert_incoming_order(&mut self, order: NewIncomingOrder) -> Result<IncomingOrder> {
        let id = self.shared.next_incoming_id.fetch_add(1, Ordering::SeqCst);
        let order = order.into_order(id, Utc::now());
        self.lock_row(RowKey::IncomingOrder(id)).await?;
        self.staged.incoming_orders.insert(id, order.clone());
        Ok(order)
    }

    async fn get_incoming_order(&mut self, id: i64) -> Result<Option<IncomingOrder>> {
        let tables = self.shared.tables.read().await;
        Ok(self.staged.order(&tables, id))
    }

    async fn lock_incoming_order(&mut self, id: i64) -> Result<Option<IncomingOrder>> {
        self.lock_row(RowKey::IncomingOrder(id)).await?;
        self.get_incoming_order(id).await
    }

    async fn update_incoming_order(
        &mut self,
        id: i64,
        update: &IncomingOrderUpdate,
    ) -> Result<IncomingOrder> {
        let mut order = self
            .get_incoming_order(id)
            .await?
            .ok_or_else(|| PaymentError::not_found("incoming order", id))?;
        update.apply(&mut order, Utc::now());
        self.staged.incoming_orders.insert(id, order.clone());
        Ok(order)
    }

    async fn list_incoming_orders(&mut self) -> Result<Vec<IncomingOrder>> {
        let tables = self.shared.tables.read().await;
        let mut merged = tables.incoming_orders.clone();
        merged.extend(self.staged.incoming_orders.clone());
        Ok(merged.into_values().collect())
    }

    async fn insert_payment_session(&mut self, session: PaymentSession) -> Result<()> {
        self.lock_row(RowKey::PaymentSession(session.token.clone()))
            .await?;
        self.staged.sessions.insert(session.token.clone(), session);
        Ok(())
    }

    async fn get_payment_session(&mut self, token: &str) -> Result<Option<PaymentSession>> {
        let tables = self.shared.tables.read().await;
        Ok(self.staged.session(&tables, token))
    }

    async fn find_payment_session(
        &mut self,
        incoming_order_id: i64,
    ) -> Result<Option<PaymentSession>> {
        let tables = self.shared.tables.read().await;
        let token = self
            .staged
            .sessions
            .values()
            .chain(tables.sessions.values())
            .find(|s| s.incoming_order_id == incoming_order_id)
            .map(|s| s.token.clone());
        Ok(token.and_then(|t| self.staged.session(&tables, &t)))
    }

    async fn lock_payment_session(&mut self, token: &str) -> Result<Option<PaymentSession>> {
        self.lock_row(RowKey::PaymentSession(token.to_string()))
            .await?;
        self.get_payment_session(token).await
    }

    async fn set_payment_session_status(
        &mut self,
        token: &str,
        status: SessionStatus,
    ) -> Result<()> {
        let mut session = self
            .get_payment_session(token)
            .await?
            .ok_or_else(|| PaymentError::not_found("payment session", token))?;
        session.status = status;
        self.staged.sessions.insert(token.to_string(), session);
        Ok(())
    }

    async fn get_merchant_store(&mut self, store_id: i64) -> Result<Option<MerchantStore>> {
        Ok(self.shared.tables.read().await.stores.get(&store_id).cloned())
    }

    async fn latest_store_commission(&mut self, store_id: i64) -> Result<Option<CommissionRate>> {
        let tables = self.shared.tables.read().await;
        Ok(latest(&tables.store_commissions, store_id))
    }

    async fn latest_trader_commission(
        &mut self,
        trader_id: i64,
    ) -> Result<Option<CommissionRate>> {
        let tables = self.shared.tables.read().await;
        Ok(latest(&tables.trader_commissions, trader_id))
    }

    async fn latest_exchange_rate(
        &mut self,
        crypto_currency_id: i64,
        fiat_currency_id: i64,
    ) -> Result<Option<ExchangeRate>> {
        let tables = self.shared.tables.read().await;
        Ok(tables
            .exchange_rates
            .iter()
            .filter(|r| {
                r.crypto_currency_id == crypto_currency_id && r.fiat_currency_id == fiat_currency_id
            })
            .max_by_key(|r| r.updated_at)
            .cloned())
    }

    async fn lock_candidates(&mut self, query: &CandidateQuery) -> Result<Vec<Candidate>> {
        let mut eligible: Vec<Candidate> = {
            let tables = self.shared.tables.read().await;
            tables
                .requisites
                .values()
                .filter_map(|requisite| {
                    let trader = tables.traders.get(&requisite.trader_id)?;
                    let limits = tables.limits.get(&requisite.id)?;
                    if !query.admits(trader, requisite, limits) {
                        return None;
                    }
                    Some(Candidate {
                        requisite_id: requisite.id,
                        trader_id: trader.id,
                        trafic_priority: trader.trafic_priority,
                        last_used_at: self
                            .staged
                            .requisite_touches
                            .get(&requisite.id)
                            .copied()
                            .or(requisite.last_used_at),
                        limits: limits.clone(),
                    })
                })
                .collect()
        };
        eligible.sort_by(|a, b| a.routing_order(b));

        let mut locked = Vec::new();
        for candidate in eligible {
            if locked.len() >= query.limit {
                break;
            }
            if self.try_lock_row(RowKey::Requisite(candidate.requisite_id)) {
                locked.push(candidate);
            }
        }
        Ok(locked)
    }

    async fn completed_turnover(
        &mut self,
        requisite_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Decimal> {
        let tables = self.shared.tables.read().await;
        Ok(self
            .staged
            .histories(&tables)
            .iter()
            .filter(|h| {
                h.requisite_id == requisite_id
                    && h.status == OrderHistoryStatus::Completed
                    && h.completed_at.is_some_and(|at| at >= since)
            })
            .map(|h| h.total_fiat)
            .sum())
    }

    async fn touch_requisite(&mut self, requisite_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.lock_row(RowKey::Requisite(requisite_id)).await?;
        self.staged.requisite_touches.insert(requisite_id, at);
        Ok(())
    }

    async fn insert_order_history(&mut self, history: NewOrderHistory) -> Result<OrderHistory> {
        let incoming_order_id = history.incoming_order_id;
        let id = self.shared.next_history_id.fetch_add(1, Ordering::SeqCst);
        if self.duplicate_of(incoming_order_id, id).await
            || self
                .staged
                .histories
                .values()
                .any(|h| h.incoming_order_id == incoming_order_id)
        {
            return Err(PaymentError::DuplicateSettlementError { incoming_order_id });
        }
        let history = history.into_history(id, Utc::now());
        self.lock_row(RowKey::OrderHistory(id)).await?;
        self.staged.histories.insert(id, history.clone());
        Ok(history)
    }

    async fn get_order_history(&mut self, id: i64) -> Result<Option<OrderHistory>> {
        let tables = self.shared.tables.read().await;
        Ok(self.staged.history(&tables, id))
    }

    async fn lock_order_history(&mut self, id: i64) -> Result<Option<OrderHistory>> {
        self.lock_row(RowKey::OrderHistory(id)).await?;
        self.get_order_history(id).await
    }

    async fn find_order_history(
        &mut self,
        incoming_order_id: i64,
    ) -> Result<Option<OrderHistory>> {
        let tables = self.shared.tables.read().await;
        Ok(self
            .staged
            .histories(&tables)
            .into_iter()
            .find(|h| h.incoming_order_id == incoming_order_id))
    }

    async fn update_order_history(
        &mut self,
        id: i64,
        update: &OrderHistoryUpdate,
    ) -> Result<OrderHistory> {
        let mut history = self
            .get_order_history(id)
            .await?
            .ok_or_else(|| PaymentError::not_found("order history", id))?;
        update.apply(&mut history, Utc::now());
        self.staged.histories.insert(id, history.clone());
        Ok(history)
    }

    async fn lock_balance(&mut self, key: BalanceKey) -> Result<Balance> {
        self.lock_row(RowKey::Balance(key)).await?;
        let current = {
            let tables = self.shared.tables.read().await;
            self.staged.balance(&tables, &key)
        };
        Ok(match current {
            Some(balance) => balance,
            None => {
                self.staged.balances.insert(key, Balance::ZERO);
                Balance::ZERO
            }
        })
    }

    async fn set_balance(&mut self, key: BalanceKey, balance: Balance) -> Result<()> {
        self.staged.balances.insert(key, balance);
        Ok(())
    }

    async fn get_balance(&mut self, key: BalanceKey) -> Result<Option<Balance>> {
        let tables = self.shared.tables.read().await;
        Ok(self.staged.balance(&tables, &key))
    }

    async fn list_balances(&mut self) -> Result<Vec<(BalanceKey, Balance)>> {
        let tables = self.shared.tables.read().await;
        let mut merged = tables.balances.clone();
        merged.extend(self.staged.balances.clone());
        Ok(merged.into_iter().collect())
    }

    async fn append_balance_history(&mut self, entry: BalanceHistoryEntry) -> Result<()> {
        self.staged.balance_history.push(entry);
        Ok(())
    }

    async fn balance_history(&mut self, order_id: i64) -> Result<Vec<BalanceHistoryEntry>> {
        let tables = self.shared.tables.read().await;
        Ok(tables
            .balance_history
            .iter()
            .chain(self.staged.balance_history.iter())
            .filter(|e| e.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn append_audit(&mut self, entry: AuditEntry) -> Result<()> {
        self.staged.audit.push(entry);
        Ok(())
    }

    async fn audit_trail(&mut self, entity: AuditEntity, entity_id: i64) -> Result<Vec<AuditEntry>> {
        let tables = self.shared.tables.read().await;
        Ok(tables
            .audit
            .iter()
            .chain(self.staged.audit.iter())
            .filter(|e| e.entity == entity && e.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTx {
            shared,
            guards,
            staged,
        } = *self;
        shared.check_available()?;
        let mut tables = shared.tables.write().await;
        for history in staged.histories.values() {
            let duplicate = tables.histories.values().any(|h| {
                h.incoming_order_id == history.incoming_order_id && h.id != history.id
            });
            if duplicate {
                return Err(PaymentError::DuplicateSettlementError {
                    incoming_order_id: history.incoming_order_id,
                });
            }
        }
        tables.incoming_orders.extend(staged.incoming_orders);
        tables.sessions.extend(staged.sessions);
        tables.histories.extend(staged.histories);
        for (id, at) in staged.requisite_touches {
            if let Some(requisite) = tables.requisites.get_mut(&id) {
                requisite.last_used_at = Some(at);
            }
        }
        tables.balances.extend(staged.balances);
        tables.balance_history.extend(staged.balance_history);
        tables.audit.extend(staged.audit);
        drop(tables);
        drop(guards);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{IncomingOrderStatus, OrderType};
    use rust_decimal_macros::dec;

    fn new_order() -> NewIncomingOrder {
        NewIncomingOrder {
            merchant_id: 1,
            store_id: 1,
            order_type: OrderType::PayIn,
            amount_fiat: Some(dec!(100)),
            amount_crypto: None,
            fiat_currency_id: 1,
            crypto_currency_id: 1,
            target_method_id: None,
            customer_id: None,
            callback_url: None,
            status: IncomingOrderStatus::New,
        }
    }

    fn new_history(incoming_order_id: i64) -> NewOrderHistory {
        NewOrderHistory {
            incoming_order_id,
            merchant_id: 1,
            store_id: 1,
            requisite_id: 1,
            trader_id: 1,
            order_type: OrderType::PayIn,
            fiat_currency_id: 1,
            crypto_currency_id: 1,
            amount_fiat: Some(dec!(100)),
            amount_crypto: None,
            store_commission: dec!(1),
            trader_commission: dec!(1),
            exchange_rate: dec!(90),
            amount_currency: dec!(1.1),
            total_fiat: dec!(100),
        }
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = InMemoryStore::new();
        let id = {
            let mut tx = store.begin().await.unwrap();
            tx.insert_incoming_order(new_order()).await.unwrap().id
        };
        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_incoming_order(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let order = tx.insert_incoming_order(new_order()).await.unwrap();
        tx.update_incoming_order(
            order.id,
            &IncomingOrderUpdate::status(IncomingOrderStatus::Retrying),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let stored = tx.get_incoming_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IncomingOrderStatus::Retrying);
    }

    #[tokio::test]
    async fn test_row_lock_times_out() {
        let store = InMemoryStore::with_lock_timeout(Duration::from_millis(50));
        let mut tx = store.begin().await.unwrap();
        let order = tx.insert_incoming_order(new_order()).await.unwrap();
        tx.commit().await.unwrap();

        let mut holder = store.begin().await.unwrap();
        holder.lock_incoming_order(order.id).await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let result = waiter.lock_incoming_order(order.id).await;
        assert!(matches!(result, Err(PaymentError::LockTimeoutError(_))));

        drop(holder);
        assert!(waiter.lock_incoming_order(order.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_settlement_record_is_rejected() {
        let store = InMemoryStore::new();
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.insert_order_history(new_history(7)).await.unwrap();
        second.insert_order_history(new_history(7)).await.unwrap();
        first.commit().await.unwrap();

        let result = second.commit().await;
        assert!(matches!(
            result,
            Err(PaymentError::DuplicateSettlementError {
                incoming_order_id: 7
            })
        ));

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.insert_order_history(new_history(7)).await,
            Err(PaymentError::DuplicateSettlementError { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_balance_is_created_at_zero() {
        let store = InMemoryStore::new();
        let key = BalanceKey::Trader {
            trader_id: 1,
            fiat_currency_id: 1,
        };
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.lock_balance(key).await.unwrap(), Balance::ZERO);
        tx.set_balance(key, Balance::new(dec!(5))).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.get_balance(key).await.unwrap(),
            Some(Balance::new(dec!(5)))
        );
    }

    #[tokio::test]
    async fn test_offline_store_fails_retryably() {
        let store = InMemoryStore::new();
        store.set_available(false);
        let err = store.begin().await.err().unwrap();
        assert!(err.is_retryable());
    }
}
