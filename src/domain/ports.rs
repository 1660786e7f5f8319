use super::actor::{AuditEntity, AuditEntry, OrderEvent};
use super::balance::{Balance, BalanceHistoryEntry, BalanceKey};
use super::merchant::{CommissionRate, ExchangeRate, MerchantStore};
use super::order::{
    IncomingOrder, IncomingOrderUpdate, NewIncomingOrder, NewOrderHistory, OrderHistory,
    OrderHistoryUpdate, PaymentSession, SessionStatus,
};
use super::requisite::{Candidate, CandidateQuery};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

/// Opens units of work against the persistent state.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;
}

/// A single unit of work.
///
/// Row locks taken by `lock_*` methods are held until the transaction ends.
/// Dropping the transaction without calling `commit` rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    async fn insert_incoming_order(&mut self, order: NewIncomingOrder) -> Result<IncomingOrder>;
    async fn get_incoming_order(&mut self, id: i64) -> Result<Option<IncomingOrder>>;
    async fn lock_incoming_order(&mut self, id: i64) -> Result<Option<IncomingOrder>>;
    async fn update_incoming_order(
        &mut self,
        id: i64,
        update: &IncomingOrderUpdate,
    ) -> Result<IncomingOrder>;
    async fn list_incoming_orders(&mut self) -> Result<Vec<IncomingOrder>>;

    async fn insert_payment_session(&mut self, session: PaymentSession) -> Result<()>;
    async fn get_payment_session(&mut self, token: &str) -> Result<Option<PaymentSession>>;
    async fn find_payment_session(&mut self, incoming_order_id: i64)
    -> Result<Option<PaymentSession>>;
    async fn lock_payment_session(&mut self, token: &str) -> Result<Option<PaymentSession>>;
    async fn set_payment_session_status(&mut self, token: &str, status: SessionStatus)
    -> Result<()>;

    async fn get_merchant_store(&mut self, store_id: i64) -> Result<Option<MerchantStore>>;
    async fn latest_store_commission(&mut self, store_id: i64) -> Result<Option<CommissionRate>>;
    async fn latest_trader_commission(&mut self, trader_id: i64)
    -> Result<Option<CommissionRate>>;
    async fn latest_exchange_rate(
        &mut self,
        crypto_currency_id: i64,
        fiat_currency_id: i64,
    ) -> Result<Option<ExchangeRate>>;

    /// Locks up to `query.limit` eligible requisites in routing order, skipping
    /// rows another transaction holds.
    async fn lock_candidates(&mut self, query: &CandidateQuery) -> Result<Vec<Candidate>>;
    /// Sum of `total_fiat` over completed settlements on a requisite since `since`.
    async fn completed_turnover(&mut self, requisite_id: i64, since: DateTime<Utc>)
    -> Result<Decimal>;
    async fn touch_requisite(&mut self, requisite_id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Fails with `DuplicateSettlementError` at commit if the incoming order
    /// already has a settlement record.
    async fn insert_order_history(&mut self, history: NewOrderHistory) -> Result<OrderHistory>;
    async fn get_order_history(&mut self, id: i64) -> Result<Option<OrderHistory>>;
    async fn lock_order_history(&mut self, id: i64) -> Result<Option<OrderHistory>>;
    async fn find_order_history(&mut self, incoming_order_id: i64)
    -> Result<Option<OrderHistory>>;
    async fn update_order_history(
        &mut self,
        id: i64,
        update: &OrderHistoryUpdate,
    ) -> Result<OrderHistory>;

    /// Locks a balance row, creating it at zero when absent.
    async fn lock_balance(&mut self, key: BalanceKey) -> Result<Balance>;
    async fn set_balance(&mut self, key: BalanceKey, balance: Balance) -> Result<()>;
    async fn get_balance(&mut self, key: BalanceKey) -> Result<Option<Balance>>;
    async fn list_balances(&mut self) -> Result<Vec<(BalanceKey, Balance)>>;
    async fn append_balance_history(&mut self, entry: BalanceHistoryEntry) -> Result<()>;
    async fn balance_history(&mut self, order_id: i64) -> Result<Vec<BalanceHistoryEntry>>;

    async fn append_audit(&mut self, entry: AuditEntry) -> Result<()>;
    async fn audit_trail(&mut self, entity: AuditEntity, entity_id: i64)
    -> Result<Vec<AuditEntry>>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Key/value configuration source.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit(&self, event: OrderEvent) -> Result<()>;
}

/// Receipt upload target. Returns a URL for the stored object.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, filename: &str) -> Result<String>;
}

/// One unit of background work: route an incoming order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOrderJob {
    pub incoming_order_id: i64,
    /// Zero on first delivery.
    pub attempt: u32,
}

impl ProcessOrderJob {
    pub fn new(incoming_order_id: i64) -> Self {
        Self {
            incoming_order_id,
            attempt: 0,
        }
    }

    pub fn next_attempt(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job: ProcessOrderJob, delay: Duration) -> Result<()>;
}

pub type StoreRef = Arc<dyn Store>;
pub type ConfigRef = Arc<dyn ConfigProvider>;
pub type SinkRef = Arc<dyn NotificationSink>;
pub type StorageRef = Arc<dyn ObjectStorage>;
pub type QueueRef = Arc<dyn TaskQueue>;
