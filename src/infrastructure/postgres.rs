use crate::domain::actor::{Actor, AuditEntity, AuditEntry, Role};
use crate::domain::balance::{Balance, BalanceHistoryEntry, BalanceKey, BalanceOperation};
use crate::domain::merchant::{CommissionRate, ExchangeRate, MerchantStore};
use crate::domain::order::{
    IncomingOrder, IncomingOrderUpdate, NewIncomingOrder, NewOrderHistory, OrderHistory,
    OrderHistoryUpdate, PaymentSession, SessionStatus,
};
use crate::domain::ports::{Store, StoreTx};
use crate::domain::requisite::{Candidate, CandidateQuery, RequisiteLimits};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const INCOMING_ORDER_COLUMNS: &str = "id, merchant_id, store_id, order_type, amount_fiat, \
    amount_crypto, fiat_currency_id, crypto_currency_id, target_method_id, customer_id, \
    callback_url, status, retry_count, failure_reason, last_attempt_at, created_at, updated_at";

const ORDER_HISTORY_COLUMNS: &str = "id, incoming_order_id, merchant_id, store_id, requisite_id, \
    trader_id, order_type, fiat_currency_id, crypto_currency_id, amount_fiat, amount_crypto, \
    store_commission, trader_commission, exchange_rate, amount_currency, total_fiat, status, \
    settlement, status_reason, client_receipt_url, trader_receipt_url, created_at, updated_at, \
    completed_at";

const SESSION_COLUMNS: &str =
    "token, incoming_order_id, status, amount_fiat_snapshot, currency_code_snapshot, expires_at";

/// Lock wait errors and deadlocks surface as retryable lock timeouts.
fn map_db_error(e: sqlx::Error) -> PaymentError {
    if let sqlx::Error::Database(db) = &e
        && matches!(db.code().as_deref(), Some("55P03") | Some("40P01"))
    {
        return PaymentError::LockTimeoutError(db.message().to_string());
    }
    PaymentError::DatabaseError(e)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn parse<T: FromStr<Err = PaymentError>>(row: &PgRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse()
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| PaymentError::StorageError(format!("negative value in column {column}")))
}

fn incoming_order(row: &PgRow) -> Result<IncomingOrder> {
    Ok(IncomingOrder {
        id: row.try_get("id")?,
        merchant_id: row.try_get("merchant_id")?,
        store_id: row.try_get("store_id")?,
        order_type: parse(row, "order_type")?,
        amount_fiat: row.try_get("amount_fiat")?,
        amount_crypto: row.try_get("amount_crypto")?,
        fiat_currency_id: row.try_get("fiat_currency_id")?,
        crypto_currency_id: row.try_get("crypto_currency_id")?,
        target_method_id: row.try_get("target_method_id")?,
        customer_id: row.try_get("customer_id")?,
        callback_url: row.try_get("callback_url")?,
        status: parse(row, "status")?,
        retry_count: to_u32(row.try_get("retry_count")?, "retry_count")?,
        failure_reason: row.try_get("failure_reason")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn order_history(row: &PgRow) -> Result<OrderHistory> {
    Ok(OrderHistory {
        id: row.try_get("id")?,
        incoming_order_id: row.try_get("incoming_order_id")?,
        merchant_id: row.try_get("merchant_id")?,
        store_id: row.try_get("store_id")?,
        requisite_id: row.try_get("requisite_id")?,
        trader_id: row.try_get("trader_id")?,
        order_type: parse(row, "order_type")?,
        fiat_currency_id: row.try_get("fiat_currency_id")?,
        crypto_currency_id: row.try_get("crypto_currency_id")?,
        amount_fiat: row.try_get("amount_fiat")?,
        amount_crypto: row.try_get("amount_crypto")?,
        store_commission: row.try_get("store_commission")?,
        trader_commission: row.try_get("trader_commission")?,
        exchange_rate: row.try_get("exchange_rate")?,
        amount_currency: row.try_get("amount_currency")?,
        total_fiat: row.try_get("total_fiat")?,
        status: parse(row, "status")?,
        settlement: parse(row, "settlement")?,
        status_reason: row.try_get("status_reason")?,
        client_receipt_url: row.try_get("client_receipt_url")?,
        trader_receipt_url: row.try_get("trader_receipt_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn payment_session(row: &PgRow) -> Result<PaymentSession> {
    Ok(PaymentSession {
        token: row.try_get("token")?,
        incoming_order_id: row.try_get("incoming_order_id")?,
        status: parse(row, "status")?,
        amount_fiat_snapshot: row.try_get("amount_fiat_snapshot")?,
        currency_code_snapshot: row.try_get("currency_code_snapshot")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn commission_rate(row: &PgRow) -> Result<CommissionRate> {
    Ok(CommissionRate {
        owner_id: row.try_get("owner_id")?,
        commission_pay_in: row.try_get("commission_pay_in")?,
        commission_pay_out: row.try_get("commission_pay_out")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn balance_key(row: &PgRow) -> Result<BalanceKey> {
    let kind: String = row.try_get("owner_kind")?;
    let owner_id: i64 = row.try_get("owner_id")?;
    let currency_id: i64 = row.try_get("currency_id")?;
    match kind.as_str() {
        "store" => Ok(BalanceKey::Store {
            store_id: owner_id,
            crypto_currency_id: currency_id,
        }),
        "trader" => Ok(BalanceKey::Trader {
            trader_id: owner_id,
            fiat_currency_id: currency_id,
        }),
        other => Err(PaymentError::StorageError(format!(
            "unknown balance owner kind '{other}'"
        ))),
    }
}

/// Table and key columns of a balance row.
fn balance_table(key: &BalanceKey) -> (&'static str, &'static str, &'static str) {
    match key {
        BalanceKey::Store { .. } => ("store_balances", "store_id", "crypto_currency_id"),
        BalanceKey::Trader { .. } => ("trader_balances", "trader_id", "fiat_currency_id"),
    }
}

/// PostgreSQL-backed store.
///
/// Row locks map to `SELECT ... FOR UPDATE`, candidate selection to
/// `FOR UPDATE SKIP LOCKED`, and lock waits are bounded per transaction with
/// `SET LOCAL lock_timeout`.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, lock_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool, lock_timeout })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let mut tx = self.pool.begin().await?;
        let timeout = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&timeout).execute(&mut *tx).await?;
        Ok(Box::new(PostgresTx { tx }))
    }
}

pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

impl PostgresTx {
    async fn fetch_incoming_order(&mut self, id: i64, lock: bool) -> Result<Option<IncomingOrder>> {
        let sql = format!(
            "SELECT {INCOMING_ORDER_COLUMNS} FROM incoming_orders WHERE id = $1{}",
            if lock { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(incoming_order).transpose()
    }

    async fn fetch_order_history(&mut self, id: i64, lock: bool) -> Result<Option<OrderHistory>> {
        let sql = format!(
            "SELECT {ORDER_HISTORY_COLUMNS} FROM order_history WHERE id = $1{}",
            if lock { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(order_history).transpose()
    }

    async fn fetch_session(&mut self, token: &str, lock: bool) -> Result<Option<PaymentSession>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM payment_sessions WHERE token = $1{}",
            if lock { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(token)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(payment_session).transpose()
    }
}

#[async_trait]
impl StoreTx for PostgresTx {
    async fn insert_incoming_order(&mut self, order: NewIncomingOrder) -> Result<IncomingOrder> {
        let sql = format!(
            "INSERT INTO incoming_orders (merchant_id, store_id, order_type, amount_fiat, \
             amount_crypto, fiat_currency_id, crypto_currency_id, target_method_id, customer_id, \
             callback_url, status) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {INCOMING_ORDER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(order.merchant_id)
            .bind(order.store_id)
            .bind(order.order_type.as_str())
            .bind(order.amount_fiat)
            .bind(order.amount_crypto)
            .bind(order.fiat_currency_id)
            .bind(order.crypto_currency_id)
            .bind(order.target_method_id)
            .bind(order.customer_id)
            .bind(order.callback_url)
            .bind(order.status.as_str())
            .fetch_one(&mut *self.tx)
            .await?;
        incoming_order(&row)
    }

    async fn get_incoming_order(&mut self, id: i64) -> Result<Option<IncomingOrder>> {
        self.fetch_incoming_order(id, false).await
    }

    async fn lock_incoming_order(&mut self, id: i64) -> Result<Option<IncomingOrder>> {
        self.fetch_incoming_order(id, true).await
    }

    async fn update_incoming_order(
        &mut self,
        id: i64,
        update: &IncomingOrderUpdate,
    ) -> Result<IncomingOrder> {
        let mut order = self
            .fetch_incoming_order(id, false)
            .await?
            .ok_or_else(|| PaymentError::not_found("incoming order", id))?;
        update.apply(&mut order, Utc::now());
        let retry_count = i32::try_from(order.retry_count).unwrap_or(i32::MAX);
        sqlx::query(
            "UPDATE incoming_orders SET status = $2, retry_count = $3, failure_reason = $4, \
             last_attempt_at = $5, updated_at = $6 WHERE id = $1",
        )
        .bind(id)
        .bind(order.status.as_str())
        .bind(retry_count)
        .bind(&order.failure_reason)
        .bind(order.last_attempt_at)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(order)
    }

    async fn list_incoming_orders(&mut self) -> Result<Vec<IncomingOrder>> {
        let sql = format!("SELECT {INCOMING_ORDER_COLUMNS} FROM incoming_orders ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
        rows.iter().map(incoming_order).collect()
    }

    async fn insert_payment_session(&mut self, session: PaymentSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO payment_sessions (token, incoming_order_id, status, \
             amount_fiat_snapshot, currency_code_snapshot, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&session.token)
        .bind(session.incoming_order_id)
        .bind(session.status.as_str())
        .bind(session.amount_fiat_snapshot)
        .bind(&session.currency_code_snapshot)
        .bind(session.expires_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_payment_session(&mut self, token: &str) -> Result<Option<PaymentSession>> {
        self.fetch_session(token, false).await
    }

    async fn find_payment_session(
        &mut self,
        incoming_order_id: i64,
    ) -> Result<Option<PaymentSession>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM payment_sessions WHERE incoming_order_id = $1");
        let row = sqlx::query(&sql)
            .bind(incoming_order_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(payment_session).transpose()
    }

    async fn lock_payment_session(&mut self, token: &str) -> Result<Option<PaymentSession>> {
        self.fetch_session(token, true).await
    }

    async fn set_payment_session_status(
        &mut self,
        token: &str,
        status: SessionStatus,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE payment_sessions SET status = $2 WHERE token = $1")
            .bind(token)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PaymentError::not_found("payment session", token));
        }
        Ok(())
    }

    async fn get_merchant_store(&mut self, store_id: i64) -> Result<Option<MerchantStore>> {
        let row = sqlx::query(
            "SELECT s.id, s.merchant_id, s.crypto_currency_id, s.fiat_currency_id, \
             f.code AS fiat_currency_code, s.lower_limit, s.upper_limit, s.access, \
             s.pay_in_enabled, s.pay_out_enabled \
             FROM merchant_stores s JOIN fiat_currencies f ON f.id = s.fiat_currency_id \
             WHERE s.id = $1",
        )
        .bind(store_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|row| {
            Ok(MerchantStore {
                id: row.try_get("id")?,
                merchant_id: row.try_get("merchant_id")?,
                crypto_currency_id: row.try_get("crypto_currency_id")?,
                fiat_currency_id: row.try_get("fiat_currency_id")?,
                fiat_currency_code: row.try_get("fiat_currency_code")?,
                lower_limit: row.try_get("lower_limit")?,
                upper_limit: row.try_get("upper_limit")?,
                access: row.try_get("access")?,
                pay_in_enabled: row.try_get("pay_in_enabled")?,
                pay_out_enabled: row.try_get("pay_out_enabled")?,
            })
        })
        .transpose()
    }

    async fn latest_store_commission(&mut self, store_id: i64) -> Result<Option<CommissionRate>> {
        let row = sqlx::query(
            "SELECT store_id AS owner_id, commission_pay_in, commission_pay_out, updated_at \
             FROM store_commissions WHERE store_id = $1 ORDER BY updated_at DESC, id DESC LIMIT 1",
        )
        .bind(store_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(commission_rate).transpose()
    }

    async fn latest_trader_commission(
        &mut self,
        trader_id: i64,
    ) -> Result<Option<CommissionRate>> {
        let row = sqlx::query(
            "SELECT trader_id AS owner_id, commission_pay_in, commission_pay_out, updated_at \
             FROM trader_commissions WHERE trader_id = $1 ORDER BY updated_at DESC, id DESC LIMIT 1",
        )
        .bind(trader_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(commission_rate).transpose()
    }

    async fn latest_exchange_rate(
        &mut self,
        crypto_currency_id: i64,
        fiat_currency_id: i64,
    ) -> Result<Option<ExchangeRate>> {
        let row = sqlx::query(
            "SELECT crypto_currency_id, fiat_currency_id, rate, updated_at FROM exchange_rates \
             WHERE crypto_currency_id = $1 AND fiat_currency_id = $2 \
             ORDER BY updated_at DESC, id DESC LIMIT 1",
        )
        .bind(crypto_currency_id)
        .bind(fiat_currency_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|row| {
            Ok(ExchangeRate {
                crypto_currency_id: row.try_get("crypto_currency_id")?,
                fiat_currency_id: row.try_get("fiat_currency_id")?,
                rate: row.try_get("rate")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn lock_candidates(&mut self, query: &CandidateQuery) -> Result<Vec<Candidate>> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT r.id AS requisite_id, r.trader_id, t.trafic_priority, r.last_used_at, \
             l.pay_in, l.pay_out, l.lower_limit, l.upper_limit, l.total_limit, \
             l.turnover_limit_minutes, l.turnover_day_max \
             FROM requisites r \
             JOIN traders t ON t.id = r.trader_id \
             JOIN users u ON u.id = t.user_id \
             JOIN requisite_limits l ON l.requisite_id = r.id \
             WHERE u.is_active AND t.in_work AND t.is_traffic_enabled_by_teamlead \
               AND r.status = 'approve' AND NOT r.is_excluded_from_distribution \
               AND r.fiat_currency_id = $1 \
               AND ($2::BIGINT IS NULL OR r.method_id = $2) \
               AND CASE WHEN $3 = 'pay_in' THEN l.pay_in ELSE l.pay_out END \
               AND l.lower_limit <= $4 AND l.upper_limit >= $4 \
             ORDER BY t.trafic_priority ASC, r.last_used_at ASC NULLS FIRST, r.id ASC \
             LIMIT $5 \
             FOR UPDATE OF r SKIP LOCKED",
        )
        .bind(query.fiat_currency_id)
        .bind(query.method_id)
        .bind(query.order_type.as_str())
        .bind(query.amount)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter()
            .map(|row| {
                let requisite_id: i64 = row.try_get("requisite_id")?;
                let minutes: i32 = row.try_get("turnover_limit_minutes")?;
                Ok(Candidate {
                    requisite_id,
                    trader_id: row.try_get("trader_id")?,
                    trafic_priority: row.try_get("trafic_priority")?,
                    last_used_at: row.try_get("last_used_at")?,
                    limits: RequisiteLimits {
                        requisite_id,
                        pay_in: row.try_get("pay_in")?,
                        pay_out: row.try_get("pay_out")?,
                        lower_limit: row.try_get("lower_limit")?,
                        upper_limit: row.try_get("upper_limit")?,
                        total_limit: row.try_get("total_limit")?,
                        turnover_limit_minutes: to_u32(minutes, "turnover_limit_minutes")?,
                        turnover_day_max: row.try_get("turnover_day_max")?,
                    },
                })
            })
            .collect()
    }

    async fn completed_turnover(
        &mut self,
        requisite_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Decimal> {
        let sum: Option<Decimal> = sqlx::query_scalar(
            "SELECT SUM(total_fiat) FROM order_history \
             WHERE requisite_id = $1 AND status = 'completed' AND completed_at >= $2",
        )
        .bind(requisite_id)
        .bind(since)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(sum.unwrap_or(Decimal::ZERO))
    }

    async fn touch_requisite(&mut self, requisite_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE requisites SET last_used_at = $2 WHERE id = $1")
            .bind(requisite_id)
            .bind(at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_order_history(&mut self, history: NewOrderHistory) -> Result<OrderHistory> {
        let incoming_order_id = history.incoming_order_id;
        let sql = format!(
            "INSERT INTO order_history (incoming_order_id, merchant_id, store_id, requisite_id, \
             trader_id, order_type, fiat_currency_id, crypto_currency_id, amount_fiat, \
             amount_crypto, store_commission, trader_commission, exchange_rate, amount_currency, \
             total_fiat, status, settlement) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
             $11, $12, $13, $14, $15, 'pending', 'unsettled') RETURNING {ORDER_HISTORY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(history.incoming_order_id)
            .bind(history.merchant_id)
            .bind(history.store_id)
            .bind(history.requisite_id)
            .bind(history.trader_id)
            .bind(history.order_type.as_str())
            .bind(history.fiat_currency_id)
            .bind(history.crypto_currency_id)
            .bind(history.amount_fiat)
            .bind(history.amount_crypto)
            .bind(history.store_commission)
            .bind(history.trader_commission)
            .bind(history.exchange_rate)
            .bind(history.amount_currency)
            .bind(history.total_fiat)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    PaymentError::DuplicateSettlementError { incoming_order_id }
                } else {
                    map_db_error(e)
                }
            })?;
        order_history(&row)
    }

    async fn get_order_history(&mut self, id: i64) -> Result<Option<OrderHistory>> {
        self.fetch_order_history(id, false).await
    }

    async fn lock_order_history(&mut self, id: i64) -> Result<Option<OrderHistory>> {
        self.fetch_order_history(id, true).await
    }

    async fn find_order_history(
        &mut self,
        incoming_order_id: i64,
    ) -> Result<Option<OrderHistory>> {
        let sql =
            format!("SELECT {ORDER_HISTORY_COLUMNS} FROM order_history WHERE incoming_order_id = $1");
        let row = sqlx::query(&sql)
            .bind(incoming_order_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(order_history).transpose()
    }

    async fn update_order_history(
        &mut self,
        id: i64,
        update: &OrderHistoryUpdate,
    ) -> Result<OrderHistory> {
        let mut history = self
            .fetch_order_history(id, false)
            .await?
            .ok_or_else(|| PaymentError::not_found("order history", id))?;
        update.apply(&mut history, Utc::now());
        sqlx::query(
            "UPDATE order_history SET status = $2, settlement = $3, status_reason = $4, \
             client_receipt_url = $5, trader_receipt_url = $6, completed_at = $7, \
             updated_at = $8 WHERE id = $1",
        )
        .bind(id)
        .bind(history.status.as_str())
        .bind(history.settlement.as_str())
        .bind(&history.status_reason)
        .bind(&history.client_receipt_url)
        .bind(&history.trader_receipt_url)
        .bind(history.completed_at)
        .bind(history.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(history)
    }

    async fn lock_balance(&mut self, key: BalanceKey) -> Result<Balance> {
        let (table, owner, currency) = balance_table(&key);
        let insert = format!(
            "INSERT INTO {table} ({owner}, {currency}, balance) VALUES ($1, $2, 0) \
             ON CONFLICT ({owner}, {currency}) DO NOTHING"
        );
        sqlx::query(&insert)
            .bind(key.owner_id())
            .bind(key.currency_id())
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        let select = format!(
            "SELECT balance FROM {table} WHERE {owner} = $1 AND {currency} = $2 FOR UPDATE"
        );
        let balance: Decimal = sqlx::query_scalar(&select)
            .bind(key.owner_id())
            .bind(key.currency_id())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        Ok(Balance::new(balance))
    }

    async fn set_balance(&mut self, key: BalanceKey, balance: Balance) -> Result<()> {
        let (table, owner, currency) = balance_table(&key);
        let sql = format!("UPDATE {table} SET balance = $3 WHERE {owner} = $1 AND {currency} = $2");
        sqlx::query(&sql)
            .bind(key.owner_id())
            .bind(key.currency_id())
            .bind(balance.0)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get_balance(&mut self, key: BalanceKey) -> Result<Option<Balance>> {
        let (table, owner, currency) = balance_table(&key);
        let sql = format!("SELECT balance FROM {table} WHERE {owner} = $1 AND {currency} = $2");
        let balance: Option<Decimal> = sqlx::query_scalar(&sql)
            .bind(key.owner_id())
            .bind(key.currency_id())
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(balance.map(Balance::new))
    }

    async fn list_balances(&mut self) -> Result<Vec<(BalanceKey, Balance)>> {
        let rows = sqlx::query(
            "SELECT 'store' AS owner_kind, store_id AS owner_id, crypto_currency_id AS currency_id, \
             balance FROM store_balances \
             UNION ALL \
             SELECT 'trader', trader_id, fiat_currency_id, balance FROM trader_balances \
             ORDER BY owner_kind, owner_id, currency_id",
        )
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| Ok((balance_key(row)?, Balance::new(row.try_get("balance")?))))
            .collect()
    }

    async fn append_balance_history(&mut self, entry: BalanceHistoryEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO balance_history (owner_kind, owner_id, currency_id, balance_change, \
             new_balance, operation_type, order_id, description, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.key.owner_kind())
        .bind(entry.key.owner_id())
        .bind(entry.key.currency_id())
        .bind(entry.balance_change)
        .bind(entry.new_balance.0)
        .bind(entry.operation_type.as_str())
        .bind(entry.order_id)
        .bind(&entry.description)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn balance_history(&mut self, order_id: i64) -> Result<Vec<BalanceHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT owner_kind, owner_id, currency_id, balance_change, new_balance, \
             operation_type, order_id, description, created_at \
             FROM balance_history WHERE order_id = $1 ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| {
                let operation: String = row.try_get("operation_type")?;
                Ok(BalanceHistoryEntry {
                    key: balance_key(row)?,
                    balance_change: row.try_get("balance_change")?,
                    new_balance: Balance::new(row.try_get("new_balance")?),
                    operation_type: BalanceOperation::parse(&operation).ok_or_else(|| {
                        PaymentError::StorageError(format!("unknown operation '{operation}'"))
                    })?,
                    order_id: row.try_get("order_id")?,
                    description: row.try_get("description")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn append_audit(&mut self, entry: AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (entity, entity_id, actor_id, actor_role, previous_status, \
             new_status, reason, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.entity.as_str())
        .bind(entry.entity_id)
        .bind(entry.actor.id)
        .bind(entry.actor.role.as_str())
        .bind(&entry.previous_status)
        .bind(&entry.new_status)
        .bind(&entry.reason)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn audit_trail(&mut self, entity: AuditEntity, entity_id: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT entity, entity_id, actor_id, actor_role, previous_status, new_status, reason, \
             created_at FROM audit_log WHERE entity = $1 AND entity_id = $2 ORDER BY id",
        )
        .bind(entity.as_str())
        .bind(entity_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| {
                let role: Role = parse(row, "actor_role")?;
                Ok(AuditEntry {
                    entity: parse(row, "entity")?,
                    entity_id: row.try_get("entity_id")?,
                    actor: Actor {
                        id: row.try_get("actor_id")?,
                        role,
                    },
                    previous_status: row.try_get("previous_status")?,
                    new_status: row.try_get("new_status")?,
                    reason: row.try_get("reason")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_db_error)
    }
}
