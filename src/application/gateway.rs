use crate::application::lifecycle::record;
use crate::application::publish;
use crate::application::settings::Settings;
use crate::domain::actor::{Actor, AuditEntity, Role};
use crate::domain::balance::Amount;
use crate::domain::order::{
    IncomingOrderStatus, NewIncomingOrder, OrderHistoryStatus, OrderRef, OrderType,
    PaymentSession, SessionStatus,
};
use crate::domain::ports::{ProcessOrderJob, QueueRef, SinkRef, StoreRef};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// A merchant's payment request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOrder {
    pub merchant_id: i64,
    pub store_id: i64,
    pub order_type: OrderType,
    /// Fiat for pay-in, crypto for pay-out.
    pub amount: Decimal,
    pub target_method_id: Option<i64>,
    pub customer_id: Option<String>,
    pub callback_url: Option<String>,
    /// Pay-in only: open a hosted payment page for the client.
    pub hosted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submitted {
    pub incoming_order_id: i64,
    pub status: IncomingOrderStatus,
    pub payment_token: Option<String>,
    pub payment_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// What a status poller sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub incoming_order_id: i64,
    pub status: IncomingOrderStatus,
    pub order_history_id: Option<i64>,
    pub order_history_status: Option<OrderHistoryStatus>,
    pub failure_reason: Option<String>,
    pub session_status: Option<SessionStatus>,
    /// Present only while the payment session can still be used.
    pub payment_url: Option<String>,
}

/// Merchant and client facing entry points.
#[derive(Clone)]
pub struct PaymentGateway {
    store: StoreRef,
    queue: QueueRef,
    settings: Settings,
    sink: SinkRef,
    payment_base_url: String,
}

impl PaymentGateway {
    pub fn new(
        store: StoreRef,
        queue: QueueRef,
        settings: Settings,
        sink: SinkRef,
        payment_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            settings,
            sink,
            payment_base_url: payment_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn payment_url(&self, token: &str) -> String {
        format!("{}/pay/{}", self.payment_base_url, token)
    }

    /// Validates and persists a new order.
    ///
    /// Direct orders are queued for routing right away. Hosted pay-in orders
    /// wait for the client to confirm on the payment page.
    #[instrument(skip(self, request), fields(store_id = request.store_id, order_type = %request.order_type))]
    pub async fn submit(&self, request: SubmitOrder) -> Result<Submitted> {
        let amount = Amount::new(request.amount)?.value();
        if request.hosted && request.order_type == OrderType::PayOut {
            return Err(PaymentError::ValidationError(
                "Hosted payment pages are only available for pay-in".into(),
            ));
        }

        let now = Utc::now();
        let mut events = Vec::new();
        let mut tx = self.store.begin().await?;
        let store = tx
            .get_merchant_store(request.store_id)
            .await?
            .ok_or_else(|| {
                PaymentError::ValidationError(format!("Unknown store {}", request.store_id))
            })?;
        let merchant = Actor::new(Role::Merchant, request.merchant_id);
        if store.merchant_id != request.merchant_id {
            return Err(PaymentError::AuthorizationError {
                actor: merchant.to_string(),
                action: "submit orders for this store",
            });
        }
        if !store.accepts(request.order_type) {
            return Err(PaymentError::ValidationError(format!(
                "Store {} does not accept {} orders",
                store.id, request.order_type
            )));
        }
        if amount < store.lower_limit || amount > store.upper_limit {
            return Err(PaymentError::ValidationError(format!(
                "Amount {} is outside the store limits {}..{}",
                amount, store.lower_limit, store.upper_limit
            )));
        }

        let (amount_fiat, amount_crypto) = match request.order_type {
            OrderType::PayIn => (Some(amount), None),
            OrderType::PayOut => (None, Some(amount)),
        };
        let status = if request.hosted {
            IncomingOrderStatus::PaymentSessionActive
        } else {
            IncomingOrderStatus::New
        };
        let order = tx
            .insert_incoming_order(NewIncomingOrder {
                merchant_id: request.merchant_id,
                store_id: store.id,
                order_type: request.order_type,
                amount_fiat,
                amount_crypto,
                fiat_currency_id: store.fiat_currency_id,
                crypto_currency_id: store.crypto_currency_id,
                target_method_id: request.target_method_id,
                customer_id: request.customer_id,
                callback_url: request.callback_url,
                status,
            })
            .await?;
        record(
            tx.as_mut(),
            &merchant,
            AuditEntity::IncomingOrder,
            order.id,
            None,
            order.status.to_string(),
            None,
            now,
            &mut events,
        )
        .await?;

        let session = if request.hosted {
            let session = PaymentSession {
                token: Uuid::new_v4().to_string(),
                incoming_order_id: order.id,
                status: SessionStatus::Active,
                amount_fiat_snapshot: amount,
                currency_code_snapshot: store.fiat_currency_code.clone(),
                expires_at: now + self.settings.session_ttl().await,
            };
            tx.insert_payment_session(session.clone()).await?;
            Some(session)
        } else {
            None
        };
        tx.commit().await?;
        publish(&self.sink, events).await;

        if session.is_none() {
            self.queue
                .enqueue(ProcessOrderJob::new(order.id), Duration::ZERO)
                .await?;
        }
        info!(incoming_order_id = order.id, %status, "Order admitted");
        Ok(Submitted {
            incoming_order_id: order.id,
            status,
            payment_url: session.as_ref().map(|s| self.payment_url(&s.token)),
            expires_at: session.as_ref().map(|s| s.expires_at),
            payment_token: session.map(|s| s.token),
        })
    }

    /// Read-only status lookup by order id or session token.
    pub async fn get_status(&self, order_ref: &OrderRef) -> Result<StatusView> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let session = match order_ref {
            OrderRef::Token(token) => Some(
                tx.get_payment_session(token)
                    .await?
                    .ok_or_else(|| PaymentError::not_found("payment session", token))?,
            ),
            OrderRef::Id(id) => tx.find_payment_session(*id).await?,
        };
        let id = match (order_ref, &session) {
            (OrderRef::Id(id), _) => *id,
            (_, Some(s)) => s.incoming_order_id,
            (OrderRef::Token(token), None) => {
                return Err(PaymentError::not_found("payment session", token));
            }
        };
        let order = tx
            .get_incoming_order(id)
            .await?
            .ok_or_else(|| PaymentError::not_found("incoming order", id))?;
        let history = tx.find_order_history(id).await?;

        let session_status = session.as_ref().map(|s| {
            if s.status == SessionStatus::Active && s.is_expired(now) {
                SessionStatus::Expired
            } else {
                s.status
            }
        });
        let payment_url = session
            .as_ref()
            .filter(|_| session_status == Some(SessionStatus::Active))
            .map(|s| self.payment_url(&s.token));
        Ok(StatusView {
            incoming_order_id: order.id,
            status: order.status,
            order_history_id: history.as_ref().map(|h| h.id),
            order_history_status: history.as_ref().map(|h| h.status),
            failure_reason: order.failure_reason,
            session_status,
            payment_url,
        })
    }
}
