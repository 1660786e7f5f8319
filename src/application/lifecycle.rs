use crate::application::ledger::Ledger;
use crate::application::publish;
use crate::domain::actor::{Actor, AuditEntity, AuditEntry, OrderEvent, Role};
use crate::domain::order::{
    IncomingOrder, IncomingOrderStatus, IncomingOrderUpdate, OrderHistory, OrderHistoryStatus,
    OrderHistoryUpdate, OrderRef, OrderType, PaymentSession, SessionStatus,
};
use crate::domain::ports::{
    ProcessOrderJob, QueueRef, SinkRef, StorageRef, StoreRef, StoreTx,
};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// A receipt file attached to a confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub bytes: Vec<u8>,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientConfirmation {
    /// No requisite yet; the order was queued for routing.
    Queued { incoming_order_id: i64 },
    AwaitingTrader { order_history_id: i64 },
}

/// Writes the audit row and queues the notification for one status change.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn record(
    tx: &mut dyn StoreTx,
    actor: &Actor,
    entity: AuditEntity,
    entity_id: i64,
    from: Option<String>,
    to: String,
    reason: Option<String>,
    now: DateTime<Utc>,
    events: &mut Vec<OrderEvent>,
) -> Result<()> {
    tx.append_audit(AuditEntry {
        entity,
        entity_id,
        actor: actor.clone(),
        previous_status: from.clone(),
        new_status: to.clone(),
        reason: reason.clone(),
        created_at: now,
    })
    .await?;
    events.push(OrderEvent::StatusChanged {
        entity,
        entity_id,
        from,
        to,
        reason,
    });
    Ok(())
}

/// Applies `update` to an incoming order, auditing a status change if there is one.
pub(crate) async fn update_incoming(
    tx: &mut dyn StoreTx,
    order: &IncomingOrder,
    update: IncomingOrderUpdate,
    actor: &Actor,
    now: DateTime<Utc>,
    events: &mut Vec<OrderEvent>,
) -> Result<IncomingOrder> {
    let updated = tx.update_incoming_order(order.id, &update).await?;
    if updated.status != order.status {
        record(
            tx,
            actor,
            AuditEntity::IncomingOrder,
            order.id,
            Some(order.status.to_string()),
            updated.status.to_string(),
            update.failure_reason.flatten(),
            now,
            events,
        )
        .await?;
    }
    Ok(updated)
}

pub(crate) async fn update_history(
    tx: &mut dyn StoreTx,
    history: &OrderHistory,
    update: OrderHistoryUpdate,
    actor: &Actor,
    now: DateTime<Utc>,
    events: &mut Vec<OrderEvent>,
) -> Result<OrderHistory> {
    let updated = tx.update_order_history(history.id, &update).await?;
    if updated.status != history.status {
        record(
            tx,
            actor,
            AuditEntity::OrderHistory,
            history.id,
            Some(history.status.to_string()),
            updated.status.to_string(),
            update.status_reason,
            now,
            events,
        )
        .await?;
    }
    Ok(updated)
}

/// Moves a freshly created settlement record out of `pending`.
pub(crate) async fn advance_after_assignment(
    tx: &mut dyn StoreTx,
    history: &OrderHistory,
    client_confirmed: bool,
    now: DateTime<Utc>,
    events: &mut Vec<OrderEvent>,
) -> Result<OrderHistory> {
    let system = Actor::system();
    record(
        tx,
        &system,
        AuditEntity::OrderHistory,
        history.id,
        None,
        history.status.to_string(),
        None,
        now,
        events,
    )
    .await?;
    let next = match (history.order_type, client_confirmed) {
        (OrderType::PayOut, _) => OrderHistoryStatus::AwaitingPayoutProof,
        (OrderType::PayIn, true) => OrderHistoryStatus::PendingTraderConfirmation,
        (OrderType::PayIn, false) => OrderHistoryStatus::PendingClientConfirmation,
    };
    update_history(
        tx,
        history,
        OrderHistoryUpdate::status(next),
        &system,
        now,
        events,
    )
    .await
}

fn invalid(history: &OrderHistory, action: &'static str) -> PaymentError {
    PaymentError::InvalidTransitionError {
        entity: "order history",
        id: history.id,
        action,
        from: history.status.to_string(),
    }
}

fn invalid_incoming(order: &IncomingOrder, action: &'static str) -> PaymentError {
    PaymentError::InvalidTransitionError {
        entity: "incoming order",
        id: order.id,
        action,
        from: order.status.to_string(),
    }
}

fn forbid(actor: &Actor, action: &'static str) -> PaymentError {
    PaymentError::AuthorizationError {
        actor: actor.to_string(),
        action,
    }
}

fn require_reason(reason: &str) -> Result<String> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(PaymentError::ValidationError("A reason is required".into()));
    }
    Ok(reason.to_string())
}

fn is_party(actor: &Actor, history: &OrderHistory) -> bool {
    actor.is(Role::Merchant, history.merchant_id) || actor.is(Role::Trader, history.trader_id)
}

/// Guards and applies every post-admission status transition.
///
/// Locks are taken in a fixed order: payment session, incoming order,
/// settlement record, balances.
#[derive(Clone)]
pub struct LifecycleManager {
    store: StoreRef,
    storage: StorageRef,
    queue: QueueRef,
    sink: SinkRef,
}

impl LifecycleManager {
    pub fn new(store: StoreRef, storage: StorageRef, queue: QueueRef, sink: SinkRef) -> Self {
        Self {
            store,
            storage,
            queue,
            sink,
        }
    }

    async fn lock_pair(
        tx: &mut dyn StoreTx,
        order_history_id: i64,
    ) -> Result<(IncomingOrder, OrderHistory)> {
        let incoming_order_id = tx
            .get_order_history(order_history_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("order history", order_history_id))?
            .incoming_order_id;
        let order = tx
            .lock_incoming_order(incoming_order_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("incoming order", incoming_order_id))?;
        let history = tx
            .lock_order_history(order_history_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("order history", order_history_id))?;
        Ok((order, history))
    }

    /// The client reports having paid.
    ///
    /// Before assignment this marks the order as client-confirmed and queues
    /// it for routing. After assignment it hands the order to the trader.
    #[instrument(skip(self, receipt))]
    pub async fn confirm_by_client(
        &self,
        order_ref: OrderRef,
        actor: &Actor,
        receipt: Option<Receipt>,
    ) -> Result<ClientConfirmation> {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut tx = self.store.begin().await?;

        let session = match &order_ref {
            OrderRef::Token(token) => Some(
                tx.lock_payment_session(token)
                    .await?
                    .ok_or_else(|| PaymentError::not_found("payment session", token))?,
            ),
            OrderRef::Id(id) => match tx.find_payment_session(*id).await? {
                Some(s) => tx.lock_payment_session(&s.token).await?,
                None => None,
            },
        };
        if let Some(session) = &session {
            match session.status {
                SessionStatus::Active if session.is_expired(now) => {
                    self.expire_session(tx, session, now).await?;
                    return Err(PaymentError::SessionExpiredError {
                        token: session.token.clone(),
                    });
                }
                SessionStatus::Active => {}
                SessionStatus::Expired => {
                    return Err(PaymentError::SessionExpiredError {
                        token: session.token.clone(),
                    });
                }
                SessionStatus::Confirmed => {
                    return Err(PaymentError::InvalidTransitionError {
                        entity: "payment session",
                        id: session.incoming_order_id,
                        action: "confirm",
                        from: session.status.to_string(),
                    });
                }
            }
        }

        let incoming_order_id = match (&order_ref, &session) {
            (OrderRef::Id(id), _) => *id,
            (OrderRef::Token(_), Some(s)) => s.incoming_order_id,
            (OrderRef::Token(token), None) => {
                return Err(PaymentError::not_found("payment session", token));
            }
        };
        let order = tx
            .lock_incoming_order(incoming_order_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("incoming order", incoming_order_id))?;

        let allowed = matches!(actor.role, Role::Client | Role::System)
            || actor.role.is_staff()
            || actor.is(Role::Merchant, order.merchant_id);
        if !allowed {
            return Err(forbid(actor, "confirm payment"));
        }

        if let Some(found) = tx.find_order_history(incoming_order_id).await? {
            let history = tx
                .lock_order_history(found.id)
                .await?
                .ok_or_else(|| PaymentError::not_found("order history", found.id))?;
            if !history.status.awaits_client() {
                return Err(invalid(&history, "confirm payment"));
            }
            drop(tx);
            let receipt_url = match receipt {
                Some(r) => Some(self.storage.upload(r.bytes, &r.filename).await?),
                None => None,
            };
            return self
                .hand_to_trader(incoming_order_id, history.id, receipt_url, actor)
                .await;
        }

        if order.status == IncomingOrderStatus::ClientPaymentConfirmed {
            drop(tx);
            debug!(incoming_order_id, "Order already confirmed, queueing again");
        } else {
            if !order.status.accepts_client_confirmation() {
                return Err(invalid_incoming(&order, "confirm payment"));
            }
            if receipt.is_some() {
                debug!(incoming_order_id, "Receipt before assignment ignored");
            }
            update_incoming(
                tx.as_mut(),
                &order,
                IncomingOrderUpdate::status(IncomingOrderStatus::ClientPaymentConfirmed),
                actor,
                now,
                &mut events,
            )
            .await?;
            if let Some(session) = &session {
                tx.set_payment_session_status(&session.token, SessionStatus::Confirmed)
                    .await?;
            }
            tx.commit().await?;
            publish(&self.sink, events).await;
        }

        self.queue
            .enqueue(ProcessOrderJob::new(incoming_order_id), Duration::ZERO)
            .await?;
        info!(incoming_order_id, "Client confirmed payment before assignment");
        Ok(ClientConfirmation::Queued { incoming_order_id })
    }

    async fn expire_session(
        &self,
        mut tx: Box<dyn StoreTx>,
        session: &PaymentSession,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut events = Vec::new();
        tx.set_payment_session_status(&session.token, SessionStatus::Expired)
            .await?;
        record(
            tx.as_mut(),
            &Actor::system(),
            AuditEntity::PaymentSession,
            session.incoming_order_id,
            Some(session.status.to_string()),
            SessionStatus::Expired.to_string(),
            None,
            now,
            &mut events,
        )
        .await?;
        tx.commit().await?;
        publish(&self.sink, events).await;
        Ok(())
    }

    async fn hand_to_trader(
        &self,
        incoming_order_id: i64,
        order_history_id: i64,
        receipt_url: Option<String>,
        actor: &Actor,
    ) -> Result<ClientConfirmation> {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut tx = self.store.begin().await?;
        if let Some(session) = tx.find_payment_session(incoming_order_id).await?
            && let Some(session) = tx.lock_payment_session(&session.token).await?
            && session.status == SessionStatus::Active
        {
            tx.set_payment_session_status(&session.token, SessionStatus::Confirmed)
                .await?;
        }
        let (_, history) = Self::lock_pair(tx.as_mut(), order_history_id).await?;
        if !history.status.awaits_client() {
            return Err(invalid(&history, "confirm payment"));
        }
        let update = OrderHistoryUpdate {
            client_receipt_url: receipt_url,
            ..OrderHistoryUpdate::status(OrderHistoryStatus::PendingTraderConfirmation)
        };
        update_history(tx.as_mut(), &history, update, actor, now, &mut events).await?;
        tx.commit().await?;
        publish(&self.sink, events).await;
        info!(order_history_id, "Client confirmed payment");
        Ok(ClientConfirmation::AwaitingTrader { order_history_id })
    }

    /// The assigned trader confirms the funds moved. Completes and settles the order.
    #[instrument(skip(self, receipt), fields(actor = %actor))]
    pub async fn confirm_by_trader(
        &self,
        order_history_id: i64,
        actor: &Actor,
        receipt: Receipt,
    ) -> Result<OrderHistory> {
        let check = |history: &OrderHistory| -> Result<()> {
            if !actor.is(Role::Trader, history.trader_id) {
                return Err(forbid(actor, "confirm as trader"));
            }
            if !history.status.awaits_trader() {
                return Err(invalid(history, "confirm as trader"));
            }
            Ok(())
        };

        {
            let mut tx = self.store.begin().await?;
            let history = tx
                .get_order_history(order_history_id)
                .await?
                .ok_or_else(|| PaymentError::not_found("order history", order_history_id))?;
            check(&history)?;
        }
        let receipt_url = self.storage.upload(receipt.bytes, &receipt.filename).await?;

        let now = Utc::now();
        let mut events = Vec::new();
        let mut tx = self.store.begin().await?;
        let (order, history) = Self::lock_pair(tx.as_mut(), order_history_id).await?;
        check(&history)?;

        let update = OrderHistoryUpdate {
            trader_receipt_url: Some(receipt_url),
            completed_at: Some(now),
            ..OrderHistoryUpdate::status(OrderHistoryStatus::Completed)
        };
        update_history(tx.as_mut(), &history, update, actor, now, &mut events).await?;
        Ledger::settle(tx.as_mut(), &history, now, &mut events).await?;
        update_incoming(
            tx.as_mut(),
            &order,
            IncomingOrderUpdate::status(IncomingOrderStatus::Processed),
            actor,
            now,
            &mut events,
        )
        .await?;
        let completed = tx
            .get_order_history(order_history_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("order history", order_history_id))?;
        tx.commit().await?;
        publish(&self.sink, events).await;
        info!(order_history_id, "Order completed by trader");
        Ok(completed)
    }

    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn cancel(
        &self,
        order_history_id: i64,
        actor: &Actor,
        reason: &str,
    ) -> Result<OrderHistory> {
        let reason = require_reason(reason)?;
        self.close(
            order_history_id,
            actor,
            "cancel",
            |actor, history| is_party(actor, history) || actor.role.is_staff(),
            |history| history.status.is_cancellable(),
            OrderHistoryStatus::Canceled,
            IncomingOrderStatus::Canceled,
            reason,
        )
        .await
    }

    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn fail(
        &self,
        order_history_id: i64,
        actor: &Actor,
        reason: &str,
    ) -> Result<OrderHistory> {
        let reason = require_reason(reason)?;
        self.close(
            order_history_id,
            actor,
            "fail",
            |actor, _| actor.role == Role::System || actor.role.is_staff(),
            |history| !history.status.is_terminal(),
            OrderHistoryStatus::Failed,
            IncomingOrderStatus::Failed,
            reason,
        )
        .await
    }

    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn dispute(
        &self,
        order_history_id: i64,
        actor: &Actor,
        reason: &str,
    ) -> Result<OrderHistory> {
        let reason = require_reason(reason)?;
        let now = Utc::now();
        let mut events = Vec::new();
        let mut tx = self.store.begin().await?;
        let (_, history) = Self::lock_pair(tx.as_mut(), order_history_id).await?;
        if !(is_party(actor, &history) || actor.role.is_staff()) {
            return Err(forbid(actor, "dispute"));
        }
        if !history.status.is_disputable() {
            return Err(invalid(&history, "dispute"));
        }
        let disputed = update_history(
            tx.as_mut(),
            &history,
            OrderHistoryUpdate::status(OrderHistoryStatus::Disputed).with_reason(reason),
            actor,
            now,
            &mut events,
        )
        .await?;
        tx.commit().await?;
        publish(&self.sink, events).await;
        info!(order_history_id, "Order disputed");
        Ok(disputed)
    }

    /// Staff decision on a dispute.
    ///
    /// Resolving to `completed` settles the order if it never was; resolving
    /// to `canceled` or `failed` reverses a prior settlement.
    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn resolve_dispute(
        &self,
        order_history_id: i64,
        actor: &Actor,
        resolution: OrderHistoryStatus,
        notes: &str,
    ) -> Result<OrderHistory> {
        if !actor.role.is_staff() {
            return Err(forbid(actor, "resolve dispute"));
        }
        if !resolution.is_resolution() {
            return Err(PaymentError::ValidationError(format!(
                "'{resolution}' is not a dispute resolution"
            )));
        }
        let notes = require_reason(notes)?;
        let now = Utc::now();
        let mut events = Vec::new();
        let mut tx = self.store.begin().await?;
        let (order, history) = Self::lock_pair(tx.as_mut(), order_history_id).await?;
        if history.status != OrderHistoryStatus::Disputed {
            return Err(invalid(&history, "resolve dispute"));
        }

        let incoming_status = match resolution {
            OrderHistoryStatus::Completed => {
                Ledger::settle(tx.as_mut(), &history, now, &mut events).await?;
                IncomingOrderStatus::Processed
            }
            OrderHistoryStatus::Canceled => {
                Ledger::reverse(tx.as_mut(), &history, now, &mut events).await?;
                IncomingOrderStatus::Canceled
            }
            _ => {
                Ledger::reverse(tx.as_mut(), &history, now, &mut events).await?;
                IncomingOrderStatus::Failed
            }
        };
        let update = OrderHistoryUpdate {
            completed_at: (resolution == OrderHistoryStatus::Completed
                && history.completed_at.is_none())
            .then_some(now),
            ..OrderHistoryUpdate::status(resolution).with_reason(notes.clone())
        };
        update_history(tx.as_mut(), &history, update, actor, now, &mut events).await?;
        let mut order_update = IncomingOrderUpdate::status(incoming_status);
        if incoming_status != IncomingOrderStatus::Processed {
            order_update = order_update.with_reason(notes);
        }
        update_incoming(tx.as_mut(), &order, order_update, actor, now, &mut events).await?;
        let resolved = tx
            .get_order_history(order_history_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("order history", order_history_id))?;
        tx.commit().await?;
        publish(&self.sink, events).await;
        info!(order_history_id, %resolution, "Dispute resolved");
        Ok(resolved)
    }

    /// Cancels an order that has not been assigned a requisite yet.
    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn cancel_incoming_order(
        &self,
        incoming_order_id: i64,
        actor: &Actor,
        reason: &str,
    ) -> Result<IncomingOrder> {
        let reason = require_reason(reason)?;
        let now = Utc::now();
        let mut events = Vec::new();
        let mut tx = self.store.begin().await?;
        let order = tx
            .lock_incoming_order(incoming_order_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("incoming order", incoming_order_id))?;
        if !(actor.is(Role::Merchant, order.merchant_id) || actor.role.is_staff()) {
            return Err(forbid(actor, "cancel order"));
        }
        let cancellable = matches!(
            order.status,
            IncomingOrderStatus::New
                | IncomingOrderStatus::PaymentSessionActive
                | IncomingOrderStatus::Retrying
        );
        if !cancellable || tx.find_order_history(incoming_order_id).await?.is_some() {
            return Err(invalid_incoming(&order, "cancel"));
        }
        let canceled = update_incoming(
            tx.as_mut(),
            &order,
            IncomingOrderUpdate::status(IncomingOrderStatus::Canceled).with_reason(reason),
            actor,
            now,
            &mut events,
        )
        .await?;
        tx.commit().await?;
        publish(&self.sink, events).await;
        Ok(canceled)
    }

    #[allow(clippy::too_many_arguments)]
    async fn close(
        &self,
        order_history_id: i64,
        actor: &Actor,
        action: &'static str,
        authorized: impl Fn(&Actor, &OrderHistory) -> bool,
        from_allowed: impl Fn(&OrderHistory) -> bool,
        status: OrderHistoryStatus,
        incoming_status: IncomingOrderStatus,
        reason: String,
    ) -> Result<OrderHistory> {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut tx = self.store.begin().await?;
        let (order, history) = Self::lock_pair(tx.as_mut(), order_history_id).await?;
        if !authorized(actor, &history) {
            return Err(forbid(actor, action));
        }
        if !from_allowed(&history) {
            return Err(invalid(&history, action));
        }
        Ledger::reverse(tx.as_mut(), &history, now, &mut events).await?;
        let closed = update_history(
            tx.as_mut(),
            &history,
            OrderHistoryUpdate::status(status).with_reason(reason.clone()),
            actor,
            now,
            &mut events,
        )
        .await?;
        update_incoming(
            tx.as_mut(),
            &order,
            IncomingOrderUpdate::status(incoming_status).with_reason(reason),
            actor,
            now,
            &mut events,
        )
        .await?;
        tx.commit().await?;
        publish(&self.sink, events).await;
        info!(order_history_id, %status, "Order closed");
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_is_trimmed_and_required() {
        assert_eq!(require_reason("  fraud ").unwrap(), "fraud");
        assert!(matches!(
            require_reason("   "),
            Err(PaymentError::ValidationError(_))
        ));
    }
}
