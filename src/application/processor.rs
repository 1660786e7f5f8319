use crate::application::fraud::{FraudDecision, FraudGate};
use crate::application::ledger::{self, Ledger};
use crate::application::lifecycle::{advance_after_assignment, update_incoming};
use crate::application::publish;
use crate::application::selector::{RequisiteSelector, RoutingRequest, Selection};
use crate::application::settings::Settings;
use crate::domain::actor::{Actor, OrderEvent};
use crate::domain::order::{
    IncomingOrder, IncomingOrderStatus, IncomingOrderUpdate, NewOrderHistory, OrderLike,
    OrderType,
};
use crate::domain::ports::{SinkRef, StoreRef, StoreTx};
use crate::error::{PaymentError, Result, Stage, StageExt};
use chrono::Utc;
use tracing::{error, info, instrument, warn};

pub const NO_REQUISITE_REASON: &str = "No suitable requisite found";
pub const MAX_RETRIES_REASON: &str = "max retries exceeded";

/// What a single processing attempt did to an order.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The order was not in a processable state or already had a settlement record.
    Skipped { status: IncomingOrderStatus },
    Assigned { order_history_id: i64 },
    Denied { reason: String },
    ManualReview { reason: String },
    /// No requisite was available; the order awaits another attempt.
    Retrying { retry_count: u32 },
    Failed { reason: String },
}

enum Attempt {
    Done(ProcessOutcome),
    NoRequisite,
}

/// Routes incoming orders to requisites.
///
/// Every attempt runs in one transaction: the order row is locked for the
/// whole attempt, so concurrent deliveries of the same job serialize and
/// the later one observes the first one's result.
#[derive(Clone)]
pub struct OrderProcessor {
    store: StoreRef,
    settings: Settings,
    fraud: FraudGate,
    sink: SinkRef,
}

impl OrderProcessor {
    pub fn new(store: StoreRef, settings: Settings, sink: SinkRef) -> Self {
        Self {
            store,
            fraud: FraudGate::new(settings.clone()),
            settings,
            sink,
        }
    }

    /// Runs one processing attempt for an incoming order.
    ///
    /// Business outcomes, including "no requisite", are returned as `Ok`.
    /// Errors are returned after the order's status has been updated in a
    /// separate transaction; retryable ones are meant to be retried by the
    /// task layer.
    #[instrument(skip(self))]
    pub async fn process(&self, incoming_order_id: i64) -> Result<ProcessOutcome> {
        match self.attempt(incoming_order_id).await {
            Ok(Attempt::Done(outcome)) => Ok(outcome),
            Ok(Attempt::NoRequisite) => self.record_no_requisite(incoming_order_id).await,
            Err(e) if matches!(e.root(), PaymentError::DuplicateSettlementError { .. }) => {
                warn!(incoming_order_id, "Settlement record created concurrently, skipping");
                Ok(ProcessOutcome::Skipped {
                    status: IncomingOrderStatus::Assigned,
                })
            }
            Err(e) if matches!(e.root(), PaymentError::NotFoundError { .. }) => Err(e),
            Err(e) => {
                if let Err(follow_up) = self.record_error(incoming_order_id, &e).await {
                    error!(
                        alert = "critical",
                        incoming_order_id,
                        error = %e,
                        follow_up_error = %follow_up,
                        "Could not record processing failure"
                    );
                    publish(
                        &self.sink,
                        vec![OrderEvent::CriticalFailure {
                            incoming_order_id,
                            reason: format!("{e}; while recording: {follow_up}"),
                        }],
                    )
                    .await;
                }
                Err(e)
            }
        }
    }

    async fn attempt(&self, id: i64) -> Result<Attempt> {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut tx = self.store.begin().await.at(id, Stage::Load)?;
        let order = tx
            .lock_incoming_order(id)
            .await
            .at(id, Stage::Load)?
            .ok_or_else(|| PaymentError::not_found("incoming order", id))?;
        if !order.status.is_processable() {
            info!(id, status = %order.status, "Order not processable, skipping");
            return Ok(Attempt::Done(ProcessOutcome::Skipped {
                status: order.status,
            }));
        }
        if tx.find_order_history(id).await.at(id, Stage::Load)?.is_some() {
            info!(id, "Order already has a settlement record, skipping");
            return Ok(Attempt::Done(ProcessOutcome::Skipped {
                status: order.status,
            }));
        }

        // Pay-in is screened on its own fiat amount; pay-out needs the rate first.
        let mut rate = None;
        let fiat_amount = match order.order_type {
            OrderType::PayIn => OrderLike::Incoming(&order).base_amount(),
            OrderType::PayOut => {
                let fetched = Ledger::exchange_rate(tx.as_mut(), OrderLike::Incoming(&order))
                    .await
                    .at(id, Stage::Commission)?;
                let amount = ledger::fiat_equivalent(OrderLike::Incoming(&order), &fetched);
                rate = Some(fetched);
                amount
            }
        };

        match self.fraud.check(id, order.order_type, fiat_amount).await {
            FraudDecision::Allow => {}
            FraudDecision::Deny { reason } => {
                self.stop(tx, &order, IncomingOrderStatus::Failed, &reason, events)
                    .await
                    .at(id, Stage::Fraud)?;
                warn!(id, %reason, "Order denied by fraud check");
                return Ok(Attempt::Done(ProcessOutcome::Denied { reason }));
            }
            FraudDecision::ManualReview { reason } => {
                self.stop(tx, &order, IncomingOrderStatus::ManualReview, &reason, events)
                    .await
                    .at(id, Stage::Fraud)?;
                warn!(id, %reason, "Order sent to manual review");
                return Ok(Attempt::Done(ProcessOutcome::ManualReview { reason }));
            }
        }

        let Some(amount) = fiat_amount else {
            return Err(
                PaymentError::ValidationError("Order has no amount".into()).at(id, Stage::Select),
            );
        };
        let selector = RequisiteSelector::new(self.settings.candidate_pool_size().await);
        let request = RoutingRequest {
            order_id: id,
            order_type: order.order_type,
            amount,
            fiat_currency_id: order.fiat_currency_id,
            method_id: order.target_method_id,
        };
        let (requisite_id, trader_id) = match selector
            .select(tx.as_mut(), &request, now)
            .await
            .at(id, Stage::Select)?
        {
            Selection::Found {
                requisite_id,
                trader_id,
            } => (requisite_id, trader_id),
            Selection::NotFound => return Ok(Attempt::NoRequisite),
        };

        let rate = match rate {
            Some(rate) => rate,
            None => Ledger::exchange_rate(tx.as_mut(), OrderLike::Incoming(&order))
                .await
                .at(id, Stage::Commission)?,
        };
        let commissions =
            Ledger::calculate_commissions(tx.as_mut(), OrderLike::Incoming(&order), trader_id)
                .await
                .at(id, Stage::Commission)?;
        let quote = ledger::quote(OrderLike::Incoming(&order), &rate, commissions)
            .at(id, Stage::Commission)?;

        let history = tx
            .insert_order_history(NewOrderHistory {
                incoming_order_id: id,
                merchant_id: order.merchant_id,
                store_id: order.store_id,
                requisite_id,
                trader_id,
                order_type: order.order_type,
                fiat_currency_id: order.fiat_currency_id,
                crypto_currency_id: order.crypto_currency_id,
                amount_fiat: order.amount_fiat,
                amount_crypto: order.amount_crypto,
                store_commission: commissions.store,
                trader_commission: quote.trader_commission,
                exchange_rate: quote.exchange_rate,
                amount_currency: quote.amount_currency,
                total_fiat: quote.total_fiat,
            })
            .await
            .at(id, Stage::Assign)?;
        let client_confirmed = order.status == IncomingOrderStatus::ClientPaymentConfirmed;
        let history =
            advance_after_assignment(tx.as_mut(), &history, client_confirmed, now, &mut events)
                .await
                .at(id, Stage::Transition)?;
        let update = IncomingOrderUpdate {
            failure_reason: Some(None),
            last_attempt_at: Some(now),
            ..IncomingOrderUpdate::status(IncomingOrderStatus::Assigned)
        };
        update_incoming(tx.as_mut(), &order, update, &Actor::system(), now, &mut events)
            .await
            .at(id, Stage::StatusUpdate)?;
        tx.commit().await.at(id, Stage::Assign)?;

        publish(&self.sink, events).await;
        info!(
            id,
            order_history_id = history.id,
            requisite_id,
            trader_id,
            status = %history.status,
            "Order assigned"
        );
        Ok(Attempt::Done(ProcessOutcome::Assigned {
            order_history_id: history.id,
        }))
    }

    /// Terminates an attempt by moving the order to a terminal review status.
    async fn stop(
        &self,
        mut tx: Box<dyn StoreTx>,
        order: &IncomingOrder,
        status: IncomingOrderStatus,
        reason: &str,
        mut events: Vec<OrderEvent>,
    ) -> Result<()> {
        let update = IncomingOrderUpdate {
            last_attempt_at: Some(Utc::now()),
            ..IncomingOrderUpdate::status(status).with_reason(reason)
        };
        update_incoming(
            tx.as_mut(),
            order,
            update,
            &Actor::system(),
            Utc::now(),
            &mut events,
        )
        .await?;
        tx.commit().await?;
        publish(&self.sink, events).await;
        Ok(())
    }

    async fn record_no_requisite(&self, id: i64) -> Result<ProcessOutcome> {
        let max_retries = self.settings.max_retries().await;
        let now = Utc::now();
        let mut events = Vec::new();
        let mut tx = self.store.begin().await.at(id, Stage::StatusUpdate)?;
        let order = tx
            .lock_incoming_order(id)
            .await
            .at(id, Stage::StatusUpdate)?
            .ok_or_else(|| PaymentError::not_found("incoming order", id))?;
        if !order.status.is_processable() {
            return Ok(ProcessOutcome::Skipped {
                status: order.status,
            });
        }
        let retry_count = order.retry_count + 1;
        let (status, reason, outcome) = if retry_count >= max_retries {
            let reason = format!("{NO_REQUISITE_REASON}: {MAX_RETRIES_REASON}");
            (
                IncomingOrderStatus::Failed,
                reason.clone(),
                ProcessOutcome::Failed { reason },
            )
        } else {
            (
                IncomingOrderStatus::Retrying,
                NO_REQUISITE_REASON.to_string(),
                ProcessOutcome::Retrying { retry_count },
            )
        };
        let update = IncomingOrderUpdate {
            retry_count: Some(retry_count),
            last_attempt_at: Some(now),
            ..IncomingOrderUpdate::status(status).with_reason(reason)
        };
        update_incoming(tx.as_mut(), &order, update, &Actor::system(), now, &mut events)
            .await
            .at(id, Stage::StatusUpdate)?;
        tx.commit().await.at(id, Stage::StatusUpdate)?;
        publish(&self.sink, events).await;
        info!(id, retry_count, max_retries, %status, "No requisite available");
        Ok(outcome)
    }

    /// Records a failed attempt. Non-retryable errors fail the order; retryable
    /// ones leave it in `retrying` for the task layer.
    async fn record_error(&self, id: i64, cause: &PaymentError) -> Result<()> {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut tx = self.store.begin().await?;
        let Some(order) = tx.lock_incoming_order(id).await? else {
            return Ok(());
        };
        if !order.status.is_processable() {
            return Ok(());
        }
        let status = if cause.is_retryable() {
            IncomingOrderStatus::Retrying
        } else {
            IncomingOrderStatus::Failed
        };
        let update = IncomingOrderUpdate {
            retry_count: Some(order.retry_count + 1),
            last_attempt_at: Some(now),
            ..IncomingOrderUpdate::status(status).with_reason(cause.public_reason())
        };
        update_incoming(tx.as_mut(), &order, update, &Actor::system(), now, &mut events).await?;
        tx.commit().await?;
        publish(&self.sink, events).await;
        warn!(id, error = %cause, %status, "Processing attempt failed");
        Ok(())
    }

    /// Fails an order whose retries are exhausted, unless it already moved on.
    #[instrument(skip(self))]
    pub async fn fail_exhausted(&self, id: i64) -> Result<bool> {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut tx = self.store.begin().await?;
        let Some(order) = tx.lock_incoming_order(id).await? else {
            return Err(PaymentError::not_found("incoming order", id));
        };
        if !order.status.is_pending_assignment() {
            return Ok(false);
        }
        let update = IncomingOrderUpdate {
            last_attempt_at: Some(now),
            ..IncomingOrderUpdate::status(IncomingOrderStatus::Failed)
                .with_reason(MAX_RETRIES_REASON)
        };
        update_incoming(tx.as_mut(), &order, update, &Actor::system(), now, &mut events).await?;
        tx.commit().await?;
        events.push(OrderEvent::CriticalFailure {
            incoming_order_id: id,
            reason: MAX_RETRIES_REASON.to_string(),
        });
        publish(&self.sink, events).await;
        error!(alert = "critical", id, "Retries exhausted, order failed");
        Ok(true)
    }
}
