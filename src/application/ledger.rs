use crate::application::publish;
use crate::domain::actor::OrderEvent;
use crate::domain::balance::{BalanceHistoryEntry, BalanceKey, BalanceOperation};
use crate::domain::merchant::ExchangeRate;
use crate::domain::order::{
    OrderHistory, OrderHistoryStatus, OrderHistoryUpdate, OrderLike, OrderType, SettlementState,
};
use crate::domain::ports::{SinkRef, StoreRef, StoreTx};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, instrument};

pub const CRYPTO_DP: u32 = 8;
pub const FIAT_DP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Commissions {
    pub store: Decimal,
    pub trader: Decimal,
}

/// Amounts fixed on a settlement record at assignment time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlementQuote {
    pub exchange_rate: Decimal,
    pub amount_currency: Decimal,
    pub total_fiat: Decimal,
    /// Credited to the trader's fiat balance.
    pub trader_commission: Decimal,
}

fn round_base(order_type: OrderType, value: Decimal) -> Decimal {
    match order_type {
        OrderType::PayIn => value.round_dp(FIAT_DP),
        OrderType::PayOut => value.round_dp(CRYPTO_DP),
    }
}

fn required_amount(order: OrderLike<'_>) -> Result<Decimal> {
    order.base_amount().ok_or_else(|| {
        PaymentError::ValidationError(format!(
            "Order {} has no {} amount",
            order.incoming_order_id(),
            match order.order_type() {
                OrderType::PayIn => "fiat",
                OrderType::PayOut => "crypto",
            }
        ))
    })
}

/// Fiat value of an order: the fiat amount for pay-in, the converted crypto
/// amount for pay-out.
pub fn fiat_equivalent(order: OrderLike<'_>, rate: &ExchangeRate) -> Option<Decimal> {
    let base = order.base_amount()?;
    Some(match order.order_type() {
        OrderType::PayIn => base,
        OrderType::PayOut => (base * rate.rate).round_dp(FIAT_DP),
    })
}

/// Fixes the crypto and fiat amounts of an order at the given rate.
pub fn quote(
    order: OrderLike<'_>,
    rate: &ExchangeRate,
    commissions: Commissions,
) -> Result<SettlementQuote> {
    let base = required_amount(order)?;
    let (amount_currency, total_fiat, trader_commission) = match order.order_type() {
        OrderType::PayIn => {
            let net = base - commissions.store;
            if net <= Decimal::ZERO {
                return Err(PaymentError::ValidationError(format!(
                    "Store commission {} consumes the whole amount {}",
                    commissions.store, base
                )));
            }
            (
                (net / rate.rate).round_dp(CRYPTO_DP),
                base.round_dp(FIAT_DP),
                commissions.trader.round_dp(FIAT_DP),
            )
        }
        // Pay-out commissions are computed on the crypto amount; the trader
        // ledger is fiat.
        OrderType::PayOut => (
            (base + commissions.store).round_dp(CRYPTO_DP),
            (base * rate.rate).round_dp(FIAT_DP),
            (commissions.trader * rate.rate).round_dp(FIAT_DP),
        ),
    };
    Ok(SettlementQuote {
        exchange_rate: rate.rate,
        amount_currency,
        total_fiat,
        trader_commission,
    })
}

/// Balance changes a settlement applies, store first.
pub fn settlement_deltas(history: &OrderHistory) -> [(BalanceKey, Decimal); 2] {
    let store_change = match history.order_type {
        OrderType::PayIn => history.amount_currency,
        OrderType::PayOut => -history.amount_currency,
    };
    [
        (
            BalanceKey::Store {
                store_id: history.store_id,
                crypto_currency_id: history.crypto_currency_id,
            },
            store_change,
        ),
        (
            BalanceKey::Trader {
                trader_id: history.trader_id,
                fiat_currency_id: history.fiat_currency_id,
            },
            history.trader_commission,
        ),
    ]
}

/// Commission calculation and balance settlement.
///
/// Balance rows are always locked store first, trader second.
#[derive(Clone)]
pub struct Ledger {
    store: StoreRef,
    sink: SinkRef,
}

impl Ledger {
    pub fn new(store: StoreRef, sink: SinkRef) -> Self {
        Self { store, sink }
    }

    /// Latest exchange rate for the order's currency pair.
    pub async fn exchange_rate(tx: &mut dyn StoreTx, order: OrderLike<'_>) -> Result<ExchangeRate> {
        let (crypto, fiat) = order.currency_pair();
        let rate = tx.latest_exchange_rate(crypto, fiat).await?.ok_or_else(|| {
            PaymentError::ConfigurationError(format!(
                "No exchange rate for crypto {crypto} / fiat {fiat}"
            ))
        })?;
        if rate.rate <= Decimal::ZERO {
            return Err(PaymentError::ConfigurationError(format!(
                "Exchange rate for crypto {crypto} / fiat {fiat} is not positive"
            )));
        }
        Ok(rate)
    }

    /// `base * percent / 100` for the store and the trader, using the latest
    /// rate record of each and the rate matching the order direction.
    pub async fn calculate_commissions(
        tx: &mut dyn StoreTx,
        order: OrderLike<'_>,
        trader_id: i64,
    ) -> Result<Commissions> {
        let base = required_amount(order)?;
        let order_type = order.order_type();
        let store_rate = tx
            .latest_store_commission(order.store_id())
            .await?
            .ok_or_else(|| {
                PaymentError::ConfigurationError(format!(
                    "No commission configured for store {}",
                    order.store_id()
                ))
            })?;
        let trader_rate = tx
            .latest_trader_commission(trader_id)
            .await?
            .ok_or_else(|| {
                PaymentError::ConfigurationError(format!(
                    "No commission configured for trader {trader_id}"
                ))
            })?;
        let hundred = Decimal::ONE_HUNDRED;
        Ok(Commissions {
            store: round_base(order_type, base * store_rate.percent_for(order_type) / hundred),
            trader: round_base(order_type, base * trader_rate.percent_for(order_type) / hundred),
        })
    }

    /// Applies the settlement deltas of a completed order.
    ///
    /// Returns `false` without touching anything when the record was already settled.
    /// The caller must hold the lock on `history`.
    pub async fn settle(
        tx: &mut dyn StoreTx,
        history: &OrderHistory,
        now: DateTime<Utc>,
        events: &mut Vec<OrderEvent>,
    ) -> Result<bool> {
        if history.settlement != SettlementState::Unsettled {
            return Ok(false);
        }
        let deltas = settlement_deltas(history);
        apply(
            tx,
            history.id,
            &deltas,
            BalanceOperation::OrderSettlement,
            now,
            events,
        )
        .await?;
        tx.update_order_history(
            history.id,
            &OrderHistoryUpdate {
                settlement: Some(SettlementState::Settled),
                ..Default::default()
            },
        )
        .await?;
        Ok(true)
    }

    /// Undoes a previous settlement with compensating entries.
    pub async fn reverse(
        tx: &mut dyn StoreTx,
        history: &OrderHistory,
        now: DateTime<Utc>,
        events: &mut Vec<OrderEvent>,
    ) -> Result<bool> {
        if history.settlement != SettlementState::Settled {
            return Ok(false);
        }
        let deltas = settlement_deltas(history).map(|(key, change)| (key, -change));
        apply(
            tx,
            history.id,
            &deltas,
            BalanceOperation::DisputeReversal,
            now,
            events,
        )
        .await?;
        tx.update_order_history(
            history.id,
            &OrderHistoryUpdate {
                settlement: Some(SettlementState::Reversed),
                ..Default::default()
            },
        )
        .await?;
        Ok(true)
    }

    /// Settles a completed order in its own transaction.
    #[instrument(skip(self))]
    pub async fn settle_order(&self, order_history_id: i64) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let history = tx
            .lock_order_history(order_history_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("order history", order_history_id))?;
        if history.status != OrderHistoryStatus::Completed {
            return Err(PaymentError::InvalidTransitionError {
                entity: "order history",
                id: order_history_id,
                action: "settle",
                from: history.status.to_string(),
            });
        }
        let mut events = Vec::new();
        let settled = Self::settle(tx.as_mut(), &history, Utc::now(), &mut events).await?;
        tx.commit().await?;
        if settled {
            info!(order_history_id, "Order settled");
        } else {
            info!(order_history_id, "Order already settled, nothing to do");
        }
        publish(&self.sink, events).await;
        Ok(settled)
    }
}

async fn apply(
    tx: &mut dyn StoreTx,
    order_id: i64,
    deltas: &[(BalanceKey, Decimal)],
    operation: BalanceOperation,
    now: DateTime<Utc>,
    events: &mut Vec<OrderEvent>,
) -> Result<()> {
    for (key, change) in deltas {
        let current = tx.lock_balance(*key).await?;
        let next = current.apply(key, *change)?;
        tx.set_balance(*key, next).await?;
        tx.append_balance_history(BalanceHistoryEntry {
            key: *key,
            balance_change: *change,
            new_balance: next,
            operation_type: operation,
            order_id,
            description: format!("{} for order {}", operation.as_str(), order_id),
            created_at: now,
        })
        .await?;
        events.push(OrderEvent::BalanceChanged {
            key: *key,
            change: *change,
            new_balance: next,
            order_history_id: order_id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{
        IncomingOrder, IncomingOrderStatus, NewIncomingOrder, NewOrderHistory,
    };
    use rust_decimal_macros::dec;

    fn rate(value: Decimal) -> ExchangeRate {
        ExchangeRate {
            crypto_currency_id: 1,
            fiat_currency_id: 1,
            rate: value,
            updated_at: Utc::now(),
        }
    }

    fn incoming(
        order_type: OrderType,
        fiat: Option<Decimal>,
        crypto: Option<Decimal>,
    ) -> IncomingOrder {
        NewIncomingOrder {
            merchant_id: 1,
            store_id: 1,
            order_type,
            amount_fiat: fiat,
            amount_crypto: crypto,
            fiat_currency_id: 1,
            crypto_currency_id: 1,
            target_method_id: None,
            customer_id: None,
            callback_url: None,
            status: IncomingOrderStatus::New,
        }
        .into_order(1, Utc::now())
    }

    #[test]
    fn test_pay_in_quote() {
        let order = incoming(OrderType::PayIn, Some(dec!(1000)), None);
        let q = quote(
            OrderLike::Incoming(&order),
            &rate(dec!(90)),
            Commissions {
                store: dec!(20),
                trader: dec!(10),
            },
        )
        .unwrap();
        assert_eq!(q.total_fiat, dec!(1000));
        assert_eq!(q.amount_currency, dec!(10.88888889));
        assert_eq!(q.trader_commission, dec!(10));
    }

    #[test]
    fn test_pay_out_quote() {
        let order = incoming(OrderType::PayOut, None, Some(dec!(2.5)));
        let q = quote(
            OrderLike::Incoming(&order),
            &rate(dec!(91.333)),
            Commissions {
                store: dec!(0.025),
                trader: dec!(0),
            },
        )
        .unwrap();
        assert_eq!(q.amount_currency, dec!(2.525));
        assert_eq!(q.total_fiat, dec!(228.33));
        assert_eq!(q.trader_commission, dec!(0));
    }

    #[test]
    fn test_pay_out_trader_commission_is_fiat() {
        let order = incoming(OrderType::PayOut, None, Some(dec!(2)));
        let q = quote(
            OrderLike::Incoming(&order),
            &rate(dec!(91)),
            Commissions {
                store: dec!(0.02),
                trader: dec!(0.03),
            },
        )
        .unwrap();
        assert_eq!(q.amount_currency, dec!(2.02));
        assert_eq!(q.trader_commission, dec!(2.73));
    }

    #[test]
    fn test_quote_rejects_commission_eating_amount() {
        let order = incoming(OrderType::PayIn, Some(dec!(10)), None);
        let result = quote(
            OrderLike::Incoming(&order),
            &rate(dec!(90)),
            Commissions {
                store: dec!(10),
                trader: dec!(0),
            },
        );
        assert!(matches!(result, Err(PaymentError::ValidationError(_))));
    }

    #[test]
    fn test_settlement_deltas_by_direction() {
        let mut history = NewOrderHistory {
            incoming_order_id: 1,
            merchant_id: 1,
            store_id: 3,
            requisite_id: 1,
            trader_id: 4,
            order_type: OrderType::PayIn,
            fiat_currency_id: 5,
            crypto_currency_id: 6,
            amount_fiat: Some(dec!(1000)),
            amount_crypto: None,
            store_commission: dec!(20),
            trader_commission: dec!(10),
            exchange_rate: dec!(90),
            amount_currency: dec!(10.88888889),
            total_fiat: dec!(1000),
        }
        .into_history(9, Utc::now());

        let [(store_key, store_change), (trader_key, trader_change)] = settlement_deltas(&history);
        assert_eq!(
            store_key,
            BalanceKey::Store {
                store_id: 3,
                crypto_currency_id: 6
            }
        );
        assert_eq!(store_change, dec!(10.88888889));
        assert_eq!(
            trader_key,
            BalanceKey::Trader {
                trader_id: 4,
                fiat_currency_id: 5
            }
        );
        assert_eq!(trader_change, dec!(10));

        history.order_type = OrderType::PayOut;
        assert_eq!(settlement_deltas(&history)[0].1, dec!(-10.88888889));
    }
}
