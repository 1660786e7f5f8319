use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a monetary balance held by a store or a trader.
///
/// This is a wrapper around `rust_decimal::Decimal` so that balance arithmetic
/// stays exact and can never silently drift at limit boundaries.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Balance(pub Decimal);

/// Represents a strictly positive amount requested by a merchant.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, PaymentError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PaymentError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl Balance {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }

    /// Returns the balance after applying `change`, refusing to go below zero.
    pub fn apply(self, key: &BalanceKey, change: Decimal) -> Result<Balance, PaymentError> {
        let next = self.0 + change;
        if next < Decimal::ZERO {
            return Err(PaymentError::InsufficientBalanceError {
                account: key.to_string(),
                balance: self.0,
                change,
            });
        }
        Ok(Balance(next))
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.normalize().fmt(f)
    }
}

/// Identifies one balance row.
///
/// Store balances are kept per crypto currency, trader balances per fiat currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "owner", rename_all = "lowercase")]
pub enum BalanceKey {
    Store {
        store_id: i64,
        crypto_currency_id: i64,
    },
    Trader {
        trader_id: i64,
        fiat_currency_id: i64,
    },
}

impl BalanceKey {
    pub fn owner_kind(&self) -> &'static str {
        match self {
            BalanceKey::Store { .. } => "store",
            BalanceKey::Trader { .. } => "trader",
        }
    }

    pub fn owner_id(&self) -> i64 {
        match self {
            BalanceKey::Store { store_id, .. } => *store_id,
            BalanceKey::Trader { trader_id, .. } => *trader_id,
        }
    }

    pub fn currency_id(&self) -> i64 {
        match self {
            BalanceKey::Store {
                crypto_currency_id, ..
            } => *crypto_currency_id,
            BalanceKey::Trader {
                fiat_currency_id, ..
            } => *fiat_currency_id,
        }
    }
}

impl fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (currency {})",
            self.owner_kind(),
            self.owner_id(),
            self.currency_id()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceOperation {
    OrderSettlement,
    DisputeReversal,
}

impl BalanceOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceOperation::OrderSettlement => "order_settlement",
            BalanceOperation::DisputeReversal => "dispute_reversal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "order_settlement" => Some(BalanceOperation::OrderSettlement),
            "dispute_reversal" => Some(BalanceOperation::DisputeReversal),
            _ => None,
        }
    }
}

/// Immutable audit row written for every balance mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceHistoryEntry {
    pub key: BalanceKey,
    pub balance_change: Decimal,
    pub new_balance: Balance,
    pub operation_type: BalanceOperation,
    pub order_id: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const STORE: BalanceKey = BalanceKey::Store {
        store_id: 1,
        crypto_currency_id: 2,
    };

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(1.0)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(PaymentError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(-1.0)),
            Err(PaymentError::ValidationError(_))
        ));
    }

    #[test]
    fn test_apply_credit_and_exact_debit() {
        let balance = Balance::new(dec!(10.0));
        assert_eq!(
            balance.apply(&STORE, dec!(2.5)).unwrap(),
            Balance::new(dec!(12.5))
        );
        assert_eq!(balance.apply(&STORE, dec!(-10.0)).unwrap(), Balance::ZERO);
    }

    #[test]
    fn test_apply_refuses_negative_result() {
        let balance = Balance::new(dec!(10.0));
        let result = balance.apply(&STORE, dec!(-10.00000001));
        assert!(matches!(
            result,
            Err(PaymentError::InsufficientBalanceError { .. })
        ));
    }

    #[test]
    fn test_balance_key_display() {
        assert_eq!(STORE.to_string(), "store 1 (currency 2)");
    }
}
