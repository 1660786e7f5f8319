use crate::domain::order::OrderType;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A merchant's storefront, fixing the currency pair and admission limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerchantStore {
    pub id: i64,
    pub merchant_id: i64,
    pub crypto_currency_id: i64,
    pub fiat_currency_id: i64,
    pub fiat_currency_code: String,
    pub lower_limit: Decimal,
    pub upper_limit: Decimal,
    pub access: bool,
    pub pay_in_enabled: bool,
    pub pay_out_enabled: bool,
}

impl MerchantStore {
    pub fn accepts(&self, order_type: OrderType) -> bool {
        self.access
            && match order_type {
                OrderType::PayIn => self.pay_in_enabled,
                OrderType::PayOut => self.pay_out_enabled,
            }
    }
}

/// A commission rate record, in percent. The most recent record wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionRate {
    pub owner_id: i64,
    pub commission_pay_in: Decimal,
    pub commission_pay_out: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl CommissionRate {
    pub fn percent_for(&self, order_type: OrderType) -> Decimal {
        match order_type {
            OrderType::PayIn => self.commission_pay_in,
            OrderType::PayOut => self.commission_pay_out,
        }
    }
}

/// Fiat price of one crypto unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub crypto_currency_id: i64,
    pub fiat_currency_id: i64,
    pub rate: Decimal,
    pub updated_at: DateTime<Utc>,
}
