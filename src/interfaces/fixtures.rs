//! JSON world files: the reference data a replay runs against.

use crate::domain::balance::{Balance, BalanceKey};
use crate::domain::merchant::{CommissionRate, ExchangeRate, MerchantStore};
use crate::domain::requisite::{Requisite, RequisiteLimits, Trader};
use crate::error::{PaymentError, Result};
use crate::infrastructure::in_memory::InMemoryStore;
use crate::infrastructure::support::StaticConfig;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequisiteFixture {
    #[serde(flatten)]
    pub requisite: Requisite,
    pub limits: LimitsFixture,
}

/// Requisite limits without the requisite id, which comes from the parent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LimitsFixture {
    #[serde(default = "enabled")]
    pub pay_in: bool,
    #[serde(default)]
    pub pay_out: bool,
    pub lower_limit: Decimal,
    pub upper_limit: Decimal,
    pub total_limit: Decimal,
    #[serde(default = "default_window")]
    pub turnover_limit_minutes: u32,
    pub turnover_day_max: Decimal,
}

fn enabled() -> bool {
    true
}

fn default_window() -> u32 {
    60
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommissionFixture {
    pub owner_id: i64,
    pub commission_pay_in: Decimal,
    pub commission_pay_out: Decimal,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CommissionFixture {
    fn into_rate(self, now: DateTime<Utc>) -> CommissionRate {
        CommissionRate {
            owner_id: self.owner_id,
            commission_pay_in: self.commission_pay_in,
            commission_pay_out: self.commission_pay_out,
            updated_at: self.updated_at.unwrap_or(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateFixture {
    pub crypto_currency_id: i64,
    pub fiat_currency_id: i64,
    pub rate: Decimal,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BalanceFixture {
    pub key: BalanceKey,
    pub balance: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct World {
    pub stores: Vec<MerchantStore>,
    pub traders: Vec<Trader>,
    pub requisites: Vec<RequisiteFixture>,
    pub store_commissions: Vec<CommissionFixture>,
    pub trader_commissions: Vec<CommissionFixture>,
    pub exchange_rates: Vec<RateFixture>,
    pub balances: Vec<BalanceFixture>,
    /// Runtime settings, keyed like the `ConfigProvider` keys.
    pub settings: HashMap<String, String>,
}

impl World {
    pub fn from_reader(source: impl Read) -> Result<Self> {
        let world: World = serde_json::from_reader(source)?;
        world.validate()?;
        Ok(world)
    }

    fn validate(&self) -> Result<()> {
        for fixture in &self.requisites {
            if !self.traders.iter().any(|t| t.id == fixture.requisite.trader_id) {
                return Err(PaymentError::ValidationError(format!(
                    "Requisite {} references unknown trader {}",
                    fixture.requisite.id, fixture.requisite.trader_id
                )));
            }
        }
        if let Some(negative) = self.balances.iter().find(|b| b.balance < Decimal::ZERO) {
            return Err(PaymentError::ValidationError(format!(
                "Balance of {} is negative",
                negative.key
            )));
        }
        Ok(())
    }

    /// Loads the reference data into a store.
    pub async fn seed(&self, store: &InMemoryStore) {
        let now = Utc::now();
        for merchant_store in &self.stores {
            store.insert_merchant_store(merchant_store.clone()).await;
        }
        for trader in &self.traders {
            store.insert_trader(trader.clone()).await;
        }
        for fixture in &self.requisites {
            let limits = &fixture.limits;
            store
                .insert_requisite(
                    fixture.requisite.clone(),
                    RequisiteLimits {
                        requisite_id: fixture.requisite.id,
                        pay_in: limits.pay_in,
                        pay_out: limits.pay_out,
                        lower_limit: limits.lower_limit,
                        upper_limit: limits.upper_limit,
                        total_limit: limits.total_limit,
                        turnover_limit_minutes: limits.turnover_limit_minutes,
                        turnover_day_max: limits.turnover_day_max,
                    },
                )
                .await;
        }
        for rate in &self.store_commissions {
            store.insert_store_commission(rate.clone().into_rate(now)).await;
        }
        for rate in &self.trader_commissions {
            store.insert_trader_commission(rate.clone().into_rate(now)).await;
        }
        for rate in &self.exchange_rates {
            store
                .insert_exchange_rate(ExchangeRate {
                    crypto_currency_id: rate.crypto_currency_id,
                    fiat_currency_id: rate.fiat_currency_id,
                    rate: rate.rate,
                    updated_at: rate.updated_at.unwrap_or(now),
                })
                .await;
        }
        for fixture in &self.balances {
            store
                .seed_balance(fixture.key, Balance::new(fixture.balance))
                .await;
        }
    }

    pub fn config(&self) -> StaticConfig {
        StaticConfig::new(self.settings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::Store;
    use rust_decimal_macros::dec;

    const WORLD: &str = r#"{
        "stores": [{
            "id": 10, "merchant_id": 1, "crypto_currency_id": 1, "fiat_currency_id": 1,
            "fiat_currency_code": "RUB", "lower_limit": "100", "upper_limit": "100000",
            "access": true, "pay_in_enabled": true, "pay_out_enabled": true
        }],
        "traders": [{ "id": 3, "user_id": 30 }],
        "requisites": [{
            "id": 7, "trader_id": 3, "method_id": 1, "fiat_currency_id": 1, "status": "approve",
            "limits": {
                "lower_limit": "100", "upper_limit": "50000",
                "total_limit": "200000", "turnover_day_max": "500000"
            }
        }],
        "store_commissions": [{ "owner_id": 10, "commission_pay_in": "2.5", "commission_pay_out": "1" }],
        "trader_commissions": [{ "owner_id": 3, "commission_pay_in": "1.5", "commission_pay_out": "1" }],
        "exchange_rates": [{ "crypto_currency_id": 1, "fiat_currency_id": 1, "rate": "91.25" }],
        "balances": [{ "key": { "owner": "store", "store_id": 10, "crypto_currency_id": 1 }, "balance": "5" }],
        "settings": { "max_retries": "2" }
    }"#;

    #[tokio::test]
    async fn test_world_seeds_store() {
        let world = World::from_reader(WORLD.as_bytes()).unwrap();
        assert_eq!(world.requisites[0].limits.turnover_limit_minutes, 60);
        assert!(world.requisites[0].limits.pay_in);
        assert!(!world.requisites[0].limits.pay_out);

        let store = InMemoryStore::new();
        world.seed(&store).await;
        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_merchant_store(10).await.unwrap().is_some());
        let rate = tx.latest_exchange_rate(1, 1).await.unwrap().unwrap();
        assert_eq!(rate.rate, dec!(91.25));
        let balance = tx
            .get_balance(BalanceKey::Store {
                store_id: 10,
                crypto_currency_id: 1,
            })
            .await
            .unwrap();
        assert_eq!(balance, Some(Balance::new(dec!(5))));
        assert!(store.requisite(7).await.is_some());
    }

    #[test]
    fn test_unknown_trader_is_rejected() {
        let world = r#"{
            "requisites": [{
                "id": 7, "trader_id": 99, "method_id": 1, "fiat_currency_id": 1, "status": "approve",
                "limits": { "lower_limit": "1", "upper_limit": "2", "total_limit": "3", "turnover_day_max": "4" }
            }]
        }"#;
        let err = World::from_reader(world.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("unknown trader 99"));
    }
}
