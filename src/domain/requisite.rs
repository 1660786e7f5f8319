use crate::domain::order::{OrderType, string_enum};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Default routing priority for traders that never had one assigned.
pub const DEFAULT_TRAFIC_PRIORITY: i32 = 5;

fn default_priority() -> i32 {
    DEFAULT_TRAFIC_PRIORITY
}

fn default_true() -> bool {
    true
}

/// A payment-processing agent who owns requisites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trader {
    pub id: i64,
    pub user_id: i64,
    #[serde(default = "default_true")]
    pub user_active: bool,
    #[serde(default = "default_true")]
    pub in_work: bool,
    #[serde(default = "default_true")]
    pub is_traffic_enabled_by_teamlead: bool,
    /// Lower value wins.
    #[serde(default = "default_priority")]
    pub trafic_priority: i32,
}

impl Trader {
    pub fn accepts_traffic(&self) -> bool {
        self.user_active && self.in_work && self.is_traffic_enabled_by_teamlead
    }
}

string_enum!(RequisiteStatus {
    Approve => "approve",
    Check => "check",
    Blocked => "blocked",
});

/// A payment destination owned by a trader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requisite {
    pub id: i64,
    pub trader_id: i64,
    pub method_id: i64,
    #[serde(default)]
    pub bank_id: Option<i64>,
    pub fiat_currency_id: i64,
    pub status: RequisiteStatus,
    #[serde(default)]
    pub is_excluded_from_distribution: bool,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Per-requisite volume and direction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequisiteLimits {
    pub requisite_id: i64,
    pub pay_in: bool,
    pub pay_out: bool,
    pub lower_limit: Decimal,
    pub upper_limit: Decimal,
    /// Maximum completed fiat volume inside the rolling window.
    pub total_limit: Decimal,
    pub turnover_limit_minutes: u32,
    /// Maximum completed fiat volume since the start of the current UTC day.
    pub turnover_day_max: Decimal,
}

impl RequisiteLimits {
    pub fn allows(&self, order_type: OrderType) -> bool {
        match order_type {
            OrderType::PayIn => self.pay_in,
            OrderType::PayOut => self.pay_out,
        }
    }

    pub fn covers(&self, amount: Decimal) -> bool {
        self.lower_limit <= amount && amount <= self.upper_limit
    }
}

/// Parameters of one candidate lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub order_type: OrderType,
    /// Fiat amount the requisite has to accept.
    pub amount: Decimal,
    pub fiat_currency_id: i64,
    pub method_id: Option<i64>,
    pub limit: usize,
}

impl CandidateQuery {
    /// Static eligibility, before volume windows are consulted.
    pub fn admits(&self, trader: &Trader, requisite: &Requisite, limits: &RequisiteLimits) -> bool {
        trader.accepts_traffic()
            && requisite.status == RequisiteStatus::Approve
            && !requisite.is_excluded_from_distribution
            && requisite.fiat_currency_id == self.fiat_currency_id
            && self.method_id.is_none_or(|m| m == requisite.method_id)
            && limits.allows(self.order_type)
            && limits.covers(self.amount)
    }
}

/// A locked, statically eligible requisite.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub requisite_id: i64,
    pub trader_id: i64,
    pub trafic_priority: i32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub limits: RequisiteLimits,
}

impl Candidate {
    /// Priority ascending, least recently used first with never-used on top.
    pub fn routing_order(&self, other: &Candidate) -> Ordering {
        self.trafic_priority
            .cmp(&other.trafic_priority)
            .then_with(|| match (self.last_used_at, other.last_used_at) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(&b),
            })
            .then_with(|| self.requisite_id.cmp(&other.requisite_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn limits() -> RequisiteLimits {
        RequisiteLimits {
            requisite_id: 1,
            pay_in: true,
            pay_out: false,
            lower_limit: dec!(10),
            upper_limit: dec!(1000),
            total_limit: dec!(5000),
            turnover_limit_minutes: 60,
            turnover_day_max: dec!(10000),
        }
    }

    fn trader() -> Trader {
        Trader {
            id: 1,
            user_id: 1,
            user_active: true,
            in_work: true,
            is_traffic_enabled_by_teamlead: true,
            trafic_priority: 5,
        }
    }

    fn requisite() -> Requisite {
        Requisite {
            id: 1,
            trader_id: 1,
            method_id: 3,
            bank_id: None,
            fiat_currency_id: 1,
            status: RequisiteStatus::Approve,
            is_excluded_from_distribution: false,
            last_used_at: None,
        }
    }

    fn query(amount: Decimal) -> CandidateQuery {
        CandidateQuery {
            order_type: OrderType::PayIn,
            amount,
            fiat_currency_id: 1,
            method_id: None,
            limit: 5,
        }
    }

    #[test]
    fn test_limits_are_inclusive() {
        let (t, r, l) = (trader(), requisite(), limits());
        assert!(query(dec!(10)).admits(&t, &r, &l));
        assert!(query(dec!(1000)).admits(&t, &r, &l));
        assert!(!query(dec!(1000.01)).admits(&t, &r, &l));
        assert!(!query(dec!(9.99)).admits(&t, &r, &l));
    }

    #[test]
    fn test_direction_method_and_trader_flags() {
        let (mut t, r, l) = (trader(), requisite(), limits());
        let mut q = query(dec!(100));
        q.order_type = OrderType::PayOut;
        assert!(!q.admits(&t, &r, &l));

        let mut q = query(dec!(100));
        q.method_id = Some(4);
        assert!(!q.admits(&t, &r, &l));
        q.method_id = Some(3);
        assert!(q.admits(&t, &r, &l));

        t.in_work = false;
        assert!(!q.admits(&t, &r, &l));
    }

    #[test]
    fn test_routing_order_prefers_priority_then_least_recent() {
        let at = |h| Some(Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap());
        let candidate = |id, priority, last_used_at| Candidate {
            requisite_id: id,
            trader_id: id,
            trafic_priority: priority,
            last_used_at,
            limits: limits(),
        };
        let mut list = vec![
            candidate(1, 5, at(3)),
            candidate(2, 5, None),
            candidate(3, 1, at(9)),
            candidate(4, 5, at(1)),
        ];
        list.sort_by(|a, b| a.routing_order(b));
        let ids: Vec<i64> = list.iter().map(|c| c.requisite_id).collect();
        assert_eq!(ids, vec![3, 2, 4, 1]);
    }
}
