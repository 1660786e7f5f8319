use crate::domain::order::OrderType;
use crate::domain::ports::StoreTx;
use crate::domain::requisite::{Candidate, CandidateQuery};
use crate::error::Result;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, instrument};

/// What the router needs to know about an order to pick a requisite.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingRequest {
    pub order_id: i64,
    pub order_type: OrderType,
    /// Fiat amount the requisite will move.
    pub amount: Decimal,
    pub fiat_currency_id: i64,
    pub method_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Found { requisite_id: i64, trader_id: i64 },
    NotFound,
}

/// Picks a requisite for an order.
///
/// Must run inside the caller's transaction: candidate rows stay locked until
/// that transaction ends, so two concurrent orders never land on the same
/// requisite through the same pool.
#[derive(Debug, Clone, Copy)]
pub struct RequisiteSelector {
    pool_size: usize,
}

impl RequisiteSelector {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size: pool_size.max(1),
        }
    }

    #[instrument(skip(self, tx, request), fields(order_id = request.order_id))]
    pub async fn select(
        &self,
        tx: &mut dyn StoreTx,
        request: &RoutingRequest,
        now: DateTime<Utc>,
    ) -> Result<Selection> {
        let query = CandidateQuery {
            order_type: request.order_type,
            amount: request.amount,
            fiat_currency_id: request.fiat_currency_id,
            method_id: request.method_id,
            limit: self.pool_size,
        };
        let candidates = tx.lock_candidates(&query).await?;
        debug!(count = candidates.len(), "Locked candidate requisites");

        for candidate in candidates {
            if !self.within_turnover(tx, &candidate, request.amount, now).await? {
                continue;
            }
            tx.touch_requisite(candidate.requisite_id, now).await?;
            debug!(
                requisite_id = candidate.requisite_id,
                trader_id = candidate.trader_id,
                "Requisite selected"
            );
            return Ok(Selection::Found {
                requisite_id: candidate.requisite_id,
                trader_id: candidate.trader_id,
            });
        }
        Ok(Selection::NotFound)
    }

    async fn within_turnover(
        &self,
        tx: &mut dyn StoreTx,
        candidate: &Candidate,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let limits = &candidate.limits;
        let window_start = now - Duration::minutes(i64::from(limits.turnover_limit_minutes));
        let rolling = tx
            .completed_turnover(candidate.requisite_id, window_start)
            .await?;
        if rolling + amount > limits.total_limit {
            debug!(
                requisite_id = candidate.requisite_id,
                %rolling,
                limit = %limits.total_limit,
                "Rolling turnover limit reached"
            );
            return Ok(false);
        }
        let daily = tx
            .completed_turnover(candidate.requisite_id, start_of_utc_day(now))
            .await?;
        if daily + amount > limits.turnover_day_max {
            debug!(
                requisite_id = candidate.requisite_id,
                %daily,
                limit = %limits.turnover_day_max,
                "Daily turnover limit reached"
            );
            return Ok(false);
        }
        Ok(true)
    }
}

pub fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_start_of_utc_day() {
        let now = Utc.with_ymd_and_hms(2024, 5, 17, 23, 59, 59).unwrap();
        assert_eq!(
            start_of_utc_day(now),
            Utc.with_ymd_and_hms(2024, 5, 17, 0, 0, 0).unwrap()
        );
    }
}
