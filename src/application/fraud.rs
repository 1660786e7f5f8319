use crate::application::settings::{FraudThresholds, Settings};
use crate::domain::order::OrderType;
use rust_decimal::Decimal;
use tracing::{debug, warn};

/// Outcome of the fraud gate.
#[derive(Debug, Clone, PartialEq)]
pub enum FraudDecision {
    Allow,
    ManualReview { reason: String },
    Deny { reason: String },
}

impl FraudThresholds {
    /// Deny wins over manual review. A missing amount always needs a human.
    pub fn classify(&self, amount: Option<Decimal>) -> FraudDecision {
        let Some(amount) = amount else {
            return FraudDecision::ManualReview {
                reason: "Manual review required: order has no amount".into(),
            };
        };
        if let Some(deny) = self.deny
            && amount > deny
        {
            return FraudDecision::Deny {
                reason: format!("Denied by fraud check: amount {amount} exceeds {deny}"),
            };
        }
        if let Some(review) = self.manual_review
            && amount > review
        {
            return FraudDecision::ManualReview {
                reason: format!("Manual review required: amount {amount} exceeds {review}"),
            };
        }
        FraudDecision::Allow
    }
}

/// Threshold-based fraud screening.
#[derive(Clone)]
pub struct FraudGate {
    settings: Settings,
}

impl FraudGate {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Classifies an order by its fiat amount.
    ///
    /// If the thresholds cannot be loaded the gate fails open and allows the order.
    pub async fn check(
        &self,
        order_id: i64,
        order_type: OrderType,
        amount: Option<Decimal>,
    ) -> FraudDecision {
        let thresholds = match self.settings.fraud_thresholds().await {
            Ok(t) => t,
            Err(e) => {
                warn!(order_id, error = %e, "Fraud thresholds unavailable, allowing order");
                return FraudDecision::Allow;
            }
        };
        let decision = thresholds.classify(amount);
        debug!(order_id, %order_type, ?decision, "Fraud check");
        decision
    }
}
