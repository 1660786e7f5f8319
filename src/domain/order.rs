use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Declares a string-backed status enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::error::PaymentError;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::error::PaymentError::ValidationError(format!(
                        "Unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use string_enum;

string_enum!(
    /// Direction of a payment request.
    OrderType {
        PayIn => "pay_in",
        PayOut => "pay_out",
    }
);

string_enum!(
    IncomingOrderStatus {
        New => "new",
        PaymentSessionActive => "payment_session_active",
        ClientPaymentConfirmed => "client_payment_confirmed",
        Processing => "processing",
        Retrying => "retrying",
        Assigned => "assigned",
        Processed => "processed",
        ManualReview => "manual_review",
        Failed => "failed",
        Canceled => "canceled",
    }
);

impl IncomingOrderStatus {
    /// Statuses the orchestrator picks up.
    pub fn is_processable(&self) -> bool {
        matches!(
            self,
            IncomingOrderStatus::New
                | IncomingOrderStatus::Retrying
                | IncomingOrderStatus::ClientPaymentConfirmed
        )
    }

    /// Statuses from which a client may confirm before a requisite is assigned.
    pub fn accepts_client_confirmation(&self) -> bool {
        matches!(
            self,
            IncomingOrderStatus::New
                | IncomingOrderStatus::Processing
                | IncomingOrderStatus::Retrying
                | IncomingOrderStatus::PaymentSessionActive
        )
    }

    /// Statuses in which the order is still waiting for a requisite.
    pub fn is_pending_assignment(&self) -> bool {
        matches!(
            self,
            IncomingOrderStatus::New
                | IncomingOrderStatus::PaymentSessionActive
                | IncomingOrderStatus::ClientPaymentConfirmed
                | IncomingOrderStatus::Retrying
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IncomingOrderStatus::Processed
                | IncomingOrderStatus::Failed
                | IncomingOrderStatus::Canceled
        )
    }
}

string_enum!(
    OrderHistoryStatus {
        Pending => "pending",
        PendingClientConfirmation => "pending_client_confirmation",
        PendingTraderConfirmation => "pending_trader_confirmation",
        AwaitingPayoutProof => "awaiting_payout_proof",
        Completed => "completed",
        Canceled => "canceled",
        Disputed => "disputed",
        Failed => "failed",
    }
);

impl OrderHistoryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderHistoryStatus::Completed
                | OrderHistoryStatus::Canceled
                | OrderHistoryStatus::Failed
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            OrderHistoryStatus::Pending
                | OrderHistoryStatus::PendingClientConfirmation
                | OrderHistoryStatus::PendingTraderConfirmation
                | OrderHistoryStatus::AwaitingPayoutProof
        )
    }

    pub fn is_disputable(&self) -> bool {
        !matches!(
            self,
            OrderHistoryStatus::Canceled | OrderHistoryStatus::Failed | OrderHistoryStatus::Disputed
        )
    }

    pub fn awaits_trader(&self) -> bool {
        matches!(
            self,
            OrderHistoryStatus::PendingTraderConfirmation | OrderHistoryStatus::AwaitingPayoutProof
        )
    }

    pub fn awaits_client(&self) -> bool {
        matches!(
            self,
            OrderHistoryStatus::Pending | OrderHistoryStatus::PendingClientConfirmation
        )
    }

    /// Valid outcomes of a dispute resolution.
    pub fn is_resolution(&self) -> bool {
        self.is_terminal()
    }
}

string_enum!(
    /// Ledger state of a settlement record. Guards against settling twice.
    SettlementState {
        Unsettled => "unsettled",
        Settled => "settled",
        Reversed => "reversed",
    }
);

string_enum!(
    SessionStatus {
        Active => "active",
        Confirmed => "confirmed",
        Expired => "expired",
    }
);

/// A requested payment, as admitted by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingOrder {
    pub id: i64,
    pub merchant_id: i64,
    pub store_id: i64,
    pub order_type: OrderType,
    pub amount_fiat: Option<Decimal>,
    pub amount_crypto: Option<Decimal>,
    pub fiat_currency_id: i64,
    pub crypto_currency_id: i64,
    pub target_method_id: Option<i64>,
    pub customer_id: Option<String>,
    pub callback_url: Option<String>,
    pub status: IncomingOrderStatus,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when an order is first persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIncomingOrder {
    pub merchant_id: i64,
    pub store_id: i64,
    pub order_type: OrderType,
    pub amount_fiat: Option<Decimal>,
    pub amount_crypto: Option<Decimal>,
    pub fiat_currency_id: i64,
    pub crypto_currency_id: i64,
    pub target_method_id: Option<i64>,
    pub customer_id: Option<String>,
    pub callback_url: Option<String>,
    pub status: IncomingOrderStatus,
}

impl NewIncomingOrder {
    pub fn into_order(self, id: i64, now: DateTime<Utc>) -> IncomingOrder {
        IncomingOrder {
            id,
            merchant_id: self.merchant_id,
            store_id: self.store_id,
            order_type: self.order_type,
            amount_fiat: self.amount_fiat,
            amount_crypto: self.amount_crypto,
            fiat_currency_id: self.fiat_currency_id,
            crypto_currency_id: self.crypto_currency_id,
            target_method_id: self.target_method_id,
            customer_id: self.customer_id,
            callback_url: self.callback_url,
            status: self.status,
            retry_count: 0,
            failure_reason: None,
            last_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The only fields of an `IncomingOrder` that change after admission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingOrderUpdate {
    pub status: Option<IncomingOrderStatus>,
    pub retry_count: Option<u32>,
    /// `Some(None)` clears the reason.
    pub failure_reason: Option<Option<String>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl IncomingOrderUpdate {
    pub fn status(status: IncomingOrderStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(Some(reason.into()));
        self
    }

    pub fn apply(&self, order: &mut IncomingOrder, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            order.status = status;
        }
        if let Some(count) = self.retry_count {
            order.retry_count = count;
        }
        if let Some(reason) = &self.failure_reason {
            order.failure_reason = reason.clone();
        }
        if let Some(at) = self.last_attempt_at {
            order.last_attempt_at = Some(at);
        }
        order.updated_at = now;
    }
}

/// Hosted payment page context for a pay-in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub token: String,
    pub incoming_order_id: i64,
    pub status: SessionStatus,
    pub amount_fiat_snapshot: Decimal,
    pub currency_code_snapshot: String,
    pub expires_at: DateTime<Utc>,
}

impl PaymentSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Expired || now >= self.expires_at
    }
}

/// Settlement record created once a requisite is matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHistory {
    pub id: i64,
    pub incoming_order_id: i64,
    pub merchant_id: i64,
    pub store_id: i64,
    pub requisite_id: i64,
    pub trader_id: i64,
    pub order_type: OrderType,
    pub fiat_currency_id: i64,
    pub crypto_currency_id: i64,
    pub amount_fiat: Option<Decimal>,
    pub amount_crypto: Option<Decimal>,
    pub store_commission: Decimal,
    /// In the fiat currency, whatever the direction.
    pub trader_commission: Decimal,
    pub exchange_rate: Decimal,
    pub amount_currency: Decimal,
    pub total_fiat: Decimal,
    pub status: OrderHistoryStatus,
    pub settlement: SettlementState,
    pub status_reason: Option<String>,
    pub client_receipt_url: Option<String>,
    pub trader_receipt_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOrderHistory {
    pub incoming_order_id: i64,
    pub merchant_id: i64,
    pub store_id: i64,
    pub requisite_id: i64,
    pub trader_id: i64,
    pub order_type: OrderType,
    pub fiat_currency_id: i64,
    pub crypto_currency_id: i64,
    pub amount_fiat: Option<Decimal>,
    pub amount_crypto: Option<Decimal>,
    pub store_commission: Decimal,
    pub trader_commission: Decimal,
    pub exchange_rate: Decimal,
    pub amount_currency: Decimal,
    pub total_fiat: Decimal,
}

impl NewOrderHistory {
    pub fn into_history(self, id: i64, now: DateTime<Utc>) -> OrderHistory {
        OrderHistory {
            id,
            incoming_order_id: self.incoming_order_id,
            merchant_id: self.merchant_id,
            store_id: self.store_id,
            requisite_id: self.requisite_id,
            trader_id: self.trader_id,
            order_type: self.order_type,
            fiat_currency_id: self.fiat_currency_id,
            crypto_currency_id: self.crypto_currency_id,
            amount_fiat: self.amount_fiat,
            amount_crypto: self.amount_crypto,
            store_commission: self.store_commission,
            trader_commission: self.trader_commission,
            exchange_rate: self.exchange_rate,
            amount_currency: self.amount_currency,
            total_fiat: self.total_fiat,
            status: OrderHistoryStatus::Pending,
            settlement: SettlementState::Unsettled,
            status_reason: None,
            client_receipt_url: None,
            trader_receipt_url: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// The only fields of an `OrderHistory` that change after creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderHistoryUpdate {
    pub status: Option<OrderHistoryStatus>,
    pub settlement: Option<SettlementState>,
    pub status_reason: Option<String>,
    pub client_receipt_url: Option<String>,
    pub trader_receipt_url: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OrderHistoryUpdate {
    pub fn status(status: OrderHistoryStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.status_reason = Some(reason.into());
        self
    }

    pub fn apply(&self, history: &mut OrderHistory, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            history.status = status;
        }
        if let Some(settlement) = self.settlement {
            history.settlement = settlement;
        }
        if let Some(reason) = &self.status_reason {
            history.status_reason = Some(reason.clone());
        }
        if let Some(url) = &self.client_receipt_url {
            history.client_receipt_url = Some(url.clone());
        }
        if let Some(url) = &self.trader_receipt_url {
            history.trader_receipt_url = Some(url.clone());
        }
        if let Some(at) = self.completed_at {
            history.completed_at = Some(at);
        }
        history.updated_at = now;
    }
}

/// How external callers identify an order: by id, or by payment session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderRef {
    Id(i64),
    Token(String),
}

/// Either shape of an order, exposing the fields pricing and routing need.
#[derive(Debug, Clone, Copy)]
pub enum OrderLike<'a> {
    Incoming(&'a IncomingOrder),
    Settlement(&'a OrderHistory),
}

impl OrderLike<'_> {
    pub fn incoming_order_id(&self) -> i64 {
        match self {
            OrderLike::Incoming(o) => o.id,
            OrderLike::Settlement(h) => h.incoming_order_id,
        }
    }

    pub fn store_id(&self) -> i64 {
        match self {
            OrderLike::Incoming(o) => o.store_id,
            OrderLike::Settlement(h) => h.store_id,
        }
    }

    pub fn order_type(&self) -> OrderType {
        match self {
            OrderLike::Incoming(o) => o.order_type,
            OrderLike::Settlement(h) => h.order_type,
        }
    }

    /// `(crypto_currency_id, fiat_currency_id)`
    pub fn currency_pair(&self) -> (i64, i64) {
        match self {
            OrderLike::Incoming(o) => (o.crypto_currency_id, o.fiat_currency_id),
            OrderLike::Settlement(h) => (h.crypto_currency_id, h.fiat_currency_id),
        }
    }

    fn amounts(&self) -> (Option<Decimal>, Option<Decimal>) {
        match self {
            OrderLike::Incoming(o) => (o.amount_fiat, o.amount_crypto),
            OrderLike::Settlement(h) => (h.amount_fiat, h.amount_crypto),
        }
    }

    /// Fiat amount for pay-in, crypto amount for pay-out.
    pub fn base_amount(&self) -> Option<Decimal> {
        let (fiat, crypto) = self.amounts();
        match self.order_type() {
            OrderType::PayIn => fiat,
            OrderType::PayOut => crypto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(order_type: OrderType) -> IncomingOrder {
        NewIncomingOrder {
            merchant_id: 1,
            store_id: 2,
            order_type,
            amount_fiat: Some(dec!(100)),
            amount_crypto: Some(dec!(1.5)),
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
    fn test_status_round_trips_through_strings() {
        let status: OrderHistoryStatus = "pending_trader_confirmation".parse().unwrap();
        assert_eq!(status, OrderHistoryStatus::PendingTraderConfirmation);
        assert_eq!(status.to_string(), "pending_trader_confirmation");
        assert!("bogus".parse::<OrderType>().is_err());
    }

    #[test]
    fn test_base_amount_follows_direction() {
        let pay_in = order(OrderType::PayIn);
        let pay_out = order(OrderType::PayOut);
        assert_eq!(OrderLike::Incoming(&pay_in).base_amount(), Some(dec!(100)));
        assert_eq!(OrderLike::Incoming(&pay_out).base_amount(), Some(dec!(1.5)));
    }

    #[test]
    fn test_update_clears_failure_reason() {
        let mut o = order(OrderType::PayIn);
        o.failure_reason = Some("old".into());
        let update = IncomingOrderUpdate {
            failure_reason: Some(None),
            ..IncomingOrderUpdate::status(IncomingOrderStatus::Assigned)
        };
        update.apply(&mut o, Utc::now());
        assert_eq!(o.status, IncomingOrderStatus::Assigned);
        assert_eq!(o.failure_reason, None);
    }

    #[test]
    fn test_terminal_history_statuses() {
        assert!(OrderHistoryStatus::Completed.is_terminal());
        assert!(!OrderHistoryStatus::Completed.is_cancellable());
        assert!(OrderHistoryStatus::Completed.is_disputable());
        assert!(!OrderHistoryStatus::Disputed.is_disputable());
        assert!(!OrderHistoryStatus::Disputed.is_resolution());
    }
}
