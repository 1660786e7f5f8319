use crate::domain::balance::{Balance, BalanceKey};
use crate::domain::order::string_enum;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

string_enum!(Role {
    Client => "client",
    Merchant => "merchant",
    Trader => "trader",
    Support => "support",
    Admin => "admin",
    System => "system",
});

impl Role {
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Support | Role::Admin)
    }
}

/// Whoever triggers a state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Merchant id, trader id or staff user id depending on the role.
    pub id: Option<i64>,
    pub role: Role,
}

impl Actor {
    pub fn new(role: Role, id: i64) -> Self {
        Self { id: Some(id), role }
    }

    pub fn system() -> Self {
        Self {
            id: None,
            role: Role::System,
        }
    }

    pub fn client() -> Self {
        Self {
            id: None,
            role: Role::Client,
        }
    }

    pub fn is(&self, role: Role, id: i64) -> bool {
        self.role == role && self.id == Some(id)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{} {}", self.role, id),
            None => write!(f, "{}", self.role),
        }
    }
}

string_enum!(AuditEntity {
    IncomingOrder => "incoming_order",
    OrderHistory => "order_history",
    PaymentSession => "payment_session",
});

/// One append-only status change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entity: AuditEntity,
    /// Payment sessions are keyed by their incoming order id.
    pub entity_id: i64,
    pub actor: Actor,
    pub previous_status: Option<String>,
    pub new_status: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Notification emitted once the transaction that produced it has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderEvent {
    StatusChanged {
        entity: AuditEntity,
        entity_id: i64,
        from: Option<String>,
        to: String,
        reason: Option<String>,
    },
    BalanceChanged {
        key: BalanceKey,
        change: Decimal,
        new_balance: Balance,
        order_history_id: i64,
    },
    CriticalFailure {
        incoming_order_id: i64,
        reason: String,
    },
}
