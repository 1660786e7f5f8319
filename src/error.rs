use rust_decimal::Decimal;
use std::fmt;
use thiserror::Error;

/// Pipeline stage an error was raised in, carried for post-mortem context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Admission,
    Load,
    Fraud,
    Select,
    Commission,
    Assign,
    Settle,
    Transition,
    StatusUpdate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Admission => "admission",
            Stage::Load => "load",
            Stage::Fraud => "fraud",
            Stage::Select => "select",
            Stage::Commission => "commission",
            Stage::Assign => "assign",
            Stage::Settle => "settle",
            Stage::Transition => "transition",
            Stage::StatusUpdate => "status_update",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("{entity} {id} not found")]
    NotFoundError { entity: &'static str, id: String },
    #[error("Invalid transition for {entity} {id}: cannot {action} from status '{from}'")]
    InvalidTransitionError {
        entity: &'static str,
        id: i64,
        action: &'static str,
        from: String,
    },
    #[error("Actor {actor} is not allowed to {action}")]
    AuthorizationError { actor: String, action: &'static str },
    #[error("Insufficient balance on {account}: balance {balance}, change {change}")]
    InsufficientBalanceError {
        account: String,
        balance: Decimal,
        change: Decimal,
    },
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Order {incoming_order_id} already has a settlement record")]
    DuplicateSettlementError { incoming_order_id: i64 },
    #[error("Payment session {token} has expired")]
    SessionExpiredError { token: String },
    #[error("Timed out waiting for lock on {0}")]
    LockTimeoutError(String),
    #[error("Storage unavailable: {0}")]
    StorageError(String),
    #[cfg(feature = "storage-postgres")]
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[cfg(feature = "storage-postgres")]
    #[error("Migration error: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
    #[error("Order {order_id} failed at {stage}: {source}")]
    StageError {
        order_id: i64,
        stage: Stage,
        #[source]
        source: Box<PaymentError>,
    },
}

impl PaymentError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        PaymentError::NotFoundError {
            entity,
            id: id.to_string(),
        }
    }

    /// Infrastructure failures are retried by the task layer; everything else is a
    /// business outcome that must be resolved to a status.
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::LockTimeoutError(_) | PaymentError::StorageError(_) => true,
            #[cfg(feature = "storage-postgres")]
            PaymentError::DatabaseError(e) => !matches!(e, sqlx::Error::RowNotFound),
            PaymentError::StageError { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The innermost error, with stage wrappers peeled off.
    pub fn root(&self) -> &PaymentError {
        match self {
            PaymentError::StageError { source, .. } => source.root(),
            other => other,
        }
    }

    /// Reason string persisted on orders and shown to status pollers.
    pub fn public_reason(&self) -> String {
        let reason = match self.root() {
            PaymentError::ConfigurationError(_) => "Configuration error".to_string(),
            PaymentError::InsufficientBalanceError { .. } => "Insufficient balance".to_string(),
            PaymentError::LockTimeoutError(_)
            | PaymentError::StorageError(_)
            | PaymentError::IoError(_) => "Temporary processing failure".to_string(),
            #[cfg(feature = "storage-postgres")]
            PaymentError::DatabaseError(_) | PaymentError::MigrationError(_) => {
                "Temporary processing failure".to_string()
            }
            other => other.to_string(),
        };
        truncate(reason, 255)
    }

    pub(crate) fn at(self, order_id: i64, stage: Stage) -> Self {
        match self {
            wrapped @ PaymentError::StageError { .. } => wrapped,
            other => PaymentError::StageError {
                order_id,
                stage,
                source: Box::new(other),
            },
        }
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

pub type Result<T> = std::result::Result<T, PaymentError>;

/// Attaches order id and stage to errors raised inside the pipeline.
pub(crate) trait StageExt<T> {
    fn at(self, order_id: i64, stage: Stage) -> Result<T>;
}

impl<T> StageExt<T> for Result<T> {
    fn at(self, order_id: i64, stage: Stage) -> Result<T> {
        self.map_err(|e| e.at(order_id, stage))
    }
}
