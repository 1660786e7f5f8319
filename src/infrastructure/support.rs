use crate::domain::actor::OrderEvent;
use crate::domain::ports::{ConfigProvider, NotificationSink, ObjectStorage};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{error, info};

/// Configuration backed by a fixed map.
#[derive(Debug, Default, Clone)]
pub struct StaticConfig {
    values: HashMap<String, String>,
    unavailable: bool,
}

impl StaticConfig {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self {
            values,
            unavailable: false,
        }
    }

    /// A provider whose every lookup fails.
    pub fn unavailable() -> Self {
        Self {
            values: HashMap::new(),
            unavailable: true,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }
}

#[async_trait]
impl ConfigProvider for StaticConfig {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if self.unavailable {
            return Err(PaymentError::StorageError(format!(
                "config provider unavailable while reading '{key}'"
            )));
        }
        Ok(self.values.get(key).cloned())
    }
}

/// Writes every event to the log. Critical failures are logged at error level.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn emit(&self, event: OrderEvent) -> Result<()> {
        match &event {
            OrderEvent::CriticalFailure {
                incoming_order_id,
                reason,
            } => error!(alert = "critical", incoming_order_id, %reason, "Critical order failure"),
            OrderEvent::StatusChanged {
                entity,
                entity_id,
                from,
                to,
                ..
            } => info!(%entity, entity_id, from = from.as_deref().unwrap_or("-"), %to, "Status changed"),
            OrderEvent::BalanceChanged {
                key,
                change,
                new_balance,
                order_history_id,
            } => info!(%key, %change, %new_balance, order_history_id, "Balance changed"),
        }
        Ok(())
    }
}

/// Keeps emitted events in memory so callers can inspect them.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<RwLock<Vec<OrderEvent>>>,
    failing: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that records nothing and rejects every event.
    pub fn failing() -> Self {
        Self {
            events: Arc::default(),
            failing: true,
        }
    }

    pub async fn events(&self) -> Vec<OrderEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn emit(&self, event: OrderEvent) -> Result<()> {
        if self.failing {
            return Err(PaymentError::StorageError("notification sink offline".into()));
        }
        self.events.write().await.push(event);
        Ok(())
    }
}

/// Object storage that keeps uploads in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryObjectStorage {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    counter: Arc<AtomicU64>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(url).cloned()
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn upload(&self, bytes: Vec<u8>, filename: &str) -> Result<String> {
        if filename.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "Receipt filename must not be empty".into(),
            ));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let url = format!("memory://receipts/{n}/{filename}");
        self.objects.write().await.insert(url.clone(), bytes);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uploads_get_distinct_urls() {
        let storage = InMemoryObjectStorage::new();
        let a = storage.upload(b"one".to_vec(), "r.pdf").await.unwrap();
        let b = storage.upload(b"two".to_vec(), "r.pdf").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(storage.get(&a).await.unwrap(), b"one".to_vec());
    }

    #[tokio::test]
    async fn test_failing_sink_rejects() {
        let sink = RecordingSink::failing();
        let event = OrderEvent::CriticalFailure {
            incoming_order_id: 1,
            reason: "x".into(),
        };
        assert!(sink.emit(event).await.is_err());
        assert!(sink.events().await.is_empty());
    }
}
