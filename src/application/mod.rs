//! Application layer: admission, routing, settlement and the order lifecycle.
//!
//! Services here own no state. Everything goes through a `Store` transaction,
//! and notifications are published only after the transaction that produced
//! them has committed.

pub mod fraud;
pub mod gateway;
pub mod ledger;
pub mod lifecycle;
pub mod processor;
pub mod selector;
pub mod settings;
pub mod worker;

use crate::domain::actor::OrderEvent;
use crate::domain::ports::SinkRef;
use tracing::warn;

/// Delivers events to the sink. Delivery failures are logged and dropped.
pub(crate) async fn publish(sink: &SinkRef, events: Vec<OrderEvent>) {
    for event in events {
        if let Err(e) = sink.emit(event).await {
            warn!(error = %e, "Notification delivery failed");
        }
    }
}
