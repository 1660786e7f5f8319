use crate::application::gateway::SubmitOrder;
use crate::domain::order::OrderType;
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One merchant submission as it appears in the replay CSV.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrderRow {
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub merchant: i64,
    pub store: i64,
    pub amount: Decimal,
    #[serde(default)]
    pub method: Option<i64>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub hosted: Option<bool>,
}

impl OrderRow {
    pub fn into_submission(self) -> SubmitOrder {
        SubmitOrder {
            merchant_id: self.merchant,
            store_id: self.store,
            order_type: self.order_type,
            amount: self.amount,
            target_method_id: self.method,
            customer_id: self.customer.filter(|c| !c.is_empty()),
            callback_url: None,
            hosted: self.hosted.unwrap_or(false),
        }
    }
}

/// Reads order submissions from a CSV source.
///
/// Whitespace around fields is trimmed and trailing optional columns may be
/// left out.
pub struct OrderReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> OrderReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes rows; a malformed row yields an error and the
    /// iterator moves on.
    pub fn orders(self) -> impl Iterator<Item = Result<OrderRow>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(PaymentError::from))
    }
}
