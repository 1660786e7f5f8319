use crate::domain::balance::BalanceKey;
use crate::domain::order::{IncomingOrderStatus, OrderHistoryStatus, OrderType};
use crate::domain::ports::Store;
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderReportRow {
    pub order: i64,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub store: i64,
    pub status: IncomingOrderStatus,
    pub retries: u32,
    pub settlement: Option<i64>,
    pub settlement_status: Option<OrderHistoryStatus>,
    pub requisite: Option<i64>,
    pub trader: Option<i64>,
    pub amount_currency: Option<Decimal>,
    pub total_fiat: Option<Decimal>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceReportRow {
    pub owner: &'static str,
    pub owner_id: i64,
    pub currency: i64,
    pub balance: Decimal,
}

impl From<(BalanceKey, Decimal)> for BalanceReportRow {
    fn from((key, balance): (BalanceKey, Decimal)) -> Self {
        Self {
            owner: key.owner_kind(),
            owner_id: key.owner_id(),
            currency: key.currency_id(),
            balance: balance.normalize(),
        }
    }
}

/// Snapshot of every order and balance, read in one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub orders: Vec<OrderReportRow>,
    pub balances: Vec<BalanceReportRow>,
}

impl Report {
    pub async fn collect(store: &dyn Store) -> Result<Self> {
        let mut tx = store.begin().await?;
        let mut orders = Vec::new();
        for order in tx.list_incoming_orders().await? {
            let history = tx.find_order_history(order.id).await?;
            orders.push(OrderReportRow {
                order: order.id,
                order_type: order.order_type,
                store: order.store_id,
                status: order.status,
                retries: order.retry_count,
                settlement: history.as_ref().map(|h| h.id),
                settlement_status: history.as_ref().map(|h| h.status),
                requisite: history.as_ref().map(|h| h.requisite_id),
                trader: history.as_ref().map(|h| h.trader_id),
                amount_currency: history.as_ref().map(|h| h.amount_currency.normalize()),
                total_fiat: history.as_ref().map(|h| h.total_fiat.normalize()),
                reason: order.failure_reason,
            });
        }
        let balances = tx
            .list_balances()
            .await?
            .into_iter()
            .map(|(key, balance)| BalanceReportRow::from((key, balance.0)))
            .collect();
        Ok(Self { orders, balances })
    }
}

const ORDER_HEADER: [&str; 12] = [
    "order",
    "type",
    "store",
    "status",
    "retries",
    "settlement",
    "settlement_status",
    "requisite",
    "trader",
    "amount_currency",
    "total_fiat",
    "reason",
];

const BALANCE_HEADER: [&str; 4] = ["owner", "owner_id", "currency", "balance"];

fn write_section<W: Write, T: Serialize>(sink: W, header: &[&str], rows: &[T]) -> Result<W> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(sink);
    writer.write_record(header)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| PaymentError::IoError(e.into_error()))
}

/// Writes a report as two CSV sections, orders then balances, separated by
/// an empty line.
pub struct ReportWriter<W: Write> {
    sink: W,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub fn write_report(&mut self, report: &Report) -> Result<()> {
        let sink = write_section(&mut self.sink, &ORDER_HEADER, &report.orders)?;
        sink.write_all(b"\n")?;
        let sink = write_section(sink, &BALANCE_HEADER, &report.balances)?;
        sink.flush()?;
        Ok(())
    }
}
