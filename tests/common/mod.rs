#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use traffic_router::application::gateway::{PaymentGateway, SubmitOrder};
use traffic_router::application::ledger::Ledger;
use traffic_router::application::lifecycle::{LifecycleManager, Receipt};
use traffic_router::application::processor::{OrderProcessor, ProcessOutcome};
use traffic_router::application::settings::Settings;
use traffic_router::domain::balance::{Balance, BalanceKey};
use traffic_router::domain::merchant::{CommissionRate, ExchangeRate, MerchantStore};
use traffic_router::domain::order::{
    IncomingOrder, NewOrderHistory, OrderHistory, OrderHistoryStatus, OrderHistoryUpdate,
    OrderType,
};
use traffic_router::domain::ports::Store;
use traffic_router::domain::requisite::{Requisite, RequisiteLimits, RequisiteStatus, Trader};
use traffic_router::infrastructure::in_memory::InMemoryStore;
use traffic_router::infrastructure::queue::{JobReceiver, TokioTaskQueue};
use traffic_router::infrastructure::support::{
    InMemoryObjectStorage, RecordingSink, StaticConfig,
};

pub const MERCHANT: i64 = 1;
pub const STORE: i64 = 10;
pub const FIAT: i64 = 1;
pub const CRYPTO: i64 = 2;
pub const METHOD: i64 = 1;

/// Every service wired against one in-memory store.
pub struct Harness {
    pub store: InMemoryStore,
    pub sink: RecordingSink,
    pub storage: InMemoryObjectStorage,
    pub queue: TokioTaskQueue,
    pub receiver: Option<JobReceiver>,
    pub settings: Settings,
    pub gateway: PaymentGateway,
    pub processor: OrderProcessor,
    pub lifecycle: LifecycleManager,
    pub ledger: Ledger,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(StaticConfig::default()).await
    }

    /// A store with one merchant store (pay-in and pay-out, limits 1..100000),
    /// 2.5% store commission and a rate of 100 fiat per crypto unit.
    pub async fn with_config(config: StaticConfig) -> Self {
        Self::with_store(InMemoryStore::new(), config).await
    }

    pub async fn with_store(store: InMemoryStore, config: StaticConfig) -> Self {
        let sink = RecordingSink::new();
        let storage = InMemoryObjectStorage::new();
        let (queue, receiver) = TokioTaskQueue::channel();
        let settings = Settings::new(Arc::new(config));
        let store_ref: Arc<dyn Store> = Arc::new(store.clone());

        let gateway = PaymentGateway::new(
            store_ref.clone(),
            Arc::new(queue.clone()),
            settings.clone(),
            Arc::new(sink.clone()),
            "https://pay.example.com",
        );
        let processor =
            OrderProcessor::new(store_ref.clone(), settings.clone(), Arc::new(sink.clone()));
        let lifecycle = LifecycleManager::new(
            store_ref.clone(),
            Arc::new(storage.clone()),
            Arc::new(queue.clone()),
            Arc::new(sink.clone()),
        );
        let ledger = Ledger::new(store_ref, Arc::new(sink.clone()));

        let harness = Self {
            store,
            sink,
            storage,
            queue,
            receiver: Some(receiver),
            settings,
            gateway,
            processor,
            lifecycle,
            ledger,
        };
        harness.seed_reference_data().await;
        harness
    }

    async fn seed_reference_data(&self) {
        self.store
            .insert_merchant_store(MerchantStore {
                id: STORE,
                merchant_id: MERCHANT,
                crypto_currency_id: CRYPTO,
                fiat_currency_id: FIAT,
                fiat_currency_code: "RUB".into(),
                lower_limit: dec!(1),
                upper_limit: dec!(100000),
                access: true,
                pay_in_enabled: true,
                pay_out_enabled: true,
            })
            .await;
        self.store
            .insert_store_commission(CommissionRate {
                owner_id: STORE,
                commission_pay_in: dec!(2.5),
                commission_pay_out: dec!(1),
                updated_at: Utc::now() - Duration::days(1),
            })
            .await;
        self.store
            .insert_exchange_rate(ExchangeRate {
                crypto_currency_id: CRYPTO,
                fiat_currency_id: FIAT,
                rate: dec!(100),
                updated_at: Utc::now() - Duration::hours(1),
            })
            .await;
    }

    /// An online trader with a 1.5% pay-in and 1% pay-out commission.
    pub async fn add_trader(&self, id: i64, priority: i32) {
        self.store
            .insert_trader(Trader {
                id,
                user_id: id * 100,
                user_active: true,
                in_work: true,
                is_traffic_enabled_by_teamlead: true,
                trafic_priority: priority,
            })
            .await;
        self.store
            .insert_trader_commission(CommissionRate {
                owner_id: id,
                commission_pay_in: dec!(1.5),
                commission_pay_out: dec!(1),
                updated_at: Utc::now() - Duration::days(1),
            })
            .await;
    }

    pub async fn add_requisite(&self, id: i64, trader_id: i64, limits: RequisiteLimits) {
        self.add_requisite_used_at(id, trader_id, limits, None).await;
    }

    pub async fn add_requisite_used_at(
        &self,
        id: i64,
        trader_id: i64,
        limits: RequisiteLimits,
        last_used_at: Option<DateTime<Utc>>,
    ) {
        self.store
            .insert_requisite(
                Requisite {
                    id,
                    trader_id,
                    method_id: METHOD,
                    bank_id: None,
                    fiat_currency_id: FIAT,
                    status: RequisiteStatus::Approve,
                    is_excluded_from_distribution: false,
                    last_used_at,
                },
                RequisiteLimits {
                    requisite_id: id,
                    ..limits
                },
            )
            .await;
    }

    pub async fn submit(&self, order_type: OrderType, amount: Decimal) -> i64 {
        self.gateway
            .submit(SubmitOrder {
                merchant_id: MERCHANT,
                store_id: STORE,
                order_type,
                amount,
                target_method_id: None,
                customer_id: Some("customer-1".into()),
                callback_url: None,
                hosted: false,
            })
            .await
            .unwrap()
            .incoming_order_id
    }

    /// Submits and routes a pay-in order, returning its settlement record id.
    pub async fn assigned_pay_in(&self, amount: Decimal) -> i64 {
        let id = self.submit(OrderType::PayIn, amount).await;
        match self.processor.process(id).await.unwrap() {
            ProcessOutcome::Assigned { order_history_id } => order_history_id,
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    pub async fn order(&self, id: i64) -> IncomingOrder {
        let mut tx = self.store.begin().await.unwrap();
        tx.get_incoming_order(id).await.unwrap().unwrap()
    }

    pub async fn history(&self, id: i64) -> OrderHistory {
        let mut tx = self.store.begin().await.unwrap();
        tx.get_order_history(id).await.unwrap().unwrap()
    }

    pub async fn balance(&self, key: BalanceKey) -> Decimal {
        let mut tx = self.store.begin().await.unwrap();
        tx.get_balance(key)
            .await
            .unwrap()
            .map(|b| b.0)
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn seed_balance(&self, key: BalanceKey, amount: Decimal) {
        self.store.seed_balance(key, Balance::new(amount)).await;
    }

    /// Records a completed settlement on a requisite, counting towards its turnover.
    pub async fn completed_turnover(
        &self,
        incoming_order_id: i64,
        requisite_id: i64,
        trader_id: i64,
        total_fiat: Decimal,
        completed_at: DateTime<Utc>,
    ) {
        let mut tx = self.store.begin().await.unwrap();
        let history = tx
            .insert_order_history(NewOrderHistory {
                incoming_order_id,
                merchant_id: MERCHANT,
                store_id: STORE,
                requisite_id,
                trader_id,
                order_type: OrderType::PayIn,
                fiat_currency_id: FIAT,
                crypto_currency_id: CRYPTO,
                amount_fiat: Some(total_fiat),
                amount_crypto: None,
                store_commission: Decimal::ZERO,
                trader_commission: Decimal::ZERO,
                exchange_rate: dec!(100),
                amount_currency: total_fiat / dec!(100),
                total_fiat,
            })
            .await
            .unwrap();
        tx.update_order_history(
            history.id,
            &OrderHistoryUpdate {
                completed_at: Some(completed_at),
                ..OrderHistoryUpdate::status(OrderHistoryStatus::Completed)
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }
}

pub fn limits(lower: Decimal, upper: Decimal, total: Decimal) -> RequisiteLimits {
    RequisiteLimits {
        requisite_id: 0,
        pay_in: true,
        pay_out: true,
        lower_limit: lower,
        upper_limit: upper,
        total_limit: total,
        turnover_limit_minutes: 60,
        turnover_day_max: dec!(1000000),
    }
}

pub fn store_key() -> BalanceKey {
    BalanceKey::Store {
        store_id: STORE,
        crypto_currency_id: CRYPTO,
    }
}

pub fn trader_key(trader_id: i64) -> BalanceKey {
    BalanceKey::Trader {
        trader_id,
        fiat_currency_id: FIAT,
    }
}

pub fn receipt(name: &str) -> Receipt {
    Receipt {
        bytes: name.as_bytes().to_vec(),
        filename: format!("{name}.pdf"),
    }
}
