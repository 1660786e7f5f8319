mod common;

use chrono::Utc;
use common::*;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use traffic_router::application::processor::{OrderProcessor, ProcessOutcome};
use traffic_router::application::settings::{
    MAX_RETRIES, RETRY_DELAY_MAX_SECONDS, RETRY_DELAY_SECONDS,
};
use traffic_router::application::worker::{ProcessOrderTask, TaskOutcome};
use traffic_router::domain::actor::OrderEvent;
use traffic_router::domain::order::{IncomingOrderStatus, OrderType};
use traffic_router::domain::ports::{ProcessOrderJob, Store};
use traffic_router::domain::requisite::CandidateQuery;
use traffic_router::infrastructure::in_memory::InMemoryStore;
use traffic_router::infrastructure::queue::WorkerPool;
use traffic_router::infrastructure::support::{RecordingSink, StaticConfig};

fn immediate_retries(max_retries: &str) -> StaticConfig {
    StaticConfig::default()
        .with(MAX_RETRIES, max_retries)
        .with(RETRY_DELAY_SECONDS, "0")
        .with(RETRY_DELAY_MAX_SECONDS, "0")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_delivery_assigns_once() {
    let h = Harness::new().await;
    h.add_trader(3, 1).await;
    h.add_requisite(7, 3, limits(dec!(10), dec!(5000), dec!(50000)))
        .await;
    let id = h.submit(OrderType::PayIn, dec!(100)).await;

    let (first, second) = tokio::join!(h.processor.process(id), h.processor.process(id));
    let outcomes = [first.unwrap(), second.unwrap()];
    let assigned = outcomes
        .iter()
        .filter(|o| matches!(o, ProcessOutcome::Assigned { .. }))
        .count();
    assert_eq!(assigned, 1);
    assert!(outcomes.contains(&ProcessOutcome::Skipped {
        status: IncomingOrderStatus::Assigned
    }));
    assert_eq!(h.order(id).await.status, IncomingOrderStatus::Assigned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_settlement_applies_once() {
    let h = Harness::new().await;
    h.add_trader(3, 1).await;
    h.add_requisite(7, 3, limits(dec!(10), dec!(5000), dec!(50000)))
        .await;
    let id = h.submit(OrderType::PayIn, dec!(100)).await;
    h.completed_turnover(id, 7, 3, dec!(100), Utc::now()).await;
    let order_history_id = {
        let mut tx = h.store.begin().await.unwrap();
        tx.find_order_history(id).await.unwrap().unwrap().id
    };

    let (first, second) = tokio::join!(
        h.ledger.settle_order(order_history_id),
        h.ledger.settle_order(order_history_id)
    );
    let mut results = vec![first.unwrap(), second.unwrap()];
    results.sort();
    assert_eq!(results, vec![false, true]);
    assert_eq!(h.balance(store_key()).await, dec!(1));

    let mut tx = h.store.begin().await.unwrap();
    assert_eq!(tx.balance_history(order_history_id).await.unwrap().len(), 2);
}

fn pay_in_candidates(limit: usize) -> CandidateQuery {
    CandidateQuery {
        order_type: OrderType::PayIn,
        amount: dec!(100),
        fiat_currency_id: FIAT,
        method_id: None,
        limit,
    }
}

async fn two_traders() -> Harness {
    let h = Harness::new().await;
    h.add_trader(3, 1).await;
    h.add_trader(4, 2).await;
    h.add_requisite(7, 3, limits(dec!(10), dec!(5000), dec!(50000)))
        .await;
    h.add_requisite(8, 4, limits(dec!(10), dec!(5000), dec!(50000)))
        .await;
    h
}

#[tokio::test]
async fn test_candidate_fetch_skips_locked_rows_and_respects_limit() {
    let h = two_traders().await;

    let mut holder = h.store.begin().await.unwrap();
    let held = holder.lock_candidates(&pay_in_candidates(1)).await.unwrap();
    assert_eq!(
        held.iter().map(|c| c.requisite_id).collect::<Vec<_>>(),
        vec![7]
    );

    let mut other = h.store.begin().await.unwrap();
    let rest = other.lock_candidates(&pay_in_candidates(5)).await.unwrap();
    assert_eq!(
        rest.iter().map(|c| c.requisite_id).collect::<Vec<_>>(),
        vec![8]
    );
    drop(other);
    drop(holder);

    let mut tx = h.store.begin().await.unwrap();
    assert_eq!(tx.lock_candidates(&pay_in_candidates(5)).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_routing_passes_over_requisites_held_elsewhere() {
    let h = two_traders().await;

    let mut holder = h.store.begin().await.unwrap();
    holder.lock_candidates(&pay_in_candidates(1)).await.unwrap();

    let first = h.submit(OrderType::PayIn, dec!(100)).await;
    let ProcessOutcome::Assigned { order_history_id } = h.processor.process(first).await.unwrap()
    else {
        panic!("the free requisite should be assigned");
    };
    assert_eq!(h.history(order_history_id).await.requisite_id, 8);

    let held = holder.lock_candidates(&pay_in_candidates(2)).await.unwrap();
    assert_eq!(held.len(), 2);
    let second = h.submit(OrderType::PayIn, dec!(100)).await;
    assert_eq!(
        h.processor.process(second).await.unwrap(),
        ProcessOutcome::Retrying { retry_count: 1 }
    );
    drop(holder);
    assert_eq!(h.order(second).await.status, IncomingOrderStatus::Retrying);
}

#[tokio::test]
async fn test_store_outage_is_retryable_and_alerts() {
    let h = Harness::new().await;
    let id = h.submit(OrderType::PayIn, dec!(100)).await;

    h.store.set_available(false);
    let err = h.processor.process(id).await.unwrap_err();
    assert!(err.is_retryable());
    h.store.set_available(true);

    let events = h.sink.events().await;
    assert!(events.iter().any(|e| matches!(
        e,
        OrderEvent::CriticalFailure { incoming_order_id, .. } if *incoming_order_id == id
    )));
    assert_eq!(h.order(id).await.status, IncomingOrderStatus::New);
}

#[tokio::test]
async fn test_failing_sink_does_not_block_assignment() {
    let h = Harness::new().await;
    h.add_trader(3, 1).await;
    h.add_requisite(7, 3, limits(dec!(10), dec!(5000), dec!(50000)))
        .await;
    let id = h.submit(OrderType::PayIn, dec!(100)).await;

    let processor = OrderProcessor::new(
        Arc::new(h.store.clone()),
        h.settings.clone(),
        Arc::new(RecordingSink::failing()),
    );
    assert!(matches!(
        processor.process(id).await.unwrap(),
        ProcessOutcome::Assigned { .. }
    ));
    assert_eq!(h.order(id).await.status, IncomingOrderStatus::Assigned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_pool_fails_order_after_retries() {
    let mut h = Harness::with_config(immediate_retries("2")).await;
    let task = ProcessOrderTask::new(
        h.processor.clone(),
        Arc::new(h.queue.clone()),
        h.settings.clone(),
    );
    let pool = WorkerPool::start(2, h.receiver.take().unwrap(), task);

    let id = h.submit(OrderType::PayIn, dec!(100)).await;
    tokio::time::timeout(Duration::from_secs(10), h.queue.drain())
        .await
        .unwrap();
    pool.shutdown().await;

    let order = h.order(id).await;
    assert_eq!(order.status, IncomingOrderStatus::Failed);
    assert_eq!(order.retry_count, 2);
    assert_eq!(
        order.failure_reason.as_deref(),
        Some("No suitable requisite found: max retries exceeded")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lock_timeout_on_last_attempt_exhausts_retries() {
    let store = InMemoryStore::with_lock_timeout(Duration::from_millis(200));
    let h = Harness::with_store(store, immediate_retries("3")).await;
    h.add_trader(3, 1).await;
    h.add_requisite(7, 3, limits(dec!(10), dec!(5000), dec!(50000)))
        .await;
    let id = h.submit(OrderType::PayIn, dec!(100)).await;

    let mut holder = h.store.begin().await.unwrap();
    holder.lock_incoming_order(id).await.unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(holder);
    });

    let task = ProcessOrderTask::new(
        h.processor.clone(),
        Arc::new(h.queue.clone()),
        h.settings.clone(),
    );
    let job = ProcessOrderJob::new(id).next_attempt().next_attempt();
    assert_eq!(task.run(job).await, TaskOutcome::Exhausted);
    release.await.unwrap();

    let order = h.order(id).await;
    assert_eq!(order.status, IncomingOrderStatus::Failed);
    assert_eq!(order.failure_reason.as_deref(), Some("max retries exceeded"));
    assert!(h.sink.events().await.iter().any(|e| matches!(
        e,
        OrderEvent::CriticalFailure { reason, .. } if reason == "max retries exceeded"
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lock_timeout_reschedules_early_attempts() {
    let store = InMemoryStore::with_lock_timeout(Duration::from_millis(100));
    let h = Harness::with_store(store, immediate_retries("3")).await;
    let id = h.submit(OrderType::PayIn, dec!(100)).await;

    let mut holder = h.store.begin().await.unwrap();
    holder.lock_incoming_order(id).await.unwrap();
    let task = ProcessOrderTask::new(
        h.processor.clone(),
        Arc::new(h.queue.clone()),
        h.settings.clone(),
    );
    let outcome = task.run(ProcessOrderJob::new(id)).await;
    drop(holder);
    assert!(matches!(outcome, TaskOutcome::Rescheduled { attempt: 1, .. }));
}
