//! End-to-end execution flow against a live PostgreSQL instance.
//!
//! These tests exercise the full pipeline - submit, split, claim, place,
//! monitor, finalize - with the deterministic mock broker. They are ignored
//! by default; run them with a local database:
//!
//! ```text
//! docker run -d -p 5432:5432 -e POSTGRES_USER=pulse \
//!     -e POSTGRES_PASSWORD=pulse123 -e POSTGRES_DB=pulse_db postgres:16
//! cargo test -- --ignored --test-threads=1
//! ```
//!
//! Single-threaded because the claim queries sweep the shared tables and
//! would otherwise grab slices seeded by a sibling test.

use std::sync::Arc;

use rust_decimal::Decimal;

use pulse_backend::broker::{BrokerAdapter, MockBroker, PlaceOrderRequest};
use pulse_backend::config::{
    ExecutionWorkerConfig, MockScenario, SplittingWorkerConfig, StoreSettings,
    TimeoutMonitorConfig,
};
use pulse_backend::context::RequestContext;
use pulse_backend::core_types::{generate_request_id, generate_slice_id};
use pulse_backend::db::Database;
use pulse_backend::models::{
    BrokerEventType, ExecutionResult, ExecutionStatus, NewOrder, Order, OrderType, QueueStatus,
    Side, SliceStatus,
};
use pulse_backend::store::{
    BrokerEventStore, ExecutionStore, NewSlice, OrderStore, SliceStore,
};
use pulse_backend::workers::{
    CancellationHandler, ExecutionWorker, SplittingWorker, TimeoutMonitor,
};

async fn test_db() -> Database {
    let db = Database::connect(&StoreSettings {
        host: "localhost".to_string(),
        port: 5432,
        user: "pulse".to_string(),
        password: "pulse123".to_string(),
        name: "pulse_db".to_string(),
        pool_size: 8,
    })
    .await
    .expect("requires PostgreSQL");
    db.ensure_schema().await.expect("schema bootstrap");
    db
}

fn execution_config() -> ExecutionWorkerConfig {
    ExecutionWorkerConfig {
        poll_interval_seconds: 0,
        batch_size: 10,
        executor_timeout_minutes: 5,
        execution_timeout_minutes: 30,
        max_placement_attempts: 3,
    }
}

fn new_order(num_splits: i32) -> NewOrder {
    NewOrder {
        instrument: "NSE:RELIANCE".to_string(),
        side: Side::Buy,
        total_quantity: 100,
        num_splits,
        duration_minutes: 60,
        randomize: false,
        order_unique_key: format!("e2e-{}", generate_request_id()),
    }
}

/// Insert `quantities.len()` slices for `order`, all due immediately
/// (scheduled at the order's creation instant).
async fn seed_slices(
    db: &Database,
    order: &Order,
    quantities: &[(i32, OrderType, Option<Decimal>)],
) -> Vec<String> {
    let slices: Vec<NewSlice> = quantities
        .iter()
        .enumerate()
        .map(|(i, (quantity, order_type, limit_price))| NewSlice {
            id: generate_slice_id(),
            order_id: order.id.clone(),
            instrument: order.instrument.clone(),
            side: order.side,
            quantity: *quantity,
            sequence_number: (i + 1) as i32,
            scheduled_at: order.created_at,
            order_type: *order_type,
            limit_price: *limit_price,
            product_type: "CNC".to_string(),
            validity: "DAY".to_string(),
            request_id: generate_request_id(),
        })
        .collect();

    let mut tx = db.pool().begin().await.unwrap();
    SliceStore::insert_batch(&mut tx, &slices).await.unwrap();
    tx.commit().await.unwrap();

    slices.into_iter().map(|s| s.id).collect()
}

#[tokio::test]
#[ignore] // Requires PostgreSQL running
async fn test_happy_path_market_slice() {
    let db = test_db().await;
    let orders = OrderStore::new(db.pool().clone());
    let slices = SliceStore::new(db.pool().clone());
    let executions = ExecutionStore::new(db.pool().clone());
    let events = BrokerEventStore::new(db.pool().clone());
    let ctx = RequestContext::for_worker("e2e");

    let order = orders.create(&new_order(1), &ctx).await.unwrap();
    let slice_ids = seed_slices(&db, &order, &[(100, OrderType::Market, None)]).await;

    let broker = Arc::new(MockBroker::new(MockScenario::Success));
    let worker = ExecutionWorker::new(&db, broker, execution_config(), 0);

    let claimed = executions
        .claim_due_slices(10, worker.executor_id(), 5, &ctx)
        .await
        .unwrap();
    let target = claimed
        .iter()
        .find(|c| c.slice.id == slice_ids[0])
        .expect("slice claimed");

    worker.process_slice(target).await;

    let slice = slices.get_by_id(&slice_ids[0]).await.unwrap().unwrap();
    assert_eq!(slice.status, SliceStatus::Completed);
    assert_eq!(slice.filled_quantity, 100);
    assert!(slice.average_price.is_some());

    let execution = executions
        .get_by_slice_id(&slice_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.execution_status, ExecutionStatus::Completed);
    assert_eq!(execution.execution_result, Some(ExecutionResult::Success));
    assert!(execution.completed_at.is_some());

    // exactly one PLACE_ORDER event, gap-free sequence
    let recorded = events.list_by_execution(&execution.id).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].event_type, BrokerEventType::PlaceOrder);
    assert_eq!(recorded[0].event_sequence, 1);
    assert!(recorded[0].is_success);
}

#[tokio::test]
#[ignore]
async fn test_splitting_then_execution_invariants() {
    let db = test_db().await;
    let orders = OrderStore::new(db.pool().clone());
    let slices = SliceStore::new(db.pool().clone());
    let ctx = RequestContext::for_worker("e2e");

    let order = orders.create(&new_order(5), &ctx).await.unwrap();

    let splitter = SplittingWorker::new(
        &db,
        SplittingWorkerConfig {
            poll_interval_seconds: 1,
            batch_size: 10,
        },
    );
    let claimed = orders.claim_pending_for_split(10, &ctx).await.unwrap();
    let target = claimed.iter().find(|o| o.id == order.id).expect("claimed");
    assert!(splitter.process_order(target).await);

    let refreshed = orders.get_by_id(&order.id).await.unwrap().unwrap();
    assert_eq!(refreshed.queue_status, QueueStatus::Completed);

    // Universal invariants: full slice set, quantity conservation, window.
    let created = slices.list_by_order(&order.id).await.unwrap();
    assert_eq!(created.len(), refreshed.num_splits as usize);
    assert_eq!(
        created.iter().map(|s| s.quantity).sum::<i32>(),
        refreshed.total_quantity
    );
    let window_end =
        refreshed.created_at + chrono::Duration::minutes(refreshed.duration_minutes as i64);
    for s in &created {
        assert!(s.scheduled_at >= refreshed.created_at && s.scheduled_at <= window_end);
    }
}

#[tokio::test]
#[ignore]
async fn test_partial_fill_limit_slice() {
    let db = test_db().await;
    let orders = OrderStore::new(db.pool().clone());
    let slices = SliceStore::new(db.pool().clone());
    let executions = ExecutionStore::new(db.pool().clone());
    let ctx = RequestContext::for_worker("e2e");

    let order = orders.create(&new_order(1), &ctx).await.unwrap();
    let limit = Decimal::new(12_400_000, 4); // 1240.0000
    let slice_ids = seed_slices(&db, &order, &[(100, OrderType::Limit, Some(limit))]).await;

    let broker = Arc::new(MockBroker::new(MockScenario::PartialFill));
    let worker = ExecutionWorker::new(&db, broker, execution_config(), 0);

    let claimed = executions
        .claim_due_slices(10, worker.executor_id(), 5, &ctx)
        .await
        .unwrap();
    let target = claimed
        .iter()
        .find(|c| c.slice.id == slice_ids[0])
        .expect("slice claimed");
    worker.process_slice(target).await;

    let slice = slices.get_by_id(&slice_ids[0]).await.unwrap().unwrap();
    assert_eq!(slice.status, SliceStatus::Completed);
    assert_eq!(slice.filled_quantity, 50);
    assert_eq!(slice.average_price, Some(limit));

    let execution = executions
        .get_by_slice_id(&slice_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        execution.execution_result,
        Some(ExecutionResult::PartialSuccess)
    );
}

#[tokio::test]
#[ignore]
async fn test_broker_rejection_no_retry() {
    let db = test_db().await;
    let orders = OrderStore::new(db.pool().clone());
    let slices = SliceStore::new(db.pool().clone());
    let executions = ExecutionStore::new(db.pool().clone());
    let events = BrokerEventStore::new(db.pool().clone());
    let ctx = RequestContext::for_worker("e2e");

    let order = orders.create(&new_order(1), &ctx).await.unwrap();
    let slice_ids = seed_slices(&db, &order, &[(100, OrderType::Market, None)]).await;

    let broker = Arc::new(MockBroker::new(MockScenario::Rejection));
    let worker = ExecutionWorker::new(&db, broker, execution_config(), 0);

    let claimed = executions
        .claim_due_slices(10, worker.executor_id(), 5, &ctx)
        .await
        .unwrap();
    let target = claimed
        .iter()
        .find(|c| c.slice.id == slice_ids[0])
        .expect("slice claimed");
    worker.process_slice(target).await;

    let execution = executions
        .get_by_slice_id(&slice_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.execution_status, ExecutionStatus::Completed);
    assert_eq!(
        execution.execution_result,
        Some(ExecutionResult::BrokerRejected)
    );
    assert_eq!(execution.error_code.as_deref(), Some("INSUFFICIENT_FUNDS"));
    assert_eq!(execution.placement_attempts, 1);

    let slice = slices.get_by_id(&slice_ids[0]).await.unwrap().unwrap();
    assert_eq!(slice.status, SliceStatus::Completed);
    assert_eq!(slice.filled_quantity, 0);

    // one failed PLACE_ORDER event, no polls, no retries
    let recorded = events.list_by_execution(&execution.id).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(!recorded[0].is_success);
    assert_eq!(
        recorded[0].error_code.as_deref(),
        Some("INSUFFICIENT_FUNDS")
    );
}

#[tokio::test]
#[ignore]
async fn test_network_retry_then_success() {
    let db = test_db().await;
    let orders = OrderStore::new(db.pool().clone());
    let executions = ExecutionStore::new(db.pool().clone());
    let events = BrokerEventStore::new(db.pool().clone());
    let ctx = RequestContext::for_worker("e2e");

    let order = orders.create(&new_order(1), &ctx).await.unwrap();
    let slice_ids = seed_slices(&db, &order, &[(100, OrderType::Market, None)]).await;

    let broker = Arc::new(MockBroker::new(MockScenario::NetworkError));
    let worker = ExecutionWorker::new(&db, broker, execution_config(), 0);

    let claimed = executions
        .claim_due_slices(10, worker.executor_id(), 5, &ctx)
        .await
        .unwrap();
    let target = claimed
        .iter()
        .find(|c| c.slice.id == slice_ids[0])
        .expect("slice claimed");
    worker.process_slice(target).await;

    let execution = executions
        .get_by_slice_id(&slice_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.execution_result, Some(ExecutionResult::Success));
    assert_eq!(execution.placement_attempts, 3);

    // two failed attempts then one success, sequences gap-free
    let recorded = events.list_by_execution(&execution.id).await.unwrap();
    let placements: Vec<_> = recorded
        .iter()
        .filter(|e| e.event_type == BrokerEventType::PlaceOrder)
        .collect();
    assert_eq!(placements.len(), 3);
    assert!(!placements[0].is_success);
    assert!(!placements[1].is_success);
    assert!(placements[2].is_success);
    for (i, event) in recorded.iter().enumerate() {
        assert_eq!(event.event_sequence as usize, i + 1);
    }
}

#[tokio::test]
#[ignore]
async fn test_cancellation_mid_flight() {
    let db = test_db().await;
    let orders = OrderStore::new(db.pool().clone());
    let slices = SliceStore::new(db.pool().clone());
    let executions = ExecutionStore::new(db.pool().clone());
    let events = BrokerEventStore::new(db.pool().clone());
    let ctx = RequestContext::for_worker("e2e");

    let order = orders.create(&new_order(3), &ctx).await.unwrap();
    // slice 3 is scheduled at the window end so only slices 1-2 are due now
    let slice_ids = seed_slices(
        &db,
        &order,
        &[(30, OrderType::Market, None), (30, OrderType::Market, None)],
    )
    .await;

    let far_slice = NewSlice {
        id: generate_slice_id(),
        order_id: order.id.clone(),
        instrument: order.instrument.clone(),
        side: order.side,
        quantity: 40,
        sequence_number: 3,
        scheduled_at: order.created_at + chrono::Duration::minutes(60),
        order_type: OrderType::Market,
        limit_price: None,
        product_type: "CNC".to_string(),
        validity: "DAY".to_string(),
        request_id: generate_request_id(),
    };
    let mut tx = db.pool().begin().await.unwrap();
    SliceStore::insert_batch(&mut tx, &[far_slice.clone()])
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let broker: Arc<MockBroker> = Arc::new(MockBroker::new(MockScenario::Timeout));

    // slice 1: completed before the cancel arrives
    sqlx::query("UPDATE order_slices SET status = 'COMPLETED', filled_quantity = quantity WHERE id = $1")
        .bind(&slice_ids[0])
        .execute(db.pool())
        .await
        .unwrap();

    // slice 2: claimed and placed, broker order still open
    let claimed = executions
        .claim_due_slices(10, "cancel-test-worker", 5, &ctx)
        .await
        .unwrap();
    let mid = claimed
        .iter()
        .find(|c| c.slice.id == slice_ids[1])
        .expect("slice 2 claimed");
    let placed = broker
        .place(&PlaceOrderRequest::from_slice(&mid.slice), &ctx)
        .await
        .unwrap();
    executions
        .mark_placed(
            &mid.execution.id,
            &placed.broker_order_id,
            placed.status,
            placed.filled_quantity,
            placed.average_price,
        )
        .await
        .unwrap();

    let handler = CancellationHandler::new(&db, broker.clone());
    let outcome = handler.cancel_order(&order.id, &ctx).await.unwrap();
    assert_eq!(outcome.skipped_slices, 2);
    assert_eq!(outcome.cancelled_executions, 1);

    // slice 1 untouched
    let s1 = slices.get_by_id(&slice_ids[0]).await.unwrap().unwrap();
    assert_eq!(s1.status, SliceStatus::Completed);

    // slice 2 skipped with execution skipped and one CANCEL_REQUEST event
    let s2 = slices.get_by_id(&slice_ids[1]).await.unwrap().unwrap();
    assert_eq!(s2.status, SliceStatus::Skipped);
    let e2 = executions
        .get_by_slice_id(&slice_ids[1])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(e2.execution_status, ExecutionStatus::Skipped);
    let cancel_events: Vec<_> = events
        .list_by_execution(&e2.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == BrokerEventType::CancelRequest)
        .collect();
    assert_eq!(cancel_events.len(), 1);

    // slice 3 skipped with no broker interaction
    let s3 = slices.get_by_id(&far_slice.id).await.unwrap().unwrap();
    assert_eq!(s3.status, SliceStatus::Skipped);
    assert!(
        executions
            .get_by_slice_id(&far_slice.id)
            .await
            .unwrap()
            .is_none()
    );

    // cancelling again is a no-op: no new broker calls or transitions
    let again = handler.cancel_order(&order.id, &ctx).await.unwrap();
    assert_eq!(again.skipped_slices, 0);
    assert_eq!(again.cancelled_executions, 0);
    let cancel_events_after: Vec<_> = events
        .list_by_execution(&e2.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == BrokerEventType::CancelRequest)
        .collect();
    assert_eq!(cancel_events_after.len(), 1);
}

#[tokio::test]
#[ignore]
async fn test_timeout_monitor_recovers_expired_lease() {
    let db = test_db().await;
    let orders = OrderStore::new(db.pool().clone());
    let slices = SliceStore::new(db.pool().clone());
    let executions = ExecutionStore::new(db.pool().clone());
    let ctx = RequestContext::for_worker("e2e");

    let order = orders.create(&new_order(1), &ctx).await.unwrap();
    let slice_ids = seed_slices(&db, &order, &[(100, OrderType::Market, None)]).await;

    // claim with a zero-length lease: the worker is immediately "crashed"
    let claimed = executions
        .claim_due_slices(10, "crashed-worker", 0, &ctx)
        .await
        .unwrap();
    assert!(claimed.iter().any(|c| c.slice.id == slice_ids[0]));

    let monitor = TimeoutMonitor::new(
        &db,
        TimeoutMonitorConfig {
            check_interval_seconds: 60,
        },
        5,
    );

    let (failed_over, _) = monitor.check(&ctx).await.unwrap();
    assert!(failed_over >= 1);

    let execution = executions
        .get_by_slice_id(&slice_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.execution_status, ExecutionStatus::Completed);
    assert_eq!(
        execution.execution_result,
        Some(ExecutionResult::ExecutorTimeout)
    );
    assert_eq!(execution.error_code.as_deref(), Some("EXECUTOR_TIMEOUT"));

    let slice = slices.get_by_id(&slice_ids[0]).await.unwrap().unwrap();
    assert_eq!(slice.status, SliceStatus::Completed);

    // a second pass finds nothing left to fail over for this slice
    let before = executions.get_by_slice_id(&slice_ids[0]).await.unwrap();
    monitor.check(&ctx).await.unwrap();
    let after = executions.get_by_slice_id(&slice_ids[0]).await.unwrap();
    assert_eq!(
        before.map(|e| e.updated_at),
        after.map(|e| e.updated_at),
        "terminal execution must not be rewritten"
    );
}

#[tokio::test]
#[ignore]
async fn test_expired_lease_blocks_worker_writes() {
    let db = test_db().await;
    let orders = OrderStore::new(db.pool().clone());
    let executions = ExecutionStore::new(db.pool().clone());
    let ctx = RequestContext::for_worker("e2e");

    let order = orders.create(&new_order(1), &ctx).await.unwrap();
    let slice_ids = seed_slices(&db, &order, &[(100, OrderType::Market, None)]).await;

    let claimed = executions
        .claim_due_slices(10, "w1", 0, &ctx)
        .await
        .unwrap();
    let target = claimed
        .iter()
        .find(|c| c.slice.id == slice_ids[0])
        .expect("claimed");

    // lease already expired: ownership verification must fail for the
    // original owner and for anyone else
    assert!(
        !executions
            .verify_and_extend(&target.execution.id, "w1", 5)
            .await
            .unwrap()
    );
    assert!(
        !executions
            .verify_and_extend(&target.execution.id, "w2", 5)
            .await
            .unwrap()
    );
}

// No database required below this line.

#[test]
fn test_place_request_from_slice() {
    let slice = pulse_backend::models::OrderSlice {
        id: "os1".to_string(),
        order_id: "ord1".to_string(),
        instrument: "NSE:INFY".to_string(),
        side: Side::Sell,
        quantity: 7,
        sequence_number: 2,
        status: SliceStatus::Executing,
        scheduled_at: chrono::Utc::now(),
        order_type: OrderType::Limit,
        limit_price: Some(Decimal::new(15_000_000, 4)),
        product_type: "CNC".to_string(),
        validity: "DAY".to_string(),
        filled_quantity: 0,
        average_price: None,
        request_id: "r1".to_string(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };

    let request = PlaceOrderRequest::from_slice(&slice);
    assert_eq!(request.instrument, "NSE:INFY");
    assert_eq!(request.side, Side::Sell);
    assert_eq!(request.quantity, 7);
    assert_eq!(request.order_type, OrderType::Limit);
    assert_eq!(request.limit_price, slice.limit_price);
}
