//! Coordinator Integration Tests
//!
//! End-to-end runs against the in-memory store: cascade handling, failure
//! isolation, cancellation and resource bounds.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use truncate_core::error::{PermanentKind, TransientKind};
use truncate_core::{
    ConfigError, Coordinator, DeletionStatus, InMemoryStore, OnDeleteAction, StorageError,
    TableSchema, TruncateConfig, TruncateError,
};

fn contention(table: &str) -> StorageError {
    StorageError::transient(TransientKind::Contention, "delete_batch", table, "transaction aborted")
}

#[tokio::test]
async fn test_cascading_child_is_measured_not_deleted() {
    let store = customers_orders_store();
    let coordinator = coordinator(&store, customers_orders_schemas(), TruncateConfig::for_testing()).unwrap();
    let events = coordinator.subscribe();

    coordinator.start(CancellationToken::new()).unwrap();
    coordinator.wait_completed().await.unwrap();
    let events = collect_events(events).await;

    let orders = statuses_of(&events, "Orders");
    assert!(orders
        .iter()
        .any(|s| matches!(s, DeletionStatus::CascadeDeleting { .. })));
    assert!(!orders.iter().any(|s| matches!(s, DeletionStatus::Deleting { .. })));
    assert!(statuses_of(&events, "Customers")
        .iter()
        .any(|s| matches!(s, DeletionStatus::Deleting { .. })));

    let customers = coordinator.snapshot("Customers").unwrap();
    let orders = coordinator.snapshot("Orders").unwrap();
    assert_eq!(customers.status, DeletionStatus::Completed);
    assert_eq!(orders.status, DeletionStatus::Completed);
    assert_eq!((customers.remained_rows, orders.remained_rows), (0, 0));
    assert_eq!((customers.total_rows, orders.total_rows), (10, 40));

    assert_eq!(store.delete_calls("Orders"), 0);
    assert_eq!(store.matching_rows("Orders"), 0);
    assert_eq!(store.matching_rows("Customers"), 0);
}

#[tokio::test]
async fn test_owner_completes_after_cascaded_child() {
    let store = customers_orders_store();
    let coordinator = coordinator(&store, customers_orders_schemas(), TruncateConfig::for_testing()).unwrap();
    let events = coordinator.subscribe();

    coordinator.start(CancellationToken::new()).unwrap();
    coordinator.wait_completed().await.unwrap();
    let events = collect_events(events).await;

    let completed_at = |table: &str| {
        events.iter().position(|e| {
            matches!(e, truncate_core::DeletionEvent::StatusChanged { table: t, to: DeletionStatus::Completed, .. } if t == table)
        })
    };
    assert!(completed_at("Orders").unwrap() < completed_at("Customers").unwrap());
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_delete() {
    let schemas = vec![
        TableSchema::root("Parent"),
        TableSchema::interleaved("Child", "Parent", OnDeleteAction::NoAction)
            .with_reference("Parent", OnDeleteAction::Cascade),
    ];
    let store = Arc::new(InMemoryStore::new(schemas.clone(), vec![]));
    store.insert_row("Parent", None, true);

    let err = coordinator(&store, schemas, TruncateConfig::for_testing()).unwrap_err();

    assert!(matches!(err, TruncateError::Cycle { .. }));
    assert!(store.delete_log().is_empty());
}

#[tokio::test]
async fn test_unsafe_filters_are_rejected() {
    let store = customers_orders_store();
    for filter in ["", "   ", "()", "TRUE", "1=1", "Status = 'x' OR 1 = 1"] {
        let err = Coordinator::construct(
            customers_orders_schemas(),
            vec![],
            filter,
            &[],
            &[],
            store.clone(),
            TruncateConfig::for_testing(),
        )
        .unwrap_err();
        assert!(
            matches!(
                err,
                TruncateError::Config(ConfigError::EmptyFilter | ConfigError::UnboundedFilter { .. })
            ),
            "filter {filter:?} was accepted: {err:?}"
        );
    }
    assert!(store.delete_log().is_empty());
}

#[tokio::test]
async fn test_failure_is_isolated_to_dependents() {
    // Z depends on X through interleaving; Y is unrelated
    let schemas = vec![
        TableSchema::root("Z"),
        TableSchema::interleaved("X", "Z", OnDeleteAction::NoAction),
        TableSchema::root("Y"),
    ];
    let store = Arc::new(InMemoryStore::new(schemas.clone(), vec![]));
    let z = store.insert_row("Z", None, true);
    store.insert_rows("X", 3, Some(z), true);
    store.insert_rows("Y", 5, None, true);
    store.fail_deletes("X", contention("X"));

    let coordinator = coordinator(&store, schemas, TruncateConfig::for_testing()).unwrap();
    coordinator.start(CancellationToken::new()).unwrap();
    let err = coordinator.wait_completed().await.unwrap_err();

    assert!(matches!(
        &err,
        TruncateError::RetryExhausted { table, attempts: 3, .. } if table == "X"
    ));
    assert_eq!(coordinator.snapshot("Y").unwrap().status, DeletionStatus::Completed);
    assert_eq!(coordinator.snapshot("Z").unwrap().status, DeletionStatus::Waiting);
    assert_eq!(store.delete_calls("Z"), 0);

    let report = coordinator.report();
    assert_eq!(report.failed, vec!["X".to_string()]);
    assert_eq!(report.blocked, vec!["Z".to_string()]);
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_wait_completed_returns_the_first_failure() {
    let schemas = vec![TableSchema::root("A")];
    let store = Arc::new(InMemoryStore::new(schemas.clone(), vec![]));
    store.insert_rows("A", 3, None, true);
    store.fail_deletes(
        "A",
        StorageError::permanent(PermanentKind::PermissionDenied, "delete_batch", "A", "denied"),
    );

    let coordinator = coordinator(&store, schemas, TruncateConfig::for_testing()).unwrap();
    coordinator.start(CancellationToken::new()).unwrap();

    let first = coordinator.wait_completed().await.unwrap_err();
    let second = coordinator.wait_completed().await.unwrap_err();
    assert_eq!(first, second);
    assert_eq!(first.table(), Some("A"));
    assert_eq!(store.delete_calls("A"), 1);
}

#[tokio::test]
async fn test_transient_errors_recover() {
    let store = customers_orders_store();
    store.inject_delete_faults("Customers", [contention("Customers"), contention("Customers")]);

    let coordinator = coordinator(&store, customers_orders_schemas(), TruncateConfig::for_testing()).unwrap();
    coordinator.start(CancellationToken::new()).unwrap();
    coordinator.wait_completed().await.unwrap();

    assert!(coordinator.report().is_success());
    assert_eq!(store.matching_rows("Customers"), 0);
}

#[tokio::test]
async fn test_rerun_after_success_deletes_nothing() {
    let store = customers_orders_store();
    let first = coordinator(&store, customers_orders_schemas(), TruncateConfig::for_testing()).unwrap();
    first.start(CancellationToken::new()).unwrap();
    first.wait_completed().await.unwrap();
    let calls = store.delete_log().len();

    let second = coordinator(&store, customers_orders_schemas(), TruncateConfig::for_testing()).unwrap();
    second.start(CancellationToken::new()).unwrap();
    second.wait_completed().await.unwrap();

    assert_eq!(store.delete_log().len(), calls);
    assert_eq!(second.report().total_rows(), 0);
    assert!(second.report().is_success());
}

#[tokio::test]
async fn test_cancellation_stops_the_run() {
    let schemas = vec![TableSchema::root("Events")];
    let store = Arc::new(
        InMemoryStore::new(schemas.clone(), vec![]).with_latency(Duration::from_millis(20)),
    );
    store.insert_rows("Events", 100, None, true);

    let run = coordinator(&store, schemas.clone(), TruncateConfig::for_testing()).unwrap();
    let cancel = CancellationToken::new();
    run.start(cancel.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let err = run.wait_completed().await.unwrap_err();
    assert_eq!(err, TruncateError::Cancelled);
    assert!(store.matching_rows("Events") > 0);
    assert!(!run.snapshot("Events").unwrap().status.is_terminal());

    // Committed rows stay deleted and a rerun finishes the job
    let rerun = coordinator(&store, schemas, TruncateConfig::for_testing()).unwrap();
    rerun.start(CancellationToken::new()).unwrap();
    rerun.wait_completed().await.unwrap();
    assert_eq!(store.matching_rows("Events"), 0);
}

#[tokio::test]
async fn test_in_flight_batches_are_bounded() {
    let schemas: Vec<TableSchema> = (0..12).map(|i| TableSchema::root(format!("T{i}"))).collect();
    let store = Arc::new(
        InMemoryStore::new(schemas.clone(), vec![]).with_latency(Duration::from_millis(2)),
    );
    for schema in &schemas {
        store.insert_rows(&schema.name, 20, None, true);
    }
    let config = TruncateConfig {
        max_in_flight_batches: 2,
        ..TruncateConfig::for_testing()
    };

    let coordinator = coordinator(&store, schemas, config).unwrap();
    coordinator.start(CancellationToken::new()).unwrap();
    coordinator.wait_completed().await.unwrap();

    assert!(store.peak_concurrent_deletes() <= 2);
    assert!(store.peak_concurrent_deletes() >= 1);
    assert_eq!(coordinator.report().deleted_rows(), 240);
}

#[tokio::test]
async fn test_cascade_through_reference() {
    let schemas = vec![
        TableSchema::root("Customers").with_reference("Invoices", OnDeleteAction::Cascade),
        TableSchema::root("Invoices"),
    ];
    let store = Arc::new(InMemoryStore::new(schemas.clone(), vec![]));
    for _ in 0..3 {
        let customer = store.insert_row("Customers", None, true);
        store.insert_row_with_references("Invoices", None, &[("Customers", customer)], true);
    }

    let coordinator = coordinator(&store, schemas, TruncateConfig::for_testing()).unwrap();
    coordinator.start(CancellationToken::new()).unwrap();
    coordinator.wait_completed().await.unwrap();

    assert_eq!(store.delete_calls("Invoices"), 0);
    assert_eq!(store.matching_rows("Invoices"), 0);
    assert_eq!(coordinator.snapshot("Invoices").unwrap().total_rows, 3);
}

#[tokio::test]
async fn test_cascade_residue_fails_the_child() {
    // Matching orders whose customers do not match are never reached by the cascade
    let store = Arc::new(InMemoryStore::new(customers_orders_schemas(), vec![]));
    let kept = store.insert_row("Customers", None, false);
    store.insert_rows("Orders", 2, Some(kept), true);

    let coordinator = coordinator(&store, customers_orders_schemas(), TruncateConfig::for_testing()).unwrap();
    coordinator.start(CancellationToken::new()).unwrap();
    let err = coordinator.wait_completed().await.unwrap_err();

    assert!(matches!(
        err,
        TruncateError::CascadeIncomplete { ref table, ref owner, remaining: 2 }
            if table == "Orders" && owner == "Customers"
    ));
    assert_eq!(store.delete_calls("Orders"), 0);
    assert_eq!(coordinator.report().failed, vec!["Orders".to_string()]);
}

#[tokio::test]
async fn test_table_cascaded_by_two_owners_waits_for_both() {
    // C is emptied partly by P1's cascade and partly by P2's, and P2 can only
    // start once its NO ACTION child D is gone
    let schemas = vec![
        TableSchema::root("P1"),
        TableSchema::interleaved("C", "P1", OnDeleteAction::Cascade),
        TableSchema::root("P2").with_reference("C", OnDeleteAction::Cascade),
        TableSchema::interleaved("D", "P2", OnDeleteAction::NoAction),
    ];
    let store = Arc::new(
        InMemoryStore::new(schemas.clone(), vec![]).with_latency(Duration::from_millis(3)),
    );
    let purged = store.insert_row("P1", None, true);
    store.insert_rows("C", 2, Some(purged), true);
    let kept = store.insert_row("P1", None, false);
    let p2 = store.insert_row("P2", None, true);
    store.insert_row_with_references("C", Some(kept), &[("P2", p2)], true);
    store.insert_rows("D", 60, Some(p2), true);

    let coordinator = coordinator(&store, schemas, TruncateConfig::for_testing()).unwrap();
    coordinator.start(CancellationToken::new()).unwrap();
    coordinator.wait_completed().await.unwrap();

    assert_eq!(store.matching_rows("C"), 0);
    assert_eq!(store.total_rows("P1"), 1);
    assert_eq!(store.delete_calls("C"), 0);
    let report = coordinator.report();
    assert!(report.is_success(), "{report:?}");
    assert_eq!(coordinator.snapshot("C").unwrap().total_rows, 3);
}

#[tokio::test]
async fn test_blocked_owner_blocks_its_cascaded_tables() {
    let schemas = vec![
        TableSchema::root("P"),
        TableSchema::interleaved("C", "P", OnDeleteAction::Cascade),
        TableSchema::interleaved("D", "P", OnDeleteAction::NoAction),
    ];
    let store = Arc::new(InMemoryStore::new(schemas.clone(), vec![]));
    let p = store.insert_row("P", None, true);
    store.insert_rows("C", 2, Some(p), true);
    store.insert_rows("D", 2, Some(p), true);
    store.fail_deletes(
        "D",
        StorageError::permanent(PermanentKind::PermissionDenied, "delete_batch", "D", "denied"),
    );

    let coordinator = coordinator(&store, schemas, TruncateConfig::for_testing()).unwrap();
    coordinator.start(CancellationToken::new()).unwrap();
    let err = coordinator.wait_completed().await.unwrap_err();

    assert_eq!(err.table(), Some("D"));
    let report = coordinator.report();
    assert_eq!(report.failed, vec!["D".to_string()]);
    assert_eq!(report.blocked, vec!["P".to_string(), "C".to_string()]);
    assert_eq!(coordinator.snapshot("C").unwrap().status, DeletionStatus::Waiting);
    assert_eq!(store.matching_rows("C"), 2);
}

#[tokio::test]
async fn test_exclusion_wins_over_inclusion() {
    let schemas = vec![TableSchema::root("Keep"), TableSchema::root("Purge")];
    let store = Arc::new(InMemoryStore::new(schemas.clone(), vec![]));
    store.insert_rows("Keep", 2, None, true);
    store.insert_rows("Purge", 2, None, true);

    let coordinator = Coordinator::construct(
        schemas,
        vec![],
        FILTER,
        &["Keep".to_string(), "Purge".to_string()],
        &["Keep".to_string()],
        store.clone(),
        TruncateConfig::for_testing(),
    )
    .unwrap();
    coordinator.start(CancellationToken::new()).unwrap();
    coordinator.wait_completed().await.unwrap();

    assert!(coordinator.snapshot("Keep").is_none());
    assert_eq!(store.matching_rows("Keep"), 2);
    assert_eq!(store.matching_rows("Purge"), 0);
}
