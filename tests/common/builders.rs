//! Schema and coordinator builders shared by the integration tests.

use std::sync::Arc;
use tokio::sync::broadcast;
use truncate_core::{
    Coordinator, DeletionEvent, DeletionStatus, InMemoryStore, OnDeleteAction, Result,
    TableSchema, TruncateConfig,
};

pub const FILTER: &str = "CreatedAt < '2020-01-01'";

/// Customers with interleaved, cascading Orders
pub fn customers_orders_schemas() -> Vec<TableSchema> {
    vec![
        TableSchema::root("Customers"),
        TableSchema::interleaved("Orders", "Customers", OnDeleteAction::Cascade),
    ]
}

/// 10 matching customers with 4 matching orders each
pub fn customers_orders_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new(customers_orders_schemas(), vec![]));
    for _ in 0..10 {
        let customer = store.insert_row("Customers", None, true);
        store.insert_rows("Orders", 4, Some(customer), true);
    }
    store
}

pub fn coordinator(
    store: &Arc<InMemoryStore>,
    schemas: Vec<TableSchema>,
    config: TruncateConfig,
) -> Result<Coordinator> {
    Coordinator::construct(schemas, vec![], FILTER, &[], &[], store.clone(), config)
}

/// Drain events until the run finishes
pub async fn collect_events(mut events: broadcast::Receiver<DeletionEvent>) -> Vec<DeletionEvent> {
    let mut collected = Vec::new();
    loop {
        match events.recv().await {
            Ok(event @ DeletionEvent::RunFinished { .. }) => {
                collected.push(event);
                break;
            }
            Ok(event) => collected.push(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                panic!("test event receiver lagged by {missed} events")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    collected
}

/// Every status a table moved into, in order
pub fn statuses_of(events: &[DeletionEvent], table: &str) -> Vec<DeletionStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            DeletionEvent::StatusChanged { table: t, to, .. } if t == table => Some(*to),
            _ => None,
        })
        .collect()
}
