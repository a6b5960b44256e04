/// Work coordinator contract tests against a real PostgreSQL.
///
/// Skipped unless TEST_DATABASE_URL (or DATABASE_URL) points at a reachable
/// database. Each test uses its own table.
/// Run with: TEST_DATABASE_URL=postgres://... cargo test --test postgres_coordinator_tests
use shardlease::{
    Clock, CoordinationError, ManualClock, PostgresWorkCoordinator, SystemClock,
    WorkAcquisitionOutcome, WorkCoordinator,
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

const LEASE: Duration = Duration::from_secs(10);

async fn maybe_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()?;

    PgPoolOptions::new()
        .max_connections(8)
        .connect(&database_url)
        .await
        .ok()
}

fn unique_table(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

async fn drop_table(pool: &PgPool, table: &str) {
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
        .execute(pool)
        .await
        .expect("drop should succeed");
}

fn worker(pool: &PgPool, table: &str, worker_id: &str, clock: Arc<dyn Clock>) -> PostgresWorkCoordinator {
    PostgresWorkCoordinator::new(pool.clone(), table, worker_id, clock).expect("valid table name")
}

#[tokio::test]
async fn postgres_lease_lifecycle() {
    let Some(pool) = maybe_pool().await else {
        eprintln!(
            "Skipping postgres_lease_lifecycle: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable."
        );
        return;
    };
    let table = unique_table("lease_lifecycle");
    let clock = Arc::new(ManualClock::starting_at_millis(1_700_000_000_000));
    let w1 = worker(&pool, &table, "w1", clock.clone());
    let w2 = worker(&pool, &table, "w2", clock.clone());

    w1.setup().await.unwrap();
    w2.setup().await.unwrap();

    assert!(w1.create_unassigned_work_item("a").await.unwrap());
    assert!(!w2.create_unassigned_work_item("a").await.unwrap());

    let acquired = w1
        .acquire_next_work_item(LEASE)
        .await
        .unwrap()
        .into_acquired()
        .unwrap();
    assert_eq!(acquired.work_item_id, "a");
    assert_eq!(acquired.lease_exponent, 0);
    assert_eq!(
        w2.acquire_next_work_item(LEASE).await.unwrap(),
        WorkAcquisitionOutcome::NoAvailableWork
    );

    let err = w2.complete_work_item("a").await.unwrap_err();
    assert!(matches!(err, CoordinationError::LeaseNotHeld { .. }));

    clock.advance(LEASE + Duration::from_millis(1));
    let recovered = w2
        .acquire_next_work_item(LEASE)
        .await
        .unwrap()
        .into_acquired()
        .unwrap();
    assert_eq!(recovered.lease_exponent, 1);
    assert_eq!(
        recovered.lease_expiry.timestamp_millis(),
        clock.now_millis() + 20_000
    );

    assert!(w1.complete_work_item("a").await.is_err());
    w2.complete_work_item("a").await.unwrap();
    assert_eq!(w2.num_work_items_not_yet_complete().await.unwrap(), 0);
    assert_eq!(
        w1.create_or_update_lease_for_work_item("a", LEASE).await.unwrap(),
        WorkAcquisitionOutcome::AlreadyCompleted
    );

    drop_table(&pool, &table).await;
}

#[tokio::test]
async fn postgres_create_or_update_lease() {
    let Some(pool) = maybe_pool().await else {
        eprintln!(
            "Skipping postgres_create_or_update_lease: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable."
        );
        return;
    };
    let table = unique_table("create_or_update");
    let clock = Arc::new(ManualClock::starting_at_millis(1_700_000_000_000));
    let w1 = worker(&pool, &table, "w1", clock.clone());
    let w2 = worker(&pool, &table, "w2", clock.clone());
    w1.setup().await.unwrap();

    let first = w1
        .create_or_update_lease_for_work_item("setup", LEASE)
        .await
        .unwrap()
        .into_acquired()
        .unwrap();
    assert_eq!(first.lease_exponent, 0);
    assert_eq!(
        first.lease_expiry.timestamp_millis(),
        clock.now_millis() + 10_000
    );
    let stored = w1.get_work_item("setup").await.unwrap().unwrap();
    assert_eq!(stored.lease_holder_id.as_deref(), Some("w1"));
    assert_eq!(stored.lease_exponent, 1);

    // The holder asking again keeps its current lease.
    let again = w1
        .create_or_update_lease_for_work_item("setup", LEASE)
        .await
        .unwrap()
        .into_acquired()
        .unwrap();
    assert_eq!(again.lease_expiry, first.lease_expiry);
    assert_eq!(again.lease_exponent, 0);

    assert_eq!(
        w2.create_or_update_lease_for_work_item("setup", LEASE)
            .await
            .unwrap(),
        WorkAcquisitionOutcome::LeaseLockHeldElsewhere
    );

    clock.advance(LEASE + Duration::from_secs(1));
    let taken = w2
        .create_or_update_lease_for_work_item("setup", LEASE)
        .await
        .unwrap()
        .into_acquired()
        .unwrap();
    assert_eq!(taken.lease_exponent, 1);
    assert_eq!(
        taken.lease_expiry.timestamp_millis(),
        clock.now_millis() + 20_000
    );
    let stored = w2.get_work_item("setup").await.unwrap().unwrap();
    assert_eq!(stored.lease_holder_id.as_deref(), Some("w2"));
    assert!(matches!(
        w1.complete_work_item("setup").await.unwrap_err(),
        CoordinationError::LeaseNotHeld { .. }
    ));

    drop_table(&pool, &table).await;
}

#[tokio::test]
async fn postgres_interrupted_split_is_finished_by_next_acquirer() {
    let Some(pool) = maybe_pool().await else {
        eprintln!(
            "Skipping postgres_interrupted_split_is_finished_by_next_acquirer: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable."
        );
        return;
    };
    let table = unique_table("zombie_split");
    let clock = Arc::new(ManualClock::starting_at_millis(1_700_000_000_000));
    let w1 = worker(&pool, &table, "w1", clock.clone());
    let w2 = worker(&pool, &table, "w2", clock.clone());
    w1.setup().await.unwrap();

    w1.create_unassigned_work_item("parent").await.unwrap();
    w1.acquire_next_work_item(LEASE)
        .await
        .unwrap()
        .into_acquired()
        .unwrap();

    // Leave the parent listing successors that were never created.
    sqlx::query(&format!(
        "UPDATE {} SET successor_item_ids = ARRAY['c1', 'c2'] WHERE work_item_id = 'parent'",
        table
    ))
    .execute(&pool)
    .await
    .expect("stamping successors should succeed");

    clock.advance(LEASE + Duration::from_secs(1));
    let acquired = w2
        .acquire_next_work_item(LEASE)
        .await
        .unwrap()
        .into_acquired()
        .unwrap();
    assert!(acquired.work_item_id == "c1" || acquired.work_item_id == "c2");

    let parent = w2.get_work_item("parent").await.unwrap().unwrap();
    assert!(parent.is_completed());
    assert_eq!(
        parent.successor_item_ids,
        Some(vec!["c1".to_string(), "c2".to_string()])
    );
    assert_eq!(w2.num_work_items_not_yet_complete().await.unwrap(), 2);

    drop_table(&pool, &table).await;
}

#[tokio::test]
async fn postgres_split_is_atomic() {
    let Some(pool) = maybe_pool().await else {
        eprintln!(
            "Skipping postgres_split_is_atomic: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable."
        );
        return;
    };
    let table = unique_table("split");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let w1 = worker(&pool, &table, "w1", clock.clone());
    let w2 = worker(&pool, &table, "w2", clock.clone());
    let w3 = worker(&pool, &table, "w3", clock.clone());
    w1.setup().await.unwrap();

    w1.create_unassigned_work_item("parent").await.unwrap();
    w1.acquire_next_work_item(LEASE).await.unwrap();

    let err = w2
        .create_successor_work_items_and_mark_complete("parent", &["c1".to_string()], 0)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::LeaseNotHeld { .. }));
    assert!(w2.get_work_item("c1").await.unwrap().is_none());

    let successors = vec!["c1".to_string(), "c2".to_string()];
    w1.create_successor_work_items_and_mark_complete("parent", &successors, 2)
        .await
        .unwrap();

    let parent = w1.get_work_item("parent").await.unwrap().unwrap();
    assert!(parent.is_completed());
    assert_eq!(parent.successor_item_ids, Some(successors.clone()));
    assert_eq!(w1.get_work_item("c1").await.unwrap().unwrap().lease_exponent, 2);

    let a = w2.acquire_next_work_item(LEASE).await.unwrap().into_acquired().unwrap();
    let b = w3.acquire_next_work_item(LEASE).await.unwrap().into_acquired().unwrap();
    assert_eq!(
        HashSet::from([a.work_item_id, b.work_item_id]),
        HashSet::from(["c1".to_string(), "c2".to_string()])
    );

    drop_table(&pool, &table).await;
}

#[tokio::test]
async fn postgres_concurrent_workers_never_share_items() {
    let Some(pool) = maybe_pool().await else {
        eprintln!(
            "Skipping postgres_concurrent_workers_never_share_items: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable."
        );
        return;
    };
    let table = unique_table("concurrent");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let seeder = worker(&pool, &table, "seeder", clock.clone());
    seeder.setup().await.unwrap();

    let num_items = 40;
    for i in 0..num_items {
        seeder
            .create_unassigned_work_item(&format!("item-{}", i))
            .await
            .unwrap();
    }

    let num_workers = 4;
    let barrier = Arc::new(Barrier::new(num_workers));
    let mut handles = vec![];
    for w in 0..num_workers {
        let coordinator = worker(&pool, &table, &format!("worker-{}", w), clock.clone());
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let mut processed = vec![];
            while let Some(item) = coordinator
                .acquire_next_work_item(Duration::from_secs(60))
                .await
                .unwrap()
                .into_acquired()
            {
                coordinator.complete_work_item(&item.work_item_id).await.unwrap();
                processed.push(item.work_item_id);
            }
            processed
        }));
    }

    let mut all = vec![];
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique = all.iter().cloned().collect::<HashSet<_>>();
    assert_eq!(all.len(), unique.len());
    assert_eq!(unique.len(), num_items);
    assert!(!seeder.work_items_are_pending().await.unwrap());

    drop_table(&pool, &table).await;
}
