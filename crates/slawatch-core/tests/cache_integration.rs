//! Status reads through the cache against the store they front.

mod common;

use common::{at, complete, finished_run, node, start};
use slawatch_core::clock::Clock;
use slawatch_core::model::{CalculatorKey, CalculatorStatusResponse, Frequency, RunStatus};
use slawatch_core::store::RunStore;

fn calculator(i: usize) -> String {
    format!("calc-{i:02}")
}

#[tokio::test]
async fn batch_status_queries_store_once_for_all_misses() {
    let node = node();
    let services = &node.services;
    node.clock.set(at(12, 0));
    let ids: Vec<String> = (0..50).map(calculator).collect();
    for (i, id) in ids.iter().enumerate() {
        services
            .store
            .upsert(&finished_run(&format!("r{i}"), id))
            .await
            .unwrap();
    }
    for id in &ids[..10] {
        services
            .query
            .status(&CalculatorKey::new(id.as_str(), "t1"), Frequency::Daily)
            .await
            .unwrap();
    }
    let before = services.store.stats();

    let responses = services
        .query
        .batch_status(&ids, "t1", Frequency::Daily)
        .await
        .unwrap();

    let after = services.store.stats();
    assert_eq!(after.batch_queries - before.batch_queries, 1);
    assert_eq!(after.last_batch_size, 40);
    assert_eq!(after.recent_queries, before.recent_queries);
    let returned: Vec<&str> = responses.iter().map(|r| r.calculator_id.as_str()).collect();
    assert_eq!(returned, ids.iter().map(String::as_str).collect::<Vec<_>>());

    // Everything is cached now; a repeat never reaches the store.
    services
        .query
        .batch_status(&ids, "t1", Frequency::Daily)
        .await
        .unwrap();
    assert_eq!(services.store.stats().batch_queries, after.batch_queries);
}

#[tokio::test]
async fn reads_after_a_change_match_the_store() {
    let node = node();
    let services = &node.services;
    let key = CalculatorKey::new("c1", "t1");
    services.ingestion.start_run(start("r1", "c1")).await.unwrap();

    let running = services.query.status(&key, Frequency::Daily).await.unwrap();
    assert_eq!(running.current.status, RunStatus::Running);

    node.clock.set(at(5, 0));
    services.ingestion.complete_run(complete("r1", at(5, 0))).await.unwrap();

    let cached = services.query.status(&key, Frequency::Daily).await.unwrap();
    let runs = services
        .store
        .query_recent(&key, Frequency::Daily, node.clock.today(), 6)
        .await
        .unwrap();
    let direct = CalculatorStatusResponse::from_runs(&runs, at(5, 0)).unwrap();
    assert_eq!(cached, direct);
    assert_eq!(cached.current.status, RunStatus::Success);
    assert_eq!(cached.current.duration_formatted.as_deref(), Some("1h 0m"));
}

#[tokio::test]
async fn cache_outage_falls_back_to_the_store() {
    let node = node();
    let services = &node.services;
    let key = CalculatorKey::new("c1", "t1");
    services.ingestion.start_run(start("r1", "c1")).await.unwrap();

    node.backend.set_unavailable(true);
    let status = services.query.status(&key, Frequency::Daily).await.unwrap();
    assert_eq!(status.current.run_id, "r1");
    assert!(services.query.is_running(&key, Frequency::Daily).await.unwrap());
    assert_eq!(services.query.running_count().await.unwrap(), 1);

    node.clock.set(at(5, 0));
    let done = services.ingestion.complete_run(complete("r1", at(5, 0))).await.unwrap();
    assert_eq!(done.status, RunStatus::Success);

    let history = services.query.run_history(&key, Frequency::Daily, 5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RunStatus::Success);
}
