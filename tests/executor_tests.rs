mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use backserver::identity::ServerIdentity;
use backserver::scheduler::{JobStatus, WorkItem};
use backserver::store::SharedStore;
use backserver::worker::TaskExecutor;
use test_harness::{FaultyStore, RecordingStore};
use tokio_util::sync::CancellationToken;

const STEP: Duration = Duration::from_millis(5);

/// Progress field of the item built by `seeded_item`.
const FIELD: &str = "package-1:job-1";

/// Seed the progress field the way the claim protocol does before enqueueing.
async fn seeded_item(store: &RecordingStore, cycles: u32) -> WorkItem {
    let owner = ServerIdentity::generate("test");
    let item = WorkItem::new("job-1", owner, "package-1", cycles, 0);
    store
        .inner()
        .hset(&item.owner.progress_key(), &item.progress_field(), &cycles.to_string(), None)
        .await
        .unwrap();
    item
}

#[tokio::test]
async fn test_job_runs_to_completion() {
    let store = Arc::new(RecordingStore::new());
    let executor = TaskExecutor::new(store.clone(), STEP);
    let item = seeded_item(&store, 3).await;

    let result = executor
        .execute(&item, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.job_id, "job-1");
    assert_eq!(result.package, "package-1");
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.steps_completed, 3);
    assert_eq!(result.remaining, 0);
    assert_eq!(store.writes_for(FIELD), vec!["2", "1", "0"]);
    assert!(store
        .hget(&item.owner.progress_key(), FIELD)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_cancel_after_two_of_five_steps() {
    let store = Arc::new(RecordingStore::new());
    let executor = TaskExecutor::new(store.clone(), STEP);
    let item = seeded_item(&store, 5).await;

    let token = CancellationToken::new();
    store.cancel_after_writes(FIELD, 2, token.clone());

    let result = executor.execute(&item, &token).await.unwrap();

    assert_eq!(result.status, JobStatus::Cancelled);
    assert_eq!(result.steps_completed, 2);
    assert_eq!(result.remaining, 3);
    assert_eq!(store.writes_for(FIELD), vec!["4", "3"]);
    assert!(!store.exists(&item.owner.progress_key()).await.unwrap());
}

#[tokio::test]
async fn test_cancelled_before_first_step() {
    let store = Arc::new(RecordingStore::new());
    let executor = TaskExecutor::new(store.clone(), STEP);
    let item = seeded_item(&store, 4).await;

    let token = CancellationToken::new();
    token.cancel();
    let result = executor.execute(&item, &token).await.unwrap();

    assert_eq!(result.status, JobStatus::Cancelled);
    assert_eq!(result.steps_completed, 0);
    assert_eq!(result.remaining, 4);
    assert!(store.writes_for(FIELD).is_empty());
    assert!(store
        .hget(&item.owner.progress_key(), FIELD)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_cancel_during_long_delay_is_prompt() {
    let store = Arc::new(RecordingStore::new());
    let executor = TaskExecutor::new(store.clone(), Duration::from_secs(30));
    let item = seeded_item(&store, 2).await;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), executor.execute(&item, &token))
        .await
        .expect("cancellation must interrupt the step delay")
        .unwrap();
    assert_eq!(result.status, JobStatus::Cancelled);
    assert_eq!(result.steps_completed, 0);
}

#[tokio::test]
async fn test_progress_granularity() {
    let store = Arc::new(RecordingStore::new());
    let executor = TaskExecutor::new(store.clone(), STEP).with_granularity(2);
    let item = seeded_item(&store, 5).await;

    let result = executor
        .execute(&item, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    // every second step, plus the last one
    assert_eq!(store.writes_for(FIELD), vec!["3", "1", "0"]);
}

#[tokio::test]
async fn test_zero_cycles_completes_immediately() {
    let store = Arc::new(RecordingStore::new());
    let executor = TaskExecutor::new(store.clone(), STEP);
    let item = seeded_item(&store, 0).await;

    let result = executor
        .execute(&item, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.steps_completed, 0);
    assert!(store.writes_for(FIELD).is_empty());
    assert!(!store.exists(&item.owner.progress_key()).await.unwrap());
}

#[tokio::test]
async fn test_progress_strictly_decreases() {
    let store = Arc::new(RecordingStore::new());
    let executor = TaskExecutor::new(store.clone(), Duration::from_millis(1));
    let item = seeded_item(&store, 12).await;

    executor
        .execute(&item, &CancellationToken::new())
        .await
        .unwrap();

    let values: Vec<u32> = store
        .writes_for(FIELD)
        .iter()
        .map(|v| v.parse().unwrap())
        .collect();
    assert_eq!(values.len(), 12);
    assert!(values.windows(2).all(|w| w[0] == w[1] + 1));
    assert_eq!(values.last(), Some(&0));
}

#[tokio::test]
async fn test_failed_progress_write_removes_progress() {
    let store = Arc::new(FaultyStore::new());
    let executor = TaskExecutor::new(store.clone(), STEP);
    let item = WorkItem::new("job-1", ServerIdentity::generate("test"), "package-1", 5, 0);
    store
        .inner()
        .hset(&item.owner.progress_key(), FIELD, "5", None)
        .await
        .unwrap();
    // step 1 is written, step 2 fails
    store.fail_hset(":progress", 1, 1);

    let result = executor.execute(&item, &CancellationToken::new()).await;

    assert!(result.is_err());
    assert!(result.unwrap_err().is_retryable());
    assert_eq!(
        store.hget(&item.owner.progress_key(), FIELD).await.unwrap(),
        None,
        "aborted job must not leave progress behind"
    );
}
