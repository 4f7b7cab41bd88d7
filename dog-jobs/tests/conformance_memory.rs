use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use serde_json::json;

use dog_jobs::{
    JobOptions, JobState, NewJob, QueueError, Transition,
    backend::{QueueBackend, memory::MemoryBackend},
};

const QUEUE: &str = "updateSubscriptions";

/// Test factory functions
fn types(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn create_test_job(job_type: &str) -> NewJob {
    NewJob::new(job_type, json!({ "username": "ann" }), JobOptions::new().with_attempts(4))
}

/// A1. Enqueue Picks The Initial Bucket
#[tokio::test]
async fn test_enqueue_picks_initial_bucket() {
    let backend = MemoryBackend::new();

    let ready = backend.enqueue(QUEUE, create_test_job("image")).await.unwrap();
    let delayed = backend
        .enqueue(QUEUE, NewJob::new("image", json!({}), JobOptions::new().with_delay_millis(2000)))
        .await
        .unwrap();

    assert_eq!(ready.state, JobState::Waiting);
    assert_eq!(ready.attempts_made, 0);
    assert_eq!(delayed.state, JobState::Delayed);
    assert!(delayed.ready_at >= delayed.created_at + chrono::Duration::milliseconds(2000));

    let counts = backend.counts(QUEUE).await.unwrap();
    assert_eq!((counts.waiting, counts.delayed), (1, 1));
}

/// A2. Concurrent Claims: Exactly One Wins
#[tokio::test]
async fn test_concurrent_claims_exactly_one_wins() {
    let backend = Arc::new(MemoryBackend::new());
    let record = backend.enqueue(QUEUE, create_test_job("image")).await.unwrap();

    // Arrange: every contender holds the same stale snapshot
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let backend = backend.clone();
            let record = record.clone();
            tokio::spawn(async move {
                backend
                    .commit_transition(QUEUE, &record.id, Transition::claim(&record))
                    .await
            })
        })
        .collect();

    let mut won = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(QueueError::Conflict { actual, .. }) => {
                assert_eq!(actual, JobState::Active);
                conflicts += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(won, 1);
    assert_eq!(conflicts, 15);
    let stored = backend.get(QUEUE, &record.id).await.unwrap();
    assert_eq!(stored.attempts_made, 1);
}

/// A3. Retry Returns The Job To Delayed Until Its Ready Time
#[tokio::test]
async fn test_retry_returns_job_to_delayed() {
    let backend = MemoryBackend::new();
    let image = types(&["image"]);
    let record = backend.enqueue(QUEUE, create_test_job("image")).await.unwrap();
    let active = backend
        .commit_transition(QUEUE, &record.id, Transition::claim(&record))
        .await
        .unwrap();

    let ready_at = Utc::now() + chrono::Duration::milliseconds(100);
    let delayed = backend
        .commit_transition(QUEUE, &active.id, Transition::retry("boom", ready_at))
        .await
        .unwrap();

    assert_eq!(delayed.state, JobState::Delayed);
    assert_eq!(delayed.last_error.as_deref(), Some("boom"));
    assert!(backend.fetch_next(QUEUE, &image).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(120)).await;
    let next = backend.fetch_next(QUEUE, &image).await.unwrap().unwrap();
    assert_eq!(next.id, record.id);
    assert_eq!(next.attempts_made, 1);
}

/// A4. Attempts Never Exceed The Maximum
#[tokio::test]
async fn test_attempts_never_exceed_max() {
    let backend = MemoryBackend::new();
    let job = NewJob::new("image", json!({}), JobOptions::new().with_attempts(2));
    let mut record = backend.enqueue(QUEUE, job).await.unwrap();

    for _ in 0..2 {
        let active = backend
            .commit_transition(QUEUE, &record.id, Transition::claim(&record))
            .await
            .unwrap();
        record = backend
            .commit_transition(QUEUE, &active.id, Transition::retry("boom", Utc::now()))
            .await
            .unwrap();
    }

    let err = backend
        .commit_transition(QUEUE, &record.id, Transition::claim(&record))
        .await
        .unwrap_err();
    assert!(!err.is_conflict());
    assert_eq!(backend.get(QUEUE, &record.id).await.unwrap().attempts_made, 2);
}

/// A5. Terminal Jobs Are Never Dispatchable
#[tokio::test]
async fn test_terminal_jobs_are_not_dispatchable() {
    let backend = MemoryBackend::new();
    let image = types(&["image"]);

    let first = backend.enqueue(QUEUE, create_test_job("image")).await.unwrap();
    let second = backend.enqueue(QUEUE, create_test_job("image")).await.unwrap();

    let active = backend
        .commit_transition(QUEUE, &first.id, Transition::claim(&first))
        .await
        .unwrap();
    backend
        .commit_transition(QUEUE, &active.id, Transition::complete(json!("done")))
        .await
        .unwrap();

    let active = backend
        .commit_transition(QUEUE, &second.id, Transition::claim(&second))
        .await
        .unwrap();
    backend
        .commit_transition(QUEUE, &active.id, Transition::fail("nope"))
        .await
        .unwrap();

    assert!(backend.fetch_next(QUEUE, &image).await.unwrap().is_none());

    let completed = backend.list_by_state(QUEUE, JobState::Completed).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].result, Some(json!("done")));

    let failed = backend.list_by_state(QUEUE, JobState::Failed).await.unwrap();
    assert_eq!(failed[0].last_error.as_deref(), Some("nope"));
    assert!(failed[0].finished_at.is_some());
}

/// A6. Waiting Jobs Come Out In Arrival Order
#[tokio::test]
async fn test_waiting_jobs_in_arrival_order() {
    let backend = MemoryBackend::new();
    let image = types(&["image"]);

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(backend.enqueue(QUEUE, create_test_job("image")).await.unwrap().id);
    }

    let mut seen = Vec::new();
    while let Some(next) = backend.fetch_next(QUEUE, &image).await.unwrap() {
        backend
            .commit_transition(QUEUE, &next.id, Transition::claim(&next))
            .await
            .unwrap();
        seen.push(next.id);
    }

    assert_eq!(seen, ids);
}

/// A7. Fetch Only Returns Requested Job Types
#[tokio::test]
async fn test_fetch_only_returns_requested_types() {
    let backend = MemoryBackend::new();
    backend.enqueue(QUEUE, create_test_job("video")).await.unwrap();
    let image = backend.enqueue(QUEUE, create_test_job("image")).await.unwrap();

    let next = backend.fetch_next(QUEUE, &types(&["image"])).await.unwrap().unwrap();
    assert_eq!(next.id, image.id);

    let either = backend.fetch_next(QUEUE, &types(&["image", "video"])).await.unwrap().unwrap();
    assert_eq!(either.job_type, "video");
}

/// A8. Store Outage Is Reported As Unavailable, Not As A Job Failure
#[tokio::test]
async fn test_store_outage_is_unavailable() {
    let backend = MemoryBackend::new();
    let record = backend.enqueue(QUEUE, create_test_job("image")).await.unwrap();

    backend.set_available(false);
    let err = backend
        .commit_transition(QUEUE, &record.id, Transition::claim(&record))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::StoreUnavailable(_)));

    backend.set_available(true);
    let stored = backend.get(QUEUE, &record.id).await.unwrap();
    assert_eq!(stored.state, JobState::Waiting);
    assert_eq!(stored.attempts_made, 0);
}

/// A9. A Claim From A Stale Snapshot Conflicts
#[tokio::test]
async fn test_stale_snapshot_claim_conflicts() {
    let backend = MemoryBackend::new();
    let image = types(&["image"]);
    let record = backend.enqueue(QUEUE, create_test_job("image")).await.unwrap();

    let active = backend
        .commit_transition(QUEUE, &record.id, Transition::claim(&record))
        .await
        .unwrap();
    backend
        .commit_transition(QUEUE, &active.id, Transition::retry("boom", Utc::now()))
        .await
        .unwrap();

    // Arrange: one dispatcher reads the job, another claims and retries it
    let snapshot = backend.fetch_next(QUEUE, &image).await.unwrap().unwrap();
    let active = backend
        .commit_transition(QUEUE, &snapshot.id, Transition::claim(&snapshot))
        .await
        .unwrap();
    let later = Utc::now() + chrono::Duration::seconds(60);
    backend
        .commit_transition(QUEUE, &active.id, Transition::retry("boom", later))
        .await
        .unwrap();

    let err = backend
        .commit_transition(QUEUE, &snapshot.id, Transition::claim(&snapshot))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let stored = backend.get(QUEUE, &record.id).await.unwrap();
    assert_eq!(stored.state, JobState::Delayed);
    assert_eq!(stored.attempts_made, 2);
    assert_eq!(stored.ready_at, later);
}

/// A10. A Delayed Job Cannot Be Claimed Before Its Ready Time
#[tokio::test]
async fn test_delayed_claim_before_ready_time_conflicts() {
    let backend = MemoryBackend::new();
    let job = NewJob::new("image", json!({}), JobOptions::new().with_delay_millis(60_000));
    let record = backend.enqueue(QUEUE, job).await.unwrap();

    let err = backend
        .commit_transition(QUEUE, &record.id, Transition::claim(&record))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(backend.get(QUEUE, &record.id).await.unwrap().attempts_made, 0);
}

/// A11. A Superseded Attempt Cannot Commit Its Outcome
#[tokio::test]
async fn test_superseded_attempt_cannot_commit() {
    let backend = MemoryBackend::new();
    let record = backend.enqueue(QUEUE, create_test_job("image")).await.unwrap();

    let first = backend
        .commit_transition(QUEUE, &record.id, Transition::claim(&record))
        .await
        .unwrap();
    let retried = backend
        .commit_transition(QUEUE, &first.id, Transition::retry("stalled", Utc::now()))
        .await
        .unwrap();
    let second = backend
        .commit_transition(QUEUE, &retried.id, Transition::claim(&retried))
        .await
        .unwrap();

    let late = Transition::complete(json!("late")).expecting(first.attempts_made);
    let err = backend.commit_transition(QUEUE, &first.id, late).await.unwrap_err();
    assert!(err.is_conflict());

    let renewed = backend
        .commit_transition(QUEUE, &second.id, Transition::renew(&second))
        .await
        .unwrap();
    assert_eq!(renewed.state, JobState::Active);
    assert_eq!(renewed.attempts_made, 2);
    assert!(renewed.heartbeat_at >= second.heartbeat_at);
}
