use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use offload::config::DatabaseConfig;
use offload::db;
use offload::error::OffloadError;
use offload::queue::{await_terminal, JobInput, JobQueue, JobState, SqlJobQueue};

/// File-backed queue so several pool connections contend for the same rows.
async fn file_queue(dir: &TempDir) -> SqlJobQueue {
    let config = DatabaseConfig {
        url: format!("sqlite://{}?mode=rwc", dir.path().join("jobs.db").display()),
        max_connections: 8,
    };
    SqlJobQueue::new(db::connect(&config).await.unwrap())
}

async fn memory_queue() -> SqlJobQueue {
    SqlJobQueue::new(db::connect_in_memory().await.unwrap())
}

#[tokio::test]
async fn test_concurrent_claims_yield_exactly_one_winner() {
    let dir = TempDir::new().unwrap();
    let queue = Arc::new(file_queue(&dir).await);
    let id = queue
        .enqueue("sentence-encode", JobInput::new(vec![json!("hello")]))
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim_one().await.unwrap() })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            winners.push(job);
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, id);
    assert_eq!(winners[0].state, JobState::Working);
    assert!(winners[0].claimed_at.is_some());
}

#[tokio::test]
async fn test_concurrent_drain_claims_every_job_once() {
    let dir = TempDir::new().unwrap();
    let queue = Arc::new(file_queue(&dir).await);

    let mut submitted = HashSet::new();
    for i in 0..20 {
        let id = queue
            .enqueue("cosine", JobInput::new(vec![json!([i]), json!([i])]))
            .await
            .unwrap();
        submitted.insert(id);
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = queue.claim_one().await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            })
        })
        .collect();

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.unwrap());
    }

    assert_eq!(claimed.len(), 20);
    let unique: HashSet<_> = claimed.into_iter().collect();
    assert_eq!(unique, submitted);
    assert_eq!(queue.counts().await.unwrap().working, 20);
}

#[tokio::test]
async fn test_jobs_are_claimed_oldest_first() {
    let queue = memory_queue().await;
    let first = queue.enqueue("a", JobInput::default()).await.unwrap();
    let second = queue.enqueue("b", JobInput::default()).await.unwrap();
    let third = queue.enqueue("c", JobInput::default()).await.unwrap();

    for expected in [first, second, third] {
        assert_eq!(queue.claim_one().await.unwrap().unwrap().id, expected);
    }
    assert!(queue.claim_one().await.unwrap().is_none());
}

#[tokio::test]
async fn test_await_terminal_sees_completion() {
    let queue = Arc::new(memory_queue().await);
    let id = queue
        .enqueue("cosine", JobInput::new(vec![json!([1.0]), json!([1.0])]))
        .await
        .unwrap();

    let worker = {
        let queue = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let job = queue.claim_one().await.unwrap().unwrap();
            queue.complete(job.id, json!(1.0)).await.unwrap();
        })
    };

    let job = await_terminal(
        queue.as_ref(),
        id,
        Duration::from_millis(10),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    worker.await.unwrap();

    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.data(), Some(&json!(1.0)));
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn test_await_terminal_times_out_on_unclaimed_job() {
    let queue = memory_queue().await;
    let id = queue.enqueue("slow", JobInput::default()).await.unwrap();

    let err = await_terminal(
        &queue,
        id,
        Duration::from_millis(10),
        Duration::from_millis(50),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OffloadError::Timeout(_)));
}

#[tokio::test]
async fn test_await_terminal_unknown_job() {
    let queue = memory_queue().await;
    let id = uuid::Uuid::new_v4();
    let err = await_terminal(&queue, id, Duration::from_millis(10), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, OffloadError::JobNotFound(missing) if missing == id));
}

#[tokio::test]
async fn test_expire_stale_fails_only_old_claims() {
    let queue = memory_queue().await;
    let stuck = queue.enqueue("a", JobInput::default()).await.unwrap();
    queue.claim_one().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let recent = queue.enqueue("b", JobInput::default()).await.unwrap();
    queue.claim_one().await.unwrap();
    let waiting = queue.enqueue("c", JobInput::default()).await.unwrap();

    assert_eq!(queue.expire_stale(Duration::from_secs(1)).await.unwrap(), 1);

    let stuck = queue.get(stuck).await.unwrap().unwrap();
    assert_eq!(stuck.state, JobState::Error);
    assert_eq!(stuck.error(), Some("claim expired after 1s"));

    assert_eq!(queue.get(recent).await.unwrap().unwrap().state, JobState::Working);
    assert_eq!(queue.get(waiting).await.unwrap().unwrap().state, JobState::New);

    // a late result from the lost worker does not resurrect the row
    assert!(!queue.complete(stuck.id, json!("late")).await.unwrap());
}

#[tokio::test]
async fn test_expire_stale_with_unrepresentable_age_keeps_claims() {
    let queue = memory_queue().await;
    let id = queue.enqueue("a", JobInput::default()).await.unwrap();
    queue.claim_one().await.unwrap();

    assert_eq!(queue.expire_stale(Duration::from_secs(u64::MAX)).await.unwrap(), 0);
    assert_eq!(queue.get(id).await.unwrap().unwrap().state, JobState::Working);
}

#[tokio::test]
async fn test_resubmit_creates_fresh_row() {
    let queue = memory_queue().await;
    let input = JobInput::new(vec![json!("text")]).with_kwarg("max_length", json!(10));
    let original = queue.enqueue("summarization", input.clone()).await.unwrap();
    queue.claim_one().await.unwrap();
    queue.fail(original, "CUDA out of memory").await.unwrap();

    let copy = queue.resubmit(original).await.unwrap();
    assert_ne!(copy, original);

    let copy = queue.get(copy).await.unwrap().unwrap();
    assert_eq!(copy.state, JobState::New);
    assert_eq!(copy.method, "summarization");
    assert_eq!(copy.input, input);
    assert!(copy.output.is_none());

    // the failed row keeps its error
    let original = queue.get(original).await.unwrap().unwrap();
    assert_eq!(original.error(), Some("CUDA out of memory"));
}

#[tokio::test]
async fn test_list_filters_by_state() {
    let queue = memory_queue().await;
    for _ in 0..3 {
        queue.enqueue("a", JobInput::default()).await.unwrap();
    }
    queue.claim_one().await.unwrap();

    assert_eq!(queue.list(None, 100).await.unwrap().len(), 3);
    assert_eq!(queue.list(Some(JobState::New), 100).await.unwrap().len(), 2);
    assert_eq!(queue.list(Some(JobState::Working), 100).await.unwrap().len(), 1);
    assert_eq!(queue.list(None, 2).await.unwrap().len(), 2);

    let counts = queue.counts().await.unwrap();
    assert_eq!((counts.new, counts.working, counts.total()), (2, 1, 3));
}
