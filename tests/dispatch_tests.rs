use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use offload::db::connect_in_memory;
use offload::error::HandlerError;
use offload::heartbeat::{HeartbeatStore, MachineStatus, SqlHeartbeatStore};
use offload::queue::{await_terminal, JobInput, JobQueue, JobState, SqlJobQueue};
use offload::worker::{DispatchLoop, HandlerRegistry, HeartbeatSender, InProcessContext};
use tokio_util::sync::CancellationToken;

struct TestWorker {
    queue: Arc<SqlJobQueue>,
    store: Arc<SqlHeartbeatStore>,
    dispatch: Arc<DispatchLoop>,
}

async fn test_worker(registry: HandlerRegistry) -> TestWorker {
    let pool = connect_in_memory().await.unwrap();
    let queue = Arc::new(SqlJobQueue::new(pool.clone()));
    let store = Arc::new(SqlHeartbeatStore::new(pool));
    let dispatch = DispatchLoop::new(
        queue.clone(),
        Arc::new(InProcessContext::new(Arc::new(registry))),
        HeartbeatSender::new(store.clone(), "gpu-test", Duration::from_millis(50)),
        Duration::from_millis(10),
    );
    TestWorker {
        queue,
        store,
        dispatch: Arc::new(dispatch),
    }
}

#[tokio::test]
async fn test_sentence_encode_reaches_done_with_vector() {
    let w = test_worker(HandlerRegistry::builtin()).await;
    let id = w
        .queue
        .enqueue("sentence-encode", JobInput::new(vec![json!("hello world")]))
        .await
        .unwrap();

    assert_eq!(w.dispatch.run_once().await.unwrap(), Some(id));

    let job = w.queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Done);
    let vector = job.data().and_then(Value::as_array).expect("vector payload");
    assert_eq!(vector.len(), 64);
    assert!(vector.iter().all(Value::is_f64));
    assert!(job.error().is_none());
}

#[tokio::test]
async fn test_unknown_method_reaches_error() {
    let w = test_worker(HandlerRegistry::builtin()).await;
    let id = w
        .queue
        .enqueue("not-a-real-method", JobInput::default())
        .await
        .unwrap();

    w.dispatch.run_once().await.unwrap();

    let job = w.queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Error);
    assert_eq!(job.error(), Some("unknown method: not-a-real-method"));
}

#[tokio::test]
async fn test_raising_handler_never_reaches_done() {
    let registry = HandlerRegistry::builtin().register("oom", |_: &JobInput| {
        Err(HandlerError::Failed("CUDA out of memory".to_string()))
    });
    let w = test_worker(registry).await;
    let id = w.queue.enqueue("oom", JobInput::default()).await.unwrap();

    w.dispatch.run_once().await.unwrap();

    let job = w.queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Error);
    assert!(!job.error().unwrap_or_default().is_empty());
    assert!(job.data().is_none());
}

#[tokio::test]
async fn test_invalid_arguments_are_job_errors() {
    let w = test_worker(HandlerRegistry::builtin()).await;
    let id = w
        .queue
        .enqueue("cosine", JobInput::new(vec![json!("not a vector")]))
        .await
        .unwrap();

    w.dispatch.run_once().await.unwrap();

    let job = w.queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Error);
    assert!(job.error().unwrap().starts_with("invalid arguments"));
}

#[tokio::test]
async fn test_running_loop_serves_producers() {
    let w = test_worker(HandlerRegistry::builtin()).await;
    let shutdown = CancellationToken::new();
    let runner = {
        let dispatch = w.dispatch.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatch.run(shutdown).await })
    };

    let ids = [
        w.queue
            .enqueue("sentiment-analysis", JobInput::new(vec![json!("what a great day")]))
            .await
            .unwrap(),
        w.queue
            .enqueue(
                "summarization",
                JobInput::new(vec![json!("First sentence. Second sentence.")])
                    .with_kwarg("max_length", json!(2)),
            )
            .await
            .unwrap(),
        w.queue
            .enqueue(
                "cluster",
                JobInput::new(vec![json!([[0.0, 0.0], [0.1, 0.0], [9.0, 9.0], [9.1, 9.0]])]),
            )
            .await
            .unwrap(),
    ];

    for id in ids {
        let job = await_terminal(
            w.queue.as_ref(),
            id,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(job.state, JobState::Done, "job {} failed: {:?}", job.method, job.error());
    }

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .unwrap()
        .unwrap();

    let record = w.store.read().await.unwrap();
    assert_eq!(record.status, MachineStatus::On);
    assert_eq!(record.worker_identity.as_deref(), Some("gpu-test"));
}

#[tokio::test]
async fn test_jobs_processed_one_at_a_time_in_order() {
    let w = test_worker(HandlerRegistry::builtin()).await;
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            w.queue
                .enqueue("cosine", JobInput::new(vec![json!([1.0, i]), json!([1.0, i])]))
                .await
                .unwrap(),
        );
    }

    for expected in &ids {
        assert_eq!(w.dispatch.run_once().await.unwrap(), Some(*expected));
        let counts = w.queue.counts().await.unwrap();
        assert_eq!(counts.working, 0);
    }
    assert_eq!(w.dispatch.run_once().await.unwrap(), None);
    assert_eq!(w.queue.counts().await.unwrap().done, 5);
}
