//! Dequeue ordering and eligibility against the in-memory broker.

use courier_jobs::{
    Broker, Clock, Job, JobOptions, JobState, ManualClock, MemoryBroker, Queue, QueueOptions,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(30);

fn setup() -> (Arc<ManualClock>, Arc<MemoryBroker>, Queue) {
    let clock = Arc::new(ManualClock::default());
    let broker = Arc::new(MemoryBroker::with_clock(clock.clone()));
    let queue = Queue::new("mail", QueueOptions::default(), broker.clone());
    (clock, broker, queue)
}

async fn enqueue(queue: &Queue, name: &str, options: JobOptions) -> Job {
    queue.enqueue(name, &json!({ "n": name }), options).await.unwrap()
}

#[tokio::test]
async fn lower_priority_value_wins_regardless_of_enqueue_order() {
    for a_first in [true, false] {
        let (_, _, queue) = setup();
        let (a, b) = if a_first {
            let a = enqueue(&queue, "a", JobOptions::new().priority(1)).await;
            let b = enqueue(&queue, "b", JobOptions::new().priority(5)).await;
            (a, b)
        } else {
            let b = enqueue(&queue, "b", JobOptions::new().priority(5)).await;
            let a = enqueue(&queue, "a", JobOptions::new().priority(1)).await;
            (a, b)
        };

        assert_eq!(queue.dequeue_next("w", LEASE).await.unwrap().unwrap().id, a.id);
        assert_eq!(queue.dequeue_next("w", LEASE).await.unwrap().unwrap().id, b.id);
    }
}

#[tokio::test]
async fn equal_priority_is_fifo() {
    let (_, _, queue) = setup();
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(enqueue(&queue, &format!("j{i}"), JobOptions::new().priority(3)).await.id);
    }

    let mut dequeued = Vec::new();
    while let Some(job) = queue.dequeue_next("w", LEASE).await.unwrap() {
        dequeued.push(job.id);
    }
    assert_eq!(dequeued, ids);
}

#[tokio::test]
async fn delayed_job_becomes_eligible_exactly_at_available_at() {
    let (clock, _, queue) = setup();
    let job = enqueue(&queue, "later", JobOptions::new().delay(Duration::from_millis(5000))).await;
    assert_eq!(job.state, JobState::Delayed);

    clock.advance(Duration::from_millis(4999));
    assert!(queue.dequeue_next("w", LEASE).await.unwrap().is_none());

    clock.advance(Duration::from_millis(1));
    let got = queue.dequeue_next("w", LEASE).await.unwrap().unwrap();
    assert_eq!(got.id, job.id);
    assert_eq!(got.state, JobState::Active);
}

#[tokio::test]
async fn due_delayed_job_keeps_its_priority() {
    let (clock, _, queue) = setup();
    let low = enqueue(&queue, "low", JobOptions::new().priority(9)).await;
    let urgent = enqueue(
        &queue,
        "urgent",
        JobOptions::new().priority(0).delay(Duration::from_secs(1)),
    )
    .await;

    clock.advance(Duration::from_secs(1));
    assert_eq!(queue.dequeue_next("w", LEASE).await.unwrap().unwrap().id, urgent.id);
    assert_eq!(queue.dequeue_next("w", LEASE).await.unwrap().unwrap().id, low.id);
}

#[tokio::test]
async fn active_job_has_exactly_one_owner() {
    let (_, _, queue) = setup();
    enqueue(&queue, "once", JobOptions::new()).await;

    let first = queue.dequeue_next("w1", LEASE).await.unwrap();
    let second = queue.dequeue_next("w2", LEASE).await.unwrap();
    assert_eq!(first.unwrap().owner.as_deref(), Some("w1"));
    assert!(second.is_none());
}

#[tokio::test]
async fn expired_lease_makes_job_dequeueable_again() {
    let (clock, broker, queue) = setup();
    let job = enqueue(&queue, "crashy", JobOptions::new()).await;
    let stale = queue.dequeue_next("w1", LEASE).await.unwrap().unwrap();

    clock.advance(LEASE + Duration::from_millis(1));
    let again = queue.dequeue_next("w2", LEASE).await.unwrap().unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(again.attempts_made, 0);

    assert!(broker.ack_complete(&stale).await.is_err());
    broker.ack_complete(&again).await.unwrap();
    assert_eq!(
        queue.get_job(&job.id).await.unwrap().unwrap().state,
        JobState::Completed
    );
    assert!(clock.now() > job.created_at);
}
