//! End-to-end worker behavior: retries, dead-lettering, events, draining.

mod common;

use common::{collect_until, registry, registry_with, wait_for};
use courier_jobs::{
    processor_fn, Backoff, Broker, Job, JobError, JobOptions, JobState, ManualClock,
    MemoryBroker, Queue, QueueOptions, Worker, WorkerEvent, WorkerOptions,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn job_failing_twice_then_succeeding_completes_with_two_attempts() -> anyhow::Result<()> {
    let (_, registry) = registry();
    let mut events = registry.subscribe();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    registry.register_processor(
        "mail",
        processor_fn(move |_job: Job| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(JobError::transient("smtp timeout"))
                } else {
                    Ok(())
                }
            }
        }),
        1,
    )?;

    let job = registry
        .enqueue(
            "mail",
            "welcome",
            &json!({ "to": "a@example.com" }),
            JobOptions::new()
                .max_attempts(3)
                .backoff(Backoff::exponential(Duration::from_millis(20))),
        )
        .await?;

    let seen = collect_until(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;

    let retry_delays: Vec<Duration> = seen
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::Failed {
                will_retry: true,
                retry_delay,
                ..
            } => *retry_delay,
            _ => None,
        })
        .collect();
    assert_eq!(
        retry_delays,
        vec![Duration::from_millis(20), Duration::from_millis(40)]
    );

    let attempts: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::Started { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let stored = registry.get_job("mail", &job.id).await?.expect("job exists");
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.attempts_made, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    registry.shutdown(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn always_failing_job_is_dead_lettered_after_max_attempts() -> anyhow::Result<()> {
    let (_, registry) = registry();
    let mut events = registry.subscribe();

    registry.register_processor(
        "mail",
        processor_fn(|job: Job| async move {
            Err(JobError::transient(format!(
                "mailbox full (try {})",
                job.attempts_made + 1
            )))
        }),
        2,
    )?;

    let payload = json!({ "to": "full@example.com" });
    let job = registry
        .enqueue(
            "mail",
            "welcome",
            &payload,
            JobOptions::new()
                .max_attempts(3)
                .backoff(Backoff::fixed(Duration::from_millis(10))),
        )
        .await?;

    let seen = collect_until(&mut events, |e| matches!(e, WorkerEvent::DeadLettered { .. })).await;
    let failures: Vec<bool> = seen
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::Failed { will_retry, .. } => Some(*will_retry),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![true, true, false]);

    let stored = registry.get_job("mail", &job.id).await?.expect("job exists");
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.attempts_made, 3);

    let sink = registry.dead_letters().expect("dead-letter enabled");
    let entries = sink.list(0, 10).await?;
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.original_queue, "mail");
    assert_eq!(entry.original_job_id, job.id);
    assert_eq!(entry.payload, payload);
    assert_eq!(entry.attempts, 3);
    assert!(entry.error.contains("try 3"), "final error kept: {}", entry.error);

    let stats = registry.worker("mail").expect("worker registered").stats();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.processed, 0);

    registry.shutdown(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn permanent_error_skips_remaining_attempts() -> anyhow::Result<()> {
    let (_, registry) = registry();
    let mut events = registry.subscribe();

    registry.register_processor(
        "mail",
        processor_fn(|_job: Job| async { Err(JobError::permanent("invalid address")) }),
        1,
    )?;
    let job = registry
        .enqueue("mail", "welcome", &json!({ "to": "nope" }), JobOptions::new().max_attempts(5))
        .await?;

    let event = wait_for(&mut events, |e| matches!(e, WorkerEvent::DeadLettered { .. })).await;
    assert_eq!(event.job_id(), &job.id);

    let stored = registry.get_job("mail", &job.id).await?.expect("job exists");
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.attempts_made, 1);
    assert!(stored.attempts_made <= stored.max_attempts);

    registry.shutdown(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn dead_letter_entry_can_be_replayed() -> anyhow::Result<()> {
    let (_, registry) = registry();
    let mut events = registry.subscribe();
    let healthy = Arc::new(AtomicU32::new(0));

    let flag = healthy.clone();
    registry.register_processor(
        "mail",
        processor_fn(move |_job: Job| {
            let flag = flag.clone();
            async move {
                if flag.load(Ordering::SeqCst) == 0 {
                    Err(JobError::permanent("relay down"))
                } else {
                    Ok(())
                }
            }
        }),
        1,
    )?;
    registry
        .enqueue("mail", "welcome", &json!({ "to": "a@example.com" }), JobOptions::new())
        .await?;

    let entry_id = match wait_for(&mut events, |e| matches!(e, WorkerEvent::DeadLettered { .. })).await {
        WorkerEvent::DeadLettered { entry_id, .. } => entry_id,
        other => panic!("unexpected event {other:?}"),
    };

    healthy.store(1, Ordering::SeqCst);
    let replayed = registry.replay_dead_letter(&entry_id).await?;
    assert_eq!(replayed.attempts_made, 0);

    let done = wait_for(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;
    assert_eq!(done.job_id(), &replayed.id);
    assert_eq!(registry.dead_letters().expect("enabled").count().await?, 0);

    registry.shutdown(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn concurrency_bounds_simultaneous_jobs() -> anyhow::Result<()> {
    let (_, registry) = registry();
    let mut events = registry.subscribe();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (r, p) = (running.clone(), peak.clone());
    registry.register_processor(
        "reports",
        processor_fn(move |_job: Job| {
            let (running, peak) = (r.clone(), p.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        2,
    )?;

    for i in 0..6 {
        registry
            .enqueue("reports", "render", &json!({ "page": i }), JobOptions::new())
            .await?;
    }

    let mut completed = 0;
    while completed < 6 {
        wait_for(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;
        completed += 1;
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);

    registry.shutdown(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn paused_queue_holds_jobs_until_resumed() -> anyhow::Result<()> {
    let (_, registry) = registry();
    let mut events = registry.subscribe();
    registry.queue("mail")?;
    registry.pause("mail").await?;

    registry.register_processor("mail", processor_fn(|_job: Job| async { Ok(()) }), 1)?;
    let job = registry
        .enqueue("mail", "welcome", &json!({}), JobOptions::new())
        .await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = registry.get_job("mail", &job.id).await?.expect("job exists");
    assert_eq!(stored.state, JobState::Waiting);
    assert!(registry.get_metrics("mail").await?.paused);

    registry.resume("mail").await?;
    let event = wait_for(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;
    assert_eq!(event.job_id(), &job.id);

    registry.shutdown(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn stopped_worker_dequeues_nothing_more() -> anyhow::Result<()> {
    let broker = Arc::new(MemoryBroker::new());
    let queue = Arc::new(Queue::new("mail", QueueOptions::default(), broker.clone()));
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let handle = Worker::new(
        queue.clone(),
        processor_fn(move |_job: Job| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    )
    .options(WorkerOptions::default().concurrency(2).poll_interval(Duration::from_millis(10)))
    .spawn()?;

    let first = queue.enqueue("welcome", &json!({}), JobOptions::new()).await?;
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.stats().processed == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    let report = handle.shutdown(Duration::from_secs(1)).await;
    assert!(report.completed_in_time);
    assert!(report.abandoned.is_empty());
    assert_eq!(
        queue.get_job(&first.id).await?.expect("job exists").state,
        JobState::Completed
    );

    let late = queue.enqueue("welcome", &json!({}), JobOptions::new()).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        broker.get_job("mail", &late.id).await?.expect("job exists").state,
        JobState::Waiting
    );
    Ok(())
}

#[tokio::test]
async fn job_abandoned_at_shutdown_is_recovered_after_lease_expiry() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::default());
    let broker = Arc::new(MemoryBroker::with_clock(clock.clone()));
    let queue = Arc::new(Queue::new("mail", QueueOptions::default(), broker.clone()));

    let handle = Worker::new(
        queue.clone(),
        processor_fn(|_job: Job| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }),
    )
    .options(
        WorkerOptions::default()
            .concurrency(1)
            .poll_interval(Duration::from_millis(10))
            .lease(Duration::from_secs(30), Duration::from_secs(10)),
    )
    .spawn()?;

    let job = queue.enqueue("slow", &json!({}), JobOptions::new()).await?;
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.active_jobs() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    let report = handle.shutdown(Duration::from_millis(50)).await;
    assert!(!report.completed_in_time);
    assert_eq!(report.abandoned, vec![job.id.clone()]);
    assert_eq!(
        broker.get_job("mail", &job.id).await?.expect("job exists").state,
        JobState::Active
    );

    clock.advance(Duration::from_secs(31));
    let recovered = queue
        .dequeue_next("another-worker", Duration::from_secs(30))
        .await?
        .expect("lease expired");
    assert_eq!(recovered.id, job.id);
    assert_eq!(recovered.attempts_made, 0);
    Ok(())
}

#[tokio::test]
async fn worker_keeps_polling_through_broker_outage() -> anyhow::Result<()> {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry_with(broker.clone());
    let mut events = registry.subscribe();

    registry.register_processor("mail", processor_fn(|_job: Job| async { Ok(()) }), 1)?;
    broker.set_offline(true);

    let err = registry
        .enqueue("mail", "welcome", &json!({}), JobOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::BrokerUnavailable(_)));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(registry.worker("mail").expect("registered").is_running());

    broker.set_offline(false);
    let job = registry
        .enqueue("mail", "welcome", &json!({}), JobOptions::new())
        .await?;
    let event = wait_for(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;
    assert_eq!(event.job_id(), &job.id);

    registry.shutdown(Duration::from_secs(1)).await?;
    Ok(())
}
