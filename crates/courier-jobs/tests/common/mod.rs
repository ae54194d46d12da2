#![allow(dead_code)]

pub mod containers;

use courier_jobs::{Broker, JobsConfig, MemoryBroker, QueueRegistry, WorkerEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Config with short worker timings so tests settle quickly.
pub fn fast_config() -> JobsConfig {
    let mut config = JobsConfig::default();
    config.worker.poll_interval_ms = 20;
    config.worker.lease_ms = 5_000;
    config.worker.lease_renew_ms = 1_000;
    config.worker.infra_backoff_initial_ms = 5;
    config.worker.infra_backoff_max_ms = 50;
    config
}

pub fn registry_with(broker: Arc<dyn Broker>) -> QueueRegistry {
    QueueRegistry::new(broker, fast_config()).expect("valid config")
}

pub fn registry() -> (Arc<MemoryBroker>, QueueRegistry) {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry_with(broker.clone());
    (broker, registry)
}

/// Wait for the first event matching `pred`, failing the test after 5s.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<WorkerEvent>,
    pred: impl Fn(&WorkerEvent) -> bool,
) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("event channel failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for worker event")
}

/// Collect events until `done` matches one, returning all of them.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<WorkerEvent>,
    done: impl Fn(&WorkerEvent) -> bool,
) -> Vec<WorkerEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut events = Vec::new();
        loop {
            let event = rx.recv().await.expect("event channel failed");
            let finished = done(&event);
            events.push(event);
            if finished {
                return events;
            }
        }
    })
    .await
    .expect("timed out collecting worker events")
}
