//! Redis testcontainer for broker integration tests.

use courier_jobs::redis::create_pool;
use courier_jobs::{Clock, RedisBroker, RedisConfig};
use deadpool_redis::Pool;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;

const KEY_PREFIX: &str = "courier-test";

/// A throwaway Redis server and a pool connected to it.
///
/// The container is removed when this value is dropped.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    pool: Pool,
}

impl TestRedis {
    /// Starts a fresh Redis container and waits until it answers PING.
    pub async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let config = RedisConfig {
            url: format!("redis://127.0.0.1:{port}"),
            pool_size: 4,
            connect_timeout_secs: 5,
            key_prefix: KEY_PREFIX.to_string(),
        };
        let pool = Self::connect_with_retry(&config, 30).await;

        Self {
            _container: container,
            pool,
        }
    }

    /// Broker on the system clock.
    pub fn broker(&self) -> RedisBroker {
        RedisBroker::new(self.pool.clone(), KEY_PREFIX)
    }

    /// Broker on a caller-controlled clock.
    pub fn broker_with_clock(&self, clock: Arc<dyn Clock>) -> RedisBroker {
        self.broker().with_clock(clock)
    }

    async fn connect_with_retry(config: &RedisConfig, max_attempts: u32) -> Pool {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match create_pool(config).await {
                Ok(pool) => return pool,
                Err(e) => {
                    if attempts >= max_attempts {
                        panic!("Failed to connect to Redis after {max_attempts} attempts: {e}");
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }
}
