use std::future::Future;
use std::time;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::RedisResult;
use tokio::time::timeout;

use super::{DedupStore, StoreError, StoreResult};

/// Add ARGV[1] to the set at KEYS[1]. A new member, or a set without an expiry,
/// (re)starts the set's expiry at ARGV[2] milliseconds. Returns 1 for a new member.
const ADD_WITH_EXPIRY: &str = r"
local added = redis.call('SADD', KEYS[1], ARGV[1])
if added == 1 or redis.call('PTTL', KEYS[1]) == -1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return added
";

/// A `DedupStore` backed by Redis. Every command is bounded by `operation_timeout`
/// so that a stuck connection fails the job instead of stalling a worker.
#[derive(Clone)]
pub struct RedisDedupStore {
    connection: MultiplexedConnection,
    operation_timeout: time::Duration,
    add_with_expiry: redis::Script,
}

impl RedisDedupStore {
    /// Connect to the Redis instance at `url`.
    ///
    /// # Arguments
    ///
    /// * `url`: A Redis connection string, e.g. `redis://localhost:6379/`.
    /// * `operation_timeout`: Upper bound for connecting and for each command. Must be non-zero.
    pub async fn new(url: &str, operation_timeout: time::Duration) -> StoreResult<Self> {
        if operation_timeout.is_zero() {
            return Err(StoreError::InvalidConfiguration(
                "redis operation timeout cannot be zero".to_owned(),
            ));
        }

        let client = redis::Client::open(url).map_err(|error| StoreError::Redis {
            command: "CONNECT",
            error,
        })?;

        let connection = timeout(operation_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Timeout("CONNECT"))?
            .map_err(|error| StoreError::Redis {
                command: "CONNECT",
                error,
            })?;

        Ok(Self {
            connection,
            operation_timeout,
            add_with_expiry: redis::Script::new(ADD_WITH_EXPIRY),
        })
    }

    async fn run<T, F>(&self, command: &'static str, future: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.operation_timeout, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(StoreError::Redis { command, error }),
            Err(_) => Err(StoreError::Timeout(command)),
        }
    }
}

/// Redis rejects expiries that overflow its clock, so longer windows are capped here.
const MAX_TTL_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

fn ttl_millis(ttl: time::Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(u64::MAX)
        .min(MAX_TTL_MS)
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn add_to_set(
        &self,
        key: &str,
        member: &str,
        ttl: Option<time::Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.connection.clone();

        let Some(ttl) = ttl else {
            let added: i64 = self
                .run(
                    "SADD",
                    redis::cmd("SADD").arg(key).arg(member).query_async(&mut conn),
                )
                .await?;
            return Ok(added == 1);
        };

        // One script, so the add and the expiry can never be split by a failure.
        let mut invocation = self.add_with_expiry.key(key);
        invocation.arg(member).arg(ttl_millis(ttl));
        let added: i64 = self
            .run("SADD", invocation.invoke_async(&mut conn))
            .await?;

        Ok(added == 1)
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .run(
                "SREM",
                redis::cmd("SREM").arg(key).arg(member).query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection.clone();
        self.run(
            "SMEMBERS",
            redis::cmd("SMEMBERS").arg(key).query_async(&mut conn),
        )
        .await
    }

    async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.connection.clone();
        self.run(
            "INCRBY",
            redis::cmd("INCRBY").arg(key).arg(delta).query_async(&mut conn),
        )
        .await
    }

    async fn get_and_delete(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection.clone();
        let value: Option<i64> = self
            .run("GETDEL", redis::cmd("GETDEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        self.run("EXISTS", redis::cmd("EXISTS").arg(key).query_async(&mut conn))
            .await
    }
}
