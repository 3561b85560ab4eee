//! Redis-backed dedupe index shared by all worker instances.
//!
//! One string key per dedupe key, holding `pending:<envelope-id>` or `done`,
//! with a TTL. The claim is a `SET NX`, so two workers racing on the same
//! event cannot both win it.

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, AsyncCommands, Script};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{DedupeKey, DedupeStatus, DedupeStore, StoreError};

const COMPLETED: &str = "done";

/// Deletes the key only while it still holds the caller's pending claim.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisDedupeStore {
    pool: Pool,
    key_prefix: String,
    ttl: Duration,
}

impl RedisDedupeStore {
    pub async fn connect(url: &str, key_prefix: &str, ttl: Duration) -> Result<Self, StoreError> {
        if url.trim().is_empty() {
            return Err(StoreError::Invalid("dedupe Redis URL is empty".into()));
        }
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Invalid(format!("invalid Redis pool config: {}", e)))?;

        let store = Self {
            pool,
            key_prefix: key_prefix.to_string(),
            ttl,
        };

        let mut conn = store.connection().await?;
        let _: String = cmd("PING").query_async(&mut conn).await?;

        info!(ttl_secs = ttl.as_secs(), "Redis dedupe store connected");
        Ok(store)
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        Ok(self.pool.get().await?)
    }

    fn redis_key(&self, key: &DedupeKey) -> String {
        format!("{}dedupe:{}", self.key_prefix, key)
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }
}

fn pending_value(owner: Uuid) -> String {
    format!("pending:{}", owner)
}

/// Interpret the value found under an already-claimed key.
fn classify_existing(value: &str, owner: Uuid) -> DedupeStatus {
    if value == pending_value(owner) {
        DedupeStatus::Resumed
    } else {
        DedupeStatus::Seen
    }
}

#[async_trait]
impl DedupeStore for RedisDedupeStore {
    async fn check_and_set(&self, key: &DedupeKey, owner: Uuid) -> Result<DedupeStatus, StoreError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.connection().await?;

        // A key can expire between the failed SET NX and the GET; one more
        // round settles it.
        for _ in 0..2 {
            let claimed: Option<String> = cmd("SET")
                .arg(&redis_key)
                .arg(pending_value(owner))
                .arg("NX")
                .arg("EX")
                .arg(self.ttl_secs())
                .query_async(&mut conn)
                .await?;
            if claimed.is_some() {
                return Ok(DedupeStatus::Fresh);
            }

            let existing: Option<String> = conn.get(&redis_key).await?;
            if let Some(value) = existing {
                let status = classify_existing(&value, owner);
                debug!(dedupe_key = %key, status = ?status, "Dedupe key already present");
                return Ok(status);
            }
        }

        Err(StoreError::Unavailable(format!(
            "dedupe key {} kept changing during check-and-set",
            key
        )))
    }

    async fn mark_completed(&self, key: &DedupeKey) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .set_ex(self.redis_key(key), COMPLETED, self.ttl_secs())
            .await?;
        Ok(())
    }

    async fn release(&self, key: &DedupeKey, owner: Uuid) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(self.redis_key(key))
            .arg(pending_value(owner))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_existing() {
        let owner = Uuid::new_v4();
        assert_eq!(classify_existing(&pending_value(owner), owner), DedupeStatus::Resumed);
        assert_eq!(
            classify_existing(&pending_value(Uuid::new_v4()), owner),
            DedupeStatus::Seen
        );
        assert_eq!(classify_existing(COMPLETED, owner), DedupeStatus::Seen);
    }

    #[tokio::test]
    async fn test_empty_url_is_rejected() {
        let result = RedisDedupeStore::connect("", "vitalflow:", Duration::from_secs(60)).await;
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }
}
