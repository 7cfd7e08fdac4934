//! Token-based device authentication with a TTL cache.
//!
//! A device proves it may speak for its sensor by presenting a token. The
//! authenticator resolves tokens through a TTL cache backed by the
//! repository; the UUID-spoofing defense (claimed UUID must match the
//! token's sensor) applies on cache hits as well as misses.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use aemos_core::{Error, IngressConfig, Result};
use aemos_storage::{SensorStatus, SharedRepository};

/// Client-id prefix of our own outbound publishers. Messages from these
/// clients are acknowledged but never processed, so broadcasts are not
/// re-ingested.
pub const PUBLISHER_CLIENT_PREFIX: &str = "aemos-publisher-";

/// Identity resolved from a valid token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedSensor {
    pub sensor_id: i64,
    pub sensor_uuid: String,
    pub name: String,
    pub organization_id: i64,
    token_id: i64,
}

/// Token authenticator with a 1-hour TTL cache and a periodic sweep.
pub struct DeviceAuthenticator {
    repo: SharedRepository,
    cache: Cache<String, AuthenticatedSensor>,
    config: IngressConfig,
}

impl DeviceAuthenticator {
    pub fn new(repo: SharedRepository, config: IngressConfig) -> Self {
        let cache = Cache::builder()
            .time_to_live(Duration::from_secs(config.token_cache_ttl_secs))
            .max_capacity(100_000)
            .build();
        Self {
            repo,
            cache,
            config,
        }
    }

    /// Whether a client id belongs to one of our own publishers.
    pub fn is_feedback_client(client_id: &str) -> bool {
        client_id.starts_with(PUBLISHER_CLIENT_PREFIX)
    }

    /// Whether the credentials match the reserved internal publisher.
    pub fn is_internal(&self, username: &str, password: &str) -> bool {
        username == self.config.internal_username && password == self.config.internal_password
    }

    /// Development mode accepts unauthenticated publishes with a warning.
    pub fn dev_mode(&self) -> bool {
        self.config.dev_mode
    }

    /// Authenticate a device claiming `device_uuid` with `token`.
    ///
    /// 1. Consult the cache; a hit schedules an async `last_used` update.
    /// 2. On miss, resolve an active unexpired token joined to its sensor.
    /// 3. Reject when the sensor's UUID does not match the claim.
    /// 4. Reject inactive sensors.
    /// 5. Cache the identity under the token.
    pub async fn authenticate(
        &self,
        device_uuid: &str,
        token: &str,
    ) -> Result<AuthenticatedSensor> {
        if let Some(cached) = self.cache.get(token).await {
            if cached.sensor_uuid != device_uuid {
                return Err(Error::AuthenticationFailed(format!(
                    "token does not belong to device {device_uuid}"
                )));
            }
            self.touch_async(cached.token_id);
            return Ok(cached);
        }

        let Some((row, sensor)) = self
            .repo
            .active_token(token)
            .await
            .map_err(Error::from)?
        else {
            return Err(Error::AuthenticationFailed(
                "unknown, expired, or revoked token".to_string(),
            ));
        };

        if sensor.uuid != device_uuid {
            // A valid token presented for somebody else's UUID.
            tracing::warn!(
                claimed = device_uuid,
                actual = %sensor.uuid,
                "token presented for a mismatched device uuid"
            );
            return Err(Error::AuthenticationFailed(format!(
                "token does not belong to device {device_uuid}"
            )));
        }
        if sensor.status != SensorStatus::Active {
            return Err(Error::AuthenticationFailed(format!(
                "sensor {} is {}",
                sensor.uuid,
                sensor.status.as_str()
            )));
        }

        let identity = AuthenticatedSensor {
            sensor_id: sensor.id,
            sensor_uuid: sensor.uuid,
            name: sensor.name,
            organization_id: sensor.organization_id,
            token_id: row.id,
        };
        self.cache.insert(token.to_string(), identity.clone()).await;
        self.touch_async(row.id);
        Ok(identity)
    }

    /// Drop a cached token, e.g. after revocation.
    pub async fn evict(&self, token: &str) {
        self.cache.invalidate(token).await;
    }

    /// Cached entry count (post-sweep approximation).
    pub fn cached_tokens(&self) -> u64 {
        self.cache.entry_count()
    }

    fn touch_async(&self, token_id: i64) {
        let repo = Arc::clone(&self.repo);
        tokio::spawn(async move {
            if let Err(e) = repo.touch_token(token_id, Utc::now()).await {
                tracing::debug!(token_id, error = %e, "last_used update failed");
            }
        });
    }

    /// Spawn the periodic expiration sweep.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let auth = Arc::clone(self);
        let interval = Duration::from_secs(self.config.token_sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                auth.cache.run_pending_tasks().await;
                tracing::debug!(cached = auth.cache.entry_count(), "token cache swept");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aemos_storage::{MemoryRepository, TokenStatus};

    fn setup() -> (Arc<MemoryRepository>, DeviceAuthenticator, String) {
        let repo = Arc::new(MemoryRepository::new());
        let sensor = repo.add_sensor("s1", "Sensor 1", SensorStatus::Active, 1);
        let token = "a".repeat(64);
        repo.add_token(&token, sensor.id, TokenStatus::Active, None);
        let auth = DeviceAuthenticator::new(
            Arc::clone(&repo) as SharedRepository,
            IngressConfig::default(),
        );
        (repo, auth, token)
    }

    #[tokio::test]
    async fn valid_token_authenticates() {
        let (_repo, auth, token) = setup();
        let identity = auth.authenticate("s1", &token).await.unwrap();
        assert_eq!(identity.sensor_uuid, "s1");
        assert_eq!(identity.organization_id, 1);
    }

    #[tokio::test]
    async fn uuid_mismatch_is_rejected_even_from_cache() {
        let (_repo, auth, token) = setup();
        // Warm the cache with the legitimate claim.
        auth.authenticate("s1", &token).await.unwrap();
        // The same token claimed for another device must still fail.
        let err = auth.authenticate("s2", &token).await.unwrap_err();
        assert_eq!(err.code(), "AUTHENTICATION_FAILED");
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let (_repo, auth, _token) = setup();
        let err = auth.authenticate("s1", &"f".repeat(64)).await.unwrap_err();
        assert_eq!(err.code(), "AUTHENTICATION_FAILED");
    }

    #[tokio::test]
    async fn inactive_sensor_is_rejected() {
        let repo = Arc::new(MemoryRepository::new());
        let sensor = repo.add_sensor("s1", "Sensor 1", SensorStatus::Retired, 1);
        let token = "b".repeat(64);
        repo.add_token(&token, sensor.id, TokenStatus::Active, None);
        let auth =
            DeviceAuthenticator::new(repo as SharedRepository, IngressConfig::default());

        let err = auth.authenticate("s1", &token).await.unwrap_err();
        assert_eq!(err.code(), "AUTHENTICATION_FAILED");
    }

    #[tokio::test]
    async fn cache_hit_skips_the_repository() {
        let (repo, auth, token) = setup();
        auth.authenticate("s1", &token).await.unwrap();
        // Revoke in the repository; the cache still answers until eviction.
        repo.set_token_status(&token, TokenStatus::Revoked);
        assert!(auth.authenticate("s1", &token).await.is_ok());

        auth.evict(&token).await;
        assert!(auth.authenticate("s1", &token).await.is_err());
    }

    #[test]
    fn feedback_clients_are_recognized() {
        assert!(DeviceAuthenticator::is_feedback_client("aemos-publisher-7"));
        assert!(!DeviceAuthenticator::is_feedback_client("device-42"));
    }

    #[test]
    fn internal_identity_matches_config() {
        let repo = Arc::new(MemoryRepository::new());
        let auth =
            DeviceAuthenticator::new(repo as SharedRepository, IngressConfig::default());
        assert!(auth.is_internal("publisher", "publisher-secret"));
        assert!(!auth.is_internal("publisher", "wrong"));
    }
}
