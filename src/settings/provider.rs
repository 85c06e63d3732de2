//! Cached access to the configuration snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::ConfigError;
use crate::settings::snapshot::{ConfigSnapshot, SNAPSHOT_KEYS};
use crate::store::Database;

struct Cached {
    snapshot: Arc<ConfigSnapshot>,
    loaded_at: Instant,
}

/// Loads [`ConfigSnapshot`] from the `settings` table on first use and
/// reuses it until the TTL lapses or [`invalidate`](Self::invalidate) is called.
pub struct SettingsProvider {
    store: Arc<dyn Database>,
    defaults: RuntimeConfig,
    ttl: Duration,
    cache: RwLock<Option<Cached>>,
}

impl SettingsProvider {
    pub fn new(store: Arc<dyn Database>, defaults: RuntimeConfig) -> Self {
        let ttl = defaults.snapshot_ttl;
        Self {
            store,
            defaults,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Current snapshot, reloading if absent or expired.
    ///
    /// If a reload fails and an expired snapshot is still held, the expired
    /// one is returned rather than failing every message in the batch.
    pub async fn snapshot(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        {
            let guard = self.cache.read().await;
            if let Some(cached) = guard.as_ref()
                && cached.loaded_at.elapsed() < self.ttl
            {
                return Ok(Arc::clone(&cached.snapshot));
            }
        }

        let mut guard = self.cache.write().await;
        // Another task may have reloaded while we waited for the write lock.
        if let Some(cached) = guard.as_ref()
            && cached.loaded_at.elapsed() < self.ttl
        {
            return Ok(Arc::clone(&cached.snapshot));
        }

        match self.load().await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *guard = Some(Cached {
                    snapshot: Arc::clone(&snapshot),
                    loaded_at: Instant::now(),
                });
                debug!("Configuration snapshot loaded");
                Ok(snapshot)
            }
            Err(e) => match guard.as_ref() {
                Some(stale) => {
                    warn!(error = %e, "Snapshot reload failed, keeping previous snapshot");
                    Ok(Arc::clone(&stale.snapshot))
                }
                None => Err(e),
            },
        }
    }

    /// Drop the cached snapshot; the next read reloads it.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
        debug!("Configuration snapshot invalidated");
    }

    /// Write a setting and invalidate the cache.
    ///
    /// The value is validated against a scratch snapshot first, so an edit
    /// the router could never apply is rejected before it is stored.
    pub async fn update(&self, key: &str, value: serde_json::Value) -> Result<(), ConfigError> {
        let mut scratch = ConfigSnapshot::from_runtime(&self.defaults);
        scratch.apply(key, &value)?;

        self.store.set_setting(key, &value).await?;
        self.invalidate().await;
        Ok(())
    }

    async fn load(&self) -> Result<ConfigSnapshot, ConfigError> {
        let mut snapshot = ConfigSnapshot::from_runtime(&self.defaults);
        for key in SNAPSHOT_KEYS {
            let Some(value) = self.store.get_setting(key).await? else {
                continue;
            };
            if let Err(e) = snapshot.apply(key, &value) {
                if snapshot.mark_malformed(key) {
                    warn!(key = %key, error = %e, "Invalid gate setting, denying new-job acknowledgments");
                } else {
                    warn!(key = %key, error = %e, "Ignoring invalid setting");
                }
            }
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::snapshot::{KEY_AUTHORIZED_SENDERS, KEY_AUTO_REPLY_ENABLED};
    use crate::store::LibSqlBackend;
    use serde_json::json;

    async fn provider(ttl: Duration) -> (Arc<dyn Database>, SettingsProvider) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let config = RuntimeConfig {
            snapshot_ttl: ttl,
            ..RuntimeConfig::default()
        };
        let provider = SettingsProvider::new(Arc::clone(&db), config);
        (db, provider)
    }

    #[tokio::test]
    async fn defaults_without_rows() {
        let (_db, provider) = provider(Duration::from_secs(60)).await;
        let snap = provider.snapshot().await.unwrap();
        assert!(snap.authorized_senders.is_empty());
        assert!(snap.auto_reply_enabled);
        assert_eq!(snap.default_sla_hours, 24);
    }

    #[tokio::test]
    async fn cached_until_invalidated() {
        let (db, provider) = provider(Duration::from_secs(3600)).await;
        let first = provider.snapshot().await.unwrap();
        assert!(first.auto_reply_enabled);

        // Direct write bypasses invalidation: still the cached value.
        db.set_setting(KEY_AUTO_REPLY_ENABLED, &json!(false))
            .await
            .unwrap();
        assert!(provider.snapshot().await.unwrap().auto_reply_enabled);

        provider.invalidate().await;
        assert!(!provider.snapshot().await.unwrap().auto_reply_enabled);
    }

    #[tokio::test]
    async fn update_invalidates_on_write() {
        let (db, provider) = provider(Duration::from_secs(3600)).await;
        provider.snapshot().await.unwrap();

        provider
            .update(KEY_AUTHORIZED_SENDERS, json!(["@insurer.example"]))
            .await
            .unwrap();
        let snap = provider.snapshot().await.unwrap();
        assert_eq!(snap.authorized_senders, vec!["@insurer.example"]);
        assert!(db.get_setting(KEY_AUTHORIZED_SENDERS).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_rejects_invalid_value() {
        let (db, provider) = provider(Duration::from_secs(3600)).await;
        let err = provider
            .update(KEY_AUTO_REPLY_ENABLED, json!("yes please"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(db.get_setting(KEY_AUTO_REPLY_ENABLED).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_ttl_always_reloads() {
        let (db, provider) = provider(Duration::ZERO).await;
        provider.snapshot().await.unwrap();
        db.set_setting(KEY_AUTO_REPLY_ENABLED, &json!(false))
            .await
            .unwrap();
        assert!(!provider.snapshot().await.unwrap().auto_reply_enabled);
    }

    #[tokio::test]
    async fn bad_row_is_skipped() {
        let (db, provider) = provider(Duration::ZERO).await;
        db.set_setting(KEY_AUTO_REPLY_ENABLED, &json!("maybe"))
            .await
            .unwrap();
        db.set_setting(KEY_AUTHORIZED_SENDERS, &json!(["a@b.example"]))
            .await
            .unwrap();
        let snap = provider.snapshot().await.unwrap();
        assert!(snap.auto_reply_enabled);
        assert_eq!(snap.authorized_senders.len(), 1);
        assert!(snap.malformed_gates.is_empty());
    }

    #[tokio::test]
    async fn bad_allowlist_row_fails_closed() {
        let (db, provider) = provider(Duration::ZERO).await;
        db.set_setting(KEY_AUTHORIZED_SENDERS, &json!("jobs@trusted.example"))
            .await
            .unwrap();
        let snap = provider.snapshot().await.unwrap();
        assert_eq!(snap.malformed_gates, vec![KEY_AUTHORIZED_SENDERS]);
        assert!(!snap.is_sender_authorized("jobs@trusted.example"));
        assert!(!snap.is_sender_authorized("stranger@elsewhere.example"));
    }
}
