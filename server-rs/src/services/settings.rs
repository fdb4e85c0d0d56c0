use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AppResult;
use crate::store::Store;

type Key = (Uuid, String);

#[derive(Default)]
struct Entries {
    values: HashMap<Key, Option<Value>>,
    /// Bumped by every write; a fill started under an older version is stale.
    versions: HashMap<Key, u64>,
}

/// Per-user settings (celebration effects and similar small toggles),
/// cached in memory after the first read and invalidated on write.
#[derive(Clone)]
pub struct SettingsService {
    store: Arc<dyn Store>,
    cache: Arc<RwLock<Entries>>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(Entries::default())),
        }
    }

    pub async fn get(&self, user_id: Uuid, key: &str) -> AppResult<Option<Value>> {
        let cache_key = (user_id, key.to_string());
        let version = {
            let cache = self.cache.read().await;
            if let Some(hit) = cache.values.get(&cache_key) {
                return Ok(hit.clone());
            }
            cache.versions.get(&cache_key).copied().unwrap_or(0)
        };

        let value = self.store.get_setting(user_id, key).await?;
        self.fill(cache_key, version, value.clone()).await;
        Ok(value)
    }

    pub async fn put(&self, user_id: Uuid, key: &str, value: &Value) -> AppResult<()> {
        self.store.put_setting(user_id, key, value).await?;
        let cache_key = (user_id, key.to_string());
        let mut cache = self.cache.write().await;
        *cache.versions.entry(cache_key.clone()).or_insert(0) += 1;
        cache.values.remove(&cache_key);
        Ok(())
    }

    /// Caches a value read under `version`, unless a write has landed since.
    async fn fill(&self, cache_key: Key, version: u64, value: Option<Value>) {
        let mut cache = self.cache.write().await;
        if cache.versions.get(&cache_key).copied().unwrap_or(0) == version {
            cache.values.insert(cache_key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn reads_through_and_invalidates_on_write() {
        let store = MemoryStore::new();
        let settings = SettingsService::new(Arc::new(store.clone()));
        let user = Uuid::new_v4();

        assert_eq!(settings.get(user, "celebration").await.unwrap(), None);

        // Written behind the service's back: the cached miss still answers.
        store
            .put_setting(user, "celebration", &json!({ "confetti": true }))
            .await
            .unwrap();
        assert_eq!(settings.get(user, "celebration").await.unwrap(), None);

        settings
            .put(user, "celebration", &json!({ "confetti": false }))
            .await
            .unwrap();
        assert_eq!(
            settings.get(user, "celebration").await.unwrap(),
            Some(json!({ "confetti": false }))
        );
    }

    #[tokio::test]
    async fn cached_value_survives_store_outage() {
        let store = MemoryStore::new();
        let settings = SettingsService::new(Arc::new(store.clone()));
        let user = Uuid::new_v4();
        settings.put(user, "sound", &json!("chime")).await.unwrap();
        assert_eq!(settings.get(user, "sound").await.unwrap(), Some(json!("chime")));

        store.set_failing(true);
        assert_eq!(settings.get(user, "sound").await.unwrap(), Some(json!("chime")));
        assert!(settings.put(user, "sound", &json!("none")).await.is_err());
    }

    #[tokio::test]
    async fn read_that_started_before_a_write_is_not_cached() {
        let store = MemoryStore::new();
        let settings = SettingsService::new(Arc::new(store.clone()));
        let user = Uuid::new_v4();
        let key = (user, "celebration".to_string());
        store
            .put_setting(user, "celebration", &json!("old"))
            .await
            .unwrap();

        // A reader takes its version and loads the old value...
        let version = settings.cache.read().await.versions.get(&key).copied().unwrap_or(0);
        let stale = store.get_setting(user, "celebration").await.unwrap();
        // ...a write lands before the reader fills the cache...
        settings.put(user, "celebration", &json!("new")).await.unwrap();
        settings.fill(key, version, stale).await;

        // ...and the stale value never becomes visible.
        assert_eq!(
            settings.get(user, "celebration").await.unwrap(),
            Some(json!("new"))
        );
    }
}
