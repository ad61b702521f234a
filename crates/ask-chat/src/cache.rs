//! Process-wide model list cache

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};

use ask_ai::{ChatProvider, ModelInfo};
use parking_lot::Mutex;

/// How long a fetched list is served without refetching
pub const MODEL_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

static GLOBAL: LazyLock<ModelCache> = LazyLock::new(|| ModelCache::new(MODEL_CACHE_TTL));

struct CacheEntry {
    models: Vec<ModelInfo>,
    fetched_at: Instant,
}

/// Model lists keyed by provider
pub struct ModelCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ModelCache {
    /// Create a cache with its own freshness window
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The shared cache
    pub fn global() -> &'static ModelCache {
        &GLOBAL
    }

    /// A cached list still inside the freshness window
    pub fn get_fresh(&self, key: &str) -> Option<Vec<ModelInfo>> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.models.clone())
    }

    /// Serve a fresh entry, or fetch and cache.
    ///
    /// A failed fetch is logged and cached as an empty list.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Vec<ModelInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ask_ai::Result<Vec<ModelInfo>>>,
    {
        if let Some(models) = self.get_fresh(key) {
            tracing::debug!("Model list for {} served from cache", key);
            return models;
        }

        let models = match fetch().await {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!("Failed to fetch models for {}: {}", key, e);
                Vec::new()
            }
        };

        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                models: models.clone(),
                fetched_at: Instant::now(),
            },
        );
        models
    }

    /// Models offered by a provider, keyed by provider and endpoint
    pub async fn models_for(&self, provider: &dyn ChatProvider) -> Vec<ModelInfo> {
        let key = format!("{:?}@{}", provider.kind(), provider.base_url());
        self.get_or_fetch(&key, || provider.list_models()).await
    }

    /// Models of several providers in order, each list cached on its own
    pub async fn models_for_all(&self, providers: &[Arc<dyn ChatProvider>]) -> Vec<ModelInfo> {
        let mut models = Vec::new();
        for provider in providers {
            models.extend(self.models_for(provider.as_ref()).await);
        }
        models
    }

    /// Forget a cached list
    pub fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}
