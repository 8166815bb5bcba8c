//! Best-effort persisted mapping from lowercase broadcaster login to
//! Twitch numeric user id. A corrupt file is ignored and the cache
//! rebuilds itself lazily from Helix.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

pub struct BroadcasterCache {
    path: PathBuf,
    map: RwLock<HashMap<String, String>>,
}

impl BroadcasterCache {
    pub async fn load(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let map = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<HashMap<String, String>>(&bytes).unwrap_or_else(
                |e| {
                    warn!(error = %e, path = %path.display(), "corrupt broadcaster cache; starting empty");
                    HashMap::new()
                },
            ),
            Err(_) => HashMap::new(),
        };

        Arc::new(Self {
            path,
            map: RwLock::new(map),
        })
    }

    pub async fn get(&self, login: &str) -> Option<String> {
        self.map.read().await.get(&login.to_lowercase()).cloned()
    }

    pub async fn insert(&self, login: &str, id: String) {
        {
            let mut map = self.map.write().await;
            map.insert(login.to_lowercase(), id);
        }
        self.persist_best_effort().await;
    }

    async fn persist_best_effort(&self) {
        let snapshot = self.map.read().await.clone();
        let Ok(bytes) = serde_json::to_vec_pretty(&snapshot) else {
            return;
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }
        if let Err(e) = tokio::fs::write(&self.path, bytes).await {
            warn!(error = %e, "failed to persist broadcaster cache (best-effort)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let cache = BroadcasterCache::load("/nonexistent/path/cache.json").await;
        assert_eq!(cache.get("foo").await, None);
    }

    #[tokio::test]
    async fn insert_then_get_is_case_insensitive() {
        let mut p = std::env::temp_dir();
        p.push(format!("bcache-test-{}.json", std::process::id()));
        let cache = BroadcasterCache::load(&p).await;
        cache.insert("FooBar", "12345".into()).await;
        assert_eq!(cache.get("foobar").await.as_deref(), Some("12345"));
        let _ = std::fs::remove_file(&p);
    }
}
