// task_cache.rs - Keyed (session-id) TTL store with manual extension.
// All operations serialize on a single mutex: the map stays small (at most
// a few hundred live sessions), so coarse-grained locking beats sharding.

use crate::error::{DispatchError, Result};
use crate::task::Task;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_TASK_TTL: Duration = Duration::from_secs(15 * 60);

struct Entry {
    expires_at: Instant,
    task: Arc<Task>,
}

pub struct TaskCache {
    base: Mutex<HashMap<String, Entry>>,
    lock_timeout: Duration,
}

impl TaskCache {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            base: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        tokio::time::timeout(self.lock_timeout, self.base.lock())
            .await
            .map_err(|_| DispatchError::LockTimeout(self.lock_timeout))
    }

    pub async fn put(&self, key: &str, task: Arc<Task>, ttl: Duration) -> Result<()> {
        let mut base = self.lock().await?;
        base.insert(
            key.to_string(),
            Entry {
                expires_at: Instant::now() + ttl,
                task,
            },
        );
        Ok(())
    }

    pub async fn try_get(&self, key: &str) -> Result<Option<Arc<Task>>> {
        let mut base = self.lock().await?;
        match base.get(key) {
            Some(entry) if entry.expires_at <= Instant::now() => {
                base.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.task.clone())),
            None => Ok(None),
        }
    }

    /// Extends expiry to now + ttl. Returns whether the key was present.
    pub async fn keep(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut base = self.lock().await?;
        match base.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut base = self.lock().await?;
        Ok(base.remove(key).is_some())
    }

    /// Sweeps all expired entries. Called by workers before picking a new task.
    pub async fn clean(&self) -> Result<usize> {
        let mut base = self.lock().await?;
        let now = Instant::now();
        let expired: Vec<String> = base
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            base.remove(key);
            log::debug!("session {key} expired, data removed");
        }
        Ok(expired.len())
    }

    pub async fn clear(&self) -> Result<()> {
        let mut base = self.lock().await?;
        base.clear();
        Ok(())
    }
}

impl Default for TaskCache {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RenderRequest;
    use proptest::prelude::*;

    fn task(session_id: &str) -> Arc<Task> {
        Arc::new(Task::new(
            "t1".into(),
            RenderRequest {
                session_id: session_id.to_string(),
                render_device: None,
                use_face_correction: None,
                use_stable_diffusion_model: "sd-v1-4".into(),
                use_vae_model: None,
                stream_progress_updates: false,
                stream_image_progress: false,
                num_outputs: 1,
                show_only_filtered_image: false,
                extra: Default::default(),
            },
        ))
    }

    #[tokio::test]
    async fn put_then_get_round_trips_within_ttl() {
        let cache = TaskCache::default();
        let t = task("s1");
        cache.put("s1", t.clone(), Duration::from_secs(60)).await.unwrap();
        let got = cache.try_get("s1").await.unwrap();
        assert!(got.is_some());
        assert_eq!(got.unwrap().task_id, t.task_id);
    }

    #[tokio::test]
    async fn zero_ttl_is_immediately_absent() {
        let cache = TaskCache::default();
        cache.put("s1", task("s1"), Duration::from_secs(0)).await.unwrap();
        // expires_at == now, `<=` comparison treats it as already expired.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(cache.try_get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keep_extends_expiry_past_the_original_ttl() {
        let cache = TaskCache::default();
        cache.put("s1", task("s1"), Duration::from_millis(10)).await.unwrap();
        assert!(cache.keep("s1", Duration::from_secs(60)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.try_get("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn keep_on_missing_key_returns_false() {
        let cache = TaskCache::default();
        assert!(!cache.keep("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn clean_sweeps_only_expired_entries() {
        let cache = TaskCache::default();
        cache.put("fresh", task("fresh"), Duration::from_secs(60)).await.unwrap();
        cache.put("stale", task("stale"), Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.clean().await.unwrap();
        assert!(cache.try_get("fresh").await.unwrap().is_some());
        assert!(cache.try_get("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let cache = TaskCache::default();
        cache.put("a", task("a"), Duration::from_secs(60)).await.unwrap();
        cache.put("b", task("b"), Duration::from_secs(60)).await.unwrap();
        cache.clear().await.unwrap();
        assert!(cache.try_get("a").await.unwrap().is_none());
        assert!(cache.try_get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_a_single_entry() {
        let cache = TaskCache::default();
        cache.put("a", task("a"), Duration::from_secs(60)).await.unwrap();
        assert!(cache.delete("a").await.unwrap());
        assert!(!cache.delete("a").await.unwrap());
    }

    proptest! {
        /// §8 round-trip law: any non-zero ttl put is visible via try_get
        /// immediately afterwards, keyed by an arbitrary session id.
        #[test]
        fn put_is_always_visible_before_its_ttl_elapses(
            key in "[a-zA-Z0-9_-]{1,16}",
            ttl_secs in 1u64..3600,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let cache = TaskCache::default();
                let t = task(&key);
                cache.put(&key, t.clone(), Duration::from_secs(ttl_secs)).await.unwrap();
                let got = cache.try_get(&key).await.unwrap();
                prop_assert!(got.is_some());
                prop_assert_eq!(got.unwrap().task_id.clone(), t.task_id.clone());
                Ok(())
            })?;
        }

        /// §8 invariant: `keep` never shrinks expiry below what `put` set,
        /// for any ttl pair where the kept ttl is the larger one.
        #[test]
        fn keep_with_a_larger_ttl_leaves_the_entry_present_past_the_original_deadline(
            key in "[a-zA-Z0-9_-]{1,16}",
            put_ttl_ms in 1u64..50,
            extra_ms in 50u64..200,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let cache = TaskCache::default();
                cache.put(&key, task(&key), Duration::from_millis(put_ttl_ms)).await.unwrap();
                let kept = cache
                    .keep(&key, Duration::from_millis(put_ttl_ms + extra_ms))
                    .await
                    .unwrap();
                prop_assert!(kept);
                tokio::time::sleep(Duration::from_millis(put_ttl_ms + 1)).await;
                prop_assert!(cache.try_get(&key).await.unwrap().is_some());
                Ok(())
            })?;
        }
    }
}
