//! Lazy per-gateway caches for users and channels.
//!
//! Reads happen on every inbound event, writes only when the platform lookup
//! discovered something new. To keep the ingest path fast, a merge takes the
//! write lock only when it is immediately available; under contention the
//! merge is handed to a detached task and becomes visible a moment later.
//! Overwrites of the same id are idempotent, so deferred merges are safe to
//! replay in any order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::model::{ChannelInfo, User};

#[derive(Default)]
struct CacheInner {
    users: RwLock<HashMap<String, User>>,
    channels: RwLock<HashMap<String, ChannelInfo>>,
}

/// Shared user/channel cache. Cloning is cheap; all clones see one store.
#[derive(Clone, Default)]
pub struct EntityCache {
    inner: Arc<CacheInner>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `ids` into the users already cached and the ids that still need
    /// a platform lookup.
    pub async fn split_users(&self, ids: &[String]) -> (HashMap<String, User>, Vec<String>) {
        let users = self.inner.users.read().await;
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for id in ids {
            match users.get(id) {
                Some(user) => {
                    found.insert(id.clone(), user.clone());
                }
                None => missing.push(id.clone()),
            }
        }
        (found, missing)
    }

    /// Split `ids` into cached channels and ids that still need a lookup.
    pub async fn split_channels(
        &self,
        ids: &[String],
    ) -> (HashMap<String, ChannelInfo>, Vec<String>) {
        let channels = self.inner.channels.read().await;
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for id in ids {
            match channels.get(id) {
                Some(channel) => {
                    found.insert(id.clone(), channel.clone());
                }
                None => missing.push(id.clone()),
            }
        }
        (found, missing)
    }

    pub async fn user(&self, id: &str) -> Option<User> {
        self.inner.users.read().await.get(id).cloned()
    }

    pub async fn channel(&self, id: &str) -> Option<ChannelInfo> {
        self.inner.channels.read().await.get(id).cloned()
    }

    /// Merge resolved users into the cache, deferring under lock contention.
    pub fn merge_users(&self, users: Vec<User>) {
        if users.is_empty() {
            return;
        }
        match self.inner.users.try_write() {
            Ok(mut guard) => {
                for user in users {
                    guard.insert(user.id.clone(), user);
                }
            }
            Err(_) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let mut guard = inner.users.write().await;
                    for user in users {
                        guard.insert(user.id.clone(), user);
                    }
                });
            }
        }
    }

    /// Merge resolved channels into the cache, deferring under contention.
    pub fn merge_channels(&self, channels: Vec<ChannelInfo>) {
        if channels.is_empty() {
            return;
        }
        match self.inner.channels.try_write() {
            Ok(mut guard) => {
                for channel in channels {
                    guard.insert(channel.id.clone(), channel);
                }
            }
            Err(_) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let mut guard = inner.channels.write().await;
                    for channel in channels {
                        guard.insert(channel.id.clone(), channel);
                    }
                });
            }
        }
    }

    /// Case-insensitive display-name lookup over the cached users.
    ///
    /// Duplicated display names resolve to whichever entry the scan sees
    /// last; callers must treat the result as "any matching user".
    pub async fn search_user_name(&self, name: &str) -> Option<User> {
        let wanted = name.to_lowercase();
        let users = self.inner.users.read().await;
        let mut result = None;
        for user in users.values() {
            if user.display_name.to_lowercase() == wanted {
                result = Some(user.clone());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, display_name: &str) -> User {
        User {
            id: id.into(),
            name: display_name.into(),
            display_name: display_name.into(),
            ..User::default()
        }
    }

    #[tokio::test]
    async fn read_after_uncontended_write() {
        let cache = EntityCache::new();
        cache.merge_users(vec![user("U1", "alice")]);
        assert_eq!(cache.user("U1").await.unwrap().display_name, "alice");
    }

    #[tokio::test]
    async fn contended_write_lands_eventually() {
        let cache = EntityCache::new();
        {
            let _read = cache.inner.users.read().await;
            // Write lock unavailable here, so the merge is deferred.
            cache.merge_users(vec![user("U2", "bob")]);
            assert!(cache.user("U2").await.is_none());
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(cache.user("U2").await.unwrap().display_name, "bob");
    }

    #[tokio::test]
    async fn split_reports_missing_ids() {
        let cache = EntityCache::new();
        cache.merge_users(vec![user("U1", "alice")]);
        let ids = vec!["U1".to_string(), "U9".to_string()];
        let (found, missing) = cache.split_users(&ids).await;
        assert!(found.contains_key("U1"));
        assert_eq!(missing, vec!["U9".to_string()]);
    }

    #[tokio::test]
    async fn merge_overwrites_same_id() {
        let cache = EntityCache::new();
        cache.merge_users(vec![user("U1", "alice")]);
        cache.merge_users(vec![user("U1", "alicia")]);
        assert_eq!(cache.user("U1").await.unwrap().display_name, "alicia");
    }

    #[tokio::test]
    async fn search_user_name_is_case_insensitive() {
        let cache = EntityCache::new();
        cache.merge_users(vec![user("U1", "Alice")]);
        assert_eq!(cache.search_user_name("aLiCe").await.unwrap().id, "U1");
        assert!(cache.search_user_name("nobody").await.is_none());
    }

    #[tokio::test]
    async fn channels_cache_round_trip() {
        let cache = EntityCache::new();
        cache.merge_channels(vec![ChannelInfo {
            id: "C1".into(),
            name: "general".into(),
            members: vec!["U1".into()],
        }]);
        let (found, missing) = cache
            .split_channels(&["C1".to_string(), "C2".to_string()])
            .await;
        assert_eq!(found["C1"].name, "general");
        assert_eq!(missing, vec!["C2".to_string()]);
    }
}
