//! Process-wide TTL caches for expensive instance-manager reads.
//!
//! Each concern gets its own cache; lookups that can meaningfully fail
//! also get a separate negative cache with a shorter TTL so transient
//! failures recover quickly. `moka`'s `try_get_with` collapses concurrent
//! misses for one key into a single upstream call.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::incus::api::{Instance, InstanceState};
use crate::instance_user::InstanceUser;

/// TTL for cached instance snapshots.
const INSTANCE_TTL: Duration = Duration::from_secs(60);
/// TTL for cached instance state (addresses change on restart).
const STATE_TTL: Duration = Duration::from_secs(30);
/// TTL for resolved instance users.
const USER_TTL: Duration = Duration::from_secs(5 * 60);
/// TTL for failed user lookups.
const USER_NEGATIVE_TTL: Duration = Duration::from_secs(30);
/// TTL for the positive-only file-exists-with-hash cache.
const FILE_EXISTS_TTL: Duration = Duration::from_secs(20 * 60);
/// TTL for validated logins.
const LOGIN_VALID_TTL: Duration = Duration::from_secs(10 * 60);
/// TTL for rejected logins; short so probing does not lock users out.
const LOGIN_INVALID_TTL: Duration = Duration::from_secs(60);

const CAPACITY: u64 = 4096;

/// The shared cache set. Cheap to clone (all inner caches are handles).
#[derive(Clone)]
pub struct Caches {
    pub instances: Cache<String, Arc<Instance>>,
    pub states: Cache<String, Arc<InstanceState>>,
    pub users: Cache<String, Arc<InstanceUser>>,
    pub users_negative: Cache<String, ()>,
    pub file_exists: Cache<String, ()>,
    pub login_valid: Cache<String, ()>,
    pub login_invalid: Cache<String, ()>,
}

impl Caches {
    pub fn new() -> Self {
        fn build<V: Clone + Send + Sync + 'static>(ttl: Duration) -> Cache<String, V> {
            Cache::builder()
                .max_capacity(CAPACITY)
                .time_to_live(ttl)
                .build()
        }
        Self {
            instances: build(INSTANCE_TTL),
            states: build(STATE_TTL),
            users: build(USER_TTL),
            users_negative: build(USER_NEGATIVE_TTL),
            file_exists: build(FILE_EXISTS_TTL),
            login_valid: build(LOGIN_VALID_TTL),
            login_invalid: build(LOGIN_INVALID_TTL),
        }
    }

    /// Cache key for an instance-scoped entry.
    pub fn instance_key(project: &str, instance: &str) -> String {
        format!("{project}/{instance}")
    }

    /// Cache key for a user inside an instance.
    pub fn user_key(project: &str, instance: &str, user: &str) -> String {
        format!("{project}/{instance}/{user}")
    }

    /// Cache key for a file identified by path and content hash.
    pub fn file_key(project: &str, instance: &str, path: &str, md5sum: &str) -> String {
        format!("{project}/{instance}/{path}:{md5sum}")
    }

    /// Drop instance-scoped entries after a mutation (create, device edit).
    pub async fn invalidate_instance(&self, project: &str, instance: &str) {
        let key = Self::instance_key(project, instance);
        self.instances.invalidate(&key).await;
        self.states.invalidate(&key).await;
    }
}

impl Default for Caches {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_fully_qualified() {
        assert_eq!(Caches::instance_key("default", "web"), "default/web");
        assert_eq!(Caches::user_key("p", "i", "dev"), "p/i/dev");
        assert_eq!(
            Caches::file_key("p", "i", "/opt/bin", "d41d8cd9"),
            "p/i//opt/bin:d41d8cd9"
        );
    }

    #[tokio::test]
    async fn negative_entries_are_separate() {
        let caches = Caches::new();
        let key = Caches::user_key("p", "i", "ghost");
        caches.users_negative.insert(key.clone(), ()).await;
        assert!(caches.users.get(&key).await.is_none());
        assert!(caches.users_negative.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn invalidate_instance_leaves_other_caches_alone() {
        let caches = Caches::new();
        let key = Caches::instance_key("p", "i");
        caches.file_exists.insert(key.clone(), ()).await;
        caches.login_valid.insert(key.clone(), ()).await;
        caches.invalidate_instance("p", "i").await;
        assert!(caches.file_exists.get(&key).await.is_some());
        assert!(caches.login_valid.get(&key).await.is_some());
    }
}
