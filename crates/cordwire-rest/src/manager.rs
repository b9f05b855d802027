//! Rate-limit bucket registry
//!
//! [`RateLimitManager`] maps every [`RateLimitKey`] to the [`Bucket`] that
//! currently governs it and owns the single global bucket.
//!
//! Keys start out with a bucket of their own. When a response reveals the
//! server-side bucket hash, the bucket is re-registered under that hash; if
//! another key already reported the same hash, the two buckets are
//! consolidated so both keys share one queue and one set of counters from
//! then on.
//!
//! ## Layout
//!
//! ```text
//! proxy:   RateLimitKey ──► BucketId ──► buckets: Arc<Bucket>
//!            GET:/a  ─┐
//!                     ├──► Hash("abc") ──► Bucket
//!            GET:/b  ─┘
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
    time::Duration,
};

use cordwire_core::{
    clock::{Clock, SystemClock},
    config::RestConfig,
};
use tracing::{debug, info};

use crate::{bucket::Bucket, route::RateLimitKey};

/// Identity under which a bucket is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BucketId {
    /// Not yet tied to a server hash: the key it was created for.
    Key(RateLimitKey),
    /// Server-assigned bucket hash.
    Hash(String),
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketId::Key(key) => write!(f, "key {key}"),
            BucketId::Hash(hash) => write!(f, "hash {hash}"),
        }
    }
}

#[derive(Debug, Default)]
struct Maps {
    proxy: HashMap<RateLimitKey, BucketId>,
    buckets: HashMap<BucketId, Arc<Bucket>>,
}

impl Maps {
    fn lookup(&self, key: &RateLimitKey) -> Option<Arc<Bucket>> {
        self.proxy
            .get(key)
            .and_then(|id| self.buckets.get(id))
            .cloned()
    }

    /// Points every key that resolves to `from` at `to`.
    fn repoint(&mut self, from: &BucketId, to: &BucketId) -> usize {
        let mut moved = 0;
        for id in self.proxy.values_mut().filter(|id| *id == from) {
            *id = to.clone();
            moved += 1;
        }
        moved
    }
}

/// Registry of rate-limit buckets, one per client.
///
/// Always handled as `Arc<RateLimitManager>`: buckets keep a weak handle on
/// it to report discovered hashes.
pub struct RateLimitManager {
    maps: RwLock<Maps>,
    global: Arc<Bucket>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    stale_grace: Duration,
    this: Weak<RateLimitManager>,
}

impl std::fmt::Debug for RateLimitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitManager")
            .field("keys", &self.key_count())
            .field("buckets", &self.bucket_count())
            .field("global", &self.global)
            .finish()
    }
}

impl RateLimitManager {
    /// Creates a manager driven by the system clock.
    pub fn new(config: &RestConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a manager reading wall-clock time from `clock`.
    pub fn with_clock(config: &RestConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let poll_interval = Duration::from_millis(config.poll_interval_ms.max(1));
        let stale_grace = Duration::from_secs(config.stale_bucket_grace_secs);

        Arc::new_cyclic(|this| Self {
            maps: RwLock::new(Maps::default()),
            global: Arc::new(Bucket::new_global(
                this.clone(),
                Arc::clone(&clock),
                poll_interval,
            )),
            clock,
            poll_interval,
            stale_grace,
            this: this.clone(),
        })
    }

    /// The bucket currently governing `key`, created on first use.
    pub fn bucket(&self, key: &RateLimitKey) -> Arc<Bucket> {
        if let Some(bucket) = self.read().lookup(key) {
            return bucket;
        }

        let mut maps = self.write();
        if let Some(bucket) = maps.lookup(key) {
            return bucket;
        }

        let bucket = Arc::new(Bucket::new(
            key.clone(),
            Arc::clone(&self.global),
            self.this.clone(),
            Arc::clone(&self.clock),
            self.poll_interval,
        ));
        let id = BucketId::Key(key.clone());
        maps.proxy.insert(key.clone(), id.clone());
        maps.buckets.insert(id, Arc::clone(&bucket));
        debug!(key = %key, "Created bucket");
        bucket
    }

    /// The global bucket. It is never consolidated.
    pub fn global(&self) -> Arc<Bucket> {
        Arc::clone(&self.global)
    }

    /// Number of keys seen so far.
    pub fn key_count(&self) -> usize {
        self.read().proxy.len()
    }

    /// Number of registered route buckets, including superseded ones still
    /// inside their grace period. The global bucket is not counted.
    pub fn bucket_count(&self) -> usize {
        self.read().buckets.len()
    }

    /// Records that `key`'s bucket belongs to the server bucket `hash`.
    ///
    /// The first key to report a hash has its bucket re-registered under it.
    /// A later key reporting the same hash is consolidated into the existing
    /// bucket: that bucket takes over the reporter's counters when their
    /// reset is later, every key of the reporter is repointed, and the
    /// reporter's entry is dropped once the grace period has passed.
    pub fn report_hash(&self, key: &RateLimitKey, hash: &str) {
        let mut maps = self.write();

        let reporter_id = maps
            .proxy
            .get(key)
            .cloned()
            .unwrap_or_else(|| BucketId::Key(key.clone()));
        let hash_id = BucketId::Hash(hash.to_string());
        if reporter_id == hash_id {
            return;
        }
        let Some(reporter) = maps.buckets.get(&reporter_id).cloned() else {
            return;
        };

        match maps.buckets.get(&hash_id).cloned() {
            None => {
                maps.buckets.remove(&reporter_id);
                maps.buckets.insert(hash_id.clone(), reporter);
                maps.repoint(&reporter_id, &hash_id);
                debug!(key = %key, bucket = hash, "Bucket hash discovered");
            }
            Some(holder) if Arc::ptr_eq(&holder, &reporter) => {}
            Some(holder) => {
                holder.absorb(&reporter);
                let moved = maps.repoint(&reporter_id, &hash_id);
                info!(
                    key = %key,
                    bucket = hash,
                    from = %reporter_id,
                    keys = moved,
                    "Consolidated rate-limit buckets"
                );
                drop(maps);
                self.retire(reporter_id, &reporter);
            }
        }
    }

    /// Removes a superseded bucket entry once the grace period has passed,
    /// or immediately when no tokio runtime is available.
    fn retire(&self, id: BucketId, bucket: &Arc<Bucket>) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) if !self.stale_grace.is_zero() => handle,
            _ => {
                self.remove_stale(&id, bucket);
                return;
            }
        };

        let manager = self.this.clone();
        let bucket = Arc::downgrade(bucket);
        let grace = self.stale_grace;
        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            if let (Some(manager), Some(bucket)) = (manager.upgrade(), bucket.upgrade()) {
                manager.remove_stale(&id, &bucket);
            }
        });
    }

    fn remove_stale(&self, id: &BucketId, bucket: &Arc<Bucket>) {
        let mut maps = self.write();
        let still_ours = maps
            .buckets
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, bucket));
        let referenced = maps.proxy.values().any(|proxied| proxied == id);
        if still_ours && !referenced {
            maps.buckets.remove(id);
            debug!(bucket = %id, "Removed superseded bucket");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.maps.write().unwrap_or_else(PoisonError::into_inner)
    }
}
