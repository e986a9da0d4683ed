//! Bounded, TTL-limited cache of signed retrieval links.
//!
//! Entries expire after a TTL that is strictly shorter than the validity of
//! the links themselves, and the least recently used entry is evicted when
//! the cache is full. All operations take one short `parking_lot` lock and
//! never hold it across an await point.
//!
//! The cache only speeds up re-issuing links that were already authorized;
//! it is not an authorization check.

use crate::{models::object::ObjectKey, services::error_translator::PipelineError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::{Duration, Instant},
};
use tracing::debug;

/// A signed link and the moment the link itself stops working.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedLink {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Marks the cache state at the start of a miss.
///
/// A fill started before an invalidation of the same key must not land
/// afterwards, so [`UrlCache::insert`] drops links whose ticket predates the
/// latest invalidation of that key. Invalidations of other keys do not
/// affect it.
#[derive(Clone, Copy, Debug)]
pub struct FillTicket(u64);

#[derive(Debug)]
struct Entry {
    link: CachedLink,
    stale_at: Instant,
    recency: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<ObjectKey, Entry>,
    /// recency tick -> key, oldest first
    order: BTreeMap<u64, ObjectKey>,
    clock: u64,
    /// bumped by every invalidation; tickets record its value
    generation: u64,
    /// key -> generation of its latest invalidation
    tombstones: HashMap<ObjectKey, u64>,
    /// tombstones oldest first; may hold superseded generations
    tombstone_order: VecDeque<(u64, ObjectKey)>,
    /// tickets taken before this generation may have lost their tombstone
    horizon: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.recency);
        Some(entry)
    }

    fn bury(&mut self, key: &ObjectKey, limit: usize) {
        self.generation += 1;
        let generation = self.generation;
        self.tombstones.insert(key.clone(), generation);
        self.tombstone_order.push_back((generation, key.clone()));

        while self.tombstone_order.len() > limit {
            let Some((generation, key)) = self.tombstone_order.pop_front() else {
                break;
            };
            if self.tombstones.get(&key) == Some(&generation) {
                self.tombstones.remove(&key);
                self.horizon = self.horizon.max(generation);
            }
        }
    }

    /// Whether `key` may have been invalidated after `ticket` was taken.
    fn buried_since(&self, key: &ObjectKey, ticket: FillTicket) -> bool {
        ticket.0 < self.horizon
            || self
                .tombstones
                .get(key)
                .is_some_and(|&generation| generation > ticket.0)
    }

    fn evict_oldest(&mut self) -> bool {
        match self.order.pop_first() {
            Some((_, key)) => {
                self.entries.remove(&key);
                debug!(%key, "evicted least recently used link");
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
pub struct UrlCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl UrlCache {
    /// Create a cache holding at most `capacity` links for `ttl` each.
    ///
    /// Fails unless `ttl < link_validity`, so a cached link is never served
    /// past the point where it may already have expired.
    pub fn new(capacity: usize, ttl: Duration, link_validity: Duration) -> Result<Self, PipelineError> {
        if capacity == 0 {
            return Err(PipelineError::configuration("url cache capacity must be positive"));
        }
        if ttl >= link_validity {
            return Err(PipelineError::configuration(
                "url cache ttl must be shorter than signed link validity",
            ));
        }
        Ok(Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            ttl,
        })
    }

    /// Fresh entry for `key`, if any. Expired entries are dropped on sight.
    pub fn get(&self, key: &ObjectKey, now: Instant) -> Option<CachedLink> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let stale_at = inner.entries.get(key)?.stale_at;
        if now >= stale_at {
            inner.remove(key);
            return None;
        }

        let recency = inner.tick();
        let entry = inner.entries.get_mut(key)?;
        let previous = std::mem::replace(&mut entry.recency, recency);
        let link = entry.link.clone();
        inner.order.remove(&previous);
        inner.order.insert(recency, key.clone());
        Some(link)
    }

    /// Take a ticket before fetching a link for a miss.
    pub fn ticket(&self) -> FillTicket {
        FillTicket(self.inner.lock().generation)
    }

    /// Store `link` for `key`. Returns `false` when `key` was invalidated
    /// since `ticket` was taken, in which case nothing is stored.
    pub fn insert(&self, key: ObjectKey, link: CachedLink, ticket: FillTicket, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if inner.buried_since(&key, ticket) {
            return false;
        }

        inner.remove(&key);
        while inner.entries.len() >= self.capacity && inner.evict_oldest() {}

        let recency = inner.tick();
        inner.order.insert(recency, key.clone());
        inner.entries.insert(
            key,
            Entry {
                link,
                stale_at: now + self.ttl,
                recency,
            },
        );
        true
    }

    /// Drop the entry for `key`, expired or not. Absent keys are a no-op.
    pub fn invalidate(&self, key: &ObjectKey) -> bool {
        let mut inner = self.inner.lock();
        inner.bury(key, self.capacity);
        inner.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
