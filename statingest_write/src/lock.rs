//! A sharded table of per-key exclusive locks.
//!
//! Keys are mapped to a fixed number of shards with a jump consistent hash over SipHash-1-3, so
//! memory is bounded by the number of keys currently held, and two different keys only ever
//! contend on the short critical section of their shard's set, never on each other's lock.

use std::{
    fmt::Debug,
    hash::{Hash, Hasher},
    num::NonZeroUsize,
};

use hashbrown::HashSet;
use parking_lot::Mutex;
use siphasher::sip::SipHasher13;
use tokio::sync::Notify;

/// Per-key exclusive locks, see the [module docs](self).
#[derive(Debug)]
pub struct KeyLockTable<K> {
    hasher: SipHasher13,
    shards: Vec<Shard<K>>,
}

#[derive(Debug)]
struct Shard<K> {
    held: Mutex<HashSet<K>>,
    released: Notify,
}

impl<K> KeyLockTable<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync,
{
    pub fn new(num_shards: NonZeroUsize) -> Self {
        // Fixed key so a given key always maps to the same shard across restarts.
        let key = [
            0x2f, 0x91, 0x0c, 0x7a, 0x55, 0xe3, 0x18, 0xb4, 0x6e, 0x03, 0xd7, 0x49, 0xa1, 0x8c,
            0x3b, 0xf0,
        ];
        let shards = (0..num_shards.get())
            .map(|_| Shard {
                held: Mutex::new(HashSet::new()),
                released: Notify::new(),
            })
            .collect();

        Self {
            hasher: SipHasher13::new_with_key(&key),
            shards,
        }
    }

    /// Take the lock for `key` if no one else holds it.
    ///
    /// Returns `None` immediately when the key is already locked.
    pub fn try_lock(&self, key: &K) -> Option<KeyGuard<'_, K>> {
        let shard = self.shard(key);
        shard
            .held
            .lock()
            .insert(key.clone())
            .then(|| KeyGuard::new(shard, key.clone()))
    }

    /// Wait until the lock for `key` can be taken.
    pub async fn lock(&self, key: &K) -> KeyGuard<'_, K> {
        let shard = self.shard(key);
        loop {
            // Register interest before checking so a release between the check and the await
            // is not missed.
            let notified = shard.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if shard.held.lock().insert(key.clone()) {
                return KeyGuard::new(shard, key.clone());
            }
            notified.await;
        }
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.shard(key).held.lock().contains(key)
    }

    /// Number of keys currently locked across all shards.
    pub fn held(&self) -> usize {
        self.shards.iter().map(|s| s.held.lock().len()).sum()
    }

    fn shard(&self, key: &K) -> &Shard<K> {
        &self.shards[self.shard_index(key)]
    }

    /// Jump consistent hash of `key` onto `0..shards.len()`.
    ///
    /// See <https://arxiv.org/ftp/arxiv/papers/1406/1406.2294.pdf>
    fn shard_index(&self, key: &K) -> usize {
        let mut state = self.hasher;
        key.hash(&mut state);
        let mut key = state.finish();

        let mut b = -1_i64;
        let mut j = 0_i64;
        while j < self.shards.len() as i64 {
            b = j;
            key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
            j = ((b.wrapping_add(1) as f64) * (((1u64 << 31) as f64) / (((key >> 33) + 1) as f64)))
                as i64
        }

        // num_shards is non-zero, so the loop ran at least once
        b as usize
    }
}

/// Holds the lock for one key; dropping it releases the lock and wakes waiters on the shard.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct KeyGuard<'a, K>
where
    K: Hash + Eq,
{
    shard: &'a Shard<K>,
    key: K,
}

impl<'a, K> KeyGuard<'a, K>
where
    K: Hash + Eq,
{
    fn new(shard: &'a Shard<K>, key: K) -> Self {
        Self { shard, key }
    }
}

impl<K> Drop for KeyGuard<'_, K>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        self.shard.held.lock().remove(&self.key);
        self.shard.released.notify_waiters();
    }
}
