//! Process-wide cache of compiled constraints.
//!
//! Entries are keyed by the canonical constraint text, the vocabulary
//! fingerprint and the schema options, and are bounded by a memory budget
//! with LRU eviction. The budget covers each entry's static tables and the
//! masks its grammars memoize; masks that would overflow it are computed
//! but not kept. Lookups take the read lock and `peek`; the recency
//! bump is attempted with `try_write` so concurrent readers never wait on
//! each other. Identical compiles that race are collapsed into one through
//! a per-key single-flight cell.

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, OnceLock, RwLock};

use lru::LruCache;
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compiled::CompiledConstraint;
use crate::constraint::ConstraintSpec;
use crate::error::Result;
use crate::json_schema::JsonSchemaOptions;
use crate::mask::MemoryBudget;
use crate::vocab::Vocabulary;

/// Cache sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on the bytes held by cached constraints, memoized masks
    /// included.
    pub memory_budget_bytes: usize,
    /// Masks memoized per compiled grammar.
    pub mask_cache_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 512 * 1024 * 1024,
            mask_cache_entries: 4096,
        }
    }
}

/// An entry that does not fit even in an empty cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("entry of {needed} bytes exceeds the cache budget of {budget} bytes")]
pub struct CacheExhausted {
    pub needed: usize,
    pub budget: usize,
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    /// Static tables of cached constraints.
    pub bytes: usize,
    /// Masks memoized by cached constraints.
    pub mask_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub compilations: u64,
}

/// Key with its hash computed once, so the in-flight map and the LRU do not
/// rehash long schema texts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    spec: String,
    vocab: u64,
    options: JsonSchemaOptions,
    hash: u64,
}

impl CacheKey {
    pub fn new(spec: &ConstraintSpec, vocab: &Vocabulary, options: &JsonSchemaOptions) -> Result<Self> {
        let spec = spec.cache_key()?;
        let mut hasher = FxHasher::default();
        spec.hash(&mut hasher);
        vocab.fingerprint().hash(&mut hasher);
        options.hash(&mut hasher);
        Ok(Self {
            spec,
            vocab: vocab.fingerprint(),
            options: options.clone(),
            hash: hasher.finish(),
        })
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

struct Entry {
    value: Arc<CompiledConstraint>,
    bytes: usize,
}

type Flight = Arc<OnceLock<Result<Arc<CompiledConstraint>>>>;

pub struct GrammarCache {
    entries: RwLock<LruCache<CacheKey, Entry>>,
    in_flight: Mutex<FxHashMap<CacheKey, Flight>>,
    /// Static bytes and memoized masks of every entry.
    ledger: Arc<MemoryBudget>,
    mask_entries: NonZeroUsize,
    bytes: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    compilations: AtomicU64,
}

static GLOBAL: LazyLock<GrammarCache> = LazyLock::new(|| GrammarCache::new(&CacheConfig::default()));

impl GrammarCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::unbounded()),
            in_flight: Mutex::new(FxHashMap::default()),
            ledger: Arc::new(MemoryBudget::new(config.memory_budget_bytes)),
            mask_entries: NonZeroUsize::new(config.mask_cache_entries).unwrap_or(NonZeroUsize::MIN),
            bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            compilations: AtomicU64::new(0),
        }
    }

    /// The process-wide instance, sized with [`CacheConfig::default`].
    pub fn global() -> &'static GrammarCache {
        &GLOBAL
    }

    /// Return the compiled form of `spec`, compiling it at most once per key
    /// even when several threads ask at the same time.
    pub fn get_or_compile(
        &self,
        spec: &ConstraintSpec,
        vocab: &Arc<Vocabulary>,
        options: &JsonSchemaOptions,
    ) -> Result<Arc<CompiledConstraint>> {
        let key = CacheKey::new(spec, vocab, options)?;
        if let Some(hit) = self.lookup(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }

        let flight = {
            let mut in_flight = lock(&self.in_flight);
            // A finished flight inserts before it unregisters, so check again
            // while holding the in-flight lock.
            if let Some(hit) = self.lookup(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }
            Arc::clone(in_flight.entry(key.clone()).or_default())
        };
        self.misses.fetch_add(1, Ordering::Relaxed);

        let result = flight
            .get_or_init(|| {
                self.compilations.fetch_add(1, Ordering::Relaxed);
                let compiled = CompiledConstraint::compile_with_budget(
                    spec,
                    vocab,
                    options,
                    self.mask_entries,
                    Arc::clone(&self.ledger),
                )
                .map(Arc::new);
                if let Ok(value) = &compiled {
                    self.publish(&key, value);
                }
                compiled
            })
            .clone();

        let mut in_flight = lock(&self.in_flight);
        if in_flight.get(&key).is_some_and(|f| Arc::ptr_eq(f, &flight)) {
            in_flight.remove(&key);
        }
        result
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<CompiledConstraint>> {
        let hit = read(&self.entries).peek(key).map(|e| Arc::clone(&e.value))?;
        if let Ok(mut entries) = self.entries.try_write() {
            entries.promote(key);
        }
        Some(hit)
    }

    fn publish(&self, key: &CacheKey, value: &Arc<CompiledConstraint>) {
        let size = value.memory_size();
        let mut entries = write(&self.entries);
        if entries.contains(key) {
            return;
        }
        if let Err(full) = self.make_room(&mut entries, size) {
            warn!(kind = value.kind(), error = %full, "serving compiled constraint uncached");
            value.retire_masks();
            return;
        }
        entries.put(key.clone(), Entry {
            value: Arc::clone(value),
            bytes: size,
        });
        self.ledger.charge(size);
        self.bytes.fetch_add(size, Ordering::Relaxed);
        debug!(kind = value.kind(), bytes = size, "cached compiled constraint");
    }

    /// Evict least recently used entries until `needed` more bytes fit.
    fn make_room(
        &self,
        entries: &mut LruCache<CacheKey, Entry>,
        needed: usize,
    ) -> std::result::Result<(), CacheExhausted> {
        let budget = self.ledger.limit();
        if needed > budget {
            return Err(CacheExhausted { needed, budget });
        }
        while self.ledger.used() + needed > budget {
            let Some((_, evicted)) = entries.pop_lru() else {
                break;
            };
            let masks = evicted.value.mask_memory_size();
            self.release(&evicted);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            info!(
                kind = evicted.value.kind(),
                bytes = evicted.bytes,
                mask_bytes = masks,
                "evicted compiled constraint"
            );
        }
        Ok(())
    }

    /// Give back an entry's bytes. Sessions still holding it keep working
    /// without a mask memo.
    fn release(&self, entry: &Entry) {
        entry.value.retire_masks();
        self.ledger.release(entry.bytes);
        self.bytes.fetch_sub(entry.bytes, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: read(&self.entries).len(),
            bytes: self.bytes.load(Ordering::Relaxed),
            mask_bytes: self.ledger.used().saturating_sub(self.bytes.load(Ordering::Relaxed)),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
        }
    }

    /// Drop every entry. Sessions holding an `Arc` keep theirs alive.
    pub fn clear(&self) {
        let mut entries = write(&self.entries);
        while let Some((_, entry)) = entries.pop_lru() {
            self.release(&entry);
        }
    }
}

impl std::fmt::Debug for GrammarCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrammarCache")
            .field("budget", &self.ledger.limit())
            .field("stats", &self.stats())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}
