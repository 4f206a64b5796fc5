//! Token masks: which vocabulary entries keep the automaton alive.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::debug;

use crate::automaton::{PushdownAutomaton, State, Step};
use crate::bitmask;
use crate::vocab::Vocabulary;

/// An immutable token bitmask, cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMask {
    words: Arc<[u32]>,
}

impl TokenMask {
    /// A mask that allows nothing.
    pub fn empty(vocab_size: usize) -> Self {
        Self {
            words: bitmask::empty_bitmask(vocab_size).into(),
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn is_allowed(&self, token: u32) -> bool {
        bitmask::get_bit(&self.words, token as usize)
    }

    pub fn count_allowed(&self) -> usize {
        bitmask::count_allowed(&self.words)
    }

    pub fn allowed_ids(&self) -> Vec<u32> {
        bitmask::allowed_ids(&self.words).collect()
    }

    /// Bytes a memoized copy of this mask costs, its state key included.
    pub fn memory_size(&self) -> usize {
        self.words.len() * 4 + std::mem::size_of::<State>() + std::mem::size_of::<Self>()
    }

    /// Copy into a host buffer of at least `bitmask_size(vocab_size)` words.
    pub fn copy_to(&self, out: &mut [u32]) {
        let n = self.words.len().min(out.len());
        out[..n].copy_from_slice(&self.words[..n]);
        out[n..].fill(0);
    }
}

/// Computes masks by walking the byte-sorted vocabulary.
///
/// Neighbouring tokens share prefixes, so the automaton state after each
/// prefix byte is kept on a stack and reused. When a byte rejects, every
/// following token with the same failing prefix is skipped without
/// stepping; `shared_prefix` tells how far that run extends.
#[derive(Clone, Copy)]
pub struct MaskEngine<'a> {
    automaton: &'a PushdownAutomaton,
    vocab: &'a Vocabulary,
}

impl<'a> MaskEngine<'a> {
    pub fn new(automaton: &'a PushdownAutomaton, vocab: &'a Vocabulary) -> Self {
        Self { automaton, vocab }
    }

    pub fn compute_mask(&self, state: &State) -> TokenMask {
        self.compute(state, false)
    }

    /// Like [`compute_mask`](Self::compute_mask), but a token is also
    /// allowed when a proper prefix of it reaches an accepting state. The
    /// bytes after that prefix are not checked: the match is over and they
    /// belong to whatever follows it.
    pub fn compute_exit_mask(&self, state: &State) -> TokenMask {
        self.compute(state, true)
    }

    fn compute(&self, state: &State, exit: bool) -> TokenMask {
        let mut words = bitmask::empty_bitmask(self.vocab.vocab_size());
        self.fill(state, &mut words, exit);
        TokenMask {
            words: words.into(),
        }
    }

    fn fill(&self, state: &State, words: &mut [u32], exit: bool) {
        if state.is_accepting() {
            for &id in self.vocab.stop_token_ids() {
                bitmask::set_bit(words, id as usize);
            }
        }
        if !state.can_continue() {
            return;
        }

        let sorted = self.vocab.sorted_ids();
        let shared = self.vocab.shared_prefix();
        // prefix[k] is the state after the first k bytes of the current
        // token.
        let mut prefix: Vec<State> = Vec::with_capacity(32);
        prefix.push(state.clone());

        let mut i = 0;
        while i < sorted.len() {
            let id = sorted[i];
            let bytes = self.vocab.token_bytes(id).unwrap_or_default();
            prefix.truncate((shared[i] as usize + 1).min(prefix.len()));

            let mut walk = Walk::Consumed;
            if exit {
                // A reused prefix may already have completed the match.
                if let Some(j) = (1..prefix.len()).find(|&j| j < bytes.len() && prefix[j].is_accepting()) {
                    walk = Walk::Exited(j - 1);
                }
            }
            while walk == Walk::Consumed && prefix.len() <= bytes.len() {
                let k = prefix.len() - 1;
                match self.automaton.step(&prefix[k], bytes[k]) {
                    Step::Next(next) => {
                        let exits = exit && k + 1 < bytes.len() && next.is_accepting();
                        prefix.push(next);
                        if exits {
                            walk = Walk::Exited(k);
                        }
                    }
                    Step::Rejected => walk = Walk::Rejected(k),
                }
            }

            bitmask::set_bit(words, id as usize);
            i += 1;
            match walk {
                Walk::Consumed => {}
                Walk::Rejected(k) => {
                    bitmask::clear_bit(words, id as usize);
                    // Everything after i sharing bytes[..=k] fails the same way.
                    while i < sorted.len() && shared[i] as usize > k {
                        i += 1;
                    }
                }
                Walk::Exited(k) => {
                    // Everything after i sharing bytes[..=k] completes there too.
                    while i < sorted.len() && shared[i] as usize > k {
                        bitmask::set_bit(words, sorted[i] as usize);
                        i += 1;
                    }
                }
            }
        }
    }
}

/// How far a token's bytes got from the starting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Walk {
    /// Every byte was accepted.
    Consumed,
    /// Byte `k` was rejected.
    Rejected(usize),
    /// The match completed after byte `k`, before the token ended.
    Exited(usize),
}

/// Byte budget shared by the mask memos of every grammar in one cache,
/// and by the cache's own entries.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: usize,
    used: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Take `bytes` if they fit under the limit.
    pub fn try_reserve(&self, bytes: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.limit)
            })
            .is_ok()
    }

    /// Take `bytes` unconditionally; the caller has made room.
    pub fn charge(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn release(&self, bytes: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| Some(used.saturating_sub(bytes)));
    }
}

/// Bounded per-grammar memo of `state → mask`.
///
/// Besides its entry count, a memo may draw on a [`MemoryBudget`]: a mask
/// that does not fit is still returned, just not kept. A retired memo keeps
/// nothing and has given its bytes back.
pub struct MaskCache {
    entries: Mutex<LruCache<State, TokenMask>>,
    budget: Option<Arc<MemoryBudget>>,
    bytes: AtomicUsize,
    retired: AtomicBool,
}

impl MaskCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self::build(capacity, None)
    }

    pub fn with_budget(capacity: NonZeroUsize, budget: Arc<MemoryBudget>) -> Self {
        Self::build(capacity, Some(budget))
    }

    fn build(capacity: NonZeroUsize, budget: Option<Arc<MemoryBudget>>) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            budget,
            bytes: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
        }
    }

    /// Cached mask for `state`, computing it on a miss. The lock is not
    /// held while computing.
    pub fn get_or_compute(&self, state: &State, compute: impl FnOnce() -> TokenMask) -> TokenMask {
        if let Some(hit) = self.lock().get(state) {
            return hit.clone();
        }
        let mask = compute();
        if self.retired.load(Ordering::Acquire) {
            return mask;
        }
        let size = mask.memory_size();
        if let Some(budget) = &self.budget {
            if !budget.try_reserve(size) {
                debug!(bytes = size, used = budget.used(), "mask memo over budget, not kept");
                return mask;
            }
        }
        self.bytes.fetch_add(size, Ordering::AcqRel);
        let displaced = self.lock().push(state.clone(), mask.clone());
        if let Some((_, old)) = displaced {
            self.give_back(old.memory_size());
        }
        if self.retired.load(Ordering::Acquire) {
            // Retired while this mask was being stored.
            self.retire();
        }
        mask
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by the memoized masks.
    pub fn memory_size(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    /// Drop every mask and stop memoizing.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.lock().clear();
        self.give_back(self.bytes.swap(0, Ordering::AcqRel));
    }

    fn give_back(&self, size: usize) {
        let _ = self
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| Some(b.saturating_sub(size)));
        if let Some(budget) = &self.budget {
            budget.release(size);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<State, TokenMask>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for MaskCache {
    fn drop(&mut self) {
        if let Some(budget) = &self.budget {
            budget.release(*self.bytes.get_mut());
        }
    }
}

impl std::fmt::Debug for MaskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskCache")
            .field("len", &self.len())
            .field("bytes", &self.memory_size())
            .finish()
    }
}
