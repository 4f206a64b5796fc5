//! Token bitmask helpers.
//!
//! A mask is a slice of `u32` words, one bit per token id, least
//! significant bit first. A set bit means the token may be sampled. This is
//! the layout hosts copy straight into their logit-masking kernels.

/// Words needed for `vocab_size` tokens.
pub const fn bitmask_size(vocab_size: usize) -> usize {
    vocab_size.div_ceil(32)
}

/// A zeroed mask for `vocab_size` tokens.
pub fn empty_bitmask(vocab_size: usize) -> Vec<u32> {
    vec![0; bitmask_size(vocab_size)]
}

#[inline]
pub fn set_bit(bitmask: &mut [u32], id: usize) {
    bitmask[id >> 5] |= 1 << (id & 31);
}

#[inline]
pub fn clear_bit(bitmask: &mut [u32], id: usize) {
    bitmask[id >> 5] &= !(1 << (id & 31));
}

#[inline]
pub fn get_bit(bitmask: &[u32], id: usize) -> bool {
    bitmask
        .get(id >> 5)
        .is_some_and(|word| word >> (id & 31) & 1 == 1)
}

/// Allow the first `vocab_size` tokens and nothing past them.
pub fn reset_bitmask(bitmask: &mut [u32], vocab_size: usize) {
    let full = vocab_size / 32;
    let rem = vocab_size % 32;
    for (i, word) in bitmask.iter_mut().enumerate() {
        *word = match i.cmp(&full) {
            std::cmp::Ordering::Less => u32::MAX,
            std::cmp::Ordering::Equal if rem > 0 => (1u32 << rem) - 1,
            _ => 0,
        };
    }
}

pub fn clear_bitmask(bitmask: &mut [u32]) {
    bitmask.fill(0);
}

/// Whether every one of the first `vocab_size` tokens is allowed.
pub fn is_bitmask_all_ones(bitmask: &[u32], vocab_size: usize) -> bool {
    let full = vocab_size / 32;
    let rem = vocab_size % 32;
    if bitmask.len() < bitmask_size(vocab_size) {
        return false;
    }
    if bitmask[..full].iter().any(|&w| w != u32::MAX) {
        return false;
    }
    rem == 0 || {
        let tail = (1u32 << rem) - 1;
        bitmask[full] & tail == tail
    }
}

/// Number of allowed tokens.
pub fn count_allowed(bitmask: &[u32]) -> usize {
    bitmask.iter().map(|w| w.count_ones() as usize).sum()
}

/// Allowed token ids, ascending.
pub fn allowed_ids(bitmask: &[u32]) -> impl Iterator<Item = u32> + '_ {
    bitmask.iter().enumerate().flat_map(|(i, &word)| {
        (0..32u32)
            .filter(move |bit| word >> bit & 1 == 1)
            .map(move |bit| (i as u32) * 32 + bit)
    })
}

/// Push the logits of disallowed tokens to `-inf`. Logits past the mask
/// are treated as disallowed.
pub fn apply_token_bitmask_inplace(logits: &mut [f32], bitmask: &[u32]) {
    for (id, logit) in logits.iter_mut().enumerate() {
        if !get_bit(bitmask, id) {
            *logit = f32::NEG_INFINITY;
        }
    }
}
