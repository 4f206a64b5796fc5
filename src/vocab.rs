//! Byte-level view of a tokenizer vocabulary.
//!
//! Tokens are kept as the exact bytes they produce, never as lossy
//! strings: a byte-fallback token such as `<0xE2>` is the single byte
//! `0xE2`, which is half of a UTF-8 character and must stay that way for
//! partial-character tokens to be matched correctly.
//!
//! Text tokens are also sorted by bytes. For the mask walk,
//! `shared_prefix[i]` counts the bytes sorted token `i` has in common with
//! the one before it.

use std::hash::{Hash, Hasher};

use anyhow::{bail, Result};
use rustc_hash::FxHasher;

/// How the tokenizer spells token bytes in its vocabulary file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VocabType {
    /// Token strings are the bytes themselves.
    Raw,
    /// SentencePiece style: `<0xAB>` is byte `0xAB`, `▁` is a space.
    ByteFallback,
    /// GPT-2 byte-level BPE: every byte is mapped to a printable character.
    ByteLevel,
}

/// An immutable vocabulary, shared by every grammar compiled against it.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: Vec<Box<[u8]>>,
    vocab_type: VocabType,
    vocab_size: usize,
    special: Vec<u32>,
    stop: Vec<u32>,
    sorted: Vec<u32>,
    shared_prefix: Vec<u32>,
    fingerprint: u64,
}

impl Vocabulary {
    /// Decode `encoded` with `vocab_type`.
    ///
    /// `vocab_size` may exceed `encoded.len()` for padded embedding tables;
    /// the padding ids are never allowed. Empty tokens count as special.
    pub fn new(encoded: &[String], vocab_type: VocabType, vocab_size: Option<usize>) -> Result<Self> {
        let tokens = encoded
            .iter()
            .map(|tok| decode_token(tok, vocab_type))
            .collect();
        Self::build(tokens, vocab_type, vocab_size)
    }

    /// Build from token bytes directly.
    pub fn from_bytes(tokens: Vec<Vec<u8>>, vocab_size: Option<usize>) -> Result<Self> {
        Self::build(
            tokens.into_iter().map(Vec::into_boxed_slice).collect(),
            VocabType::Raw,
            vocab_size,
        )
    }

    fn build(tokens: Vec<Box<[u8]>>, vocab_type: VocabType, vocab_size: Option<usize>) -> Result<Self> {
        let vocab_size = vocab_size.unwrap_or(tokens.len());
        if vocab_size < tokens.len() {
            bail!(
                "vocab_size ({vocab_size}) must be >= the number of tokens ({})",
                tokens.len()
            );
        }
        let special = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_empty())
            .map(|(i, _)| i as u32)
            .collect();
        let mut vocab = Vocabulary {
            tokens,
            vocab_type,
            vocab_size,
            special,
            stop: Vec::new(),
            sorted: Vec::new(),
            shared_prefix: Vec::new(),
            fingerprint: 0,
        };
        vocab.reindex();
        Ok(vocab)
    }

    /// Mark end-of-sequence tokens. They are allowed exactly when the
    /// constraint is satisfied.
    pub fn with_stop_tokens(mut self, ids: &[u32]) -> Result<Self> {
        self.check_ids(ids)?;
        self.stop = normalized_ids(ids);
        self.reindex();
        Ok(self)
    }

    /// Mark control tokens (chat-template markers and the like). They are
    /// never allowed while a constraint is active.
    pub fn with_special_tokens(mut self, ids: &[u32]) -> Result<Self> {
        self.check_ids(ids)?;
        let mut all = self.special.clone();
        all.extend_from_slice(ids);
        self.special = normalized_ids(&all);
        self.reindex();
        Ok(self)
    }

    fn check_ids(&self, ids: &[u32]) -> Result<()> {
        if let Some(&bad) = ids.iter().find(|&&id| id as usize >= self.vocab_size) {
            bail!("token id {bad} is outside the vocabulary of {}", self.vocab_size);
        }
        Ok(())
    }

    fn reindex(&mut self) {
        let mut sorted: Vec<u32> = (0..self.tokens.len() as u32)
            .filter(|id| self.special.binary_search(id).is_err() && self.stop.binary_search(id).is_err())
            .collect();
        sorted.sort_by(|&a, &b| self.tokens[a as usize].cmp(&self.tokens[b as usize]).then(a.cmp(&b)));

        let bytes_of = |i: usize| -> &[u8] { &self.tokens[sorted[i] as usize] };
        let shared_prefix: Vec<u32> = (0..sorted.len())
            .map(|i| {
                if i == 0 {
                    return 0;
                }
                let (a, b) = (bytes_of(i - 1), bytes_of(i));
                a.iter().zip(b).take_while(|(x, y)| x == y).count() as u32
            })
            .collect();

        let mut hasher = FxHasher::default();
        self.vocab_size.hash(&mut hasher);
        self.tokens.hash(&mut hasher);
        self.special.hash(&mut hasher);
        self.stop.hash(&mut hasher);
        self.fingerprint = hasher.finish();

        self.sorted = sorted;
        self.shared_prefix = shared_prefix;
    }

    pub fn vocab_type(&self) -> VocabType {
        self.vocab_type
    }

    /// Number of token ids, including padding past the decoded tokens.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Bytes produced by `id`, or `None` for padding and unknown ids.
    pub fn token_bytes(&self, id: u32) -> Option<&[u8]> {
        self.tokens.get(id as usize).map(|b| &**b)
    }

    /// Text token ids in byte order.
    pub fn sorted_ids(&self) -> &[u32] {
        &self.sorted
    }

    pub fn shared_prefix(&self) -> &[u32] {
        &self.shared_prefix
    }

    pub fn special_token_ids(&self) -> &[u32] {
        &self.special
    }

    pub fn stop_token_ids(&self) -> &[u32] {
        &self.stop
    }

    pub fn is_stop(&self, id: u32) -> bool {
        self.stop.binary_search(&id).is_ok()
    }

    pub fn is_special(&self, id: u32) -> bool {
        self.special.binary_search(&id).is_ok() || id as usize >= self.tokens.len()
    }

    /// Stable hash of everything that affects masks; part of the grammar
    /// cache key.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

fn normalized_ids(ids: &[u32]) -> Vec<u32> {
    let mut out = ids.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

fn decode_token(encoded: &str, vocab_type: VocabType) -> Box<[u8]> {
    match vocab_type {
        VocabType::Raw => encoded.as_bytes().into(),
        VocabType::ByteFallback => decode_byte_fallback(encoded),
        VocabType::ByteLevel => decode_byte_level(encoded),
    }
}

fn decode_byte_fallback(encoded: &str) -> Box<[u8]> {
    if let Some(hex) = encoded
        .strip_prefix("<0x")
        .and_then(|rest| rest.strip_suffix('>'))
        .filter(|hex| hex.len() == 2)
    {
        if let Ok(byte) = u8::from_str_radix(hex, 16) {
            return Box::new([byte]);
        }
    }
    encoded.replace('\u{2581}', " ").into_bytes().into_boxed_slice()
}

fn decode_byte_level(encoded: &str) -> Box<[u8]> {
    let mut bytes = Vec::with_capacity(encoded.len());
    for c in encoded.chars() {
        match byte_level_char_to_byte(c as u32) {
            Some(b) => bytes.push(b),
            None => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    bytes.into_boxed_slice()
}

/// Inverse of GPT-2's `bytes_to_unicode`. Printable Latin-1 bytes map to
/// themselves; the 68 remaining bytes are numbered from U+0100 in order.
fn byte_level_char_to_byte(cp: u32) -> Option<u8> {
    match cp {
        0x21..=0x7E | 0xA1..=0xAC | 0xAE..=0xFF => Some(cp as u8),
        0x100..=0x120 => Some((cp - 0x100) as u8),
        0x121..=0x142 => Some((0x7F + (cp - 0x121)) as u8),
        0x143 => Some(0xAD),
        _ => None,
    }
}
