//! Per-request matcher session.
//!
//! A [`GrammarMatcher`] walks one compiled grammar token by token. It hands
//! the host a mask before each sampling step and advances on the sampled
//! token. While the host reports a reasoning span the automaton is frozen
//! and every token is allowed; leaving the span resumes exactly where the
//! constrained output stopped.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::automaton::{State, Step};
use crate::bitmask;
use crate::compiled::CompiledGrammar;
use crate::error::DriftFault;
use crate::mask::TokenMask;

/// Where the session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherState {
    /// Constrained generation in progress.
    Active,
    /// End of sequence was signalled in an accepting state.
    Accepted,
    /// A drift fault was recorded; see [`GrammarMatcher::fault`].
    Rejected,
    /// Inside a reasoning span. The automaton is frozen.
    Unconstrained,
}

impl MatcherState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MatcherState::Accepted | MatcherState::Rejected)
    }
}

/// Session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Tokens that can be undone with [`GrammarMatcher::rollback`].
    pub max_rollback: usize,
    /// The request starts inside a reasoning span.
    pub start_in_reasoning: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_rollback: 16,
            start_in_reasoning: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Checkpoint {
    cursor: State,
    phase: MatcherState,
    fault: Option<DriftFault>,
    content_len: usize,
    reasoning_len: usize,
    tokens_len: usize,
}

/// Grammar-guided token matcher for one request.
#[derive(Debug)]
pub struct GrammarMatcher {
    compiled: Arc<CompiledGrammar>,
    cursor: State,
    phase: MatcherState,
    fault: Option<DriftFault>,
    content: Vec<u8>,
    reasoning: Vec<u8>,
    tokens: Vec<u32>,
    history: VecDeque<Checkpoint>,
    config: SessionConfig,
}

impl GrammarMatcher {
    pub fn new(compiled: Arc<CompiledGrammar>, config: SessionConfig) -> Self {
        let cursor = compiled.initial_state();
        let phase = if config.start_in_reasoning {
            MatcherState::Unconstrained
        } else {
            MatcherState::Active
        };
        Self {
            compiled,
            cursor,
            phase,
            fault: None,
            content: Vec::new(),
            reasoning: Vec::new(),
            tokens: Vec::new(),
            history: VecDeque::new(),
            config,
        }
    }

    /// A session whose first tokens belong to a reasoning span.
    pub fn new_in_reasoning(compiled: Arc<CompiledGrammar>, max_rollback: usize) -> Self {
        Self::new(
            compiled,
            SessionConfig {
                max_rollback,
                start_in_reasoning: true,
            },
        )
    }

    pub fn state(&self) -> MatcherState {
        self.phase
    }

    pub fn fault(&self) -> Option<&DriftFault> {
        self.fault.as_ref()
    }

    /// The automaton state; frozen while unconstrained.
    pub fn automaton_state(&self) -> &State {
        &self.cursor
    }

    pub fn compiled(&self) -> &Arc<CompiledGrammar> {
        &self.compiled
    }

    pub fn is_terminated(&self) -> bool {
        self.phase.is_terminal()
    }

    /// The constrained output so far is a complete match.
    pub fn can_terminate(&self) -> bool {
        self.cursor.is_accepting()
    }

    /// Apply one sampled token.
    ///
    /// Inside a reasoning span the token is recorded as reasoning text and
    /// the automaton does not move. Otherwise a stop token ends the session
    /// and any other token must be fully accepted by the automaton. A token
    /// that is not is a [`DriftFault`]: the session moves to `Rejected` and
    /// stays there until rolled back or reset.
    pub fn consume(&mut self, token: u32) -> Result<MatcherState, DriftFault> {
        if self.phase.is_terminal() {
            return Err(DriftFault::Terminated);
        }
        self.checkpoint();
        self.tokens.push(token);

        let vocab = Arc::clone(self.compiled.vocab());
        let Some(bytes) = vocab.token_bytes(token) else {
            return Err(self.drift(DriftFault::UnknownToken(token)));
        };

        if vocab.is_stop(token) {
            return self.finish();
        }
        if self.phase == MatcherState::Unconstrained {
            self.reasoning.extend_from_slice(bytes);
            return Ok(self.phase);
        }
        if vocab.is_special(token) {
            return Err(self.drift(DriftFault::OutOfMask {
                token,
                position: self.content.len(),
            }));
        }

        let mut next = self.cursor.clone();
        for (i, &b) in bytes.iter().enumerate() {
            match self.compiled.automaton().step(&next, b) {
                Step::Next(s) => next = s,
                Step::Rejected => {
                    return Err(self.drift(DriftFault::OutOfMask {
                        token,
                        position: self.content.len() + i,
                    }));
                }
            }
        }
        self.cursor = next;
        self.content.extend_from_slice(bytes);
        Ok(self.phase)
    }

    /// Advance through raw bytes that did not come from a sampled token,
    /// such as a forced jump-forward string. Returns false and leaves the
    /// session untouched if the automaton rejects them.
    pub fn accept_bytes(&mut self, bytes: &[u8]) -> bool {
        if self.phase != MatcherState::Active {
            return false;
        }
        match self.compiled.automaton().step_bytes(&self.cursor, bytes) {
            Step::Next(next) => {
                self.checkpoint();
                self.cursor = next;
                self.content.extend_from_slice(bytes);
                true
            }
            Step::Rejected => false,
        }
    }

    /// Single-byte advance without a rollback checkpoint.
    pub(crate) fn advance_byte(&mut self, byte: u8) -> bool {
        if self.phase != MatcherState::Active {
            return false;
        }
        match self.compiled.automaton().step(&self.cursor, byte) {
            Step::Next(next) => {
                self.cursor = next;
                self.content.push(byte);
                true
            }
            Step::Rejected => false,
        }
    }

    /// The mask for the next token, or `None` when every token is allowed.
    pub fn next_token_mask(&self) -> Option<TokenMask> {
        match self.phase {
            MatcherState::Active => Some(self.compiled.mask(&self.cursor)),
            MatcherState::Unconstrained => None,
            MatcherState::Accepted | MatcherState::Rejected => {
                Some(TokenMask::empty(self.compiled.vocab().vocab_size()))
            }
        }
    }

    /// Write the next-token mask into `bitmask`, which must hold at least
    /// `bitmask_size(vocab_size)` words. Terminal sessions allow nothing.
    pub fn fill_next_token_bitmask(&self, bitmask: &mut [u32]) {
        match self.phase {
            MatcherState::Active => self.compiled.mask(&self.cursor).copy_to(bitmask),
            MatcherState::Unconstrained => {
                bitmask::reset_bitmask(bitmask, self.compiled.vocab().vocab_size())
            }
            MatcherState::Accepted | MatcherState::Rejected => bitmask::clear_bitmask(bitmask),
        }
    }

    /// Freeze the automaton for a reasoning span.
    pub fn enter_reasoning(&mut self) {
        if self.phase == MatcherState::Active {
            self.phase = MatcherState::Unconstrained;
        }
    }

    /// Resume constrained output at the frozen state.
    pub fn exit_reasoning(&mut self) {
        if self.phase == MatcherState::Unconstrained {
            self.phase = MatcherState::Active;
        }
    }

    /// Apply the host's per-step "inside reasoning" signal.
    pub fn observe_reasoning(&mut self, inside: bool) {
        if inside {
            self.enter_reasoning();
        } else {
            self.exit_reasoning();
        }
    }

    /// End of sequence without a stop token, e.g. a length limit the host
    /// treats as final.
    pub fn signal_end(&mut self) -> Result<MatcherState, DriftFault> {
        if self.phase.is_terminal() {
            return Err(DriftFault::Terminated);
        }
        self.checkpoint();
        self.finish()
    }

    fn finish(&mut self) -> Result<MatcherState, DriftFault> {
        if self.cursor.is_accepting() {
            self.phase = MatcherState::Accepted;
            Ok(self.phase)
        } else {
            Err(self.drift(DriftFault::PrematureEnd))
        }
    }

    fn drift(&mut self, fault: DriftFault) -> DriftFault {
        warn!(%fault, position = self.content.len(), "constrained session drifted");
        self.phase = MatcherState::Rejected;
        self.fault = Some(fault.clone());
        fault
    }

    fn checkpoint(&mut self) {
        if self.config.max_rollback == 0 {
            return;
        }
        if self.history.len() == self.config.max_rollback {
            self.history.pop_front();
        }
        self.history.push_back(Checkpoint {
            cursor: self.cursor.clone(),
            phase: self.phase,
            fault: self.fault.clone(),
            content_len: self.content.len(),
            reasoning_len: self.reasoning.len(),
            tokens_len: self.tokens.len(),
        });
    }

    /// Undo the last `n` steps, at most `max_rollback`. Returns how many
    /// were undone. Rolling back past a fault or an accepted end reopens
    /// the session.
    pub fn rollback(&mut self, n: usize) -> usize {
        let n = n.min(self.history.len());
        let keep = self.history.len() - n;
        if let Some(cp) = self.history.drain(keep..).next() {
            self.cursor = cp.cursor;
            self.phase = cp.phase;
            self.fault = cp.fault;
            self.content.truncate(cp.content_len);
            self.reasoning.truncate(cp.reasoning_len);
            self.tokens.truncate(cp.tokens_len);
        }
        n
    }

    /// Bytes every continuation must start with, as long as exactly one
    /// byte is viable and the output is not already complete. Only whole
    /// UTF-8 characters are returned.
    pub fn find_jump_forward_string(&self) -> String {
        if self.phase != MatcherState::Active {
            return String::new();
        }
        let automaton = self.compiled.automaton();
        let mut state = self.cursor.clone();
        let mut forced = Vec::new();
        while !state.is_accepting() {
            let allowed = automaton.allowed_bytes(&state);
            let [byte] = allowed[..] else {
                break;
            };
            match automaton.step(&state, byte) {
                Step::Next(next) => state = next,
                Step::Rejected => break,
            }
            forced.push(byte);
        }
        let (text, _) = split_pending(&forced);
        text.into_owned()
    }

    /// Back to the state the session was created in.
    pub fn reset(&mut self) {
        self.cursor = self.compiled.initial_state();
        self.phase = if self.config.start_in_reasoning {
            MatcherState::Unconstrained
        } else {
            MatcherState::Active
        };
        self.fault = None;
        self.content.clear();
        self.reasoning.clear();
        self.tokens.clear();
        self.history.clear();
    }

    /// Constrained output as text, without a trailing incomplete character.
    pub fn content_text(&self) -> Cow<'_, str> {
        split_pending(&self.content).0
    }

    /// Trailing bytes of an incomplete UTF-8 character, if any.
    pub fn pending_bytes(&self) -> &[u8] {
        split_pending(&self.content).1
    }

    pub fn content_bytes(&self) -> &[u8] {
        &self.content
    }

    pub fn reasoning_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.reasoning)
    }

    /// Every token fed to the session, in order.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }
}

/// Split off a trailing incomplete UTF-8 sequence.
fn split_pending(bytes: &[u8]) -> (Cow<'_, str>, &[u8]) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (Cow::Borrowed(text), &[]),
        Err(e) if e.error_len().is_none() => {
            let (head, tail) = bytes.split_at(e.valid_up_to());
            (String::from_utf8_lossy(head), tail)
        }
        Err(_) => (String::from_utf8_lossy(bytes), &[]),
    }
}
