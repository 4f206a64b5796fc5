//! Grammar → pushdown automaton.
//!
//! Every rule that is called (rather than inlined) gets its own byte-level
//! DFA ([`RuleDfa`]). Rule references stay as call edges on those DFAs and
//! the [`PushdownAutomaton`] in [`pushdown`] walks them with an explicit
//! frame stack. Ambiguity is carried as a set of live configurations, so
//! advancing is a pure function and never backtracks.

pub mod nfa;
pub mod pushdown;

pub use pushdown::{Config, Configs, Frame, PushdownAutomaton, State, Step};

use crate::grammar::RuleId;

/// Marks a missing byte transition in [`RuleDfa::byte_table`].
pub(crate) const NO_EDGE: u32 = u32::MAX;

/// Deterministic automaton for one rule.
///
/// Node 0 is the start node. Byte transitions live in a dense 256-wide table;
/// call edges are stored flat and sliced through `call_offsets`. Every node
/// can reach an accepting node, so any configuration made of these nodes
/// has a valid completion.
#[derive(Debug, Clone, Default)]
pub struct RuleDfa {
    /// `byte_table[node * 256 + byte]` → target node or [`NO_EDGE`].
    byte_table: Vec<u32>,
    call_offsets: Vec<u32>,
    calls: Vec<(RuleId, u32)>,
    accepting: Vec<bool>,
    has_bytes: Vec<bool>,
}

impl RuleDfa {
    pub fn num_nodes(&self) -> usize {
        self.accepting.len()
    }

    #[inline]
    pub fn next(&self, node: u32, byte: u8) -> Option<u32> {
        let target = self.byte_table[node as usize * 256 + byte as usize];
        (target != NO_EDGE).then_some(target)
    }

    /// The 256 byte transitions of `node`.
    pub fn byte_row(&self, node: u32) -> &[u32] {
        let start = node as usize * 256;
        &self.byte_table[start..start + 256]
    }

    /// Call edges `(callee, return node)` leaving `node`.
    pub fn calls(&self, node: u32) -> &[(RuleId, u32)] {
        let start = self.call_offsets[node as usize] as usize;
        let end = self.call_offsets[node as usize + 1] as usize;
        &self.calls[start..end]
    }

    #[inline]
    pub fn is_accepting(&self, node: u32) -> bool {
        self.accepting[node as usize]
    }

    #[inline]
    pub fn has_bytes(&self, node: u32) -> bool {
        self.has_bytes[node as usize]
    }

    /// Accepting with nothing left to do: returning here is the same as
    /// returning from the caller.
    pub fn is_tail(&self, node: u32) -> bool {
        self.is_accepting(node) && !self.has_bytes(node) && self.calls(node).is_empty()
    }

    pub fn memory_size(&self) -> usize {
        self.byte_table.len() * 4
            + self.call_offsets.len() * 4
            + self.calls.len() * std::mem::size_of::<(RuleId, u32)>()
            + self.accepting.len() * 2
    }

    /// Match `input` using byte edges only. Calls are not followed.
    #[cfg(test)]
    pub fn accepts_bytes(&self, input: &[u8]) -> bool {
        let mut node = 0u32;
        for &b in input {
            match self.next(node, b) {
                Some(n) => node = n,
                None => return false,
            }
        }
        self.is_accepting(node)
    }
}
