//! Per-rule NFA construction and determinization.
//!
//! Edge kinds:
//! - `Bytes { lo, hi }`: consume one byte in `[lo, hi]`
//! - `Epsilon`: free transition
//! - `Call { rule }`: match a whole rule, then continue at `target`
//!
//! Small non-recursive rules are expanded in place. Character classes are
//! encoded as UTF-8 byte paths, so the automata never see codepoints.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rustc_hash::FxHashMap;

use super::{RuleDfa, NO_EDGE};
use crate::grammar::{analysis, CharClass, Expr, ExprId, Grammar, RuleId};

/// Upper bound on the NFA weight of a rule that is expanded in place.
const INLINE_BUDGET: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NfaEdge {
    Bytes { lo: u8, hi: u8, target: NodeId },
    Epsilon(NodeId),
    Call { rule: RuleId, target: NodeId },
}

/// Mutable adjacency-list NFA used during construction.
#[derive(Debug, Clone, Default)]
pub struct NfaGraph {
    edges: Vec<Vec<NfaEdge>>,
}

impl NfaGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self) -> NodeId {
        let id = NodeId(self.edges.len() as u32);
        self.edges.push(Vec::new());
        id
    }

    pub fn num_nodes(&self) -> usize {
        self.edges.len()
    }

    pub fn edges(&self, node: NodeId) -> &[NfaEdge] {
        &self.edges[node.0 as usize]
    }

    pub fn add_bytes(&mut self, from: NodeId, lo: u8, hi: u8, target: NodeId) {
        self.edges[from.0 as usize].push(NfaEdge::Bytes { lo, hi, target });
    }

    pub fn add_epsilon(&mut self, from: NodeId, target: NodeId) {
        if from != target {
            self.edges[from.0 as usize].push(NfaEdge::Epsilon(target));
        }
    }

    pub fn add_call(&mut self, from: NodeId, rule: RuleId, target: NodeId) {
        self.edges[from.0 as usize].push(NfaEdge::Call { rule, target });
    }

    pub fn epsilon_closure(&self, seeds: impl IntoIterator<Item = NodeId>) -> BTreeSet<NodeId> {
        let mut closure = BTreeSet::new();
        let mut queue = VecDeque::new();
        for s in seeds {
            if closure.insert(s) {
                queue.push_back(s);
            }
        }
        while let Some(s) = queue.pop_front() {
            for edge in self.edges(s) {
                if let NfaEdge::Epsilon(t) = edge {
                    if closure.insert(*t) {
                        queue.push_back(*t);
                    }
                }
            }
        }
        closure
    }
}

/// The NFA of one rule: a single start and a single accepting node.
#[derive(Debug, Clone)]
pub struct RuleNfa {
    pub graph: NfaGraph,
    pub start: NodeId,
    pub end: NodeId,
}

impl RuleNfa {
    /// Simulate on `input` without following calls.
    #[cfg(test)]
    pub fn accepts(&self, input: &[u8]) -> bool {
        let mut current = self.graph.epsilon_closure([self.start]);
        for &byte in input {
            let mut next = Vec::new();
            for &s in &current {
                for edge in self.graph.edges(s) {
                    if let NfaEdge::Bytes { lo, hi, target } = edge {
                        if (*lo..=*hi).contains(&byte) {
                            next.push(*target);
                        }
                    }
                }
            }
            if next.is_empty() {
                return false;
            }
            current = self.graph.epsilon_closure(next);
        }
        current.contains(&self.end)
    }

    /// Subset construction. Calls are symbols like bytes, grouped by callee,
    /// so the result is deterministic on both. Calls into rules that can
    /// never complete are dropped and nodes that cannot reach acceptance
    /// are trimmed.
    pub fn determinize(&self, productive: &[bool]) -> RuleDfa {
        let mut subsets = Subsets::default();
        let start = self.graph.epsilon_closure([self.start]);
        subsets.intern(start, self.end);

        let mut cursor = 0;
        while cursor < subsets.sets.len() {
            let set = subsets.sets[cursor].clone();
            for (lo, hi, targets) in collect_intervals(&self.graph, &set) {
                let closure = self.graph.epsilon_closure(targets);
                let t = subsets.intern(closure, self.end);
                subsets.bytes[cursor].push((lo, hi, t));
            }

            let mut by_rule: BTreeMap<RuleId, Vec<NodeId>> = BTreeMap::new();
            for &s in &set {
                for edge in self.graph.edges(s) {
                    if let NfaEdge::Call { rule, target } = edge {
                        by_rule.entry(*rule).or_default().push(*target);
                    }
                }
            }
            for (rule, targets) in by_rule {
                if !productive[rule.0 as usize] {
                    continue;
                }
                let closure = self.graph.epsilon_closure(targets);
                let t = subsets.intern(closure, self.end);
                subsets.calls[cursor].push((rule, t));
            }
            cursor += 1;
        }
        subsets.into_trimmed_dfa()
    }
}

#[derive(Default)]
struct Subsets {
    sets: Vec<BTreeSet<NodeId>>,
    index: FxHashMap<BTreeSet<NodeId>, u32>,
    accepting: Vec<bool>,
    bytes: Vec<Vec<(u8, u8, u32)>>,
    calls: Vec<Vec<(RuleId, u32)>>,
}

impl Subsets {
    fn intern(&mut self, set: BTreeSet<NodeId>, end: NodeId) -> u32 {
        if let Some(&id) = self.index.get(&set) {
            return id;
        }
        let id = self.sets.len() as u32;
        self.accepting.push(set.contains(&end));
        self.bytes.push(Vec::new());
        self.calls.push(Vec::new());
        self.index.insert(set.clone(), id);
        self.sets.push(set);
        id
    }

    fn into_trimmed_dfa(self) -> RuleDfa {
        let n = self.sets.len();
        let mut preds: Vec<Vec<u32>> = vec![Vec::new(); n];
        for d in 0..n {
            for &(_, _, t) in &self.bytes[d] {
                preds[t as usize].push(d as u32);
            }
            for &(_, t) in &self.calls[d] {
                preds[t as usize].push(d as u32);
            }
        }
        let mut live = self.accepting.clone();
        let mut queue: Vec<u32> = (0..n as u32).filter(|&d| live[d as usize]).collect();
        while let Some(d) = queue.pop() {
            for &p in &preds[d as usize] {
                if !live[p as usize] {
                    live[p as usize] = true;
                    queue.push(p);
                }
            }
        }

        if !live.first().copied().unwrap_or(false) {
            // The rule matches nothing; a lone dead start node keeps
            // indexing valid.
            return RuleDfa {
                byte_table: vec![NO_EDGE; 256],
                call_offsets: vec![0, 0],
                calls: Vec::new(),
                accepting: vec![false],
                has_bytes: vec![false],
            };
        }

        let mut renumber = vec![NO_EDGE; n];
        let mut next_id = 0u32;
        for d in 0..n {
            if live[d] {
                renumber[d] = next_id;
                next_id += 1;
            }
        }
        let kept = next_id as usize;

        let mut dfa = RuleDfa {
            byte_table: vec![NO_EDGE; kept * 256],
            call_offsets: Vec::with_capacity(kept + 1),
            calls: Vec::new(),
            accepting: Vec::with_capacity(kept),
            has_bytes: Vec::with_capacity(kept),
        };
        for d in (0..n).filter(|&d| live[d]) {
            let row = renumber[d] as usize * 256;
            let mut any = false;
            for &(lo, hi, t) in &self.bytes[d] {
                if !live[t as usize] {
                    continue;
                }
                any = true;
                for b in lo..=hi {
                    dfa.byte_table[row + b as usize] = renumber[t as usize];
                }
            }
            dfa.call_offsets.push(dfa.calls.len() as u32);
            for &(rule, t) in &self.calls[d] {
                if live[t as usize] {
                    dfa.calls.push((rule, renumber[t as usize]));
                }
            }
            dfa.accepting.push(self.accepting[d]);
            dfa.has_bytes.push(any);
        }
        dfa.call_offsets.push(dfa.calls.len() as u32);
        dfa
    }
}

/// Split the byte edges leaving `set` into disjoint intervals, each with
/// the union of its targets.
fn collect_intervals(graph: &NfaGraph, set: &BTreeSet<NodeId>) -> Vec<(u8, u8, Vec<NodeId>)> {
    let mut ranges: Vec<(u8, u8, NodeId)> = Vec::new();
    for &s in set {
        for edge in graph.edges(s) {
            if let NfaEdge::Bytes { lo, hi, target } = edge {
                ranges.push((*lo, *hi, *target));
            }
        }
    }
    if ranges.is_empty() {
        return Vec::new();
    }

    let mut points: BTreeSet<u16> = BTreeSet::new();
    for &(lo, hi, _) in &ranges {
        points.insert(lo as u16);
        points.insert(hi as u16 + 1);
    }
    let points: Vec<u16> = points.into_iter().collect();

    let mut out: Vec<(u8, u8, Vec<NodeId>)> = Vec::new();
    for pair in points.windows(2) {
        let (lo, hi) = (pair[0], pair[1] - 1);
        let mut targets: Vec<NodeId> = ranges
            .iter()
            .filter(|&&(a, b, _)| a as u16 <= lo && hi <= b as u16)
            .map(|&(_, _, t)| t)
            .collect();
        if targets.is_empty() {
            continue;
        }
        targets.sort_unstable();
        targets.dedup();
        match out.last_mut() {
            Some(last) if last.2 == targets && last.1 as u16 + 1 == lo => last.1 = hi as u8,
            _ => out.push((lo as u8, hi as u8, targets)),
        }
    }
    out
}

/// Rules that are expanded in place at every reference.
///
/// A rule qualifies when its body references only rules that qualify
/// (so recursive rules never do) and its expanded size stays within
/// [`INLINE_BUDGET`].
pub fn inline_plan(grammar: &Grammar) -> Vec<bool> {
    let n = grammar.num_rules();
    let mut inline = vec![false; n];
    let mut weight = vec![0usize; n];
    loop {
        let mut changed = false;
        for (i, rule) in grammar.rules().iter().enumerate() {
            if inline[i] {
                continue;
            }
            if let Some(w) = inline_weight(grammar, rule.body, &inline, &weight) {
                if w <= INLINE_BUDGET {
                    inline[i] = true;
                    weight[i] = w;
                    changed = true;
                }
            }
        }
        if !changed {
            return inline;
        }
    }
}

fn inline_weight(grammar: &Grammar, id: ExprId, inline: &[bool], weight: &[usize]) -> Option<usize> {
    let w = match grammar.expr(id) {
        Expr::Empty => 1,
        Expr::Literal(b) => b.len(),
        Expr::Class(c) | Expr::ClassStar(c) => 1 + 4 * c.ranges.len(),
        Expr::Ref(r) => {
            if !inline[r.0 as usize] {
                return None;
            }
            weight[r.0 as usize]
        }
        Expr::Sequence(items) | Expr::Choice(items) => {
            let mut sum = 0usize;
            for &item in items {
                sum = sum.saturating_add(inline_weight(grammar, item, inline, weight)?);
            }
            sum
        }
        Expr::Repeat { expr, min, max } => {
            let copies = max.unwrap_or(min.saturating_add(1)).max(1) as usize;
            inline_weight(grammar, *expr, inline, weight)?.saturating_mul(copies)
        }
    };
    Some(w)
}

/// Build the NFA for `rule`, expanding the rules marked in `inline`.
pub fn build_rule_nfa(grammar: &Grammar, rule: RuleId, inline: &[bool]) -> RuleNfa {
    let mut lowering = Lowering {
        grammar,
        inline,
        graph: NfaGraph::new(),
    };
    let start = lowering.graph.add_node();
    let end = lowering.graph.add_node();
    lowering.expr(grammar.rule(rule).body, start, end);
    RuleNfa {
        graph: lowering.graph,
        start,
        end,
    }
}

/// Build DFAs for the root and every rule it (transitively) calls.
/// Rules that are only ever inlined keep an empty placeholder.
pub fn build_rule_dfas(grammar: &Grammar) -> Vec<RuleDfa> {
    let inline = inline_plan(grammar);
    let productive = analysis::productive_rules(grammar);
    let n = grammar.num_rules();
    let mut dfas = vec![RuleDfa::default(); n];
    let mut queued = vec![false; n];
    let mut queue = vec![grammar.root()];
    queued[grammar.root().0 as usize] = true;
    while let Some(rule) = queue.pop() {
        let dfa = build_rule_nfa(grammar, rule, &inline).determinize(&productive);
        for &(callee, _) in &dfa.calls {
            if !queued[callee.0 as usize] {
                queued[callee.0 as usize] = true;
                queue.push(callee);
            }
        }
        dfas[rule.0 as usize] = dfa;
    }
    dfas
}

/// Invariant: no construction adds an edge into its `start` node or out of
/// its `end` node, so siblings sharing those nodes cannot interfere.
struct Lowering<'g> {
    grammar: &'g Grammar,
    inline: &'g [bool],
    graph: NfaGraph,
}

impl Lowering<'_> {
    fn expr(&mut self, id: ExprId, start: NodeId, end: NodeId) {
        match self.grammar.expr(id) {
            Expr::Empty => self.graph.add_epsilon(start, end),
            Expr::Literal(bytes) => {
                let mut prev = start;
                for (i, &b) in bytes.iter().enumerate() {
                    let next = if i + 1 == bytes.len() {
                        end
                    } else {
                        self.graph.add_node()
                    };
                    self.graph.add_bytes(prev, b, b, next);
                    prev = next;
                }
                if bytes.is_empty() {
                    self.graph.add_epsilon(start, end);
                }
            }
            Expr::Class(class) => self.class(class, start, end),
            Expr::ClassStar(class) => {
                let head = self.graph.add_node();
                self.graph.add_epsilon(start, head);
                self.class(class, head, head);
                self.graph.add_epsilon(head, end);
            }
            Expr::Ref(rule) => {
                if self.inline[rule.0 as usize] {
                    let body = self.grammar.rule(*rule).body;
                    self.expr(body, start, end);
                } else {
                    self.graph.add_call(start, *rule, end);
                }
            }
            Expr::Sequence(items) => {
                let mut prev = start;
                for (i, &item) in items.iter().enumerate() {
                    let next = if i + 1 == items.len() {
                        end
                    } else {
                        self.graph.add_node()
                    };
                    self.expr(item, prev, next);
                    prev = next;
                }
                if items.is_empty() {
                    self.graph.add_epsilon(start, end);
                }
            }
            Expr::Choice(alts) => {
                for &alt in alts {
                    self.expr(alt, start, end);
                }
            }
            Expr::Repeat { expr, min, max } => self.repeat(*expr, *min, *max, start, end),
        }
    }

    fn repeat(&mut self, body: ExprId, min: u32, max: Option<u32>, start: NodeId, end: NodeId) {
        let mut prev = start;
        for _ in 0..min {
            let next = self.graph.add_node();
            self.expr(body, prev, next);
            prev = next;
        }
        match max {
            Some(max) => {
                for _ in min..max {
                    let next = self.graph.add_node();
                    self.graph.add_epsilon(prev, end);
                    self.expr(body, prev, next);
                    prev = next;
                }
                self.graph.add_epsilon(prev, end);
            }
            None => {
                let head = self.graph.add_node();
                let tail = self.graph.add_node();
                self.graph.add_epsilon(prev, head);
                self.expr(body, head, tail);
                self.graph.add_epsilon(tail, head);
                self.graph.add_epsilon(head, end);
            }
        }
    }

    fn class(&mut self, class: &CharClass, start: NodeId, end: NodeId) {
        for (lo, hi) in class.effective_ranges() {
            add_codepoint_range(&mut self.graph, lo, hi, start, end);
        }
    }
}

/// Byte paths for the codepoints `[lo, hi]`, split by UTF-8 length.
fn add_codepoint_range(graph: &mut NfaGraph, lo: u32, hi: u32, start: NodeId, end: NodeId) {
    if lo <= 0x7F {
        graph.add_bytes(start, lo as u8, hi.min(0x7F) as u8, end);
    }
    for (band_lo, band_hi) in [(0x80, 0x7FF), (0x800, 0xD7FF), (0xE000, 0xFFFF), (0x1_0000, 0x10_FFFF)] {
        let (l, h) = (lo.max(band_lo), hi.min(band_hi));
        if l <= h {
            if let (Some(lb), Some(hb)) = (utf8(l), utf8(h)) {
                add_utf8_byte_range(graph, &lb, &hb, 0, start, end);
            }
        }
    }
}

fn utf8(cp: u32) -> Option<Vec<u8>> {
    let c = char::from_u32(cp)?;
    let mut buf = [0u8; 4];
    Some(c.encode_utf8(&mut buf).as_bytes().to_vec())
}

/// Paths for all equal-length encodings between `lo` and `hi`, recursing
/// on the first differing byte.
fn add_utf8_byte_range(
    graph: &mut NfaGraph,
    lo: &[u8],
    hi: &[u8],
    depth: usize,
    start: NodeId,
    end: NodeId,
) {
    if depth + 1 == lo.len() {
        graph.add_bytes(start, lo[depth], hi[depth], end);
        return;
    }
    if lo[depth] == hi[depth] {
        let mid = graph.add_node();
        graph.add_bytes(start, lo[depth], lo[depth], mid);
        add_utf8_byte_range(graph, lo, hi, depth + 1, mid, end);
        return;
    }

    let mut lo_top = lo.to_vec();
    lo_top[depth + 1..].fill(0xBF);
    let mid = graph.add_node();
    graph.add_bytes(start, lo[depth], lo[depth], mid);
    add_utf8_byte_range(graph, lo, &lo_top, depth + 1, mid, end);

    if lo[depth] + 1 < hi[depth] {
        let mut full_lo = lo.to_vec();
        let mut full_hi = hi.to_vec();
        full_lo[depth + 1..].fill(0x80);
        full_hi[depth + 1..].fill(0xBF);
        let mid = graph.add_node();
        graph.add_bytes(start, lo[depth] + 1, hi[depth] - 1, mid);
        add_utf8_byte_range(graph, &full_lo, &full_hi, depth + 1, mid, end);
    }

    let mut hi_bottom = hi.to_vec();
    hi_bottom[depth + 1..].fill(0x80);
    let mid = graph.add_node();
    graph.add_bytes(start, hi[depth], hi[depth], mid);
    add_utf8_byte_range(graph, &hi_bottom, hi, depth + 1, mid, end);
}
