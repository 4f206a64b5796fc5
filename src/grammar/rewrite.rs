//! Left recursion elimination.
//!
//! The automaton builder cannot expand a rule that calls itself before
//! consuming a byte, so left-recursive rules are rewritten into an
//! equivalent iterative form first:
//!
//! ```text
//! expr ::= expr "+" num | num      becomes      expr ::= num ("+" num)*
//! ```
//!
//! Indirect recursion is handled per strongly connected component of the
//! left-call graph. Members are ordered; each member's alternatives are
//! unfolded until they start with a byte, with a member, or with something
//! that can no longer lead back into the component. Leading references to
//! earlier members are replaced by those members' finished forms, which
//! leaves only direct recursion to split into heads and tails. Cycles that
//! can repeat without consuming input stay errors.

use rustc_hash::FxHashSet;
use tracing::debug;

use super::analysis::{self, Defect};
use super::builder::GrammarBuilder;
use super::{Expr, ExprId, Grammar, RuleId};
use crate::error::{GrammarError, Result};

/// Alternatives a single rule may unfold into before giving up.
pub const MAX_ALTERNATIVES: usize = 4096;

/// Rewrite `grammar` so no rule is left-recursive. Returns `None` when
/// there is nothing to rewrite.
pub fn eliminate_left_recursion(grammar: &Grammar) -> Result<Option<Grammar>> {
    if !matches!(analysis::find_defect(grammar), Some(Defect::LeftRecursive(_))) {
        return Ok(None);
    }
    let mut working = grammar.clone();
    for members in left_recursive_components(grammar) {
        let names: Vec<&str> = members.iter().map(|r| grammar.rule(*r).name.as_str()).collect();
        debug!(rules = ?names, "rewriting left recursion");
        working = Component::new(&working, members).rewrite()?;
    }
    Ok(Some(working))
}

/// Left-call edges of every rule.
fn left_edges(grammar: &Grammar, nullable: &[bool]) -> Vec<Vec<RuleId>> {
    grammar
        .rules()
        .iter()
        .map(|rule| {
            let mut out = Vec::new();
            analysis::left_calls(grammar, rule.body, nullable, &mut out);
            out
        })
        .collect()
}

/// Reachable components of the left-call graph that contain a cycle, in
/// the order Tarjan's algorithm completes them: callees first.
fn left_recursive_components(grammar: &Grammar) -> Vec<Vec<RuleId>> {
    let edges = left_edges(grammar, &analysis::nullable_rules(grammar));
    let reachable = analysis::reachable_rules(grammar);
    let n = grammar.num_rules();

    let mut index: Vec<Option<usize>> = vec![None; n];
    let mut low = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut counter = 0;
    let mut components = Vec::new();

    for start in 0..n {
        if index[start].is_some() || !reachable[start] {
            continue;
        }
        let mut calls: Vec<(usize, usize)> = Vec::new();
        index[start] = Some(counter);
        low[start] = counter;
        counter += 1;
        stack.push(start);
        on_stack[start] = true;
        calls.push((start, 0));

        while let Some(top) = calls.len().checked_sub(1) {
            let (v, next) = calls[top];
            if let Some(w) = edges[v].get(next).map(|r| r.0 as usize) {
                calls[top].1 += 1;
                match index[w] {
                    None => {
                        index[w] = Some(counter);
                        low[w] = counter;
                        counter += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        calls.push((w, 0));
                    }
                    Some(iw) if on_stack[w] => low[v] = low[v].min(iw),
                    Some(_) => {}
                }
                continue;
            }
            calls.pop();
            if let Some(&(u, _)) = calls.last() {
                low[u] = low[u].min(low[v]);
            }
            if Some(low[v]) != index[v] {
                continue;
            }
            let mut members = Vec::new();
            while let Some(w) = stack.pop() {
                on_stack[w] = false;
                members.push(RuleId(w as u32));
                if w == v {
                    break;
                }
            }
            let cyclic = members.len() > 1 || edges[v].iter().any(|r| r.0 as usize == v);
            if cyclic {
                members.sort_unstable();
                components.push(members);
            }
        }
    }
    components
}

/// One position of an alternative being unfolded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Item {
    /// An expression of the grammar, as is.
    Node(ExprId),
    /// A partly unrolled `Repeat`.
    Repeat { expr: ExprId, min: u32, max: Option<u32> },
    /// One character of the `ClassStar` at this id.
    Char(ExprId),
    /// The tail loop of an already rewritten member.
    Tail(usize),
}

type Alt = Vec<Item>;

/// A member in iterative form: `(heads) (tails)*`.
#[derive(Debug)]
struct Rewritten {
    heads: Vec<Alt>,
    tails: Vec<Alt>,
}

struct Component<'g> {
    grammar: &'g Grammar,
    members: Vec<RuleId>,
    nullable: Vec<bool>,
    /// Rules that can reach a member without consuming input.
    leads: Vec<bool>,
    done: Vec<Option<Rewritten>>,
}

impl<'g> Component<'g> {
    fn new(grammar: &'g Grammar, members: Vec<RuleId>) -> Self {
        let nullable = analysis::nullable_rules(grammar);
        let edges = left_edges(grammar, &nullable);
        let mut leads = vec![false; grammar.num_rules()];
        for m in &members {
            leads[m.0 as usize] = true;
        }
        loop {
            let mut changed = false;
            for (r, out) in edges.iter().enumerate() {
                if !leads[r] && out.iter().any(|c| leads[c.0 as usize]) {
                    leads[r] = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        let done = members.iter().map(|_| None).collect();
        Self {
            grammar,
            members,
            nullable,
            leads,
            done,
        }
    }

    fn rewrite(mut self) -> Result<Grammar> {
        for i in 0..self.members.len() {
            let alts = self.expand(i)?;
            let rewritten = self.split(i, alts)?;
            self.done[i] = Some(rewritten);
        }
        self.materialize()
    }

    fn name(&self, i: usize) -> &str {
        &self.grammar.rule(self.members[i]).name
    }

    /// Unfold member `i` until every alternative is settled.
    fn expand(&self, i: usize) -> Result<Vec<Alt>> {
        let start = vec![Item::Node(self.grammar.rule(self.members[i]).body)];
        let mut seen: FxHashSet<Alt> = FxHashSet::default();
        seen.insert(start.clone());
        let mut work = vec![start];
        let mut settled = Vec::new();
        while let Some(alt) = work.pop() {
            let Some(next) = self.step(i, &alt) else {
                settled.push(alt);
                continue;
            };
            for alt in next {
                if seen.insert(alt.clone()) {
                    if seen.len() > MAX_ALTERNATIVES {
                        return Err(GrammarError::invalid(format!(
                            "left recursion through `{}` is too complex to rewrite",
                            self.name(i)
                        )));
                    }
                    work.push(alt);
                }
            }
        }
        Ok(settled)
    }

    /// Replace the first item of `alt`, or `None` if `alt` is settled.
    fn step(&self, i: usize, alt: &[Item]) -> Option<Vec<Alt>> {
        let (first, rest) = alt.split_first()?;
        let then = |mut head: Alt| {
            head.extend_from_slice(rest);
            head
        };

        if let Some(j) = self.member_head(first) {
            if j == i {
                return None;
            }
            if let Some(done) = &self.done[j] {
                return Some(
                    done.heads
                        .iter()
                        .map(|head| {
                            let mut alt = head.clone();
                            if !done.tails.is_empty() {
                                alt.push(Item::Tail(j));
                            }
                            then(alt)
                        })
                        .collect(),
                );
            }
            // A later member settles unless it can vanish in front of
            // something that leads back in.
            if !(self.nullable[self.members[j].0 as usize] && self.seq_leads(rest)) {
                return None;
            }
            let body = self.grammar.rule(self.members[j]).body;
            return Some(vec![then(vec![Item::Node(body)])]);
        }

        if !self.item_leads(first) && (!self.item_nullable(first) || !self.seq_leads(rest)) {
            return None;
        }
        let unfolded = self.unfold(first)?;
        Some(unfolded.into_iter().map(then).collect())
    }

    /// The alternatives `item` stands for, or `None` for a single character.
    fn unfold(&self, item: &Item) -> Option<Vec<Alt>> {
        match *item {
            Item::Node(id) => match self.grammar.expr(id) {
                Expr::Empty => Some(vec![vec![]]),
                Expr::Literal(bytes) if bytes.is_empty() => Some(vec![vec![]]),
                Expr::Literal(_) | Expr::Class(_) => None,
                Expr::ClassStar(_) => Some(vec![vec![], vec![Item::Char(id), Item::Node(id)]]),
                Expr::Ref(rule) => Some(vec![vec![Item::Node(self.grammar.rule(*rule).body)]]),
                Expr::Sequence(items) => Some(vec![items.iter().map(|&e| Item::Node(e)).collect()]),
                Expr::Choice(alts) => Some(alts.iter().map(|&e| vec![Item::Node(e)]).collect()),
                Expr::Repeat { expr, min, max } => Some(unroll(*expr, *min, *max)),
            },
            Item::Repeat { expr, min, max } => Some(unroll(expr, min, max)),
            Item::Char(_) => None,
            Item::Tail(j) => {
                let done = self.done[j].as_ref()?;
                let mut alts = vec![vec![]];
                for tail in &done.tails {
                    let mut alt = tail.clone();
                    alt.push(Item::Tail(j));
                    alts.push(alt);
                }
                Some(alts)
            }
        }
    }

    fn member_head(&self, item: &Item) -> Option<usize> {
        match item {
            Item::Node(id) => match self.grammar.expr(*id) {
                Expr::Ref(rule) => self.members.iter().position(|m| m == rule),
                _ => None,
            },
            _ => None,
        }
    }

    fn item_nullable(&self, item: &Item) -> bool {
        match *item {
            Item::Node(id) => analysis::expr_nullable(self.grammar, id, &self.nullable),
            Item::Repeat { expr, min, .. } => {
                min == 0 || analysis::expr_nullable(self.grammar, expr, &self.nullable)
            }
            Item::Char(_) => false,
            Item::Tail(_) => true,
        }
    }

    fn item_leads(&self, item: &Item) -> bool {
        match *item {
            Item::Node(id) => self.expr_leads(id),
            Item::Repeat { expr, max, .. } => max != Some(0) && self.expr_leads(expr),
            Item::Char(_) => false,
            Item::Tail(j) => self.done[j]
                .as_ref()
                .is_some_and(|done| done.tails.iter().any(|t| self.seq_leads(t))),
        }
    }

    fn expr_leads(&self, id: ExprId) -> bool {
        let mut calls = Vec::new();
        analysis::left_calls(self.grammar, id, &self.nullable, &mut calls);
        calls.iter().any(|r| self.leads[r.0 as usize])
    }

    fn seq_leads(&self, items: &[Item]) -> bool {
        for item in items {
            if self.item_leads(item) {
                return true;
            }
            if !self.item_nullable(item) {
                return false;
            }
        }
        false
    }

    /// Separate `A ::= A tail` from everything else.
    fn split(&self, i: usize, alts: Vec<Alt>) -> Result<Rewritten> {
        let mut heads = Vec::new();
        let mut tails = Vec::new();
        for alt in alts {
            if alt.first().and_then(|first| self.member_head(first)) == Some(i) {
                tails.push(alt[1..].to_vec());
            } else {
                heads.push(alt);
            }
        }
        if tails.iter().any(|t| t.iter().all(|item| self.item_nullable(item))) {
            return Err(GrammarError::invalid(format!(
                "left recursion through `{}` consumes no input",
                self.name(i)
            )));
        }
        if heads.is_empty() {
            return Err(GrammarError::invalid(format!(
                "left recursion through `{}` never terminates",
                self.name(i)
            )));
        }
        Ok(Rewritten { heads, tails })
    }

    /// Copy the grammar and give every member its iterative body.
    fn materialize(self) -> Result<Grammar> {
        let mut b = GrammarBuilder::new();
        // Into an empty builder, so rule and expression ids are unchanged.
        b.import(self.grammar, "");
        let mut tail_loops: Vec<Option<ExprId>> = vec![None; self.members.len()];
        for (i, done) in self.done.iter().enumerate() {
            let Some(done) = done else {
                continue;
            };
            let heads = done
                .heads
                .iter()
                .map(|alt| self.emit(&mut b, alt, &tail_loops))
                .collect();
            let heads = b.choice(heads);
            let body = if done.tails.is_empty() {
                heads
            } else {
                let tails = done
                    .tails
                    .iter()
                    .map(|alt| self.emit(&mut b, alt, &tail_loops))
                    .collect();
                let tails = b.choice(tails);
                let looped = b.repeat(tails, 0, None);
                tail_loops[i] = Some(looped);
                b.sequence(vec![heads, looped])
            };
            b.define_rule(self.members[i], body);
        }
        b.build(&self.grammar.root_rule().name)
    }

    fn emit(&self, b: &mut GrammarBuilder, alt: &[Item], tail_loops: &[Option<ExprId>]) -> ExprId {
        let items = alt
            .iter()
            .map(|item| match *item {
                Item::Node(id) => id,
                Item::Repeat { expr, min, max } => b.repeat(expr, min, max),
                Item::Char(id) => match self.grammar.expr(id) {
                    Expr::ClassStar(class) => b.class(class.clone()),
                    _ => id,
                },
                Item::Tail(j) => match tail_loops[j] {
                    Some(looped) => looped,
                    None => b.empty(),
                },
            })
            .collect();
        b.sequence(items)
    }
}

/// `expr{min,max}` as "nothing" (when `min` is zero) or one copy followed
/// by the rest.
fn unroll(expr: ExprId, min: u32, max: Option<u32>) -> Vec<Alt> {
    if max == Some(0) {
        return vec![vec![]];
    }
    let max = max.map(|m| m - 1);
    let mut once = vec![Item::Node(expr)];
    if max != Some(0) {
        once.push(Item::Repeat {
            expr,
            min: min.saturating_sub(1),
            max,
        });
    }
    if min == 0 {
        vec![vec![], once]
    } else {
        vec![once]
    }
}
