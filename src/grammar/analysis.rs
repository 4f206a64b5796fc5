//! Static checks run on every grammar before it reaches the automaton
//! builder: reachability, productivity and left recursion.

use super::{Expr, ExprId, Grammar, RuleId};
use crate::error::{GrammarError, Result};

/// A structural problem that makes a grammar unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Defect {
    /// A reachable rule derives no finite string.
    Unproductive(String),
    /// The rules form a cycle with no input consumed in between.
    LeftRecursive(Vec<String>),
}

impl std::fmt::Display for Defect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Defect::Unproductive(rule) => write!(f, "rule `{rule}` can never match any input"),
            Defect::LeftRecursive(cycle) => {
                write!(f, "left recursion through {}", cycle.join(" -> "))
            }
        }
    }
}

/// Rules reachable from the root.
pub fn reachable_rules(grammar: &Grammar) -> Vec<bool> {
    let mut seen = vec![false; grammar.num_rules()];
    let mut stack = vec![grammar.root()];
    seen[grammar.root().0 as usize] = true;
    while let Some(rule) = stack.pop() {
        let mut refs = Vec::new();
        collect_refs(grammar, grammar.rule(rule).body, &mut refs);
        for r in refs {
            if !seen[r.0 as usize] {
                seen[r.0 as usize] = true;
                stack.push(r);
            }
        }
    }
    seen
}

fn collect_refs(grammar: &Grammar, id: ExprId, out: &mut Vec<RuleId>) {
    match grammar.expr(id) {
        Expr::Ref(r) => out.push(*r),
        Expr::Sequence(items) | Expr::Choice(items) => {
            for &item in items {
                collect_refs(grammar, item, out);
            }
        }
        Expr::Repeat { expr, .. } => collect_refs(grammar, *expr, out),
        Expr::Empty | Expr::Literal(_) | Expr::Class(_) | Expr::ClassStar(_) => {}
    }
}

/// Least fixpoint of a per-expression predicate over all rules.
fn rule_fixpoint(
    grammar: &Grammar,
    eval: impl Fn(&Grammar, ExprId, &[bool]) -> bool,
) -> Vec<bool> {
    let mut known = vec![false; grammar.num_rules()];
    loop {
        let mut changed = false;
        for (i, rule) in grammar.rules().iter().enumerate() {
            if !known[i] && eval(grammar, rule.body, &known) {
                known[i] = true;
                changed = true;
            }
        }
        if !changed {
            return known;
        }
    }
}

pub fn nullable_rules(grammar: &Grammar) -> Vec<bool> {
    rule_fixpoint(grammar, expr_nullable)
}

pub fn productive_rules(grammar: &Grammar) -> Vec<bool> {
    rule_fixpoint(grammar, expr_productive)
}

pub(crate) fn expr_nullable(grammar: &Grammar, id: ExprId, nullable: &[bool]) -> bool {
    match grammar.expr(id) {
        Expr::Empty | Expr::ClassStar(_) => true,
        Expr::Literal(b) => b.is_empty(),
        Expr::Class(_) => false,
        Expr::Ref(r) => nullable[r.0 as usize],
        Expr::Sequence(items) => items.iter().all(|&e| expr_nullable(grammar, e, nullable)),
        Expr::Choice(alts) => alts.iter().any(|&e| expr_nullable(grammar, e, nullable)),
        Expr::Repeat { expr, min, .. } => *min == 0 || expr_nullable(grammar, *expr, nullable),
    }
}

pub(crate) fn expr_productive(grammar: &Grammar, id: ExprId, productive: &[bool]) -> bool {
    match grammar.expr(id) {
        Expr::Empty | Expr::Literal(_) | Expr::ClassStar(_) => true,
        Expr::Class(c) => !c.is_empty(),
        Expr::Ref(r) => productive[r.0 as usize],
        Expr::Sequence(items) => items.iter().all(|&e| expr_productive(grammar, e, productive)),
        Expr::Choice(alts) => alts.iter().any(|&e| expr_productive(grammar, e, productive)),
        Expr::Repeat { expr, min, .. } => {
            *min == 0 || expr_productive(grammar, *expr, productive)
        }
    }
}

/// Rules that can be entered before any byte is consumed from `id`.
pub(crate) fn left_calls(grammar: &Grammar, id: ExprId, nullable: &[bool], out: &mut Vec<RuleId>) {
    match grammar.expr(id) {
        Expr::Ref(r) => out.push(*r),
        Expr::Sequence(items) => {
            for &item in items {
                left_calls(grammar, item, nullable, out);
                if !expr_nullable(grammar, item, nullable) {
                    break;
                }
            }
        }
        Expr::Choice(alts) => {
            for &alt in alts {
                left_calls(grammar, alt, nullable, out);
            }
        }
        Expr::Repeat { expr, max, .. } => {
            if *max != Some(0) {
                left_calls(grammar, *expr, nullable, out);
            }
        }
        Expr::Empty | Expr::Literal(_) | Expr::Class(_) | Expr::ClassStar(_) => {}
    }
}

fn find_left_cycle(grammar: &Grammar, reachable: &[bool]) -> Option<Vec<RuleId>> {
    let nullable = nullable_rules(grammar);
    let edges: Vec<Vec<RuleId>> = grammar
        .rules()
        .iter()
        .map(|rule| {
            let mut out = Vec::new();
            left_calls(grammar, rule.body, &nullable, &mut out);
            out
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }
    let mut marks = vec![Mark::New; grammar.num_rules()];
    for start in 0..grammar.num_rules() {
        if !reachable[start] || marks[start] != Mark::New {
            continue;
        }
        // Iterative DFS; the path doubles as the cycle report.
        let mut path: Vec<(RuleId, usize)> = vec![(RuleId(start as u32), 0)];
        marks[start] = Mark::Active;
        while let Some(top) = path.len().checked_sub(1) {
            let (rule, next) = path[top];
            let succ = &edges[rule.0 as usize];
            if next < succ.len() {
                path[top].1 += 1;
                let callee = succ[next];
                match marks[callee.0 as usize] {
                    Mark::Active => {
                        let from = path.iter().position(|(r, _)| *r == callee).unwrap_or(0);
                        let mut cycle: Vec<RuleId> = path[from..].iter().map(|(r, _)| *r).collect();
                        cycle.push(callee);
                        return Some(cycle);
                    }
                    Mark::New => {
                        marks[callee.0 as usize] = Mark::Active;
                        path.push((callee, 0));
                    }
                    Mark::Done => {}
                }
            } else {
                marks[rule.0 as usize] = Mark::Done;
                path.pop();
            }
        }
    }
    None
}

/// First defect found in the part of the grammar reachable from the root.
pub fn find_defect(grammar: &Grammar) -> Option<Defect> {
    let reachable = reachable_rules(grammar);
    let productive = productive_rules(grammar);
    if !productive[grammar.root().0 as usize] {
        return Some(Defect::Unproductive(grammar.root_rule().name.clone()));
    }
    if let Some(i) = (0..grammar.num_rules()).find(|&i| reachable[i] && !productive[i]) {
        return Some(Defect::Unproductive(grammar.rules()[i].name.clone()));
    }
    find_left_cycle(grammar, &reachable).map(|cycle| {
        Defect::LeftRecursive(cycle.iter().map(|r| grammar.rule(*r).name.clone()).collect())
    })
}

/// Turn [`find_defect`] into the compile error taxonomy. An unproductive
/// root means the constraint admits nothing; any other defect is a malformed
/// grammar.
pub fn validate(grammar: &Grammar) -> Result<()> {
    match find_defect(grammar) {
        None => Ok(()),
        Some(Defect::Unproductive(rule)) if rule == grammar.root_rule().name => Err(
            GrammarError::unrepresentable(format!("rule `{rule}` can never match any input")),
        ),
        Some(defect) => Err(GrammarError::invalid(defect.to_string())),
    }
}
