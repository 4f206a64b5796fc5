use rustc_hash::FxHashMap;

use super::{CharClass, Expr, ExprId, Grammar, Rule, RuleId};
use crate::error::{GrammarError, Result};

const UNDEFINED: ExprId = ExprId(u32::MAX);

/// Programmatic grammar construction.
///
/// Rules may be declared before they are defined, so forward references
/// work. `build` fails if a declared rule never received a body.
///
/// ```
/// use pie_structured::grammar::builder::GrammarBuilder;
///
/// let mut b = GrammarBuilder::new();
/// let root = b.declare_rule("root");
/// let hello = b.literal(b"hello");
/// b.define_rule(root, hello);
/// let grammar = b.build("root").unwrap();
/// assert_eq!(grammar.num_rules(), 1);
/// ```
#[derive(Debug, Default)]
pub struct GrammarBuilder {
    rules: Vec<Rule>,
    exprs: Vec<Expr>,
    by_name: FxHashMap<String, RuleId>,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the rule called `name`, declaring it if needed.
    pub fn declare_rule(&mut self, name: &str) -> RuleId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = RuleId(self.rules.len() as u32);
        self.rules.push(Rule {
            name: name.to_string(),
            body: UNDEFINED,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Declare a helper rule with a name derived from `prefix` that is not
    /// taken yet.
    pub fn fresh_rule(&mut self, prefix: &str) -> RuleId {
        let mut n = self.rules.len();
        loop {
            let candidate = format!("{prefix}_{n}");
            if !self.by_name.contains_key(&candidate) {
                return self.declare_rule(&candidate);
            }
            n += 1;
        }
    }

    pub fn define_rule(&mut self, rule: RuleId, body: ExprId) {
        self.rules[rule.0 as usize].body = body;
    }

    pub fn is_defined(&self, rule: RuleId) -> bool {
        self.rules[rule.0 as usize].body != UNDEFINED
    }

    pub fn find_rule(&self, name: &str) -> Option<RuleId> {
        self.by_name.get(name).copied()
    }

    pub fn rule_name(&self, rule: RuleId) -> &str {
        &self.rules[rule.0 as usize].name
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    pub fn add(&mut self, expr: Expr) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(expr);
        id
    }

    pub fn empty(&mut self) -> ExprId {
        self.add(Expr::Empty)
    }

    pub fn literal(&mut self, bytes: &[u8]) -> ExprId {
        if bytes.is_empty() {
            return self.empty();
        }
        self.add(Expr::Literal(bytes.to_vec()))
    }

    pub fn class(&mut self, class: CharClass) -> ExprId {
        self.add(Expr::Class(class))
    }

    pub fn class_star(&mut self, class: CharClass) -> ExprId {
        self.add(Expr::ClassStar(class))
    }

    pub fn rule_ref(&mut self, rule: RuleId) -> ExprId {
        self.add(Expr::Ref(rule))
    }

    /// Concatenation; a single item is returned unchanged.
    pub fn sequence(&mut self, mut items: Vec<ExprId>) -> ExprId {
        match items.len() {
            0 => self.empty(),
            1 => items.remove(0),
            _ => self.add(Expr::Sequence(items)),
        }
    }

    /// Alternation; a single alternative is returned unchanged.
    pub fn choice(&mut self, mut alts: Vec<ExprId>) -> ExprId {
        match alts.len() {
            1 => alts.remove(0),
            _ => self.add(Expr::Choice(alts)),
        }
    }

    pub fn repeat(&mut self, expr: ExprId, min: u32, max: Option<u32>) -> ExprId {
        match (min, max) {
            (1, Some(1)) => expr,
            (_, Some(0)) => self.empty(),
            _ => self.add(Expr::Repeat { expr, min, max }),
        }
    }

    pub fn optional(&mut self, expr: ExprId) -> ExprId {
        self.repeat(expr, 0, Some(1))
    }

    /// Copy every rule of `grammar` into this builder with `prefix` prepended
    /// to its name and return the copied root. Names that are already taken
    /// get a fresh suffix.
    pub fn import(&mut self, grammar: &Grammar, prefix: &str) -> RuleId {
        let ids: Vec<RuleId> = grammar
            .rules
            .iter()
            .map(|rule| {
                let name = format!("{prefix}{}", rule.name);
                if self.by_name.contains_key(&name) {
                    self.fresh_rule(&name)
                } else {
                    self.declare_rule(&name)
                }
            })
            .collect();
        let offset = self.exprs.len() as u32;
        let shift = |items: &[ExprId]| -> Vec<ExprId> {
            items.iter().map(|e| ExprId(e.0 + offset)).collect()
        };
        for expr in &grammar.exprs {
            let copied = match expr {
                Expr::Ref(rule) => Expr::Ref(ids[rule.0 as usize]),
                Expr::Sequence(items) => Expr::Sequence(shift(items)),
                Expr::Choice(items) => Expr::Choice(shift(items)),
                Expr::Repeat { expr, min, max } => Expr::Repeat {
                    expr: ExprId(expr.0 + offset),
                    min: *min,
                    max: *max,
                },
                other => other.clone(),
            };
            self.exprs.push(copied);
        }
        for (rule, &id) in grammar.rules.iter().zip(&ids) {
            self.define_rule(id, ExprId(rule.body.0 + offset));
        }
        ids[grammar.root.0 as usize]
    }

    /// Finish the grammar. Every declared rule must have a body and
    /// `root_name` must exist.
    pub fn build(self, root_name: &str) -> Result<Grammar> {
        let root = self.find_rule(root_name).ok_or_else(|| {
            GrammarError::invalid(format!("grammar has no `{root_name}` rule"))
        })?;
        if let Some(rule) = self.rules.iter().find(|r| r.body == UNDEFINED) {
            return Err(GrammarError::invalid(format!(
                "rule `{}` is not defined",
                rule.name
            )));
        }
        Ok(Grammar {
            rules: self.rules,
            exprs: self.exprs,
            root,
        })
    }
}
