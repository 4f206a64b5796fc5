//! Structural tags: schema-constrained segments embedded in free text.
//!
//! A structural tag lists structures `begin body end`, where the body is a
//! JSON Schema, and the trigger substrings that announce them. Output stays
//! unconstrained until a trigger shows up; the dispatcher then enforces the
//! grammar of the structures that trigger can start.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{GrammarError, Result};
use crate::grammar::builder::GrammarBuilder;
use crate::grammar::{analysis, Grammar};
use crate::json_schema::{schema_value_to_grammar, JsonSchemaOptions};

/// One `begin body end` structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub begin: String,
    /// JSON Schema for the body, either inline or as JSON text.
    pub schema: Value,
    pub end: String,
}

/// The `structural_tag` request descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralTagSpec {
    pub structures: Vec<Structure>,
    pub triggers: Vec<String>,
}

/// The grammar armed when one trigger fires.
#[derive(Debug, Clone)]
pub struct TriggerGrammar {
    pub trigger: String,
    /// Alternation of every structure whose `begin` starts with `trigger`.
    pub grammar: Grammar,
}

/// A compiled structural tag.
#[derive(Debug, Clone)]
pub struct StructuralTag {
    /// `root ::= s_1 | ... | s_n` over all structures.
    pub grammar: Grammar,
    pub triggers: Vec<TriggerGrammar>,
}

impl StructuralTagSpec {
    /// Check the trigger/begin consistency rules.
    pub fn validate(&self) -> Result<()> {
        if self.structures.is_empty() {
            return Err(GrammarError::invalid("structural tag has no structures"));
        }
        if self.triggers.is_empty() {
            return Err(GrammarError::invalid("structural tag has no triggers"));
        }
        for (i, trigger) in self.triggers.iter().enumerate() {
            if trigger.is_empty() {
                return Err(GrammarError::invalid("structural tag trigger is empty"));
            }
            if self.triggers[..i].contains(trigger) {
                return Err(GrammarError::invalid(format!(
                    "duplicate trigger `{trigger}` makes dispatch ambiguous"
                )));
            }
            if !self.structures.iter().any(|s| s.begin.starts_with(trigger.as_str())) {
                return Err(GrammarError::invalid(format!(
                    "trigger `{trigger}` does not start any begin marker"
                )));
            }
        }
        for structure in &self.structures {
            if !self.triggers.iter().any(|t| structure.begin.starts_with(t.as_str())) {
                return Err(GrammarError::invalid(format!(
                    "begin marker `{}` is not announced by any trigger",
                    structure.begin
                )));
            }
        }
        Ok(())
    }
}

/// Compile a structural tag into its combined grammar and one grammar per
/// trigger.
pub fn compile_structural_tag(spec: &StructuralTagSpec, options: &JsonSchemaOptions) -> Result<StructuralTag> {
    spec.validate()?;
    let bodies = spec
        .structures
        .iter()
        .enumerate()
        .map(|(i, s)| {
            body_grammar(&s.schema, options).map_err(|e| e.context(format_args!("structure {i}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let all: Vec<usize> = (0..spec.structures.len()).collect();
    let grammar = union_grammar(spec, &bodies, &all)?;

    let triggers = spec
        .triggers
        .iter()
        .map(|trigger| {
            let members: Vec<usize> = (0..spec.structures.len())
                .filter(|&i| spec.structures[i].begin.starts_with(trigger.as_str()))
                .collect();
            Ok(TriggerGrammar {
                trigger: trigger.clone(),
                grammar: union_grammar(spec, &bodies, &members)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(
        structures = spec.structures.len(),
        triggers = triggers.len(),
        "compiled structural tag"
    );
    Ok(StructuralTag { grammar, triggers })
}

fn body_grammar(schema: &Value, options: &JsonSchemaOptions) -> Result<Grammar> {
    match schema {
        Value::String(text) => {
            let parsed: Value = serde_json::from_str(text)
                .map_err(|e| GrammarError::invalid(format!("schema is not valid JSON: {e}")))?;
            schema_value_to_grammar(&parsed, options)
        }
        other => schema_value_to_grammar(other, options),
    }
}

fn union_grammar(spec: &StructuralTagSpec, bodies: &[Grammar], members: &[usize]) -> Result<Grammar> {
    let mut b = GrammarBuilder::new();
    let root = b.declare_rule("root");
    let mut alts = Vec::with_capacity(members.len());
    for &i in members {
        let structure = &spec.structures[i];
        let body = b.import(&bodies[i], &format!("s{i}_"));
        let begin = b.literal(structure.begin.as_bytes());
        let body = b.rule_ref(body);
        let end = b.literal(structure.end.as_bytes());
        let seq = b.sequence(vec![begin, body, end]);
        let rule = b.declare_rule(&format!("structure_{i}"));
        b.define_rule(rule, seq);
        alts.push(b.rule_ref(rule));
    }
    let body = b.choice(alts);
    b.define_rule(root, body);
    let grammar = b.build("root")?;
    analysis::validate(&grammar)?;
    Ok(grammar)
}
