//! The request-level constraint surface.
//!
//! A request carries exactly one of `json_schema`, `ebnf`, `regex` or
//! `structural_tag` (the last may also sit under `response_format`).
//! [`ConstraintSpec`] is that choice after validation, and
//! [`ConstraintSpec::to_grammar`] runs the matching front end.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{GrammarError, Result};
use crate::grammar::Grammar;
use crate::json_schema::{schema_value_to_grammar, JsonSchemaOptions};
use crate::regex::regex_to_grammar;
use crate::structural_tag::{compile_structural_tag, StructuralTag, StructuralTagSpec};

const REQUEST_FIELDS: [&str; 4] = ["json_schema", "ebnf", "regex", "structural_tag"];

/// One constraint, as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintSpec {
    /// A schema object, or its JSON text.
    JsonSchema(Value),
    /// EBNF text with a `root` rule.
    Ebnf(String),
    Regex(String),
    StructuralTag(StructuralTagSpec),
}

/// Front-end output: a grammar, plus the trigger grammars of a structural
/// tag.
#[derive(Debug, Clone)]
pub enum ConstraintGrammar {
    Plain(Grammar),
    Tagged(StructuralTag),
}

impl ConstraintSpec {
    /// Pick the constraint out of a request object.
    ///
    /// Exactly one of the top-level constraint fields or
    /// `response_format.structural_tag` must be present and non-null.
    pub fn from_request(request: &Value) -> Result<Self> {
        let Value::Object(fields) = request else {
            return Err(GrammarError::invalid("request must be a JSON object"));
        };
        let mut found: Vec<(&str, &Value)> = REQUEST_FIELDS
            .iter()
            .filter_map(|&name| match fields.get(name) {
                Some(Value::Null) | None => None,
                Some(value) => Some((name, value)),
            })
            .collect();
        if let Some(tag) = fields
            .get("response_format")
            .and_then(|format| format.get("structural_tag"))
            .filter(|v| !v.is_null())
        {
            found.push(("response_format.structural_tag", tag));
        }

        match found.as_slice() {
            [] => Err(GrammarError::invalid(format!(
                "request has no constraint; expected one of {}",
                REQUEST_FIELDS.join(", ")
            ))),
            [(name, value)] => Self::from_field(name, value),
            many => Err(GrammarError::invalid(format!(
                "request has {} constraints ({}); exactly one is allowed",
                many.len(),
                many.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    fn from_field(name: &str, value: &Value) -> Result<Self> {
        let text = |value: &Value| match value {
            Value::String(s) => Ok(s.clone()),
            _ => Err(GrammarError::invalid(format!("`{name}` must be a string"))),
        };
        match name {
            "json_schema" => Ok(ConstraintSpec::JsonSchema(value.clone())),
            "ebnf" => Ok(ConstraintSpec::Ebnf(text(value)?)),
            "regex" => Ok(ConstraintSpec::Regex(text(value)?)),
            _ => serde_json::from_value(value.clone())
                .map(ConstraintSpec::StructuralTag)
                .map_err(|e| GrammarError::invalid(format!("malformed `{name}`: {e}"))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConstraintSpec::JsonSchema(_) => "json_schema",
            ConstraintSpec::Ebnf(_) => "ebnf",
            ConstraintSpec::Regex(_) => "regex",
            ConstraintSpec::StructuralTag(_) => "structural_tag",
        }
    }

    /// Canonical text of the constraint. Two specs with equal keys compile
    /// to the same grammar. Schema text is parsed first so formatting does
    /// not matter; key order does, since it drives property order.
    pub fn cache_key(&self) -> Result<String> {
        let body = match self {
            ConstraintSpec::JsonSchema(schema) => to_json(&parse_schema(schema)?)?,
            ConstraintSpec::Ebnf(text) | ConstraintSpec::Regex(text) => text.clone(),
            ConstraintSpec::StructuralTag(tag) => {
                let mut tag = tag.clone();
                for structure in &mut tag.structures {
                    structure.schema = parse_schema(&structure.schema)?;
                }
                to_json(&tag)?
            }
        };
        Ok(format!("{}:{body}", self.kind()))
    }

    /// Run the front end for this constraint.
    pub fn to_grammar(&self, options: &JsonSchemaOptions) -> Result<ConstraintGrammar> {
        let grammar = match self {
            ConstraintSpec::JsonSchema(schema) => {
                ConstraintGrammar::Plain(schema_value_to_grammar(&parse_schema(schema)?, options)?)
            }
            ConstraintSpec::Ebnf(text) => ConstraintGrammar::Plain(Grammar::from_ebnf(text, "root")?),
            ConstraintSpec::Regex(pattern) => ConstraintGrammar::Plain(regex_to_grammar(pattern)?),
            ConstraintSpec::StructuralTag(tag) => {
                ConstraintGrammar::Tagged(compile_structural_tag(tag, options)?)
            }
        };
        debug!(kind = self.kind(), "constraint translated to grammar");
        Ok(grammar)
    }
}

fn parse_schema(schema: &Value) -> Result<Value> {
    match schema {
        Value::String(text) => serde_json::from_str(text)
            .map_err(|e| GrammarError::invalid(format!("schema is not valid JSON: {e}"))),
        other => Ok(other.clone()),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| GrammarError::invalid(e.to_string()))
}
