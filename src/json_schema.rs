//! JSON Schema to grammar converter.
//!
//! Converts a JSON Schema into EBNF text, then parses it into a `Grammar`.
//! The generated grammar constrains output to JSON text that matches the
//! schema.
//!
//! # Supported features
//! - Types: string, integer, number, boolean, null, array, object, and
//!   type unions
//! - Constraints: enum, const, minLength/maxLength, pattern, format,
//!   minimum/maximum, exclusiveMinimum/exclusiveMaximum
//! - Arrays: items, prefixItems, minItems/maxItems
//! - Objects: properties, required, additionalProperties,
//!   minProperties/maxProperties
//! - Composition: $ref, $defs/definitions, anyOf, oneOf, allOf
//! - Formatting: any_whitespace, indent, separators
//!
//! # Widening
//! Some constraints cannot be expressed by a context-free grammar at
//! reasonable size. They are widened: the grammar accepts a superset of the
//! valid instances, never a subset. Number bounds, `oneOf` exclusivity,
//! `maxProperties` next to declared properties, and the keywords listed as
//! unsupported in [`keywords`] are widened unless
//! [`KeywordPolicy::Reject`] is set.
//!
//! # Narrowing
//! Integers only take their plain decimal spelling. `1.0` and `1e2` are
//! valid instances of `{"type": "integer"}` but the grammar rejects them.
//! The opt-in `strict_mode` and [`PropertyOrder::Declared`] narrow objects
//! further.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::automaton::PushdownAutomaton;
use crate::error::{GrammarError, Result};
use crate::grammar::analysis::{self, Defect};
use crate::grammar::ebnf::quote_literal;
use crate::grammar::Grammar;
use crate::regex::{push_json_char, regex_expr, regex_to_grammar, RegexContext};

mod keywords;
mod numeric;

use keywords::Keyword;

/// Order in which object properties may appear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyOrder {
    /// Any order. `required` is enforced for up to
    /// [`MAX_TRACKED_REQUIRED`] required properties and widened beyond.
    #[default]
    Any,
    /// Declaration order; optional properties may be skipped. Narrows the
    /// language: an instance with reordered keys is rejected.
    Declared,
}

/// Handling of keywords the grammar cannot express.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordPolicy {
    /// Ignore the keyword; the output is a superset of the valid instances.
    #[default]
    Widen,
    /// Fail with `InvalidSpecification`.
    Reject,
}

/// Options for JSON schema to grammar conversion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonSchemaOptions {
    /// Allow arbitrary whitespace between JSON tokens.
    pub any_whitespace: bool,
    /// Spaces per nesting level. Only used when `any_whitespace` is off;
    /// `None` means single-line output.
    pub indent: Option<usize>,
    /// Custom separators: (item_separator, key_value_separator).
    pub separators: Option<(String, String)>,
    /// Disallow properties and items the schema does not declare, unless
    /// `additionalProperties` or `items` allow them. Narrows the language
    /// when on.
    pub strict_mode: bool,
    pub property_order: PropertyOrder,
    pub unsupported_keywords: KeywordPolicy,
}

impl Default for JsonSchemaOptions {
    fn default() -> Self {
        Self {
            any_whitespace: true,
            indent: None,
            separators: None,
            strict_mode: false,
            property_order: PropertyOrder::Any,
            unsupported_keywords: KeywordPolicy::Widen,
        }
    }
}

/// Convert JSON Schema text to a Grammar.
pub fn json_schema_to_grammar(schema: &str, options: &JsonSchemaOptions) -> Result<Grammar> {
    let value: Value = serde_json::from_str(schema)
        .map_err(|e| GrammarError::invalid(format!("schema is not valid JSON: {e}")))?;
    schema_value_to_grammar(&value, options)
}

/// Convert a parsed JSON Schema to a Grammar.
pub fn schema_value_to_grammar(schema: &Value, options: &JsonSchemaOptions) -> Result<Grammar> {
    let ebnf = json_schema_to_ebnf(schema, options)?;
    let grammar = Grammar::from_ebnf(&ebnf, "root")?;
    match analysis::find_defect(&grammar) {
        None => {}
        Some(Defect::Unproductive(rule)) => {
            return Err(GrammarError::unrepresentable(format!(
                "schema admits no value: rule `{rule}` can never match"
            )));
        }
        Some(defect) => return Err(GrammarError::invalid(defect.to_string())),
    }
    debug!(rules = grammar.num_rules(), "compiled JSON schema");
    Ok(grammar)
}

/// Convert a parsed JSON Schema to EBNF text rooted at `root`.
pub fn json_schema_to_ebnf(schema: &Value, options: &JsonSchemaOptions) -> Result<String> {
    let mut converter = Converter::new(schema, options);
    let body = converter.visit(schema, 0)?;
    converter.rules[0].1 = body;
    Ok(converter.to_ebnf())
}

/// Grammar for any JSON value.
pub fn builtin_json_grammar() -> Result<Grammar> {
    Grammar::from_ebnf(BUILTIN_JSON_EBNF, "root")
}

const BUILTIN_JSON_EBNF: &str = r#"
root ::= value
value ::= object | array | string | number | "true" | "false" | "null"
object ::= "{" ws (member ("," ws member)*)? "}"
member ::= string ws ":" ws value ws
array ::= "[" ws (value ws ("," ws value ws)*)? "]"
string ::= "\"" char* "\""
char ::= [^"\\\x00-\x1f] | "\\" escape
escape ::= ["\\/bfnrt] | "u" [0-9a-fA-F]{4}
number ::= "-"? ("0" | [1-9] [0-9]*) ("." [0-9]+)? ([eE] [+-]? [0-9]+)?
ws ::= [ \t\n\r]*
"#;

const QUOTE: &str = r#""\"""#;

/// Repeat counts above this are widened to unbounded, which keeps the
/// automaton small.
const MAX_EXACT_COUNT: u64 = 1000;

/// Nesting depth up to which indentation is exact. Deeper levels accept a
/// newline followed by any number of spaces.
const MAX_INDENT_DEPTH: usize = 16;

/// Bound on `$ref` chains followed while merging `allOf`.
const MAX_REF_CHAIN: usize = 32;

/// Required properties tracked by an any-order object. Each subset of them
/// becomes a rule, so more than this are widened to "not enforced".
pub const MAX_TRACKED_REQUIRED: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Spacing {
    Free,
    Compact,
    Indent(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Basic {
    Ws,
    Char,
    String,
    Value,
    Object,
    Array,
    DeepNewline,
}

/// What may follow the declared items or properties of a container.
enum Extra<'s> {
    Forbidden,
    Any,
    Schema(&'s Value),
}

struct Converter<'a> {
    root: &'a Value,
    options: &'a JsonSchemaOptions,
    spacing: Spacing,
    item_sep: String,
    pair_sep: String,
    rules: Vec<(String, String)>,
    names: FxHashSet<String>,
    basics: FxHashMap<Basic, usize>,
    refs: FxHashMap<(String, usize), usize>,
}

impl<'a> Converter<'a> {
    fn new(root: &'a Value, options: &'a JsonSchemaOptions) -> Self {
        let spacing = match (options.any_whitespace, options.indent) {
            (true, _) => Spacing::Free,
            (false, Some(n)) => Spacing::Indent(n),
            (false, None) => Spacing::Compact,
        };
        let (item_sep, pair_sep) = match &options.separators {
            Some((item, pair)) => (item.clone(), pair.clone()),
            None if matches!(spacing, Spacing::Indent(_)) => (",".into(), ": ".into()),
            None => (",".into(), ":".into()),
        };
        let mut converter = Self {
            root,
            options,
            spacing,
            item_sep,
            pair_sep,
            rules: Vec::new(),
            names: FxHashSet::default(),
            basics: FxHashMap::default(),
            refs: FxHashMap::default(),
        };
        let root_name = converter.fresh_name("root");
        converter.rules.push((root_name, String::new()));
        converter
    }

    fn to_ebnf(&self) -> String {
        let mut out = String::new();
        for (name, body) in &self.rules {
            out.push_str(&format!("{name} ::= {body}\n"));
        }
        out
    }

    fn fresh_name(&mut self, base: &str) -> String {
        let base = sanitize_rule_name(base);
        let mut name = base.clone();
        let mut n = 0;
        while self.names.contains(&name) {
            n += 1;
            name = format!("{base}_{n}");
        }
        self.names.insert(name.clone());
        name
    }

    fn add_rule(&mut self, base: &str, body: String) -> String {
        let name = self.fresh_name(base);
        self.rules.push((name.clone(), body));
        name
    }

    /// Visit `schema`, undoing every rule it added if it fails, so an
    /// alternative that turns out empty leaves no dangling references.
    fn attempt(&mut self, schema: &Value, depth: usize) -> Result<String> {
        let mark = self.rules.len();
        let result = self.visit(schema, depth);
        if result.is_err() {
            self.rollback(mark);
        }
        result
    }

    fn rollback(&mut self, mark: usize) {
        self.rules.truncate(mark);
        self.basics.retain(|_, idx| *idx < mark);
        self.refs.retain(|_, idx| *idx < mark);
    }

    /// Name of a shared helper rule, emitting it on first use. The slot is
    /// registered before the body is built so the value rules can recurse.
    fn basic(&mut self, basic: Basic) -> String {
        if let Some(&idx) = self.basics.get(&basic) {
            return self.rules[idx].0.clone();
        }
        let base = match basic {
            Basic::Ws => "ws",
            Basic::Char => "json_char",
            Basic::String => "json_string",
            Basic::Value => "json_value",
            Basic::Object => "json_object",
            Basic::Array => "json_array",
            Basic::DeepNewline => "deep_newline",
        };
        let name = self.fresh_name(base);
        self.rules.push((name.clone(), String::new()));
        let idx = self.rules.len() - 1;
        self.basics.insert(basic, idx);
        let body = self.basic_body(basic);
        self.rules[idx].1 = body;
        name
    }

    fn basic_body(&mut self, basic: Basic) -> String {
        // Free-form values inside an indented document fall back to free
        // whitespace.
        let spacing = match self.spacing {
            Spacing::Indent(_) => Spacing::Free,
            other => other,
        };
        match basic {
            Basic::Ws => r"[ \t\n\r]*".to_string(),
            Basic::Char => r#"[^"\\\x00-\x1f] | "\\" (["\\/bfnrt] | "u" [0-9a-fA-F]{4})"#.to_string(),
            Basic::DeepNewline => r#""\n" [ ]*"#.to_string(),
            Basic::String => {
                let ch = self.basic(Basic::Char);
                format!("{QUOTE} {ch}* {QUOTE}")
            }
            Basic::Value => {
                let object = self.basic(Basic::Object);
                let array = self.basic(Basic::Array);
                let string = self.basic(Basic::String);
                format!(
                    r#"{object} | {array} | {string} | ({}) | "true" | "false" | "null""#,
                    numeric::NUMBER
                )
            }
            Basic::Object => {
                let string = self.basic(Basic::String);
                let value = self.basic(Basic::Value);
                let pair = format!("{string} {} {value}", self.pair_separator(spacing));
                let content = format!("{pair} ({} {pair})*", self.item_separator(spacing, 0));
                self.container_with(spacing, '{', '}', &content, true, 0)
            }
            Basic::Array => {
                let value = self.basic(Basic::Value);
                let content = format!("{value} ({} {value})*", self.item_separator(spacing, 0));
                self.container_with(spacing, '[', ']', &content, true, 0)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Layout
    // ---------------------------------------------------------------------

    fn newline(&mut self, depth: usize) -> String {
        match self.spacing {
            Spacing::Indent(n) if depth <= MAX_INDENT_DEPTH => {
                quote_literal(&format!("\n{}", " ".repeat(n * depth)))
            }
            _ => self.basic(Basic::DeepNewline),
        }
    }

    fn item_separator(&mut self, spacing: Spacing, depth: usize) -> String {
        let sep = self.item_sep.clone();
        match spacing {
            Spacing::Free => {
                let ws = self.basic(Basic::Ws);
                format!("{ws} {} {ws}", quote_literal(&sep))
            }
            Spacing::Compact => quote_literal(&sep),
            Spacing::Indent(n) if depth < MAX_INDENT_DEPTH => {
                quote_literal(&format!("{sep}\n{}", " ".repeat(n * (depth + 1))))
            }
            Spacing::Indent(_) => format!("{} {}", quote_literal(&sep), self.newline(depth + 1)),
        }
    }

    fn pair_separator(&mut self, spacing: Spacing) -> String {
        let sep = self.pair_sep.clone();
        match spacing {
            Spacing::Free => {
                let ws = self.basic(Basic::Ws);
                format!("{ws} {} {ws}", quote_literal(&sep))
            }
            Spacing::Compact | Spacing::Indent(_) => quote_literal(&sep),
        }
    }

    /// `open content close`, where `content` is atomic-safe to sequence and
    /// may be skipped when `optional`.
    fn container(&mut self, open: char, close: char, content: &str, optional: bool, depth: usize) -> String {
        self.container_with(self.spacing, open, close, content, optional, depth)
    }

    fn container_with(
        &mut self,
        spacing: Spacing,
        open: char,
        close: char,
        content: &str,
        optional: bool,
        depth: usize,
    ) -> String {
        let (o, c) = (quote_literal(&open.to_string()), quote_literal(&close.to_string()));
        if content.is_empty() {
            return match spacing {
                Spacing::Free => format!("{o} {} {c}", self.basic(Basic::Ws)),
                _ => quote_literal(&format!("{open}{close}")),
            };
        }
        let inner = match spacing {
            Spacing::Free => format!("{content} {}", self.basic(Basic::Ws)),
            Spacing::Compact => content.to_string(),
            Spacing::Indent(_) => {
                format!("{} {content} {}", self.newline(depth + 1), self.newline(depth))
            }
        };
        let lead = match spacing {
            Spacing::Free => format!(" {}", self.basic(Basic::Ws)),
            _ => String::new(),
        };
        if optional {
            format!("{o}{lead} ({inner})? {c}")
        } else {
            format!("{o}{lead} {inner} {c}")
        }
    }

    fn ref_depth(&self, depth: usize) -> usize {
        match self.spacing {
            Spacing::Indent(_) => depth.min(MAX_INDENT_DEPTH + 1),
            _ => 0,
        }
    }

    // ---------------------------------------------------------------------
    // Schema nodes
    // ---------------------------------------------------------------------

    fn visit(&mut self, schema: &Value, depth: usize) -> Result<String> {
        let obj = match schema {
            Value::Bool(true) => return Ok(self.basic(Basic::Value)),
            Value::Bool(false) => {
                return Err(GrammarError::unrepresentable("schema `false` admits no value"));
            }
            Value::Object(obj) => obj,
            other => {
                return Err(GrammarError::invalid(format!(
                    "schema must be an object or a boolean, got `{other}`"
                )));
            }
        };
        self.check_keywords(obj)?;

        if let Some(reference) = obj.get("$ref") {
            let reference = reference
                .as_str()
                .ok_or_else(|| GrammarError::invalid("`$ref` must be a string"))?;
            return self.visit_ref(reference, depth);
        }

        if let Some(all_of) = obj.get("allOf") {
            let merged = self.merge_all_of(obj, all_of)?;
            return self.visit(&merged, depth);
        }

        if let Some(branches) = obj.get("anyOf").or_else(|| obj.get("oneOf")) {
            if obj.contains_key("oneOf") {
                debug!("widening oneOf to anyOf");
            }
            return self.visit_any_of(branches, depth);
        }

        if let Some(value) = obj.get("const") {
            return self.visit_literals(obj, std::slice::from_ref(value));
        }
        if let Some(values) = obj.get("enum") {
            let values = values
                .as_array()
                .ok_or_else(|| GrammarError::invalid("`enum` must be an array"))?;
            return self.visit_literals(obj, values);
        }

        match obj.get("type") {
            Some(Value::String(ty)) => self.visit_typed(obj, ty, depth),
            Some(Value::Array(types)) => {
                if types.is_empty() {
                    return Err(GrammarError::unrepresentable("empty `type` list"));
                }
                let mut alts = Vec::new();
                for ty in types {
                    let ty = ty
                        .as_str()
                        .ok_or_else(|| GrammarError::invalid("`type` entries must be strings"))?;
                    let mark = self.rules.len();
                    match self.visit_typed(obj, ty, depth) {
                        Ok(expr) => alts.push(expr),
                        Err(GrammarError::Unrepresentable(reason)) => {
                            self.rollback(mark);
                            debug!(ty, %reason, "dropping unrepresentable type");
                        }
                        Err(e) => return Err(e),
                    }
                }
                alternation(alts)
                    .ok_or_else(|| GrammarError::unrepresentable("no listed type admits a value"))
            }
            Some(other) => Err(GrammarError::invalid(format!(
                "`type` must be a string or an array, got `{other}`"
            ))),
            None => match infer_type(obj) {
                Some(ty) => self.visit_typed(obj, ty, depth),
                None => Ok(self.basic(Basic::Value)),
            },
        }
    }

    fn check_keywords(&self, obj: &Map<String, Value>) -> Result<()> {
        for key in obj.keys() {
            match keywords::classify(key) {
                Keyword::Supported | Keyword::Annotation => {}
                Keyword::Unsupported => match self.options.unsupported_keywords {
                    KeywordPolicy::Widen => debug!(keyword = %key, "ignoring unsupported keyword"),
                    KeywordPolicy::Reject => {
                        return Err(GrammarError::invalid(format!(
                            "keyword `{key}` is not supported"
                        )));
                    }
                },
                Keyword::Unknown => {
                    return Err(GrammarError::invalid(format!("unknown schema keyword `{key}`")));
                }
            }
        }
        Ok(())
    }

    fn visit_typed(&mut self, obj: &Map<String, Value>, ty: &str, depth: usize) -> Result<String> {
        match ty {
            "string" => self.visit_string(obj),
            "integer" => visit_integer(obj),
            "number" => visit_number(obj),
            "boolean" => Ok(r#"("true" | "false")"#.to_string()),
            "null" => Ok(r#""null""#.to_string()),
            "array" => self.visit_array(obj, depth),
            "object" => self.visit_object(obj, depth),
            _ => Err(GrammarError::invalid(format!("unknown type `{ty}`"))),
        }
    }

    fn resolve(&self, reference: &str) -> Result<&'a Value> {
        let root = self.root;
        let pointer = reference.strip_prefix('#').ok_or_else(|| {
            GrammarError::invalid(format!("unsupported `$ref` `{reference}`: only local references resolve"))
        })?;
        if pointer.is_empty() {
            return Ok(root);
        }
        root.pointer(pointer)
            .ok_or_else(|| GrammarError::invalid(format!("unresolved `$ref` `{reference}`")))
    }

    fn visit_ref(&mut self, reference: &str, depth: usize) -> Result<String> {
        let depth = self.ref_depth(depth);
        let key = (reference.to_string(), depth);
        if let Some(&idx) = self.refs.get(&key) {
            return Ok(self.rules[idx].0.clone());
        }
        let target = self.resolve(reference)?;
        let base = reference
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty() && *s != "#")
            .unwrap_or("root_ref");
        let name = self.fresh_name(base);
        self.rules.push((name.clone(), String::new()));
        let idx = self.rules.len() - 1;
        self.refs.insert(key, idx);
        let body = self
            .visit(target, depth)
            .map_err(|e| e.context(format_args!("`$ref` `{reference}`")))?;
        self.rules[idx].1 = body;
        Ok(name)
    }

    fn visit_any_of(&mut self, branches: &Value, depth: usize) -> Result<String> {
        let branches = branches
            .as_array()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| GrammarError::invalid("`anyOf`/`oneOf` must be a non-empty array"))?;
        let mut alts = Vec::with_capacity(branches.len());
        for (i, branch) in branches.iter().enumerate() {
            match self.attempt(branch, depth) {
                Ok(expr) => alts.push(expr),
                Err(GrammarError::Unrepresentable(reason)) => {
                    debug!(branch = i, %reason, "dropping unrepresentable anyOf branch");
                }
                Err(e) => return Err(e),
            }
        }
        alternation(alts)
            .ok_or_else(|| GrammarError::unrepresentable("no `anyOf` branch admits a value"))
    }

    fn visit_literals(&mut self, obj: &Map<String, Value>, values: &[Value]) -> Result<String> {
        let mut alts = Vec::with_capacity(values.len());
        for value in values {
            if literal_allowed(obj, value)? {
                alts.push(quote_literal(&value.to_string()));
            } else {
                debug!(%value, "enum value excluded by sibling constraints");
            }
        }
        alternation(alts).ok_or_else(|| {
            GrammarError::unrepresentable("no `enum`/`const` value satisfies the schema")
        })
    }

    fn visit_string(&mut self, obj: &Map<String, Value>) -> Result<String> {
        let min = count(obj, "minLength")?.unwrap_or(0);
        let max = count(obj, "maxLength")?;
        if let Some(max) = max {
            if min > max {
                return Err(GrammarError::unrepresentable(format!(
                    "minLength {min} exceeds maxLength {max}"
                )));
            }
        }

        let pattern = match obj.get("pattern") {
            Some(p) => Some(
                p.as_str()
                    .ok_or_else(|| GrammarError::invalid("`pattern` must be a string"))?,
            ),
            None => match obj.get("format").and_then(Value::as_str) {
                Some(format) => {
                    let regex = keywords::format_regex(format);
                    if regex.is_none() {
                        debug!(format, "unknown format, accepting any string");
                    }
                    regex
                }
                None => None,
            },
        };
        if let Some(pattern) = pattern {
            if min > 0 || max.is_some() {
                debug!("length bounds next to a pattern are widened");
            }
            let body = regex_expr(pattern, RegexContext::JsonString)?;
            return Ok(format!("{QUOTE} {body} {QUOTE}"));
        }

        let ch = self.basic(Basic::Char);
        Ok(format!("{QUOTE} {} {QUOTE}", repeat(&ch, min, max)))
    }

    fn visit_array(&mut self, obj: &Map<String, Value>, depth: usize) -> Result<String> {
        let min = count(obj, "minItems")?.unwrap_or(0);
        let max = count(obj, "maxItems")?;
        if let Some(max) = max {
            if min > max {
                return Err(GrammarError::unrepresentable(format!(
                    "minItems {min} exceeds maxItems {max}"
                )));
            }
        }

        let (prefix, extra): (&[Value], Option<&Value>) = match (obj.get("prefixItems"), obj.get("items")) {
            (Some(prefix), items) => (
                prefix
                    .as_array()
                    .map(Vec::as_slice)
                    .ok_or_else(|| GrammarError::invalid("`prefixItems` must be an array"))?,
                items,
            ),
            // Tuple form from older drafts.
            (None, Some(Value::Array(prefix))) => (prefix.as_slice(), obj.get("additionalItems")),
            (None, items) => (&[] as &[Value], items),
        };
        let mut extra = match extra {
            Some(Value::Bool(false)) => Extra::Forbidden,
            Some(Value::Bool(true)) => Extra::Any,
            Some(schema @ Value::Object(_)) => Extra::Schema(schema),
            Some(other) => {
                return Err(GrammarError::invalid(format!("invalid `items` value `{other}`")));
            }
            None if !prefix.is_empty() && self.options.strict_mode => Extra::Forbidden,
            None => Extra::Any,
        };

        let limit = max.map_or(prefix.len(), |m| (m as usize).min(prefix.len()));
        if max.is_some_and(|m| m <= prefix.len() as u64) {
            extra = Extra::Forbidden;
        }
        let mut elems = Vec::with_capacity(limit);
        for (i, item) in prefix[..limit].iter().enumerate() {
            if (i as u64) < min {
                elems.push(self.visit(item, depth + 1).map_err(|e| e.context(format_args!("item {i}")))?);
                continue;
            }
            match self.attempt(item, depth + 1) {
                Ok(expr) => elems.push(expr),
                Err(GrammarError::Unrepresentable(_)) => {
                    // The array has to end before this position.
                    extra = Extra::Forbidden;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let extra_expr = match extra {
            Extra::Forbidden => None,
            Extra::Any => Some(self.basic(Basic::Value)),
            Extra::Schema(schema) => match self.attempt(schema, depth + 1) {
                Ok(expr) => Some(expr),
                Err(GrammarError::Unrepresentable(_)) => None,
                Err(e) => return Err(e),
            },
        };
        let k = elems.len() as u64;
        if extra_expr.is_none() && min > k {
            return Err(GrammarError::unrepresentable(format!(
                "minItems {min} but at most {k} items are allowed"
            )));
        }

        let sep = self.item_separator(self.spacing, depth);
        if k == 0 {
            let Some(item) = extra_expr else {
                return Ok(self.container('[', ']', "", true, depth));
            };
            let rest = repeat(
                &format!("({sep} {item})"),
                min.saturating_sub(1),
                max.map(|m| m.saturating_sub(1)),
            );
            let content = format!("{item} {rest}");
            return Ok(self.container('[', ']', content.trim_end(), min == 0, depth));
        }

        let mut tail = match &extra_expr {
            Some(item) => repeat(
                &format!("({sep} {item})"),
                min.saturating_sub(k),
                max.map(|m| m - k),
            ),
            None => String::new(),
        };
        for i in (1..elems.len()).rev() {
            let part = format!("{sep} {} {tail}", elems[i]);
            let part = part.trim_end();
            tail = if (i as u64) < min {
                part.to_string()
            } else {
                format!("({part})?")
            };
        }
        let content = format!("{} {tail}", elems[0]);
        Ok(self.container('[', ']', content.trim_end(), min == 0, depth))
    }

    fn visit_object(&mut self, obj: &Map<String, Value>, depth: usize) -> Result<String> {
        let min = count(obj, "minProperties")?.unwrap_or(0);
        let max = count(obj, "maxProperties")?;
        let properties = match obj.get("properties") {
            Some(Value::Object(props)) => Some(props),
            Some(_) => return Err(GrammarError::invalid("`properties` must be an object")),
            None => None,
        };
        let mut required: Vec<&str> = Vec::new();
        if let Some(list) = obj.get("required") {
            let list = list
                .as_array()
                .ok_or_else(|| GrammarError::invalid("`required` must be an array"))?;
            for key in list {
                let key = key
                    .as_str()
                    .ok_or_else(|| GrammarError::invalid("`required` entries must be strings"))?;
                if !required.contains(&key) {
                    required.push(key);
                }
            }
        }
        if let Some(max) = max {
            if min > max {
                return Err(GrammarError::unrepresentable(format!(
                    "minProperties {min} exceeds maxProperties {max}"
                )));
            }
            if required.len() as u64 > max {
                return Err(GrammarError::unrepresentable(format!(
                    "{} required properties exceed maxProperties {max}",
                    required.len()
                )));
            }
        }

        let extra = match obj.get("additionalProperties") {
            Some(Value::Bool(false)) => Extra::Forbidden,
            Some(Value::Bool(true)) => Extra::Any,
            Some(schema @ Value::Object(_)) => Extra::Schema(schema),
            Some(other) => {
                return Err(GrammarError::invalid(format!(
                    "invalid `additionalProperties` value `{other}`"
                )));
            }
            None if properties.is_some() && self.options.strict_mode => Extra::Forbidden,
            None => Extra::Any,
        };
        let kv = self.pair_separator(self.spacing);
        let mut pairs: Vec<(String, bool)> = Vec::new();
        if let Some(props) = properties {
            for (key, schema) in props {
                let is_required = required.contains(&key.as_str());
                let value = if is_required {
                    self.visit(schema, depth + 1)
                        .map_err(|e| e.context(format_args!("property `{key}`")))?
                } else {
                    match self.attempt(schema, depth + 1) {
                        Ok(value) => value,
                        Err(GrammarError::Unrepresentable(_)) => {
                            debug!(property = %key, "optional property can never be present");
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                };
                pairs.push((format!("{} {kv} {value}", json_key(key)), is_required));
            }
        }

        let extra_value = if max == Some(0) {
            None
        } else {
            match extra {
                Extra::Forbidden => None,
                Extra::Any => Some(self.basic(Basic::Value)),
                Extra::Schema(schema) => match self.attempt(schema, depth + 1) {
                    Ok(expr) => Some(expr),
                    Err(GrammarError::Unrepresentable(_)) => None,
                    Err(e) => return Err(e),
                },
            }
        };

        for key in &required {
            if properties.is_some_and(|p| p.contains_key(*key)) {
                continue;
            }
            let Some(value) = &extra_value else {
                return Err(GrammarError::unrepresentable(format!(
                    "required property `{key}` is not allowed by the schema"
                )));
            };
            pairs.push((format!("{} {kv} {value}", json_key(key)), true));
        }

        if extra_value.is_none() && min > pairs.len() as u64 {
            return Err(GrammarError::unrepresentable(format!(
                "minProperties {min} but only {} properties are allowed",
                pairs.len()
            )));
        }

        let extra_pair = match &extra_value {
            Some(value) => {
                let mut declared: Vec<&str> = required.clone();
                if let Some(props) = properties {
                    declared.extend(props.keys().map(String::as_str));
                }
                let key = self.undeclared_key(&declared);
                Some(self.add_rule("additional_pair", format!("{key} {kv} {value}")))
            }
            None => None,
        };
        let sep = self.item_separator(self.spacing, depth);

        if pairs.is_empty() {
            let Some(pair) = extra_pair else {
                return Ok(self.container('{', '}', "", true, depth));
            };
            let rest = repeat(
                &format!("({sep} {pair})"),
                min.saturating_sub(1),
                max.map(|m| m.saturating_sub(1)),
            );
            let content = format!("{pair} {rest}");
            return Ok(self.container('{', '}', content.trim_end(), min == 0, depth));
        }
        if max.is_some() || min > 0 {
            debug!("property count bounds next to declared properties are widened");
        }

        match self.options.property_order {
            PropertyOrder::Declared => {
                let (content, optional) = self.declared_order(&pairs, extra_pair.as_deref(), &sep);
                Ok(self.container('{', '}', &content, optional, depth))
            }
            PropertyOrder::Any => {
                let (content, optional) = self.any_order(pairs, extra_pair, &sep, min);
                Ok(self.container('{', '}', &content, optional, depth))
            }
        }
    }

    /// Properties in any order. Each rule `rest_s` continues an object in
    /// which the required properties in the bit set `s` have been written;
    /// the object may close only once all of them have.
    fn any_order(&mut self, pairs: Vec<(String, bool)>, extra: Option<String>, sep: &str, min: u64) -> (String, bool) {
        let (required, optional): (Vec<_>, Vec<_>) = pairs.into_iter().partition(|(_, r)| *r);
        if required.is_empty() || required.len() > MAX_TRACKED_REQUIRED {
            let may_be_empty = required.is_empty() && min == 0;
            if !required.is_empty() {
                debug!(count = required.len(), "too many required properties to track, not enforced");
            }
            let mut alts: Vec<String> = required.into_iter().chain(optional).map(|(pair, _)| pair).collect();
            alts.extend(extra);
            let pair = self.add_rule("any_pair", alts.join(" | "));
            return (format!("{pair} ({sep} {pair})*"), may_be_empty);
        }

        let mut free: Vec<String> = optional.into_iter().map(|(pair, _)| pair).collect();
        free.extend(extra);
        let free = match free.len() {
            0 => None,
            1 => free.pop(),
            _ => Some(self.add_rule("free_pair", free.join(" | "))),
        };
        let required: Vec<String> = required
            .into_iter()
            .map(|(pair, _)| self.add_rule("required_pair", pair))
            .collect();

        let n = required.len();
        let full = (1usize << n) - 1;
        let free_star = free.as_ref().map(|f| format!("({sep} {f})*")).unwrap_or_default();
        let mut rest = vec![String::new(); full + 1];
        for seen in (0..=full).rev() {
            let next: Vec<String> = (0..n)
                .filter(|i| seen & (1 << i) == 0)
                .map(|i| format!("{sep} {} {}", required[i], rest[seen | (1 << i)]).trim_end().to_string())
                .collect();
            let body = match alternation(next) {
                Some(next) => format!("{free_star} {next}"),
                None => free_star.clone(),
            };
            let body = body.trim();
            if !body.is_empty() {
                rest[seen] = self.add_rule("object_rest", body.to_string());
            }
        }

        let mut starts = Vec::with_capacity(n + 1);
        if let Some(free) = &free {
            starts.push(format!("{free} {}", rest[0]).trim_end().to_string());
        }
        for (i, pair) in required.iter().enumerate() {
            starts.push(format!("{pair} {}", rest[1 << i]).trim_end().to_string());
        }
        (alternation(starts).unwrap_or_default(), false)
    }

    /// A JSON string that spells none of `keys`. Keys that need escaping
    /// are not excluded, and neither are escaped spellings of the others.
    fn undeclared_key(&mut self, keys: &[&str]) -> String {
        let excluded: Vec<Vec<char>> = keys
            .iter()
            .filter(|k| !k.chars().any(|c| c == '"' || c == '\\' || (c as u32) < 0x20))
            .map(|k| k.chars().collect())
            .collect();
        if excluded.is_empty() {
            return self.basic(Basic::String);
        }
        let ch = self.basic(Basic::Char);
        let body = self.key_suffix(&excluded, 0, &ch);
        self.add_rule("undeclared_key", format!("{QUOTE} {body}"))
    }

    /// The rest of an undeclared key after a shared prefix of `depth`
    /// characters of every key in `keys`.
    fn key_suffix(&mut self, keys: &[Vec<char>], depth: usize, ch: &str) -> String {
        let mut alts = Vec::new();
        if !keys.iter().any(|k| k.len() == depth) {
            alts.push(QUOTE.to_string());
        }
        let mut children: Vec<char> = keys.iter().filter_map(|k| k.get(depth).copied()).collect();
        children.sort_unstable();
        children.dedup();

        let listed: String = children.iter().map(|c| format!("\\u{{{:x}}}", *c as u32)).collect();
        alts.push(format!(r#"[^"\\\x00-\x1f{listed}] {ch}* {QUOTE}"#));
        alts.push(format!(r#""\\" (["\\/bfnrt] | "u" [0-9a-fA-F]{{4}}) {ch}* {QUOTE}"#));
        for c in children {
            let branch: Vec<Vec<char>> = keys.iter().filter(|k| k.get(depth) == Some(&c)).cloned().collect();
            let next = self.key_suffix(&branch, depth + 1, ch);
            alts.push(format!("{} {next}", quote_literal(&c.to_string())));
        }
        self.add_rule("key_suffix", alts.join(" | "))
    }

    /// Properties in declaration order. `rest_i` is what may follow once
    /// something has been written and properties before `i` are settled;
    /// the object starts with one of the properties up to and including the
    /// first required one.
    fn declared_order(&mut self, pairs: &[(String, bool)], extra: Option<&str>, sep: &str) -> (String, bool) {
        let n = pairs.len();
        let mut rest: Vec<String> = vec![String::new(); n + 1];
        if let Some(extra) = extra {
            rest[n] = format!("({sep} {extra})*");
        }
        for i in (1..n).rev() {
            let (pair, is_required) = &pairs[i];
            let next = &rest[i + 1];
            let body = if *is_required {
                format!("{sep} {pair} {next}")
            } else {
                format!("({sep} {pair})? {next}")
            };
            rest[i] = self.add_rule("object_rest", body.trim_end().to_string());
        }

        let first_required = pairs.iter().position(|(_, r)| *r);
        let last_start = first_required.unwrap_or(n - 1);
        let mut starts = Vec::with_capacity(last_start + 2);
        for (i, (pair, _)) in pairs.iter().enumerate().take(last_start + 1) {
            starts.push(format!("{pair} {}", rest[i + 1]).trim_end().to_string());
        }
        if first_required.is_none() {
            if let Some(extra) = extra {
                starts.push(format!("{extra} {}", rest[n]));
            }
        }
        let content = if starts.len() == 1 {
            starts.remove(0)
        } else {
            format!("({})", starts.join(" | "))
        };
        (content, first_required.is_none())
    }

    fn merge_all_of(&self, obj: &Map<String, Value>, parts: &Value) -> Result<Value> {
        let parts = parts
            .as_array()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| GrammarError::invalid("`allOf` must be a non-empty array"))?;
        let mut merged = obj.clone();
        merged.remove("allOf");
        for part in parts {
            self.merge_part(&mut merged, part, 0)?;
        }
        Ok(Value::Object(merged))
    }

    fn merge_part(&self, target: &mut Map<String, Value>, part: &Value, chain: usize) -> Result<()> {
        let part = match part {
            Value::Bool(true) => return Ok(()),
            Value::Bool(false) => {
                return Err(GrammarError::unrepresentable("`allOf` contains schema `false`"));
            }
            Value::Object(part) => part,
            other => return Err(GrammarError::invalid(format!("invalid `allOf` entry `{other}`"))),
        };
        self.check_keywords(part)?;
        if let Some(reference) = part.get("$ref").and_then(Value::as_str) {
            if chain >= MAX_REF_CHAIN {
                return Err(GrammarError::invalid(format!("`$ref` chain through `{reference}` is too deep")));
            }
            let resolved = self.resolve(reference)?;
            return self.merge_part(target, resolved, chain + 1);
        }
        for (key, value) in part {
            match key.as_str() {
                "$defs" | "definitions" => {}
                "allOf" => {
                    for nested in value.as_array().into_iter().flatten() {
                        self.merge_part(target, nested, chain)?;
                    }
                }
                "properties" => {
                    let entry = target
                        .entry("properties")
                        .or_insert_with(|| Value::Object(Map::new()));
                    let (Value::Object(into), Value::Object(from)) = (entry, value) else {
                        return Err(GrammarError::invalid("`properties` must be an object"));
                    };
                    for (name, schema) in from {
                        match into.get_mut(name) {
                            Some(existing) if *existing != *schema => {
                                let both = serde_json::json!({ "allOf": [existing.take(), schema.clone()] });
                                *existing = both;
                            }
                            Some(_) => {}
                            None => {
                                into.insert(name.clone(), schema.clone());
                            }
                        }
                    }
                }
                "required" => {
                    let entry = target.entry("required").or_insert_with(|| Value::Array(Vec::new()));
                    if let (Value::Array(into), Value::Array(from)) = (entry, value) {
                        for name in from {
                            if !into.contains(name) {
                                into.push(name.clone());
                            }
                        }
                    }
                }
                "type" => {
                    let merged = match target.get("type") {
                        Some(existing) => intersect_types(existing, value)?,
                        None => value.clone(),
                    };
                    target.insert("type".into(), merged);
                }
                "minimum" | "exclusiveMinimum" | "minLength" | "minItems" | "minProperties" => {
                    tighten(target, key, value, |new, old| new > old);
                }
                "maximum" | "exclusiveMaximum" | "maxLength" | "maxItems" | "maxProperties" => {
                    tighten(target, key, value, |new, old| new < old);
                }
                _ => match target.get(key) {
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                    Some(existing) if existing == value => {}
                    Some(_) => debug!(keyword = %key, "conflicting `allOf` keyword, keeping the first"),
                },
            }
        }
        Ok(())
    }
}

fn visit_integer(obj: &Map<String, Value>) -> Result<String> {
    let lo = [
        obj.get("minimum")
            .map(|v| int_bound(v, exclusive_flag(obj, "exclusiveMinimum"), true))
            .transpose()?,
        obj.get("exclusiveMinimum")
            .filter(|v| !v.is_boolean())
            .map(|v| int_bound(v, true, true))
            .transpose()?,
    ]
    .into_iter()
    .flatten()
    .flatten()
    .max();
    let hi = [
        obj.get("maximum")
            .map(|v| int_bound(v, exclusive_flag(obj, "exclusiveMaximum"), false))
            .transpose()?,
        obj.get("exclusiveMaximum")
            .filter(|v| !v.is_boolean())
            .map(|v| int_bound(v, true, false))
            .transpose()?,
    ]
    .into_iter()
    .flatten()
    .flatten()
    .min();
    if let (Some(lo), Some(hi)) = (lo, hi) {
        if lo > hi {
            return Err(GrammarError::unrepresentable(format!("no integer in [{lo}, {hi}]")));
        }
    }
    Ok(numeric::integer_range(lo, hi))
}

fn visit_number(obj: &Map<String, Value>) -> Result<String> {
    let lo = number_bound(obj, "minimum", "exclusiveMinimum", true)?;
    let hi = number_bound(obj, "maximum", "exclusiveMaximum", false)?;
    if let (Some((lo, lo_ex)), Some((hi, hi_ex))) = (lo, hi) {
        if lo > hi || (lo == hi && (lo_ex || hi_ex)) {
            return Err(GrammarError::unrepresentable(format!("no number between {lo} and {hi}")));
        }
    }
    if lo.is_some() || hi.is_some() {
        debug!("number bounds are widened");
    }
    Ok(format!("({})", numeric::NUMBER))
}

/// Draft 4 spells exclusivity as a boolean next to `minimum`/`maximum`.
fn exclusive_flag(obj: &Map<String, Value>, key: &str) -> bool {
    matches!(obj.get(key), Some(Value::Bool(true)))
}

/// The integer bound implied by `value`. Bounds outside `i64` are dropped,
/// which only widens.
fn int_bound(value: &Value, exclusive: bool, lower: bool) -> Result<Option<i64>> {
    if let Some(i) = value.as_i64() {
        return Ok(match (exclusive, lower) {
            (false, _) => Some(i),
            (true, true) => i.checked_add(1),
            (true, false) => i.checked_sub(1),
        });
    }
    let f = value
        .as_f64()
        .ok_or_else(|| GrammarError::invalid(format!("numeric bound expected, got `{value}`")))?;
    let bound = match (lower, exclusive && f.fract() == 0.0) {
        (true, false) => f.ceil(),
        (true, true) => f + 1.0,
        (false, false) => f.floor(),
        (false, true) => f - 1.0,
    };
    Ok(((i64::MIN as f64)..(i64::MAX as f64)).contains(&bound).then_some(bound as i64))
}

/// The tighter of the inclusive and exclusive bounds, as `(value, exclusive)`.
fn number_bound(obj: &Map<String, Value>, key: &str, exclusive_key: &str, lower: bool) -> Result<Option<(f64, bool)>> {
    let as_number = |v: &Value| {
        v.as_f64()
            .ok_or_else(|| GrammarError::invalid(format!("numeric bound expected, got `{v}`")))
    };
    let inclusive = obj.get(key).map(as_number).transpose()?;
    let draft4 = exclusive_flag(obj, exclusive_key);
    let exclusive = obj
        .get(exclusive_key)
        .filter(|v| !v.is_boolean())
        .map(as_number)
        .transpose()?;
    Ok(match (inclusive, exclusive) {
        (Some(i), None) => Some((i, draft4)),
        (None, Some(e)) => Some((e, true)),
        (Some(i), Some(e)) => {
            let exclusive_tighter = if lower { e >= i } else { e <= i };
            Some(if exclusive_tighter { (e, true) } else { (i, draft4) })
        }
        (None, None) => None,
    })
}

fn count(obj: &Map<String, Value>, key: &str) -> Result<Option<u64>> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| GrammarError::invalid(format!("`{key}` must be a non-negative integer"))),
    }
}

/// `item` repeated between `min` and `max` times. Counts beyond
/// `MAX_EXACT_COUNT` are widened.
fn repeat(item: &str, min: u64, max: Option<u64>) -> String {
    let max = max.filter(|&m| m <= MAX_EXACT_COUNT);
    let min = min.min(MAX_EXACT_COUNT);
    match (min, max) {
        (0, Some(0)) => String::new(),
        (0, None) => format!("{item}*"),
        (1, None) => format!("{item}+"),
        (0, Some(1)) => format!("{item}?"),
        (1, Some(1)) => item.to_string(),
        (min, None) => format!("{item}{{{min},}}"),
        (min, Some(max)) if min == max => format!("{item}{{{min}}}"),
        (min, Some(max)) => format!("{item}{{{min},{max}}}"),
    }
}

fn alternation(mut alts: Vec<String>) -> Option<String> {
    let mut seen = FxHashSet::default();
    alts.retain(|a| seen.insert(a.clone()));
    match alts.len() {
        0 => None,
        1 => alts.pop(),
        _ => Some(format!("({})", alts.join(" | "))),
    }
}

/// The JSON-encoded property name as an EBNF literal.
fn json_key(key: &str) -> String {
    let mut text = String::with_capacity(key.len() + 2);
    text.push('"');
    for c in key.chars() {
        push_json_char(&mut text, c);
    }
    text.push('"');
    quote_literal(&text)
}

fn infer_type(obj: &Map<String, Value>) -> Option<&'static str> {
    let has = |keys: &[&str]| keys.iter().any(|k| obj.contains_key(*k));
    if has(&["properties", "required", "additionalProperties", "minProperties", "maxProperties"]) {
        Some("object")
    } else if has(&["items", "prefixItems", "minItems", "maxItems"]) {
        Some("array")
    } else if has(&["pattern", "minLength", "maxLength", "format"]) {
        Some("string")
    } else if has(&["minimum", "maximum", "exclusiveMinimum", "exclusiveMaximum"]) {
        Some("number")
    } else {
        None
    }
}

fn type_matches(ty: &str, value: &Value) -> bool {
    match ty {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64() || value.as_f64().is_some_and(|f| f.fract() == 0.0),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => false,
    }
}

/// Whether an `enum`/`const` value survives the sibling `type`, length,
/// pattern and bound constraints.
fn literal_allowed(obj: &Map<String, Value>, value: &Value) -> Result<bool> {
    let type_ok = match obj.get("type") {
        Some(Value::String(ty)) => type_matches(ty, value),
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).any(|ty| type_matches(ty, value)),
        _ => true,
    };
    if !type_ok {
        return Ok(false);
    }
    if let Some(s) = value.as_str() {
        let len = s.chars().count() as u64;
        if count(obj, "minLength")?.is_some_and(|min| len < min)
            || count(obj, "maxLength")?.is_some_and(|max| len > max)
        {
            return Ok(false);
        }
        if let Some(pattern) = obj.get("pattern").and_then(Value::as_str) {
            let automaton = PushdownAutomaton::build(&regex_to_grammar(pattern)?)?;
            if !automaton.accepts(s.as_bytes()) {
                return Ok(false);
            }
        }
    }
    if let Some(n) = value.as_f64() {
        if let Some((lo, exclusive)) = number_bound(obj, "minimum", "exclusiveMinimum", true)? {
            if n < lo || (exclusive && n == lo) {
                return Ok(false);
            }
        }
        if let Some((hi, exclusive)) = number_bound(obj, "maximum", "exclusiveMaximum", false)? {
            if n > hi || (exclusive && n == hi) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn intersect_types(a: &Value, b: &Value) -> Result<Value> {
    let list = |v: &Value| -> Vec<String> {
        match v {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).map(String::from).collect(),
            _ => Vec::new(),
        }
    };
    let (a, b) = (list(a), list(b));
    let mut out: Vec<Value> = Vec::new();
    for ty in &a {
        let keep = if b.contains(ty) {
            Some(ty.as_str())
        } else if ty == "integer" && b.iter().any(|t| t == "number") {
            Some("integer")
        } else if ty == "number" && b.iter().any(|t| t == "integer") {
            Some("integer")
        } else {
            None
        };
        if let Some(keep) = keep {
            let keep = Value::String(keep.into());
            if !out.contains(&keep) {
                out.push(keep);
            }
        }
    }
    if out.is_empty() {
        return Err(GrammarError::unrepresentable("`allOf` branches share no type"));
    }
    Ok(Value::Array(out))
}

fn tighten(target: &mut Map<String, Value>, key: &str, value: &Value, tighter: impl Fn(f64, f64) -> bool) {
    let replace = match (target.get(key).and_then(Value::as_f64), value.as_f64()) {
        (Some(old), Some(new)) => tighter(new, old),
        (None, _) => true,
        (Some(_), None) => false,
    };
    if replace {
        target.insert(key.to_string(), value.clone());
    }
}

fn sanitize_rule_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, ch) in name.chars().enumerate() {
        let ok = if i == 0 {
            ch.is_ascii_alphabetic() || ch == '_'
        } else {
            ch.is_ascii_alphanumeric() || ch == '_'
        };
        if ok {
            out.push(ch);
        } else if i == 0 && ch.is_ascii_digit() {
            out.push('_');
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push_str("rule");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(schema: Value, options: &JsonSchemaOptions) -> PushdownAutomaton {
        let grammar = schema_value_to_grammar(&schema, options).unwrap();
        PushdownAutomaton::build(&grammar).unwrap()
    }

    fn compact() -> JsonSchemaOptions {
        JsonSchemaOptions {
            any_whitespace: false,
            ..Default::default()
        }
    }

    fn declared() -> JsonSchemaOptions {
        JsonSchemaOptions {
            strict_mode: true,
            property_order: PropertyOrder::Declared,
            ..compact()
        }
    }

    fn unrepresentable(schema: Value) {
        match schema_value_to_grammar(&schema, &compact()) {
            Err(GrammarError::Unrepresentable(_)) => {}
            other => panic!("expected Unrepresentable for {schema}, got {other:?}"),
        }
    }

    fn invalid(schema: Value, options: &JsonSchemaOptions) {
        match schema_value_to_grammar(&schema, options) {
            Err(GrammarError::InvalidSpecification(_)) => {}
            other => panic!("expected InvalidSpecification for {schema}, got {other:?}"),
        }
    }

    #[test]
    fn test_declared_order_with_optional_properties() {
        let pda = compile(
            json!({
                "type": "object",
                "properties": {
                    "a": {"type": "integer"},
                    "b": {"type": "string"},
                    "c": {"type": "boolean"}
                },
                "required": ["b"]
            }),
            &declared(),
        );
        assert!(pda.accepts(br#"{"b":"x"}"#));
        assert!(pda.accepts(br#"{"a":1,"b":"x"}"#));
        assert!(pda.accepts(br#"{"a":1,"b":"x","c":true}"#));
        assert!(pda.accepts(br#"{"b":"x","c":false}"#));
        assert!(!pda.accepts(br#"{"a":1}"#));
        assert!(!pda.accepts(br#"{"b":"x","a":1}"#));
        assert!(!pda.accepts(br#"{,"b":"x"}"#));
        assert!(!pda.accepts(br#"{"b":"x","d":1}"#));
    }

    #[test]
    fn test_all_optional_allows_empty_object() {
        let pda = compile(
            json!({"properties": {"a": {"type": "null"}, "b": {"type": "null"}}}),
            &compact(),
        );
        assert!(pda.accepts(b"{}"));
        assert!(pda.accepts(br#"{"b":null}"#));
        assert!(pda.accepts(br#"{"a":null,"b":null}"#));
    }

    #[test]
    fn test_any_order() {
        let options = JsonSchemaOptions {
            property_order: PropertyOrder::Any,
            ..compact()
        };
        let pda = compile(
            json!({"properties": {"a": {"type": "integer"}, "b": {"type": "integer"}}, "required": ["a"]}),
            &options,
        );
        assert!(pda.accepts(br#"{"b":2,"a":1}"#));
        assert!(pda.accepts(br#"{"a":1,"b":2}"#));
        assert!(!pda.accepts(br#"{"b":2}"#));
        assert!(!pda.accepts(b"{}"));
    }

    #[test]
    fn test_default_options_accept_any_valid_object() {
        let pda = compile(
            json!({
                "type": "object",
                "properties": {"city": {"type": "string"}, "state": {"type": "string"}},
                "required": ["city", "state"]
            }),
            &compact(),
        );
        assert!(pda.accepts(br#"{"city":"NYC","state":"NY"}"#));
        assert!(pda.accepts(br#"{"state":"NY","city":"NYC"}"#));
        assert!(pda.accepts(br#"{"city":"NYC","state":"NY","zip":"10001"}"#));
        assert!(pda.accepts(br#"{"zip":10001,"state":"NY","ci":[],"city":"NYC"}"#));
        assert!(pda.accepts(br#"{"cityx":1,"city":"NYC","state":"NY"}"#));
        assert!(!pda.accepts(br#"{"state":"NY"}"#));
        assert!(!pda.accepts(br#"{"city":"NYC","zip":"10001"}"#));
        // A declared key cannot take the undeclared route with a bad value.
        assert!(!pda.accepts(br#"{"city":"NYC","state":"NY","city":1}"#));
        assert!(!pda.accepts(br#"{"city":1,"state":"NY"}"#));
    }

    #[test]
    fn test_required_tracking_limit_widens() {
        let names: Vec<String> = (0..=MAX_TRACKED_REQUIRED).map(|i| format!("k{i}")).collect();
        let properties: Map<String, Value> =
            names.iter().map(|n| (n.clone(), json!({"type": "integer"}))).collect();
        let pda = compile(
            json!({"type": "object", "properties": properties, "required": names}),
            &compact(),
        );
        assert!(pda.accepts(br#"{"k3":1}"#));
        assert!(!pda.accepts(br#"{"k3":"x"}"#));
    }
    #[test]
    fn test_additional_properties_schema() {
        let pda = compile(
            json!({"properties": {"id": {"type": "integer"}}, "required": ["id"], "additionalProperties": {"type": "string"}}),
            &compact(),
        );
        assert!(pda.accepts(br#"{"id":1,"note":"x","tag":"y"}"#));
        assert!(!pda.accepts(br#"{"id":1,"note":2}"#));
    }

    #[test]
    fn test_free_whitespace() {
        let pda = compile(
            json!({"type": "object", "properties": {"xs": {"type": "array", "items": {"type": "integer"}}}, "required": ["xs"]}),
            &JsonSchemaOptions::default(),
        );
        assert!(pda.accepts(b"{ \"xs\" : [ 1 , 2 ] }"));
        assert!(pda.accepts(br#"{"xs":[]}"#));
        assert!(pda.accepts(b"{\n  \"xs\": [\n    3\n  ]\n}"));
    }

    #[test]
    fn test_indent_layout() {
        let options = JsonSchemaOptions {
            any_whitespace: false,
            indent: Some(2),
            ..Default::default()
        };
        let pda = compile(
            json!({"properties": {"a": {"type": "integer"}, "b": {"type": "array", "items": {"type": "integer"}}}, "required": ["a", "b"]}),
            &options,
        );
        assert!(pda.accepts(b"{\n  \"a\": 1,\n  \"b\": [\n    1,\n    2\n  ]\n}"));
        assert!(pda.accepts(b"{\n  \"a\": 1,\n  \"b\": []\n}"));
        assert!(!pda.accepts(br#"{"a":1,"b":[]}"#));
    }

    #[test]
    fn test_custom_separators() {
        let options = JsonSchemaOptions {
            separators: Some((", ".into(), ": ".into())),
            ..compact()
        };
        let pda = compile(
            json!({"properties": {"a": {"type": "integer"}, "b": {"type": "integer"}}, "required": ["a", "b"]}),
            &options,
        );
        assert!(pda.accepts(br#"{"a": 1, "b": 2}"#));
        assert!(!pda.accepts(br#"{"a":1,"b":2}"#));
    }

    #[test]
    fn test_arrays() {
        let pda = compile(json!({"type": "array", "items": {"type": "integer"}, "minItems": 1, "maxItems": 3}), &compact());
        assert!(!pda.accepts(b"[]"));
        assert!(pda.accepts(b"[1]"));
        assert!(pda.accepts(b"[1,2,3]"));
        assert!(!pda.accepts(b"[1,2,3,4]"));

        let tuple = compile(
            json!({"prefixItems": [{"type": "string"}, {"type": "integer"}], "items": false}),
            &compact(),
        );
        assert!(tuple.accepts(b"[]"));
        assert!(tuple.accepts(br#"["a"]"#));
        assert!(tuple.accepts(br#"["a",1]"#));
        assert!(!tuple.accepts(br#"["a",1,2]"#));
        assert!(!tuple.accepts(br#"[1]"#));

        let prefix = json!({"prefixItems": [{"type": "string"}, {"type": "integer"}]});
        let open = compile(prefix.clone(), &compact());
        assert!(open.accepts(br#"["a",1,true,{"x":null}]"#));
        assert!(!open.accepts(br#"[1,"a"]"#));
        let closed = compile(prefix, &declared());
        assert!(closed.accepts(br#"["a",1]"#));
        assert!(!closed.accepts(br#"["a",1,true]"#));
    }

    #[test]
    fn test_string_constraints() {
        let pda = compile(json!({"type": "string", "minLength": 2, "maxLength": 3}), &compact());
        assert!(!pda.accepts(br#""a""#));
        assert!(pda.accepts(br#""ab""#));
        assert!(pda.accepts(br#""a\n""#));
        assert!(!pda.accepts(br#""abcd""#));

        let pattern = compile(json!({"type": "string", "pattern": "^[a-z]+\"?$"}), &compact());
        assert!(pattern.accepts(br#""abc\"""#));
        assert!(!pattern.accepts(br#""ab"""#));

        let date = compile(json!({"type": "string", "format": "date"}), &compact());
        assert!(date.accepts(br#""2024-05-01""#));
        assert!(!date.accepts(br#""2024-5-1""#));
    }

    #[test]
    fn test_integer_bounds() {
        let pda = compile(json!({"type": "integer", "minimum": -3, "exclusiveMaximum": 12}), &compact());
        assert!(pda.accepts(b"-3"));
        assert!(pda.accepts(b"11"));
        assert!(!pda.accepts(b"12"));
        assert!(!pda.accepts(b"-4"));
        assert!(!pda.accepts(b"1.5"));
        // Integral values in number syntax are not generated.
        assert!(!pda.accepts(b"1.0"));
        assert!(!pda.accepts(b"1e1"));
    }

    #[test]
    fn test_enum_and_const() {
        let pda = compile(json!({"enum": ["red", 1, null, {"k": [true]}]}), &compact());
        assert!(pda.accepts(br#""red""#));
        assert!(pda.accepts(b"1"));
        assert!(pda.accepts(b"null"));
        assert!(pda.accepts(br#"{"k":[true]}"#));
        assert!(!pda.accepts(br#""blue""#));

        let filtered = compile(json!({"type": "string", "enum": ["a", 2, "bcd"], "maxLength": 2}), &compact());
        assert!(filtered.accepts(br#""a""#));
        assert!(!filtered.accepts(b"2"));
        assert!(!filtered.accepts(br#""bcd""#));
    }

    #[test]
    fn test_refs_and_recursion() {
        let pda = compile(
            json!({
                "$defs": {
                    "node": {
                        "type": "object",
                        "properties": {
                            "v": {"type": "integer"},
                            "next": {"anyOf": [{"$ref": "#/$defs/node"}, {"type": "null"}]}
                        },
                        "required": ["v", "next"]
                    }
                },
                "$ref": "#/$defs/node"
            }),
            &compact(),
        );
        assert!(pda.accepts(br#"{"v":1,"next":{"v":2,"next":null}}"#));
        assert!(!pda.accepts(br#"{"v":1,"next":{"v":2}}"#));
    }

    #[test]
    fn test_all_of_merges_objects() {
        let pda = compile(
            json!({
                "allOf": [
                    {"properties": {"a": {"type": "integer"}}, "required": ["a"]},
                    {"properties": {"b": {"type": "string"}}, "required": ["b"]}
                ]
            }),
            &compact(),
        );
        assert!(pda.accepts(br#"{"a":1,"b":"x"}"#));
        assert!(!pda.accepts(br#"{"a":1}"#));
    }

    #[test]
    fn test_type_union_and_any() {
        let pda = compile(json!({"type": ["integer", "null"]}), &compact());
        assert!(pda.accepts(b"5"));
        assert!(pda.accepts(b"null"));
        assert!(!pda.accepts(b"true"));

        let any = compile(json!(true), &compact());
        assert!(any.accepts(br#"{"a":[1,"b",null,{"c":-2.5e3}]}"#));
    }

    #[test]
    fn test_unrepresentable_cases() {
        unrepresentable(json!(false));
        unrepresentable(json!({"type": "integer", "minimum": 5, "maximum": 4}));
        unrepresentable(json!({"type": "integer", "exclusiveMinimum": 1, "exclusiveMaximum": 2}));
        unrepresentable(json!({"type": "string", "minLength": 3, "maxLength": 2}));
        unrepresentable(json!({"type": "array", "minItems": 3, "maxItems": 2}));
        unrepresentable(json!({"type": "object", "minProperties": 3, "maxProperties": 2}));
        unrepresentable(json!({"required": ["a", "b"], "maxProperties": 1}));
        unrepresentable(json!({"properties": {"a": false}, "required": ["a"]}));
        unrepresentable(json!({"properties": {"a": {}}, "required": ["b"], "additionalProperties": false}));
        unrepresentable(json!({"type": "string", "enum": [1, 2]}));
        unrepresentable(json!({"anyOf": [false, {"type": "integer", "minimum": 2, "maximum": 1}]}));
        unrepresentable(json!({"type": []}));
        unrepresentable(json!({"type": "string", "pattern": "[^\\x00-\\x{10FFFF}]"}));
    }

    #[test]
    fn test_keyword_policy() {
        let schema = json!({"type": "integer", "multipleOf": 3});
        let widened = compile(schema.clone(), &compact());
        assert!(widened.accepts(b"4"));
        let strict = JsonSchemaOptions {
            unsupported_keywords: KeywordPolicy::Reject,
            ..compact()
        };
        invalid(schema, &strict);
        invalid(json!({"type": "integer", "minimun": 3}), &compact());
        invalid(json!({"$ref": "#/$defs/missing"}), &compact());
        invalid(json!({"type": "strin"}), &compact());
    }

    #[test]
    fn test_optional_false_property_is_dropped() {
        let pda = compile(json!({"properties": {"a": false, "b": {"type": "null"}}}), &compact());
        assert!(pda.accepts(br#"{"b":null}"#));
        assert!(!pda.accepts(br#"{"a":null}"#));
    }

    #[test]
    fn test_builtin_json_grammar() {
        let pda = PushdownAutomaton::build(&builtin_json_grammar().unwrap()).unwrap();
        assert!(pda.accepts(r#"{"a": [1, 2.5, "xé"], "b": {"c": null}}"#.as_bytes()));
        assert!(!pda.accepts(br#"{"a": }"#));
    }
}
