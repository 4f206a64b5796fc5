//! Grammar-constrained token generation.
//!
//! Before each sampling step the engine narrows the vocabulary to the
//! tokens that keep the output inside a formal constraint: a JSON Schema,
//! an EBNF grammar, a regular expression, or a structural tag that embeds
//! schema-constrained segments in free text.
//!
//! # Usage
//!
//! 1. **Describe the constraint** with a [`ConstraintSpec`], usually taken
//!    from the request with [`ConstraintSpec::from_request`]
//! 2. **Compile it** against the model's [`Vocabulary`] through the shared
//!    [`GrammarCache`]
//! 3. **Open a session**: a [`GrammarMatcher`] for plain constraints, a
//!    [`TagDispatcher`] for structural tags
//! 4. **Loop**: `fill_next_token_bitmask` → mask logits → sample → `consume`
//!
//! ```rust
//! use std::sync::Arc;
//! use pie_structured::{
//!     bitmask, ConstraintSpec, GrammarCache, GrammarMatcher, JsonSchemaOptions,
//!     MatcherState, SessionConfig, Vocabulary,
//! };
//!
//! let vocab = Arc::new(
//!     Vocabulary::from_bytes(
//!         vec![b"</s>".to_vec(), b"yes".to_vec(), b"no".to_vec(), b"maybe".to_vec()],
//!         None,
//!     )
//!     .unwrap()
//!     .with_stop_tokens(&[0])
//!     .unwrap(),
//! );
//!
//! let spec = ConstraintSpec::Ebnf(r#"root ::= "yes" | "no""#.into());
//! let compiled = GrammarCache::global()
//!     .get_or_compile(&spec, &vocab, &JsonSchemaOptions::default())
//!     .unwrap();
//! let mut matcher = GrammarMatcher::new(Arc::clone(compiled.grammar()), SessionConfig::default());
//!
//! let mut bm = vec![0u32; bitmask::bitmask_size(vocab.vocab_size())];
//! matcher.fill_next_token_bitmask(&mut bm);
//! assert!(bitmask::get_bit(&bm, 1));  // "yes"
//! assert!(bitmask::get_bit(&bm, 2));  // "no"
//! assert!(!bitmask::get_bit(&bm, 3)); // "maybe"
//!
//! matcher.consume(1).unwrap();
//! assert_eq!(matcher.consume(0), Ok(MatcherState::Accepted));
//! ```
//!
//! # JSON Schema
//!
//! ```rust
//! use pie_structured::json_schema::{json_schema_to_grammar, JsonSchemaOptions};
//!
//! let grammar = json_schema_to_grammar(r#"{
//!     "type": "object",
//!     "properties": {
//!         "name": {"type": "string"},
//!         "age": {"type": "integer", "minimum": 0}
//!     },
//!     "required": ["name", "age"]
//! }"#, &JsonSchemaOptions::default()).unwrap();
//! ```
//!
//! # Regex
//!
//! ```rust
//! use pie_structured::regex::regex_to_grammar;
//!
//! let grammar = regex_to_grammar(r"[a-z]+@[a-z]+\.[a-z]{2,4}").unwrap();
//! ```
//!
//! # Reasoning spans
//!
//! Hosts that let the model think before answering report, once per step,
//! whether generation is inside the reasoning span with
//! [`GrammarMatcher::observe_reasoning`]. The automaton is frozen there and
//! every token is allowed.

pub mod automaton;
pub mod bitmask;
pub mod cache;
pub mod compiled;
pub mod config;
pub mod constraint;
pub mod dispatcher;
pub mod error;
pub mod grammar;
pub mod json_schema;
pub mod logging;
pub mod mask;
pub mod matcher;
pub mod regex;
pub mod structural_tag;
pub mod vocab;

pub use cache::{CacheConfig, CacheStats, GrammarCache};
pub use compiled::{CompiledConstraint, CompiledGrammar};
pub use config::EngineConfig;
pub use constraint::ConstraintSpec;
pub use dispatcher::{DispatchEvent, Segment, TagDispatcher};
pub use error::{DriftFault, GrammarError};
pub use grammar::Grammar;
pub use json_schema::{JsonSchemaOptions, KeywordPolicy, PropertyOrder};
pub use mask::TokenMask;
pub use matcher::{GrammarMatcher, MatcherState, SessionConfig};
pub use structural_tag::StructuralTagSpec;
pub use vocab::{VocabType, Vocabulary};
