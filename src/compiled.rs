//! Compiled constraints: automata bound to one vocabulary.
//!
//! A [`CompiledGrammar`] pairs a pushdown automaton with the vocabulary it
//! masks against and a bounded memo of masks per automaton state. A
//! [`CompiledConstraint`] is what the cache stores: the main grammar and,
//! for structural tags, the trigger finder and one grammar per trigger.
//! Both are immutable once built apart from the mask memo, so they are
//! shared between sessions through `Arc`. Memoized masks may draw on a
//! [`MemoryBudget`] shared with the cache that owns the constraint.

use std::num::NonZeroUsize;
use std::sync::Arc;

use aho_corasick::{AhoCorasick, MatchKind};

use crate::automaton::{PushdownAutomaton, State};
use crate::constraint::{ConstraintGrammar, ConstraintSpec};
use crate::error::{GrammarError, Result};
use crate::grammar::Grammar;
use crate::json_schema::JsonSchemaOptions;
use crate::mask::{MaskCache, MaskEngine, MemoryBudget, TokenMask};
use crate::vocab::Vocabulary;

/// An automaton ready to produce token masks.
pub struct CompiledGrammar {
    grammar: Grammar,
    automaton: PushdownAutomaton,
    vocab: Arc<Vocabulary>,
    masks: MaskCache,
    exit_masks: MaskCache,
}

impl CompiledGrammar {
    pub fn new(grammar: Grammar, vocab: Arc<Vocabulary>, mask_entries: NonZeroUsize) -> Result<Self> {
        Self::build(grammar, vocab, mask_entries, None)
    }

    /// Like [`new`](Self::new), with memoized masks charged to `budget`.
    pub fn with_budget(
        grammar: Grammar,
        vocab: Arc<Vocabulary>,
        mask_entries: NonZeroUsize,
        budget: Arc<MemoryBudget>,
    ) -> Result<Self> {
        Self::build(grammar, vocab, mask_entries, Some(budget))
    }

    fn build(
        grammar: Grammar,
        vocab: Arc<Vocabulary>,
        mask_entries: NonZeroUsize,
        budget: Option<Arc<MemoryBudget>>,
    ) -> Result<Self> {
        let automaton = PushdownAutomaton::build(&grammar)?;
        let memo = |budget: Option<Arc<MemoryBudget>>| match budget {
            Some(budget) => MaskCache::with_budget(mask_entries, budget),
            None => MaskCache::new(mask_entries),
        };
        Ok(Self {
            grammar,
            automaton,
            vocab,
            masks: memo(budget.clone()),
            exit_masks: memo(budget),
        })
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    pub fn automaton(&self) -> &PushdownAutomaton {
        &self.automaton
    }

    pub fn vocab(&self) -> &Arc<Vocabulary> {
        &self.vocab
    }

    pub fn initial_state(&self) -> State {
        self.automaton.initial_state()
    }

    /// Mask for `state`, served from the memo when possible.
    pub fn mask(&self, state: &State) -> TokenMask {
        self.masks.get_or_compute(state, || {
            MaskEngine::new(&self.automaton, &self.vocab).compute_mask(state)
        })
    }

    /// Mask for a match that may end inside the token: tokens that
    /// complete the grammar and carry on past it are allowed too.
    pub fn exit_mask(&self, state: &State) -> TokenMask {
        self.exit_masks.get_or_compute(state, || {
            MaskEngine::new(&self.automaton, &self.vocab).compute_exit_mask(state)
        })
    }

    pub fn cached_masks(&self) -> usize {
        self.masks.len() + self.exit_masks.len()
    }

    /// Bytes held by memoized masks.
    pub fn mask_memory_size(&self) -> usize {
        self.masks.memory_size() + self.exit_masks.memory_size()
    }

    /// Stop memoizing and hand the memo's bytes back to its budget.
    pub fn retire_masks(&self) {
        self.masks.retire();
        self.exit_masks.retire();
    }

    /// Static footprint: grammar and automaton tables. Memoized masks are
    /// counted by [`mask_memory_size`](Self::mask_memory_size).
    pub fn memory_size(&self) -> usize {
        self.grammar.memory_size() + self.automaton.memory_size()
    }
}

impl std::fmt::Debug for CompiledGrammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGrammar")
            .field("automaton", &self.automaton)
            .field("vocab_size", &self.vocab.vocab_size())
            .field("masks", &self.masks)
            .finish()
    }
}

/// One trigger of a structural tag and the grammar it arms.
#[derive(Debug)]
pub struct CompiledTrigger {
    pub text: String,
    pub grammar: Arc<CompiledGrammar>,
}

/// Trigger detection data for a structural tag.
#[derive(Debug)]
pub struct CompiledTags {
    finder: AhoCorasick,
    triggers: Vec<CompiledTrigger>,
    longest: usize,
}

impl CompiledTags {
    /// Pattern ids of `finder` index into `triggers`.
    pub fn finder(&self) -> &AhoCorasick {
        &self.finder
    }

    pub fn triggers(&self) -> &[CompiledTrigger] {
        &self.triggers
    }

    /// Length in bytes of the longest trigger.
    pub fn longest(&self) -> usize {
        self.longest
    }
}

/// A compiled constraint, as stored in the grammar cache.
#[derive(Debug)]
pub struct CompiledConstraint {
    kind: &'static str,
    grammar: Arc<CompiledGrammar>,
    tags: Option<CompiledTags>,
}

impl CompiledConstraint {
    /// Run the front end and build every automaton the constraint needs.
    pub fn compile(
        spec: &ConstraintSpec,
        vocab: &Arc<Vocabulary>,
        options: &JsonSchemaOptions,
        mask_entries: NonZeroUsize,
    ) -> Result<Self> {
        Self::compile_inner(spec, vocab, options, mask_entries, None)
    }

    /// Like [`compile`](Self::compile), with every grammar's memoized masks
    /// charged to `budget`.
    pub fn compile_with_budget(
        spec: &ConstraintSpec,
        vocab: &Arc<Vocabulary>,
        options: &JsonSchemaOptions,
        mask_entries: NonZeroUsize,
        budget: Arc<MemoryBudget>,
    ) -> Result<Self> {
        Self::compile_inner(spec, vocab, options, mask_entries, Some(budget))
    }

    fn compile_inner(
        spec: &ConstraintSpec,
        vocab: &Arc<Vocabulary>,
        options: &JsonSchemaOptions,
        mask_entries: NonZeroUsize,
        budget: Option<Arc<MemoryBudget>>,
    ) -> Result<Self> {
        let build = |grammar: Grammar| {
            CompiledGrammar::build(grammar, Arc::clone(vocab), mask_entries, budget.clone()).map(Arc::new)
        };
        match spec.to_grammar(options)? {
            ConstraintGrammar::Plain(grammar) => Ok(Self {
                kind: spec.kind(),
                grammar: build(grammar)?,
                tags: None,
            }),
            ConstraintGrammar::Tagged(tag) => {
                let triggers = tag
                    .triggers
                    .into_iter()
                    .map(|t| {
                        Ok(CompiledTrigger {
                            text: t.trigger,
                            grammar: build(t.grammar)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                // Standard semantics so overlapping matches are all reported.
                let finder = AhoCorasick::builder()
                    .match_kind(MatchKind::Standard)
                    .build(triggers.iter().map(|t| t.text.as_bytes()))
                    .map_err(|e| GrammarError::invalid(format!("cannot index triggers: {e}")))?;
                let longest = triggers.iter().map(|t| t.text.len()).max().unwrap_or(0);
                Ok(Self {
                    kind: spec.kind(),
                    grammar: build(tag.grammar)?,
                    tags: Some(CompiledTags {
                        finder,
                        triggers,
                        longest,
                    }),
                })
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// The whole-output grammar. For a structural tag this is the union of
    /// all structures.
    pub fn grammar(&self) -> &Arc<CompiledGrammar> {
        &self.grammar
    }

    pub fn tags(&self) -> Option<&CompiledTags> {
        self.tags.as_ref()
    }

    pub fn vocab(&self) -> &Arc<Vocabulary> {
        self.grammar.vocab()
    }

    fn grammars(&self) -> impl Iterator<Item = &Arc<CompiledGrammar>> {
        let triggers = self.tags.iter().flat_map(|tags| tags.triggers.iter().map(|t| &t.grammar));
        std::iter::once(&self.grammar).chain(triggers)
    }

    /// Bytes held by the memoized masks of every grammar.
    pub fn mask_memory_size(&self) -> usize {
        self.grammars().map(|g| g.mask_memory_size()).sum()
    }

    pub fn retire_masks(&self) {
        for grammar in self.grammars() {
            grammar.retire_masks();
        }
    }

    pub fn memory_size(&self) -> usize {
        let tags = self.tags.as_ref().map_or(0, |tags| {
            tags.finder.memory_usage()
                + tags
                    .triggers
                    .iter()
                    .map(|t| t.text.len() + t.grammar.memory_size())
                    .sum::<usize>()
        });
        self.grammar.memory_size() + tags
    }
}
