//! Trigger-driven enforcement for structural tags.
//!
//! Output is free text until one of the tag's triggers appears. The
//! [`TagDispatcher`] watches the generated bytes with an Aho-Corasick
//! automaton over a rolling window, so a trigger split across tokens is
//! still seen. When a trigger completes, the matching sub-grammar is armed
//! and masks come from it until its end marker has been emitted; then the
//! dispatcher goes back to watching. A response may contain any number of
//! such segments.

use std::borrow::Cow;
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use tracing::{debug, warn};

use crate::bitmask;
use crate::compiled::{CompiledConstraint, CompiledGrammar};
use crate::error::{DriftFault, GrammarError, Result};
use crate::mask::TokenMask;
use crate::matcher::{GrammarMatcher, SessionConfig};
use crate::vocab::Vocabulary;

/// Byte span of one structured segment, from the first byte of its trigger
/// to the last byte of its end marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub trigger: String,
    pub start: usize,
    pub end: usize,
}

/// What a consumed token did to enforcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// A trigger completed; output from `position` on is constrained.
    Armed { trigger: String, position: usize },
    /// The end marker was emitted; output is free again.
    Disarmed(Segment),
    /// A trigger was followed, in the same token, by bytes no structure
    /// allows. It is kept as plain text.
    FalseTrigger { trigger: String, position: usize },
}

struct Armed {
    matcher: GrammarMatcher,
    trigger: usize,
    start: usize,
    trigger_end: usize,
    /// Index in `tokens` of the token that completed the trigger.
    token: usize,
}

impl Armed {
    fn exit_mask(&self) -> TokenMask {
        self.matcher.compiled().exit_mask(self.matcher.automaton_state())
    }
}

/// Structural-tag session for one request.
pub struct TagDispatcher {
    vocab: Arc<Vocabulary>,
    finder: AhoCorasick,
    triggers: Vec<(String, Arc<CompiledGrammar>)>,
    longest: usize,
    armed: Option<Armed>,
    /// Unarmed bytes that may still hold the start of a trigger.
    window: Vec<u8>,
    window_start: usize,
    output: Vec<u8>,
    tokens: Vec<u32>,
    segments: Vec<Segment>,
    fault: Option<DriftFault>,
    ended: bool,
}

impl TagDispatcher {
    pub fn new(compiled: &CompiledConstraint) -> Result<Self> {
        let Some(tags) = compiled.tags() else {
            return Err(GrammarError::invalid(format!(
                "a {} constraint has no triggers to dispatch on",
                compiled.kind()
            )));
        };
        Ok(Self {
            vocab: Arc::clone(compiled.vocab()),
            finder: tags.finder().clone(),
            triggers: tags
                .triggers()
                .iter()
                .map(|t| (t.text.clone(), Arc::clone(&t.grammar)))
                .collect(),
            longest: tags.longest(),
            armed: None,
            window: Vec::new(),
            window_start: 0,
            output: Vec::new(),
            tokens: Vec::new(),
            segments: Vec::new(),
            fault: None,
            ended: false,
        })
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Trigger of the structure currently being enforced.
    pub fn active_trigger(&self) -> Option<&str> {
        self.armed.as_ref().map(|a| self.triggers[a.trigger].0.as_str())
    }

    pub fn is_terminated(&self) -> bool {
        self.ended || self.fault.is_some()
    }

    pub fn fault(&self) -> Option<&DriftFault> {
        self.fault.as_ref()
    }

    /// Every completed segment, in output order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment_text(&self, segment: &Segment) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output[segment.start..segment.end])
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// The mask for the next token, or `None` when every token is allowed.
    ///
    /// While armed, a token may finish the structure and continue with free
    /// text, so tokens that complete the end marker part way through are
    /// allowed.
    pub fn next_token_mask(&self) -> Option<TokenMask> {
        if self.is_terminated() {
            return Some(TokenMask::empty(self.vocab.vocab_size()));
        }
        self.armed.as_ref().map(Armed::exit_mask)
    }

    pub fn fill_next_token_bitmask(&self, out: &mut [u32]) {
        match &self.armed {
            _ if self.is_terminated() => bitmask::clear_bitmask(out),
            Some(armed) => armed.exit_mask().copy_to(out),
            None => bitmask::reset_bitmask(out, self.vocab.vocab_size()),
        }
    }

    /// Apply one sampled token and report the arm and disarm transitions
    /// it caused.
    pub fn consume(&mut self, token: u32) -> Result<Vec<DispatchEvent>, DriftFault> {
        if self.is_terminated() {
            return Err(DriftFault::Terminated);
        }
        let vocab = Arc::clone(&self.vocab);
        let Some(bytes) = vocab.token_bytes(token) else {
            return Err(self.drift(DriftFault::UnknownToken(token)));
        };
        self.tokens.push(token);

        if vocab.is_stop(token) {
            if self.armed.is_some() {
                return Err(self.drift(DriftFault::PrematureEnd));
            }
            self.ended = true;
            return Ok(Vec::new());
        }

        let token_index = self.tokens.len() - 1;
        let token_start = self.output.len();
        self.output.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            i = if self.armed.is_some() {
                self.feed_armed(token, token_index, token_start, bytes, i, &mut events)?
            } else {
                self.scan(token_index, token_start, bytes, i, &mut events)
            };
        }
        Ok(events)
    }

    /// Feed armed bytes from `bytes[i..]` until the structure closes or the
    /// token ends. Returns the index to continue from.
    fn feed_armed(
        &mut self,
        token: u32,
        token_index: usize,
        token_start: usize,
        bytes: &[u8],
        mut i: usize,
        events: &mut Vec<DispatchEvent>,
    ) -> Result<usize, DriftFault> {
        let Some(armed) = self.armed.as_mut() else {
            return Ok(i);
        };
        while i < bytes.len() {
            if !armed.matcher.advance_byte(bytes[i]) {
                if armed.token == token_index {
                    return Ok(self.drop_false_trigger(token_start, events));
                }
                return Err(self.drift(DriftFault::OutOfMask {
                    token,
                    position: token_start + i,
                }));
            }
            i += 1;
            if armed.matcher.can_terminate() {
                self.disarm(token_start + i, events);
                return Ok(i);
            }
        }
        Ok(i)
    }

    fn drop_false_trigger(&mut self, token_start: usize, events: &mut Vec<DispatchEvent>) -> usize {
        let Some(armed) = self.armed.take() else {
            return 0;
        };
        let trigger = self.triggers[armed.trigger].0.clone();
        debug!(%trigger, position = armed.start, "false trigger");
        // The arming happened in this same token; report only the outcome.
        if matches!(events.last(), Some(DispatchEvent::Armed { .. })) {
            events.pop();
        }
        events.push(DispatchEvent::FalseTrigger {
            trigger,
            position: armed.start,
        });
        self.restart_window(armed.trigger_end);
        armed.trigger_end - token_start
    }

    fn disarm(&mut self, end: usize, events: &mut Vec<DispatchEvent>) {
        let Some(armed) = self.armed.take() else {
            return;
        };
        let segment = Segment {
            trigger: self.triggers[armed.trigger].0.clone(),
            start: armed.start,
            end,
        };
        debug!(trigger = %segment.trigger, start = segment.start, end, "structure closed");
        self.segments.push(segment.clone());
        events.push(DispatchEvent::Disarmed(segment));
        self.restart_window(end);
    }

    /// Scan the unarmed bytes `bytes[i..]` for a trigger, arming on the
    /// first one found. Returns the index to continue from.
    fn scan(
        &mut self,
        token_index: usize,
        token_start: usize,
        bytes: &[u8],
        i: usize,
        events: &mut Vec<DispatchEvent>,
    ) -> usize {
        self.window.extend_from_slice(&bytes[i..]);
        let Some((pattern, end)) = self.earliest_trigger() else {
            let keep = self.longest.saturating_sub(1);
            let drop = self.window.len().saturating_sub(keep);
            self.window.drain(..drop);
            self.window_start += drop;
            return bytes.len();
        };

        let (text, grammar) = &self.triggers[pattern];
        let trigger_end = self.window_start + end;
        let start = trigger_end - text.len();
        let mut matcher = GrammarMatcher::new(
            Arc::clone(grammar),
            SessionConfig {
                max_rollback: 0,
                start_in_reasoning: false,
            },
        );
        if !matcher.accept_bytes(text.as_bytes()) {
            // Structure begins always extend their trigger.
            self.restart_window(trigger_end);
            return trigger_end - token_start;
        }
        debug!(trigger = %text, position = start, "trigger armed");
        events.push(DispatchEvent::Armed {
            trigger: text.clone(),
            position: start,
        });
        self.armed = Some(Armed {
            matcher,
            trigger: pattern,
            start,
            trigger_end,
            token: token_index,
        });
        self.restart_window(trigger_end);
        trigger_end - token_start
    }

    /// The trigger completing first in the window; the longest one among
    /// those completing at the same byte. Returns its pattern index and end
    /// offset in the window.
    fn earliest_trigger(&self) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        for m in self.finder.find_overlapping_iter(self.window.as_slice()) {
            match best {
                Some((_, end)) if m.end() > end => break,
                Some((pattern, _)) if m.len() <= self.triggers[pattern].0.len() => {}
                _ => best = Some((m.pattern().as_usize(), m.end())),
            }
        }
        best
    }

    fn restart_window(&mut self, at: usize) {
        self.window.clear();
        self.window_start = at;
    }

    fn drift(&mut self, fault: DriftFault) -> DriftFault {
        warn!(%fault, position = self.output.len(), "structural tag session drifted");
        self.fault = Some(fault.clone());
        fault
    }

    /// Forget all output and start watching again.
    pub fn reset(&mut self) {
        self.armed = None;
        self.window.clear();
        self.window_start = 0;
        self.output.clear();
        self.tokens.clear();
        self.segments.clear();
        self.fault = None;
        self.ended = false;
    }
}

impl std::fmt::Debug for TagDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagDispatcher")
            .field("triggers", &self.triggers.iter().map(|t| &t.0).collect::<Vec<_>>())
            .field("armed", &self.active_trigger())
            .field("output_len", &self.output.len())
            .field("segments", &self.segments)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::ConstraintSpec;
    use crate::json_schema::JsonSchemaOptions;
    use serde_json::json;
    use std::num::NonZeroUsize;

    fn dispatcher(tag: serde_json::Value, tokens: &[&str]) -> TagDispatcher {
        let vocab = Arc::new(
            Vocabulary::from_bytes(tokens.iter().map(|t| t.as_bytes().to_vec()).collect(), None)
                .unwrap()
                .with_stop_tokens(&[0])
                .unwrap(),
        );
        let spec = ConstraintSpec::StructuralTag(serde_json::from_value(tag).unwrap());
        let compiled = CompiledConstraint::compile(
            &spec,
            &vocab,
            &JsonSchemaOptions::default(),
            NonZeroUsize::new(64).unwrap(),
        )
        .unwrap();
        TagDispatcher::new(&compiled).unwrap()
    }

    fn numbers() -> serde_json::Value {
        json!({
            "structures": [{"begin": "<n>", "schema": {"type": "integer"}, "end": "</n>"}],
            "triggers": ["<n>"]
        })
    }

    const TOKENS: [&str; 9] = ["</s>", "hi ", "<n>", "<", "n>", "42", "</n>", "</n> ok", "<n>x"];

    #[test]
    fn test_free_text_is_unconstrained() {
        let mut d = dispatcher(numbers(), &TOKENS);
        assert!(d.next_token_mask().is_none());
        let mut words = vec![0u32; 1];
        d.fill_next_token_bitmask(&mut words);
        assert_eq!(words, vec![0b1_1111_1111]);
        assert!(d.consume(1).unwrap().is_empty());
        assert!(!d.is_armed());
    }

    #[test]
    fn test_trigger_split_across_tokens() {
        let mut d = dispatcher(numbers(), &TOKENS);
        d.consume(1).unwrap();
        assert!(d.consume(3).unwrap().is_empty());
        let events = d.consume(4).unwrap();
        assert_eq!(
            events,
            vec![DispatchEvent::Armed {
                trigger: "<n>".into(),
                position: 3
            }]
        );
        assert_eq!(d.next_token_mask().unwrap().allowed_ids(), vec![5]);
        d.consume(5).unwrap();
        let events = d.consume(7).unwrap();
        let segment = Segment {
            trigger: "<n>".into(),
            start: 3,
            end: 12,
        };
        assert_eq!(events, vec![DispatchEvent::Disarmed(segment.clone())]);
        assert_eq!(d.segment_text(&segment), "<n>42</n>");
        assert!(!d.is_armed());
        assert_eq!(d.text(), "hi <n>42</n> ok");
    }

    #[test]
    fn test_mask_allows_running_past_the_end_marker() {
        let mut d = dispatcher(numbers(), &TOKENS);
        d.consume(2).unwrap();
        d.consume(5).unwrap();
        // "</n> ok" closes the structure and carries on with free text.
        assert_eq!(d.next_token_mask().unwrap().allowed_ids(), vec![3, 5, 6, 7]);
        let mut words = vec![0u32; 1];
        d.fill_next_token_bitmask(&mut words);
        assert_eq!(bitmask::allowed_ids(&words).collect::<Vec<_>>(), vec![3, 5, 6, 7]);

        let events = d.consume(7).unwrap();
        assert!(matches!(events[..], [DispatchEvent::Disarmed(Segment { start: 0, end: 9, .. })]));
        assert!(!d.is_armed());
        assert_eq!(d.text(), "<n>42</n> ok");
        assert!(d.next_token_mask().is_none());
    }

    #[test]
    fn test_false_trigger_in_same_token() {
        let mut d = dispatcher(numbers(), &TOKENS);
        let events = d.consume(8).unwrap();
        assert_eq!(
            events,
            vec![DispatchEvent::FalseTrigger {
                trigger: "<n>".into(),
                position: 0
            }]
        );
        assert!(!d.is_armed());
        // Scanning resumes after the false trigger.
        let events = d.consume(2).unwrap();
        assert!(matches!(events[..], [DispatchEvent::Armed { position: 4, .. }]));
    }

    #[test]
    fn test_bad_token_after_arming_is_a_fault() {
        let mut d = dispatcher(numbers(), &TOKENS);
        d.consume(2).unwrap();
        assert_eq!(d.consume(1), Err(DriftFault::OutOfMask { token: 1, position: 3 }));
        assert!(d.is_terminated());
        assert_eq!(d.consume(5), Err(DriftFault::Terminated));
    }

    #[test]
    fn test_stop_inside_structure_is_premature() {
        let mut d = dispatcher(numbers(), &TOKENS);
        d.consume(2).unwrap();
        assert_eq!(d.consume(0), Err(DriftFault::PrematureEnd));
    }

    #[test]
    fn test_multiple_segments() {
        let mut d = dispatcher(numbers(), &TOKENS);
        for token in [2, 5, 6, 1, 2, 5, 6] {
            d.consume(token).unwrap();
        }
        assert_eq!(d.segments().len(), 2);
        assert_eq!(d.segments()[1].start, 12);
        assert!(d.consume(0).unwrap().is_empty());
        assert!(d.is_terminated());
    }

    #[test]
    fn test_longest_trigger_wins_at_same_end() {
        let tag = json!({
            "structures": [
                {"begin": "<ab>", "schema": {"type": "boolean"}, "end": "</ab>"},
                {"begin": "b>", "schema": {"type": "null"}, "end": "<"}
            ],
            "triggers": ["b>", "<ab>"]
        });
        let mut d = dispatcher(tag, &["</s>", "<ab>", "true", "</ab>"]);
        let events = d.consume(1).unwrap();
        assert_eq!(
            events,
            vec![DispatchEvent::Armed {
                trigger: "<ab>".into(),
                position: 0
            }]
        );
        d.consume(2).unwrap();
        assert!(matches!(d.consume(3).unwrap()[..], [DispatchEvent::Disarmed(_)]));
    }

    #[test]
    fn test_earliest_trigger_wins() {
        let tag = json!({
            "structures": [
                {"begin": "<a>", "schema": {"type": "null"}, "end": "</a>"},
                {"begin": "<ab>", "schema": {"type": "null"}, "end": "</ab>"}
            ],
            "triggers": ["<a", "<ab"]
        });
        let mut d = dispatcher(tag, &["</s>", "<ab>null</ab>"]);
        let events = d.consume(1).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            DispatchEvent::Armed {
                trigger: "<a".into(),
                position: 0
            }
        );
        assert_eq!(d.segments()[0].end, 13);
    }

    #[test]
    fn test_non_tag_constraint_is_rejected() {
        let vocab = Arc::new(Vocabulary::from_bytes(vec![b"a".to_vec()], None).unwrap());
        let compiled = CompiledConstraint::compile(
            &ConstraintSpec::Regex("a".into()),
            &vocab,
            &JsonSchemaOptions::default(),
            NonZeroUsize::new(4).unwrap(),
        )
        .unwrap();
        assert!(TagDispatcher::new(&compiled).is_err());
    }
}
