//! Tool-call style structural tags, end to end through the cache and the
//! dispatcher.

use pie_structured::{ConstraintSpec, DispatchEvent, DriftFault, Segment, TagDispatcher};
use serde_json::json;

use crate::common::{compile, first_rejected_byte, vocab};

const TOKENS: [&str; 16] = [
    "Let me check. ",
    "<function=",
    "get_current_weather>",
    r#"{"city":""#,
    "NYC",
    r#"","state":""#,
    "NY",
    r#"","unit":""#,
    "celsius",
    r#""}"#,
    "</function>",
    " Done.",
    "<func",
    "tion=",
    "<function=x",
    "</function><function=get_current_weather>",
];

// Ids are shifted by one: `</s>` is token 0.
const FREE: u32 = 1;
const TRIGGER: u32 = 2;
const NAME: u32 = 3;
const CALL: [u32; 8] = [4, 5, 6, 7, 8, 9, 10, 11];
const DONE: u32 = 12;
const TRIGGER_HEAD: u32 = 13;
const TRIGGER_TAIL: u32 = 14;
const BOGUS_TRIGGER: u32 = 15;
const CLOSE_AND_REOPEN: u32 = 16;

fn weather_request() -> serde_json::Value {
    json!({
        "response_format": {
            "type": "structural_tag",
            "structural_tag": {
                "structures": [{
                    "begin": "<function=get_current_weather>",
                    "schema": {
                        "type": "object",
                        "properties": {
                            "city": {"type": "string"},
                            "state": {"type": "string"},
                            "unit": {"type": "string", "enum": ["celsius", "fahrenheit"]}
                        },
                        "required": ["city", "state", "unit"]
                    },
                    "end": "</function>"
                }],
                "triggers": ["<function="]
            }
        }
    })
}

fn dispatcher() -> TagDispatcher {
    let spec = ConstraintSpec::from_request(&weather_request()).unwrap();
    let compiled = compile(spec, &vocab(&TOKENS));
    TagDispatcher::new(&compiled).unwrap()
}

fn call_segment(start: usize) -> Segment {
    Segment {
        trigger: "<function=".into(),
        start,
        end: start + 85,
    }
}

#[test]
fn test_weather_call_in_free_text() {
    let mut d = dispatcher();

    assert!(d.next_token_mask().is_none());
    assert_eq!(d.consume(FREE), Ok(vec![]));
    assert!(d.next_token_mask().is_none());

    assert_eq!(
        d.consume(TRIGGER),
        Ok(vec![DispatchEvent::Armed {
            trigger: "<function=".into(),
            position: 14,
        }])
    );
    let mask = d.next_token_mask().expect("armed");
    assert_eq!(mask.allowed_ids(), vec![NAME]);

    assert_eq!(d.consume(NAME), Ok(vec![]));
    let (last, body) = CALL.split_last().unwrap();
    for &token in body {
        assert_eq!(d.consume(token), Ok(vec![]), "token {token}");
        assert!(d.is_armed());
    }
    assert_eq!(
        d.consume(*last),
        Ok(vec![DispatchEvent::Disarmed(call_segment(14))])
    );
    assert!(!d.is_armed());
    assert!(d.next_token_mask().is_none());

    assert_eq!(d.consume(DONE), Ok(vec![]));
    assert_eq!(d.consume(0), Ok(vec![]));
    assert!(d.is_terminated());

    let segment = &d.segments()[0];
    assert_eq!(
        d.segment_text(segment),
        r#"<function=get_current_weather>{"city":"NYC","state":"NY","unit":"celsius"}</function>"#
    );
    assert!(d.text().starts_with("Let me check. <function="));
    assert!(d.text().ends_with("</function> Done."));
}

#[test]
fn test_segment_is_accepted_by_the_combined_grammar() {
    let spec = ConstraintSpec::from_request(&weather_request()).unwrap();
    let compiled = compile(spec, &vocab(&TOKENS));
    let automaton = compiled.grammar().automaton();
    let call = br#"<function=get_current_weather>{"city":"NYC","state":"NY","unit":"celsius"}</function>"#;
    assert_eq!(first_rejected_byte(automaton, call), None);
    assert!(automaton.accepts(call));
    // "kelvin" is not a unit.
    let bad = br#"<function=get_current_weather>{"city":"NYC","state":"NY","unit":"kelvin"}</function>"#;
    assert_eq!(first_rejected_byte(automaton, bad), Some(65));
}

#[test]
fn test_trigger_split_across_tokens() {
    let mut d = dispatcher();
    d.consume(FREE).unwrap();
    assert_eq!(d.consume(TRIGGER_HEAD), Ok(vec![]));
    assert!(!d.is_armed());
    assert_eq!(
        d.consume(TRIGGER_TAIL),
        Ok(vec![DispatchEvent::Armed {
            trigger: "<function=".into(),
            position: 14,
        }])
    );
    assert_eq!(d.active_trigger(), Some("<function="));
    d.consume(NAME).unwrap();
    let events: Vec<_> = CALL.iter().flat_map(|&t| d.consume(t).unwrap()).collect();
    assert_eq!(events, vec![DispatchEvent::Disarmed(call_segment(14))]);
}

#[test]
fn test_two_calls_in_one_response() {
    let mut d = dispatcher();
    let mut events = Vec::new();
    for token in [TRIGGER, NAME]
        .into_iter()
        .chain(CALL)
        .chain([DONE, TRIGGER, NAME])
        .chain(CALL)
    {
        events.extend(d.consume(token).unwrap());
    }
    let second = 85 + 6;
    assert_eq!(
        events,
        vec![
            DispatchEvent::Armed { trigger: "<function=".into(), position: 0 },
            DispatchEvent::Disarmed(call_segment(0)),
            DispatchEvent::Armed { trigger: "<function=".into(), position: second },
            DispatchEvent::Disarmed(call_segment(second)),
        ]
    );
    assert_eq!(d.segments().len(), 2);
    assert_eq!(d.consume(0), Ok(vec![]));
}

#[test]
fn test_token_closing_one_call_and_opening_the_next() {
    let mut d = dispatcher();
    d.consume(FREE).unwrap();
    d.consume(TRIGGER).unwrap();
    d.consume(NAME).unwrap();
    let (last, body) = CALL.split_last().unwrap();
    for &token in body {
        d.consume(token).unwrap();
    }
    // The end marker alone, or the end marker followed by more output.
    assert_eq!(d.next_token_mask().unwrap().allowed_ids(), vec![*last, CLOSE_AND_REOPEN]);

    assert_eq!(
        d.consume(CLOSE_AND_REOPEN),
        Ok(vec![
            DispatchEvent::Disarmed(call_segment(14)),
            DispatchEvent::Armed { trigger: "<function=".into(), position: 99 },
        ])
    );
    assert!(d.is_armed());
    let events: Vec<_> = CALL.iter().flat_map(|&t| d.consume(t).unwrap()).collect();
    assert_eq!(events, vec![DispatchEvent::Disarmed(call_segment(99))]);
    assert_eq!(d.segments().len(), 2);
}

#[test]
fn test_false_trigger_stays_free_text() {
    let mut d = dispatcher();
    assert_eq!(
        d.consume(BOGUS_TRIGGER),
        Ok(vec![DispatchEvent::FalseTrigger {
            trigger: "<function=".into(),
            position: 0,
        }])
    );
    assert!(!d.is_armed());
    assert!(d.next_token_mask().is_none());
    assert_eq!(d.consume(DONE), Ok(vec![]));
    assert!(d.segments().is_empty());
}

#[test]
fn test_drift_inside_a_call() {
    let mut d = dispatcher();
    d.consume(TRIGGER).unwrap();
    d.consume(NAME).unwrap();
    assert_eq!(
        d.consume(FREE),
        Err(DriftFault::OutOfMask { token: FREE, position: 30 })
    );
    assert!(d.is_terminated());
    assert_eq!(d.next_token_mask().unwrap().count_allowed(), 0);
    assert_eq!(d.consume(DONE), Err(DriftFault::Terminated));
}

#[test]
fn test_stop_while_armed_is_premature() {
    let mut d = dispatcher();
    d.consume(TRIGGER).unwrap();
    assert_eq!(d.consume(0), Err(DriftFault::PrematureEnd));
    assert_eq!(d.fault(), Some(&DriftFault::PrematureEnd));
}
