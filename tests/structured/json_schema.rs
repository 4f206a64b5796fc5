//! Schema constraints driven token by token over a byte-level vocabulary.

use pie_structured::{ConstraintSpec, GrammarError, GrammarMatcher, MatcherState};
use serde_json::{json, Value};

use crate::common::{ascii_token, ascii_vocab, compile, first_rejected_byte, session};

fn person_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": {"type": "string", "minLength": 1},
            "age": {"type": "integer", "minimum": 0, "maximum": 150},
            "email": {"type": "string", "format": "email"},
            "tags": {"type": "array", "items": {"enum": ["admin", "user"]}, "maxItems": 3},
            "address": {
                "type": "object",
                "properties": {
                    "city": {"type": "string"},
                    "zip": {"type": "string", "pattern": "[0-9]{5}"}
                },
                "required": ["city"]
            }
        },
        "required": ["name", "age"]
    })
}

/// Feed `text` one byte token at a time, checking every token against the
/// mask computed just before it.
fn drive(m: &mut GrammarMatcher, text: &str) {
    for (i, b) in text.bytes().enumerate() {
        let token = ascii_token(b);
        let mask = m.next_token_mask().expect("constrained");
        assert!(
            mask.is_allowed(token),
            "byte {i} ({:?}) of {text:?} is masked out",
            b as char
        );
        assert_eq!(m.consume(token), Ok(MatcherState::Active));
    }
}

#[test]
fn test_valid_instances_are_never_masked() {
    let vocab = ascii_vocab();
    let instances = [
        json!({"name": "Ada", "age": 36}),
        json!({"name": "Grace", "age": 85, "email": "grace@navy.mil"}),
        json!({"name": "Linus", "age": 0, "tags": ["admin", "user"]}),
        json!({"name": "Ken", "age": 150, "address": {"city": "Murray Hill", "zip": "07974"}}),
        // Keys in any order, and properties the schema does not declare.
        json!({"age": 7, "name": "Al"}),
        json!({"nickname": "Bo", "age": 41, "tags": [], "name": "Robert"}),
        json!({"address": {"zip": "12345", "country": "US", "city": "Ely"}, "name": "Di", "age": 1}),
    ];
    for instance in instances {
        let mut m = session(ConstraintSpec::JsonSchema(person_schema()), &vocab);
        let text = serde_json::to_string(&instance).unwrap();
        drive(&mut m, &text);
        assert!(m.can_terminate(), "{text} should be complete");
        assert_eq!(m.consume(0), Ok(MatcherState::Accepted));
        assert_eq!(m.content_text(), text);
    }
}

#[test]
fn test_pretty_printed_instance_with_free_whitespace() {
    let vocab = ascii_vocab();
    let mut m = session(ConstraintSpec::JsonSchema(person_schema()), &vocab);
    let text = serde_json::to_string_pretty(&json!({
        "name": "Ada",
        "age": 36,
        "address": {"city": "London"}
    }))
    .unwrap();
    drive(&mut m, &text);
    assert_eq!(m.consume(0), Ok(MatcherState::Accepted));
}

#[test]
fn test_invalid_instances_are_rejected_at_the_first_bad_byte() {
    let vocab = ascii_vocab();
    let compiled = compile(ConstraintSpec::JsonSchema(person_schema()), &vocab);
    let automaton = compiled.grammar().automaton();

    let cases: [(&str, usize); 6] = [
        // Required property missing: the object cannot close after "name".
        (r#"{"name":"Ada"}"#, 13),
        // Any order, but "name" is still required.
        (r#"{"age":3}"#, 8),
        (r#"{"name":"Ada","age":-1}"#, 20),
        (r#"{"name":"Ada","age":151}"#, 22),
        (r#"{"name":"","age":1}"#, 9),
        (r#"{"name":"Ada","age":1,"tags":["root"]}"#, 31),
    ];
    for (text, at) in cases {
        assert_eq!(
            first_rejected_byte(automaton, text.as_bytes()),
            Some(at),
            "{text}"
        );
    }
}

#[test]
fn test_declared_keys_keep_their_schema_in_any_position() {
    let vocab = ascii_vocab();
    let compiled = compile(ConstraintSpec::JsonSchema(person_schema()), &vocab);
    let automaton = compiled.grammar().automaton();

    // "age" is declared, so it cannot pass as an undeclared property.
    let text = r#"{"x":1,"age":"old","name":"Ada"}"#;
    assert_eq!(first_rejected_byte(automaton, text.as_bytes()), Some(13));
    let text = r#"{"name":"Ada","x":[1,{}],"age":2}"#;
    assert_eq!(first_rejected_byte(automaton, text.as_bytes()), None);
    assert!(automaton.accepts(text.as_bytes()));
}

#[test]
fn test_stop_is_only_allowed_once_complete() {
    let vocab = ascii_vocab();
    let mut m = session(ConstraintSpec::JsonSchema(person_schema()), &vocab);
    drive(&mut m, r#"{"name":"Ada","age":3"#);
    // "3" could still grow into "30", and the object is still open.
    assert!(!m.next_token_mask().unwrap().is_allowed(0));
    drive(&mut m, "}");
    assert!(m.next_token_mask().unwrap().is_allowed(0));
}

#[test]
fn test_schema_errors_surface_at_compile_time() {
    let vocab = ascii_vocab();
    let cache = pie_structured::GrammarCache::global();
    let options = pie_structured::JsonSchemaOptions::default();

    let err = cache
        .get_or_compile(&ConstraintSpec::JsonSchema(json!({"type": "integer", "minimum": 5, "maximum": 1})), &vocab, &options)
        .unwrap_err();
    assert!(matches!(err, GrammarError::Unrepresentable(_)));

    let err = cache
        .get_or_compile(&ConstraintSpec::JsonSchema(json!({"$ref": "#/$defs/missing"})), &vocab, &options)
        .unwrap_err();
    assert!(matches!(err, GrammarError::InvalidSpecification(_)));

    let err = cache
        .get_or_compile(&ConstraintSpec::JsonSchema(Value::String("{not json".into())), &vocab, &options)
        .unwrap_err();
    assert!(matches!(err, GrammarError::InvalidSpecification(_)));
}
