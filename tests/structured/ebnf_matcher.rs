//! EBNF acceptance, and the token-level session over an EBNF constraint.

use pie_structured::grammar::Grammar;
use pie_structured::{ConstraintSpec, GrammarCache, GrammarError, JsonSchemaOptions, MatcherState};

use crate::common::{accepts, session, vocab};

const JSON_GRAMMAR: &str = r#"
root ::= value
value ::= object | array | string | number | "true" | "false" | "null"
object ::= "{" ws (pair ("," ws pair)*)? ws "}"
pair ::= ws string ws ":" ws value
array ::= "[" ws (value ("," ws value)*)? ws "]"
string ::= "\"" char* "\""
char ::= [^"\\] | "\\" escape
escape ::= "\"" | "\\" | "/" | "b" | "f" | "n" | "r" | "t" | "u" [0-9a-fA-F]{4}
number ::= integer fraction? exponent?
integer ::= "-"? ("0" | [1-9] [0-9]*)
fraction ::= "." [0-9]+
exponent ::= [eE] [+-]? [0-9]+
ws ::= [ \t\n\r]*
"#;

fn json_accepts(input: &str) -> bool {
    accepts(&Grammar::from_ebnf(JSON_GRAMMAR, "root").unwrap(), input)
}

#[test]
fn test_json_values() {
    for input in [
        r#"{"name": "John", "age": 30}"#,
        r#"{"a": {"b": [1, 2, 3]}}"#,
        "[1, 2, 3]",
        "true",
        "null",
        r#""hello\nworld""#,
        r#""\u0041""#,
        "-17",
        "2.5E-3",
        "{}",
        "[]",
    ] {
        assert!(json_accepts(input), "should accept {input:?}");
    }
    for input in ["{", "[1,]", "01", r#""\q""#, "nul", "{\"a\" 1}"] {
        assert!(!json_accepts(input), "should reject {input:?}");
    }
}

#[test]
fn test_json_multiline_document() {
    let doc = r#"{
    "web-app": {
    "servlet": [
        {
        "servlet-name": "cofaxCDS",
        "init-param": {
            "configGlossary:installationAt": "Philadelphia, PA",
            "useJSP": false,
            "cachePackageTagsTrack": 200
        }
        }
    ],
    "servlet-mapping": {"cofaxCDS": "/"}
    }
}"#;
    assert!(json_accepts(doc));
}

#[test]
fn test_nullable_grammar() {
    let g = Grammar::from_ebnf(
        r#"
    root ::= rule1 | (rule1 rule1 rule1 rule3)+
    rule1 ::= rule2
    rule2 ::= [0-9]*
    rule3 ::= [a-z]
"#,
        "root",
    )
    .unwrap();
    assert!(accepts(&g, ""));
    assert!(accepts(&g, "abc12312398014a"));
    assert!(!accepts(&g, "abc1"));
}

#[test]
fn test_right_recursion() {
    let g = Grammar::from_ebnf("root ::= [a-z] root | [a-z]", "root").unwrap();
    for s in ["a", "ab", "abcde"] {
        assert!(accepts(&g, s), "should accept {s:?}");
    }
    for s in ["", "1", "ab1"] {
        assert!(!accepts(&g, s), "should reject {s:?}");
    }
}

#[test]
fn test_balanced_braces() {
    let g = Grammar::from_ebnf(
        r#"root ::= rule1
    rule1 ::= "{" rule2 | ""
    rule2 ::= root "}"
    "#,
        "root",
    )
    .unwrap();
    for s in ["", "{}", "{{}}", "{{{{}}}}"] {
        assert!(accepts(&g, s), "should accept {s:?}");
    }
    for s in ["{", "{}{}", "{{{{}", "{{}}}"] {
        assert!(!accepts(&g, s), "should reject {s:?}");
    }
}

#[test]
fn test_overlapping_alternatives() {
    let g = Grammar::from_ebnf(
        r#"root ::= rule1
    rule1 ::= [a] | [a-b] | [a-c]* | "a" | "aaaaaaaaaaaaaaaaaaa"
    "#,
        "root",
    )
    .unwrap();
    for i in 0..25 {
        assert!(accepts(&g, &"a".repeat(i)), "should accept {i} 'a's");
    }
    assert!(accepts(&g, "abcab"));
}

#[test]
fn test_compile_errors() {
    let v = vocab(&["a"]);
    let compile = |src: &str| {
        GrammarCache::global().get_or_compile(
            &ConstraintSpec::Ebnf(src.into()),
            &v,
            &JsonSchemaOptions::default(),
        )
    };

    let err = compile("root ::= item\n").unwrap_err();
    assert!(matches!(err, GrammarError::InvalidSpecification(ref m) if m.contains("item")));

    assert!(matches!(
        compile("root ::= root | \"a\""),
        Err(GrammarError::InvalidSpecification(_))
    ));
    assert!(matches!(
        compile("root ::= root \"x\""),
        Err(GrammarError::Unrepresentable(_))
    ));
    assert!(matches!(
        compile("root ::= \"a\" (\"b\""),
        Err(GrammarError::InvalidSpecification(_))
    ));
}

#[test]
fn test_left_recursive_arithmetic() {
    let g = Grammar::from_ebnf(
        r#"
root ::= expr
expr ::= expr ("+" | "-") term | term
term ::= term "*" factor | factor
factor ::= [0-9]+ | "(" expr ")"
"#,
        "root",
    )
    .unwrap();
    for s in ["7", "1+2*3", "(1-2)*3", "10*(2+3)-4"] {
        assert!(accepts(&g, s), "should accept {s:?}");
    }
    for s in ["", "+1", "1+", "(1", "1*/2"] {
        assert!(!accepts(&g, s), "should reject {s:?}");
    }

    let v = vocab(&["1", "+", "2", "+2", "*"]);
    let mut m = session(ConstraintSpec::Ebnf("root ::= root \"+\" [0-9] | [0-9]".into()), &v);
    assert_eq!(m.next_token_mask().unwrap().allowed_ids(), vec![1, 3]);
    m.consume(1).unwrap();
    assert_eq!(m.next_token_mask().unwrap().allowed_ids(), vec![0, 2, 4]);
    m.consume(4).unwrap();
    assert_eq!(m.consume(0), Ok(MatcherState::Accepted));
    assert_eq!(m.content_text(), "1+2");
}

#[test]
fn test_paris_or_london() {
    let v = vocab(&["P", "L", "aris", "ondon", "Paris", "London", "Lyon", "x"]);
    let mut m = session(ConstraintSpec::Ebnf(r#"root ::= "Paris" | "London""#.into()), &v);

    // Only tokens starting with P or L that stay on a city name.
    assert_eq!(m.next_token_mask().unwrap().allowed_ids(), vec![1, 2, 5, 6]);

    m.consume(5).unwrap();
    assert!(m.can_terminate());
    assert!(m.compiled().automaton().allowed_bytes(m.automaton_state()).is_empty());
    assert_eq!(m.next_token_mask().unwrap().allowed_ids(), vec![0]);
    assert_eq!(m.consume(0), Ok(MatcherState::Accepted));
    assert_eq!(m.content_text(), "Paris");
}
