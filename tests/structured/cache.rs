//! Compiled-grammar cache: sharing, single-flight compilation, and the
//! config file that sizes it.

use std::io::Write;
use std::sync::{Arc, Barrier};
use std::thread;

use pie_structured::{
    CacheConfig, ConstraintSpec, EngineConfig, GrammarCache, GrammarMatcher, KeywordPolicy,
    MatcherState,
};
use serde_json::json;

use crate::common::{ascii_token, ascii_vocab};

fn schema() -> ConstraintSpec {
    ConstraintSpec::JsonSchema(json!({
        "type": "object",
        "properties": {"id": {"type": "integer"}, "name": {"type": "string"}},
        "required": ["id"]
    }))
}

#[test]
fn test_repeated_compiles_share_one_grammar() {
    let cache = GrammarCache::new(&CacheConfig::default());
    let vocab = ascii_vocab();
    let options = Default::default();

    let a = cache.get_or_compile(&schema(), &vocab, &options).unwrap();
    // Same schema as JSON text with different formatting.
    let text = ConstraintSpec::JsonSchema(json!(
        r#"{ "type": "object",
            "properties": { "id": {"type": "integer"}, "name": {"type": "string"} },
            "required": ["id"] }"#
    ));
    let b = cache.get_or_compile(&text, &vocab, &options).unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let stats = cache.stats();
    assert_eq!(stats.compilations, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.size, 1);
    assert!(stats.bytes > 0);
}

#[test]
fn test_concurrent_requests_compile_once() {
    const THREADS: usize = 8;
    let cache = Arc::new(GrammarCache::new(&CacheConfig::default()));
    let vocab = ascii_vocab();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let vocab = Arc::clone(&vocab);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache
                    .get_or_compile(&schema(), &vocab, &Default::default())
                    .unwrap()
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    let stats = cache.stats();
    assert_eq!(stats.compilations, 1);
    assert_eq!(stats.hits + stats.misses, THREADS as u64);
}

#[test]
fn test_sessions_on_a_shared_grammar_are_independent() {
    let cache = GrammarCache::new(&CacheConfig::default());
    let vocab = ascii_vocab();
    let compiled = cache.get_or_compile(&schema(), &vocab, &Default::default()).unwrap();

    let mut first = GrammarMatcher::new(Arc::clone(compiled.grammar()), Default::default());
    let mut second = GrammarMatcher::new(Arc::clone(compiled.grammar()), Default::default());
    for b in br#"{"id":7}"#.iter() {
        assert!(first.next_token_mask().unwrap().is_allowed(ascii_token(*b)));
        first.consume(ascii_token(*b)).unwrap();
    }
    assert_eq!(first.consume(0), Ok(MatcherState::Accepted));

    // The second session starts from scratch and shares the mask memo.
    assert!(compiled.grammar().cached_masks() > 0);
    assert!(!second.next_token_mask().unwrap().is_allowed(0));
    for b in br#"{"id":1,"name":"x"}"#.iter() {
        second.consume(ascii_token(*b)).unwrap();
    }
    assert_eq!(second.consume(0), Ok(MatcherState::Accepted));
}

#[test]
fn test_engine_config_drives_the_cache() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[cache]
memory_budget_bytes = 1

[json_schema]
unsupported_keywords = "reject"
"#
    )
    .unwrap();
    let config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.json_schema.unsupported_keywords, KeywordPolicy::Reject);

    let cache = GrammarCache::new(&config.cache);
    let vocab = ascii_vocab();
    // Too big for a one-byte budget: served, but never stored.
    let a = cache.get_or_compile(&schema(), &vocab, &config.json_schema).unwrap();
    let b = cache.get_or_compile(&schema(), &vocab, &config.json_schema).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(cache.stats().size, 0);
    assert_eq!(cache.stats().compilations, 2);

    let widened = ConstraintSpec::JsonSchema(json!({"type": "integer", "multipleOf": 3}));
    assert!(cache.get_or_compile(&widened, &vocab, &config.json_schema).is_err());
    assert!(cache.get_or_compile(&widened, &vocab, &Default::default()).is_ok());
}

#[test]
fn test_missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = EngineConfig::load(&dir.path().join("engine.toml")).unwrap_err();
    assert!(format!("{err:#}").contains("engine.toml"));
}
