//! Common test utilities and fixtures

#![allow(dead_code)]

use std::collections::HashMap;

use mapstage::{Engine, Process, ProcessSpecification, StageRegistry};

/// Word count fixture
pub const TEST_TEXT: &str = "He pointed his finger in friendly jest and went over to the parapet \
laughing to himself. Stephen Dedalus stepped up, followed him wearily halfway and sat down on \
the edge of the gunrest, watching him still as he propped his mirror on the parapet, dipped the \
brush in the bowl and lathered cheeks and neck.";

pub const TEST_INPUT_KEY: &str = "wordstream:test";

/// Expected counts for [`TEST_TEXT`]
pub fn expected_word_counts() -> HashMap<&'static str, u64> {
    [
        ("gunrest", 1),
        ("over", 1),
        ("still", 1),
        ("of", 1),
        ("him", 2),
        ("and", 4),
        ("bowl", 1),
        ("himself", 1),
        ("went", 1),
        ("friendly", 1),
        ("finger", 1),
        ("propped", 1),
        ("cheeks", 1),
        ("dipped", 1),
        ("down", 1),
        ("wearily", 1),
        ("up", 1),
        ("stepped", 1),
        ("dedalus", 1),
        ("to", 2),
        ("in", 2),
        ("sat", 1),
        ("the", 6),
        ("pointed", 1),
        ("as", 1),
        ("followed", 1),
        ("stephen", 1),
        ("laughing", 1),
        ("his", 2),
        ("he", 2),
        ("brush", 1),
        ("jest", 1),
        ("neck", 1),
        ("mirror", 1),
        ("edge", 1),
        ("on", 2),
        ("parapet", 2),
        ("lathered", 1),
        ("watching", 1),
        ("halfway", 1),
    ]
    .into_iter()
    .collect()
}

/// In-memory engine with the built-in stages
pub fn test_engine() -> Engine {
    Engine::in_memory(StageRegistry::with_builtins())
}

/// Engine with the fixture text already stored under [`TEST_INPUT_KEY`]
pub async fn seeded_engine() -> Engine {
    let engine = test_engine();
    engine
        .store()
        .set(TEST_INPUT_KEY, TEST_TEXT)
        .await
        .expect("Failed to seed input");
    engine
}

pub fn word_count_spec() -> ProcessSpecification {
    ProcessSpecification::builder()
        .inputter("word_stream")
        .mapper("word_counter")
        .reducer("adder")
        .finalizer("to_hash")
        .outputter("hash_outputter")
        .keyname("test:result")
        .build()
        .expect("Valid word count specification")
}

pub fn char_count_spec(keyname: &str) -> ProcessSpecification {
    ProcessSpecification::builder()
        .inputter("word_stream")
        .mapper("char_counter")
        .reducer("adder")
        .finalizer("to_hash")
        .outputter("hash_outputter")
        .keyname(keyname)
        .build()
        .expect("Valid char count specification")
}

/// Check every final value of a finished word count against the fixture
pub async fn assert_word_counts(process: &Process) {
    let expected = expected_word_counts();
    let keys = process.map_keys().await.unwrap();
    assert_eq!(keys.len(), expected.len());

    for key in &keys {
        assert_eq!(process.reduce_values(key).await.unwrap().len(), 1, "{}", key);
        let decoded = process.decode(key).await.unwrap().unwrap();
        assert_eq!(decoded.parse::<u64>().unwrap(), expected[key.as_str()], "{}", key);
    }
}
