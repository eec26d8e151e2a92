//! Built-in stages for word and character counting

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::{
    Finalizer, InputChunk, InputStream, MapEmitter, Mapper, OutputContext, Outputter, Reducer,
    StageError, StageResult,
};
use crate::process::Process;
use crate::storage::KeyValueStore;

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\W").expect("Valid regex pattern"));

/// Default number of whitespace-separated words per chunk
pub const DEFAULT_WORDS_PER_CHUNK: usize = 10;

/// Splits a string stored under the data reference into chunks of words
#[derive(Debug, Clone)]
pub struct WordStream {
    words_per_chunk: usize,
}

impl WordStream {
    pub fn new(words_per_chunk: usize) -> Self {
        Self {
            words_per_chunk: words_per_chunk.max(1),
        }
    }
}

impl Default for WordStream {
    fn default() -> Self {
        Self::new(DEFAULT_WORDS_PER_CHUNK)
    }
}

#[async_trait]
impl InputStream for WordStream {
    async fn scan(
        &self,
        store: &dyn KeyValueStore,
        data_ref: &str,
    ) -> StageResult<Vec<InputChunk>> {
        let text = store
            .get(data_ref)
            .await?
            .ok_or_else(|| StageError::fatal(format!("no input stored under {}", data_ref)))?;

        let words: Vec<&str> = text.split_whitespace().collect();
        let chunks: Vec<InputChunk> = words
            .chunks(self.words_per_chunk)
            .enumerate()
            .map(|(index, words)| InputChunk::new(index, words.join(" ")))
            .collect();

        debug!("Split {} words into {} chunks", words.len(), chunks.len());
        Ok(chunks)
    }
}

/// Emits `(lowercased word, 1)` for every word in a chunk
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCounter;

impl Mapper for WordCounter {
    fn map(&self, chunk: &str, emitter: &mut MapEmitter) -> StageResult<()> {
        for word in NON_WORD.split(chunk).filter(|word| !word.is_empty()) {
            emitter.emit(word.to_lowercase(), 1);
        }
        Ok(())
    }
}

/// Emits `(char, 1)` for every character in a chunk, whitespace included
#[derive(Debug, Clone, Copy, Default)]
pub struct CharCounter;

impl Mapper for CharCounter {
    fn map(&self, chunk: &str, emitter: &mut MapEmitter) -> StageResult<()> {
        for c in chunk.chars() {
            emitter.emit(c.to_string(), 1);
        }
        Ok(())
    }
}

/// Sums integer values
#[derive(Debug, Clone, Copy, Default)]
pub struct Adder;

impl Reducer for Adder {
    fn reduce(&self, values: &[String]) -> StageResult<String> {
        let mut total: i64 = 0;
        for value in values {
            let n: i64 = value
                .trim()
                .parse()
                .map_err(|_| StageError::fatal(format!("cannot add non-integer value {:?}", value)))?;
            total = total
                .checked_add(n)
                .ok_or_else(|| StageError::fatal(format!("sum overflows at {:?}", value)))?;
        }
        Ok(total.to_string())
    }
}

/// Writes every reduced pair through the process outputter
#[derive(Debug, Clone, Copy, Default)]
pub struct ToHash;

#[async_trait]
impl Finalizer for ToHash {
    async fn finalize(&self, process: &Process) -> StageResult<()> {
        let pairs = process.reduced_pairs().await?;
        for (key, value) in &pairs {
            process.encode(key, value).await?;
        }
        debug!("Wrote {} results for process {}", pairs.len(), process.pid());
        Ok(())
    }
}

/// Stores results as fields of one hash per keyname
#[derive(Debug, Clone, Copy, Default)]
pub struct HashOutputter;

#[async_trait]
impl Outputter for HashOutputter {
    async fn encode(
        &self,
        ctx: &OutputContext<'_>,
        keyname: &str,
        key: &str,
        value: &str,
    ) -> StageResult<()> {
        ctx.store
            .hash_set(&ctx.keys.output(keyname), key, value)
            .await?;
        Ok(())
    }

    async fn decode(
        &self,
        ctx: &OutputContext<'_>,
        keyname: &str,
        key: &str,
    ) -> StageResult<Option<String>> {
        Ok(ctx.store.hash_get(&ctx.keys.output(keyname), key).await?)
    }
}

/// Stores each result as a JSON string scalar
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonOutputter;

#[async_trait]
impl Outputter for JsonOutputter {
    async fn encode(
        &self,
        ctx: &OutputContext<'_>,
        keyname: &str,
        key: &str,
        value: &str,
    ) -> StageResult<()> {
        let encoded = serde_json::to_string(value)
            .map_err(|e| StageError::fatal(format!("cannot encode {:?}: {}", key, e)))?;
        ctx.store
            .set(&ctx.keys.output_value(keyname, key), &encoded)
            .await?;
        Ok(())
    }

    async fn decode(
        &self,
        ctx: &OutputContext<'_>,
        keyname: &str,
        key: &str,
    ) -> StageResult<Option<String>> {
        let Some(raw) = ctx.store.get(&ctx.keys.output_value(keyname, key)).await? else {
            return Ok(None);
        };
        let value: String = serde_json::from_str(&raw)
            .map_err(|e| StageError::fatal(format!("cannot decode {:?}: {}", key, e)))?;
        Ok(Some(value))
    }
}
