//! Intermediate key/value tables of one process
//!
//! Two per-process tables hold what the map and reduce stages emit:
//!
//! - *nonreduced*: key -> every value a mapper emitted for it
//! - *reduced*: key -> the value(s) a reducer emitted for it
//!
//! plus the sets of distinct keys present in each. All writes are single
//! appends or set-adds, so concurrent sibling units never need a lock.
//!
//! In ordered mode a nonreduced entry also carries a rank. Entries are kept
//! in a sorted set scored by rank, and iterating the whole table yields pairs
//! in rank order across every key.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use super::keys::KeyNamespace;
use super::ProcessId;
use crate::error::{Error, Result};
use crate::storage::KeyValueStore;

/// Stored form of a ranked nonreduced value
#[derive(Debug, Serialize, Deserialize)]
struct RankedValue {
    rank: i64,
    // Keeps repeated (rank, value) emissions distinct in the sorted set
    id: String,
    value: String,
}

#[derive(Debug, Clone, Copy)]
enum Table {
    Nonreduced,
    Reduced,
}

/// One ranked nonreduced pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedPair {
    pub rank: i64,
    pub key: String,
    pub value: String,
}

/// Emission and iteration over one process's intermediate tables
#[derive(Clone)]
pub struct IntermediateStore {
    store: Arc<dyn KeyValueStore>,
    keys: KeyNamespace,
    pid: ProcessId,
    ordered: bool,
}

impl IntermediateStore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: KeyNamespace,
        pid: ProcessId,
        ordered: bool,
    ) -> Self {
        Self {
            store,
            keys,
            pid,
            ordered,
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Append an unranked value to the nonreduced list for `key`
    ///
    /// Rejected on an ordered process, whose entries must all carry a rank.
    pub async fn emit_intermediate(&self, key: &str, value: &str) -> Result<()> {
        if self.ordered {
            return Err(Error::UnrankedEmission {
                pid: self.pid.to_string(),
            });
        }
        self.push_unranked(key, value).await
    }

    /// Append a ranked value to the nonreduced entries for `key`
    ///
    /// On an unordered process the rank is ignored.
    pub async fn emit_intermediate_ranked(&self, rank: i64, key: &str, value: &str) -> Result<()> {
        if !self.ordered {
            return self.push_unranked(key, value).await;
        }
        let member = serde_json::to_string(&RankedValue {
            rank,
            id: Uuid::new_v4().simple().to_string(),
            value: value.to_string(),
        })?;
        self.store
            .sorted_add(&self.keys.map_values(&self.pid, key), rank as f64, &member)
            .await?;
        self.store
            .set_add(&self.keys.map_keys(&self.pid), key)
            .await?;
        trace!("emit_intermediate {} {:?} at rank {}", self.pid, key, rank);
        Ok(())
    }

    async fn push_unranked(&self, key: &str, value: &str) -> Result<()> {
        self.store
            .list_push(&self.keys.map_values(&self.pid, key), value)
            .await?;
        self.store
            .set_add(&self.keys.map_keys(&self.pid), key)
            .await?;
        trace!("emit_intermediate {} {:?}", self.pid, key);
        Ok(())
    }

    /// Append a value to the reduced list for `key`
    pub async fn emit(&self, key: &str, value: &str) -> Result<()> {
        self.store
            .list_push(&self.keys.reduce_values(&self.pid, key), value)
            .await?;
        self.store
            .set_add(&self.keys.reduce_keys(&self.pid), key)
            .await?;
        trace!("emit {} {:?}", self.pid, key);
        Ok(())
    }

    /// Make `value` the only reduced value for `key`
    pub async fn replace(&self, key: &str, value: &str) -> Result<()> {
        self.store
            .list_replace(&self.keys.reduce_values(&self.pid, key), value)
            .await?;
        self.store
            .set_add(&self.keys.reduce_keys(&self.pid), key)
            .await?;
        trace!("emit {} {:?} (replacing)", self.pid, key);
        Ok(())
    }

    /// Distinct keys with at least one nonreduced value, sorted
    pub async fn map_keys(&self) -> Result<Vec<String>> {
        let mut keys = self.store.set_members(&self.keys.map_keys(&self.pid)).await?;
        keys.sort();
        Ok(keys)
    }

    /// Distinct keys with at least one reduced value, sorted
    pub async fn reduce_keys(&self) -> Result<Vec<String>> {
        let mut keys = self
            .store
            .set_members(&self.keys.reduce_keys(&self.pid))
            .await?;
        keys.sort();
        Ok(keys)
    }

    /// Nonreduced values for `key`: rank order if ordered, emission order otherwise
    pub async fn map_values(&self, key: &str) -> Result<Vec<String>> {
        if self.ordered {
            Ok(self
                .ranked_values(key)
                .await?
                .into_iter()
                .map(|ranked| ranked.value)
                .collect())
        } else {
            Ok(self
                .store
                .list_range(&self.keys.map_values(&self.pid, key), 0, -1)
                .await?)
        }
    }

    /// Reduced values for `key`
    pub async fn reduce_values(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .list_range(&self.keys.reduce_values(&self.pid, key), 0, -1)
            .await?)
    }

    async fn ranked_values(&self, key: &str) -> Result<Vec<RankedValue>> {
        let entries = self
            .store
            .sorted_range(&self.keys.map_values(&self.pid, key))
            .await?;
        entries
            .into_iter()
            .map(|(member, _)| serde_json::from_str(&member).map_err(Error::from))
            .collect()
    }

    /// Every ranked nonreduced pair of the process, ascending by rank
    ///
    /// Equal ranks are ordered by key. Fails on an unordered process.
    pub async fn ranked_pairs(&self) -> Result<Vec<RankedPair>> {
        if !self.ordered {
            return Err(Error::Invariant(format!(
                "process {} is not ordered",
                self.pid
            )));
        }
        let mut pairs = Vec::new();
        for key in self.map_keys().await? {
            for ranked in self.ranked_values(&key).await? {
                pairs.push(RankedPair {
                    rank: ranked.rank,
                    key: key.clone(),
                    value: ranked.value,
                });
            }
        }
        pairs.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.key.cmp(&b.key)));
        Ok(pairs)
    }

    /// Every `(key, value)` of the nonreduced table
    ///
    /// Unordered processes are read one key at a time. Ordered processes are
    /// read whole so the pairs can be merged by rank across keys.
    pub fn each_key_nonreduced_value(&self) -> BoxStream<'static, Result<(String, String)>> {
        if !self.ordered {
            return self.clone().keyed_pairs(Table::Nonreduced);
        }
        let this = self.clone();
        stream::once(async move { this.ranked_pairs().await })
            .map_ok(|pairs| {
                stream::iter(
                    pairs
                        .into_iter()
                        .map(|pair| Ok::<_, Error>((pair.key, pair.value))),
                )
            })
            .try_flatten()
            .boxed()
    }

    /// Every `(key, value)` of the reduced table, one key at a time
    pub fn each_key_reduced_value(&self) -> BoxStream<'static, Result<(String, String)>> {
        self.clone().keyed_pairs(Table::Reduced)
    }

    fn keyed_pairs(self, table: Table) -> BoxStream<'static, Result<(String, String)>> {
        let lookup = self.clone();
        stream::once(async move {
            match table {
                Table::Nonreduced => self.map_keys().await,
                Table::Reduced => self.reduce_keys().await,
            }
        })
        .map_ok(move |keys| {
            let lookup = lookup.clone();
            stream::iter(keys)
                .then(move |key| {
                    let lookup = lookup.clone();
                    async move {
                        let values = match table {
                            Table::Nonreduced => lookup.map_values(&key).await?,
                            Table::Reduced => lookup.reduce_values(&key).await?,
                        };
                        Ok::<_, Error>(pairs_of(key, values))
                    }
                })
                .try_flatten()
        })
        .try_flatten()
        .boxed()
    }

    /// Remove both tables and their key sets; returns how many store keys existed
    pub async fn clear(&self) -> Result<usize> {
        let mut doomed = Vec::new();
        for key in self.map_keys().await? {
            doomed.push(self.keys.map_values(&self.pid, &key));
        }
        for key in self.reduce_keys().await? {
            doomed.push(self.keys.reduce_values(&self.pid, &key));
        }
        doomed.push(self.keys.map_keys(&self.pid));
        doomed.push(self.keys.reduce_keys(&self.pid));
        Ok(self.store.delete(&doomed).await?)
    }
}

fn pairs_of(
    key: String,
    values: Vec<String>,
) -> stream::Iter<impl Iterator<Item = Result<(String, String)>>> {
    stream::iter(values.into_iter().map(move |value| Ok((key.clone(), value))))
}
