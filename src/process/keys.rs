//! Storage key derivation
//!
//! Every key the engine touches is derived here from the namespace, a
//! process id, a table name and (for per-key tables) the logical key.
//! Logical keys come from user mappers and may contain anything, so they are
//! replaced by a stable digest unless they are made only of safe characters.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::{ProcessId, ProcessState};

static SAFE_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    // '.' is excluded so a digest segment ("h.<hex>") can never collide
    // with a logical key that passed through unchanged
    Regex::new(r"^[A-Za-z0-9_\-]{1,64}$").expect("Valid regex pattern")
});

/// Stable hex digest of a logical key
///
/// Identical across processes, machines and releases, unlike the std hasher.
pub fn key_hash(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{:x}", digest)[..32].to_string()
}

/// Key segment for a logical key: the key itself when safe, a digest otherwise
pub fn key_segment(key: &str) -> String {
    if SAFE_SEGMENT.is_match(key) {
        key.to_string()
    } else {
        format!("h.{}", key_hash(key))
    }
}

/// Derives storage keys under a namespace prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Set of every known process id
    pub fn processes(&self) -> String {
        format!("{}:processes", self.prefix)
    }

    /// Persisted process record
    pub fn process(&self, pid: &ProcessId) -> String {
        format!("{}:process:{}", self.prefix, pid)
    }

    /// Hash of input chunks, chunk index -> chunk
    pub fn input(&self, pid: &ProcessId) -> String {
        format!("{}:process:{}:input", self.prefix, pid)
    }

    /// Set of distinct intermediate keys
    pub fn map_keys(&self, pid: &ProcessId) -> String {
        format!("{}:process:{}:map_keys", self.prefix, pid)
    }

    /// Set of keys with at least one reduced value
    pub fn reduce_keys(&self, pid: &ProcessId) -> String {
        format!("{}:process:{}:reduce_keys", self.prefix, pid)
    }

    /// Nonreduced values emitted for `key`
    pub fn map_values(&self, pid: &ProcessId, key: &str) -> String {
        format!("{}:process:{}:map:{}", self.prefix, pid, key_segment(key))
    }

    /// Reduced values emitted for `key`
    pub fn reduce_values(&self, pid: &ProcessId, key: &str) -> String {
        format!("{}:process:{}:reduce:{}", self.prefix, pid, key_segment(key))
    }

    /// Input text staged by the process itself
    pub fn upload(&self, pid: &ProcessId) -> String {
        format!("{}:process:{}:upload", self.prefix, pid)
    }

    /// Outstanding-unit markers for one stage of a process
    pub fn slaves(&self, pid: &ProcessId, stage: ProcessState) -> String {
        format!("{}:process:{}:slaves:{}", self.prefix, pid, stage.label())
    }

    /// Latest process id an owner ran under a template name
    pub fn support(&self, owner: &str, name: &str) -> String {
        format!(
            "{}:support:{}:{}",
            self.prefix,
            key_segment(owner),
            key_segment(name)
        )
    }

    /// Default output namespace when a specification names no keyname
    pub fn default_keyname(&self, pid: &ProcessId) -> String {
        format!("{}:result:{}", self.prefix, pid)
    }

    /// Output hash for a keyname
    pub fn output(&self, keyname: &str) -> String {
        format!("{}:output:{}", self.prefix, keyname)
    }

    /// Output scalar for one key under a keyname
    pub fn output_value(&self, keyname: &str, key: &str) -> String {
        format!("{}:output:{}:{}", self.prefix, keyname, key_segment(key))
    }
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self::new("mapstage")
    }
}
