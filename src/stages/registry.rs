//! Registry mapping stable names to stage implementations
//!
//! Queue payloads carry only a stage name. Workers resolve that name against
//! the registry they were started with, so every worker that may pick up a
//! job must register the same names.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::builtin;
use super::{Finalizer, InputStream, Mapper, Outputter, Reducer};
use crate::error::{Error, Result};
use crate::process::ProcessSpecification;

/// The role a registered stage plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Input,
    Map,
    Reduce,
    Finalize,
    Output,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Input => "input stream",
            Self::Map => "mapper",
            Self::Reduce => "reducer",
            Self::Finalize => "finalizer",
            Self::Output => "outputter",
        };
        f.write_str(name)
    }
}

/// A registered stage implementation
#[derive(Clone)]
pub enum Stage {
    Input(Arc<dyn InputStream>),
    Map(Arc<dyn Mapper>),
    Reduce(Arc<dyn Reducer>),
    Finalize(Arc<dyn Finalizer>),
    Output(Arc<dyn Outputter>),
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Input(_) => StageKind::Input,
            Self::Map(_) => StageKind::Map,
            Self::Reduce(_) => StageKind::Reduce,
            Self::Finalize(_) => StageKind::Finalize,
            Self::Output(_) => StageKind::Output,
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stage({})", self.kind())
    }
}

/// Name -> stage lookup table
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<String, Stage>,
}

impl StageRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in stages
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("word_stream", Stage::Input(Arc::new(builtin::WordStream::default())))
            .register("word_counter", Stage::Map(Arc::new(builtin::WordCounter)))
            .register("char_counter", Stage::Map(Arc::new(builtin::CharCounter)))
            .register("adder", Stage::Reduce(Arc::new(builtin::Adder)))
            .register("to_hash", Stage::Finalize(Arc::new(builtin::ToHash)))
            .register("hash_outputter", Stage::Output(Arc::new(builtin::HashOutputter)))
            .register("json_outputter", Stage::Output(Arc::new(builtin::JsonOutputter)));
        registry
    }

    /// Registers `stage` under `name`, replacing any previous registration
    pub fn register(&mut self, name: impl Into<String>, stage: Stage) -> &mut Self {
        self.stages.insert(name.into(), stage);
        self
    }

    pub fn register_input(
        &mut self,
        name: impl Into<String>,
        stage: impl InputStream + 'static,
    ) -> &mut Self {
        self.register(name, Stage::Input(Arc::new(stage)))
    }

    pub fn register_mapper(
        &mut self,
        name: impl Into<String>,
        stage: impl Mapper + 'static,
    ) -> &mut Self {
        self.register(name, Stage::Map(Arc::new(stage)))
    }

    pub fn register_reducer(
        &mut self,
        name: impl Into<String>,
        stage: impl Reducer + 'static,
    ) -> &mut Self {
        self.register(name, Stage::Reduce(Arc::new(stage)))
    }

    pub fn register_finalizer(
        &mut self,
        name: impl Into<String>,
        stage: impl Finalizer + 'static,
    ) -> &mut Self {
        self.register(name, Stage::Finalize(Arc::new(stage)))
    }

    pub fn register_outputter(
        &mut self,
        name: impl Into<String>,
        stage: impl Outputter + 'static,
    ) -> &mut Self {
        self.register(name, Stage::Output(Arc::new(stage)))
    }

    /// Gets a stage by name
    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.stages.get(name)
    }

    /// Gets a stage by name, failing for unknown names
    pub fn resolve(&self, name: &str) -> Result<&Stage> {
        self.get(name)
            .ok_or_else(|| Error::UnknownWorker(name.to_string()))
    }

    /// Lists all registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.stages.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn input(&self, name: &str) -> Result<Arc<dyn InputStream>> {
        match self.expect_kind(name, StageKind::Input)? {
            Stage::Input(stage) => Ok(stage.clone()),
            _ => unreachable!("kind checked"),
        }
    }

    pub fn mapper(&self, name: &str) -> Result<Arc<dyn Mapper>> {
        match self.expect_kind(name, StageKind::Map)? {
            Stage::Map(stage) => Ok(stage.clone()),
            _ => unreachable!("kind checked"),
        }
    }

    pub fn reducer(&self, name: &str) -> Result<Arc<dyn Reducer>> {
        match self.expect_kind(name, StageKind::Reduce)? {
            Stage::Reduce(stage) => Ok(stage.clone()),
            _ => unreachable!("kind checked"),
        }
    }

    pub fn finalizer(&self, name: &str) -> Result<Arc<dyn Finalizer>> {
        match self.expect_kind(name, StageKind::Finalize)? {
            Stage::Finalize(stage) => Ok(stage.clone()),
            _ => unreachable!("kind checked"),
        }
    }

    pub fn outputter(&self, name: &str) -> Result<Arc<dyn Outputter>> {
        match self.expect_kind(name, StageKind::Output)? {
            Stage::Output(stage) => Ok(stage.clone()),
            _ => unreachable!("kind checked"),
        }
    }

    /// Checks every stage a specification names is registered with the right role
    pub fn validate(&self, spec: &ProcessSpecification) -> Result<()> {
        self.expect_kind(&spec.inputter, StageKind::Input)?;
        self.expect_kind(&spec.mapper, StageKind::Map)?;
        self.expect_kind(&spec.reducer, StageKind::Reduce)?;
        if let Some(finalizer) = &spec.finalizer {
            self.expect_kind(finalizer, StageKind::Finalize)?;
        }
        if let Some(outputter) = &spec.outputter {
            self.expect_kind(outputter, StageKind::Output)?;
        }
        Ok(())
    }

    fn expect_kind(&self, name: &str, kind: StageKind) -> Result<&Stage> {
        let stage = self.get(name).ok_or_else(|| {
            Error::Specification(format!("no {} registered under {:?}", kind, name))
        })?;
        if stage.kind() != kind {
            return Err(Error::Specification(format!(
                "{:?} is registered as a {}, not a {}",
                name,
                stage.kind(),
                kind
            )));
        }
        Ok(stage)
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.names())
            .finish()
    }
}
