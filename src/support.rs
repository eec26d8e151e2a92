//! Processes owned by an application object
//!
//! A [`Support`] handle gives one owner (a document, an account, anything with
//! a stable id) a set of named process templates. Running a template starts a
//! fresh process whose output lives under the owner's own keyname, and the
//! latest process of each template can be found again by name.

use std::collections::HashMap;

use tracing::debug;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::process::{Process, ProcessId, ProcessSpecification};

/// Named processes of one owner
#[derive(Clone)]
pub struct Support {
    engine: Engine,
    owner: String,
    templates: HashMap<String, ProcessSpecification>,
}

impl Support {
    pub fn new(engine: Engine, owner: impl Into<String>) -> Self {
        Self {
            engine,
            owner: owner.into(),
            templates: HashMap::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Register a template under `name`
    ///
    /// Without a keyname of its own, output goes under `<owner>:<name>`.
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        mut specification: ProcessSpecification,
    ) -> Result<&mut Self> {
        self.engine.registry().validate(&specification)?;
        let name = name.into();
        if specification.keyname.is_none() {
            specification.keyname = Some(format!("{}:{}", self.owner, name));
        }
        self.templates.insert(name, specification);
        Ok(self)
    }

    fn template(&self, name: &str) -> Result<&ProcessSpecification> {
        self.templates.get(name).ok_or_else(|| {
            Error::Specification(format!("{} declares no process named {}", self.owner, name))
        })
    }

    /// Keyname the output of template `name` is written under
    pub fn keyname(&self, name: &str) -> Result<String> {
        Ok(self
            .template(name)?
            .keyname
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.owner, name)))
    }

    /// Start a new process from template `name` over `data_ref`
    ///
    /// It replaces any earlier process of the same name as the one
    /// [`Support::process`] returns.
    pub async fn run(&self, name: &str, data_ref: &str, synchronous: bool) -> Result<Process> {
        let specification = self.template(name)?.clone();
        let mut process = Process::create(&self.engine, specification).await?;
        self.engine
            .store()
            .set(
                &self.engine.keys().support(&self.owner, name),
                process.pid().as_str(),
            )
            .await?;
        debug!("{} runs {} as process {}", self.owner, name, process.pid());

        process.run(data_ref, synchronous).await?;
        Ok(process)
    }

    /// The latest process started from template `name`, if it still exists
    pub async fn process(&self, name: &str) -> Result<Option<Process>> {
        self.template(name)?;
        let Some(pid) = self
            .engine
            .store()
            .get(&self.engine.keys().support(&self.owner, name))
            .await?
        else {
            return Ok(None);
        };
        match Process::open(&self.engine, &ProcessId::from(pid)).await {
            Ok(process) => Ok(Some(process)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Final value of `key` from the latest process of template `name`
    pub async fn result(&self, name: &str, key: &str) -> Result<Option<String>> {
        match self.process(name).await? {
            Some(process) => process.decode(key).await,
            None => Ok(None),
        }
    }
}
