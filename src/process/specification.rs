//! Process specifications
//!
//! A specification names the registered stage implementations a process
//! runs with, plus the ordering mode and the output keyname.

use serde::{Deserialize, Serialize};

use super::ProcessState;
use crate::error::{Error, Result};

/// The stages and options a process runs with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpecification {
    /// Registered input splitter
    pub inputter: String,
    /// Registered mapper
    pub mapper: String,
    /// Registered reducer
    pub reducer: String,
    /// Registered finalizer; without one the finalize stage only completes the process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizer: Option<String>,
    /// Registered outputter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputter: Option<String>,
    /// Whether intermediate emissions carry a rank
    #[serde(default)]
    pub ordered: bool,
    /// Output namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyname: Option<String>,
}

impl ProcessSpecification {
    pub fn builder() -> SpecificationBuilder {
        SpecificationBuilder::default()
    }
}

/// Builder that rejects specifications missing a required stage
#[derive(Debug, Clone, Default)]
pub struct SpecificationBuilder {
    inputter: Option<String>,
    mapper: Option<String>,
    reducer: Option<String>,
    finalizer: Option<String>,
    outputter: Option<String>,
    ordered: bool,
    keyname: Option<String>,
}

impl SpecificationBuilder {
    pub fn inputter(mut self, name: impl Into<String>) -> Self {
        self.inputter = Some(name.into());
        self
    }

    pub fn mapper(mut self, name: impl Into<String>) -> Self {
        self.mapper = Some(name.into());
        self
    }

    pub fn reducer(mut self, name: impl Into<String>) -> Self {
        self.reducer = Some(name.into());
        self
    }

    pub fn finalizer(mut self, name: impl Into<String>) -> Self {
        self.finalizer = Some(name.into());
        self
    }

    pub fn outputter(mut self, name: impl Into<String>) -> Self {
        self.outputter = Some(name.into());
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn keyname(mut self, keyname: impl Into<String>) -> Self {
        self.keyname = Some(keyname.into());
        self
    }

    pub fn build(self) -> Result<ProcessSpecification> {
        Ok(ProcessSpecification {
            inputter: required("inputter", self.inputter)?,
            mapper: required("mapper", self.mapper)?,
            reducer: required("reducer", self.reducer)?,
            finalizer: self.finalizer,
            outputter: self.outputter,
            ordered: self.ordered,
            keyname: self.keyname,
        })
    }
}

fn required(field: &str, value: Option<String>) -> Result<String> {
    match value {
        Some(name) if !name.trim().is_empty() => Ok(name),
        _ => Err(Error::Specification(format!(
            "process specification is missing its {}",
            field
        ))),
    }
}

/// Fields to merge into a persisted process in one write
///
/// `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessUpdate {
    pub inputter: Option<String>,
    pub mapper: Option<String>,
    pub reducer: Option<String>,
    pub finalizer: Option<String>,
    pub outputter: Option<String>,
    pub ordered: Option<bool>,
    pub keyname: Option<String>,
    pub state: Option<ProcessState>,
    pub synchronous: Option<bool>,
}

impl ProcessUpdate {
    pub fn mapper(mut self, name: impl Into<String>) -> Self {
        self.mapper = Some(name.into());
        self
    }

    pub fn reducer(mut self, name: impl Into<String>) -> Self {
        self.reducer = Some(name.into());
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = Some(ordered);
        self
    }

    pub fn keyname(mut self, keyname: impl Into<String>) -> Self {
        self.keyname = Some(keyname.into());
        self
    }

    pub fn state(mut self, state: ProcessState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = Some(synchronous);
        self
    }

    /// Merge the specification fields into `spec`
    pub(crate) fn apply_to(&self, spec: &mut ProcessSpecification) {
        if let Some(inputter) = &self.inputter {
            spec.inputter = inputter.clone();
        }
        if let Some(mapper) = &self.mapper {
            spec.mapper = mapper.clone();
        }
        if let Some(reducer) = &self.reducer {
            spec.reducer = reducer.clone();
        }
        if let Some(finalizer) = &self.finalizer {
            spec.finalizer = Some(finalizer.clone());
        }
        if let Some(outputter) = &self.outputter {
            spec.outputter = Some(outputter.clone());
        }
        if let Some(ordered) = self.ordered {
            spec.ordered = ordered;
        }
        if let Some(keyname) = &self.keyname {
            spec.keyname = Some(keyname.clone());
        }
    }
}
