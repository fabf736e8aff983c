use crate::value::Value;
use std::fmt;
use thiserror::Error;

/// A position in a model source file. Statements, definitions and values all
/// carry the location they originate from so that every diagnostic can point
/// back into the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
}

impl Location {
    pub fn new<S: Into<String>>(file: S, line: u32) -> Self {
        Location {
            file: file.into(),
            line,
        }
    }

    /// Location for values synthesized by the engine itself (defaults,
    /// inverse relation wiring).
    pub fn internal() -> Self {
        Location {
            file: "<internal>".to_string(),
            line: 0,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Everything that can go wrong during a compile.
///
/// Errors are collected per compile rather than aborting on first failure;
/// the scheduler keeps running so a single run surfaces every problem it can
/// reach. Each variant carries the location that triggered it.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CompileError {
    #[error("could not find type {name} in namespace {namespace} ({location})")]
    TypeNotFound {
        name: String,
        namespace: String,
        location: Location,
    },

    #[error("could not find value {name} ({location})")]
    NameNotFound { name: String, location: Location },

    #[error("{message} ({location}) (duplicate at {other})")]
    Duplicate {
        message: String,
        location: Location,
        other: Location,
    },

    #[error("{message} ({location})")]
    Typing { message: String, location: Location },

    #[error("value set twice on {target}: old value: {old} (set at {first}), new value: {new} ({location})")]
    DoubleSet {
        target: String,
        old: Value,
        new: Value,
        first: Location,
        location: Location,
    },

    #[error("{target} requires at least {required} values but only {actual} are set ({location})")]
    MultiplicityUnderfill {
        target: String,
        required: usize,
        actual: usize,
        location: Location,
    },

    #[error("index collision on {index}: {message} ({location}) (other instance at {other})")]
    IndexCollision {
        index: String,
        message: String,
        location: Location,
        other: Location,
    },

    #[error("could not complete model: no fixpoint reached after {iterations} iterations")]
    FixpointExhausted { iterations: usize },

    #[error("plugin {name} failed: {message} ({location})")]
    Plugin {
        name: String,
        message: String,
        location: Location,
    },
}

impl CompileError {
    pub fn typing<S: Into<String>>(message: S, location: Location) -> Self {
        CompileError::Typing {
            message: message.into(),
            location,
        }
    }
}

/// Collects the errors produced over the course of one compile.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<CompileError>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, error: CompileError) {
        tracing::debug!(error = %error, "diagnostic reported");
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[CompileError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<CompileError> {
        self.errors
    }
}
