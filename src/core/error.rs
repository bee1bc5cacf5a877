use thiserror::Error;

use super::types::InputField;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid input '{field}': {reason}")]
pub struct InputError {
    pub field: &'static str,
    pub reason: String,
}

impl InputError {
    pub fn new(field: InputField, reason: impl Into<String>) -> Self {
        Self {
            field: field.key(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("simulation cancelled after {completed} of {requested} iterations")]
    Cancelled { completed: usize, requested: usize },

    #[error(transparent)]
    InvalidInputs(#[from] InputError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("unknown graph node '{0}'")]
    UnknownNode(String),

    #[error("unknown traversal direction '{0}' (expected upstream or downstream)")]
    UnknownDirection(String),
}
