// src/error.rs
//
// Error types for the engine, connector, graph edits and configuration.
//
// Tick-time failures (a block throwing, an edge the backend rejects) are
// contained per instance / per edge and never escape as `Err` from a tick
// or a reconcile pass. These types describe what gets recorded.

use thiserror::Error;

use crate::state::PortType;

/// Failure while compiling or running a block's logic.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LogicError {
    /// The logic body could not be parsed.
    #[error("parse error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    /// The logic body raised an error with `throw`.
    #[error("{0}")]
    Thrown(String),

    /// An operation was applied to a value of the wrong type.
    #[error("type error: {0}")]
    Type(String),

    /// Call to a function the host does not provide.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// Read or assignment of an undeclared variable.
    #[error("'{0}' is not defined")]
    UnknownVariable(String),

    /// The logic body ran for more steps than one tick allows.
    #[error("step budget of {limit} exceeded")]
    BudgetExceeded { limit: u64 },
}

/// Failure reported by the audio backend for one connect/disconnect call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoutingError {
    #[error("backend rejected routing: {0}")]
    Backend(String),

    /// The endpoint no longer exists (node already torn down).
    #[error("no live endpoint for '{0}'")]
    UnknownEndpoint(String),
}

/// Failure while editing the patch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatchError {
    #[error("unknown instance '{0}'")]
    UnknownInstance(String),

    #[error("unknown specification '{0}'")]
    UnknownSpec(String),

    #[error("instance '{instance}' has no port '{port}'")]
    UnknownPort { instance: String, port: String },

    #[error("cannot connect {from} output to {to} input")]
    IncompatiblePorts { from: PortType, to: PortType },

    #[error("instance '{0}' already exists")]
    DuplicateInstance(String),
}

/// Failure while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
