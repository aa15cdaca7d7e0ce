//! Sandboxed host for per-block control logic.
//!
//! Block logic is untrusted source text supplied with a specification. It is
//! compiled once into a [`CompiledLogic`] and then run every tick through a
//! narrow interface: inputs, params and a copy of state go in; named
//! outputs, log lines, backend messages and a state update come out. The
//! logic cannot reach anything else.
//!
//! The built-in host ([`ScriptHost`]) parses a small JavaScript-flavoured
//! language:
//!
//! ```text
//! let level = inputs.gate ? params.depth : 0;
//! if (inputs.trig && !state.armed) {
//!     send({ type: "retrigger" });
//! }
//! output("level", level * 2);
//! return { armed: inputs.trig };
//! ```

mod ast;
mod interpreter;
mod parser;

use std::sync::Arc;

pub use ast::{AssignTarget, BinaryOp, Expr, Program, Stmt, UnaryOp};
pub use parser::parse_program;

use crate::error::LogicError;
use crate::value::{Value, ValueMap};

/// Read-only values every logic call receives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionContext {
    /// Sample rate of the audio backend.
    pub sample_rate: f64,

    /// Global tempo in BPM.
    pub bpm: f64,
}

impl ExecutionContext {
    pub fn new(sample_rate: f64, bpm: f64) -> Self {
        Self { sample_rate, bpm }
    }
}

/// Everything one run of a block's logic may see and touch.
pub struct LogicCall<'a> {
    /// Resolved input values, one per declared input port.
    pub inputs: &'a ValueMap,

    /// Current parameter values.
    pub params: &'a ValueMap,

    /// Copy of the instance's persistent state.
    pub state: ValueMap,

    pub context: ExecutionContext,

    /// Outputs recorded by the logic.
    pub outputs: &'a mut ValueMap,

    /// Log lines appended by the logic.
    pub logs: &'a mut Vec<String>,

    /// Forwards a message to the instance's audio-rate counterpart.
    pub send: &'a mut dyn FnMut(Value),
}

/// A compiled logic body, reusable across ticks.
pub trait CompiledLogic: Send + Sync + std::fmt::Debug {
    /// Run once. Returns the state update to merge over the previous state.
    fn run(&self, call: LogicCall<'_>) -> Result<ValueMap, LogicError>;
}

/// Compiles logic source into runnable form.
pub trait LogicHost: Send {
    fn compile(&self, source: &str) -> Result<Arc<dyn CompiledLogic>, LogicError>;
}

/// Host for the built-in block script language.
#[derive(Debug, Clone)]
pub struct ScriptHost {
    budget: u64,
}

impl ScriptHost {
    /// Create a host whose scripts may take at most `budget` steps per run.
    pub fn new(budget: u64) -> Self {
        Self { budget }
    }
}

impl Default for ScriptHost {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SCRIPT_OP_BUDGET)
    }
}

impl LogicHost for ScriptHost {
    fn compile(&self, source: &str) -> Result<Arc<dyn CompiledLogic>, LogicError> {
        let program = parse_program(source)?;
        Ok(Arc::new(Script {
            program,
            budget: self.budget,
        }))
    }
}

/// A parsed block script.
#[derive(Debug)]
struct Script {
    program: Program,
    budget: u64,
}

impl CompiledLogic for Script {
    fn run(&self, call: LogicCall<'_>) -> Result<ValueMap, LogicError> {
        interpreter::Interpreter::new(call, self.budget).run(&self.program)
    }
}
