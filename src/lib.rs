// src/lib.rs
//
// Library entry point.
//
// Control-rate side of a block-based synthesizer: per-block logic runs on a
// fixed tick in dependency order, and audio-typed connections are mirrored
// into the host's audio graph.

mod compile_cache;
mod connector;
mod engine;
mod execution_order;
mod runtime;
mod state;

pub mod backend;
pub mod config;
pub mod error;
pub mod logic;
pub mod ticker;
pub mod value;

#[cfg(feature = "web")]
pub mod wasm;

// Re-export key types for Rust consumers
pub use backend::{AudioBackend, MemoryBackend, NodeRegistry};
pub use compile_cache::CompileCache;
pub use config::EngineConfig;
pub use connector::{ActiveRoute, AudioGraphConnector, ReconcileReport};
pub use engine::{LogicEngine, TickReport};
pub use error::{ConfigError, LogicError, PatchError, RoutingError};
pub use execution_order::execution_order;
pub use runtime::Runtime;
pub use state::{
    BlockInstance, BlockSpec, Command, CommandResult, Connection, GraphStore, InstanceUpdate,
    ParamSpec, ParamType, Patch, PortSpec, PortType, SpecRegistry,
};
pub use ticker::SessionHandle;
pub use value::{Value, ValueMap};
