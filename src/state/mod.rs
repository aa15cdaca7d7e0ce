// src/state/mod.rs
//
// Declarative state layer.
//
// This module contains the structures that describe the user's patch:
// block specifications, block instances, connections, and the commands
// used to mutate them while the engine is running.
//
// Key principles:
// - All structures are serializable (specs and instances cross the JS boundary as JSON)
// - Mutations happen through Commands once the engine is running
// - The logic engine and audio connector only see the patch through `GraphStore`

mod block_spec;
mod command;
mod patch;

pub use block_spec::*;
pub use command::*;
pub use patch::*;
