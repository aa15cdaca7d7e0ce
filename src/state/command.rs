// Commands from the UI to the engine.
//
// Once the runtime is running on its own thread, commands are the ONLY way
// the UI can mutate patch or engine state. They are queued and applied
// between ticks, never during one.

use serde::{Deserialize, Serialize};

use super::{BlockInstance, BlockSpec, ConnectionId, InstanceId};
use crate::value::Value;

/// A command from the UI to the engine.
///
/// Commands are:
/// - Immutable once created
/// - Applied in order, between ticks
/// - Answered with exactly one `CommandResult`
///
/// On the JSON boundary a command is an object tagged by `type`, e.g.
/// `{"type": "setParam", "instanceId": "lfo1", "paramId": "rate", "value": 2}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    // ═══════════════════════════════════════════
    // Specifications
    // ═══════════════════════════════════════════
    /// Register a new specification.
    RegisterSpec { spec: BlockSpec },

    /// Replace a specification; instances using it recompile their logic.
    UpdateSpec { spec: BlockSpec },

    // ═══════════════════════════════════════════
    // Graph mutations
    // ═══════════════════════════════════════════
    /// Add a block instance.
    AddInstance { instance: BlockInstance },

    /// Remove an instance, its connections and its live routing.
    RemoveInstance { instance_id: InstanceId },

    /// Connect two ports.
    Connect {
        from_instance: InstanceId,
        from_output: String,
        to_instance: InstanceId,
        to_input: String,
    },

    /// Remove a connection.
    Disconnect { connection_id: ConnectionId },

    // ═══════════════════════════════════════════
    // Parameter changes
    // ═══════════════════════════════════════════
    /// Set a parameter value.
    SetParam {
        instance_id: InstanceId,
        param_id: String,
        value: Value,
    },

    // ═══════════════════════════════════════════
    // Engine
    // ═══════════════════════════════════════════
    /// Globally enable or disable audio (starts/stops the tick loop).
    SetAudioEnabled { enabled: bool },

    /// Set the global tempo in BPM.
    SetTempo { bpm: f64 },

    /// Drop compiled logic for one instance, or for all when `None`.
    InvalidateLogic { instance_id: Option<InstanceId> },

    /// Release the audio backend; routing is torn down and ticking stops.
    DetachBackend,

    /// Ask for a copy of every instance.
    Snapshot,

    /// Stop the engine thread.
    Shutdown,
}

/// Response from the engine after processing a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CommandResult {
    /// Command succeeded.
    Ok,

    /// Command succeeded and created a connection.
    Connected { connection_id: ConnectionId },

    /// Answer to `Command::Snapshot`.
    Snapshot { instances: Vec<BlockInstance> },

    /// Command failed.
    Error { message: String },
}
