// src/backend/mod.rs
//
// Audio backend abstraction.
//
// The engine never touches the host's audio engine directly. It sees a
// handful of managed-node registries (instance id -> live endpoint) and a
// connect/disconnect surface. The browser build implements this over the
// Web Audio graph; tests and the sanity binary use `MemoryBackend`.

pub mod memory;

use std::fmt;

use crate::error::RoutingError;
use crate::value::Value;

pub use memory::{BackendCall, MemoryBackend};

/// Parameter name of the all-pass delay line's delay time.
pub const ALL_PASS_DELAY_PARAM: &str = "delayTime";

/// Parameter name of the all-pass feedback gain.
pub const ALL_PASS_FEEDBACK_PARAM: &str = "feedback";

/// Opaque handle to a live node in the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(pub u64);

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// An audio-rate parameter on a live node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamHandle {
    pub node: NodeHandle,
    pub name: String,
}

impl ParamHandle {
    pub fn new(node: NodeHandle, name: impl Into<String>) -> Self {
        Self {
            node,
            name: name.into(),
        }
    }
}

/// Where a route delivers its signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteTarget {
    /// The node's main input.
    Node(NodeHandle),

    /// One of the node's audio-rate parameters.
    Param(ParamHandle),
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Node(node) => write!(f, "{}", node),
            RouteTarget::Param(param) => write!(f, "{}.{}", param.node, param.name),
        }
    }
}

/// State of the backend's audio context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Running,
    Suspended,
    Closed,
}

/// The managed-node registries, in the order sources are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKind {
    /// Custom processing units (script-defined audio nodes).
    CustomUnit,

    /// Native backend nodes (oscillators, filters, gain stages).
    Native,

    /// The generative-music streaming service.
    Generative,
}

impl RegistryKind {
    /// Resolution priority: custom unit, native node, generative service.
    pub const ALL: [RegistryKind; 3] = [
        RegistryKind::CustomUnit,
        RegistryKind::Native,
        RegistryKind::Generative,
    ];
}

/// Internal structure of the two-path all-pass filter.
///
/// A signal routed into this topology must reach both the delay line and
/// the feedback/passthrough stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllPassNodes {
    pub delay: NodeHandle,
    pub feedback: NodeHandle,
    pub delay_time: ParamHandle,
    pub feedback_gain: ParamHandle,
}

/// Instance id -> live endpoint lookup for one kind of managed node.
pub trait NodeRegistry {
    /// Endpoint that produces the instance's audio output.
    fn output(&self, instance_id: &str) -> Option<NodeHandle>;

    /// Designated main input endpoint. Most nodes use the same node for
    /// both directions.
    fn input(&self, instance_id: &str) -> Option<NodeHandle> {
        self.output(instance_id)
    }

    /// A named audio-rate parameter on the instance's node.
    fn param(&self, instance_id: &str, name: &str) -> Option<ParamHandle>;

    /// All-pass sub-nodes, if the instance uses that topology.
    fn all_pass(&self, _instance_id: &str) -> Option<AllPassNodes> {
        None
    }
}

/// The host's audio engine as seen by the logic engine and the connector.
pub trait AudioBackend {
    /// `None` when no audio context exists at all.
    fn context_state(&self) -> Option<ContextState>;

    fn sample_rate(&self) -> f64;

    fn registry(&self, kind: RegistryKind) -> Option<&dyn NodeRegistry>;

    fn connect(&mut self, source: NodeHandle, target: &RouteTarget) -> Result<(), RoutingError>;

    fn disconnect(&mut self, source: NodeHandle, target: &RouteTarget)
    -> Result<(), RoutingError>;

    /// Forward an opaque control message to the instance's audio-rate
    /// counterpart. Instances without one ignore it.
    fn send_instance_message(&mut self, instance_id: &str, payload: Value);

    fn is_running(&self) -> bool {
        self.context_state() == Some(ContextState::Running)
    }
}
