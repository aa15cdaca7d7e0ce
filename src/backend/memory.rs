// src/backend/memory.rs
//
// In-memory audio backend.
//
// Hands out node handles, keeps the live connection set and records every
// connect/disconnect/message call so routing behaviour can be asserted
// without a real audio context.

use std::collections::{HashMap, HashSet};

use super::{
    ALL_PASS_DELAY_PARAM, ALL_PASS_FEEDBACK_PARAM, AllPassNodes, AudioBackend, ContextState,
    NodeHandle, NodeRegistry, ParamHandle, RegistryKind, RouteTarget,
};
use crate::error::RoutingError;
use crate::state::InstanceId;
use crate::value::Value;

/// One call made against the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Connect {
        source: NodeHandle,
        target: RouteTarget,
    },
    Disconnect {
        source: NodeHandle,
        target: RouteTarget,
    },
}

#[derive(Debug, Default)]
struct MemoryRegistry {
    outputs: HashMap<InstanceId, NodeHandle>,
    params: HashMap<(InstanceId, String), ParamHandle>,
    all_pass: HashMap<InstanceId, AllPassNodes>,
}

impl NodeRegistry for MemoryRegistry {
    fn output(&self, instance_id: &str) -> Option<NodeHandle> {
        self.outputs.get(instance_id).copied()
    }

    fn param(&self, instance_id: &str, name: &str) -> Option<ParamHandle> {
        self.params
            .get(&(instance_id.to_string(), name.to_string()))
            .cloned()
    }

    fn all_pass(&self, instance_id: &str) -> Option<AllPassNodes> {
        self.all_pass.get(instance_id).cloned()
    }
}

/// Backend double that routes nothing but remembers everything.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Option<ContextState>,
    sample_rate: f64,
    next_handle: u64,
    registries: HashMap<RegistryKind, MemoryRegistry>,
    torn_down: HashSet<NodeHandle>,
    live: HashSet<(NodeHandle, RouteTarget)>,
    calls: Vec<BackendCall>,
    messages: Vec<(InstanceId, Value)>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SAMPLE_RATE)
    }
}

impl MemoryBackend {
    /// A backend with a running context.
    pub fn new(sample_rate: f64) -> Self {
        Self {
            state: Some(ContextState::Running),
            sample_rate,
            next_handle: 1,
            registries: HashMap::new(),
            torn_down: HashSet::new(),
            live: HashSet::new(),
            calls: Vec::new(),
            messages: Vec::new(),
        }
    }

    fn allocate(&mut self) -> NodeHandle {
        let handle = NodeHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn registry_mut(&mut self, kind: RegistryKind) -> &mut MemoryRegistry {
        self.registries.entry(kind).or_default()
    }

    fn add_node(&mut self, kind: RegistryKind, instance_id: &str) -> NodeHandle {
        let handle = self.allocate();
        self.registry_mut(kind)
            .outputs
            .insert(instance_id.to_string(), handle);
        handle
    }

    fn add_param(&mut self, kind: RegistryKind, instance_id: &str, name: &str) -> ParamHandle {
        let existing = self.registry_mut(kind).outputs.get(instance_id).copied();
        let node = match existing {
            Some(node) => node,
            None => self.add_node(kind, instance_id),
        };
        let param = ParamHandle::new(node, name);
        self.registry_mut(kind)
            .params
            .insert((instance_id.to_string(), name.to_string()), param.clone());
        param
    }

    // ═══════════════════════════════════════════════════════════════
    // Registration
    // ═══════════════════════════════════════════════════════════════

    pub fn add_native_node(&mut self, instance_id: &str) -> NodeHandle {
        self.add_node(RegistryKind::Native, instance_id)
    }

    /// Expose a named audio-rate parameter on a native node (created if needed).
    pub fn add_native_param(&mut self, instance_id: &str, name: &str) -> ParamHandle {
        self.add_param(RegistryKind::Native, instance_id, name)
    }

    pub fn add_custom_unit(&mut self, instance_id: &str) -> NodeHandle {
        self.add_node(RegistryKind::CustomUnit, instance_id)
    }

    pub fn add_custom_param(&mut self, instance_id: &str, name: &str) -> ParamHandle {
        self.add_param(RegistryKind::CustomUnit, instance_id, name)
    }

    pub fn add_generative_output(&mut self, instance_id: &str) -> NodeHandle {
        self.add_node(RegistryKind::Generative, instance_id)
    }

    /// Register a native all-pass filter: an output node plus delay and
    /// feedback sub-nodes.
    pub fn add_all_pass(&mut self, instance_id: &str) -> AllPassNodes {
        self.add_native_node(instance_id);
        let delay = self.allocate();
        let feedback = self.allocate();
        let nodes = AllPassNodes {
            delay,
            feedback,
            delay_time: ParamHandle::new(delay, ALL_PASS_DELAY_PARAM),
            feedback_gain: ParamHandle::new(feedback, ALL_PASS_FEEDBACK_PARAM),
        };
        self.registry_mut(RegistryKind::Native)
            .all_pass
            .insert(instance_id.to_string(), nodes.clone());
        nodes
    }

    /// Destroy a node: later connect/disconnect calls on it fail.
    pub fn tear_down(&mut self, handle: NodeHandle) {
        self.torn_down.insert(handle);
        self.live
            .retain(|(source, target)| *source != handle && target_node(target) != handle);
    }

    pub fn set_context_state(&mut self, state: Option<ContextState>) {
        self.state = state;
    }

    // ═══════════════════════════════════════════════════════════════
    // Inspection
    // ═══════════════════════════════════════════════════════════════

    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<BackendCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn connect_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, BackendCall::Connect { .. }))
            .count()
    }

    pub fn disconnect_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, BackendCall::Disconnect { .. }))
            .count()
    }

    pub fn is_connected(&self, source: NodeHandle, target: &RouteTarget) -> bool {
        self.live.contains(&(source, target.clone()))
    }

    pub fn live_route_count(&self) -> usize {
        self.live.len()
    }

    pub fn messages(&self) -> &[(InstanceId, Value)] {
        &self.messages
    }

    fn check_alive(&self, source: NodeHandle, target: &RouteTarget) -> Result<(), RoutingError> {
        for node in [source, target_node(target)] {
            if self.torn_down.contains(&node) {
                return Err(RoutingError::UnknownEndpoint(node.to_string()));
            }
        }
        Ok(())
    }
}

fn target_node(target: &RouteTarget) -> NodeHandle {
    match target {
        RouteTarget::Node(node) => *node,
        RouteTarget::Param(param) => param.node,
    }
}

impl AudioBackend for MemoryBackend {
    fn context_state(&self) -> Option<ContextState> {
        self.state
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn registry(&self, kind: RegistryKind) -> Option<&dyn NodeRegistry> {
        self.registries
            .get(&kind)
            .map(|r| r as &dyn NodeRegistry)
    }

    fn connect(&mut self, source: NodeHandle, target: &RouteTarget) -> Result<(), RoutingError> {
        self.calls.push(BackendCall::Connect {
            source,
            target: target.clone(),
        });
        self.check_alive(source, target)?;
        self.live.insert((source, target.clone()));
        Ok(())
    }

    fn disconnect(
        &mut self,
        source: NodeHandle,
        target: &RouteTarget,
    ) -> Result<(), RoutingError> {
        self.calls.push(BackendCall::Disconnect {
            source,
            target: target.clone(),
        });
        self.check_alive(source, target)?;
        if !self.live.remove(&(source, target.clone())) {
            return Err(RoutingError::Backend(format!(
                "{} is not connected to {}",
                source, target
            )));
        }
        Ok(())
    }

    fn send_instance_message(&mut self, instance_id: &str, payload: Value) {
        self.messages.push((instance_id.to_string(), payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_resolve_by_kind() {
        let mut backend = MemoryBackend::default();
        let osc = backend.add_native_node("osc");
        let unit = backend.add_custom_unit("unit");
        let gen_out = backend.add_generative_output("gen");

        let native = backend.registry(RegistryKind::Native).unwrap();
        assert_eq!(native.output("osc"), Some(osc));
        assert_eq!(native.input("osc"), Some(osc));
        assert_eq!(native.output("unit"), None);

        let custom = backend.registry(RegistryKind::CustomUnit).unwrap();
        assert_eq!(custom.output("unit"), Some(unit));

        let generative = backend.registry(RegistryKind::Generative).unwrap();
        assert_eq!(generative.output("gen"), Some(gen_out));
    }

    #[test]
    fn test_param_shares_the_node() {
        let mut backend = MemoryBackend::default();
        let filter = backend.add_native_node("filter");
        let cutoff = backend.add_native_param("filter", "frequency");
        assert_eq!(cutoff.node, filter);

        let native = backend.registry(RegistryKind::Native).unwrap();
        assert_eq!(native.param("filter", "frequency"), Some(cutoff));
        assert_eq!(native.param("filter", "Q"), None);
    }

    #[test]
    fn test_torn_down_node_rejects_routing() {
        let mut backend = MemoryBackend::default();
        let a = backend.add_native_node("a");
        let b = backend.add_native_node("b");
        let target = RouteTarget::Node(b);

        backend.connect(a, &target).unwrap();
        assert!(backend.is_connected(a, &target));

        backend.tear_down(b);
        assert_eq!(backend.live_route_count(), 0);
        assert!(matches!(
            backend.connect(a, &target),
            Err(RoutingError::UnknownEndpoint(_))
        ));
        assert_eq!(backend.connect_count(), 2);
    }

    #[test]
    fn test_disconnect_requires_live_route() {
        let mut backend = MemoryBackend::default();
        let a = backend.add_native_node("a");
        let b = backend.add_native_node("b");
        assert!(backend.disconnect(a, &RouteTarget::Node(b)).is_err());
    }
}
