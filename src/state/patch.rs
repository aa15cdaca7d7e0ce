// Declarative patch: block instances, their connections and live values.
//
// This is the "document" the UI edits and the logic engine reports into.
// Everything the engine and connector read goes through the `GraphStore`
// trait so they can run against any store, not just `Patch`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{BlockSpec, PortId, PortType, SpecId, SpecRegistry};
use crate::error::PatchError;
use crate::value::{Value, ValueMap};

/// Unique identifier of a block instance.
pub type InstanceId = String;

/// Unique identifier of a connection.
pub type ConnectionId = String;

/// A live block in the user's signal graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInstance {
    pub id: InstanceId,

    /// Specification this instance was created from.
    #[serde(rename = "definitionId")]
    pub spec_id: SpecId,

    /// User-facing name, used in error messages.
    #[serde(default)]
    pub name: String,

    /// Current parameter values.
    #[serde(default, rename = "parameters")]
    pub params: ValueMap,

    /// Persistent state owned by the block's logic; round-trips across ticks.
    #[serde(default)]
    pub internal_state: ValueMap,

    /// Output values committed by the last tick.
    #[serde(default)]
    pub last_outputs: ValueMap,

    /// Error from the last tick, if it failed.
    #[serde(default)]
    pub error: Option<String>,

    /// Instance-scoped log lines.
    #[serde(default)]
    pub logs: Vec<String>,
}

impl BlockInstance {
    pub fn new(id: impl Into<InstanceId>, spec_id: impl Into<SpecId>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            spec_id: spec_id.into(),
            params: ValueMap::new(),
            internal_state: ValueMap::new(),
            last_outputs: ValueMap::new(),
            error: None,
            logs: Vec::new(),
        }
    }

    /// Create an instance with the specification's name and parameter defaults.
    pub fn from_spec(id: impl Into<InstanceId>, spec: &BlockSpec) -> Self {
        let mut instance = Self::new(id, spec.id.clone());
        if !spec.name.is_empty() {
            instance.name = spec.name.clone();
        }
        for param in &spec.parameters {
            instance.params.insert(param.id.clone(), param.default.clone());
        }
        instance
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_param(mut self, param_id: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(param_id.into(), value.into());
        self
    }
}

/// A directed edge from one instance's output port to another's input port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub from_instance_id: InstanceId,
    pub from_output_id: PortId,
    pub to_instance_id: InstanceId,
    pub to_input_id: PortId,
}

impl Connection {
    pub fn new(
        id: impl Into<ConnectionId>,
        from_instance_id: impl Into<InstanceId>,
        from_output_id: impl Into<PortId>,
        to_instance_id: impl Into<InstanceId>,
        to_input_id: impl Into<PortId>,
    ) -> Self {
        Self {
            id: id.into(),
            from_instance_id: from_instance_id.into(),
            from_output_id: from_output_id.into(),
            to_instance_id: to_instance_id.into(),
            to_input_id: to_input_id.into(),
        }
    }

    pub fn targets(&self, instance_id: &str, input_id: &str) -> bool {
        self.to_instance_id == instance_id && self.to_input_id == input_id
    }

    pub fn touches(&self, instance_id: &str) -> bool {
        self.from_instance_id == instance_id || self.to_instance_id == instance_id
    }
}

/// Values the logic engine commits for one instance after a tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceUpdate {
    pub last_outputs: ValueMap,
    pub internal_state: ValueMap,
    pub error: Option<String>,
}

/// Read access to the graph plus the batched write-back the engine uses.
pub trait GraphStore {
    fn instances(&self) -> &[BlockInstance];

    fn connections(&self) -> &[Connection];

    fn specification(&self, instance: &BlockInstance) -> Option<Arc<BlockSpec>>;

    /// Apply every update computed during one tick.
    fn batch_update_instances(&mut self, updates: Vec<(InstanceId, InstanceUpdate)>);

    fn append_instance_log(&mut self, instance_id: &str, message: String);

    fn instance(&self, id: &str) -> Option<&BlockInstance> {
        self.instances().iter().find(|i| i.id == id)
    }
}

/// In-memory graph store.
#[derive(Debug, Clone, Default)]
pub struct Patch {
    specs: SpecRegistry,
    instances: Vec<BlockInstance>,
    connections: Vec<Connection>,
    next_connection: u64,
    max_log_lines: usize,
}

impl Patch {
    pub fn new(specs: SpecRegistry) -> Self {
        Self {
            specs,
            instances: Vec::new(),
            connections: Vec::new(),
            next_connection: 0,
            max_log_lines: crate::config::DEFAULT_MAX_LOG_LINES,
        }
    }

    pub fn with_log_limit(mut self, max_log_lines: usize) -> Self {
        self.max_log_lines = max_log_lines;
        self
    }

    pub fn specs(&self) -> &SpecRegistry {
        &self.specs
    }

    /// Register or replace a specification.
    pub fn register_spec(&mut self, spec: BlockSpec) -> Option<Arc<BlockSpec>> {
        self.specs.register(spec)
    }

    /// Add an instance. Its specification is not required to exist yet;
    /// a dangling reference is reported by the engine at tick time.
    pub fn add_instance(&mut self, instance: BlockInstance) -> Result<(), PatchError> {
        if self.instance(&instance.id).is_some() {
            return Err(PatchError::DuplicateInstance(instance.id));
        }
        self.instances.push(instance);
        Ok(())
    }

    /// Create an instance of a registered specification with default params.
    pub fn create_instance(
        &mut self,
        id: impl Into<InstanceId>,
        spec_id: &str,
    ) -> Result<&BlockInstance, PatchError> {
        let spec = self
            .specs
            .get(spec_id)
            .ok_or_else(|| PatchError::UnknownSpec(spec_id.to_string()))?;
        let instance = BlockInstance::from_spec(id, &spec);
        self.add_instance(instance)?;
        Ok(&self.instances[self.instances.len() - 1])
    }

    /// Remove an instance and every connection referencing it.
    pub fn remove_instance(&mut self, id: &str) -> Option<BlockInstance> {
        self.connections.retain(|c| !c.touches(id));
        let index = self.instances.iter().position(|i| i.id == id)?;
        Some(self.instances.remove(index))
    }

    pub fn instance_mut(&mut self, id: &str) -> Option<&mut BlockInstance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    /// Connect two ports, generating a connection id.
    pub fn connect(
        &mut self,
        from_instance: &str,
        from_output: &str,
        to_instance: &str,
        to_input: &str,
    ) -> Result<ConnectionId, PatchError> {
        if let Some(existing) = self.connections.iter().find(|c| {
            c.from_instance_id == from_instance
                && c.from_output_id == from_output
                && c.targets(to_instance, to_input)
        }) {
            return Ok(existing.id.clone());
        }

        let id = loop {
            self.next_connection += 1;
            let candidate = format!("conn-{}", self.next_connection);
            if !self.connections.iter().any(|c| c.id == candidate) {
                break candidate;
            }
        };

        self.add_connection(Connection::new(
            id.clone(),
            from_instance,
            from_output,
            to_instance,
            to_input,
        ))?;
        Ok(id)
    }

    /// Add a connection with a caller-chosen id.
    ///
    /// Ports must exist and be type-compatible. A non-audio input accepts
    /// a single driver, so any connection already targeting it is replaced;
    /// audio inputs fan in.
    pub fn add_connection(&mut self, conn: Connection) -> Result<(), PatchError> {
        let from_port = self.port_of(&conn.from_instance_id, &conn.from_output_id, false)?;
        let to_port = self.port_of(&conn.to_instance_id, &conn.to_input_id, true)?;

        if !to_port.accepts(&from_port) {
            return Err(PatchError::IncompatiblePorts {
                from: from_port.port_type,
                to: to_port.port_type,
            });
        }

        if to_port.port_type != PortType::Audio {
            self.connections
                .retain(|c| !c.targets(&conn.to_instance_id, &conn.to_input_id));
        }
        self.connections.retain(|c| c.id != conn.id);
        self.connections.push(conn);
        Ok(())
    }

    fn port_of(
        &self,
        instance_id: &str,
        port_id: &str,
        input: bool,
    ) -> Result<super::PortSpec, PatchError> {
        let instance = self
            .instance(instance_id)
            .ok_or_else(|| PatchError::UnknownInstance(instance_id.to_string()))?;
        let spec = self
            .specs
            .get(&instance.spec_id)
            .ok_or_else(|| PatchError::UnknownSpec(instance.spec_id.clone()))?;
        let port = if input {
            spec.find_input(port_id)
        } else {
            spec.find_output(port_id)
        };
        port.cloned().ok_or_else(|| PatchError::UnknownPort {
            instance: instance_id.to_string(),
            port: port_id.to_string(),
        })
    }

    /// Remove a connection by id.
    pub fn disconnect(&mut self, connection_id: &str) -> Option<Connection> {
        let index = self.connections.iter().position(|c| c.id == connection_id)?;
        Some(self.connections.remove(index))
    }

    /// Set a parameter value, constrained by the specification's bounds.
    pub fn set_param(
        &mut self,
        instance_id: &str,
        param_id: &str,
        value: Value,
    ) -> Result<(), PatchError> {
        let spec_id = self
            .instance(instance_id)
            .map(|i| i.spec_id.clone())
            .ok_or_else(|| PatchError::UnknownInstance(instance_id.to_string()))?;

        let value = match self.specs.get(&spec_id) {
            Some(spec) => spec
                .find_param(param_id)
                .map(|p| p.constrain(value.clone()))
                .unwrap_or(value),
            None => value,
        };

        if let Some(instance) = self.instance_mut(instance_id) {
            instance.params.insert(param_id.to_string(), value);
        }
        Ok(())
    }

    /// Connections driving a specific input port.
    pub fn connections_to<'a>(
        &'a self,
        instance_id: &'a str,
        input_id: &'a str,
    ) -> impl Iterator<Item = &'a Connection> {
        self.connections
            .iter()
            .filter(move |c| c.targets(instance_id, input_id))
    }

    /// Connections leaving a specific instance.
    pub fn connections_from<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> impl Iterator<Item = &'a Connection> {
        self.connections
            .iter()
            .filter(move |c| c.from_instance_id == instance_id)
    }

    /// Instances using a specification.
    pub fn instances_of<'a>(&'a self, spec_id: &'a str) -> impl Iterator<Item = &'a BlockInstance> {
        self.instances.iter().filter(move |i| i.spec_id == spec_id)
    }
}

impl GraphStore for Patch {
    fn instances(&self) -> &[BlockInstance] {
        &self.instances
    }

    fn connections(&self) -> &[Connection] {
        &self.connections
    }

    fn specification(&self, instance: &BlockInstance) -> Option<Arc<BlockSpec>> {
        self.specs.get(&instance.spec_id)
    }

    fn batch_update_instances(&mut self, updates: Vec<(InstanceId, InstanceUpdate)>) {
        for (id, update) in updates {
            if let Some(instance) = self.instance_mut(&id) {
                instance.last_outputs = update.last_outputs;
                instance.internal_state = update.internal_state;
                instance.error = update.error;
            }
        }
    }

    fn append_instance_log(&mut self, instance_id: &str, message: String) {
        let limit = self.max_log_lines;
        if let Some(instance) = self.instance_mut(instance_id) {
            instance.logs.push(message);
            if instance.logs.len() > limit {
                let excess = instance.logs.len() - limit;
                instance.logs.drain(..excess);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ParamSpec, PortSpec};

    fn registry() -> SpecRegistry {
        let mut specs = SpecRegistry::new();
        specs.register(
            BlockSpec::new("num", "Number")
                .with_input(PortSpec::new("in", PortType::Number))
                .with_output(PortSpec::new("out", PortType::Number))
                .with_param(ParamSpec::number("gain", 1.0).range(0.0, 2.0)),
        );
        specs.register(
            BlockSpec::new("osc", "Oscillator")
                .with_input(PortSpec::audio("in"))
                .with_output(PortSpec::audio("out")),
        );
        specs.register(
            BlockSpec::new("seq", "Sequencer")
                .with_output(PortSpec::new("trig", PortType::Trigger))
                .with_output(PortSpec::new("label", PortType::String)),
        );
        specs.register(
            BlockSpec::new("env", "Envelope").with_input(PortSpec::new("gate", PortType::Gate)),
        );
        specs
    }

    fn patch_with(ids: &[(&str, &str)]) -> Patch {
        let mut patch = Patch::new(registry());
        for (id, spec) in ids {
            patch.create_instance(*id, spec).unwrap();
        }
        patch
    }

    #[test]
    fn test_create_instance_uses_spec_defaults() {
        let patch = patch_with(&[("a", "num")]);
        let a = patch.instance("a").unwrap();
        assert_eq!(a.name, "Number");
        assert_eq!(a.params.get("gain"), Some(&Value::from(1.0)));
    }

    #[test]
    fn test_duplicate_instance_rejected() {
        let mut patch = patch_with(&[("a", "num")]);
        let err = patch.add_instance(BlockInstance::new("a", "num")).unwrap_err();
        assert_eq!(err, PatchError::DuplicateInstance("a".into()));
    }

    #[test]
    fn test_instance_builders() {
        let mut patch = patch_with(&[]);
        let instance = BlockInstance::new("g", "num")
            .named("Gain Stage")
            .with_param("gain", 1.5);
        patch.add_instance(instance).unwrap();

        let g = patch.instance("g").unwrap();
        assert_eq!(g.name, "Gain Stage");
        assert_eq!(g.params.get("gain"), Some(&Value::from(1.5)));
    }

    #[test]
    fn test_instance_json_carries_no_layout() {
        let json = r#"{"id": "a", "definitionId": "num", "position": [10, 20]}"#;
        let instance: BlockInstance = serde_json::from_str(json).unwrap();
        assert_eq!(instance.spec_id, "num");

        let back = serde_json::to_value(&instance).unwrap();
        assert!(back.get("position").is_none());
        assert_eq!(back["definitionId"], "num");
    }

    #[test]
    fn test_control_input_replaces_previous_driver() {
        let mut patch = patch_with(&[("a", "num"), ("b", "num"), ("c", "num")]);
        let first = patch.connect("a", "out", "c", "in").unwrap();
        let second = patch.connect("b", "out", "c", "in").unwrap();

        assert_ne!(first, second);
        let drivers: Vec<_> = patch.connections_to("c", "in").collect();
        assert_eq!(drivers.len(), 1);
        assert_eq!(drivers[0].from_instance_id, "b");
    }

    #[test]
    fn test_audio_input_fans_in() {
        let mut patch = patch_with(&[("a", "osc"), ("b", "osc"), ("c", "osc")]);
        patch.connect("a", "out", "c", "in").unwrap();
        patch.connect("b", "out", "c", "in").unwrap();
        assert_eq!(patch.connections_to("c", "in").count(), 2);
    }

    #[test]
    fn test_reconnecting_same_edge_is_idempotent() {
        let mut patch = patch_with(&[("a", "num"), ("b", "num")]);
        let first = patch.connect("a", "out", "b", "in").unwrap();
        let again = patch.connect("a", "out", "b", "in").unwrap();
        assert_eq!(first, again);
        assert_eq!(patch.connections().len(), 1);
    }

    #[test]
    fn test_incompatible_ports_rejected() {
        let mut patch = patch_with(&[("s", "seq"), ("a", "num"), ("e", "env")]);
        let err = patch.connect("s", "label", "a", "in").unwrap_err();
        assert_eq!(
            err,
            PatchError::IncompatiblePorts {
                from: PortType::String,
                to: PortType::Number
            }
        );

        // trigger -> gate is allowed
        assert!(patch.connect("s", "trig", "e", "gate").is_ok());
    }

    #[test]
    fn test_unknown_port_rejected() {
        let mut patch = patch_with(&[("a", "num"), ("b", "num")]);
        let err = patch.connect("a", "nope", "b", "in").unwrap_err();
        assert!(matches!(err, PatchError::UnknownPort { .. }));
    }

    #[test]
    fn test_remove_instance_drops_its_connections() {
        let mut patch = patch_with(&[("a", "num"), ("b", "num"), ("c", "num")]);
        patch.connect("a", "out", "b", "in").unwrap();
        patch.connect("b", "out", "c", "in").unwrap();
        assert_eq!(patch.connections_from("b").count(), 1);

        assert!(patch.remove_instance("b").is_some());
        assert_eq!(patch.connections_from("b").count(), 0);
        assert!(patch.connections().is_empty());
        assert_eq!(patch.instances().len(), 2);
    }

    #[test]
    fn test_set_param_is_clamped() {
        let mut patch = patch_with(&[("a", "num")]);
        patch.set_param("a", "gain", Value::from(5.0)).unwrap();
        assert_eq!(
            patch.instance("a").unwrap().params.get("gain"),
            Some(&Value::from(2.0))
        );
        assert!(patch.set_param("zzz", "gain", Value::from(1.0)).is_err());
    }

    #[test]
    fn test_log_cap_drops_oldest() {
        let mut patch = patch_with(&[("a", "num")]).with_log_limit(2);
        for i in 0..3 {
            patch.append_instance_log("a", format!("line {}", i));
        }
        assert_eq!(patch.instance("a").unwrap().logs, vec!["line 1", "line 2"]);
    }

    #[test]
    fn test_batch_update_writes_fields() {
        let mut patch = patch_with(&[("a", "num")]);
        let mut outputs = ValueMap::new();
        outputs.insert("out".into(), 3.into());
        patch.batch_update_instances(vec![(
            "a".into(),
            InstanceUpdate {
                last_outputs: outputs.clone(),
                internal_state: ValueMap::new(),
                error: Some("bad".into()),
            },
        )]);
        let a = patch.instance("a").unwrap();
        assert_eq!(a.last_outputs, outputs);
        assert_eq!(a.error.as_deref(), Some("bad"));
    }
}
