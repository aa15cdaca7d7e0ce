// src/state/block_spec.rs
//
// Block specifications: the immutable templates instances are created from.
//
// Specifications are supplied externally (loaded at startup or produced by
// a block-generation assistant) and never mutated while instances refer to
// them; an edit registers a replacement `Arc<BlockSpec>`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Identifier of a block specification.
pub type SpecId = String;

/// Identifier of a port on a block specification.
pub type PortId = String;

/// Identifier of a parameter on a block specification.
pub type ParamId = String;

/// Semantic type of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Number,
    String,
    Boolean,
    /// Audio-rate signal routed through the backend, not the logic engine.
    Audio,
    /// Transient control pulse.
    Trigger,
    /// Sustained on/off control signal.
    Gate,
    /// Accepts and connects to every other type.
    Any,
}

impl PortType {
    /// Value an input of this type sees when nothing drives it.
    pub fn default_value(self) -> Value {
        match self {
            PortType::Number => Value::Number(0.0),
            PortType::String => Value::String(String::new()),
            PortType::Boolean | PortType::Gate => Value::Bool(false),
            PortType::Audio | PortType::Trigger | PortType::Any => Value::Null,
        }
    }

    /// Whether an output of type `self` may drive an input of type `dest`.
    pub fn is_compatible(self, dest: PortType) -> bool {
        use PortType::*;
        match (self, dest) {
            (Any, _) | (_, Any) => true,
            (Trigger, Gate) | (Gate, Trigger) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortType::Number => "number",
            PortType::String => "string",
            PortType::Boolean => "boolean",
            PortType::Audio => "audio",
            PortType::Trigger => "trigger",
            PortType::Gate => "gate",
            PortType::Any => "any",
        };
        write!(f, "{}", name)
    }
}

/// Metadata describing one input or output port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    pub id: PortId,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type")]
    pub port_type: PortType,

    /// Name of an audio-rate parameter on the live node this input drives
    /// directly (e.g. a filter's `frequency`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_target: Option<String>,
}

impl PortSpec {
    pub fn new(id: impl Into<PortId>, port_type: PortType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            port_type,
            param_target: None,
        }
    }

    pub fn audio(id: impl Into<PortId>) -> Self {
        Self::new(id, PortType::Audio)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn param_target(mut self, param: impl Into<String>) -> Self {
        self.param_target = Some(param.into());
        self
    }

    /// Whether this input port accepts a connection from `source`.
    ///
    /// Besides the plain type rules, an audio output may bind onto an input
    /// that declares a parameter target.
    pub fn accepts(&self, source: &PortSpec) -> bool {
        source.port_type.is_compatible(self.port_type)
            || (source.port_type == PortType::Audio && self.param_target.is_some())
    }
}

/// Kind of value a parameter holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Number,
    Boolean,
    String,
    Select,
}

/// Metadata describing a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSpec {
    pub id: ParamId,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type")]
    pub param_type: ParamType,

    #[serde(default, rename = "defaultValue")]
    pub default: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,

    /// Allowed values for `select` parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl ParamSpec {
    pub fn new(id: impl Into<ParamId>, param_type: ParamType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            param_type,
            default: Value::Null,
            min: None,
            max: None,
            step: None,
            options: Vec::new(),
        }
    }

    pub fn number(id: impl Into<ParamId>, default: f64) -> Self {
        Self::new(id, ParamType::Number).default(default)
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }

    pub fn options<S: Into<String>>(mut self, options: impl IntoIterator<Item = S>) -> Self {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Constrain a value to this parameter's declared bounds.
    ///
    /// Numbers are clamped to `min`/`max`; a `select` value outside its
    /// options falls back to the default. Other values pass through.
    pub fn constrain(&self, value: Value) -> Value {
        match (self.param_type, value) {
            (ParamType::Number, Value::Number(n)) => {
                let lo = self.min.unwrap_or(f64::NEG_INFINITY);
                let hi = self.max.unwrap_or(f64::INFINITY);
                Value::Number(n.max(lo).min(hi))
            }
            (ParamType::Select, Value::String(s)) => {
                if self.options.is_empty() || self.options.contains(&s) {
                    Value::String(s)
                } else {
                    self.default.clone()
                }
            }
            (_, other) => other,
        }
    }
}

/// Immutable template for a block: ports, parameters and control logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSpec {
    pub id: SpecId,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub inputs: Vec<PortSpec>,

    #[serde(default)]
    pub outputs: Vec<PortSpec>,

    #[serde(default)]
    pub parameters: Vec<ParamSpec>,

    /// Control-logic source body, executed once per tick.
    #[serde(default, rename = "logicCode")]
    pub logic: String,
}

impl BlockSpec {
    pub fn new(id: impl Into<SpecId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameters: Vec::new(),
            logic: String::new(),
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_input(mut self, port: PortSpec) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: PortSpec) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn with_logic(mut self, source: impl Into<String>) -> Self {
        self.logic = source.into();
        self
    }

    pub fn find_input(&self, id: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.id == id)
    }

    pub fn find_output(&self, id: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.id == id)
    }

    pub fn find_param(&self, id: &str) -> Option<&ParamSpec> {
        self.parameters.iter().find(|p| p.id == id)
    }
}

/// Registry of available block specifications.
///
/// The UI uses this to populate the block palette; the engine uses it to
/// look up ports and logic for each instance.
#[derive(Debug, Default, Clone)]
pub struct SpecRegistry {
    specs: HashMap<SpecId, Arc<BlockSpec>>,
}

impl SpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a specification, returning the one it replaced.
    pub fn register(&mut self, spec: BlockSpec) -> Option<Arc<BlockSpec>> {
        self.specs.insert(spec.id.clone(), Arc::new(spec))
    }

    /// Register every specification in a JSON array.
    pub fn register_json(&mut self, json: &str) -> Result<usize, serde_json::Error> {
        let specs: Vec<BlockSpec> = serde_json::from_str(json)?;
        let count = specs.len();
        for spec in specs {
            self.register(spec);
        }
        Ok(count)
    }

    pub fn get(&self, id: &str) -> Option<Arc<BlockSpec>> {
        self.specs.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.specs.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BlockSpec>> {
        self.specs.values()
    }
}
