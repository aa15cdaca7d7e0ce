//! WebAssembly bindings via wasm-bindgen for browser integration.
//!
//! This module is only compiled when the `web` feature is enabled.
//!
//! # Usage
//!
//! Build with wasm-pack:
//! ```bash
//! wasm-pack build --target web --features web
//! ```
//!
//! # JavaScript Example
//!
//! ```javascript
//! import init, { blockgraph_init, BlockgraphRuntime } from './blockgraph.js';
//!
//! await init();
//! blockgraph_init();
//!
//! const runtime = new BlockgraphRuntime(null);
//! runtime.register_specs(JSON.stringify(specs));
//! runtime.command(JSON.stringify({ type: "addInstance", instance }));
//! runtime.attach_backend(audioHost);
//! runtime.command(JSON.stringify({ type: "setAudioEnabled", enabled: true }));
//!
//! setInterval(() => runtime.tick(), runtime.tick_period_ms());
//! ```
//!
//! `audioHost` is a plain JS object wrapping the Web Audio graph. Node
//! handles are numbers chosen by the host.

use wasm_bindgen::prelude::*;

use crate::backend::{
    ALL_PASS_DELAY_PARAM, ALL_PASS_FEEDBACK_PARAM, AllPassNodes, AudioBackend, ContextState,
    NodeHandle, NodeRegistry, ParamHandle, RegistryKind, RouteTarget,
};
use crate::config::EngineConfig;
use crate::error::RoutingError;
use crate::runtime::Runtime;
use crate::state::{BlockSpec, Command, CommandResult, Patch, SpecRegistry};
use crate::value::Value;

// ═══════════════════════════════════════════════════════════════════════════
// Initialization
// ═══════════════════════════════════════════════════════════════════════════

/// Initialize the wasm module. Call this once before using any other functions.
/// Sets up panic hooks and console logging.
#[wasm_bindgen]
pub fn blockgraph_init() {
    console_error_panic_hook::set_once();
    console_log::init_with_level(log::Level::Debug).ok();
}

// ═══════════════════════════════════════════════════════════════════════════
// JS audio host
// ═══════════════════════════════════════════════════════════════════════════

#[wasm_bindgen]
extern "C" {
    /// The page's wrapper around its Web Audio graph.
    pub type JsAudioHost;

    /// "running", "suspended", "closed", or undefined without a context.
    #[wasm_bindgen(method, js_name = contextState)]
    fn context_state(this: &JsAudioHost) -> Option<String>;

    #[wasm_bindgen(method, js_name = sampleRate)]
    fn sample_rate(this: &JsAudioHost) -> f64;

    #[wasm_bindgen(method, js_name = resolveOutput)]
    fn resolve_output(this: &JsAudioHost, kind: &str, instance_id: &str) -> Option<f64>;

    #[wasm_bindgen(method, js_name = resolveInput)]
    fn resolve_input(this: &JsAudioHost, kind: &str, instance_id: &str) -> Option<f64>;

    /// Node handle owning the named audio-rate parameter.
    #[wasm_bindgen(method, js_name = resolveParam)]
    fn resolve_param(this: &JsAudioHost, kind: &str, instance_id: &str, name: &str)
    -> Option<f64>;

    #[wasm_bindgen(method, js_name = allPassDelay)]
    fn all_pass_delay(this: &JsAudioHost, instance_id: &str) -> Option<f64>;

    #[wasm_bindgen(method, js_name = allPassFeedback)]
    fn all_pass_feedback(this: &JsAudioHost, instance_id: &str) -> Option<f64>;

    #[wasm_bindgen(method, catch)]
    fn connect(
        this: &JsAudioHost,
        source: f64,
        target: f64,
        param: Option<String>,
    ) -> Result<(), JsValue>;

    #[wasm_bindgen(method, catch)]
    fn disconnect(
        this: &JsAudioHost,
        source: f64,
        target: f64,
        param: Option<String>,
    ) -> Result<(), JsValue>;

    #[wasm_bindgen(method, js_name = sendMessage)]
    fn send_message(this: &JsAudioHost, instance_id: &str, payload_json: &str);
}

fn handle(raw: f64) -> NodeHandle {
    NodeHandle(raw as u64)
}

fn kind_name(kind: RegistryKind) -> &'static str {
    match kind {
        RegistryKind::CustomUnit => "customUnit",
        RegistryKind::Native => "native",
        RegistryKind::Generative => "generative",
    }
}

/// One managed-node registry on the JS side.
struct JsRegistry {
    host: JsAudioHost,
    kind: RegistryKind,
}

impl NodeRegistry for JsRegistry {
    fn output(&self, instance_id: &str) -> Option<NodeHandle> {
        self.host
            .resolve_output(kind_name(self.kind), instance_id)
            .map(handle)
    }

    fn input(&self, instance_id: &str) -> Option<NodeHandle> {
        self.host
            .resolve_input(kind_name(self.kind), instance_id)
            .map(handle)
    }

    fn param(&self, instance_id: &str, name: &str) -> Option<ParamHandle> {
        self.host
            .resolve_param(kind_name(self.kind), instance_id, name)
            .map(|node| ParamHandle::new(handle(node), name))
    }

    fn all_pass(&self, instance_id: &str) -> Option<AllPassNodes> {
        if self.kind != RegistryKind::Native {
            return None;
        }
        let delay = handle(self.host.all_pass_delay(instance_id)?);
        let feedback = handle(self.host.all_pass_feedback(instance_id)?);
        Some(AllPassNodes {
            delay,
            feedback,
            delay_time: ParamHandle::new(delay, ALL_PASS_DELAY_PARAM),
            feedback_gain: ParamHandle::new(feedback, ALL_PASS_FEEDBACK_PARAM),
        })
    }
}

/// `AudioBackend` over a JS audio host.
pub struct JsBackend {
    host: JsAudioHost,
    registries: Vec<JsRegistry>,
}

impl JsBackend {
    pub fn new(host: JsAudioHost) -> Self {
        let registries = RegistryKind::ALL
            .iter()
            .map(|&kind| JsRegistry {
                host: host.clone(),
                kind,
            })
            .collect();
        Self { host, registries }
    }

    fn split(target: &RouteTarget) -> (f64, Option<String>) {
        match target {
            RouteTarget::Node(node) => (node.0 as f64, None),
            RouteTarget::Param(param) => (param.node.0 as f64, Some(param.name.clone())),
        }
    }
}

fn js_error(e: JsValue) -> RoutingError {
    RoutingError::Backend(e.as_string().unwrap_or_else(|| format!("{:?}", e)))
}

impl AudioBackend for JsBackend {
    fn context_state(&self) -> Option<ContextState> {
        match self.host.context_state()?.as_str() {
            "running" => Some(ContextState::Running),
            "suspended" => Some(ContextState::Suspended),
            "closed" => Some(ContextState::Closed),
            other => {
                log::warn!("unknown audio context state '{}'", other);
                None
            }
        }
    }

    fn sample_rate(&self) -> f64 {
        self.host.sample_rate()
    }

    fn registry(&self, kind: RegistryKind) -> Option<&dyn NodeRegistry> {
        self.registries
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| r as &dyn NodeRegistry)
    }

    fn connect(&mut self, source: NodeHandle, target: &RouteTarget) -> Result<(), RoutingError> {
        let (node, param) = Self::split(target);
        self.host
            .connect(source.0 as f64, node, param)
            .map_err(js_error)
    }

    fn disconnect(
        &mut self,
        source: NodeHandle,
        target: &RouteTarget,
    ) -> Result<(), RoutingError> {
        let (node, param) = Self::split(target);
        self.host
            .disconnect(source.0 as f64, node, param)
            .map_err(js_error)
    }

    fn send_instance_message(&mut self, instance_id: &str, payload: Value) {
        match serde_json::to_string(&payload) {
            Ok(json) => self.host.send_message(instance_id, &json),
            Err(e) => log::warn!("dropping message for '{}': {}", instance_id, e),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Runtime
// ═══════════════════════════════════════════════════════════════════════════

/// Browser-side runtime. The page drives `tick` from its own timer.
#[wasm_bindgen]
pub struct BlockgraphRuntime {
    inner: Runtime<JsBackend>,
}

#[wasm_bindgen]
impl BlockgraphRuntime {
    /// Create a runtime. `config_json` may be null for defaults.
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: Option<String>) -> Result<BlockgraphRuntime, JsError> {
        let config = match config_json {
            Some(json) => EngineConfig::from_json(&json)?,
            None => EngineConfig::default(),
        };
        Ok(Self {
            inner: Runtime::new(config, Patch::new(SpecRegistry::new())),
        })
    }

    /// Register a JSON array of block specifications. Returns the count.
    pub fn register_specs(&mut self, json: &str) -> Result<u32, JsError> {
        let specs: Vec<BlockSpec> = serde_json::from_str(json)?;
        let count = specs.len() as u32;
        for spec in specs {
            self.inner.apply(Command::RegisterSpec { spec });
        }
        Ok(count)
    }

    /// Apply one JSON command and return its JSON result.
    pub fn command(&mut self, json: &str) -> Result<String, JsError> {
        let command: Command = serde_json::from_str(json)?;
        let result: CommandResult = self.inner.apply(command);
        Ok(serde_json::to_string(&result)?)
    }

    pub fn attach_backend(&mut self, host: JsAudioHost) {
        self.inner.attach_backend(JsBackend::new(host));
    }

    pub fn detach_backend(&mut self) {
        self.inner.detach_backend();
    }

    /// Run one tick if the loop is active. Returns whether it ran.
    pub fn tick(&mut self) -> bool {
        self.inner.tick().is_some()
    }

    /// Re-sync routing, e.g. after the host created or destroyed nodes.
    pub fn reconcile(&mut self) {
        self.inner.reconcile();
    }

    pub fn tick_period_ms(&self) -> f64 {
        self.inner.tick_period().as_secs_f64() * 1000.0
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }
}
