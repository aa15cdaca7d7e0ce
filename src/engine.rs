// src/engine.rs
//
// Control-rate logic engine.
//
// One tick walks every instance in execution order and, for each one:
// resolve inputs -> run logic -> commit outputs/state. Instances fail
// independently; nothing that happens inside one block's logic can abort
// the tick for the others.

use std::collections::HashMap;

use crate::backend::AudioBackend;
use crate::compile_cache::CompileCache;
use crate::config::EngineConfig;
use crate::execution_order::execution_order;
use crate::logic::{ExecutionContext, LogicCall, LogicHost};
use crate::state::{BlockInstance, BlockSpec, GraphStore, InstanceId, InstanceUpdate};
use crate::value::{Value, ValueMap, maps_shallow_eq};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Instances whose logic ran (successfully or not).
    pub executed: usize,

    /// Instances bypassed (the generative service block).
    pub skipped: usize,

    /// Instances that ended the tick with an error.
    pub failed: usize,

    /// Instances that appeared in the batched update.
    pub updated: usize,
}

/// Candidate values for one instance after it ran.
struct Candidate {
    outputs: ValueMap,
    state: ValueMap,
    error: Option<String>,
    logs: Vec<String>,
    sent: Vec<Value>,
}

/// Runs block logic once per tick.
///
/// The engine owns:
/// - the compiled-logic cache (keyed by instance id)
/// - the tick-scoped output cache that feeds downstream instances
///
/// The graph itself lives in the `GraphStore` passed to each tick.
pub struct LogicEngine {
    host: Box<dyn LogicHost>,
    cache: CompileCache,

    /// instance id -> output id -> value, as computed so far.
    outputs: HashMap<InstanceId, ValueMap>,

    generative_spec_id: String,
}

impl LogicEngine {
    pub fn new(host: Box<dyn LogicHost>, config: &EngineConfig) -> Self {
        Self {
            host,
            cache: CompileCache::new(),
            outputs: HashMap::new(),
            generative_spec_id: config.generative_spec_id.clone(),
        }
    }

    /// Reset the output cache from every instance's last known outputs.
    ///
    /// Called when the tick loop (re)starts so the first tick has a value
    /// for every port that already produced one.
    pub fn reset_outputs(&mut self, store: &dyn GraphStore) {
        self.outputs = store
            .instances()
            .iter()
            .map(|i| (i.id.clone(), i.last_outputs.clone()))
            .collect();
    }

    /// Drop compiled logic for one instance (its source changed).
    pub fn invalidate(&mut self, instance_id: &str) {
        if self.cache.evict(instance_id) {
            log::debug!("invalidated compiled logic for '{}'", instance_id);
        }
    }

    /// Drop all compiled logic.
    pub fn invalidate_all(&mut self) {
        log::debug!("invalidated {} compiled logic entries", self.cache.len());
        self.cache.clear();
    }

    /// Forget everything held for a removed instance.
    pub fn forget(&mut self, instance_id: &str) {
        self.cache.evict(instance_id);
        self.outputs.remove(instance_id);
    }

    /// Value of one output in the tick-scoped cache.
    pub fn output(&self, instance_id: &str, output_id: &str) -> Option<&Value> {
        self.outputs.get(instance_id)?.get(output_id)
    }

    pub fn compiled_count(&self) -> usize {
        self.cache.len()
    }

    /// Run one tick over every instance in the store.
    ///
    /// Updates are computed first and written back in a single
    /// `batch_update_instances` call; only instances whose outputs, state
    /// or error actually changed are included.
    pub fn tick(
        &mut self,
        store: &mut dyn GraphStore,
        context: ExecutionContext,
        mut backend: Option<&mut dyn AudioBackend>,
    ) -> TickReport {
        let mut report = TickReport::default();
        let mut updates: Vec<(InstanceId, InstanceUpdate)> = Vec::new();
        let mut log_lines: Vec<(InstanceId, String)> = Vec::new();

        {
            let view: &dyn GraphStore = &*store;
            let order = execution_order(view.instances(), view.connections());

            for id in &order {
                let Some(instance) = view.instance(id) else {
                    continue;
                };
                if instance.spec_id == self.generative_spec_id {
                    report.skipped += 1;
                    continue;
                }

                let candidate = match view.specification(instance) {
                    Some(spec) => {
                        report.executed += 1;
                        self.run_instance(view, instance, &spec, context)
                    }
                    None => Candidate {
                        outputs: ValueMap::new(),
                        state: instance.internal_state.clone(),
                        error: Some(format!(
                            "specification '{}' not found",
                            instance.spec_id
                        )),
                        logs: Vec::new(),
                        sent: Vec::new(),
                    },
                };

                if let Some(backend) = backend.as_deref_mut() {
                    for payload in candidate.sent {
                        backend.send_instance_message(&instance.id, payload);
                    }
                }

                self.outputs
                    .insert(instance.id.clone(), candidate.outputs.clone());

                for line in candidate.logs {
                    log_lines.push((instance.id.clone(), line));
                }

                if let Some(error) = &candidate.error {
                    report.failed += 1;
                    // Log transitions, not every failing tick
                    if instance.error.as_ref() != Some(error) {
                        log::warn!("instance '{}': {}", instance.id, error);
                        log_lines.push((instance.id.clone(), error.clone()));
                    }
                }

                let unchanged = candidate.error == instance.error
                    && maps_shallow_eq(&candidate.outputs, &instance.last_outputs)
                    && maps_shallow_eq(&candidate.state, &instance.internal_state);
                if !unchanged {
                    updates.push((
                        instance.id.clone(),
                        InstanceUpdate {
                            last_outputs: candidate.outputs,
                            internal_state: candidate.state,
                            error: candidate.error,
                        },
                    ));
                }
            }
        }

        for (id, line) in log_lines {
            store.append_instance_log(&id, line);
        }

        report.updated = updates.len();
        if !updates.is_empty() {
            store.batch_update_instances(updates);
        }

        report
    }

    /// Resolve inputs, run the logic and build the candidate update.
    fn run_instance(
        &mut self,
        store: &dyn GraphStore,
        instance: &BlockInstance,
        spec: &BlockSpec,
        context: ExecutionContext,
    ) -> Candidate {
        let inputs = self.resolve_inputs(store, instance, spec);
        let params = collect_params(instance, spec);

        let mut recorded = ValueMap::new();
        let mut logs = Vec::new();
        let mut sent = Vec::new();

        let result = self
            .cache
            .get_or_compile(&instance.id, &spec.logic, self.host.as_ref())
            .and_then(|logic| {
                let mut send = |payload: Value| sent.push(payload);
                logic.run(LogicCall {
                    inputs: &inputs,
                    params: &params,
                    state: instance.internal_state.clone(),
                    context,
                    outputs: &mut recorded,
                    logs: &mut logs,
                    send: &mut send,
                })
            });

        match result {
            Ok(update) => {
                // Shallow merge: keys are added or overwritten, never removed
                let mut state = instance.internal_state.clone();
                state.extend(update);

                // Every declared output gets a value
                let outputs = spec
                    .outputs
                    .iter()
                    .map(|port| {
                        let value = recorded
                            .remove(&port.id)
                            .unwrap_or_else(|| port.port_type.default_value());
                        (port.id.clone(), value)
                    })
                    .collect();

                Candidate {
                    outputs,
                    state,
                    error: None,
                    logs,
                    sent,
                }
            }
            Err(e) => {
                let name = if instance.name.is_empty() {
                    &instance.id
                } else {
                    &instance.name
                };
                Candidate {
                    outputs: ValueMap::new(),
                    state: instance.internal_state.clone(),
                    error: Some(format!("error in '{}': {}", name, e)),
                    logs,
                    sent,
                }
            }
        }
    }

    /// One value per declared input: the upstream output if connected and
    /// already produced, otherwise the port type's default.
    fn resolve_inputs(
        &self,
        store: &dyn GraphStore,
        instance: &BlockInstance,
        spec: &BlockSpec,
    ) -> ValueMap {
        spec.inputs
            .iter()
            .map(|port| {
                let value = store
                    .connections()
                    .iter()
                    .find(|c| c.targets(&instance.id, &port.id))
                    .and_then(|c| self.output(&c.from_instance_id, &c.from_output_id))
                    .cloned()
                    .unwrap_or_else(|| port.port_type.default_value());
                (port.id.clone(), value)
            })
            .collect()
    }
}

/// Spec defaults overlaid with the instance's current values.
fn collect_params(instance: &BlockInstance, spec: &BlockSpec) -> ValueMap {
    let mut params: ValueMap = spec
        .parameters
        .iter()
        .map(|p| (p.id.clone(), p.default.clone()))
        .collect();
    params.extend(
        instance
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::logic::ScriptHost;
    use crate::state::{Connection, Patch, PortSpec, PortType, SpecRegistry};

    fn engine() -> LogicEngine {
        LogicEngine::new(Box::new(ScriptHost::default()), &EngineConfig::default())
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(48_000.0, 120.0)
    }

    fn specs() -> SpecRegistry {
        let mut specs = SpecRegistry::new();
        specs.register(
            BlockSpec::new("source", "Source")
                .with_output(PortSpec::new("outA", PortType::Number))
                .with_logic(r#"output("outA", 10);"#),
        );
        specs.register(
            BlockSpec::new("doubler", "Doubler")
                .with_input(PortSpec::new("inB", PortType::Number))
                .with_output(PortSpec::new("outB", PortType::Number))
                .with_logic(r#"output("outB", inputs.inB * 2);"#),
        );
        specs.register(
            BlockSpec::new("bomb", "Bomb")
                .with_output(PortSpec::new("out", PortType::Number))
                .with_logic(r#"if (params.fail ?? true) { throw "fuse lit"; } output("out", 1);"#),
        );
        specs.register(
            BlockSpec::new("silent", "Silent")
                .with_input(PortSpec::new("n", PortType::Number))
                .with_input(PortSpec::new("g", PortType::Gate))
                .with_input(PortSpec::new("t", PortType::Trigger))
                .with_output(PortSpec::new("n", PortType::Number))
                .with_output(PortSpec::new("s", PortType::String))
                .with_output(PortSpec::new("b", PortType::Boolean))
                .with_output(PortSpec::new("t", PortType::Trigger))
                .with_logic("log(inputs.n, inputs.g, inputs.t);"),
        );
        specs.register(
            BlockSpec::new(crate::config::GENERATIVE_SERVICE_SPEC_ID, "Generative")
                .with_logic("throw \"never run\";"),
        );
        specs
    }

    fn scenario() -> Patch {
        let mut patch = Patch::new(specs());
        // Stored downstream-first so ordering matters
        patch.create_instance("B", "doubler").unwrap();
        patch.create_instance("A", "source").unwrap();
        patch.connect("A", "outA", "B", "inB").unwrap();
        patch
    }

    /// Graph store that counts batched updates.
    struct Recording {
        patch: Patch,
        batches: Vec<Vec<InstanceId>>,
    }

    impl GraphStore for Recording {
        fn instances(&self) -> &[BlockInstance] {
            self.patch.instances()
        }

        fn connections(&self) -> &[Connection] {
            self.patch.connections()
        }

        fn specification(&self, instance: &BlockInstance) -> Option<std::sync::Arc<BlockSpec>> {
            self.patch.specification(instance)
        }

        fn batch_update_instances(&mut self, updates: Vec<(InstanceId, InstanceUpdate)>) {
            self.batches
                .push(updates.iter().map(|(id, _)| id.clone()).collect());
            self.patch.batch_update_instances(updates);
        }

        fn append_instance_log(&mut self, instance_id: &str, message: String) {
            self.patch.append_instance_log(instance_id, message);
        }
    }

    #[test]
    fn test_upstream_output_feeds_downstream_same_tick() {
        let mut patch = scenario();
        let mut engine = engine();

        let report = engine.tick(&mut patch, ctx(), None);

        assert_eq!(report.executed, 2);
        assert_eq!(
            patch.instance("A").unwrap().last_outputs.get("outA"),
            Some(&Value::from(10))
        );
        assert_eq!(
            patch.instance("B").unwrap().last_outputs.get("outB"),
            Some(&Value::from(20))
        );
        assert_eq!(engine.output("B", "outB"), Some(&Value::from(20)));
    }

    #[test]
    fn test_throwing_block_is_isolated() {
        let mut patch = scenario();
        patch.create_instance("X", "bomb").unwrap();
        patch.instance_mut("X").unwrap().name = "Big Red Button".into();
        let mut engine = engine();

        let report = engine.tick(&mut patch, ctx(), None);

        assert_eq!(report.failed, 1);
        let x = patch.instance("X").unwrap();
        let error = x.error.as_deref().unwrap();
        assert!(error.contains("Big Red Button"));
        assert!(error.contains("fuse lit"));
        assert!(x.last_outputs.is_empty());
        assert_eq!(
            patch.instance("B").unwrap().last_outputs.get("outB"),
            Some(&Value::from(20))
        );
    }

    #[test]
    fn test_failed_upstream_feeds_port_default() {
        let mut specs = specs();
        specs.register(
            BlockSpec::new("echo", "Echo")
                .with_input(PortSpec::new("inB", PortType::Number))
                .with_output(PortSpec::new("outB", PortType::Number))
                .with_logic(r#"log(inputs.inB); output("outB", inputs.inB * 2);"#),
        );
        let mut patch = Patch::new(specs);
        patch.create_instance("X", "bomb").unwrap();
        patch.create_instance("B", "echo").unwrap();
        patch.connect("X", "out", "B", "inB").unwrap();
        let mut engine = engine();

        let report = engine.tick(&mut patch, ctx(), None);

        assert_eq!(report.failed, 1);
        assert!(patch.instance("X").unwrap().error.is_some());
        assert_eq!(engine.output("X", "out"), None);

        let b = patch.instance("B").unwrap();
        assert_eq!(b.error, None);
        assert_eq!(b.last_outputs.get("outB"), Some(&Value::from(0)));
        assert_eq!(b.logs, vec!["0"]);

        let spec = patch.specification(b).unwrap();
        let inputs = engine.resolve_inputs(&patch, b, &spec);
        assert_eq!(inputs.get("inB"), Some(&Value::Number(0.0)));
    }

    #[test]
    fn test_deeply_nested_logic_fails_without_crashing() {
        let mut specs = specs();
        let deep = format!("output(\"x\", {}1{});", "(".repeat(1000), ")".repeat(1000));
        specs.register(
            BlockSpec::new("deep", "Deep")
                .with_output(PortSpec::new("x", PortType::Number))
                .with_logic(deep),
        );
        let mut patch = Patch::new(specs);
        patch.create_instance("B", "doubler").unwrap();
        patch.create_instance("A", "source").unwrap();
        patch.create_instance("D", "deep").unwrap();
        patch.connect("A", "outA", "B", "inB").unwrap();
        let mut engine = engine();

        engine.tick(&mut patch, ctx(), None);

        let error = patch.instance("D").unwrap().error.clone().unwrap();
        assert!(error.contains("nesting too deep"));
        assert_eq!(
            patch.instance("B").unwrap().last_outputs.get("outB"),
            Some(&Value::from(20))
        );
    }

    #[test]
    fn test_error_clears_and_logs_once() {
        let mut patch = Patch::new(specs());
        patch.create_instance("X", "bomb").unwrap();
        let mut engine = engine();

        engine.tick(&mut patch, ctx(), None);
        engine.tick(&mut patch, ctx(), None);
        assert!(patch.instance("X").unwrap().error.is_some());
        assert_eq!(patch.instance("X").unwrap().logs.len(), 1);

        patch.set_param("X", "fail", false.into()).unwrap();
        engine.tick(&mut patch, ctx(), None);

        let x = patch.instance("X").unwrap();
        assert_eq!(x.error, None);
        assert_eq!(x.last_outputs.get("out"), Some(&Value::from(1)));
    }

    #[test]
    fn test_missing_specification_is_reported() {
        let mut patch = scenario();
        patch
            .add_instance(BlockInstance::new("ghost", "no-such-spec"))
            .unwrap();
        let mut engine = engine();

        engine.tick(&mut patch, ctx(), None);

        assert_eq!(
            patch.instance("ghost").unwrap().error.as_deref(),
            Some("specification 'no-such-spec' not found")
        );
        assert_eq!(
            patch.instance("B").unwrap().last_outputs.get("outB"),
            Some(&Value::from(20))
        );
    }

    #[test]
    fn test_quiescent_instances_are_not_updated() {
        let mut store = Recording {
            patch: scenario(),
            batches: Vec::new(),
        };
        let mut engine = engine();

        let first = engine.tick(&mut store, ctx(), None);
        let second = engine.tick(&mut store, ctx(), None);

        assert_eq!(first.updated, 2);
        assert_eq!(second.updated, 0);
        assert_eq!(store.batches.len(), 1);
    }

    #[test]
    fn test_outputs_and_inputs_fall_back_to_defaults() {
        let mut patch = Patch::new(specs());
        patch.create_instance("S", "silent").unwrap();
        let mut engine = engine();

        engine.tick(&mut patch, ctx(), None);

        let s = patch.instance("S").unwrap();
        assert_eq!(s.last_outputs.get("n"), Some(&Value::from(0)));
        assert_eq!(s.last_outputs.get("s"), Some(&Value::from("")));
        assert_eq!(s.last_outputs.get("b"), Some(&Value::from(false)));
        assert_eq!(s.last_outputs.get("t"), Some(&Value::Null));
        assert_eq!(s.logs, vec!["0 false null"]);
    }

    #[test]
    fn test_generative_block_is_skipped() {
        let mut patch = Patch::new(specs());
        patch
            .create_instance("G", crate::config::GENERATIVE_SERVICE_SPEC_ID)
            .unwrap();
        let mut engine = engine();

        let report = engine.tick(&mut patch, ctx(), None);

        assert_eq!(report.skipped, 1);
        assert_eq!(report.executed, 0);
        assert_eq!(patch.instance("G").unwrap().error, None);
        assert_eq!(engine.compiled_count(), 0);
    }

    #[test]
    fn test_state_merges_shallowly() {
        let mut specs = specs();
        specs.register(
            BlockSpec::new("counter", "Counter")
                .with_logic("return { b: (state.b ?? 0) + 1 };"),
        );
        let mut patch = Patch::new(specs);
        patch
            .add_instance(BlockInstance::new("c", "counter"))
            .unwrap();
        patch
            .instance_mut("c")
            .unwrap()
            .internal_state
            .insert("a".into(), 1.into());
        let mut engine = engine();

        engine.tick(&mut patch, ctx(), None);
        engine.tick(&mut patch, ctx(), None);

        let state = &patch.instance("c").unwrap().internal_state;
        assert_eq!(state.get("a"), Some(&Value::from(1)));
        assert_eq!(state.get("b"), Some(&Value::from(2)));
    }

    #[test]
    fn test_send_reaches_backend() {
        let mut specs = specs();
        specs.register(
            BlockSpec::new("filter", "Filter")
                .with_logic(r#"send({ type: "sweep", rate: context.sampleRate });"#),
        );
        let mut patch = Patch::new(specs);
        patch.create_instance("f", "filter").unwrap();
        let mut backend = MemoryBackend::new(44_100.0);
        let mut engine = engine();

        engine.tick(
            &mut patch,
            ExecutionContext::new(44_100.0, 90.0),
            Some(&mut backend),
        );

        let messages = backend.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "f");
        match &messages[0].1 {
            Value::Map(m) => assert_eq!(m.get("rate"), Some(&Value::from(44_100.0))),
            other => panic!("expected map payload, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_reads_seeded_outputs() {
        let mut specs = specs();
        specs.register(
            BlockSpec::new("relay", "Relay")
                .with_input(PortSpec::new("in", PortType::Number))
                .with_output(PortSpec::new("out", PortType::Number))
                .with_logic(r#"output("out", inputs.in + 1);"#),
        );
        let mut patch = Patch::new(specs);
        patch.create_instance("a", "relay").unwrap();
        patch.create_instance("b", "relay").unwrap();
        patch.connect("a", "out", "b", "in").unwrap();
        patch.connect("b", "out", "a", "in").unwrap();
        patch
            .instance_mut("b")
            .unwrap()
            .last_outputs
            .insert("out".into(), 5.into());

        let mut engine = engine();
        engine.reset_outputs(&patch);
        engine.tick(&mut patch, ctx(), None);

        // `a` runs first (storage order) and sees b's previous output
        assert_eq!(
            patch.instance("a").unwrap().last_outputs.get("out"),
            Some(&Value::from(6))
        );
        assert_eq!(
            patch.instance("b").unwrap().last_outputs.get("out"),
            Some(&Value::from(7))
        );
    }

    #[test]
    fn test_runaway_logic_is_an_instance_error() {
        let mut specs = specs();
        specs.register(BlockSpec::new("spin", "Spin").with_logic("while (true) { }"));
        let mut patch = Patch::new(specs);
        patch.create_instance("s", "spin").unwrap();
        let mut engine = LogicEngine::new(Box::new(ScriptHost::new(500)), &EngineConfig::default());

        engine.tick(&mut patch, ctx(), None);

        let error = patch.instance("s").unwrap().error.clone().unwrap();
        assert!(error.contains("step budget of 500 exceeded"));
    }

    #[test]
    fn test_forget_drops_cached_state() {
        let mut patch = scenario();
        let mut engine = engine();
        engine.tick(&mut patch, ctx(), None);
        assert_eq!(engine.compiled_count(), 2);

        engine.forget("A");
        assert_eq!(engine.compiled_count(), 1);
        assert_eq!(engine.output("A", "outA"), None);

        engine.invalidate_all();
        assert_eq!(engine.compiled_count(), 0);
    }
}
