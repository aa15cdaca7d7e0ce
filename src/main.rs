// src/main.rs
//
// Sanity run: a two-block control chain plus one audio edge, driven by a
// handful of manual ticks against the in-memory backend.

use blockgraph::{
    AudioBackend, BlockInstance, BlockSpec, Command, CommandResult, EngineConfig, GraphStore,
    MemoryBackend, ParamSpec, Patch, PortSpec, PortType, Runtime, SpecRegistry,
};

/// ===============================
/// Block Specifications
/// ===============================

fn specs() -> SpecRegistry {
    let mut specs = SpecRegistry::new();

    specs.register(
        BlockSpec::new("counter", "Counter")
            .category("control")
            .with_output(PortSpec::new("count", PortType::Number))
            .with_logic(
                r#"
                let next = (state.count ?? 0) + 1;
                output("count", next);
                return { count: next };
                "#,
            ),
    );

    specs.register(
        BlockSpec::new("scale", "Scale")
            .category("control")
            .with_input(PortSpec::new("in", PortType::Number))
            .with_param(ParamSpec::number("factor", 2.0))
            .with_output(PortSpec::new("out", PortType::Number))
            .with_logic(
                r#"
                let value = inputs.in * params.factor;
                if (value > 4) {
                    log("over four:", value);
                }
                output("out", value);
                "#,
            ),
    );

    specs.register(
        BlockSpec::new("osc", "Oscillator")
            .category("audio")
            .with_output(PortSpec::audio("out")),
    );

    specs.register(
        BlockSpec::new("speaker", "Speaker")
            .category("audio")
            .with_input(PortSpec::audio("in")),
    );

    specs
}

fn connect(runtime: &mut Runtime<MemoryBackend>, from: (&str, &str), to: (&str, &str)) {
    let result = runtime.apply(Command::Connect {
        from_instance: from.0.into(),
        from_output: from.1.into(),
        to_instance: to.0.into(),
        to_input: to.1.into(),
    });
    match result {
        CommandResult::Connected { connection_id } => {
            println!("{}.{} -> {}.{} ({})", from.0, from.1, to.0, to.1, connection_id)
        }
        other => println!("connect failed: {:?}", other),
    }
}

/// ===============================
/// Main
/// ===============================

fn main() {
    println!("=== Block Graph Engine ===\n");

    let specs = specs();
    let mut patch = Patch::new(specs.clone());
    for (id, spec_id) in [
        ("scale1", "scale"),
        ("counter1", "counter"),
        ("osc1", "osc"),
        ("out1", "speaker"),
    ] {
        let Some(spec) = specs.get(spec_id) else {
            continue;
        };
        if let Err(e) = patch.add_instance(BlockInstance::from_spec(id, &spec)) {
            println!("add failed: {}", e);
        }
    }

    let mut backend = MemoryBackend::default();
    backend.add_native_node("osc1");
    backend.add_native_node("out1");

    let mut runtime = Runtime::new(EngineConfig::default(), patch);
    connect(&mut runtime, ("counter1", "count"), ("scale1", "in"));
    connect(&mut runtime, ("osc1", "out"), ("out1", "in"));

    runtime.attach_backend(backend);
    runtime.apply(Command::SetAudioEnabled { enabled: true });
    println!(
        "\naudio routes: {} (backend running: {})\n",
        runtime.connector().route_count(),
        runtime.backend().is_some_and(|b| b.is_running())
    );

    for tick in 1..=4 {
        if let Some(report) = runtime.tick() {
            let out = runtime
                .patch()
                .instance("scale1")
                .and_then(|i| i.last_outputs.get("out").cloned());
            println!(
                "tick {}: executed={} updated={} scale1.out={:?}",
                tick, report.executed, report.updated, out
            );
        }
    }

    if let Some(scale) = runtime.patch().instance("scale1") {
        println!("\nscale1 log:");
        for line in &scale.logs {
            println!("  {}", line);
        }
    }

    runtime.apply(Command::Shutdown);
    println!(
        "\nafter shutdown: {} live routes",
        runtime.backend().map_or(0, |b| b.live_route_count())
    );
}
