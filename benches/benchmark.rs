use std::sync::Arc;

use agentbridge::{
    adapter::RegistryAdapter,
    context::{ContextBuilder, RawContext},
    event_bus::EventBus,
    pipeline::{InvocationPipeline, Target},
    registry::{fn_handler, CapabilityRegistry, FunctionDefinition, RegisterOptions},
    schema::Schema,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};

fn setup() -> InvocationPipeline {
    let registry = Arc::new(CapabilityRegistry::new(Arc::new(EventBus::new(64))));
    for i in 0..100 {
        registry
            .register_function(
                FunctionDefinition::new(&format!("fn_{}", i), "").with_schema(
                    Schema::object()
                        .property("a", Schema::number(), true)
                        .property("b", Schema::number(), true),
                ),
                fn_handler(|params: Value, _| async move {
                    Ok(json!(params["a"].as_i64().unwrap_or_default()
                        + params["b"].as_i64().unwrap_or_default()))
                }),
                RegisterOptions::default(),
            )
            .unwrap();
    }
    let adapter = Arc::new(RegistryAdapter::new(registry.clone()));
    InvocationPipeline::new(registry, adapter, ContextBuilder::default())
}

fn bench_registry_lookup(c: &mut Criterion) {
    let pipeline = setup();
    c.bench_function("registry lookup", |b| {
        b.iter(|| pipeline.registry().get_function(black_box("fn_42")))
    });
}

fn bench_invoke(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let pipeline = setup();
    let target = Target::function("fn_42");
    c.bench_function("invoke with validation", |b| {
        b.to_async(&runtime).iter(|| {
            pipeline.invoke(&target, json!({"a": 2, "b": 3}), RawContext::default())
        })
    });
}

// Lookup and invoke benchmarks
criterion_group!(benches, bench_registry_lookup, bench_invoke);
criterion_main!(benches);
