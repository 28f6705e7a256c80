//! Flow-control handlers shipped with the engine.

pub mod branch;
pub mod iterate;
pub mod transform;

use serde_json::Value;

use flowgate_core::traits::Handler;
use flowgate_core::types::HandlerMetadata;

use crate::registry::{HandlerBinding, NodeRegistry};

/// Register every built-in handler.
pub fn register_builtins(registry: &mut NodeRegistry) {
    registry.bulk_register(
        &["conditional_branch", "if"],
        HandlerBinding::new(|config| {
            Ok(Box::new(branch::ConditionalBranch::from_config(config)?) as Box<dyn Handler>)
        })
        .with_metadata(HandlerMetadata {
            description: "Route the input to true_result or false_result".into(),
            output_handles: vec!["true_result".into(), "false_result".into()],
            ..Default::default()
        }),
    );

    registry.bulk_register(
        &["loop_items", "loop_over_items"],
        HandlerBinding::new(|config| {
            Ok(Box::new(iterate::LoopItems::from_config(config)) as Box<dyn Handler>)
        })
        .with_metadata(HandlerMetadata {
            description: "Run the downstream nodes once per item".into(),
            opens_iterations: true,
            ..Default::default()
        }),
    );

    registry.register(
        "split_in_batches",
        HandlerBinding::new(|config| {
            Ok(Box::new(iterate::SplitInBatches::from_config(config)) as Box<dyn Handler>)
        })
        .with_metadata(HandlerMetadata {
            description: "Run the downstream nodes once per batch of items".into(),
            opens_iterations: true,
            ..Default::default()
        }),
    );

    registry.bulk_register(
        &["collect_items", "loop_end"],
        HandlerBinding::new(|config| {
            Ok(Box::new(iterate::CollectItems::from_config(config)) as Box<dyn Handler>)
        })
        .with_metadata(HandlerMetadata {
            description: "Close a loop and receive every iteration's value".into(),
            joins_iterations: true,
            ..Default::default()
        }),
    );

    registry.register(
        "merge",
        HandlerBinding::new(|config| {
            Ok(Box::new(transform::Merge::from_config(config)?) as Box<dyn Handler>)
        })
        .with_metadata(HandlerMetadata::described("Combine the inputs of several branches")),
    );

    registry.register(
        "set",
        HandlerBinding::new(|config| {
            Ok(Box::new(transform::SetFields::from_config(config)) as Box<dyn Handler>)
        })
        .with_metadata(HandlerMetadata::described("Write fixed fields into the input object")),
    );

    registry.register(
        "wait",
        HandlerBinding::new(|config| {
            Ok(Box::new(transform::Wait::from_config(config)) as Box<dyn Handler>)
        })
        .with_metadata(HandlerMetadata::described("Pause, then pass the input through")),
    );

    registry.bulk_register(
        &["passthrough", "noop", "manual_trigger", "chatInput", "task_sequencer"],
        HandlerBinding::new(|_| Ok(Box::new(transform::Passthrough) as Box<dyn Handler>))
            .with_metadata(HandlerMetadata::described("Pass the input through unchanged")),
    );
}

// ── Config helpers ──────────────────────────────────────────────

pub(crate) fn config_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

pub(crate) fn config_f64(config: &Value, key: &str) -> Option<f64> {
    match config.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Resolve a dotted path such as `user.address.city` inside a JSON value.
/// Numeric segments index into arrays.
pub(crate) fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(value, |current, seg| match current {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}
