/// Stage order for processing one incoming user message: perception through
/// dialog realization, execution planning, and memory commit. The sequence
/// encodes the causal dependencies between stages; reordering it is a
/// behavior change.
pub const TURN_ORDER: &[&str] = &[
    // Perception
    "perception.collect",
    "perception.normalize",
    "perception.split_sentences",
    "perception.tokenize",
    "perception.script_tag",
    "perception.addressing",
    "perception.speech_act",
    "perception.confidence",
    "perception.novelty",
    "perception.packz",
    // World model
    "world_model.context",
    "world_model.predict",
    "world_model.error",
    "world_model.uncertainty",
    // Memory
    "memory.wal_write",
    "memory.index_ops",
    "memory.retrieve",
    "memory.context_cache",
    // Concept graph
    "concept.mine_patterns",
    "concept.manage_nodes",
    "concept.score_edges",
    "concept.extract_rules",
    // Planning
    "planner.route_intent",
    "planner.collect_slots",
    "planner.build_plan",
    // Dialog
    "dialog.realize_turn",
    "dialog.surface",
    "dialog.safety_filter",
    // Execution
    "executor.dispatch",
    "executor.normalize_results",
    "executor.present_results",
    // Commit
    "memory.commit",
];

/// Default order of the I/O tick's first composer pass: persistence planning,
/// observability, adaptation, runtime decisions, orchestration, and the
/// driver protocol builder.
pub const TICK_ORDER: &[&str] = &[
    // Persistence
    "persist.plan_apply",
    "persist.optimize_apply",
    // Observability
    "observe.telemetry",
    "observe.trace",
    "observe.slo",
    // Adaptation
    "policy.plan_delta",
    "policy.plan_apply",
    "policy.stage_apply",
    // Runtime
    "runtime.activate_config",
    "runtime.gatekeeper",
    "runtime.schedule",
    "runtime.initiative",
    // Orchestration
    "orchestrate.actions",
    "orchestrate.envelope",
    "orchestrate.build_jobs",
    // Driver protocol
    "protocol.build_frames",
];

/// Second composer pass after driver dispatch: normalize replies, refresh
/// telemetry and the SLO score, plan retries.
pub const REPLY_ORDER: &[&str] = &[
    "protocol.normalize_replies",
    "observe.telemetry",
    "observe.slo",
    "protocol.plan_retry",
];
