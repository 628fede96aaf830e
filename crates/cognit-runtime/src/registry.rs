use cognit_kernel::Registry;
use cognit_stages::{
    adaptation, concept, dialog, execution, memory, observability, orchestration, perception,
    persistence, planning, protocol, runtime, world_model,
};
use cognit_types::StageFn;

/// Bind every stage to its registry name. Orders reference these names;
/// a name absent from the registry is skipped by the composer, which is the
/// partial-deployment seam.
pub fn build_registry() -> Registry {
    let mut reg = Registry::new();
    let mut add = |name: &'static str, stage: StageFn| {
        reg.insert(name, stage);
    };

    // Perception
    add("perception.collect", perception::collect);
    add("perception.normalize", perception::normalize);
    add("perception.split_sentences", perception::split_sentences);
    add("perception.tokenize", perception::tokenize);
    add("perception.script_tag", perception::script_tag);
    add("perception.addressing", perception::addressing);
    add("perception.speech_act", perception::speech_act);
    add("perception.confidence", perception::confidence);
    add("perception.novelty", perception::novelty);
    add("perception.packz", perception::packz);

    // World model
    add("world_model.context", world_model::build_context);
    add("world_model.predict", world_model::predict);
    add("world_model.error", world_model::compute_error);
    add("world_model.uncertainty", world_model::uncertainty);

    // Memory
    add("memory.wal_write", memory::wal_write);
    add("memory.index_ops", memory::build_index_ops);
    add("memory.retrieve", memory::retrieve);
    add("memory.context_cache", memory::context_cache);
    add("memory.commit", persistence::memory_commit);

    // Concept graph
    add("concept.mine_patterns", concept::mine_patterns);
    add("concept.manage_nodes", concept::manage_nodes);
    add("concept.score_edges", concept::score_edges);
    add("concept.extract_rules", concept::extract_rules);

    // Planning
    add("planner.route_intent", planning::route_intent);
    add("planner.collect_slots", planning::collect_slots);
    add("planner.build_plan", planning::build_plan);

    // Dialog
    add("dialog.realize_turn", dialog::realize_turn);
    add("dialog.surface", dialog::surface);
    add("dialog.safety_filter", dialog::safety_filter);

    // Execution
    add("executor.dispatch", execution::dispatch);
    add("executor.normalize_results", execution::normalize_results);
    add("executor.present_results", execution::present_results);

    // Persistence
    add("persist.plan_apply", persistence::plan_apply);
    add("persist.optimize_apply", persistence::optimize_apply);

    // Observability
    add("observe.telemetry", observability::aggregate_telemetry);
    add("observe.trace", observability::build_trace);
    add("observe.slo", observability::evaluate_slo);

    // Adaptation
    add("policy.plan_delta", adaptation::plan_delta);
    add("policy.plan_apply", adaptation::plan_apply);
    add("policy.stage_apply", adaptation::stage_apply);

    // Runtime decisions
    add("runtime.activate_config", runtime::activate_config);
    add("runtime.gatekeeper", runtime::gatekeeper);
    add("runtime.schedule", runtime::schedule);
    add("runtime.initiative", runtime::initiative);

    // Orchestration
    add("orchestrate.actions", orchestration::orchestrate);
    add("orchestrate.envelope", orchestration::envelope_actions);
    add("orchestrate.build_jobs", orchestration::build_jobs);

    // Driver protocol
    add("protocol.build_frames", protocol::build_frames);
    add("protocol.normalize_replies", protocol::normalize_replies);
    add("protocol.plan_retry", protocol::plan_retry);

    reg
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognit_kernel::{REPLY_ORDER, TICK_ORDER, TURN_ORDER};

    #[test]
    fn every_ordered_stage_is_registered() {
        let reg = build_registry();
        for name in TURN_ORDER.iter().chain(TICK_ORDER).chain(REPLY_ORDER) {
            assert!(reg.contains_key(name), "order references unknown stage {name}");
        }
    }

    #[test]
    fn registry_is_complete() {
        assert_eq!(build_registry().len(), 50);
    }
}
