use std::collections::BTreeMap;
use std::sync::Arc;

use patchbay_engine::{Connection, Engine, EngineConfig, FeedbackPolicy, ModuleFactory, ModuleId};
use proptest::prelude::*;

const KINDS: [&str; 4] = ["sine", "gain", "unit-delay", "outlet"];

fn build(kinds: &[usize], edges: &[(usize, usize)], policy: FeedbackPolicy) -> Engine {
    let config = EngineConfig::default().with_feedback(policy);
    let engine = Engine::new(Arc::new(ModuleFactory::with_builtins(config)));
    let ids: Vec<ModuleId> = kinds
        .iter()
        .map(|kind| engine.add_module(KINDS[*kind]).unwrap())
        .collect();
    for (src, dst) in edges {
        let (src, dst) = (ids[src % ids.len()], ids[dst % ids.len()]);
        engine.connect(Connection::new(src, 0, dst, 0));
    }
    engine.prepare(48_000.0, 32).unwrap();
    engine
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn committed_graphs_always_sort(
        kinds in prop::collection::vec(0usize..4, 1..10),
        edges in prop::collection::vec((0usize..16, 0usize..16), 0..24),
        delayed in any::<bool>(),
    ) {
        let policy = if delayed { FeedbackPolicy::ThroughDelay } else { FeedbackPolicy::Reject };
        let engine = build(&kinds, &edges, policy);
        let plan = engine.plan();
        prop_assert!(plan.check_consistency().is_ok());
        prop_assert_eq!(plan.len(), kinds.len());

        let position: BTreeMap<ModuleId, usize> =
            plan.order().enumerate().map(|(index, id)| (id, index)).collect();
        let delays: Vec<ModuleId> = engine
            .modules()
            .into_iter()
            .filter(|info| info.type_name == "unit-delay")
            .map(|info| info.id)
            .collect();
        for connection in engine.connections() {
            let breaks = delayed && delays.contains(&connection.dst);
            if !breaks {
                prop_assert!(position[&connection.src] < position[&connection.dst]);
            }
        }
    }

    #[test]
    fn same_topology_same_order(
        kinds in prop::collection::vec(0usize..4, 1..8),
        edges in prop::collection::vec((0usize..16, 0usize..16), 0..16),
    ) {
        let first = build(&kinds, &edges, FeedbackPolicy::ThroughDelay);
        let second = build(&kinds, &edges, FeedbackPolicy::ThroughDelay);
        let a: Vec<_> = first.plan().order().collect();
        let b: Vec<_> = second.plan().order().collect();
        prop_assert_eq!(a, b);
    }
}
