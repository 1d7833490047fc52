use std::sync::Arc;

use patchbay_engine::state::{load_patch, save_patch, validate_patch};
use patchbay_engine::{
    Connection, Engine, EngineConfig, GraphError, ModuleFactory, ModuleId, PatchState, Renderer,
    StateValue, SubPatch,
};

const BLOCK: usize = 64;

fn factory() -> Arc<ModuleFactory> {
    Arc::new(ModuleFactory::with_builtins(EngineConfig::default()))
}

/// sine -> sub-patch(inlet -> outlet) -> outlet, plus a loose gain.
fn build_patch(factory: &Arc<ModuleFactory>) -> Engine {
    let engine = Engine::new(Arc::clone(factory));

    let sub = SubPatch::new(Arc::clone(factory));
    let inner = sub.engine().clone();
    let inlet = inner.add_module("inlet").unwrap();
    let outlet = inner.add_module("outlet").unwrap();
    inner.connect(Connection::new(inlet, 0, outlet, 0));
    inner.commit().unwrap();

    let sine = engine.add_module("sine").unwrap();
    let nested = engine.add_module_instance(Box::new(sub)).unwrap();
    let out = engine.add_module("outlet").unwrap();
    engine.add_module("gain").unwrap();
    engine.connect(Connection::new(sine, 0, nested, 0));
    engine.connect(Connection::new(nested, 0, out, 0));
    let report = engine.commit().unwrap();
    assert!(report.issues.is_empty(), "{:?}", report.issues);

    engine.set_parameter(sine, "freq", 440.0).unwrap();
    engine
}

fn render(renderer: &mut Renderer) -> Vec<f32> {
    let mut outputs = vec![vec![0.0f32; BLOCK]];
    renderer.process(&[], &mut outputs, BLOCK);
    outputs.remove(0)
}

#[test]
fn patch_round_trips_through_a_file() {
    let factory = factory();
    let original = build_patch(&factory);
    let saved = original.save_state();

    assert_eq!(saved.modules.len(), 4);
    assert_eq!(saved.connections.len(), 2);
    let nested = saved
        .modules
        .iter()
        .find(|module| module.type_name == "sub-patch")
        .and_then(|module| module.state.get_patch("patch"))
        .expect("nested patch");
    assert_eq!(nested.modules.len(), 2);
    assert_eq!(nested.connections.len(), 1);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("patches").join("demo.json");
    save_patch(&path, &saved).unwrap();
    let loaded = load_patch(&path).unwrap();
    assert_eq!(loaded, saved);
    assert!(validate_patch(&loaded, &factory).is_empty());

    let restored = Engine::new(Arc::clone(&factory));
    let report = restored.load_state(&loaded).unwrap();
    assert!(!report.has_errors(), "{:?}", report.issues);
    assert_eq!(restored.save_state(), saved);
    assert_eq!(
        restored.parameters(ModuleId(1)).unwrap()[0],
        ("freq".to_string(), 440.0)
    );

    // New modules never reuse a loaded id.
    let fresh = restored.add_module("gain").unwrap();
    assert!(saved.modules.iter().all(|module| module.id < fresh));
}

#[test]
fn restored_patch_renders_like_the_original() {
    let factory = factory();
    let original = build_patch(&factory);
    let mut first = original.renderer().unwrap();
    original.prepare(48_000.0, BLOCK).unwrap();

    let restored = Engine::new(Arc::clone(&factory));
    let mut second = restored.renderer().unwrap();
    restored.load_state(&original.save_state()).unwrap();
    restored.prepare(48_000.0, BLOCK).unwrap();

    for _ in 0..4 {
        let a = render(&mut first);
        let b = render(&mut second);
        assert!(a.iter().any(|sample| *sample != 0.0));
        assert_eq!(a, b);
    }
}

#[test]
fn bad_entries_are_reported_and_skipped() {
    let factory = factory();
    let mut patch = build_patch(&factory).save_state();
    patch.modules[3].type_name = "theremin".into();
    patch.connections.push(Connection::new(ModuleId(1), 5, ModuleId(3), 0));
    let duplicate = patch.modules[0].clone();
    patch.modules.push(duplicate);

    let issues = validate_patch(&patch, &factory);
    assert_eq!(issues.iter().filter(|issue| issue.is_error()).count(), 3);

    let engine = Engine::new(Arc::clone(&factory));
    let report = engine.load_state(&patch).unwrap();
    assert!(report.has_errors());
    assert_eq!(engine.modules().len(), 3);
    assert_eq!(engine.connections().len(), 2);
}

#[test]
fn nested_patch_problems_reach_the_enclosing_report() {
    let factory = factory();
    let mut patch = build_patch(&factory).save_state();
    let nested_id = patch
        .modules
        .iter()
        .find(|module| module.type_name == "sub-patch")
        .map(|module| module.id)
        .unwrap();
    let sub_state = patch
        .modules
        .iter_mut()
        .find(|module| module.id == nested_id)
        .map(|module| &mut module.state)
        .unwrap();
    match sub_state.properties.get_mut("patch") {
        Some(StateValue::Patch(inner)) => inner.modules[1].type_name = "theremin".into(),
        other => panic!("sub-patch state without nested patch: {other:?}"),
    }
    let prefix = format!("module {nested_id}:");

    let issues = validate_patch(&patch, &factory);
    assert!(
        issues.iter().any(|issue| issue.is_error()
            && issue.message.starts_with(&prefix)
            && issue.message.contains("theremin")),
        "{issues:?}"
    );

    let engine = Engine::new(Arc::clone(&factory));
    let report = engine.load_state(&patch).unwrap();
    assert!(report.has_errors(), "{:?}", report.issues);
    assert!(report
        .issues
        .iter()
        .any(|issue| issue.is_error()
            && issue.message.starts_with(&prefix)
            && issue.message.contains("theremin")));

    // The same nested state loaded as a preset fails the call.
    let sub_state = patch.module(nested_id).unwrap().state.clone();
    let result = engine.load_preset(nested_id, &sub_state);
    assert!(matches!(
        result,
        Err(GraphError::ModuleFailed { module, .. }) if module == nested_id
    ));
    assert!(engine
        .module_status(nested_id)
        .unwrap()
        .last_error
        .unwrap()
        .contains("theremin"));
}

#[test]
fn newer_versions_are_refused() {
    let json = br#"{"version": 99, "modules": [], "connections": []}"#;
    assert!(patchbay_engine::state::parse_patch(json).is_err());

    let engine = Engine::new(factory());
    let patch = PatchState {
        version: 99,
        ..PatchState::default()
    };
    assert!(engine.load_state(&patch).unwrap().has_errors());
}

#[test]
fn sub_patch_layout_follows_its_bridges() {
    let factory = factory();
    let engine = Engine::new(Arc::clone(&factory));
    let sub = SubPatch::new(Arc::clone(&factory));
    let inner = sub.engine().clone();
    let nested = engine.add_module_instance(Box::new(sub)).unwrap();
    engine.prepare(48_000.0, BLOCK).unwrap();
    assert_eq!(engine.layout(nested).unwrap().input_channels(), 0);

    let inlet = inner.add_module("inlet").unwrap();
    inner.add_module("outlet").unwrap();
    inner.add_module("outlet").unwrap();
    inner.commit().unwrap();
    let layout = engine.layout(nested).unwrap();
    assert_eq!(layout.input_channels(), 1);
    assert_eq!(layout.output_channels(), 2);
    assert_eq!(layout.outputs[1].name, "out 2");

    // A wider inlet widens the enclosing module through a preset.
    inner
        .load_preset(
            inlet,
            &patchbay_engine::StateTree::new("inlet").with("channels", StateValue::Int(2)),
        )
        .unwrap();
    assert_eq!(engine.layout(nested).unwrap().input_channels(), 2);

    // Connections that no longer fit are pruned on the enclosing side.
    let sine = engine.add_module("sine").unwrap();
    engine.connect(Connection::new(sine, 0, nested, 1));
    engine.commit().unwrap();
    assert_eq!(engine.connections().len(), 1);
    inner.remove_module(inlet);
    let report = inner.commit().unwrap();
    assert!(!report.has_errors());
    assert!(engine.connections().is_empty());
}
