use std::sync::Arc;

use patchbay_engine::{
    Connection, Engine, EngineConfig, ModuleFactory, ModuleId, Renderer, StateTree, StateValue,
};

const BLOCK: usize = 32;

fn ramp_into_outlet(kind: &str) -> (Engine, Renderer, ModuleId) {
    let factory = Arc::new(ModuleFactory::with_builtins(EngineConfig::default()));
    let engine = Engine::new(factory);
    let renderer = engine.renderer().unwrap();
    let ramp = engine.add_module(kind).unwrap();
    let out = engine.add_module("outlet").unwrap();
    engine.connect(Connection::new(ramp, 0, out, 0));
    engine.prepare(48_000.0, BLOCK).unwrap();
    (engine, renderer, ramp)
}

fn render(renderer: &mut Renderer) -> Vec<f32> {
    let mut outputs = vec![vec![0.0f32; BLOCK]];
    renderer.process(&[], &mut outputs, BLOCK);
    outputs.remove(0)
}

fn first_sample_after_play(kind: &str) -> f32 {
    let (engine, mut renderer, ramp) = ramp_into_outlet(kind);
    engine.stop();
    render(&mut renderer);

    engine
        .load_preset(ramp, &StateTree::new(kind).with("phase", StateValue::Float(0.7)))
        .unwrap();
    // Stopped: the phase holds.
    assert!((render(&mut renderer)[0] - 0.7).abs() < 1e-6);

    engine.play();
    render(&mut renderer)[0]
}

#[test]
fn restart_ramp_resets_on_play() {
    assert_eq!(first_sample_after_play("ramp"), 0.0);
}

#[test]
fn free_ramp_resumes_where_it_was() {
    assert!((first_sample_after_play("free-ramp") - 0.7).abs() < 1e-6);
}

#[test]
fn pause_keeps_phase_and_stop_resets_it() {
    let (engine, mut renderer, _) = ramp_into_outlet("ramp");
    engine.play();
    render(&mut renderer);
    let running = render(&mut renderer);
    assert!(running[BLOCK - 1] > running[0]);

    engine.pause();
    let paused = render(&mut renderer);
    assert!(paused.iter().all(|sample| *sample == paused[0]));
    assert!(paused[0] > 0.0);

    engine.stop();
    let stopped = render(&mut renderer);
    assert!(stopped.iter().all(|sample| *sample == 0.0));
    assert_eq!(renderer.transport().position_samples(), 0);
}

#[test]
fn subdivision_master_overrides_every_synced_ramp() {
    let (engine, mut renderer, ramp) = ramp_into_outlet("ramp");
    engine.set_parameter(ramp, "steps", 1.0).unwrap();
    let clock = engine.add_module("clock-master").unwrap();
    engine.commit().unwrap();
    engine.set_parameter(clock, "steps", 8.0).unwrap();
    engine.play();

    render(&mut renderer);
    assert_eq!(
        renderer.transport().effective_subdivision(1.0),
        8.0,
        "claim is applied after the block"
    );
    let block = render(&mut renderer);
    let per_sample = renderer.transport().beats_per_sample() * 8.0;
    assert!(((block[1] - block[0]) as f64 - per_sample).abs() < 1e-6);

    // Removing the master releases the override.
    engine.remove_module(clock);
    engine.commit().unwrap();
    render(&mut renderer);
    assert!(renderer.transport().subdivision_override().is_none());
}

#[test]
fn clip_player_ignores_relocation() {
    let factory = Arc::new(ModuleFactory::with_builtins(EngineConfig::default()));
    let engine = Engine::new(factory);
    let mut renderer = engine.renderer().unwrap();
    let clip = engine.add_module("clip-player").unwrap();
    let out = engine.add_module("outlet").unwrap();
    engine.connect(Connection::new(clip, 0, out, 0));
    engine.prepare(48_000.0, BLOCK).unwrap();
    let samples: Vec<f32> = (0..BLOCK * 4).map(|index| index as f32).collect();
    engine
        .load_preset(
            clip,
            &StateTree::new("clip-player").with("samples", StateValue::Floats(samples)),
        )
        .unwrap();

    engine.play();
    assert_eq!(render(&mut renderer)[0], 0.0);
    engine.send_transport(patchbay_engine::TransportRequest::Locate { samples: 0 });
    assert_eq!(render(&mut renderer)[0], BLOCK as f32);
    assert_eq!(renderer.transport().position_samples(), BLOCK as u64);
}

#[test]
fn transport_snapshot_mirrors_the_audio_side() {
    let (engine, mut renderer, _) = ramp_into_outlet("ramp");
    engine.set_bpm(90.0);
    engine.play();
    render(&mut renderer);
    render(&mut renderer);

    let snapshot = engine.transport();
    assert!(snapshot.playing);
    assert_eq!(snapshot.position_samples, 2 * BLOCK as u64);
    assert_eq!(snapshot.bpm, 90.0);
}
