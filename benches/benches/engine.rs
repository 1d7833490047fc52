use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use patchbay_engine::{AudioBuffer, Connection, Engine, EngineConfig, ModuleFactory};

fn voices_96k_block64(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(20);

    group.bench_function("48_voices_96k_block64", |b| {
        let factory = Arc::new(ModuleFactory::with_builtins(EngineConfig::default()));
        let engine = Engine::new(factory);
        let mut renderer = engine.renderer().expect("renderer");
        let outlet = engine.add_module("outlet").expect("outlet");

        for voice in 0..48 {
            let sine = engine.add_module("sine").expect("sine");
            let gain = engine.add_module("gain").expect("gain");
            let ramp = engine.add_module("ramp").expect("ramp");
            engine.connect(Connection::new(sine, 0, gain, 0));
            engine.connect(Connection::new(ramp, 0, gain, 1));
            engine.connect(Connection::new(gain, 0, outlet, 0));
            engine.commit().expect("commit");
            engine
                .set_parameter(sine, "freq", 110.0 + voice as f32)
                .expect("freq");
        }
        engine.prepare(96_000.0, 64).expect("prepare");
        engine.play();

        let inputs = AudioBuffer::new(0, 64);
        let mut outputs = AudioBuffer::new(1, 64);
        b.iter(|| {
            renderer.process_buffers(&inputs, &mut outputs);
        });
    });

    group.bench_function("commit_while_idle", |b| {
        let factory = Arc::new(ModuleFactory::with_builtins(EngineConfig::default()));
        let engine = Engine::new(factory);
        engine.prepare(48_000.0, 128).expect("prepare");
        let sine = engine.add_module("sine").expect("sine");
        let outlet = engine.add_module("outlet").expect("outlet");
        engine.commit().expect("commit");

        let connection = Connection::new(sine, 0, outlet, 0);
        b.iter(|| {
            engine.connect(connection);
            engine.commit().expect("commit");
            engine.disconnect(connection);
            engine.commit().expect("commit");
        });
    });

    group.finish();
}

criterion_group!(benches, voices_96k_block64);
criterion_main!(benches);
