use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use patchbay_engine::{
    Connection, Direction, Engine, EngineConfig, GraphError, LatestSource, ModuleFactory,
    PinKind, Renderer,
};

/// Stands in for a video decoder: one current value per frame source.
#[derive(Default)]
struct Decoder {
    frames: Mutex<Vec<(u64, f32)>>,
}

impl LatestSource<f32> for Decoder {
    fn latest(&self, source: u64) -> Option<f32> {
        self.frames
            .lock()
            .iter()
            .find(|(id, _)| *id == source)
            .map(|(_, value)| *value)
    }

    fn known_sources(&self) -> Vec<u64> {
        self.frames.lock().iter().map(|(id, _)| *id).collect()
    }
}

fn engine_with(decoder: Arc<Decoder>) -> Engine {
    let mut factory = ModuleFactory::with_builtins(EngineConfig::default());
    factory.register_frame_source(decoder);
    Engine::new(Arc::new(factory))
}

#[test]
fn frame_ids_only_connect_to_frame_ids() {
    let engine = engine_with(Arc::default());
    let sine = engine.add_module("sine").unwrap();
    let follower = engine.add_module("frame-follower").unwrap();
    let delay = engine.add_module("unit-delay").unwrap();
    engine.commit().unwrap();

    let pins = engine.input_pins(follower).unwrap();
    assert_eq!(pins[0].kind, PinKind::VideoFrameId);
    assert_eq!(pins[0].name, "frame");

    assert_eq!(
        engine.validate_connection(&Connection::new(sine, 0, follower, 0)),
        Err(GraphError::IncompatiblePins {
            from: PinKind::Audio,
            to: PinKind::VideoFrameId,
        })
    );
    // Raw pins pass anything through.
    engine
        .validate_connection(&Connection::new(sine, 0, delay, 0))
        .unwrap();
    engine
        .validate_connection(&Connection::new(delay, 0, follower, 0))
        .unwrap();

    engine.connect(Connection::new(sine, 0, follower, 0));
    let report = engine.commit().unwrap();
    assert!(report.has_errors());
    assert!(engine.connections().is_empty());
}

#[test]
fn out_of_range_channels_are_rejected() {
    let engine = engine_with(Arc::default());
    let sine = engine.add_module("sine").unwrap();
    let gain = engine.add_module("gain").unwrap();
    engine.commit().unwrap();

    assert_eq!(
        engine.validate_connection(&Connection::new(sine, 1, gain, 0)),
        Err(GraphError::ChannelOutOfRange {
            module: sine,
            direction: Direction::Output,
            channel: 1,
            available: 1,
        })
    );
    // The gain CV input is the second channel.
    engine
        .validate_connection(&Connection::new(sine, 0, gain, 1))
        .unwrap();
    assert!(engine
        .validate_connection(&Connection::new(sine, 0, gain, 2))
        .is_err());
}

fn wait_for_output(renderer: &mut Renderer, expected: f32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        let mut outputs = vec![vec![0.0f32; 16]];
        renderer.process(&[], &mut outputs, 16);
        if outputs[0][15] == expected {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn follower_reports_the_newest_frame_value() {
    let decoder = Arc::new(Decoder::default());
    decoder.frames.lock().push((5, 0.5));
    let engine = engine_with(Arc::clone(&decoder));
    let mut renderer = engine.renderer().unwrap();
    let follower = engine.add_module("frame-follower").unwrap();
    let out = engine.add_module("outlet").unwrap();
    engine.connect(Connection::new(follower, 0, out, 0));
    engine.prepare(48_000.0, 16).unwrap();

    // No frame id connected: the first known source is followed.
    assert!(wait_for_output(&mut renderer, 0.5));

    decoder.frames.lock()[0].1 = 0.8;
    assert!(wait_for_output(&mut renderer, 0.8));

    engine.remove_module(follower);
    engine.commit().unwrap();
    assert!(wait_for_output(&mut renderer, 0.0));
}
