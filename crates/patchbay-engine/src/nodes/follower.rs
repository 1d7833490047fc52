use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use patchbay_rt::{
    fetch_latest, handoff, BackgroundWorker, EdgeDetector, LatestSource, PlayEdgePolicy, Publish,
    ResultReceiver, SourceSelector, TransportState, WorkerFlow,
};

use crate::config::PrepareConfig;
use crate::error::{ModuleError, ProcessError};
use crate::module::{BusInfo, BusLayout, Module, ModuleDescriptor, PinKind, ProcessContext};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Follows the newest value produced for a video frame source.
///
/// The `frame` input carries the source id. A background worker polls the
/// source and hands results over a one-slot ring, so the audio thread only
/// ever reads the latest one. A Stop drops whatever the worker delivered
/// and has it publish afresh.
pub struct FrameFollower {
    source: Arc<dyn LatestSource<f32>>,
    selector: SourceSelector,
    receiver: Option<ResultReceiver<(u64, f32)>>,
    worker: Option<BackgroundWorker>,
    edges: EdgeDetector,
    cancel: bool,
    resync: Arc<AtomicBool>,
}

impl FrameFollower {
    pub fn new(source: Arc<dyn LatestSource<f32>>) -> Self {
        Self {
            source,
            selector: SourceSelector::new(),
            receiver: None,
            worker: None,
            edges: EdgeDetector::new(),
            cancel: false,
            resync: Arc::new(AtomicBool::new(false)),
        }
    }

    fn start_worker(&mut self) -> anyhow::Result<()> {
        let (mut publisher, receiver) = handoff::<(u64, f32)>(1);
        let source = Arc::clone(&self.source);
        let selector = self.selector.clone();
        let resync = Arc::clone(&self.resync);
        let mut last: Option<(u64, u32)> = None;
        let worker = BackgroundWorker::spawn("frame-follower", POLL_INTERVAL, move || {
            if publisher.flush() == Publish::Abandoned {
                return Ok(WorkerFlow::Finished);
            }
            if resync.swap(false, Ordering::AcqRel) {
                last = None;
            }
            let Some((id, value)) = fetch_latest(source.as_ref(), selector.current()) else {
                return Ok(WorkerFlow::Continue);
            };
            if last != Some((id, value.to_bits())) {
                last = Some((id, value.to_bits()));
                if publisher.publish((id, value)) == Publish::Abandoned {
                    return Ok(WorkerFlow::Finished);
                }
            }
            Ok(WorkerFlow::Continue)
        })?;
        self.receiver = Some(receiver);
        self.worker = Some(worker);
        Ok(())
    }
}

impl Module for FrameFollower {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("frame-follower", PlayEdgePolicy::Continue)
    }

    fn layout(&self) -> BusLayout {
        BusLayout::new()
            .with_input(BusInfo::new("frame", 1, PinKind::VideoFrameId))
            .with_output(BusInfo::new("value", 1, PinKind::ControlVoltage))
    }

    fn prepare(&mut self, _config: &PrepareConfig) -> Result<(), ModuleError> {
        let running = self.worker.as_ref().is_some_and(|worker| !worker.is_finished());
        if running {
            return Ok(());
        }
        self.start_worker()
            .map_err(|err| ModuleError::MissingResource(format!("frame worker: {err}")))
    }

    fn release_resources(&mut self) {
        // Retire the receiver first so the worker sees the abandonment.
        self.receiver = None;
        self.worker = None;
    }

    fn set_timing_info(&mut self, transport: &TransportState) {
        if let Some(edge) = self.edges.observe(transport) {
            self.cancel |= edge.cancels_pending();
        }
    }

    fn process_block(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let id = ctx.input(0).first().copied().unwrap_or(0.0);
        self.selector
            .select(if id >= 1.0 { id.round() as u64 } else { 0 });

        if std::mem::take(&mut self.cancel) {
            if let Some(receiver) = self.receiver.as_mut() {
                receiver.discard();
            }
            self.resync.store(true, Ordering::Release);
            ctx.output(0).fill(0.0);
            return Ok(());
        }

        let value = match self.receiver.as_mut() {
            Some(receiver) => {
                receiver.poll();
                receiver.latest().map(|(_, value)| *value).unwrap_or(0.0)
            }
            None => 0.0,
        };
        ctx.output(0).fill(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ParamView, ParameterBank};
    use parking_lot::Mutex;
    use patchbay_rt::{ModuleId, TransportCommand};
    use std::time::Instant;

    #[derive(Default)]
    struct Frames {
        values: Mutex<Vec<(u64, f32)>>,
    }

    impl LatestSource<f32> for Frames {
        fn latest(&self, source: u64) -> Option<f32> {
            self.values
                .lock()
                .iter()
                .find(|(id, _)| *id == source)
                .map(|(_, value)| *value)
        }

        fn known_sources(&self) -> Vec<u64> {
            self.values.lock().iter().map(|(id, _)| *id).collect()
        }
    }

    fn run(follower: &mut FrameFollower, frame_id: f32) -> f32 {
        let bank = ParameterBank::new(Vec::new());
        let inputs = vec![vec![frame_id; 8]];
        let mut outputs = vec![vec![0.0; 8]];
        let mut claim = None;
        let mut ctx = ProcessContext {
            id: ModuleId(1),
            frames: 8,
            sample_rate: 48_000.0,
            inputs: &inputs,
            outputs: &mut outputs,
            events: &[],
            params: ParamView {
                bank: &bank,
                routes: &[],
                inputs: &inputs,
            },
            claim: &mut claim,
        };
        follower.process_block(&mut ctx).unwrap();
        outputs[0][7]
    }

    fn wait_for(follower: &mut FrameFollower, frame_id: f32, expected: f32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if run(follower, frame_id) == expected {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn follows_selected_source_and_falls_back_when_unset() {
        let frames = Arc::new(Frames::default());
        frames.values.lock().extend([(3, 0.25), (7, 0.75)]);
        let mut follower = FrameFollower::new(frames.clone());
        follower
            .prepare(&PrepareConfig::new(48_000.0, 8))
            .unwrap();

        assert!(wait_for(&mut follower, 7.0, 0.75));
        // Unset id picks the first known source.
        assert!(wait_for(&mut follower, 0.0, 0.25));

        follower.release_resources();
        assert!(follower.worker.is_none());
        assert_eq!(run(&mut follower, 7.0), 0.0);
    }

    #[test]
    fn stop_drops_delivered_results_until_the_worker_republishes() {
        let frames = Arc::new(Frames::default());
        frames.values.lock().push((4, 0.5));
        let mut follower = FrameFollower::new(frames.clone());
        follower
            .prepare(&PrepareConfig::new(48_000.0, 8))
            .unwrap();
        assert!(wait_for(&mut follower, 4.0, 0.5));

        let mut transport = TransportState::default();
        transport.apply(TransportCommand::Pause.into());
        follower.set_timing_info(&transport);
        assert_eq!(run(&mut follower, 4.0), 0.5);

        transport.apply(TransportCommand::Stop.into());
        follower.set_timing_info(&transport);
        assert_eq!(run(&mut follower, 4.0), 0.0);
        // The unchanged source value is published again after the stop.
        assert!(wait_for(&mut follower, 4.0, 0.5));
    }
}
