use patchbay_rt::{ClockSource, EdgeDetector, PlayEdgePolicy, TransportState};

use crate::config::PrepareConfig;
use crate::error::{ModuleError, ProcessError};
use crate::module::{BusInfo, BusLayout, Module, ModuleDescriptor, ParameterSpec, PinKind, ProcessContext};
use crate::state::{StateTree, StateValue};

const LEVEL: usize = 0;

/// Plays a mono clip against its own playhead. The playhead runs while the
/// transport plays, holds on pause and rewinds on stop, but never follows
/// the shared position.
pub struct ClipPlayer {
    clip: Vec<f32>,
    looping: bool,
    position: usize,
    playing: bool,
    edges: EdgeDetector,
}

impl ClipPlayer {
    pub fn new() -> Self {
        Self {
            clip: Vec::new(),
            looping: false,
            position: 0,
            playing: false,
            edges: EdgeDetector::new(),
        }
    }

    pub fn with_clip(mut self, clip: Vec<f32>, looping: bool) -> Self {
        self.clip = clip;
        self.looping = looping;
        self.position = 0;
        self
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn finished(&self) -> bool {
        self.position >= self.clip.len()
    }
}

impl Default for ClipPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for ClipPlayer {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("clip-player", PlayEdgePolicy::Continue)
            .with_clock(ClockSource::Internal)
    }

    fn layout(&self) -> BusLayout {
        BusLayout::new().with_output(BusInfo::new("out", 1, PinKind::Audio))
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![ParameterSpec::new("level", 1.0, 0.0, 1.0)]
    }

    fn prepare(&mut self, _config: &PrepareConfig) -> Result<(), ModuleError> {
        Ok(())
    }

    fn set_timing_info(&mut self, transport: &TransportState) {
        if let Some(edge) = self.edges.observe(transport) {
            if edge.resets_phase(PlayEdgePolicy::Continue) {
                self.position = 0;
            }
        }
        self.playing = transport.is_playing();
    }

    fn process_block(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let level = ctx.param(LEVEL);
        let output = ctx.output(0);
        output.fill(0.0);
        if !self.playing || self.clip.is_empty() {
            return Ok(());
        }
        for (frame, sample) in output.iter_mut().enumerate() {
            if self.finished() {
                if !self.looping {
                    break;
                }
                self.position = 0;
            }
            *sample = self.clip[self.position] * level.at(frame);
            self.position += 1;
        }
        Ok(())
    }

    fn save_state(&self) -> StateTree {
        StateTree::new("clip-player")
            .with("samples", StateValue::Floats(self.clip.clone()))
            .with("looping", StateValue::Bool(self.looping))
    }

    fn load_state(&mut self, state: &StateTree) -> Result<(), ModuleError> {
        if let Some(samples) = state.get_floats("samples") {
            self.clip = samples.to_vec();
            self.position = 0;
        }
        if let Some(looping) = state.get_bool("looping") {
            self.looping = looping;
        }
        Ok(())
    }
}
