use std::f64::consts::TAU;

use patchbay_rt::PlayEdgePolicy;

use crate::config::PrepareConfig;
use crate::error::{ModuleError, ProcessError};
use crate::module::{
    BusInfo, BusLayout, Module, ModuleDescriptor, ParameterRoute, ParameterSpec, PinKind,
    ProcessContext,
};

const FREQUENCY: usize = 0;
const LEVEL: usize = 1;

/// Free-running sine oscillator. Ignores transport edges.
///
/// `freq` is exposed on the `fm` input and modulated relatively: a full
/// scale signal sweeps half the frequency range around the knob.
pub struct SineOscillator {
    phase: f64,
    sample_rate: f64,
}

impl SineOscillator {
    pub fn new() -> Self {
        Self {
            phase: 0.0,
            sample_rate: 48_000.0,
        }
    }
}

impl Default for SineOscillator {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for SineOscillator {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("sine", PlayEdgePolicy::Continue)
    }

    fn layout(&self) -> BusLayout {
        BusLayout::new()
            .with_input(BusInfo::new("fm", 1, PinKind::ControlVoltage))
            .with_output(BusInfo::new("out", 1, PinKind::Audio))
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::new("freq", 220.0, 1.0, 20_000.0).relative(),
            ParameterSpec::new("level", 0.5, 0.0, 1.0),
        ]
    }

    fn prepare(&mut self, config: &PrepareConfig) -> Result<(), ModuleError> {
        self.sample_rate = config.sample_rate.max(f64::EPSILON);
        Ok(())
    }

    fn process_block(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let frequency = ctx.param(FREQUENCY);
        let level = ctx.param(LEVEL);
        let mut phase = self.phase;
        let step = TAU / self.sample_rate;
        for (frame, sample) in ctx.output(0).iter_mut().enumerate() {
            *sample = (phase.sin() as f32) * level.at(frame);
            phase = (phase + step * frequency.at(frame) as f64).rem_euclid(TAU);
        }
        self.phase = phase;
        Ok(())
    }

    fn parameter_routing(&self, parameter: &str) -> Option<ParameterRoute> {
        (parameter == "freq").then_some(ParameterRoute { bus: 0, channel: 0 })
    }
}
