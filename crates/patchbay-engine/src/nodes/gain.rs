use patchbay_rt::PlayEdgePolicy;

use crate::config::PrepareConfig;
use crate::error::{ModuleError, ProcessError};
use crate::module::{
    BusInfo, BusLayout, Module, ModuleDescriptor, ParameterRoute, ParameterSpec, PinKind,
    ProcessContext,
};

/// Voltage-controlled amplifier. A signal on `cv` replaces the `gain` knob.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gain;

impl Gain {
    pub fn new() -> Self {
        Self
    }
}

impl Module for Gain {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("gain", PlayEdgePolicy::Continue)
    }

    fn layout(&self) -> BusLayout {
        BusLayout::new()
            .with_input(BusInfo::new("in", 1, PinKind::Audio))
            .with_input(BusInfo::new("cv", 1, PinKind::ControlVoltage))
            .with_output(BusInfo::new("out", 1, PinKind::Audio))
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![ParameterSpec::new("gain", 1.0, 0.0, 1.0)]
    }

    fn prepare(&mut self, _config: &PrepareConfig) -> Result<(), ModuleError> {
        Ok(())
    }

    fn process_block(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let gain = ctx.param(0);
        let input = ctx.input(0);
        for (frame, sample) in ctx.output(0).iter_mut().enumerate() {
            *sample = input.get(frame).copied().unwrap_or_default() * gain.at(frame);
        }
        Ok(())
    }

    fn parameter_routing(&self, parameter: &str) -> Option<ParameterRoute> {
        (parameter == "gain").then_some(ParameterRoute { bus: 1, channel: 0 })
    }
}
