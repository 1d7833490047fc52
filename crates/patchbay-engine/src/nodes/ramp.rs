use patchbay_rt::{EdgeDetector, PlayEdgePolicy, TransportState};

use crate::config::PrepareConfig;
use crate::error::{ModuleError, ProcessError};
use crate::module::{BusInfo, BusLayout, Module, ModuleDescriptor, ParameterSpec, PinKind, ProcessContext};
use crate::state::{StateTree, StateValue};

/// Clock-synced phase ramp, the skeleton of a step sequencer. Outputs the
/// phase within the current step, advancing only while the transport plays.
///
/// The step length follows the global subdivision override when one is
/// claimed, otherwise the local `steps` parameter (steps per beat).
pub struct PhaseRamp {
    policy: PlayEdgePolicy,
    edges: EdgeDetector,
    transport: TransportState,
    phase: f64,
}

impl PhaseRamp {
    pub fn new(policy: PlayEdgePolicy) -> Self {
        Self {
            policy,
            edges: EdgeDetector::new(),
            transport: TransportState::default(),
            phase: 0.0,
        }
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    pub fn set_phase(&mut self, phase: f64) {
        self.phase = phase.rem_euclid(1.0);
    }

    fn type_name(&self) -> &'static str {
        match self.policy {
            PlayEdgePolicy::Restart => "ramp",
            PlayEdgePolicy::Continue => "free-ramp",
        }
    }
}

impl Module for PhaseRamp {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new(self.type_name(), self.policy)
    }

    fn layout(&self) -> BusLayout {
        BusLayout::new().with_output(BusInfo::new("phase", 1, PinKind::ControlVoltage))
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![ParameterSpec::new("steps", 4.0, 1.0, 64.0)]
    }

    fn prepare(&mut self, _config: &PrepareConfig) -> Result<(), ModuleError> {
        Ok(())
    }

    fn set_timing_info(&mut self, transport: &TransportState) {
        if let Some(edge) = self.edges.observe(transport) {
            if edge.resets_phase(self.policy) {
                self.phase = 0.0;
            }
        }
        self.transport = *transport;
    }

    fn process_block(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let steps = self
            .transport
            .effective_subdivision(ctx.param(0).base() as f64);
        let increment = if self.transport.is_playing() {
            self.transport.beats_per_sample() * steps
        } else {
            0.0
        };
        let mut phase = self.phase;
        for sample in ctx.output(0) {
            *sample = phase as f32;
            phase = (phase + increment).fract();
        }
        self.phase = phase;
        Ok(())
    }

    fn save_state(&self) -> StateTree {
        StateTree::new(self.type_name()).with("phase", StateValue::Float(self.phase))
    }

    fn load_state(&mut self, state: &StateTree) -> Result<(), ModuleError> {
        if let Some(phase) = state.get_float("phase") {
            self.set_phase(phase);
        }
        Ok(())
    }
}
