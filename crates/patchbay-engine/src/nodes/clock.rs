use patchbay_rt::{EdgeDetector, PlayEdgePolicy, TransportState};

use crate::config::PrepareConfig;
use crate::error::{ModuleError, ProcessError};
use crate::module::{BusInfo, BusLayout, Module, ModuleDescriptor, ParameterSpec, PinKind, ProcessContext};

/// Owns the global subdivision override. While present in the graph it
/// claims its `steps` setting for every synced module and emits a gate on
/// each step.
pub struct SubdivisionMaster {
    edges: EdgeDetector,
    transport: TransportState,
    last_step: Option<i64>,
}

impl SubdivisionMaster {
    pub fn new() -> Self {
        Self {
            edges: EdgeDetector::new(),
            transport: TransportState::default(),
            last_step: None,
        }
    }
}

impl Default for SubdivisionMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for SubdivisionMaster {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("clock-master", PlayEdgePolicy::Restart)
    }

    fn layout(&self) -> BusLayout {
        BusLayout::new().with_output(BusInfo::new("step", 1, PinKind::Gate))
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![ParameterSpec::new("steps", 3.0, 1.0, 64.0)]
    }

    fn prepare(&mut self, _config: &PrepareConfig) -> Result<(), ModuleError> {
        Ok(())
    }

    fn set_timing_info(&mut self, transport: &TransportState) {
        if let Some(edge) = self.edges.observe(transport) {
            if edge.resets_phase(PlayEdgePolicy::Restart) {
                self.last_step = None;
            }
        }
        self.transport = *transport;
    }

    fn process_block(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let steps = ctx.param(0).base() as f64;
        ctx.claim_subdivision(steps);

        let playing = self.transport.is_playing();
        let start = self.transport.position_beats();
        let per_sample = self.transport.beats_per_sample();
        let mut last_step = self.last_step;
        for (frame, sample) in ctx.output(0).iter_mut().enumerate() {
            *sample = 0.0;
            if !playing {
                continue;
            }
            let step = ((start + frame as f64 * per_sample) * steps).floor() as i64;
            if last_step != Some(step) {
                *sample = 1.0;
                last_step = Some(step);
            }
        }
        self.last_step = last_step;
        Ok(())
    }
}
