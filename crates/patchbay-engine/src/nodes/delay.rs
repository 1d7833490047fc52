use patchbay_rt::PlayEdgePolicy;

use crate::config::PrepareConfig;
use crate::error::{ModuleError, ProcessError};
use crate::module::{BusInfo, BusLayout, Module, ModuleDescriptor, PinKind, ProcessContext};
use crate::state::{StateTree, StateValue};

const MAX_CHANNELS: usize = 64;

/// One-block delay. The engine hands it the inputs gathered at the end of
/// the previous block, which is what lets it close a feedback loop.
#[derive(Debug, Clone)]
pub struct UnitDelay {
    channels: usize,
}

impl UnitDelay {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.clamp(1, MAX_CHANNELS),
        }
    }
}

impl Module for UnitDelay {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("unit-delay", PlayEdgePolicy::Continue).with_feedback_delay()
    }

    fn layout(&self) -> BusLayout {
        BusLayout::new()
            .with_input(BusInfo::new("in", self.channels, PinKind::Raw))
            .with_output(BusInfo::new("out", self.channels, PinKind::Raw))
    }

    fn prepare(&mut self, _config: &PrepareConfig) -> Result<(), ModuleError> {
        Ok(())
    }

    fn process_block(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        for channel in 0..self.channels {
            let input = ctx.input(channel);
            let output = ctx.output(channel);
            let len = input.len().min(output.len());
            output[..len].copy_from_slice(&input[..len]);
            output[len..].fill(0.0);
        }
        Ok(())
    }

    fn save_state(&self) -> StateTree {
        StateTree::new("unit-delay").with("channels", StateValue::Int(self.channels as i64))
    }

    fn load_state(&mut self, state: &StateTree) -> Result<(), ModuleError> {
        if let Some(channels) = state.get_int("channels") {
            if !(1..=MAX_CHANNELS as i64).contains(&channels) {
                return Err(ModuleError::State(format!("invalid channel count {channels}")));
            }
            self.channels = channels as usize;
        }
        Ok(())
    }
}
