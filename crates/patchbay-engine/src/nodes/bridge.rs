use patchbay_rt::PlayEdgePolicy;

use crate::config::PrepareConfig;
use crate::error::{ModuleError, ProcessError};
use crate::module::{
    BridgeRole, BusInfo, BusLayout, Module, ModuleDescriptor, PinKind, ProcessContext,
};
use crate::state::{StateTree, StateValue};

const MAX_CHANNELS: usize = 64;

fn load_channels(state: &StateTree, current: &mut usize) -> Result<(), ModuleError> {
    if let Some(channels) = state.get_int("channels") {
        if !(1..=MAX_CHANNELS as i64).contains(&channels) {
            return Err(ModuleError::State(format!("invalid channel count {channels}")));
        }
        *current = channels as usize;
    }
    Ok(())
}

/// Entry point of a patch. The renderer copies the host input channels
/// assigned to this inlet straight into its outputs.
#[derive(Debug, Clone)]
pub struct Inlet {
    channels: usize,
}

impl Inlet {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.clamp(1, MAX_CHANNELS),
        }
    }
}

impl Module for Inlet {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("inlet", PlayEdgePolicy::Continue)
    }

    fn layout(&self) -> BusLayout {
        BusLayout::new().with_output(BusInfo::new("out", self.channels, PinKind::Raw))
    }

    fn prepare(&mut self, _config: &PrepareConfig) -> Result<(), ModuleError> {
        Ok(())
    }

    fn process_block(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        Ok(())
    }

    fn bridge(&self) -> Option<BridgeRole> {
        Some(BridgeRole::Inlet {
            channels: self.channels,
        })
    }

    fn save_state(&self) -> StateTree {
        StateTree::new("inlet").with("channels", StateValue::Int(self.channels as i64))
    }

    fn load_state(&mut self, state: &StateTree) -> Result<(), ModuleError> {
        load_channels(state, &mut self.channels)
    }
}

/// Exit point of a patch. Whatever reaches its inputs is mixed into the
/// host output channels assigned to it.
#[derive(Debug, Clone)]
pub struct Outlet {
    channels: usize,
}

impl Outlet {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.clamp(1, MAX_CHANNELS),
        }
    }
}

impl Module for Outlet {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("outlet", PlayEdgePolicy::Continue)
    }

    fn layout(&self) -> BusLayout {
        BusLayout::new().with_input(BusInfo::new("in", self.channels, PinKind::Raw))
    }

    fn prepare(&mut self, _config: &PrepareConfig) -> Result<(), ModuleError> {
        Ok(())
    }

    fn process_block(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        Ok(())
    }

    fn bridge(&self) -> Option<BridgeRole> {
        Some(BridgeRole::Outlet {
            channels: self.channels,
        })
    }

    fn save_state(&self) -> StateTree {
        StateTree::new("outlet").with("channels", StateValue::Int(self.channels as i64))
    }

    fn load_state(&mut self, state: &StateTree) -> Result<(), ModuleError> {
        load_channels(state, &mut self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_count_follows_state() {
        let mut outlet = Outlet::new(1);
        outlet
            .load_state(&StateTree::new("outlet").with("channels", StateValue::Int(2)))
            .unwrap();
        assert_eq!(outlet.layout().input_channels(), 2);
        assert_eq!(outlet.bridge(), Some(BridgeRole::Outlet { channels: 2 }));

        let mut inlet = Inlet::new(1);
        let err = inlet.load_state(&StateTree::new("inlet").with("channels", StateValue::Int(0)));
        assert!(err.is_err());
        assert_eq!(inlet.layout().output_channels(), 1);
    }
}
