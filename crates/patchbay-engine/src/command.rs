use patchbay_rt::{Coalesce, ModuleId, TransportRequest};
use serde::{Deserialize, Serialize};

use crate::graph::Connection;
use crate::module::ModuleEvent;
use crate::state::StateTree;

/// Typed command produced by an external control surface and consumed
/// through an [`patchbay_rt::IngressQueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlCommand {
    Create {
        type_name: String,
        id: Option<ModuleId>,
    },
    Destroy {
        id: ModuleId,
    },
    Update {
        target: ModuleId,
        parameter: String,
        value: f32,
    },
    Connect(Connection),
    Disconnect(Connection),
    LoadPreset {
        target: ModuleId,
        state: StateTree,
    },
    Event {
        target: ModuleId,
        event: ModuleEvent,
    },
    Transport(TransportRequest),
}

impl ControlCommand {
    pub fn update(target: ModuleId, parameter: impl Into<String>, value: f32) -> Self {
        ControlCommand::Update {
            target,
            parameter: parameter.into(),
            value,
        }
    }

    /// Module the command addresses directly, if it needs a live one.
    pub fn target(&self) -> Option<ModuleId> {
        match self {
            ControlCommand::Update { target, .. }
            | ControlCommand::LoadPreset { target, .. }
            | ControlCommand::Event { target, .. } => Some(*target),
            _ => None,
        }
    }
}

impl Coalesce for ControlCommand {
    fn superseded_by(&self, newer: &Self) -> bool {
        match (self, newer) {
            (
                ControlCommand::Update {
                    target, parameter, ..
                },
                ControlCommand::Update {
                    target: newer_target,
                    parameter: newer_parameter,
                    ..
                },
            ) => target == newer_target && parameter == newer_parameter,
            _ => false,
        }
    }
}
