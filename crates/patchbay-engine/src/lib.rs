//! Patchbay Engine
//! ===============
//! Graph engine of a modular instrument. Modules are edited on the control
//! side and committed as immutable processing plans; the audio thread
//! renders whichever plan is current without ever waiting on the editor.

pub mod buffer;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod factory;
pub mod graph;
pub mod module;
pub mod nodes;
pub mod plan;
pub mod renderer;
mod slot;
pub mod state;
pub mod subpatch;

pub use buffer::AudioBuffer;
pub use command::ControlCommand;
pub use config::{EngineConfig, FeedbackPolicy, PrepareConfig};
pub use engine::{
    BridgeLayout, CommitReport, Engine, EngineState, LoadReport, ModuleFailure, ModuleInfo,
    ModuleStatus, TransportSnapshot,
};
pub use error::{GraphError, Issue, ModuleError, ProcessError, Severity, StateError};
pub use factory::ModuleFactory;
pub use graph::Connection;
pub use module::{
    BridgeRole, BusInfo, BusLayout, Direction, EventKind, Module, ModuleDescriptor, ModuleEvent,
    ModuleHost, ParameterRoute, ParameterSpec, PinInfo, PinKind, ProcessContext,
    SubdivisionClaim,
};
pub use plan::ProcessingPlan;
pub use renderer::Renderer;
pub use state::{ModuleState, PatchState, StateTree, StateValue};
pub use subpatch::SubPatch;

pub use patchbay_rt::{
    ClockSource, IngressQueue, LatestSource, ModuleId, PlayEdgePolicy, TransportCommand,
    TransportRequest, TransportState,
};
