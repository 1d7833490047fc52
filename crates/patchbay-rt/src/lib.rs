//! Real-time primitives shared by the patchbay engine: module identity,
//! the transport broadcast, the background-worker handoff and the command
//! ingress queue. Nothing in here knows about the graph.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod handoff;
pub mod ingress;
pub mod transport;

pub use handoff::{
    fetch_latest, handoff, BackgroundWorker, LatestSource, Liveness, Publish, ResultPublisher,
    ResultReceiver, SourceSelector, WorkerFlow,
};
pub use ingress::{Coalesce, IngressQueue};
pub use transport::{
    ClockSource, EdgeDetector, PlayEdgePolicy, SubdivisionOverride, TransportCommand,
    TransportEdge, TransportRequest, TransportState,
};

/// Stable logical identifier of a module. Never reused within one graph and
/// persisted across save/load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(pub u32);

impl ModuleId {
    /// The unset id. Workers must tolerate it.
    pub const UNSET: ModuleId = ModuleId(0);

    pub fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
