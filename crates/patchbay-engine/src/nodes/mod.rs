//! Built-in modules: enough to patch, test and demonstrate the engine.

pub mod bridge;
pub mod clip;
pub mod clock;
pub mod delay;
pub mod follower;
pub mod gain;
pub mod ramp;
pub mod sine;

pub use bridge::{Inlet, Outlet};
pub use clip::ClipPlayer;
pub use clock::SubdivisionMaster;
pub use delay::UnitDelay;
pub use follower::FrameFollower;
pub use gain::Gain;
pub use ramp::PhaseRamp;
pub use sine::SineOscillator;
