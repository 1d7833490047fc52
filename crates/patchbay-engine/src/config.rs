use serde::{Deserialize, Serialize};

/// How the engine treats connection cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackPolicy {
    /// Every cycle is rejected.
    Reject,
    /// Cycles are accepted when they pass through a module that declares a
    /// one-block delay.
    ThroughDelay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub feedback: FeedbackPolicy,
    /// Events buffered per module between two blocks.
    pub event_capacity: usize,
    /// Processing failures buffered until the control side polls them.
    pub failure_capacity: usize,
    /// Transport requests buffered until the next block.
    pub transport_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            feedback: FeedbackPolicy::ThroughDelay,
            event_capacity: 256,
            failure_capacity: 64,
            transport_capacity: 64,
        }
    }
}

impl EngineConfig {
    pub fn with_feedback(mut self, feedback: FeedbackPolicy) -> Self {
        self.feedback = feedback;
        self
    }
}

/// Sample rate and block size of one preparation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrepareConfig {
    pub sample_rate: f64,
    pub block_size: usize,
}

impl PrepareConfig {
    pub fn new(sample_rate: f64, block_size: usize) -> Self {
        Self {
            sample_rate,
            block_size: block_size.max(1),
        }
    }
}
