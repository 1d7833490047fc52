//! Transport state broadcast to every module once per block.
//!
//! The engine owns exactly one [`TransportState`] and hands a copy to each
//! module before it processes. Modules react to command edges through an
//! [`EdgeDetector`] rather than to the playing level alone.

use serde::{Deserialize, Serialize};

use crate::ModuleId;

/// Commands that produce a transport edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportCommand {
    Play,
    Pause,
    Stop,
    Reset,
}

/// Everything the control side can ask of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TransportRequest {
    Command(TransportCommand),
    SetBpm(f64),
    SetLoop {
        enabled: bool,
        start_beats: f64,
        end_beats: f64,
    },
    Locate {
        samples: u64,
    },
    ClaimSubdivision {
        owner: ModuleId,
        steps_per_beat: f64,
    },
    ReleaseSubdivision {
        owner: ModuleId,
    },
}

impl From<TransportCommand> for TransportRequest {
    fn from(command: TransportCommand) -> Self {
        TransportRequest::Command(command)
    }
}

/// Whether a Play edge rewinds a module's own phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayEdgePolicy {
    /// Sequencer-like: phase returns to zero on every Play edge.
    Restart,
    /// Free-running or timeline master: Play resumes where it was.
    Continue,
}

/// Where a module takes its notion of musical time from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockSource {
    /// Follows the shared song position.
    Shared,
    /// Owns an independent playhead and only honours the playing level.
    Internal,
}

/// Global subdivision claimed by one module.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubdivisionOverride {
    pub owner: ModuleId,
    /// Steps per beat.
    pub steps_per_beat: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportState {
    playing: bool,
    position_samples: u64,
    position_beats: f64,
    bpm: f64,
    sample_rate: f64,
    last_command: Option<TransportCommand>,
    command_serial: u64,
    subdivision: Option<SubdivisionOverride>,
    looping: bool,
    loop_start_beats: f64,
    loop_end_beats: f64,
}

impl Default for TransportState {
    fn default() -> Self {
        Self::new(48_000.0)
    }
}

impl TransportState {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            playing: false,
            position_samples: 0,
            position_beats: 0.0,
            bpm: 120.0,
            sample_rate: sample_rate.max(1.0),
            last_command: None,
            command_serial: 0,
            subdivision: None,
            looping: false,
            loop_start_beats: 0.0,
            loop_end_beats: 0.0,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn position_samples(&self) -> u64 {
        self.position_samples
    }

    pub fn position_beats(&self) -> f64 {
        self.position_beats
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn last_command(&self) -> Option<TransportCommand> {
        self.last_command
    }

    pub fn command_serial(&self) -> u64 {
        self.command_serial
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn subdivision_override(&self) -> Option<SubdivisionOverride> {
        self.subdivision
    }

    /// The subdivision a synced module must use: the global override when
    /// one is claimed, otherwise its own local setting.
    pub fn effective_subdivision(&self, local_steps_per_beat: f64) -> f64 {
        self.subdivision
            .map(|claim| claim.steps_per_beat)
            .unwrap_or(local_steps_per_beat)
    }

    pub fn beats_per_sample(&self) -> f64 {
        self.bpm / 60.0 / self.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate.max(1.0);
        self.position_beats = self.position_samples as f64 * self.beats_per_sample();
    }

    pub fn apply(&mut self, request: TransportRequest) {
        match request {
            TransportRequest::Command(command) => self.command(command),
            TransportRequest::SetBpm(bpm) => {
                if bpm.is_finite() && bpm > 0.0 {
                    self.bpm = bpm;
                }
            }
            TransportRequest::SetLoop {
                enabled,
                start_beats,
                end_beats,
            } => {
                self.loop_start_beats = start_beats.max(0.0);
                self.loop_end_beats = end_beats.max(0.0);
                self.looping = enabled && self.loop_end_beats > self.loop_start_beats;
            }
            TransportRequest::Locate { samples } => {
                self.position_samples = samples;
                self.position_beats = samples as f64 * self.beats_per_sample();
            }
            TransportRequest::ClaimSubdivision {
                owner,
                steps_per_beat,
            } => self.claim_subdivision(owner, steps_per_beat),
            TransportRequest::ReleaseSubdivision { owner } => {
                self.release_subdivision(owner);
            }
        }
    }

    fn command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Play => self.playing = true,
            TransportCommand::Pause => self.playing = false,
            TransportCommand::Stop => {
                self.playing = false;
                self.rewind();
            }
            TransportCommand::Reset => self.rewind(),
        }
        self.last_command = Some(command);
        self.command_serial = self.command_serial.wrapping_add(1);
    }

    fn rewind(&mut self) {
        self.position_samples = 0;
        self.position_beats = if self.looping {
            self.loop_start_beats
        } else {
            0.0
        };
    }

    /// Moves the song position forward by one block while playing.
    pub fn advance(&mut self, frames: usize) {
        if !self.playing {
            return;
        }
        self.position_samples = self.position_samples.saturating_add(frames as u64);
        self.position_beats += frames as f64 * self.beats_per_sample();
        let length = self.loop_end_beats - self.loop_start_beats;
        if self.looping && length > 0.0 && self.position_beats >= self.loop_end_beats {
            self.position_beats =
                self.loop_start_beats + (self.position_beats - self.loop_start_beats) % length;
        }
    }

    /// Installs a global subdivision override owned by `owner`, replacing any
    /// previous claim.
    pub fn claim_subdivision(&mut self, owner: ModuleId, steps_per_beat: f64) {
        if steps_per_beat.is_finite() && steps_per_beat > 0.0 {
            self.subdivision = Some(SubdivisionOverride {
                owner,
                steps_per_beat,
            });
        }
    }

    /// Clears the override if `owner` holds it. Returns whether it was cleared.
    pub fn release_subdivision(&mut self, owner: ModuleId) -> bool {
        match self.subdivision {
            Some(claim) if claim.owner == owner => {
                self.subdivision = None;
                true
            }
            _ => false,
        }
    }
}

/// One observed transport command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportEdge {
    pub command: TransportCommand,
    pub serial: u64,
}

impl TransportEdge {
    /// Stop and Reset always rewind; Play only rewinds modules that restart.
    pub fn resets_phase(&self, policy: PlayEdgePolicy) -> bool {
        match self.command {
            TransportCommand::Stop | TransportCommand::Reset => true,
            TransportCommand::Play => policy == PlayEdgePolicy::Restart,
            TransportCommand::Pause => false,
        }
    }

    /// Stop cancels pending asynchronous work such as a running recording.
    pub fn cancels_pending(&self) -> bool {
        self.command == TransportCommand::Stop
    }
}

/// Per-module cache that turns transport copies into edges.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeDetector {
    seen_serial: u64,
}

impl EdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the given state without reporting its last command.
    pub fn synced_to(state: &TransportState) -> Self {
        Self {
            seen_serial: state.command_serial(),
        }
    }

    pub fn observe(&mut self, state: &TransportState) -> Option<TransportEdge> {
        if state.command_serial() == self.seen_serial {
            return None;
        }
        self.seen_serial = state.command_serial();
        state.last_command().map(|command| TransportEdge {
            command,
            serial: state.command_serial(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_only_moves_while_playing() {
        let mut state = TransportState::new(48_000.0);
        state.advance(480);
        assert_eq!(state.position_samples(), 0);

        state.apply(TransportCommand::Play.into());
        state.advance(24_000);
        assert_eq!(state.position_samples(), 24_000);
        assert!((state.position_beats() - 1.0).abs() < 1e-9);

        state.apply(TransportCommand::Pause.into());
        state.advance(24_000);
        assert_eq!(state.position_samples(), 24_000);
    }

    #[test]
    fn stop_rewinds_and_reset_keeps_level() {
        let mut state = TransportState::new(48_000.0);
        state.apply(TransportCommand::Play.into());
        state.advance(4_800);
        state.apply(TransportCommand::Reset.into());
        assert!(state.is_playing());
        assert_eq!(state.position_samples(), 0);

        state.advance(4_800);
        state.apply(TransportCommand::Stop.into());
        assert!(!state.is_playing());
        assert_eq!(state.position_samples(), 0);
    }

    #[test]
    fn loop_wraps_beat_position() {
        let mut state = TransportState::new(48_000.0);
        state.apply(TransportRequest::SetLoop {
            enabled: true,
            start_beats: 1.0,
            end_beats: 2.0,
        });
        state.apply(TransportCommand::Play.into());
        // 2.5 beats at 120 bpm
        state.advance(60_000);
        assert!((state.position_beats() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn negative_loop_region_collapses_to_no_loop() {
        let mut state = TransportState::new(48_000.0);
        state.apply(TransportRequest::SetLoop {
            enabled: true,
            start_beats: -2.0,
            end_beats: -1.0,
        });
        assert!(!state.is_looping());

        state.apply(TransportCommand::Play.into());
        state.advance(64);
        assert!(state.position_beats().is_finite());
        assert!(state.position_beats() > 0.0);
    }

    #[test]
    fn edge_detector_reports_each_command_once() {
        let mut state = TransportState::default();
        let mut detector = EdgeDetector::synced_to(&state);
        assert!(detector.observe(&state).is_none());

        state.apply(TransportCommand::Play.into());
        let edge = detector.observe(&state).expect("play edge");
        assert_eq!(edge.command, TransportCommand::Play);
        assert!(detector.observe(&state).is_none());

        state.apply(TransportCommand::Play.into());
        assert!(detector.observe(&state).is_some());
    }

    #[test]
    fn play_edge_policy_decides_phase_reset() {
        let play = TransportEdge {
            command: TransportCommand::Play,
            serial: 1,
        };
        assert!(play.resets_phase(PlayEdgePolicy::Restart));
        assert!(!play.resets_phase(PlayEdgePolicy::Continue));

        let stop = TransportEdge {
            command: TransportCommand::Stop,
            serial: 2,
        };
        assert!(stop.resets_phase(PlayEdgePolicy::Continue));
        assert!(stop.cancels_pending());
    }

    #[test]
    fn only_owner_releases_subdivision() {
        let mut state = TransportState::default();
        assert_eq!(state.effective_subdivision(4.0), 4.0);

        state.claim_subdivision(ModuleId(3), 3.0);
        assert_eq!(state.effective_subdivision(4.0), 3.0);
        assert!(!state.release_subdivision(ModuleId(9)));
        assert!(state.release_subdivision(ModuleId(3)));
        assert_eq!(state.effective_subdivision(4.0), 4.0);
    }
}
