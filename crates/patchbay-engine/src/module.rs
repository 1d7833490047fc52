//! The capability interface every module implements, plus the value types
//! the engine uses to describe buses, pins and parameters.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Weak;

use atomic_float::AtomicF32;
use patchbay_rt::{ClockSource, ModuleId, PlayEdgePolicy, TransportState};
use serde::{Deserialize, Serialize};

use crate::config::PrepareConfig;
use crate::engine::Shared;
use crate::error::{Issue, ModuleError, ProcessError};
use crate::state::StateTree;

/// Semantic type of a pin, checked by routing validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinKind {
    Audio,
    ControlVoltage,
    Gate,
    VideoFrameId,
    Raw,
}

impl PinKind {
    /// Raw pins connect to anything. Video frame ids only travel between
    /// video frame id pins. Audio, control voltage and gates interconnect.
    pub fn can_feed(self, input: PinKind) -> bool {
        match (self, input) {
            (PinKind::Raw, _) | (_, PinKind::Raw) => true,
            (PinKind::VideoFrameId, other) | (other, PinKind::VideoFrameId) => {
                other == PinKind::VideoFrameId
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Named group of channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusInfo {
    pub name: String,
    pub channels: usize,
    pub kind: PinKind,
}

impl BusInfo {
    pub fn new(name: impl Into<String>, channels: usize, kind: PinKind) -> Self {
        Self {
            name: name.into(),
            channels,
            kind,
        }
    }
}

/// Declared buses of a module. Fixed for one preparation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusLayout {
    pub inputs: Vec<BusInfo>,
    pub outputs: Vec<BusInfo>,
}

impl BusLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, bus: BusInfo) -> Self {
        self.inputs.push(bus);
        self
    }

    pub fn with_output(mut self, bus: BusInfo) -> Self {
        self.outputs.push(bus);
        self
    }

    pub fn input_channels(&self) -> usize {
        self.inputs.iter().map(|bus| bus.channels).sum()
    }

    pub fn output_channels(&self) -> usize {
        self.outputs.iter().map(|bus| bus.channels).sum()
    }

    pub fn channels(&self, direction: Direction) -> usize {
        match direction {
            Direction::Input => self.input_channels(),
            Direction::Output => self.output_channels(),
        }
    }

    /// Flat channel index of `channel` within input bus `bus`.
    pub fn flat_input(&self, bus: usize, channel: usize) -> Option<usize> {
        flat_index(&self.inputs, bus, channel)
    }

    /// Kind of the flat channel, if it exists.
    pub fn kind_of(&self, direction: Direction, flat: usize) -> Option<PinKind> {
        let buses = match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        };
        let mut start = 0;
        for bus in buses {
            if flat < start + bus.channels {
                return Some(bus.kind);
            }
            start += bus.channels;
        }
        None
    }
}

fn flat_index(buses: &[BusInfo], bus: usize, channel: usize) -> Option<usize> {
    let target = buses.get(bus)?;
    if channel >= target.channels {
        return None;
    }
    let offset: usize = buses[..bus].iter().map(|bus| bus.channels).sum();
    Some(offset + channel)
}

/// One connectable channel as presented to a patching surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinInfo {
    pub name: String,
    pub channel: usize,
    pub kind: PinKind,
}

/// Pins derived from bus declarations, one per channel.
pub fn pins_for(buses: &[BusInfo]) -> Vec<PinInfo> {
    let mut pins = Vec::new();
    let mut channel = 0;
    for bus in buses {
        for index in 0..bus.channels {
            let name = if bus.channels == 1 {
                bus.name.clone()
            } else {
                format!("{} {}", bus.name, index + 1)
            };
            pins.push(PinInfo {
                name,
                channel,
                kind: bus.kind,
            });
            channel += 1;
        }
    }
    pins
}

/// How an audio-rate signal routed onto a parameter is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModulationMode {
    /// The signal replaces the base value.
    Absolute,
    /// `base + signal * (max - min) / 2`, clamped to the range.
    Relative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub default: f32,
    pub min: f32,
    pub max: f32,
    pub modulation: ModulationMode,
}

impl ParameterSpec {
    /// Bounds given in either order are sorted. A NaN bound takes the other
    /// bound's value.
    pub fn new(name: impl Into<String>, default: f32, min: f32, max: f32) -> Self {
        debug_assert!(!(min.is_nan() && max.is_nan()), "parameter without bounds");
        let (min, max) = (min.min(max), min.max(max));
        Self {
            name: name.into(),
            default: bounded(default, min, max),
            min,
            max,
            modulation: ModulationMode::Absolute,
        }
    }

    pub fn relative(mut self) -> Self {
        self.modulation = ModulationMode::Relative;
        self
    }

    pub fn clamp(&self, value: f32) -> f32 {
        if value.is_nan() {
            self.default
        } else {
            bounded(value, self.min, self.max)
        }
    }
}

/// `clamp` that tolerates inverted or NaN bounds instead of panicking.
#[inline]
fn bounded(value: f32, min: f32, max: f32) -> f32 {
    value.max(min).min(max)
}

/// Audio-rate input a parameter is exposed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterRoute {
    pub bus: usize,
    pub channel: usize,
}

/// Control-rate parameter values shared between the control side and the
/// audio thread.
#[derive(Debug)]
pub struct ParameterBank {
    specs: Vec<ParameterSpec>,
    values: Vec<AtomicF32>,
}

impl ParameterBank {
    pub fn new(specs: Vec<ParameterSpec>) -> Self {
        let values = specs.iter().map(|spec| AtomicF32::new(spec.default)).collect();
        Self { specs, values }
    }

    pub fn specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.specs.iter().position(|spec| spec.name == name)
    }

    pub fn get(&self, index: usize) -> f32 {
        self.values
            .get(index)
            .map(|value| value.load(Ordering::Relaxed))
            .unwrap_or_default()
    }

    /// Stores a clamped value. Returns `false` for an unknown index.
    pub fn set(&self, index: usize, value: f32) -> bool {
        match (self.specs.get(index), self.values.get(index)) {
            (Some(spec), Some(slot)) => {
                slot.store(spec.clamp(value), Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<(String, f32)> {
        self.specs
            .iter()
            .enumerate()
            .map(|(index, spec)| (spec.name.clone(), self.get(index)))
            .collect()
    }
}

/// Per-sample view of one parameter for the current block.
#[derive(Debug, Clone, Copy)]
pub struct ParamSignal<'a> {
    base: f32,
    min: f32,
    max: f32,
    mode: ModulationMode,
    audio: Option<&'a [f32]>,
}

impl<'a> ParamSignal<'a> {
    pub fn constant(value: f32) -> Self {
        Self {
            base: value,
            min: f32::MIN,
            max: f32::MAX,
            mode: ModulationMode::Absolute,
            audio: None,
        }
    }

    /// Control-rate value set by the control side.
    pub fn base(&self) -> f32 {
        self.base
    }

    pub fn is_modulated(&self) -> bool {
        self.audio.is_some()
    }

    #[inline]
    pub fn at(&self, frame: usize) -> f32 {
        let Some(sample) = self.audio.and_then(|audio| audio.get(frame).copied()) else {
            return self.base;
        };
        match self.mode {
            ModulationMode::Absolute => bounded(sample, self.min, self.max),
            ModulationMode::Relative => {
                bounded(self.base + sample * (self.max - self.min) * 0.5, self.min, self.max)
            }
        }
    }
}

/// Parameters of the module being processed, with their audio-rate routes
/// already resolved for this block.
#[derive(Debug, Clone, Copy)]
pub struct ParamView<'a> {
    pub bank: &'a ParameterBank,
    /// Flat input channel feeding each parameter, when one is connected.
    pub routes: &'a [Option<usize>],
    pub inputs: &'a [Vec<f32>],
}

impl<'a> ParamView<'a> {
    pub fn signal(&self, index: usize) -> ParamSignal<'a> {
        let Some(spec) = self.bank.specs().get(index) else {
            return ParamSignal::constant(0.0);
        };
        let audio = self
            .routes
            .get(index)
            .copied()
            .flatten()
            .and_then(|channel| self.inputs.get(channel))
            .map(|channel| channel.as_slice());
        ParamSignal {
            base: self.bank.get(index),
            min: spec.min,
            max: spec.max,
            mode: spec.modulation,
            audio,
        }
    }
}

/// Request to change the global subdivision override after this block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubdivisionClaim {
    Claim(f64),
    Release,
}

/// Timestamped event delivered with one block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModuleEvent {
    /// Sample offset within the block.
    pub offset: u32,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    NoteOn { note: u8, velocity: f32 },
    NoteOff { note: u8 },
    Trigger,
    Value { index: u32, value: f32 },
}

/// Everything a module sees for one block.
pub struct ProcessContext<'a> {
    pub id: ModuleId,
    pub frames: usize,
    pub sample_rate: f64,
    pub inputs: &'a [Vec<f32>],
    pub outputs: &'a mut [Vec<f32>],
    pub events: &'a [ModuleEvent],
    pub params: ParamView<'a>,
    pub claim: &'a mut Option<SubdivisionClaim>,
}

impl<'a> ProcessContext<'a> {
    /// Input channel limited to the block length. Missing channels read as
    /// an empty slice.
    pub fn input(&self, channel: usize) -> &'a [f32] {
        let inputs: &'a [Vec<f32>] = self.inputs;
        inputs
            .get(channel)
            .map(|samples| &samples[..self.frames.min(samples.len())])
            .unwrap_or(&[])
    }

    pub fn output(&mut self, channel: usize) -> &mut [f32] {
        let frames = self.frames;
        match self.outputs.get_mut(channel) {
            Some(samples) => {
                let len = frames.min(samples.len());
                &mut samples[..len]
            }
            None => &mut [],
        }
    }

    pub fn param(&self, index: usize) -> ParamSignal<'a> {
        self.params.signal(index)
    }

    /// Claims the global subdivision override for every synced module.
    pub fn claim_subdivision(&mut self, steps_per_beat: f64) {
        *self.claim = Some(SubdivisionClaim::Claim(steps_per_beat));
    }

    pub fn release_subdivision(&mut self) {
        *self.claim = Some(SubdivisionClaim::Release);
    }
}

/// Static facts a module declares about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub type_name: String,
    pub play_edge: PlayEdgePolicy,
    pub clock: ClockSource,
    /// Reads its inputs one block late, so it may close a feedback loop.
    pub feedback_delay: bool,
}

impl ModuleDescriptor {
    pub fn new(type_name: impl Into<String>, play_edge: PlayEdgePolicy) -> Self {
        Self {
            type_name: type_name.into(),
            play_edge,
            clock: ClockSource::Shared,
            feedback_delay: false,
        }
    }

    pub fn with_clock(mut self, clock: ClockSource) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_feedback_delay(mut self) -> Self {
        self.feedback_delay = true;
        self
    }
}

/// Role of a bridge module inside a nested graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeRole {
    Inlet { channels: usize },
    Outlet { channels: usize },
}

/// Handle given to a module when it joins an engine.
#[derive(Debug, Clone)]
pub struct ModuleHost {
    id: ModuleId,
    engine: Weak<Shared>,
}

impl ModuleHost {
    pub(crate) fn new(id: ModuleId, engine: Weak<Shared>) -> Self {
        Self { id, engine }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Tells the owning engine that this module's bus layout changed, so the
    /// topology is re-committed around it.
    pub fn notify_layout_changed(&self) {
        if let Some(shared) = self.engine.upgrade() {
            crate::engine::Engine::from_shared(shared).refresh_module(self.id);
        }
    }
}

/// Closed capability interface implemented by every module kind.
pub trait Module: Send {
    fn descriptor(&self) -> ModuleDescriptor;

    fn layout(&self) -> BusLayout;

    fn parameters(&self) -> Vec<ParameterSpec> {
        Vec::new()
    }

    fn on_attach(&mut self, _host: ModuleHost) {}

    /// Called before the first block and whenever sample rate, block size or
    /// layout change. A failing module is kept but stays silent.
    fn prepare(&mut self, config: &PrepareConfig) -> Result<(), ModuleError>;

    fn release_resources(&mut self) {}

    /// Receives a copy of the transport once per block, before
    /// [`Module::process_block`].
    fn set_timing_info(&mut self, _transport: &TransportState) {}

    /// Must not allocate, lock or wait.
    fn process_block(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError>;

    fn parameter_routing(&self, _parameter: &str) -> Option<ParameterRoute> {
        None
    }

    fn dynamic_input_pins(&self) -> Vec<PinInfo> {
        pins_for(&self.layout().inputs)
    }

    fn dynamic_output_pins(&self) -> Vec<PinInfo> {
        pins_for(&self.layout().outputs)
    }

    fn bridge(&self) -> Option<BridgeRole> {
        None
    }

    fn save_state(&self) -> StateTree {
        StateTree::new(self.descriptor().type_name)
    }

    fn load_state(&mut self, _state: &StateTree) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Problems the last [`Module::load_state`] worked around instead of
    /// failing on, such as skipped entries of a nested patch.
    fn take_load_issues(&mut self) -> Vec<Issue> {
        Vec::new()
    }
}
