//! Audio-thread side of the engine.
//!
//! Each block the renderer loads the current plan with one atomic load,
//! hands the transport to every module and runs them in plan order. It never
//! waits: a module whose state is held by the control side is skipped for
//! that block and reads as silence.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use patchbay_rt::{ModuleId, TransportRequest, TransportState};
use rtrb::Consumer;

use crate::buffer::{silence, AudioBuffer};
use crate::engine::{ModuleFailure, Shared};
use crate::module::{ParamView, ProcessContext, SubdivisionClaim};
use crate::plan::{HostWindow, ProcessingPlan};
use crate::slot::ModuleRuntime;

pub struct Renderer {
    shared: Arc<Shared>,
    commands: Consumer<TransportRequest>,
    transport: TransportState,
}

impl Renderer {
    pub(crate) fn new(shared: Arc<Shared>, commands: Consumer<TransportRequest>) -> Self {
        Self {
            shared,
            commands,
            transport: TransportState::default(),
        }
    }

    pub fn transport(&self) -> &TransportState {
        &self.transport
    }

    /// Runs one block. `inputs` feed the inlet modules and `outputs` receive
    /// the outlet modules, both in module id order.
    pub fn process(&mut self, inputs: &[Vec<f32>], outputs: &mut [Vec<f32>], frames: usize) {
        while let Ok(request) = self.commands.pop() {
            self.transport.apply(request);
        }

        let plan = self.shared.plan.load();
        if let Some(config) = plan.config() {
            if self.transport.sample_rate() != config.sample_rate {
                self.transport.set_sample_rate(config.sample_rate);
            }
        }
        let transport = self.transport;
        let claimed = render(&self.shared, &plan, &transport, inputs, outputs, frames);
        drop(plan);

        if let Some((owner, claim)) = claimed {
            match claim {
                SubdivisionClaim::Claim(steps) => self.transport.claim_subdivision(owner, steps),
                SubdivisionClaim::Release => {
                    self.transport.release_subdivision(owner);
                }
            }
        }
        self.transport.advance(frames);

        let shared = &self.shared;
        shared
            .playing
            .store(self.transport.is_playing(), Ordering::Release);
        shared
            .position_samples
            .store(self.transport.position_samples(), Ordering::Release);
        shared.bpm.store(self.transport.bpm(), Ordering::Release);
    }

    pub fn process_buffers(&mut self, inputs: &AudioBuffer, outputs: &mut AudioBuffer) {
        let frames = outputs.frames();
        self.process(inputs.as_slice(), outputs.as_mut_slice(), frames);
    }

    /// Runs one block on a transport owned by an enclosing graph. Requests
    /// sent to this engine's own transport are discarded. Returns the
    /// subdivision claim made inside, if any.
    pub fn process_slaved(
        &mut self,
        transport: &TransportState,
        inputs: &[Vec<f32>],
        outputs: &mut [Vec<f32>],
        frames: usize,
    ) -> Option<SubdivisionClaim> {
        while self.commands.pop().is_ok() {}
        let plan = self.shared.plan.load();
        let claimed = render(&self.shared, &plan, transport, inputs, outputs, frames);
        drop(plan);
        claimed.map(|(_, claim)| claim)
    }
}

fn render(
    shared: &Shared,
    plan: &ProcessingPlan,
    transport: &TransportState,
    inputs: &[Vec<f32>],
    outputs: &mut [Vec<f32>],
    frames: usize,
) -> Option<(ModuleId, SubdivisionClaim)> {
    silence(outputs, frames);
    let config = plan.config()?;
    shared.mark_running();
    let frames = frames.min(config.block_size);
    let mut claimed = None;

    for (index, node) in plan.nodes.iter().enumerate() {
        let Some(mut guard) = node.slot.runtime.try_lock() else {
            continue;
        };
        let runtime = &mut *guard;
        if !node.deferred {
            gather(plan, index, runtime, frames);
        }
        if let Some(window) = node.inlet {
            copy_window(inputs, window, &mut runtime.outputs, frames);
        }
        if let Some(window) = node.outlet {
            write_window(&runtime.inputs, window, outputs, frames);
        }

        if !node.slot.is_ready() || runtime.prepared != Some(config) {
            silence(&mut runtime.outputs, frames);
            continue;
        }

        runtime.events.clear();
        while runtime.events.len() < runtime.events.capacity() {
            match node.slot.events.pop() {
                Some(event) => runtime.events.push(event),
                None => break,
            }
        }

        let ModuleRuntime {
            module,
            inputs: module_inputs,
            outputs: module_outputs,
            events,
            ..
        } = runtime;
        let module_inputs: &[Vec<f32>] = module_inputs;
        let mut claim = None;
        module.set_timing_info(transport);
        let mut ctx = ProcessContext {
            id: node.slot.id,
            frames,
            sample_rate: config.sample_rate,
            inputs: module_inputs,
            outputs: &mut module_outputs[..],
            events: events.as_slice(),
            params: ParamView {
                bank: &node.slot.params,
                routes: &node.routes,
                inputs: module_inputs,
            },
            claim: &mut claim,
        };
        if let Err(error) = module.process_block(&mut ctx) {
            node.slot.mark_not_ready();
            silence(module_outputs, frames);
            let _ = shared.failures.push(ModuleFailure {
                module: node.slot.id,
                error,
            });
        }
        if let Some(claim) = claim {
            claimed = Some((node.slot.id, claim));
        }
    }

    // Delay modules read what arrived during this block on the next one.
    for (index, node) in plan.nodes.iter().enumerate() {
        if !node.deferred {
            continue;
        }
        if let Some(mut guard) = node.slot.runtime.try_lock() {
            gather(plan, index, &mut guard, frames);
        }
    }
    claimed
}

/// Sums every feed of node `index` into its input channels.
fn gather(plan: &ProcessingPlan, index: usize, runtime: &mut ModuleRuntime, frames: usize) {
    silence(&mut runtime.inputs, frames);
    let Some(node) = plan.nodes.get(index) else {
        return;
    };
    for feed in &node.feeds {
        if feed.src == index {
            let (Some(dst), Some(src)) = (
                runtime.inputs.get_mut(feed.dst_channel),
                runtime.outputs.get(feed.src_channel),
            ) else {
                continue;
            };
            mix(dst, src, frames);
            continue;
        }
        let Some(source) = plan.nodes.get(feed.src) else {
            continue;
        };
        let Some(source) = source.slot.runtime.try_lock() else {
            continue;
        };
        let (Some(dst), Some(src)) = (
            runtime.inputs.get_mut(feed.dst_channel),
            source.outputs.get(feed.src_channel),
        ) else {
            continue;
        };
        mix(dst, src, frames);
    }
}

#[inline]
fn mix(dst: &mut [f32], src: &[f32], frames: usize) {
    let len = frames.min(dst.len()).min(src.len());
    for (out, sample) in dst[..len].iter_mut().zip(&src[..len]) {
        *out += *sample;
    }
}

fn copy_window(host: &[Vec<f32>], window: HostWindow, channels: &mut [Vec<f32>], frames: usize) {
    for (offset, channel) in channels.iter_mut().take(window.channels).enumerate() {
        let len = frames.min(channel.len());
        match host.get(window.offset + offset) {
            Some(source) => {
                let len = len.min(source.len());
                channel[..len].copy_from_slice(&source[..len]);
                channel[len..].fill(0.0);
            }
            None => channel[..len].fill(0.0),
        }
    }
}

fn write_window(channels: &[Vec<f32>], window: HostWindow, host: &mut [Vec<f32>], frames: usize) {
    for (offset, channel) in channels.iter().take(window.channels).enumerate() {
        let Some(target) = host.get_mut(window.offset + offset) else {
            break;
        };
        mix(target, channel, frames);
    }
}
