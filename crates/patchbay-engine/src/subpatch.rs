//! A module whose body is a complete nested engine.
//!
//! The nested graph talks to the enclosing one through inlet and outlet
//! modules. Each inlet becomes an input bus of the sub-patch, each outlet an
//! output bus, in id order. Editing the nested graph so that this layout
//! changes re-commits the enclosing graph.

use std::sync::Arc;

use patchbay_rt::{PlayEdgePolicy, TransportState};

use crate::config::PrepareConfig;
use crate::engine::Engine;
use crate::error::{Issue, ModuleError, ProcessError};
use crate::factory::ModuleFactory;
use crate::module::{
    BusInfo, BusLayout, Module, ModuleDescriptor, ModuleHost, PinKind, ProcessContext,
};
use crate::renderer::Renderer;
use crate::state::{StateTree, StateValue};

pub const SUB_PATCH: &str = "sub-patch";

pub struct SubPatch {
    engine: Engine,
    renderer: Option<Renderer>,
    transport: TransportState,
    load_issues: Vec<Issue>,
}

impl SubPatch {
    pub fn new(factory: Arc<ModuleFactory>) -> Self {
        let engine = Engine::new(factory);
        let renderer = engine.renderer();
        Self {
            engine,
            renderer,
            transport: TransportState::default(),
            load_issues: Vec::new(),
        }
    }

    /// The nested engine, for editing the inner patch.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl Module for SubPatch {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new(SUB_PATCH, PlayEdgePolicy::Continue)
    }

    fn layout(&self) -> BusLayout {
        let bridges = self.engine.bridge_layout();
        let mut layout = BusLayout::new();
        for (index, channels) in bridges.inlets.iter().enumerate() {
            layout = layout.with_input(BusInfo::new(format!("in {}", index + 1), *channels, PinKind::Raw));
        }
        for (index, channels) in bridges.outlets.iter().enumerate() {
            layout = layout.with_output(BusInfo::new(format!("out {}", index + 1), *channels, PinKind::Raw));
        }
        layout
    }

    fn on_attach(&mut self, host: ModuleHost) {
        self.engine
            .set_layout_listener(move || host.notify_layout_changed());
    }

    fn prepare(&mut self, config: &PrepareConfig) -> Result<(), ModuleError> {
        let report = self
            .engine
            .prepare(config.sample_rate, config.block_size)
            .map_err(|err| ModuleError::Prepare(err.to_string()))?;
        for issue in &report.issues {
            tracing::warn!(%issue, "nested patch");
        }
        if self.renderer.is_none() {
            return Err(ModuleError::MissingResource("nested renderer".into()));
        }
        Ok(())
    }

    fn release_resources(&mut self) {
        self.engine.shutdown();
    }

    fn set_timing_info(&mut self, transport: &TransportState) {
        self.transport = *transport;
    }

    fn process_block(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let renderer = self
            .renderer
            .as_mut()
            .ok_or(ProcessError("sub-patch has no renderer"))?;
        let inputs: &[Vec<f32>] = ctx.inputs;
        let claim = renderer.process_slaved(&self.transport, inputs, ctx.outputs, ctx.frames);
        if claim.is_some() {
            *ctx.claim = claim;
        }
        Ok(())
    }

    fn save_state(&self) -> StateTree {
        StateTree::new(SUB_PATCH).with(
            "patch",
            StateValue::Patch(Box::new(self.engine.save_state())),
        )
    }

    fn load_state(&mut self, state: &StateTree) -> Result<(), ModuleError> {
        let patch = state
            .get_patch("patch")
            .ok_or_else(|| ModuleError::State("sub-patch state has no nested patch".into()))?;
        let report = self
            .engine
            .load_state(patch)
            .map_err(|err| ModuleError::State(err.to_string()))?;
        self.load_issues = report.issues;
        Ok(())
    }

    fn take_load_issues(&mut self) -> Vec<Issue> {
        std::mem::take(&mut self.load_issues)
    }
}
