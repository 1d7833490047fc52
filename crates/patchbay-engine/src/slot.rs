use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use patchbay_rt::ModuleId;

use crate::buffer::allocate_channels;
use crate::config::PrepareConfig;
use crate::error::ModuleError;
use crate::module::{BusLayout, Module, ModuleDescriptor, ModuleEvent, ParameterBank};

/// Mutable side of a module, touched by the audio thread only through
/// `try_lock` so it never waits on the control side.
pub(crate) struct ModuleRuntime {
    pub module: Box<dyn Module>,
    pub inputs: Vec<Vec<f32>>,
    pub outputs: Vec<Vec<f32>>,
    pub events: Vec<ModuleEvent>,
    pub prepared: Option<PrepareConfig>,
}

/// One module instance shared by the registry, every plan that contains it,
/// and the control side.
pub(crate) struct ModuleSlot {
    pub id: ModuleId,
    pub descriptor: ModuleDescriptor,
    pub params: ParameterBank,
    pub runtime: Mutex<ModuleRuntime>,
    pub events: ArrayQueue<ModuleEvent>,
    ready: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl ModuleSlot {
    pub fn new(id: ModuleId, module: Box<dyn Module>, event_capacity: usize) -> Self {
        let descriptor = module.descriptor();
        let params = ParameterBank::new(module.parameters());
        let event_capacity = event_capacity.max(1);
        Self {
            id,
            descriptor,
            params,
            runtime: Mutex::new(ModuleRuntime {
                module,
                inputs: Vec::new(),
                outputs: Vec::new(),
                events: Vec::with_capacity(event_capacity),
                prepared: None,
            }),
            events: ArrayQueue::new(event_capacity),
            ready: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.descriptor.type_name
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_not_ready(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn record_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    /// Prepares the module and sizes its buffers from the layout it reports
    /// afterwards. A failure leaves the module silent.
    pub fn prepare(&self, config: PrepareConfig) -> (BusLayout, Result<(), ModuleError>) {
        let mut runtime = self.runtime.lock();
        self.mark_not_ready();
        let result = runtime.module.prepare(&config);
        let layout = runtime.module.layout();
        runtime.inputs = allocate_channels(layout.input_channels(), config.block_size);
        runtime.outputs = allocate_channels(layout.output_channels(), config.block_size);
        runtime.prepared = Some(config);
        match &result {
            Ok(()) => {
                *self.last_error.lock() = None;
                self.ready.store(true, Ordering::Release);
            }
            Err(err) => self.record_error(err.to_string()),
        }
        (layout, result)
    }

    pub fn needs_prepare(&self, config: PrepareConfig) -> bool {
        self.runtime.lock().prepared != Some(config)
    }

    pub fn invalidate(&self) {
        self.runtime.lock().prepared = None;
    }

    /// Final teardown once the module left the graph.
    pub fn release(&self) {
        self.mark_not_ready();
        let mut runtime = self.runtime.lock();
        runtime.module.release_resources();
        runtime.prepared = None;
    }
}
