use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use patchbay_rt::{LatestSource, PlayEdgePolicy};

use crate::config::EngineConfig;
use crate::error::GraphError;
use crate::module::Module;
use crate::nodes::{
    ClipPlayer, FrameFollower, Gain, Inlet, Outlet, PhaseRamp, SineOscillator, SubdivisionMaster,
    UnitDelay,
};
use crate::subpatch::SubPatch;

type Constructor = dyn Fn(&ModuleFactory) -> Box<dyn Module> + Send + Sync;

/// Registry of known module types. Used to create modules by name, to
/// validate and load saved patches, and by sub-patches to build their
/// nested graphs.
#[derive(Clone)]
pub struct ModuleFactory {
    constructors: BTreeMap<String, Arc<Constructor>>,
    config: EngineConfig,
}

impl fmt::Debug for ModuleFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleFactory")
            .field("types", &self.constructors.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}

impl ModuleFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            constructors: BTreeMap::new(),
            config,
        }
    }

    /// Factory with every built-in module type registered.
    pub fn with_builtins(config: EngineConfig) -> Self {
        let mut factory = Self::new(config);
        factory.register("sine", |_| Box::new(SineOscillator::new()));
        factory.register("gain", |_| Box::new(Gain::new()));
        factory.register("ramp", |_| Box::new(PhaseRamp::new(PlayEdgePolicy::Restart)));
        factory.register("free-ramp", |_| {
            Box::new(PhaseRamp::new(PlayEdgePolicy::Continue))
        });
        factory.register("clock-master", |_| Box::new(SubdivisionMaster::new()));
        factory.register("unit-delay", |_| Box::new(UnitDelay::new(1)));
        factory.register("clip-player", |_| Box::new(ClipPlayer::new()));
        factory.register("inlet", |_| Box::new(Inlet::new(1)));
        factory.register("outlet", |_| Box::new(Outlet::new(1)));
        factory.register("sub-patch", |factory| {
            Box::new(SubPatch::new(Arc::new(factory.clone())))
        });
        factory
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn register<F>(&mut self, type_name: impl Into<String>, constructor: F)
    where
        F: Fn(&ModuleFactory) -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_name.into(), Arc::new(constructor));
    }

    /// Registers `frame-follower`, which tracks results of `source` through
    /// a background worker.
    pub fn register_frame_source(&mut self, source: Arc<dyn LatestSource<f32>>) {
        self.register("frame-follower", move |_| {
            Box::new(FrameFollower::new(Arc::clone(&source)))
        });
    }

    pub fn knows(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn create(&self, type_name: &str) -> Result<Box<dyn Module>, GraphError> {
        let constructor = self
            .constructors
            .get(type_name)
            .ok_or_else(|| GraphError::UnknownType(type_name.to_string()))?;
        Ok(constructor(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_registered_types_only() {
        let factory = ModuleFactory::with_builtins(EngineConfig::default());
        assert!(factory.knows("sub-patch"));
        assert!(!factory.knows("frame-follower"));
        let sine = factory.create("sine").unwrap();
        assert_eq!(sine.descriptor().type_name, "sine");
        assert_eq!(
            factory.create("theremin").err(),
            Some(GraphError::UnknownType("theremin".into()))
        );
    }
}
