//! Hierarchical, human-inspectable patch state and its JSON file format.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use patchbay_rt::ModuleId;
use serde::{Deserialize, Serialize};

use crate::error::{Issue, StateError};
use crate::factory::ModuleFactory;
use crate::graph::Connection;
use crate::module::Direction;

pub const PATCH_VERSION: u32 = 1;

/// Typed value stored in a [`StateTree`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Floats(Vec<f32>),
    Patch(Box<PatchState>),
}

/// Opaque per-module state: typed properties plus child trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTree {
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, StateValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StateTree>,
}

impl StateTree {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            properties: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: StateValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_child(mut self, child: StateTree) -> Self {
        self.children.push(child);
        self
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.properties.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            StateValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            StateValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            StateValue::Float(value) => Some(*value),
            StateValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn get_floats(&self, key: &str) -> Option<&[f32]> {
        match self.get(key)? {
            StateValue::Floats(values) => Some(values),
            _ => None,
        }
    }

    pub fn get_patch(&self, key: &str) -> Option<&PatchState> {
        match self.get(key)? {
            StateValue::Patch(patch) => Some(patch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleState {
    pub id: ModuleId,
    pub type_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, f32>,
    pub state: StateTree,
}

/// Complete topology of one engine. Sub-patches nest another `PatchState`
/// inside their module state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchState {
    pub version: u32,
    pub modules: Vec<ModuleState>,
    pub connections: Vec<Connection>,
}

impl Default for PatchState {
    fn default() -> Self {
        Self {
            version: PATCH_VERSION,
            modules: Vec::new(),
            connections: Vec::new(),
        }
    }
}

impl PatchState {
    pub fn module(&self, id: ModuleId) -> Option<&ModuleState> {
        self.modules.iter().find(|module| module.id == id)
    }
}

pub fn parse_patch(bytes: &[u8]) -> Result<PatchState, StateError> {
    let patch: PatchState = serde_json::from_slice(bytes)?;
    if patch.version > PATCH_VERSION {
        return Err(StateError::UnsupportedVersion(patch.version));
    }
    Ok(patch)
}

pub fn load_patch(path: impl AsRef<Path>) -> Result<PatchState, StateError> {
    let bytes = fs::read(path.as_ref())?;
    parse_patch(&bytes)
}

/// Writes the patch as pretty JSON through a temporary file and a rename so
/// a crash never leaves a truncated patch behind.
pub fn save_patch(path: impl AsRef<Path>, patch: &PatchState) -> Result<(), StateError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_vec_pretty(patch)?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    tracing::debug!(path = %path.display(), modules = patch.modules.len(), "saved patch");
    Ok(())
}

/// Checks a patch against the known module types without touching any
/// engine. Problems come back as issues, never as panics.
pub fn validate_patch(patch: &PatchState, factory: &ModuleFactory) -> Vec<Issue> {
    let mut issues = Vec::new();
    if patch.version > PATCH_VERSION {
        issues.push(Issue::error(format!(
            "patch version {} is newer than supported version {PATCH_VERSION}",
            patch.version
        )));
    }

    let mut layouts = BTreeMap::new();
    let mut seen = BTreeSet::new();
    for module in &patch.modules {
        if module.id.is_unset() {
            issues.push(Issue::error(format!("module `{}` has no id", module.type_name)));
            continue;
        }
        if !seen.insert(module.id) {
            issues.push(Issue::error(format!("duplicate module id {}", module.id)));
            continue;
        }
        match factory.create(&module.type_name) {
            Ok(mut instance) => {
                if let Err(err) = instance.load_state(&module.state) {
                    issues.push(Issue::warning(format!("module {}: {err}", module.id)));
                }
                layouts.insert(module.id, instance.layout());
            }
            Err(err) => issues.push(Issue::error(format!("module {}: {err}", module.id))),
        }

        let context = format!("module {}", module.id);
        let mut nested = Vec::new();
        nested_patches(&module.state, &mut nested);
        for patch in nested {
            issues.extend(
                validate_patch(patch, factory)
                    .into_iter()
                    .map(|issue| issue.within(&context)),
            );
        }
    }

    for connection in &patch.connections {
        let endpoints = [
            (connection.src, connection.src_channel, Direction::Output),
            (connection.dst, connection.dst_channel, Direction::Input),
        ];
        for (module, channel, direction) in endpoints {
            if !seen.contains(&module) {
                issues.push(Issue::error(format!(
                    "connection {connection} references missing module {module}"
                )));
                continue;
            }
            let Some(layout) = layouts.get(&module) else {
                continue;
            };
            let available = layout.channels(direction);
            if channel >= available {
                issues.push(Issue::error(format!(
                    "connection {connection}: {direction} channel {channel} out of range ({available} available)"
                )));
            }
        }
    }
    issues
}

/// Every patch stored anywhere in `tree`, children included.
fn nested_patches<'a>(tree: &'a StateTree, found: &mut Vec<&'a PatchState>) {
    for value in tree.properties.values() {
        if let StateValue::Patch(patch) = value {
            found.push(&**patch);
        }
    }
    for child in &tree.children {
        nested_patches(child, found);
    }
}

/// Entry point for the patch loader fuzz target.
#[cfg(feature = "fuzzing")]
pub fn fuzz_parse_patch(data: &[u8]) {
    if let Ok(patch) = parse_patch(data) {
        let factory = ModuleFactory::with_builtins(Default::default());
        let _ = validate_patch(&patch, &factory);
    }
}
