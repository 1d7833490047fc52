//! The graph engine: staged mutations, the commit protocol and the
//! control-side API.
//!
//! Mutations are staged and only take effect on commit. A commit copies the
//! registry inside a short critical section, then sorts, validates and
//! prepares on the copy without holding any lock the audio thread could
//! want, and finally publishes a new immutable [`ProcessingPlan`] with a
//! single atomic swap. Commits requested while another one runs are
//! coalesced into the running loop.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use atomic_float::AtomicF64;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use patchbay_rt::{IngressQueue, ModuleId, TransportCommand, TransportRequest};
use rtrb::{Consumer, Producer, RingBuffer};
use serde::{Deserialize, Serialize};

use crate::command::ControlCommand;
use crate::config::{EngineConfig, PrepareConfig};
use crate::error::{GraphError, Issue, ProcessError};
use crate::factory::ModuleFactory;
use crate::graph::{Connection, Entry, Registry};
use crate::module::{BridgeRole, BusLayout, Module, ModuleEvent, ModuleHost, PinInfo};
use crate::plan::ProcessingPlan;
use crate::renderer::Renderer;
use crate::slot::ModuleSlot;
use crate::state::{ModuleState, PatchState, StateTree, PATCH_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// No plan published yet.
    Idle,
    /// Sample rate and block size known, plan published.
    Prepared,
    /// The audio callback is pulling plans.
    Running,
    /// Teardown in progress, no new plans accepted.
    Draining,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Idle,
            1 => EngineState::Prepared,
            2 => EngineState::Running,
            _ => EngineState::Draining,
        }
    }
}

/// Outcome of one call to [`Engine::commit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReport {
    pub generation: u64,
    pub issues: Vec<Issue>,
    /// Another commit was running and will apply the staged mutations.
    pub deferred: bool,
}

impl CommitReport {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(Issue::is_error)
    }

    fn merge(&mut self, other: CommitReport) {
        self.generation = other.generation;
        self.issues.extend(other.issues);
        self.deferred = false;
    }
}

/// Issues found while loading a patch, plus the commit that published it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub issues: Vec<Issue>,
    pub generation: u64,
}

impl LoadReport {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(Issue::is_error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub type_name: String,
}

/// Readiness of one module as shown to the control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStatus {
    pub id: ModuleId,
    pub type_name: String,
    pub ready: bool,
    pub last_error: Option<String>,
}

/// Failure reported by the audio thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleFailure {
    pub module: ModuleId,
    pub error: ProcessError,
}

/// Channel widths of the inlet and outlet modules, in id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeLayout {
    pub inlets: Vec<usize>,
    pub outlets: Vec<usize>,
}

/// Last transport state the audio thread reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportSnapshot {
    pub playing: bool,
    pub position_samples: u64,
    pub bpm: f64,
}

pub(crate) enum Mutation {
    Add(Arc<ModuleSlot>),
    Remove(ModuleId),
    Connect(Connection),
    Disconnect(Connection),
    Refresh(ModuleId),
    Replace {
        modules: Vec<Arc<ModuleSlot>>,
        connections: Vec<Connection>,
    },
}

type LayoutListener = Box<dyn Fn() + Send + Sync>;

pub(crate) struct Shared {
    pub config: EngineConfig,
    factory: Arc<ModuleFactory>,
    registry: Mutex<Registry>,
    staged: Mutex<Vec<Mutation>>,
    commit_lock: Mutex<()>,
    commit_requested: AtomicBool,
    pub plan: ArcSwap<ProcessingPlan>,
    retired: Mutex<Vec<Arc<ProcessingPlan>>>,
    state: AtomicU8,
    prepare_config: Mutex<Option<PrepareConfig>>,
    generation: AtomicU64,
    next_id: AtomicU32,
    pub failures: ArrayQueue<ModuleFailure>,
    transport_tx: Mutex<Producer<TransportRequest>>,
    transport_rx: Mutex<Option<Consumer<TransportRequest>>>,
    pub playing: AtomicBool,
    pub position_samples: AtomicU64,
    pub bpm: AtomicF64,
    bridges: Mutex<BridgeLayout>,
    layout_listener: Mutex<Option<LayoutListener>>,
}

impl Shared {
    pub fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            EngineState::Prepared as u8,
            EngineState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Control-side handle to one engine instance. Cloning yields another
/// handle to the same engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn new(factory: Arc<ModuleFactory>) -> Self {
        let config = factory.config().clone();
        let (transport_tx, transport_rx) = RingBuffer::new(config.transport_capacity.max(1));
        let shared = Shared {
            failures: ArrayQueue::new(config.failure_capacity.max(1)),
            config,
            factory,
            registry: Mutex::new(Registry::default()),
            staged: Mutex::new(Vec::new()),
            commit_lock: Mutex::new(()),
            commit_requested: AtomicBool::new(false),
            plan: ArcSwap::from_pointee(ProcessingPlan::empty(0)),
            retired: Mutex::new(Vec::new()),
            state: AtomicU8::new(EngineState::Idle as u8),
            prepare_config: Mutex::new(None),
            generation: AtomicU64::new(0),
            next_id: AtomicU32::new(1),
            transport_tx: Mutex::new(transport_tx),
            transport_rx: Mutex::new(Some(transport_rx)),
            playing: AtomicBool::new(false),
            position_samples: AtomicU64::new(0),
            bpm: AtomicF64::new(120.0),
            bridges: Mutex::new(BridgeLayout::default()),
            layout_listener: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn factory(&self) -> &Arc<ModuleFactory> {
        &self.shared.factory
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    pub fn prepare_config(&self) -> Option<PrepareConfig> {
        *self.shared.prepare_config.lock()
    }

    /// The audio-side renderer. There is exactly one per engine.
    pub fn renderer(&self) -> Option<Renderer> {
        let commands = self.shared.transport_rx.lock().take()?;
        Some(Renderer::new(Arc::clone(&self.shared), commands))
    }

    /// Currently published plan.
    pub fn plan(&self) -> Arc<ProcessingPlan> {
        self.shared.plan.load_full()
    }

    /// Called by the host whenever the layout of the nested inlets and
    /// outlets changes.
    pub fn set_layout_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        *self.shared.layout_listener.lock() = Some(Box::new(listener));
    }

    // Mutations

    /// Creates a module of a registered type. It joins the graph on the next
    /// commit.
    pub fn add_module(&self, type_name: &str) -> Result<ModuleId, GraphError> {
        let module = self.shared.factory.create(type_name)?;
        self.add_module_with_id(ModuleId::UNSET, module)
    }

    pub fn add_module_instance(&self, module: Box<dyn Module>) -> Result<ModuleId, GraphError> {
        self.add_module_with_id(ModuleId::UNSET, module)
    }

    /// Adds a module under a caller-chosen id. An unset id allocates one.
    pub fn add_module_with_id(
        &self,
        id: ModuleId,
        module: Box<dyn Module>,
    ) -> Result<ModuleId, GraphError> {
        self.ensure_accepting()?;
        let id = self.claim_id(id)?;
        let slot = self.attach(id, module);
        self.stage(Mutation::Add(slot));
        Ok(id)
    }

    fn claim_id(&self, id: ModuleId) -> Result<ModuleId, GraphError> {
        if id.is_unset() {
            return Ok(ModuleId(self.shared.next_id.fetch_add(1, Ordering::AcqRel)));
        }
        let taken = self.shared.registry.lock().contains(id)
            || self
                .shared
                .staged
                .lock()
                .iter()
                .any(|mutation| matches!(mutation, Mutation::Add(slot) if slot.id == id));
        if taken {
            return Err(GraphError::DuplicateModule(id));
        }
        self.shared
            .next_id
            .fetch_max(id.0.saturating_add(1), Ordering::AcqRel);
        Ok(id)
    }

    fn attach(&self, id: ModuleId, mut module: Box<dyn Module>) -> Arc<ModuleSlot> {
        module.on_attach(ModuleHost::new(id, Arc::downgrade(&self.shared)));
        Arc::new(ModuleSlot::new(
            id,
            module,
            self.shared.config.event_capacity,
        ))
    }

    pub fn remove_module(&self, id: ModuleId) {
        self.stage(Mutation::Remove(id));
    }

    pub fn connect(&self, connection: Connection) {
        self.stage(Mutation::Connect(connection));
    }

    pub fn disconnect(&self, connection: Connection) {
        self.stage(Mutation::Disconnect(connection));
    }

    /// Re-reads the layout of a module and commits around it.
    pub fn refresh_module(&self, id: ModuleId) {
        self.stage(Mutation::Refresh(id));
        if let Err(err) = self.commit() {
            tracing::debug!(module = %id, %err, "layout refresh not committed");
        }
    }

    fn stage(&self, mutation: Mutation) {
        self.shared.staged.lock().push(mutation);
    }

    fn ensure_accepting(&self) -> Result<(), GraphError> {
        if self.state() == EngineState::Draining {
            Err(GraphError::Draining)
        } else {
            Ok(())
        }
    }

    // Commit protocol

    /// Applies everything staged so far. When another commit is in flight
    /// the staged work is folded into it and the report is marked deferred.
    pub fn commit(&self) -> Result<CommitReport, GraphError> {
        self.ensure_accepting()?;
        let shared = &self.shared;
        shared.commit_requested.store(true, Ordering::Release);

        let mut report = CommitReport {
            generation: self.generation(),
            issues: Vec::new(),
            deferred: true,
        };
        loop {
            let Some(guard) = shared.commit_lock.try_lock() else {
                return Ok(report);
            };
            while shared.commit_requested.swap(false, Ordering::AcqRel) {
                report.merge(self.commit_once());
            }
            drop(guard);
            if !shared.commit_requested.load(Ordering::Acquire) {
                return Ok(report);
            }
        }
    }

    fn commit_once(&self) -> CommitReport {
        let shared = &self.shared;
        let policy = shared.config.feedback;
        let mutations = std::mem::take(&mut *shared.staged.lock());
        let config = *shared.prepare_config.lock();

        // The only section shared with other control callers: copy and go.
        let current = shared.registry.lock().clone();
        let mut next = current.clone();

        let mut issues = Vec::new();
        let mut removed: Vec<Arc<ModuleSlot>> = Vec::new();
        for mutation in mutations {
            apply_mutation(&mut next, mutation, policy, &mut issues, &mut removed);
        }

        if let Some(config) = config {
            for (id, entry) in next.modules.iter_mut() {
                if !entry.slot.needs_prepare(config) {
                    continue;
                }
                let (layout, result) = entry.slot.prepare(config);
                if let Err(err) = result {
                    tracing::warn!(module = %id, kind = entry.slot.type_name(), %err, "module failed to prepare");
                    issues.push(Issue::warning(format!("module {id} is not ready: {err}")));
                }
                if layout != *entry.layout {
                    *entry = describe(&entry.slot);
                }
            }
        }

        for connection in next.prune() {
            tracing::warn!(%connection, "pruned connection with a dangling endpoint");
            issues.push(Issue::warning(format!("removed dangling connection {connection}")));
        }

        let order = match next.topological_order(policy) {
            Ok(order) => order,
            Err(err) => {
                tracing::error!(%err, "commit rejected");
                issues.push(err.into());
                for (id, entry) in &next.modules {
                    let known = current
                        .modules
                        .get(id)
                        .is_some_and(|old| Arc::ptr_eq(&old.slot, &entry.slot));
                    if !known {
                        entry.slot.release();
                    }
                }
                return CommitReport {
                    generation: self.generation(),
                    issues,
                    deferred: false,
                };
            }
        };

        let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let bridges = bridge_layout(&next);
        let module_count = next.modules.len();
        let connection_count = next.connections.len();

        let publish = config.filter(|_| self.state() != EngineState::Draining);
        if let Some(config) = publish {
            let plan = ProcessingPlan::build(generation, config, &next, &order, policy);
            self.publish(plan);
        }
        *shared.registry.lock() = next;

        for slot in removed {
            let _ = shared
                .transport_tx
                .lock()
                .push(TransportRequest::ReleaseSubdivision { owner: slot.id });
            slot.release();
        }
        self.collect_retired();

        let changed = {
            let mut current = shared.bridges.lock();
            let changed = *current != bridges;
            *current = bridges;
            changed
        };
        if changed {
            if let Some(listener) = shared.layout_listener.lock().as_ref() {
                listener();
            }
        }

        tracing::debug!(
            generation,
            modules = module_count,
            connections = connection_count,
            published = publish.is_some(),
            "committed graph"
        );
        CommitReport {
            generation,
            issues,
            deferred: false,
        }
    }

    fn publish(&self, plan: ProcessingPlan) {
        let old = self.shared.plan.swap(Arc::new(plan));
        self.shared.retired.lock().push(old);
    }

    /// Frees retired plans the audio thread no longer holds, so the last
    /// reference is always dropped on the control side.
    fn collect_retired(&self) {
        self.shared
            .retired
            .lock()
            .retain(|plan| Arc::strong_count(plan) > 1);
    }

    /// Sets sample rate and block size and re-prepares every module.
    pub fn prepare(&self, sample_rate: f64, block_size: usize) -> Result<CommitReport, GraphError> {
        self.ensure_accepting()?;
        *self.shared.prepare_config.lock() = Some(PrepareConfig::new(sample_rate, block_size));
        let _ = self.shared.state.compare_exchange(
            EngineState::Idle as u8,
            EngineState::Prepared as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.commit()
    }

    /// Stops accepting plans, publishes an empty one and releases every
    /// module.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        shared
            .state
            .store(EngineState::Draining as u8, Ordering::Release);
        let _guard = shared.commit_lock.lock();
        shared.staged.lock().clear();
        self.publish(ProcessingPlan::empty(self.generation()));
        let slots: Vec<_> = shared
            .registry
            .lock()
            .modules
            .values()
            .map(|entry| Arc::clone(&entry.slot))
            .collect();
        for slot in slots {
            slot.release();
        }
        self.collect_retired();
        tracing::debug!("engine drained");
    }

    // Queries

    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.shared
            .registry
            .lock()
            .modules
            .values()
            .map(|entry| ModuleInfo {
                id: entry.slot.id,
                type_name: entry.slot.type_name().to_string(),
            })
            .collect()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.shared.registry.lock().connections.clone()
    }

    fn slot(&self, id: ModuleId) -> Result<Arc<ModuleSlot>, GraphError> {
        self.shared
            .registry
            .lock()
            .modules
            .get(&id)
            .map(|entry| Arc::clone(&entry.slot))
            .ok_or(GraphError::UnknownModule(id))
    }

    fn entry(&self, id: ModuleId) -> Option<Entry> {
        self.shared.registry.lock().modules.get(&id).cloned()
    }

    pub fn module_status(&self, id: ModuleId) -> Option<ModuleStatus> {
        let slot = self.slot(id).ok()?;
        Some(ModuleStatus {
            id,
            type_name: slot.type_name().to_string(),
            ready: slot.is_ready(),
            last_error: slot.last_error(),
        })
    }

    pub fn layout(&self, id: ModuleId) -> Option<BusLayout> {
        self.entry(id).map(|entry| (*entry.layout).clone())
    }

    pub fn input_pins(&self, id: ModuleId) -> Option<Vec<PinInfo>> {
        self.entry(id).map(|entry| (*entry.input_pins).clone())
    }

    pub fn output_pins(&self, id: ModuleId) -> Option<Vec<PinInfo>> {
        self.entry(id).map(|entry| (*entry.output_pins).clone())
    }

    pub fn parameters(&self, id: ModuleId) -> Option<Vec<(String, f32)>> {
        self.slot(id).ok().map(|slot| slot.params.snapshot())
    }

    /// Routing validation against the committed graph: endpoints exist,
    /// channels are in range, pin kinds match and no undelayed cycle forms.
    pub fn validate_connection(&self, connection: &Connection) -> Result<(), GraphError> {
        let registry = self.shared.registry.lock();
        registry.validate(connection)?;
        if registry.closes_cycle(connection, self.shared.config.feedback) {
            return Err(GraphError::Cycle(connection.to_string()));
        }
        Ok(())
    }

    pub fn bridge_layout(&self) -> BridgeLayout {
        bridge_layout(&self.shared.registry.lock())
    }

    // Control-rate input

    pub fn set_parameter(&self, id: ModuleId, name: &str, value: f32) -> Result<(), GraphError> {
        let slot = self.slot(id)?;
        let index = slot
            .params
            .index_of(name)
            .ok_or_else(|| GraphError::UnknownParameter {
                module: id,
                parameter: name.to_string(),
            })?;
        slot.params.set(index, value);
        Ok(())
    }

    pub fn send_event(&self, id: ModuleId, event: ModuleEvent) -> Result<(), GraphError> {
        self.slot(id)?
            .events
            .push(event)
            .map_err(|_| GraphError::EventQueueFull(id))
    }

    /// Loads opaque state into a live module and re-commits in case its
    /// layout changed. Errors a nested patch skipped over are returned after
    /// the rest of the state was applied.
    pub fn load_preset(&self, id: ModuleId, state: &StateTree) -> Result<(), GraphError> {
        let slot = self.slot(id)?;
        // Held so that layout notifications raised while loading are folded
        // into the refresh below instead of re-entering the module lock.
        let (result, issues) = {
            let _commit = self.shared.commit_lock.lock();
            let mut runtime = slot.runtime.lock();
            let result = runtime.module.load_state(state);
            (result, runtime.module.take_load_issues())
        };
        if let Err(err) = result {
            slot.record_error(err.to_string());
            return Err(GraphError::ModuleFailed {
                module: id,
                message: err.to_string(),
            });
        }
        self.refresh_module(id);

        for issue in &issues {
            tracing::warn!(module = %id, %issue, "preset load");
        }
        let errors: Vec<&str> = issues
            .iter()
            .filter(|issue| issue.is_error())
            .map(|issue| issue.message.as_str())
            .collect();
        if !errors.is_empty() {
            let message = errors.join("; ");
            slot.record_error(message.clone());
            return Err(GraphError::ModuleFailed {
                module: id,
                message,
            });
        }
        Ok(())
    }

    // Transport

    pub fn send_transport(&self, request: TransportRequest) -> bool {
        let pushed = self.shared.transport_tx.lock().push(request).is_ok();
        if !pushed {
            tracing::warn!(?request, "transport queue full, request dropped");
        }
        pushed
    }

    pub fn play(&self) -> bool {
        self.send_transport(TransportCommand::Play.into())
    }

    pub fn pause(&self) -> bool {
        self.send_transport(TransportCommand::Pause.into())
    }

    pub fn stop(&self) -> bool {
        self.send_transport(TransportCommand::Stop.into())
    }

    pub fn reset(&self) -> bool {
        self.send_transport(TransportCommand::Reset.into())
    }

    pub fn set_bpm(&self, bpm: f64) -> bool {
        self.send_transport(TransportRequest::SetBpm(bpm))
    }

    pub fn set_loop(&self, enabled: bool, start_beats: f64, end_beats: f64) -> bool {
        self.send_transport(TransportRequest::SetLoop {
            enabled,
            start_beats,
            end_beats,
        })
    }

    pub fn transport(&self) -> TransportSnapshot {
        TransportSnapshot {
            playing: self.shared.playing.load(Ordering::Acquire),
            position_samples: self.shared.position_samples.load(Ordering::Acquire),
            bpm: self.shared.bpm.load(Ordering::Acquire),
        }
    }

    // Failures

    /// Drains failures reported by the audio thread, logs them and records
    /// them as the module's last error.
    pub fn poll_failures(&self) -> Vec<ModuleFailure> {
        let mut failures = Vec::new();
        while let Some(failure) = self.shared.failures.pop() {
            tracing::warn!(module = %failure.module, error = %failure.error, "module failed while processing");
            if let Ok(slot) = self.slot(failure.module) {
                slot.record_error(failure.error.to_string());
            }
            failures.push(failure);
        }
        failures
    }

    // Persistence

    pub fn save_state(&self) -> PatchState {
        let registry = self.shared.registry.lock().clone();
        let modules = registry
            .modules
            .values()
            .map(|entry| {
                let slot = &entry.slot;
                let state = slot.runtime.lock().module.save_state();
                ModuleState {
                    id: slot.id,
                    type_name: slot.type_name().to_string(),
                    parameters: slot.params.snapshot().into_iter().collect(),
                    state,
                }
            })
            .collect();
        PatchState {
            version: PATCH_VERSION,
            modules,
            connections: registry.connections,
        }
    }

    /// Replaces the whole graph with `patch`. Unknown types, duplicate ids
    /// and invalid connections are reported and skipped.
    pub fn load_state(&self, patch: &PatchState) -> Result<LoadReport, GraphError> {
        self.ensure_accepting()?;
        let mut issues = Vec::new();
        if patch.version > PATCH_VERSION {
            issues.push(Issue::error(format!(
                "unsupported patch version {}",
                patch.version
            )));
            return Ok(LoadReport {
                issues,
                generation: self.generation(),
            });
        }

        let mut slots = Vec::with_capacity(patch.modules.len());
        let mut seen = BTreeSet::new();
        for state in &patch.modules {
            if state.id.is_unset() || !seen.insert(state.id) {
                issues.push(Issue::error(format!(
                    "skipping `{}` with missing or duplicate id {}",
                    state.type_name, state.id
                )));
                continue;
            }
            let mut module = match self.shared.factory.create(&state.type_name) {
                Ok(module) => module,
                Err(err) => {
                    tracing::warn!(module = %state.id, %err, "skipping module while loading");
                    issues.push(Issue::error(format!("module {}: {err}", state.id)));
                    continue;
                }
            };
            if let Err(err) = module.load_state(&state.state) {
                issues.push(Issue::warning(format!("module {}: {err}", state.id)));
            }
            let context = format!("module {}", state.id);
            issues.extend(
                module
                    .take_load_issues()
                    .into_iter()
                    .map(|issue| issue.within(&context)),
            );
            let slot = self.attach(state.id, module);
            for (name, value) in &state.parameters {
                match slot.params.index_of(name) {
                    Some(index) => {
                        slot.params.set(index, *value);
                    }
                    None => issues.push(Issue::warning(format!(
                        "module {} has no parameter `{name}`",
                        state.id
                    ))),
                }
            }
            slots.push(slot);
        }

        let max_id = seen.iter().map(|id| id.0).max().unwrap_or(0);
        self.shared
            .next_id
            .fetch_max(max_id.saturating_add(1), Ordering::AcqRel);

        {
            let mut staged = self.shared.staged.lock();
            staged.clear();
            staged.push(Mutation::Replace {
                modules: slots,
                connections: patch.connections.clone(),
            });
        }
        let report = self.commit()?;
        issues.extend(report.issues);
        for issue in &issues {
            tracing::warn!(%issue, "patch load");
        }
        Ok(LoadReport {
            issues,
            generation: report.generation,
        })
    }

    // Ingress

    /// Applies one external command. Returns whether it staged a structural
    /// change that still needs a commit.
    pub fn apply_command(&self, command: ControlCommand) -> Result<bool, GraphError> {
        match command {
            ControlCommand::Create { type_name, id } => {
                let module = self.shared.factory.create(&type_name)?;
                self.add_module_with_id(id.unwrap_or(ModuleId::UNSET), module)?;
                Ok(true)
            }
            ControlCommand::Destroy { id } => {
                self.remove_module(id);
                Ok(true)
            }
            ControlCommand::Update {
                target,
                parameter,
                value,
            } => {
                self.set_parameter(target, &parameter, value)?;
                Ok(false)
            }
            ControlCommand::Connect(connection) => {
                self.connect(connection);
                Ok(true)
            }
            ControlCommand::Disconnect(connection) => {
                self.disconnect(connection);
                Ok(true)
            }
            ControlCommand::LoadPreset { target, state } => {
                self.load_preset(target, &state)?;
                Ok(false)
            }
            ControlCommand::Event { target, event } => {
                self.send_event(target, event)?;
                Ok(false)
            }
            ControlCommand::Transport(request) => {
                self.send_transport(request);
                Ok(false)
            }
        }
    }

    /// Drains the ingress queue and applies every command in order. Pending
    /// structural changes are committed before a command that addresses a
    /// module, so commands can target modules created earlier in the batch.
    pub fn drain_ingress(&self, queue: &IngressQueue<ControlCommand>) -> CommitReport {
        let mut report = CommitReport {
            generation: self.generation(),
            ..CommitReport::default()
        };
        let mut pending = false;
        for command in queue.drain() {
            if pending && command.target().is_some() {
                self.commit_into(&mut report);
                pending = false;
            }
            match self.apply_command(command) {
                Ok(structural) => pending |= structural,
                Err(err) => report.issues.push(Issue::from(err)),
            }
        }
        if pending {
            self.commit_into(&mut report);
        }
        report
    }

    fn commit_into(&self, report: &mut CommitReport) {
        match self.commit() {
            Ok(committed) => {
                report.generation = committed.generation;
                report.issues.extend(committed.issues);
                report.deferred |= committed.deferred;
            }
            Err(err) => report.issues.push(err.into()),
        }
    }
}

/// Reads layout, pins, parameter routes and bridge role of a module.
fn describe(slot: &Arc<ModuleSlot>) -> Entry {
    let runtime = slot.runtime.lock();
    let module = &runtime.module;
    let layout = module.layout();
    let routes = slot
        .params
        .specs()
        .iter()
        .map(|spec| {
            module
                .parameter_routing(&spec.name)
                .and_then(|route| layout.flat_input(route.bus, route.channel))
        })
        .collect();
    Entry {
        slot: Arc::clone(slot),
        input_pins: Arc::new(module.dynamic_input_pins()),
        output_pins: Arc::new(module.dynamic_output_pins()),
        routes: Arc::new(routes),
        bridge: module.bridge(),
        layout: Arc::new(layout),
    }
}

fn add_connection(
    registry: &mut Registry,
    connection: Connection,
    policy: crate::config::FeedbackPolicy,
    issues: &mut Vec<Issue>,
) {
    if registry.connections.contains(&connection) {
        return;
    }
    if let Err(err) = registry.validate(&connection) {
        tracing::warn!(%connection, %err, "connection rejected");
        issues.push(Issue::error(format!("connection {connection}: {err}")));
        return;
    }
    if registry.closes_cycle(&connection, policy) {
        let err = GraphError::Cycle(connection.to_string());
        tracing::warn!(%err, "connection rejected");
        issues.push(err.into());
        return;
    }
    registry.connections.push(connection);
}

fn apply_mutation(
    registry: &mut Registry,
    mutation: Mutation,
    policy: crate::config::FeedbackPolicy,
    issues: &mut Vec<Issue>,
    removed: &mut Vec<Arc<ModuleSlot>>,
) {
    match mutation {
        Mutation::Add(slot) => {
            if registry.contains(slot.id) {
                issues.push(GraphError::DuplicateModule(slot.id).into());
                return;
            }
            registry.modules.insert(slot.id, describe(&slot));
        }
        Mutation::Remove(id) => match registry.modules.remove(&id) {
            Some(entry) => {
                registry.connections.retain(|connection| !connection.touches(id));
                removed.push(entry.slot);
            }
            None => issues.push(Issue::warning(format!("module {id} does not exist"))),
        },
        Mutation::Connect(connection) => add_connection(registry, connection, policy, issues),
        Mutation::Disconnect(connection) => {
            let before = registry.connections.len();
            registry.connections.retain(|existing| *existing != connection);
            if registry.connections.len() == before {
                issues.push(Issue::warning(format!("connection {connection} does not exist")));
            }
        }
        Mutation::Refresh(id) => {
            let Some(entry) = registry.modules.get_mut(&id) else {
                return;
            };
            let fresh = describe(&entry.slot);
            if fresh.layout != entry.layout {
                entry.slot.invalidate();
            }
            *entry = fresh;
        }
        Mutation::Replace {
            modules,
            connections,
        } => {
            let previous = std::mem::take(&mut registry.modules);
            removed.extend(previous.into_values().map(|entry| entry.slot));
            registry.connections.clear();
            let mut incoming = BTreeMap::new();
            for slot in modules {
                incoming.insert(slot.id, describe(&slot));
            }
            registry.modules = incoming;
            for connection in connections {
                add_connection(registry, connection, policy, issues);
            }
        }
    }
}

fn bridge_layout(registry: &Registry) -> BridgeLayout {
    let mut layout = BridgeLayout::default();
    for entry in registry.modules.values() {
        match entry.bridge {
            Some(BridgeRole::Inlet { channels }) => layout.inlets.push(channels),
            Some(BridgeRole::Outlet { channels }) => layout.outlets.push(channels),
            None => {}
        }
    }
    layout
}
