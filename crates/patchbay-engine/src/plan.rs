use std::collections::BTreeMap;
use std::sync::Arc;

use patchbay_rt::ModuleId;

use crate::config::{FeedbackPolicy, PrepareConfig};
use crate::graph::{Connection, Registry};
use crate::module::BridgeRole;
use crate::slot::ModuleSlot;

/// Source of one input channel, resolved to plan indices.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Feed {
    pub src: usize,
    pub src_channel: usize,
    pub dst_channel: usize,
}

/// Host channel window served by an inlet or outlet module.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HostWindow {
    pub offset: usize,
    pub channels: usize,
}

pub(crate) struct PlanNode {
    pub slot: Arc<ModuleSlot>,
    pub feeds: Vec<Feed>,
    /// Inputs are gathered after the whole block ran.
    pub deferred: bool,
    /// Flat input channel per parameter, only when a connection feeds it.
    pub routes: Vec<Option<usize>>,
    pub inlet: Option<HostWindow>,
    pub outlet: Option<HostWindow>,
}

/// Immutable, fully resolved snapshot of the graph. Never changed after it
/// is published; every commit builds a new one.
pub struct ProcessingPlan {
    generation: u64,
    config: Option<PrepareConfig>,
    pub(crate) nodes: Vec<PlanNode>,
    connections: Vec<Connection>,
    host_inputs: usize,
    host_outputs: usize,
}

impl ProcessingPlan {
    pub(crate) fn empty(generation: u64) -> Self {
        Self {
            generation,
            config: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            host_inputs: 0,
            host_outputs: 0,
        }
    }

    pub(crate) fn build(
        generation: u64,
        config: PrepareConfig,
        registry: &Registry,
        order: &[ModuleId],
        policy: FeedbackPolicy,
    ) -> Self {
        let index_of: BTreeMap<ModuleId, usize> =
            order.iter().enumerate().map(|(index, id)| (*id, index)).collect();

        // Host channel windows follow module id order, not processing order.
        let mut windows = BTreeMap::new();
        let mut host_inputs = 0;
        let mut host_outputs = 0;
        for (id, entry) in &registry.modules {
            match entry.bridge {
                Some(BridgeRole::Inlet { channels }) => {
                    let window = HostWindow {
                        offset: host_inputs,
                        channels,
                    };
                    host_inputs += channels;
                    windows.insert(*id, (Some(window), None));
                }
                Some(BridgeRole::Outlet { channels }) => {
                    let window = HostWindow {
                        offset: host_outputs,
                        channels,
                    };
                    host_outputs += channels;
                    windows.insert(*id, (None, Some(window)));
                }
                None => {}
            }
        }

        let mut nodes = Vec::with_capacity(order.len());
        for id in order {
            let Some(entry) = registry.modules.get(id) else {
                continue;
            };
            let feeds: Vec<Feed> = registry
                .connections
                .iter()
                .filter(|connection| connection.dst == *id)
                .filter_map(|connection| {
                    index_of.get(&connection.src).map(|&src| Feed {
                        src,
                        src_channel: connection.src_channel,
                        dst_channel: connection.dst_channel,
                    })
                })
                .collect();
            let routes = entry
                .routes
                .iter()
                .map(|route| route.filter(|channel| feeds.iter().any(|feed| feed.dst_channel == *channel)))
                .collect();
            let (inlet, outlet) = windows.get(id).copied().unwrap_or((None, None));

            nodes.push(PlanNode {
                slot: Arc::clone(&entry.slot),
                feeds,
                deferred: entry.slot.descriptor.feedback_delay
                    && policy == FeedbackPolicy::ThroughDelay,
                routes,
                inlet,
                outlet,
            });
        }

        Self {
            generation,
            config: Some(config),
            nodes,
            connections: registry.connections.clone(),
            host_inputs,
            host_outputs,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> Option<PrepareConfig> {
        self.config
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Modules in processing order.
    pub fn order(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.nodes.iter().map(|node| node.slot.id)
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Host channels consumed by inlet modules.
    pub fn host_inputs(&self) -> usize {
        self.host_inputs
    }

    /// Host channels produced by outlet modules.
    pub fn host_outputs(&self) -> usize {
        self.host_outputs
    }

    /// Verifies that every connection references modules of this plan and
    /// that non-delayed feeds point backwards in the order.
    pub fn check_consistency(&self) -> Result<(), String> {
        let position = |id: ModuleId| self.nodes.iter().position(|node| node.slot.id == id);
        for connection in &self.connections {
            if position(connection.src).is_none() || position(connection.dst).is_none() {
                return Err(format!(
                    "generation {}: connection {connection} references a module outside the plan",
                    self.generation
                ));
            }
        }
        for (index, node) in self.nodes.iter().enumerate() {
            for feed in &node.feeds {
                if feed.src >= self.nodes.len() {
                    return Err(format!("feed source {} out of bounds", feed.src));
                }
                if !node.deferred && feed.src >= index {
                    return Err(format!(
                        "module {} is fed by {} which runs later",
                        node.slot.id, self.nodes[feed.src].slot.id
                    ));
                }
            }
        }
        Ok(())
    }
}
