//! Control-side registry of modules and connections, and the ordering
//! algorithms run on a copy of it during a commit.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use patchbay_rt::ModuleId;
use serde::{Deserialize, Serialize};

use crate::config::FeedbackPolicy;
use crate::error::GraphError;
use crate::module::{BridgeRole, BusLayout, Direction, PinInfo};
use crate::slot::ModuleSlot;

/// Directed edge `(src, src_channel) -> (dst, dst_channel)` over flat
/// channel indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub src: ModuleId,
    pub src_channel: usize,
    pub dst: ModuleId,
    pub dst_channel: usize,
}

impl Connection {
    pub fn new(src: ModuleId, src_channel: usize, dst: ModuleId, dst_channel: usize) -> Self {
        Self {
            src,
            src_channel,
            dst,
            dst_channel,
        }
    }

    pub fn touches(&self, id: ModuleId) -> bool {
        self.src == id || self.dst == id
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src, self.src_channel, self.dst, self.dst_channel
        )
    }
}

/// Cached facts about a registered module, refreshed when its layout may
/// have changed.
#[derive(Clone)]
pub(crate) struct Entry {
    pub slot: Arc<ModuleSlot>,
    pub layout: Arc<BusLayout>,
    pub input_pins: Arc<Vec<PinInfo>>,
    pub output_pins: Arc<Vec<PinInfo>>,
    /// Flat input channel each parameter is routed to.
    pub routes: Arc<Vec<Option<usize>>>,
    pub bridge: Option<BridgeRole>,
}

#[derive(Clone, Default)]
pub(crate) struct Registry {
    pub modules: BTreeMap<ModuleId, Entry>,
    pub connections: Vec<Connection>,
}

impl Registry {
    pub fn contains(&self, id: ModuleId) -> bool {
        self.modules.contains_key(&id)
    }

    fn delays_input(&self, id: ModuleId, policy: FeedbackPolicy) -> bool {
        policy == FeedbackPolicy::ThroughDelay
            && self
                .modules
                .get(&id)
                .map(|entry| entry.slot.descriptor.feedback_delay)
                .unwrap_or(false)
    }

    /// Whether the edge orders its endpoints. Edges into a delay module do
    /// not, since the delay reads them one block late.
    pub fn orders(&self, connection: &Connection, policy: FeedbackPolicy) -> bool {
        !self.delays_input(connection.dst, policy)
    }

    /// Structural checks for one connection against the registered layouts.
    pub fn validate(&self, connection: &Connection) -> Result<(), GraphError> {
        let src = self
            .modules
            .get(&connection.src)
            .ok_or(GraphError::UnknownModule(connection.src))?;
        let dst = self
            .modules
            .get(&connection.dst)
            .ok_or(GraphError::UnknownModule(connection.dst))?;

        let from = channel_kind(connection.src, &src.output_pins, connection.src_channel, Direction::Output)?;
        let to = channel_kind(connection.dst, &dst.input_pins, connection.dst_channel, Direction::Input)?;
        if !from.can_feed(to) {
            return Err(GraphError::IncompatiblePins { from, to });
        }
        Ok(())
    }

    /// Whether adding `connection` would close a cycle that no delay module
    /// breaks.
    pub fn closes_cycle(&self, connection: &Connection, policy: FeedbackPolicy) -> bool {
        if !self.orders(connection, policy) {
            return false;
        }
        if connection.src == connection.dst {
            return true;
        }
        let mut stack = vec![connection.dst];
        let mut visited = Vec::new();
        while let Some(current) = stack.pop() {
            if current == connection.src {
                return true;
            }
            if visited.contains(&current) {
                continue;
            }
            visited.push(current);
            for edge in &self.connections {
                if edge.src == current && self.orders(edge, policy) {
                    stack.push(edge.dst);
                }
            }
        }
        false
    }

    /// Kahn ordering of all modules. Ties resolve by id so the same topology
    /// always produces the same order.
    pub fn topological_order(&self, policy: FeedbackPolicy) -> Result<Vec<ModuleId>, GraphError> {
        let ids: Vec<ModuleId> = self.modules.keys().copied().collect();
        let index_of: BTreeMap<ModuleId, usize> =
            ids.iter().enumerate().map(|(index, id)| (*id, index)).collect();

        let mut adjacency = vec![Vec::new(); ids.len()];
        let mut indegree = vec![0usize; ids.len()];
        for connection in &self.connections {
            if !self.orders(connection, policy) {
                continue;
            }
            let (Some(&src), Some(&dst)) =
                (index_of.get(&connection.src), index_of.get(&connection.dst))
            else {
                continue;
            };
            adjacency[src].push(dst);
            indegree[dst] += 1;
        }

        let mut queue: VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| index)
            .collect();

        let mut order = Vec::with_capacity(ids.len());
        while let Some(index) = queue.pop_front() {
            order.push(ids[index]);
            for &next in &adjacency[index] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != ids.len() {
            let stuck = indegree
                .iter()
                .position(|degree| *degree > 0)
                .map(|index| ids[index].to_string())
                .unwrap_or_default();
            return Err(GraphError::Cycle(format!("through module {stuck}")));
        }
        Ok(order)
    }

    /// Drops connections whose endpoints are gone or out of range. Returns
    /// what was removed.
    pub fn prune(&mut self) -> Vec<Connection> {
        let mut pruned = Vec::new();
        let mut kept = Vec::with_capacity(self.connections.len());
        for connection in self.connections.drain(..) {
            let valid = {
                let src = self.modules.get(&connection.src);
                let dst = self.modules.get(&connection.dst);
                match (src, dst) {
                    (Some(src), Some(dst)) => {
                        connection.src_channel < src.layout.output_channels()
                            && connection.dst_channel < dst.layout.input_channels()
                    }
                    _ => false,
                }
            };
            if valid {
                kept.push(connection);
            } else {
                pruned.push(connection);
            }
        }
        self.connections = kept;
        pruned
    }
}

fn channel_kind(
    module: ModuleId,
    pins: &[PinInfo],
    channel: usize,
    direction: Direction,
) -> Result<crate::module::PinKind, GraphError> {
    pins.iter()
        .find(|pin| pin.channel == channel)
        .map(|pin| pin.kind)
        .ok_or(GraphError::ChannelOutOfRange {
            module,
            direction,
            channel,
            available: pins.len(),
        })
}
