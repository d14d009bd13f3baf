//! The pending graph: topology and reference counts, guarded by the graph
//! lock.
//!
//! Nodes live in a petgraph arena indexed by stable indices; edges carry which
//! output feeds which input or param. A node's *connection references* are
//! its outgoing edges plus any references the context holds on it (active
//! source, automatic pull). *External references* come from its
//! [`NodeHandle`](crate::NodeHandle). With both at zero the node is marked for
//! deletion; the actual free always happens on the control thread.

use std::sync::Arc;

use hashbrown::HashMap;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction::{Incoming, Outgoing};

use crate::config::{validate_channel_count, ContextOptions};
use crate::dirty::DirtySet;
use crate::error::{GraphError, Result};
use crate::node::NodeId;
use crate::param::ParamShared;
use crate::render::RenderNode;

/// Where an edge lands on its target node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Port {
    Input(usize),
    Param(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Connection {
    pub(crate) output: usize,
    pub(crate) port: Port,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct JunctionKey {
    pub(crate) node: NodeId,
    pub(crate) port: Port,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct OutputKey {
    pub(crate) node: NodeId,
    pub(crate) output: usize,
}

/// Control-side bookkeeping for one node.
pub(crate) struct NodeEntry {
    pub(crate) id: NodeId,
    pub(crate) name: &'static str,
    pub(crate) num_inputs: usize,
    pub(crate) output_channels: Vec<usize>,
    pub(crate) params: Vec<Arc<ParamShared>>,
    pub(crate) tail_time: f64,
    pub(crate) latency_time: f64,
    pub(crate) requires_pull: bool,
    pub(crate) external_refs: u32,
    pub(crate) context_refs: u32,
    pub(crate) pulled: bool,
    pub(crate) active_source: bool,
    pub(crate) marked: bool,
}

impl NodeEntry {
    pub(crate) fn new(
        name: &'static str,
        num_inputs: usize,
        output_channels: Vec<usize>,
        params: Vec<Arc<ParamShared>>,
    ) -> Self {
        Self {
            id: NodeId(u32::MAX),
            name,
            num_inputs,
            output_channels,
            params,
            tail_time: 0.0,
            latency_time: 0.0,
            requires_pull: false,
            external_refs: 1,
            context_refs: 0,
            pulled: false,
            active_source: false,
            marked: false,
        }
    }

    fn port_count(&self, port: Port) -> (usize, usize, &'static str) {
        match port {
            Port::Input(i) => (i, self.num_inputs, "input"),
            Port::Param(i) => (i, self.params.len(), "param"),
        }
    }
}

pub(crate) struct GraphState {
    pub(crate) graph: StableDiGraph<NodeEntry, Connection>,
    pub(crate) index: HashMap<NodeId, NodeIndex>,
    next_id: u32,
    pub(crate) destination: Option<NodeId>,

    /// Set by the first pre-render; cleared when the renderer retires.
    pub(crate) initialized: bool,
    pub(crate) resume_pending: bool,

    /// Render halves of nodes the audio thread has not adopted yet.
    pub(crate) pending_nodes: Vec<RenderNode>,

    pub(crate) dirty_junctions: DirtySet<JunctionKey>,
    pub(crate) dirty_outputs: DirtySet<OutputKey>,
    pub(crate) pull_dirty: bool,
    pub(crate) pull_pending: Vec<NodeId>,

    pub(crate) active_sources: Vec<NodeId>,
    pub(crate) finished_sources: Vec<NodeId>,

    /// Filled while the renderer is live; handed off in post-render.
    pub(crate) marked_for_deletion: Vec<NodeId>,
    /// Handed off by the audio thread, freed by the control thread.
    pub(crate) nodes_to_delete: Vec<(NodeId, Option<RenderNode>)>,
    /// Filled while no renderer is live; freed directly on the control thread.
    pub(crate) control_deletions: Vec<NodeId>,
    pub(crate) deletion_scheduled: bool,
    pub(crate) deleted: u64,
}

impl GraphState {
    pub(crate) fn new(options: &ContextOptions) -> Self {
        let capacity = options.node_capacity.max(1);
        Self {
            graph: StableDiGraph::with_capacity(capacity, capacity * 2),
            index: HashMap::with_capacity(capacity),
            next_id: 0,
            destination: None,
            initialized: false,
            resume_pending: false,
            pending_nodes: Vec::with_capacity(capacity),
            dirty_junctions: DirtySet::with_capacity(capacity),
            dirty_outputs: DirtySet::with_capacity(capacity),
            pull_dirty: false,
            pull_pending: Vec::with_capacity(capacity),
            active_sources: Vec::with_capacity(capacity),
            finished_sources: Vec::with_capacity(capacity),
            marked_for_deletion: Vec::with_capacity(capacity),
            nodes_to_delete: Vec::with_capacity(capacity),
            control_deletions: Vec::new(),
            deletion_scheduled: false,
            deleted: 0,
        }
    }

    /// Register a node and queue its render half for adoption.
    pub(crate) fn add_node(&mut self, mut entry: NodeEntry, mut render: RenderNode) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        entry.id = id;
        let idx = self.graph.add_node(entry);
        self.index.insert(id, idx);
        render.bind(id, idx.index());
        self.pending_nodes.push(render);
        self.reserve_for_audio_thread();
        tracing::debug!(node = ?id, name = self.graph[idx].name, slot = idx.index(), "added node");
        id
    }

    /// Make sure the lists the audio thread pushes into can hold every node
    /// without reallocating.
    fn reserve_for_audio_thread(&mut self) {
        let n = self.graph.node_count();
        for list in [
            &mut self.marked_for_deletion,
            &mut self.finished_sources,
            &mut self.active_sources,
        ] {
            if list.capacity() < n {
                list.reserve(n - list.len());
            }
        }
        if self.nodes_to_delete.capacity() < n {
            self.nodes_to_delete.reserve(n - self.nodes_to_delete.len());
        }
    }

    pub(crate) fn node_index(&self, id: NodeId) -> Result<NodeIndex> {
        self.index
            .get(&id)
            .copied()
            .ok_or(GraphError::UnknownNode(id))
    }

    pub(crate) fn entry(&self, id: NodeId) -> Result<&NodeEntry> {
        Ok(&self.graph[self.node_index(id)?])
    }

    fn entry_mut(&mut self, id: NodeId) -> Option<&mut NodeEntry> {
        let idx = *self.index.get(&id)?;
        self.graph.node_weight_mut(idx)
    }

    pub(crate) fn outgoing_count(&self, idx: NodeIndex) -> usize {
        self.graph.edges_directed(idx, Outgoing).count()
    }

    fn incoming_count(&self, idx: NodeIndex) -> usize {
        self.graph.edges_directed(idx, Incoming).count()
    }

    /// Outgoing edges plus references held by the context.
    pub(crate) fn connection_refs(&self, id: NodeId) -> Result<usize> {
        let idx = self.node_index(id)?;
        Ok(self.outgoing_count(idx) + self.graph[idx].context_refs as usize)
    }

    /// Connect `output` of `from` to `port` of `to`. Connecting the same pair
    /// twice is a no-op.
    pub(crate) fn connect(&mut self, from: NodeId, output: usize, to: NodeId, port: Port) -> Result<()> {
        let from_idx = self.node_index(from)?;
        let to_idx = self.node_index(to)?;

        let outputs = self.graph[from_idx].output_channels.len();
        if output >= outputs {
            return Err(GraphError::IndexSize {
                kind: "output",
                index: output,
                count: outputs,
            });
        }
        let (index, count, kind) = self.graph[to_idx].port_count(port);
        if index >= count {
            return Err(GraphError::IndexSize { kind, index, count });
        }

        let conn = Connection { output, port };
        let exists = self
            .graph
            .edges_directed(from_idx, Outgoing)
            .any(|e| e.target() == to_idx && *e.weight() == conn);
        if exists {
            return Ok(());
        }

        self.graph.add_edge(from_idx, to_idx, conn);
        self.dirty_junctions.mark(JunctionKey { node: to, port });
        tracing::debug!(?from, output, ?to, ?port, "connected");

        self.update_pull(from);
        self.update_pull(to);
        Ok(())
    }

    /// Remove every outgoing edge of `from` for which `pred(target, connection)`
    /// holds. Returns how many were removed.
    pub(crate) fn disconnect_where(
        &mut self,
        from: NodeId,
        mut pred: impl FnMut(NodeId, &Connection) -> bool,
    ) -> Result<usize> {
        let from_idx = self.node_index(from)?;
        let doomed: Vec<_> = self
            .graph
            .edges_directed(from_idx, Outgoing)
            .filter(|e| pred(self.graph[e.target()].id, e.weight()))
            .map(|e| (e.id(), self.graph[e.target()].id, e.weight().port))
            .collect();

        for &(edge, target, port) in &doomed {
            self.graph.remove_edge(edge);
            self.dirty_junctions.mark(JunctionKey { node: target, port });
        }
        if doomed.is_empty() {
            return Ok(0);
        }
        tracing::debug!(?from, edges = doomed.len(), "disconnected");

        for &(_, target, _) in &doomed {
            self.update_pull(target);
        }
        self.update_pull(from);
        self.release_if_unreferenced(from);
        Ok(doomed.len())
    }

    /// Keep the automatic-pull set in step with the topology: a node that
    /// asks for it is pulled while it has inputs but nothing downstream.
    pub(crate) fn update_pull(&mut self, id: NodeId) {
        let Some(&idx) = self.index.get(&id) else {
            return;
        };
        let entry = &self.graph[idx];
        let wants = entry.requires_pull
            && self.incoming_count(idx) > 0
            && self.outgoing_count(idx) == 0;
        if wants == entry.pulled {
            return;
        }

        let entry = &mut self.graph[idx];
        entry.pulled = wants;
        if wants {
            entry.context_refs += 1;
            self.pull_pending.push(id);
        } else {
            entry.context_refs -= 1;
            self.pull_pending.retain(|&p| p != id);
        }
        self.pull_dirty = true;
        tracing::trace!(node = ?id, pulled = wants, "automatic pull changed");

        if !wants {
            self.release_if_unreferenced(id);
        }
    }

    pub(crate) fn set_output_channels(&mut self, id: NodeId, output: usize, channels: usize) -> Result<()> {
        validate_channel_count(channels)?;
        let idx = self.node_index(id)?;
        let entry = &mut self.graph[idx];
        let count = entry.output_channels.len();
        let slot = entry.output_channels.get_mut(output).ok_or(GraphError::IndexSize {
            kind: "output",
            index: output,
            count,
        })?;
        if *slot != channels {
            *slot = channels;
            self.dirty_outputs.mark(OutputKey { node: id, output });
        }
        Ok(())
    }

    pub(crate) fn release_external(&mut self, id: NodeId) {
        let Some(entry) = self.entry_mut(id) else {
            return;
        };
        entry.external_refs = entry.external_refs.saturating_sub(1);
        tracing::trace!(node = ?id, refs = entry.external_refs, "external reference released");
        self.release_if_unreferenced(id);
    }

    /// Take the context's reference on a started source.
    pub(crate) fn activate_source(&mut self, id: NodeId) -> Result<()> {
        let idx = self.node_index(id)?;
        let entry = &mut self.graph[idx];
        if !entry.active_source {
            entry.active_source = true;
            entry.context_refs += 1;
            self.active_sources.push(id);
        }
        Ok(())
    }

    pub(crate) fn is_active_source(&self, id: NodeId) -> bool {
        self.entry(id).map(|e| e.active_source).unwrap_or(false)
    }

    /// Drop the context's reference on a source. Returns whether it held one.
    pub(crate) fn release_source(&mut self, id: NodeId) -> bool {
        if let Some(pos) = self.active_sources.iter().position(|&s| s == id) {
            self.active_sources.swap_remove(pos);
        }
        let Some(entry) = self.entry_mut(id) else {
            return false;
        };
        if !entry.active_source {
            return false;
        }
        entry.active_source = false;
        entry.context_refs -= 1;
        self.release_if_unreferenced(id);
        true
    }

    /// Move active sources nobody can ever hear (no handle, nothing
    /// downstream) to the finished list.
    pub(crate) fn prune_stoppable_sources(&mut self) {
        let mut i = 0;
        while i < self.active_sources.len() {
            let id = self.active_sources[i];
            let stoppable = match self.index.get(&id) {
                Some(&idx) => {
                    self.graph[idx].external_refs == 0 && self.outgoing_count(idx) == 0
                }
                None => true,
            };
            if stoppable {
                self.active_sources.swap_remove(i);
                if !self.finished_sources.contains(&id) {
                    self.finished_sources.push(id);
                }
            } else {
                i += 1;
            }
        }
    }

    /// Mark `id` for deletion if nothing references it any more.
    pub(crate) fn release_if_unreferenced(&mut self, id: NodeId) {
        if self.destination == Some(id) {
            return;
        }
        let Some(&idx) = self.index.get(&id) else {
            return;
        };
        let entry = &self.graph[idx];
        if entry.marked || entry.external_refs > 0 || entry.context_refs > 0 {
            return;
        }
        if self.outgoing_count(idx) > 0 {
            return;
        }
        self.mark_for_deletion(id);
    }

    fn mark_for_deletion(&mut self, id: NodeId) {
        let Some(entry) = self.entry_mut(id) else {
            return;
        };
        entry.marked = true;
        if self.initialized {
            self.marked_for_deletion.push(id);
        } else {
            self.control_deletions.push(id);
        }
        tracing::trace!(node = ?id, deferred = self.initialized, "marked for deletion");
    }

    /// Take the render half of a node that was never adopted.
    pub(crate) fn take_pending(&mut self, id: NodeId) -> Option<RenderNode> {
        let pos = self.pending_nodes.iter().position(|n| n.id() == id)?;
        Some(self.pending_nodes.swap_remove(pos))
    }

    /// Free the nodes the audio thread handed off. Render halves are moved
    /// into `doomed` so the caller can drop them after releasing the lock.
    pub(crate) fn delete_handed_off(&mut self, doomed: &mut Vec<RenderNode>) {
        let handed_off: Vec<_> = self.nodes_to_delete.drain(..).collect();
        for (id, render) in handed_off {
            self.remove_node(id);
            doomed.extend(render);
        }
    }

    /// Free nodes marked while no renderer was live.
    pub(crate) fn collect_control_deletions(&mut self, doomed: &mut Vec<RenderNode>) {
        while let Some(id) = self.control_deletions.pop() {
            doomed.extend(self.take_pending(id));
            self.remove_node(id);
        }
    }

    /// The renderer is gone: nothing will hand marked nodes off any more.
    pub(crate) fn retire_renderer(&mut self) {
        self.initialized = false;
        self.resume_pending = false;
        self.control_deletions.append(&mut self.marked_for_deletion);
    }

    pub(crate) fn has_pending_deletions(&self) -> bool {
        !self.marked_for_deletion.is_empty()
            || !self.nodes_to_delete.is_empty()
            || !self.control_deletions.is_empty()
    }

    fn remove_node(&mut self, id: NodeId) {
        let Some(idx) = self.index.remove(&id) else {
            return;
        };
        let upstream: Vec<NodeId> = self
            .graph
            .edges_directed(idx, Incoming)
            .map(|e| self.graph[e.source()].id)
            .collect();

        self.dirty_junctions.purge(|k| k.node == id);
        self.dirty_outputs.purge(|k| k.node == id);
        self.pull_pending.retain(|&p| p != id);
        self.active_sources.retain(|&s| s != id);
        self.finished_sources.retain(|&s| s != id);

        let entry = self.graph.remove_node(idx);
        self.deleted += 1;
        tracing::debug!(node = ?id, name = entry.map(|e| e.name), "deleted node");

        for up in upstream {
            self.update_pull(up);
            self.release_if_unreferenced(up);
        }
    }

    /// Pending sources of `port` on `id`, sorted.
    pub(crate) fn sources_of(&self, id: NodeId, port: Port) -> Result<Vec<NodeId>> {
        let idx = self.node_index(id)?;
        let mut ids: Vec<NodeId> = self
            .graph
            .edges_directed(idx, Incoming)
            .filter(|e| e.weight().port == port)
            .map(|e| self.graph[e.source()].id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
