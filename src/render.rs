//! The rendering snapshot and the audio-thread driver.
//!
//! [`Renderer`] owns the render halves of all adopted nodes in a slot arena
//! indexed like the pending graph. Each quantum it
//!
//! 1. tries the graph lock and, if it gets it, adopts new nodes, rebuilds
//!    dirty summing junctions and outputs, and refreshes the automatic-pull
//!    list;
//! 2. pulls the destination (and every automatically pulled node) depth
//!    first, each node at most once per quantum;
//! 3. tries the lock again to release finished sources and hand nodes marked
//!    for deletion back to the control thread.
//!
//! When a lock attempt fails the step is skipped and the previous snapshot is
//! used as is.

use core::mem;
use std::sync::{mpsc, Arc};
use std::thread;

use dasp_graph::Buffer;
use petgraph::visit::EdgeRef;
use petgraph::Direction::Incoming;

use crate::config::{ContextOptions, RENDER_QUANTUM_FRAMES};
use crate::context::{ContextShared, ContextState};
use crate::graph::{GraphState, Port};
use crate::handler::{ControlTask, TaskSender};
use crate::node::{Bus, ErasedNode, NodeId, ProcessContext, ProcessStatus};
use crate::param::ParamShared;

/// One entry of a summing junction's rendering list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Source {
    slot: usize,
    output: usize,
}

/// The audio-thread half of a node.
pub(crate) struct RenderNode {
    id: NodeId,
    slot: usize,
    processor: Box<dyn ErasedNode>,
    input_sources: Vec<Vec<Source>>,
    inputs: Vec<Bus>,
    param_sources: Vec<Vec<Source>>,
    params: Vec<Arc<ParamShared>>,
    param_values: Vec<Buffer>,
    outputs: Vec<Bus>,
    stamp: u64,
    finished: bool,
}

fn upstream<'a>(nodes: &'a [Option<RenderNode>], source: &Source) -> Option<&'a Bus> {
    nodes.get(source.slot)?.as_ref()?.outputs.get(source.output)
}

impl RenderNode {
    pub(crate) fn new(
        processor: Box<dyn ErasedNode>,
        num_inputs: usize,
        output_channels: &[usize],
        params: Vec<Arc<ParamShared>>,
    ) -> Self {
        let junction = || Vec::with_capacity(4);
        Self {
            id: NodeId(u32::MAX),
            slot: usize::MAX,
            processor,
            input_sources: (0..num_inputs).map(|_| junction()).collect(),
            inputs: (0..num_inputs).map(|_| Bus::new(1)).collect(),
            param_sources: params.iter().map(|_| junction()).collect(),
            param_values: params
                .iter()
                .map(|p| {
                    let mut values = Buffer::SILENT;
                    values.iter_mut().for_each(|v| *v = p.last_value());
                    values
                })
                .collect(),
            params,
            outputs: output_channels.iter().map(|&c| Bus::new(c)).collect(),
            stamp: 0,
            finished: false,
        }
    }

    pub(crate) fn bind(&mut self, id: NodeId, slot: usize) {
        self.id = id;
        self.slot = slot;
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    fn sources_mut(&mut self, port: Port) -> Option<&mut Vec<Source>> {
        match port {
            Port::Input(i) => self.input_sources.get_mut(i),
            Port::Param(i) => self.param_sources.get_mut(i),
        }
    }

    /// Sum upstream outputs into the input buses and compute param values.
    fn gather(&mut self, nodes: &[Option<RenderNode>], ctx: &ProcessContext) {
        for (bus, sources) in self.inputs.iter_mut().zip(&self.input_sources) {
            let channels = sources
                .iter()
                .filter_map(|s| upstream(nodes, s))
                .map(Bus::channel_count)
                .max()
                .unwrap_or(1);
            bus.set_channel_count(channels);
            bus.silence();
            for up in sources.iter().filter_map(|s| upstream(nodes, s)) {
                bus.sum_from(up);
            }
        }

        let params = self.param_values.iter_mut().zip(&self.params);
        for ((values, shared), sources) in params.zip(&self.param_sources) {
            if sources.is_empty() {
                shared.render(ctx, None, values);
                continue;
            }
            let mut audio = Buffer::SILENT;
            let mut mono = Buffer::SILENT;
            for up in sources.iter().filter_map(|s| upstream(nodes, s)) {
                up.mix_down_into(&mut mono);
                for (a, m) in audio.iter_mut().zip(mono.iter()) {
                    *a += *m;
                }
            }
            shared.render(ctx, Some(&audio), values);
        }
    }

    fn process(&mut self, ctx: &ProcessContext) -> ProcessStatus {
        self.processor
            .process_erased(ctx, &self.inputs, &self.param_values, &mut self.outputs)
    }
}

impl Drop for RenderNode {
    fn drop(&mut self) {
        self.processor.uninitialize();
    }
}

/// Slot arena of adopted nodes plus the automatic-pull snapshot.
#[derive(Default)]
pub(crate) struct RenderGraph {
    nodes: Vec<Option<RenderNode>>,
    pull_list: Vec<usize>,
}

impl RenderGraph {
    fn with_capacity(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity);
        nodes.resize_with(capacity, || None);
        Self {
            nodes,
            pull_list: Vec::with_capacity(capacity),
        }
    }

    fn adopt(&mut self, node: RenderNode) {
        let slot = node.slot;
        if slot >= self.nodes.len() {
            // past node_capacity; grows on the audio thread
            self.nodes.resize_with(slot + 1, || None);
        }
        debug_assert!(self.nodes[slot].is_none(), "slot {} still occupied", slot);
        self.nodes[slot] = Some(node);
    }

    fn get_mut(&mut self, slot: usize, id: NodeId) -> Option<&mut RenderNode> {
        self.nodes
            .get_mut(slot)?
            .as_mut()
            .filter(|n| n.id == id)
    }

    fn take(&mut self, slot: usize, id: NodeId) -> Option<RenderNode> {
        let entry = self.nodes.get_mut(slot)?;
        if entry.as_ref()?.id != id {
            return None;
        }
        entry.take()
    }

    fn find(&self, id: NodeId) -> Option<&RenderNode> {
        self.nodes.iter().flatten().find(|n| n.id == id)
    }

    pub(crate) fn live_nodes(&self) -> usize {
        self.nodes.iter().flatten().count()
    }
}

/// The audio-thread half of a context.
///
/// Obtained from [`AudioContext::detached`](crate::AudioContext::detached)
/// (or created internally for device and offline rendering). Call
/// [`render_quantum`](Self::render_quantum) or
/// [`render_interleaved`](Self::render_interleaved) from exactly one thread
/// at a time; that thread is the audio thread for the duration of the call.
///
/// Dropping the renderer hands its nodes back to the control thread, which
/// frees them in [`process_control_tasks`](crate::BaseAudioContext::process_control_tasks).
/// If the context is already gone, a short-lived reaper thread frees them
/// instead.
pub struct Renderer {
    shared: Arc<ContextShared>,
    core: RenderCore,
    /// Set when the renderer is dropped after its context. Dropped last, so
    /// the reaper only wakes once this renderer's `shared` is gone.
    reaped: Option<mpsc::Sender<()>>,
}

struct RenderCore {
    graph: Box<RenderGraph>,
    tasks: TaskSender,
    ctx: ProcessContext,
    quantum: u64,
    destination: usize,
    /// Sources that reported `Finished` since the last successful post-render.
    finished: Vec<NodeId>,
    released: Vec<NodeId>,
    last: Bus,
    cursor: usize,
}

impl Renderer {
    pub(crate) fn new(
        shared: Arc<ContextShared>,
        tasks: TaskSender,
        options: &ContextOptions,
        destination: usize,
    ) -> Self {
        let capacity = options.node_capacity.max(1);
        Self {
            shared,
            core: RenderCore {
                graph: Box::new(RenderGraph::with_capacity(capacity)),
                tasks,
                ctx: ProcessContext::new(options.sample_rate),
                quantum: 0,
                destination,
                finished: Vec::with_capacity(capacity),
                released: Vec::with_capacity(capacity),
                last: Bus::new(options.channels),
                cursor: RENDER_QUANTUM_FRAMES,
            },
            reaped: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.core.ctx.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.core.last.channel_count()
    }

    /// First frame of the next quantum to render.
    pub fn current_frame(&self) -> u64 {
        self.core.ctx.current_frame
    }

    /// Number of quanta rendered while the context was running.
    pub fn quanta_rendered(&self) -> u64 {
        self.core.quantum
    }

    /// Render one quantum and return the destination's output.
    ///
    /// Outputs silence while the context is suspended or closed.
    pub fn render_quantum(&mut self) -> &Bus {
        self.render_next(false);
        self.core.cursor = RENDER_QUANTUM_FRAMES;
        &self.core.last
    }

    /// Fill an interleaved buffer of any length, rendering quanta as needed.
    /// Output channels beyond the context's channel count repeat its last
    /// channel.
    pub fn render_interleaved(&mut self, out: &mut [f32], channels: usize) {
        for frame in out.chunks_mut(channels.max(1)) {
            if self.core.cursor >= RENDER_QUANTUM_FRAMES {
                self.render_next(false);
                self.core.cursor = 0;
            }
            let cursor = self.core.cursor;
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = self.core.last.channel(ch)[cursor];
            }
            self.core.cursor += 1;
        }
    }

    /// Nodes currently feeding input `input` of `id` in the rendering
    /// snapshot, sorted. Empty if the node has not been adopted.
    pub fn rendering_inputs(&self, id: NodeId, input: usize) -> Vec<NodeId> {
        let graph = &self.core.graph;
        let Some(node) = graph.find(id) else {
            return Vec::new();
        };
        let mut ids: Vec<NodeId> = node
            .input_sources
            .get(input)
            .into_iter()
            .flatten()
            .filter_map(|s| graph.nodes.get(s.slot)?.as_ref().map(|n| n.id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Number of nodes adopted by the audio thread.
    pub fn live_nodes(&self) -> usize {
        self.core.graph.live_nodes()
    }

    /// Render with the blocking lock; used by the offline worker.
    pub(crate) fn render_offline_quantum(&mut self) -> &Bus {
        self.render_next(true);
        &self.core.last
    }

    pub(crate) fn post(&mut self, task: ControlTask) {
        self.core.tasks.post(task);
    }

    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    fn render_next(&mut self, blocking: bool) {
        let handler = &self.shared.handler;
        handler.enter_audio_thread();

        if self.shared.state() == ContextState::Closed {
            self.core.last.silence();
            handler.leave_audio_thread();
            return;
        }
        self.core.tasks.flush();

        {
            let guard = if blocking {
                Some(handler.offline_lock())
            } else {
                handler.try_lock()
            };
            // a closed context has already reclaimed the graph
            if let Some(guard) = guard.filter(|_| self.shared.state() != ContextState::Closed) {
                self.core.pre_render(&mut guard.state());
            }
        }

        if self.shared.state() == ContextState::Running {
            self.core.process();
            self.shared.set_current_frame(self.core.ctx.current_frame);
        } else {
            self.core.last.silence();
        }

        {
            let guard = if blocking {
                Some(handler.offline_lock())
            } else {
                handler.try_lock()
            };
            if let Some(guard) = guard.filter(|_| self.shared.state() != ContextState::Closed) {
                self.core.post_render(&mut guard.state(), &self.shared);
            }
        }

        handler.leave_audio_thread();
    }
}

impl RenderCore {
    fn pre_render(&mut self, g: &mut GraphState) {
        g.initialized = true;
        if mem::take(&mut g.resume_pending) {
            self.tasks.post(ControlTask::Resumed);
        }
        g.prune_stoppable_sources();
        self.handle_deferred(g);
    }

    fn post_render(&mut self, g: &mut GraphState, shared: &Arc<ContextShared>) {
        // Sources that finished before the previous successful post-render
        // are released now; the ones that finished since wait one more turn.
        mem::swap(&mut self.released, &mut g.finished_sources);
        for i in 0..self.released.len() {
            let id = self.released[i];
            if g.release_source(id) {
                self.tasks.post(ControlTask::SourceEnded(id));
            }
        }
        self.released.clear();
        for id in self.finished.drain(..) {
            if g.is_active_source(id) && !g.finished_sources.contains(&id) {
                g.finished_sources.push(id);
            }
        }

        if !g.marked_for_deletion.is_empty() {
            let GraphState {
                marked_for_deletion,
                nodes_to_delete,
                index,
                pending_nodes,
                ..
            } = &mut *g;
            for id in marked_for_deletion.drain(..) {
                let render = index
                    .get(&id)
                    .and_then(|idx| self.graph.take(idx.index(), id))
                    .or_else(|| {
                        let pos = pending_nodes.iter().position(|n| n.id == id)?;
                        Some(pending_nodes.swap_remove(pos))
                    });
                nodes_to_delete.push((id, render));
            }
            if !g.deletion_scheduled {
                g.deletion_scheduled = true;
                self.tasks
                    .post(ControlTask::DeleteMarkedNodes(Arc::clone(shared)));
            }
        }

        self.handle_deferred(g);
    }

    /// Bring the rendering snapshot in line with the pending graph.
    fn handle_deferred(&mut self, g: &mut GraphState) {
        for node in g.pending_nodes.drain(..) {
            self.graph.adopt(node);
        }

        let GraphState {
            graph,
            index,
            dirty_outputs,
            dirty_junctions,
            pull_pending,
            pull_dirty,
            ..
        } = &mut *g;

        for key in dirty_outputs.drain() {
            let Some(&idx) = index.get(&key.node) else {
                continue;
            };
            let Some(&channels) = graph[idx].output_channels.get(key.output) else {
                continue;
            };
            if let Some(bus) = self
                .graph
                .get_mut(idx.index(), key.node)
                .and_then(|n| n.outputs.get_mut(key.output))
            {
                bus.set_channel_count(channels);
            }
        }

        for key in dirty_junctions.drain() {
            let Some(&idx) = index.get(&key.node) else {
                continue;
            };
            let Some(sources) = self
                .graph
                .get_mut(idx.index(), key.node)
                .and_then(|n| n.sources_mut(key.port))
            else {
                continue;
            };
            sources.clear();
            for edge in graph.edges_directed(idx, Incoming) {
                let conn = edge.weight();
                if conn.port == key.port {
                    sources.push(Source {
                        slot: edge.source().index(),
                        output: conn.output,
                    });
                }
            }
        }

        if mem::take(pull_dirty) {
            let pull_list = &mut self.graph.pull_list;
            pull_list.clear();
            pull_list.extend(pull_pending.iter().filter_map(|id| index.get(id)).map(|idx| idx.index()));
        }
    }

    fn process(&mut self) {
        self.quantum += 1;
        self.pull(self.destination);
        for i in 0..self.graph.pull_list.len() {
            let slot = self.graph.pull_list[i];
            self.pull(slot);
        }

        let out = self
            .graph
            .nodes
            .get(self.destination)
            .and_then(Option::as_ref)
            .and_then(|n| n.outputs.first());
        match out {
            Some(out) => self.last.copy_from(out),
            None => self.last.silence(),
        }
        self.ctx.current_frame += RENDER_QUANTUM_FRAMES as u64;
    }

    /// Render `slot` and everything upstream of it, once per quantum.
    ///
    /// The node is taken out of the arena while it renders; an upstream edge
    /// that leads back to it (a cycle) finds the slot empty and contributes
    /// silence.
    fn pull(&mut self, slot: usize) {
        let Some(mut node) = self.graph.nodes.get_mut(slot).and_then(Option::take) else {
            return;
        };

        if node.stamp != self.quantum {
            node.stamp = self.quantum;
            for input in 0..node.input_sources.len() {
                for k in 0..node.input_sources[input].len() {
                    let up = node.input_sources[input][k].slot;
                    self.pull(up);
                }
            }
            for param in 0..node.param_sources.len() {
                for k in 0..node.param_sources[param].len() {
                    let up = node.param_sources[param][k].slot;
                    self.pull(up);
                }
            }

            node.gather(&self.graph.nodes, &self.ctx);
            let status = node.process(&self.ctx);
            // a full list must not grow here; the node reports again next
            // quantum, after post-render has drained it
            if status == ProcessStatus::Finished
                && !node.finished
                && self.finished.len() < self.finished.capacity()
            {
                node.finished = true;
                self.finished.push(node.id);
            }
        }

        self.graph.nodes[slot] = Some(node);
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let mut graph = Some(mem::take(&mut self.core.graph));
        let tasks = &mut self.core.tasks;
        let posted = self.shared.post_if_attached(|| {
            tasks.flush();
            if let Some(graph) = graph.take() {
                tasks.post(ControlTask::Retired(graph));
            }
            tasks.flush();
        });
        if posted {
            if tasks.pending_overflow() > 0 {
                self.shared.stash_tasks(tasks.take_overflow());
            }
            return;
        }

        let Some(graph) = graph else {
            return;
        };
        let (signal, wait) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("rendergraph-reaper".into())
            .spawn(move || {
                // disconnects once the renderer has dropped its own `shared`
                let _ = wait.recv();
                shared.reap(graph);
            });
        match spawned {
            Ok(_) => self.reaped = Some(signal),
            Err(e) => tracing::warn!(error = %e, "could not spawn reaper; freeing nodes in place"),
        }
    }
}
