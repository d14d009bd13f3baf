//! Contexts: the control-thread owners of a render graph.
//!
//! Both flavors share [`ContextShared`] (graph lock, task queue, state
//! machine) and expose the same control API through [`BaseAudioContext`].
//! [`AudioContext`] is driven by a device callback or by hand;
//! [`OfflineAudioContext`] renders on a worker thread as fast as it can.

mod offline;
mod realtime;

pub use offline::OfflineAudioContext;
pub use realtime::AudioContext;

pub use crate::nodes::DestinationNode;

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rtrb::RingBuffer;

use crate::config::{validate_channel_count, ContextOptions, RENDER_QUANTUM_FRAMES};
use crate::error::{GraphError, Result};
use crate::graph::{GraphState, NodeEntry, Port};
use crate::handler::{task_queue, ControlTask, DeferredTaskHandler, GraphGuard, TaskReceiver};
use crate::listener::{AudioListener, ListenerShared};
use crate::node::{AsNode, AudioNode, Bus, ContextId, NodeHandle, NodeId, NodeWrapper, ProcessContext};
use crate::nodes::sink::destination::DestinationProcessor;
use crate::param::{AudioParam, ParamDescriptor, ParamShared};
use crate::render::{RenderGraph, RenderNode, Renderer};

static NEXT_CONTEXT_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContextState {
    Suspended = 0,
    Running = 1,
    Closed = 2,
}

impl ContextState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ContextState::Suspended,
            1 => ContextState::Running,
            _ => ContextState::Closed,
        }
    }
}

/// Notifications delivered by [`BaseAudioContext::process_control_tasks`].
#[derive(Clone, Debug, PartialEq)]
pub enum ContextEvent {
    /// The audio thread picked up a `resume()`.
    Resumed,
    /// A started source finished and the context dropped its reference.
    SourceEnded(NodeId),
    /// Offline rendering halted at `frame`, as requested by `suspend`.
    SuspendedAt { frame: u64 },
    /// Offline rendering finished.
    RenderComplete(AudioBuffer),
}

/// Planar rendered audio.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(channels: usize, length: usize, sample_rate: u32) -> Self {
        Self {
            channels: vec![vec![0.0; length]; channels.max(1)],
            sample_rate,
        }
    }

    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Frames per channel.
    pub fn length(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration(&self) -> f64 {
        self.length() as f64 / self.sample_rate as f64
    }

    /// Samples of channel `index`; panics if out of range.
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn into_channels(self) -> Vec<Vec<f32>> {
        self.channels
    }

    /// Copy one quantum starting at frame `offset`, truncated to the length.
    pub(crate) fn write_quantum(&mut self, bus: &Bus, offset: usize) {
        for (ch, samples) in self.channels.iter_mut().enumerate() {
            let Some(dst) = samples.get_mut(offset..) else {
                continue;
            };
            let n = dst.len().min(RENDER_QUANTUM_FRAMES);
            dst[..n].copy_from_slice(&bus.channel(ch)[..n]);
        }
    }
}

/// State shared by a context, its renderer, and every handle it gives out.
#[doc(hidden)]
pub struct ContextShared {
    id: ContextId,
    options: ContextOptions,
    pub(crate) handler: DeferredTaskHandler,
    state: AtomicU8,
    current_frame: AtomicU64,
    tasks: TaskReceiver,
    /// Tasks a dropped renderer could not fit into the queue.
    stashed: Mutex<Vec<ControlTask>>,
    /// Cleared when the context is dropped. After that nobody drains the
    /// task queue, so a retiring renderer frees its nodes on a reaper thread.
    control_attached: Mutex<bool>,
    listener: Arc<ListenerShared>,
    destination: NodeId,
}

impl ContextShared {
    pub(crate) fn new(options: ContextOptions) -> Result<(Arc<Self>, Renderer)> {
        options.validate()?;

        let mut graph = GraphState::new(&options);
        let channels = options.channels;
        let (_, receiver) = RingBuffer::new(1);
        let processor = NodeWrapper {
            node: DestinationProcessor::new(channels),
            receiver,
        };
        let render = RenderNode::new(Box::new(processor), 1, &[channels], Vec::new());
        let entry = NodeEntry::new("Destination", 1, vec![channels], Vec::new());
        let destination = graph.add_node(entry, render);
        graph.destination = Some(destination);
        let slot = graph.node_index(destination)?.index();

        let (sender, receiver) = task_queue(options.task_queue_size);
        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(Self {
            id,
            handler: DeferredTaskHandler::new(graph),
            state: AtomicU8::new(ContextState::Suspended as u8),
            current_frame: AtomicU64::new(0),
            tasks: receiver,
            stashed: Mutex::new(Vec::new()),
            control_attached: Mutex::new(true),
            listener: Arc::new(ListenerShared::default()),
            destination,
            options,
        });
        let renderer = Renderer::new(Arc::clone(&shared), sender, &shared.options, slot);
        tracing::debug!(context = id.0, sample_rate = shared.options.sample_rate, channels, "context created");
        Ok((shared, renderer))
    }

    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub(crate) fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ContextState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn current_frame(&self) -> u64 {
        self.current_frame.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_frame(&self, frame: u64) {
        self.current_frame.store(frame, Ordering::Release);
    }

    pub(crate) fn current_time(&self) -> f64 {
        self.current_frame() as f64 / self.options.sample_rate as f64
    }

    pub(crate) fn listener(&self) -> &Arc<ListenerShared> {
        &self.listener
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.state() == ContextState::Closed {
            return Err(GraphError::invalid_state("context is closed"));
        }
        Ok(())
    }

    /// Resolve `node` to an id of this context.
    pub(crate) fn own(&self, node: &impl AsNode) -> Result<NodeId> {
        if node.context_id() != self.id {
            return Err(GraphError::InvalidAccess(format!(
                "node {:?} belongs to another context",
                node.node_id()
            )));
        }
        Ok(node.node_id())
    }

    /// Run `f` on the pending graph under the lock. Nodes deleted as a side
    /// effect are dropped after the lock is released.
    pub(crate) fn with_graph<R>(&self, f: impl FnOnce(&mut GraphState) -> Result<R>) -> Result<R> {
        let mut doomed = Vec::new();
        let result = {
            let guard = self.handler.lock();
            let mut g = guard.state();
            let result = f(&mut g);
            g.collect_control_deletions(&mut doomed);
            result
        };
        drop(doomed);
        result
    }

    pub(crate) fn add_node<N: AudioNode>(
        self: &Arc<Self>,
        mut node: N,
        descriptors: &[ParamDescriptor],
    ) -> Result<NodeHandle<N::Message>> {
        self.ensure_open()?;
        for descriptor in descriptors {
            descriptor.validate()?;
        }
        let num_inputs = node.num_inputs();
        let output_channels: Vec<usize> = (0..node.num_outputs())
            .map(|output| node.output_channels(output))
            .collect();
        for &channels in &output_channels {
            validate_channel_count(channels)?;
        }

        let mut ctx = ProcessContext::new(self.options.sample_rate);
        ctx.current_frame = self.current_frame();
        node.initialize(&ctx);

        let params: Vec<Arc<ParamShared>> = descriptors
            .iter()
            .map(|d| Arc::new(ParamShared::new(*d)))
            .collect();
        let name = core::any::type_name::<N>().rsplit("::").next().unwrap_or("node");
        let mut entry = NodeEntry::new(name, num_inputs, output_channels.clone(), params.clone());
        entry.tail_time = node.tail_time();
        entry.latency_time = node.latency_time();
        entry.requires_pull = node.requires_automatic_pull();

        let (sender, receiver) = RingBuffer::new(self.options.message_queue_size);
        let processor = NodeWrapper { node, receiver };
        let render = RenderNode::new(Box::new(processor), num_inputs, &output_channels, params.clone());
        let id = self.with_graph(|g| Ok(g.add_node(entry, render)))?;

        let params = params
            .into_iter()
            .enumerate()
            .map(|(index, shared)| AudioParam::new(shared, id, index, Arc::clone(self)))
            .collect();
        Ok(NodeHandle {
            id,
            sender,
            params,
            context: Arc::clone(self),
            _marker: PhantomData,
        })
    }

    pub(crate) fn release_external_ref(&self, id: NodeId) {
        // a failure here only means the node is already gone
        let _ = self.with_graph(|g| {
            g.release_external(id);
            Ok(())
        });
    }

    pub(crate) fn activate_source(&self, id: NodeId) -> Result<()> {
        self.ensure_open()?;
        self.with_graph(|g| g.activate_source(id))
    }

    pub(crate) fn resume(&self) -> Result<()> {
        let guard = self.handler.lock();
        self.transition(ContextState::Suspended, ContextState::Running)?;
        guard.state().resume_pending = true;
        Ok(())
    }

    pub(crate) fn suspend(&self) -> Result<()> {
        self.transition(ContextState::Running, ContextState::Suspended)
    }

    fn transition(&self, from: ContextState, to: ContextState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| {
                GraphError::invalid_state(format!(
                    "cannot go from {:?} to {:?}",
                    ContextState::from_u8(actual),
                    to
                ))
            })?;
        tracing::debug!(context = self.id.0, ?from, ?to, "state changed");
        Ok(())
    }

    /// Drain the audio-to-control queue.
    pub(crate) fn process_control_tasks(&self) -> Vec<ContextEvent> {
        let mut tasks = self.tasks.drain();
        tasks.append(&mut self.stashed.lock());

        let mut events = Vec::new();
        for task in tasks {
            match task {
                ControlTask::DeleteMarkedNodes(context) => context.delete_marked_nodes(),
                ControlTask::Resumed => events.push(ContextEvent::Resumed),
                ControlTask::SourceEnded(id) => {
                    tracing::trace!(node = ?id, "source ended");
                    events.push(ContextEvent::SourceEnded(id));
                }
                ControlTask::Suspended { frame } => events.push(ContextEvent::SuspendedAt { frame }),
                ControlTask::RenderComplete(buffer) => events.push(ContextEvent::RenderComplete(buffer)),
                ControlTask::Retired(graph) => self.renderer_retired(graph),
            }
        }
        events
    }

    pub(crate) fn stash_tasks(&self, tasks: Vec<ControlTask>) {
        tracing::warn!(count = tasks.len(), "task queue full while retiring renderer");
        self.stashed.lock().extend(tasks);
    }

    fn delete_marked_nodes(&self) {
        let mut doomed = Vec::new();
        {
            let guard = self.handler.lock();
            let mut g = guard.state();
            g.deletion_scheduled = false;
            g.delete_handed_off(&mut doomed);
            g.collect_control_deletions(&mut doomed);
        }
        tracing::trace!(count = doomed.len(), "freeing handed-off nodes");
        drop(doomed);
    }

    /// Mark the control side as gone. A renderer dropped after this does
    /// not post to the task queue.
    pub(crate) fn detach_control(&self) {
        *self.control_attached.lock() = false;
    }

    /// Run `post` while the control side is still attached. Returns `false`
    /// without running it otherwise.
    pub(crate) fn post_if_attached(&self, post: impl FnOnce()) -> bool {
        let attached = self.control_attached.lock();
        if *attached {
            post();
        }
        *attached
    }

    /// Free a retired renderer's nodes and everything still queued. Runs on
    /// the reaper thread once the control side is gone.
    pub(crate) fn reap(&self, graph: Box<RenderGraph>) {
        self.renderer_retired(graph);
        self.shutdown();
    }

    fn renderer_retired(&self, graph: Box<RenderGraph>) {
        let mut doomed = Vec::new();
        {
            let guard = self.handler.lock();
            let mut g = guard.state();
            g.retire_renderer();
            g.delete_handed_off(&mut doomed);
            g.collect_control_deletions(&mut doomed);
        }
        tracing::debug!(context = self.id.0, nodes = graph.live_nodes(), "renderer retired");
        drop(graph);
        drop(doomed);
    }

    /// Close the context and free everything that can be freed.
    ///
    /// Safe to call more than once. After the state flips to `Closed` the
    /// renderer never takes the graph lock again, so deletion no longer
    /// waits for a hand-off.
    pub(crate) fn shutdown(&self) {
        let previous = ContextState::from_u8(self.state.swap(ContextState::Closed as u8, Ordering::AcqRel));
        if previous != ContextState::Closed {
            tracing::debug!(context = self.id.0, ?previous, "context closed");
        }
        loop {
            self.process_control_tasks();
            let mut doomed = Vec::new();
            let remaining = {
                let guard = self.handler.lock();
                let mut g = guard.state();
                g.retire_renderer();
                g.delete_handed_off(&mut doomed);
                g.collect_control_deletions(&mut doomed);
                doomed.append(&mut g.pending_nodes);
                g.has_pending_deletions()
            };
            let freed = doomed.len();
            drop(doomed);
            if !remaining && freed == 0 {
                break;
            }
        }
    }
}

/// The control API shared by [`AudioContext`] and [`OfflineAudioContext`].
///
/// All methods run on the control thread. Graph edits take the graph lock
/// (blocking); they become visible to the audio thread at the next quantum
/// for which it manages to take the lock.
pub trait BaseAudioContext {
    #[doc(hidden)]
    fn shared(&self) -> &Arc<ContextShared>;

    fn id(&self) -> ContextId {
        self.shared().id()
    }

    fn sample_rate(&self) -> u32 {
        self.shared().options().sample_rate
    }

    /// Channel count of the destination.
    fn channels(&self) -> usize {
        self.shared().options().channels
    }

    fn state(&self) -> ContextState {
        self.shared().state()
    }

    /// First frame of the next quantum the audio thread will render.
    fn current_frame(&self) -> u64 {
        self.shared().current_frame()
    }

    fn current_time(&self) -> f64 {
        self.shared().current_time()
    }

    fn destination(&self) -> DestinationNode {
        let shared = self.shared();
        DestinationNode::new(shared.destination, Arc::clone(shared), shared.options().channels)
    }

    fn listener(&self) -> AudioListener {
        AudioListener::new(Arc::clone(self.shared().listener()))
    }

    /// Take the graph lock for a batch of edits. While the guard lives the
    /// audio thread keeps rendering its previous snapshot.
    fn lock(&self) -> GraphGuard<'_> {
        self.shared().handler.lock()
    }

    /// Register a processor with the given params and get its handle.
    fn add_node<N: AudioNode>(
        &self,
        node: N,
        params: &[ParamDescriptor],
    ) -> Result<NodeHandle<N::Message>>
    where
        Self: Sized,
    {
        self.shared().add_node(node, params)
    }

    /// Connect output 0 of `from` to input 0 of `to`.
    fn connect(&self, from: &impl AsNode, to: &impl AsNode) -> Result<()>
    where
        Self: Sized,
    {
        self.connect_with(from, 0, to, 0)
    }

    fn connect_with(&self, from: &impl AsNode, output: usize, to: &impl AsNode, input: usize) -> Result<()>
    where
        Self: Sized,
    {
        let shared = self.shared();
        shared.ensure_open()?;
        let (from, to) = (shared.own(from)?, shared.own(to)?);
        shared.with_graph(|g| g.connect(from, output, to, Port::Input(input)))
    }

    /// Connect `output` of `from` to a param; the signal is mixed to mono and
    /// added to the param's automation value.
    fn connect_param(&self, from: &impl AsNode, output: usize, param: &AudioParam) -> Result<()>
    where
        Self: Sized,
    {
        let shared = self.shared();
        shared.ensure_open()?;
        let from = shared.own(from)?;
        if param.context_id() != shared.id() {
            return Err(GraphError::InvalidAccess("param belongs to another context".into()));
        }
        let (to, index) = (param.node_id(), param.index());
        shared.with_graph(|g| g.connect(from, output, to, Port::Param(index)))
    }

    /// Remove every outgoing connection of `from`. Returns how many went.
    fn disconnect(&self, from: &impl AsNode) -> Result<usize>
    where
        Self: Sized,
    {
        let shared = self.shared();
        let from = shared.own(from)?;
        shared.with_graph(|g| g.disconnect_where(from, |_, _| true))
    }

    /// Remove every connection from `from` into inputs of `to`.
    fn disconnect_from(&self, from: &impl AsNode, to: &impl AsNode) -> Result<()>
    where
        Self: Sized,
    {
        let shared = self.shared();
        let (from, to) = (shared.own(from)?, shared.own(to)?);
        let removed = shared.with_graph(|g| {
            g.disconnect_where(from, |target, c| target == to && matches!(c.port, Port::Input(_)))
        })?;
        if removed == 0 {
            return Err(GraphError::InvalidAccess(format!("{:?} is not connected to {:?}", from, to)));
        }
        Ok(())
    }

    fn disconnect_param(&self, from: &impl AsNode, param: &AudioParam) -> Result<()>
    where
        Self: Sized,
    {
        let shared = self.shared();
        let from = shared.own(from)?;
        let (to, port) = (param.node_id(), Port::Param(param.index()));
        let removed = shared.with_graph(|g| g.disconnect_where(from, |target, c| target == to && c.port == port))?;
        if removed == 0 {
            return Err(GraphError::InvalidAccess(format!(
                "{:?} is not connected to param `{}`",
                from,
                param.name()
            )));
        }
        Ok(())
    }

    fn set_output_channel_count(&self, node: &impl AsNode, output: usize, channels: usize) -> Result<()>
    where
        Self: Sized,
    {
        let shared = self.shared();
        let id = shared.own(node)?;
        shared.with_graph(|g| g.set_output_channels(id, output, channels))
    }

    /// Apply whatever the audio thread handed back: free deleted nodes and
    /// collect notifications. Call this regularly from the control thread.
    fn process_control_tasks(&self) -> Vec<ContextEvent> {
        self.shared().process_control_tasks()
    }

    /// Nodes in the pending graph, destination included.
    fn node_count(&self) -> usize {
        let guard = self.lock();
        let count = guard.state().graph.node_count();
        count
    }

    fn is_alive(&self, id: NodeId) -> bool {
        let guard = self.lock();
        let alive = guard.state().index.contains_key(&id);
        alive
    }

    fn active_source_count(&self) -> usize {
        let guard = self.lock();
        let count = guard.state().active_sources.len();
        count
    }

    /// Outgoing edges plus references held by the context.
    fn connection_refs(&self, id: NodeId) -> Result<usize> {
        let guard = self.lock();
        let refs = guard.state().connection_refs(id);
        refs
    }

    /// Nodes connected to input `input` of `id` in the pending graph, sorted.
    fn connected_inputs(&self, id: NodeId, input: usize) -> Result<Vec<NodeId>> {
        let guard = self.lock();
        let sources = guard.state().sources_of(id, Port::Input(input));
        sources
    }

    /// Nodes deleted so far.
    fn deleted_count(&self) -> u64 {
        let guard = self.lock();
        let deleted = guard.state().deleted;
        deleted
    }
}
