//! Core node trait, buses and node handles.

use core::fmt;
use core::marker::PhantomData;
use std::sync::Arc;

use dasp_graph::Buffer;
use rtrb::{Consumer, Producer};

use crate::config::{MAX_CHANNELS, RENDER_QUANTUM_FRAMES};
use crate::context::ContextShared;
use crate::param::AudioParam;

/// Information available during audio processing.
///
/// Passed to every [`AudioNode::process`] call.
#[derive(Clone, Copy, Debug)]
pub struct ProcessContext {
    /// Sample rate of the graph in Hz (e.g., 44100, 48000)
    pub sample_rate: u32,
    /// Number of frames per quantum (always [`RENDER_QUANTUM_FRAMES`])
    pub buffer_size: usize,
    /// Index of the first frame of the quantum being rendered
    pub current_frame: u64,
}

impl ProcessContext {
    pub(crate) fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            buffer_size: RENDER_QUANTUM_FRAMES,
            current_frame: 0,
        }
    }

    /// Time in seconds of the first frame of this quantum.
    pub fn current_time(&self) -> f64 {
        self.current_frame as f64 / self.sample_rate as f64
    }

    /// Frame one past the end of this quantum.
    pub fn end_frame(&self) -> u64 {
        self.current_frame + self.buffer_size as u64
    }
}

/// What a node reports after processing a quantum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Keep going.
    Active,
    /// The node will produce nothing but silence from now on. Reported by
    /// scheduled sources once their stop time has been reached. A finished
    /// node may still be processed for a quantum or two before it is
    /// detached.
    Finished,
}

/// Unique identifier for a node within a context.
///
/// Ids are never reused, so a stale id reliably reports
/// [`GraphError::UnknownNode`](crate::GraphError::UnknownNode).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies the context a node or param belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ContextId(pub(crate) usize);

/// One node input or output: up to [`MAX_CHANNELS`] channels of one quantum.
///
/// Storage for every channel is allocated up front so changing the channel
/// count on the audio thread never allocates.
#[derive(Clone)]
pub struct Bus {
    buffers: Vec<Buffer>,
    channels: usize,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("channels", &self.channels)
            .field("peak", &self.peak())
            .finish()
    }
}

impl Bus {
    /// A silent bus with `channels` channels (clamped to `1..=MAX_CHANNELS`).
    pub fn new(channels: usize) -> Self {
        Self {
            buffers: vec![Buffer::SILENT; MAX_CHANNELS],
            channels: channels.clamp(1, MAX_CHANNELS),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// Change the number of active channels. Newly exposed channels are
    /// silent.
    pub fn set_channel_count(&mut self, channels: usize) {
        let channels = channels.clamp(1, MAX_CHANNELS);
        for buffer in &mut self.buffers[self.channels.min(channels)..channels] {
            *buffer = Buffer::SILENT;
        }
        self.channels = channels;
    }

    pub fn channels(&self) -> &[Buffer] {
        &self.buffers[..self.channels]
    }

    pub fn channels_mut(&mut self) -> &mut [Buffer] {
        &mut self.buffers[..self.channels]
    }

    /// Channel `index`, or the last channel if `index` is past the end.
    pub fn channel(&self, index: usize) -> &Buffer {
        &self.buffers[index.min(self.channels - 1)]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut Buffer {
        let index = index.min(self.channels - 1);
        &mut self.buffers[index]
    }

    pub fn silence(&mut self) {
        for buffer in self.channels_mut() {
            *buffer = Buffer::SILENT;
        }
    }

    pub fn is_silent(&self) -> bool {
        self.channels()
            .iter()
            .all(|b| b.iter().all(|&s| s == 0.0))
    }

    /// Mix `other` into this bus. A mono source feeds every channel; otherwise
    /// channels are summed index by index and extra source channels dropped.
    pub fn sum_from(&mut self, other: &Bus) {
        if other.channels == 1 {
            let src = &other.buffers[0];
            for dst in self.channels_mut() {
                for (d, s) in dst.iter_mut().zip(src.iter()) {
                    *d += *s;
                }
            }
            return;
        }
        for (dst, src) in self.channels_mut().iter_mut().zip(other.channels()) {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d += *s;
            }
        }
    }

    /// Overwrite this bus with `other`, using the same mixing rule as
    /// [`sum_from`](Self::sum_from).
    pub fn copy_from(&mut self, other: &Bus) {
        self.silence();
        self.sum_from(other);
    }

    /// Largest absolute sample value over all active channels.
    pub fn peak(&self) -> f32 {
        self.channels()
            .iter()
            .flat_map(|b| b.iter())
            .fold(0.0f32, |peak, s| peak.max(s.abs()))
    }

    /// Average of the active channels, written into `out`.
    pub fn mix_down_into(&self, out: &mut Buffer) {
        let scale = 1.0 / self.channels as f32;
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.channels().iter().map(|b| b[i]).sum::<f32>() * scale;
        }
    }
}

/// The DSP contract every node implements.
///
/// Processors are created on the control thread, moved to the audio thread
/// when the renderer next takes the graph lock, and handed back to the
/// control thread to be dropped once the node is deleted. The renderer only
/// ever calls the methods below; it never looks inside.
///
/// # Message-Based Parameters
///
/// Discrete updates (start/stop, waveform changes, ...) arrive through a
/// lock-free queue as `Self::Message`. Drain `messages` at the top of
/// `process`. Continuous values belong in params instead: they are listed as
/// [`ParamDescriptor`](crate::ParamDescriptor)s when the node is added and
/// arrive in `process` as one [`Buffer`] of per-frame values each.
///
/// ```
/// use rendergraph::{AudioNode, Buffer, Bus, ProcessContext, ProcessStatus};
///
/// struct Invert;
///
/// impl AudioNode for Invert {
///     type Message = ();
///
///     fn process(
///         &mut self,
///         _ctx: &ProcessContext,
///         _messages: impl Iterator<Item = ()>,
///         inputs: &[Bus],
///         _params: &[Buffer],
///         outputs: &mut [Bus],
///     ) -> ProcessStatus {
///         let (input, output) = (&inputs[0], &mut outputs[0]);
///         output.set_channel_count(input.channel_count());
///         for (o, i) in output.channels_mut().iter_mut().zip(input.channels()) {
///             for (o, i) in o.iter_mut().zip(i.iter()) {
///                 *o = -*i;
///             }
///         }
///         ProcessStatus::Active
///     }
///
///     fn num_inputs(&self) -> usize { 1 }
/// }
/// ```
pub trait AudioNode: Send + 'static {
    /// Message type for discrete updates. Use `()` for nodes without any.
    type Message: Send + 'static;

    /// Process one quantum.
    ///
    /// - `inputs` - one summed bus per input
    /// - `params` - per-frame values for each registered param, automation
    ///   and audio-rate connections already applied
    /// - `outputs` - one bus per output, to be filled
    fn process(
        &mut self,
        ctx: &ProcessContext,
        messages: impl Iterator<Item = Self::Message>,
        inputs: &[Bus],
        params: &[Buffer],
        outputs: &mut [Bus],
    ) -> ProcessStatus;

    /// Called on the control thread when the node is added.
    fn initialize(&mut self, _ctx: &ProcessContext) {}

    /// Called on the control thread right before the processor is dropped.
    fn uninitialize(&mut self) {}

    /// Seconds of output this node keeps producing after its inputs go silent.
    fn tail_time(&self) -> f64 {
        0.0
    }

    /// Seconds of delay this node adds.
    fn latency_time(&self) -> f64 {
        0.0
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn num_outputs(&self) -> usize {
        1
    }

    /// Initial channel count of output `output`.
    fn output_channels(&self, _output: usize) -> usize {
        1
    }

    /// Whether this node must be processed every quantum even when nothing
    /// downstream reads it (analysers, meters).
    fn requires_automatic_pull(&self) -> bool {
        false
    }
}

/// Object-safe view of an [`AudioNode`] plus its message queue.
pub(crate) trait ErasedNode: Send {
    fn process_erased(
        &mut self,
        ctx: &ProcessContext,
        inputs: &[Bus],
        params: &[Buffer],
        outputs: &mut [Bus],
    ) -> ProcessStatus;

    fn uninitialize(&mut self);
}

pub(crate) struct NodeWrapper<N: AudioNode> {
    pub(crate) node: N,
    pub(crate) receiver: Consumer<N::Message>,
}

impl<N: AudioNode> ErasedNode for NodeWrapper<N> {
    fn process_erased(
        &mut self,
        ctx: &ProcessContext,
        inputs: &[Bus],
        params: &[Buffer],
        outputs: &mut [Bus],
    ) -> ProcessStatus {
        let receiver = &mut self.receiver;
        let messages = core::iter::from_fn(|| receiver.pop().ok());
        self.node.process(ctx, messages, inputs, params, outputs)
    }

    fn uninitialize(&mut self) {
        self.node.uninitialize();
    }
}

/// Anything that names a node of some context.
pub trait AsNode {
    fn node_id(&self) -> NodeId;
    fn context_id(&self) -> ContextId;
}

/// Control-thread handle to a node.
///
/// Returned by [`BaseAudioContext::add_node`](crate::BaseAudioContext::add_node).
/// The handle is the node's external reference: dropping it lets the graph
/// delete the node once nothing is connected from it and it is not an active
/// source. Messages go straight to the node's queue without locking.
pub struct NodeHandle<M: Send + 'static> {
    pub(crate) id: NodeId,
    pub(crate) sender: Producer<M>,
    pub(crate) params: Vec<AudioParam>,
    pub(crate) context: Arc<ContextShared>,
    pub(crate) _marker: PhantomData<M>,
}

impl<M: Send + 'static> NodeHandle<M> {
    /// Send a message to the node; it is applied at the start of its next
    /// quantum. Returns `Err(msg)` if the queue is full.
    pub fn send(&mut self, msg: M) -> Result<(), M> {
        self.sender.push(msg).map_err(|rtrb::PushError::Full(m)| m)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn is_full(&self) -> bool {
        self.sender.is_full()
    }

    /// Param `index`, in the order it was registered.
    pub fn param(&self, index: usize) -> Option<&AudioParam> {
        self.params.get(index)
    }

    pub fn params(&self) -> &[AudioParam] {
        &self.params
    }

    pub(crate) fn context(&self) -> &Arc<ContextShared> {
        &self.context
    }
}

impl<M: Send + 'static> AsNode for NodeHandle<M> {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn context_id(&self) -> ContextId {
        self.context.id()
    }
}

impl<M: Send + 'static> fmt::Debug for NodeHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id)
            .field("context", &self.context.id())
            .finish()
    }
}

impl<M: Send + 'static> Drop for NodeHandle<M> {
    fn drop(&mut self) {
        self.context.release_external_ref(self.id);
    }
}

impl<T: AsNode + ?Sized> AsNode for &T {
    fn node_id(&self) -> NodeId {
        (**self).node_id()
    }

    fn context_id(&self) -> ContextId {
        (**self).context_id()
    }
}
