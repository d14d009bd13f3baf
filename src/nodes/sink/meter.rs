//! Peak meter

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use delegate::delegate;

use crate::context::BaseAudioContext;
use crate::error::Result;
use crate::node::{AsNode, AudioNode, Bus, ContextId, NodeHandle, NodeId, ProcessContext, ProcessStatus};
use crate::Buffer;

#[derive(Debug, Default)]
struct MeterShared {
    /// f32 bits of the largest absolute sample since the last reset
    peak: AtomicU32,
    frames: AtomicU64,
}

struct Meter {
    shared: Arc<MeterShared>,
}

impl AudioNode for Meter {
    type Message = ();

    fn process(
        &mut self,
        ctx: &ProcessContext,
        _messages: impl Iterator<Item = ()>,
        inputs: &[Bus],
        _params: &[Buffer],
        outputs: &mut [Bus],
    ) -> ProcessStatus {
        let (input, output) = (&inputs[0], &mut outputs[0]);
        output.set_channel_count(input.channel_count());
        output.copy_from(input);

        let peak = input.peak();
        // only the audio thread raises it, so load-then-store cannot lose a value
        let prev = f32::from_bits(self.shared.peak.load(Ordering::Relaxed));
        if peak > prev {
            self.shared.peak.store(peak.to_bits(), Ordering::Relaxed);
        }
        self.shared
            .frames
            .fetch_add(ctx.buffer_size as u64, Ordering::Relaxed);
        ProcessStatus::Active
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn requires_automatic_pull(&self) -> bool {
        true
    }
}

/// Pass-through that records the peak level of its input.
///
/// Rendered every quantum even when its output is unconnected, so a meter
/// hanging off the side of a chain keeps measuring.
#[derive(Debug)]
pub struct MeterNode {
    handle: NodeHandle<()>,
    shared: Arc<MeterShared>,
}

impl MeterNode {
    pub fn new(ctx: &impl BaseAudioContext) -> Result<Self> {
        let shared = Arc::new(MeterShared::default());
        let handle = ctx.add_node(
            Meter {
                shared: Arc::clone(&shared),
            },
            &[],
        )?;
        Ok(Self { handle, shared })
    }

    /// Largest absolute sample seen since creation or the last [`reset`](Self::reset).
    pub fn peak(&self) -> f32 {
        f32::from_bits(self.shared.peak.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.shared.peak.store(0.0f32.to_bits(), Ordering::Relaxed);
    }

    /// Frames this meter has processed.
    pub fn frames_processed(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    delegate! {
        to self.handle {
            pub fn id(&self) -> NodeId;
        }
    }
}

impl AsNode for MeterNode {
    delegate! {
        to self.handle {
            fn node_id(&self) -> NodeId;
            fn context_id(&self) -> ContextId;
        }
    }
}
