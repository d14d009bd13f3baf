//! The context's terminal node

use std::sync::Arc;

use crate::context::ContextShared;
use crate::node::{AsNode, AudioNode, Bus, ContextId, NodeId, ProcessContext, ProcessStatus};
use crate::Buffer;

/// Copies its summed input to its output, which the renderer hands to the
/// device. Mono input is spread over every channel.
pub(crate) struct DestinationProcessor {
    channels: usize,
}

impl DestinationProcessor {
    pub(crate) fn new(channels: usize) -> Self {
        Self { channels }
    }
}

impl AudioNode for DestinationProcessor {
    type Message = ();

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        _messages: impl Iterator<Item = ()>,
        inputs: &[Bus],
        _params: &[Buffer],
        outputs: &mut [Bus],
    ) -> ProcessStatus {
        outputs[0].copy_from(&inputs[0]);
        ProcessStatus::Active
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn output_channels(&self, _output: usize) -> usize {
        self.channels
    }
}

/// Handle to a context's destination.
///
/// The destination is owned by the context and lives as long as it does, so
/// this handle holds no reference of its own and may be cloned freely.
#[derive(Clone)]
pub struct DestinationNode {
    id: NodeId,
    context: Arc<ContextShared>,
    channels: usize,
}

impl DestinationNode {
    pub(crate) fn new(id: NodeId, context: Arc<ContextShared>, channels: usize) -> Self {
        Self { id, context, channels }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }
}

impl AsNode for DestinationNode {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn context_id(&self) -> ContextId {
        self.context.id()
    }
}

impl core::fmt::Debug for DestinationNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DestinationNode")
            .field("id", &self.id)
            .field("channels", &self.channels)
            .finish()
    }
}
