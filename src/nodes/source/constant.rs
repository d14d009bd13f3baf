//! Constant value source

use delegate::delegate;

use super::scheduled::{PlaybackState, Schedule, ScheduledSource, SourceMessage};
use crate::context::BaseAudioContext;
use crate::error::Result;
use crate::node::{AsNode, AudioNode, Bus, ContextId, NodeHandle, NodeId, ProcessContext, ProcessStatus};
use crate::param::{AudioParam, ParamDescriptor};
use crate::Buffer;

/// Outputs the value of its `offset` param while playing.
///
/// Handy as a DC source or, connected to params, as one control signal
/// fanned out to many nodes.
#[derive(Debug)]
pub struct ConstantSourceNode {
    handle: NodeHandle<SourceMessage>,
    source: ScheduledSource,
}

struct ConstantSource {
    schedule: Schedule,
}

impl AudioNode for ConstantSource {
    type Message = SourceMessage;

    fn process(
        &mut self,
        ctx: &ProcessContext,
        messages: impl Iterator<Item = SourceMessage>,
        _inputs: &[Bus],
        params: &[Buffer],
        outputs: &mut [Bus],
    ) -> ProcessStatus {
        for msg in messages {
            self.schedule.apply(msg);
        }

        let out = &mut outputs[0];
        out.silence();
        if let Some(range) = self.schedule.active_range(ctx) {
            out.channel_mut(0)[range.clone()].copy_from_slice(&params[0][range]);
        }
        self.schedule.status(ctx)
    }
}

impl ConstantSourceNode {
    pub const OFFSET: ParamDescriptor = ParamDescriptor::new("offset", 1.0, f32::MIN, f32::MAX);

    pub fn new(ctx: &impl BaseAudioContext) -> Result<Self> {
        let (source, schedule) = ScheduledSource::new();
        let handle = ctx.add_node(ConstantSource { schedule }, &[Self::OFFSET])?;
        Ok(Self { handle, source })
    }

    pub fn offset(&self) -> &AudioParam {
        &self.handle.params()[0]
    }

    /// Start playing at context time `when` (seconds).
    pub fn start(&mut self, when: f64) -> Result<()> {
        self.source.start(&mut self.handle, when, |m| m)
    }

    /// Stop at context time `when` (seconds).
    pub fn stop(&mut self, when: f64) -> Result<()> {
        self.source.stop(&mut self.handle, when, |m| m)
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.source.state()
    }

    delegate! {
        to self.handle {
            pub fn id(&self) -> NodeId;
        }
    }
}

impl AsNode for ConstantSourceNode {
    delegate! {
        to self.handle {
            fn node_id(&self) -> NodeId;
            fn context_id(&self) -> ContextId;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AudioContext, ContextOptions, GraphError};

    #[test]
    fn start_twice_and_early_stop_are_rejected() {
        let (ctx, _renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
        let mut source = ConstantSourceNode::new(&ctx).unwrap();
        assert!(matches!(source.stop(1.0), Err(GraphError::InvalidState(_))));
        assert!(matches!(source.start(-1.0), Err(GraphError::InvalidSchedule(_))));
        assert_eq!(source.playback_state(), PlaybackState::Unscheduled);

        source.start(0.0).unwrap();
        assert_eq!(source.playback_state(), PlaybackState::Scheduled);
        assert_eq!(ctx.active_source_count(), 1);
        assert!(matches!(source.start(0.0), Err(GraphError::InvalidState(_))));
        source.stop(1.0).unwrap();
    }

    #[test]
    fn start_on_a_closed_context_leaves_the_source_unscheduled() {
        let (mut ctx, _renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
        let mut source = ConstantSourceNode::new(&ctx).unwrap();
        ctx.close().unwrap();

        assert!(matches!(source.start(0.0), Err(GraphError::InvalidState(_))));
        assert_eq!(source.playback_state(), PlaybackState::Unscheduled);
        assert_eq!(ctx.active_source_count(), 0);
        // still refused for the closed context, not as a second start
        match source.start(0.0) {
            Err(GraphError::InvalidState(msg)) => assert_eq!(msg, "context is closed"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn outputs_offset_from_start_frame() {
        let (ctx, mut renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
        let mut source = ConstantSourceNode::new(&ctx).unwrap();
        source.offset().set_value(0.25);
        ctx.connect(&source, &ctx.destination()).unwrap();
        source.start(32.0 / 48_000.0).unwrap();
        ctx.resume().unwrap();

        let out = renderer.render_quantum();
        assert_eq!(out.channel(0)[31], 0.0);
        assert_eq!(out.channel(0)[32], 0.25);
        assert_eq!(out.channel(0)[63], 0.25);
    }
}
