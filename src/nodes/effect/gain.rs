//! Gain/volume control effect

use delegate::delegate;

use crate::context::BaseAudioContext;
use crate::error::Result;
use crate::node::{AsNode, AudioNode, Bus, ContextId, NodeHandle, NodeId, ProcessContext, ProcessStatus};
use crate::param::{AudioParam, ParamDescriptor};
use crate::Buffer;

struct Gain;

impl AudioNode for Gain {
    type Message = ();

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        _messages: impl Iterator<Item = ()>,
        inputs: &[Bus],
        params: &[Buffer],
        outputs: &mut [Bus],
    ) -> ProcessStatus {
        let (input, output) = (&inputs[0], &mut outputs[0]);
        let gain = &params[0];
        output.set_channel_count(input.channel_count());
        for (out, inp) in output.channels_mut().iter_mut().zip(input.channels()) {
            for ((o, i), g) in out.iter_mut().zip(inp.iter()).zip(gain.iter()) {
                *o = *i * *g;
            }
        }
        ProcessStatus::Active
    }

    fn num_inputs(&self) -> usize {
        1
    }
}

/// Multiplies its input by the `gain` param. The output has as many
/// channels as the summed input.
#[derive(Debug)]
pub struct GainNode {
    handle: NodeHandle<()>,
}

impl GainNode {
    pub const GAIN: ParamDescriptor = ParamDescriptor::new("gain", 1.0, f32::MIN, f32::MAX);

    pub fn new(ctx: &impl BaseAudioContext) -> Result<Self> {
        let handle = ctx.add_node(Gain, &[Self::GAIN])?;
        Ok(Self { handle })
    }

    pub fn gain(&self) -> &AudioParam {
        &self.handle.params()[0]
    }

    delegate! {
        to self.handle {
            pub fn id(&self) -> NodeId;
        }
    }
}

impl AsNode for GainNode {
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
    use crate::nodes::ConstantSourceNode;
    use crate::{AudioContext, ContextOptions};

    #[test]
    fn scales_and_follows_automation() {
        let (ctx, mut renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
        let mut source = ConstantSourceNode::new(&ctx).unwrap();
        let gain = GainNode::new(&ctx).unwrap();
        ctx.connect(&source, &gain).unwrap();
        ctx.connect(&gain, &ctx.destination()).unwrap();
        source.start(0.0).unwrap();
        gain.gain().set_value(0.5);
        gain.gain().set_value_at_time(0.0, 64.0 / 48_000.0).unwrap();
        ctx.resume().unwrap();

        assert_eq!(renderer.render_quantum().channel(1)[63], 0.5);
        assert_eq!(renderer.render_quantum().channel(1)[0], 0.0);
    }

    #[test]
    fn silent_without_input() {
        let (ctx, mut renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
        let gain = GainNode::new(&ctx).unwrap();
        gain.gain().set_value(2.0);
        ctx.connect(&gain, &ctx.destination()).unwrap();
        ctx.resume().unwrap();
        assert!(renderer.render_quantum().is_silent());
    }
}
