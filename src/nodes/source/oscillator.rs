//! Periodic waveform oscillator

use core::f32::consts::TAU;

use delegate::delegate;

use super::scheduled::{PlaybackState, Schedule, ScheduledSource, SourceMessage};
use crate::context::BaseAudioContext;
use crate::error::{GraphError, Result};
use crate::node::{AsNode, AudioNode, Bus, ContextId, NodeHandle, NodeId, ProcessContext, ProcessStatus};
use crate::param::{AudioParam, ParamDescriptor};
use crate::Buffer;

/// Shape of one oscillator cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Waveform {
    #[default]
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

impl Waveform {
    /// Sample at `phase` in `[0, 1)`.
    #[inline]
    fn sample(self, phase: f32) -> f32 {
        match self {
            Waveform::Sine => (phase * TAU).sin(),
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Sawtooth => 2.0 * phase - 1.0,
            Waveform::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
        }
    }
}

/// Messages for controlling an [`OscillatorNode`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OscillatorMessage {
    Schedule(SourceMessage),
    SetWaveform(Waveform),
}

struct Oscillator {
    waveform: Waveform,
    /// Current phase in [0, 1)
    phase: f32,
    schedule: Schedule,
}

impl AudioNode for Oscillator {
    type Message = OscillatorMessage;

    fn process(
        &mut self,
        ctx: &ProcessContext,
        messages: impl Iterator<Item = OscillatorMessage>,
        _inputs: &[Bus],
        params: &[Buffer],
        outputs: &mut [Bus],
    ) -> ProcessStatus {
        for msg in messages {
            match msg {
                OscillatorMessage::Schedule(msg) => self.schedule.apply(msg),
                OscillatorMessage::SetWaveform(waveform) => self.waveform = waveform,
            }
        }

        let out = &mut outputs[0];
        out.silence();
        let Some(range) = self.schedule.active_range(ctx) else {
            return self.schedule.status(ctx);
        };

        let sample_rate = ctx.sample_rate as f32;
        let frequency = &params[0];
        let buffer = out.channel_mut(0);
        for i in range {
            buffer[i] = self.waveform.sample(self.phase);
            self.phase += frequency[i] / sample_rate;
            self.phase -= self.phase.floor();
        }
        self.schedule.status(ctx)
    }
}

/// A scheduled oscillator with an audio-rate `frequency` param.
#[derive(Debug)]
pub struct OscillatorNode {
    handle: NodeHandle<OscillatorMessage>,
    source: ScheduledSource,
    waveform: Waveform,
}

impl OscillatorNode {
    pub const FREQUENCY: ParamDescriptor = ParamDescriptor::new("frequency", 440.0, -96_000.0, 96_000.0);

    /// A 440 Hz sine.
    pub fn new(ctx: &impl BaseAudioContext) -> Result<Self> {
        Self::with_waveform(ctx, Waveform::Sine)
    }

    pub fn with_waveform(ctx: &impl BaseAudioContext, waveform: Waveform) -> Result<Self> {
        let (source, schedule) = ScheduledSource::new();
        let oscillator = Oscillator {
            waveform,
            phase: 0.0,
            schedule,
        };
        let handle = ctx.add_node(oscillator, &[Self::FREQUENCY])?;
        Ok(Self {
            handle,
            source,
            waveform,
        })
    }

    pub fn frequency(&self) -> &AudioParam {
        &self.handle.params()[0]
    }

    pub fn waveform(&self) -> Waveform {
        self.waveform
    }

    pub fn set_waveform(&mut self, waveform: Waveform) -> Result<()> {
        self.handle
            .send(OscillatorMessage::SetWaveform(waveform))
            .map_err(|_| GraphError::QueueFull(self.handle.id()))?;
        self.waveform = waveform;
        Ok(())
    }

    /// Start playing at context time `when` (seconds).
    pub fn start(&mut self, when: f64) -> Result<()> {
        self.source.start(&mut self.handle, when, OscillatorMessage::Schedule)
    }

    /// Stop at context time `when` (seconds).
    pub fn stop(&mut self, when: f64) -> Result<()> {
        self.source.stop(&mut self.handle, when, OscillatorMessage::Schedule)
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

impl AsNode for OscillatorNode {
    delegate! {
        to self.handle {
            fn node_id(&self) -> NodeId;
            fn context_id(&self) -> ContextId;
        }
    }
}
