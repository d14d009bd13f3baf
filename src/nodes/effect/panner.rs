//! Positional panner
//!
//! The control thread edits the panner's geometry under its own lock. The
//! audio thread `try_lock`s the listener geometry and then the panner state,
//! recomputing only the caches whose dirty bit is set, and keeps last
//! quantum's values when either lock is contended. The doppler rate is not
//! applied to the signal; it is exposed for sources that resample.

use std::sync::Arc;

use delegate::delegate;

use crate::context::BaseAudioContext;
use crate::error::{GraphError, Result};
use crate::listener::ListenerShared;
use crate::node::{AsNode, AudioNode, Bus, ContextId, NodeHandle, NodeId, ProcessContext, ProcessStatus};
use crate::positional::{equal_power_gains, ConeParams, DistanceModel, DistanceParams, PannerShared, Vec3};
use crate::Buffer;

struct Panner {
    shared: Arc<PannerShared>,
    listener: Arc<ListenerShared>,
    azimuth: f32,
    gain: f32,
}

impl Panner {
    fn refresh(&mut self) {
        let Some(geometry) = self.listener.geometry.try_lock() else {
            return;
        };
        let Some(mut state) = self.shared.state.try_lock() else {
            return;
        };
        self.azimuth = state.azimuth_elevation(&geometry).0;
        self.gain = state.distance_cone_gain(&geometry);
    }
}

impl AudioNode for Panner {
    type Message = ();

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        _messages: impl Iterator<Item = ()>,
        inputs: &[Bus],
        _params: &[Buffer],
        outputs: &mut [Bus],
    ) -> ProcessStatus {
        self.refresh();

        let (input, output) = (&inputs[0], &mut outputs[0]);
        output.set_channel_count(2);
        let stereo = input.channel_count() >= 2;
        let pan = equal_power_gains(self.azimuth, stereo);
        let gain = self.gain;

        let (left, right) = output.channels_mut().split_at_mut(1);
        let (left, right) = (&mut left[0], &mut right[0]);
        if !stereo {
            let src = input.channel(0);
            for i in 0..src.len() {
                left[i] = src[i] * pan.left * gain;
                right[i] = src[i] * pan.right * gain;
            }
        } else {
            let (in_l, in_r) = (input.channel(0), input.channel(1));
            for i in 0..in_l.len() {
                let (l, r) = if self.azimuth <= 0.0 {
                    (in_l[i] + in_r[i] * pan.left, in_r[i] * pan.right)
                } else {
                    (in_l[i] * pan.left, in_r[i] + in_l[i] * pan.right)
                };
                left[i] = l * gain;
                right[i] = r * gain;
            }
        }
        ProcessStatus::Active
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn output_channels(&self, _output: usize) -> usize {
        2
    }
}

fn finite(v: Vec3, what: &str) -> Result<Vec3> {
    if !v.is_finite() {
        return Err(GraphError::not_supported(format!("panner {} must be finite", what)));
    }
    Ok(v)
}

/// Positions a mono or stereo input in space relative to the context's
/// [`AudioListener`](crate::AudioListener). Output is always stereo.
#[derive(Debug)]
pub struct PannerNode {
    handle: NodeHandle<()>,
    shared: Arc<PannerShared>,
    listener: Arc<ListenerShared>,
}

impl PannerNode {
    pub fn new(ctx: &impl BaseAudioContext) -> Result<Self> {
        let shared = Arc::new(PannerShared::default());
        let listener = Arc::clone(ctx.shared().listener());
        let panner = Panner {
            shared: Arc::clone(&shared),
            listener: Arc::clone(&listener),
            azimuth: 0.0,
            gain: 1.0,
        };
        let handle = ctx.add_node(panner, &[])?;
        listener.register(&shared);
        Ok(Self {
            handle,
            shared,
            listener,
        })
    }

    pub fn set_position(&self, position: Vec3) -> Result<()> {
        let position = finite(position, "position")?;
        self.shared.state.lock().set_position(position);
        Ok(())
    }

    pub fn set_orientation(&self, orientation: Vec3) -> Result<()> {
        let orientation = finite(orientation, "orientation")?;
        self.shared.state.lock().set_orientation(orientation);
        Ok(())
    }

    pub fn set_velocity(&self, velocity: Vec3) -> Result<()> {
        let velocity = finite(velocity, "velocity")?;
        self.shared.state.lock().set_velocity(velocity);
        Ok(())
    }

    pub fn set_distance_model(&self, model: DistanceModel) {
        let mut state = self.shared.state.lock();
        let distance = DistanceParams { model, ..state.distance() };
        state.set_distance(distance);
    }

    /// Reference distance, max distance and rolloff in one go.
    pub fn set_distance(&self, distance: DistanceParams) -> Result<()> {
        let DistanceParams {
            ref_distance,
            max_distance,
            rolloff_factor,
            ..
        } = distance;
        if !(ref_distance >= 0.0 && max_distance > 0.0 && rolloff_factor >= 0.0)
            || !max_distance.is_finite()
            || !ref_distance.is_finite()
            || !rolloff_factor.is_finite()
        {
            return Err(GraphError::not_supported(format!(
                "invalid distance parameters {:?}",
                distance
            )));
        }
        self.shared.state.lock().set_distance(distance);
        Ok(())
    }

    pub fn set_cone(&self, cone: ConeParams) -> Result<()> {
        if !(0.0..=1.0).contains(&cone.outer_gain)
            || !cone.inner_angle.is_finite()
            || !cone.outer_angle.is_finite()
        {
            return Err(GraphError::not_supported(format!("invalid cone {:?}", cone)));
        }
        self.shared.state.lock().set_cone(cone);
        Ok(())
    }

    pub fn position(&self) -> Vec3 {
        self.shared.state.lock().position()
    }

    pub fn orientation(&self) -> Vec3 {
        self.shared.state.lock().orientation()
    }

    pub fn velocity(&self) -> Vec3 {
        self.shared.state.lock().velocity()
    }

    pub fn distance(&self) -> DistanceParams {
        self.shared.state.lock().distance()
    }

    pub fn cone(&self) -> ConeParams {
        self.shared.state.lock().cone()
    }

    /// Azimuth and elevation in degrees, from the cache when it is clean.
    pub fn azimuth_elevation(&self) -> (f32, f32) {
        let geometry = self.listener.geometry.lock();
        let angles = self.shared.state.lock().azimuth_elevation(&geometry);
        angles
    }

    /// Distance attenuation times cone gain.
    pub fn distance_cone_gain(&self) -> f32 {
        let geometry = self.listener.geometry.lock();
        let gain = self.shared.state.lock().distance_cone_gain(&geometry);
        gain
    }

    pub fn doppler_rate(&self) -> f32 {
        let geometry = self.listener.geometry.lock();
        let rate = self.shared.state.lock().doppler_rate(&geometry);
        rate
    }

    /// How many times any derived value has been recomputed.
    pub fn cache_recomputations(&self) -> u64 {
        self.shared.state.lock().recomputations()
    }

    pub fn dirty_bits(&self) -> u8 {
        self.shared.state.lock().dirty_bits()
    }

    delegate! {
        to self.handle {
            pub fn id(&self) -> NodeId;
        }
    }
}

impl AsNode for PannerNode {
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
    use crate::positional::{ALL, DOPPLER_RATE};
    use crate::{AudioContext, ContextOptions};

    #[test]
    fn source_on_the_right_is_louder_on_the_right() {
        let (ctx, mut renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
        let mut source = ConstantSourceNode::new(&ctx).unwrap();
        let panner = PannerNode::new(&ctx).unwrap();
        panner.set_position(Vec3::new(1.0, 0.0, 0.0)).unwrap();
        ctx.connect(&source, &panner).unwrap();
        ctx.connect(&panner, &ctx.destination()).unwrap();
        source.start(0.0).unwrap();
        ctx.resume().unwrap();

        let out = renderer.render_quantum();
        assert!(out.channel(1)[0] > 0.9);
        assert!(out.channel(0)[0].abs() < 1e-3);
        // rendering refreshes only what it consumes
        assert_eq!(panner.dirty_bits(), DOPPLER_RATE);
    }

    #[test]
    fn clean_caches_are_not_recomputed() {
        let (ctx, _renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
        let panner = PannerNode::new(&ctx).unwrap();
        assert_eq!(panner.dirty_bits(), ALL);

        panner.azimuth_elevation();
        panner.azimuth_elevation();
        assert_eq!(panner.cache_recomputations(), 1);

        ctx.listener().set_velocity(Vec3::new(0.0, 0.0, 1.0)).unwrap();
        panner.azimuth_elevation();
        assert_eq!(panner.cache_recomputations(), 1);
        panner.doppler_rate();
        assert_eq!(panner.cache_recomputations(), 2);
    }

    #[test]
    fn contended_state_keeps_last_values() {
        let shared = Arc::new(PannerShared::default());
        let listener = Arc::new(ListenerShared::default());
        listener.register(&shared);
        let mut panner = Panner {
            shared: Arc::clone(&shared),
            listener: Arc::clone(&listener),
            azimuth: 0.0,
            gain: 1.0,
        };
        shared.state.lock().set_position(Vec3::new(1.0, 0.0, 0.0));
        panner.refresh();
        assert_eq!(panner.azimuth, 90.0);

        let mut state = shared.state.lock();
        state.set_position(Vec3::new(-1.0, 0.0, 0.0));
        panner.refresh();
        assert_eq!(panner.azimuth, 90.0);
        drop(state);

        let geometry = listener.geometry.lock();
        panner.refresh();
        assert_eq!(panner.azimuth, 90.0);
        drop(geometry);

        panner.refresh();
        assert!((panner.azimuth + 90.0).abs() < 1e-3);
    }

    #[test]
    fn rejects_invalid_geometry() {
        let (ctx, _renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
        let panner = PannerNode::new(&ctx).unwrap();
        assert!(panner.set_position(Vec3::new(f32::INFINITY, 0.0, 0.0)).is_err());
        let cone = ConeParams {
            outer_gain: 2.0,
            ..ConeParams::default()
        };
        assert!(panner.set_cone(cone).is_err());
        let distance = DistanceParams {
            max_distance: 0.0,
            ..DistanceParams::default()
        };
        assert!(panner.set_distance(distance).is_err());
    }
}
