//! The context's listener.
//!
//! Geometry changes mark every registered panner's caches dirty while the
//! geometry lock is still held, so a panner can never clear a bit using a
//! listener snapshot older than the change that set it.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{GraphError, Result};
use crate::positional::{ListenerGeometry, PannerShared, Vec3, ALL, DOPPLER_RATE};

#[derive(Debug, Default)]
pub(crate) struct ListenerShared {
    pub(crate) geometry: Mutex<ListenerGeometry>,
    panners: Mutex<Vec<Weak<PannerShared>>>,
}

impl ListenerShared {
    pub(crate) fn register(&self, panner: &Arc<PannerShared>) {
        let mut panners = self.panners.lock();
        panners.retain(|p| p.strong_count() > 0);
        panners.push(Arc::downgrade(panner));
    }

    fn update(&self, bits: u8, f: impl FnOnce(&mut ListenerGeometry)) {
        let mut geometry = self.geometry.lock();
        f(&mut geometry);
        let mut panners = self.panners.lock();
        panners.retain(|p| match p.upgrade() {
            Some(panner) => {
                panner.state.lock().mark(bits);
                true
            }
            None => false,
        });
    }
}

/// Control-thread handle to the listener of a context.
#[derive(Clone, Debug)]
pub struct AudioListener {
    shared: Arc<ListenerShared>,
}

fn finite(v: Vec3, what: &str) -> Result<Vec3> {
    if !v.is_finite() {
        return Err(GraphError::not_supported(format!("listener {} must be finite", what)));
    }
    Ok(v)
}

impl AudioListener {
    pub(crate) fn new(shared: Arc<ListenerShared>) -> Self {
        Self { shared }
    }

    pub fn set_position(&self, position: Vec3) -> Result<()> {
        let position = finite(position, "position")?;
        self.shared.update(ALL, |g| g.position = position);
        Ok(())
    }

    /// Facing direction and up vector. Neither may be zero.
    pub fn set_orientation(&self, forward: Vec3, up: Vec3) -> Result<()> {
        let (forward, up) = (finite(forward, "forward")?, finite(up, "up")?);
        if forward.is_zero() || up.is_zero() {
            return Err(GraphError::not_supported("listener orientation vectors must be non-zero"));
        }
        self.shared.update(ALL, |g| {
            g.forward = forward;
            g.up = up;
        });
        Ok(())
    }

    pub fn set_velocity(&self, velocity: Vec3) -> Result<()> {
        let velocity = finite(velocity, "velocity")?;
        self.shared.update(DOPPLER_RATE, |g| g.velocity = velocity);
        Ok(())
    }

    pub fn set_doppler_factor(&self, factor: f32) -> Result<()> {
        if !factor.is_finite() || factor < 0.0 {
            return Err(GraphError::not_supported(format!("doppler factor {} out of range", factor)));
        }
        self.shared.update(DOPPLER_RATE, |g| g.doppler_factor = factor);
        Ok(())
    }

    pub fn set_speed_of_sound(&self, speed: f32) -> Result<()> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(GraphError::not_supported(format!("speed of sound {} out of range", speed)));
        }
        self.shared.update(DOPPLER_RATE, |g| g.speed_of_sound = speed);
        Ok(())
    }

    pub fn position(&self) -> Vec3 {
        self.shared.geometry.lock().position
    }

    pub fn forward(&self) -> Vec3 {
        self.shared.geometry.lock().forward
    }

    pub fn up(&self) -> Vec3 {
        self.shared.geometry.lock().up
    }

    pub fn velocity(&self) -> Vec3 {
        self.shared.geometry.lock().velocity
    }

    pub fn doppler_factor(&self) -> f32 {
        self.shared.geometry.lock().doppler_factor
    }

    pub fn speed_of_sound(&self) -> f32 {
        self.shared.geometry.lock().speed_of_sound
    }

    /// Copy of the current geometry.
    pub fn snapshot(&self) -> ListenerGeometry {
        *self.shared.geometry.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positional::{AZIMUTH_ELEVATION, DISTANCE_CONE_GAIN};

    fn settled(listener: &ListenerShared) -> Arc<PannerShared> {
        let panner = Arc::new(PannerShared::default());
        listener.register(&panner);
        {
            let geometry = *listener.geometry.lock();
            let mut state = panner.state.lock();
            state.azimuth_elevation(&geometry);
            state.distance_cone_gain(&geometry);
            state.doppler_rate(&geometry);
            assert_eq!(state.dirty_bits(), 0);
        }
        panner
    }

    #[test]
    fn velocity_marks_doppler_only() {
        let shared = Arc::new(ListenerShared::default());
        let panner = settled(&shared);
        let listener = AudioListener::new(Arc::clone(&shared));
        listener.set_velocity(Vec3::new(1.0, 0.0, 0.0)).unwrap();
        assert_eq!(panner.state.lock().dirty_bits(), DOPPLER_RATE);
    }

    #[test]
    fn position_marks_everything() {
        let shared = Arc::new(ListenerShared::default());
        let panner = settled(&shared);
        let listener = AudioListener::new(Arc::clone(&shared));
        listener.set_position(Vec3::new(0.0, 0.0, 2.0)).unwrap();
        assert_eq!(
            panner.state.lock().dirty_bits(),
            AZIMUTH_ELEVATION | DISTANCE_CONE_GAIN | DOPPLER_RATE
        );
        assert_eq!(listener.position(), Vec3::new(0.0, 0.0, 2.0));
    }

    #[test]
    fn rejects_bad_values_without_marking() {
        let shared = Arc::new(ListenerShared::default());
        let panner = settled(&shared);
        let listener = AudioListener::new(Arc::clone(&shared));
        assert!(listener.set_position(Vec3::new(f32::NAN, 0.0, 0.0)).is_err());
        assert!(listener.set_orientation(Vec3::ZERO, Vec3::UP).is_err());
        assert!(listener.set_speed_of_sound(0.0).is_err());
        assert_eq!(panner.state.lock().dirty_bits(), 0);
    }

    #[test]
    fn dropped_panners_are_forgotten() {
        let shared = ListenerShared::default();
        drop(settled(&shared));
        let listener = AudioListener::new(Arc::new(shared));
        listener.set_position(Vec3::ZERO).unwrap();
        assert!(listener.shared.panners.lock().is_empty());
    }
}
