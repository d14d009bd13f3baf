//! Geometry for positional nodes.
//!
//! Everything here is plain math plus [`PannerState`], which caches the three
//! derived values a panner needs every quantum (angles, distance/cone gain,
//! doppler rate) behind [`DirtyFlags`]. Setters only flip bits; the values
//! are recomputed on the next read, from whatever geometry is current then.

use core::ops::{Add, Mul, Sub};

use parking_lot::Mutex;

use crate::dirty::{DirtyFlags, Memo};

/// Azimuth and elevation of the source relative to the listener.
pub const AZIMUTH_ELEVATION: u8 = 1 << 0;
/// Distance attenuation times cone attenuation.
pub const DISTANCE_CONE_GAIN: u8 = 1 << 1;
/// Playback-rate factor from relative velocity.
pub const DOPPLER_RATE: u8 = 1 << 2;
pub const ALL: u8 = AZIMUTH_ELEVATION | DISTANCE_CONE_GAIN | DOPPLER_RATE;

/// A 3D vector.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);
    /// Negative Z.
    pub const FORWARD: Self = Self::new(0.0, 0.0, -1.0);
    pub const UP: Self = Self::new(0.0, 1.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn length(&self) -> f32 {
        self.dot(*self).sqrt()
    }

    /// Unit vector in the same direction, or zero for a (near) zero vector.
    pub fn normalize(&self) -> Self {
        let len = self.length();
        if len > 1e-8 {
            *self * (1.0 / len)
        } else {
            Self::ZERO
        }
    }

    pub fn dot(&self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: Self) -> Self {
        Self {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Sub for Vec3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Add for Vec3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DistanceModel {
    Linear,
    #[default]
    Inverse,
    Exponential,
}

/// Distance attenuation settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceParams {
    pub model: DistanceModel,
    pub ref_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
}

impl Default for DistanceParams {
    fn default() -> Self {
        Self {
            model: DistanceModel::Inverse,
            ref_distance: 1.0,
            max_distance: 10_000.0,
            rolloff_factor: 1.0,
        }
    }
}

/// Directional attenuation, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConeParams {
    pub inner_angle: f32,
    pub outer_angle: f32,
    pub outer_gain: f32,
}

impl Default for ConeParams {
    fn default() -> Self {
        Self {
            inner_angle: 360.0,
            outer_angle: 360.0,
            outer_gain: 0.0,
        }
    }
}

/// What a panner needs to know about the listener.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerGeometry {
    pub position: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
    pub velocity: Vec3,
    pub doppler_factor: f32,
    pub speed_of_sound: f32,
}

impl Default for ListenerGeometry {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            forward: Vec3::FORWARD,
            up: Vec3::UP,
            velocity: Vec3::ZERO,
            doppler_factor: 1.0,
            speed_of_sound: 343.3,
        }
    }
}

/// Azimuth in `[-180, 180]` (0 straight ahead, positive to the right) and
/// elevation in `[-90, 90]`, both in degrees.
pub fn azimuth_elevation(source: Vec3, listener: &ListenerGeometry) -> (f32, f32) {
    let to_source = (source - listener.position).normalize();
    if to_source.is_zero() {
        return (0.0, 0.0);
    }

    let front = listener.forward.normalize();
    let right = front.cross(listener.up).normalize();
    let up = right.cross(front);

    let up_projection = to_source.dot(up);
    let projected = (to_source - up * up_projection).normalize();

    let mut azimuth = projected.dot(right).clamp(-1.0, 1.0).acos().to_degrees();
    if projected.dot(front) < 0.0 {
        azimuth = 360.0 - azimuth;
    }
    // measured from the right; rotate so 0 is in front
    azimuth = if azimuth <= 270.0 { 90.0 - azimuth } else { 450.0 - azimuth };
    if azimuth > 180.0 {
        azimuth -= 360.0;
    }

    let mut elevation = 90.0 - to_source.dot(up).clamp(-1.0, 1.0).acos().to_degrees();
    if elevation > 90.0 {
        elevation = 180.0 - elevation;
    } else if elevation < -90.0 {
        elevation = -180.0 - elevation;
    }
    (azimuth, elevation)
}

pub fn distance_gain(distance: f32, params: &DistanceParams) -> f32 {
    let DistanceParams {
        model,
        ref_distance,
        max_distance,
        rolloff_factor,
    } = *params;
    match model {
        DistanceModel::Linear => {
            if max_distance <= ref_distance {
                return 1.0;
            }
            let d = distance.clamp(ref_distance, max_distance);
            1.0 - rolloff_factor * (d - ref_distance) / (max_distance - ref_distance)
        }
        DistanceModel::Inverse => {
            if ref_distance <= 0.0 {
                return 1.0;
            }
            let d = distance.max(ref_distance);
            ref_distance / (ref_distance + rolloff_factor * (d - ref_distance))
        }
        DistanceModel::Exponential => {
            if ref_distance <= 0.0 {
                return 1.0;
            }
            (distance.max(ref_distance) / ref_distance).powf(-rolloff_factor)
        }
    }
}

/// Attenuation from the source's orientation relative to the listener.
pub fn cone_gain(source: Vec3, orientation: Vec3, listener: Vec3, cone: &ConeParams) -> f32 {
    if orientation.is_zero() || (cone.inner_angle >= 360.0 && cone.outer_angle >= 360.0) {
        return 1.0;
    }
    let to_listener = (listener - source).normalize();
    let angle = to_listener
        .dot(orientation.normalize())
        .clamp(-1.0, 1.0)
        .acos()
        .to_degrees();

    let inner = cone.inner_angle.abs() * 0.5;
    let outer = cone.outer_angle.abs() * 0.5;
    if angle <= inner {
        1.0
    } else if angle >= outer {
        cone.outer_gain
    } else {
        let x = (angle - inner) / (outer - inner);
        (1.0 - x) + cone.outer_gain * x
    }
}

/// Playback-rate factor, clamped to `[0.125, 8]`. `1.0` when nothing moves.
pub fn doppler_rate(source: Vec3, source_velocity: Vec3, listener: &ListenerGeometry) -> f32 {
    let factor = listener.doppler_factor;
    let speed = listener.speed_of_sound;
    if factor <= 0.0 || speed <= 0.0 {
        return 1.0;
    }
    if source_velocity.is_zero() && listener.velocity.is_zero() {
        return 1.0;
    }
    let source_to_listener = source - listener.position;
    let magnitude = source_to_listener.length();
    if magnitude == 0.0 {
        return 1.0;
    }

    let scaled_speed = speed / factor;
    let listener_projection = (-source_to_listener.dot(listener.velocity) / magnitude).min(scaled_speed);
    let source_projection = (-source_to_listener.dot(source_velocity) / magnitude).min(scaled_speed);

    let rate = (speed - factor * listener_projection) / (speed - factor * source_projection);
    if rate.is_finite() {
        rate.clamp(0.125, 8.0)
    } else {
        1.0
    }
}

/// Equal-power gains for a pan position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanGains {
    pub left: f32,
    pub right: f32,
}

/// Equal-power pan gains for `azimuth` degrees. For stereo input the gains
/// say how much of the far channel leaks into the near one.
pub fn equal_power_gains(azimuth: f32, stereo_input: bool) -> PanGains {
    let mut azimuth = azimuth.clamp(-180.0, 180.0);
    // fold rear positions onto the front half
    if azimuth < -90.0 {
        azimuth = -180.0 - azimuth;
    } else if azimuth > 90.0 {
        azimuth = 180.0 - azimuth;
    }

    let x = if !stereo_input {
        (azimuth + 90.0) / 180.0
    } else if azimuth <= 0.0 {
        (azimuth + 90.0) / 90.0
    } else {
        azimuth / 90.0
    };
    let angle = x * core::f32::consts::FRAC_PI_2;
    PanGains {
        left: angle.cos(),
        right: angle.sin(),
    }
}

/// Control-side geometry of one panner plus its derived-value caches.
#[derive(Debug, Clone)]
pub struct PannerState {
    position: Vec3,
    orientation: Vec3,
    velocity: Vec3,
    distance: DistanceParams,
    cone: ConeParams,
    flags: DirtyFlags,
    angles: Memo<(f32, f32)>,
    gain: Memo<f32>,
    doppler: Memo<f32>,
}

impl Default for PannerState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            orientation: Vec3::new(1.0, 0.0, 0.0),
            velocity: Vec3::ZERO,
            distance: DistanceParams::default(),
            cone: ConeParams::default(),
            flags: DirtyFlags::all(),
            angles: Memo::new(AZIMUTH_ELEVATION, (0.0, 0.0)),
            gain: Memo::new(DISTANCE_CONE_GAIN, 1.0),
            doppler: Memo::new(DOPPLER_RATE, 1.0),
        }
    }
}

impl PannerState {
    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn orientation(&self) -> Vec3 {
        self.orientation
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn distance(&self) -> DistanceParams {
        self.distance
    }

    pub fn cone(&self) -> ConeParams {
        self.cone
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.flags.set(ALL);
    }

    pub fn set_orientation(&mut self, orientation: Vec3) {
        self.orientation = orientation;
        self.flags.set(DISTANCE_CONE_GAIN);
    }

    pub fn set_velocity(&mut self, velocity: Vec3) {
        self.velocity = velocity;
        self.flags.set(DOPPLER_RATE);
    }

    pub fn set_distance(&mut self, distance: DistanceParams) {
        self.distance = distance;
        self.flags.set(DISTANCE_CONE_GAIN);
    }

    pub fn set_cone(&mut self, cone: ConeParams) {
        self.cone = cone;
        self.flags.set(DISTANCE_CONE_GAIN);
    }

    /// Mark caches stale after a listener change.
    pub fn mark(&mut self, bits: u8) {
        self.flags.set(bits);
    }

    pub fn dirty_bits(&self) -> u8 {
        self.flags.bits() & ALL
    }

    pub fn azimuth_elevation(&mut self, listener: &ListenerGeometry) -> (f32, f32) {
        let position = self.position;
        self.angles
            .get(&mut self.flags, || azimuth_elevation(position, listener))
    }

    pub fn distance_cone_gain(&mut self, listener: &ListenerGeometry) -> f32 {
        let (position, orientation) = (self.position, self.orientation);
        let (distance, cone) = (self.distance, self.cone);
        self.gain.get(&mut self.flags, || {
            let d = (position - listener.position).length();
            distance_gain(d, &distance) * cone_gain(position, orientation, listener.position, &cone)
        })
    }

    pub fn doppler_rate(&mut self, listener: &ListenerGeometry) -> f32 {
        let (position, velocity) = (self.position, self.velocity);
        self.doppler
            .get(&mut self.flags, || doppler_rate(position, velocity, listener))
    }

    /// Total recomputations across the three caches.
    pub fn recomputations(&self) -> u64 {
        self.angles.recomputations() + self.gain.recomputations() + self.doppler.recomputations()
    }
}

/// A panner's state as shared between its handle, its processor and the
/// listener. Lock order: listener geometry, listener panner list, then this.
#[derive(Debug, Default)]
pub(crate) struct PannerShared {
    pub(crate) state: Mutex<PannerState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn azimuth_follows_listener_frame() {
        let listener = ListenerGeometry::default();
        let (az, el) = azimuth_elevation(Vec3::new(1.0, 0.0, 0.0), &listener);
        assert!(approx(az, 90.0) && approx(el, 0.0));
        let (az, _) = azimuth_elevation(Vec3::new(-1.0, 0.0, 0.0), &listener);
        assert!(approx(az, -90.0));
        let (az, _) = azimuth_elevation(Vec3::new(0.0, 0.0, -1.0), &listener);
        assert!(approx(az, 0.0));
        let (_, el) = azimuth_elevation(Vec3::new(0.0, 1.0, 0.0), &listener);
        assert!(approx(el, 90.0));
        assert_eq!(azimuth_elevation(Vec3::ZERO, &listener), (0.0, 0.0));
    }

    #[test]
    fn distance_models() {
        let mut p = DistanceParams {
            model: DistanceModel::Linear,
            ref_distance: 1.0,
            max_distance: 11.0,
            rolloff_factor: 1.0,
        };
        assert!(approx(distance_gain(0.5, &p), 1.0));
        assert!(approx(distance_gain(6.0, &p), 0.5));
        assert!(approx(distance_gain(100.0, &p), 0.0));

        p.model = DistanceModel::Inverse;
        assert!(approx(distance_gain(2.0, &p), 0.5));
        p.model = DistanceModel::Exponential;
        p.rolloff_factor = 2.0;
        assert!(approx(distance_gain(2.0, &p), 0.25));
    }

    #[test]
    fn cone_interpolates_between_inner_and_outer() {
        let cone = ConeParams {
            inner_angle: 90.0,
            outer_angle: 180.0,
            outer_gain: 0.0,
        };
        let facing = Vec3::new(0.0, 0.0, -1.0);
        let ahead = cone_gain(Vec3::ZERO, facing, Vec3::new(0.0, 0.0, -5.0), &cone);
        let behind = cone_gain(Vec3::ZERO, facing, Vec3::new(0.0, 0.0, 5.0), &cone);
        assert!(approx(ahead, 1.0));
        assert!(approx(behind, 0.0));
        // 67.5 degrees off axis sits halfway between 45 and 90
        let side = Vec3::new((67.5f32).to_radians().sin(), 0.0, -(67.5f32).to_radians().cos());
        assert!(approx(cone_gain(Vec3::ZERO, facing, side, &cone), 0.5));
    }

    #[test]
    fn doppler_rises_when_approaching() {
        let listener = ListenerGeometry::default();
        let source = Vec3::new(0.0, 0.0, -10.0);
        assert_eq!(doppler_rate(source, Vec3::ZERO, &listener), 1.0);
        let approaching = doppler_rate(source, Vec3::new(0.0, 0.0, 10.0), &listener);
        let receding = doppler_rate(source, Vec3::new(0.0, 0.0, -10.0), &listener);
        assert!(approaching > 1.0 && receding < 1.0);
        let absurd = doppler_rate(source, Vec3::new(0.0, 0.0, 1.0e6), &listener);
        assert!(absurd <= 8.0);
    }

    #[test]
    fn equal_power_is_constant_power() {
        for az in [-90.0f32, -45.0, 0.0, 30.0, 90.0] {
            let g = equal_power_gains(az, false);
            assert!(approx(g.left * g.left + g.right * g.right, 1.0));
        }
        let center = equal_power_gains(0.0, false);
        assert!(approx(center.left, center.right));
    }

    #[test]
    fn cached_reads_are_idempotent() {
        let listener = ListenerGeometry::default();
        let mut state = PannerState::default();
        state.set_position(Vec3::new(3.0, 0.0, -4.0));

        let first = state.azimuth_elevation(&listener);
        let second = state.azimuth_elevation(&listener);
        assert_eq!(first.0.to_bits(), second.0.to_bits());
        assert_eq!(first.1.to_bits(), second.1.to_bits());
        assert_eq!(state.recomputations(), 1);

        // several setters before a read cost one recomputation per cache
        state.set_position(Vec3::new(1.0, 0.0, 0.0));
        state.set_position(Vec3::new(-1.0, 0.0, 0.0));
        let gain_a = state.distance_cone_gain(&listener);
        let gain_b = state.distance_cone_gain(&listener);
        assert_eq!(gain_a.to_bits(), gain_b.to_bits());
        assert_eq!(state.recomputations(), 2);
        assert_eq!(state.dirty_bits(), AZIMUTH_ELEVATION | DOPPLER_RATE);
    }

    #[test]
    fn velocity_only_dirties_doppler() {
        let listener = ListenerGeometry::default();
        let mut state = PannerState::default();
        state.azimuth_elevation(&listener);
        state.distance_cone_gain(&listener);
        state.doppler_rate(&listener);
        assert_eq!(state.dirty_bits(), 0);
        state.set_velocity(Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(state.dirty_bits(), DOPPLER_RATE);
    }
}
