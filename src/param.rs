//! Automatable scalar parameters.
//!
//! A param's timeline lives behind its own small mutex. The control thread
//! edits it freely; the audio thread only `try_lock`s it and, when that
//! fails, holds the last value it computed. Audio-rate connections into a
//! param are mixed to mono and added on top of the timeline value.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dasp_graph::Buffer;
use parking_lot::Mutex;

use crate::context::ContextShared;
use crate::error::{GraphError, Result};
use crate::node::{ContextId, NodeId, ProcessContext};

/// Declares a param when a node is added.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamDescriptor {
    pub name: &'static str,
    pub default: f32,
    pub min: f32,
    pub max: f32,
}

impl ParamDescriptor {
    pub const fn new(name: &'static str, default: f32, min: f32, max: f32) -> Self {
        Self {
            name,
            default,
            min,
            max,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let finite = self.default.is_finite() && !self.min.is_nan() && !self.max.is_nan();
        if !finite || self.min > self.max || !(self.min..=self.max).contains(&self.default) {
            return Err(GraphError::not_supported(format!(
                "param `{}`: default {} outside [{}, {}]",
                self.name, self.default, self.min, self.max
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum EventKind {
    SetValue,
    LinearRamp,
    ExponentialRamp,
    SetTarget { time_constant: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct ParamEvent {
    kind: EventKind,
    time: f64,
    value: f32,
}

/// Scheduled automation events plus the point the next segment starts from.
#[derive(Debug)]
pub(crate) struct Timeline {
    events: Vec<ParamEvent>,
    anchor_value: f32,
    anchor_time: f64,
}

impl Timeline {
    fn new(value: f32) -> Self {
        Self {
            events: Vec::with_capacity(8),
            anchor_value: value,
            anchor_time: 0.0,
        }
    }

    fn insert(&mut self, event: ParamEvent) {
        // events at the same time keep insertion order
        let at = self.events.partition_point(|e| e.time <= event.time);
        self.events.insert(at, event);
    }

    fn cancel_from(&mut self, time: f64) {
        self.events.retain(|e| e.time < time);
    }

    /// Value at time `t`. Events that are fully in the past are folded into
    /// the anchor, so `t` must not go backwards between calls.
    fn value_at(&mut self, t: f64) -> f32 {
        loop {
            let Some(first) = self.events.first().copied() else {
                return self.anchor_value;
            };

            if t < first.time {
                let span = first.time - self.anchor_time;
                let x = if span > 0.0 {
                    ((t - self.anchor_time) / span).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                return match first.kind {
                    EventKind::LinearRamp => {
                        self.anchor_value + (first.value - self.anchor_value) * x as f32
                    }
                    EventKind::ExponentialRamp => {
                        let v0 = self.anchor_value;
                        if v0 <= 0.0 {
                            v0
                        } else {
                            v0 * (first.value / v0).powf(x as f32)
                        }
                    }
                    _ => self.anchor_value,
                };
            }

            if let EventKind::SetTarget { time_constant } = first.kind {
                let start = self.anchor_value;
                let curve = |at: f64| {
                    let decay = (-(at - first.time) / time_constant).exp() as f32;
                    first.value + (start - first.value) * decay
                };
                match self.events.get(1).copied() {
                    Some(next) if t >= next.time || matches!(next.kind, EventKind::LinearRamp | EventKind::ExponentialRamp) => {
                        let at = if t >= next.time { next.time } else { t };
                        self.anchor_value = curve(at);
                        self.anchor_time = at;
                        self.events.remove(0);
                        continue;
                    }
                    _ => return curve(t),
                }
            }

            self.anchor_value = first.value;
            self.anchor_time = first.time;
            self.events.remove(0);
        }
    }
}

/// State shared between an [`AudioParam`] and the node's render side.
pub(crate) struct ParamShared {
    descriptor: ParamDescriptor,
    value: AtomicU32,
    timeline: Mutex<Timeline>,
}

impl fmt::Debug for ParamShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamShared")
            .field("name", &self.descriptor.name)
            .field("value", &self.last_value())
            .finish()
    }
}

impl ParamShared {
    pub(crate) fn new(descriptor: ParamDescriptor) -> Self {
        Self {
            descriptor,
            value: AtomicU32::new(descriptor.default.to_bits()),
            timeline: Mutex::new(Timeline::new(descriptor.default)),
        }
    }

    pub(crate) fn last_value(&self) -> f32 {
        f32::from_bits(self.value.load(Ordering::Relaxed))
    }

    fn clamp(&self, v: f32) -> f32 {
        v.clamp(self.descriptor.min, self.descriptor.max)
    }

    /// Fill `out` with this quantum's values. Audio thread only.
    pub(crate) fn render(&self, ctx: &ProcessContext, audio_in: Option<&Buffer>, out: &mut Buffer) {
        match self.timeline.try_lock() {
            Some(timeline) if timeline.events.is_empty() => {
                let v = timeline.anchor_value;
                out.iter_mut().for_each(|s| *s = v);
            }
            Some(mut timeline) => {
                let sr = ctx.sample_rate as f64;
                for (i, s) in out.iter_mut().enumerate() {
                    *s = timeline.value_at((ctx.current_frame + i as u64) as f64 / sr);
                }
            }
            None => {
                let v = self.last_value();
                out.iter_mut().for_each(|s| *s = v);
            }
        }

        if let Some(audio_in) = audio_in {
            for (s, a) in out.iter_mut().zip(audio_in.iter()) {
                *s += *a;
            }
        }
        for s in out.iter_mut() {
            *s = self.clamp(*s);
        }
        self.value.store(out[out.len() - 1].to_bits(), Ordering::Relaxed);
    }
}

/// Control-thread handle to one param of a node.
#[derive(Clone)]
pub struct AudioParam {
    shared: Arc<ParamShared>,
    node: NodeId,
    index: usize,
    context: Arc<ContextShared>,
}

impl fmt::Debug for AudioParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioParam")
            .field("name", &self.name())
            .field("node", &self.node)
            .field("value", &self.value())
            .finish()
    }
}

fn check_time(time: f64) -> Result<()> {
    if !time.is_finite() || time < 0.0 {
        return Err(GraphError::invalid_schedule(format!(
            "automation time {} must be finite and non-negative",
            time
        )));
    }
    Ok(())
}

fn check_value(value: f32) -> Result<()> {
    if !value.is_finite() {
        return Err(GraphError::invalid_schedule(format!(
            "automation value {} must be finite",
            value
        )));
    }
    Ok(())
}

impl AudioParam {
    pub(crate) fn new(
        shared: Arc<ParamShared>,
        node: NodeId,
        index: usize,
        context: Arc<ContextShared>,
    ) -> Self {
        Self {
            shared,
            node,
            index,
            context,
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.descriptor.name
    }

    pub fn default_value(&self) -> f32 {
        self.shared.descriptor.default
    }

    pub fn min_value(&self) -> f32 {
        self.shared.descriptor.min
    }

    pub fn max_value(&self) -> f32 {
        self.shared.descriptor.max
    }

    /// The node this param belongs to.
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn context_id(&self) -> ContextId {
        self.context.id()
    }

    /// Last value computed by the audio thread, or the value set most
    /// recently if nothing has rendered yet.
    pub fn value(&self) -> f32 {
        self.shared.last_value()
    }

    /// Set the value now. With automation scheduled this is a
    /// `set_value_at_time` at the context's current time; otherwise it simply
    /// replaces the value. Non-finite values are ignored.
    pub fn set_value(&self, value: f32) {
        if !value.is_finite() {
            tracing::warn!(param = self.name(), value, "ignoring non-finite param value");
            return;
        }
        let mut timeline = self.shared.timeline.lock();
        if timeline.events.is_empty() {
            timeline.anchor_value = value;
            self.shared
                .value
                .store(self.shared.clamp(value).to_bits(), Ordering::Relaxed);
        } else {
            timeline.insert(ParamEvent {
                kind: EventKind::SetValue,
                time: self.context.current_time(),
                value,
            });
        }
    }

    pub fn set_value_at_time(&self, value: f32, time: f64) -> Result<&Self> {
        check_value(value)?;
        check_time(time)?;
        self.schedule(EventKind::SetValue, time, value)
    }

    pub fn linear_ramp_to_value_at_time(&self, value: f32, end_time: f64) -> Result<&Self> {
        check_value(value)?;
        check_time(end_time)?;
        self.schedule(EventKind::LinearRamp, end_time, value)
    }

    /// Exponential ramp; `value` must be strictly positive.
    pub fn exponential_ramp_to_value_at_time(&self, value: f32, end_time: f64) -> Result<&Self> {
        check_value(value)?;
        check_time(end_time)?;
        if value <= 0.0 {
            return Err(GraphError::invalid_schedule(format!(
                "exponential ramp target {} must be positive",
                value
            )));
        }
        self.schedule(EventKind::ExponentialRamp, end_time, value)
    }

    /// Approach `target` exponentially from `start_time` with the given time
    /// constant (seconds, strictly positive).
    pub fn set_target_at_time(&self, target: f32, start_time: f64, time_constant: f64) -> Result<&Self> {
        check_value(target)?;
        check_time(start_time)?;
        if !(time_constant > 0.0 && time_constant.is_finite()) {
            return Err(GraphError::invalid_schedule(format!(
                "time constant {} must be positive",
                time_constant
            )));
        }
        self.schedule(EventKind::SetTarget { time_constant }, start_time, target)
    }

    /// Remove every event at or after `time`.
    pub fn cancel_scheduled_values(&self, time: f64) -> Result<&Self> {
        check_time(time)?;
        self.shared.timeline.lock().cancel_from(time);
        Ok(self)
    }

    fn schedule(&self, kind: EventKind, time: f64, value: f32) -> Result<&Self> {
        tracing::trace!(param = self.name(), node = ?self.node, ?kind, time, value, "schedule");
        self.shared
            .timeline
            .lock()
            .insert(ParamEvent { kind, time, value });
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(kind: EventKind, time: f64, value: f32) -> ParamEvent {
        ParamEvent { kind, time, value }
    }

    #[test]
    fn set_value_steps() {
        let mut tl = Timeline::new(1.0);
        tl.insert(ev(EventKind::SetValue, 0.5, 2.0));
        assert_eq!(tl.value_at(0.25), 1.0);
        assert_eq!(tl.value_at(0.5), 2.0);
        assert_eq!(tl.value_at(3.0), 2.0);
        assert!(tl.events.is_empty());
    }

    #[test]
    fn linear_ramp_interpolates_from_previous_event() {
        let mut tl = Timeline::new(0.0);
        tl.insert(ev(EventKind::SetValue, 1.0, 0.0));
        tl.insert(ev(EventKind::LinearRamp, 2.0, 1.0));
        assert_eq!(tl.value_at(1.0), 0.0);
        assert!((tl.value_at(1.5) - 0.5).abs() < 1e-6);
        assert_eq!(tl.value_at(2.5), 1.0);
    }

    #[test]
    fn exponential_ramp_is_geometric() {
        let mut tl = Timeline::new(1.0);
        tl.insert(ev(EventKind::SetValue, 0.0, 1.0));
        tl.insert(ev(EventKind::ExponentialRamp, 2.0, 4.0));
        assert!((tl.value_at(1.0) - 2.0).abs() < 1e-5);
    }

    #[test]
    fn set_target_decays_then_hands_over() {
        let mut tl = Timeline::new(1.0);
        tl.insert(ev(EventKind::SetTarget { time_constant: 1.0 }, 0.0, 0.0));
        tl.insert(ev(EventKind::SetValue, 5.0, 0.75));
        let v = tl.value_at(1.0);
        assert!((v - (-1.0f32).exp()).abs() < 1e-5);
        assert_eq!(tl.value_at(5.0), 0.75);
    }

    #[test]
    fn cancel_drops_later_events() {
        let mut tl = Timeline::new(0.0);
        tl.insert(ev(EventKind::SetValue, 1.0, 1.0));
        tl.insert(ev(EventKind::SetValue, 2.0, 2.0));
        tl.cancel_from(1.5);
        assert_eq!(tl.value_at(10.0), 1.0);
    }

    #[test]
    fn render_clamps_and_adds_audio_input() {
        let shared = ParamShared::new(ParamDescriptor::new("gain", 0.5, 0.0, 1.0));
        let ctx = ProcessContext::new(48_000);
        let mut input = Buffer::SILENT;
        input.iter_mut().for_each(|s| *s = 0.75);
        let mut out = Buffer::SILENT;
        shared.render(&ctx, Some(&input), &mut out);
        assert_eq!(out[0], 1.0);
        assert_eq!(shared.last_value(), 1.0);
    }

    #[test]
    fn contended_timeline_holds_last_value() {
        let shared = ParamShared::new(ParamDescriptor::new("freq", 440.0, 0.0, 20_000.0));
        let ctx = ProcessContext::new(48_000);
        let mut out = Buffer::SILENT;
        shared.render(&ctx, None, &mut out);

        let mut timeline = shared.timeline.lock();
        timeline.anchor_value = 880.0;
        shared.render(&ctx, None, &mut out);
        drop(timeline);
        assert!(out.iter().all(|&s| s == 440.0));

        shared.render(&ctx, None, &mut out);
        assert_eq!(out[0], 880.0);
    }

    #[test]
    fn descriptor_validation() {
        assert!(ParamDescriptor::new("ok", 1.0, 0.0, 2.0).validate().is_ok());
        assert!(ParamDescriptor::new("bad", 3.0, 0.0, 2.0).validate().is_err());
        assert!(ParamDescriptor::new("inf", f32::INFINITY, 0.0, f32::INFINITY)
            .validate()
            .is_err());
    }
}
