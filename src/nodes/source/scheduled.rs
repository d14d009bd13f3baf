//! Start/stop scheduling shared by the built-in sources.

use core::ops::Range;
use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::node::{NodeHandle, ProcessContext, ProcessStatus};

/// Where a scheduled source is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    Unscheduled = 0,
    Scheduled = 1,
    Playing = 2,
    Finished = 3,
}

impl PlaybackState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unscheduled,
            1 => Self::Scheduled,
            2 => Self::Playing,
            _ => Self::Finished,
        }
    }
}

/// Messages for controlling a scheduled source
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceMessage {
    /// Begin producing output at this context frame
    Start { frame: u64 },
    /// Go silent and finish at this context frame
    Stop { frame: u64 },
}

fn to_frame(when: f64, sample_rate: u32) -> Result<u64> {
    if !when.is_finite() || when < 0.0 {
        return Err(GraphError::invalid_schedule(format!(
            "time {} must be finite and non-negative",
            when
        )));
    }
    Ok((when * sample_rate as f64).round() as u64)
}

/// Audio-thread half: applies [`SourceMessage`]s and decides which frames of
/// a quantum play.
#[derive(Debug)]
pub(crate) struct Schedule {
    start: Option<u64>,
    stop: Option<u64>,
    state: Arc<AtomicU8>,
}

impl Schedule {
    pub(crate) fn apply(&mut self, msg: SourceMessage) {
        match msg {
            SourceMessage::Start { frame } => self.start = Some(frame),
            SourceMessage::Stop { frame } => self.stop = Some(frame),
        }
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Frames of the current quantum during which the source plays.
    pub(crate) fn active_range(&self, ctx: &ProcessContext) -> Option<Range<usize>> {
        let start = self.start?;
        let (begin, end) = (ctx.current_frame, ctx.end_frame());
        let stop = self.stop.unwrap_or(u64::MAX);
        if start >= end || stop <= begin || stop <= start {
            return None;
        }
        self.set_state(PlaybackState::Playing);
        let from = start.saturating_sub(begin) as usize;
        let to = (stop.min(end) - begin) as usize;
        Some(from..to)
    }

    /// `Finished` once the stop frame falls inside or before this quantum.
    pub(crate) fn status(&self, ctx: &ProcessContext) -> ProcessStatus {
        match (self.start, self.stop) {
            (Some(_), Some(stop)) if stop <= ctx.end_frame() => {
                self.set_state(PlaybackState::Finished);
                ProcessStatus::Finished
            }
            _ => ProcessStatus::Active,
        }
    }
}

/// Control-thread half of a scheduled source.
#[derive(Debug)]
pub(crate) struct ScheduledSource {
    state: Arc<AtomicU8>,
}

impl ScheduledSource {
    pub(crate) fn new() -> (Self, Schedule) {
        let state = Arc::new(AtomicU8::new(PlaybackState::Unscheduled as u8));
        let schedule = Schedule {
            start: None,
            stop: None,
            state: Arc::clone(&state),
        };
        (Self { state }, schedule)
    }

    pub(crate) fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Schedule the start and hand the node to the context's active sources.
    pub(crate) fn start<M: Send + 'static>(
        &self,
        handle: &mut NodeHandle<M>,
        when: f64,
        wrap: impl FnOnce(SourceMessage) -> M,
    ) -> Result<()> {
        let frame = to_frame(when, handle.context().options().sample_rate)?;
        handle.context().ensure_open()?;
        if handle.is_full() {
            return Err(GraphError::QueueFull(handle.id()));
        }
        let unscheduled = PlaybackState::Unscheduled as u8;
        if self
            .state
            .compare_exchange(unscheduled, PlaybackState::Scheduled as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GraphError::invalid_state("source has already been started"));
        }
        let id = handle.id();
        if let Err(err) = handle.context().activate_source(id) {
            self.state.store(unscheduled, Ordering::Release);
            return Err(err);
        }
        // only this thread pushes, so the queue still has room
        if handle.send(wrap(SourceMessage::Start { frame })).is_err() {
            handle.context().with_graph(|g| Ok(g.release_source(id)))?;
            self.state.store(unscheduled, Ordering::Release);
            return Err(GraphError::QueueFull(id));
        }
        tracing::trace!(node = ?id, frame, "source scheduled");
        Ok(())
    }

    /// Schedule the stop. May be called again to move the stop time.
    pub(crate) fn stop<M: Send + 'static>(
        &self,
        handle: &mut NodeHandle<M>,
        when: f64,
        wrap: impl FnOnce(SourceMessage) -> M,
    ) -> Result<()> {
        let frame = to_frame(when, handle.context().options().sample_rate)?;
        if self.state() == PlaybackState::Unscheduled {
            return Err(GraphError::invalid_state("source stopped before it was started"));
        }
        handle
            .send(wrap(SourceMessage::Stop { frame }))
            .map_err(|_| GraphError::QueueFull(handle.id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantum(index: u64) -> ProcessContext {
        let mut ctx = ProcessContext::new(48_000);
        ctx.current_frame = index * 64;
        ctx
    }

    #[test]
    fn plays_from_start_frame_to_stop_frame() {
        let (control, mut schedule) = ScheduledSource::new();
        assert_eq!(schedule.active_range(&quantum(0)), None);

        schedule.apply(SourceMessage::Start { frame: 100 });
        schedule.apply(SourceMessage::Stop { frame: 200 });
        assert_eq!(schedule.active_range(&quantum(0)), None);
        assert_eq!(schedule.active_range(&quantum(1)), Some(36..64));
        assert_eq!(control.state(), PlaybackState::Playing);
        assert_eq!(schedule.active_range(&quantum(2)), Some(0..64));
        assert_eq!(schedule.status(&quantum(2)), ProcessStatus::Active);
        assert_eq!(schedule.active_range(&quantum(3)), Some(0..8));
        assert_eq!(schedule.status(&quantum(3)), ProcessStatus::Finished);
        assert_eq!(control.state(), PlaybackState::Finished);
        assert_eq!(schedule.active_range(&quantum(4)), None);
    }

    #[test]
    fn unstopped_source_stays_active() {
        let (_, mut schedule) = ScheduledSource::new();
        schedule.apply(SourceMessage::Start { frame: 0 });
        assert_eq!(schedule.active_range(&quantum(1000)), Some(0..64));
        assert_eq!(schedule.status(&quantum(1000)), ProcessStatus::Active);
    }

    #[test]
    fn times_become_frames() {
        assert_eq!(to_frame(0.5, 48_000).unwrap(), 24_000);
        assert!(matches!(to_frame(-0.1, 48_000), Err(GraphError::InvalidSchedule(_))));
        assert!(to_frame(f64::INFINITY, 48_000).is_err());
    }
}
