use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};

use hashbrown::HashSet;
use parking_lot::Mutex;

use super::{AudioBuffer, BaseAudioContext, ContextEvent, ContextShared, ContextState};
use crate::config::{ContextOptions, RENDER_QUANTUM_FRAMES};
use crate::error::{GraphError, Result};
use crate::handler::ControlTask;
use crate::render::Renderer;

const QUANTUM: u64 = RENDER_QUANTUM_FRAMES as u64;

/// Flags shared between the control thread and the offline worker.
#[derive(Default)]
struct OfflineControl {
    /// Quantum-aligned frames to halt at. Checked and edited only under its
    /// own lock so a request can never race past the worker.
    suspends: Mutex<HashSet<u64>>,
    started: AtomicBool,
    resume: AtomicBool,
    cancel: AtomicBool,
    finished: AtomicBool,
    waiter: Mutex<Option<Thread>>,
}

impl OfflineControl {
    fn wake(&self) {
        if let Some(waiter) = self.waiter.lock().as_ref() {
            waiter.unpark();
        }
    }
}

/// A context that renders a fixed number of frames as fast as possible on a
/// worker thread.
///
/// ```
/// use rendergraph::{BaseAudioContext, OfflineAudioContext};
/// use rendergraph::nodes::ConstantSourceNode;
///
/// let mut ctx = OfflineAudioContext::new(1, 256, 48_000).unwrap();
/// let mut source = ConstantSourceNode::new(&ctx).unwrap();
/// ctx.connect(&source, &ctx.destination()).unwrap();
/// source.start(0.0).unwrap();
///
/// ctx.suspend_at_frame(128).unwrap();
/// ctx.start_rendering().unwrap();
/// // ... pick up the `SuspendedAt` event, edit the graph, resume ...
/// let buffer = ctx.render().unwrap();
/// assert_eq!(buffer.length(), 256);
/// ```
pub struct OfflineAudioContext {
    shared: Arc<ContextShared>,
    renderer: Option<Renderer>,
    control: Arc<OfflineControl>,
    length: usize,
    worker: Option<JoinHandle<Renderer>>,
    events: VecDeque<ContextEvent>,
}

impl OfflineAudioContext {
    /// `length` frames of `channels` channels at `sample_rate`.
    pub fn new(channels: usize, length: usize, sample_rate: u32) -> Result<Self> {
        if length == 0 {
            return Err(GraphError::not_supported("offline length must be at least one frame"));
        }
        let options = ContextOptions::default()
            .with_channels(channels)
            .with_sample_rate(sample_rate);
        Self::with_options(options, length)
    }

    pub fn with_options(options: ContextOptions, length: usize) -> Result<Self> {
        if length == 0 {
            return Err(GraphError::not_supported("offline length must be at least one frame"));
        }
        let (shared, renderer) = ContextShared::new(options)?;
        Ok(Self {
            shared,
            renderer: Some(renderer),
            control: Arc::new(OfflineControl::default()),
            length,
            worker: None,
            events: VecDeque::new(),
        })
    }

    /// Total frames to render.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Halt rendering at `when` seconds, rounded down to a quantum boundary.
    /// Returns the frame rendering will halt at.
    pub fn suspend(&self, when: f64) -> Result<u64> {
        if !when.is_finite() || when < 0.0 {
            return Err(GraphError::invalid_schedule(format!(
                "suspend time {} must be finite and non-negative",
                when
            )));
        }
        let frame = (when * self.sample_rate() as f64).floor() as u64;
        self.suspend_at_frame(frame)
    }

    /// Halt rendering right before `frame` (rounded down to a quantum
    /// boundary) is rendered.
    ///
    /// Rejected when the frame is at or past the end, already rendered, or
    /// already requested.
    pub fn suspend_at_frame(&self, frame: u64) -> Result<u64> {
        self.shared.ensure_open()?;
        let frame = frame / QUANTUM * QUANTUM;
        if frame >= self.length as u64 {
            return Err(GraphError::invalid_schedule(format!(
                "suspend frame {} is beyond the rendering length {}",
                frame, self.length
            )));
        }

        let mut suspends = self.control.suspends.lock();
        if self.control.started.load(Ordering::Acquire) && frame <= self.shared.current_frame() {
            return Err(GraphError::invalid_schedule(format!(
                "suspend frame {} has already been rendered",
                frame
            )));
        }
        if !suspends.insert(frame) {
            return Err(GraphError::invalid_schedule(format!(
                "a suspend is already scheduled at frame {}",
                frame
            )));
        }
        tracing::debug!(frame, "offline suspend scheduled");
        Ok(frame)
    }

    /// Spawn the worker and start rendering. Only once.
    pub fn start_rendering(&mut self) -> Result<()> {
        if self.renderer.is_none() {
            return Err(GraphError::invalid_state("rendering has already started"));
        }
        self.shared.resume()?;
        let Some(renderer) = self.renderer.take() else {
            return Err(GraphError::invalid_state("rendering has already started"));
        };
        self.control.started.store(true, Ordering::Release);
        *self.control.waiter.lock() = Some(thread::current());

        let control = Arc::clone(&self.control);
        let length = self.length;
        let worker = thread::Builder::new()
            .name("rendergraph-offline".into())
            .spawn(move || render_worker(renderer, control, length))
            .map_err(|e| GraphError::Backend(e.to_string()))?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Continue after a suspend.
    pub fn resume(&self) -> Result<()> {
        let Some(worker) = &self.worker else {
            return Err(GraphError::invalid_state("rendering has not started"));
        };
        self.shared.resume()?;
        self.control.resume.store(true, Ordering::Release);
        worker.thread().unpark();
        Ok(())
    }

    /// Block until the next event. `None` once rendering has finished (or
    /// never started) and every event has been returned.
    pub fn next_event(&mut self) -> Option<ContextEvent> {
        *self.control.waiter.lock() = Some(thread::current());
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            // read before draining so nothing posted before the flag is missed
            let finished = self.control.finished.load(Ordering::Acquire);
            if finished {
                self.join_worker();
            }
            self.events.extend(self.shared.process_control_tasks());
            if !self.events.is_empty() {
                continue;
            }
            if finished || !self.control.started.load(Ordering::Acquire) {
                return None;
            }
            thread::park_timeout(Duration::from_millis(10));
        }
    }

    /// Render to completion, resuming through every suspend, and return the
    /// result. Starts rendering if needed.
    pub fn render(&mut self) -> Result<AudioBuffer> {
        if !self.control.started.load(Ordering::Acquire) {
            self.start_rendering()?;
        }
        while let Some(event) = self.next_event() {
            match event {
                ContextEvent::SuspendedAt { .. } => self.resume()?,
                ContextEvent::RenderComplete(buffer) => return Ok(buffer),
                _ => {}
            }
        }
        Err(GraphError::invalid_state("rendering ended without a result"))
    }

    fn join_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.join() {
            // dropped here, on the control thread
            Ok(renderer) => drop(renderer),
            Err(_) => tracing::warn!("offline worker panicked"),
        }
    }
}

fn render_worker(mut renderer: Renderer, control: Arc<OfflineControl>, length: usize) -> Renderer {
    let shared = Arc::clone(renderer.shared());
    let options = shared.options();
    let mut buffer = AudioBuffer::new(options.channels, length, options.sample_rate);
    tracing::debug!(length, "offline rendering started");

    let mut frame = 0u64;
    while frame < length as u64 {
        if control.cancel.load(Ordering::Acquire) {
            tracing::debug!(frame, "offline rendering cancelled");
            return renderer;
        }

        let suspend_here = control.suspends.lock().remove(&frame);
        if suspend_here {
            shared.set_state(ContextState::Suspended);
            renderer.post(ControlTask::Suspended { frame });
            control.wake();
            tracing::debug!(frame, "offline rendering suspended");
            while !control.resume.swap(false, Ordering::AcqRel) {
                if control.cancel.load(Ordering::Acquire) {
                    return renderer;
                }
                thread::park();
            }
        }

        let out = renderer.render_offline_quantum();
        buffer.write_quantum(out, frame as usize);
        frame += QUANTUM;
    }

    renderer.post(ControlTask::RenderComplete(buffer));
    shared.set_state(ContextState::Closed);
    control.finished.store(true, Ordering::Release);
    control.wake();
    tracing::debug!(frames = length, "offline rendering complete");
    renderer
}

impl BaseAudioContext for OfflineAudioContext {
    fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }
}

impl fmt::Debug for OfflineAudioContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineAudioContext")
            .field("id", &self.shared.id())
            .field("state", &self.shared.state())
            .field("length", &self.length)
            .finish()
    }
}

impl Drop for OfflineAudioContext {
    fn drop(&mut self) {
        self.control.cancel.store(true, Ordering::Release);
        if let Some(worker) = &self.worker {
            worker.thread().unpark();
        }
        self.join_worker();
        drop(self.renderer.take());
        self.shared.detach_control();
        self.shared.shutdown();
    }
}
