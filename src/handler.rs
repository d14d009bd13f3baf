//! The graph lock and the audio-to-control task queue.
//!
//! [`DeferredTaskHandler`] owns the graph state behind a reentrant mutex and
//! records which thread owns it. The control thread blocks on [`lock`]; the
//! audio thread only ever calls [`try_lock`] and treats failure as "render
//! with what I already have". Whatever the audio thread cannot do itself
//! (free memory, notify user code) travels back as a [`ControlTask`].
//!
//! [`lock`]: DeferredTaskHandler::lock
//! [`try_lock`]: DeferredTaskHandler::try_lock

use core::cell::{RefCell, RefMut};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use rtrb::{Consumer, Producer, PushError, RingBuffer};

use crate::context::{AudioBuffer, ContextShared};
use crate::graph::GraphState;
use crate::node::NodeId;
use crate::render::RenderGraph;

static NEXT_THREAD_TOKEN: AtomicUsize = AtomicUsize::new(1);

std::thread_local! {
    static THREAD_TOKEN: usize = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Small non-zero integer identifying the calling thread. Zero means "none".
pub(crate) fn current_thread_token() -> usize {
    THREAD_TOKEN.with(|t| *t)
}

/// Guards the graph state shared by the control and audio threads.
pub struct DeferredTaskHandler {
    graph: ReentrantMutex<RefCell<GraphState>>,
    owner: AtomicUsize,
    depth: AtomicUsize,
    audio_thread: AtomicUsize,
}

impl DeferredTaskHandler {
    pub(crate) fn new(state: GraphState) -> Self {
        Self {
            graph: ReentrantMutex::new(RefCell::new(state)),
            owner: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
            audio_thread: AtomicUsize::new(0),
        }
    }

    /// Blocking acquire for the control thread. Reentrant: a thread that
    /// already owns the lock gets a nested guard and the lock is released
    /// only when the outermost guard drops.
    pub fn lock(&self) -> GraphGuard<'_> {
        debug_assert!(
            !self.is_audio_thread(),
            "the audio thread must never block on the graph lock"
        );
        let guard = self.graph.lock();
        self.acquired(guard)
    }

    /// Non-blocking acquire for the audio thread. `None` is the normal
    /// contended case, not an error.
    pub fn try_lock(&self) -> Option<GraphGuard<'_>> {
        debug_assert!(
            self.is_audio_thread(),
            "try_lock is reserved for the audio thread"
        );
        self.graph.try_lock().map(|guard| self.acquired(guard))
    }

    /// Blocking acquire for the offline worker, which stands in for the audio
    /// thread but has no deadline to keep.
    pub(crate) fn offline_lock(&self) -> GraphGuard<'_> {
        debug_assert!(self.is_audio_thread());
        let guard = self.graph.lock();
        self.acquired(guard)
    }

    fn acquired<'a>(&'a self, guard: ReentrantMutexGuard<'a, RefCell<GraphState>>) -> GraphGuard<'a> {
        // depth is only touched while the mutex is held
        if self.depth.fetch_add(1, Ordering::Relaxed) == 0 {
            self.owner.store(current_thread_token(), Ordering::Release);
        }
        GraphGuard {
            guard,
            handler: self,
        }
    }

    fn released(&self) {
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(0, Ordering::Release);
        }
    }

    /// Whether the calling thread currently holds the graph lock.
    pub fn is_graph_owner(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_token()
    }

    pub fn is_audio_thread(&self) -> bool {
        self.audio_thread.load(Ordering::Acquire) == current_thread_token()
    }

    /// Designate the calling thread as the audio thread until
    /// [`leave_audio_thread`](Self::leave_audio_thread).
    pub(crate) fn enter_audio_thread(&self) {
        self.audio_thread
            .store(current_thread_token(), Ordering::Release);
    }

    pub(crate) fn leave_audio_thread(&self) {
        self.audio_thread.store(0, Ordering::Release);
    }
}

/// Proof that the current thread holds the graph lock.
///
/// Returned by [`BaseAudioContext::lock`](crate::BaseAudioContext::lock).
/// Holding one keeps the audio thread from applying any topology change; it
/// keeps rendering with its last snapshot until the guard drops.
pub struct GraphGuard<'a> {
    guard: ReentrantMutexGuard<'a, RefCell<GraphState>>,
    handler: &'a DeferredTaskHandler,
}

impl GraphGuard<'_> {
    pub(crate) fn state(&self) -> RefMut<'_, GraphState> {
        self.guard.borrow_mut()
    }
}

impl Drop for GraphGuard<'_> {
    fn drop(&mut self) {
        // runs before `guard` is dropped, so the owner is cleared while the
        // mutex is still held
        self.handler.released();
    }
}

/// Work the audio thread hands back to the control thread.
pub(crate) enum ControlTask {
    /// Nodes were moved to the to-delete list. Holds the context alive until
    /// the control thread has freed them.
    DeleteMarkedNodes(Arc<ContextShared>),
    Resumed,
    SourceEnded(NodeId),
    Suspended { frame: u64 },
    RenderComplete(AudioBuffer),
    /// The renderer was dropped; its node arena must be freed off the audio
    /// thread.
    Retired(Box<RenderGraph>),
}

pub(crate) fn task_queue(capacity: usize) -> (TaskSender, TaskReceiver) {
    let (producer, consumer) = RingBuffer::new(capacity);
    let sender = TaskSender {
        producer,
        overflow: VecDeque::with_capacity(capacity),
    };
    (sender, TaskReceiver(Mutex::new(consumer)))
}

/// Audio-thread end of the task queue.
pub(crate) struct TaskSender {
    producer: Producer<ControlTask>,
    overflow: VecDeque<ControlTask>,
}

impl TaskSender {
    /// Post a task. Order is preserved; when the queue is full the task waits
    /// in the overflow list until the control thread catches up.
    pub(crate) fn post(&mut self, task: ControlTask) {
        self.flush();
        if !self.overflow.is_empty() {
            self.overflow.push_back(task);
            return;
        }
        if let Err(PushError::Full(task)) = self.producer.push(task) {
            self.overflow.push_back(task);
        }
    }

    pub(crate) fn flush(&mut self) {
        while let Some(task) = self.overflow.pop_front() {
            if let Err(PushError::Full(task)) = self.producer.push(task) {
                self.overflow.push_front(task);
                break;
            }
        }
    }

    pub(crate) fn pending_overflow(&self) -> usize {
        self.overflow.len()
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.producer.is_abandoned()
    }

    /// Empty the overflow list, for when the sender itself is going away.
    pub(crate) fn take_overflow(&mut self) -> Vec<ControlTask> {
        self.overflow.drain(..).collect()
    }
}

/// Control-thread end of the task queue.
pub(crate) struct TaskReceiver(Mutex<Consumer<ControlTask>>);

impl TaskReceiver {
    pub(crate) fn drain(&self) -> Vec<ControlTask> {
        let mut consumer = self.0.lock();
        let mut tasks = Vec::with_capacity(consumer.slots());
        while let Ok(task) = consumer.pop() {
            tasks.push(task);
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextOptions;
    use std::sync::mpsc;

    fn handler() -> Arc<DeferredTaskHandler> {
        let options = ContextOptions::default();
        Arc::new(DeferredTaskHandler::new(GraphState::new(&options)))
    }

    #[test]
    fn lock_is_reentrant_and_tracks_owner() {
        let handler = handler();
        assert!(!handler.is_graph_owner());
        {
            let _outer = handler.lock();
            assert!(handler.is_graph_owner());
            {
                let _inner = handler.lock();
                assert!(handler.is_graph_owner());
            }
            // releasing the nested guard keeps the lock
            assert!(handler.is_graph_owner());
        }
        assert!(!handler.is_graph_owner());
    }

    #[test]
    fn try_lock_fails_while_control_thread_holds_lock() {
        let handler = handler();
        let guard = handler.lock();

        let (tx, rx) = mpsc::channel();
        let audio = Arc::clone(&handler);
        let join = std::thread::spawn(move || {
            audio.enter_audio_thread();
            tx.send(audio.try_lock().is_some()).unwrap();
        });
        assert!(!rx.recv().unwrap());
        join.join().unwrap();

        drop(guard);
        let audio = Arc::clone(&handler);
        let got = std::thread::spawn(move || {
            audio.enter_audio_thread();
            let guard = audio.try_lock();
            let owner = audio.is_graph_owner();
            (guard.is_some(), owner)
        })
        .join()
        .unwrap();
        assert_eq!(got, (true, true));
    }

    #[test]
    fn overflowing_tasks_keep_their_order() {
        let (mut sender, receiver) = task_queue(2);
        for i in 0..5 {
            sender.post(ControlTask::SourceEnded(NodeId(i)));
        }
        assert_eq!(sender.pending_overflow(), 3);

        let ids = |tasks: Vec<ControlTask>| -> Vec<u32> {
            tasks
                .into_iter()
                .filter_map(|t| match t {
                    ControlTask::SourceEnded(id) => Some(id.0),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(ids(receiver.drain()), vec![0, 1]);
        sender.flush();
        assert_eq!(ids(receiver.drain()), vec![2, 3]);
        sender.post(ControlTask::SourceEnded(NodeId(5)));
        assert_eq!(ids(receiver.drain()), vec![4, 5]);
    }
}
