#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use rendergraph::{AudioNode, Buffer, Bus, NodeId, ProcessContext, ProcessStatus, Renderer};

/// Sets up `tracing` output for a test run. Honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

enum Command {
    Render,
    Inputs(NodeId, usize),
    Stop,
}

enum Reply {
    Rendered(Quantum),
    Inputs(Vec<NodeId>),
}

/// What one quantum looked like from the audio thread.
#[derive(Clone, Debug)]
pub struct Quantum {
    pub peak: f32,
    pub first_sample: f32,
    pub live_nodes: usize,
    pub frame: u64,
}

/// A dedicated thread that owns a [`Renderer`] and renders on request, so
/// the test thread can play the control thread.
pub struct AudioThread {
    commands: Sender<Command>,
    replies: Receiver<Reply>,
    handle: Option<JoinHandle<Renderer>>,
}

impl AudioThread {
    pub fn spawn(mut renderer: Renderer) -> Self {
        let (commands, command_rx) = channel();
        let (reply_tx, replies) = channel();
        let handle = thread::Builder::new()
            .name("test-audio".into())
            .spawn(move || {
                for command in command_rx {
                    match command {
                        Command::Render => {
                            let out = renderer.render_quantum();
                            let (peak, first_sample) = (out.peak(), out.channel(0)[0]);
                            let quantum = Quantum {
                                peak,
                                first_sample,
                                live_nodes: renderer.live_nodes(),
                                frame: renderer.current_frame(),
                            };
                            let _ = reply_tx.send(Reply::Rendered(quantum));
                        }
                        Command::Inputs(id, input) => {
                            let _ = reply_tx.send(Reply::Inputs(renderer.rendering_inputs(id, input)));
                        }
                        Command::Stop => break,
                    }
                }
                renderer
            })
            .expect("spawn audio thread");
        Self {
            commands,
            replies,
            handle: Some(handle),
        }
    }

    pub fn render(&self) -> Quantum {
        self.commands.send(Command::Render).expect("audio thread gone");
        match self.replies.recv().expect("audio thread gone") {
            Reply::Rendered(q) => q,
            Reply::Inputs(_) => panic!("unexpected reply"),
        }
    }

    pub fn render_n(&self, n: usize) -> Vec<Quantum> {
        (0..n).map(|_| self.render()).collect()
    }

    pub fn rendering_inputs(&self, id: NodeId, input: usize) -> Vec<NodeId> {
        self.commands
            .send(Command::Inputs(id, input))
            .expect("audio thread gone");
        match self.replies.recv().expect("audio thread gone") {
            Reply::Inputs(ids) => ids,
            Reply::Rendered(_) => panic!("unexpected reply"),
        }
    }

    /// Stop the thread and get the renderer back on the calling thread.
    pub fn stop(mut self) -> Renderer {
        let _ = self.commands.send(Command::Stop);
        self.handle
            .take()
            .expect("joined twice")
            .join()
            .expect("audio thread panicked")
    }
}

impl Drop for AudioThread {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Shared observations of a [`Probe`].
#[derive(Debug, Default)]
pub struct ProbeLog {
    pub processed: AtomicUsize,
    pub dropped_on: Mutex<Option<ThreadId>>,
}

impl ProbeLog {
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn dropped_on(&self) -> Option<ThreadId> {
        *self.dropped_on.lock()
    }
}

/// A source that outputs `value`, counts its process calls and records the
/// thread it is dropped on.
pub struct Probe {
    pub value: f32,
    pub log: Arc<ProbeLog>,
}

impl Probe {
    pub fn new(value: f32) -> (Self, Arc<ProbeLog>) {
        let log = Arc::new(ProbeLog::default());
        (
            Self {
                value,
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl AudioNode for Probe {
    type Message = ();

    fn process(
        &mut self,
        _ctx: &ProcessContext,
        _messages: impl Iterator<Item = ()>,
        _inputs: &[Bus],
        _params: &[Buffer],
        outputs: &mut [Bus],
    ) -> ProcessStatus {
        self.log.processed.fetch_add(1, Ordering::SeqCst);
        for b in outputs[0].channels_mut() {
            b.iter_mut().for_each(|s| *s = self.value);
        }
        ProcessStatus::Active
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        *self.log.dropped_on.lock() = Some(thread::current().id());
    }
}
