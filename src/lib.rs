//! # rendergraph
//!
//! A realtime audio render graph. The control thread creates, connects,
//! reconfigures and drops nodes while a single audio thread renders the
//! graph one quantum of [`RENDER_QUANTUM_FRAMES`] frames at a time.
//!
//! The audio thread never blocks: every quantum it *tries* to take the graph
//! lock, migrates pending topology edits into its rendering snapshot, runs the
//! nodes, and hands anything that must not be freed on the audio thread back
//! to the control thread through a lock-free task queue. When the lock is
//! contended it simply renders with last quantum's snapshot.
//!
//! ## Quick Start
//!
//! ```
//! use rendergraph::{AudioContext, BaseAudioContext, ContextOptions};
//! use rendergraph::nodes::{ConstantSourceNode, GainNode};
//!
//! let (ctx, mut renderer) = AudioContext::detached(ContextOptions::default()).unwrap();
//! let mut source = ConstantSourceNode::new(&ctx).unwrap();
//! let gain = GainNode::new(&ctx).unwrap();
//! gain.gain().set_value(0.5);
//!
//! ctx.connect(&source, &gain).unwrap();
//! ctx.connect(&gain, &ctx.destination()).unwrap();
//! source.start(0.0).unwrap();
//! ctx.resume().unwrap();
//!
//! // Normally a device callback drives the renderer.
//! let out = renderer.render_quantum();
//! assert!((out.channel(0)[0] - 0.5).abs() < 1e-6);
//!
//! ctx.process_control_tasks();
//! ```
//!
//! ## Threads
//!
//! - **Control thread**: everything on [`BaseAudioContext`], node handles,
//!   params and the listener. May block on [`BaseAudioContext::lock`].
//! - **Audio thread**: the [`Renderer`]. Driven by a cpal callback
//!   (`cpal_sink` feature), by the offline worker, or by your own code.
//!
//! Anything the audio thread needs to tell the control thread (a node can be
//! freed, a source ended, rendering suspended) arrives as a task and is
//! applied by [`BaseAudioContext::process_control_tasks`].
//!
//! ## Features
//!
//! - `cpal_sink`: realtime output through the system's default device.

pub mod config;
pub mod context;
pub mod dirty;
pub mod error;
pub mod handler;
pub mod listener;
pub mod node;
pub mod nodes;
pub mod param;
pub mod positional;
pub mod render;

mod graph;

#[cfg(feature = "cpal_sink")]
pub mod device;

pub use config::{ContextOptions, MAX_CHANNELS, MAX_HARDWARE_CONTEXTS, RENDER_QUANTUM_FRAMES};
pub use context::{
    AudioBuffer, AudioContext, BaseAudioContext, ContextEvent, ContextState, DestinationNode,
    OfflineAudioContext,
};
pub use error::{GraphError, Result};
pub use handler::GraphGuard;
pub use listener::AudioListener;
pub use node::{AsNode, AudioNode, Bus, ContextId, NodeHandle, NodeId, ProcessContext, ProcessStatus};
pub use param::{AudioParam, ParamDescriptor};
pub use render::Renderer;

#[cfg(feature = "cpal_sink")]
pub use device::OutputDevice;

pub use dasp_graph::Buffer;
