//! Built-in audio nodes.
//!
//! Nodes are organized into three categories:
//!
//! ## Sources ([`source`])
//!
//! Generate audio with no audio inputs. Both are scheduled with
//! `start`/`stop` and count as active sources while playing:
//! - [`OscillatorNode`] - Periodic waveform with a `frequency` param
//! - [`ConstantSourceNode`] - Outputs its `offset` param
//!
//! ## Effects ([`effect`])
//!
//! Process audio (inputs → outputs):
//! - [`GainNode`] - Multiplies its input by the `gain` param
//! - [`PannerNode`] - Positions its input relative to the context's listener
//!
//! ## Sinks ([`sink`])
//!
//! - [`DestinationNode`] - The context's output; one per context
//! - [`MeterNode`] - Pass-through peak meter, processed even when nothing
//!   downstream reads it
//!
//! # Message Types
//!
//! Scheduled sources take [`SourceMessage`]s; [`OscillatorMessage`] adds a
//! waveform change. Nodes without discrete updates use `()`.

pub mod effect;
pub mod sink;
pub mod source;

pub use effect::{GainNode, PannerNode};
pub use sink::{DestinationNode, MeterNode};
pub use source::{
    ConstantSourceNode, OscillatorMessage, OscillatorNode, PlaybackState, SourceMessage, Waveform,
};
