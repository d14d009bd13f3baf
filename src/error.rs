//! Error types for rendergraph.
//!
//! Every error is raised synchronously on the control thread, at the call
//! that attempted the invalid operation. The audio thread never fails: when
//! it cannot take the graph lock it renders with the state it already has.

use crate::node::NodeId;

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, GraphError>;

/// Rejections reported by the control-thread API.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// The call is not valid in the current state (e.g. resuming a closed
    /// context, starting a source twice).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An input, output or param index is out of range for the node.
    #[error("{kind} index {index} out of range (node has {count})")]
    IndexSize {
        /// Which kind of port was addressed.
        kind: &'static str,
        /// The requested index.
        index: usize,
        /// How many ports of that kind the node has.
        count: usize,
    },

    /// The objects involved belong to different contexts.
    #[error("invalid access: {0}")]
    InvalidAccess(String),

    /// A channel count, sample rate or length is outside the supported range.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A time or frame argument is negative, duplicated, out of range or
    /// already in the past.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The node was already deleted from the graph.
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),

    /// The node's message queue is full; the message was not delivered.
    #[error("message queue for node {0:?} is full")]
    QueueFull(NodeId),

    /// Too many hardware-backed contexts are open at once.
    #[error("too many hardware contexts (limit {limit})")]
    TooManyContexts {
        /// Maximum number of concurrent hardware contexts.
        limit: usize,
    },

    /// The audio backend failed to open or start a stream.
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl GraphError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub(crate) fn invalid_schedule(msg: impl Into<String>) -> Self {
        Self::InvalidSchedule(msg.into())
    }

    pub(crate) fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }
}
