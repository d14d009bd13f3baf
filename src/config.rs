//! Context configuration and global limits.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{GraphError, Result};

/// Number of frames processed per render quantum.
pub const RENDER_QUANTUM_FRAMES: usize = dasp_graph::Buffer::LEN;

/// Maximum number of channels on any bus.
pub const MAX_CHANNELS: usize = 32;

/// Maximum number of hardware-backed contexts open at the same time.
pub const MAX_HARDWARE_CONTEXTS: usize = 6;

/// Supported sample rate range in Hz.
pub const MIN_SAMPLE_RATE: u32 = 3_000;
/// Supported sample rate range in Hz.
pub const MAX_SAMPLE_RATE: u32 = 768_000;

/// Options used to construct a context.
///
/// Built with the usual `with_*` methods and validated once, when the
/// context is created. Nothing here can fail later, mid-render.
///
/// ```
/// use rendergraph::ContextOptions;
///
/// let options = ContextOptions::default()
///     .with_sample_rate(44_100)
///     .with_channels(1);
/// assert!(options.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContextOptions {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count of the destination.
    pub channels: usize,
    /// Number of node slots pre-allocated on the audio thread.
    pub node_capacity: usize,
    /// Capacity of each node's message queue.
    pub message_queue_size: usize,
    /// Capacity of the audio-to-control task queue.
    pub task_queue_size: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            node_capacity: 256,
            message_queue_size: 64,
            task_queue_size: 256,
        }
    }
}

impl ContextOptions {
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_node_capacity(mut self, capacity: usize) -> Self {
        self.node_capacity = capacity;
        self
    }

    pub fn with_message_queue_size(mut self, size: usize) -> Self {
        self.message_queue_size = size;
        self
    }

    pub fn with_task_queue_size(mut self, size: usize) -> Self {
        self.task_queue_size = size;
        self
    }

    /// Check every field against the supported ranges.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(GraphError::not_supported(format!(
                "sample rate {} Hz outside {}..={} Hz",
                self.sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }
        validate_channel_count(self.channels)?;
        if self.message_queue_size == 0 || self.task_queue_size == 0 {
            return Err(GraphError::not_supported("queue sizes must be non-zero"));
        }
        Ok(())
    }
}

pub(crate) fn validate_channel_count(channels: usize) -> Result<()> {
    if channels == 0 || channels > MAX_CHANNELS {
        return Err(GraphError::not_supported(format!(
            "channel count {} outside 1..={}",
            channels, MAX_CHANNELS
        )));
    }
    Ok(())
}

/// Counter of hardware contexts currently open.
pub(crate) struct HardwareSlots {
    limit: usize,
    active: AtomicUsize,
}

#[cfg_attr(not(feature = "cpal_sink"), allow(dead_code))]
pub(crate) static HARDWARE_CONTEXTS: HardwareSlots = HardwareSlots::new(MAX_HARDWARE_CONTEXTS);

impl HardwareSlots {
    pub(crate) const fn new(limit: usize) -> Self {
        Self {
            limit,
            active: AtomicUsize::new(0),
        }
    }

    /// Claim a slot; released when the returned guard drops.
    pub(crate) fn claim(&self) -> Result<HardwareSlot<'_>> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return Err(GraphError::TooManyContexts { limit: self.limit });
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(HardwareSlot { slots: self }),
                Err(actual) => current = actual,
            }
        }
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

pub(crate) struct HardwareSlot<'a> {
    slots: &'a HardwareSlots,
}

impl Drop for HardwareSlot<'_> {
    fn drop(&mut self) {
        self.slots.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        assert!(ContextOptions::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let too_many = ContextOptions::default().with_channels(MAX_CHANNELS + 1);
        assert!(matches!(too_many.validate(), Err(GraphError::NotSupported(_))));

        let silent = ContextOptions::default().with_channels(0);
        assert!(silent.validate().is_err());

        let slow = ContextOptions::default().with_sample_rate(100);
        assert!(slow.validate().is_err());
    }

    #[test]
    fn hardware_slots_enforce_limit() {
        let slots = HardwareSlots::new(2);
        let a = slots.claim().unwrap();
        let _b = slots.claim().unwrap();
        assert_eq!(
            slots.claim().err(),
            Some(GraphError::TooManyContexts { limit: 2 })
        );

        drop(a);
        assert_eq!(slots.active(), 1);
        assert!(slots.claim().is_ok());
    }
}
