use core::fmt;
use std::sync::Arc;

use super::{BaseAudioContext, ContextShared, ContextState};
use crate::config::ContextOptions;
use crate::error::{GraphError, Result};
use crate::render::Renderer;

#[cfg(feature = "cpal_sink")]
use crate::config::{HardwareSlot, HARDWARE_CONTEXTS};
#[cfg(feature = "cpal_sink")]
use crate::device::OutputDevice;

/// A context rendered in real time.
///
/// Starts `Suspended`; nothing is rendered until [`resume`](Self::resume).
/// With the `cpal_sink` feature [`AudioContext::new`] plays through the
/// default output device. [`AudioContext::detached`] hands the
/// [`Renderer`] to the caller instead, for custom sinks and tests.
pub struct AudioContext {
    shared: Arc<ContextShared>,
    #[cfg(feature = "cpal_sink")]
    backend: Option<Backend>,
}

#[cfg(feature = "cpal_sink")]
struct Backend {
    stream: cpal::Stream,
    _slot: HardwareSlot<'static>,
}

impl AudioContext {
    /// Create a context without a device. The returned renderer must be
    /// driven by the caller, one thread at a time.
    pub fn detached(options: ContextOptions) -> Result<(Self, Renderer)> {
        let (shared, renderer) = ContextShared::new(options)?;
        let ctx = Self {
            shared,
            #[cfg(feature = "cpal_sink")]
            backend: None,
        };
        Ok((ctx, renderer))
    }

    /// Open the default output device. Sample rate and channel count come
    /// from the device; the rest of `options` is kept.
    ///
    /// Fails with [`GraphError::TooManyContexts`] when
    /// [`MAX_HARDWARE_CONTEXTS`](crate::MAX_HARDWARE_CONTEXTS) are already
    /// open.
    #[cfg(feature = "cpal_sink")]
    pub fn new(options: ContextOptions) -> Result<Self> {
        let slot = HARDWARE_CONTEXTS.claim()?;
        let device = OutputDevice::default_output()
            .ok_or_else(|| GraphError::Backend("no default output device".into()))?;
        let options = options
            .with_sample_rate(device.sample_rate())
            .with_channels(device.channels() as usize);
        let (shared, renderer) = ContextShared::new(options)?;
        let stream = device.start(renderer)?;
        Ok(Self {
            shared,
            backend: Some(Backend {
                stream,
                _slot: slot,
            }),
        })
    }

    /// Suspended → Running.
    pub fn resume(&self) -> Result<()> {
        self.shared.resume()
    }

    /// Running → Suspended. The renderer outputs silence and the clock
    /// stops until the next resume.
    pub fn suspend(&self) -> Result<()> {
        self.shared.suspend()
    }

    /// Stop rendering for good and free every node that is no longer
    /// referenced. Closing twice is an error.
    pub fn close(&mut self) -> Result<()> {
        if self.shared.state() == ContextState::Closed {
            return Err(GraphError::invalid_state("context is already closed"));
        }
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        #[cfg(feature = "cpal_sink")]
        if let Some(backend) = self.backend.take() {
            // stops the callback; the renderer retires through the task queue
            drop(backend.stream);
        }
        self.shared.shutdown();
    }
}

impl BaseAudioContext for AudioContext {
    fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }
}

impl fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioContext")
            .field("id", &self.shared.id())
            .field("state", &self.shared.state())
            .field("sample_rate", &self.shared.options().sample_rate)
            .finish()
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        // a device renderer retires here, while the queue is still drained
        #[cfg(feature = "cpal_sink")]
        drop(self.backend.take());
        self.shared.detach_control();
        self.teardown();
    }
}
