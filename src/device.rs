//! CPAL output devices.
//!
//! [`OutputDevice`] discovers output devices and drives a [`Renderer`] from
//! the device's callback. Most code does not need it directly:
//! [`AudioContext::new`](crate::AudioContext::new) opens the default device.
//!
//! # Example: List Devices
//!
//! ```no_run
//! use rendergraph::OutputDevice;
//!
//! for (i, device) in OutputDevice::list_outputs().iter().enumerate() {
//!     println!("[{}] {} ({} Hz, {} ch)",
//!         i, device.name(), device.sample_rate(), device.channels());
//! }
//! ```

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SupportedStreamConfig};

use crate::error::{GraphError, Result};
use crate::render::Renderer;

/// A discovered audio output device.
pub struct OutputDevice {
    device: cpal::Device,
    config: SupportedStreamConfig,
    name: String,
    sample_rate: u32,
    channels: u16,
}

impl OutputDevice {
    fn from_device(device: cpal::Device) -> Option<Self> {
        let config = device.default_output_config().ok()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".into());
        Some(Self {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
            name,
            device,
            config,
        })
    }

    /// The system's default output device, if there is one.
    pub fn default_output() -> Option<Self> {
        let host = cpal::default_host();
        Self::from_device(host.default_output_device()?)
    }

    /// All output devices with a usable default config.
    pub fn list_outputs() -> Vec<Self> {
        let host = cpal::default_host();
        host.output_devices()
            .map(|devices| devices.filter_map(Self::from_device).collect())
            .unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Build and start an output stream whose callback renders `renderer`.
    ///
    /// The renderer moves into the callback; the stream stops and the
    /// renderer is dropped when the returned stream is dropped.
    pub fn start(&self, renderer: Renderer) -> Result<cpal::Stream> {
        let stream = build_stream(&self.device, self.config.sample_format(), &self.config.config(), renderer)
            .map_err(|e| GraphError::Backend(e.to_string()))?;
        stream.play().map_err(|e| GraphError::Backend(e.to_string()))?;
        tracing::debug!(device = %self.name, sample_rate = self.sample_rate, channels = self.channels, "output stream started");
        Ok(stream)
    }
}

fn build_stream(
    device: &cpal::Device,
    sample_format: SampleFormat,
    stream_config: &cpal::StreamConfig,
    mut renderer: Renderer,
) -> core::result::Result<cpal::Stream, cpal::BuildStreamError> {
    let channels = stream_config.channels as usize;
    let on_error = |err: cpal::StreamError| tracing::warn!("output stream error: {}", err);
    // integer formats render into this first; grown on the first callback only
    let mut scratch: Vec<f32> = Vec::new();

    match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            stream_config,
            move |data: &mut [f32], _| renderer.render_interleaved(data, channels),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            stream_config,
            move |data: &mut [i16], _| {
                scratch.resize(data.len(), 0.0);
                renderer.render_interleaved(&mut scratch, channels);
                for (out, s) in data.iter_mut().zip(&scratch) {
                    *out = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                }
            },
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_output_stream(
            stream_config,
            move |data: &mut [u16], _| {
                scratch.resize(data.len(), 0.0);
                renderer.render_interleaved(&mut scratch, channels);
                for (out, s) in data.iter_mut().zip(&scratch) {
                    *out = ((s.clamp(-1.0, 1.0) + 1.0) * 0.5 * u16::MAX as f32) as u16;
                }
            },
            on_error,
            None,
        ),
        _ => Err(cpal::BuildStreamError::StreamConfigNotSupported),
    }
}
