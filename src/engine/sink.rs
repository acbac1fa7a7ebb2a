//! The audio backend seam and its cpal implementation.
//!
//! The engine opens a stream through [`AudioBackend`], hands it the ring
//! consumer, and controls it through [`AudioStream`]. The stream callback
//! only copies ring bytes and converts them to the device sample type; it
//! never locks, allocates after warm-up, or calls back into the mixer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use env_logger::{Builder, Env};

use crate::engine::errors::SinkError;
use crate::engine::ring::PacketReader;

/// Observable state of an open stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkStatus {
    /// Open but not currently playing.
    Inactive,
    /// Playing.
    Active,
    /// The backend reported an unrecoverable stream error.
    Error,
}

/// An open output stream.
pub trait AudioStream {
    /// Starts playback. Returns false if the backend refused.
    fn start(&mut self) -> bool;

    /// Stops playback without closing the stream.
    fn stop(&mut self) -> bool;

    fn status(&self) -> SinkStatus;
}

/// Factory opening output streams; closing happens by dropping the stream.
pub trait AudioBackend {
    /// Opens a stream reading `consumer`. `bits` is the ring sample depth
    /// (16 or 24); backends may convert to whatever the device wants.
    fn open(
        &self,
        rate: u32,
        channels: u8,
        bits: u8,
        consumer: PacketReader,
    ) -> Result<Box<dyn AudioStream>, SinkError>;
}

/// Configures the logger for audio diagnostics. `RUST_LOG` overrides the
/// default `info` filter.
pub fn setup_logger() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .try_init()
        .unwrap_or(());
}

/// Default backend over the host's default cpal output device.
///
/// Devices are driven with `f32` samples; the callback converts the ring's
/// 16- or 24-bit little-endian bytes on the fly.
#[derive(Default)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open(
        &self,
        rate: u32,
        channels: u8,
        bits: u8,
        mut consumer: PacketReader,
    ) -> Result<Box<dyn AudioStream>, SinkError> {
        setup_logger();

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(SinkError::NoDevice)?;
        log::info!(
            "opening output stream ({channels} ch @ {rate} Hz, {bits}-bit ring)"
        );

        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: SampleRate(rate),
            buffer_size: BufferSize::Default,
        };

        let failed = Arc::new(AtomicBool::new(false));
        let failed_cb = failed.clone();
        let err_fn = move |err| {
            log::error!("output stream error: {err}");
            failed_cb.store(true, Ordering::Release);
        };

        let bytes_per_sample = (bits / 8) as usize;
        let scale = if bits == 24 {
            1.0 / 8_388_608.0
        } else {
            1.0 / 32_768.0
        };
        let mut bytes: Vec<u8> = Vec::new();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let need = data.len() * bytes_per_sample;
                    if bytes.len() < need {
                        bytes.resize(need, 0);
                    }
                    consumer.read(&mut bytes[..need]);
                    for (out, raw) in data.iter_mut().zip(bytes.chunks_exact(bytes_per_sample)) {
                        let value = if bytes_per_sample == 3 {
                            (raw[0] as i32 | (raw[1] as i32) << 8 | (raw[2] as i8 as i32) << 16)
                                as f32
                        } else {
                            i16::from_le_bytes([raw[0], raw[1]]) as f32
                        };
                        *out = value * scale;
                    }
                },
                err_fn,
                None,
            )
            .map_err(|err| SinkError::OpenStream(err.to_string()))?;

        Ok(Box::new(CpalStream {
            stream,
            playing: false,
            failed,
        }))
    }
}

struct CpalStream {
    stream: cpal::Stream,
    playing: bool,
    failed: Arc<AtomicBool>,
}

impl AudioStream for CpalStream {
    fn start(&mut self) -> bool {
        match self.stream.play() {
            Ok(()) => {
                self.playing = true;
                true
            }
            Err(err) => {
                log::error!("failed to start output stream: {err}");
                self.failed.store(true, Ordering::Release);
                false
            }
        }
    }

    fn stop(&mut self) -> bool {
        match self.stream.pause() {
            Ok(()) => {
                self.playing = false;
                true
            }
            Err(err) => {
                log::error!("failed to stop output stream: {err}");
                false
            }
        }
    }

    fn status(&self) -> SinkStatus {
        if self.failed.load(Ordering::Acquire) {
            SinkStatus::Error
        } else if self.playing {
            SinkStatus::Active
        } else {
            SinkStatus::Inactive
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_setup_is_idempotent() {
        setup_logger();
        setup_logger();
    }
}
