//! Mixer configuration constants and limits.

/// Lowest supported output sample rate in Hz.
pub const RATE_MIN: u32 = 8_000;

/// Highest supported output sample rate in Hz.
pub const RATE_MAX: u32 = 96_000;

/// Default number of packets in the ring buffer.
pub const DEFAULT_PACKET_COUNT: usize = 5;

/// Target end-to-end latency in milliseconds used to size packets when the
/// caller does not pick explicit buffer parameters.
pub const DEFAULT_LATENCY_MS: u32 = 100;

/// Master volume value that corresponds to unity gain (`(v * 128) >> 7`).
pub const MASTER_VOLUME_UNITY: u8 = 128;

/// Default master volume applied to a fresh mixer.
pub const DEFAULT_MASTER_VOLUME: u8 = MASTER_VOLUME_UNITY;

/// Upper bound of the KSS cartridge volume scale (0..=100).
pub const KSS_VOLUME_MAX: u8 = 100;

/// Default master volume of a fresh KSS cartridge.
pub const DEFAULT_KSS_VOLUME: u8 = 60;

/// Highest source id that fits in the 12-bit id field of a handle.
pub const MAX_SOURCE_ID: usize = 0xFFF;

/// Highest channel or line number that fits in the 12-bit field of a handle.
pub const MAX_CHANNEL_ID: usize = 0xFFF;

/// Number of fractional bits in the fixed-point resampler cursor.
pub const FP_SHIFT: u32 = 16;

/// Mask extracting the fractional part of the fixed-point cursor.
pub const FP_MASK: u64 = (1 << FP_SHIFT) - 1;

/// Size in bytes of the per-voice Vorbis decode scratch.
pub const VORBIS_SCRATCH_BYTES: usize = 4096;
