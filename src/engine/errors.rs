//! Mixer-specific error types.

use thiserror::Error;

/// Errors raised by format and buffer configuration calls.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The mixer format can only change while the sink is closed.
    #[error("format can only be changed while the mixer is stopped")]
    SinkOpen,

    /// Requested sample rate is outside the supported range.
    #[error("sample rate {0} Hz outside supported range 8000..=96000")]
    Rate(u32),

    /// Requested bit depth is not 16 or 24.
    #[error("bit depth {0} unsupported (expected 16 or 24)")]
    Bits(u8),

    /// The channel table needs at least one voice.
    #[error("voice capacity must be at least 1")]
    VoiceCapacity,

    /// The ring needs at least two packets to decouple the threads.
    #[error("packet count must be at least 2")]
    PacketCount,

    /// Packets must hold at least one frame.
    #[error("packet frames must be at least 1")]
    PacketFrames,
}

/// Errors raised while parsing a WAVE file.
#[derive(Debug, Error)]
pub enum WaveError {
    /// Failed to read the file.
    #[error("failed to read wave file: {0}")]
    Io(#[from] std::io::Error),

    /// The file does not carry the RIFF/WAVE magic.
    #[error("not a RIFF/WAVE file")]
    NotWave,

    /// A required chunk never appeared.
    #[error("missing {0} chunk")]
    MissingChunk(&'static str),

    /// A chunk was present but too short to parse.
    #[error("malformed {0} chunk")]
    MalformedChunk(&'static str),
}

/// Errors raised while turning a file into a playable source.
#[derive(Debug, Error)]
pub enum SourceLoadError {
    /// The WAVE container could not be parsed.
    #[error(transparent)]
    Wave(#[from] WaveError),

    /// Failed to open the file.
    #[error("failed to open file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to probe or decode the stream.
    #[error("failed to decode stream: {0}")]
    Decode(#[from] symphonia::core::errors::Error),

    /// The container has no default audio track.
    #[error("stream has no default track")]
    NoDefaultTrack,

    /// The default track is not Vorbis audio.
    #[error("stream is not Vorbis audio")]
    NotVorbis,

    /// The stream is missing sample-rate information.
    #[error("stream is missing a sample rate")]
    MissingSampleRate,

    /// The stream is missing channel information.
    #[error("stream is missing channel information")]
    MissingChannels,

    /// The WAVE format tag / bit-depth combination has no decoder.
    #[error("unsupported wave format (tag {tag:#06x}, {bits} bits per sample)")]
    UnsupportedWaveFormat {
        /// Resolved format tag (after EXTENSIBLE indirection).
        tag: u16,
        /// Bits per sample as declared by the file.
        bits: u16,
    },

    /// The file has a channel layout the mixer cannot map.
    #[error("unsupported channel count {0}")]
    UnsupportedChannels(u16),
}

/// Errors raised by the audio backend while opening a stream.
#[derive(Debug, Error)]
pub enum SinkError {
    /// No output device is available on this host.
    #[error("no output device available")]
    NoDevice,

    /// The backend refused to open a stream.
    #[error("failed to open output stream: {0}")]
    OpenStream(String),
}
