//! polymix - an in-process polyphonic software mixer.
//!
//! Registered sources (in-memory WAVE PCM, streamed Ogg Vorbis, KSS
//! chip-tune cartridges) are played on a fixed table of voices, resampled
//! and converted to one canonical output format (16/24-bit, mono/stereo,
//! 8-96 kHz), summed with a master gain, and delivered through a bounded
//! packet ring to a realtime sink callback that never blocks.
//!
//! ```no_run
//! use polymix::Mixer;
//!
//! let mut mixer = Mixer::new();
//! mixer.set_format(44_100, true, 16, 10).unwrap();
//! let bgm = mixer.add_source("music.ogg");
//! let blip = mixer.add_source("blip.wav");
//! if mixer.start() {
//!     mixer.play_source(bgm, true, false);
//!     mixer.play_source(blip, false, false);
//! }
//! mixer.stop();
//! ```
//!
//! KSS playback needs a chip emulator registered through
//! [`Mixer::set_chip_emulator`]; the [`chip`] module defines the traits an
//! emulator implementation provides.

mod engine;

pub use engine::chip;
pub use engine::constants;
pub use engine::errors;
pub use engine::ring::PacketReader;
pub use engine::sink::{self, AudioBackend, AudioStream, CpalBackend, SinkStatus};
pub use engine::{MixFormat, Mixer, MixerStatus};
