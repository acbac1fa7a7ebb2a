//! The chip-emulator seam used by KSS cartridges.
//!
//! The mixer does not ship an MSX sound-chip emulator; it drives one through
//! these traits. An implementation typically wraps a KSS player library:
//! [`ChipEmulator::load`] parses the cartridge image, [`ChipEmulator::player`]
//! creates an emulator instance bound to a private copy of that image, and
//! [`ChipPlayer`] renders 16-bit interleaved frames on demand.
//!
//! Every line of a cartridge owns its own rom copy and player, so lines can
//! render the same cartridge independently.

use std::io;
use std::path::Path;

/// Sound devices a KSS cartridge may address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChipDevice {
    /// AY-3-8910 programmable sound generator.
    Psg,
    /// Konami SCC wavetable.
    Scc,
    /// MSX-Audio OPL.
    Opl,
    /// MSX-Music OPLL.
    Opll,
}

/// Placement of one emulated channel in the stereo field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StereoSide {
    Left,
    Right,
    Center,
}

/// A loaded cartridge image.
pub trait ChipRom: Send {
    /// Bit-identical copy for another line of the same cartridge.
    fn duplicate(&self) -> Box<dyn ChipRom>;
}

/// One emulator instance bound to a rom copy.
pub trait ChipPlayer: Send {
    /// Restarts the emulator on `track`. `cpu_speed` 0 selects the
    /// cartridge default clock.
    fn reset(&mut self, track: u8, cpu_speed: u32);

    /// Renders interleaved 16-bit frames, always filling `out` completely
    /// (`out.len()` = frames x channels).
    fn calc(&mut self, out: &mut [i16]);

    /// Advances the emulator by `frames` without producing audio.
    fn calc_silent(&mut self, frames: u64);

    /// Starts the emulator's internal fade-out ramp.
    fn fade_start(&mut self, fade_ms: u32);

    /// True once the silence detector has declared the track finished.
    fn stopped(&self) -> bool;

    /// Silence duration (ms) after which [`ChipPlayer::stopped`] trips.
    fn set_silent_limit(&mut self, ms: u32);

    /// Output gain, 0..=100.
    fn set_master_volume(&mut self, volume: u8);
    fn master_volume(&self) -> u8;

    /// Device placement on a -128 (right) ..= +128 (left) scale.
    fn set_device_pan(&mut self, device: ChipDevice, pan: i32);

    /// Per-channel placement; meaningful for the OPLL in stereo mode.
    fn set_channel_pan(&mut self, device: ChipDevice, channel: u8, side: StereoSide);

    /// Switches the OPLL into stereo rendering.
    fn set_opll_stereo(&mut self, enabled: bool);

    /// Frames rendered since the last reset.
    fn decoded_frames(&self) -> u64;

    /// Current vsync frequency in Hz; 0 means the cartridge default.
    fn vsync_freq(&self) -> u32;
    fn set_vsync_freq(&mut self, hz: u32);
}

/// Factory for roms and bound players.
pub trait ChipEmulator: Send + Sync {
    /// Parses a cartridge file.
    fn load(&self, path: &Path) -> io::Result<Box<dyn ChipRom>>;

    /// Creates a player bound to (a copy of) `rom`, rendering 16-bit frames
    /// at `rate` Hz with `channels` interleaved channels.
    fn player(&self, rom: &dyn ChipRom, rate: u32, channels: u8) -> Box<dyn ChipPlayer>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted chip used by cartridge and mixer tests. Each track renders
    //! a constant sample equal to `track`, so packets can be attributed to
    //! tracks; a settable silence countdown drives autostop tests. The
    //! emulator keeps a handle to every player state it hands out so tests
    //! can inspect players owned by a cartridge.

    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct FakeEmulator {
        pub loads: AtomicU64,
        pub players: Mutex<Vec<Arc<Mutex<PlayerState>>>>,
    }

    pub struct FakeRom {
        pub generation: u64,
    }

    impl ChipRom for FakeRom {
        fn duplicate(&self) -> Box<dyn ChipRom> {
            Box::new(FakeRom {
                generation: self.generation + 1,
            })
        }
    }

    pub struct PlayerState {
        pub rate: u32,
        pub channels: u8,
        pub track: u8,
        pub resets: Vec<u8>,
        pub decoded: u64,
        pub vsync: u32,
        pub volume: u8,
        pub silent_limit: u32,
        pub fade_started: Option<u32>,
        pub opll_stereo: bool,
        pub device_pans: Vec<(ChipDevice, i32)>,
        pub channel_pans: Vec<(ChipDevice, u8, StereoSide)>,
        pub silent_calls: Vec<u64>,
        /// Frames until the silence detector trips; `u64::MAX` = never.
        pub frames_until_stop: u64,
    }

    impl PlayerState {
        fn new(rate: u32, channels: u8) -> Self {
            Self {
                rate,
                channels,
                track: 0,
                resets: Vec::new(),
                decoded: 0,
                vsync: 0,
                volume: 0,
                silent_limit: 0,
                fade_started: None,
                opll_stereo: false,
                device_pans: Vec::new(),
                channel_pans: Vec::new(),
                silent_calls: Vec::new(),
                frames_until_stop: u64::MAX,
            }
        }
    }

    pub struct FakePlayer {
        pub state: Arc<Mutex<PlayerState>>,
    }

    impl ChipPlayer for FakePlayer {
        fn reset(&mut self, track: u8, _cpu_speed: u32) {
            let mut state = self.state.lock().unwrap();
            state.track = track;
            state.resets.push(track);
            state.decoded = 0;
        }

        fn calc(&mut self, out: &mut [i16]) {
            let mut state = self.state.lock().unwrap();
            out.fill(state.track as i16);
            let frames = (out.len() / state.channels as usize) as u64;
            state.decoded += frames;
            state.frames_until_stop = state.frames_until_stop.saturating_sub(frames);
        }

        fn calc_silent(&mut self, frames: u64) {
            let mut state = self.state.lock().unwrap();
            state.silent_calls.push(frames);
            state.decoded += frames;
        }

        fn fade_start(&mut self, fade_ms: u32) {
            self.state.lock().unwrap().fade_started = Some(fade_ms);
        }

        fn stopped(&self) -> bool {
            self.state.lock().unwrap().frames_until_stop == 0
        }

        fn set_silent_limit(&mut self, ms: u32) {
            self.state.lock().unwrap().silent_limit = ms;
        }

        fn set_master_volume(&mut self, volume: u8) {
            self.state.lock().unwrap().volume = volume;
        }

        fn master_volume(&self) -> u8 {
            self.state.lock().unwrap().volume
        }

        fn set_device_pan(&mut self, device: ChipDevice, pan: i32) {
            self.state.lock().unwrap().device_pans.push((device, pan));
        }

        fn set_channel_pan(&mut self, device: ChipDevice, channel: u8, side: StereoSide) {
            self.state
                .lock()
                .unwrap()
                .channel_pans
                .push((device, channel, side));
        }

        fn set_opll_stereo(&mut self, enabled: bool) {
            self.state.lock().unwrap().opll_stereo = enabled;
        }

        fn decoded_frames(&self) -> u64 {
            self.state.lock().unwrap().decoded
        }

        fn vsync_freq(&self) -> u32 {
            self.state.lock().unwrap().vsync
        }

        fn set_vsync_freq(&mut self, hz: u32) {
            self.state.lock().unwrap().vsync = hz;
        }
    }

    impl ChipEmulator for FakeEmulator {
        fn load(&self, _path: &Path) -> io::Result<Box<dyn ChipRom>> {
            self.loads.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(FakeRom { generation: 0 }))
        }

        fn player(&self, _rom: &dyn ChipRom, rate: u32, channels: u8) -> Box<dyn ChipPlayer> {
            let state = Arc::new(Mutex::new(PlayerState::new(rate, channels)));
            self.players.lock().unwrap().push(state.clone());
            Box::new(FakePlayer { state })
        }
    }
}
