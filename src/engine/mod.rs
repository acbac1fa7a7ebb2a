//! The mixing engine.
//!
//! [`Mixer`] is the control surface: it owns the source table, the channel
//! table, the KSS cartridges, the ring and the sink stream, and spawns the
//! producer thread that mixes one packet per tick. Control operations talk
//! to the producer through atomic flags; operations that restructure shared
//! state (dropping sources, retuning cartridges) pause the producer for the
//! duration via the ring gate.
//!
//! Play operations return 32-bit handles (see [`handle`]); handle 0 is the
//! wildcard addressing everything, and unknown handles are ignored.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub mod chip;
pub mod constants;
pub mod errors;
pub mod ring;
pub mod sink;

pub(crate) mod channels;
pub(crate) mod decoders;
pub(crate) mod handle;
pub(crate) mod kss;
pub(crate) mod pcm;
pub(crate) mod vorbis;
pub(crate) mod wave;

use chip::ChipEmulator;
use channels::{Channel, ChannelTable, Voice};
use constants::{
    DEFAULT_LATENCY_MS, DEFAULT_MASTER_VOLUME, DEFAULT_PACKET_COUNT, MAX_SOURCE_ID, RATE_MAX,
    RATE_MIN,
};
use errors::{FormatError, SourceLoadError};
use kss::KssCartridge;
use pcm::{PcmSource, PcmVoice};
use ring::RingGate;
use sink::{AudioBackend, AudioStream, CpalBackend, SinkStatus};
use vorbis::VorbisSource;

/// The canonical output format every voice is converted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MixFormat {
    /// Output sample rate in Hz (8000..=96000).
    pub rate: u32,
    /// 1 (mono) or 2 (stereo).
    pub channels: u8,
    /// 16 or 24.
    pub bits: u8,
    /// Number of channel-table slots.
    pub voice_capacity: usize,
}

impl MixFormat {
    /// Bytes of one output frame across all channels.
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * (self.bits as usize / 8)
    }
}

/// Mixer state derived from the sink stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MixerStatus {
    /// No stream is open.
    Stopped,
    /// Stream open but not playing.
    Paused,
    /// Stream playing.
    Running,
    /// The sink reported an error; `start_stop_mixer(false)` clears it.
    Error,
}

/// One registered PCM or Vorbis source.
enum SourceEntry {
    Pcm(Arc<PcmSource>),
    Vorbis(Arc<VorbisSource>),
}

impl SourceEntry {
    fn create_voice(&self) -> Result<Voice, SourceLoadError> {
        match self {
            SourceEntry::Pcm(source) => Ok(Voice::Pcm(PcmVoice::new(source.clone()))),
            SourceEntry::Vorbis(source) => Ok(Voice::Vorbis(source.create_voice()?)),
        }
    }
}

/// The polyphonic mixer.
///
/// Typical use: [`set_format`](Mixer::set_format), add sources, start the
/// mixer, then play/stop/pause through handles. All methods are cheap
/// except those documented to pause the producer.
pub struct Mixer {
    format: MixFormat,
    configured: bool,
    packet_count: usize,
    packet_frames: usize,
    explicit_buffer_params: bool,

    channels: Arc<ChannelTable>,
    sources: Vec<Option<SourceEntry>>,
    cartridges: Arc<Mutex<Vec<Option<KssCartridge>>>>,
    master_volume: Arc<AtomicU8>,

    gate: Arc<RingGate>,
    backend: Box<dyn AudioBackend>,
    stream: Option<Box<dyn AudioStream>>,
    producer: Option<JoinHandle<()>>,
    chip: Option<Arc<dyn ChipEmulator>>,
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}

impl Mixer {
    /// A mixer playing through the default cpal output device.
    pub fn new() -> Self {
        Self::with_backend(Box::new(CpalBackend))
    }

    /// A mixer playing through a custom backend.
    pub fn with_backend(backend: Box<dyn AudioBackend>) -> Self {
        Self {
            format: MixFormat {
                rate: 44_100,
                channels: 2,
                bits: 16,
                voice_capacity: 0,
            },
            configured: false,
            packet_count: DEFAULT_PACKET_COUNT,
            packet_frames: 0,
            explicit_buffer_params: false,
            channels: Arc::new(ChannelTable::new(0)),
            sources: Vec::new(),
            cartridges: Arc::new(Mutex::new(Vec::new())),
            master_volume: Arc::new(AtomicU8::new(DEFAULT_MASTER_VOLUME)),
            gate: Arc::new(RingGate::new()),
            backend,
            stream: None,
            producer: None,
            chip: None,
        }
    }

    /// Registers the chip emulator used by [`add_source_kss`](Mixer::add_source_kss).
    pub fn set_chip_emulator(&mut self, emulator: Arc<dyn ChipEmulator>) {
        self.chip = Some(emulator);
    }

    /* ---------------- configuration ---------------- */

    /// Sets the output format and rebuilds the channel table. Existing
    /// sources and cartridges are retargeted. Only valid while the sink is
    /// closed.
    pub fn set_format(
        &mut self,
        rate: u32,
        stereo: bool,
        bits: u8,
        voice_capacity: usize,
    ) -> Result<(), FormatError> {
        if self.stream.is_some() {
            return Err(FormatError::SinkOpen);
        }
        if !(RATE_MIN..=RATE_MAX).contains(&rate) {
            return Err(FormatError::Rate(rate));
        }
        if bits != 16 && bits != 24 {
            return Err(FormatError::Bits(bits));
        }
        if voice_capacity == 0 {
            return Err(FormatError::VoiceCapacity);
        }

        self.format = MixFormat {
            rate,
            channels: if stereo { 2 } else { 1 },
            bits,
            voice_capacity,
        };
        self.channels = Arc::new(ChannelTable::new(voice_capacity));

        let format = self.format;
        for entry in self.sources.iter_mut().flatten() {
            match entry {
                SourceEntry::Pcm(source) => *source = Arc::new(source.retargeted(&format)),
                SourceEntry::Vorbis(source) => *source = Arc::new(source.retargeted(&format)),
            }
        }
        for cartridge in self.cartridges.lock().unwrap().iter_mut().flatten() {
            cartridge.set_output_format(format.rate, format.channels, format.bits);
        }

        if !self.explicit_buffer_params {
            self.packet_frames =
                (DEFAULT_LATENCY_MS * rate / (DEFAULT_PACKET_COUNT as u32 * 1000)) as usize;
            self.packet_count = DEFAULT_PACKET_COUNT;
        }
        self.configured = true;
        log::debug!(
            "format set: {rate} Hz, {} ch, {bits}-bit, {voice_capacity} voices",
            self.format.channels
        );
        Ok(())
    }

    /// Overrides the ring geometry. Latency is roughly
    /// `packet_count x packet_frames / rate`. Only valid while the sink is
    /// closed.
    pub fn set_mixer_buffer_parameters(
        &mut self,
        packet_count: usize,
        packet_frames: usize,
    ) -> Result<(), FormatError> {
        if self.stream.is_some() {
            return Err(FormatError::SinkOpen);
        }
        if packet_count < 2 {
            return Err(FormatError::PacketCount);
        }
        if packet_frames == 0 {
            return Err(FormatError::PacketFrames);
        }
        self.packet_count = packet_count;
        self.packet_frames = packet_frames;
        self.explicit_buffer_params = true;
        Ok(())
    }

    /* ---------------- transport ---------------- */

    /// Opens the sink and spawns the producer (`start = true`) or tears
    /// both down (`start = false`). Idempotent in both directions.
    pub fn start_stop_mixer(&mut self, start: bool) -> bool {
        if start {
            if self.stream.is_some() {
                return true;
            }
            if !self.configured || self.packet_frames == 0 {
                log::warn!("cannot start: no format configured");
                return false;
            }

            let packet_bytes = self.packet_frames * self.format.frame_bytes();
            let (mut writer, reader) =
                ring::packet_ring(self.packet_count, packet_bytes, self.gate.clone());

            let stream = match self.backend.open(
                self.format.rate,
                self.format.channels,
                self.format.bits,
                reader,
            ) {
                Ok(stream) => stream,
                Err(err) => {
                    log::error!("failed to open sink: {err}");
                    return false;
                }
            };

            self.gate.turn_on();
            let mut worker = self.worker();
            let spawned = thread::Builder::new()
                .name("polymix-producer".into())
                .spawn(move || {
                    while writer.produce(&mut |packet: &mut [u8]| worker.mix_packet(packet)) {}
                });
            match spawned {
                Ok(handle) => self.producer = Some(handle),
                Err(err) => {
                    log::error!("failed to spawn producer: {err}");
                    self.gate.shut_down();
                    return false;
                }
            }

            self.stream = Some(stream);
            self.pause_resume_mixer(false)
        } else {
            if let Some(mut stream) = self.stream.take() {
                stream.stop();
            }
            self.gate.shut_down();
            if let Some(producer) = self.producer.take() {
                let _ = producer.join();
            }
            true
        }
    }

    /// Starts the mixer. Shorthand for `start_stop_mixer(true)`.
    pub fn start(&mut self) -> bool {
        self.start_stop_mixer(true)
    }

    /// Stops the mixer. Shorthand for `start_stop_mixer(false)`.
    pub fn stop(&mut self) -> bool {
        self.start_stop_mixer(false)
    }

    /// Pauses or resumes the sink without closing it. With no open sink
    /// this reports the requested state back.
    pub fn pause_resume_mixer(&mut self, pause: bool) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return pause;
        };
        match stream.status() {
            SinkStatus::Error => false,
            SinkStatus::Active if pause => stream.stop(),
            SinkStatus::Inactive if !pause => stream.start(),
            _ => true,
        }
    }

    /// Shorthand for `pause_resume_mixer(true)`.
    pub fn pause(&mut self) -> bool {
        self.pause_resume_mixer(true)
    }

    /// Shorthand for `pause_resume_mixer(false)`.
    pub fn resume(&mut self) -> bool {
        self.pause_resume_mixer(false)
    }

    /// Current mixer status derived from the sink stream.
    pub fn get_mixer_status(&self) -> MixerStatus {
        match &self.stream {
            None => MixerStatus::Stopped,
            Some(stream) => match stream.status() {
                SinkStatus::Error => MixerStatus::Error,
                SinkStatus::Active => MixerStatus::Running,
                SinkStatus::Inactive => MixerStatus::Paused,
            },
        }
    }

    /* ---------------- sources ---------------- */

    /// Registers a WAVE or Ogg Vorbis file. Returns a non-zero source
    /// handle, or 0 when the file cannot be used.
    pub fn add_source(&mut self, path: impl AsRef<Path>) -> i32 {
        let path = path.as_ref();
        let entry = if wave::sniff(path) {
            match wave::load(path)
                .map_err(SourceLoadError::from)
                .and_then(|wave| PcmSource::new(wave, &self.format))
            {
                Ok(source) => SourceEntry::Pcm(Arc::new(source)),
                Err(err) => {
                    log::warn!("failed to load {}: {err}", path.display());
                    return 0;
                }
            }
        } else {
            match VorbisSource::probe(path) {
                Ok(()) => {
                    SourceEntry::Vorbis(Arc::new(VorbisSource::new(path.to_path_buf(), &self.format)))
                }
                Err(err) => {
                    log::warn!("failed to load {}: {err}", path.display());
                    return 0;
                }
            }
        };
        self.insert_source(entry)
    }

    fn insert_source(&mut self, entry: SourceEntry) -> i32 {
        for (index, slot) in self.sources.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return (index + 1) as i32;
            }
        }
        if self.sources.len() >= MAX_SOURCE_ID {
            log::warn!("source table full");
            return 0;
        }
        self.sources.push(Some(entry));
        self.sources.len() as i32
    }

    /// Registers a KSS cartridge with `lines` concurrently playable lines.
    /// Requires a chip emulator (see [`set_chip_emulator`](Mixer::set_chip_emulator)).
    /// Returns a KSS source handle, or -1 on failure. Pauses the producer
    /// across the insertion.
    pub fn add_source_kss(
        &mut self,
        path: impl AsRef<Path>,
        lines: usize,
        silent_limit_ms: u32,
    ) -> i32 {
        let path = path.as_ref();
        if lines == 0 {
            return -1;
        }
        let Some(emulator) = self.chip.clone() else {
            log::warn!("no chip emulator registered, cannot load {}", path.display());
            return -1;
        };
        let rom = match emulator.load(path) {
            Ok(rom) => rom,
            Err(err) => {
                log::warn!("failed to load {}: {err}", path.display());
                return -1;
            }
        };
        let cartridge = KssCartridge::new(
            emulator,
            rom,
            lines,
            self.format.rate,
            self.format.channels,
            self.format.bits,
            silent_limit_ms,
        );

        let _pause = self.gate.pause_scope();
        let mut cartridges = self.cartridges.lock().unwrap();
        let mut cartridge = Some(cartridge);
        let mut id = 0;
        for (index, slot) in cartridges.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = cartridge.take();
                id = index + 1;
                break;
            }
        }
        if id == 0 {
            if cartridges.len() >= MAX_SOURCE_ID {
                log::warn!("cartridge table full");
                return -1;
            }
            cartridges.push(cartridge.take());
            id = cartridges.len();
        }
        handle::kss_source_id(id as i32)
    }

    /// Drops a source (or everything, with handle 0), first detaching every
    /// channel that references it. Pauses the producer for the duration.
    pub fn drop_source(&mut self, source_handle: i32) -> bool {
        let source_type = handle::source_type(source_handle);
        let source_id = handle::source_id(source_handle);
        let untyped = handle::untyped_source_id(source_handle) as usize;
        let mut dropped = false;

        let _pause = self.gate.pause_scope();
        if source_handle == 0 {
            for channel in self.channels.slots() {
                channel.detach();
            }
            for slot in &mut self.sources {
                *slot = None;
            }
            for slot in self.cartridges.lock().unwrap().iter_mut() {
                *slot = None;
            }
            dropped = true;
        } else if source_id > 0 {
            if source_type == 0 {
                for channel in self.channels.slots() {
                    if channel.source_id() == source_id {
                        channel.detach();
                    }
                }
                if untyped >= 1 && untyped <= self.sources.len() {
                    self.sources[untyped - 1] = None;
                    dropped = true;
                }
            }
            if source_type == handle::SOURCE_TYPE_KSS {
                let mut cartridges = self.cartridges.lock().unwrap();
                if untyped >= 1 && untyped <= cartridges.len() {
                    cartridges[untyped - 1] = None;
                    dropped = true;
                }
            }
        }
        dropped
    }

    /* ---------------- playback ---------------- */

    /// Starts a source on the first free channel. If the slot last played
    /// the same source its voice is reused and rewound. Returns a play
    /// handle, or 0 when no channel is free.
    pub fn play_source(&mut self, source_handle: i32, looping: bool, paused: bool) -> i32 {
        let source_id = handle::source_id(source_handle);
        if source_id <= 0 {
            return 0;
        }
        let Some(Some(entry)) = self.sources.get(source_id as usize - 1) else {
            return 0;
        };

        for (index, channel) in self.channels.slots().iter().enumerate() {
            if channel.is_active() {
                continue;
            }
            {
                let mut voice = channel.voice.lock().unwrap();
                let reusable = channel.source_id() == source_id && voice.is_some();
                if reusable {
                    if let Some(voice) = voice.as_mut() {
                        voice.seek_start();
                    }
                } else {
                    match entry.create_voice() {
                        Ok(fresh) => *voice = Some(fresh),
                        Err(err) => {
                            log::warn!("failed to open voice: {err}");
                            return 0;
                        }
                    }
                    channel.set_source_id(source_id);
                }
            }
            channel.set_stopped(false);
            channel.set_looping(looping);
            channel.set_paused(paused);
            channel.set_active(true);
            return handle::compose(source_id, (index + 1) as i32);
        }
        0
    }

    /// Plays a track on a free line of a cartridge. With `force` and no
    /// free line, the oldest forcable line is preempted (this pauses the
    /// producer). Returns a play handle or 0.
    pub fn play_kss_track(
        &mut self,
        kss_handle: i32,
        track: u8,
        autostop: bool,
        forcable: bool,
        force: bool,
    ) -> i32 {
        if handle::source_type(kss_handle) != handle::SOURCE_TYPE_KSS {
            return 0;
        }
        let untyped = handle::untyped_source_id(kss_handle);
        if untyped <= 0 {
            return 0;
        }
        let index = untyped as usize - 1;

        let line = {
            let mut cartridges = self.cartridges.lock().unwrap();
            let Some(Some(cartridge)) = cartridges.get_mut(index) else {
                return 0;
            };
            cartridge.activate_line(track, autostop, forcable)
        };
        if line != 0 {
            return handle::compose(handle::source_id(kss_handle), line as i32);
        }
        if !force {
            return 0;
        }

        // No free line: preempt under a producer pause.
        let _pause = self.gate.pause_scope();
        let mut cartridges = self.cartridges.lock().unwrap();
        let Some(Some(cartridge)) = cartridges.get_mut(index) else {
            return 0;
        };
        let line = cartridge.force_line(track, autostop, forcable);
        if line != 0 {
            handle::compose(handle::source_id(kss_handle), line as i32)
        } else {
            0
        }
    }

    /// Switches a playing line to a new track, fading the old one out over
    /// `fade_out_ms` if non-zero. Pauses the producer.
    pub fn update_kss_track(
        &mut self,
        kss_handle: i32,
        new_track: u8,
        autostop: bool,
        forcable: bool,
        fade_out_ms: u32,
    ) -> bool {
        self.kss_cartridge_action(kss_handle, true, true, false, |cartridge, line| {
            cartridge.update_line(line, new_track, autostop, forcable, fade_out_ms)
        })
    }

    /// Stops playback addressed by `play_handle`: 0 stops everything, a
    /// source handle stops every voice/line of that source, a play handle
    /// stops one voice or line.
    pub fn stop_playback(&mut self, play_handle: i32) {
        let sink_open = self.stream.is_some();
        if play_handle == 0 {
            for channel in self.channels.slots() {
                if channel.is_active() {
                    channel.set_stopped(true);
                    channel.set_paused(false);
                    if !sink_open {
                        channel.set_looping(false);
                        channel.set_active(false);
                    }
                }
            }
            for cartridge in self.cartridges.lock().unwrap().iter_mut().flatten() {
                cartridge.stop_active();
            }
        } else if handle::source_type(play_handle) == handle::SOURCE_TYPE_KSS {
            let is_line = handle::channel_id(play_handle) != 0;
            self.kss_cartridge_action(play_handle, false, is_line, (), |cartridge, line| {
                if is_line {
                    cartridge.stop(line);
                } else {
                    cartridge.stop_active();
                }
            });
        } else {
            let source_id = handle::source_id(play_handle);
            let channel_id = handle::channel_id(play_handle) as usize;
            if source_id <= 0 {
                return;
            }
            let stop = |channel: &Channel| {
                if channel.is_active() && channel.source_id() == source_id {
                    channel.set_stopped(true);
                    if !sink_open {
                        channel.set_looping(false);
                        channel.set_active(false);
                    }
                }
            };
            if channel_id > 0 {
                if let Some(channel) = self.channels.get(channel_id - 1) {
                    stop(channel);
                }
            } else {
                for channel in self.channels.slots() {
                    stop(channel);
                }
            }
        }
    }

    /// Pauses or resumes playback with the same addressing as
    /// [`stop_playback`](Mixer::stop_playback).
    pub fn pause_resume_playback(&mut self, play_handle: i32, pause: bool) {
        if play_handle == 0 {
            for channel in self.channels.slots() {
                if channel.is_active() {
                    channel.set_paused(pause);
                }
            }
            for cartridge in self.cartridges.lock().unwrap().iter_mut().flatten() {
                cartridge.set_pause_active(pause);
            }
        } else if handle::source_type(play_handle) == handle::SOURCE_TYPE_KSS {
            let is_line = handle::channel_id(play_handle) != 0;
            self.kss_cartridge_action(play_handle, false, is_line, (), |cartridge, line| {
                if is_line {
                    cartridge.set_pause(line, pause);
                } else {
                    cartridge.set_pause_active(pause);
                }
            });
        } else {
            let source_id = handle::source_id(play_handle);
            let channel_id = handle::channel_id(play_handle) as usize;
            if source_id <= 0 {
                return;
            }
            if channel_id > 0 {
                if let Some(channel) = self.channels.get(channel_id - 1) {
                    if channel.is_active() && channel.source_id() == source_id {
                        channel.set_paused(pause);
                    }
                }
            } else {
                for channel in self.channels.slots() {
                    if channel.is_active() && channel.source_id() == source_id {
                        channel.set_paused(pause);
                    }
                }
            }
        }
    }

    /// Shorthand for `pause_resume_playback(handle, true)`.
    pub fn pause_playback(&mut self, play_handle: i32) {
        self.pause_resume_playback(play_handle, true);
    }

    /// Shorthand for `pause_resume_playback(handle, false)`.
    pub fn resume_playback(&mut self, play_handle: i32) {
        self.pause_resume_playback(play_handle, false);
    }

    /// Sets the loop flag of one voice.
    pub fn set_loop(&mut self, play_handle: i32, looping: bool) {
        let source_id = handle::source_id(play_handle);
        let channel_id = handle::channel_id(play_handle) as usize;
        if source_id > 0 && channel_id > 0 {
            if let Some(channel) = self.channels.get(channel_id - 1) {
                channel.set_looping(looping);
            }
        }
    }

    /// Master volume, 0..=255 with 128 = unity gain.
    pub fn set_master_volume(&mut self, volume: u8) {
        self.master_volume.store(volume, Ordering::Release);
    }

    pub fn master_volume(&self) -> u8 {
        self.master_volume.load(Ordering::Acquire)
    }

    /* ---------------- kss controls ---------------- */

    /// Sets cartridge master volume (source handle) or one line's volume
    /// (play handle), 0..=100. Pauses the producer.
    pub fn update_kss_volume(&mut self, kss_handle: i32, volume: u8) -> bool {
        let is_line = handle::channel_id(kss_handle) != 0;
        self.kss_cartridge_action(kss_handle, true, is_line, false, |cartridge, line| {
            if is_line {
                cartridge.set_line_volume(line, volume);
            } else {
                cartridge.set_master_volume(volume);
            }
            true
        })
    }

    /// Changes the vsync frequency (typically 50 or 60 Hz) of one line, one
    /// cartridge, or - with handle 0 - every cartridge. Pauses the producer.
    pub fn update_kss_frequency(&mut self, kss_handle: i32, frequency: u32) -> bool {
        if frequency == 0 {
            return false;
        }
        if kss_handle == 0 {
            let _pause = self.gate.pause_scope();
            for cartridge in self.cartridges.lock().unwrap().iter_mut().flatten() {
                cartridge.set_frequency(frequency);
            }
            return true;
        }
        let is_line = handle::channel_id(kss_handle) != 0;
        self.kss_cartridge_action(kss_handle, true, is_line, false, |cartridge, line| {
            if is_line {
                cartridge.set_line_frequency(line, frequency);
            } else {
                cartridge.set_frequency(frequency);
            }
            true
        })
    }

    /// Grows or shrinks a cartridge's line table. Pauses the producer.
    pub fn set_kss_lines_count(&mut self, kss_handle: i32, lines: usize) -> bool {
        if lines == 0 {
            return false;
        }
        self.kss_cartridge_action(kss_handle, true, false, false, |cartridge, _| {
            cartridge.set_lines_count(lines);
            true
        })
    }

    /// Number of currently active lines of a cartridge.
    pub fn get_kss_active_lines_count(&self, kss_handle: i32) -> usize {
        self.kss_cartridge_query(kss_handle, false, 0, |cartridge, _| cartridge.active_lines())
    }

    /// Playback time in milliseconds of one line since its activation.
    pub fn get_kss_playtime_millis(&self, kss_handle: i32) -> u64 {
        self.kss_cartridge_query(kss_handle, true, 0, |cartridge, line| {
            cartridge.playtime_millis(line)
        })
    }

    /* ---------------- internals ---------------- */

    fn kss_cartridge_action<T>(
        &mut self,
        kss_handle: i32,
        need_sync: bool,
        need_line: bool,
        default: T,
        action: impl FnOnce(&mut KssCartridge, usize) -> T,
    ) -> T {
        if handle::source_type(kss_handle) != handle::SOURCE_TYPE_KSS {
            return default;
        }
        let untyped = handle::untyped_source_id(kss_handle);
        if untyped <= 0 {
            return default;
        }
        let line_id = handle::channel_id(kss_handle) as usize;

        let _pause = if need_sync {
            Some(self.gate.pause_scope())
        } else {
            None
        };
        let mut cartridges = self.cartridges.lock().unwrap();
        match cartridges.get_mut(untyped as usize - 1) {
            Some(Some(cartridge)) => {
                if need_line && (line_id == 0 || line_id > cartridge.line_count()) {
                    default
                } else {
                    action(cartridge, line_id)
                }
            }
            _ => default,
        }
    }

    fn kss_cartridge_query<T>(
        &self,
        kss_handle: i32,
        need_line: bool,
        default: T,
        query: impl FnOnce(&KssCartridge, usize) -> T,
    ) -> T {
        if handle::source_type(kss_handle) != handle::SOURCE_TYPE_KSS {
            return default;
        }
        let untyped = handle::untyped_source_id(kss_handle);
        if untyped <= 0 {
            return default;
        }
        let line_id = handle::channel_id(kss_handle) as usize;
        let cartridges = self.cartridges.lock().unwrap();
        match cartridges.get(untyped as usize - 1) {
            Some(Some(cartridge)) => {
                if need_line && (line_id == 0 || line_id > cartridge.line_count()) {
                    default
                } else {
                    query(cartridge, line_id)
                }
            }
            _ => default,
        }
    }

    fn worker(&self) -> MixWorker {
        MixWorker::new(
            self.format,
            self.packet_frames,
            self.channels.clone(),
            self.cartridges.clone(),
            self.master_volume.clone(),
        )
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        self.start_stop_mixer(false);
    }
}

/// The producer-side mix state: one tick sums every active voice and
/// cartridge into the accumulator, applies the master volume and encodes
/// one little-endian packet.
pub(crate) struct MixWorker {
    format: MixFormat,
    packet_frames: usize,
    channels: Arc<ChannelTable>,
    cartridges: Arc<Mutex<Vec<Option<KssCartridge>>>>,
    master_volume: Arc<AtomicU8>,
    acc: Vec<i32>,
    scratch: Vec<i32>,
}

impl MixWorker {
    fn new(
        format: MixFormat,
        packet_frames: usize,
        channels: Arc<ChannelTable>,
        cartridges: Arc<Mutex<Vec<Option<KssCartridge>>>>,
        master_volume: Arc<AtomicU8>,
    ) -> Self {
        let samples = packet_frames * format.channels as usize;
        Self {
            format,
            packet_frames,
            channels,
            cartridges,
            master_volume,
            acc: vec![0; samples],
            scratch: vec![0; samples],
        }
    }

    /// Mixes exactly one packet into `out` (`packet_frames x frame_bytes`
    /// bytes).
    pub fn mix_packet(&mut self, out: &mut [u8]) {
        let frames = self.packet_frames;
        let out_channels = self.format.channels as usize;
        let acc = &mut self.acc;
        let scratch = &mut self.scratch;
        acc.fill(0);

        for channel in self.channels.slots() {
            if !channel.is_active() {
                continue;
            }
            let mut deactivate = false;
            if channel.is_stopped() {
                deactivate = true;
            } else {
                let mut voice = channel.voice.lock().unwrap();
                match voice.as_mut() {
                    None => deactivate = true,
                    Some(voice) => {
                        if !channel.is_paused() {
                            let mut produced = voice.read(scratch, frames);
                            if produced < frames && channel.is_looping() {
                                // Rewound source: keep pulling until the
                                // packet is full.
                                while produced < frames {
                                    let got = voice
                                        .read(&mut scratch[produced * out_channels..], frames - produced);
                                    if got == 0 {
                                        break;
                                    }
                                    produced += got;
                                }
                            }
                            for (out, sample) in acc.iter_mut().zip(scratch.iter()).take(produced * out_channels) {
                                *out += *sample;
                            }
                            if produced < frames {
                                deactivate = true;
                            }
                        }
                    }
                }
            }
            if deactivate {
                channel.set_stopped(true);
                channel.set_active(false);
            }
        }

        {
            let mut cartridges = self.cartridges.lock().unwrap();
            for cartridge in cartridges.iter_mut().flatten() {
                cartridge.read_into(acc, frames);
            }
        }

        // 128 is unity; 255 is roughly double.
        let volume = self.master_volume.load(Ordering::Acquire) as i64;
        for value in acc.iter_mut() {
            *value = ((*value as i64 * volume) >> 7) as i32;
        }

        if self.format.bits == 24 {
            for (bytes, value) in out.chunks_exact_mut(3).zip(acc.iter()) {
                bytes[0] = (*value & 0xFF) as u8;
                bytes[1] = ((*value >> 8) & 0xFF) as u8;
                bytes[2] = ((*value >> 16) & 0xFF) as u8;
            }
        } else {
            for (bytes, value) in out.chunks_exact_mut(2).zip(acc.iter()) {
                bytes[0] = (*value & 0xFF) as u8;
                bytes[1] = ((*value >> 8) & 0xFF) as u8;
            }
        }
    }
}
