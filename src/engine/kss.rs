//! KSS cartridges: multi-line chip-tune sources.
//!
//! A cartridge exposes `L` lines, each owning a private copy of the
//! cartridge image and an independent emulator instance, so lines render
//! concurrently without colliding. Lines move through a small lifecycle:
//! idle, pending-track (reset happens on the next mix tick), playing,
//! fading (per-tick countdown), paused. Deactivation happens on explicit
//! stop, on autostop when the emulator's silence detector trips, or at the
//! end of a fade with no pending track.
//!
//! All mutating cartridge methods expect the caller to hold the mixer's
//! cartridge lock or to have paused the producer; activating an idle line
//! is the one operation that is safe concurrently with production, which is
//! why `active` is always written last.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crate::engine::chip::{ChipDevice, ChipEmulator, ChipPlayer, ChipRom, StereoSide};
use crate::engine::constants::{DEFAULT_KSS_VOLUME, KSS_VOLUME_MAX};

/// One voice slot inside a cartridge.
pub(crate) struct KssLine {
    pub active: AtomicBool,
    pub paused: AtomicBool,
    pub autostop: AtomicBool,
    pub forcable: AtomicBool,
    /// Activation sequence number; the oldest line has the smallest id.
    pub id: AtomicI64,

    current_track: u8,
    next_track: u8,
    /// Frames remaining in the running track-transition fade.
    transition_fadeout: i64,

    rom: Box<dyn ChipRom>,
    player: Box<dyn ChipPlayer>,
}

/// A loaded KSS cartridge with its line table.
pub(crate) struct KssCartridge {
    emulator: Arc<dyn ChipEmulator>,
    rate: u32,
    channels: u8,
    bits: u8,
    silent_limit_ms: u32,
    /// Source of line ids; 64 bits so it never wraps in practice.
    next_id: i64,
    master_volume: u8,
    lines: Vec<KssLine>,
    /// Shared 16-bit render buffer for the line read path.
    scratch: Vec<i16>,
}

impl KssCartridge {
    pub fn new(
        emulator: Arc<dyn ChipEmulator>,
        rom: Box<dyn ChipRom>,
        lines: usize,
        rate: u32,
        channels: u8,
        bits: u8,
        silent_limit_ms: u32,
    ) -> Self {
        let mut cartridge = Self {
            emulator,
            rate,
            channels,
            bits,
            silent_limit_ms,
            next_id: 0,
            master_volume: DEFAULT_KSS_VOLUME,
            lines: Vec::with_capacity(lines.max(1)),
            scratch: Vec::new(),
        };
        let mut roms = Vec::with_capacity(lines.max(1));
        for _ in 1..lines.max(1) {
            roms.push(rom.duplicate());
        }
        roms.insert(0, rom);
        for rom in roms {
            cartridge.push_line(rom);
        }
        cartridge
    }

    fn push_line(&mut self, rom: Box<dyn ChipRom>) {
        let player = self.make_player(rom.as_ref(), self.master_volume, 0);
        self.lines.push(KssLine {
            active: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            autostop: AtomicBool::new(false),
            forcable: AtomicBool::new(true),
            id: AtomicI64::new(0),
            current_track: 0,
            next_track: 0,
            transition_fadeout: 0,
            rom,
            player,
        });
    }

    /// Creates an emulator instance with the cartridge's stereo layout,
    /// silence limit, and the carried-over volume and vsync frequency.
    fn make_player(&self, rom: &dyn ChipRom, volume: u8, vsync: u32) -> Box<dyn ChipPlayer> {
        let mut player = self.emulator.player(rom, self.rate, self.channels);
        if self.channels > 1 {
            // PSG sits a little left of centre, SCC a little right; the
            // OPLL renders stereo with alternating channel placement.
            player.set_device_pan(ChipDevice::Psg, 32);
            player.set_device_pan(ChipDevice::Scc, -32);
            player.set_opll_stereo(true);
            for channel in 0..6u8 {
                let side = if channel % 2 == 0 {
                    StereoSide::Left
                } else {
                    StereoSide::Right
                };
                player.set_channel_pan(ChipDevice::Opll, channel, side);
            }
        }
        player.set_silent_limit(self.silent_limit_ms);
        player.set_master_volume(volume);
        if vsync != 0 {
            player.set_vsync_freq(vsync);
        }
        player
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn active_lines(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| line.active.load(Ordering::Acquire))
            .count()
    }

    /// Re-targets the cartridge to a new mixer format, recreating every
    /// line's player while preserving its volume and vsync frequency.
    pub fn set_output_format(&mut self, rate: u32, channels: u8, bits: u8) {
        self.rate = rate;
        self.channels = channels;
        self.bits = bits;

        let mut players = Vec::with_capacity(self.lines.len());
        for line in &self.lines {
            let volume = line.player.master_volume();
            let vsync = line.player.vsync_freq();
            players.push(self.make_player(line.rom.as_ref(), volume, vsync));
        }
        for (line, player) in self.lines.iter_mut().zip(players) {
            line.player = player;
            line.active.store(false, Ordering::Release);
            line.paused.store(false, Ordering::Release);
            line.autostop.store(false, Ordering::Release);
            line.forcable.store(true, Ordering::Release);
            line.current_track = 0;
            line.next_track = 0;
            line.transition_fadeout = 0;
        }
    }

    /// Grows or shrinks the line table. Callers synchronise with the
    /// producer first.
    pub fn set_lines_count(&mut self, lines: usize) {
        if lines == 0 || lines == self.lines.len() {
            return;
        }
        if lines < self.lines.len() {
            self.lines.truncate(lines);
            return;
        }
        let additional = lines - self.lines.len();
        for _ in 0..additional {
            let rom = self.lines[0].rom.duplicate();
            self.push_line(rom);
        }
    }

    /// Configures a line for (re-)activation; `active` is set last so a
    /// concurrently mixing producer sees either the old state or the whole
    /// new one.
    fn activate(&mut self, index: usize, track: u8, autostop: bool, forcable: bool, fade_ms: u32) {
        let id = self.next_id;
        self.next_id += 1;
        let rate = self.rate;
        let line = &mut self.lines[index];

        line.autostop.store(autostop, Ordering::Release);
        line.next_track = track;
        line.paused.store(false, Ordering::Release);
        line.forcable.store(forcable, Ordering::Release);
        line.id.store(id, Ordering::Release);
        if fade_ms > 0 {
            line.transition_fadeout = fade_ms as i64 * rate as i64 / 1000;
            line.player.fade_start(fade_ms);
        } else {
            line.transition_fadeout = 0;
        }
        line.active.store(true, Ordering::Release);
    }

    /// Assigns `track` to the first idle line. Returns the 1-based line id,
    /// or 0 when every line is busy.
    pub fn activate_line(&mut self, track: u8, autostop: bool, forcable: bool) -> usize {
        for index in 0..self.lines.len() {
            if !self.lines[index].active.load(Ordering::Acquire) {
                self.activate(index, track, autostop, forcable, 0);
                return index + 1;
            }
        }
        0
    }

    /// Preempts the oldest forcable line (smallest id, ties resolved in
    /// index order). The caller must have paused the producer. Returns the
    /// 1-based line id, or 0 when no line is forcable.
    pub fn force_line(&mut self, track: u8, autostop: bool, forcable: bool) -> usize {
        let mut smallest = i64::MAX;
        let mut chosen = 0usize;
        for (index, line) in self.lines.iter().enumerate() {
            if line.forcable.load(Ordering::Acquire) {
                let id = line.id.load(Ordering::Acquire);
                if id < smallest {
                    smallest = id;
                    chosen = index + 1;
                }
            }
        }
        if chosen != 0 {
            self.activate(chosen - 1, track, autostop, forcable, 0);
        }
        chosen
    }

    /// Re-activates a specific line, optionally fading the old track out
    /// first. The caller must have paused the producer.
    pub fn update_line(
        &mut self,
        line_id: usize,
        new_track: u8,
        autostop: bool,
        forcable: bool,
        fade_ms: u32,
    ) -> bool {
        if line_id == 0 || line_id > self.lines.len() {
            return false;
        }
        self.activate(line_id - 1, new_track, autostop, forcable, fade_ms);
        true
    }

    pub fn stop(&mut self, line_id: usize) {
        if let Some(line) = self.lines.get(line_id.wrapping_sub(1)) {
            line.active.store(false, Ordering::Release);
        }
    }

    pub fn stop_active(&mut self) {
        for line in &self.lines {
            if line.active.load(Ordering::Acquire) {
                line.active.store(false, Ordering::Release);
            }
        }
    }

    pub fn set_pause(&mut self, line_id: usize, pause: bool) {
        if let Some(line) = self.lines.get(line_id.wrapping_sub(1)) {
            line.paused.store(pause, Ordering::Release);
        }
    }

    pub fn set_pause_active(&mut self, pause: bool) {
        for line in &self.lines {
            if line.active.load(Ordering::Acquire) {
                line.paused.store(pause, Ordering::Release);
            }
        }
    }

    /// Sets the cartridge master volume (0..=100) on every line.
    pub fn set_master_volume(&mut self, volume: u8) {
        self.master_volume = volume.min(KSS_VOLUME_MAX);
        let volume = self.master_volume;
        for line in &mut self.lines {
            line.player.set_master_volume(volume);
        }
    }

    /// Per-line volume override (0..=100).
    pub fn set_line_volume(&mut self, line_id: usize, volume: u8) {
        if let Some(line) = self.lines.get_mut(line_id.wrapping_sub(1)) {
            line.player.set_master_volume(volume.min(KSS_VOLUME_MAX));
        }
    }

    /// Changes the vsync frequency of every line.
    pub fn set_frequency(&mut self, hz: u32) {
        for index in 0..self.lines.len() {
            self.set_line_frequency_at(index, hz);
        }
    }

    /// Changes the vsync frequency of one line (1-based id).
    pub fn set_line_frequency(&mut self, line_id: usize, hz: u32) {
        if line_id == 0 || line_id > self.lines.len() {
            return;
        }
        self.set_line_frequency_at(line_id - 1, hz);
    }

    fn set_line_frequency_at(&mut self, index: usize, hz: u32) {
        let line = &mut self.lines[index];
        if !line.active.load(Ordering::Acquire) {
            line.player.set_vsync_freq(hz);
            return;
        }
        // An active line is reset on its current track and advanced
        // silently to an equivalent position. The advance is tuned so a
        // 50 <-> 60 Hz switch stays inaudible.
        let decoded = line.player.decoded_frames() as f64;
        let old_hz = line.player.vsync_freq() as f64;
        let new_hz = hz as f64;
        let position = if old_hz > 0.0 && new_hz > 0.0 {
            decoded * old_hz * (1024.0 + (old_hz - new_hz) * 0.3667) / (new_hz * 1024.0)
        } else {
            0.0
        };
        line.player.set_vsync_freq(hz);
        line.player.reset(line.current_track, 0);
        line.player.calc_silent(position.max(0.0) as u64);
    }

    /// Playback time of a line in milliseconds since its last reset.
    pub fn playtime_millis(&self, line_id: usize) -> u64 {
        if self.rate == 0 {
            return 0;
        }
        match self.lines.get(line_id.wrapping_sub(1)) {
            Some(line) => line.player.decoded_frames() * 1000 / self.rate as u64,
            None => 0,
        }
    }

    /// Renders every active, unpaused line and adds it into `acc`
    /// (`frames x channels` accumulator samples). 16-bit emulator output is
    /// widened by 8 bits when the mixer runs at 24-bit depth.
    pub fn read_into(&mut self, acc: &mut [i32], frames: usize) {
        let data_count = frames * self.channels as usize;
        if self.scratch.len() < data_count {
            self.scratch.resize(data_count, 0);
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        let shift = if self.bits == 24 { 8 } else { 0 };
        for line in &mut self.lines {
            Self::read_line_into(
                line,
                &mut scratch[..data_count],
                &mut acc[..data_count],
                frames,
                shift,
            );
        }
        self.scratch = scratch;
    }

    fn read_line_into(
        line: &mut KssLine,
        scratch: &mut [i16],
        acc: &mut [i32],
        frames: usize,
        shift: u32,
    ) {
        if !line.active.load(Ordering::Acquire) {
            return;
        }
        let mut deactivate = false;
        if !line.paused.load(Ordering::Acquire) {
            // A pending track takes over once any fade has finished.
            if line.next_track != 0 && line.transition_fadeout == 0 {
                line.current_track = line.next_track;
                line.next_track = 0;
                line.player.reset(line.current_track, 0);
            }

            line.player.calc(scratch);
            // Autostop is checked between produce and accumulate so the
            // final (silent) block still reaches the mix.
            deactivate = line.autostop.load(Ordering::Acquire) && line.player.stopped();
            for (out, &sample) in acc.iter_mut().zip(scratch.iter()) {
                *out += (sample as i32) << shift;
            }

            if line.transition_fadeout > 0 {
                if line.transition_fadeout < frames as i64 {
                    line.transition_fadeout = 0;
                    deactivate = line.next_track == 0;
                } else {
                    line.transition_fadeout -= frames as i64;
                }
            }
        }
        if deactivate {
            line.active.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::chip::testing::{FakeEmulator, PlayerState};
    use std::path::Path;
    use std::sync::Mutex;

    const FRAMES: usize = 10;

    fn cartridge(lines: usize, channels: u8, bits: u8) -> (Arc<FakeEmulator>, KssCartridge) {
        let emulator = Arc::new(FakeEmulator::default());
        let rom = emulator.load(Path::new("game.kss")).unwrap();
        let cartridge = KssCartridge::new(
            emulator.clone(),
            rom,
            lines,
            44_100,
            channels,
            bits,
            500,
        );
        (emulator, cartridge)
    }

    fn player(emulator: &FakeEmulator, index: usize) -> Arc<Mutex<PlayerState>> {
        emulator.players.lock().unwrap()[index].clone()
    }

    fn tick(cartridge: &mut KssCartridge, channels: usize) -> Vec<i32> {
        let mut acc = vec![0i32; FRAMES * channels];
        cartridge.read_into(&mut acc, FRAMES);
        acc
    }

    #[test]
    fn test_lines_get_private_players_and_panning() {
        let (emulator, _cartridge) = cartridge(3, 2, 16);
        // One file parse; every line gets a private copy.
        assert_eq!(emulator.loads.load(Ordering::Relaxed), 1);
        let players = emulator.players.lock().unwrap();
        assert_eq!(players.len(), 3);
        for state in players.iter() {
            let state = state.lock().unwrap();
            assert_eq!(state.silent_limit, 500);
            assert_eq!(state.volume, DEFAULT_KSS_VOLUME);
            assert!(state.opll_stereo);
            assert!(state.device_pans.contains(&(ChipDevice::Psg, 32)));
            assert!(state.device_pans.contains(&(ChipDevice::Scc, -32)));
            assert_eq!(state.channel_pans.len(), 6);
            assert_eq!(state.channel_pans[0], (ChipDevice::Opll, 0, StereoSide::Left));
            assert_eq!(state.channel_pans[1], (ChipDevice::Opll, 1, StereoSide::Right));
        }
    }

    #[test]
    fn test_mono_cartridge_skips_panning() {
        let (emulator, _cartridge) = cartridge(1, 1, 16);
        let state = player(&emulator, 0);
        let state = state.lock().unwrap();
        assert!(state.device_pans.is_empty());
        assert!(!state.opll_stereo);
    }

    #[test]
    fn test_activate_line_takes_first_idle() {
        let (_emulator, mut cartridge) = cartridge(2, 1, 16);
        assert_eq!(cartridge.activate_line(3, true, true), 1);
        assert_eq!(cartridge.activate_line(4, true, true), 2);
        assert_eq!(cartridge.activate_line(5, true, true), 0);
        assert_eq!(cartridge.active_lines(), 2);
    }

    #[test]
    fn test_pending_track_resets_on_first_tick() {
        let (emulator, mut cartridge) = cartridge(1, 1, 16);
        cartridge.activate_line(7, false, true);
        let state = player(&emulator, 0);
        assert!(state.lock().unwrap().resets.is_empty());

        let acc = tick(&mut cartridge, 1);
        assert_eq!(state.lock().unwrap().resets, vec![7]);
        assert!(acc.iter().all(|&s| s == 7));
        assert_eq!(cartridge.lines[0].current_track, 7);
    }

    #[test]
    fn test_force_line_picks_oldest_forcable() {
        let (_emulator, mut cartridge) = cartridge(3, 1, 16);
        cartridge.activate_line(1, true, true); // id 0
        cartridge.activate_line(2, true, false); // id 1, not forcable
        cartridge.activate_line(3, true, true); // id 2

        // Oldest forcable is line 1 (id 0).
        assert_eq!(cartridge.force_line(9, true, true), 1);
        // Line 1 now has id 3; next force picks line 3 (id 2).
        assert_eq!(cartridge.force_line(8, true, true), 3);
    }

    #[test]
    fn test_force_line_tie_breaks_by_index() {
        let (_emulator, mut cartridge) = cartridge(3, 1, 16);
        // All idle lines share id 0; index order wins.
        assert_eq!(cartridge.force_line(5, true, true), 1);
    }

    #[test]
    fn test_force_line_without_candidates() {
        let (_emulator, mut cartridge) = cartridge(1, 1, 16);
        cartridge.activate_line(1, true, false);
        assert_eq!(cartridge.force_line(2, true, true), 0);
    }

    #[test]
    fn test_update_line_with_fade_switches_after_countdown() {
        let (emulator, mut cartridge) = cartridge(1, 1, 16);
        cartridge.activate_line(1, false, true);
        tick(&mut cartridge, 1); // track 1 playing

        // 1 ms fade = 44 frames = a few ticks of old-track audio.
        let fade_ms = 1;
        assert!(cartridge.update_line(1, 2, false, true, fade_ms));
        let state = player(&emulator, 0);
        assert_eq!(state.lock().unwrap().fade_started, Some(fade_ms));

        // While fading the old track keeps playing.
        let acc = tick(&mut cartridge, 1);
        assert!(acc.iter().all(|&s| s == 1));

        // Run ticks until the fade has elapsed and the new track starts.
        for _ in 0..4 {
            tick(&mut cartridge, 1);
        }
        let acc = tick(&mut cartridge, 1);
        assert!(acc.iter().all(|&s| s == 2));
        assert!(cartridge.lines[0].active.load(Ordering::Acquire));
    }

    #[test]
    fn test_fade_without_next_track_deactivates() {
        let (_emulator, mut cartridge) = cartridge(1, 1, 16);
        cartridge.activate_line(1, false, true);
        tick(&mut cartridge, 1);

        // A zero "next track" with a fade is a fade-to-stop.
        cartridge.update_line(1, 0, false, true, 1);
        for _ in 0..8 {
            tick(&mut cartridge, 1);
        }
        assert!(!cartridge.lines[0].active.load(Ordering::Acquire));
    }

    #[test]
    fn test_autostop_deactivates_after_silence() {
        let (emulator, mut cartridge) = cartridge(1, 1, 16);
        cartridge.activate_line(1, true, true);
        let state = player(&emulator, 0);
        state.lock().unwrap().frames_until_stop = FRAMES as u64 * 2;

        tick(&mut cartridge, 1);
        assert!(cartridge.lines[0].active.load(Ordering::Acquire));
        tick(&mut cartridge, 1);
        assert!(!cartridge.lines[0].active.load(Ordering::Acquire));
        assert_eq!(cartridge.active_lines(), 0);
    }

    #[test]
    fn test_no_autostop_keeps_line_running() {
        let (emulator, mut cartridge) = cartridge(1, 1, 16);
        cartridge.activate_line(1, false, true);
        let state = player(&emulator, 0);
        state.lock().unwrap().frames_until_stop = FRAMES as u64;

        tick(&mut cartridge, 1);
        tick(&mut cartridge, 1);
        assert!(cartridge.lines[0].active.load(Ordering::Acquire));
    }

    #[test]
    fn test_paused_line_contributes_silence_without_advance() {
        let (emulator, mut cartridge) = cartridge(1, 1, 16);
        cartridge.activate_line(6, false, true);
        tick(&mut cartridge, 1);
        let state = player(&emulator, 0);
        let decoded = state.lock().unwrap().decoded;

        cartridge.set_pause(1, true);
        let acc = tick(&mut cartridge, 1);
        assert!(acc.iter().all(|&s| s == 0));
        assert_eq!(state.lock().unwrap().decoded, decoded);

        cartridge.set_pause(1, false);
        let acc = tick(&mut cartridge, 1);
        assert!(acc.iter().all(|&s| s == 6));
    }

    #[test]
    fn test_stop_and_stop_active() {
        let (_emulator, mut cartridge) = cartridge(2, 1, 16);
        cartridge.activate_line(1, false, true);
        cartridge.activate_line(2, false, true);
        cartridge.stop(1);
        assert_eq!(cartridge.active_lines(), 1);
        cartridge.stop_active();
        assert_eq!(cartridge.active_lines(), 0);
    }

    #[test]
    fn test_volumes() {
        let (emulator, mut cartridge) = cartridge(2, 1, 16);
        cartridge.set_master_volume(80);
        for index in 0..2 {
            assert_eq!(player(&emulator, index).lock().unwrap().volume, 80);
        }
        cartridge.set_line_volume(2, 30);
        assert_eq!(player(&emulator, 0).lock().unwrap().volume, 80);
        assert_eq!(player(&emulator, 1).lock().unwrap().volume, 30);

        // The scale is clamped to 0..=100.
        cartridge.set_master_volume(250);
        assert_eq!(player(&emulator, 0).lock().unwrap().volume, 100);
    }

    #[test]
    fn test_frequency_change_on_idle_line_just_stores() {
        let (emulator, mut cartridge) = cartridge(1, 1, 16);
        cartridge.set_frequency(50);
        let state = player(&emulator, 0);
        assert_eq!(state.lock().unwrap().vsync, 50);
        assert!(state.lock().unwrap().silent_calls.is_empty());
    }

    #[test]
    fn test_frequency_change_on_active_line_preserves_position() {
        let (emulator, mut cartridge) = cartridge(1, 1, 16);
        cartridge.set_frequency(60);
        cartridge.activate_line(1, false, true);
        for _ in 0..100 {
            tick(&mut cartridge, 1);
        }
        let state = player(&emulator, 0);
        let decoded = state.lock().unwrap().decoded as f64;

        cartridge.set_line_frequency(1, 50);

        let state = state.lock().unwrap();
        assert_eq!(state.vsync, 50);
        // Reset on the current track, then advanced silently.
        assert_eq!(*state.resets.last().unwrap(), 1);
        let expected =
            (decoded * 60.0 * (1024.0 + (60.0 - 50.0) * 0.3667) / (50.0 * 1024.0)) as u64;
        assert_eq!(state.silent_calls, vec![expected]);
    }

    #[test]
    fn test_playtime_millis() {
        let (_emulator, mut cartridge) = cartridge(1, 1, 16);
        cartridge.activate_line(1, false, true);
        // 4410 frames at 44.1kHz = 100ms.
        for _ in 0..441 {
            tick(&mut cartridge, 1);
        }
        assert_eq!(cartridge.playtime_millis(1), 100);
        assert_eq!(cartridge.playtime_millis(9), 0);
    }

    #[test]
    fn test_set_output_format_recreates_players_preserving_settings() {
        let (emulator, mut cartridge) = cartridge(1, 2, 16);
        cartridge.set_master_volume(42);
        cartridge.set_frequency(50);
        cartridge.activate_line(1, false, true);

        cartridge.set_output_format(48_000, 2, 24);
        assert_eq!(cartridge.active_lines(), 0);

        let players = emulator.players.lock().unwrap();
        assert_eq!(players.len(), 2);
        let fresh = players[1].lock().unwrap();
        assert_eq!(fresh.rate, 48_000);
        assert_eq!(fresh.volume, 42);
        assert_eq!(fresh.vsync, 50);
    }

    #[test]
    fn test_24_bit_read_widens_samples() {
        let (_emulator, mut cartridge) = cartridge(1, 1, 24);
        cartridge.activate_line(2, false, true);
        let acc = tick(&mut cartridge, 1);
        assert!(acc.iter().all(|&s| s == 2 << 8));
    }

    #[test]
    fn test_read_is_additive() {
        let (_emulator, mut cartridge) = cartridge(2, 1, 16);
        cartridge.activate_line(3, false, true);
        cartridge.activate_line(4, false, true);
        let mut acc = vec![10i32; FRAMES];
        cartridge.read_into(&mut acc, FRAMES);
        assert!(acc.iter().all(|&s| s == 10 + 3 + 4));
    }

    #[test]
    fn test_set_lines_count() {
        let (emulator, mut cartridge) = cartridge(2, 1, 16);
        cartridge.set_lines_count(4);
        assert_eq!(cartridge.line_count(), 4);
        assert_eq!(emulator.players.lock().unwrap().len(), 4);

        cartridge.set_lines_count(1);
        assert_eq!(cartridge.line_count(), 1);

        // Zero is refused.
        cartridge.set_lines_count(0);
        assert_eq!(cartridge.line_count(), 1);
    }
}
