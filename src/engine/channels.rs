//! The fixed table of voice slots.
//!
//! Lifecycle discipline: the control thread configures an inactive slot
//! (voice, source id, flags) and flips `active` last with release ordering,
//! so the producer either sees an inactive slot or a fully configured one.
//! While the sink runs, only the producer clears `active`; with the sink
//! closed the control thread may clear it directly.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use crate::engine::pcm::PcmVoice;
use crate::engine::vorbis::VorbisVoice;

/// One playing instance of a PCM or Vorbis source.
pub(crate) enum Voice {
    Pcm(PcmVoice),
    Vorbis(VorbisVoice),
}

impl Voice {
    /// Reads up to `frames` output frames into `out`. A short count means
    /// the source end was reached and the voice has rewound.
    pub fn read(&mut self, out: &mut [i32], frames: usize) -> usize {
        match self {
            Voice::Pcm(voice) => voice.read(out, frames),
            Voice::Vorbis(voice) => voice.read(out, frames),
        }
    }

    /// Restarts playback from the first frame.
    pub fn seek_start(&mut self) {
        match self {
            Voice::Pcm(voice) => voice.seek(0),
            Voice::Vorbis(voice) => voice.seek(0),
        }
    }
}

/// One slot of the channel table.
pub(crate) struct Channel {
    active: AtomicBool,
    stopped: AtomicBool,
    paused: AtomicBool,
    looping: AtomicBool,
    /// Typed source id that last filled this slot; 0 when never used.
    source_id: AtomicI32,
    /// The owned voice. Locked by the producer each tick and by the control
    /// thread only while the slot is inactive or the producer is paused.
    pub voice: Mutex<Option<Voice>>,
}

impl Channel {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            source_id: AtomicI32::new(0),
            voice: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// `true` publishes the fully configured slot; release ordering pairs
    /// with the producer's acquire load.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::Release);
    }

    pub fn source_id(&self) -> i32 {
        self.source_id.load(Ordering::Acquire)
    }

    pub fn set_source_id(&self, id: i32) {
        self.source_id.store(id, Ordering::Release);
    }

    /// Fully releases the slot, dropping the voice.
    pub fn detach(&self) {
        self.set_active(false);
        self.set_paused(false);
        self.set_looping(false);
        self.set_stopped(true);
        self.set_source_id(0);
        *self.voice.lock().unwrap() = None;
    }
}

/// Fixed-capacity table created by `set_format`.
pub(crate) struct ChannelTable {
    slots: Box<[Channel]>,
}

impl ChannelTable {
    pub fn new(voice_capacity: usize) -> Self {
        Self {
            slots: (0..voice_capacity).map(|_| Channel::new()).collect(),
        }
    }

    pub fn slots(&self) -> &[Channel] {
        &self.slots
    }

    pub fn get(&self, index: usize) -> Option<&Channel> {
        self.slots.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_slot_is_available() {
        let table = ChannelTable::new(3);
        assert_eq!(table.slots().len(), 3);
        for slot in table.slots() {
            assert!(!slot.is_active());
            assert!(slot.is_stopped());
            assert_eq!(slot.source_id(), 0);
        }
    }

    #[test]
    fn test_detach_clears_everything() {
        let table = ChannelTable::new(1);
        let slot = table.get(0).unwrap();
        slot.set_source_id(9);
        slot.set_looping(true);
        slot.set_paused(true);
        slot.set_stopped(false);
        slot.set_active(true);

        slot.detach();
        assert!(!slot.is_active());
        assert!(!slot.is_looping());
        assert!(!slot.is_paused());
        assert!(slot.is_stopped());
        assert_eq!(slot.source_id(), 0);
        assert!(slot.voice.lock().unwrap().is_none());
    }

    #[test]
    fn test_get_out_of_range() {
        let table = ChannelTable::new(2);
        assert!(table.get(2).is_none());
    }
}
