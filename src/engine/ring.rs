//! The packet ring between the producer thread and the sink callback.
//!
//! One producer mixes fixed-size packets, one consumer (the realtime sink
//! callback) drains bytes. The byte transport is an rtrb SPSC ring sized for
//! `packet_count - 1` packets, so the producer can never overwrite unread
//! data. On top of it sits a gate - one mutex plus two condition variables -
//! used strictly for wait/notify: the producer never holds the lock across a
//! mix. Each tick it waits (under the lock) for space and for the pause flag
//! to be clear, drops the lock, mixes and publishes, then briefly retakes
//! the lock to park and signal that it is idle again.
//!
//! `RingGate::pause(true)` raises the pause flag and then waits on that idle
//! signal, so it returns only once the producer is observably parked between
//! ticks - and with the flag up it cannot start another one. Control
//! operations that mutate source or cartridge state wrap themselves in
//! [`RingGate::pause_scope`]. The consumer notifies the gate whenever it
//! finishes a packet, waking a producer that is waiting for space.
//!
//! The consumer side never blocks: an empty ring yields zero-filled bytes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use rtrb::{Consumer, Producer, RingBuffer};

/// Shared wait/notify state between producer, consumer and control thread.
pub(crate) struct RingGate {
    lock: Mutex<()>,
    /// Wakes the producer: space freed, pause toggled, shutdown.
    cv: Condvar,
    /// Wakes a pauser waiting for the producer to park.
    idle_cv: Condvar,
    producer_on: AtomicBool,
    paused: AtomicBool,
    /// True while the producer is parked between ticks.
    idle: AtomicBool,
}

impl RingGate {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
            idle_cv: Condvar::new(),
            producer_on: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            idle: AtomicBool::new(true),
        }
    }

    /// True while a producer thread is expected to run.
    pub fn is_on(&self) -> bool {
        self.producer_on.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Arms the gate before spawning a producer thread.
    pub fn turn_on(&self) {
        self.paused.store(false, Ordering::Release);
        self.idle.store(true, Ordering::Release);
        self.producer_on.store(true, Ordering::Release);
    }

    /// Tells the producer to exit and wakes it. The caller joins the thread.
    pub fn shut_down(&self) {
        self.producer_on.store(false, Ordering::Release);
        let _guard = self.lock.lock().unwrap();
        self.cv.notify_all();
        self.idle_cv.notify_all();
    }

    /// Pauses or resumes production. Pausing returns only once the producer
    /// has parked between ticks: the producer raises the idle signal under
    /// the gate lock after every publish, and with the pause flag already up
    /// it cannot start another mix.
    pub fn pause(&self, pause: bool) {
        if self.paused.swap(pause, Ordering::AcqRel) == pause {
            return;
        }
        let mut guard = self.lock.lock().unwrap();
        self.cv.notify_all();
        if pause {
            while self.producer_on.load(Ordering::Acquire) && !self.idle.load(Ordering::Acquire) {
                guard = self.idle_cv.wait(guard).unwrap();
            }
        }
    }

    /// Scoped pause for control operations that mutate shared state. Engages
    /// only when a producer is running and not already paused; drops back to
    /// running state on scope exit.
    pub fn pause_scope(&self) -> PauseGuard<'_> {
        let engaged = self.is_on() && !self.is_paused();
        if engaged {
            self.pause(true);
        }
        PauseGuard { gate: self, engaged }
    }
}

/// RAII guard resuming the producer when dropped.
pub(crate) struct PauseGuard<'a> {
    gate: &'a RingGate,
    engaged: bool,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        if self.engaged {
            self.gate.pause(false);
        }
    }
}

/// Builds the two ring halves. Capacity is `(packet_count - 1)` packets: the
/// transport refuses the next packet while that many are still unread.
pub(crate) fn packet_ring(
    packet_count: usize,
    packet_bytes: usize,
    gate: Arc<RingGate>,
) -> (PacketWriter, PacketReader) {
    debug_assert!(packet_count >= 2);
    let (tx, rx) = RingBuffer::<u8>::new((packet_count - 1) * packet_bytes);
    (
        PacketWriter {
            tx,
            gate: gate.clone(),
            packet: vec![0; packet_bytes],
        },
        PacketReader {
            rx,
            gate,
            packet_bytes,
            read_inrange_index: 0,
        },
    )
}

/// Producer half: mixes and publishes exactly one packet per tick.
pub(crate) struct PacketWriter {
    tx: Producer<u8>,
    gate: Arc<RingGate>,
    packet: Vec<u8>,
}

impl PacketWriter {
    /// Runs one producer tick: waits until there is room for a packet and
    /// the ring is not paused, then mixes and publishes one packet with the
    /// gate lock released. Returns `false` once the gate has been shut down.
    pub fn produce(&mut self, mix: &mut dyn FnMut(&mut [u8])) -> bool {
        // The gate lock frames only the wait/notify handshake, never the
        // mix itself.
        {
            let mut guard = self.gate.lock.lock().unwrap();
            loop {
                if !self.gate.is_on() {
                    return false;
                }
                if !self.gate.is_paused() && self.tx.slots() >= self.packet.len() {
                    break;
                }
                guard = self.gate.cv.wait(guard).unwrap();
            }
            self.gate.idle.store(false, Ordering::Release);
        }

        mix(&mut self.packet);
        if let Ok(chunk) = self.tx.write_chunk_uninit(self.packet.len()) {
            chunk.fill_from_iter(self.packet.iter().copied());
        }

        // Park: tell any pauser the tick is complete.
        {
            let _guard = self.gate.lock.lock().unwrap();
            self.gate.idle.store(true, Ordering::Release);
            self.gate.idle_cv.notify_all();
        }
        true
    }
}

/// Consumer half: owned by the sink callback.
pub struct PacketReader {
    rx: Consumer<u8>,
    gate: Arc<RingGate>,
    packet_bytes: usize,
    /// Byte offset into the packet currently being consumed.
    read_inrange_index: usize,
}

impl PacketReader {
    /// Copies ring bytes into `out`, walking across packet boundaries and
    /// waking the producer at each boundary. If the ring runs empty the
    /// remainder is zero-filled; this call never blocks.
    pub fn read(&mut self, out: &mut [u8]) {
        let mut filled = 0;
        while filled < out.len() {
            let available = self.rx.slots();
            if available == 0 {
                out[filled..].fill(0);
                return;
            }
            let take = (out.len() - filled).min(available);
            let chunk = match self.rx.read_chunk(take) {
                Ok(chunk) => chunk,
                Err(_) => {
                    out[filled..].fill(0);
                    return;
                }
            };
            let (first, second) = chunk.as_slices();
            out[filled..filled + first.len()].copy_from_slice(first);
            out[filled + first.len()..filled + take].copy_from_slice(second);
            chunk.commit_all();
            filled += take;

            self.read_inrange_index += take;
            if self.read_inrange_index >= self.packet_bytes {
                self.read_inrange_index %= self.packet_bytes;
                self.gate.cv.notify_one();
            }
        }
    }

    /// Bytes currently buffered in the ring.
    pub fn buffered_bytes(&self) -> usize {
        self.rx.slots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn spawn_producer(
        mut writer: PacketWriter,
        mut next_byte: u8,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut mix = move |packet: &mut [u8]| {
                packet.fill(next_byte);
                next_byte = next_byte.wrapping_add(1);
            };
            while writer.produce(&mut mix) {}
        })
    }

    #[test]
    fn test_packets_arrive_in_order() {
        let gate = Arc::new(RingGate::new());
        let (writer, mut reader) = packet_ring(3, 4, gate.clone());
        gate.turn_on();
        let handle = spawn_producer(writer, 1);

        let mut seen = Vec::new();
        let mut buf = [0u8; 4];
        while seen.len() < 5 {
            reader.read(&mut buf);
            if buf[0] != 0 {
                assert!(buf.iter().all(|&b| b == buf[0]));
                seen.push(buf[0]);
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);

        gate.shut_down();
        handle.join().unwrap();
    }

    #[test]
    fn test_capacity_is_packet_count_minus_one() {
        let gate = Arc::new(RingGate::new());
        let (writer, reader) = packet_ring(5, 8, gate.clone());
        gate.turn_on();
        let handle = spawn_producer(writer, 1);

        // The producer can buffer at most 4 packets ahead.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while reader.buffered_bytes() < 4 * 8 {
            assert!(std::time::Instant::now() < deadline, "producer stalled");
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(reader.buffered_bytes(), 4 * 8);

        gate.shut_down();
        handle.join().unwrap();
    }

    #[test]
    fn test_underrun_zero_fills() {
        let gate = Arc::new(RingGate::new());
        let (_writer, mut reader) = packet_ring(2, 4, gate);
        let mut buf = [0xAAu8; 10];
        reader.read(&mut buf);
        assert_eq!(buf, [0u8; 10]);
    }

    #[test]
    fn test_partial_packet_reads_cross_boundaries() {
        let gate = Arc::new(RingGate::new());
        let (writer, mut reader) = packet_ring(4, 4, gate.clone());
        gate.turn_on();
        let handle = spawn_producer(writer, 1);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while reader.buffered_bytes() < 3 * 4 {
            assert!(std::time::Instant::now() < deadline, "producer stalled");
            thread::yield_now();
        }

        // 3-byte reads walk across the 4-byte packet boundary.
        let mut out = Vec::new();
        for _ in 0..4 {
            let mut buf = [0u8; 3];
            reader.read(&mut buf);
            out.extend_from_slice(&buf);
        }
        assert_eq!(out, vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);

        gate.shut_down();
        handle.join().unwrap();
    }

    #[test]
    fn test_pause_stops_production() {
        let gate = Arc::new(RingGate::new());
        let (writer, mut reader) = packet_ring(8, 2, gate.clone());
        gate.turn_on();
        let handle = spawn_producer(writer, 1);

        {
            let _pause = gate.pause_scope();
            // Pausing waits for the producer to park, so every packet mixed
            // before the pause is already published; drain them.
            let mut buf = [0u8; 2];
            while reader.buffered_bytes() > 0 {
                reader.read(&mut buf);
            }
            // Paused: nothing new shows up.
            thread::sleep(Duration::from_millis(30));
            assert_eq!(reader.buffered_bytes(), 0);
        }

        // Resumed: production continues.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while reader.buffered_bytes() == 0 {
            assert!(std::time::Instant::now() < deadline, "producer stalled");
            thread::yield_now();
        }

        gate.shut_down();
        handle.join().unwrap();
    }

    #[test]
    fn test_shut_down_unblocks_full_ring() {
        let gate = Arc::new(RingGate::new());
        let (writer, _reader) = packet_ring(2, 4, gate.clone());
        gate.turn_on();
        let handle = spawn_producer(writer, 1);
        thread::sleep(Duration::from_millis(10));
        gate.shut_down();
        handle.join().unwrap();
    }

    #[test]
    fn test_pause_scope_noop_when_stopped() {
        let gate = RingGate::new();
        {
            let _pause = gate.pause_scope();
            assert!(!gate.is_paused());
        }
        assert!(!gate.is_paused());
    }
}
