//! Note-Off Scheduler (spec §4.9): a background thread that fires a
//! note-off for every note-on after its gate-length duration elapses,
//! independent of the sequencer's own tick cadence. Uses the same
//! min-heap-by-due-time structure as `output.rs`'s priority queue, grounded
//! in the same `latency_optimizer.py::PriorityMidiQueue` pattern.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::output::MidiOutputGateway;

#[derive(Debug, Clone, Copy)]
struct PendingNoteOff {
    due_at: Instant,
    note: u8,
    channel: u8,
    sequence: u64,
}

impl PartialEq for PendingNoteOff {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.sequence == other.sequence
    }
}
impl Eq for PendingNoteOff {}
impl Ord for PendingNoteOff {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for PendingNoteOff {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

pub struct NoteOffScheduler {
    output: Arc<MidiOutputGateway>,
    heap: Mutex<BinaryHeap<PendingNoteOff>>,
    next_sequence: Mutex<u64>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl NoteOffScheduler {
    pub fn new(output: Arc<MidiOutputGateway>) -> Arc<Self> {
        Arc::new(NoteOffScheduler {
            output,
            heap: Mutex::new(BinaryHeap::new()),
            next_sequence: Mutex::new(0),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn schedule(&self, note: u8, channel: u8, duration: Duration) {
        let mut sequence = self.next_sequence.lock().unwrap();
        let entry = PendingNoteOff {
            due_at: Instant::now() + duration,
            note,
            channel,
            sequence: *sequence,
        };
        *sequence += 1;
        self.heap.lock().unwrap().push(entry);
    }

    pub fn pending_count(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = self.clone();
        let handle = thread::spawn(move || scheduler.run_loop());
        *self.thread.lock().unwrap() = Some(handle);
        log::debug!("note-off scheduler started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.flush_all();
        log::debug!("note-off scheduler stopped");
    }

    /// Discards every still-pending note-off without sending it, matching
    /// spec §4.9 ("Stopping flushes ... does not send pending note-offs")
    /// and §5's "pending timers are discarded on stop". The gateway's own
    /// `stop()` sends an All-Notes-Off instead of relying on these firing.
    fn flush_all(&self) {
        self.heap.lock().unwrap().clear();
    }

    fn run_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            let due: Vec<PendingNoteOff> = {
                let mut heap = self.heap.lock().unwrap();
                let mut due = Vec::new();
                while let Some(top) = heap.peek() {
                    if top.due_at <= now {
                        due.push(heap.pop().unwrap());
                    } else {
                        break;
                    }
                }
                due
            };
            for entry in due {
                let _ = self.output.send_immediate(
                    entry.channel,
                    crate::output::MessageKind::NoteOff { note: entry.note },
                );
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_increments_pending_count() {
        let output = MidiOutputGateway::new(None, 10);
        let scheduler = NoteOffScheduler::new(output);
        scheduler.schedule(60, 1, Duration::from_secs(5));
        scheduler.schedule(64, 1, Duration::from_secs(5));
        assert_eq!(scheduler.pending_count(), 2);
    }

    #[test]
    fn due_note_offs_fire_and_drain() {
        let output = MidiOutputGateway::new(None, 10);
        let scheduler = NoteOffScheduler::new(output);
        scheduler.schedule(60, 1, Duration::from_millis(1));
        scheduler.start();
        thread::sleep(Duration::from_millis(30));
        scheduler.stop();
        assert_eq!(scheduler.pending_count(), 0);
    }
}
