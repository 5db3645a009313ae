//! MIDI Output Gateway (spec §4.8): wraps a `midir` output connection with
//! CC throttling, a priority queue, and latency statistics. Grounded in
//! `original_source/rpi-engine/src/midi_out.py` (the raw send calls) and
//! `latency_optimizer.py` (throttling/priority-queue/stats), with the
//! teacher crate's `midir::MidiOutputConnection` usage in `main.rs` as the
//! wire-level precedent.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use midir::MidiOutputConnection;

use crate::error::EngineError;

const ALL_NOTES_OFF_CC: u8 = 123;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessageKind {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
    ControlChange { cc: u8, value: u8 },
}

#[derive(Debug, Clone, Copy)]
struct TimestampedMessage {
    scheduled_at: Instant,
    channel: u8,
    kind: MessageKind,
    priority: u8,
    sequence: u64,
}

impl PartialEq for TimestampedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.scheduled_at == other.scheduled_at
            && self.priority == other.priority
            && self.sequence == other.sequence
    }
}
impl Eq for TimestampedMessage {}

impl Ord for TimestampedMessage {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse ordering on (timestamp, priority,
        // sequence) makes `pop()` return the earliest, highest-priority,
        // first-enqueued message, matching the Python heapq's
        // `(-timestamp, priority, sequence)` min-heap key.
        other
            .scheduled_at
            .cmp(&self.scheduled_at)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for TimestampedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Min-heap (by scheduled time) bounded queue, matching `PriorityMidiQueue`.
struct PriorityMidiQueue {
    heap: BinaryHeap<TimestampedMessage>,
    max_size: usize,
    next_sequence: u64,
}

impl PriorityMidiQueue {
    fn new(max_size: usize) -> Self {
        PriorityMidiQueue {
            heap: BinaryHeap::new(),
            max_size,
            next_sequence: 0,
        }
    }

    fn put(&mut self, scheduled_at: Instant, channel: u8, kind: MessageKind, priority: u8) -> bool {
        if self.heap.len() >= self.max_size {
            log::warn!("MIDI queue full, dropping message");
            return false;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(TimestampedMessage {
            scheduled_at,
            channel,
            kind,
            priority,
            sequence,
        });
        true
    }

    fn drain_ready(&mut self, now: Instant) -> Vec<TimestampedMessage> {
        let mut ready = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.scheduled_at <= now {
                ready.push(self.heap.pop().unwrap());
            } else {
                break;
            }
        }
        ready
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

/// Per-`(channel, cc)` throttle, matching `CCThrottler`.
struct CCThrottler {
    throttle: Duration,
    last_sent: HashMap<(u8, u8), Instant>,
    pending: HashMap<(u8, u8), u8>,
}

impl CCThrottler {
    fn new(throttle_ms: u64) -> Self {
        CCThrottler {
            throttle: Duration::from_millis(throttle_ms),
            last_sent: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    fn should_send_now(&mut self, channel: u8, cc: u8, value: u8, now: Instant) -> bool {
        let key = (channel, cc);
        let due = self
            .last_sent
            .get(&key)
            .map(|last| now.duration_since(*last) >= self.throttle)
            .unwrap_or(true);
        if due {
            self.last_sent.insert(key, now);
            self.pending.remove(&key);
            true
        } else {
            self.pending.insert(key, value);
            false
        }
    }

    fn drain_pending(&mut self, now: Instant) -> Vec<(u8, u8, u8)> {
        let mut ready = Vec::new();
        let due_keys: Vec<(u8, u8)> = self
            .pending
            .keys()
            .filter(|key| {
                self.last_sent
                    .get(*key)
                    .map(|last| now.duration_since(*last) >= self.throttle)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        for key in due_keys {
            if let Some(value) = self.pending.remove(&key) {
                self.last_sent.insert(key, now);
                ready.push((key.0, key.1, value));
            }
        }
        ready
    }
}

/// Rolling latency stats over the last 100 samples, matching `LatencyStats`.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    pub total_messages: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub min_latency_ms: f64,
    recent: VecDeque<f64>,
}

impl LatencyStats {
    fn new() -> Self {
        LatencyStats {
            min_latency_ms: f64::INFINITY,
            ..Default::default()
        }
    }

    fn update(&mut self, latency_ms: f64) {
        self.total_messages += 1;
        if self.recent.len() == 100 {
            self.recent.pop_front();
        }
        self.recent.push_back(latency_ms);
        self.max_latency_ms = self.max_latency_ms.max(latency_ms);
        self.min_latency_ms = self.min_latency_ms.min(latency_ms);
        self.avg_latency_ms = self.recent.iter().sum::<f64>() / self.recent.len() as f64;
    }
}

struct Inner {
    connection: Option<MidiOutputConnection>,
    queue: PriorityMidiQueue,
    throttler: CCThrottler,
    stats: LatencyStats,
    channels_used: std::collections::HashSet<u8>,
}

/// MIDI channel is 1-based in the public API and 0-based on the wire, per
/// `midi_out.py`'s `channel - 1` conversion.
pub struct MidiOutputGateway {
    inner: Mutex<Inner>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    sequence_counter: AtomicU64,
}

impl MidiOutputGateway {
    pub fn new(connection: Option<MidiOutputConnection>, throttle_ms: u64) -> Arc<Self> {
        Arc::new(MidiOutputGateway {
            inner: Mutex::new(Inner {
                connection,
                queue: PriorityMidiQueue::new(1000),
                throttler: CCThrottler::new(throttle_ms),
                stats: LatencyStats::new(),
                channels_used: std::collections::HashSet::new(),
            }),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            sequence_counter: AtomicU64::new(0),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connection.is_some()
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let gateway = self.clone();
        let handle = thread::spawn(move || gateway.process_loop());
        *self.thread.lock().unwrap() = Some(handle);
        log::info!("MIDI output gateway started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let channels: Vec<u8> = self.inner.lock().unwrap().channels_used.iter().copied().collect();
        if channels.is_empty() {
            self.send_all_notes_off(1);
        } else {
            for channel in channels {
                self.send_all_notes_off(channel);
            }
        }
        log::info!("MIDI output gateway stopped");
    }

    pub fn schedule_note_on(&self, note: u8, velocity: u8, channel: u8, when: Option<Instant>) {
        self.enqueue(
            when.unwrap_or_else(Instant::now),
            channel,
            MessageKind::NoteOn { note, velocity },
            1,
        );
    }

    pub fn schedule_note_off(&self, note: u8, channel: u8, when: Option<Instant>) {
        self.enqueue(
            when.unwrap_or_else(Instant::now),
            channel,
            MessageKind::NoteOff { note },
            1,
        );
    }

    /// Schedules a CC message, throttling immediate (no `when`) sends per
    /// `(channel, cc)` so rapid writes collapse to the latest value.
    pub fn schedule_cc(&self, cc: u8, value: u8, channel: u8, when: Option<Instant>) {
        let mut inner = self.inner.lock().unwrap();
        inner.channels_used.insert(channel);
        if when.is_none() {
            let now = Instant::now();
            if !inner.throttler.should_send_now(channel, cc, value, now) {
                return;
            }
        }
        let sequence = self.sequence_counter.fetch_add(1, Ordering::Relaxed);
        inner.queue.put(
            when.unwrap_or_else(Instant::now),
            channel,
            MessageKind::ControlChange { cc, value },
            2,
        );
        let _ = sequence;
    }

    fn enqueue(&self, when: Instant, channel: u8, kind: MessageKind, priority: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.channels_used.insert(channel);
        inner.queue.put(when, channel, kind, priority);
    }

    pub fn send_all_notes_off(&self, channel: u8) {
        let mut inner = self.inner.lock().unwrap();
        let channel0 = channel.saturating_sub(1).min(15);
        let bytes = [0xB0 | channel0, ALL_NOTES_OFF_CC, 0];
        send_bytes(&mut inner.connection, &bytes);
    }

    /// Sends immediately, bypassing the queue and throttler, recording
    /// latency against the time the call was made.
    pub fn send_immediate(&self, channel: u8, kind: MessageKind) -> Result<(), EngineError> {
        let start = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.channels_used.insert(channel);
        let channel0 = channel.saturating_sub(1).min(15);
        let ok = send_kind(&mut inner.connection, channel0, kind);
        if ok {
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            inner.stats.update(latency_ms);
            Ok(())
        } else {
            Err(EngineError::MidiSendFailed(format!("{kind:?}")))
        }
    }

    pub fn latency_stats(&self) -> LatencyStats {
        self.inner.lock().unwrap().stats.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    fn process_loop(&self) {
        log::debug!("MIDI output processing loop started");
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            let (ready, pending_ccs) = {
                let mut inner = self.inner.lock().unwrap();
                let ready = inner.queue.drain_ready(now);
                let pending = inner.throttler.drain_pending(now);
                (ready, pending)
            };

            for message in ready {
                let latency_ms = now
                    .saturating_duration_since(message.scheduled_at)
                    .as_secs_f64()
                    * 1000.0;
                let mut inner = self.inner.lock().unwrap();
                let channel0 = message.channel.saturating_sub(1).min(15);
                if send_kind(&mut inner.connection, channel0, message.kind) {
                    inner.stats.update(latency_ms);
                }
            }

            for (channel, cc, value) in pending_ccs {
                let _ = self.send_immediate(channel, MessageKind::ControlChange { cc, value });
            }

            thread::sleep(Duration::from_millis(1));
        }
        log::debug!("MIDI output processing loop stopped");
    }
}

fn send_kind(connection: &mut Option<MidiOutputConnection>, channel0: u8, kind: MessageKind) -> bool {
    let bytes = match kind {
        MessageKind::NoteOn { note, velocity } => [0x90 | channel0, note, velocity],
        MessageKind::NoteOff { note } => [0x80 | channel0, note, 0],
        MessageKind::ControlChange { cc, value } => [0xB0 | channel0, cc, value],
    };
    send_bytes(connection, &bytes)
}

/// On a send error the connection is dropped (set to `None`) so the gateway
/// reports `is_connected() == false` from then on, matching §7's
/// `MidiSendFailed`: "gateway marked disconnected; subsequent sends return
/// failure. No retry loop lives in the gateway."
fn send_bytes(connection: &mut Option<MidiOutputConnection>, bytes: &[u8; 3]) -> bool {
    match connection {
        Some(conn) => match conn.send(bytes) {
            Ok(()) => true,
            Err(err) => {
                log::error!("MIDI send failed, marking gateway disconnected: {err}");
                *connection = None;
                false
            }
        },
        None => {
            log::debug!("no MIDI output connected, dropping message");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_without_connection_reports_disconnected() {
        let gateway = MidiOutputGateway::new(None, 10);
        assert!(!gateway.is_connected());
    }

    #[test]
    fn immediate_send_without_connection_errors() {
        let gateway = MidiOutputGateway::new(None, 10);
        let result = gateway.send_immediate(1, MessageKind::NoteOn { note: 60, velocity: 100 });
        assert!(result.is_err());
    }

    #[test]
    fn cc_throttle_suppresses_rapid_repeats() {
        let gateway = MidiOutputGateway::new(None, 50);
        gateway.schedule_cc(74, 10, 1, None);
        let len_after_first = gateway.queue_len();
        gateway.schedule_cc(74, 20, 1, None);
        // second write within the throttle window should not grow the queue
        assert_eq!(gateway.queue_len(), len_after_first);
    }

    #[test]
    fn latency_stats_start_empty() {
        let gateway = MidiOutputGateway::new(None, 10);
        let stats = gateway.latency_stats();
        assert_eq!(stats.total_messages, 0);
    }

    #[test]
    fn priority_queue_orders_by_time_then_priority() {
        let mut queue = PriorityMidiQueue::new(10);
        let now = Instant::now();
        queue.put(now + Duration::from_millis(5), 1, MessageKind::NoteOff { note: 1 }, 1);
        queue.put(now, 1, MessageKind::NoteOn { note: 60, velocity: 1 }, 1);
        let ready = queue.drain_ready(now + Duration::from_millis(10));
        assert_eq!(ready.len(), 2);
        assert!(matches!(ready[0].kind, MessageKind::NoteOn { .. }));
    }
}
