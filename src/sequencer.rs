//! Sequencer Core (spec §4.6): owns step direction, quantized scale
//! changes, and standard-mode note generation; delegates to the Fugue
//! Generator when `direction_pattern == "fugue"`. Grounded in
//! `original_source/rpi-engine/src/sequencer.py::Sequencer`.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::clock::HighResClock;
use crate::fugue::{FugueParams, FugueSequencer};
use crate::params::{ParamValue, ParameterStore, StateChange};
use crate::presets;
use crate::scale::ScaleMapper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
    PingPong,
    Random,
    Fugue,
}

impl Direction {
    fn parse(name: &str) -> Direction {
        match name {
            "backward" => Direction::Backward,
            "ping_pong" => Direction::PingPong,
            "random" => Direction::Random,
            "fugue" => Direction::Fugue,
            _ => Direction::Forward,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NoteEvent {
    pub voice: usize,
    pub note: u8,
    pub velocity: u8,
    pub gate_length_secs: f64,
}

struct DirectionState {
    current_step: usize,
    ping_pong_direction: i64,
}

struct PendingScaleChange {
    scale_name: Option<String>,
    root_note: Option<i64>,
}

/// An in-progress smooth BPM fade, driven from the clock tick callback
/// rather than its own thread (spec §4.6/§5 "runs in lockstep with the
/// Clock tick callback, not a separate thread").
struct BpmTransition {
    start_value: f64,
    target_value: f64,
    started_at: Instant,
    duration: Duration,
}

pub struct Sequencer {
    state: Arc<ParameterStore>,
    scale: Mutex<ScaleMapper>,
    scale_names: Vec<String>,
    direction_state: Mutex<DirectionState>,
    pending_scale_change: Mutex<Option<PendingScaleChange>>,
    fugue_sequencer: Mutex<FugueSequencer>,
    clock: Mutex<Option<Arc<HighResClock>>>,
    bpm_transition: Mutex<Option<BpmTransition>>,
    step_count: AtomicUsize,
    fugue_seed: AtomicI64,
}

impl Sequencer {
    pub fn new(state: Arc<ParameterStore>, scale_name: &str, root_note: i64) -> Arc<Self> {
        let sequencer = Arc::new(Sequencer {
            state: state.clone(),
            scale: Mutex::new(ScaleMapper::new(scale_name, root_note)),
            scale_names: ScaleMapper::available_scales()
                .into_iter()
                .map(str::to_string)
                .collect(),
            direction_state: Mutex::new(DirectionState {
                current_step: 0,
                ping_pong_direction: 1,
            }),
            pending_scale_change: Mutex::new(None),
            fugue_sequencer: Mutex::new(FugueSequencer::new()),
            clock: Mutex::new(None),
            bpm_transition: Mutex::new(None),
            step_count: AtomicUsize::new(8),
            fugue_seed: AtomicI64::new(1),
        });
        sequencer.attach_listener();
        sequencer
    }

    /// Wires the clock the sequencer should drive on `bpm`/`swing` writes.
    /// Spec §3 has the Sequencer exclusively own the Clock; here the two are
    /// constructed separately by `Engine` and linked with this call so both
    /// can be started/stopped independently while the sequencer still
    /// mediates every live parameter update into the clock.
    pub fn set_clock(&self, clock: Arc<HighResClock>) {
        *self.clock.lock().unwrap() = Some(clock);
    }

    /// Registers a `Weak` self-reference as a Parameter Store listener so
    /// the sequencer reacts to `scale_index`/`root_note`/`direction_pattern`
    /// writes from any source (mutation engine, idle manager, external
    /// caller) without creating an `Arc` reference cycle with the store.
    fn attach_listener(self: &Arc<Self>) {
        let weak: Weak<Sequencer> = Arc::downgrade(self);
        self.state.add_listener(Arc::new(move |change: &StateChange| {
            if let Some(sequencer) = weak.upgrade() {
                sequencer.on_state_change(change);
            }
        }));
    }

    fn on_state_change(&self, change: &StateChange) {
        match change.parameter.as_str() {
            "root_note" => {
                if let Some(root) = change.new_value.as_i64() {
                    self.queue_scale_change(None, Some(root));
                }
            }
            "scale_index" => {
                if let Some(index) = change.new_value.as_i64() {
                    if let Some(name) = self.scale_names.get(index.max(0) as usize) {
                        self.queue_scale_change(Some(name.clone()), None);
                    }
                }
            }
            "sequence_length" => {
                if let Some(len) = change.new_value.as_i64() {
                    self.step_count.store(len.max(1) as usize, Ordering::SeqCst);
                }
            }
            "direction_pattern" => {
                let mut direction_state = self.direction_state.lock().unwrap();
                direction_state.current_step = 0;
                direction_state.ping_pong_direction = 1;
            }
            "step_position" => {
                if let Some(step) = change.new_value.as_i64() {
                    self.direction_state.lock().unwrap().current_step = step.max(0) as usize;
                }
            }
            "bpm" => self.on_bpm_change(change),
            "swing" => {
                if let Some(swing) = change.new_value.as_f64() {
                    if let Some(clock) = self.clock.lock().unwrap().as_ref() {
                        clock.update_params(None, Some(swing));
                    }
                }
            }
            _ => {}
        }
    }

    /// Spec §4.6: a `bpm` write from source `idle` with smooth transitions
    /// on starts a cubic ease over `idle_transition_duration_s`, applied to
    /// the clock on each `tick()` without recursing back into `set`. Any
    /// other source cancels an in-progress transition and updates the
    /// clock immediately.
    fn on_bpm_change(&self, change: &StateChange) {
        let Some(new_bpm) = change.new_value.as_f64() else { return };
        let old_bpm = change
            .old_value
            .as_ref()
            .and_then(|v| v.as_f64())
            .unwrap_or(new_bpm);

        let smooth = change.source == "idle" && self.state.get_bool("smooth_idle_transitions", true);
        if smooth && (new_bpm - old_bpm).abs() >= 1.0 {
            let duration_s = self.state.get_f64("idle_transition_duration_s", 4.0).max(0.0);
            *self.bpm_transition.lock().unwrap() = Some(BpmTransition {
                start_value: old_bpm,
                target_value: new_bpm,
                started_at: Instant::now(),
                duration: Duration::from_secs_f64(duration_s),
            });
            return;
        }

        *self.bpm_transition.lock().unwrap() = None;
        if let Some(clock) = self.clock.lock().unwrap().as_ref() {
            clock.update_params(Some(new_bpm), None);
        }
    }

    /// Advances an in-progress smooth BPM transition by one clock tick.
    /// Called from the engine's tick-driven loop, never from a separate
    /// thread, so there is no race with `on_bpm_change`'s cancellation path.
    pub fn tick(&self) {
        let (done, value) = {
            let transition = self.bpm_transition.lock().unwrap();
            let Some(t) = transition.as_ref() else { return };
            let duration_s = t.duration.as_secs_f64().max(f64::EPSILON);
            let progress = (t.started_at.elapsed().as_secs_f64() / duration_s).min(1.0);
            let eased = cubic_ease_in_out(progress);
            let value = t.start_value + (t.target_value - t.start_value) * eased;
            (progress >= 1.0, value)
        };

        if let Some(clock) = self.clock.lock().unwrap().as_ref() {
            clock.update_params(Some(value), None);
        }

        if done {
            *self.bpm_transition.lock().unwrap() = None;
            self.state
                .set("bpm", ParamValue::Float(value), "sequencer_transition_complete");
        }
    }

    fn queue_scale_change(&self, scale_name: Option<String>, root_note: Option<i64>) {
        *self.pending_scale_change.lock().unwrap() = Some(PendingScaleChange { scale_name, root_note });
    }

    /// Applies any pending quantized scale/root change, but only at the
    /// start of a bar (step 0), matching `_apply_scale_change`'s
    /// quantize-unless-forced behavior.
    fn apply_pending_scale_change_if_due(&self, step: usize) {
        if step != 0 {
            return;
        }
        let pending = self.pending_scale_change.lock().unwrap().take();
        if let Some(pending) = pending {
            let mut scale = self.scale.lock().unwrap();
            if let Some(name) = pending.scale_name {
                if scale.set_scale(&name).is_err() {
                    log::warn!("pending scale change to '{name}' rejected, unknown scale");
                }
            }
            if let Some(root) = pending.root_note {
                scale.set_root_note(root);
            }
        }
    }

    fn direction(&self) -> Direction {
        Direction::parse(&self.state.get_enum("direction_pattern", "forward"))
    }

    fn sequence_length(&self) -> usize {
        self.step_count.load(Ordering::SeqCst).max(1)
    }

    /// Computes the next step index under the active direction policy,
    /// matching `_get_next_step`.
    fn next_step(&self, rng: &mut impl Rng) -> usize {
        let length = self.sequence_length();
        let mut direction_state = self.direction_state.lock().unwrap();
        let current = direction_state.current_step;

        let next = match self.direction() {
            Direction::Forward | Direction::Fugue => (current + 1) % length,
            Direction::Backward => (current + length - 1) % length,
            Direction::PingPong => {
                if length <= 1 {
                    current
                } else {
                    let mut next = current as i64 + direction_state.ping_pong_direction;
                    if next >= length as i64 {
                        direction_state.ping_pong_direction = -1;
                        next = (length as i64 - 2).max(0);
                    } else if next < 0 {
                        direction_state.ping_pong_direction = 1;
                        next = 1.min(length as i64 - 1);
                    }
                    next as usize
                }
            }
            Direction::Random => {
                if length <= 1 {
                    current
                } else {
                    loop {
                        let candidate = rng.gen_range(0..length);
                        if candidate != current {
                            break candidate;
                        }
                    }
                }
            }
        };

        direction_state.current_step = next;
        next
    }

    /// Generates the note(s) for the sequencer's current step without
    /// advancing it, matching `Sequencer.start()`'s "generate note for the
    /// initial step (step 0)" before the clock itself starts ticking. Call
    /// this once before the first `advance_step`, or every later step is
    /// shifted one ahead of the direction policy's own starting position.
    pub fn generate_initial_step(&self, rng: &mut impl Rng) -> Vec<NoteEvent> {
        let step = self.direction_state.lock().unwrap().current_step;
        self.apply_pending_scale_change_if_due(step);
        self.state
            .set("step_position", ParamValue::Int(step as i64), "sequencer");
        self.generate_step_note(step, rng)
    }

    /// Advances the sequencer by one step, applying any due scale change,
    /// publishing the new `step_position`, and returning the notes to
    /// sound at this step (zero, one, or several in fugue mode).
    pub fn advance_step(&self, rng: &mut impl Rng) -> Vec<NoteEvent> {
        let next = self.next_step(rng);
        self.apply_pending_scale_change_if_due(next);
        self.state
            .set("step_position", ParamValue::Int(next as i64), "sequencer");
        self.generate_step_note(next, rng)
    }

    fn generate_step_note(&self, step: usize, rng: &mut impl Rng) -> Vec<NoteEvent> {
        if self.direction() == Direction::Fugue {
            return self.generate_fugue_notes(rng);
        }

        let density = self.state.get_f64("density", 0.85);
        if rng.gen_range(0.0..1.0) > density {
            return Vec::new();
        }

        let length = self.sequence_length();
        let note_probability = self.state.get_f64("note_probability", 0.9);
        let step_prob = self
            .state
            .get("step_probabilities", ParamValue::FloatList(vec![]))
            .as_float_list()
            .and_then(|probs| probs.get(step).copied())
            .unwrap_or(note_probability);

        let active = self
            .state
            .get("step_pattern", ParamValue::BoolList(vec![]))
            .as_bool_list()
            .and_then(|pattern| pattern.get(step).copied())
            .unwrap_or(step % 2 == 0);

        if !active || rng.gen_range(0.0..1.0) >= step_prob {
            return Vec::new();
        }

        let degree = (step / 2) as i64;
        let note = self.scale.lock().unwrap().get_note(degree, 0);

        let base_velocity = self.state.get_i64("base_velocity", 80) as f64;
        let velocity_range = self.state.get_i64("velocity_range", 40) as f64;
        let velocity_factor = (0.5 + step_prob * 0.5 + rng.gen_range(-0.2..0.2) * step_prob).clamp(0.1, 1.0);
        let velocity = (base_velocity + velocity_range * (velocity_factor - 0.5)).clamp(1.0, 127.0) as u8;

        let base_gate_length = self.state.get_f64("base_gate_length", 0.8);
        let gate_length_range = self.state.get_f64("gate_length_range", 0.3);
        let gate_factor = (0.5 + step_prob * 0.5 + rng.gen_range(-0.15..0.15) * step_prob).clamp(0.1, 1.0);
        let bpm = self.state.get_f64("bpm", 110.0);
        let steps_per_beat = 4.0;
        let step_duration = 60.0 / (bpm * steps_per_beat);
        let gate_length = (base_gate_length + gate_length_range * (gate_factor - 0.5)).clamp(0.1, 1.0);

        vec![NoteEvent {
            voice: 0,
            note,
            velocity,
            gate_length_secs: step_duration * gate_length,
        }]
    }

    fn generate_fugue_notes(&self, rng: &mut impl Rng) -> Vec<NoteEvent> {
        let mut fugue_sequencer = self.fugue_sequencer.lock().unwrap();
        if fugue_sequencer.should_start_new_fugue() {
            let seed = self.fugue_seed.fetch_add(1, Ordering::SeqCst) as u64;
            let params = FugueParams {
                seed,
                subject_length: 8,
                num_voices: self.state.get_i64("voices", 3).clamp(1, 4) as usize,
                stretto_overlap: 0.5,
                entry_gap_beats: None,
                base_velocity: self.state.get_i64("base_velocity", 90) as u8,
                velocity_range: self.state.get_i64("velocity_range", 20) as u8,
                ..FugueParams::default()
            };
            let scale = self.scale.lock().unwrap();
            fugue_sequencer.start_new_fugue(params, &scale, rng);
        }

        let bpm = self.state.get_f64("bpm", 110.0);
        let steps = fugue_sequencer.get_next_step_notes(bpm);
        steps
            .into_iter()
            .map(|step| NoteEvent {
                voice: step.voice,
                note: step.pitch.clamp(0, 127) as u8,
                velocity: step.velocity,
                gate_length_secs: step.duration_secs,
            })
            .collect()
    }

    pub fn set_step_pattern(&self, pattern: Vec<bool>) {
        self.state.set("step_pattern", ParamValue::BoolList(pattern), "sequencer");
    }

    pub fn set_step_probabilities(&self, probabilities: Vec<f64>) {
        self.state
            .set("step_probabilities", ParamValue::FloatList(probabilities), "sequencer");
    }

    pub fn apply_pattern_preset(&self, name: &str) -> bool {
        match presets::pattern_preset(name, self.sequence_length()) {
            Some(pattern) => {
                self.set_step_pattern(pattern);
                true
            }
            None => false,
        }
    }

    pub fn apply_probability_preset(&self, name: &str, rng: &mut impl Rng) -> bool {
        match presets::probability_preset(name, self.sequence_length(), rng) {
            Some(probabilities) => {
                self.set_step_probabilities(probabilities);
                true
            }
            None => false,
        }
    }
}

fn cubic_ease_in_out(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    if t < 0.5 {
        4.0 * t * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn non_idle_bpm_write_updates_clock_immediately() {
        let state = Arc::new(ParameterStore::new());
        let sequencer = Sequencer::new(state.clone(), "major", 60);
        let clock = Arc::new(HighResClock::new(110.0, 24, 0.0));
        sequencer.set_clock(clock.clone());

        state.set("bpm", ParamValue::Float(140.0), "midi");
        assert_eq!(clock.bpm(), 140.0);
        assert!(sequencer.bpm_transition.lock().unwrap().is_none());
    }

    #[test]
    fn idle_bpm_write_starts_smooth_transition_applied_on_tick() {
        let state = Arc::new(ParameterStore::new());
        let sequencer = Sequencer::new(state.clone(), "major", 60);
        let clock = Arc::new(HighResClock::new(120.0, 24, 0.0));
        sequencer.set_clock(clock.clone());

        state.set("idle_transition_duration_s", ParamValue::Float(0.01), "config");
        state.set("bpm", ParamValue::Float(60.0), "idle");
        assert!(sequencer.bpm_transition.lock().unwrap().is_some());

        std::thread::sleep(Duration::from_millis(20));
        sequencer.tick();
        assert!(sequencer.bpm_transition.lock().unwrap().is_none());
        assert_eq!(clock.bpm(), 60.0);
    }

    #[test]
    fn swing_write_updates_clock_immediately() {
        let state = Arc::new(ParameterStore::new());
        let sequencer = Sequencer::new(state.clone(), "major", 60);
        let clock = Arc::new(HighResClock::new(110.0, 24, 0.0));
        sequencer.set_clock(clock.clone());

        state.set("swing", ParamValue::Float(0.3), "midi");
        assert_eq!(clock.swing(), 0.3);
    }

    #[test]
    fn forward_direction_wraps_at_sequence_end() {
        let state = Arc::new(ParameterStore::new());
        state.set("sequence_length", ParamValue::Int(4), "config");
        let sequencer = Sequencer::new(state, "major", 60);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..4 {
            sequencer.advance_step(&mut rng);
        }
        // after 4 advances from step 0 we should have wrapped back to 0
        assert_eq!(sequencer.direction_state.lock().unwrap().current_step, 0);
    }

    #[test]
    fn density_zero_silences_every_step() {
        let state = Arc::new(ParameterStore::new());
        state.set("density", ParamValue::Float(0.0), "config");
        let sequencer = Sequencer::new(state, "major", 60);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        for _ in 0..8 {
            assert!(sequencer.advance_step(&mut rng).is_empty());
        }
    }

    #[test]
    fn fugue_mode_bypasses_density_and_step_pattern() {
        let state = Arc::new(ParameterStore::new());
        state.set("density", ParamValue::Float(0.0), "config");
        state.set(
            "direction_pattern",
            ParamValue::Enum("fugue".into()),
            "config",
        );
        let sequencer = Sequencer::new(state, "major", 60);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut total_notes = 0;
        for _ in 0..200 {
            total_notes += sequencer.advance_step(&mut rng).len();
        }
        assert!(total_notes > 0, "fugue mode must produce notes despite density=0");
    }

    #[test]
    fn pattern_preset_sets_step_pattern() {
        let state = Arc::new(ParameterStore::new());
        let sequencer = Sequencer::new(state.clone(), "major", 60);
        assert!(sequencer.apply_pattern_preset("four_on_floor"));
        let stored = state.get("step_pattern", ParamValue::BoolList(vec![]));
        assert_eq!(stored.as_bool_list().unwrap()[0], true);
    }
}
