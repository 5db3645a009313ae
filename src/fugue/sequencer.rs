//! Runtime playback of a rendered fugue score, matching
//! `fugue.py::FugueSequencer`: decides when to start a new fugue, and
//! steps through the active score one sixteenth note at a time.

use std::time::{Duration, Instant};

use rand::Rng;

use super::{FugueEngine, FugueParams, Score};
use crate::scale::ScaleMapper;

const REST_DURATION_SECS: f64 = 10.0;
const MAX_ACTIVE_DURATION_SECS: f64 = 300.0;
const SIXTEENTH_BEAT: f64 = 0.25;

/// One emitted note, relative to the active score's voice, ready to clamp
/// to MIDI range and send: (voice index, MIDI pitch, velocity, duration in
/// seconds).
#[derive(Debug, Clone, Copy)]
pub struct FugueStep {
    pub voice: usize,
    pub pitch: i64,
    pub velocity: u8,
    pub duration_secs: f64,
}

struct VoiceCursor {
    next_index: usize,
}

pub struct FugueSequencer {
    score: Option<Score>,
    cursors: Vec<VoiceCursor>,
    musical_time_beats: f64,
    last_activity: Instant,
    active_since: Option<Instant>,
}

impl Default for FugueSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl FugueSequencer {
    pub fn new() -> Self {
        FugueSequencer {
            score: None,
            cursors: Vec::new(),
            musical_time_beats: 0.0,
            last_activity: Instant::now(),
            active_since: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.score.is_some()
    }

    /// True once the rest period has elapsed since the last score finished,
    /// or the active score has been running for too long, matching
    /// `should_start_new_fugue`.
    pub fn should_start_new_fugue(&self) -> bool {
        match self.active_since {
            Some(started) if self.score.is_some() => {
                started.elapsed().as_secs_f64() >= MAX_ACTIVE_DURATION_SECS
            }
            _ => self.last_activity.elapsed().as_secs_f64() >= REST_DURATION_SECS,
        }
    }

    /// Derives `FugueParams` from live engine state and renders a fresh
    /// score, matching `start_new_fugue`. `scale` resolves every generated
    /// scale degree to a MIDI pitch at generation time, matching
    /// `FugueEngine`'s constructor taking a `scale_mapper`.
    pub fn start_new_fugue(&mut self, params: FugueParams, scale: &ScaleMapper, rng: &mut impl Rng) {
        let engine = FugueEngine::new(params.clone(), scale.clone());
        let score = engine.render_fugue(rng);
        self.cursors = score
            .voices
            .iter()
            .map(|_| VoiceCursor { next_index: 0 })
            .collect();
        self.score = Some(score);
        self.musical_time_beats = 0.0;
        self.active_since = Some(Instant::now());
        log::info!(
            "started new fugue: {} voices, {:.1} beats",
            params.num_voices,
            self.score.as_ref().unwrap().total_beats
        );
    }

    /// Advances musical time by one sixteenth note and returns every note
    /// due to start at this instant across all voices, matching
    /// `get_next_step_note`'s per-call 0.25-beat advance.
    pub fn get_next_step_notes(&mut self, bpm: f64) -> Vec<FugueStep> {
        let score = match &self.score {
            Some(s) => s,
            None => return Vec::new(),
        };

        let window_start = self.musical_time_beats;
        let window_end = window_start + SIXTEENTH_BEAT;
        let seconds_per_beat = 60.0 / bpm.max(1.0);

        let mut due = Vec::new();
        let mut all_exhausted = true;
        for (voice_idx, phrase) in score.voices.iter().enumerate() {
            let cursor = &mut self.cursors[voice_idx];
            if cursor.next_index < phrase.len() {
                all_exhausted = false;
            }
            while cursor.next_index < phrase.len() {
                let note = phrase[cursor.next_index];
                if note.start_beat >= window_end {
                    break;
                }
                // Rests still advance the cursor and timing but never sound.
                if note.start_beat >= window_start {
                    if let Some(pitch) = note.pitch {
                        due.push(FugueStep {
                            voice: voice_idx,
                            pitch,
                            velocity: note.velocity,
                            duration_secs: note.duration_beats * seconds_per_beat,
                        });
                    }
                }
                cursor.next_index += 1;
            }
        }

        self.musical_time_beats = window_end;
        self.last_activity = Instant::now();

        if all_exhausted {
            log::debug!("fugue score retired, entering rest period");
            self.score = None;
            self.cursors.clear();
            self.active_since = None;
        }

        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn fresh_sequencer_wants_a_new_fugue_immediately() {
        let mut sequencer = FugueSequencer::new();
        sequencer.last_activity = Instant::now() - Duration::from_secs(20);
        assert!(sequencer.should_start_new_fugue());
    }

    #[test]
    fn active_sequencer_eventually_drains_all_voices() {
        let mut sequencer = FugueSequencer::new();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let scale = ScaleMapper::new("major", 60);
        sequencer.start_new_fugue(FugueParams::default(), &scale, &mut rng);
        assert!(sequencer.is_active());

        let mut total_steps = 0;
        for _ in 0..2000 {
            if !sequencer.is_active() {
                break;
            }
            total_steps += sequencer.get_next_step_notes(120.0).len();
        }
        assert!(!sequencer.is_active());
        assert!(total_steps > 0);
    }
}
