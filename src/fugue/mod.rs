//! Fugue Generator (spec §4.7): generates contrapuntal multi-voice scores
//! from a short subject, using classical tonal-answer / stretto / episode
//! construction. Grounded in
//! `original_source/rpi-engine/src/fugue.py` (`FugueEngine`, `FugueParams`,
//! `Entry`) and its runtime companion `FugueSequencer`.

mod generate;
mod sequencer;
mod transform;

pub use generate::FugueEngine;
pub use sequencer::FugueSequencer;

/// A single note expressed as a MIDI pitch (semitones, not yet clamped to
/// `0..=127` -- transformations like `invert` can briefly push a pitch out
/// of range before the final clamp at the output boundary), a duration in
/// beats, and a start time in beats from the start of its containing
/// phrase. `pitch == None` is a rest; per spec §3's invariant, rests always
/// carry `velocity == 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Note {
    pub pitch: Option<i64>,
    pub duration_beats: f64,
    pub start_beat: f64,
    pub velocity: u8,
}

impl Note {
    pub fn rest(duration_beats: f64, start_beat: f64) -> Note {
        Note { pitch: None, duration_beats, start_beat, velocity: 0 }
    }

    pub fn is_rest(&self) -> bool {
        self.pitch.is_none()
    }
}

/// An ordered, monophonic line: one voice's material.
pub type Phrase = Vec<Note>;

/// A complete multi-voice score, one `Phrase` per voice.
#[derive(Debug, Clone, Default)]
pub struct Score {
    pub voices: Vec<Phrase>,
    pub total_beats: f64,
}

/// Parameters controlling one fugue's generation, derived from live engine
/// state at the moment a new fugue is started (`FugueSequencer::start_new_fugue`).
#[derive(Debug, Clone)]
pub struct FugueParams {
    pub seed: u64,
    pub subject_length: usize,
    pub num_voices: usize,
    pub stretto_overlap: f64,
    pub entry_gap_beats: Option<f64>,
    pub base_velocity: u8,
    pub velocity_range: u8,
    pub w_parallel: f64,
    pub w_contrary: f64,
    pub w_oblique: f64,
    pub degree_range: (i64, i64),
}

impl Default for FugueParams {
    fn default() -> Self {
        FugueParams {
            seed: 0,
            subject_length: 8,
            num_voices: 3,
            stretto_overlap: 0.5,
            entry_gap_beats: None,
            base_velocity: 90,
            velocity_range: 20,
            w_parallel: 0.2,
            w_contrary: 0.5,
            w_oblique: 0.3,
            degree_range: (-7, 14),
        }
    }
}

/// One voice's entry of the subject or answer within `render_fugue`'s
/// exposition, matching `fugue.py::Entry`.
#[derive(Debug, Clone)]
pub struct Entry {
    pub voice: usize,
    pub start_beat: f64,
    pub is_answer: bool,
    pub material: Phrase,
}
