//! Scale Mapper (spec §4.5): turns scale-degree + octave pairs into MIDI
//! note numbers against a named scale and root note.

use crate::error::EngineError;

/// Built-in scales, reproduced from
/// `original_source/rpi-engine/src/scale_mapper.py::SCALES`.
const SCALES: &[(&str, &[i64])] = &[
    ("major", &[0, 2, 4, 5, 7, 9, 11]),
    ("minor", &[0, 2, 3, 5, 7, 8, 10]),
    ("pentatonic_major", &[0, 2, 4, 7, 9]),
    ("pentatonic_minor", &[0, 3, 5, 7, 10]),
    ("dorian", &[0, 2, 3, 5, 7, 9, 10]),
    ("locrian", &[0, 1, 3, 5, 6, 8, 10]),
    ("mixolydian", &[0, 2, 4, 5, 7, 9, 10]),
    ("blues", &[0, 3, 5, 6, 7, 10]),
    ("chromatic", &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
];

#[derive(Clone)]
pub struct ScaleMapper {
    scale_name: String,
    intervals: Vec<i64>,
    root_note: i64,
}

impl ScaleMapper {
    pub fn new(scale_name: &str, root_note: i64) -> Self {
        let intervals = scale_intervals(scale_name).unwrap_or_else(|| {
            log::warn!("unknown scale '{scale_name}' at construction, falling back to major");
            scale_intervals("major").unwrap()
        });
        ScaleMapper {
            scale_name: scale_name.to_string(),
            intervals,
            root_note,
        }
    }

    pub fn scale_name(&self) -> &str {
        &self.scale_name
    }

    pub fn root_note(&self) -> i64 {
        self.root_note
    }

    pub fn set_root_note(&mut self, root_note: i64) {
        self.root_note = root_note.clamp(0, 127);
    }

    pub fn set_scale(&mut self, scale_name: &str) -> Result<(), EngineError> {
        match scale_intervals(scale_name) {
            Some(intervals) => {
                self.intervals = intervals;
                self.scale_name = scale_name.to_string();
                Ok(())
            }
            None => Err(EngineError::InvalidScale(scale_name.to_string())),
        }
    }

    pub fn available_scales() -> Vec<&'static str> {
        SCALES.iter().map(|(name, _)| *name).collect()
    }

    /// Maps a (possibly negative) scale degree and octave offset to a MIDI
    /// note number, clamped to `0..=127`. Degrees outside `0..len` wrap into
    /// neighboring octaves, matching
    /// `root + intervals[degree % len] + 12 * (octave + degree // len)`
    /// from `scale_mapper.py`. Rust's `%`/`/` truncate toward zero and can
    /// return a negative remainder for negative degrees (the fugue
    /// generator produces degrees as low as -7), so `rem_euclid`/
    /// `div_euclid` are used here instead to match Python's floor semantics.
    pub fn get_note(&self, degree: i64, octave: i64) -> u8 {
        let len = self.intervals.len() as i64;
        let interval = self.intervals[degree.rem_euclid(len) as usize];
        let octave_offset = octave + degree.div_euclid(len);
        let note = self.root_note + interval + 12 * octave_offset;
        note.clamp(0, 127) as u8
    }

    /// Returns `n` consecutive scale degrees starting at `start_degree`,
    /// all at `octave`. A thin convenience wrapper over repeated
    /// `get_note` calls, matching `scale_mapper.py`'s `get_notes`.
    pub fn get_notes(&self, n: usize, start_degree: i64, octave: i64) -> Vec<u8> {
        (0..n as i64)
            .map(|i| self.get_note(start_degree + i, octave))
            .collect()
    }
}

fn scale_intervals(name: &str) -> Option<Vec<i64>> {
    SCALES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, intervals)| intervals.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_scale_degree_zero_is_root() {
        let mapper = ScaleMapper::new("major", 60);
        assert_eq!(mapper.get_note(0, 0), 60);
    }

    #[test]
    fn major_scale_wraps_into_next_octave() {
        let mapper = ScaleMapper::new("major", 60);
        // degree 7 == one full octave above degree 0
        assert_eq!(mapper.get_note(7, 0), 72);
    }

    #[test]
    fn negative_degree_wraps_into_lower_octave() {
        let mapper = ScaleMapper::new("major", 60);
        // degree -1 is the 7th scale step, one octave down: 60 + 11 - 12 = 59
        assert_eq!(mapper.get_note(-1, 0), 59);
    }

    #[test]
    fn note_is_clamped_to_midi_range() {
        let mapper = ScaleMapper::new("major", 120);
        assert_eq!(mapper.get_note(20, 2), 127);
    }

    #[test]
    fn set_scale_rejects_unknown_name() {
        let mut mapper = ScaleMapper::new("major", 60);
        assert!(mapper.set_scale("atonal").is_err());
        assert_eq!(mapper.scale_name(), "major");
    }

    #[test]
    fn get_notes_returns_consecutive_degrees() {
        let mapper = ScaleMapper::new("pentatonic_major", 60);
        let notes = mapper.get_notes(3, 0, 0);
        assert_eq!(notes, vec![60, 62, 64]);
    }
}
