//! Melodic transformations over a `Phrase`, matching `fugue.py`'s
//! `transpose`/`invert`/`retrograde`/`time_scale`/`slice_by_time`.

use super::Note;

pub fn transpose(phrase: &[Note], semitones: i64) -> Vec<Note> {
    phrase
        .iter()
        .map(|n| Note {
            pitch: n.pitch.map(|p| p + semitones),
            ..*n
        })
        .collect()
}

/// Mirrors the phrase's pitches around the caller-supplied `axis` (in
/// semitones): `pitch' = 2*axis - pitch`. Rests pass through unchanged.
/// `invert(invert(p, axis), axis) == p` for any axis.
pub fn invert(phrase: &[Note], axis: i64) -> Vec<Note> {
    phrase
        .iter()
        .map(|n| Note {
            pitch: n.pitch.map(|p| 2 * axis - p),
            ..*n
        })
        .collect()
}

/// Reverses the phrase in time, keeping each note's duration attached to
/// its (now reversed) position but recomputing start times so the phrase
/// still begins at beat 0.
pub fn retrograde(phrase: &[Note]) -> Vec<Note> {
    let mut reversed: Vec<Note> = phrase.iter().rev().cloned().collect();
    let mut cursor = 0.0;
    for note in reversed.iter_mut() {
        note.start_beat = cursor;
        cursor += note.duration_beats;
    }
    reversed
}

/// Scales every duration and start time by `factor` (diminution < 1.0,
/// augmentation > 1.0).
pub fn time_scale(phrase: &[Note], factor: f64) -> Vec<Note> {
    phrase
        .iter()
        .map(|n| Note {
            duration_beats: n.duration_beats * factor,
            start_beat: n.start_beat * factor,
            ..*n
        })
        .collect()
}

/// Returns the notes overlapping `[start, start + length)`, with start
/// times rebased to 0 at `start`. A note overlapping the boundary is kept
/// in whichever slice its onset falls into, matching the Python original's
/// overlap-inclusive slicing.
pub fn slice_by_time(phrase: &[Note], start: f64, length: f64) -> Vec<Note> {
    let end = start + length;
    phrase
        .iter()
        .filter(|n| n.start_beat >= start && n.start_beat < end)
        .map(|n| Note {
            start_beat: n.start_beat - start,
            ..*n
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(pitch: i64, start: f64, dur: f64) -> Note {
        Note {
            pitch: Some(pitch),
            start_beat: start,
            duration_beats: dur,
            velocity: 90,
        }
    }

    #[test]
    fn transpose_shifts_every_pitch() {
        let phrase = vec![note(60, 0.0, 1.0), note(62, 1.0, 1.0)];
        let result = transpose(&phrase, 7);
        assert_eq!(result[0].pitch, Some(67));
        assert_eq!(result[1].pitch, Some(69));
    }

    #[test]
    fn invert_mirrors_around_given_axis() {
        let phrase = vec![note(60, 0.0, 1.0), note(64, 1.0, 1.0)];
        let result = invert(&phrase, 60);
        assert_eq!(result[0].pitch, Some(60));
        assert_eq!(result[1].pitch, Some(56));
    }

    #[test]
    fn invert_is_its_own_inverse_around_any_axis() {
        let phrase = vec![note(55, 0.0, 1.0), note(71, 1.0, 1.0), note(48, 2.0, 0.5)];
        let axis = 66;
        let round_tripped = invert(&invert(&phrase, axis), axis);
        assert_eq!(round_tripped, phrase);
    }

    #[test]
    fn retrograde_reverses_order_and_rebases_time() {
        let phrase = vec![note(60, 0.0, 1.0), note(62, 1.0, 2.0)];
        let result = retrograde(&phrase);
        assert_eq!(result[0].pitch, Some(62));
        assert_eq!(result[0].start_beat, 0.0);
        assert_eq!(result[1].pitch, Some(60));
        assert_eq!(result[1].start_beat, 2.0);
    }

    #[test]
    fn time_scale_augments_durations() {
        let phrase = vec![note(60, 1.0, 1.0)];
        let result = time_scale(&phrase, 2.0);
        assert_eq!(result[0].start_beat, 2.0);
        assert_eq!(result[0].duration_beats, 2.0);
    }

    #[test]
    fn slice_by_time_keeps_notes_onset_in_range() {
        let phrase = vec![note(60, 0.0, 1.0), note(61, 1.0, 1.0), note(62, 2.0, 1.0)];
        let result = slice_by_time(&phrase, 1.0, 1.0);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].pitch, Some(61));
        assert_eq!(result[0].start_beat, 0.0);
    }

    #[test]
    fn transpose_and_invert_preserve_rests() {
        let phrase = vec![note(60, 0.0, 1.0), Note::rest(1.0, 1.0), note(64, 2.0, 1.0)];
        let transposed = transpose(&phrase, 7);
        assert!(transposed[1].is_rest());
        let inverted = invert(&phrase, 60);
        assert!(inverted[1].is_rest());
        assert_eq!(
            phrase.iter().filter(|n| n.is_rest()).count(),
            transposed.iter().filter(|n| n.is_rest()).count()
        );
    }
}
