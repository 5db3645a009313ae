//! Subject/answer/episode/stretto generation and full-score assembly,
//! matching `fugue.py::FugueEngine` section for section.

use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::transform::{invert, retrograde, slice_by_time, time_scale, transpose};
use super::{Entry, FugueParams, Note, Phrase, Score};
use crate::error::EngineError;
use crate::scale::ScaleMapper;

const RHYTHM_PATTERNS: &[&[f64]] = &[
    &[1.0, 1.0, 1.0, 1.0],
    &[0.5, 0.5, 1.0, 1.0, 1.0],
    &[1.0, 0.5, 0.5, 1.0, 1.0],
    &[0.5, 0.5, 0.5, 0.5, 1.0, 1.0],
];

/// Rest masks, one per length bucket the rhythm patterns above can
/// produce; `true` marks a rest at that position, matching `fugue.py`'s
/// `REST_PATTERNS` table.
const REST_PATTERNS: &[&[bool]] = &[
    &[false, false, true, false],
    &[false, true, false, false, false],
    &[false, false, false, true, false],
    &[false, false, true, false, false, false],
];

pub struct FugueEngine {
    seed: u64,
    params: FugueParams,
    scale: ScaleMapper,
}

impl FugueEngine {
    pub fn new(params: FugueParams, scale: ScaleMapper) -> Self {
        FugueEngine {
            seed: params.seed,
            params,
            scale,
        }
    }

    /// Re-seeds a fresh generator from the fugue's own seed on every call,
    /// matching `fugue.py`'s `random.seed(self._seed)` at the top of
    /// `generate_subject` -- the same seed always yields the same subject.
    fn seeded_rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed)
    }

    /// Converts a scale degree to a MIDI pitch via the scale mapper,
    /// matching `generate_subject`'s `try/except` around
    /// `scale_mapper.get_note`: on failure, falls back to a whole-tone
    /// approximation (`root_note + degree * 2`) and reports
    /// `FugueGenerationError` rather than propagating the panic.
    fn degree_to_pitch(&self, degree: i64) -> i64 {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.scale.get_note(degree, 0))) {
            Ok(pitch) => pitch as i64,
            Err(_) => {
                let err = EngineError::FugueGenerationError(format!(
                    "scale mapping failed for degree {degree}, falling back to whole-tone approximation"
                ));
                log::warn!("{err}");
                self.scale.root_note() + degree * 2
            }
        }
    }

    pub fn generate_subject(&self) -> Phrase {
        let mut rng = self.seeded_rng();
        let rhythm_index = rng.gen_range(0..RHYTHM_PATTERNS.len());
        let rhythm = RHYTHM_PATTERNS[rhythm_index];
        let (lo, hi) = self.params.degree_range;

        let start_degree = if rng.gen_bool(0.5) { 0i64 } else { 4i64 };
        let mut degrees = vec![start_degree];
        let mut last_direction = 0i64;
        let mut consecutive_same_leap = 0u32;

        for _ in 1..rhythm.len() {
            let roll: f64 = rng.gen_range(0.0..1.0);
            let interval: i64 = if roll < 0.6 {
                if rng.gen_bool(0.5) { 1 } else { -1 }
            } else if roll < 0.9 {
                *[2i64, -2, 3, -3].get(rng.gen_range(0..4)).unwrap()
            } else {
                *[4i64, -4, 5, -5].get(rng.gen_range(0..4)).unwrap()
            };

            let direction = interval.signum();
            let is_leap = interval.abs() > 1;
            if is_leap && direction == last_direction && consecutive_same_leap >= 2 {
                degrees.push((*degrees.last().unwrap() - direction).clamp(lo, hi));
                consecutive_same_leap = 0;
                last_direction = -direction;
                continue;
            }
            if is_leap && direction == last_direction {
                consecutive_same_leap += 1;
            } else {
                consecutive_same_leap = 0;
            }
            last_direction = direction;

            let next = (*degrees.last().unwrap() + interval).clamp(lo, hi);
            degrees.push(next);
        }

        // 30% chance to silence selected notes with a fixed rest mask the
        // same length as the rhythm, matching `fugue.py`'s rest injection.
        let rest_mask = REST_PATTERNS
            .get(rhythm_index)
            .filter(|_| rng.gen_bool(0.3));

        let mut start = 0.0;
        let mut phrase = Vec::with_capacity(rhythm.len());
        for (i, (degree, duration)) in degrees.into_iter().zip(rhythm.iter()).enumerate() {
            let is_rest = rest_mask.map(|mask| mask.get(i).copied().unwrap_or(false)).unwrap_or(false);
            phrase.push(Note {
                pitch: if is_rest { None } else { Some(self.degree_to_pitch(degree)) },
                duration_beats: *duration,
                start_beat: start,
                velocity: if is_rest { 0 } else { self.params.base_velocity },
            });
            start += duration;
        }
        phrase
    }

    /// Tonal answer: transposes the subject up a perfect fifth (+7
    /// semitones); if the subject's first two non-rest pitches themselves
    /// form that same fifth (tonic to dominant), the corresponding answer
    /// note is rewritten to a fourth above the answer's opening pitch
    /// instead, matching `tonal_answer`'s dux-comes correction.
    pub fn tonal_answer(&self, subject: &Phrase) -> Phrase {
        let mut answer = transpose(subject, 7);
        let non_rest: Vec<(usize, i64)> = subject
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.pitch.map(|p| (i, p)))
            .collect();
        if non_rest.len() >= 2 {
            let (idx0, p0) = non_rest[0];
            let (idx1, p1) = non_rest[1];
            if p1 - p0 == 7 {
                let answer_p0 = answer[idx0].pitch.unwrap();
                answer[idx1].pitch = Some(answer_p0 + 5);
            }
        }
        answer
    }

    pub fn real_answer(&self, subject: &Phrase) -> Phrase {
        transpose(subject, 7)
    }

    /// Builds voice entry times: even voices restate the subject, odd
    /// voices answer, each delayed by `entry_gap_beats` (default: subject
    /// length scaled by `1 - stretto_overlap`), matching `make_entry_plan`.
    pub fn make_entry_plan(&self, subject: &Phrase, answer: &Phrase) -> Vec<Entry> {
        let subject_length: f64 = subject.iter().map(|n| n.duration_beats).sum();
        let gap = self
            .params
            .entry_gap_beats
            .unwrap_or(subject_length * (1.0 - self.params.stretto_overlap));

        (0..self.params.num_voices)
            .map(|voice| {
                let is_answer = voice % 2 == 1;
                let material = if is_answer { answer.clone() } else { subject.clone() };
                let start_beat = voice as f64 * gap;
                Entry {
                    voice,
                    start_beat,
                    is_answer,
                    material: offset_start(&material, start_beat),
                }
            })
            .collect()
    }

    /// Builds a connective episode from fragments of the subject, matching
    /// `generate_episode`'s sequence-pattern-driven development.
    pub fn generate_episode(&self, subject: &Phrase, start_beat: f64, rng: &mut impl Rng) -> Phrase {
        const SEQUENCE_PATTERN: &[i64] = &[0, -3, 2, 7, 0, -5, 2];
        let subject_length: f64 = subject.iter().map(|n| n.duration_beats).sum();

        let fragment = best_variety_fragment(subject, subject_length);
        let mut cursor = start_beat;
        let mut result = Vec::new();

        for (i, shift) in SEQUENCE_PATTERN.iter().enumerate() {
            let mut piece = transpose(&fragment, *shift);
            if i % 3 == 1 {
                piece = time_scale(&piece, 0.75);
            } else if i % 4 == 3 {
                piece = time_scale(&piece, 1.25);
            }
            let piece = offset_start(&piece, cursor - piece.first().map(|n| n.start_beat).unwrap_or(0.0));
            let piece_length: f64 = piece.iter().map(|n| n.duration_beats).sum();
            cursor += piece_length;
            result.extend(piece);

            if i + 1 < SEQUENCE_PATTERN.len() {
                if rng.gen_bool(0.25) {
                    result.push(Note::rest(0.25, cursor));
                } else {
                    let connecting_pitch = result
                        .iter()
                        .rev()
                        .find_map(|n| n.pitch)
                        .unwrap_or(self.scale.root_note());
                    result.push(Note {
                        pitch: Some(connecting_pitch + rng.gen_range(-2..=2)),
                        duration_beats: 0.25,
                        start_beat: cursor,
                        velocity: self.params.base_velocity,
                    });
                }
                cursor += 0.25;
            }
        }
        result
    }

    /// Builds a free countersubject against the subject: rhythm choice
    /// depends on whether the subject's average note duration exceeds
    /// 0.75 beats, matching `generate_countersubject`.
    pub fn generate_countersubject(&self, subject: &Phrase, start_beat: f64, rng: &mut impl Rng) -> Phrase {
        let avg_duration = if subject.is_empty() {
            1.0
        } else {
            subject.iter().map(|n| n.duration_beats).sum::<f64>() / subject.len() as f64
        };
        let rhythm: &[f64] = if avg_duration > 0.75 {
            &[0.5, 0.5, 0.5, 0.5, 1.0, 1.0]
        } else {
            &[1.0, 1.0, 1.0, 1.0]
        };

        let mut degree = 2i64;
        let mut cursor = start_beat;
        let mut phrase = Vec::with_capacity(rhythm.len());
        for (i, duration) in rhythm.iter().enumerate() {
            let is_rest = rng.gen_bool(0.15);
            phrase.push(Note {
                pitch: if is_rest { None } else { Some(self.degree_to_pitch(degree)) },
                duration_beats: *duration,
                start_beat: cursor,
                velocity: if is_rest { 0 } else { self.params.base_velocity.saturating_sub(10) },
            });
            cursor += duration;
            degree += if i % 2 == 0 { -1 } else { 2 };
        }
        phrase
    }

    /// Spreads one episode across three voices at canonical offsets
    /// (+5, +7 semitones, and -3) with a two-beat canon delay, matching
    /// `distribute_episode_canonically`.
    pub fn distribute_episode_canonically(&self, episode: &Phrase) -> Vec<Phrase> {
        let voice0 = episode.clone();
        let voice1 = offset_start(&transpose(episode, 5), 2.0);
        let voice2 = offset_start(&transpose(episode, -3), 4.0);
        vec![voice0, voice1, voice2]
    }

    /// Up to four alternating subject/answer entries, with the third and
    /// fourth inverted around the subject's first (or first non-rest)
    /// pitch, matching `generate_stretto_section`'s `axis_pitch =
    /// subject[0]['pitch']`.
    pub fn generate_stretto_section(
        &self,
        subject: &Phrase,
        answer: &Phrase,
        start_beat: f64,
    ) -> Vec<Entry> {
        let subject_length: f64 = subject.iter().map(|n| n.duration_beats).sum();
        let gap = subject_length * self.params.stretto_overlap.max(0.1);
        let entry_count = self.params.num_voices.min(4);
        let axis = subject.iter().find_map(|n| n.pitch).unwrap_or(self.scale.root_note());

        (0..entry_count)
            .map(|i| {
                let is_answer = i % 2 == 1;
                let mut material = if is_answer { answer.clone() } else { subject.clone() };
                if i >= 2 {
                    material = invert(&material, axis);
                }
                let entry_start = start_beat + i as f64 * gap;
                Entry {
                    voice: i,
                    start_beat: entry_start,
                    is_answer,
                    material: offset_start(&material, entry_start),
                }
            })
            .collect()
    }

    /// Three simultaneous developments of a fragment: a transposed
    /// sequence, an inverted-and-delayed line (around the fragment's own
    /// first non-rest pitch, matching `generate_complex_episode`'s
    /// `axis_pitch = fragment1[0]['pitch']`), and a ×2 augmentation.
    pub fn generate_complex_episode(&self, subject: &Phrase, start_beat: f64) -> Vec<Phrase> {
        const KEY_SEQUENCE: &[i64] = &[0, 7, 2, -5, 0];
        let subject_length: f64 = subject.iter().map(|n| n.duration_beats).sum();
        let fragment = best_variety_fragment(subject, subject_length);

        let mut cursor = start_beat;
        let mut voice_a = Vec::new();
        for shift in KEY_SEQUENCE {
            let piece = offset_start(&transpose(&fragment, *shift), cursor);
            cursor += piece.iter().map(|n| n.duration_beats).sum::<f64>();
            voice_a.extend(piece);
        }

        let axis = fragment.iter().find_map(|n| n.pitch).unwrap_or(self.scale.root_note());
        let voice_b = offset_start(&retrograde(&invert(&fragment, axis)), start_beat + 2.0);
        let voice_c = offset_start(&time_scale(&fragment, 2.0), start_beat);

        vec![voice_a, voice_b, voice_c]
    }

    /// Dominant (one beat on degree 4) then tonic (two beats on degree 0),
    /// with a 20% chance of a preceding 0.5-beat rest and a 30% chance of a
    /// 0.25-beat rest between the two chords, matching `generate_cadence`.
    pub fn generate_cadence(&self, start_beat: f64, rng: &mut impl Rng) -> Phrase {
        let mut cursor = start_beat;
        let mut phrase = Vec::with_capacity(3);
        if rng.gen_bool(0.2) {
            phrase.push(Note::rest(0.5, cursor));
            cursor += 0.5;
        }
        phrase.push(Note {
            pitch: Some(self.degree_to_pitch(4)),
            duration_beats: 1.0,
            start_beat: cursor,
            velocity: self.params.base_velocity,
        });
        cursor += 1.0;
        if rng.gen_bool(0.3) {
            phrase.push(Note::rest(0.25, cursor));
            cursor += 0.25;
        }
        phrase.push(Note {
            pitch: Some(self.degree_to_pitch(0)),
            duration_beats: 2.0,
            start_beat: cursor,
            velocity: self.params.base_velocity,
        });
        phrase
    }

    /// Assembles a full fugue score: exposition, episode, related-key
    /// re-entries with mini-episodes, an optional stretto, a final complex
    /// episode, and a closing statement with countersubject and cadence,
    /// matching `render_fugue`'s section ordering.
    pub fn render_fugue(&self, rng: &mut impl Rng) -> Score {
        let subject = self.generate_subject();
        let answer = self.tonal_answer(&subject);
        let subject_length: f64 = subject.iter().map(|n| n.duration_beats).sum();

        let mut voices: Vec<Phrase> = vec![Vec::new(); self.params.num_voices];

        // Exposition.
        let exposition = self.make_entry_plan(&subject, &answer);
        let mut cursor = exposition
            .iter()
            .map(|e| e.start_beat + phrase_length(&e.material))
            .fold(0.0, f64::max);
        for entry in &exposition {
            voices[entry.voice].extend(entry.material.clone());
        }

        // First episode.
        let episode1 = self.generate_episode(&subject, cursor, rng);
        cursor += phrase_length(&episode1);
        distribute_across(&mut voices, self.distribute_episode_canonically(&episode1));

        // Related-key re-entries with mini-episodes between them.
        for key_shift in [7i64, -5, 2, -10] {
            let voice = (key_shift.unsigned_abs() as usize) % self.params.num_voices;
            let entry_material = offset_start(&transpose(&subject, key_shift), cursor);
            let entry_len = phrase_length(&entry_material);
            voices[voice].extend(entry_material);
            cursor += entry_len;

            let mini_episode = self.generate_episode(&subject, cursor, rng);
            cursor += phrase_length(&mini_episode);
            let target_voice = (voice + 1) % self.params.num_voices;
            voices[target_voice].extend(mini_episode);
        }

        // Stretto, if the configured overlap is tight enough to support it.
        if self.params.stretto_overlap > 0.1 {
            let stretto = self.generate_stretto_section(&subject, &answer, cursor);
            cursor = stretto
                .iter()
                .map(|e| e.start_beat + phrase_length(&e.material))
                .fold(cursor, f64::max);
            for entry in stretto {
                voices[entry.voice].extend(entry.material);
            }
        }

        // Final complex episode.
        let complex = self.generate_complex_episode(&subject, cursor);
        cursor += complex.iter().map(|v| phrase_length(v)).fold(0.0, f64::max);
        distribute_across(&mut voices, complex);

        // Final statement: subject plus countersubject, closed with a cadence.
        let final_subject = offset_start(&subject, cursor);
        voices[0].extend(final_subject);
        if self.params.num_voices > 1 {
            let countersubject = self.generate_countersubject(&subject, cursor, rng);
            voices[1].extend(countersubject);
        }
        cursor += subject_length;
        let cadence = self.generate_cadence(cursor, rng);
        cursor += phrase_length(&cadence);
        voices[0].extend(cadence);

        Score {
            voices,
            total_beats: cursor,
        }
    }

    pub fn params(&self) -> &FugueParams {
        &self.params
    }
}

fn phrase_length(phrase: &Phrase) -> f64 {
    phrase
        .iter()
        .map(|n| n.start_beat + n.duration_beats)
        .fold(0.0, f64::max)
        - phrase.first().map(|n| n.start_beat).unwrap_or(0.0)
}

fn offset_start(phrase: &Phrase, offset: f64) -> Phrase {
    phrase
        .iter()
        .map(|n| Note {
            start_beat: n.start_beat + offset,
            ..*n
        })
        .collect()
}

fn distribute_across(voices: &mut [Phrase], parts: Vec<Phrase>) {
    for (i, part) in parts.into_iter().enumerate() {
        let voice = i % voices.len();
        voices[voice].extend(part);
    }
}

/// Picks whichever of the subject's opening, middle, or closing third has
/// the most distinct pitches, matching `generate_episode`'s
/// fragment-candidate selection.
fn best_variety_fragment(subject: &Phrase, subject_length: f64) -> Phrase {
    let third = subject_length / 3.0;
    let candidates = [
        slice_by_time(subject, 0.0, third.max(0.5)),
        slice_by_time(subject, third, third.max(0.5)),
        slice_by_time(subject, 2.0 * third, third.max(0.5)),
    ];
    candidates
        .into_iter()
        .filter(|c| !c.is_empty())
        .max_by_key(|c| pitch_class_variety(c))
        .unwrap_or_else(|| subject.clone())
}

/// Count of distinct literal pitches in the phrase, matching
/// `generate_episode`'s `len(set(n['pitch'] for n in f))`.
fn pitch_class_variety(phrase: &Phrase) -> usize {
    let mut pitches: Vec<i64> = phrase.iter().filter_map(|n| n.pitch).collect();
    pitches.sort_unstable();
    pitches.dedup();
    pitches.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> FugueEngine {
        FugueEngine::new(
            FugueParams {
                seed: 7,
                ..FugueParams::default()
            },
            ScaleMapper::new("major", 60),
        )
    }

    #[test]
    fn same_seed_produces_same_subject() {
        let a = engine().generate_subject();
        let b = engine().generate_subject();
        assert_eq!(a, b);
    }

    #[test]
    fn subject_starts_on_tonic_or_dominant() {
        let subject = engine().generate_subject();
        // degree 0 or 4 in C major maps to MIDI pitch 60 or 64.
        assert!(matches!(subject[0].pitch, Some(60) | Some(64)));
    }

    #[test]
    fn tonal_answer_rewrites_the_opening_fifth_to_a_fourth() {
        let e = engine();
        let p = 60;
        let subject = vec![
            Note { pitch: Some(p), duration_beats: 1.0, start_beat: 0.0, velocity: 90 },
            Note { pitch: Some(p + 7), duration_beats: 1.0, start_beat: 1.0, velocity: 90 },
        ];
        let answer = e.tonal_answer(&subject);
        // Spec's testable property: (p, p+7) -> (p+7, p+12).
        assert_eq!(answer[0].pitch, Some(p + 7));
        assert_eq!(answer[1].pitch, Some(p + 12));
    }

    #[test]
    fn real_answer_transposes_every_pitch_up_a_fifth() {
        let e = engine();
        let subject = vec![
            Note { pitch: Some(60), duration_beats: 1.0, start_beat: 0.0, velocity: 90 },
            Note { pitch: Some(62), duration_beats: 1.0, start_beat: 1.0, velocity: 90 },
        ];
        let answer = e.real_answer(&subject);
        assert_eq!(answer[0].pitch, Some(67));
        assert_eq!(answer[1].pitch, Some(69));
    }

    #[test]
    fn tonal_answer_skips_rests_when_finding_the_first_two_pitches() {
        let e = engine();
        let p = 60;
        let subject = vec![
            Note::rest(0.5, 0.0),
            Note { pitch: Some(p), duration_beats: 1.0, start_beat: 0.5, velocity: 90 },
            Note { pitch: Some(p + 7), duration_beats: 1.0, start_beat: 1.5, velocity: 90 },
        ];
        let answer = e.tonal_answer(&subject);
        assert!(answer[0].is_rest());
        assert_eq!(answer[1].pitch, Some(p + 7));
        assert_eq!(answer[2].pitch, Some(p + 12));
    }

    #[test]
    fn entry_plan_alternates_subject_and_answer() {
        let e = engine();
        let subject = e.generate_subject();
        let answer = e.tonal_answer(&subject);
        let plan = e.make_entry_plan(&subject, &answer);
        assert_eq!(plan.len(), e.params().num_voices);
        assert!(!plan[0].is_answer);
        assert!(plan[1].is_answer);
    }

    #[test]
    fn render_fugue_produces_nonempty_voices_with_positive_duration() {
        let e = engine();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let score = e.render_fugue(&mut rng);
        assert_eq!(score.voices.len(), e.params().num_voices);
        assert!(score.voices.iter().any(|v| !v.is_empty()));
        assert!(score.total_beats > 0.0);
    }
}
