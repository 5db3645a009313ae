//! Built-in step-pattern, probability, and direction presets (spec §6),
//! reproduced verbatim from
//! `original_source/rpi-engine/src/sequencer.py::get_pattern_preset` and
//! `get_probability_preset`.

use rand::Rng;

pub fn pattern_preset(name: &str, length: usize) -> Option<Vec<bool>> {
    let pattern: &[bool] = match name {
        "four_on_floor" => &[true, false, false, false, true, false, false, false],
        "offbeat" => &[false, true, false, true, false, true, false, true],
        "every_other" => &[true, false, true, false, true, false, true, false],
        "syncopated" => &[true, false, true, true, false, true, false, false],
        "dense" => &[true, true, false, true, true, false, true, true],
        "sparse" => &[true, false, false, false, false, false, true, false],
        "all_on" => return Some(vec![true; length]),
        "all_off" => return Some(vec![false; length]),
        _ => return None,
    };
    Some((0..length).map(|i| pattern[i % pattern.len()]).collect())
}

pub fn probability_preset(
    name: &str,
    length: usize,
    rng: &mut impl Rng,
) -> Option<Vec<f64>> {
    if length == 0 {
        return Some(Vec::new());
    }
    let values = match name {
        "uniform" => vec![0.9; length],
        "crescendo" => (0..length)
            .map(|i| 0.3 + 0.6 * (i as f64 / (length - 1).max(1) as f64))
            .collect(),
        "diminuendo" => (0..length)
            .map(|i| 0.9 - 0.6 * (i as f64 / (length - 1).max(1) as f64))
            .collect(),
        "peaks" => (0..length)
            .map(|i| if i % 4 == 0 { 0.9 } else { 0.4 })
            .collect(),
        "valleys" => (0..length)
            .map(|i| if i % 4 == 0 { 0.3 } else { 0.8 })
            .collect(),
        "random_low" => (0..length).map(|_| rng.gen_range(0.2..0.6)).collect(),
        "random_high" => (0..length).map(|_| rng.gen_range(0.6..1.0)).collect(),
        "alternating" => (0..length)
            .map(|i| if i % 2 == 0 { 0.9 } else { 0.3 })
            .collect(),
        _ => return None,
    };
    Some(values)
}

pub fn available_direction_presets() -> &'static [&'static str] {
    &["forward", "backward", "ping_pong", "random", "fugue"]
}

pub fn available_pattern_presets() -> &'static [&'static str] {
    &[
        "four_on_floor",
        "offbeat",
        "every_other",
        "syncopated",
        "dense",
        "sparse",
        "all_on",
        "all_off",
    ]
}

pub fn available_probability_presets() -> &'static [&'static str] {
    &[
        "uniform",
        "crescendo",
        "diminuendo",
        "peaks",
        "valleys",
        "random_low",
        "random_high",
        "alternating",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn four_on_floor_matches_source_table() {
        let pattern = pattern_preset("four_on_floor", 8).unwrap();
        assert_eq!(
            pattern,
            vec![true, false, false, false, true, false, false, false]
        );
    }

    #[test]
    fn pattern_repeats_over_length() {
        let pattern = pattern_preset("offbeat", 10).unwrap();
        assert_eq!(pattern.len(), 10);
        assert_eq!(pattern[8], false);
        assert_eq!(pattern[9], true);
    }

    #[test]
    fn unknown_pattern_returns_none() {
        assert!(pattern_preset("nonexistent", 8).is_none());
    }

    #[test]
    fn peaks_probability_spikes_every_fourth_step() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let probs = probability_preset("peaks", 8, &mut rng).unwrap();
        assert_eq!(probs[0], 0.9);
        assert_eq!(probs[1], 0.4);
        assert_eq!(probs[4], 0.9);
    }

    #[test]
    fn random_low_stays_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let probs = probability_preset("random_low", 16, &mut rng).unwrap();
        assert!(probs.iter().all(|p| (0.2..0.6).contains(p)));
    }
}
