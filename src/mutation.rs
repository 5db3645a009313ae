//! Mutation Engine (spec §4.2): periodically nudges parameters by a small
//! random delta, weighted by rule and gated by idle state. Grounded in
//! `original_source/rpi-engine/src/mutation.py`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::{thread_rng, Rng};

use crate::params::{ParamValue, ParameterStore};

const MAX_HISTORY: usize = 100;

#[derive(Debug, Clone)]
pub struct MutationRule {
    pub parameter: String,
    pub weight: f64,
    pub delta_range: f64,
}

impl MutationRule {
    pub fn new(parameter: &str, weight: f64, delta_range: f64) -> Self {
        MutationRule {
            parameter: parameter.to_string(),
            weight,
            delta_range,
        }
    }

    /// Samples a delta in `[-delta_range, delta_range]` and adds it to
    /// `current`, matching `MutationRule.apply_delta`.
    pub fn apply_delta(&self, current: f64, rng: &mut impl Rng) -> f64 {
        current + rng.gen_range(-self.delta_range..=self.delta_range)
    }
}

/// Default rule set, reproduced verbatim from
/// `mutation.py::MutationEngine._init_default_rules`.
pub fn default_rules() -> Vec<MutationRule> {
    vec![
        MutationRule::new("bpm", 2.0, 5.0),
        MutationRule::new("swing", 1.5, 0.05),
        MutationRule::new("density", 3.0, 0.1),
        MutationRule::new("note_probability", 2.5, 0.05),
        MutationRule::new("root_note", 1.0, 2.0),
        MutationRule::new("filter_cutoff", 2.0, 10.0),
        MutationRule::new("reverb_mix", 1.5, 5.0),
        MutationRule::new("sequence_length", 1.0, 2.0),
        MutationRule::new("drift", 1.5, 0.05),
    ]
}

#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub parameter: String,
    pub old_value: f64,
    pub new_value: f64,
    pub delta: f64,
}

#[derive(Debug, Clone)]
pub struct MutationStats {
    pub total_mutations: usize,
    pub rules_count: usize,
    pub is_idle_gated: bool,
}

pub struct MutationEngine {
    state: Arc<ParameterStore>,
    rules: Mutex<Vec<MutationRule>>,
    history: Mutex<VecDeque<MutationEvent>>,
    /// True only while the wired `IdleManager` reports idle (spec §4.2:
    /// "no idle manager is wired" also leaves this `false`, i.e. disabled).
    mutations_enabled: Arc<AtomicBool>,
    total_mutations: Mutex<usize>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MutationEngine {
    pub fn new(state: Arc<ParameterStore>) -> Self {
        MutationEngine {
            state,
            rules: Mutex::new(default_rules()),
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
            mutations_enabled: Arc::new(AtomicBool::new(false)),
            total_mutations: Mutex::new(0),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Returns the shared flag an `IdleManager` callback should set to the
    /// current idle state, matching `set_idle_manager`/`_on_idle_state_change`.
    /// Mutation only proceeds while this is `true`.
    pub fn idle_gate_handle(&self) -> Arc<AtomicBool> {
        self.mutations_enabled.clone()
    }

    pub fn is_gated(&self) -> bool {
        !self.mutations_enabled.load(Ordering::SeqCst)
    }

    /// Adds a custom mutation rule, matching `add_rule`.
    pub fn add_rule(&self, rule: MutationRule) {
        log::debug!("mutation_rule_added parameter={} weight={}", rule.parameter, rule.weight);
        self.rules.lock().unwrap().push(rule);
    }

    /// Removes the rule for `parameter`, if one exists, matching `remove_rule`.
    pub fn remove_rule(&self, parameter: &str) -> bool {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter().position(|r| r.parameter == parameter) {
            Some(index) => {
                rules.remove(index);
                log::debug!("mutation_rule_removed parameter={parameter}");
                true
            }
            None => false,
        }
    }

    /// Starts the dedicated mutation-loop thread (spec §5's "Mutation
    /// loop"): sleeps in 1s increments and fires a gated cycle once a
    /// randomized interval in `[interval_min_s, interval_max_s]` elapses,
    /// matching `_mutation_thread`/`_schedule_next_mutation`.
    pub fn start(self: &Arc<Self>, interval_min_s: f64, interval_max_s: f64, max_changes: usize) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        let handle =
            thread::spawn(move || engine.mutation_loop(interval_min_s, interval_max_s, max_changes));
        *self.thread.lock().unwrap() = Some(handle);
        log::info!("mutation engine started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        log::info!("mutation engine stopped");
    }

    fn mutation_loop(&self, interval_min_s: f64, interval_max_s: f64, max_changes: usize) {
        let mut rng = thread_rng();
        let mut next_at = Instant::now() + next_interval(interval_min_s, interval_max_s, &mut rng);
        while self.running.load(Ordering::SeqCst) {
            if Instant::now() >= next_at {
                self.perform_cycle(max_changes, &mut rng);
                next_at = Instant::now() + next_interval(interval_min_s, interval_max_s, &mut rng);
            }
            thread::sleep(Duration::from_secs(1));
        }
    }

    /// Checks whether a mutation is due and performs one if so, matching
    /// `maybe_mutate` (intended for manual/main-loop triggering; the
    /// dedicated `start()` thread is the usual driver).
    pub fn maybe_mutate(&self, max_changes: usize, rng: &mut impl Rng) -> Vec<MutationEvent> {
        self.perform_cycle(max_changes, rng)
    }

    /// Forces a mutation cycle immediately, for testing/debugging, matching
    /// `force_mutation`. Still gated by idle state, exactly like
    /// `_perform_mutation_cycle` -- forcing only skips the scheduled-time
    /// check, never the idle gate.
    pub fn force_mutation(&self, max_changes: usize, rng: &mut impl Rng) -> Vec<MutationEvent> {
        self.perform_cycle(max_changes, rng)
    }

    fn perform_cycle(&self, max_changes: usize, rng: &mut impl Rng) -> Vec<MutationEvent> {
        if self.is_gated() {
            log::debug!("mutation_cycle_skipped reason=mutations_disabled");
            return Vec::new();
        }

        let count = rng.gen_range(1..=max_changes.max(1));
        let rules = self.select_rules(count, rng);
        let mut events = Vec::with_capacity(rules.len());
        for rule in rules {
            if let Some(event) = self.apply_rule(&rule, rng) {
                events.push(event);
            }
        }
        events
    }

    /// Selects up to `count` rules without replacement, weighted by
    /// `MutationRule.weight`, matching `_select_mutation_rules`. The
    /// candidate pool is first narrowed to rules whose parameter currently
    /// exists in the store (spec §4.2 step 2); a rule targeting a
    /// parameter that was never written is skipped here rather than
    /// surfacing later as a silent default-value mutation.
    fn select_rules(&self, count: usize, rng: &mut impl Rng) -> Vec<MutationRule> {
        let mut pool: Vec<MutationRule> = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                let exists = self.state.try_get(&r.parameter).is_some();
                if !exists {
                    log::warn!("mutation_rule_skipped parameter={} reason=not_in_store", r.parameter);
                }
                exists
            })
            .cloned()
            .collect();
        let mut chosen = Vec::with_capacity(count.min(pool.len()));
        for _ in 0..count.min(pool.len()) {
            let total_weight: f64 = pool.iter().map(|r| r.weight).sum();
            if total_weight <= 0.0 {
                break;
            }
            let mut pick = rng.gen_range(0.0..total_weight);
            let mut idx = 0;
            for (i, rule) in pool.iter().enumerate() {
                if pick < rule.weight {
                    idx = i;
                    break;
                }
                pick -= rule.weight;
            }
            chosen.push(pool.remove(idx));
        }
        chosen
    }

    fn apply_rule(&self, rule: &MutationRule, rng: &mut impl Rng) -> Option<MutationEvent> {
        let current = match self.state.try_get(&rule.parameter) {
            Some(v) => v,
            None => {
                log::warn!("mutation_rule_skipped parameter={} reason=not_in_store", rule.parameter);
                return None;
            }
        };
        let current_f = current.as_f64()?;
        let proposed = rule.apply_delta(current_f, rng);

        let new_value = if matches!(current, ParamValue::Int(_)) {
            ParamValue::Int(proposed.round() as i64)
        } else {
            ParamValue::Float(proposed)
        };

        if !self.state.set(&rule.parameter, new_value.clone(), "mutation") {
            return None;
        }

        let final_f = self
            .state
            .get(&rule.parameter, ParamValue::Float(current_f))
            .as_f64()
            .unwrap_or(current_f);
        let event = MutationEvent {
            parameter: rule.parameter.clone(),
            old_value: current_f,
            new_value: final_f,
            delta: final_f - current_f,
        };

        let mut history = self.history.lock().unwrap();
        if history.len() >= MAX_HISTORY {
            history.pop_front();
        }
        history.push_back(event.clone());
        *self.total_mutations.lock().unwrap() += 1;

        Some(event)
    }

    pub fn get_history(&self) -> Vec<MutationEvent> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    pub fn stats(&self) -> MutationStats {
        MutationStats {
            total_mutations: *self.total_mutations.lock().unwrap(),
            rules_count: self.rules.lock().unwrap().len(),
            is_idle_gated: self.is_gated(),
        }
    }
}

fn next_interval(min_s: f64, max_s: f64, rng: &mut impl Rng) -> Duration {
    let max_s = max_s.max(min_s);
    Duration::from_secs_f64(rng.gen_range(min_s..=max_s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn force_mutation_changes_at_least_one_parameter_while_idle() {
        let store = Arc::new(ParameterStore::new());
        let engine = MutationEngine::new(store.clone());
        engine.idle_gate_handle().store(true, Ordering::SeqCst);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let events = engine.force_mutation(3, &mut rng);
        assert!(!events.is_empty());
        assert!(events.len() <= 3);
    }

    #[test]
    fn force_mutation_is_gated_while_not_idle() {
        let store = Arc::new(ParameterStore::new());
        let engine = MutationEngine::new(store);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        assert!(engine.force_mutation(3, &mut rng).is_empty());
    }

    #[test]
    fn mutation_starts_gated_until_idle_manager_reports_idle() {
        let store = Arc::new(ParameterStore::new());
        let engine = MutationEngine::new(store);
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        // No idle manager has reported idle yet: engine starts disabled.
        assert!(engine.maybe_mutate(3, &mut rng).is_empty());

        engine.idle_gate_handle().store(true, Ordering::SeqCst);
        assert!(!engine.maybe_mutate(3, &mut rng).is_empty());

        engine.idle_gate_handle().store(false, Ordering::SeqCst);
        assert!(engine.maybe_mutate(3, &mut rng).is_empty());
    }

    #[test]
    fn history_is_capped_at_max() {
        let store = Arc::new(ParameterStore::new());
        let engine = MutationEngine::new(store);
        engine.idle_gate_handle().store(true, Ordering::SeqCst);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        for _ in 0..150 {
            engine.force_mutation(1, &mut rng);
        }
        assert!(engine.get_history().len() <= MAX_HISTORY);
    }

    #[test]
    fn stats_reflects_rule_count_and_gate() {
        let store = Arc::new(ParameterStore::new());
        let engine = MutationEngine::new(store);
        let stats = engine.stats();
        assert_eq!(stats.rules_count, default_rules().len());
        assert!(stats.is_idle_gated, "engine must start gated until idle is reported");
    }

    #[test]
    fn add_and_remove_rule_round_trip() {
        let store = Arc::new(ParameterStore::new());
        let engine = MutationEngine::new(store);
        let before = engine.stats().rules_count;
        engine.add_rule(MutationRule::new("master_volume", 1.0, 3.0));
        assert_eq!(engine.stats().rules_count, before + 1);
        assert!(engine.remove_rule("master_volume"));
        assert_eq!(engine.stats().rules_count, before);
        assert!(!engine.remove_rule("master_volume"));
    }

    #[test]
    fn rule_targeting_a_parameter_never_written_is_skipped_not_defaulted() {
        let store = Arc::new(ParameterStore::new());
        let engine = MutationEngine::new(store.clone());
        engine.idle_gate_handle().store(true, Ordering::SeqCst);
        engine.add_rule(MutationRule::new("unregistered_plugin_param", 100.0, 1.0));

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..20 {
            let events = engine.force_mutation(1, &mut rng);
            assert!(events.iter().all(|e| e.parameter != "unregistered_plugin_param"));
        }
        assert!(store.try_get("unregistered_plugin_param").is_none());
    }

    #[test]
    fn start_stop_is_idempotent() {
        let store = Arc::new(ParameterStore::new());
        let engine = Arc::new(MutationEngine::new(store));
        engine.start(0.01, 0.02, 2);
        engine.start(0.01, 0.02, 2);
        engine.stop();
        engine.stop();
    }
}
