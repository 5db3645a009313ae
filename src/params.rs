//! Observable parameter store (spec §4.1).
//!
//! Writes are validated and clamped against the domain table in spec §3,
//! then fanned out to listeners in registration order. The store uses a
//! plain `std::sync::Mutex` rather than a reentrant one: per spec §9's
//! Design Notes ("in implementations without reentrant locks, copy the
//! listener list under the lock and invoke outside"), the map mutation and
//! the listener dispatch are two separate critical sections, so a listener
//! that calls back into `set` does not deadlock and re-enters the same
//! logical serialization point.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::error::{panic_message, EngineError};

/// A dynamically typed parameter value. Unknown parameter names are still
/// accepted and stored (spec §4.1, "Unknown parameters are accepted").
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    /// A named member of a string-enumerated domain, e.g. `direction_pattern`.
    Enum(String),
    FloatList(Vec<f64>),
    BoolList(Vec<bool>),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&str> {
        match self {
            ParamValue::Enum(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_float_list(&self) -> Option<&[f64]> {
        match self {
            ParamValue::FloatList(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_bool_list(&self) -> Option<&[bool]> {
        match self {
            ParamValue::BoolList(v) => Some(v.as_slice()),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Enum(v) => write!(f, "{v}"),
            ParamValue::FloatList(v) => write!(f, "{v:?}"),
            ParamValue::BoolList(v) => write!(f, "{v:?}"),
        }
    }
}

/// A single parameter write, tagged with its originating source (spec §3).
#[derive(Debug, Clone)]
pub struct StateChange {
    pub parameter: String,
    pub old_value: Option<ParamValue>,
    pub new_value: ParamValue,
    pub timestamp: SystemTime,
    pub source: String,
}

pub type Listener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Opaque handle returned by `add_listener`, used to `remove_listener` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Subscription {
    id: ListenerId,
    listener: Listener,
}

pub struct ParameterStore {
    values: Mutex<HashMap<String, ParamValue>>,
    listeners: Mutex<Vec<Subscription>>,
    next_listener_id: AtomicU64,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterStore {
    pub fn new() -> Self {
        let store = ParameterStore {
            values: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
        };
        store.init_defaults();
        store
    }

    fn init_defaults(&self) {
        let defaults: &[(&str, ParamValue)] = &[
            ("bpm", ParamValue::Float(110.0)),
            ("swing", ParamValue::Float(0.12)),
            ("density", ParamValue::Float(0.85)),
            ("note_probability", ParamValue::Float(0.9)),
            ("sequence_length", ParamValue::Int(8)),
            ("scale_index", ParamValue::Int(0)),
            ("root_note", ParamValue::Int(60)),
            ("gate_length", ParamValue::Float(0.8)),
            ("base_velocity", ParamValue::Int(80)),
            ("velocity_range", ParamValue::Int(40)),
            ("direction_pattern", ParamValue::Enum("forward".into())),
            ("voices", ParamValue::Int(3)),
            ("step_position", ParamValue::Int(0)),
            ("smooth_idle_transitions", ParamValue::Bool(true)),
            ("idle_transition_duration_s", ParamValue::Float(4.0)),
            ("drift", ParamValue::Float(0.0)),
            ("filter_cutoff", ParamValue::Int(64)),
            ("reverb_mix", ParamValue::Int(32)),
            ("master_volume", ParamValue::Int(100)),
            ("mode", ParamValue::Int(0)),
            ("palette", ParamValue::Int(0)),
        ];
        let mut values = self.values.lock().unwrap();
        for (name, value) in defaults {
            values.insert((*name).to_string(), value.clone());
        }
    }

    pub fn get(&self, name: &str, default: ParamValue) -> ParamValue {
        self.values
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or(default)
    }

    /// Like `get`, but distinguishes "parameter not present in the store"
    /// (`None`) from "present and equal to some default value" -- needed by
    /// callers (the mutation engine's candidate filter) that must skip a
    /// parameter rather than silently substitute a default for it.
    pub fn try_get(&self, name: &str) -> Option<ParamValue> {
        self.values.lock().unwrap().get(name).cloned()
    }

    pub fn get_f64(&self, name: &str, default: f64) -> f64 {
        self.get(name, ParamValue::Float(default))
            .as_f64()
            .unwrap_or(default)
    }

    pub fn get_i64(&self, name: &str, default: i64) -> i64 {
        self.get(name, ParamValue::Int(default))
            .as_i64()
            .unwrap_or(default)
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.get(name, ParamValue::Bool(default))
            .as_bool()
            .unwrap_or(default)
    }

    pub fn get_enum(&self, name: &str, default: &str) -> String {
        match self.values.lock().unwrap().get(name) {
            Some(ParamValue::Enum(v)) => v.clone(),
            _ => default.to_string(),
        }
    }

    /// Validates and clamps `value`, writes it if changed, and notifies
    /// listeners. Returns `false` on no-op (equal value) or a rejected
    /// write (logged at warn and ignored, spec §7 `InvalidParameterValue`).
    pub fn set(&self, name: &str, value: ParamValue, source: &str) -> bool {
        let validated = match validate_param(name, &value) {
            Some(v) => v,
            None => {
                log::warn!("rejected parameter write: {name}={value} (out of domain)");
                return false;
            }
        };

        let change = {
            let mut values = self.values.lock().unwrap();
            let old_value = values.get(name).cloned();
            if old_value.as_ref() == Some(&validated) {
                return false;
            }
            values.insert(name.to_string(), validated.clone());
            StateChange {
                parameter: name.to_string(),
                old_value,
                new_value: validated,
                timestamp: SystemTime::now(),
                source: source.to_string(),
            }
        };

        log::debug!(
            "state_change param={} old={:?} new={} source={}",
            change.parameter,
            change.old_value,
            change.new_value,
            change.source
        );

        // Listener list is copied under its own lock and invoked with no
        // lock held, so a listener that calls back into `set` (e.g. the
        // sequencer reacting to a `bpm` change) never deadlocks.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.listener.clone())
            .collect();
        for listener in listeners {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(&change))) {
                let message = panic_message(&payload);
                log::error!("{}", EngineError::CallbackError(message));
            }
        }
        true
    }

    pub fn update_multiple(&self, updates: Vec<(&str, ParamValue)>, source: &str) -> usize {
        updates
            .into_iter()
            .filter(|(name, value)| self.set(name, value.clone(), source))
            .count()
    }

    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap()
            .push(Subscription { id, listener });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().retain(|s| s.id != id);
    }

    pub fn get_all(&self) -> HashMap<String, ParamValue> {
        self.values.lock().unwrap().clone()
    }
}

/// Clamps/validates a single parameter write against the domain table in
/// spec §3. Numeric bounds for `drift`, `filter_cutoff`, `reverb_mix`,
/// `master_volume`, `mode`, and `palette` follow
/// `original_source/rpi-engine/src/state.py::_validate_param`, which spec
/// §3 leaves to "bounded integers/floats per §4.2" without spelling out.
fn validate_param(name: &str, value: &ParamValue) -> Option<ParamValue> {
    let clamp_f = |lo: f64, hi: f64| value.as_f64().map(|v| v.clamp(lo, hi));
    let clamp_i = |lo: i64, hi: i64| value.as_i64().map(|v| v.clamp(lo, hi));

    match name {
        "bpm" => clamp_f(1.0, 200.0).map(ParamValue::Float),
        "swing" => clamp_f(0.0, 0.5).map(ParamValue::Float),
        "density" => clamp_f(0.0, 1.0).map(ParamValue::Float),
        "note_probability" => clamp_f(0.0, 1.0).map(ParamValue::Float),
        "sequence_length" => clamp_i(1, 32).map(ParamValue::Int),
        "scale_index" => clamp_i(0, i64::MAX).map(ParamValue::Int),
        "root_note" => clamp_i(0, 127).map(ParamValue::Int),
        "gate_length" => clamp_f(0.1, 1.0).map(ParamValue::Float),
        "base_gate_length" => clamp_f(0.1, 1.0).map(ParamValue::Float),
        "gate_length_range" => clamp_f(0.0, 0.9).map(ParamValue::Float),
        "base_velocity" => clamp_i(1, 127).map(ParamValue::Int),
        "velocity_range" => clamp_i(0, 127).map(ParamValue::Int),
        "step_pattern" => match value {
            ParamValue::BoolList(_) => Some(value.clone()),
            _ => None,
        },
        "step_probabilities" => match value {
            ParamValue::FloatList(list) => Some(ParamValue::FloatList(
                list.iter().map(|p| p.clamp(0.0, 1.0)).collect(),
            )),
            _ => None,
        },
        "direction_pattern" => match value.as_enum() {
            Some(v) if matches!(v, "forward" | "backward" | "ping_pong" | "random" | "fugue") => {
                Some(value.clone())
            }
            _ => None,
        },
        "voices" => clamp_i(1, 4).map(ParamValue::Int),
        "step_position" => clamp_i(0, i64::MAX).map(ParamValue::Int),
        "smooth_idle_transitions" => value.as_bool().map(ParamValue::Bool),
        "idle_transition_duration_s" => clamp_f(0.0, f64::MAX).map(ParamValue::Float),
        "drift" => clamp_f(-0.2, 0.2).map(ParamValue::Float),
        "filter_cutoff" | "reverb_mix" | "master_volume" => clamp_i(0, 127).map(ParamValue::Int),
        "mode" | "palette" => clamp_i(0, 7).map(ParamValue::Int),
        _ => {
            log::debug!("unknown parameter '{name}', storing as-is");
            Some(value.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn set_clamps_and_reports_change() {
        let store = ParameterStore::new();
        assert!(store.set("bpm", ParamValue::Float(500.0), "config"));
        assert_eq!(store.get_f64("bpm", 0.0), 200.0);
    }

    #[test]
    fn set_is_idempotent() {
        let store = ParameterStore::new();
        assert!(store.set("bpm", ParamValue::Float(140.0), "config"));
        assert!(!store.set("bpm", ParamValue::Float(140.0), "config"));
    }

    #[test]
    fn unknown_parameter_is_accepted() {
        let store = ParameterStore::new();
        assert!(store.set("plugin_knob", ParamValue::Float(0.5), "config"));
        assert_eq!(store.get_f64("plugin_knob", -1.0), 0.5);
    }

    #[test]
    fn invalid_direction_pattern_is_rejected() {
        let store = ParameterStore::new();
        assert!(!store.set(
            "direction_pattern",
            ParamValue::Enum("sideways".into()),
            "midi"
        ));
        assert_eq!(store.get_enum("direction_pattern", "forward"), "forward");
    }

    #[test]
    fn listeners_fire_in_registration_order_and_survive_panics() {
        let store = ParameterStore::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = order.clone();
        store.add_listener(Arc::new(move |_c: &StateChange| {
            order_a.lock().unwrap().push(1);
        }));

        store.add_listener(Arc::new(|_c: &StateChange| {
            panic!("listener boom");
        }));

        let order_c = order.clone();
        store.add_listener(Arc::new(move |_c: &StateChange| {
            order_c.lock().unwrap().push(3);
        }));

        store.set("bpm", ParamValue::Float(130.0), "config");
        assert_eq!(*order.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn reentrant_set_from_listener_does_not_deadlock() {
        let store = Arc::new(ParameterStore::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let store_clone = store.clone();
        let calls_clone = calls.clone();
        store.add_listener(Arc::new(move |change: &StateChange| {
            if change.parameter == "bpm" {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                store_clone.set("swing", ParamValue::Float(0.2), "sequencer");
            }
        }));

        store.set("bpm", ParamValue::Float(100.0), "config");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_f64("swing", 0.0), 0.2);
    }

    #[test]
    fn remove_listener_stops_future_notifications() {
        let store = ParameterStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let id = store.add_listener(Arc::new(move |_: &StateChange| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));
        store.set("bpm", ParamValue::Float(120.0), "config");
        store.remove_listener(id);
        store.set("bpm", ParamValue::Float(130.0), "config");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
