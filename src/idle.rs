//! Idle Manager (spec §4.3): after a period of inactivity, smoothly fades
//! parameters toward an ambient profile. Grounded in
//! `original_source/rpi-engine/src/idle.py`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{panic_message, EngineError};
use crate::params::{ParamValue, ParameterStore};

#[derive(Debug, Clone)]
pub struct IdleProfile {
    pub name: String,
    pub values: Vec<(String, ParamValue)>,
}

fn profile(name: &str, values: &[(&str, ParamValue)]) -> IdleProfile {
    IdleProfile {
        name: name.to_string(),
        values: values.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
    }
}

/// Built-in ambient profiles, values reproduced verbatim from `idle.py`.
pub fn builtin_profiles() -> Vec<IdleProfile> {
    vec![
        profile(
            "slow_fade",
            &[
                ("density", ParamValue::Float(0.3)),
                ("bpm", ParamValue::Float(65.0)),
                ("scale_index", ParamValue::Int(2)),
                ("reverb_mix", ParamValue::Int(90)),
                ("filter_cutoff", ParamValue::Int(40)),
                ("master_volume", ParamValue::Int(60)),
            ],
        ),
        profile(
            "minimal",
            &[
                ("density", ParamValue::Float(0.15)),
                ("bpm", ParamValue::Float(50.0)),
                ("scale_index", ParamValue::Int(2)),
                ("reverb_mix", ParamValue::Int(100)),
                ("swing", ParamValue::Float(0.05)),
                ("master_volume", ParamValue::Int(40)),
            ],
        ),
        profile(
            "meditative",
            &[
                ("density", ParamValue::Float(0.4)),
                ("bpm", ParamValue::Float(72.0)),
                ("scale_index", ParamValue::Int(1)),
                ("reverb_mix", ParamValue::Int(80)),
                ("filter_cutoff", ParamValue::Int(30)),
                ("swing", ParamValue::Float(0.0)),
                ("master_volume", ParamValue::Int(50)),
            ],
        ),
    ]
}

fn find_profile(name: &str) -> Option<IdleProfile> {
    builtin_profiles().into_iter().find(|p| p.name == name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Transitioning,
    Idle,
}

struct Transition {
    start_values: Vec<(String, ParamValue)>,
    target: IdleProfile,
    started_at: Instant,
    duration: Duration,
}

#[derive(Debug, Clone)]
pub struct IdleStatus {
    pub is_idle: bool,
    pub is_transitioning: bool,
    pub time_since_last_interaction: Duration,
    pub time_to_idle: Option<Duration>,
    pub current_profile: Option<String>,
}

type Callback = Arc<dyn Fn(bool) + Send + Sync>;

pub struct IdleManager {
    state: Arc<ParameterStore>,
    timeout: Duration,
    transition_duration: Duration,
    ambient_profile: String,
    phase: Mutex<Phase>,
    last_interaction: Mutex<Instant>,
    transition: Mutex<Option<Transition>>,
    callbacks: Mutex<Vec<Callback>>,
}

impl IdleManager {
    pub fn new(
        state: Arc<ParameterStore>,
        timeout: Duration,
        transition_duration: Duration,
        ambient_profile: &str,
    ) -> Self {
        IdleManager {
            state,
            timeout,
            transition_duration,
            ambient_profile: ambient_profile.to_string(),
            phase: Mutex::new(Phase::Active),
            last_interaction: Mutex::new(Instant::now()),
            transition: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn add_callback(&self, callback: Callback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    pub fn is_idle(&self) -> bool {
        *self.phase.lock().unwrap() == Phase::Idle
    }

    pub fn is_transitioning(&self) -> bool {
        *self.phase.lock().unwrap() == Phase::Transitioning
    }

    /// Resets the inactivity timer and, if idle or transitioning, interrupts
    /// the idle mode without restoring prior values, matching
    /// `_interrupt_idle_mode`.
    pub fn touch(&self) {
        *self.last_interaction.lock().unwrap() = Instant::now();
        let mut phase = self.phase.lock().unwrap();
        let was_idle = *phase == Phase::Idle;
        let was_transitioning = *phase == Phase::Transitioning;
        if was_idle || was_transitioning {
            *phase = Phase::Active;
            *self.transition.lock().unwrap() = None;
            drop(phase);
            if was_idle {
                self.fire_callbacks(false);
            }
        }
    }

    pub fn force_idle(&self) {
        self.begin_idle_transition();
    }

    pub fn force_active(&self) {
        self.touch();
    }

    /// Called on a regular tick from the engine loop; begins, advances, or
    /// completes an idle transition as time passes.
    pub fn update(&self) {
        let elapsed = self.last_interaction.lock().unwrap().elapsed();
        let phase = *self.phase.lock().unwrap();

        match phase {
            Phase::Active => {
                if elapsed >= self.timeout {
                    self.begin_idle_transition();
                }
            }
            Phase::Transitioning => self.advance_transition(),
            Phase::Idle => {}
        }
    }

    fn begin_idle_transition(&self) {
        let target = match find_profile(&self.ambient_profile) {
            Some(p) => p,
            None => {
                log::warn!("unknown idle profile '{}'; staying active", self.ambient_profile);
                return;
            }
        };
        let start_values: Vec<(String, ParamValue)> = target
            .values
            .iter()
            .map(|(name, _)| (name.clone(), self.state.get(name, ParamValue::Float(0.0))))
            .collect();

        *self.transition.lock().unwrap() = Some(Transition {
            start_values,
            target,
            started_at: Instant::now(),
            duration: self.transition_duration,
        });
        *self.phase.lock().unwrap() = Phase::Transitioning;
        log::debug!("idle transition started toward '{}'", self.ambient_profile);
    }

    fn advance_transition(&self) {
        let progress = {
            let transition = self.transition.lock().unwrap();
            let transition = match transition.as_ref() {
                Some(t) => t,
                None => return,
            };
            let elapsed = transition.started_at.elapsed().as_secs_f64();
            let duration = transition.duration.as_secs_f64().max(f64::EPSILON);
            (elapsed / duration).min(1.0)
        };

        if progress >= 1.0 {
            self.complete_idle_transition();
            return;
        }

        let transition = self.transition.lock().unwrap();
        let transition = transition.as_ref().unwrap();
        for (name, start) in &transition.start_values {
            let target_value = transition
                .target
                .values
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .unwrap();

            let interpolated = match (start.as_f64(), target_value.as_f64()) {
                (Some(s), Some(t)) => {
                    let v = s + (t - s) * progress;
                    if matches!(target_value, ParamValue::Int(_)) {
                        ParamValue::Int(v.round() as i64)
                    } else {
                        ParamValue::Float(v)
                    }
                }
                _ => {
                    if progress >= 0.5 {
                        target_value
                    } else {
                        start.clone()
                    }
                }
            };
            self.state.set(name, interpolated, "idle_transition");
        }
    }

    fn complete_idle_transition(&self) {
        let transition = self.transition.lock().unwrap().take();
        if let Some(transition) = transition {
            for (name, value) in &transition.target.values {
                self.state.set(name, value.clone(), "idle");
            }
        }
        *self.phase.lock().unwrap() = Phase::Idle;
        drop(self.transition.lock().unwrap());
        self.fire_callbacks(true);
        log::info!("entered idle profile '{}'", self.ambient_profile);
    }

    fn fire_callbacks(&self, is_idle: bool) {
        let callbacks: Vec<Callback> = self.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(is_idle))) {
                let message = panic_message(&payload);
                log::error!("{}", EngineError::CallbackError(message));
            }
        }
    }

    pub fn status(&self) -> IdleStatus {
        let phase = *self.phase.lock().unwrap();
        let elapsed = self.last_interaction.lock().unwrap().elapsed();
        let time_to_idle = if phase == Phase::Active {
            Some(self.timeout.saturating_sub(elapsed))
        } else {
            None
        };
        IdleStatus {
            is_idle: phase == Phase::Idle,
            is_transitioning: phase == Phase::Transitioning,
            time_since_last_interaction: elapsed,
            time_to_idle,
            current_profile: if phase == Phase::Active {
                None
            } else {
                Some(self.ambient_profile.clone())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn touch_resets_timer_and_stays_active() {
        let store = Arc::new(ParameterStore::new());
        let manager = IdleManager::new(
            store,
            Duration::from_secs(600),
            Duration::from_millis(10),
            "minimal",
        );
        manager.touch();
        assert!(!manager.is_idle());
        assert!(!manager.is_transitioning());
    }

    #[test]
    fn force_idle_begins_transition_then_completes() {
        let store = Arc::new(ParameterStore::new());
        let manager = IdleManager::new(
            store.clone(),
            Duration::from_secs(600),
            Duration::from_millis(5),
            "minimal",
        );
        manager.force_idle();
        assert!(manager.is_transitioning());
        std::thread::sleep(Duration::from_millis(20));
        manager.update();
        assert!(manager.is_idle());
        assert_eq!(store.get_f64("bpm", 0.0), 50.0);
    }

    #[test]
    fn interrupt_fires_callback_only_when_was_idle() {
        let store = Arc::new(ParameterStore::new());
        let manager = IdleManager::new(
            store,
            Duration::from_secs(600),
            Duration::from_millis(5),
            "minimal",
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        manager.add_callback(Arc::new(move |_is_idle| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        manager.touch();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        manager.force_idle();
        std::thread::sleep(Duration::from_millis(20));
        manager.update();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        manager.touch();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn interrupting_a_transitioning_idle_mode_does_not_fire_callback() {
        let store = Arc::new(ParameterStore::new());
        let manager = IdleManager::new(
            store,
            Duration::from_secs(600),
            Duration::from_millis(5000),
            "minimal",
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        manager.add_callback(Arc::new(move |_is_idle| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        manager.force_idle();
        assert!(manager.is_transitioning());
        manager.touch();
        assert_eq!(calls.load(Ordering::SeqCst), 0, "touch during transitioning must not fire the leave-idle callback");
        assert!(!manager.is_transitioning());
        assert!(!manager.is_idle());
    }

    #[test]
    fn a_panicking_callback_does_not_block_later_callbacks() {
        let store = Arc::new(ParameterStore::new());
        let manager = IdleManager::new(
            store,
            Duration::from_secs(600),
            Duration::from_millis(5),
            "minimal",
        );
        manager.add_callback(Arc::new(|_is_idle| panic!("callback boom")));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        manager.add_callback(Arc::new(move |_is_idle| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        manager.force_idle();
        std::thread::sleep(Duration::from_millis(20));
        manager.update();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_profile_name_is_rejected_without_panicking() {
        let store = Arc::new(ParameterStore::new());
        let manager = IdleManager::new(
            store,
            Duration::from_secs(600),
            Duration::from_millis(5),
            "nonexistent",
        );
        manager.force_idle();
        assert!(!manager.is_transitioning());
    }
}
