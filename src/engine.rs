//! Top-level `Engine`: owns and wires every component, mirroring the
//! wiring role of `original_source/rpi-engine/src/main.py`'s `Application`
//! class minus its CLI/logging bootstrap (an external collaborator's job
//! per spec §1).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use midir::MidiOutput;
use rand::thread_rng;

use crate::clock::HighResClock;
use crate::config::EngineConfig;
use crate::idle::IdleManager;
use crate::mutation::MutationEngine;
use crate::note_off::NoteOffScheduler;
use crate::output::{MessageKind, MidiOutputGateway};
use crate::params::{ParamValue, ParameterStore};
use crate::sequencer::Sequencer;

pub struct Engine {
    pub state: Arc<ParameterStore>,
    pub sequencer: Arc<Sequencer>,
    pub mutation: Arc<MutationEngine>,
    pub idle: Arc<IdleManager>,
    pub output: Arc<MidiOutputGateway>,
    pub note_off: Arc<NoteOffScheduler>,
    clock: Arc<HighResClock>,
    config: EngineConfig,
    running: Arc<AtomicBool>,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let state = Arc::new(ParameterStore::new());
        state.set("bpm", ParamValue::Float(config.bpm), "config");
        state.set("swing", ParamValue::Float(config.swing), "config");
        state.set(
            "sequence_length",
            ParamValue::Int(config.sequence_length as i64),
            "config",
        );
        state.set("root_note", ParamValue::Int(config.root_note), "config");

        let sequencer = Sequencer::new(state.clone(), &config.scale_name, config.root_note);
        let mutation = Arc::new(MutationEngine::new(state.clone()));
        let idle = Arc::new(IdleManager::new(
            state.clone(),
            Duration::from_millis(config.idle.timeout_ms),
            Duration::from_millis(config.idle.fade_in_ms),
            &config.idle.ambient_profile,
        ));

        let idle_gate = mutation.idle_gate_handle();
        idle.add_callback(Arc::new(move |is_idle| {
            idle_gate.store(is_idle, Ordering::SeqCst);
        }));

        let connection = open_output_port(config.midi_port_name.as_deref());
        let output = MidiOutputGateway::new(connection, config.cc_throttle_ms);
        let note_off = NoteOffScheduler::new(output.clone());
        let clock = Arc::new(HighResClock::new(config.bpm, config.ppq, config.swing));
        sequencer.set_clock(clock.clone());

        Engine {
            state,
            sequencer,
            mutation,
            idle,
            output,
            note_off,
            clock,
            config,
            running: Arc::new(AtomicBool::new(false)),
            loop_thread: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.output.start();
        self.note_off.start();
        self.mutation.start(
            self.config.mutation.interval_min_s,
            self.config.mutation.interval_max_s,
            self.config.mutation.max_changes_per_cycle,
        );

        let mut rng = thread_rng();
        let initial_notes = self.sequencer.generate_initial_step(&mut rng);
        self.emit_notes(initial_notes);

        let tick_rx = self.clock.start();
        let engine = self.clone();
        let handle = thread::spawn(move || engine.run_loop(tick_rx));
        *self.loop_thread.lock().unwrap() = Some(handle);
        log::info!("engine started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.clock.stop();
        if let Some(handle) = self.loop_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.mutation.stop();
        self.note_off.stop();
        self.output.stop();
        log::info!("engine stopped");
    }

    pub fn touch(&self) {
        self.idle.touch();
    }

    fn run_loop(&self, tick_rx: std::sync::mpsc::Receiver<crate::clock::TickEvent>) {
        let mut rng = thread_rng();
        let ticks_per_step = (self.clock.ppq() / 4).max(1) as u64;

        while self.running.load(Ordering::SeqCst) {
            let tick = match tick_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(tick) => tick,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            };

            self.idle.update();
            self.sequencer.tick();

            if tick.tick_count % ticks_per_step == 0 {
                let notes = self.sequencer.advance_step(&mut rng);
                self.emit_notes(notes);
            }
        }
    }

    fn emit_notes(&self, notes: Vec<crate::sequencer::NoteEvent>) {
        for note in notes {
            let _ = self.output.send_immediate(
                self.config.midi_channel,
                MessageKind::NoteOn {
                    note: note.note,
                    velocity: note.velocity,
                },
            );
            self.note_off.schedule(
                note.note,
                self.config.midi_channel,
                Duration::from_secs_f64(note.gate_length_secs.max(0.0)),
            );
        }
    }
}

fn open_output_port(port_name: Option<&str>) -> Option<midir::MidiOutputConnection> {
    let midi_out = match MidiOutput::new("midi_loom") {
        Ok(out) => out,
        Err(err) => {
            log::error!("failed to initialize MIDI output: {err}");
            return None;
        }
    };

    let ports = midi_out.ports();
    let port = match port_name {
        Some(name) => ports.into_iter().find(|p| {
            midi_out
                .port_name(p)
                .map(|n| n == name)
                .unwrap_or(false)
        }),
        None => ports.into_iter().next(),
    };

    let port = match port {
        Some(p) => p,
        None => {
            log::warn!("no MIDI output port available; running without hardware output");
            return None;
        }
    };

    match midi_out.connect(&port, "midi_loom-out") {
        Ok(connection) => Some(connection),
        Err(err) => {
            log::error!("failed to connect to MIDI port: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_constructs_with_defaults() {
        let engine = Engine::new(EngineConfig::default());
        assert_eq!(engine.state.get_f64("bpm", 0.0), 110.0);
    }

    #[test]
    fn start_stop_is_idempotent() {
        let engine = Arc::new(Engine::new(EngineConfig::default()));
        engine.start();
        engine.start();
        engine.stop();
        engine.stop();
    }
}
