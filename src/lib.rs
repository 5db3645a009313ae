//! Generative MIDI composition engine: a free-running tick clock drives a
//! step sequencer (with a contrapuntal fugue mode), a parameter store with
//! reentrancy-safe listener dispatch, a weighted mutation engine, an idle
//! ambient-profile manager, and a throttled/prioritized MIDI output
//! gateway. See `SPEC_FULL.md` for the full module and behavior reference.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fugue;
pub mod idle;
pub mod mutation;
pub mod note_off;
pub mod output;
pub mod params;
pub mod presets;
pub mod scale;
pub mod sequencer;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
