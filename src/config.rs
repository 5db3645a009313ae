//! Plain configuration structs consumed by `Engine::new` (spec §6). No
//! parsing logic lives here -- an external collaborator (CLI, config file,
//! UI) is expected to populate these and hand them to the engine.

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bpm: f64,
    pub ppq: u32,
    pub swing: f64,
    pub scale_name: String,
    pub root_note: i64,
    pub sequence_length: usize,
    pub midi_port_name: Option<String>,
    pub midi_channel: u8,
    pub cc_throttle_ms: u64,
    pub mutation: MutationConfig,
    pub idle: IdleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            bpm: 110.0,
            ppq: 24,
            swing: 0.12,
            scale_name: "major".to_string(),
            root_note: 60,
            sequence_length: 8,
            midi_port_name: None,
            midi_channel: 1,
            cc_throttle_ms: 10,
            mutation: MutationConfig::default(),
            idle: IdleConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutationConfig {
    pub interval_min_s: f64,
    pub interval_max_s: f64,
    pub max_changes_per_cycle: usize,
}

impl Default for MutationConfig {
    fn default() -> Self {
        MutationConfig {
            interval_min_s: 15.0,
            interval_max_s: 60.0,
            max_changes_per_cycle: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdleConfig {
    pub timeout_ms: u64,
    pub ambient_profile: String,
    pub fade_in_ms: u64,
    pub fade_out_ms: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        IdleConfig {
            timeout_ms: 5 * 60 * 1000,
            ambient_profile: "slow_fade".to_string(),
            fade_in_ms: 4000,
            fade_out_ms: 4000,
        }
    }
}
