use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::types::{InterfaceConfig, TrafficProfile};
use crate::error::{EngineError, Result};

/// Serializable registry state: `load(save(state)) == state` modulo volatile
/// counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSnapshot {
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceConfig>,
    #[serde(default)]
    pub traffic_profiles: BTreeMap<String, TrafficProfile>,
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<EngineSnapshot> {
    let text = std::fs::read_to_string(&path)
        .map_err(|e| EngineError::Config(format!("failed to read config file: {e}")))?;
    serde_json::from_str(&text)
        .map_err(|e| EngineError::Config(format!("failed to parse config: {e}")))
}

pub fn save_to_path<P: AsRef<Path>>(path: P, snapshot: &EngineSnapshot) -> Result<()> {
    let text = serde_json::to_string_pretty(snapshot)
        .map_err(|e| EngineError::Config(format!("failed to serialize config: {e}")))?;
    std::fs::write(&path, text)
        .map_err(|e| EngineError::Config(format!("failed to write config file: {e}")))
}
