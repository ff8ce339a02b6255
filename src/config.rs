//! Simulator configuration.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`XS1_EMU_*`)
//! 2. Project-local config file (`./xs1-emu.toml`)
//! 3. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # xs1-emu.toml
//!
//! # Disable the fragment compiler (pure interpretation)
//! jit = false
//!
//! # Process every port clock edge instead of skipping unobservable ones
//! slow_ports = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::exec::jit::DEFAULT_JIT_THRESHOLD;

/// Simulator configuration, constructor-injected into the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Whether hot code is compiled to fragments.
    pub jit: bool,
    /// Executions of an instruction before its cell is promoted to a stub.
    pub jit_threshold: u32,
    /// Process every port clock edge (the oracle for the fast path).
    pub slow_ports: bool,
    /// Deliver instruction-level events to the tracer.
    pub trace: bool,
    /// Wall-clock limit in host seconds; None runs until completion.
    pub timeout_secs: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            jit: true,
            jit_threshold: DEFAULT_JIT_THRESHOLD,
            slow_ports: false,
            trace: false,
            timeout_secs: None,
        }
    }
}

impl SimConfig {
    /// Load configuration from all sources.
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Some(file) = Self::load_local_config() {
            config = file;
        }
        config.apply_env_overrides();
        config
    }

    fn load_local_config() -> Option<Self> {
        Self::load_from_file(Path::new("xs1-emu.toml"))
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("XS1_EMU_JIT") {
            self.jit = v != "0" && v != "false";
        }
        if let Ok(v) = std::env::var("XS1_EMU_JIT_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.jit_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("XS1_EMU_SLOW_PORTS") {
            self.slow_ports = v == "1" || v == "true";
        }
        if let Ok(v) = std::env::var("XS1_EMU_TRACE") {
            self.trace = v == "1" || v == "true";
        }
        if let Ok(v) = std::env::var("XS1_EMU_TIMEOUT") {
            self.timeout_secs = v.parse().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = SimConfig::default();
        assert!(c.jit);
        assert_eq!(c.jit_threshold, DEFAULT_JIT_THRESHOLD);
        assert!(!c.slow_ports);
        assert!(c.timeout_secs.is_none());
    }

    #[test]
    fn test_toml_roundtrip() {
        let c = SimConfig { jit: false, slow_ports: true, ..SimConfig::default() };
        let text = toml::to_string(&c).unwrap();
        let back: SimConfig = toml::from_str(&text).unwrap();
        assert!(!back.jit);
        assert!(back.slow_ports);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let back: SimConfig = toml::from_str("jit = false\n").unwrap();
        assert!(!back.jit);
        assert_eq!(back.jit_threshold, DEFAULT_JIT_THRESHOLD);
    }
}
