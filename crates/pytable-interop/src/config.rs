use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{InteropError, InteropResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

/// Knobs for the Python interop layer. The config is loaded once by the
/// host and threaded into every component that constructs handles.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InteropConfig {
    /// Leak Python references on drop instead of releasing them.
    /// Diagnostic escape hatch for chasing interpreter teardown issues.
    pub disable_release: bool,
    /// Log handle construction and release at trace level.
    pub log_refcounts: bool,
}

impl InteropConfig {
    pub fn load() -> InteropResult<Self> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .admerge(Env::prefixed("PYTABLE__"))
            .extract()
            .map_err(|e| InteropError::Configuration(e.to_string()))
    }
}
