//! Bridge configuration and the environment it is discovered from.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ActivationError;

/// What remote accessors do once the bridge has faulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Every later call on the accessor reports a recoverable backend error.
    #[default]
    Surface,
    /// The accessor rebuilds itself locally from its last fetched host copy.
    Rematerialize,
}

/// Contents of the JSON file named by `NDVEM_CONFIG`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Executable name looked up in the search path, or a path to it.
    pub engine: String,
    pub args: Vec<String>,
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub fault_policy: FaultPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            engine: "ndvem-engine".to_string(),
            args: Vec::new(),
            handshake_timeout_ms: 2_000,
            request_timeout_ms: 10_000,
            fault_policy: FaultPolicy::Surface,
        }
    }
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ActivationError> {
        let text = fs::read_to_string(path).map_err(|err| ActivationError::Config {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Self::parse(&text).map_err(|reason| ActivationError::Config {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|err| err.to_string())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Where activation looks for its configuration and for the engine executable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeEnv {
    pub search_path: Vec<PathBuf>,
    pub config_path: Option<PathBuf>,
}

impl BridgeEnv {
    /// Reads `NDVEM_PATH` (or `PATH`) and `NDVEM_CONFIG`.
    pub fn from_env() -> Self {
        BridgeEnv {
            search_path: crate::env::search_path(),
            config_path: crate::env::config_path(),
        }
    }

    pub fn new(search_path: Vec<PathBuf>, config_path: Option<PathBuf>) -> Self {
        BridgeEnv {
            search_path,
            config_path,
        }
    }

    /// Resolves `engine` to an existing file.
    ///
    /// Names containing a path separator are taken as paths; bare names are searched in order.
    pub fn locate_engine(&self, engine: &str) -> Option<PathBuf> {
        let direct = Path::new(engine);
        if direct.components().count() > 1 || direct.is_absolute() {
            return direct.is_file().then(|| direct.to_path_buf());
        }
        self.search_path.iter().find_map(|dir| {
            let candidate = dir.join(engine);
            if candidate.is_file() {
                return Some(candidate);
            }
            let suffixed = dir.join(format!("{engine}{}", std::env::consts::EXE_SUFFIX));
            suffixed.is_file().then_some(suffixed)
        })
    }
}
