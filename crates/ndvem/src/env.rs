use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::OnceLock;

static NDVEM_EAGER: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

/// Lazy graphs materialise every node as soon as it is recorded.
pub(crate) fn eager_enabled() -> bool {
    *NDVEM_EAGER.get_or_init(|| flag("NDVEM_EAGER"))
}

/// Read on every call so a process can flip the toggle before building a context.
pub(crate) fn unsafe_disabled() -> bool {
    flag("NDVEM_DISABLE_UNSAFE")
}

/// Engine search path from `NDVEM_PATH`, falling back to `PATH`.
pub(crate) fn search_path() -> Vec<PathBuf> {
    let raw: OsString = env::var_os("NDVEM_PATH")
        .filter(|value| !value.is_empty())
        .or_else(|| env::var_os("PATH"))
        .unwrap_or_default();
    env::split_paths(&raw)
        .filter(|entry| !entry.as_os_str().is_empty())
        .collect()
}

pub(crate) fn config_path() -> Option<PathBuf> {
    env::var_os("NDVEM_CONFIG")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
