use std::path::PathBuf;
use std::time::Duration;

use crate::engine::Toolchains;
use crate::engine::types::DEFAULT_TIMEOUT_MS;

const DEFAULT_BUILD_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "TERM",
    "USER",
    "TMPDIR",
    "CARGO_HOME",
    "RUSTUP_HOME",
    "RUSTUP_TOOLCHAIN",
];

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub workspace_root: PathBuf,
    pub default_timeout_ms: u64,
    pub build_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub env_allowlist: Vec<String>,
    pub toolchains: Toolchains,
}

/// Raw string values as they come from the environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawValues<'a> {
    pub workspace_root: Option<&'a str>,
    pub timeout_ms: Option<&'a str>,
    pub build_timeout_ms: Option<&'a str>,
    pub max_output_bytes: Option<&'a str>,
    pub env_allowlist: Option<&'a str>,
    pub node: Option<&'a str>,
    pub python: Option<&'a str>,
    pub cargo: Option<&'a str>,
}

impl Config {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok();
        let workspace_root = var("POLYRUN_WORKSPACE_ROOT");
        let timeout_ms = var("POLYRUN_TIMEOUT_MS");
        let build_timeout_ms = var("POLYRUN_BUILD_TIMEOUT_MS");
        let max_output_bytes = var("POLYRUN_MAX_OUTPUT_BYTES");
        let env_allowlist = var("POLYRUN_ENV_ALLOWLIST");
        let node = var("POLYRUN_NODE");
        let python = var("POLYRUN_PYTHON");
        let cargo = var("POLYRUN_CARGO");

        Self::from_raw_values(RawValues {
            workspace_root: workspace_root.as_deref(),
            timeout_ms: timeout_ms.as_deref(),
            build_timeout_ms: build_timeout_ms.as_deref(),
            max_output_bytes: max_output_bytes.as_deref(),
            env_allowlist: env_allowlist.as_deref(),
            node: node.as_deref(),
            python: python.as_deref(),
            cargo: cargo.as_deref(),
        })
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(raw: RawValues<'_>) -> Self {
        let workspace_root = non_empty(raw.workspace_root)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("polyrun"));

        let env_allowlist = match non_empty(raw.env_allowlist) {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect(),
            None => DEFAULT_ENV_ALLOWLIST.iter().map(|k| k.to_string()).collect(),
        };

        let defaults = Toolchains::default();
        let toolchains = Toolchains {
            node: non_empty(raw.node).map(String::from).unwrap_or(defaults.node),
            python: non_empty(raw.python)
                .map(String::from)
                .unwrap_or(defaults.python),
            cargo: non_empty(raw.cargo)
                .map(String::from)
                .unwrap_or(defaults.cargo),
        };

        Config {
            workspace_root,
            default_timeout_ms: positive(raw.timeout_ms).unwrap_or(DEFAULT_TIMEOUT_MS),
            build_timeout_ms: positive(raw.build_timeout_ms).unwrap_or(DEFAULT_BUILD_TIMEOUT_MS),
            max_output_bytes: positive(raw.max_output_bytes).unwrap_or(DEFAULT_MAX_OUTPUT_BYTES),
            env_allowlist,
            toolchains,
        }
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw_values(RawValues::default())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn positive<T>(value: Option<&str>) -> Option<T>
where
    T: std::str::FromStr + Default + PartialEq,
{
    non_empty(value)
        .and_then(|v| v.parse::<T>().ok())
        .filter(|v| *v != T::default())
}
