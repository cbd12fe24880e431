use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ExecError;

/// Exit code reserved for executions stopped by the wall-clock timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

// ── Language ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Language {
    JavaScript,
    TypeScript,
    Python,
    Rust,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::JavaScript,
        Language::TypeScript,
        Language::Python,
        Language::Rust,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Language::JavaScript => "js",
            Language::TypeScript => "ts",
            Language::Python => "python",
            Language::Rust => "rust",
        }
    }
}

impl FromStr for Language {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "js" | "javascript" | "node" => Ok(Language::JavaScript),
            "ts" | "typescript" => Ok(Language::TypeScript),
            "python" | "py" | "python3" => Ok(Language::Python),
            "rust" | "rs" => Ok(Language::Rust),
            _ => Err(ExecError::UnsupportedLanguage(s.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ── Request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionRequest {
    /// Raw language tag as submitted; parsed by the executor.
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub options: RequestOptions,
}

/// Options as submitted. Anything left out is filled in by the executor
/// that runs the request, so an omitted timeout means the configured one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    #[serde(alias = "buildTool")]
    pub build_tool: Option<String>,
    #[serde(alias = "buildArgs")]
    pub build_args: Vec<String>,
    #[serde(alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    pub stdin: String,
}

impl RequestOptions {
    pub fn resolve(&self, default_timeout_ms: u64) -> ExecutionOptions {
        ExecutionOptions {
            build_tool: self.build_tool.clone(),
            build_args: self.build_args.clone(),
            timeout_ms: self.timeout_ms.unwrap_or(default_timeout_ms),
            stdin: self.stdin.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Replaces the default toolchain program (`node`, `python3`, `cargo`).
    pub build_tool: Option<String>,
    /// Appended to the build invocation; runtime flags for interpreters.
    pub build_args: Vec<String>,
    pub timeout_ms: u64,
    pub stdin: String,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            build_tool: None,
            build_args: vec![],
            timeout_ms: DEFAULT_TIMEOUT_MS,
            stdin: String::new(),
        }
    }
}

impl ExecutionOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ExecError> {
        if self.timeout_ms == 0 {
            return Err(ExecError::InvalidOptions(
                "timeout_ms must be greater than zero".into(),
            ));
        }
        if matches!(self.build_tool.as_deref(), Some(t) if t.trim().is_empty()) {
            return Err(ExecError::InvalidOptions("build_tool is empty".into()));
        }
        Ok(())
    }
}

// ── Result ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecutionResult {
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("execution timed out after {}ms", timeout.as_millis()),
            exit_code: TIMEOUT_EXIT_CODE,
        }
    }

    /// A failure attributable to the request itself, reported as data.
    pub fn rejected(err: &ExecError) -> Self {
        Self {
            stdout: String::new(),
            stderr: err.to_string(),
            exit_code: 1,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

// ── Commands ────────────────────────────────────────────────────────

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            cwd: cwd.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Program and arguments joined for log output.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a strategy hands back after materializing the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub build: Option<CommandSpec>,
    pub run: RunTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    Process(CommandSpec),
    /// A WebAssembly module produced by the build step, run in-process.
    Wasm { module: PathBuf, args: Vec<String> },
}

// ── Execution phases ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Created,
    WorkspaceReady,
    Building,
    Running,
    Completed,
    TimedOut,
    Failed,
    Released,
}

impl ExecutionPhase {
    pub fn after_run(result: &ExecutionResult) -> Self {
        if result.is_timeout() {
            ExecutionPhase::TimedOut
        } else if result.is_success() {
            ExecutionPhase::Completed
        } else {
            ExecutionPhase::Failed
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionPhase::Created => "CREATED",
            ExecutionPhase::WorkspaceReady => "WORKSPACE_READY",
            ExecutionPhase::Building => "BUILDING",
            ExecutionPhase::Running => "RUNNING",
            ExecutionPhase::Completed => "COMPLETED",
            ExecutionPhase::TimedOut => "TIMED_OUT",
            ExecutionPhase::Failed => "FAILED",
            ExecutionPhase::Released => "RELEASED",
        };
        f.write_str(name)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
