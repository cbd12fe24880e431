use std::io;

/// Errors from the execution engine.
///
/// Problems with the submitted code (unsupported language, build or run
/// failures, timeouts) are normally reported as data in an
/// `ExecutionResult`. The variants here are what escapes as `Err`: broken
/// environments (I/O, spawn), and the interactive path, which has no
/// partial handle to hand back.
#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("build failed: code={exit_code}, stderr={stderr}")]
    BuildFailed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("workspace: {0}")]
    Workspace(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("wasm: {0}")]
    Wasm(String),

    #[error("session: {0}")]
    Session(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}
