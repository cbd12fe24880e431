//! Polyglot snippet execution.
//!
//! [`Executor`] ties the pieces together: a [`WorkspaceManager`] hands out
//! throwaway directories, a [`LanguageStrategy`] turns source into build
//! and run commands, the [`ProcessSupervisor`] runs them under a timeout,
//! [`SessionController`] drives interactive children and [`WasmBridge`]
//! runs WebAssembly build outputs in-process.

pub mod error;
pub mod executor;
pub mod output;
pub mod session;
pub mod strategy;
pub mod supervisor;
pub mod types;
pub mod wasm;
pub mod workspace;


pub use error::ExecError;
pub use executor::Executor;
pub use session::{ExitFuture, InteractiveHandle, SessionController};
pub use strategy::{LanguageStrategy, StrategyRegistry, Toolchains};
pub use supervisor::ProcessSupervisor;
pub use types::*;
pub use wasm::{WasmBridge, WasmOutput};
pub use workspace::{Workspace, WorkspaceManager};

use crate::config::Config;

/// Build an executor from runtime config.
pub fn build_executor(config: &Config) -> Executor {
    tracing::info!(
        workspace_root = %config.workspace_root.display(),
        timeout_ms = config.default_timeout_ms,
        build_timeout_ms = config.build_timeout_ms,
        node = %config.toolchains.node,
        python = %config.toolchains.python,
        cargo = %config.toolchains.cargo,
        "initializing executor"
    );
    Executor::from_config(config)
}
