use std::collections::BTreeMap;

use async_trait::async_trait;

use super::error::ExecError;
use super::types::{ExecutionOptions, Language, RunSpec};
use super::workspace::Workspace;

pub mod javascript;
pub mod python;
pub mod rust;

pub use javascript::JavaScriptStrategy;
pub use python::PythonStrategy;
pub use rust::RustStrategy;

/// Language-specific recipe turning a source string into commands.
///
/// `prepare` materializes the source (and any scaffold) inside the
/// workspace and returns the optional build step plus the run target. It
/// never spawns anything itself.
#[async_trait]
pub trait LanguageStrategy: Send + Sync {
    fn language(&self) -> Language;

    async fn prepare(
        &self,
        workspace: &Workspace,
        source: &str,
        options: &ExecutionOptions,
    ) -> Result<RunSpec, ExecError>;
}

/// Default toolchain programs, overridable per request via `build_tool`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchains {
    pub node: String,
    pub python: String,
    pub cargo: String,
}

impl Default for Toolchains {
    fn default() -> Self {
        Self {
            node: "node".into(),
            python: "python3".into(),
            cargo: "cargo".into(),
        }
    }
}

/// Strategy lookup keyed by language.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<Language, Box<dyn LanguageStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in strategy for every supported language.
    pub fn with_defaults(toolchains: &Toolchains) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(JavaScriptStrategy::javascript(&toolchains.node)));
        registry.register(Box::new(JavaScriptStrategy::typescript(&toolchains.node)));
        registry.register(Box::new(PythonStrategy::new(&toolchains.python)));
        registry.register(Box::new(RustStrategy::new(&toolchains.cargo)));
        registry
    }

    /// Add a strategy, replacing any previous one for the same language.
    pub fn register(&mut self, strategy: Box<dyn LanguageStrategy>) {
        self.strategies.insert(strategy.language(), strategy);
    }

    pub fn get(&self, language: Language) -> Option<&dyn LanguageStrategy> {
        self.strategies.get(&language).map(|s| s.as_ref())
    }
}
