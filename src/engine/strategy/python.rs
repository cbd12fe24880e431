use async_trait::async_trait;

use super::LanguageStrategy;
use crate::engine::error::ExecError;
use crate::engine::types::{CommandSpec, ExecutionOptions, Language, RunSpec, RunTarget};
use crate::engine::workspace::Workspace;

pub struct PythonStrategy {
    python: String,
}

impl PythonStrategy {
    pub fn new(python: &str) -> Self {
        Self {
            python: python.to_string(),
        }
    }
}

#[async_trait]
impl LanguageStrategy for PythonStrategy {
    fn language(&self) -> Language {
        Language::Python
    }

    async fn prepare(
        &self,
        workspace: &Workspace,
        source: &str,
        options: &ExecutionOptions,
    ) -> Result<RunSpec, ExecError> {
        workspace.write_file("main.py", source).await?;

        let program = options.build_tool.as_deref().unwrap_or(&self.python);
        // -u: output must reach the readers as it is produced, not at exit
        let run = CommandSpec::new(program, workspace.root())
            .arg("-u")
            .args(options.build_args.iter().cloned())
            .arg("main.py")
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1");

        Ok(RunSpec {
            build: None,
            run: RunTarget::Process(run),
        })
    }
}
