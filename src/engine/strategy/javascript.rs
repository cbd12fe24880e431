use async_trait::async_trait;

use super::LanguageStrategy;
use crate::engine::error::ExecError;
use crate::engine::types::{CommandSpec, ExecutionOptions, Language, RunSpec, RunTarget};
use crate::engine::workspace::Workspace;

/// Type stripping needs no separate compile step. Node 22.6 is the first
/// release with the flag; older ones fail with "bad option".
const TYPESCRIPT_FLAGS: &[&str] = &["--experimental-strip-types", "--no-warnings"];

/// Runs JavaScript or TypeScript directly with a Node-compatible runtime.
pub struct JavaScriptStrategy {
    language: Language,
    runtime: String,
}

impl JavaScriptStrategy {
    pub fn javascript(runtime: &str) -> Self {
        Self {
            language: Language::JavaScript,
            runtime: runtime.to_string(),
        }
    }

    pub fn typescript(runtime: &str) -> Self {
        Self {
            language: Language::TypeScript,
            runtime: runtime.to_string(),
        }
    }

    fn file_name(&self) -> &'static str {
        match self.language {
            Language::TypeScript => "main.ts",
            _ => "main.js",
        }
    }
}

#[async_trait]
impl LanguageStrategy for JavaScriptStrategy {
    fn language(&self) -> Language {
        self.language
    }

    async fn prepare(
        &self,
        workspace: &Workspace,
        source: &str,
        options: &ExecutionOptions,
    ) -> Result<RunSpec, ExecError> {
        let file = self.file_name();
        workspace.write_file(file, source).await?;

        // An explicit runtime (bun, deno, tsx, ...) gets only the caller's flags.
        let run = match &options.build_tool {
            Some(tool) => CommandSpec::new(tool, workspace.root()),
            None => {
                let cmd = CommandSpec::new(&self.runtime, workspace.root());
                if self.language == Language::TypeScript {
                    cmd.args(TYPESCRIPT_FLAGS.iter().copied())
                } else {
                    cmd
                }
            }
        }
        .args(options.build_args.iter().cloned())
        .arg(file);

        Ok(RunSpec {
            build: None,
            run: RunTarget::Process(run),
        })
    }
}
