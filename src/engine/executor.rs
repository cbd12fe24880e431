use std::path::Path;
use std::time::{Duration, Instant};

use tracing::Instrument;

use super::error::ExecError;
use super::session::{InteractiveHandle, SessionController};
use super::strategy::{LanguageStrategy, StrategyRegistry, Toolchains};
use super::supervisor::ProcessSupervisor;
use super::types::{
    DEFAULT_TIMEOUT_MS, ExecutionOptions, ExecutionPhase, ExecutionRequest, ExecutionResult,
    Language, RunTarget, TIMEOUT_EXIT_CODE,
};
use super::wasm::WasmBridge;
use super::workspace::WorkspaceManager;
use crate::config::Config;

const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(120);

/// Entry point for executing snippets.
///
/// Every call acquires its own workspace and releases it before `run`
/// returns (or before an interactive session's exit future resolves).
/// Executions share nothing else, so one executor can serve any number of
/// concurrent calls.
pub struct Executor {
    workspaces: WorkspaceManager,
    supervisor: ProcessSupervisor,
    sessions: SessionController,
    wasm: WasmBridge,
    strategies: StrategyRegistry,
    build_timeout: Duration,
    default_timeout_ms: u64,
}

impl Executor {
    pub fn new(
        workspaces: WorkspaceManager,
        supervisor: ProcessSupervisor,
        wasm: WasmBridge,
        toolchains: &Toolchains,
    ) -> Self {
        Self {
            workspaces,
            sessions: SessionController::new(supervisor.clone()),
            supervisor,
            wasm,
            strategies: StrategyRegistry::with_defaults(toolchains),
            build_timeout: DEFAULT_BUILD_TIMEOUT,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let supervisor =
            ProcessSupervisor::new(config.env_allowlist.clone(), config.max_output_bytes);
        Self::new(
            WorkspaceManager::new(&config.workspace_root),
            supervisor,
            WasmBridge::new(config.max_output_bytes),
            &config.toolchains,
        )
        .with_build_timeout(config.build_timeout())
        .with_default_timeout_ms(config.default_timeout_ms)
    }

    /// Timeout for build steps, separate from the per-request run timeout.
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Replace the strategy for the strategy's language.
    pub fn register_strategy(&mut self, strategy: Box<dyn LanguageStrategy>) {
        self.strategies.register(strategy);
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Options with this executor's configured default timeout.
    pub fn default_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            timeout_ms: self.default_timeout_ms,
            ..ExecutionOptions::default()
        }
    }

    /// Run a submitted request. Options it leaves out take this
    /// executor's defaults.
    pub async fn run_request(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ExecError> {
        let options = request.options.resolve(self.default_timeout_ms);
        self.run(&request.language, &request.source, &options).await
    }

    /// Run `source` to completion.
    ///
    /// Unsupported languages and invalid options come back as a result with
    /// exit code 1, as do build failures (verbatim) and timeouts (124).
    /// Only environment failures (workspace, spawn, wasm loading) are errors.
    pub async fn run(
        &self,
        language: &str,
        source: &str,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, ExecError> {
        let (language, strategy) = match self.resolve(language, options) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::info!(error = %e, "execution rejected");
                return Ok(ExecutionResult::rejected(&e));
            }
        };
        phase(ExecutionPhase::Created);

        let workspace = self.workspaces.acquire()?;
        let span = tracing::info_span!("execution", language = %language, workspace = %workspace.name());
        let started = Instant::now();

        let result: Result<ExecutionResult, ExecError> = async {
            phase(ExecutionPhase::WorkspaceReady);
            let spec = strategy.prepare(&workspace, source, options).await?;

            if let Some(build) = &spec.build {
                phase(ExecutionPhase::Building);
                let built = self.supervisor.execute(build, "", self.build_timeout).await?;
                if !built.is_success() {
                    tracing::info!(exit_code = built.exit_code, "build failed, skipping run");
                    return Ok(built);
                }
            }

            phase(ExecutionPhase::Running);
            match &spec.run {
                RunTarget::Process(command) => {
                    self.supervisor
                        .execute(command, &options.stdin, options.timeout())
                        .await
                }
                RunTarget::Wasm { module, args } => self.run_wasm(module, args, options).await,
            }
        }
        .instrument(span.clone())
        .await;

        if let Ok(result) = &result {
            phase(ExecutionPhase::after_run(result));
        }
        workspace.release();
        phase(ExecutionPhase::Released);

        let result = result?;
        tracing::info!(
            parent: &span,
            exit_code = result.exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execution finished"
        );
        Ok(result)
    }

    /// Start `source` as an interactive session.
    ///
    /// Unlike [`Executor::run`], request problems are errors here, and a
    /// failed build is [`ExecError::BuildFailed`]. Non-empty `options.stdin`
    /// is written to the session before the handle is returned; the timeout
    /// does not apply to the session itself.
    pub async fn open_interactive<O, E>(
        &self,
        language: &str,
        source: &str,
        options: &ExecutionOptions,
        on_stdout: O,
        on_stderr: E,
    ) -> Result<InteractiveHandle, ExecError>
    where
        O: FnMut(String) + Send + 'static,
        E: FnMut(String) + Send + 'static,
    {
        let (language, strategy) = self.resolve(language, options)?;
        let workspace = self.workspaces.acquire()?;
        let span = tracing::info_span!("session", language = %language, workspace = %workspace.name());

        async move {
            phase(ExecutionPhase::WorkspaceReady);
            let spec = strategy.prepare(&workspace, source, options).await?;
            if let Some(build) = &spec.build {
                phase(ExecutionPhase::Building);
                let built = self.supervisor.execute(build, "", self.build_timeout).await?;
                if !built.is_success() {
                    return Err(ExecError::BuildFailed {
                        exit_code: built.exit_code,
                        stdout: built.stdout,
                        stderr: built.stderr,
                    });
                }
            }

            let command = match spec.run {
                RunTarget::Process(command) => command,
                RunTarget::Wasm { .. } => {
                    return Err(ExecError::Unsupported("interactive webassembly execution"));
                }
            };

            phase(ExecutionPhase::Running);
            let handle = self
                .sessions
                .open(&command, workspace, on_stdout, on_stderr)?;
            if !options.stdin.is_empty() {
                handle.write(options.stdin.as_bytes()).await?;
            }
            Ok(handle)
        }
        .instrument(span)
        .await
    }

    fn resolve(
        &self,
        tag: &str,
        options: &ExecutionOptions,
    ) -> Result<(Language, &dyn LanguageStrategy), ExecError> {
        let language: Language = tag.parse()?;
        options.validate()?;
        let strategy = self
            .strategies
            .get(language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(tag.to_string()))?;
        Ok((language, strategy))
    }

    async fn run_wasm(
        &self,
        module: &Path,
        args: &[String],
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, ExecError> {
        let timeout = options.timeout();
        let run = self.wasm.run_module(module, &options.stdin, args);
        let output = match tokio::time::timeout(timeout, run).await {
            Ok(output) => output?,
            Err(_) => {
                tracing::warn!(
                    module = %module.display(),
                    timeout_ms = timeout.as_millis() as u64,
                    "wasm module timed out"
                );
                return Ok(ExecutionResult::timed_out(timeout));
            }
        };

        let exit_code = if output.exit_code == TIMEOUT_EXIT_CODE {
            tracing::warn!("wasm module exited with reserved timeout code, reporting 1");
            1
        } else {
            output.exit_code
        };
        Ok(ExecutionResult {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
        })
    }
}

fn phase(phase: ExecutionPhase) {
    tracing::debug!(phase = %phase, "execution phase");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{CommandSpec, RunSpec};
    use crate::engine::workspace::Workspace;
    use async_trait::async_trait;

    /// Stands in for a compiled language using only POSIX tools: the build
    /// runs `build_script`, the run step executes the snippet with `sh`.
    struct ShellStrategy {
        build_script: &'static str,
    }

    #[async_trait]
    impl LanguageStrategy for ShellStrategy {
        fn language(&self) -> Language {
            Language::Rust
        }

        async fn prepare(
            &self,
            workspace: &Workspace,
            source: &str,
            _options: &ExecutionOptions,
        ) -> Result<RunSpec, ExecError> {
            workspace.write_file("main.sh", source).await?;
            Ok(RunSpec {
                build: Some(
                    CommandSpec::new("sh", workspace.root())
                        .arg("-c")
                        .arg(self.build_script),
                ),
                run: RunTarget::Process(CommandSpec::new("sh", workspace.root()).arg("main.sh")),
            })
        }
    }

    /// Writes the snippet as a WAT module and hands it to the wasm bridge.
    struct WatStrategy;

    #[async_trait]
    impl LanguageStrategy for WatStrategy {
        fn language(&self) -> Language {
            Language::Rust
        }

        async fn prepare(
            &self,
            workspace: &Workspace,
            source: &str,
            _options: &ExecutionOptions,
        ) -> Result<RunSpec, ExecError> {
            let module = workspace.write_file("snippet.wat", source).await?;
            Ok(RunSpec {
                build: None,
                run: RunTarget::Wasm {
                    module,
                    args: vec!["snippet".into()],
                },
            })
        }
    }

    const SPIN: &str = r#"(module (func (export "_start") (loop $l (br $l))))"#;

    fn executor(tmp: &tempfile::TempDir) -> Executor {
        Executor::new(
            WorkspaceManager::new(tmp.path().join("ws")),
            ProcessSupervisor::new(vec!["PATH".into()], 1024 * 1024),
            WasmBridge::new(1024 * 1024),
            &Toolchains::default(),
        )
    }

    fn workspace_root_is_empty(executor: &Executor) -> bool {
        match std::fs::read_dir(executor.workspaces().root()) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn unsupported_language_is_data() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = executor(&tmp);

        let res = executor
            .run("cobol", "DISPLAY 'HI'.", &ExecutionOptions::default())
            .await
            .unwrap();

        assert_eq!(res.exit_code, 1);
        assert_eq!(res.stderr, "unsupported language: cobol");
        assert!(res.stdout.is_empty());
        assert!(workspace_root_is_empty(&executor));
    }

    #[tokio::test]
    async fn invalid_options_are_data() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = executor(&tmp);
        let options = ExecutionOptions {
            timeout_ms: 0,
            ..ExecutionOptions::default()
        };

        let res = executor.run("python", "print(1)", &options).await.unwrap();
        assert_eq!(res.exit_code, 1);
        assert!(res.stderr.contains("timeout_ms"));
    }

    #[tokio::test]
    async fn failed_build_skips_run_step() {
        let tmp = tempfile::tempdir().unwrap();
        let mut executor = executor(&tmp);
        executor.register_strategy(Box::new(ShellStrategy {
            build_script: "echo 'error[E0425]: broken' >&2; exit 101",
        }));

        let res = executor
            .run("rust", "touch ran", &ExecutionOptions::default())
            .await
            .unwrap();

        assert_eq!(res.exit_code, 101);
        assert_eq!(res.stderr, "error[E0425]: broken\n");
        assert!(workspace_root_is_empty(&executor));
    }

    #[tokio::test]
    async fn successful_build_runs_with_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        let mut executor = executor(&tmp);
        executor.register_strategy(Box::new(ShellStrategy {
            build_script: "echo compiling",
        }));
        let options = ExecutionOptions {
            stdin: "hi".into(),
            ..ExecutionOptions::default()
        };

        let res = executor.run("rust", "cat; echo", &options).await.unwrap();
        assert_eq!(res.stdout, "hi\n");
        assert_eq!(res.exit_code, 0);
        assert!(workspace_root_is_empty(&executor));
    }

    #[tokio::test]
    async fn run_timeout_reports_124() {
        let tmp = tempfile::tempdir().unwrap();
        let mut executor = executor(&tmp);
        executor.register_strategy(Box::new(ShellStrategy { build_script: "true" }));
        let options = ExecutionOptions {
            timeout_ms: 50,
            ..ExecutionOptions::default()
        };

        let started = Instant::now();
        let res = executor
            .run("rust", "while :; do :; done", &options)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(res, ExecutionResult::timed_out(Duration::from_millis(50)));
        assert!(workspace_root_is_empty(&executor));
    }

    #[tokio::test]
    async fn request_without_timeout_uses_configured_default() {
        let tmp = tempfile::tempdir().unwrap();
        let mut executor = executor(&tmp).with_default_timeout_ms(50);
        executor.register_strategy(Box::new(ShellStrategy { build_script: "true" }));
        let request: ExecutionRequest =
            serde_yaml::from_str("language: rust\nsource: 'while :; do :; done'\n").unwrap();

        let started = Instant::now();
        let res = executor.run_request(&request).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(res, ExecutionResult::timed_out(Duration::from_millis(50)));
        assert!(workspace_root_is_empty(&executor));
    }

    #[tokio::test]
    async fn build_timeout_is_separate_from_run_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let mut executor = executor(&tmp).with_build_timeout(Duration::from_millis(100));
        executor.register_strategy(Box::new(ShellStrategy {
            build_script: "sleep 5",
        }));

        let res = executor
            .run("rust", "echo never", &ExecutionOptions::default())
            .await
            .unwrap();
        assert!(res.is_timeout());
        assert!(res.stdout.is_empty());
    }

    #[tokio::test]
    async fn wasm_timeout_interrupts_module() {
        let tmp = tempfile::tempdir().unwrap();
        let mut executor = executor(&tmp);
        executor.register_strategy(Box::new(WatStrategy));
        let options = ExecutionOptions {
            timeout_ms: 50,
            ..ExecutionOptions::default()
        };

        let res = executor.run("rust", SPIN, &options).await.unwrap();
        assert_eq!(res.exit_code, TIMEOUT_EXIT_CODE);
        assert!(res.stdout.is_empty());
        assert!(!res.stderr.is_empty());
        assert!(workspace_root_is_empty(&executor));
    }

    #[tokio::test]
    async fn wasm_load_failure_is_an_error_and_releases() {
        let tmp = tempfile::tempdir().unwrap();
        let mut executor = executor(&tmp);
        executor.register_strategy(Box::new(WatStrategy));

        let err = executor
            .run("rust", "(module", &ExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Wasm(_)));
        assert!(workspace_root_is_empty(&executor));
    }

    #[tokio::test]
    async fn interactive_rejects_unsupported_language() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = executor(&tmp);

        let err = executor
            .open_interactive("cobol", "", &ExecutionOptions::default(), |_| {}, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::UnsupportedLanguage(_)));
    }

    #[tokio::test]
    async fn interactive_build_failure_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut executor = executor(&tmp);
        executor.register_strategy(Box::new(ShellStrategy {
            build_script: "echo nope >&2; exit 2",
        }));

        let err = executor
            .open_interactive("rust", "cat", &ExecutionOptions::default(), |_| {}, |_| {})
            .await
            .unwrap_err();

        match err {
            ExecError::BuildFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "nope\n");
            }
            other => panic!("expected BuildFailed, got {other:?}"),
        }
        assert!(workspace_root_is_empty(&executor));
    }

    #[tokio::test]
    async fn interactive_wasm_is_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let mut executor = executor(&tmp);
        executor.register_strategy(Box::new(WatStrategy));

        let err = executor
            .open_interactive("rust", SPIN, &ExecutionOptions::default(), |_| {}, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Unsupported(_)));
        assert!(workspace_root_is_empty(&executor));
    }

    #[tokio::test]
    async fn interactive_session_runs_after_build() {
        let tmp = tempfile::tempdir().unwrap();
        let mut executor = executor(&tmp);
        executor.register_strategy(Box::new(ShellStrategy { build_script: "true" }));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = executor
            .open_interactive(
                "rust",
                "read line; echo \"got $line\"",
                &ExecutionOptions::default(),
                move |text| {
                    let _ = tx.send(text);
                },
                |_| {},
            )
            .await
            .unwrap();
        handle.write(b"5\n").await.unwrap();

        let code = tokio::time::timeout(Duration::from_secs(5), handle.exit())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(rx.recv().await.as_deref(), Some("got 5\n"));
        assert!(workspace_root_is_empty(&executor));
    }

    #[test]
    fn default_options_use_configured_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = executor(&tmp).with_default_timeout_ms(2500);
        assert_eq!(executor.default_options().timeout_ms, 2500);
    }
}
