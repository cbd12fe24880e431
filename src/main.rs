use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use polyrun::config::Config;
use polyrun::engine::{self, ExecutionOptions, ExecutionRequest, ExecutionResult, Executor};

#[derive(Parser)]
#[command(name = "polyrun", about = "Run code snippets in throwaway workspaces")]
enum Cli {
    /// Run a snippet to completion and exit with its exit code
    Run {
        #[command(flatten)]
        snippet: SnippetArgs,
        /// Text fed to the program's stdin
        #[arg(long)]
        stdin: Option<String>,
        /// Print the result as JSON instead of replaying its streams
        #[arg(long)]
        json: bool,
    },
    /// Run an execution request read from a YAML file, print the JSON result
    Request { path: PathBuf },
    /// Run a snippet attached to this terminal
    Interactive {
        #[command(flatten)]
        snippet: SnippetArgs,
    },
}

#[derive(Args)]
struct SnippetArgs {
    /// Language tag: js, ts, python, rust
    #[arg(long, short)]
    language: String,
    /// Read the source from a file
    #[arg(long, conflicts_with = "code", required_unless_present = "code")]
    file: Option<PathBuf>,
    /// Source given inline
    #[arg(long)]
    code: Option<String>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Program replacing the language's default toolchain
    #[arg(long)]
    build_tool: Option<String>,
    /// Extra argument for the build (or interpreter) invocation; repeatable
    #[arg(long = "build-arg", allow_hyphen_values = true)]
    build_args: Vec<String>,
}

impl SnippetArgs {
    fn source(&self) -> Result<String> {
        match (&self.code, &self.file) {
            (Some(code), _) => Ok(code.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read source file: {}", path.display())),
            (None, None) => anyhow::bail!("either --file or --code is required"),
        }
    }

    fn options(&self, executor: &Executor) -> ExecutionOptions {
        let defaults = executor.default_options();
        ExecutionOptions {
            build_tool: self.build_tool.clone(),
            build_args: self.build_args.clone(),
            timeout_ms: self.timeout_ms.unwrap_or(defaults.timeout_ms),
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();
    let cli = Cli::parse();

    // Logs go to stderr so program output on stdout stays clean.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("polyrun=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_writer(std::io::stderr)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .init();

    let config = Config::from_env();
    let executor = engine::build_executor(&config);

    let code = match cli {
        Cli::Run {
            snippet,
            stdin,
            json,
        } => {
            let mut options = snippet.options(&executor);
            options.stdin = stdin.unwrap_or_default();
            let result = executor
                .run(&snippet.language, &snippet.source()?, &options)
                .await
                .context("execution failed")?;
            report(&result, json)?;
            result.exit_code
        }
        Cli::Request { path } => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read request file: {}", path.display()))?;
            let request: ExecutionRequest = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse request file: {}", path.display()))?;
            let result = executor
                .run_request(&request)
                .await
                .context("execution failed")?;
            report(&result, true)?;
            result.exit_code
        }
        Cli::Interactive { snippet } => {
            let options = snippet.options(&executor);
            interactive(&executor, &snippet.language, &snippet.source()?, &options).await?
        }
    };

    Ok(exit_code(code))
}

fn report(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(result).context("failed to encode result")?;
        println!("{out}");
    } else {
        print!("{}", result.stdout);
        eprint!("{}", result.stderr);
    }
    Ok(())
}

async fn interactive(
    executor: &Executor,
    language: &str,
    source: &str,
    options: &ExecutionOptions,
) -> Result<i32> {
    let handle = executor
        .open_interactive(
            language,
            source,
            options,
            |text| {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            },
            |text| {
                let mut err = std::io::stderr().lock();
                let _ = err.write_all(text.as_bytes());
                let _ = err.flush();
            },
        )
        .await
        .context("failed to start interactive session")?;

    // Blocking reads on a plain thread: a pending tokio stdin read would
    // hold up runtime shutdown after the session ends.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read terminal input");
                    break;
                }
            }
        }
    });

    let writer = handle.clone();
    let forward = tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if let Err(e) = writer.write(format!("{line}\n").as_bytes()).await {
                tracing::debug!(error = %e, "session no longer accepts input");
                return;
            }
        }
        let _ = writer.close_stdin().await;
    });

    let exit = handle.exit();
    let code = tokio::select! {
        code = exit.clone() => code,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(session = %handle.session(), "interrupted, killing session");
            handle.kill();
            exit.await
        }
    };
    forward.abort();
    Ok(code)
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map(ExitCode::from).unwrap_or(ExitCode::FAILURE)
}
