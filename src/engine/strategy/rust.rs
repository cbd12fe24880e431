use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::LanguageStrategy;
use crate::engine::error::ExecError;
use crate::engine::types::{CommandSpec, ExecutionOptions, Language, RunSpec, RunTarget};
use crate::engine::workspace::Workspace;

const CRATE_NAME: &str = "snippet";

// The empty [workspace] table keeps cargo from attaching the scaffold to
// any workspace found above the temp root.
const MANIFEST: &str = r#"[package]
name = "snippet"
version = "0.1.0"
edition = "2021"
publish = false

[[bin]]
name = "snippet"
path = "src/main.rs"

[workspace]
"#;

/// Scaffolds a single-binary cargo project and builds it.
pub struct RustStrategy {
    cargo: String,
}

impl RustStrategy {
    pub fn new(cargo: &str) -> Self {
        Self {
            cargo: cargo.to_string(),
        }
    }
}

#[async_trait]
impl LanguageStrategy for RustStrategy {
    fn language(&self) -> Language {
        Language::Rust
    }

    async fn prepare(
        &self,
        workspace: &Workspace,
        source: &str,
        options: &ExecutionOptions,
    ) -> Result<RunSpec, ExecError> {
        workspace.write_file("Cargo.toml", MANIFEST).await?;
        workspace.write_file("src/main.rs", source).await?;

        let target_dir = workspace.root().join("target");
        let program = options.build_tool.as_deref().unwrap_or(&self.cargo);
        let build = CommandSpec::new(program, workspace.root())
            .arg("build")
            .args(options.build_args.iter().cloned())
            .env("CARGO_TARGET_DIR", target_dir.to_string_lossy())
            .env("CARGO_TERM_COLOR", "never");

        let target = BuildTarget::from_args(&options.build_args);
        let artifact_dir = target.artifact_dir(&target_dir);
        let run = if target.is_wasm() {
            RunTarget::Wasm {
                module: artifact_dir.join(format!("{CRATE_NAME}.wasm")),
                args: vec![CRATE_NAME.to_string()],
            }
        } else {
            let binary = artifact_dir.join(format!("{CRATE_NAME}{}", std::env::consts::EXE_SUFFIX));
            RunTarget::Process(CommandSpec::new(
                binary.to_string_lossy(),
                workspace.root(),
            ))
        };

        Ok(RunSpec {
            build: Some(build),
            run,
        })
    }
}

/// Where cargo puts the artifact, derived from the build arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BuildTarget {
    triple: Option<String>,
    profile_dir: String,
}

impl BuildTarget {
    fn from_args(args: &[String]) -> Self {
        let mut triple = None;
        let mut profile_dir = "debug".to_string();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--release" | "-r" => profile_dir = "release".into(),
                "--target" => triple = iter.next().cloned(),
                "--profile" => {
                    if let Some(p) = iter.next() {
                        profile_dir = profile_dir_for(p);
                    }
                }
                other => {
                    if let Some(t) = other.strip_prefix("--target=") {
                        triple = Some(t.to_string());
                    } else if let Some(p) = other.strip_prefix("--profile=") {
                        profile_dir = profile_dir_for(p);
                    }
                }
            }
        }
        Self {
            triple,
            profile_dir,
        }
    }

    fn is_wasm(&self) -> bool {
        self.triple
            .as_deref()
            .is_some_and(|t| t.starts_with("wasm32"))
    }

    fn artifact_dir(&self, target_dir: &Path) -> PathBuf {
        match &self.triple {
            Some(triple) => target_dir.join(triple).join(&self.profile_dir),
            None => target_dir.join(&self.profile_dir),
        }
    }
}

/// Cargo stores the built-in `dev`/`test` profiles under `debug` and
/// `bench` under `release`; custom profiles use their own name.
fn profile_dir_for(profile: &str) -> String {
    match profile {
        "dev" | "test" => "debug",
        "bench" => "release",
        other => other,
    }
    .to_string()
}
