//! Runs `wasm32-wasip1` modules in-process with Wasmtime.
//!
//! The guest sees WASI Preview 1 with in-memory stdin/stdout/stderr and
//! program arguments; nothing else is granted (no preopened directories,
//! no environment). Execution is synchronous and happens on the blocking
//! pool. Dropping the future returned by [`WasmBridge::run_module`]
//! interrupts the guest at its next epoch check.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use tokio::io::AsyncWrite;
use wasmtime::{Config, Engine, Linker, Module, Store};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::cli::{IsTerminal, StdoutStream};
use wasmtime_wasi::p2::pipe::MemoryInputPipe;
use wasmtime_wasi::p2::{OutputStream, Pollable, StreamResult};
use wasmtime_wasi::preview1::WasiP1Ctx;

use super::error::ExecError;
use super::output::CapturedOutput;

/// Largest write the guest is offered at once.
const WRITE_PERMIT: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WasmOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone)]
pub struct WasmBridge {
    /// Bytes kept per output stream before truncation.
    max_output_bytes: usize,
}

impl WasmBridge {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    /// Load, instantiate and run the module at `path` to completion.
    ///
    /// `args` become the guest's argv (first entry is the program name).
    /// Load/link/instantiate failures and a missing `_start` export are
    /// errors; a guest `proc_exit(n)` becomes `exit_code = n`, any other
    /// trap `exit_code = 1` with the trap appended to stderr.
    pub async fn run_module(
        &self,
        path: &Path,
        stdin: &str,
        args: &[String],
    ) -> Result<WasmOutput, ExecError> {
        // One engine per run: epoch bumps must not reach other executions.
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config)
            .map_err(|e| ExecError::Wasm(format!("failed to create engine: {e}")))?;

        let interrupt = Interrupt {
            engine: engine.clone(),
            cancelled: Arc::new(AtomicBool::new(false)),
            armed: true,
        };
        let job = WasmJob {
            engine,
            path: path.to_path_buf(),
            stdin: stdin.as_bytes().to_vec(),
            args: args.to_vec(),
            limit: self.max_output_bytes,
            cancelled: interrupt.cancelled.clone(),
        };

        let output = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| ExecError::Wasm(format!("wasm task failed: {e}")))?;
        interrupt.disarm();
        output
    }
}

/// Interrupts the guest when dropped while still armed.
struct Interrupt {
    engine: Engine,
    cancelled: Arc<AtomicBool>,
    armed: bool,
}

impl Interrupt {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Interrupt {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.engine.increment_epoch();
        tracing::debug!("wasm execution interrupted");
    }
}

struct WasmJob {
    engine: Engine,
    path: PathBuf,
    stdin: Vec<u8>,
    args: Vec<String>,
    limit: usize,
    cancelled: Arc<AtomicBool>,
}

impl WasmJob {
    fn run(self) -> Result<WasmOutput, ExecError> {
        let started = Instant::now();
        let module = Module::from_file(&self.engine, &self.path).map_err(|e| {
            ExecError::Wasm(format!(
                "failed to load module {}: {e}",
                self.path.display()
            ))
        })?;

        let stdout_pipe = CappedPipe::new(self.limit);
        let stderr_pipe = CappedPipe::new(self.limit);
        let mut wasi_builder = WasiCtxBuilder::new();
        wasi_builder
            .stdin(MemoryInputPipe::new(self.stdin))
            .stdout(stdout_pipe.clone())
            .stderr(stderr_pipe.clone())
            .args(self.args.as_slice());

        let mut store = Store::new(&self.engine, wasi_builder.build_p1());
        store.set_epoch_deadline(1);
        // deadline first, then the flag: a cancel racing with setup is
        // either seen here or trips the deadline
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ExecError::Wasm("cancelled before start".into()));
        }

        let mut linker: Linker<WasiP1Ctx> = Linker::new(&self.engine);
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |ctx: &mut WasiP1Ctx| ctx)
            .map_err(|e| ExecError::Wasm(format!("failed to link WASI: {e}")))?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| ExecError::Wasm(format!("failed to instantiate module: {e}")))?;
        let start_fn = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(|e| ExecError::Wasm(format!("no _start entry point: {e}")))?;

        let (exit_code, trap) = match start_fn.call(&mut store, ()) {
            Ok(()) => (0, None),
            Err(e) => match e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                Some(exit) => (exit.0, None),
                None => (1, Some(e)),
            },
        };

        let stdout = stdout_pipe.contents().into_text();
        let mut stderr = stderr_pipe.contents().into_text();
        if let Some(trap) = trap {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!("wasm trap: {trap:#}"));
        }

        tracing::info!(
            module = %self.path.display(),
            exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "wasm module finished"
        );
        Ok(WasmOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

/// Guest output sink that keeps the first `limit` bytes and accepts the
/// rest, so overflowing output truncates instead of trapping the guest.
#[derive(Debug, Clone)]
struct CappedPipe {
    limit: usize,
    captured: Arc<Mutex<CapturedOutput>>,
}

impl CappedPipe {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            captured: Arc::new(Mutex::new(CapturedOutput::default())),
        }
    }

    fn push(&self, chunk: &[u8]) {
        self.captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chunk, self.limit);
    }

    fn contents(&self) -> CapturedOutput {
        self.captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl OutputStream for CappedPipe {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        self.push(&bytes);
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(WRITE_PERMIT)
    }
}

#[async_trait::async_trait]
impl Pollable for CappedPipe {
    async fn ready(&mut self) {}
}

impl AsyncWrite for CappedPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.push(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl IsTerminal for CappedPipe {
    fn is_terminal(&self) -> bool {
        false
    }
}

impl StdoutStream for CappedPipe {
    fn p2_stream(&self) -> Box<dyn OutputStream> {
        Box::new(self.clone())
    }

    fn async_stream(&self) -> Box<dyn AsyncWrite + Send + Sync> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const HELLO: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "hello\n")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 6))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

    const ECHO: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_read"
    (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 64))
    (i32.store (i32.const 4) (i32.const 64))
    (drop (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 8)))
    (i32.store (i32.const 4) (i32.load (i32.const 8)))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 12)))))
"#;

    const EXIT_3: &str = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start") (call $exit (i32.const 3))))
"#;

    // one 64-byte fd_write to stdout
    const CHATTY: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 64))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

    const TRAP: &str = r#"(module (func (export "_start") unreachable))"#;
    const NO_START: &str = r#"(module (func (export "main")))"#;
    const SPIN: &str = r#"(module (func (export "_start") (loop $l (br $l))))"#;

    fn module(dir: &tempfile::TempDir, name: &str, wat: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, wat).unwrap();
        path
    }

    fn bridge() -> WasmBridge {
        WasmBridge::new(1024 * 1024)
    }

    fn argv() -> Vec<String> {
        vec!["snippet".to_string()]
    }

    #[tokio::test]
    async fn runs_module_and_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(&dir, "hello.wat", HELLO);
        let out = bridge().run_module(&path, "", &argv()).await.unwrap();
        assert_eq!(
            out,
            WasmOutput {
                stdout: "hello\n".into(),
                stderr: String::new(),
                exit_code: 0,
            }
        );
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(&dir, "echo.wat", ECHO);
        let out = bridge().run_module(&path, "hi\n", &argv()).await.unwrap();
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn proc_exit_sets_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(&dir, "exit.wat", EXIT_3);
        let out = bridge().run_module(&path, "", &argv()).await.unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.stderr.is_empty());
    }

    #[tokio::test]
    async fn trap_is_reported_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(&dir, "trap.wat", TRAP);
        let out = bridge().run_module(&path, "", &argv()).await.unwrap();
        assert_eq!(out.exit_code, 1);
        assert!(out.stderr.starts_with("wasm trap:"));
    }

    #[tokio::test]
    async fn output_over_the_limit_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(&dir, "chatty.wat", CHATTY);
        let out = WasmBridge::new(16)
            .run_module(&path, "", &argv())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.starts_with("0123456789abcdef\n"));
        assert!(out.stdout.ends_with("[output truncated at 16 bytes]"));
        assert!(out.stderr.is_empty());
    }

    #[tokio::test]
    async fn missing_entry_point_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(&dir, "nostart.wat", NO_START);
        let err = bridge().run_module(&path, "", &argv()).await.unwrap_err();
        assert!(matches!(err, ExecError::Wasm(ref msg) if msg.contains("_start")));
    }

    #[tokio::test]
    async fn malformed_module_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(&dir, "bad.wasm", "\0asm garbage");
        let err = bridge().run_module(&path, "", &argv()).await.unwrap_err();
        assert!(matches!(err, ExecError::Wasm(ref msg) if msg.contains("failed to load")));
    }

    #[tokio::test]
    async fn dropping_the_future_interrupts_the_guest() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(&dir, "spin.wat", SPIN);
        let bridge = bridge();
        let argv = argv();
        let run = bridge.run_module(&path, "", &argv);
        // if the interrupt did not land, runtime shutdown would hang on the
        // blocking thread
        let res = tokio::time::timeout(Duration::from_millis(200), run).await;
        assert!(res.is_err());
    }
}
