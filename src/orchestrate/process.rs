// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Spawnable worker processes.
//!
//! The supervisor only talks to [`ProcessLauncher`] and [`WorkerProcess`], so
//! tests can substitute scripted processes for real ones. The tokio-backed
//! implementation puts each worker in its own process group and signals the
//! whole group on shutdown, so tools the worker started die with it.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Upper bound on captured bytes per stream; older lines are dropped first.
pub const MAX_CAPTURE_BYTES: usize = 8 * 1024 * 1024;

/// Everything needed to start one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
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
        self.env.push((key.into(), value.into()));
        self
    }

    /// Value of an environment variable set on this spec.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The prompt, which is always the final argument.
    pub fn prompt(&self) -> Option<&str> {
        self.args.last().map(String::as_str)
    }
}

/// Output captured from a worker's standard streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A running worker process.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if there is one.
    fn id(&self) -> Option<u32>;

    /// Wait for exit. Returns the exit code, or `None` when killed by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Ask the process to stop.
    fn terminate(&mut self) -> io::Result<()>;

    /// Stop the process unconditionally.
    fn kill(&mut self) -> io::Result<()>;

    /// Collect captured output, waiting at most `bound` for the streams to close.
    async fn collect_output(&mut self, bound: Duration) -> CapturedOutput;
}

/// Starts worker processes.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn WorkerProcess>>;
}

/// Terminate politely, then forcibly once `grace` has elapsed.
pub async fn shutdown(process: &mut dyn WorkerProcess, grace: Duration) -> Option<i32> {
    if let Err(e) = process.terminate() {
        debug!("terminate failed: {}", e);
    }

    match tokio::time::timeout(grace, process.wait()).await {
        Ok(Ok(code)) => return code,
        Ok(Err(e)) => warn!("wait after terminate failed: {}", e),
        Err(_) => debug!(pid = ?process.id(), "grace period elapsed, killing"),
    }

    if let Err(e) = process.kill() {
        debug!("kill failed: {}", e);
    }
    process.wait().await.ok().flatten()
}

// ============================================================================
// Tokio implementation
// ============================================================================

/// Launches real OS processes with tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn WorkerProcess>> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            command.process_group(0);
        }

        let mut child = command.spawn()?;
        let pid = child.id();

        let stdout = Arc::new(Mutex::new(LineBuffer::default()));
        let stderr = Arc::new(Mutex::new(LineBuffer::default()));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, Arc::clone(&stdout)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, Arc::clone(&stderr)));
        }

        debug!(pid = ?pid, program = %spec.program, "worker process started");
        Ok(Box::new(TokioProcess {
            child,
            pid,
            stdout,
            stderr,
            readers,
        }))
    }
}

/// Lines captured from one stream, bounded by [`MAX_CAPTURE_BYTES`].
#[derive(Debug, Default)]
struct LineBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    dropped: usize,
}

impl LineBuffer {
    fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > MAX_CAPTURE_BYTES && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len() + 1;
                self.dropped += 1;
            }
        }
    }

    fn render(&self) -> String {
        let mut out = String::with_capacity(self.bytes + 32);
        if self.dropped > 0 {
            out.push_str(&format!("... [{} earlier lines dropped]\n", self.dropped));
        }
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Drain a pipe line by line until EOF. Invalid UTF-8 is replaced, never fatal:
/// closing the read end early would kill the worker with SIGPIPE.
fn spawn_reader<R>(stream: R, buffer: Arc<Mutex<LineBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    if raw.last() == Some(&b'\n') {
                        raw.pop();
                    }
                    if raw.last() == Some(&b'\r') {
                        raw.pop();
                    }
                    let line = String::from_utf8_lossy(&raw).into_owned();
                    buffer.lock().unwrap_or_else(|e| e.into_inner()).push(line);
                }
                Err(e) => {
                    debug!("output reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}

struct TokioProcess {
    child: Child,
    pid: Option<u32>,
    stdout: Arc<Mutex<LineBuffer>>,
    stderr: Arc<Mutex<LineBuffer>>,
    readers: Vec<JoinHandle<()>>,
}

#[cfg(unix)]
fn signal_group(pid: u32, forced: bool) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = if forced { Signal::SIGKILL } else { Signal::SIGTERM };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _forced: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are not supported on this platform",
    ))
}

#[async_trait]
impl WorkerProcess for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    fn terminate(&mut self) -> io::Result<()> {
        match self.pid {
            Some(pid) if cfg!(unix) => signal_group(pid, false),
            _ => self.child.start_kill(),
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        if let Some(pid) = self.pid.filter(|_| cfg!(unix)) {
            signal_group(pid, true)?;
        }
        match self.child.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    async fn collect_output(&mut self, bound: Duration) -> CapturedOutput {
        let readers = std::mem::take(&mut self.readers);
        let aborts: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();
        let joined = tokio::time::timeout(bound, async {
            for reader in readers {
                let _ = reader.await;
            }
        })
        .await;
        if joined.is_err() {
            debug!(pid = ?self.pid, "output streams still open, abandoning readers");
            for abort in aborts {
                abort.abort();
            }
        }

        CapturedOutput {
            stdout: self.stdout.lock().unwrap_or_else(|e| e.into_inner()).render(),
            stderr: self.stderr.lock().unwrap_or_else(|e| e.into_inner()).render(),
        }
    }
}
