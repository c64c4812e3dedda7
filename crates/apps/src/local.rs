//! Local subprocess application.

use appctl_core::{Application, Backoff};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Errors raised by [`LocalApp`].
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    /// The program could not be spawned
    #[error("Failed to spawn `{program}`: {source}")]
    SpawnFailed {
        /// Program that was spawned
        program: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The OS did not report a process id
    #[error("Failed to get process ID of `{0}`")]
    MissingPid(String),

    /// A hook was called before `run`
    #[error("Process has not been started")]
    NotStarted,

    /// Output was requested before the process exited
    #[error("Process is still running")]
    StillRunning,

    /// Reading a pipe failed
    #[error("Failed to read process output: {0}")]
    Output(String),

    /// I/O error while talking to the process
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The process exited unsuccessfully
    #[error("`{program}` exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        /// Program that failed
        program: String,
        /// Exit code (-1 when killed by a signal)
        exit_code: i32,
        /// Captured standard error
        stderr: String,
    },
}

/// Harvested result of a finished process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// Exit code
    pub exit_code: i32,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,

    /// OS process ID
    pub pid: u32,

    /// Launch timestamp
    pub started_at: chrono::DateTime<chrono::Utc>,

    /// Exit timestamp (as observed by polling)
    pub finished_at: chrono::DateTime<chrono::Utc>,

    /// Execution duration
    pub duration: Duration,
}

type PipeReader = JoinHandle<std::io::Result<Vec<u8>>>;

#[derive(Debug)]
struct RunningProcess {
    child: Child,
    pid: u32,
    started_at: chrono::DateTime<chrono::Utc>,
    started: Instant,
    stdout: Option<PipeReader>,
    stderr: Option<PipeReader>,
    exit: Option<(ExitStatus, chrono::DateTime<chrono::Utc>, Duration)>,
}

/// A command line executed as a child process.
///
/// Both output pipes are drained in the background while the process runs,
/// so chatty programs never block on a full pipe.
#[derive(Debug)]
pub struct LocalApp {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
    poll: Backoff,
    process: Option<RunningProcess>,
}

impl LocalApp {
    /// Create an application running `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            stdin: None,
            poll: Backoff::new(Duration::from_millis(10), 1.5, Duration::from_secs(1)),
            process: None,
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Feed `input` to the process' standard input, then close it.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Set the poll cadence.
    pub fn poll_interval(mut self, poll: Backoff) -> Self {
        self.poll = poll;
        self
    }

    /// Command line, for display.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Process ID, once launched.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    fn spawn(&self) -> Result<RunningProcess, SubprocessError> {
        let mut cmd = Command::new(&self.program);

        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|source| SubprocessError::SpawnFailed {
            program: self.program.clone(),
            source,
        })?;

        let pid = child
            .id()
            .ok_or_else(|| SubprocessError::MissingPid(self.program.clone()))?;

        if let (Some(input), Some(mut pipe)) = (self.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    warn!("Failed to write process stdin: {}", e);
                }
            });
        }

        Ok(RunningProcess {
            pid,
            started_at: chrono::Utc::now(),
            started: Instant::now(),
            stdout: child.stdout.take().map(drain),
            stderr: child.stderr.take().map(drain),
            exit: None,
            child,
        })
    }
}

fn drain<R>(mut pipe: R) -> PipeReader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).await?;
        Ok(buf)
    })
}

async fn collect(reader: Option<PipeReader>) -> Result<String, SubprocessError> {
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    let bytes = reader
        .await
        .map_err(|e| SubprocessError::Output(e.to_string()))??;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

#[async_trait]
impl Application for LocalApp {
    type Output = ProcessOutput;

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        let process = self.spawn()?;
        debug!("Spawned `{}` as pid {}", self.command_line(), process.pid);
        self.process = Some(process);
        Ok(())
    }

    async fn is_finished(&mut self) -> Result<bool, anyhow::Error> {
        let process = self.process.as_mut().ok_or(SubprocessError::NotStarted)?;
        if process.exit.is_some() {
            return Ok(true);
        }

        match process.child.try_wait().map_err(SubprocessError::from)? {
            Some(status) => {
                process.exit = Some((status, chrono::Utc::now(), process.started.elapsed()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn wait_interval(&mut self) -> Duration {
        self.poll.next()
    }

    async fn evaluate(&mut self) -> Result<ProcessOutput, anyhow::Error> {
        let process = self.process.as_mut().ok_or(SubprocessError::NotStarted)?;
        let (status, finished_at, duration) = process.exit.ok_or(SubprocessError::StillRunning)?;

        let stdout = collect(process.stdout.take()).await?;
        let stderr = collect(process.stderr.take()).await?;
        let exit_code = status.code().unwrap_or(-1);

        if !status.success() {
            return Err(SubprocessError::NonZeroExit {
                program: self.program.clone(),
                exit_code,
                stderr: stderr.trim_end().to_string(),
            }
            .into());
        }

        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr,
            pid: process.pid,
            started_at: process.started_at,
            finished_at,
            duration,
        })
    }

    async fn clean_up(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };

        if process.exit.is_none() {
            debug!("Killing pid {}", process.pid);
            if let Err(e) = process.child.kill().await {
                warn!("Failed to kill pid {}: {}", process.pid, e);
            }
        }

        for reader in [process.stdout.take(), process.stderr.take()]
            .into_iter()
            .flatten()
        {
            reader.abort();
        }
    }

    fn name(&self) -> &str {
        &self.program
    }
}
