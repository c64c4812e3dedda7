//! Job files: a local command described in JSON.

use anyhow::{bail, Context, Result};
use appctl_apps::LocalApp;
use appctl_core::Backoff;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A command to run, as read from `--job FILE`.
///
/// ```json
/// { "program": "sleep", "args": ["2"], "timeout_secs": 10 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobFile {
    /// Program to execute
    pub program: Option<String>,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Text fed to standard input
    pub stdin: Option<String>,
    /// Join timeout in seconds
    pub timeout_secs: Option<u64>,
    /// Fixed poll interval in milliseconds
    pub poll_interval_ms: Option<u64>,
}

impl JobFile {
    /// Load a job file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid job file {}", path.display()))
    }

    /// Apply command-line overrides. A non-empty `command` replaces the
    /// program and arguments.
    pub fn merge(
        mut self,
        command: Vec<String>,
        timeout_secs: Option<u64>,
        poll_interval_ms: Option<u64>,
    ) -> Self {
        let mut command = command.into_iter();
        if let Some(program) = command.next() {
            self.program = Some(program);
            self.args = command.collect();
        }
        self.timeout_secs = timeout_secs.or(self.timeout_secs);
        self.poll_interval_ms = poll_interval_ms.or(self.poll_interval_ms);
        self
    }

    /// Join timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Build the application.
    pub fn into_app(self) -> Result<LocalApp> {
        let Some(program) = self.program else {
            bail!("No program given (pass one after `--` or set `program` in the job file)");
        };

        let mut app = LocalApp::new(program).args(self.args);
        for (key, value) in self.env {
            app = app.env(key, value);
        }
        if let Some(cwd) = self.cwd {
            app = app.current_dir(cwd);
        }
        if let Some(stdin) = self.stdin {
            app = app.stdin(stdin);
        }
        if let Some(ms) = self.poll_interval_ms {
            app = app.poll_interval(Backoff::fixed(Duration::from_millis(ms)));
        }
        Ok(app)
    }
}
