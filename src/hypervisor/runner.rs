//! Backend command execution
//!
//! Every hypervisor command goes through [`CommandRunner`] so drivers can be
//! exercised against a scripted runner in tests.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::DriverError;

/// Captured output of a finished command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// Failed output with the given stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, trimmed
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Render a command line for logs and errors
pub fn command_line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Executes backend commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, DriverError>;

    /// Launch a long-running process detached from the caller
    ///
    /// Stdout and stderr are appended to `log_file`. Returns the process id.
    async fn spawn_detached(
        &self,
        program: &str,
        args: &[&str],
        log_file: &Path,
    ) -> Result<u32, DriverError>;

    /// Run a command and turn a non-zero exit into `BackendCommandFailed`
    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<CommandOutput, DriverError> {
        let output = self.run(program, args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(DriverError::BackendCommandFailed {
                command: command_line(program, args),
                output: output.combined(),
            })
        }
    }
}

/// Runner backed by real host processes
#[derive(Clone, Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, DriverError> {
        let line = command_line(program, args);
        debug!("Running: {}", line);

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| DriverError::Spawn {
                command: line.clone(),
                source,
            })?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };
        debug!("{} exited with {}", program, result.exit_code);
        Ok(result)
    }

    async fn spawn_detached(
        &self,
        program: &str,
        args: &[&str],
        log_file: &Path,
    ) -> Result<u32, DriverError> {
        let line = command_line(program, args);
        debug!("Spawning: {} (log: {})", line, log_file.display());

        let io_err = |source| DriverError::Io {
            path: log_file.to_path_buf(),
            source,
        };
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(io_err)?;
        let log_err = log.try_clone().map_err(io_err)?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|source| DriverError::Spawn {
                command: line.clone(),
                source,
            })?;

        child.id().ok_or_else(|| DriverError::BackendCommandFailed {
            command: line,
            output: "process exited before its pid could be read".to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    //! Scripted runner for driver tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned outputs keyed by command-line prefix
    ///
    /// The last queued output for a prefix is sticky so repeated status
    /// queries keep returning the final state. Unmatched commands succeed
    /// with empty output.
    #[derive(Default)]
    pub struct ScriptedRunner {
        responses: Mutex<Vec<(String, VecDeque<CommandOutput>)>>,
        calls: Mutex<Vec<String>>,
        pid: u32,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self {
                pid: 4242,
                ..Default::default()
            }
        }

        /// Queue an output for commands starting with `prefix`
        pub fn respond(&self, prefix: &str, output: CommandOutput) -> &Self {
            let mut responses = self.responses.lock().unwrap();
            match responses.iter_mut().find(|(p, _)| p == prefix) {
                Some((_, queue)) => queue.push_back(output),
                None => responses.push((prefix.to_string(), VecDeque::from([output]))),
            }
            self
        }

        /// All command lines seen so far
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        /// Command lines that start with `prefix`
        pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| c.starts_with(prefix))
                .collect()
        }

        fn next_output(&self, line: &str) -> CommandOutput {
            let mut responses = self.responses.lock().unwrap();
            let matched = responses
                .iter_mut()
                .filter(|(p, _)| line.starts_with(p.as_str()))
                .max_by_key(|(p, _)| p.len());
            match matched {
                Some((_, queue)) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
                Some((_, queue)) => queue.front().cloned().unwrap_or_default(),
                None => CommandOutput::default(),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, DriverError> {
            let line = command_line(program, args);
            self.calls.lock().unwrap().push(line.clone());
            Ok(self.next_output(&line))
        }

        async fn spawn_detached(
            &self,
            program: &str,
            args: &[&str],
            _log_file: &Path,
        ) -> Result<u32, DriverError> {
            let line = format!("spawn {}", command_line(program, args));
            self.calls.lock().unwrap().push(line);
            Ok(self.pid)
        }
    }
}
