use std::{
    fmt, fs,
    io::Write,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context as _, Result};
use thiserror::Error;

/// environment variable pointing the PUT at the file to write its raw
/// coverage map to
pub const COVERAGE_FILE_ENV: &str = "CANOPY_COVERAGE_FILE";

const KILL_GRACE: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_micros(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    Normal,
    Timeout,
    Crash,
    Hang,
}

impl ExitReason {
    /// stable numeric tag used in on-disk file names
    pub fn code(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Timeout => 1,
            Self::Crash => 2,
            Self::Hang => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Timeout => "timeout",
            Self::Crash => "crash",
            Self::Hang => "hang",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_reason: ExitReason,
    pub coverage: Vec<u8>,
    pub execution_time: Duration,
}

/// setup failures, distinct from PUT crashes which are outcomes
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("PUT binary {0:?} does not exist")]
    MissingBinary(PathBuf),

    #[error("failed to spawn PUT {0:?}: {1}")]
    Spawn(PathBuf, String),
}

pub trait Executor {
    fn execute(&mut self, data: &[u8]) -> Result<ExecutionResult>;
    fn map_size(&self) -> usize;
}

/// runs the PUT as a child process: input bytes on stdin, coverage map read
/// back from the file named by `CANOPY_COVERAGE_FILE`
#[derive(Debug)]
pub struct CommandExecutor {
    command: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    memory_limit_mb: Option<u64>,
    map_size: usize,
    coverage_path: PathBuf,
}

impl CommandExecutor {
    pub fn new(
        command: PathBuf,
        args: Vec<String>,
        timeout: Duration,
        memory_limit_mb: Option<u64>,
        map_size: usize,
        work_dir: &Path,
    ) -> Result<Self, ExecutorError> {
        // only verify plain paths, bare names are resolved via PATH at spawn
        if command.components().count() > 1 && !command.is_file() {
            return Err(ExecutorError::MissingBinary(command));
        }

        Ok(Self {
            command,
            args,
            timeout,
            memory_limit_mb,
            map_size,
            coverage_path: work_dir.join("coverage.bin"),
        })
    }

    fn spawn(&self) -> Result<Child, ExecutorError> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .env(COVERAGE_FILE_ENV, &self.coverage_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let Some(limit) = self.memory_limit_mb {
            let bytes = limit.saturating_mul(1024 * 1024);
            unsafe {
                command.pre_exec(move || {
                    nix::sys::resource::setrlimit(
                        nix::sys::resource::Resource::RLIMIT_AS,
                        bytes,
                        bytes,
                    )
                    .map_err(std::io::Error::from)
                });
            }
        }

        command
            .spawn()
            .map_err(|err| ExecutorError::Spawn(self.command.clone(), err.to_string()))
    }

    fn read_coverage(&self) -> Vec<u8> {
        let mut coverage = fs::read(&self.coverage_path).unwrap_or_default();
        // the map size is fixed for the duration of a run
        coverage.resize(self.map_size, 0);
        coverage
    }
}

impl Executor for CommandExecutor {
    fn execute(&mut self, data: &[u8]) -> Result<ExecutionResult> {
        let _ = fs::remove_file(&self.coverage_path);

        let start = Instant::now();
        let mut child = self.spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // the PUT may close stdin early, a broken pipe is not an error
            let _ = stdin.write_all(data);
        }

        let exit_reason = match wait_with_deadline(&mut child, start + self.timeout)? {
            Some(status) if status.signal().is_some() => ExitReason::Crash,
            Some(_) => ExitReason::Normal,
            None => {
                let _ = child.kill();
                match wait_with_deadline(&mut child, Instant::now() + KILL_GRACE)? {
                    Some(_) => ExitReason::Timeout,
                    None => ExitReason::Hang,
                }
            }
        };
        let execution_time = start.elapsed();

        // on timeout the map may be partial, the candidate is still offered
        // to the queue keyed on its exit reason
        Ok(ExecutionResult {
            exit_reason,
            coverage: self.read_coverage(),
            execution_time,
        })
    }

    fn map_size(&self) -> usize {
        self.map_size
    }
}

fn wait_with_deadline(child: &mut Child, deadline: Instant) -> Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait().context("wait for PUT")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }

        thread::sleep(POLL_INTERVAL);
    }
}
