//! External tool invocation with argument vectors, accepted exit codes and timeouts.

use crate::error::{MigrateError, Result};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub accepted_codes: Vec<i32>,
    pub timeout: Option<Duration>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            accepted_codes: vec![0],
            timeout: None,
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

    pub fn path_arg(self, path: &Path) -> Self {
        let value = path.to_string_lossy().to_string();
        self.arg(value)
    }

    /// Replaces the accepted exit codes. Some copy tools report benign results with 1.
    pub fn accept_codes(mut self, codes: &[i32]) -> Self {
        self.accepted_codes = codes.to_vec();
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(char::is_whitespace) {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }

    pub fn is_accepted(&self, code: Option<i32>) -> bool {
        code.map(|code| self.accepted_codes.contains(&code))
            .unwrap_or(false)
    }

    pub fn check(&self, output: ToolOutput) -> Result<ToolOutput> {
        if self.is_accepted(output.code) {
            return Ok(output);
        }
        warn!(
            program = %self.program,
            code = ?output.code,
            "external tool returned a non-accepted exit status"
        );
        Err(MigrateError::ToolExecution {
            program: self.program.clone(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

pub trait ToolRunner: Send + Sync {
    /// Runs the command to completion and reports whatever status it produced.
    fn execute(&self, command: &ToolCommand) -> Result<ToolOutput>;

    /// Runs the command and fails unless its exit code is accepted.
    fn run(&self, command: &ToolCommand) -> Result<ToolOutput> {
        let output = self.execute(command)?;
        command.check(output)
    }
}

/// Runs every command in order, stopping at the first one that fails.
pub fn run_sequence(runner: &dyn ToolRunner, commands: &[ToolCommand]) -> Result<()> {
    for command in commands {
        runner.run(command)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct SystemToolRunner {
    default_timeout: Option<Duration>,
}

impl SystemToolRunner {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }
}

impl ToolRunner for SystemToolRunner {
    fn execute(&self, command: &ToolCommand) -> Result<ToolOutput> {
        debug!(command = %command.display_line(), "running external tool");
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| MigrateError::ToolExecution {
                program: command.program.clone(),
                code: None,
                stderr: format!("failed to start: {}", error),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = thread::spawn(move || drain(stdout));
        let stderr_reader = thread::spawn(move || drain(stderr));

        let timeout = command.timeout.or(self.default_timeout);
        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!(program = %command.program, "external tool timed out");
                    return Err(MigrateError::ToolTimeout {
                        program: command.program.clone(),
                        timeout_secs: limit.as_secs(),
                    });
                }
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();
        debug!(program = %command.program, code = ?status.code(), "external tool exited");
        Ok(ToolOutput {
            code: status.code(),
            stdout,
            stderr,
        })
    }
}

fn drain<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_line_quotes_whitespace() {
        let command = ToolCommand::new("robocopy")
            .arg("C:\\Temp\\restore")
            .arg("C:\\Program Files")
            .arg("/E");
        assert_eq!(
            command.display_line(),
            "robocopy C:\\Temp\\restore \"C:\\Program Files\" /E"
        );
    }

    #[test]
    fn accepted_codes_drive_check() {
        let command = ToolCommand::new("robocopy").accept_codes(&[0, 1]);
        let benign = ToolOutput {
            code: Some(1),
            ..ToolOutput::default()
        };
        assert!(command.check(benign).is_ok());

        let fatal = ToolOutput {
            code: Some(8),
            stderr: "copy failed\n".to_string(),
            ..ToolOutput::default()
        };
        match command.check(fatal) {
            Err(MigrateError::ToolExecution { code, stderr, .. }) => {
                assert_eq!(code, Some(8));
                assert_eq!(stderr, "copy failed");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn signal_termination_is_never_accepted() {
        let command = ToolCommand::new("mount");
        assert!(!command.is_accepted(None));
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_reports_exit_status() {
        let runner = SystemToolRunner::default();
        let ok = runner.run(&ToolCommand::new("sh").args(["-c", "echo hello"])).unwrap();
        assert_eq!(ok.stdout.trim(), "hello");

        let failed = runner.run(&ToolCommand::new("sh").args(["-c", "echo oops >&2; exit 3"]));
        assert!(matches!(
            failed,
            Err(MigrateError::ToolExecution { code: Some(3), .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_enforces_timeout() {
        let runner = SystemToolRunner::default();
        let command = ToolCommand::new("sleep")
            .arg("5")
            .timeout(Some(Duration::from_millis(200)));
        assert!(matches!(
            runner.run(&command),
            Err(MigrateError::ToolTimeout { .. })
        ));
    }

    #[test]
    fn missing_program_is_a_tool_error() {
        let runner = SystemToolRunner::default();
        let result = runner.run(&ToolCommand::new("osmigrate-no-such-tool"));
        assert!(matches!(
            result,
            Err(MigrateError::ToolExecution { code: None, .. })
        ));
    }
}
